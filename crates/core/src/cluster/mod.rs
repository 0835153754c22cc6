pub use self::protocol::{
	check_envelope, parse_path, serve, unpack_envelope, OpKind, WireBlock, WireValue,
};
#[cfg(feature = "http")]
pub use self::transport::HttpTransport;
pub use self::transport::{Method, PeerRequest, Transport};

mod protocol;
mod transport;

use crate::err::Error;
use crate::kvs::Collection;
use crate::val::Json;

/// The identity of one horizontal partition of a collection.
pub type ShardId = String;

/// The cluster metadata collaborator.
///
/// Injected at engine construction on coordinators and DB-servers so that
/// tests can swap in a fake shard map.
pub trait ClusterInfo: Send + Sync {
	/// The shard responsible for a candidate document, determined by the
	/// collection's shard-key attributes only.
	fn responsible_shard(&self, collection: &Collection, document: &Json)
		-> Result<ShardId, Error>;

	/// Whether the collection is partitioned by the document-key
	/// attribute. Only then may the engine generate document keys while
	/// distributing, and only then may callers supply their own.
	fn uses_default_sharding(&self, collection: &Collection) -> bool;
}
