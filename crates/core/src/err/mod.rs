use thiserror::Error;

/// The errors surfaced by the execution engine. Every variant maps onto a
/// stable numeric code via [`Error::code`]; peers exchange the numbers, not
/// the names.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
	/// A generic unexpected engine failure
	#[error("An internal error occurred: {message}")]
	Internal {
		message: String,
	},

	/// The engine could not allocate the memory it needed
	#[error("The operation ran out of memory")]
	OutOfMemory,

	/// The query was killed while it was executing
	#[error("The query was killed")]
	QueryKilled,

	/// The compiled plan violates a structural rule
	#[error("The query plan could not be accepted: {message}")]
	Parse {
		message: String,
	},

	/// A data-modification operation was planned inside a subquery
	#[error("Data-modification operations are not allowed inside a subquery")]
	ModifyInSubquery,

	/// Modification options referenced values which are not compile-time constant
	#[error("Modification options must be known at query compile time")]
	CompileTimeOptions,

	/// An operator expected an array-like value
	#[error("An array value was expected, but found: {value}")]
	ArrayExpected {
		value: String,
	},

	/// A document value had a type the operation cannot work with
	#[error("The document value has an invalid type")]
	DocumentTypeInvalid,

	/// A document was specified without a key
	#[error("The document key is missing")]
	DocumentKeyMissing,

	/// A document handle could not be parsed or resolved
	#[error("The document handle is malformed: {handle}")]
	DocumentHandleBad {
		handle: String,
	},

	/// A document could not be found in its collection
	#[error("The document '{key}' was not found in collection '{collection}'")]
	DocumentNotFound {
		collection: String,
		key: String,
	},

	/// A unique index rejected the write
	#[error("The unique constraint was violated for key '{key}' in collection '{collection}'")]
	UniqueConstraintViolated {
		collection: String,
		key: String,
	},

	/// No index matching the requested access pattern exists
	#[error("No suitable index exists on collection '{collection}'")]
	NoIndex {
		collection: String,
	},

	/// A peer DB-server did not answer within the configured timeout
	#[error("Timeout while waiting for answer from server '{server}' shard '{shard}'")]
	ClusterTimeout {
		server: String,
		shard: String,
	},

	/// The connection to a peer DB-server was lost mid-call
	#[error("The connection to server '{server}' was lost")]
	ClusterConnectionLost {
		server: String,
	},

	/// A peer answered, but with an unusable response
	#[error("Cluster-internal communication error: {message}")]
	ClusterCommunication {
		message: String,
	},

	/// The collection is not sharded by its key attribute, so the caller
	/// must not supply document keys
	#[error("The collection is not sharded by its key attribute, '_key' must not be specified")]
	MustNotSpecifyKey,

	/// A sharded replace could not locate the document on this shard
	#[error("The document was not found, or its sharding attributes were changed")]
	ShardingAttributesChanged,

	/// The peer does not (or no longer does) know the addressed query
	#[error("The query was not found on the server")]
	QueryNotFound,

	/// An error number received from a peer with no local variant
	#[error("Error {code} from peer: {message}")]
	Peer {
		code: i64,
		message: String,
	},
}

impl Error {
	/// The stable numeric code for this error, as exchanged with peers.
	pub fn code(&self) -> i64 {
		match self {
			Self::Internal {
				..
			} => 1000,
			Self::OutOfMemory => 1001,
			Self::DocumentTypeInvalid => 1200,
			Self::DocumentKeyMissing => 1201,
			Self::DocumentHandleBad {
				..
			} => 1202,
			Self::DocumentNotFound {
				..
			} => 1203,
			Self::UniqueConstraintViolated {
				..
			} => 1210,
			Self::NoIndex {
				..
			} => 1212,
			Self::ClusterTimeout {
				..
			} => 1450,
			Self::ClusterConnectionLost {
				..
			} => 1451,
			Self::ClusterCommunication {
				..
			} => 1452,
			Self::MustNotSpecifyKey => 1453,
			Self::ShardingAttributesChanged => 1454,
			Self::QueryKilled => 1500,
			Self::Parse {
				..
			} => 1501,
			Self::ModifyInSubquery => 1502,
			Self::CompileTimeOptions => 1503,
			Self::ArrayExpected {
				..
			} => 1504,
			Self::QueryNotFound => 1505,
			Self::Peer {
				code,
				..
			} => *code,
		}
	}

	/// Rebuild an error from a numeric code and message received from a peer.
	pub fn from_code(code: i64, message: String) -> Self {
		match code {
			1001 => Self::OutOfMemory,
			1200 => Self::DocumentTypeInvalid,
			1201 => Self::DocumentKeyMissing,
			1453 => Self::MustNotSpecifyKey,
			1454 => Self::ShardingAttributesChanged,
			1500 => Self::QueryKilled,
			1501 => Self::Parse {
				message,
			},
			1502 => Self::ModifyInSubquery,
			1503 => Self::CompileTimeOptions,
			1505 => Self::QueryNotFound,
			1000 => Self::Internal {
				message,
			},
			_ => Self::Peer {
				code,
				message,
			},
		}
	}

	/// Whether this error can be downgraded to an ignored write when the
	/// modification options ask for error tolerance.
	pub(crate) fn is_data_error(&self) -> bool {
		matches!(
			self,
			Self::DocumentTypeInvalid
				| Self::DocumentKeyMissing
				| Self::DocumentHandleBad {
					..
				} | Self::DocumentNotFound {
				..
			} | Self::UniqueConstraintViolated {
				..
			} | Self::ShardingAttributesChanged
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn codes_round_trip() {
		for err in [
			Error::OutOfMemory,
			Error::DocumentTypeInvalid,
			Error::DocumentKeyMissing,
			Error::MustNotSpecifyKey,
			Error::QueryKilled,
			Error::ModifyInSubquery,
			Error::CompileTimeOptions,
			Error::QueryNotFound,
		] {
			let code = err.code();
			assert_eq!(Error::from_code(code, String::new()).code(), code);
		}
	}

	#[test]
	fn unknown_codes_are_preserved() {
		let err = Error::from_code(4242, "works as designed".to_string());
		assert_eq!(err.code(), 4242);
		assert_eq!(err.to_string(), "Error 4242 from peer: works as designed");
	}
}
