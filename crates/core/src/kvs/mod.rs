pub use self::mem::MemoryStore;
pub(crate) use self::mem::VecIterator;

mod mem;

use crate::err::Error;
use crate::val::Json;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The document key attribute.
pub const KEY_ATTRIBUTE: &str = "_key";
/// The document id attribute, `<collection>/<key>`.
pub const ID_ATTRIBUTE: &str = "_id";
/// The source vertex attribute of an edge document.
pub const FROM_ATTRIBUTE: &str = "_from";
/// The target vertex attribute of an edge document.
pub const TO_ATTRIBUTE: &str = "_to";

/// What a collection stores.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub enum CollectionKind {
	#[default]
	Document,
	Edge,
}

/// A handle onto a collection, borrowed from the transaction for the
/// lifetime of the query. Blocks carry these per register so that shaped
/// values can be interpreted.
#[derive(Debug)]
pub struct Collection {
	name: String,
	kind: CollectionKind,
}

impl Collection {
	pub fn new(name: &str, kind: CollectionKind) -> Self {
		Self {
			name: name.to_owned(),
			kind,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn kind(&self) -> CollectionKind {
		self.kind
	}

	pub fn is_edge(&self) -> bool {
		self.kind == CollectionKind::Edge
	}
}

/// An immutable pointer to a stored document. Cloning copies the pointer,
/// never the document.
#[derive(Clone, Debug)]
pub struct Document {
	data: Arc<Json>,
}

impl Document {
	/// Create a document for the given collection, deriving the id
	/// attribute from the key attribute when present.
	pub fn new(collection: &str, mut doc: Json) -> Self {
		if let Some(key) = doc.get(KEY_ATTRIBUTE).and_then(Json::as_str) {
			let id = format!("{collection}/{key}");
			if let Some(obj) = doc.as_object_mut() {
				obj.insert(ID_ATTRIBUTE.to_owned(), Json::from(id));
			}
		}
		Self {
			data: Arc::new(doc),
		}
	}

	/// The document key, when the document carries one.
	pub fn key(&self) -> Option<&str> {
		self.data.get(KEY_ATTRIBUTE).and_then(Json::as_str)
	}

	/// Borrow the underlying document tree.
	pub fn as_json(&self) -> &Json {
		&self.data
	}

	/// Copy the document out of storage.
	pub fn to_json(&self) -> Json {
		(*self.data).clone()
	}
}

/// A parsed `<collection>/<key>` document handle.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DocumentHandle {
	pub collection: String,
	pub key: String,
}

impl DocumentHandle {
	/// Parse a handle out of its string form.
	pub fn parse(handle: &str) -> Result<Self, Error> {
		match handle.split_once('/') {
			Some((collection, key)) if !collection.is_empty() && !key.is_empty() => Ok(Self {
				collection: collection.to_owned(),
				key: key.to_owned(),
			}),
			_ => Err(Error::DocumentHandleBad {
				handle: handle.to_owned(),
			}),
		}
	}

	/// Parse a handle out of a JSON value, which must be a string.
	pub fn from_json(value: &Json) -> Result<Self, Error> {
		match value.as_str() {
			Some(s) => Self::parse(s),
			None => Err(Error::DocumentHandleBad {
				handle: value.to_string(),
			}),
		}
	}
}

impl fmt::Display for DocumentHandle {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}/{}", self.collection, self.key)
	}
}

/// Which end of an edge an edge-index lookup constrains.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum EdgeDirection {
	From,
	To,
}

impl EdgeDirection {
	pub fn attribute(&self) -> &'static str {
		match self {
			Self::From => FROM_ATTRIBUTE,
			Self::To => TO_ATTRIBUTE,
		}
	}
}

/// The kind of index an index scan runs against.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IndexKind {
	Primary,
	Edge,
	Hash,
	Skiplist,
}

/// The description of an index, as chosen by the planner.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexDef {
	pub name: String,
	pub kind: IndexKind,
	/// The indexed attributes, in index order
	pub fields: Vec<String>,
}

/// One scalar bound of a skiplist range scan.
#[derive(Clone, Debug)]
pub struct ScalarBound {
	pub value: Json,
	pub inclusive: bool,
}

/// The condition a skiplist index scan evaluates: an equality chain over
/// the fully-bound prefix of the indexed attributes, plus at most one
/// range on the first non-equality attribute.
#[derive(Clone, Debug, Default)]
pub struct SkiplistCondition {
	pub prefix: Vec<Json>,
	pub low: Option<ScalarBound>,
	pub high: Option<ScalarBound>,
}

/// A batched, single-owner stream of document pointers out of an index.
/// The operator which created an iterator frees it on completion, on
/// advancing to the next disjunct, on error, or on shutdown.
pub trait DocumentIterator: Send + Sync {
	/// Pull up to `limit` more documents.
	fn next_batch(&mut self, limit: usize) -> Result<Vec<Document>, Error>;
}

pub type DocIter = Box<dyn DocumentIterator>;

/// Cursor state of a full collection scan, owned by the scanning operator.
#[derive(Default)]
pub struct ScanCursor {
	keys: Option<Vec<String>>,
	pos: usize,
}

impl ScanCursor {
	/// Reset the cursor so that the next scan starts over.
	pub fn reset(&mut self) {
		self.keys = None;
		self.pos = 0;
	}
}

/// The interface the engine requires from the transaction / storage layer.
///
/// Implementations provide snapshot reads and per-document writes; the
/// engine never touches storage except through this trait, so tests can
/// swap in fakes.
pub trait Store: Send + Sync {
	/// Resolve a collection by name.
	fn collection(&self, name: &str) -> Result<Arc<Collection>, Error>;

	/// Continue a full collection scan, returning at most `hint` documents,
	/// in random order when `random` is set. An empty result means the scan
	/// is exhausted.
	fn scan(
		&self,
		collection: &Collection,
		cursor: &mut ScanCursor,
		hint: usize,
		random: bool,
	) -> Result<Vec<Document>, Error>;

	/// Look up a single document by key.
	fn primary_lookup(&self, collection: &Collection, key: &str)
		-> Result<Option<Document>, Error>;

	/// Obtain an iterator over the edges pointing at the given vertex.
	fn edge_lookup(
		&self,
		collection: &Collection,
		direction: EdgeDirection,
		vertex: &DocumentHandle,
	) -> Result<DocIter, Error>;

	/// Obtain an iterator over the documents matching a fully shaped
	/// search tuple on a hash index.
	fn hash_lookup(
		&self,
		collection: &Collection,
		index: &IndexDef,
		search: &[Json],
	) -> Result<DocIter, Error>;

	/// Obtain an iterator over a skiplist index range, in index order, or
	/// reversed.
	fn skiplist_range(
		&self,
		collection: &Collection,
		index: &IndexDef,
		condition: &SkiplistCondition,
		reverse: bool,
	) -> Result<DocIter, Error>;

	/// Insert a new document, failing on key collisions.
	fn insert(&self, collection: &Collection, doc: Json, wait_for_sync: bool)
		-> Result<Document, Error>;

	/// Patch an existing document, returning the pre- and post-image.
	fn update(
		&self,
		collection: &Collection,
		key: &str,
		patch: &Json,
		keep_null: bool,
		merge_objects: bool,
		wait_for_sync: bool,
	) -> Result<(Document, Document), Error>;

	/// Overwrite an existing document wholesale, returning the pre- and
	/// post-image.
	fn replace(
		&self,
		collection: &Collection,
		key: &str,
		doc: Json,
		wait_for_sync: bool,
	) -> Result<(Document, Document), Error>;

	/// Remove a document, returning the pre-image.
	fn remove(&self, collection: &Collection, key: &str, wait_for_sync: bool)
		-> Result<Document, Error>;

	/// Generate a fresh document key for the collection.
	fn generate_key(&self, collection: &Collection) -> String;
}
