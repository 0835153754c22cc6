use crate::err::Error;
use crate::kvs::{
	Collection, CollectionKind, DocIter, Document, DocumentHandle, DocumentIterator,
	EdgeDirection, IndexDef, ScanCursor, SkiplistCondition, Store, ID_ATTRIBUTE, KEY_ATTRIBUTE,
};
use crate::val::compare::compare_json;
use crate::val::Json;
use nanoid::nanoid;
use rand::seq::SliceRandom;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

/// An in-memory implementation of the storage interface, with the
/// transactional surface the engine requires. Index lookups are answered
/// by filtering the collection, which is adequate for a test datastore.
#[derive(Default)]
pub struct MemoryStore {
	collections: RwLock<HashMap<String, Arc<Collection>>>,
	data: RwLock<HashMap<String, BTreeMap<String, Document>>>,
}

impl MemoryStore {
	pub fn new() -> Self {
		Self::default()
	}

	/// Create a collection, replacing any previous one of the same name.
	pub fn create_collection(&self, name: &str, kind: CollectionKind) -> Arc<Collection> {
		let collection = Arc::new(Collection::new(name, kind));
		self.collections.write().unwrap().insert(name.to_owned(), collection.clone());
		self.data.write().unwrap().insert(name.to_owned(), BTreeMap::new());
		collection
	}

	/// The number of live documents in a collection.
	pub fn len(&self, collection: &Collection) -> usize {
		self.data.read().unwrap().get(collection.name()).map(BTreeMap::len).unwrap_or(0)
	}

	pub fn is_empty(&self, collection: &Collection) -> bool {
		self.len(collection) == 0
	}

	/// All live documents of a collection, in key order.
	pub fn all(&self, collection: &Collection) -> Vec<Document> {
		self.data
			.read()
			.unwrap()
			.get(collection.name())
			.map(|docs| docs.values().cloned().collect())
			.unwrap_or_default()
	}

	fn documents(&self, collection: &Collection) -> Result<Vec<Document>, Error> {
		let data = self.data.read().unwrap();
		let docs = data.get(collection.name()).ok_or_else(|| Error::Internal {
			message: format!("Collection '{}' has no storage", collection.name()),
		})?;
		Ok(docs.values().cloned().collect())
	}

	/// The value of a document attribute used in an index, with missing
	/// attributes indexed as null.
	fn indexed(doc: &Document, field: &str) -> Json {
		doc.as_json().get(field).cloned().unwrap_or(Json::Null)
	}
}

impl Store for MemoryStore {
	fn collection(&self, name: &str) -> Result<Arc<Collection>, Error> {
		self.collections.read().unwrap().get(name).cloned().ok_or_else(|| Error::Internal {
			message: format!("Collection '{name}' does not exist"),
		})
	}

	fn scan(
		&self,
		collection: &Collection,
		cursor: &mut ScanCursor,
		hint: usize,
		random: bool,
	) -> Result<Vec<Document>, Error> {
		// Snapshot the key order on the first call
		if cursor.keys.is_none() {
			let data = self.data.read().unwrap();
			let mut keys: Vec<String> = data
				.get(collection.name())
				.map(|docs| docs.keys().cloned().collect())
				.unwrap_or_default();
			if random {
				keys.shuffle(&mut rand::thread_rng());
			}
			cursor.keys = Some(keys);
		}
		let keys = cursor.keys.as_ref().unwrap();
		let data = self.data.read().unwrap();
		let docs = data.get(collection.name());
		let mut out = Vec::with_capacity(hint.min(keys.len() - cursor.pos.min(keys.len())));
		while out.len() < hint && cursor.pos < keys.len() {
			// Skip keys removed since the snapshot was taken
			if let Some(doc) = docs.and_then(|d| d.get(&keys[cursor.pos])) {
				out.push(doc.clone());
			}
			cursor.pos += 1;
		}
		Ok(out)
	}

	fn primary_lookup(
		&self,
		collection: &Collection,
		key: &str,
	) -> Result<Option<Document>, Error> {
		let data = self.data.read().unwrap();
		Ok(data.get(collection.name()).and_then(|docs| docs.get(key)).cloned())
	}

	fn edge_lookup(
		&self,
		collection: &Collection,
		direction: EdgeDirection,
		vertex: &DocumentHandle,
	) -> Result<DocIter, Error> {
		let handle = vertex.to_string();
		let matches = self
			.documents(collection)?
			.into_iter()
			.filter(|doc| {
				doc.as_json().get(direction.attribute()).and_then(Json::as_str)
					== Some(handle.as_str())
			})
			.collect();
		Ok(Box::new(VecIterator::new(matches)))
	}

	fn hash_lookup(
		&self,
		collection: &Collection,
		index: &IndexDef,
		search: &[Json],
	) -> Result<DocIter, Error> {
		let matches = self
			.documents(collection)?
			.into_iter()
			.filter(|doc| {
				index.fields.iter().zip(search.iter()).all(|(field, wanted)| {
					compare_json(&Self::indexed(doc, field), wanted) == Ordering::Equal
				})
			})
			.collect();
		Ok(Box::new(VecIterator::new(matches)))
	}

	fn skiplist_range(
		&self,
		collection: &Collection,
		index: &IndexDef,
		condition: &SkiplistCondition,
		reverse: bool,
	) -> Result<DocIter, Error> {
		let range_field = index.fields.get(condition.prefix.len());
		let mut matches: Vec<Document> = self
			.documents(collection)?
			.into_iter()
			.filter(|doc| {
				// The fully-bound prefix attributes must match exactly
				let prefix_ok = index.fields.iter().zip(condition.prefix.iter()).all(
					|(field, wanted)| {
						compare_json(&Self::indexed(doc, field), wanted) == Ordering::Equal
					},
				);
				if !prefix_ok {
					return false;
				}
				// The next attribute, if any, must fall inside the range
				if let Some(field) = range_field {
					let v = Self::indexed(doc, field);
					if let Some(low) = &condition.low {
						match compare_json(&v, &low.value) {
							Ordering::Less => return false,
							Ordering::Equal if !low.inclusive => return false,
							_ => (),
						}
					}
					if let Some(high) = &condition.high {
						match compare_json(&v, &high.value) {
							Ordering::Greater => return false,
							Ordering::Equal if !high.inclusive => return false,
							_ => (),
						}
					}
				}
				true
			})
			.collect();
		// Serve the documents in index order
		matches.sort_by(|a, b| {
			for field in &index.fields {
				match compare_json(&Self::indexed(a, field), &Self::indexed(b, field)) {
					Ordering::Equal => continue,
					other => return other,
				}
			}
			a.key().cmp(&b.key())
		});
		if reverse {
			matches.reverse();
		}
		Ok(Box::new(VecIterator::new(matches)))
	}

	fn insert(
		&self,
		collection: &Collection,
		mut doc: Json,
		_wait_for_sync: bool,
	) -> Result<Document, Error> {
		if !doc.is_object() {
			return Err(Error::DocumentTypeInvalid);
		}
		let key = match doc.get(KEY_ATTRIBUTE) {
			Some(Json::String(key)) => key.clone(),
			Some(_) => return Err(Error::DocumentKeyMissing),
			None => {
				let key = self.generate_key(collection);
				doc.as_object_mut()
					.unwrap()
					.insert(KEY_ATTRIBUTE.to_owned(), Json::from(key.clone()));
				key
			}
		};
		let mut data = self.data.write().unwrap();
		let docs = data.entry(collection.name().to_owned()).or_default();
		if docs.contains_key(&key) {
			return Err(Error::UniqueConstraintViolated {
				collection: collection.name().to_owned(),
				key,
			});
		}
		let doc = Document::new(collection.name(), doc);
		docs.insert(key, doc.clone());
		Ok(doc)
	}

	fn update(
		&self,
		collection: &Collection,
		key: &str,
		patch: &Json,
		keep_null: bool,
		merge_objects: bool,
		_wait_for_sync: bool,
	) -> Result<(Document, Document), Error> {
		let mut data = self.data.write().unwrap();
		let docs = data.entry(collection.name().to_owned()).or_default();
		let old = docs.get(key).cloned().ok_or_else(|| Error::DocumentNotFound {
			collection: collection.name().to_owned(),
			key: key.to_owned(),
		})?;
		let mut merged = old.to_json();
		merge(&mut merged, patch, keep_null, merge_objects);
		// The system attributes of the stored document always win
		if let (Some(obj), Some(old)) = (merged.as_object_mut(), old.as_json().as_object()) {
			for attr in [KEY_ATTRIBUTE, ID_ATTRIBUTE] {
				if let Some(v) = old.get(attr) {
					obj.insert(attr.to_owned(), v.clone());
				}
			}
		}
		let new = Document::new(collection.name(), merged);
		docs.insert(key.to_owned(), new.clone());
		Ok((old, new))
	}

	fn replace(
		&self,
		collection: &Collection,
		key: &str,
		mut doc: Json,
		_wait_for_sync: bool,
	) -> Result<(Document, Document), Error> {
		if !doc.is_object() {
			return Err(Error::DocumentTypeInvalid);
		}
		let mut data = self.data.write().unwrap();
		let docs = data.entry(collection.name().to_owned()).or_default();
		let old = docs.get(key).cloned().ok_or_else(|| Error::DocumentNotFound {
			collection: collection.name().to_owned(),
			key: key.to_owned(),
		})?;
		if let Some(obj) = doc.as_object_mut() {
			obj.insert(KEY_ATTRIBUTE.to_owned(), Json::from(key));
		}
		let new = Document::new(collection.name(), doc);
		docs.insert(key.to_owned(), new.clone());
		Ok((old, new))
	}

	fn remove(
		&self,
		collection: &Collection,
		key: &str,
		_wait_for_sync: bool,
	) -> Result<Document, Error> {
		let mut data = self.data.write().unwrap();
		let docs = data.entry(collection.name().to_owned()).or_default();
		docs.remove(key).ok_or_else(|| Error::DocumentNotFound {
			collection: collection.name().to_owned(),
			key: key.to_owned(),
		})
	}

	fn generate_key(&self, collection: &Collection) -> String {
		let data = self.data.read().unwrap();
		let docs = data.get(collection.name());
		loop {
			let key = nanoid!(16);
			if docs.map_or(true, |d| !d.contains_key(&key)) {
				return key;
			}
		}
	}
}

/// Merge a patch into a document, following the update options.
fn merge(target: &mut Json, patch: &Json, keep_null: bool, merge_objects: bool) {
	if let (Some(target), Some(patch)) = (target.as_object_mut(), patch.as_object()) {
		for (k, v) in patch {
			match v {
				Json::Null if !keep_null => {
					target.remove(k);
				}
				Json::Object(_) if merge_objects && target.get(k).map_or(false, Json::is_object) => {
					merge(target.get_mut(k).unwrap(), v, keep_null, merge_objects);
				}
				v => {
					target.insert(k.clone(), v.clone());
				}
			}
		}
	}
}

/// A pre-collected batch iterator over document pointers.
pub(crate) struct VecIterator {
	docs: std::vec::IntoIter<Document>,
}

impl VecIterator {
	pub(crate) fn new(docs: Vec<Document>) -> Self {
		Self {
			docs: docs.into_iter(),
		}
	}
}

impl DocumentIterator for VecIterator {
	fn next_batch(&mut self, limit: usize) -> Result<Vec<Document>, Error> {
		Ok(self.docs.by_ref().take(limit).collect())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kvs::{IndexKind, ScalarBound};
	use serde_json::json;

	fn store_with(docs: &[Json]) -> (MemoryStore, Arc<Collection>) {
		let store = MemoryStore::new();
		let collection = store.create_collection("test", CollectionKind::Document);
		for doc in docs {
			store.insert(&collection, doc.clone(), false).unwrap();
		}
		(store, collection)
	}

	#[test]
	fn insert_generates_and_rejects_keys() {
		let (store, collection) = store_with(&[]);
		let doc = store.insert(&collection, json!({"a": 1}), false).unwrap();
		assert!(doc.key().is_some());
		store.insert(&collection, json!({"_key": "x"}), false).unwrap();
		let err = store.insert(&collection, json!({"_key": "x"}), false).unwrap_err();
		assert!(matches!(err, Error::UniqueConstraintViolated { .. }));
	}

	#[test]
	fn scan_is_batched_and_exhausts() {
		let docs: Vec<Json> = (0..25).map(|i| json!({"_key": format!("k{i:02}")})).collect();
		let (store, collection) = store_with(&docs);
		let mut cursor = ScanCursor::default();
		let mut seen = 0;
		loop {
			let batch = store.scan(&collection, &mut cursor, 10, false).unwrap();
			if batch.is_empty() {
				break;
			}
			seen += batch.len();
		}
		assert_eq!(seen, 25);
	}

	#[test]
	fn update_merges_and_honors_options() {
		let (store, collection) =
			store_with(&[json!({"_key": "a", "x": {"y": 1}, "gone": true})]);
		let (_, new) = store
			.update(&collection, "a", &json!({"x": {"z": 2}, "gone": null}), false, true, false)
			.unwrap();
		assert_eq!(new.as_json()["x"], json!({"y": 1, "z": 2}));
		assert!(new.as_json().get("gone").is_none());
		// Without object merging the patch value wins wholesale
		let (_, new) = store
			.update(&collection, "a", &json!({"x": {"w": 3}}), true, false, false)
			.unwrap();
		assert_eq!(new.as_json()["x"], json!({"w": 3}));
	}

	#[test]
	fn skiplist_filters_and_orders() {
		let (store, collection) = store_with(&[
			json!({"_key": "a", "g": 1, "v": 5}),
			json!({"_key": "b", "g": 1, "v": 2}),
			json!({"_key": "c", "g": 2, "v": 9}),
			json!({"_key": "d", "g": 1, "v": 7}),
		]);
		let index = IndexDef {
			name: "gv".to_owned(),
			kind: IndexKind::Skiplist,
			fields: vec!["g".to_owned(), "v".to_owned()],
		};
		let condition = SkiplistCondition {
			prefix: vec![json!(1)],
			low: Some(ScalarBound {
				value: json!(2),
				inclusive: true,
			}),
			high: Some(ScalarBound {
				value: json!(7),
				inclusive: false,
			}),
		};
		let mut iter = store.skiplist_range(&collection, &index, &condition, false).unwrap();
		let keys: Vec<_> =
			iter.next_batch(10).unwrap().iter().map(|d| d.key().unwrap().to_owned()).collect();
		assert_eq!(keys, vec!["b", "a"]);
	}
}
