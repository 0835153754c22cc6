use crate::dbs::Block;
use crate::kvs::Document;
use crate::val::{Json, Range};
use std::fmt;

/// The tagged value carrier moved between pipeline operators.
///
/// A value is either absent, an owned JSON tree, an immutable pointer to a
/// stored document (interpreted through the collection pointer of the
/// register it sits in), a list of child blocks produced by a subquery, or
/// a lazy integer range.
#[derive(Clone, Debug, Default)]
pub enum Value {
	/// An absent slot
	#[default]
	None,
	/// An owned, materialized document or value tree
	Json(Json),
	/// An immutable document pointer into storage
	Shaped(Document),
	/// A sequence of child blocks, typically the result of a subquery;
	/// each child block carries its own register layout
	Docvec(Vec<Block>),
	/// A lazy, half-open integer interval
	Range(Range),
}

impl Value {
	/// Check if this value is absent.
	pub fn is_none(&self) -> bool {
		matches!(self, Value::None)
	}

	/// Materialize this value as an owned JSON tree. Shaped documents are
	/// copied out of storage; ranges are expanded; child blocks project
	/// their first register, the single column an inner result carries.
	pub fn to_json(&self) -> Json {
		match self {
			Value::None => Json::Null,
			Value::Json(v) => v.clone(),
			Value::Shaped(d) => d.to_json(),
			Value::Range(r) => r.to_json(),
			Value::Docvec(blocks) => {
				let mut out = Vec::new();
				for block in blocks {
					for row in 0..block.rows() {
						match block.get(row, 0) {
							Some(v) => out.push(v.to_json()),
							None => out.push(Json::Null),
						}
					}
				}
				Json::Array(out)
			}
		}
	}

	/// The truthiness of this value when used as a condition.
	pub fn is_truthy(&self) -> bool {
		match self {
			Value::None => false,
			Value::Json(v) => json_is_truthy(v),
			Value::Shaped(_) => true,
			Value::Docvec(blocks) => blocks.iter().any(|b| b.rows() > 0),
			Value::Range(r) => !r.is_empty(),
		}
	}

	/// The number of elements this value expands to in list enumeration,
	/// or `None` when the value is not array-like.
	pub fn list_len(&self) -> Option<usize> {
		match self {
			Value::Json(Json::Array(a)) => Some(a.len()),
			Value::Range(r) => Some(r.len()),
			Value::Docvec(blocks) => Some(blocks.iter().map(Block::rows).sum()),
			_ => None,
		}
	}

	/// The element at position `i` in list enumeration.
	pub fn list_at(&self, i: usize) -> Value {
		match self {
			Value::Json(Json::Array(a)) => a.get(i).cloned().map(Value::Json).unwrap_or_default(),
			Value::Range(r) => r.at(i).map(|v| Value::Json(Json::from(v))).unwrap_or_default(),
			Value::Docvec(blocks) => {
				let mut i = i;
				for block in blocks {
					if i < block.rows() {
						return block.get(i, 0).cloned().unwrap_or_default();
					}
					i -= block.rows();
				}
				Value::None
			}
			_ => Value::None,
		}
	}
}

/// The truthiness of a JSON value: null, false, zero and the empty string
/// are false, everything else is true.
pub fn json_is_truthy(v: &Json) -> bool {
	match v {
		Json::Null => false,
		Json::Bool(b) => *b,
		Json::Number(n) => n.as_f64().map_or(false, |n| n != 0.0),
		Json::String(s) => !s.is_empty(),
		Json::Array(_) | Json::Object(_) => true,
	}
}

impl From<Json> for Value {
	fn from(v: Json) -> Self {
		Value::Json(v)
	}
}

impl From<Document> for Value {
	fn from(v: Document) -> Self {
		Value::Shaped(v)
	}
}

impl From<Range> for Value {
	fn from(v: Range) -> Self {
		Value::Range(v)
	}
}

impl From<i64> for Value {
	fn from(v: i64) -> Self {
		Value::Json(Json::from(v))
	}
}

impl From<bool> for Value {
	fn from(v: bool) -> Self {
		Value::Json(Json::from(v))
	}
}

impl From<&str> for Value {
	fn from(v: &str) -> Self {
		Value::Json(Json::from(v))
	}
}

impl fmt::Display for Value {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		match self {
			Value::None => f.write_str("none"),
			Value::Range(r) => fmt::Display::fmt(r, f),
			v => fmt::Display::fmt(&v.to_json(), f),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn list_expansion() {
		let v = Value::Json(json!([1, "two", null]));
		assert_eq!(v.list_len(), Some(3));
		assert_eq!(v.list_at(1).to_json(), json!("two"));
		assert!(v.list_at(3).is_none());

		let r = Value::Range(Range::new(5, 8));
		assert_eq!(r.list_len(), Some(3));
		assert_eq!(r.list_at(2).to_json(), json!(7));

		assert_eq!(Value::Json(json!({"a": 1})).list_len(), None);
		assert_eq!(Value::None.list_len(), None);
	}

	#[test]
	fn shaped_materializes() {
		let doc = Document::new("users", json!({"_key": "jane", "age": 40}));
		let v = Value::Shaped(doc);
		assert_eq!(v.to_json()["age"], json!(40));
	}
}
