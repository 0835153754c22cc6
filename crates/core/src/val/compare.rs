use crate::val::{Json, Value};
use lexicmp::lexical_cmp;
use std::borrow::Cow;
use std::cmp::Ordering;

/// Three-way comparison between two values.
///
/// The order is the typed JSON total order: absent < null < bool < number <
/// string < array < object. Shaped documents are projected to JSON on
/// demand, ranges participate as arrays of integers, and child-block lists
/// as arrays of their rows. String comparison is collated through
/// `lexicmp`, which is stable across threads and runs.
pub fn compare(a: &Value, b: &Value) -> Ordering {
	match (a, b) {
		(Value::None, Value::None) => Ordering::Equal,
		(Value::None, _) => Ordering::Less,
		(_, Value::None) => Ordering::Greater,
		(a, b) => compare_json(project(a).as_ref(), project(b).as_ref()),
	}
}

/// Project a value onto its JSON representation, borrowing when possible.
fn project(v: &Value) -> Cow<'_, Json> {
	match v {
		Value::Json(j) => Cow::Borrowed(j),
		Value::Shaped(d) => Cow::Borrowed(d.as_json()),
		_ => Cow::Owned(v.to_json()),
	}
}

fn type_rank(v: &Json) -> u8 {
	match v {
		Json::Null => 0,
		Json::Bool(_) => 1,
		Json::Number(_) => 2,
		Json::String(_) => 3,
		Json::Array(_) => 4,
		Json::Object(_) => 5,
	}
}

/// Three-way comparison of two JSON trees in the typed total order.
pub fn compare_json(a: &Json, b: &Json) -> Ordering {
	match (a, b) {
		(Json::Null, Json::Null) => Ordering::Equal,
		(Json::Bool(a), Json::Bool(b)) => a.cmp(b),
		(Json::Number(a), Json::Number(b)) => compare_numbers(a, b),
		(Json::String(a), Json::String(b)) => lexical_cmp(a.as_str(), b.as_str()),
		(Json::Array(a), Json::Array(b)) => {
			for (x, y) in a.iter().zip(b.iter()) {
				match compare_json(x, y) {
					Ordering::Equal => continue,
					other => return other,
				}
			}
			a.len().cmp(&b.len())
		}
		(Json::Object(a), Json::Object(b)) => {
			// Objects compare by their sorted attribute names first, then by
			// the attribute values in that same order.
			let mut ka: Vec<&String> = a.keys().collect();
			let mut kb: Vec<&String> = b.keys().collect();
			ka.sort_unstable();
			kb.sort_unstable();
			for (x, y) in ka.iter().zip(kb.iter()) {
				match lexical_cmp(x.as_str(), y.as_str()) {
					Ordering::Equal => continue,
					other => return other,
				}
			}
			match ka.len().cmp(&kb.len()) {
				Ordering::Equal => (),
				other => return other,
			}
			for k in ka {
				match compare_json(&a[k], &b[k]) {
					Ordering::Equal => continue,
					other => return other,
				}
			}
			Ordering::Equal
		}
		(a, b) => type_rank(a).cmp(&type_rank(b)),
	}
}

fn compare_numbers(a: &serde_json::Number, b: &serde_json::Number) -> Ordering {
	if let (Some(a), Some(b)) = (a.as_i64(), b.as_i64()) {
		return a.cmp(&b);
	}
	if let (Some(a), Some(b)) = (a.as_u64(), b.as_u64()) {
		return a.cmp(&b);
	}
	let a = a.as_f64().unwrap_or(f64::NAN);
	let b = b.as_f64().unwrap_or(f64::NAN);
	a.total_cmp(&b)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::val::Range;
	use serde_json::json;

	fn cmp(a: Json, b: Json) -> Ordering {
		compare(&Value::Json(a), &Value::Json(b))
	}

	#[test]
	fn type_order() {
		let ordered = [json!(null), json!(false), json!(1), json!("a"), json!([1]), json!({"a": 1})];
		for pair in ordered.windows(2) {
			assert_eq!(cmp(pair[0].clone(), pair[1].clone()), Ordering::Less);
		}
		assert_eq!(compare(&Value::None, &Value::Json(json!(null))), Ordering::Less);
	}

	#[test]
	fn numbers_across_representations() {
		assert_eq!(cmp(json!(1), json!(1.0)), Ordering::Equal);
		assert_eq!(cmp(json!(-3), json!(2.5)), Ordering::Less);
		assert_eq!(cmp(json!(u64::MAX), json!(1)), Ordering::Greater);
	}

	#[test]
	fn arrays_elementwise_then_length() {
		assert_eq!(cmp(json!([1, 2]), json!([1, 2, 0])), Ordering::Less);
		assert_eq!(cmp(json!([1, 3]), json!([1, 2, 0])), Ordering::Greater);
	}

	#[test]
	fn objects_by_keys_then_values() {
		assert_eq!(cmp(json!({"a": 1}), json!({"a": 1})), Ordering::Equal);
		assert_eq!(cmp(json!({"a": 1}), json!({"b": 1})), Ordering::Less);
		assert_eq!(cmp(json!({"a": 1}), json!({"a": 2})), Ordering::Less);
		assert_eq!(cmp(json!({"a": 1}), json!({"a": 1, "b": 1})), Ordering::Less);
	}

	#[test]
	fn ranges_compare_as_arrays() {
		let r = Value::Range(Range::new(1, 4));
		assert_eq!(compare(&r, &Value::Json(json!([1, 2, 3]))), Ordering::Equal);
		assert_eq!(compare(&r, &Value::Json(json!([1, 2, 4]))), Ordering::Less);
	}
}
