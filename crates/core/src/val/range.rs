use crate::val::Json;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A lazy, half-open interval of integers `[low, high)`.
///
/// Ranges participate in comparisons and list expansion as if they were
/// materialized arrays of integers, without allocating until asked to.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Range {
	pub low: i64,
	pub high: i64,
}

impl Range {
	pub fn new(low: i64, high: i64) -> Self {
		Self {
			low,
			high,
		}
	}

	/// The number of integers in the interval.
	pub fn len(&self) -> usize {
		(self.high - self.low).max(0) as usize
	}

	pub fn is_empty(&self) -> bool {
		self.high <= self.low
	}

	/// The integer at position `i`, if inside the interval.
	pub fn at(&self, i: usize) -> Option<i64> {
		let v = self.low.checked_add(i as i64)?;
		(v < self.high).then_some(v)
	}

	/// Materialize the interval as a JSON array of integers.
	pub fn to_json(&self) -> Json {
		Json::Array((self.low..self.high).map(Json::from).collect())
	}
}

impl fmt::Display for Range {
	fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
		write!(f, "{}..{}", self.low, self.high)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn half_open_bounds() {
		let r = Range::new(10, 15);
		assert_eq!(r.len(), 5);
		assert_eq!(r.at(0), Some(10));
		assert_eq!(r.at(4), Some(14));
		assert_eq!(r.at(5), None);
		assert!(Range::new(3, 3).is_empty());
		assert_eq!(Range::new(5, 3).len(), 0);
	}

	#[test]
	fn materializes_to_json() {
		assert_eq!(Range::new(0, 3).to_json(), serde_json::json!([0, 1, 2]));
	}
}
