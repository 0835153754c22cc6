use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

/// The execution counters a query engine exposes upwards. Counters are
/// cumulative; `full_count` uses `-1` as the "not tracked" sentinel
/// because the number crosses the peer protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Statistics {
	pub writes_executed: u64,
	pub writes_ignored: u64,
	pub scanned_full: u64,
	pub scanned_index: u64,
	pub filtered: u64,
	pub full_count: i64,
}

impl Default for Statistics {
	fn default() -> Self {
		Self {
			writes_executed: 0,
			writes_ignored: 0,
			scanned_full: 0,
			scanned_index: 0,
			filtered: 0,
			full_count: -1,
		}
	}
}

impl Statistics {
	/// Fold another statistics object (typically a per-peer delta) into
	/// this one.
	pub fn add(&mut self, other: &Statistics) {
		self.writes_executed += other.writes_executed;
		self.writes_ignored += other.writes_ignored;
		self.scanned_full += other.scanned_full;
		self.scanned_index += other.scanned_index;
		self.filtered += other.filtered;
		if other.full_count >= 0 {
			if self.full_count < 0 {
				self.full_count = 0;
			}
			self.full_count += other.full_count;
		}
	}

	/// The incremental change since a previous snapshot, for delta
	/// accounting across the peer protocol.
	pub fn delta_since(&self, prev: &Statistics) -> Statistics {
		Statistics {
			writes_executed: self.writes_executed - prev.writes_executed,
			writes_ignored: self.writes_ignored - prev.writes_ignored,
			scanned_full: self.scanned_full - prev.scanned_full,
			scanned_index: self.scanned_index - prev.scanned_index,
			filtered: self.filtered - prev.filtered,
			full_count: match self.full_count {
				n if n < 0 => -1,
				n => n - prev.full_count.max(0),
			},
		}
	}
}

/// A cheaply cloneable handle onto the statistics of one query.
#[derive(Clone, Default)]
pub struct Stats(Arc<Mutex<Statistics>>);

impl Stats {
	pub fn snapshot(&self) -> Statistics {
		*self.0.lock().unwrap()
	}

	pub fn add(&self, delta: &Statistics) {
		self.0.lock().unwrap().add(delta);
	}

	pub(crate) fn incr_writes_executed(&self, n: u64) {
		self.0.lock().unwrap().writes_executed += n;
	}

	pub(crate) fn incr_writes_ignored(&self, n: u64) {
		self.0.lock().unwrap().writes_ignored += n;
	}

	pub(crate) fn incr_scanned_full(&self, n: u64) {
		self.0.lock().unwrap().scanned_full += n;
	}

	pub(crate) fn incr_scanned_index(&self, n: u64) {
		self.0.lock().unwrap().scanned_index += n;
	}

	pub(crate) fn incr_filtered(&self, n: u64) {
		self.0.lock().unwrap().filtered += n;
	}

	/// Add to the full count, initializing the sentinel to zero on first
	/// use.
	pub(crate) fn add_full_count(&self, n: u64) {
		let mut stats = self.0.lock().unwrap();
		if stats.full_count < 0 {
			stats.full_count = 0;
		}
		stats.full_count += n as i64;
	}
}

/// A warning raised during execution, forwarded from peers to the
/// coordinator's query.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
	pub code: i64,
	pub message: String,
}

/// A cheaply cloneable handle onto the warning list of one query.
#[derive(Clone, Default)]
pub struct Warnings(Arc<Mutex<Vec<Warning>>>);

impl Warnings {
	pub fn push(&self, code: i64, message: String) {
		self.0.lock().unwrap().push(Warning {
			code,
			message,
		});
	}

	pub fn extend(&self, warnings: Vec<Warning>) {
		self.0.lock().unwrap().extend(warnings);
	}

	pub fn snapshot(&self) -> Vec<Warning> {
		self.0.lock().unwrap().clone()
	}

	/// Remove and return the warnings accumulated so far.
	pub fn drain(&self) -> Vec<Warning> {
		std::mem::take(&mut *self.0.lock().unwrap())
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn full_count_sentinel_semantics() {
		let mut a = Statistics::default();
		assert_eq!(a.full_count, -1);
		let mut delta = Statistics::default();
		delta.full_count = 10;
		a.add(&delta);
		assert_eq!(a.full_count, 10);
		let b = Statistics::default();
		a.add(&b);
		assert_eq!(a.full_count, 10);
	}

	#[test]
	fn delta_accounting() {
		let mut prev = Statistics::default();
		prev.scanned_full = 5;
		let mut now = prev;
		now.scanned_full = 12;
		now.full_count = 3;
		let delta = now.delta_since(&prev);
		assert_eq!(delta.scanned_full, 7);
		assert_eq!(delta.full_count, 3);
	}
}
