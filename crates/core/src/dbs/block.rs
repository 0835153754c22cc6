use crate::err::Error;
use crate::kvs::Collection;
use crate::val::Value;
use ahash::AHashMap;
use std::sync::Arc;

/// A column slot in a block, addressed by a small integer.
pub type RegisterId = usize;

/// The identity of a logical value inside one block.
pub type ValueId = u64;

/// The result of stealing a value out of a block cell.
#[derive(Debug)]
pub enum Stolen {
	/// The cell was empty
	Empty,
	/// The cell held the only reference; the caller now owns the value
	Owned(Value),
	/// The value is still referenced elsewhere in the block; the cell was
	/// cleared and the reference count decremented. Callers migrating the
	/// value into another block must clone it instead.
	Shared,
}

#[derive(Clone, Debug)]
struct Entry {
	value: Value,
	count: u32,
}

/// A rectangular batch of rows with a fixed register layout, passed
/// between operators.
///
/// Every logical value stored in a block lives in the block's value table
/// exactly once; cells reference values by id. A value may sit in several
/// cells of the same block (operators project the first row's inherited
/// registers into every subsequent row), and the table tracks the live
/// reference count so that ownership can be transferred out precisely and
/// memory released exactly once.
#[derive(Clone, Debug, Default)]
pub struct Block {
	rows: usize,
	regs: usize,
	data: Vec<Option<ValueId>>,
	values: AHashMap<ValueId, Entry>,
	next: ValueId,
	cols: Vec<Option<Arc<Collection>>>,
}

impl Block {
	/// Create a block of the given dimensions, with every cell empty.
	pub fn new(rows: usize, regs: usize) -> Self {
		Self {
			rows,
			regs,
			data: vec![None; rows * regs],
			values: AHashMap::new(),
			next: 0,
			cols: vec![None; regs],
		}
	}

	pub fn rows(&self) -> usize {
		self.rows
	}

	pub fn regs(&self) -> usize {
		self.regs
	}

	fn idx(&self, row: usize, reg: RegisterId) -> usize {
		debug_assert!(row < self.rows && reg < self.regs);
		row * self.regs + reg
	}

	/// Store a value into an empty cell, returning its id.
	pub fn set(&mut self, row: usize, reg: RegisterId, value: Value) -> ValueId {
		let idx = self.idx(row, reg);
		debug_assert!(self.data[idx].is_none(), "cell ({row},{reg}) already occupied");
		let id = self.next;
		self.next += 1;
		self.values.insert(
			id,
			Entry {
				value,
				count: 1,
			},
		);
		self.data[idx] = Some(id);
		id
	}

	/// Reference an existing value from another (empty) cell.
	pub fn share(&mut self, row: usize, reg: RegisterId, id: ValueId) {
		let idx = self.idx(row, reg);
		debug_assert!(self.data[idx].is_none(), "cell ({row},{reg}) already occupied");
		let entry = self.values.get_mut(&id).expect("shared value id must be live");
		entry.count += 1;
		self.data[idx] = Some(id);
	}

	/// The value id stored at a position, if any.
	pub fn id_at(&self, row: usize, reg: RegisterId) -> Option<ValueId> {
		self.data[self.idx(row, reg)]
	}

	/// Borrow the value at a position.
	pub fn get(&self, row: usize, reg: RegisterId) -> Option<&Value> {
		self.data[self.idx(row, reg)].map(|id| &self.values[&id].value)
	}

	/// The number of live references to a value within this block.
	pub fn value_count(&self, id: ValueId) -> usize {
		self.values.get(&id).map(|e| e.count as usize).unwrap_or(0)
	}

	/// Deep-copy the value at a position.
	pub fn clone_value(&self, row: usize, reg: RegisterId) -> Option<Value> {
		self.get(row, reg).cloned()
	}

	/// Transfer ownership of the value at a position out of the block.
	pub fn steal(&mut self, row: usize, reg: RegisterId) -> Stolen {
		let idx = self.idx(row, reg);
		let Some(id) = self.data[idx].take() else {
			return Stolen::Empty;
		};
		let entry = self.values.get_mut(&id).expect("cell id must be live");
		if entry.count == 1 {
			Stolen::Owned(self.values.remove(&id).unwrap().value)
		} else {
			entry.count -= 1;
			Stolen::Shared
		}
	}

	/// Null out a cell, dropping one reference. The value is released when
	/// the last reference goes.
	pub fn erase(&mut self, row: usize, reg: RegisterId) {
		let idx = self.idx(row, reg);
		if let Some(id) = self.data[idx].take() {
			let entry = self.values.get_mut(&id).expect("cell id must be live");
			entry.count -= 1;
			if entry.count == 0 {
				self.values.remove(&id);
			}
		}
	}

	/// The collection pointer interpreting shaped values in a register.
	pub fn col(&self, reg: RegisterId) -> Option<&Arc<Collection>> {
		self.cols.get(reg).and_then(Option::as_ref)
	}

	/// Attach the collection pointer of a register.
	pub fn set_col(&mut self, reg: RegisterId, collection: Arc<Collection>) {
		self.cols[reg] = Some(collection);
	}

	/// Erase every value in the given columns.
	pub fn clear_registers(&mut self, regs: &[RegisterId]) {
		for &reg in regs {
			for row in 0..self.rows {
				self.erase(row, reg);
			}
		}
	}

	/// Truncate the block to `n` rows, releasing the dropped rows' values.
	pub fn shrink(&mut self, n: usize) {
		if n >= self.rows {
			return;
		}
		for row in n..self.rows {
			for reg in 0..self.regs {
				self.erase(row, reg);
			}
		}
		self.rows = n;
		self.data.truncate(n * self.regs);
	}

	/// Clone the rows `[from, to)` into a new block. Values shared between
	/// cells of the slice stay shared in the copy.
	pub fn slice(&self, from: usize, to: usize) -> Block {
		let rows: Vec<usize> = (from..to).collect();
		self.slice_rows(&rows)
	}

	/// Clone the selected rows, in the given order, into a new block.
	pub fn slice_rows(&self, rows: &[usize]) -> Block {
		let mut out = Block::new(rows.len(), self.regs);
		out.cols.clone_from(&self.cols);
		let mut mapped: AHashMap<ValueId, ValueId> = AHashMap::new();
		for (dst, &src) in rows.iter().enumerate() {
			for reg in 0..self.regs {
				if let Some(id) = self.id_at(src, reg) {
					match mapped.get(&id) {
						Some(&new) => out.share(dst, reg, new),
						None => {
							let new = out.set(dst, reg, self.values[&id].value.clone());
							mapped.insert(id, new);
						}
					}
				}
			}
		}
		out
	}

	/// Move the selected rows' values into a new block without cloning,
	/// clearing them in the source. Values still referenced from rows that
	/// were not selected are cloned instead of moved.
	pub fn steal_rows(&mut self, rows: &[usize]) -> Block {
		let mut out = Block::new(rows.len(), self.regs);
		out.cols.clone_from(&self.cols);
		let mut mapped: AHashMap<ValueId, ValueId> = AHashMap::new();
		for (dst, &src) in rows.iter().enumerate() {
			for reg in 0..self.regs {
				let Some(id) = self.id_at(src, reg) else {
					continue;
				};
				if let Some(&new) = mapped.get(&id) {
					out.share(dst, reg, new);
					self.erase(src, reg);
					continue;
				}
				let new = match self.steal(src, reg) {
					Stolen::Owned(value) => out.set(dst, reg, value),
					Stolen::Shared => {
						out.set(dst, reg, self.values[&id].value.clone())
					}
					Stolen::Empty => unreachable!("cell id checked above"),
				};
				mapped.insert(id, new);
			}
		}
		out
	}

	/// Coalesce equally-shaped blocks into one.
	pub fn concatenate(blocks: Vec<Block>) -> Result<Block, Error> {
		let mut iter = blocks.into_iter();
		let Some(first) = iter.next() else {
			return Err(Error::Internal {
				message: String::from("Cannot concatenate zero blocks"),
			});
		};
		let regs = first.regs;
		let mut out = first;
		for block in iter {
			if block.regs != regs {
				return Err(Error::Internal {
					message: String::from("Cannot concatenate blocks of different width"),
				});
			}
			let base = out.rows;
			out.rows += block.rows;
			out.data.resize(out.rows * regs, None);
			for reg in 0..regs {
				if out.cols[reg].is_none() {
					out.cols[reg] = block.cols[reg].clone();
				}
			}
			let mut mapped: AHashMap<ValueId, ValueId> = AHashMap::new();
			let mut values = block.values;
			for row in 0..block.rows {
				for reg in 0..regs {
					let Some(id) = block.data[row * regs + reg] else {
						continue;
					};
					match mapped.get(&id) {
						Some(&new) => out.share(base + row, reg, new),
						None => {
							let value = values
								.remove(&id)
								.map(|e| e.value)
								.expect("cell id must be live");
							let new = out.set(base + row, reg, value);
							mapped.insert(id, new);
						}
					}
				}
			}
		}
		Ok(out)
	}

	/// Transfer one row's values into a row of another block, stealing
	/// values the row owns exclusively and cloning values still shared
	/// with other rows of this block. The source cells are cleared.
	pub fn move_row(&mut self, src_row: usize, dst: &mut Block, dst_row: usize) {
		for reg in 0..self.regs.min(dst.regs) {
			let Some(id) = self.id_at(src_row, reg) else {
				continue;
			};
			if self.value_count(id) == 1 {
				if let Stolen::Owned(value) = self.steal(src_row, reg) {
					dst.set(dst_row, reg, value);
				}
			} else {
				let value = self.values[&id].value.clone();
				self.erase(src_row, reg);
				dst.set(dst_row, reg, value);
			}
			if dst.cols[reg].is_none() {
				dst.cols[reg] = self.cols[reg].clone();
			}
		}
	}

	/// Clone one row's values (the registers inherited from upstream) from
	/// another block into a row of this one, carrying the collection
	/// pointers along.
	pub fn inherit(&mut self, dst_row: usize, src: &Block, src_row: usize) {
		for reg in 0..src.regs().min(self.regs) {
			if let Some(value) = src.get(src_row, reg) {
				self.set(dst_row, reg, value.clone());
			}
			if self.cols[reg].is_none() {
				self.cols[reg] = src.col(reg).cloned();
			}
		}
	}

	/// Reference every value of one row from another (empty) row, used to
	/// project the first row's inherited registers into every subsequent
	/// row without copying.
	pub fn repeat(&mut self, src_row: usize, dst_row: usize, regs: usize) {
		for reg in 0..regs.min(self.regs) {
			if let Some(id) = self.id_at(src_row, reg) {
				self.share(dst_row, reg, id);
			}
		}
	}

	/// Borrow one row as an input view for expression evaluation.
	pub fn row(&self, row: usize) -> Row<'_> {
		Row {
			block: self,
			row,
		}
	}
}

/// A borrowed view of one row of a block.
#[derive(Clone, Copy)]
pub struct Row<'a> {
	block: &'a Block,
	row: usize,
}

impl<'a> Row<'a> {
	pub fn new(block: &'a Block, row: usize) -> Self {
		Self {
			block,
			row,
		}
	}

	pub fn get(&self, reg: RegisterId) -> Option<&'a Value> {
		self.block.get(self.row, reg)
	}

	pub fn col(&self, reg: RegisterId) -> Option<&'a Arc<Collection>> {
		self.block.col(reg)
	}

	pub fn block(&self) -> &'a Block {
		self.block
	}

	pub fn index(&self) -> usize {
		self.row
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	fn value(v: i64) -> Value {
		Value::Json(json!(v))
	}

	#[test]
	fn sharing_tracks_reference_counts() {
		let mut block = Block::new(3, 2);
		let id = block.set(0, 0, value(7));
		block.share(1, 0, id);
		block.share(2, 0, id);
		assert_eq!(block.value_count(id), 3);
		// A shared value cannot be stolen, only released
		assert!(matches!(block.steal(2, 0), Stolen::Shared));
		assert_eq!(block.value_count(id), 2);
		block.erase(1, 0);
		assert!(matches!(block.steal(0, 0), Stolen::Owned(_)));
		assert_eq!(block.value_count(id), 0);
		assert!(block.get(0, 0).is_none());
	}

	#[test]
	fn slice_preserves_sharing() {
		let mut block = Block::new(3, 2);
		let id = block.set(0, 0, value(1));
		block.share(1, 0, id);
		block.set(1, 1, value(2));
		block.set(2, 0, value(3));
		let slice = block.slice(0, 2);
		assert_eq!(slice.rows(), 2);
		let a = slice.id_at(0, 0).unwrap();
		let b = slice.id_at(1, 0).unwrap();
		assert_eq!(a, b);
		assert_eq!(slice.value_count(a), 2);
		// The source block is untouched
		assert_eq!(block.value_count(id), 2);
	}

	#[test]
	fn steal_rows_moves_unique_and_clones_shared() {
		let mut block = Block::new(3, 1);
		let shared = block.set(0, 0, value(1));
		block.share(2, 0, shared);
		block.set(1, 0, value(2));
		let out = block.steal_rows(&[0, 1]);
		assert_eq!(out.rows(), 2);
		assert_eq!(out.get(0, 0).unwrap().to_json(), json!(1));
		assert_eq!(out.get(1, 0).unwrap().to_json(), json!(2));
		// Row 0 was shared with row 2, so the source kept one reference
		assert!(block.get(0, 0).is_none());
		assert!(block.get(1, 0).is_none());
		assert_eq!(block.get(2, 0).unwrap().to_json(), json!(1));
	}

	#[test]
	fn concatenate_requires_equal_width() {
		let mut a = Block::new(1, 2);
		a.set(0, 0, value(1));
		let mut b = Block::new(2, 2);
		let id = b.set(0, 1, value(2));
		b.share(1, 1, id);
		let out = Block::concatenate(vec![a, b]).unwrap();
		assert_eq!(out.rows(), 3);
		assert_eq!(out.get(0, 0).unwrap().to_json(), json!(1));
		let x = out.id_at(1, 1).unwrap();
		assert_eq!(out.id_at(2, 1), Some(x));
		assert_eq!(out.value_count(x), 2);

		let c = Block::new(1, 3);
		assert!(Block::concatenate(vec![out, c]).is_err());
	}

	#[test]
	fn shrink_and_clear_release_values() {
		let mut block = Block::new(3, 2);
		block.set(0, 0, value(1));
		block.set(1, 0, value(2));
		block.set(2, 1, value(3));
		block.shrink(2);
		assert_eq!(block.rows(), 2);
		block.clear_registers(&[0]);
		assert!(block.get(0, 0).is_none());
		assert!(block.get(1, 0).is_none());
	}

	#[test]
	fn repeat_projects_inherited_registers() {
		let mut input = Block::new(1, 2);
		input.set(0, 0, value(9));
		let mut out = Block::new(3, 3);
		out.inherit(0, &input, 0);
		out.repeat(0, 1, 2);
		out.repeat(0, 2, 2);
		let id = out.id_at(0, 0).unwrap();
		assert_eq!(out.value_count(id), 3);
		assert_eq!(out.get(2, 0).unwrap().to_json(), json!(9));
	}
}
