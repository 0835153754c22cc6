use crate::cnf::DEFAULT_BATCH_SIZE;
use crate::ctx::Context;
use crate::dbs::operator::{InputRow, OperatorBase};
use crate::dbs::{Block, Stolen, ValueId};
use crate::err::Error;
use crate::plan::SortKey;
use crate::val::{compare, Value};
use ahash::AHashMap;
use std::cmp::Ordering;

static NONE: Value = Value::None;

/// The fully blocking sort: pulls the complete upstream stream, sorts a
/// coordinate list over it, and re-materializes fresh batches, moving
/// each value when it is unique and cloning it when shared.
pub(crate) struct SortOperator {
	pub(crate) base: OperatorBase,
	keys: Vec<SortKey>,
	stable: bool,
	sorted: bool,
}

impl SortOperator {
	pub(crate) fn new(base: OperatorBase, keys: Vec<SortKey>, stable: bool) -> Self {
		Self {
			base,
			keys,
			stable,
			sorted: false,
		}
	}

	pub(crate) async fn initialize_cursor(
		&mut self,
		ctx: &Context,
		input: InputRow<'_>,
	) -> Result<(), Error> {
		self.base.initialize_cursor(ctx, input).await?;
		self.sorted = false;
		Ok(())
	}

	pub(crate) async fn get_or_skip_some(
		&mut self,
		ctx: &Context,
		_at_least: usize,
		at_most: usize,
		skipping: bool,
	) -> Result<(Option<Block>, usize), Error> {
		if !self.sorted {
			self.do_sort(ctx).await?;
		}
		let mut collected = Vec::new();
		let count = self.base.take_from_buffer(at_most, skipping, &mut collected);
		if self.base.buffer.is_empty() {
			self.base.done = true;
		}
		if skipping || count == 0 {
			return Ok((None, count));
		}
		let block = Block::concatenate(collected)?;
		Ok((Some(block), count))
	}

	/// Drain the upstream stream, sort, and refill the buffer with the
	/// rearranged batches.
	async fn do_sort(&mut self, ctx: &Context) -> Result<(), Error> {
		self.sorted = true;
		// Any block probed into the buffer belongs to the input as well
		let mut blocks: Vec<Block> = self.base.buffer.drain(..).collect();
		loop {
			ctx.check()?;
			let Some(dep) = self.base.deps.first_mut() else {
				break;
			};
			match dep.get_some(ctx, *DEFAULT_BATCH_SIZE, *DEFAULT_BATCH_SIZE).await? {
				Some(block) => blocks.push(block),
				None => break,
			}
		}
		if blocks.is_empty() {
			return Ok(());
		}
		// Materialize the coordinate list
		let mut coords: Vec<(usize, usize)> = Vec::new();
		for (b, block) in blocks.iter().enumerate() {
			for row in 0..block.rows() {
				coords.push((b, row));
			}
		}
		// Chain the per-key comparisons
		let keys = &self.keys;
		let cmp = |a: &(usize, usize), b: &(usize, usize)| -> Ordering {
			for key in keys {
				let left = blocks[a.0].get(a.1, key.reg).unwrap_or(&NONE);
				let right = blocks[b.0].get(b.1, key.reg).unwrap_or(&NONE);
				let order = match key.ascending {
					true => compare(left, right),
					false => compare(right, left),
				};
				match order {
					Ordering::Equal => continue,
					order => return order,
				}
			}
			Ordering::Equal
		};
		if self.stable {
			coords.sort_by(cmp);
		} else {
			coords.sort_unstable_by(cmp);
		}
		// Re-materialize into fresh batches, stealing unique values and
		// cloning values shared inside their source block
		let width = self.base.width;
		for chunk in coords.chunks(*DEFAULT_BATCH_SIZE) {
			ctx.check()?;
			let mut out = Block::new(chunk.len(), width);
			for reg in 0..width {
				if let Some(col) = blocks.iter().find_map(|b| b.col(reg)) {
					out.set_col(reg, col.clone());
				}
			}
			let mut cache: AHashMap<(usize, ValueId), ValueId> = AHashMap::new();
			for (dst, &(b, row)) in chunk.iter().enumerate() {
				for reg in 0..width.min(blocks[b].regs()) {
					let Some(id) = blocks[b].id_at(row, reg) else {
						continue;
					};
					if let Some(&shared) = cache.get(&(b, id)) {
						out.share(dst, reg, shared);
						continue;
					}
					let new = if blocks[b].value_count(id) == 1 {
						match blocks[b].steal(row, reg) {
							Stolen::Owned(value) => out.set(dst, reg, value),
							_ => continue,
						}
					} else {
						let value = blocks[b].clone_value(row, reg).unwrap();
						out.set(dst, reg, value)
					};
					cache.insert((b, id), new);
				}
			}
			self.base.buffer.push_back(out);
		}
		Ok(())
	}
}
