use crate::ctx::Context;
use crate::dbs::operator::OperatorBase;
use crate::dbs::{Block, RegisterId};
use crate::err::Error;
use crate::val::Value;

/// Drops the rows whose boolean register does not hold. Implements its
/// own pull because the row count shrinks: surviving rows are sliced out
/// by index list, or the whole block is forwarded when every row passes.
pub(crate) struct FilterOperator {
	pub(crate) base: OperatorBase,
	in_reg: RegisterId,
}

impl FilterOperator {
	pub(crate) fn new(base: OperatorBase, in_reg: RegisterId) -> Self {
		Self {
			base,
			in_reg,
		}
	}

	pub(crate) async fn get_or_skip_some(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		skipping: bool,
	) -> Result<(Option<Block>, usize), Error> {
		if self.base.done && self.base.buffer.is_empty() {
			return Ok((None, 0));
		}
		let mut collected = Vec::new();
		let mut count = 0;
		while count < at_least {
			if self.base.buffer.is_empty() {
				if self.base.done || !self.base.get_block(ctx, at_least, at_most).await? {
					self.base.done = true;
					break;
				}
			}
			let front = self.base.buffer.front().unwrap();
			let rows = front.rows();
			let started_at = self.base.pos;
			let mut chosen = Vec::new();
			let mut suppressed = 0u64;
			while self.base.pos < rows && count + chosen.len() < at_most {
				ctx.check()?;
				let passes = front
					.get(self.base.pos, self.in_reg)
					.map(Value::is_truthy)
					.unwrap_or(false);
				if passes {
					chosen.push(self.base.pos);
				} else {
					suppressed += 1;
				}
				self.base.pos += 1;
			}
			self.base.stats.incr_filtered(suppressed);
			if skipping {
				count += chosen.len();
			} else if !chosen.is_empty() {
				count += chosen.len();
				if started_at == 0 && self.base.pos == rows && chosen.len() == rows {
					// Every row passed, forward the block as-is
					collected.push(self.base.buffer.pop_front().unwrap());
					self.base.pos = 0;
					continue;
				}
				collected.push(front.slice_rows(&chosen));
			}
			if self.base.pos >= rows {
				self.base.buffer.pop_front();
				self.base.pos = 0;
			}
		}
		if skipping || count == 0 {
			return Ok((None, count));
		}
		let block = Block::concatenate(collected)?;
		Ok((Some(block), count))
	}
}
