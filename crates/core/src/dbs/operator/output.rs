use crate::ctx::Context;
use crate::dbs::operator::OperatorBase;
use crate::dbs::{Block, RegisterId, Stolen};
use crate::err::Error;

/// The tree root on the result path: strips each row down to the single
/// designated register, stealing its value into a fresh single-column
/// block and nulling the source cell.
pub(crate) struct ReturnOperator {
	pub(crate) base: OperatorBase,
	in_reg: RegisterId,
}

impl ReturnOperator {
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
		let (block, count) = self.base.produce(ctx, at_least, at_most, skipping).await?;
		let Some(mut block) = block else {
			return Ok((None, count));
		};
		let mut out = Block::new(block.rows(), 1);
		if let Some(col) = block.col(self.in_reg).cloned() {
			out.set_col(0, col);
		}
		for row in 0..block.rows() {
			let Some(id) = block.id_at(row, self.in_reg) else {
				continue;
			};
			if block.value_count(id) == 1 {
				if let Stolen::Owned(value) = block.steal(row, self.in_reg) {
					out.set(row, 0, value);
				}
			} else {
				// Other cells still reference the value, so it must be
				// cloned before the source cell is nulled out
				let value = block.clone_value(row, self.in_reg).unwrap();
				block.erase(row, self.in_reg);
				out.set(row, 0, value);
			}
		}
		Ok((Some(out), count))
	}
}
