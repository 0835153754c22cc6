use crate::ctx::Context;
use crate::dbs::operator::{InputRow, OperatorBase};
use crate::dbs::{Block, RegisterId};
use crate::err::Error;

/// Expands one input-row register holding an array, range or subquery
/// result into one output row per element, re-copying the input row's
/// inherited registers.
pub(crate) struct ListOperator {
	pub(crate) base: OperatorBase,
	in_reg: RegisterId,
	out_reg: RegisterId,
	/// The position inside the current row's list
	index: usize,
}

impl ListOperator {
	pub(crate) fn new(base: OperatorBase, in_reg: RegisterId, out_reg: RegisterId) -> Self {
		Self {
			base,
			in_reg,
			out_reg,
			index: 0,
		}
	}

	pub(crate) async fn initialize_cursor(
		&mut self,
		ctx: &Context,
		input: InputRow<'_>,
	) -> Result<(), Error> {
		self.base.initialize_cursor(ctx, input).await?;
		self.index = 0;
		Ok(())
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
		let mut out = (!skipping).then(|| Block::new(at_most, self.base.width));
		let mut count = 0;
		let mut anchor: Option<usize> = None;
		while count < at_least {
			ctx.check()?;
			if self.base.buffer.is_empty() {
				if self.base.done || !self.base.get_block(ctx, at_least, at_most).await? {
					self.base.done = true;
					break;
				}
			}
			let front = self.base.buffer.front().unwrap();
			let value = front.get(self.base.pos, self.in_reg).ok_or(Error::ArrayExpected {
				value: String::from("none"),
			})?;
			let len = value.list_len().ok_or_else(|| Error::ArrayExpected {
				value: value.to_string(),
			})?;
			if self.index >= len {
				// This upstream row is fully expanded
				self.index = 0;
				self.base.pos += 1;
				anchor = None;
				if self.base.pos >= front.rows() {
					self.base.buffer.pop_front();
					self.base.pos = 0;
				}
				continue;
			}
			let take = (len - self.index).min(at_most - count);
			for i in self.index..self.index + take {
				if let Some(out) = out.as_mut() {
					let front = self.base.buffer.front().unwrap();
					let element = front.get(self.base.pos, self.in_reg).unwrap().list_at(i);
					match anchor {
						Some(row) => out.repeat(row, count, front.regs()),
						None => out.inherit(count, front, self.base.pos),
					}
					anchor = Some(count);
					out.set(count, self.out_reg, element);
				}
				count += 1;
			}
			self.index += take;
		}
		match out {
			Some(mut out) if count > 0 => {
				out.shrink(count);
				Ok((Some(out), count))
			}
			_ => Ok((None, count)),
		}
	}
}
