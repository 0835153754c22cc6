use crate::ctx::Context;
use crate::dbs::operator::{InputRow, OperatorBase};
use crate::dbs::Block;
use crate::err::Error;

/// The root source of every pipeline: yields exactly one row carrying the
/// registers inherited from the query's input binding.
pub(crate) struct SingletonOperator {
	pub(crate) base: OperatorBase,
	/// A one-row copy of the input binding, stashed at cursor
	/// initialization
	input: Option<Block>,
}

impl SingletonOperator {
	pub(crate) fn new(base: OperatorBase) -> Self {
		Self {
			base,
			input: None,
		}
	}

	pub(crate) async fn initialize_cursor(
		&mut self,
		ctx: &Context,
		input: InputRow<'_>,
	) -> Result<(), Error> {
		self.base.initialize_cursor(ctx, input).await?;
		self.input = input.map(|(block, pos)| block.slice(pos, pos + 1));
		Ok(())
	}

	pub(crate) async fn get_or_skip_some(
		&mut self,
		_ctx: &Context,
		_at_least: usize,
		_at_most: usize,
		skipping: bool,
	) -> Result<(Option<Block>, usize), Error> {
		if self.base.done {
			return Ok((None, 0));
		}
		self.base.done = true;
		if skipping {
			return Ok((None, 1));
		}
		let mut out = Block::new(1, self.base.width);
		if let Some(src) = &self.input {
			out.inherit(0, src, 0);
		}
		Ok((Some(out), 1))
	}
}
