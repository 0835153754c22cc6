use crate::cnf::DEFAULT_BATCH_SIZE;
use crate::ctx::Context;
use crate::dbs::operator::{InputRow, OperatorBase};
use crate::dbs::{Block, RegisterId};
use crate::err::Error;
use crate::val::Value;

/// Runs an inner plan once per outer row, materializing the drained
/// result blocks into the designated register as one docvec value.
///
/// The outer dependency is the first dependency; the inner plan's root is
/// the second. Cursor initialization only propagates to the outer side,
/// since the inner plan is re-initialized with every outer row.
pub(crate) struct SubqueryOperator {
	pub(crate) base: OperatorBase,
	out_reg: RegisterId,
	/// The inner plan is constant and deterministic, so its first result
	/// may be reused for every outer row
	constant: bool,
	cache: Option<Vec<Block>>,
}

impl SubqueryOperator {
	pub(crate) fn new(base: OperatorBase, out_reg: RegisterId, constant: bool) -> Self {
		Self {
			base,
			out_reg,
			constant,
			cache: None,
		}
	}

	pub(crate) async fn initialize_cursor(
		&mut self,
		ctx: &Context,
		input: InputRow<'_>,
	) -> Result<(), Error> {
		self.base.buffer.clear();
		self.base.pos = 0;
		self.base.done = false;
		self.cache = None;
		self.base.deps[0].initialize_cursor(ctx, input).await
	}

	/// Drop the cached constant result.
	pub(crate) fn release(&mut self) {
		self.cache = None;
	}

	pub(crate) async fn get_or_skip_some(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		skipping: bool,
	) -> Result<(Option<Block>, usize), Error> {
		let (block, count) = self.outer_produce(ctx, at_least, at_most, skipping).await?;
		let Some(mut block) = block else {
			return Ok((None, count));
		};
		for row in 0..block.rows() {
			ctx.check()?;
			let result = match self.cache.clone() {
				Some(cached) if self.constant => cached,
				_ => {
					let result = self.run_inner(ctx, &block, row).await?;
					if self.constant {
						self.cache = Some(result.clone());
					}
					result
				}
			};
			block.set(row, self.out_reg, Value::Docvec(result));
		}
		Ok((Some(block), count))
	}

	/// Pull outer rows through the generic implementation, which reads
	/// from the first dependency.
	async fn outer_produce(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		skipping: bool,
	) -> Result<(Option<Block>, usize), Error> {
		self.base.produce(ctx, at_least, at_most, skipping).await
	}

	/// Re-initialize the inner plan with one outer row and drain it.
	async fn run_inner(
		&mut self,
		ctx: &Context,
		outer: &Block,
		row: usize,
	) -> Result<Vec<Block>, Error> {
		let inner = &mut self.base.deps[1];
		inner.initialize_cursor(ctx, Some((outer, row))).await?;
		let mut blocks = Vec::new();
		while let Some(block) =
			inner.get_some(ctx, *DEFAULT_BATCH_SIZE, *DEFAULT_BATCH_SIZE).await?
		{
			blocks.push(block);
		}
		Ok(blocks)
	}
}
