use crate::cnf::DEFAULT_BATCH_SIZE;
use crate::ctx::Context;
use crate::dbs::operator::{InputRow, OperatorBase};
use crate::dbs::Block;
use crate::err::Error;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum LimitState {
	/// The offset has not been skipped yet
	Initial,
	/// Rows are being handed through
	Yielding,
	/// The limit was reached or the upstream ran dry
	Done,
}

/// Skips `offset` upstream rows, then yields up to `limit` rows through
/// the generic implementation with clamped windows. With `full_count`
/// enabled, the upstream is drained after the limit is reached and the
/// total upstream row count is accumulated into the statistics.
pub(crate) struct LimitOperator {
	pub(crate) base: OperatorBase,
	offset: usize,
	limit: usize,
	full_count: bool,
	state: LimitState,
	/// Rows yielded so far
	count: usize,
}

impl LimitOperator {
	pub(crate) fn new(base: OperatorBase, offset: usize, limit: usize, full_count: bool) -> Self {
		Self {
			base,
			offset,
			limit,
			full_count,
			state: LimitState::Initial,
			count: 0,
		}
	}

	pub(crate) async fn initialize_cursor(
		&mut self,
		ctx: &Context,
		input: InputRow<'_>,
	) -> Result<(), Error> {
		self.base.initialize_cursor(ctx, input).await?;
		self.state = LimitState::Initial;
		self.count = 0;
		Ok(())
	}

	/// Skip the offset rows, accounting them towards the full count.
	async fn skip_offset(&mut self, ctx: &Context) -> Result<(), Error> {
		if self.full_count {
			// Initializes the statistic from its sentinel on first use
			self.base.stats.add_full_count(0);
		}
		let mut remaining = self.offset;
		while remaining > 0 {
			let (_, skipped) = self.base.produce(ctx, remaining, remaining, true).await?;
			if self.full_count {
				self.base.stats.add_full_count(skipped as u64);
			}
			if skipped == 0 {
				break;
			}
			remaining -= skipped;
		}
		self.state = LimitState::Yielding;
		self.count = 0;
		Ok(())
	}

	/// Keep pulling and discarding upstream rows after the limit, so the
	/// full count reflects the entire upstream row count.
	async fn drain(&mut self, ctx: &Context) -> Result<(), Error> {
		loop {
			ctx.check()?;
			let (_, skipped) =
				self.base.produce(ctx, *DEFAULT_BATCH_SIZE, *DEFAULT_BATCH_SIZE, true).await?;
			if skipped == 0 {
				return Ok(());
			}
			self.base.stats.add_full_count(skipped as u64);
		}
	}

	pub(crate) async fn get_or_skip_some(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		skipping: bool,
	) -> Result<(Option<Block>, usize), Error> {
		if self.state == LimitState::Done {
			return Ok((None, 0));
		}
		if self.state == LimitState::Initial {
			self.skip_offset(ctx).await?;
		}
		let window = at_most.min(self.limit - self.count);
		if window == 0 {
			return self.finish(ctx, (None, 0)).await;
		}
		let (block, count) =
			self.base.produce(ctx, at_least.min(window), window, skipping).await?;
		self.count += count;
		if self.full_count {
			self.base.stats.add_full_count(count as u64);
		}
		if count == 0 || self.count >= self.limit {
			return self.finish(ctx, (block, count)).await;
		}
		Ok((block, count))
	}

	async fn finish(
		&mut self,
		ctx: &Context,
		result: (Option<Block>, usize),
	) -> Result<(Option<Block>, usize), Error> {
		if self.full_count && self.count >= self.limit {
			self.drain(ctx).await?;
		}
		self.state = LimitState::Done;
		Ok(result)
	}

	/// The state machine decides liveness, not the dependency.
	pub(crate) async fn has_more(&mut self, ctx: &Context) -> Result<bool, Error> {
		match self.state {
			LimitState::Done => Ok(false),
			LimitState::Initial => {
				if self.limit == 0 {
					return Ok(false);
				}
				self.skip_offset(ctx).await?;
				self.base.has_more(ctx).await
			}
			LimitState::Yielding => {
				if self.count >= self.limit {
					return Ok(false);
				}
				self.base.has_more(ctx).await
			}
		}
	}
}
