pub(crate) use self::aggregate::AggregateOperator;
pub(crate) use self::calculation::CalculationOperator;
pub(crate) use self::collection::CollectionOperator;
pub(crate) use self::distribute::DistributeOperator;
pub(crate) use self::filter::FilterOperator;
pub(crate) use self::gather::GatherOperator;
pub(crate) use self::index::IndexOperator;
pub(crate) use self::limit::LimitOperator;
pub(crate) use self::list::ListOperator;
pub(crate) use self::modify::{ModifyOperator, ModifyVerb};
pub(crate) use self::output::ReturnOperator;
pub(crate) use self::remote::RemoteOperator;
pub(crate) use self::scatter::ScatterOperator;
pub(crate) use self::singleton::SingletonOperator;
pub(crate) use self::sort::SortOperator;
pub(crate) use self::subquery::SubqueryOperator;

mod aggregate;
mod calculation;
mod collection;
mod distribute;
mod filter;
mod gather;
mod index;
mod limit;
mod list;
mod modify;
mod output;
mod remote;
mod scatter;
mod singleton;
mod sort;
mod subquery;

use crate::cluster::ShardId;
use crate::cnf::DEFAULT_BATCH_SIZE;
use crate::ctx::Context;
use crate::dbs::{Block, RegisterId, Row, Stats};
use crate::err::Error;
use crate::plan::Expression;
use crate::val::Value;
use async_recursion::async_recursion;
use std::collections::VecDeque;

/// Evaluate a planned expression against one input row. The two simple
/// shapes are answered locally; compiled expressions go through the
/// evaluator collaborator.
pub(crate) fn evaluate(ctx: &Context, expr: &Expression, row: Row<'_>) -> Result<Value, Error> {
	match expr {
		Expression::Constant {
			value,
		} => Ok(Value::Json(value.clone())),
		Expression::Reference {
			reg,
		} => Ok(row.get(*reg).cloned().unwrap_or_default()),
		Expression::Compiled {
			id,
			..
		} => ctx.evaluator()?.evaluate(*id, row),
	}
}

/// The sentinel for an unknown row count.
pub(crate) const UNKNOWN_COUNT: i64 = -1;

/// The input binding an operator is (re-)initialized with: a block and a
/// row position inside it.
pub(crate) type InputRow<'a> = Option<(&'a Block, usize)>;

/// A pipeline operator, realized as a tagged variant over the operator
/// family, with the shared pull-protocol defaults on [`OperatorBase`].
pub(crate) enum Operator {
	Singleton(SingletonOperator),
	Collection(CollectionOperator),
	List(ListOperator),
	Index(IndexOperator),
	Calculation(CalculationOperator),
	Filter(FilterOperator),
	Subquery(SubqueryOperator),
	Aggregate(AggregateOperator),
	Sort(SortOperator),
	Limit(LimitOperator),
	Return(ReturnOperator),
	Modify(ModifyOperator),
	Gather(GatherOperator),
	Scatter(ScatterOperator),
	Distribute(DistributeOperator),
	Remote(RemoteOperator),
}

impl Operator {
	pub(crate) fn base(&self) -> &OperatorBase {
		match self {
			Operator::Singleton(o) => &o.base,
			Operator::Collection(o) => &o.base,
			Operator::List(o) => &o.base,
			Operator::Index(o) => &o.base,
			Operator::Calculation(o) => &o.base,
			Operator::Filter(o) => &o.base,
			Operator::Subquery(o) => &o.base,
			Operator::Aggregate(o) => &o.base,
			Operator::Sort(o) => &o.base,
			Operator::Limit(o) => &o.base,
			Operator::Return(o) => &o.base,
			Operator::Modify(o) => &o.base,
			Operator::Gather(o) => &o.base,
			Operator::Scatter(o) => &o.base,
			Operator::Distribute(o) => &o.base,
			Operator::Remote(o) => &o.base,
		}
	}

	pub(crate) fn base_mut(&mut self) -> &mut OperatorBase {
		match self {
			Operator::Singleton(o) => &mut o.base,
			Operator::Collection(o) => &mut o.base,
			Operator::List(o) => &mut o.base,
			Operator::Index(o) => &mut o.base,
			Operator::Calculation(o) => &mut o.base,
			Operator::Filter(o) => &mut o.base,
			Operator::Subquery(o) => &mut o.base,
			Operator::Aggregate(o) => &mut o.base,
			Operator::Sort(o) => &mut o.base,
			Operator::Limit(o) => &mut o.base,
			Operator::Return(o) => &mut o.base,
			Operator::Modify(o) => &mut o.base,
			Operator::Gather(o) => &mut o.base,
			Operator::Scatter(o) => &mut o.base,
			Operator::Distribute(o) => &mut o.base,
			Operator::Remote(o) => &mut o.base,
		}
	}

	/// One-shot initialization before any work, propagated leaves-first.
	#[async_recursion]
	pub(crate) async fn initialize(&mut self, ctx: &Context) -> Result<(), Error> {
		for dep in &mut self.base_mut().deps {
			dep.initialize(ctx).await?;
		}
		Ok(())
	}

	/// Re-entrant reset to a new input binding, propagated with the same
	/// arguments.
	#[async_recursion]
	pub(crate) async fn initialize_cursor<'ic>(
		&'ic mut self,
		ctx: &'ic Context,
		input: InputRow<'ic>,
	) -> Result<(), Error> {
		match self {
			Operator::Singleton(o) => o.initialize_cursor(ctx, input).await,
			Operator::Collection(o) => o.initialize_cursor(ctx, input).await,
			Operator::List(o) => o.initialize_cursor(ctx, input).await,
			Operator::Index(o) => o.initialize_cursor(ctx, input).await,
			Operator::Calculation(o) => o.base.initialize_cursor(ctx, input).await,
			Operator::Filter(o) => o.base.initialize_cursor(ctx, input).await,
			Operator::Subquery(o) => o.initialize_cursor(ctx, input).await,
			Operator::Aggregate(o) => o.initialize_cursor(ctx, input).await,
			Operator::Sort(o) => o.initialize_cursor(ctx, input).await,
			Operator::Limit(o) => o.initialize_cursor(ctx, input).await,
			Operator::Return(o) => o.base.initialize_cursor(ctx, input).await,
			Operator::Modify(o) => o.initialize_cursor(ctx, input).await,
			Operator::Gather(o) => o.initialize_cursor(ctx, input).await,
			Operator::Scatter(o) => o.initialize_cursor(ctx, input).await,
			Operator::Distribute(o) => o.initialize_cursor(ctx, input).await,
			Operator::Remote(o) => o.initialize_cursor(ctx, input).await,
		}
	}

	/// Release buffers and propagate shutdown to every dependency,
	/// collecting errors without throwing past any of them.
	#[async_recursion]
	pub(crate) async fn shutdown(&mut self, ctx: &Context, code: i64) -> Result<(), Error> {
		match self {
			Operator::Index(o) => o.release(),
			Operator::Collection(o) => o.release(),
			Operator::Subquery(o) => o.release(),
			Operator::Aggregate(o) => o.release(),
			Operator::Gather(o) => o.release(),
			Operator::Scatter(o) => return o.shutdown(ctx, code).await,
			Operator::Distribute(o) => return o.shutdown(ctx, code).await,
			Operator::Remote(o) => return o.shutdown(ctx, code).await,
			_ => (),
		}
		self.base_mut().shutdown_deps(ctx, code).await
	}

	/// Pull the next batch of rows, aiming for `[at_least, at_most]` rows
	/// and never returning an empty block.
	pub(crate) async fn get_some(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
	) -> Result<Option<Block>, Error> {
		ctx.check()?;
		let at_least = at_least.clamp(1, at_most.max(1));
		let (block, _) = self.get_or_skip_some(ctx, at_least, at_most, false).await?;
		match block {
			Some(mut block) => {
				debug_assert!(block.rows() >= 1 && block.rows() <= at_most);
				let regs = self.base().regs_to_clear.clone();
				block.clear_registers(&regs);
				Ok(Some(block))
			}
			None => Ok(None),
		}
	}

	/// Pull and discard the next batch of rows, with the same framing
	/// guarantees as [`Operator::get_some`].
	pub(crate) async fn skip_some(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
	) -> Result<usize, Error> {
		ctx.check()?;
		let at_least = at_least.clamp(1, at_most.max(1));
		let (_, skipped) = self.get_or_skip_some(ctx, at_least, at_most, true).await?;
		Ok(skipped)
	}

	/// Skip exactly `n` rows, reporting whether the end of the stream was
	/// reached.
	pub(crate) async fn skip(&mut self, ctx: &Context, n: usize) -> Result<bool, Error> {
		let mut remaining = n;
		while remaining > 0 {
			let skipped = self.skip_some(ctx, remaining, remaining).await?;
			if skipped == 0 {
				break;
			}
			remaining -= skipped;
		}
		Ok(!self.has_more(ctx).await?)
	}

	#[async_recursion]
	async fn get_or_skip_some(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		skipping: bool,
	) -> Result<(Option<Block>, usize), Error> {
		match self {
			Operator::Singleton(o) => o.get_or_skip_some(ctx, at_least, at_most, skipping).await,
			Operator::Collection(o) => o.get_or_skip_some(ctx, at_least, at_most, skipping).await,
			Operator::List(o) => o.get_or_skip_some(ctx, at_least, at_most, skipping).await,
			Operator::Index(o) => o.get_or_skip_some(ctx, at_least, at_most, skipping).await,
			Operator::Calculation(o) => o.get_or_skip_some(ctx, at_least, at_most, skipping).await,
			Operator::Filter(o) => o.get_or_skip_some(ctx, at_least, at_most, skipping).await,
			Operator::Subquery(o) => o.get_or_skip_some(ctx, at_least, at_most, skipping).await,
			Operator::Aggregate(o) => o.get_or_skip_some(ctx, at_least, at_most, skipping).await,
			Operator::Sort(o) => o.get_or_skip_some(ctx, at_least, at_most, skipping).await,
			Operator::Limit(o) => o.get_or_skip_some(ctx, at_least, at_most, skipping).await,
			Operator::Return(o) => o.get_or_skip_some(ctx, at_least, at_most, skipping).await,
			Operator::Modify(o) => o.get_or_skip_some(ctx, at_least, at_most, skipping).await,
			Operator::Gather(o) => o.get_or_skip_some(ctx, at_least, at_most, skipping).await,
			Operator::Remote(o) => o.get_or_skip_some(ctx, at_least, at_most, skipping).await,
			Operator::Scatter(_) | Operator::Distribute(_) => Err(Error::Internal {
				message: String::from("Operator requires a shard-aware call"),
			}),
		}
	}

	/// Whether another `get_some` call can yield rows.
	#[async_recursion]
	pub(crate) async fn has_more(&mut self, ctx: &Context) -> Result<bool, Error> {
		match self {
			Operator::Singleton(o) => Ok(!o.base.done),
			// A finished group may still be pending emission after the
			// input ran dry
			Operator::Aggregate(o) => Ok(!o.base.done),
			Operator::Limit(o) => o.has_more(ctx).await,
			Operator::Gather(o) => o.has_more(ctx).await,
			Operator::Remote(o) => o.has_more(ctx).await,
			Operator::Scatter(_) | Operator::Distribute(_) => Err(Error::Internal {
				message: String::from("Operator requires a shard-aware call"),
			}),
			_ => self.base_mut().has_more(ctx).await,
		}
	}

	/// The total number of rows this operator will produce, `-1` when
	/// unknown.
	pub(crate) async fn count(&mut self, ctx: &Context) -> Result<i64, Error> {
		match self {
			Operator::Singleton(_) => Ok(1),
			Operator::Remote(o) => o.count(ctx).await,
			_ => Ok(UNKNOWN_COUNT),
		}
	}

	/// The number of rows still to come, `-1` when unknown.
	pub(crate) async fn remaining(&mut self, ctx: &Context) -> Result<i64, Error> {
		match self {
			Operator::Singleton(o) => Ok(if o.base.done {
				0
			} else {
				1
			}),
			Operator::Remote(o) => o.remaining(ctx).await,
			_ => Ok(UNKNOWN_COUNT),
		}
	}

	/// Pull the next batch on behalf of one shard, valid on the operators
	/// which track per-client state.
	pub(crate) async fn get_some_for_shard(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		shard: &ShardId,
	) -> Result<Option<Block>, Error> {
		ctx.check()?;
		let at_least = at_least.clamp(1, at_most.max(1));
		match self {
			Operator::Scatter(o) => o.get_some_for_shard(ctx, at_least, at_most, shard).await,
			Operator::Distribute(o) => o.get_some_for_shard(ctx, at_least, at_most, shard).await,
			_ => Err(Error::Internal {
				message: String::from("Operator does not track per-shard state"),
			}),
		}
	}

	/// Skip the next batch on behalf of one shard.
	pub(crate) async fn skip_some_for_shard(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		shard: &ShardId,
	) -> Result<usize, Error> {
		ctx.check()?;
		let at_least = at_least.clamp(1, at_most.max(1));
		match self {
			Operator::Scatter(o) => o.skip_some_for_shard(ctx, at_least, at_most, shard).await,
			Operator::Distribute(o) => o.skip_some_for_shard(ctx, at_least, at_most, shard).await,
			_ => Err(Error::Internal {
				message: String::from("Operator does not track per-shard state"),
			}),
		}
	}

	/// Whether one shard can still be served rows.
	pub(crate) async fn has_more_for_shard(
		&mut self,
		ctx: &Context,
		shard: &ShardId,
	) -> Result<bool, Error> {
		match self {
			Operator::Scatter(o) => o.has_more_for_shard(ctx, shard).await,
			Operator::Distribute(o) => o.has_more_for_shard(ctx, shard).await,
			_ => Err(Error::Internal {
				message: String::from("Operator does not track per-shard state"),
			}),
		}
	}
}

/// The state every operator shares: the link to the query's statistics,
/// the upstream dependencies, and the partially consumed buffer of
/// upstream blocks with the position into its front block.
pub(crate) struct OperatorBase {
	pub(crate) deps: Vec<Operator>,
	pub(crate) buffer: VecDeque<Block>,
	pub(crate) pos: usize,
	pub(crate) done: bool,
	/// The width of the blocks this operator produces
	pub(crate) width: usize,
	pub(crate) regs_to_clear: Vec<RegisterId>,
	pub(crate) stats: Stats,
}

impl OperatorBase {
	pub(crate) fn new(
		width: usize,
		regs_to_clear: Vec<RegisterId>,
		deps: Vec<Operator>,
		stats: Stats,
	) -> Self {
		Self {
			deps,
			buffer: VecDeque::new(),
			pos: 0,
			done: false,
			width,
			regs_to_clear,
			stats,
		}
	}

	/// Reset the buffer state and propagate the new input binding to every
	/// dependency.
	pub(crate) async fn initialize_cursor(
		&mut self,
		ctx: &Context,
		input: InputRow<'_>,
	) -> Result<(), Error> {
		self.buffer.clear();
		self.pos = 0;
		self.done = false;
		for dep in &mut self.deps {
			dep.initialize_cursor(ctx, input).await?;
		}
		Ok(())
	}

	/// Release the buffer and shut down every dependency, keeping the
	/// first error without letting any dependency be skipped.
	pub(crate) async fn shutdown_deps(&mut self, ctx: &Context, code: i64) -> Result<(), Error> {
		self.buffer.clear();
		self.pos = 0;
		let mut result = Ok(());
		for dep in &mut self.deps {
			if let Err(e) = dep.shutdown(ctx, code).await {
				if result.is_ok() {
					result = Err(e);
				}
			}
		}
		result
	}

	/// Pull one block from the first dependency into the buffer. Returns
	/// false when the dependency is exhausted.
	pub(crate) async fn get_block(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
	) -> Result<bool, Error> {
		let Some(dep) = self.deps.first_mut() else {
			return Ok(false);
		};
		match dep.get_some(ctx, at_least, at_most).await? {
			Some(block) => {
				self.buffer.push_back(block);
				Ok(true)
			}
			None => Ok(false),
		}
	}

	/// Consume up to `at_most` rows from the buffer, appending slices to
	/// the collector (or just counting when skipping). Whole blocks are
	/// forwarded without copying.
	pub(crate) fn take_from_buffer(
		&mut self,
		at_most: usize,
		skipping: bool,
		collected: &mut Vec<Block>,
	) -> usize {
		let mut taken = 0;
		while taken < at_most {
			let Some(front) = self.buffer.front() else {
				break;
			};
			let available = front.rows() - self.pos;
			let take = available.min(at_most - taken);
			if !skipping {
				if self.pos == 0 && take == front.rows() {
					collected.push(self.buffer.pop_front().unwrap());
					taken += take;
					continue;
				}
				collected.push(front.slice(self.pos, self.pos + take));
			}
			self.pos += take;
			taken += take;
			if self.pos >= self.buffer.front().unwrap().rows() {
				self.buffer.pop_front();
				self.pos = 0;
			}
		}
		taken
	}

	/// The generic implementation shared by `get_some` and `skip_some`:
	/// pull blocks from the dependency into the buffer, slice according to
	/// the position and the window, and either collect the slices for
	/// concatenation or just count.
	pub(crate) async fn produce(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		skipping: bool,
	) -> Result<(Option<Block>, usize), Error> {
		if self.done && self.buffer.is_empty() {
			return Ok((None, 0));
		}
		let mut collected = Vec::new();
		let mut count = 0;
		loop {
			count += self.take_from_buffer(at_most - count, skipping, &mut collected);
			if count >= at_least {
				break;
			}
			if self.done || !self.get_block(ctx, at_least - count, at_most - count).await? {
				self.done = true;
				break;
			}
		}
		if skipping || count == 0 {
			return Ok((None, count));
		}
		let block = Block::concatenate(collected)?;
		let rows = block.rows();
		Ok((Some(block), rows))
	}

	/// The default liveness probe: rows are available in the buffer, or
	/// the dependency can still produce some.
	pub(crate) async fn has_more(&mut self, ctx: &Context) -> Result<bool, Error> {
		if self.done && self.buffer.is_empty() {
			return Ok(false);
		}
		if !self.buffer.is_empty() {
			return Ok(true);
		}
		if self.get_block(ctx, 1, *DEFAULT_BATCH_SIZE).await? {
			Ok(true)
		} else {
			self.done = true;
			Ok(false)
		}
	}
}
