use crate::cluster::ShardId;
use crate::ctx::{Canceller, Context};
use crate::dbs::operator::{
	AggregateOperator, CalculationOperator, CollectionOperator, DistributeOperator,
	FilterOperator, GatherOperator, IndexOperator, LimitOperator, ListOperator, ModifyOperator,
	ModifyVerb, Operator, OperatorBase, RemoteOperator, ReturnOperator, ScatterOperator,
	SingletonOperator, SortOperator, SubqueryOperator,
};
use crate::dbs::{Block, Statistics, Stats, Warnings};
use crate::err::Error;
use crate::plan::{ModifyOptions, Node, NodeKind};

/// The execution engine of one query on one host: the instantiated
/// operator tree plus the query-wide statistics and warnings.
///
/// The engine walks the plan leaves-first, instantiates the matching
/// operator for every node, and afterwards answers the pull protocol on
/// the root operator. Structural plan violations surface here, before any
/// row moves.
pub struct Engine {
	root: Operator,
	ctx: Context,
	stats: Stats,
	warnings: Warnings,
	/// The statistics snapshot last reported to a coordinator
	reported: Statistics,
	initialized: bool,
	cursor_ready: bool,
	was_shutdown: bool,
}

impl Engine {
	/// Instantiate the operator tree for a compiled plan.
	pub fn new(plan: &Node, ctx: Context) -> Result<Engine, Error> {
		validate(plan)?;
		let stats = Stats::default();
		let warnings = Warnings::default();
		let root = build(plan, &ctx, &stats, &warnings)?;
		trace!(root = plan.id, "Instantiated execution engine");
		Ok(Engine {
			root,
			ctx,
			stats,
			warnings,
			reported: Statistics::default(),
			initialized: false,
			cursor_ready: false,
			was_shutdown: false,
		})
	}

	/// A handle which can kill this query from another thread.
	pub fn canceller(&self) -> Canceller {
		self.ctx.add_cancel()
	}

	pub fn stats(&self) -> &Stats {
		&self.stats
	}

	pub fn warnings(&self) -> &Warnings {
		&self.warnings
	}

	/// The statistics change since the last report, for the delta
	/// accounting of the peer protocol.
	pub fn take_stats_delta(&mut self) -> Statistics {
		let snapshot = self.stats.snapshot();
		let delta = snapshot.delta_since(&self.reported);
		self.reported = snapshot;
		delta
	}

	async fn ensure_ready(&mut self) -> Result<(), Error> {
		if !self.initialized {
			self.root.initialize(&self.ctx).await?;
			self.initialized = true;
		}
		if !self.cursor_ready {
			self.root.initialize_cursor(&self.ctx, None).await?;
			self.cursor_ready = true;
		}
		Ok(())
	}

	/// Reset the operator tree onto a new input binding.
	pub async fn initialize_cursor(
		&mut self,
		input: Option<(Block, usize)>,
	) -> Result<(), Error> {
		if !self.initialized {
			self.root.initialize(&self.ctx).await?;
			self.initialized = true;
		}
		let input = input.as_ref().map(|(block, pos)| (block, *pos));
		self.root.initialize_cursor(&self.ctx, input).await?;
		self.cursor_ready = true;
		Ok(())
	}

	/// Pull the next batch of result rows from the root operator. Cluster
	/// operators tracking per-client state are addressed with the calling
	/// shard.
	pub async fn get_some(
		&mut self,
		at_least: usize,
		at_most: usize,
		shard: Option<&ShardId>,
	) -> Result<Option<Block>, Error> {
		self.ensure_ready().await?;
		match shard {
			None => self.root.get_some(&self.ctx, at_least, at_most).await,
			Some(shard) => {
				self.root.get_some_for_shard(&self.ctx, at_least, at_most, shard).await
			}
		}
	}

	/// Pull and discard the next batch of result rows.
	pub async fn skip_some(
		&mut self,
		at_least: usize,
		at_most: usize,
		shard: Option<&ShardId>,
	) -> Result<usize, Error> {
		self.ensure_ready().await?;
		match shard {
			None => self.root.skip_some(&self.ctx, at_least, at_most).await,
			Some(shard) => {
				self.root.skip_some_for_shard(&self.ctx, at_least, at_most, shard).await
			}
		}
	}

	/// Skip exactly `n` result rows, reporting whether the end of the
	/// stream was reached.
	pub async fn skip(&mut self, n: usize) -> Result<bool, Error> {
		self.ensure_ready().await?;
		self.root.skip(&self.ctx, n).await
	}

	pub async fn has_more(&mut self, shard: Option<&ShardId>) -> Result<bool, Error> {
		self.ensure_ready().await?;
		match shard {
			None => self.root.has_more(&self.ctx).await,
			Some(shard) => self.root.has_more_for_shard(&self.ctx, shard).await,
		}
	}

	pub async fn count(&mut self) -> Result<i64, Error> {
		self.root.count(&self.ctx).await
	}

	pub async fn remaining(&mut self) -> Result<i64, Error> {
		self.root.remaining(&self.ctx).await
	}

	/// Release the query, exactly once; later calls are no-ops.
	pub async fn shutdown(&mut self, code: i64) -> Result<(), Error> {
		if self.was_shutdown {
			return Ok(());
		}
		self.was_shutdown = true;
		self.root.shutdown(&self.ctx, code).await
	}
}

/// Check the structural rules a plan must satisfy before execution: at
/// most one data-modification node, and none inside a subquery.
fn validate(plan: &Node) -> Result<(), Error> {
	let mut modifications = 0;
	count_modifications(plan, false, &mut modifications)?;
	if modifications > 1 {
		return Err(Error::Parse {
			message: String::from("Only one data-modification operation is allowed per query"),
		});
	}
	Ok(())
}

fn count_modifications(node: &Node, in_subquery: bool, count: &mut usize) -> Result<(), Error> {
	if node.kind.is_modification() {
		if in_subquery {
			return Err(Error::ModifyInSubquery);
		}
		*count += 1;
	}
	if let NodeKind::Subquery {
		subquery,
		..
	} = &node.kind
	{
		count_modifications(subquery, true, count)?;
	}
	for dep in &node.dependencies {
		count_modifications(dep, in_subquery, count)?;
	}
	Ok(())
}

/// Whether an inner plan touches no state outside its registers, the
/// requirement for reusing a constant subquery's first result.
fn is_pure(node: &Node) -> bool {
	let pure = match &node.kind {
		NodeKind::EnumerateCollection {
			..
		}
		| NodeKind::IndexRange {
			..
		}
		| NodeKind::Remove {
			..
		}
		| NodeKind::Insert {
			..
		}
		| NodeKind::Update {
			..
		}
		| NodeKind::Replace {
			..
		}
		| NodeKind::Gather {
			..
		}
		| NodeKind::Scatter {
			..
		}
		| NodeKind::Distribute {
			..
		}
		| NodeKind::Remote {
			..
		} => false,
		NodeKind::Subquery {
			subquery,
			..
		} => is_pure(subquery),
		_ => true,
	};
	pure && node.dependencies.iter().all(is_pure)
}

/// Instantiate the operator for one plan node, leaves-first.
fn build(node: &Node, ctx: &Context, stats: &Stats, warnings: &Warnings) -> Result<Operator, Error> {
	let mut deps = Vec::with_capacity(node.dependencies.len());
	for dep in &node.dependencies {
		deps.push(build(dep, ctx, stats, warnings)?);
	}
	let base = OperatorBase::new(node.width(), node.regs_to_clear.clone(), deps, stats.clone());
	let operator = match &node.kind {
		NodeKind::Singleton => Operator::Singleton(SingletonOperator::new(base)),
		NodeKind::EnumerateCollection {
			collection,
			out_reg,
			random,
		} => {
			let collection = ctx.store().collection(collection)?;
			Operator::Collection(CollectionOperator::new(base, collection, *out_reg, *random))
		}
		NodeKind::EnumerateList {
			in_reg,
			out_reg,
		} => Operator::List(ListOperator::new(base, *in_reg, *out_reg)),
		NodeKind::IndexRange {
			collection,
			index,
			ranges,
			out_reg,
			reverse,
		} => {
			let collection = ctx.store().collection(collection)?;
			Operator::Index(IndexOperator::new(
				base,
				collection,
				index.clone(),
				ranges.clone(),
				*out_reg,
				*reverse,
			))
		}
		NodeKind::Calculation {
			expression,
			out_reg,
			condition_reg,
		} => Operator::Calculation(CalculationOperator::new(
			base,
			expression.clone(),
			*out_reg,
			*condition_reg,
		)),
		NodeKind::Filter {
			in_reg,
		} => Operator::Filter(FilterOperator::new(base, *in_reg)),
		NodeKind::Subquery {
			subquery,
			out_reg,
			constant,
		} => {
			// Result reuse is only sound when re-running the inner plan
			// cannot observe different state
			let constant = *constant && is_pure(subquery);
			let inner = build(subquery, ctx, stats, warnings)?;
			let mut base = base;
			base.deps.push(inner);
			Operator::Subquery(SubqueryOperator::new(base, *out_reg, constant))
		}
		NodeKind::Aggregate {
			groups,
			out_reg,
			mode,
		} => Operator::Aggregate(AggregateOperator::new(
			base,
			groups.clone(),
			*out_reg,
			mode.clone(),
		)),
		NodeKind::Sort {
			keys,
			stable,
		} => Operator::Sort(SortOperator::new(base, keys.clone(), *stable)),
		NodeKind::Limit {
			offset,
			limit,
			full_count,
		} => Operator::Limit(LimitOperator::new(base, *offset, *limit, *full_count)),
		NodeKind::Return {
			in_reg,
		} => Operator::Return(ReturnOperator::new(base, *in_reg)),
		NodeKind::Remove {
			collection,
			in_reg,
			options,
			out_reg,
		} => {
			let collection = ctx.store().collection(collection)?;
			let options = ModifyOptions::compile(options)?;
			Operator::Modify(ModifyOperator::new(
				base,
				ModifyVerb::Remove,
				collection,
				*in_reg,
				None,
				options,
				*out_reg,
			))
		}
		NodeKind::Insert {
			collection,
			in_reg,
			options,
			out_reg,
		} => {
			let collection = ctx.store().collection(collection)?;
			let options = ModifyOptions::compile(options)?;
			Operator::Modify(ModifyOperator::new(
				base,
				ModifyVerb::Insert,
				collection,
				*in_reg,
				None,
				options,
				*out_reg,
			))
		}
		NodeKind::Update {
			collection,
			in_reg,
			key_reg,
			options,
			out_reg,
		} => {
			let collection = ctx.store().collection(collection)?;
			let options = ModifyOptions::compile(options)?;
			Operator::Modify(ModifyOperator::new(
				base,
				ModifyVerb::Update,
				collection,
				*in_reg,
				*key_reg,
				options,
				*out_reg,
			))
		}
		NodeKind::Replace {
			collection,
			in_reg,
			key_reg,
			options,
			out_reg,
		} => {
			let collection = ctx.store().collection(collection)?;
			let options = ModifyOptions::compile(options)?;
			Operator::Modify(ModifyOperator::new(
				base,
				ModifyVerb::Replace,
				collection,
				*in_reg,
				*key_reg,
				options,
				*out_reg,
			))
		}
		NodeKind::Gather {
			sort_keys,
		} => Operator::Gather(GatherOperator::new(base, sort_keys.clone())),
		NodeKind::Scatter {
			clients,
		} => Operator::Scatter(ScatterOperator::new(base, clients.clone())),
		NodeKind::Distribute {
			collection,
			clients,
			in_reg,
			create_keys,
		} => {
			let collection = ctx.store().collection(collection)?;
			Operator::Distribute(DistributeOperator::new(
				base,
				clients.clone(),
				collection,
				*in_reg,
				*create_keys,
			))
		}
		NodeKind::Remote {
			server,
			own_name,
			query_id,
		} => Operator::Remote(RemoteOperator::new(
			base,
			server.clone(),
			own_name.clone(),
			query_id.clone(),
			warnings.clone(),
		)),
	};
	Ok(operator)
}
