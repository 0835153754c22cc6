use crate::cluster::ShardId;
use crate::cnf::DEFAULT_BATCH_SIZE;
use crate::ctx::Context;
use crate::dbs::operator::{InputRow, OperatorBase};
use crate::dbs::{Block, RegisterId};
use crate::err::Error;
use crate::kvs::{Collection, KEY_ATTRIBUTE};
use crate::val::{Json, Value};
use std::collections::VecDeque;
use std::sync::Arc;

/// Partitions one upstream stream into N per-client queues by shard key.
///
/// Each input row is routed to exactly one client, determined by the
/// cluster metadata from the row's candidate document. The shared-buffer
/// bookkeeping follows the scatter semantics: a block leaves the buffer
/// once all of its rows were delivered.
pub(crate) struct DistributeOperator {
	pub(crate) base: OperatorBase,
	clients: Vec<ShardId>,
	collection: Arc<Collection>,
	in_reg: RegisterId,
	/// Generate missing document keys while routing, allowed only under
	/// default sharding
	create_keys: bool,
	/// Per client: the rows routed to it, as (absolute block, row) pairs
	queues: Vec<VecDeque<(usize, usize)>>,
	/// Per buffered block: rows not yet delivered to their client
	remaining: VecDeque<usize>,
	popped: usize,
	dep_exhausted: bool,
	done_for_client: Vec<bool>,
	needs_init: bool,
	shutdown_done: bool,
}

impl DistributeOperator {
	pub(crate) fn new(
		base: OperatorBase,
		clients: Vec<ShardId>,
		collection: Arc<Collection>,
		in_reg: RegisterId,
		create_keys: bool,
	) -> Self {
		let n = clients.len();
		Self {
			base,
			clients,
			collection,
			in_reg,
			create_keys,
			queues: vec![VecDeque::new(); n],
			remaining: VecDeque::new(),
			popped: 0,
			dep_exhausted: false,
			done_for_client: vec![false; n],
			needs_init: true,
			shutdown_done: false,
		}
	}

	fn client(&self, shard: &ShardId) -> Result<usize, Error> {
		self.clients.iter().position(|s| s == shard).ok_or_else(|| Error::Internal {
			message: format!("Shard '{shard}' is not a client of this operator"),
		})
	}

	pub(crate) async fn initialize_cursor(
		&mut self,
		ctx: &Context,
		input: InputRow<'_>,
	) -> Result<(), Error> {
		if !self.needs_init {
			return Ok(());
		}
		self.needs_init = false;
		self.shutdown_done = false;
		self.base.initialize_cursor(ctx, input).await?;
		for queue in &mut self.queues {
			queue.clear();
		}
		self.remaining.clear();
		self.popped = 0;
		self.dep_exhausted = false;
		self.done_for_client.fill(false);
		Ok(())
	}

	pub(crate) async fn shutdown(&mut self, ctx: &Context, code: i64) -> Result<(), Error> {
		if self.shutdown_done {
			return Ok(());
		}
		self.shutdown_done = true;
		self.needs_init = true;
		for queue in &mut self.queues {
			queue.clear();
		}
		self.remaining.clear();
		self.base.shutdown_deps(ctx, code).await
	}

	/// Pull one upstream block and route every row to its client queue.
	async fn fill(&mut self, ctx: &Context) -> Result<bool, Error> {
		if !self.base.get_block(ctx, *DEFAULT_BATCH_SIZE, *DEFAULT_BATCH_SIZE).await? {
			self.dep_exhausted = true;
			return Ok(false);
		}
		let abs = self.popped + self.base.buffer.len() - 1;
		let rows = self.base.buffer.back().unwrap().rows();
		self.remaining.push_back(rows);
		for row in 0..rows {
			ctx.check()?;
			let c = self.route(ctx, row)?;
			self.queues[c].push_back((abs, row));
		}
		Ok(true)
	}

	/// Determine the destination client of one row of the freshly pulled
	/// block, generating and writing back a document key when asked to.
	fn route(&mut self, ctx: &Context, row: usize) -> Result<usize, Error> {
		let cluster = ctx.cluster()?.clone();
		let block = self.base.buffer.back_mut().unwrap();
		let mut doc = match block.get(row, self.in_reg) {
			// A bare string is a document key, as used when removing
			Some(Value::Json(Json::String(key))) => {
				let mut obj = serde_json::Map::with_capacity(1);
				obj.insert(KEY_ATTRIBUTE.to_owned(), Json::from(key.clone()));
				Json::Object(obj)
			}
			Some(Value::Json(v)) if v.is_object() => v.clone(),
			Some(Value::Shaped(d)) => d.to_json(),
			_ => return Err(Error::DocumentTypeInvalid),
		};
		let has_key = doc.get(KEY_ATTRIBUTE).is_some();
		if cluster.uses_default_sharding(&self.collection) {
			if self.create_keys && !has_key {
				// Auto-insert a generated key and tag the row with it, so
				// the receiving shard stores exactly this document
				let key = ctx.store().generate_key(&self.collection);
				doc.as_object_mut()
					.unwrap()
					.insert(KEY_ATTRIBUTE.to_owned(), Json::from(key));
				block.erase(row, self.in_reg);
				block.set(row, self.in_reg, Value::Json(doc.clone()));
			}
		} else if has_key {
			return Err(Error::MustNotSpecifyKey);
		}
		let shard = cluster.responsible_shard(&self.collection, &doc)?;
		self.client(&shard)
	}

	fn pop_consumed(&mut self) {
		while self.remaining.front() == Some(&0) {
			self.base.buffer.pop_front();
			self.remaining.pop_front();
			self.popped += 1;
		}
	}

	async fn serve(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		shard: &ShardId,
		skipping: bool,
	) -> Result<(Option<Block>, usize), Error> {
		let c = self.client(shard)?;
		if self.done_for_client[c] {
			return Ok((None, 0));
		}
		while self.queues[c].len() < at_least && !self.dep_exhausted {
			self.fill(ctx).await?;
		}
		let take = self.queues[c].len().min(at_most);
		if take == 0 {
			self.done_for_client[c] = true;
			return Ok((None, 0));
		}
		let mut out = (!skipping).then(|| Block::new(take, self.base.width));
		for i in 0..take {
			let (abs, row) = self.queues[c].pop_front().unwrap();
			let effective = abs - self.popped;
			if let Some(out) = out.as_mut() {
				self.base.buffer[effective].move_row(row, out, i);
			}
			self.remaining[effective] -= 1;
		}
		self.pop_consumed();
		Ok((out, take))
	}

	pub(crate) async fn get_some_for_shard(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		shard: &ShardId,
	) -> Result<Option<Block>, Error> {
		let (block, _) = self.serve(ctx, at_least, at_most, shard, false).await?;
		Ok(block)
	}

	pub(crate) async fn skip_some_for_shard(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		shard: &ShardId,
	) -> Result<usize, Error> {
		let (_, skipped) = self.serve(ctx, at_least, at_most, shard, true).await?;
		Ok(skipped)
	}

	pub(crate) async fn has_more_for_shard(
		&mut self,
		ctx: &Context,
		shard: &ShardId,
	) -> Result<bool, Error> {
		let c = self.client(shard)?;
		if self.done_for_client[c] {
			return Ok(false);
		}
		while self.queues[c].is_empty() && !self.dep_exhausted {
			self.fill(ctx).await?;
		}
		Ok(!self.queues[c].is_empty())
	}
}
