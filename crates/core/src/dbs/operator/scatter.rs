use crate::cluster::ShardId;
use crate::cnf::DEFAULT_BATCH_SIZE;
use crate::ctx::Context;
use crate::dbs::operator::{InputRow, OperatorBase};
use crate::dbs::Block;
use crate::err::Error;

/// Replicates one upstream stream to N clients on the DB-server side.
///
/// All clients read from the shared buffer; a block is popped from the
/// front only when every client has fully consumed it. The calls carry an
/// explicit shard id, and cursor initialization and shutdown are
/// idempotent with respect to per-client re-entry.
pub(crate) struct ScatterOperator {
	pub(crate) base: OperatorBase,
	clients: Vec<ShardId>,
	/// Per client: the absolute block index and the row inside it
	cursors: Vec<(usize, usize)>,
	/// Blocks already dropped from the front of the shared buffer
	popped: usize,
	dep_exhausted: bool,
	done_for_client: Vec<bool>,
	/// Suppresses a second propagation once the first client has
	/// initialized the shared dependencies
	needs_init: bool,
	shutdown_done: bool,
}

impl ScatterOperator {
	pub(crate) fn new(base: OperatorBase, clients: Vec<ShardId>) -> Self {
		let n = clients.len();
		Self {
			base,
			clients,
			cursors: vec![(0, 0); n],
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
		self.cursors.fill((0, 0));
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
		self.base.shutdown_deps(ctx, code).await
	}

	/// Drop fully consumed blocks from the front of the shared buffer.
	fn pop_consumed(&mut self) {
		while !self.base.buffer.is_empty() {
			let min_block = self.cursors.iter().map(|(block, _)| *block).min().unwrap_or(0);
			if min_block <= self.popped {
				break;
			}
			self.base.buffer.pop_front();
			self.popped += 1;
		}
	}

	/// Serve one client, slicing its next window out of the shared
	/// buffer, pulling new upstream blocks as needed.
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
		let mut collected = Vec::new();
		let mut count = 0;
		while count < at_least {
			ctx.check()?;
			let (block, row) = self.cursors[c];
			let effective = block - self.popped;
			if effective >= self.base.buffer.len() {
				if self.dep_exhausted {
					break;
				}
				if !self.base.get_block(ctx, *DEFAULT_BATCH_SIZE, *DEFAULT_BATCH_SIZE).await? {
					self.dep_exhausted = true;
				}
				continue;
			}
			let front = &self.base.buffer[effective];
			let take = (front.rows() - row).min(at_most - count);
			if !skipping {
				// Every client receives its own copy of the shared rows
				collected.push(front.slice(row, row + take));
			}
			if row + take >= front.rows() {
				self.cursors[c] = (block + 1, 0);
			} else {
				self.cursors[c] = (block, row + take);
			}
			count += take;
			self.pop_consumed();
		}
		if count == 0 {
			self.done_for_client[c] = true;
			return Ok((None, 0));
		}
		if skipping {
			return Ok((None, count));
		}
		let block = Block::concatenate(collected)?;
		Ok((Some(block), count))
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
		loop {
			let (block, _) = self.cursors[c];
			if block - self.popped < self.base.buffer.len() {
				return Ok(true);
			}
			if self.dep_exhausted {
				return Ok(false);
			}
			if !self.base.get_block(ctx, 1, *DEFAULT_BATCH_SIZE).await? {
				self.dep_exhausted = true;
			}
		}
	}
}
