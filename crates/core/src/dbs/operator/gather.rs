use crate::cnf::DEFAULT_BATCH_SIZE;
use crate::ctx::Context;
use crate::dbs::operator::{InputRow, OperatorBase};
use crate::dbs::Block;
use crate::err::Error;
use crate::plan::SortKey;
use crate::val::{compare, Value};
use std::cmp::Ordering;
use std::collections::VecDeque;

static NONE: Value = Value::None;

/// Merges the already-sorted streams of N clients on a coordinator.
///
/// Without sort keys the clients are drained in order. With sort keys the
/// client whose head row is minimal under the lexicographic comparator is
/// picked row by row; a client with an empty queue and a live dependency
/// is refilled before it takes part, and a drained client never wins.
pub(crate) struct GatherOperator {
	pub(crate) base: OperatorBase,
	sort_keys: Vec<SortKey>,
	/// One deque of buffered blocks per client
	queues: Vec<VecDeque<Block>>,
	/// The row cursor into each client's front block
	pos: Vec<usize>,
	exhausted: Vec<bool>,
}

impl GatherOperator {
	pub(crate) fn new(base: OperatorBase, sort_keys: Vec<SortKey>) -> Self {
		let clients = base.deps.len();
		Self {
			base,
			sort_keys,
			queues: vec![VecDeque::new(); clients],
			pos: vec![0; clients],
			exhausted: vec![false; clients],
		}
	}

	pub(crate) async fn initialize_cursor(
		&mut self,
		ctx: &Context,
		input: InputRow<'_>,
	) -> Result<(), Error> {
		self.base.initialize_cursor(ctx, input).await?;
		for queue in &mut self.queues {
			queue.clear();
		}
		self.pos.fill(0);
		self.exhausted.fill(false);
		Ok(())
	}

	/// Drop every client's buffered blocks.
	pub(crate) fn release(&mut self) {
		for queue in &mut self.queues {
			queue.clear();
		}
		self.pos.fill(0);
	}

	/// Make sure client `c` has a head row, refilling its deque when it
	/// runs dry. Returns false once the client is drained for good.
	async fn ensure(&mut self, ctx: &Context, c: usize) -> Result<bool, Error> {
		while self.queues[c].is_empty() && !self.exhausted[c] {
			ctx.check()?;
			match self.base.deps[c]
				.get_some(ctx, *DEFAULT_BATCH_SIZE, *DEFAULT_BATCH_SIZE)
				.await?
			{
				Some(block) => self.queues[c].push_back(block),
				None => self.exhausted[c] = true,
			}
		}
		Ok(!self.queues[c].is_empty())
	}

	fn advance(&mut self, c: usize) {
		self.pos[c] += 1;
		if self.pos[c] >= self.queues[c].front().map(Block::rows).unwrap_or(0) {
			self.queues[c].pop_front();
			self.pos[c] = 0;
		}
	}

	/// The client whose head row sorts first, `None` when all are done.
	async fn pick(&mut self, ctx: &Context) -> Result<Option<usize>, Error> {
		let mut winner: Option<usize> = None;
		for c in 0..self.queues.len() {
			if !self.ensure(ctx, c).await? {
				continue;
			}
			let Some(best) = winner else {
				winner = Some(c);
				continue;
			};
			if self.head_cmp(c, best) == Ordering::Less {
				winner = Some(c);
			}
		}
		Ok(winner)
	}

	/// Compare the head rows of two clients along the sort keys; when the
	/// keys are equal the earlier client wins, keeping the merge stable.
	fn head_cmp(&self, a: usize, b: usize) -> Ordering {
		let block_a = self.queues[a].front().unwrap();
		let block_b = self.queues[b].front().unwrap();
		for key in &self.sort_keys {
			let left = block_a.get(self.pos[a], key.reg).unwrap_or(&NONE);
			let right = block_b.get(self.pos[b], key.reg).unwrap_or(&NONE);
			let order = match key.ascending {
				true => compare(left, right),
				false => compare(right, left),
			};
			match order {
				Ordering::Equal => continue,
				order => return order,
			}
		}
		Ordering::Equal
	}

	pub(crate) async fn get_or_skip_some(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		skipping: bool,
	) -> Result<(Option<Block>, usize), Error> {
		if self.sort_keys.is_empty() {
			self.simple(ctx, at_least, at_most, skipping).await
		} else {
			self.sorted(ctx, at_most, skipping).await
		}
	}

	/// Drain the clients in order, forwarding whichever yields next.
	async fn simple(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		skipping: bool,
	) -> Result<(Option<Block>, usize), Error> {
		let mut collected = Vec::new();
		let mut count = 0;
		'outer: while count < at_least {
			for c in 0..self.queues.len() {
				if !self.ensure(ctx, c).await? {
					continue;
				}
				let front = self.queues[c].front().unwrap();
				let take = (front.rows() - self.pos[c]).min(at_most - count);
				if !skipping {
					if self.pos[c] == 0 && take == front.rows() {
						collected.push(self.queues[c].pop_front().unwrap());
					} else {
						collected.push(front.slice(self.pos[c], self.pos[c] + take));
						self.pos[c] += take;
						if self.pos[c] >= self.queues[c].front().unwrap().rows() {
							self.queues[c].pop_front();
							self.pos[c] = 0;
						}
					}
				} else {
					self.pos[c] += take;
					if self.pos[c] >= front.rows() {
						self.queues[c].pop_front();
						self.pos[c] = 0;
					}
				}
				count += take;
				continue 'outer;
			}
			// Every client is drained
			break;
		}
		if skipping || count == 0 {
			self.base.done = count == 0;
			return Ok((None, count));
		}
		let block = Block::concatenate(collected)?;
		Ok((Some(block), count))
	}

	/// Merge row by row along the sort keys.
	async fn sorted(
		&mut self,
		ctx: &Context,
		at_most: usize,
		skipping: bool,
	) -> Result<(Option<Block>, usize), Error> {
		let mut out = (!skipping).then(|| Block::new(at_most, self.base.width));
		let mut count = 0;
		while count < at_most {
			ctx.check()?;
			let Some(c) = self.pick(ctx).await? else {
				break;
			};
			if let Some(out) = out.as_mut() {
				let pos = self.pos[c];
				self.queues[c].front_mut().unwrap().move_row(pos, out, count);
			}
			self.advance(c);
			count += 1;
		}
		if count == 0 {
			self.base.done = true;
			return Ok((None, 0));
		}
		match out {
			Some(mut out) => {
				out.shrink(count);
				Ok((Some(out), count))
			}
			None => Ok((None, count)),
		}
	}

	/// Liveness is the OR over the clients.
	pub(crate) async fn has_more(&mut self, ctx: &Context) -> Result<bool, Error> {
		for c in 0..self.queues.len() {
			if self.ensure(ctx, c).await? {
				return Ok(true);
			}
		}
		self.base.done = true;
		Ok(false)
	}
}
