use crate::cnf::SCAN_BATCH_SIZE;
use crate::ctx::Context;
use crate::dbs::operator::{InputRow, OperatorBase};
use crate::dbs::{Block, RegisterId};
use crate::err::Error;
use crate::kvs::{Collection, Document, ScanCursor};
use crate::val::Value;
use std::sync::Arc;

/// A full collection scan: one output row per stored document per
/// upstream row, in sequential or random order.
pub(crate) struct CollectionOperator {
	pub(crate) base: OperatorBase,
	collection: Arc<Collection>,
	out_reg: RegisterId,
	random: bool,
	cursor: ScanCursor,
	/// The locally buffered batch of document pointers
	docs: Vec<Document>,
	doc_pos: usize,
}

impl CollectionOperator {
	pub(crate) fn new(
		base: OperatorBase,
		collection: Arc<Collection>,
		out_reg: RegisterId,
		random: bool,
	) -> Self {
		Self {
			base,
			collection,
			out_reg,
			random,
			cursor: ScanCursor::default(),
			docs: Vec::new(),
			doc_pos: 0,
		}
	}

	pub(crate) async fn initialize_cursor(
		&mut self,
		ctx: &Context,
		input: InputRow<'_>,
	) -> Result<(), Error> {
		self.base.initialize_cursor(ctx, input).await?;
		self.cursor.reset();
		self.docs.clear();
		self.doc_pos = 0;
		Ok(())
	}

	/// Drop the buffered document pointers and the scan position.
	pub(crate) fn release(&mut self) {
		self.cursor.reset();
		self.docs.clear();
		self.doc_pos = 0;
	}

	/// Refill the local document batch. Returns false when the scan over
	/// the collection is exhausted.
	fn refill(&mut self, ctx: &Context, at_most: usize) -> Result<bool, Error> {
		let hint = at_most.max(*SCAN_BATCH_SIZE);
		let batch = ctx.store().scan(&self.collection, &mut self.cursor, hint, self.random)?;
		ctx.check()?;
		if batch.is_empty() {
			return Ok(false);
		}
		self.base.stats.incr_scanned_full(batch.len() as u64);
		self.docs = batch;
		self.doc_pos = 0;
		Ok(true)
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
		// The output row the current upstream row was last copied into
		let mut anchor: Option<usize> = None;
		while count < at_least {
			ctx.check()?;
			if self.base.buffer.is_empty() {
				if self.base.done || !self.base.get_block(ctx, at_least, at_most).await? {
					self.base.done = true;
					break;
				}
			}
			if self.doc_pos >= self.docs.len() {
				if !self.refill(ctx, at_most - count)? {
					// This upstream row is fully enumerated
					self.cursor.reset();
					self.docs.clear();
					self.base.pos += 1;
					anchor = None;
					if self.base.pos >= self.base.buffer.front().unwrap().rows() {
						self.base.buffer.pop_front();
						self.base.pos = 0;
					}
					continue;
				}
			}
			let take = (self.docs.len() - self.doc_pos).min(at_most - count);
			for doc in &self.docs[self.doc_pos..self.doc_pos + take] {
				if let Some(out) = out.as_mut() {
					let front = self.base.buffer.front().unwrap();
					match anchor {
						Some(row) => out.repeat(row, count, front.regs()),
						None => out.inherit(count, front, self.base.pos),
					}
					anchor = Some(count);
					out.set(count, self.out_reg, Value::Shaped(doc.clone()));
				}
				count += 1;
			}
			self.doc_pos += take;
			if let Some(out) = out.as_mut() {
				out.set_col(self.out_reg, self.collection.clone());
			}
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
