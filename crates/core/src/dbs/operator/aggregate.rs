use crate::cnf::DEFAULT_BATCH_SIZE;
use crate::ctx::Context;
use crate::dbs::operator::{InputRow, OperatorBase};
use crate::dbs::Block;
use crate::err::Error;
use crate::plan::{AggregateMode, GroupPair};
use crate::val::{compare, Json, Value};
use std::cmp::Ordering;
use std::collections::VecDeque;

static NONE: Value = Value::None;

/// The state of the group currently being collected.
struct GroupState {
	/// The group key values, cloned from the group's first row
	values: Vec<Value>,
	/// The grouped input rows, kept only when the emission mode needs them
	blocks: Vec<Block>,
	length: usize,
}

/// Groups consecutive runs of equal group-key tuples; rows arrive already
/// sorted by group key. Each finished group is emitted as one output row,
/// in one of the mutually exclusive emission modes.
pub(crate) struct AggregateOperator {
	pub(crate) base: OperatorBase,
	groups: Vec<GroupPair>,
	out_reg: Option<crate::dbs::RegisterId>,
	mode: AggregateMode,
	current: Option<GroupState>,
	/// Finished groups awaiting emission
	ready: VecDeque<GroupState>,
	input_done: bool,
}

impl AggregateOperator {
	pub(crate) fn new(
		base: OperatorBase,
		groups: Vec<GroupPair>,
		out_reg: Option<crate::dbs::RegisterId>,
		mode: AggregateMode,
	) -> Self {
		Self {
			base,
			groups,
			out_reg,
			mode,
			current: None,
			ready: VecDeque::new(),
			input_done: false,
		}
	}

	fn needs_rows(&self) -> bool {
		matches!(
			self.mode,
			AggregateMode::Expression {
				..
			} | AggregateMode::Variables {
				..
			}
		)
	}

	pub(crate) async fn initialize_cursor(
		&mut self,
		ctx: &Context,
		input: InputRow<'_>,
	) -> Result<(), Error> {
		self.base.initialize_cursor(ctx, input).await?;
		self.current = None;
		self.ready.clear();
		self.input_done = false;
		Ok(())
	}

	/// Drop the group state and any groups awaiting emission.
	pub(crate) fn release(&mut self) {
		self.current = None;
		self.ready.clear();
	}

	pub(crate) async fn get_or_skip_some(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		skipping: bool,
	) -> Result<(Option<Block>, usize), Error> {
		if self.base.done {
			return Ok((None, 0));
		}
		while self.ready.len() < at_least && !self.input_done {
			ctx.check()?;
			if self.base.buffer.is_empty()
				&& !self.base.get_block(ctx, *DEFAULT_BATCH_SIZE, *DEFAULT_BATCH_SIZE).await?
			{
				// End of input: emit the pending group, or the single row
				// a total aggregation produces for empty input
				self.input_done = true;
				match self.current.take() {
					Some(group) => self.ready.push_back(group),
					None if self.groups.is_empty() && self.ready.is_empty() => {
						self.ready.push_back(GroupState {
							values: Vec::new(),
							blocks: Vec::new(),
							length: 0,
						});
					}
					None => (),
				}
				break;
			}
			let block = self.base.buffer.pop_front().unwrap();
			self.consume(ctx, block)?;
		}
		let take = self.ready.len().min(at_most);
		if take == 0 {
			self.base.done = self.input_done;
			return Ok((None, 0));
		}
		if skipping {
			self.ready.drain(..take);
			return Ok((None, take));
		}
		let mut out = Block::new(take, self.base.width);
		for row in 0..take {
			let group = self.ready.pop_front().unwrap();
			self.emit(group, &mut out, row);
		}
		if self.input_done && self.ready.is_empty() {
			self.base.done = true;
		}
		Ok((Some(out), take))
	}

	/// Scan one input block, closing a group whenever the key tuple
	/// changes.
	fn consume(&mut self, ctx: &Context, block: Block) -> Result<(), Error> {
		let needs_rows = self.needs_rows();
		let mut segment_start = 0;
		for row in 0..block.rows() {
			ctx.check()?;
			let differs = match &self.current {
				None => true,
				Some(group) => self.groups.iter().zip(group.values.iter()).any(|(pair, cur)| {
					let value = block.get(row, pair.in_reg).unwrap_or(&NONE);
					compare(value, cur) != Ordering::Equal
				}),
			};
			if differs {
				if let Some(mut group) = self.current.take() {
					if needs_rows && row > segment_start {
						group.blocks.push(block.slice(segment_start, row));
					}
					self.ready.push_back(group);
				}
				segment_start = row;
				self.current = Some(GroupState {
					values: self
						.groups
						.iter()
						.map(|pair| block.clone_value(row, pair.in_reg).unwrap_or_default())
						.collect(),
					blocks: Vec::new(),
					length: 0,
				});
			}
			self.current.as_mut().unwrap().length += 1;
		}
		if needs_rows {
			if let Some(group) = self.current.as_mut() {
				if block.rows() > segment_start {
					group.blocks.push(block.slice(segment_start, block.rows()));
				}
			}
		}
		Ok(())
	}

	/// Materialize one finished group into one output row.
	fn emit(&self, group: GroupState, out: &mut Block, row: usize) {
		for (pair, value) in self.groups.iter().zip(group.values.into_iter()) {
			// A single collection pointer per output register must remain
			// sufficient, so shaped group values become plain documents
			let value = match value {
				Value::Shaped(doc) => Value::Json(doc.to_json()),
				value => value,
			};
			out.set(row, pair.out_reg, value);
		}
		let Some(out_reg) = self.out_reg else {
			return;
		};
		match &self.mode {
			AggregateMode::GroupsOnly => (),
			AggregateMode::Count => {
				out.set(row, out_reg, Value::Json(Json::from(group.length as i64)));
			}
			AggregateMode::Expression {
				reg,
			} => {
				let mut values = Vec::with_capacity(group.length);
				for block in &group.blocks {
					for r in 0..block.rows() {
						values.push(block.get(r, *reg).map(Value::to_json).unwrap_or(Json::Null));
					}
				}
				out.set(row, out_reg, Value::Json(Json::Array(values)));
			}
			AggregateMode::Variables {
				variables,
			} => {
				let mut rows = Vec::with_capacity(group.length);
				for block in &group.blocks {
					for r in 0..block.rows() {
						let mut obj = serde_json::Map::with_capacity(variables.len());
						for var in variables {
							let value = block
								.get(r, var.reg)
								.map(Value::to_json)
								.unwrap_or(Json::Null);
							obj.insert(var.name.clone(), value);
						}
						rows.push(Json::Object(obj));
					}
				}
				out.set(row, out_reg, Value::Json(Json::Array(rows)));
			}
		}
	}
}
