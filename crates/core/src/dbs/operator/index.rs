use crate::ctx::Context;
use crate::dbs::operator::{evaluate, InputRow, OperatorBase};
use crate::dbs::{Block, RegisterId, Row};
use crate::err::Error;
use crate::kvs::{
	Collection, DocIter, Document, DocumentHandle, EdgeDirection, IndexDef, IndexKind,
	ScalarBound, SkiplistCondition, VecIterator, FROM_ATTRIBUTE, ID_ATTRIBUTE, KEY_ATTRIBUTE,
	TO_ATTRIBUTE,
};
use crate::plan::{BoundValue, RangeCondition};
use crate::val::compare::compare_json;
use crate::val::{Json, Value};
use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

/// One evaluated scalar range on one attribute.
#[derive(Clone, Debug)]
struct ScalarRange {
	attribute: String,
	low: Option<(Json, bool)>,
	high: Option<(Json, bool)>,
}

impl ScalarRange {
	/// The single value this range pins its attribute to, when it is an
	/// equality.
	fn equality(&self) -> Option<&Json> {
		match (&self.low, &self.high) {
			(Some((low, true)), Some((high, true)))
				if compare_json(low, high) == Ordering::Equal =>
			{
				Some(low)
			}
			_ => None,
		}
	}

	/// Whether no value can satisfy this range.
	fn is_unsatisfiable(&self) -> bool {
		match (&self.low, &self.high) {
			(Some((low, low_inc)), Some((high, high_inc))) => match compare_json(low, high) {
				Ordering::Greater => true,
				Ordering::Equal => !(*low_inc && *high_inc),
				Ordering::Less => false,
			},
			_ => false,
		}
	}

	fn fingerprint(&self) -> Json {
		serde_json::json!([
			self.attribute,
			self.low.as_ref().map(|(v, i)| serde_json::json!([v, i])),
			self.high.as_ref().map(|(v, i)| serde_json::json!([v, i])),
		])
	}
}

/// One conjunction of scalar ranges, ready to drive an index iterator.
#[derive(Clone, Debug)]
struct Disjunct {
	ranges: Vec<ScalarRange>,
}

impl Disjunct {
	fn find(&self, attribute: &str) -> Option<&ScalarRange> {
		self.ranges.iter().find(|r| r.attribute == attribute)
	}

	fn fingerprint(&self) -> String {
		Json::Array(self.ranges.iter().map(ScalarRange::fingerprint).collect()).to_string()
	}

	/// The constant bound of the leading indexed column, used to order
	/// disjuncts for stable output.
	fn leading_bound(&self, field: &str, reverse: bool) -> Json {
		self.find(field)
			.and_then(|r| {
				if reverse {
					r.high.as_ref()
				} else {
					r.low.as_ref()
				}
			})
			.map(|(v, _)| v.clone())
			.unwrap_or(Json::Null)
	}
}

/// An index scan: per upstream row, evaluates the planned disjunction of
/// range conjunctions, picks the iteration strategy the chosen index
/// supports, and streams the matching documents.
pub(crate) struct IndexOperator {
	pub(crate) base: OperatorBase,
	collection: Arc<Collection>,
	index: IndexDef,
	ranges: Vec<Vec<RangeCondition>>,
	out_reg: RegisterId,
	reverse: bool,
	/// The disjuncts evaluated for the current upstream row
	disjuncts: Vec<Disjunct>,
	disjunct_pos: usize,
	iter: Option<DocIter>,
	docs: Vec<Document>,
	doc_pos: usize,
	row_ready: bool,
}

impl IndexOperator {
	pub(crate) fn new(
		base: OperatorBase,
		collection: Arc<Collection>,
		index: IndexDef,
		ranges: Vec<Vec<RangeCondition>>,
		out_reg: RegisterId,
		reverse: bool,
	) -> Self {
		Self {
			base,
			collection,
			index,
			ranges,
			out_reg,
			reverse,
			disjuncts: Vec::new(),
			disjunct_pos: 0,
			iter: None,
			docs: Vec::new(),
			doc_pos: 0,
			row_ready: false,
		}
	}

	pub(crate) async fn initialize_cursor(
		&mut self,
		ctx: &Context,
		input: InputRow<'_>,
	) -> Result<(), Error> {
		self.base.initialize_cursor(ctx, input).await?;
		self.release();
		Ok(())
	}

	/// Drop the current iterator and all per-row scan state. Called on
	/// cursor initialization, on errors, and on shutdown.
	pub(crate) fn release(&mut self) {
		self.disjuncts.clear();
		self.disjunct_pos = 0;
		self.iter = None;
		self.docs.clear();
		self.doc_pos = 0;
		self.row_ready = false;
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
		let mut anchor: Option<usize> = None;
		while count < at_least {
			ctx.check()?;
			if self.base.buffer.is_empty() {
				if self.base.done || !self.base.get_block(ctx, at_least, at_most).await? {
					self.base.done = true;
					break;
				}
			}
			if !self.row_ready {
				let disjuncts = {
					let front = self.base.buffer.front().unwrap();
					build_disjuncts(
						ctx,
						&self.ranges,
						&self.index,
						self.reverse,
						front.row(self.base.pos),
					)?
				};
				self.disjuncts = disjuncts;
				self.disjunct_pos = 0;
				self.iter = None;
				self.row_ready = true;
			}
			if self.doc_pos >= self.docs.len() {
				if self.iter.is_none() {
					if self.disjunct_pos >= self.disjuncts.len() {
						// This upstream row is fully scanned
						self.row_ready = false;
						self.base.pos += 1;
						anchor = None;
						if self.base.pos >= self.base.buffer.front().unwrap().rows() {
							self.base.buffer.pop_front();
							self.base.pos = 0;
						}
						continue;
					}
					let disjunct = &self.disjuncts[self.disjunct_pos];
					match self.make_iterator(ctx, disjunct)? {
						Some(iter) => self.iter = Some(iter),
						None => {
							self.disjunct_pos += 1;
							continue;
						}
					}
				}
				// Pull the next batch of document pointers out of the index
				let batch = self.iter.as_mut().unwrap().next_batch(at_most - count)?;
				ctx.check()?;
				if batch.is_empty() {
					self.iter = None;
					self.disjunct_pos += 1;
					continue;
				}
				self.base.stats.incr_scanned_index(batch.len() as u64);
				self.docs = batch;
				self.doc_pos = 0;
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

	/// Choose and open the iterator for one disjunct. `None` means the
	/// disjunct cannot produce rows on this index.
	fn make_iterator(&self, ctx: &Context, disjunct: &Disjunct) -> Result<Option<DocIter>, Error> {
		if disjunct.ranges.iter().any(ScalarRange::is_unsatisfiable) {
			return Ok(None);
		}
		let store = ctx.store();
		match self.index.kind {
			IndexKind::Primary => {
				// Translate a `_key` or `_id` equality into a primary-key
				// lookup; a non-string value matches nothing
				let key = match disjunct.find(KEY_ATTRIBUTE).and_then(ScalarRange::equality) {
					Some(Json::String(key)) => Some(key.clone()),
					Some(_) => return Ok(None),
					None => match disjunct.find(ID_ATTRIBUTE).and_then(ScalarRange::equality) {
						Some(Json::String(id)) => match DocumentHandle::parse(id) {
							Ok(handle) if handle.collection == self.collection.name() => {
								Some(handle.key)
							}
							_ => return Ok(None),
						},
						Some(_) => return Ok(None),
						None => None,
					},
				};
				let Some(key) = key else {
					return Ok(None);
				};
				let doc = store.primary_lookup(&self.collection, &key)?;
				Ok(Some(Box::new(VecIterator::new(doc.into_iter().collect()))))
			}
			IndexKind::Edge => {
				for (attribute, direction) in
					[(FROM_ATTRIBUTE, EdgeDirection::From), (TO_ATTRIBUTE, EdgeDirection::To)]
				{
					let Some(value) = disjunct.find(attribute).and_then(ScalarRange::equality)
					else {
						continue;
					};
					// An unresolvable vertex handle matches nothing
					let Ok(handle) = DocumentHandle::from_json(value) else {
						return Ok(None);
					};
					return Ok(Some(store.edge_lookup(&self.collection, direction, &handle)?));
				}
				Ok(None)
			}
			IndexKind::Hash => {
				// Populate the search tuple in the index's attribute order;
				// an unreferenced field makes the disjunct unsatisfiable on
				// this index
				let mut search = Vec::with_capacity(self.index.fields.len());
				for field in &self.index.fields {
					match disjunct.find(field).and_then(ScalarRange::equality) {
						Some(value) => search.push(value.clone()),
						None => return Ok(None),
					}
				}
				Ok(Some(store.hash_lookup(&self.collection, &self.index, &search)?))
			}
			IndexKind::Skiplist => {
				// An equality chain over the fully-bound prefix, plus at
				// most one range on the first non-equality column
				let mut condition = SkiplistCondition::default();
				for field in &self.index.fields {
					let Some(range) = disjunct.find(field) else {
						break;
					};
					if let Some(value) = range.equality() {
						condition.prefix.push(value.clone());
						continue;
					}
					condition.low = range.low.clone().map(|(value, inclusive)| ScalarBound {
						value,
						inclusive,
					});
					condition.high = range.high.clone().map(|(value, inclusive)| ScalarBound {
						value,
						inclusive,
					});
					break;
				}
				if condition.prefix.is_empty() && condition.low.is_none() && condition.high.is_none()
				{
					// No predicate at all iterates the full range
					condition.low = Some(ScalarBound {
						value: Json::Null,
						inclusive: true,
					});
				}
				Ok(Some(store.skiplist_range(
					&self.collection,
					&self.index,
					&condition,
					self.reverse,
				)?))
			}
		}
	}
}

/// Evaluate the planned disjunction against one input row: resolve every
/// expression bound, distribute conjunctions over list-valued equality
/// bounds into a cartesian product of scalar-bound conjunctions, drop
/// duplicate disjuncts, and order them by the constant bound of their
/// leading indexed column.
fn build_disjuncts(
	ctx: &Context,
	ranges: &[Vec<RangeCondition>],
	index: &IndexDef,
	reverse: bool,
	row: Row<'_>,
) -> Result<Vec<Disjunct>, Error> {
	// Hold an expression scope while bounds may execute user code
	let dynamic = ranges
		.iter()
		.flatten()
		.flat_map(|c| c.lows.iter().chain(c.highs.iter()))
		.any(|b| match &b.value {
			BoundValue::Expression(e) => e.may_run_user_code(),
			BoundValue::Constant(_) => false,
		});
	let _scope = dynamic.then(|| ctx.expression_scope());
	let mut disjuncts = Vec::new();
	for conjunction in ranges {
		// Per condition, the alternative scalar ranges it expands to
		let mut alternatives: Vec<Vec<ScalarRange>> = Vec::with_capacity(conjunction.len());
		for condition in conjunction {
			alternatives.push(expand_condition(ctx, condition, row)?);
		}
		// Distribute the conjunction over the alternatives
		let mut product: Vec<Vec<ScalarRange>> = vec![Vec::new()];
		for alternative in alternatives {
			let mut next = Vec::with_capacity(product.len() * alternative.len());
			for partial in &product {
				for range in &alternative {
					let mut extended = partial.clone();
					extended.push(range.clone());
					next.push(extended);
				}
			}
			product = next;
		}
		for ranges in product {
			disjuncts.push(Disjunct {
				ranges,
			});
		}
	}
	// Deduplicate overlapping disjuncts
	let mut seen = HashSet::new();
	disjuncts.retain(|d| seen.insert(d.fingerprint()));
	// Order disjuncts by the constant bound of their leading indexed
	// column; equal bounds keep their plan order
	if let Some(field) = index.fields.first() {
		disjuncts.sort_by(|a, b| {
			let a = a.leading_bound(field, reverse);
			let b = b.leading_bound(field, reverse);
			if reverse {
				compare_json(&b, &a)
			} else {
				compare_json(&a, &b)
			}
		});
	}
	Ok(disjuncts)
}

/// Evaluate one range condition, folding multiple bounds per side into
/// the tightest one, and expanding a list-valued equality bound into one
/// equality alternative per element.
fn expand_condition(
	ctx: &Context,
	condition: &RangeCondition,
	row: Row<'_>,
) -> Result<Vec<ScalarRange>, Error> {
	let mut dynamic = false;
	let mut eval = |bound: &crate::plan::Bound| -> Result<(Json, bool), Error> {
		let value = match &bound.value {
			BoundValue::Constant(v) => v.clone(),
			BoundValue::Expression(e) => {
				dynamic = true;
				evaluate(ctx, e, row)?.to_json()
			}
		};
		Ok((value, bound.inclusive))
	};
	let mut low: Option<(Json, bool)> = None;
	for bound in &condition.lows {
		let (value, inclusive) = eval(bound)?;
		low = Some(tighten(low, value, inclusive, Ordering::Greater));
	}
	let mut high: Option<(Json, bool)> = None;
	for bound in &condition.highs {
		let (value, inclusive) = eval(bound)?;
		high = Some(tighten(high, value, inclusive, Ordering::Less));
	}
	let range = ScalarRange {
		attribute: condition.attribute.clone(),
		low,
		high,
	};
	// A dynamically computed equality against an array matches each of
	// its elements, one disjunct per element
	if dynamic {
		if let Some(Json::Array(elements)) = range.equality().cloned() {
			let expanded = elements
				.into_iter()
				.map(|element| ScalarRange {
					attribute: condition.attribute.clone(),
					low: Some((element.clone(), true)),
					high: Some((element, true)),
				})
				.collect();
			return Ok(expanded);
		}
	}
	Ok(vec![range])
}

/// Combine two bounds on the same side, keeping the tighter one.
fn tighten(
	current: Option<(Json, bool)>,
	value: Json,
	inclusive: bool,
	tighter: Ordering,
) -> (Json, bool) {
	match current {
		None => (value, inclusive),
		Some((existing, existing_inclusive)) => match compare_json(&value, &existing) {
			o if o == tighter => (value, inclusive),
			Ordering::Equal => (existing, existing_inclusive && inclusive),
			_ => (existing, existing_inclusive),
		},
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn range(low: Option<(Json, bool)>, high: Option<(Json, bool)>) -> ScalarRange {
		ScalarRange {
			attribute: "a".to_owned(),
			low,
			high,
		}
	}

	#[test]
	fn equality_detection() {
		use serde_json::json;
		let eq = range(Some((json!(5), true)), Some((json!(5), true)));
		assert_eq!(eq.equality(), Some(&json!(5)));
		let open = range(Some((json!(5), true)), Some((json!(5), false)));
		assert_eq!(open.equality(), None);
		assert!(open.is_unsatisfiable());
		let inverted = range(Some((json!(9), true)), Some((json!(5), true)));
		assert!(inverted.is_unsatisfiable());
	}

	#[test]
	fn bounds_tighten() {
		use serde_json::json;
		let (v, i) = tighten(Some((json!(3), true)), json!(5), true, Ordering::Greater);
		assert_eq!((v, i), (json!(5), true));
		let (v, i) = tighten(Some((json!(5), true)), json!(5), false, Ordering::Greater);
		assert_eq!((v, i), (json!(5), false));
		let (v, i) = tighten(Some((json!(7), false)), json!(5), true, Ordering::Less);
		assert_eq!((v, i), (json!(5), true));
	}
}
