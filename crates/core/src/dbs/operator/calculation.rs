use crate::ctx::Context;
use crate::dbs::operator::{evaluate, OperatorBase};
use crate::dbs::{Block, RegisterId};
use crate::err::Error;
use crate::plan::Expression;
use crate::val::{Json, Value};

/// Evaluates an expression per row into the designated output register.
///
/// Two fast paths avoid the evaluator entirely: a pure register reference
/// copies by reference and shares the collection pointer, and a constant
/// is materialized once and shared across the batch. A conditional
/// calculation emits null for rows whose condition register is false.
pub(crate) struct CalculationOperator {
	pub(crate) base: OperatorBase,
	expression: Expression,
	out_reg: RegisterId,
	condition_reg: Option<RegisterId>,
}

impl CalculationOperator {
	pub(crate) fn new(
		base: OperatorBase,
		expression: Expression,
		out_reg: RegisterId,
		condition_reg: Option<RegisterId>,
	) -> Self {
		Self {
			base,
			expression,
			out_reg,
			condition_reg,
		}
	}

	pub(crate) async fn get_or_skip_some(
		&mut self,
		ctx: &Context,
		at_least: usize,
		at_most: usize,
		skipping: bool,
	) -> Result<(Option<Block>, usize), Error> {
		let (block, count) = self.base.produce(ctx, at_least, at_most, skipping).await?;
		let Some(mut block) = block else {
			return Ok((None, count));
		};
		self.apply(ctx, &mut block)?;
		Ok((Some(block), count))
	}

	fn apply(&self, ctx: &Context, block: &mut Block) -> Result<(), Error> {
		match &self.expression {
			Expression::Reference {
				reg,
			} => {
				// Copy the source register by reference and share its
				// collection pointer
				let reg = *reg;
				if let Some(col) = block.col(reg).cloned() {
					block.set_col(self.out_reg, col);
				}
				for row in 0..block.rows() {
					ctx.check()?;
					if !self.condition_holds(block, row) {
						block.set(row, self.out_reg, Value::Json(Json::Null));
						continue;
					}
					if let Some(id) = block.id_at(row, reg) {
						block.share(row, self.out_reg, id);
					}
				}
			}
			Expression::Constant {
				value,
			} => {
				let mut shared = None;
				for row in 0..block.rows() {
					ctx.check()?;
					if !self.condition_holds(block, row) {
						block.set(row, self.out_reg, Value::Json(Json::Null));
						continue;
					}
					match shared {
						Some(id) => block.share(row, self.out_reg, id),
						None => {
							shared =
								Some(block.set(row, self.out_reg, Value::Json(value.clone())));
						}
					}
				}
			}
			Expression::Compiled {
				..
			} => {
				// Compiled caches are bound per node; in cluster mode they
				// must be dropped before and after the batch
				if ctx.is_cluster() {
					ctx.evaluator()?.invalidate();
				}
				let user_code = self.expression.may_run_user_code();
				let _scope = user_code.then(|| ctx.expression_scope());
				let mut results = Vec::with_capacity(block.rows());
				for row in 0..block.rows() {
					ctx.check()?;
					if !self.condition_holds(block, row) {
						results.push(Value::Json(Json::Null));
						continue;
					}
					results.push(evaluate(ctx, &self.expression, block.row(row))?);
				}
				for (row, value) in results.into_iter().enumerate() {
					block.set(row, self.out_reg, value);
				}
				drop(_scope);
				if ctx.is_cluster() {
					ctx.evaluator()?.invalidate();
				}
			}
		}
		Ok(())
	}

	fn condition_holds(&self, block: &Block, row: usize) -> bool {
		match self.condition_reg {
			None => true,
			Some(reg) => block.get(row, reg).map(Value::is_truthy).unwrap_or(false),
		}
	}
}
