use crate::dbs::Row;
use crate::err::Error;
use crate::val::{Json, Value};

/// A planned expression, as handed over by the planner.
///
/// The two simple shapes are evaluated by the engine itself; everything
/// else arrives pre-compiled and is executed through the [`Evaluator`]
/// collaborator.
#[derive(Clone, Debug, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Expression {
	/// A compile-time constant
	Constant {
		value: Json,
	},
	/// A pure reference to another register of the input row
	Reference {
		reg: crate::dbs::RegisterId,
	},
	/// A compiled expression executed by the evaluator
	#[serde(rename_all = "camelCase")]
	Compiled {
		/// The evaluator's handle for the compiled form
		id: u32,
		/// The source text, carried for diagnostics only
		#[serde(default)]
		source: String,
		/// Whether evaluation may re-enter a user-code runtime
		#[serde(default)]
		user_code: bool,
	},
}

impl Expression {
	/// Whether evaluating this expression may execute user code, requiring
	/// an expression scope to be held around the call.
	pub fn may_run_user_code(&self) -> bool {
		matches!(
			self,
			Expression::Compiled {
				user_code: true,
				..
			}
		)
	}
}

/// The expression evaluator collaborator.
///
/// Implementations are bound to the calling thread while a scope is open;
/// in cluster mode the engine invalidates cached compiled expressions
/// around every calculation batch.
pub trait Evaluator: Send + Sync {
	/// Evaluate a compiled expression against one input row.
	fn evaluate(&self, id: u32, row: Row<'_>) -> Result<Value, Error>;

	/// Called when the engine enters a scope in which expressions may
	/// execute user code.
	fn enter_scope(&self) {}

	/// Called when such a scope is released.
	fn exit_scope(&self) {}

	/// Drop any cached compiled state, forcing recompilation on next use.
	fn invalidate(&self) {}
}
