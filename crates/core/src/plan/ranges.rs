use crate::plan::Expression;
use crate::val::Json;
use serde::{Deserialize, Serialize};

/// One side of an attribute range predicate.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bound {
	pub value: BoundValue,
	pub inclusive: bool,
}

impl Bound {
	pub fn constant(value: Json, inclusive: bool) -> Self {
		Self {
			value: BoundValue::Constant(value),
			inclusive,
		}
	}
}

/// A bound is either a compile-time constant or an expression evaluated
/// against the current input row.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BoundValue {
	Constant(Json),
	Expression(Expression),
}

impl BoundValue {
	pub fn is_constant(&self) -> bool {
		matches!(self, BoundValue::Constant(_))
	}
}

/// The range predicate on one indexed attribute inside a conjunction.
///
/// An equality predicate is expressed as an inclusive low bound equal to
/// an inclusive high bound. Several bounds on the same side are combined
/// by intersection when constant; list-valued expression bounds expand
/// into separate equality disjuncts at cursor initialization.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RangeCondition {
	pub attribute: String,
	#[serde(default)]
	pub lows: Vec<Bound>,
	#[serde(default)]
	pub highs: Vec<Bound>,
}

impl RangeCondition {
	/// An `attribute == value` predicate.
	pub fn equality(attribute: &str, value: Json) -> Self {
		Self {
			attribute: attribute.to_owned(),
			lows: vec![Bound::constant(value.clone(), true)],
			highs: vec![Bound::constant(value, true)],
		}
	}

	/// Whether every bound on both sides is compile-time constant.
	pub fn is_constant(&self) -> bool {
		self.lows.iter().chain(self.highs.iter()).all(|b| b.value.is_constant())
	}
}
