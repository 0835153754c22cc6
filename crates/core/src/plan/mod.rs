pub use self::expression::{Evaluator, Expression};
pub use self::options::{ModifyOptions, OptionsSource};
pub use self::ranges::{Bound, BoundValue, RangeCondition};

mod expression;
mod options;
mod ranges;

use crate::cluster::ShardId;
use crate::dbs::RegisterId;
use crate::kvs::IndexDef;
use serde::{Deserialize, Serialize};

/// One key of a sort or merge order.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SortKey {
	pub reg: RegisterId,
	pub ascending: bool,
}

impl SortKey {
	pub fn asc(reg: RegisterId) -> Self {
		Self {
			reg,
			ascending: true,
		}
	}

	pub fn desc(reg: RegisterId) -> Self {
		Self {
			reg,
			ascending: false,
		}
	}
}

/// One grouped register pair of an aggregation: the input register the
/// group key is read from, and the output register it is written to.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupPair {
	pub in_reg: RegisterId,
	pub out_reg: RegisterId,
}

/// A register collected under a name by a keep-variables aggregation.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NamedRegister {
	pub name: String,
	pub reg: RegisterId,
}

/// How an aggregation materializes each finished group.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "camelCase")]
pub enum AggregateMode {
	/// Only the group keys are emitted
	#[default]
	GroupsOnly,
	/// The group length is emitted into the out register
	Count,
	/// One register of the grouped rows is concatenated into an array
	#[serde(rename_all = "camelCase")]
	Expression {
		reg: RegisterId,
	},
	/// The grouped rows are collected as one object per row, keyed by
	/// variable name
	Variables {
		variables: Vec<NamedRegister>,
	},
}

/// A node of the compiled operator tree, as handed over by the planner.
///
/// `nr_regs` is the register layout per depth; the node's own output width
/// is `nr_regs[depth]`. `regs_to_clear` names the registers no operator
/// further downstream reads, erased from every block this node returns.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Node {
	pub id: u32,
	pub depth: usize,
	pub nr_regs: Vec<usize>,
	#[serde(default)]
	pub regs_to_clear: Vec<RegisterId>,
	#[serde(flatten)]
	pub kind: NodeKind,
	#[serde(default)]
	pub dependencies: Vec<Node>,
}

impl Node {
	/// The width of the blocks this node produces.
	pub fn width(&self) -> usize {
		self.nr_regs.get(self.depth).copied().unwrap_or_default()
	}
}

/// The operator-specific payload of a plan node.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NodeKind {
	/// Yields exactly one row carrying the query's input binding
	Singleton,
	/// Full collection scan
	#[serde(rename_all = "camelCase")]
	EnumerateCollection {
		collection: String,
		out_reg: RegisterId,
		#[serde(default)]
		random: bool,
	},
	/// Expansion of an array-like register into one row per element
	#[serde(rename_all = "camelCase")]
	EnumerateList {
		in_reg: RegisterId,
		out_reg: RegisterId,
	},
	/// Index scan over a disjunction of attribute range conjunctions
	#[serde(rename_all = "camelCase")]
	IndexRange {
		collection: String,
		index: IndexDef,
		ranges: Vec<Vec<RangeCondition>>,
		out_reg: RegisterId,
		#[serde(default)]
		reverse: bool,
	},
	/// Per-row expression evaluation into an output register
	#[serde(rename_all = "camelCase")]
	Calculation {
		expression: Expression,
		out_reg: RegisterId,
		/// When set, the expression only runs while this boolean register
		/// is true; otherwise null is emitted
		#[serde(default)]
		condition_reg: Option<RegisterId>,
	},
	/// Predicate on a boolean register
	#[serde(rename_all = "camelCase")]
	Filter {
		in_reg: RegisterId,
	},
	/// Per-outer-row execution of an inner plan into a docvec register
	#[serde(rename_all = "camelCase")]
	Subquery {
		subquery: Box<Node>,
		out_reg: RegisterId,
		/// The planner determined the inner plan is constant and
		/// deterministic, so its first result may be reused
		#[serde(default)]
		constant: bool,
	},
	/// Grouping of consecutive runs of equal group keys
	#[serde(rename_all = "camelCase")]
	Aggregate {
		groups: Vec<GroupPair>,
		#[serde(default)]
		out_reg: Option<RegisterId>,
		#[serde(default)]
		mode: AggregateMode,
	},
	/// Fully blocking sort
	#[serde(rename_all = "camelCase")]
	Sort {
		keys: Vec<SortKey>,
		#[serde(default)]
		stable: bool,
	},
	/// Offset/limit window with optional full-count accounting
	#[serde(rename_all = "camelCase")]
	Limit {
		offset: usize,
		limit: usize,
		#[serde(default)]
		full_count: bool,
	},
	/// Strips the row down to the single result register
	#[serde(rename_all = "camelCase")]
	Return {
		in_reg: RegisterId,
	},
	/// Document removal
	#[serde(rename_all = "camelCase")]
	Remove {
		collection: String,
		in_reg: RegisterId,
		#[serde(default)]
		options: OptionsSource,
		#[serde(default)]
		out_reg: Option<RegisterId>,
	},
	/// Document insertion
	#[serde(rename_all = "camelCase")]
	Insert {
		collection: String,
		in_reg: RegisterId,
		#[serde(default)]
		options: OptionsSource,
		#[serde(default)]
		out_reg: Option<RegisterId>,
	},
	/// Patch merge into existing documents
	#[serde(rename_all = "camelCase")]
	Update {
		collection: String,
		in_reg: RegisterId,
		/// A separate key variable, when the plan supplies one
		#[serde(default)]
		key_reg: Option<RegisterId>,
		#[serde(default)]
		options: OptionsSource,
		#[serde(default)]
		out_reg: Option<RegisterId>,
	},
	/// Wholesale document replacement
	#[serde(rename_all = "camelCase")]
	Replace {
		collection: String,
		in_reg: RegisterId,
		#[serde(default)]
		key_reg: Option<RegisterId>,
		#[serde(default)]
		options: OptionsSource,
		#[serde(default)]
		out_reg: Option<RegisterId>,
	},
	/// Coordinator-side merge of per-shard streams
	#[serde(rename_all = "camelCase")]
	Gather {
		#[serde(default)]
		sort_keys: Vec<SortKey>,
	},
	/// DB-server-side replication of one stream to every client
	#[serde(rename_all = "camelCase")]
	Scatter {
		clients: Vec<ShardId>,
	},
	/// DB-server-side partitioning of one stream by shard key
	#[serde(rename_all = "camelCase")]
	Distribute {
		collection: String,
		clients: Vec<ShardId>,
		in_reg: RegisterId,
		#[serde(default)]
		create_keys: bool,
	},
	/// Shim for an upstream sub-plan executing on a peer DB-server
	#[serde(rename_all = "camelCase")]
	Remote {
		server: String,
		#[serde(default)]
		own_name: String,
		query_id: String,
	},
}

impl NodeKind {
	/// Whether this node writes to a collection.
	pub fn is_modification(&self) -> bool {
		matches!(
			self,
			NodeKind::Remove {
				..
			} | NodeKind::Insert {
				..
			} | NodeKind::Update {
				..
			} | NodeKind::Replace {
				..
			}
		)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn nodes_round_trip_through_json() {
		let node = Node {
			id: 3,
			depth: 1,
			nr_regs: vec![1, 2],
			regs_to_clear: vec![0],
			kind: NodeKind::Limit {
				offset: 10,
				limit: 5,
				full_count: true,
			},
			dependencies: vec![Node {
				id: 2,
				depth: 1,
				nr_regs: vec![1, 2],
				regs_to_clear: vec![],
				kind: NodeKind::EnumerateList {
					in_reg: 0,
					out_reg: 1,
				},
				dependencies: vec![],
			}],
		};
		let encoded = serde_json::to_value(&node).unwrap();
		assert_eq!(encoded["type"], "Limit");
		assert_eq!(encoded["fullCount"], true);
		let decoded: Node = serde_json::from_value(encoded).unwrap();
		assert_eq!(decoded.width(), 2);
		assert!(matches!(decoded.kind, NodeKind::Limit { limit: 5, .. }));
	}
}
