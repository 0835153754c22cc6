#![allow(dead_code)]

use opaldb_core::cluster::{ClusterInfo, ShardId};
use opaldb_core::ctx::Context;
use opaldb_core::dbs::{Block, Engine, RegisterId, Row};
use opaldb_core::err::Error;
use opaldb_core::kvs::{Collection, CollectionKind, MemoryStore, Store};
use opaldb_core::plan::{Evaluator, Expression, Node, NodeKind};
use opaldb_core::val::{Json, Value};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Build a plan node without the ceremony.
pub fn node(id: u32, depth: usize, nr_regs: Vec<usize>, kind: NodeKind, deps: Vec<Node>) -> Node {
	Node {
		id,
		depth,
		nr_regs,
		regs_to_clear: vec![],
		kind,
		dependencies: deps,
	}
}

/// A plan which enumerates the elements of a constant array into register
/// 1: Singleton -> Calculation(const) -> EnumerateList.
pub fn list_plan(values: Json) -> Node {
	let singleton = node(1, 0, vec![1], NodeKind::Singleton, vec![]);
	let constant = node(
		2,
		0,
		vec![1],
		NodeKind::Calculation {
			expression: Expression::Constant {
				value: values,
			},
			out_reg: 0,
			condition_reg: None,
		},
		vec![singleton],
	);
	node(
		3,
		1,
		vec![1, 4],
		NodeKind::EnumerateList {
			in_reg: 0,
			out_reg: 1,
		},
		vec![constant],
	)
}

/// A programmable expression evaluator keyed by compiled-expression id.
#[derive(Default)]
pub struct TestEvaluator {
	#[allow(clippy::type_complexity)]
	funcs: HashMap<u32, Box<dyn for<'a> Fn(Row<'a>) -> Result<Value, Error> + Send + Sync>>,
}

impl TestEvaluator {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn with<F>(mut self, id: u32, f: F) -> Self
	where
		F: for<'a> Fn(Row<'a>) -> Result<Value, Error> + Send + Sync + 'static,
	{
		self.funcs.insert(id, Box::new(f));
		self
	}
}

impl Evaluator for TestEvaluator {
	fn evaluate(&self, id: u32, row: Row<'_>) -> Result<Value, Error> {
		match self.funcs.get(&id) {
			Some(f) => f(row),
			None => Err(Error::Internal {
				message: format!("No test expression with id {id}"),
			}),
		}
	}
}

/// A compiled expression reading an attribute of the document in a
/// register.
pub fn attribute_of(reg: RegisterId, attribute: &'static str) -> impl for<'a> Fn(Row<'a>) -> Result<Value, Error> + Send + Sync
{
	move |row: Row<'_>| {
		let value = row.get(reg).map(Value::to_json).unwrap_or(Json::Null);
		Ok(Value::Json(value.get(attribute).cloned().unwrap_or(Json::Null)))
	}
}

/// A shard map routing each candidate document by one shard-key
/// attribute.
pub struct TestCluster {
	pub shard_key: String,
	pub shards: HashMap<String, ShardId>,
	pub default_sharding: bool,
}

impl TestCluster {
	pub fn by_key(shard_key: &str, shards: &[(&str, &str)]) -> Self {
		Self {
			shard_key: shard_key.to_owned(),
			shards: shards.iter().map(|(k, s)| (k.to_string(), s.to_string())).collect(),
			default_sharding: false,
		}
	}
}

impl ClusterInfo for TestCluster {
	fn responsible_shard(
		&self,
		_collection: &Collection,
		document: &Json,
	) -> Result<ShardId, Error> {
		let key = document.get(&self.shard_key).and_then(Json::as_str).unwrap_or_default();
		self.shards.get(key).cloned().ok_or_else(|| Error::Internal {
			message: format!("No shard for key '{key}'"),
		})
	}

	fn uses_default_sharding(&self, _collection: &Collection) -> bool {
		self.default_sharding
	}
}

/// A fresh context over an empty in-memory store.
pub fn ctx() -> (Context, Arc<MemoryStore>) {
	let store = Arc::new(MemoryStore::new());
	(Context::new("test", store.clone()), store)
}

/// A context plus a collection pre-filled with documents keyed
/// `test0..testN`.
pub fn ctx_with_docs(collection: &str, n: usize) -> (Context, Arc<MemoryStore>, Arc<Collection>) {
	let store = Arc::new(MemoryStore::new());
	let col = store.create_collection(collection, CollectionKind::Document);
	for i in 0..n {
		store
			.insert(&col, json!({ "_key": format!("test{i}"), "value": i }), false)
			.unwrap();
	}
	(Context::new("test", store.clone()), store, col)
}

/// Drain the engine, materializing column 0 of every result row.
pub async fn drain(engine: &mut Engine) -> Vec<Json> {
	drain_reg(engine, 0).await
}

/// Drain the engine, materializing one column of every result row.
pub async fn drain_reg(engine: &mut Engine, reg: RegisterId) -> Vec<Json> {
	let mut out = Vec::new();
	while let Some(block) = engine.get_some(1, 1000, None).await.unwrap() {
		for row in 0..block.rows() {
			out.push(block.get(row, reg).map(Value::to_json).unwrap_or(Json::Null));
		}
	}
	out
}

/// Drain the engine, collecting the raw result blocks.
pub async fn drain_blocks(engine: &mut Engine) -> Vec<Block> {
	let mut out = Vec::new();
	while let Some(block) = engine.get_some(1, 1000, None).await.unwrap() {
		out.push(block);
	}
	out
}
