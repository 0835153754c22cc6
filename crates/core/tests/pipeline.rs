mod common;

use common::*;
use opaldb_core::dbs::Engine;
use opaldb_core::err::Error;
use opaldb_core::kvs::{IndexDef, IndexKind, Store};
use opaldb_core::plan::{
	AggregateMode, Bound, Expression, GroupPair, NodeKind, OptionsSource, RangeCondition,
	SortKey,
};
use opaldb_core::val::Value;
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn limit_with_offset_windows_the_stream() {
	let (ctx, _) = ctx();
	let values = (0..100).collect::<Vec<i64>>();
	let list = list_plan(json!(values));
	let limit = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Limit {
			offset: 10,
			limit: 5,
			full_count: false,
		},
		vec![list],
	);
	let ret = node(
		5,
		1,
		vec![1, 4],
		NodeKind::Return {
			in_reg: 1,
		},
		vec![limit],
	);
	let mut engine = Engine::new(&ret, ctx).unwrap();
	assert_eq!(drain(&mut engine).await, vec![json!(10), json!(11), json!(12), json!(13), json!(14)]);
	// Without the flag the full count stays untracked
	assert_eq!(engine.stats().snapshot().full_count, -1);
	engine.shutdown(0).await.unwrap();
}

#[tokio::test]
async fn limit_with_full_count_drains_and_accounts() {
	let (ctx, _) = ctx();
	let values = (0..100).collect::<Vec<i64>>();
	let list = list_plan(json!(values));
	let limit = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Limit {
			offset: 10,
			limit: 5,
			full_count: true,
		},
		vec![list],
	);
	let ret = node(
		5,
		1,
		vec![1, 4],
		NodeKind::Return {
			in_reg: 1,
		},
		vec![limit],
	);
	let mut engine = Engine::new(&ret, ctx).unwrap();
	assert_eq!(drain(&mut engine).await.len(), 5);
	assert_eq!(engine.stats().snapshot().full_count, 100);
}

#[tokio::test]
async fn filter_and_sort_reorder_the_survivors() {
	let (ctx, _) = ctx();
	let ctx = ctx.with_evaluator(Arc::new(
		TestEvaluator::new()
			.with(1, |row| {
				let a = row.get(1).map(Value::to_json).unwrap_or_default();
				Ok(Value::Json(json!(a["a"] != json!(2))))
			})
			.with(2, attribute_of(1, "a")),
	));
	let list = list_plan(json!([{"a": 3}, {"a": 1}, {"a": 2}, {"a": 2}]));
	let flag = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Calculation {
			expression: Expression::Compiled {
				id: 1,
				source: String::from("row.a != 2"),
				user_code: false,
			},
			out_reg: 2,
			condition_reg: None,
		},
		vec![list],
	);
	let filter = node(
		5,
		1,
		vec![1, 4],
		NodeKind::Filter {
			in_reg: 2,
		},
		vec![flag],
	);
	let key = node(
		6,
		1,
		vec![1, 4],
		NodeKind::Calculation {
			expression: Expression::Compiled {
				id: 2,
				source: String::from("row.a"),
				user_code: false,
			},
			out_reg: 3,
			condition_reg: None,
		},
		vec![filter],
	);
	let sort = node(
		7,
		1,
		vec![1, 4],
		NodeKind::Sort {
			keys: vec![SortKey::asc(3)],
			stable: false,
		},
		vec![key],
	);
	let ret = node(
		8,
		1,
		vec![1, 4],
		NodeKind::Return {
			in_reg: 1,
		},
		vec![sort],
	);
	let mut engine = Engine::new(&ret, ctx).unwrap();
	assert_eq!(drain(&mut engine).await, vec![json!({"a": 1}), json!({"a": 3})]);
	assert_eq!(engine.stats().snapshot().filtered, 2);
}

#[tokio::test]
async fn aggregate_counts_adjacent_groups() {
	let (ctx, _) = ctx();
	let ctx = ctx.with_evaluator(Arc::new(TestEvaluator::new().with(1, |row| {
		let v = row.get(1).map(Value::to_json).unwrap_or_default();
		Ok(Value::Json(json!(v.as_i64().unwrap() % 3)))
	})));
	let values = (0..100).collect::<Vec<i64>>();
	let list = list_plan(json!(values));
	let group_key = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Calculation {
			expression: Expression::Compiled {
				id: 1,
				source: String::from("value % 3"),
				user_code: false,
			},
			out_reg: 2,
			condition_reg: None,
		},
		vec![list],
	);
	let sort = node(
		5,
		1,
		vec![1, 4],
		NodeKind::Sort {
			keys: vec![SortKey::asc(2)],
			stable: false,
		},
		vec![group_key],
	);
	let aggregate = node(
		6,
		1,
		vec![1, 4],
		NodeKind::Aggregate {
			groups: vec![GroupPair {
				in_reg: 2,
				out_reg: 3,
			}],
			out_reg: Some(1),
			mode: AggregateMode::Count,
		},
		vec![sort],
	);
	let mut engine = Engine::new(&aggregate, ctx).unwrap();
	let mut groups = Vec::new();
	let mut total = 0;
	for block in drain_blocks(&mut engine).await {
		for row in 0..block.rows() {
			let g = block.get(row, 3).map(Value::to_json).unwrap();
			let n = block.get(row, 1).map(Value::to_json).unwrap();
			total += n.as_i64().unwrap();
			groups.push((g, n));
		}
	}
	assert_eq!(
		groups,
		vec![
			(json!(0), json!(34)),
			(json!(1), json!(33)),
			(json!(2), json!(33)),
		]
	);
	// The group lengths add up to the input row count
	assert_eq!(total, 100);
}

#[tokio::test]
async fn total_aggregation_emits_one_row_for_empty_input() {
	let (ctx, _) = ctx();
	let list = list_plan(json!([]));
	let aggregate = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Aggregate {
			groups: vec![],
			out_reg: Some(1),
			mode: AggregateMode::Count,
		},
		vec![list],
	);
	let mut engine = Engine::new(&aggregate, ctx).unwrap();
	let blocks = drain_blocks(&mut engine).await;
	assert_eq!(blocks.len(), 1);
	assert_eq!(blocks[0].rows(), 1);
	assert_eq!(blocks[0].get(0, 1).map(Value::to_json), Some(json!(0)));
}

#[tokio::test]
async fn remove_with_ignore_errors_empties_the_collection() {
	let (ctx, store, col) = ctx_with_docs("c", 100);
	let keys: Vec<String> = (0..=100).map(|i| format!("test{i}")).collect();
	let list = list_plan(json!(keys));
	let remove = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Remove {
			collection: String::from("c"),
			in_reg: 1,
			options: OptionsSource::Constant(json!({"ignoreErrors": true})),
			out_reg: None,
		},
		vec![list],
	);
	let mut engine = Engine::new(&remove, ctx).unwrap();
	drain_blocks(&mut engine).await;
	assert!(store.is_empty(&col));
	let stats = engine.stats().snapshot();
	assert_eq!(stats.writes_executed, 100);
	assert_eq!(stats.writes_ignored, 1);
}

#[tokio::test]
async fn remove_without_ignore_errors_aborts_on_first_missing() {
	let (ctx, store, col) = ctx_with_docs("c", 2);
	let list = list_plan(json!(["test0", "missing", "test1"]));
	let remove = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Remove {
			collection: String::from("c"),
			in_reg: 1,
			options: OptionsSource::None,
			out_reg: None,
		},
		vec![list],
	);
	let mut engine = Engine::new(&remove, ctx).unwrap();
	let mut err = None;
	loop {
		match engine.get_some(1, 1000, None).await {
			Ok(Some(_)) => continue,
			Ok(None) => break,
			Err(e) => {
				err = Some(e);
				break;
			}
		}
	}
	assert!(matches!(err, Some(Error::DocumentNotFound { .. })));
	// test1 must still be there, the batch aborted at the missing key
	assert_eq!(store.len(&col), 1);
}

#[tokio::test]
async fn insert_disjoint_keys_executes_all() {
	let (ctx, store, col) = ctx_with_docs("c", 50);
	let docs: Vec<_> = (50..=100).map(|i| json!({"_key": format!("test{i}")})).collect();
	let list = list_plan(json!(docs));
	let insert = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Insert {
			collection: String::from("c"),
			in_reg: 1,
			options: OptionsSource::Constant(json!({"ignoreErrors": true})),
			out_reg: None,
		},
		vec![list],
	);
	let mut engine = Engine::new(&insert, ctx).unwrap();
	drain_blocks(&mut engine).await;
	assert_eq!(store.len(&col), 101);
	let stats = engine.stats().snapshot();
	assert_eq!(stats.writes_executed, 51);
	assert_eq!(stats.writes_ignored, 0);
}

#[tokio::test]
async fn insert_colliding_keys_ignores_all() {
	let (ctx, store, col) = ctx_with_docs("c", 100);
	let docs: Vec<_> = (0..100).map(|i| json!({"_key": format!("test{i}")})).collect();
	let list = list_plan(json!(docs));
	let insert = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Insert {
			collection: String::from("c"),
			in_reg: 1,
			options: OptionsSource::Constant(json!({"ignoreErrors": true})),
			out_reg: None,
		},
		vec![list],
	);
	let mut engine = Engine::new(&insert, ctx).unwrap();
	drain_blocks(&mut engine).await;
	assert_eq!(store.len(&col), 100);
	let stats = engine.stats().snapshot();
	assert_eq!(stats.writes_executed, 0);
	assert_eq!(stats.writes_ignored, 100);
}

#[tokio::test]
async fn update_returns_the_requested_image() {
	let (ctx, store, col) = ctx_with_docs("c", 1);
	let list = list_plan(json!([{"_key": "test0", "value": 99}]));
	let update = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Update {
			collection: String::from("c"),
			in_reg: 1,
			key_reg: None,
			options: OptionsSource::Constant(json!({"returnNewValues": true})),
			out_reg: Some(2),
		},
		vec![list],
	);
	let ret = node(
		5,
		1,
		vec![1, 4],
		NodeKind::Return {
			in_reg: 2,
		},
		vec![update],
	);
	let mut engine = Engine::new(&ret, ctx).unwrap();
	let out = drain(&mut engine).await;
	assert_eq!(out.len(), 1);
	assert_eq!(out[0]["value"], json!(99));
	let stored = store.primary_lookup(&col, "test0").unwrap().unwrap();
	assert_eq!(stored.as_json()["value"], json!(99));
}

#[tokio::test]
async fn subquery_materializes_a_docvec_per_row() {
	let (ctx, _) = ctx();
	let inner_list = list_plan(json!([10, 20]));
	let inner = node(
		10,
		1,
		vec![1, 4],
		NodeKind::Return {
			in_reg: 1,
		},
		vec![inner_list],
	);
	let outer_list = list_plan(json!([1, 2, 3]));
	let subquery = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Subquery {
			subquery: Box::new(inner),
			out_reg: 2,
			constant: false,
		},
		vec![outer_list],
	);
	let ret = node(
		5,
		1,
		vec![1, 4],
		NodeKind::Return {
			in_reg: 2,
		},
		vec![subquery],
	);
	let mut engine = Engine::new(&ret, ctx).unwrap();
	let out = drain(&mut engine).await;
	assert_eq!(out, vec![json!([10, 20]), json!([10, 20]), json!([10, 20])]);
}

#[tokio::test]
async fn enumerate_list_rejects_non_arrays() {
	let (ctx, _) = ctx();
	let list = list_plan(json!([1]));
	// Expanding the scalar element again must fail
	let inner = node(
		4,
		2,
		vec![1, 4, 5],
		NodeKind::EnumerateList {
			in_reg: 1,
			out_reg: 2,
		},
		vec![list],
	);
	let mut engine = Engine::new(&inner, ctx).unwrap();
	let err = engine.get_some(1, 100, None).await.unwrap_err();
	assert!(matches!(err, Error::ArrayExpected { .. }));
}

#[tokio::test]
async fn index_range_primary_and_skiplist() {
	let (ctx, _, _) = ctx_with_docs("c", 10);
	// Primary lookup by key
	let singleton = node(1, 0, vec![0], NodeKind::Singleton, vec![]);
	let primary = node(
		2,
		1,
		vec![0, 1],
		NodeKind::IndexRange {
			collection: String::from("c"),
			index: IndexDef {
				name: String::from("primary"),
				kind: IndexKind::Primary,
				fields: vec![String::from("_key")],
			},
			ranges: vec![vec![RangeCondition::equality("_key", json!("test7"))]],
			out_reg: 0,
			reverse: false,
		},
		vec![singleton],
	);
	let mut engine = Engine::new(&primary, ctx.clone()).unwrap();
	let out = drain_reg(&mut engine, 0).await;
	assert_eq!(out.len(), 1);
	assert_eq!(out[0]["value"], json!(7));
	assert_eq!(engine.stats().snapshot().scanned_index, 1);

	// A non-string key equality yields no rows
	let singleton = node(1, 0, vec![0], NodeKind::Singleton, vec![]);
	let empty = node(
		2,
		1,
		vec![0, 1],
		NodeKind::IndexRange {
			collection: String::from("c"),
			index: IndexDef {
				name: String::from("primary"),
				kind: IndexKind::Primary,
				fields: vec![String::from("_key")],
			},
			ranges: vec![vec![RangeCondition::equality("_key", json!(7))]],
			out_reg: 0,
			reverse: false,
		},
		vec![singleton],
	);
	let mut engine = Engine::new(&empty, ctx.clone()).unwrap();
	assert!(drain_reg(&mut engine, 0).await.is_empty());

	// A skiplist range over two disjuncts, ordered by the leading bound
	let singleton = node(1, 0, vec![0], NodeKind::Singleton, vec![]);
	let skiplist = node(
		2,
		1,
		vec![0, 1],
		NodeKind::IndexRange {
			collection: String::from("c"),
			index: IndexDef {
				name: String::from("values"),
				kind: IndexKind::Skiplist,
				fields: vec![String::from("value")],
			},
			ranges: vec![
				vec![RangeCondition {
					attribute: String::from("value"),
					lows: vec![Bound::constant(json!(7), true)],
					highs: vec![],
				}],
				vec![RangeCondition {
					attribute: String::from("value"),
					lows: vec![],
					highs: vec![Bound::constant(json!(2), false)],
				}],
			],
			out_reg: 0,
			reverse: false,
		},
		vec![singleton],
	);
	let mut engine = Engine::new(&skiplist, ctx).unwrap();
	let out: Vec<_> =
		drain_reg(&mut engine, 0).await.iter().map(|d| d["value"].clone()).collect();
	assert_eq!(out, vec![json!(0), json!(1), json!(7), json!(8), json!(9)]);
}

#[tokio::test]
async fn skip_some_is_get_some_minus_the_prefix() {
	let (ctx, _) = ctx();
	let values = (0..20).collect::<Vec<i64>>();
	let plan = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Return {
			in_reg: 1,
		},
		vec![list_plan(json!(values))],
	);
	let mut full = Engine::new(&plan, ctx.clone()).unwrap();
	let all = drain(&mut full).await;
	let mut skipped = Engine::new(&plan, ctx).unwrap();
	assert_eq!(skipped.skip_some(7, 7, None).await.unwrap(), 7);
	assert_eq!(drain(&mut skipped).await, all[7..]);
}

#[tokio::test]
async fn initialize_cursor_reproduces_the_stream() {
	let (ctx, _) = ctx();
	let plan = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Return {
			in_reg: 1,
		},
		vec![list_plan(json!([5, 6, 7]))],
	);
	let mut engine = Engine::new(&plan, ctx).unwrap();
	let first = drain(&mut engine).await;
	engine.initialize_cursor(None).await.unwrap();
	let second = drain(&mut engine).await;
	assert_eq!(first, second);
}

#[tokio::test]
async fn get_some_respects_the_batch_window() {
	let (ctx, _) = ctx();
	let values = (0..25).collect::<Vec<i64>>();
	let plan = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Return {
			in_reg: 1,
		},
		vec![list_plan(json!(values))],
	);
	let mut engine = Engine::new(&plan, ctx).unwrap();
	let mut total = 0;
	while let Some(block) = engine.get_some(1, 7, None).await.unwrap() {
		assert!(block.rows() >= 1 && block.rows() <= 7);
		total += block.rows();
	}
	assert_eq!(total, 25);
	assert!(!engine.has_more(None).await.unwrap());
}

#[tokio::test]
async fn killed_queries_stop_at_the_next_row() {
	let (ctx, _) = ctx();
	let plan = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Return {
			in_reg: 1,
		},
		vec![list_plan(json!([1, 2, 3]))],
	);
	let mut engine = Engine::new(&plan, ctx).unwrap();
	engine.canceller().cancel();
	let err = engine.get_some(1, 10, None).await.unwrap_err();
	assert!(matches!(err, Error::QueryKilled));
}

#[tokio::test]
async fn structural_plan_violations_surface_before_execution() {
	let (ctx, _, _) = ctx_with_docs("c", 1);
	let modify = |id| {
		node(
			id,
			1,
			vec![1, 4],
			NodeKind::Remove {
				collection: String::from("c"),
				in_reg: 1,
				options: OptionsSource::None,
				out_reg: None,
			},
			vec![list_plan(json!(["test0"]))],
		)
	};
	// Two data-modification nodes in one plan
	let double = node(
		20,
		1,
		vec![1, 4],
		NodeKind::Insert {
			collection: String::from("c"),
			in_reg: 1,
			options: OptionsSource::None,
			out_reg: None,
		},
		vec![modify(10)],
	);
	assert!(matches!(Engine::new(&double, ctx.clone()), Err(Error::Parse { .. })));
	// A modification inside a subquery
	let subquery = node(
		21,
		1,
		vec![1, 4],
		NodeKind::Subquery {
			subquery: Box::new(modify(10)),
			out_reg: 2,
			constant: false,
		},
		vec![list_plan(json!([1]))],
	);
	assert!(matches!(Engine::new(&subquery, ctx.clone()), Err(Error::ModifyInSubquery)));
	// Options which are not compile-time constant
	let dynamic = node(
		22,
		1,
		vec![1, 4],
		NodeKind::Remove {
			collection: String::from("c"),
			in_reg: 1,
			options: OptionsSource::Dynamic,
			out_reg: None,
		},
		vec![list_plan(json!(["test0"]))],
	);
	assert!(matches!(Engine::new(&dynamic, ctx), Err(Error::CompileTimeOptions)));
}

#[tokio::test]
async fn sorted_output_is_ordered_and_stable() {
	let (ctx, _) = ctx();
	let ctx = ctx.with_evaluator(Arc::new(TestEvaluator::new().with(1, attribute_of(1, "k"))));
	let docs = json!([
		{"k": 2, "tag": "first"},
		{"k": 1, "tag": "a"},
		{"k": 2, "tag": "second"},
		{"k": 0, "tag": "b"},
	]);
	let key = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Calculation {
			expression: Expression::Compiled {
				id: 1,
				source: String::from("row.k"),
				user_code: false,
			},
			out_reg: 2,
			condition_reg: None,
		},
		vec![list_plan(docs)],
	);
	let sort = node(
		5,
		1,
		vec![1, 4],
		NodeKind::Sort {
			keys: vec![SortKey::asc(2)],
			stable: true,
		},
		vec![key],
	);
	let ret = node(
		6,
		1,
		vec![1, 4],
		NodeKind::Return {
			in_reg: 1,
		},
		vec![sort],
	);
	let mut engine = Engine::new(&ret, ctx).unwrap();
	let out = drain(&mut engine).await;
	let keys: Vec<_> = out.iter().map(|d| d["k"].clone()).collect();
	assert_eq!(keys, vec![json!(0), json!(1), json!(2), json!(2)]);
	// Stable sorting preserves the relative order of equal keys
	assert_eq!(out[2]["tag"], json!("first"));
	assert_eq!(out[3]["tag"], json!("second"));
}
