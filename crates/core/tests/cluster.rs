mod common;

use common::*;
use futures::future::BoxFuture;
use opaldb_core::cluster::{parse_path, serve, PeerRequest, Transport};
use opaldb_core::ctx::Context;
use opaldb_core::dbs::Engine;
use opaldb_core::err::Error;
use opaldb_core::kvs::{CollectionKind, MemoryStore};
use opaldb_core::plan::{NodeKind, SortKey};
use opaldb_core::val::{Json, Value};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

fn shard(s: &str) -> String {
	s.to_owned()
}

fn distribute_plan(docs: Json, create_keys: bool) -> opaldb_core::plan::Node {
	node(
		4,
		1,
		vec![1, 4],
		NodeKind::Distribute {
			collection: String::from("c"),
			clients: vec![shard("s1"), shard("s2"), shard("s3")],
			in_reg: 1,
			create_keys,
		},
		vec![list_plan(docs)],
	)
}

async fn drain_shard(engine: &mut Engine, shard: &str) -> Vec<Json> {
	let shard = shard.to_owned();
	let mut out = Vec::new();
	while let Some(block) = engine.get_some(1, 1000, Some(&shard)).await.unwrap() {
		for row in 0..block.rows() {
			out.push(block.get(row, 1).map(Value::to_json).unwrap_or(Json::Null));
		}
	}
	out
}

#[tokio::test]
async fn distribute_partitions_by_shard_key() {
	let store = Arc::new(MemoryStore::new());
	store.create_collection("c", CollectionKind::Document);
	let cluster = TestCluster::by_key("sk", &[("a", "s1"), ("b", "s2"), ("c", "s3")]);
	let ctx = Context::new("test", store).with_cluster(Arc::new(cluster));
	let docs = json!([
		{"sk": "a", "n": 0}, {"sk": "b", "n": 1}, {"sk": "a", "n": 2},
		{"sk": "c", "n": 3}, {"sk": "b", "n": 4}, {"sk": "a", "n": 5},
	]);
	let mut engine = Engine::new(&distribute_plan(docs, false), ctx).unwrap();
	let s1 = drain_shard(&mut engine, "s1").await;
	let s2 = drain_shard(&mut engine, "s2").await;
	let s3 = drain_shard(&mut engine, "s3").await;
	// Each row lands on exactly one shard, in upstream order
	let ns = |rows: &[Json]| rows.iter().map(|d| d["n"].as_i64().unwrap()).collect::<Vec<_>>();
	assert_eq!(ns(&s1), vec![0, 2, 5]);
	assert_eq!(ns(&s2), vec![1, 4]);
	assert_eq!(ns(&s3), vec![3]);
	assert!(!engine.has_more(Some(&shard("s1"))).await.unwrap());
}

#[tokio::test]
async fn distribute_generates_keys_under_default_sharding() {
	let store = Arc::new(MemoryStore::new());
	store.create_collection("c", CollectionKind::Document);
	let mut cluster = TestCluster::by_key("sk", &[("a", "s1"), ("b", "s2"), ("c", "s3")]);
	cluster.default_sharding = true;
	let ctx = Context::new("test", store).with_cluster(Arc::new(cluster));
	let docs = json!([{"sk": "a"}, {"sk": "b"}]);
	let mut engine = Engine::new(&distribute_plan(docs, true), ctx).unwrap();
	let s1 = drain_shard(&mut engine, "s1").await;
	assert_eq!(s1.len(), 1);
	// The routed row was tagged with the generated key
	assert!(s1[0]["_key"].is_string());
}

#[tokio::test]
async fn distribute_forbids_caller_keys_without_default_sharding() {
	let store = Arc::new(MemoryStore::new());
	store.create_collection("c", CollectionKind::Document);
	let cluster = TestCluster::by_key("sk", &[("a", "s1"), ("b", "s2"), ("c", "s3")]);
	let ctx = Context::new("test", store).with_cluster(Arc::new(cluster));
	let docs = json!([{"sk": "a", "_key": "mine"}]);
	let mut engine = Engine::new(&distribute_plan(docs, false), ctx).unwrap();
	let err = engine.get_some(1, 10, Some(&shard("s1"))).await.unwrap_err();
	assert!(matches!(err, Error::MustNotSpecifyKey));
}

#[tokio::test]
async fn scatter_replicates_to_every_client() {
	let store = Arc::new(MemoryStore::new());
	let ctx = Context::new("test", store);
	let plan = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Scatter {
			clients: vec![shard("s1"), shard("s2")],
		},
		vec![list_plan(json!([1, 2, 3]))],
	);
	let mut engine = Engine::new(&plan, ctx).unwrap();
	// Interleave the clients to exercise the shared buffer bookkeeping
	let a1 = engine.get_some(1, 2, Some(&shard("s1"))).await.unwrap().unwrap();
	assert_eq!(a1.rows(), 2);
	let b1 = drain_shard(&mut engine, "s2").await;
	let mut a = Vec::new();
	for row in 0..a1.rows() {
		a.push(a1.get(row, 1).unwrap().to_json());
	}
	a.extend(drain_shard(&mut engine, "s1").await.iter().cloned());
	assert_eq!(a, vec![json!(1), json!(2), json!(3)]);
	assert_eq!(b1, vec![json!(1), json!(2), json!(3)]);
}

#[tokio::test]
async fn gather_merges_sorted_client_streams() {
	let store = Arc::new(MemoryStore::new());
	let ctx = Context::new("test", store);
	// Three already-sorted per-shard streams, as distribute would deliver
	let clients = vec![
		list_plan(json!(["a", "a", "a"])),
		list_plan(json!(["b", "b"])),
		list_plan(json!(["c"])),
	];
	let gather = node(
		9,
		1,
		vec![1, 4],
		NodeKind::Gather {
			sort_keys: vec![SortKey::asc(1)],
		},
		clients,
	);
	let mut engine = Engine::new(&gather, ctx).unwrap();
	let mut out = Vec::new();
	while let Some(block) = engine.get_some(1, 4, None).await.unwrap() {
		assert!(block.rows() >= 1 && block.rows() <= 4);
		for row in 0..block.rows() {
			out.push(block.get(row, 1).unwrap().to_json());
		}
	}
	assert_eq!(out, vec![json!("a"), json!("a"), json!("a"), json!("b"), json!("b"), json!("c")]);
}

#[tokio::test]
async fn gather_without_sort_keys_drains_clients_in_order() {
	let store = Arc::new(MemoryStore::new());
	let ctx = Context::new("test", store);
	let clients = vec![list_plan(json!([1, 2])), list_plan(json!([3]))];
	let gather = node(
		9,
		1,
		vec![1, 4],
		NodeKind::Gather {
			sort_keys: vec![],
		},
		clients,
	);
	let mut engine = Engine::new(&gather, ctx).unwrap();
	let mut out = Vec::new();
	while let Some(block) = engine.get_some(1, 1000, None).await.unwrap() {
		for row in 0..block.rows() {
			out.push(block.get(row, 1).unwrap().to_json());
		}
	}
	assert_eq!(out, vec![json!(1), json!(2), json!(3)]);
}

/// A transport which answers operator calls from in-process peer engines,
/// exactly as the peer-side dispatch would over HTTP.
struct LocalTransport {
	peers: tokio::sync::Mutex<HashMap<String, Engine>>,
}

impl LocalTransport {
	fn new(peers: HashMap<String, Engine>) -> Self {
		Self {
			peers: tokio::sync::Mutex::new(peers),
		}
	}
}

impl Transport for LocalTransport {
	fn send<'a>(
		&'a self,
		_server: &'a str,
		request: PeerRequest,
	) -> BoxFuture<'a, Result<Json, Error>> {
		Box::pin(async move {
			let (op, id) = parse_path(&request.path)?;
			let mut peers = self.peers.lock().await;
			let engine = peers.get_mut(&id).ok_or(Error::QueryNotFound)?;
			Ok(serve(engine, op, request.shard.as_ref(), request.body.as_ref()).await)
		})
	}
}

fn remote_plan(query_id: &str) -> opaldb_core::plan::Node {
	node(
		1,
		0,
		vec![1],
		NodeKind::Remote {
			server: String::from("db1"),
			own_name: String::new(),
			query_id: query_id.to_owned(),
		},
		vec![],
	)
}

#[tokio::test]
async fn remote_tunnels_the_pull_protocol() {
	// The peer runs a full local pipeline with full-count accounting
	let (peer_ctx, _) = ctx();
	let limit = node(
		4,
		1,
		vec![1, 4],
		NodeKind::Limit {
			offset: 0,
			limit: 100,
			full_count: true,
		},
		vec![list_plan(json!([1, 2, 3, 4, 5]))],
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
	let peer = Engine::new(&ret, peer_ctx).unwrap();
	peer.warnings().push(1400, String::from("approximation used"));
	let transport = LocalTransport::new(HashMap::from([(String::from("q1"), peer)]));

	let (ctx, _) = ctx();
	let ctx = ctx.with_transport(Arc::new(transport));
	let mut engine = Engine::new(&remote_plan("q1"), ctx).unwrap();
	assert_eq!(drain(&mut engine).await, vec![json!(1), json!(2), json!(3), json!(4), json!(5)]);
	// The peer's statistics deltas were folded into the local counters
	assert_eq!(engine.stats().snapshot().full_count, 5);
	// The peer's warnings were forwarded into the local query
	let warnings = engine.warnings().snapshot();
	assert_eq!(warnings.len(), 1);
	assert_eq!(warnings[0].code, 1400);
	assert!(!engine.has_more(None).await.unwrap());
	engine.shutdown(0).await.unwrap();
}

#[tokio::test]
async fn remote_shutdown_tolerates_unknown_queries() {
	let transport = LocalTransport::new(HashMap::new());
	let (ctx, _) = ctx();
	let ctx = ctx.with_transport(Arc::new(transport));
	let mut engine = Engine::new(&remote_plan("gone"), ctx).unwrap();
	// The peer never heard of the query; shutdown still succeeds
	engine.shutdown(0).await.unwrap();
}

#[cfg(feature = "http")]
mod http {
	use super::*;
	use opaldb_core::cluster::HttpTransport;
	use url::Url;
	use wiremock::matchers::{header, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	async fn transport_for(server: &MockServer) -> HttpTransport {
		HttpTransport::new()
			.with_endpoint("db1", Url::parse(&server.uri()).unwrap())
	}

	#[tokio::test]
	async fn http_transport_round_trips_operator_calls() {
		let server = MockServer::start().await;
		Mock::given(method("PUT"))
			.and(path("/_db/test/_api/aql/initializeCursor/q9"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"error": false})))
			.mount(&server)
			.await;
		Mock::given(method("PUT"))
			.and(path("/_db/test/_api/aql/getSome/q9"))
			.and(header("Shard-Id", "shard7"))
			.respond_with(
				ResponseTemplate::new(200)
					.set_body_json(json!({"error": false, "exhausted": true})),
			)
			.mount(&server)
			.await;

		let (ctx, _) = ctx();
		let ctx = ctx.with_transport(Arc::new(transport_for(&server).await));
		let plan = node(
			1,
			0,
			vec![1],
			NodeKind::Remote {
				server: String::from("db1"),
				own_name: String::from("shard7"),
				query_id: String::from("q9"),
			},
			vec![],
		);
		let mut engine = Engine::new(&plan, ctx).unwrap();
		assert!(engine.get_some(1, 100, None).await.unwrap().is_none());
	}

	#[tokio::test]
	async fn http_transport_rethrows_structured_peer_errors() {
		let server = MockServer::start().await;
		Mock::given(method("PUT"))
			.and(path("/_db/test/_api/aql/initializeCursor/q9"))
			.respond_with(ResponseTemplate::new(500).set_body_json(json!({
				"error": true,
				"errorNum": 1500,
				"errorMessage": "query killed",
			})))
			.mount(&server)
			.await;

		let (ctx, _) = ctx();
		let ctx = ctx.with_transport(Arc::new(transport_for(&server).await));
		let mut engine = Engine::new(&remote_plan("q9"), ctx).unwrap();
		let err = engine.get_some(1, 100, None).await.unwrap_err();
		assert!(matches!(err, Error::QueryKilled));
	}
}
