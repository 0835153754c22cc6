use crate::cluster::ShardId;
use crate::dbs::{Block, Engine, Statistics, Warning};
use crate::err::Error;
use crate::val::{Json, Range, Value};
use serde::{Deserialize, Serialize};

/// The operator calls a peer exposes under its database prefix.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OpKind {
	GetSome,
	SkipSome,
	InitializeCursor,
	Shutdown,
	HasMore,
	Count,
	Remaining,
}

impl OpKind {
	pub fn path_segment(&self) -> &'static str {
		match self {
			Self::GetSome => "getSome",
			Self::SkipSome => "skipSome",
			Self::InitializeCursor => "initializeCursor",
			Self::Shutdown => "shutdown",
			Self::HasMore => "hasMore",
			Self::Count => "count",
			Self::Remaining => "remaining",
		}
	}
}

/// Parse an operator call path of the form `…/aql/<op>/<queryId>`.
pub fn parse_path(path: &str) -> Result<(OpKind, String), Error> {
	let mut segments = path.split('/').filter(|s| !s.is_empty());
	while let Some(segment) = segments.next() {
		if segment != "aql" {
			continue;
		}
		let op = match segments.next() {
			Some("getSome") => OpKind::GetSome,
			Some("skipSome") => OpKind::SkipSome,
			Some("initializeCursor") => OpKind::InitializeCursor,
			Some("shutdown") => OpKind::Shutdown,
			Some("hasMore") => OpKind::HasMore,
			Some("count") => OpKind::Count,
			Some("remaining") => OpKind::Remaining,
			_ => break,
		};
		if let Some(id) = segments.next() {
			return Ok((op, id.to_owned()));
		}
		break;
	}
	Err(Error::ClusterCommunication {
		message: format!("Unrecognized operator call path '{path}'"),
	})
}

/// One cell of a block crossing the wire. Intra-block sharing is dropped
/// and shaped values are materialized; the protocol is JSON by contract.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum WireValue {
	Json(Json),
	Range {
		low: i64,
		high: i64,
	},
	Docvec(Vec<WireBlock>),
}

/// The JSON-serializable mirror of a [`Block`].
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireBlock {
	pub rows: usize,
	pub nr_regs: usize,
	/// Row-major cells; `null` encodes an absent value
	pub data: Vec<Option<WireValue>>,
}

impl WireBlock {
	pub fn from_block(block: &Block) -> Self {
		let mut data = Vec::with_capacity(block.rows() * block.regs());
		for row in 0..block.rows() {
			for reg in 0..block.regs() {
				data.push(block.get(row, reg).map(WireValue::from_value));
			}
		}
		Self {
			rows: block.rows(),
			nr_regs: block.regs(),
			data,
		}
	}

	pub fn into_block(self) -> Block {
		let mut block = Block::new(self.rows, self.nr_regs);
		let mut cells = self.data.into_iter();
		for row in 0..block.rows() {
			for reg in 0..block.regs() {
				if let Some(Some(wire)) = cells.next() {
					block.set(row, reg, wire.into_value());
				}
			}
		}
		block
	}
}

impl WireValue {
	fn from_value(value: &Value) -> Self {
		match value {
			Value::None => WireValue::Json(Json::Null),
			Value::Json(v) => WireValue::Json(v.clone()),
			Value::Shaped(d) => WireValue::Json(d.to_json()),
			Value::Range(r) => WireValue::Range {
				low: r.low,
				high: r.high,
			},
			Value::Docvec(blocks) => {
				WireValue::Docvec(blocks.iter().map(WireBlock::from_block).collect())
			}
		}
	}

	fn into_value(self) -> Value {
		match self {
			WireValue::Json(v) => Value::Json(v),
			WireValue::Range {
				low,
				high,
			} => Value::Range(Range::new(low, high)),
			WireValue::Docvec(blocks) => {
				Value::Docvec(blocks.into_iter().map(WireBlock::into_block).collect())
			}
		}
	}
}

/// Check a peer response body for an embedded error, rethrowing it with
/// the peer's error number.
pub fn check_envelope(body: &Json) -> Result<(), Error> {
	if body.get("error").and_then(Json::as_bool).unwrap_or(false) {
		let code = body.get("errorNum").and_then(Json::as_i64).unwrap_or(1000);
		let message =
			body.get("errorMessage").and_then(Json::as_str).unwrap_or_default().to_owned();
		return Err(Error::from_code(code, message));
	}
	Ok(())
}

/// Pull the statistics delta and forwarded warnings out of a peer
/// response body.
pub fn unpack_envelope(body: &Json) -> (Option<Statistics>, Vec<Warning>) {
	let stats = body.get("stats").and_then(|v| serde_json::from_value(v.clone()).ok());
	let warnings = body
		.get("warnings")
		.and_then(|v| serde_json::from_value(v.clone()).ok())
		.unwrap_or_default();
	(stats, warnings)
}

fn error_body(err: &Error) -> Json {
	serde_json::json!({
		"error": true,
		"errorNum": err.code(),
		"errorMessage": err.to_string(),
	})
}

fn ok_body(mut extra: serde_json::Map<String, Json>, engine: &mut Engine) -> Json {
	extra.insert("error".to_owned(), Json::Bool(false));
	let delta = engine.take_stats_delta();
	extra.insert("stats".to_owned(), serde_json::to_value(delta).unwrap_or(Json::Null));
	let warnings = engine.warnings().drain();
	extra.insert("warnings".to_owned(), serde_json::to_value(warnings).unwrap_or(Json::Null));
	Json::Object(extra)
}

/// Answer one operator call against a local engine, producing the JSON
/// response body the peer protocol prescribes. This is the dispatch the
/// HTTP frontend (out of scope here) and the test suite sit on.
pub async fn serve(
	engine: &mut Engine,
	op: OpKind,
	shard: Option<&ShardId>,
	body: Option<&Json>,
) -> Json {
	match serve_inner(engine, op, shard, body).await {
		Ok(body) => body,
		Err(e) => error_body(&e),
	}
}

async fn serve_inner(
	engine: &mut Engine,
	op: OpKind,
	shard: Option<&ShardId>,
	body: Option<&Json>,
) -> Result<Json, Error> {
	let mut extra = serde_json::Map::new();
	match op {
		OpKind::GetSome => {
			let (at_least, at_most) = window(body)?;
			match engine.get_some(at_least, at_most, shard).await? {
				Some(block) => {
					let wire = serde_json::to_value(WireBlock::from_block(&block))
						.map_err(|e| Error::Internal {
							message: format!("Failed to serialize block: {e}"),
						})?;
					if let Json::Object(map) = wire {
						extra.extend(map);
					}
					extra.insert("exhausted".to_owned(), Json::Bool(false));
				}
				None => {
					extra.insert("exhausted".to_owned(), Json::Bool(true));
				}
			}
		}
		OpKind::SkipSome => {
			let (at_least, at_most) = window(body)?;
			let skipped = engine.skip_some(at_least, at_most, shard).await?;
			let exhausted = !engine.has_more(shard).await?;
			extra.insert("skipped".to_owned(), Json::from(skipped));
			extra.insert("exhausted".to_owned(), Json::Bool(exhausted));
		}
		OpKind::InitializeCursor => {
			let body = body.ok_or_else(|| Error::ClusterCommunication {
				message: String::from("initializeCursor requires a body"),
			})?;
			let exhausted = body.get("exhausted").and_then(Json::as_bool).unwrap_or(true);
			let input = if exhausted {
				None
			} else {
				let pos = body.get("pos").and_then(Json::as_u64).unwrap_or(0) as usize;
				let items = body.get("items").cloned().ok_or_else(|| {
					Error::ClusterCommunication {
						message: String::from("initializeCursor body lacks items"),
					}
				})?;
				let wire: WireBlock = serde_json::from_value(items).map_err(|e| {
					Error::ClusterCommunication {
						message: format!("Malformed block in initializeCursor: {e}"),
					}
				})?;
				Some((wire.into_block(), pos))
			};
			engine.initialize_cursor(input).await?;
		}
		OpKind::Shutdown => {
			let code = body
				.and_then(|b| b.get("code"))
				.and_then(Json::as_i64)
				.unwrap_or(0);
			engine.shutdown(code).await?;
		}
		OpKind::HasMore => {
			let has_more = engine.has_more(shard).await?;
			extra.insert("hasMore".to_owned(), Json::Bool(has_more));
		}
		OpKind::Count => {
			extra.insert("count".to_owned(), Json::from(engine.count().await?));
		}
		OpKind::Remaining => {
			extra.insert("remaining".to_owned(), Json::from(engine.remaining().await?));
		}
	}
	Ok(ok_body(extra, engine))
}

fn window(body: Option<&Json>) -> Result<(usize, usize), Error> {
	let body = body.ok_or_else(|| Error::ClusterCommunication {
		message: String::from("Operator call requires a body"),
	})?;
	let at_least = body.get("atLeast").and_then(Json::as_u64).unwrap_or(1) as usize;
	let at_most =
		body.get("atMost").and_then(Json::as_u64).unwrap_or(at_least.max(1) as u64) as usize;
	Ok((at_least, at_most))
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn paths_parse() {
		let (op, id) = parse_path("/_db/test/_api/aql/getSome/q-17").unwrap();
		assert_eq!(op, OpKind::GetSome);
		assert_eq!(id, "q-17");
		assert!(parse_path("/_db/test/_api/cursor").is_err());
		assert!(parse_path("/_db/test/_api/aql/getSome").is_err());
	}

	#[test]
	fn blocks_survive_the_wire() {
		let mut block = Block::new(2, 2);
		block.set(0, 0, Value::Json(json!({"a": 1})));
		block.set(0, 1, Value::Range(Range::new(0, 3)));
		block.set(1, 0, Value::Json(json!(null)));
		let wire = WireBlock::from_block(&block);
		let encoded = serde_json::to_value(&wire).unwrap();
		let decoded: WireBlock = serde_json::from_value(encoded).unwrap();
		let back = decoded.into_block();
		assert_eq!(back.rows(), 2);
		assert_eq!(back.get(0, 0).unwrap().to_json(), json!({"a": 1}));
		assert!(matches!(back.get(0, 1), Some(Value::Range(r)) if r.len() == 3));
		// A stored JSON null is distinct from an absent cell
		assert!(matches!(back.get(1, 0), Some(Value::Json(Json::Null))));
		assert!(back.get(1, 1).is_none());
	}

	#[test]
	fn envelopes_rethrow_peer_errors() {
		let body = json!({"error": true, "errorNum": 1500, "errorMessage": "killed"});
		assert!(matches!(check_envelope(&body), Err(Error::QueryKilled)));
		assert!(check_envelope(&json!({"error": false})).is_ok());
	}
}
