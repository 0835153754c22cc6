use crate::cluster::{check_envelope, unpack_envelope, Method, OpKind, PeerRequest, WireBlock};
use crate::cnf;
use crate::ctx::Context;
use crate::dbs::operator::{InputRow, OperatorBase, UNKNOWN_COUNT};
use crate::dbs::{Block, Warnings};
use crate::err::Error;
use crate::val::Json;

/// The shim for an upstream sub-plan executing on a peer DB-server.
///
/// Every pull-protocol call is serialized to a small JSON body, sent
/// synchronously to the peer identified by `(server, own_name, query_id)`,
/// and the response is deserialized back into a block or a status. Peer
/// warnings are forwarded into the local query, and the peer's
/// incremental statistics are folded into the local counters on every
/// call.
pub(crate) struct RemoteOperator {
	pub(crate) base: OperatorBase,
	server: String,
	/// The calling shard, sent as a header when this node is a DB-server
	own_name: String,
	query_id: String,
	warnings: Warnings,
}

impl RemoteOperator {
	pub(crate) fn new(
		base: OperatorBase,
		server: String,
		own_name: String,
		query_id: String,
		warnings: Warnings,
	) -> Self {
		Self {
			base,
			server,
			own_name,
			query_id,
			warnings,
		}
	}

	async fn call(
		&self,
		ctx: &Context,
		method: Method,
		op: OpKind,
		body: Option<Json>,
	) -> Result<Json, Error> {
		let path = format!(
			"/_db/{}/_api/aql/{}/{}",
			ctx.database(),
			op.path_segment(),
			self.query_id
		);
		trace!(server = %self.server, path = %path, "Calling remote operator");
		let request = PeerRequest {
			method,
			path,
			shard: (!self.own_name.is_empty()).then(|| self.own_name.clone()),
			body,
			timeout: cnf::remote_timeout(),
		};
		let response = ctx.transport()?.send(&self.server, request).await?;
		// Fold the peer's statistics delta and forward its warnings
		let (stats, warnings) = unpack_envelope(&response);
		if let Some(delta) = stats {
			self.base.stats.add(&delta);
		}
		if !warnings.is_empty() {
			self.warnings.extend(warnings);
		}
		check_envelope(&response)?;
		Ok(response)
	}

	pub(crate) async fn initialize_cursor(
		&mut self,
		ctx: &Context,
		input: InputRow<'_>,
	) -> Result<(), Error> {
		self.base.buffer.clear();
		self.base.pos = 0;
		self.base.done = false;
		let body = match input {
			None => serde_json::json!({ "exhausted": true }),
			Some((block, pos)) => serde_json::json!({
				"exhausted": false,
				"pos": pos,
				"items": WireBlock::from_block(block),
			}),
		};
		self.call(ctx, Method::Put, OpKind::InitializeCursor, Some(body)).await?;
		Ok(())
	}

	pub(crate) async fn shutdown(&mut self, ctx: &Context, code: i64) -> Result<(), Error> {
		self.base.buffer.clear();
		let body = serde_json::json!({ "code": code });
		match self.call(ctx, Method::Put, OpKind::Shutdown, Some(body)).await {
			// The peer may have released the query already
			Err(Error::QueryNotFound) => Ok(()),
			Err(e) => Err(e),
			Ok(_) => Ok(()),
		}
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
		let body = serde_json::json!({ "atLeast": at_least, "atMost": at_most });
		if skipping {
			let response = self.call(ctx, Method::Put, OpKind::SkipSome, Some(body)).await?;
			let skipped =
				response.get("skipped").and_then(Json::as_u64).unwrap_or(0) as usize;
			if response.get("exhausted").and_then(Json::as_bool).unwrap_or(false) {
				self.base.done = true;
			}
			return Ok((None, skipped));
		}
		let response = self.call(ctx, Method::Put, OpKind::GetSome, Some(body)).await?;
		if response.get("exhausted").and_then(Json::as_bool).unwrap_or(false) {
			self.base.done = true;
			return Ok((None, 0));
		}
		let wire: WireBlock =
			serde_json::from_value(response).map_err(|e| Error::ClusterCommunication {
				message: format!("Malformed block from server '{}': {e}", self.server),
			})?;
		let block = wire.into_block();
		if block.rows() == 0 {
			self.base.done = true;
			return Ok((None, 0));
		}
		let rows = block.rows();
		Ok((Some(block), rows))
	}

	pub(crate) async fn has_more(&mut self, ctx: &Context) -> Result<bool, Error> {
		if self.base.done {
			return Ok(false);
		}
		let response = self.call(ctx, Method::Get, OpKind::HasMore, None).await?;
		Ok(response.get("hasMore").and_then(Json::as_bool).unwrap_or(false))
	}

	pub(crate) async fn count(&mut self, ctx: &Context) -> Result<i64, Error> {
		let response = self.call(ctx, Method::Get, OpKind::Count, None).await?;
		Ok(response.get("count").and_then(Json::as_i64).unwrap_or(UNKNOWN_COUNT))
	}

	pub(crate) async fn remaining(&mut self, ctx: &Context) -> Result<i64, Error> {
		let response = self.call(ctx, Method::Get, OpKind::Remaining, None).await?;
		Ok(response.get("remaining").and_then(Json::as_i64).unwrap_or(UNKNOWN_COUNT))
	}
}
