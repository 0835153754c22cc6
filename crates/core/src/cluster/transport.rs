use crate::cluster::ShardId;
use crate::err::Error;
use crate::val::Json;
use futures::future::BoxFuture;
use std::time::Duration;

/// The HTTP header carrying the calling shard's id when a DB-server
/// addresses another shard.
pub const SHARD_ID_HEADER: &str = "Shard-Id";

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Method {
	Get,
	Put,
}

/// One synchronous request to a peer DB-server.
#[derive(Clone, Debug)]
pub struct PeerRequest {
	pub method: Method,
	/// The request path, including the database prefix
	pub path: String,
	/// The calling shard, set when the caller is a DB-server
	pub shard: Option<ShardId>,
	pub body: Option<Json>,
	pub timeout: Duration,
}

/// The transport collaborator carrying operator calls to peer DB-servers.
///
/// A transport resolves a server name, performs the round-trip, and hands
/// back the decoded response body. Transport-level failures map onto
/// [`Error::ClusterTimeout`] and [`Error::ClusterConnectionLost`];
/// error bodies inside a successful round-trip are left to the caller.
pub trait Transport: Send + Sync {
	fn send<'a>(&'a self, server: &'a str, request: PeerRequest)
		-> BoxFuture<'a, Result<Json, Error>>;
}

#[cfg(feature = "http")]
pub use self::http::HttpTransport;

#[cfg(feature = "http")]
mod http {
	use super::*;
	use futures::FutureExt;
	use std::collections::HashMap;
	use url::Url;

	/// The production transport, tunnelling operator calls over HTTP.
	pub struct HttpTransport {
		client: reqwest::Client,
		endpoints: HashMap<String, Url>,
	}

	impl HttpTransport {
		pub fn new() -> Self {
			Self {
				client: reqwest::Client::new(),
				endpoints: HashMap::new(),
			}
		}

		/// Register the base URL a server name resolves to.
		pub fn with_endpoint(mut self, server: &str, endpoint: Url) -> Self {
			self.endpoints.insert(server.to_owned(), endpoint);
			self
		}

		async fn roundtrip(&self, server: &str, request: PeerRequest) -> Result<Json, Error> {
			let base = self.endpoints.get(server).ok_or_else(|| Error::ClusterConnectionLost {
				server: server.to_owned(),
			})?;
			let url = base.join(request.path.trim_start_matches('/')).map_err(|e| {
				Error::ClusterCommunication {
					message: format!("Invalid peer path '{}': {e}", request.path),
				}
			})?;
			let mut req = match request.method {
				Method::Get => self.client.get(url),
				Method::Put => self.client.put(url),
			};
			req = req.timeout(request.timeout);
			if let Some(shard) = &request.shard {
				req = req.header(SHARD_ID_HEADER, shard);
			}
			if let Some(body) = &request.body {
				req = req.json(body);
			}
			let shard = request.shard.clone().unwrap_or_default();
			let res = req.send().await.map_err(|e| {
				if e.is_timeout() {
					Error::ClusterTimeout {
						server: server.to_owned(),
						shard: shard.clone(),
					}
				} else {
					Error::ClusterConnectionLost {
						server: server.to_owned(),
					}
				}
			})?;
			let status = res.status();
			let body: Json = res.json().await.map_err(|e| Error::ClusterCommunication {
				message: format!("Unreadable response from server '{server}': {e}"),
			})?;
			if !status.is_success() {
				// A structured error body is rethrown with its error number
				if let Some(num) = body.get("errorNum").and_then(Json::as_i64) {
					let message = body
						.get("errorMessage")
						.and_then(Json::as_str)
						.unwrap_or_default()
						.to_owned();
					return Err(Error::from_code(num, message));
				}
				return Err(Error::ClusterCommunication {
					message: format!("HTTP {status} from server '{server}'"),
				});
			}
			Ok(body)
		}
	}

	impl Default for HttpTransport {
		fn default() -> Self {
			Self::new()
		}
	}

	impl Transport for HttpTransport {
		fn send<'a>(
			&'a self,
			server: &'a str,
			request: PeerRequest,
		) -> BoxFuture<'a, Result<Json, Error>> {
			self.roundtrip(server, request).boxed()
		}
	}
}
