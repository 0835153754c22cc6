pub use self::canceller::Canceller;
pub use self::reason::Reason;

mod canceller;
mod reason;

use crate::cluster::{ClusterInfo, Transport};
use crate::err::Error;
use crate::kvs::Store;
use crate::plan::Evaluator;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// The per-query execution context.
///
/// Carries the cooperative cancellation flag, an optional deadline, and the
/// external collaborators every operator needs: the storage layer, the
/// expression evaluator, and (in cluster mode) the cluster metadata and the
/// transport to peer DB-servers. Cloning is cheap; every operator call
/// receives a shared reference.
#[derive(Clone)]
pub struct Context {
	/// Whether or not this query has been killed
	cancelled: Arc<AtomicBool>,
	/// An optional deadline
	deadline: Option<Instant>,
	/// The name of the database this query runs against
	database: String,
	/// The storage layer for this query's transaction
	store: Arc<dyn Store>,
	/// The expression evaluator, if the plan contains computed expressions
	evaluator: Option<Arc<dyn Evaluator>>,
	/// Cluster metadata, present on coordinators and DB-servers
	cluster: Option<Arc<dyn ClusterInfo>>,
	/// The transport used to reach peer DB-servers
	transport: Option<Arc<dyn Transport>>,
}

impl Context {
	/// Create a new context around a storage transaction.
	pub fn new(database: &str, store: Arc<dyn Store>) -> Self {
		Self {
			cancelled: Arc::new(AtomicBool::new(false)),
			deadline: None,
			database: database.to_owned(),
			store,
			evaluator: None,
			cluster: None,
			transport: None,
		}
	}

	/// Attach an expression evaluator.
	pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
		self.evaluator = Some(evaluator);
		self
	}

	/// Attach cluster metadata. Doing so puts the engine in cluster mode.
	pub fn with_cluster(mut self, cluster: Arc<dyn ClusterInfo>) -> Self {
		self.cluster = Some(cluster);
		self
	}

	/// Attach a transport for remote operators.
	pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
		self.transport = Some(transport);
		self
	}

	/// Add a deadline this far in the future.
	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.deadline = Some(Instant::now() + timeout);
		self
	}

	/// Get a handle which can kill this query from another thread.
	pub fn add_cancel(&self) -> Canceller {
		Canceller::new(self.cancelled.clone())
	}

	/// The database this query runs against.
	pub fn database(&self) -> &str {
		&self.database
	}

	/// The storage layer of this query.
	pub fn store(&self) -> &Arc<dyn Store> {
		&self.store
	}

	/// Whether this engine participates in a cluster.
	pub fn is_cluster(&self) -> bool {
		self.cluster.is_some()
	}

	/// The cluster metadata, failing when the plan needs it but the engine
	/// was built without it.
	pub fn cluster(&self) -> Result<&Arc<dyn ClusterInfo>, Error> {
		self.cluster.as_ref().ok_or_else(|| Error::Internal {
			message: String::from("Cluster operator used without cluster metadata"),
		})
	}

	/// The transport to peer DB-servers.
	pub fn transport(&self) -> Result<&Arc<dyn Transport>, Error> {
		self.transport.as_ref().ok_or_else(|| Error::Internal {
			message: String::from("Remote operator used without a transport"),
		})
	}

	/// The expression evaluator.
	pub fn evaluator(&self) -> Result<&Arc<dyn Evaluator>, Error> {
		self.evaluator.as_ref().ok_or_else(|| Error::Internal {
			message: String::from("Computed expression used without an evaluator"),
		})
	}

	/// Enter a scope in which expressions may execute user code. The scope
	/// is released when the guard drops, on every exit path.
	pub fn expression_scope(&self) -> ExpressionScope<'_> {
		if let Some(e) = self.evaluator.as_deref() {
			e.enter_scope();
		}
		ExpressionScope {
			evaluator: self.evaluator.as_deref(),
		}
	}

	/// Check if the context is done. If it returns `None` the operation may
	/// proceed, otherwise the operation should be stopped.
	pub fn done(&self) -> Option<Reason> {
		match self.deadline {
			Some(deadline) if deadline <= Instant::now() => Some(Reason::Timedout),
			_ if self.cancelled.load(Ordering::Relaxed) => Some(Reason::Killed),
			_ => None,
		}
	}

	/// Check if the context is ok to continue.
	pub fn is_ok(&self) -> bool {
		self.done().is_none()
	}

	/// Fail with [`Error::QueryKilled`] if the context is no longer usable.
	/// This is the first check on every row an operator touches.
	pub fn check(&self) -> Result<(), Error> {
		match self.done() {
			Some(reason) => Err(reason.into()),
			None => Ok(()),
		}
	}
}

/// A guard around expression evaluation which may re-enter a scripting
/// runtime. Acquired before evaluation, released when dropped.
pub struct ExpressionScope<'a> {
	evaluator: Option<&'a dyn Evaluator>,
}

impl Drop for ExpressionScope<'_> {
	fn drop(&mut self) {
		if let Some(e) = self.evaluator {
			e.exit_scope();
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::kvs::MemoryStore;

	#[test]
	fn cancellation_is_observed() {
		let ctx = Context::new("test", Arc::new(MemoryStore::new()));
		assert!(ctx.is_ok());
		let canceller = ctx.add_cancel();
		canceller.cancel();
		assert_eq!(ctx.done(), Some(Reason::Killed));
		assert!(matches!(ctx.check(), Err(Error::QueryKilled)));
	}

	#[test]
	fn deadlines_are_observed() {
		let ctx = Context::new("test", Arc::new(MemoryStore::new()))
			.with_timeout(Duration::from_secs(0));
		assert_eq!(ctx.done(), Some(Reason::Timedout));
	}
}
