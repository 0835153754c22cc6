use once_cell::sync::Lazy;
use std::time::Duration;

/// The publicly visible name of the server
pub const SERVER_NAME: &str = "OpalDB";

/// Default number of rows an operator aims to produce or consume per batch.
/// Batch windows passed down the operator tree are clamped against this.
pub static DEFAULT_BATCH_SIZE: Lazy<usize> =
	lazy_env_parse!("OPAL_DEFAULT_BATCH_SIZE", usize, 1000);

/// How long a coordinator waits for a peer DB-server to answer a single
/// operator call before the query fails with a cluster timeout.
pub static REMOTE_TIMEOUT: Lazy<u64> = lazy_env_parse!("OPAL_REMOTE_TIMEOUT_SECS", u64, 3600);

/// The timeout applied to every remote operator round-trip.
pub fn remote_timeout() -> Duration {
	Duration::from_secs(*REMOTE_TIMEOUT)
}

/// Storage scan batch size for collection and index scans. Operators ask
/// the storage layer for at least this many document pointers at a time.
pub static SCAN_BATCH_SIZE: Lazy<usize> = lazy_env_parse!("OPAL_SCAN_BATCH_SIZE", usize, 1000);
