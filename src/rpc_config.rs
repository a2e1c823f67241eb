//! Public, broker-agnostic RPC configuration.
//!
//! This type intentionally contains no broker connection settings (those
//! live in [`BrokerConfig`](crate::BrokerConfig)). It holds the timeouts,
//! bounds and intervals that shape call, dispatch and scheduling behaviour.

use std::time::Duration;

use crate::RetryConfig;

/// Default time a synchronous call waits for its reply.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(6);

/// Default server-side block of one dispatch read.
pub const DEFAULT_READ_BLOCK: Duration = Duration::from_secs(20);

/// Default lifetime of an unclaimed reply.
pub const DEFAULT_REPLY_TTL: Duration = Duration::from_secs(20);

/// Default cap on entries retained per service queue.
pub const DEFAULT_MAX_QUEUE_LEN: usize = 4096;

/// Default consumer group name.
pub const DEFAULT_GROUP: &str = "rpc";

/// Default number of entries fetched per queue per read.
pub const DEFAULT_READ_COUNT: usize = 64;

/// Default upper bound on one fire-loop sleep.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Default pause after a worker loop hits a broker error.
pub const DEFAULT_LOOP_BACKOFF: Duration = Duration::from_secs(1);

/// RPC node configuration.
///
/// Usually set through [`RpcNodeBuilder`](crate::RpcNodeBuilder).
///
/// # Example
///
/// ```
/// use stream_rpc::RpcConfig;
/// use std::time::Duration;
///
/// let config = RpcConfig::default()
///     .with_call_timeout(Duration::from_secs(2))
///     .with_max_queue_len(1024);
/// assert_eq!(config.reply_ttl, Duration::from_secs(20));
/// ```
#[derive(Debug, Clone)]
pub struct RpcConfig {
    // ---
    /// How long `call()` waits for a reply before returning
    /// [`RpcError::Timeout`](crate::RpcError::Timeout).
    ///
    /// Default: 6 seconds
    pub call_timeout: Duration,

    /// How long one dispatch read blocks waiting for new entries.
    ///
    /// Default: 20 seconds
    pub read_block: Duration,

    /// Expiry set on a rendezvous list after a reply is pushed.
    ///
    /// Default: 20 seconds
    pub reply_ttl: Duration,

    /// Maximum entries kept per service queue; older entries are trimmed.
    ///
    /// Default: 4096
    pub max_queue_len: usize,

    /// Consumer group every process of a service reads through.
    ///
    /// Default: `"rpc"`
    pub group: String,

    /// Entries fetched per queue on each dispatch read.
    ///
    /// Default: 64
    pub read_count: usize,

    /// Longest single sleep of the fire loop; bounds how late a newly added
    /// earlier task is noticed.
    ///
    /// Default: 100 ms
    pub poll_interval: Duration,

    /// Pause after a dispatch or fire loop hits a broker error.
    ///
    /// Default: 1 second
    pub loop_backoff: Duration,

    /// Optional retry of the enqueue step on retryable broker errors.
    ///
    /// Only enqueueing is retried, never the wait for a reply, so a retry
    /// cannot execute a call twice.
    ///
    /// Default: `None` (broker errors surface immediately)
    pub retry_config: Option<RetryConfig>,

    /// Optional period for merging the durable delay hashes back into the
    /// local pending list.
    ///
    /// Default: `None` (only the startup reload)
    pub reload_interval: Option<Duration>,
}

impl Default for RpcConfig {
    fn default() -> Self {
        // ---
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            read_block: DEFAULT_READ_BLOCK,
            reply_ttl: DEFAULT_REPLY_TTL,
            max_queue_len: DEFAULT_MAX_QUEUE_LEN,
            group: DEFAULT_GROUP.to_string(),
            read_count: DEFAULT_READ_COUNT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            loop_backoff: DEFAULT_LOOP_BACKOFF,
            retry_config: None,
            reload_interval: None,
        }
    }
}

impl RpcConfig {
    // ---
    /// Set the reply wait of `call()`.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the per-queue entry cap.
    pub fn with_max_queue_len(mut self, len: usize) -> Self {
        self.max_queue_len = len;
        self
    }

    /// Configure retry behavior with exponential backoff.
    ///
    /// # Example
    ///
    /// ```
    /// use stream_rpc::{RpcConfig, RetryConfig};
    ///
    /// let config = RpcConfig::default().with_retry(RetryConfig::default());
    /// assert!(config.retry_config.is_some());
    /// ```
    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry_config = Some(config);
        self
    }
}
