//! RPC node builder.
//!
//! Provides a fluent builder API for assembling an [`RpcNode`] from a
//! service registry, one broker per data source, and timing settings.

use crate::{
    // ---
    BrokerPtr,
    Result,
    RetryConfig,
    RpcConfig,
    RpcError,
    RpcNode,
    ServiceRegistry,
};
use std::collections::HashMap;
use std::time::Duration;

/// Builder for creating RPC nodes.
///
/// Every data source a registered service points to needs a broker with the
/// same [`name`](crate::BrokerBuilder::name).
///
/// # Examples
///
/// ## Single broker with enqueue retry
/// ```no_run
/// use stream_rpc::{BrokerBuilder, RpcNodeBuilder, ServiceRegistry};
/// use std::time::Duration;
///
/// # async fn example() -> stream_rpc::Result<()> {
/// let broker = BrokerBuilder::new()
///     .uri("redis://localhost:6379")
///     .build()
///     .await?;
///
/// let node = RpcNodeBuilder::new(ServiceRegistry::new())
///     .broker(broker)
///     .retry_max_attempts(5)
///     .retry_initial_delay(Duration::from_millis(200))
///     .call_timeout(Duration::from_secs(2))
///     .build()?;
/// # Ok(())
/// # }
/// ```
///
/// ## Two data sources
/// ```no_run
/// use stream_rpc::{BrokerBuilder, RpcNodeBuilder, ServiceRegistry};
///
/// # async fn example() -> stream_rpc::Result<()> {
/// let registry = ServiceRegistry::new();
/// registry.route("billing.charge", "billing");
///
/// let main = BrokerBuilder::new().uri("redis://main:6379").build().await?;
/// let billing = BrokerBuilder::new()
///     .uri("redis://billing:6379")
///     .name("billing")
///     .build()
///     .await?;
///
/// let node = RpcNodeBuilder::new(registry)
///     .broker(main)
///     .broker(billing)
///     .build()?;
/// # Ok(())
/// # }
/// ```
pub struct RpcNodeBuilder {
    // ---
    registry: ServiceRegistry,
    brokers: Vec<BrokerPtr>,
    config: RpcConfig,

    // Retry configuration (all optional)
    retry_max_attempts: Option<u32>,
    retry_multiplier: Option<f32>,
    retry_initial_delay: Option<Duration>,
    retry_max_delay: Option<Duration>,
}

impl RpcNodeBuilder {
    /// Create a new node builder over `registry`.
    pub fn new(registry: ServiceRegistry) -> Self {
        // ---
        Self {
            registry,
            brokers: Vec::new(),
            config: RpcConfig::default(),
            retry_max_attempts: None,
            retry_multiplier: None,
            retry_initial_delay: None,
            retry_max_delay: None,
        }
    }

    /// Add a broker; it serves the data source named by its
    /// [`Broker::name`](crate::Broker::name).
    pub fn broker(mut self, broker: BrokerPtr) -> Self {
        self.brokers.push(broker);
        self
    }

    /// Replace the whole configuration.
    ///
    /// Individual setters called afterwards still apply on top.
    pub fn config(mut self, config: RpcConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the reply wait of `call()`.
    ///
    /// Default: 6s.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = timeout;
        self
    }

    /// Set how long one dispatch read blocks.
    ///
    /// Default: 20s.
    pub fn read_block(mut self, block: Duration) -> Self {
        self.config.read_block = block;
        self
    }

    /// Set the expiry of unclaimed replies.
    ///
    /// Default: 20s.
    pub fn reply_ttl(mut self, ttl: Duration) -> Self {
        self.config.reply_ttl = ttl;
        self
    }

    /// Set the per-queue entry cap.
    ///
    /// Default: 4096.
    pub fn max_queue_len(mut self, len: usize) -> Self {
        self.config.max_queue_len = len;
        self
    }

    /// Set the consumer group name.
    ///
    /// Default: `"rpc"`.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.config.group = group.into();
        self
    }

    /// Set the longest single fire-loop sleep.
    ///
    /// Default: 100ms.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Set the pause after a worker loop hits a broker error.
    ///
    /// Default: 1s.
    pub fn loop_backoff(mut self, backoff: Duration) -> Self {
        self.config.loop_backoff = backoff;
        self
    }

    /// Periodically merge the durable delay hashes into the local list.
    ///
    /// Default: off.
    pub fn reload_interval(mut self, interval: Duration) -> Self {
        self.config.reload_interval = Some(interval);
        self
    }

    /// Set maximum enqueue retry attempts.
    ///
    /// Default: no retries (single attempt).
    pub fn retry_max_attempts(mut self, attempts: u32) -> Self {
        self.retry_max_attempts = Some(attempts);
        self
    }

    /// Set retry backoff multiplier.
    ///
    /// Default: 2.0 (exponential backoff).
    pub fn retry_multiplier(mut self, multiplier: f32) -> Self {
        self.retry_multiplier = Some(multiplier);
        self
    }

    /// Set initial delay before first retry.
    ///
    /// Default: 100ms.
    pub fn retry_initial_delay(mut self, delay: Duration) -> Self {
        self.retry_initial_delay = Some(delay);
        self
    }

    /// Set maximum delay between retry attempts.
    ///
    /// Default: 5s.
    pub fn retry_max_delay(mut self, delay: Duration) -> Self {
        self.retry_max_delay = Some(delay);
        self
    }

    /// Build the node (consumes self).
    ///
    /// # Errors
    ///
    /// - [`RpcError::MissingConfig`] when no broker was given, or a route
    ///   names a data source without a broker
    /// - [`RpcError::ConfigConflict`] when two brokers share a name
    pub fn build(self) -> Result<RpcNode> {
        // ---
        let mut config = self.config;

        // Build retry config only if at least one retry parameter was set
        if self.retry_max_attempts.is_some()
            || self.retry_multiplier.is_some()
            || self.retry_initial_delay.is_some()
            || self.retry_max_delay.is_some()
        {
            let defaults = config.retry_config.take().unwrap_or_default();
            config.retry_config = Some(RetryConfig {
                max_attempts: self.retry_max_attempts.unwrap_or(defaults.max_attempts),
                multiplier: self.retry_multiplier.unwrap_or(defaults.multiplier),
                initial_delay: self.retry_initial_delay.unwrap_or(defaults.initial_delay),
                max_delay: self.retry_max_delay.unwrap_or(defaults.max_delay),
            });
        }

        if self.brokers.is_empty() {
            return Err(RpcError::MissingConfig("at least one broker is required".into()));
        }

        let mut brokers: HashMap<String, BrokerPtr> = HashMap::new();
        for broker in self.brokers {
            let name = broker.name().to_string();
            if brokers.insert(name.clone(), broker).is_some() {
                return Err(RpcError::ConfigConflict(format!(
                    "two brokers named {name}"
                )));
            }
        }

        for data_source in self.registry.data_sources() {
            if !brokers.contains_key(&data_source) {
                return Err(RpcError::MissingConfig(format!(
                    "no broker for data source {data_source}"
                )));
            }
        }

        Ok(RpcNode::new(self.registry, brokers, config))
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::{BrokerBuilder, MemoryHub};

    async fn memory(name: &str, hub: &std::sync::Arc<MemoryHub>) -> BrokerPtr {
        BrokerBuilder::new()
            .name(name)
            .memory_hub(hub.clone())
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_requires_a_broker() {
        // ---
        let res = RpcNodeBuilder::new(ServiceRegistry::new()).build();
        assert!(matches!(res, Err(RpcError::MissingConfig(_))));
    }

    #[tokio::test]
    async fn test_every_data_source_needs_a_broker() {
        // ---
        let hub = MemoryHub::new();
        let registry = ServiceRegistry::new();
        registry.route("billing.charge", "billing");

        let res = RpcNodeBuilder::new(registry.clone())
            .broker(memory("default", &hub).await)
            .build();
        assert!(matches!(res, Err(RpcError::MissingConfig(ref m)) if m.contains("billing")));

        let node = RpcNodeBuilder::new(registry)
            .broker(memory("default", &hub).await)
            .broker(memory("billing", &hub).await)
            .build()
            .unwrap();
        assert!(node.broker("billing").is_some());
    }

    #[tokio::test]
    async fn test_duplicate_broker_names() {
        // ---
        let hub = MemoryHub::new();
        let res = RpcNodeBuilder::new(ServiceRegistry::new())
            .broker(memory("default", &hub).await)
            .broker(memory("default", &hub).await)
            .build();
        assert!(matches!(res, Err(RpcError::ConfigConflict(_))));
    }

    #[tokio::test]
    async fn test_retry_settings_fold_into_config() {
        // ---
        let hub = MemoryHub::new();
        let node = RpcNodeBuilder::new(ServiceRegistry::new())
            .broker(memory("default", &hub).await)
            .retry_max_attempts(7)
            .call_timeout(Duration::from_millis(250))
            .build()
            .unwrap();

        let retry = node.config().retry_config.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 7);
        assert_eq!(retry.initial_delay, Duration::from_millis(100));
        assert_eq!(node.config().call_timeout, Duration::from_millis(250));
        assert!(node.config().reload_interval.is_none());
    }
}
