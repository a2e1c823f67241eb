//! Broker builder for creating broker instances.
//!
//! Provides a fluent builder API for constructing brokers with clear separation
//! between required and optional configuration.

use std::sync::Arc;

use crate::{BrokerConfig, BrokerPtr, MemoryHub, Result, RpcError};

/// Default data source name.
pub const DEFAULT_DATA_SOURCE: &str = "default";

/// Default consumer identity, shared by every process reading a group.
pub const DEFAULT_CONSUMER: &str = "rpc";

/// Builder for creating broker instances.
///
/// # Examples
///
/// ## Redis broker
/// ```no_run
/// use stream_rpc::BrokerBuilder;
///
/// # async fn example() -> stream_rpc::Result<()> {
/// let broker = BrokerBuilder::new()
///     .uri("redis://localhost:6379")
///     .name("orders-db")
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// ## Per-process consumer identity
/// ```no_run
/// use stream_rpc::BrokerBuilder;
///
/// # async fn example() -> stream_rpc::Result<()> {
/// let broker = BrokerBuilder::new()
///     .uri("redis://localhost:6379")
///     .unique_consumer()  // "default-<uuid>" instead of the shared "rpc"
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
///
/// ## In-memory broker
/// ```
/// use stream_rpc::BrokerBuilder;
///
/// # async fn example() -> stream_rpc::Result<()> {
/// let broker = BrokerBuilder::new().uri("memory://").build().await?;
/// assert_eq!(broker.name(), "default");
/// # Ok(())
/// # }
/// ```
pub struct BrokerBuilder {
    uri: Option<String>,
    name: Option<String>,
    consumer: Option<String>,
    transport_type: Option<String>,
    memory_hub: Option<Arc<MemoryHub>>,

    // Tracked so conflicts can be detected at build()
    called_unique_consumer: bool,
}

impl BrokerBuilder {
    /// Create a new broker builder.
    pub fn new() -> Self {
        Self {
            uri: None,
            name: None,
            consumer: None,
            transport_type: None,
            memory_hub: None,
            called_unique_consumer: false,
        }
    }

    /// Set the broker URI.
    ///
    /// Examples:
    /// - `"redis://localhost:6379"`
    /// - `"rediss://cache.internal:6380/2"`
    /// - `"memory://"`
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Set the data source name services are routed by.
    ///
    /// Default: `"default"`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set an explicit consumer identity.
    ///
    /// Default: `"rpc"`, shared by all processes. Cannot be combined with
    /// [`unique_consumer()`](Self::unique_consumer).
    pub fn consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = Some(consumer.into());
        self
    }

    /// Give this process its own consumer identity (`"{name}-{uuid}"`).
    ///
    /// Delivery stays competing-consumers either way; a distinct identity
    /// only makes per-process delivery visible on the broker.
    pub fn unique_consumer(mut self) -> Self {
        self.called_unique_consumer = true;
        self
    }

    /// Set explicit broker type.
    ///
    /// Valid values: `"memory"`, `"redis"`
    ///
    /// If not specified, the type is inferred from the URI scheme.
    pub fn transport_type(mut self, flag: impl Into<String>) -> Self {
        self.transport_type = Some(flag.into());
        self
    }

    /// Use an explicit [`MemoryHub`] (implies the memory broker).
    ///
    /// Brokers built on the same hub share one store; tests use this to stay
    /// isolated from each other.
    pub fn memory_hub(mut self, hub: Arc<MemoryHub>) -> Self {
        self.memory_hub = Some(hub);
        self
    }

    /// Build the broker (consumes self).
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Both `consumer()` and `unique_consumer()` were used
    /// - A memory hub was supplied for a non-memory broker
    /// - The broker type is unknown or cannot be inferred
    /// - Broker creation fails
    pub async fn build(self) -> Result<BrokerPtr> {
        // ---
        if self.called_unique_consumer && self.consumer.is_some() {
            return Err(RpcError::ConfigConflict(
                "Cannot use both consumer() and unique_consumer()".into(),
            ));
        }

        let uri = self.uri.unwrap_or_default();
        let name = self.name.unwrap_or_else(|| DEFAULT_DATA_SOURCE.to_string());

        let consumer = match self.consumer {
            Some(consumer) => consumer,
            None if self.called_unique_consumer => format!("{name}-{}", uuid::Uuid::new_v4()),
            None => DEFAULT_CONSUMER.to_string(),
        };

        let transport_type = match self.transport_type {
            Some(t) => t,
            None if self.memory_hub.is_some() => "memory".to_string(),
            None => infer_transport_type(&uri)?.to_string(),
        };

        if self.memory_hub.is_some() && transport_type != "memory" {
            return Err(RpcError::ConfigConflict(format!(
                "memory_hub() given for transport_type {transport_type}"
            )));
        }

        let config = BrokerConfig {
            uri,
            name,
            consumer,
            transport_type: Some(transport_type.clone()),
        };

        match transport_type.as_str() {
            "memory" => match self.memory_hub {
                Some(hub) => crate::create_memory_broker_with_hub(config, hub).await,
                None => crate::create_memory_broker(config).await,
            },
            "redis" => crate::create_redis_broker(config).await,
            other => Err(RpcError::Transport(format!(
                "unrecognized transport_type: {other}, valid values: memory, redis"
            ))),
        }
    }
}

impl Default for BrokerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Pick a broker type from a URI scheme.
fn infer_transport_type(uri: &str) -> Result<&'static str> {
    // ---
    if uri.is_empty() || uri.starts_with("memory:") {
        return Ok("memory");
    }

    let scheme = uri.split("://").next().unwrap_or_default();
    match scheme {
        "redis" | "rediss" | "redis+unix" | "unix" => Ok("redis"),
        other => Err(RpcError::Transport(format!(
            "cannot infer broker type from URI scheme {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_infer_transport_type() {
        // ---
        assert_eq!(infer_transport_type("").unwrap(), "memory");
        assert_eq!(infer_transport_type("memory://").unwrap(), "memory");
        assert_eq!(infer_transport_type("redis://localhost:6379").unwrap(), "redis");
        assert_eq!(infer_transport_type("rediss://host:6380/1").unwrap(), "redis");
        assert!(infer_transport_type("mqtt://localhost:1883").is_err());
    }

    #[tokio::test]
    async fn test_consumer_conflict() {
        // ---
        let res = BrokerBuilder::new()
            .consumer("a")
            .unique_consumer()
            .build()
            .await;
        assert!(matches!(res, Err(RpcError::ConfigConflict(_))));
    }

    #[tokio::test]
    async fn test_unique_consumer_is_prefixed_by_name() {
        // ---
        let broker = BrokerBuilder::new()
            .name("orders")
            .unique_consumer()
            .memory_hub(MemoryHub::new())
            .build()
            .await
            .unwrap();
        assert!(broker.consumer().starts_with("orders-"));
        assert_eq!(broker.name(), "orders");
    }

    #[tokio::test]
    async fn test_memory_hub_requires_memory_type() {
        // ---
        let res = BrokerBuilder::new()
            .transport_type("redis")
            .memory_hub(MemoryHub::new())
            .build()
            .await;
        assert!(matches!(res, Err(RpcError::ConfigConflict(_))));
    }
}
