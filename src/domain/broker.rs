// src/domain/broker.rs

//! Broker domain abstractions.
//!
//! This module defines the broker-facing interface used by the dispatch loop,
//! the delay scheduler and the producer side. It intentionally avoids any
//! reference to a concrete client library: every method is one semantic
//! broker round trip (append to a queue, read through a consumer group, push
//! or pop a reply, touch a durable hash).
//!
//! Concrete implementations live under `src/transport/`.

use crate::{CallEnvelope, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;

/// Shared base state for all broker implementations.
///
/// Each concrete broker embeds this as a field named `base`:
///
/// ```ignore
/// struct RedisBroker {
///     base: BrokerBase,
///     // ... redis specific fields
/// }
///
/// impl Broker for RedisBroker {
///     fn base(&self) -> &BrokerBase { &self.base }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct BrokerBase {
    /// Data source name; services are routed to a broker by this name.
    pub name: String,
    /// Consumer identity used when reading through consumer groups.
    pub consumer: String,
}

impl From<&BrokerConfig> for BrokerBase {
    fn from(config: &BrokerConfig) -> Self {
        // ---
        Self {
            name: config.name.clone(),
            consumer: config.consumer.clone(),
        }
    }
}

/// Configuration for creating a broker instance.
///
/// Passed to broker factory functions (`create_*_broker()`); usually built
/// with [`BrokerBuilder`](crate::BrokerBuilder).
#[derive(Clone, Debug)]
pub struct BrokerConfig {
    /// Broker URI (e.g. `"redis://localhost:6379"`, `"memory://"`).
    pub uri: String,
    /// Data source name.
    pub name: String,
    /// Consumer identity inside consumer groups.
    pub consumer: String,
    /// Optional broker type override (`"memory"`, `"redis"`).
    pub transport_type: Option<String>,
}

/// One entry delivered by [`Broker::read_group`].
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Queue the entry was read from.
    pub queue: Arc<str>,
    /// Broker-assigned entry id.
    pub id: Arc<str>,
    /// Decoded envelope, with `entry_id` set.
    pub envelope: CallEnvelope,
}

/// Broker abstraction.
///
/// A `Broker` is one connection to a shared store offering append-only
/// queues with consumer groups, blocking lists with expiry, and hashes.
/// Everything shared between processes lives behind this trait; nothing
/// above it keeps authoritative state.
///
/// Implementations must ensure that:
/// - `append()` trims the queue to at most `max_len` entries, oldest first.
/// - `create_group()` positions a new group at the tail and treats an
///   already existing group as success.
/// - `read_group()` reports a missing queue or group as
///   [`RpcError::MissingQueue`](crate::RpcError::MissingQueue) naming the queue.
/// - `hash_take()` reads and deletes a field as one atomic operation, so at
///   most one caller across all processes observes the value.
/// - every blocking method returns once its timeout elapses.
///
/// The in-memory broker serves as the reference implementation of these
/// semantics.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    // ---
    /// Returns a reference to the shared base state.
    fn base(&self) -> &BrokerBase;

    /// Data source name of this broker.
    fn name(&self) -> &str {
        &self.base().name
    }

    /// Consumer identity used in consumer group reads.
    fn consumer(&self) -> &str {
        &self.base().consumer
    }

    /// Append an envelope to `queue`, trimming to `max_len`; returns the entry id.
    async fn append(&self, queue: &str, env: &CallEnvelope, max_len: usize) -> Result<String>;

    /// Append a placeholder entry so that `queue` exists.
    async fn append_placeholder(&self, queue: &str) -> Result<String>;

    /// Whether `queue` currently exists.
    async fn queue_exists(&self, queue: &str) -> Result<bool>;

    /// Number of entries currently held by `queue`.
    async fn queue_len(&self, queue: &str) -> Result<usize>;

    /// Names of the consumer groups attached to `queue`.
    async fn list_groups(&self, queue: &str) -> Result<Vec<String>>;

    /// Create consumer group `group` on `queue`, positioned at the tail.
    async fn create_group(&self, queue: &str, group: &str) -> Result<()>;

    /// Read new entries for `consumer` in `group` across all `queues`.
    ///
    /// Blocks up to `block` when nothing is available and then returns an
    /// empty vector.
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        queues: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>>;

    /// Acknowledge delivered entries.
    async fn ack(&self, queue: &str, group: &str, ids: &[Arc<str>]) -> Result<()>;

    /// Push one reply value onto list `key` and expire the list after `ttl`.
    async fn push_reply(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()>;

    /// Block up to `timeout` popping one reply value from list `key`.
    async fn pop_reply(&self, key: &str, timeout: Duration) -> Result<Option<Bytes>>;

    /// Set `field` of hash `key`.
    async fn hash_set(&self, key: &str, field: &str, value: Bytes) -> Result<()>;

    /// All field names of hash `key`.
    async fn hash_fields(&self, key: &str) -> Result<Vec<String>>;

    /// Atomically fetch and delete `field` of hash `key`.
    async fn hash_take(&self, key: &str, field: &str) -> Result<Option<Bytes>>;

    /// Delete `field` of hash `key`; deleting an absent field is not an error.
    async fn hash_delete(&self, key: &str, field: &str) -> Result<()>;

    /// Close the broker and release any associated resources.
    async fn close(&self) -> Result<()>;
}

/// Shared broker pointer.
///
/// `.clone()` is cheap and all clones share one underlying connection set.
pub type BrokerPtr = Arc<dyn Broker>;
