//! Redis broker.
//!
//! This module contains the broker implementation for Redis-compatible
//! servers (streams, consumer groups, lists and hashes) via the `redis`
//! library (redis.rs).

#[cfg(feature = "transport_redis")]
#[allow(clippy::module_inception)]
mod redis;

#[cfg(feature = "transport_redis")]
pub use self::redis::create_broker as create_redis_broker;

#[cfg(not(feature = "transport_redis"))]
pub async fn create_redis_broker(_config: crate::BrokerConfig) -> crate::Result<crate::BrokerPtr> {
    Err(crate::RpcError::Transport(
        "transport_redis feature is not enabled".into(),
    ))
}
