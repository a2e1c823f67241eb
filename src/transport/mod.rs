//! Broker implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Broker` trait. Brokers other than the in-memory reference are hidden
//! behind feature flags and exposed only through constructor functions.
//!
//! Domain code must not depend on broker-specific types.

mod memory;
mod redis;

pub use self::memory::{create_memory_broker, create_memory_broker_with_hub, MemoryHub};
pub use self::redis::create_redis_broker;
