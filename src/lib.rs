//! Name-addressed RPC over broker streams, with durable delayed calls
//!
//! Callers and handlers never talk directly. A call is appended to a
//! per-service queue on a shared broker, read by exactly one of the processes
//! listening through the service's consumer group, executed, and its result
//! pushed back to a short-lived rendezvous list the caller blocks on.
//!
//! Calls can also be deferred to a fire time. Deferred calls are persisted in
//! a durable per-service hash, survive restarts, fire at most once across all
//! processes, and can be cancelled with a tombstone sent through the same
//! queue.
//!
//! The main entry points are [`ServiceRegistry`] (what runs where),
//! [`BrokerBuilder`] (one broker per data source) and [`RpcNode`] (call,
//! schedule, cancel, serve).
//!

// Import all sub modules once...
mod domain;
mod transport;

mod broker_builder;
mod node;
mod node_builder;
mod registry;
mod rpc_config;

mod dispatch;
mod group;
mod protocol;
mod rendezvous;
mod scheduler;

mod error;
mod lock;
mod macros;
mod retry;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use node::RpcNode;
pub use node_builder::RpcNodeBuilder;

pub use broker_builder::{BrokerBuilder, DEFAULT_CONSUMER, DEFAULT_DATA_SOURCE};
pub use registry::{BoxFuture, HandlerPtr, Route, ServiceHandler, ServiceRegistry};
pub use rpc_config::{
    // ---
    RpcConfig,
    DEFAULT_CALL_TIMEOUT,
    DEFAULT_GROUP,
    DEFAULT_LOOP_BACKOFF,
    DEFAULT_MAX_QUEUE_LEN,
    DEFAULT_POLL_INTERVAL,
    DEFAULT_READ_BLOCK,
    DEFAULT_READ_COUNT,
    DEFAULT_REPLY_TTL,
};

pub use error::{Result, RpcError};
pub use group::ensure_group;
pub use protocol::{deferred_reply_key, delay_key, reply_key, Reply};
pub use retry::RetryConfig;
pub use scheduler::{unix_nanos, DelayedTask};

pub(crate) use retry::retry_with_backoff;

pub use transport::{
    // ---
    create_memory_broker,
    create_memory_broker_with_hub,
    create_redis_broker,
    MemoryHub,
};

// --- public re-exports
pub use domain::{
    //
    Broker,
    BrokerBase,
    BrokerConfig,
    BrokerPtr,
    CallEnvelope,
    Delivery,
};
