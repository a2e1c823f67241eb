//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! broker implementations or client libraries.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod broker;
mod envelope;

// --- Broker domain re-exports ---

pub use broker::{
    //
    Broker,
    BrokerBase,
    BrokerConfig,
    BrokerPtr,
    Delivery,
};

pub use envelope::CallEnvelope;
