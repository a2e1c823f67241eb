//! Broker key naming.
//!
//! All keys are derived from the service name so that one service's state
//! can be found (and cleaned up) by prefix.

/// Durable hash holding a service's pending deferred calls.
///
/// Field: decimal unix-nanosecond fire time. Value: encoded payload.
pub fn delay_key(service: &str) -> String {
    format!("{service}:delay")
}

/// Rendezvous list for an immediate call.
///
/// The entry id is used verbatim; it is namespaced by service because entry
/// ids are only unique within one queue.
pub fn reply_key(service: &str, entry_id: &str) -> String {
    format!("{service}:reply:{entry_id}")
}

/// Rendezvous list for a deferred call firing at `fire_at` (unix nanos).
pub fn deferred_reply_key(service: &str, fire_at: i64) -> String {
    format!("{service}:reply:at:{fire_at}")
}
