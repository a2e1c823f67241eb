//! Rendezvous entries: single-use result slots on the broker.
//!
//! A caller blocks popping a short-lived list; whoever executes the call
//! pushes exactly one [`Reply`] onto it and sets an expiry, so a reply nobody
//! waits for (fire-and-forget, caller gave up) disappears on its own.

use std::time::Duration;

use crate::protocol::Reply;
use crate::{log_debug, log_error, Broker, Result, RpcError};

/// Push the outcome of a call onto rendezvous list `key`.
///
/// Failures are logged and swallowed: the call has already run and there is
/// nobody to report the error to.
pub(crate) async fn deliver(broker: &dyn Broker, key: &str, reply: Reply, ttl: Duration) {
    // ---
    if let Err(err) = broker.push_reply(key, reply.encode(), ttl).await {
        log_error!("{}: failed to deliver reply to {key}: {err}", broker.name());
    } else {
        log_debug!("{}: reply delivered to {key}", broker.name());
    }
}

/// Wait up to `timeout` for the reply on `key`.
///
/// # Errors
///
/// - [`RpcError::Timeout`] when no reply arrived in time
/// - [`RpcError::Remote`] when the handler reported an error
/// - broker errors from the blocking pop
pub(crate) async fn await_reply(
    broker: &dyn Broker,
    key: &str,
    timeout: Duration,
) -> Result<bytes::Bytes> {
    // ---
    match broker.pop_reply(key, timeout).await? {
        Some(raw) => Reply::decode(raw)?.into_result(),
        None => {
            log_debug!("{}: no reply on {key} within {timeout:?}", broker.name());
            Err(RpcError::Timeout)
        }
    }
}
