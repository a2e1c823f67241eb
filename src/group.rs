//! Consumer group provisioning.
//!
//! A queue cannot carry a consumer group before it exists, and a group must
//! exist before anyone can read through it. [`ensure_group`] brings both into
//! being, lazily and idempotently:
//!
//! 1. If the queue does not exist, append a placeholder entry to create it.
//! 2. If the group is already attached, stop.
//! 3. Otherwise create the group at the tail, so history is never replayed.
//!
//! Several processes may run this at once. Each step tolerates losing the
//! race: a concurrent creator makes the queue exist, and the broker treats
//! creating an existing group as success.

use crate::{log_debug, log_info, Broker, Result, RpcError};

/// Make sure `queue` exists and carries consumer group `group`.
///
/// Safe to call concurrently and repeatedly.
pub async fn ensure_group(broker: &dyn Broker, queue: &str, group: &str) -> Result<()> {
    // ---
    if !broker.queue_exists(queue).await? {
        broker.append_placeholder(queue).await?;
        log_info!("{}: created queue {queue}", broker.name());
    }

    let groups = match broker.list_groups(queue).await {
        Ok(groups) => groups,
        // Deleted since the existence check; the create below reports the
        // real state.
        Err(RpcError::MissingQueue(_)) => Vec::new(),
        Err(err) => return Err(err),
    };

    if groups.iter().any(|g| g == group) {
        log_debug!("{}: group {group} present on {queue}", broker.name());
        return Ok(());
    }

    match broker.create_group(queue, group).await {
        Ok(()) => Ok(()),
        Err(RpcError::MissingQueue(_)) => {
            // Queue vanished in between; recreate once and retry.
            broker.append_placeholder(queue).await?;
            broker.create_group(queue, group).await
        }
        Err(err) => Err(err),
    }
}
