//! Delay scheduler.
//!
//! Keeps deferred calls until their fire time and then runs them.
//!
//! ## State
//!
//! The durable hash `"{service}:delay"` on the service's broker is the only
//! source of truth: field = decimal unix-nanosecond fire time, value =
//! encoded payload. This process mirrors the subset it knows about in a
//! [`TaskQueue`] guarded by one lock. The lock is held only for in-memory
//! insert, remove and pop, never across a broker call or a handler.
//!
//! Each task ends exactly one way:
//!
//! - **fired**: the fire loop popped it and won the atomic fetch-and-delete
//!   of its hash field;
//! - **cancelled**: a tombstone reached [`DelayScheduler::remove`], or the
//!   fetch-and-delete found the field already gone.
//!
//! Mutations only ever come from this process's dispatch loop (add/remove)
//! and fire loop (pop). Producers never touch the hash directly; a cancel is
//! a tombstone on the queue like any other call.
//!
//! ## Fire loop
//!
//! One loop per node, started after the startup reload:
//!
//! - empty list: sleep `poll_interval` and look again;
//! - head not due: sleep `min(remaining, poll_interval)`, so a task added
//!   while asleep is seen within one interval;
//! - head due: pop it, claim it with `hash_take`, execute it on its own task
//!   and push the reply to `"{service}:reply:at:{fire_at}"`.
//!
//! A claim that fails on a broker error puts the task back and backs off.

mod queue;

pub use queue::DelayedTask;
pub(crate) use queue::TaskQueue;

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::dispatch::execute;
use crate::lock::lock_ignore_poison;
use crate::node::Shared;
use crate::protocol::{delay_key, deferred_reply_key, Reply};
use crate::{
    // ---
    log_debug,
    log_error,
    log_info,
    log_warn,
    rendezvous,
    Broker,
    BrokerPtr,
    Result,
    RpcError,
};

/// Convert a wall-clock time to unix nanoseconds.
///
/// # Errors
///
/// [`RpcError::InvalidFireTime`] for times before the epoch or beyond `i64`.
pub fn unix_nanos(t: SystemTime) -> Result<i64> {
    // ---
    let since = t
        .duration_since(UNIX_EPOCH)
        .map_err(|e| RpcError::InvalidFireTime(format!("before unix epoch: {e}")))?;
    i64::try_from(since.as_nanos())
        .map_err(|_| RpcError::InvalidFireTime(format!("{since:?} overflows i64 nanoseconds")))
}

fn now_nanos() -> i64 {
    unix_nanos(SystemTime::now()).unwrap_or(i64::MAX)
}

enum Step {
    Fire(DelayedTask),
    Sleep(Duration),
}

/// Durable, restart-safe, cancellable set of deferred calls.
pub(crate) struct DelayScheduler {
    // ---
    shared: Arc<Shared>,
    pending: Mutex<TaskQueue>,
}

impl DelayScheduler {
    // ---
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self {
            shared,
            pending: Mutex::new(TaskQueue::default()),
        }
    }

    /// Persist a deferred call and start tracking it.
    pub(crate) async fn add(
        &self,
        broker: &dyn Broker,
        service: &str,
        fire_at: i64,
        payload: Bytes,
    ) -> Result<()> {
        // ---
        broker
            .hash_set(&delay_key(service), &fire_at.to_string(), payload)
            .await?;

        let inserted = lock_ignore_poison(&self.pending).insert(DelayedTask::new(service, fire_at));
        log_debug!(
            "{}: scheduled {service} at {fire_at}{}",
            broker.name(),
            if inserted { "" } else { " (replaced payload)" }
        );
        Ok(())
    }

    /// Cancel a deferred call: forget it locally and delete its hash field.
    ///
    /// Cancelling an unknown or already fired task is a no-op.
    pub(crate) async fn remove(&self, broker: &dyn Broker, service: &str, fire_at: i64) -> Result<()> {
        // ---
        let was_pending =
            lock_ignore_poison(&self.pending).remove(&DelayedTask::new(service, fire_at));

        broker
            .hash_delete(&delay_key(service), &fire_at.to_string())
            .await?;

        log_info!(
            "{}: cancelled {service} at {fire_at}{}",
            broker.name(),
            if was_pending { "" } else { " (not pending here)" }
        );
        Ok(())
    }

    /// Scan every durable delay hash this node serves.
    async fn scan(&self) -> Result<Vec<DelayedTask>> {
        // ---
        let mut found = Vec::new();

        for (data_source, broker) in self.shared.brokers.iter() {
            for service in self.shared.registry.services_for(data_source) {
                let fields = broker.hash_fields(&delay_key(&service)).await?;
                let service: Arc<str> = Arc::from(service.as_str());

                for field in fields {
                    match field.parse::<i64>() {
                        Ok(fire_at) => found.push(DelayedTask::new(service.clone(), fire_at)),
                        Err(err) => log_warn!(
                            "{data_source}: ignoring bad delay field {field:?} of {service}: {err}"
                        ),
                    }
                }
            }
        }

        Ok(found)
    }

    /// Rebuild the local list from the durable hashes, replacing it.
    pub(crate) async fn reload(&self) -> Result<usize> {
        // ---
        let found = self.scan().await?;
        let mut pending = lock_ignore_poison(&self.pending);
        pending.replace(found);
        let n = pending.len();
        drop(pending);

        log_info!("delay scheduler reloaded {n} pending task(s)");
        Ok(n)
    }

    /// Merge the durable hashes into the local list without dropping entries.
    async fn resync(&self) -> Result<()> {
        let found = self.scan().await?;
        lock_ignore_poison(&self.pending).merge(found);
        Ok(())
    }

    pub(crate) fn pending(&self) -> Vec<DelayedTask> {
        lock_ignore_poison(&self.pending).snapshot()
    }

    fn next_step(&self) -> Step {
        // ---
        let poll = self.shared.config.poll_interval;
        let now = now_nanos();
        let mut pending = lock_ignore_poison(&self.pending);

        if let Some(task) = pending.pop_due(now) {
            return Step::Fire(task);
        }
        match pending.peek() {
            None => Step::Sleep(poll),
            Some(head) => {
                let remaining = Duration::from_nanos((head.fire_at - now).max(0) as u64);
                Step::Sleep(remaining.min(poll))
            }
        }
    }

    /// Run the fire loop until `shutdown` flips to true or its sender is
    /// dropped.
    pub(crate) async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        // ---
        log_debug!("fire loop started");
        let mut last_resync = Instant::now();

        loop {
            if *shutdown.borrow() {
                break;
            }

            if let Some(every) = self.shared.config.reload_interval {
                if last_resync.elapsed() >= every {
                    last_resync = Instant::now();
                    if let Err(err) = self.resync().await {
                        log_warn!("delay resync failed: {err}");
                    }
                }
            }

            let pause = match self.next_step() {
                Step::Fire(task) => match self.fire(task).await {
                    Ok(()) => continue,
                    Err(err) => {
                        log_error!("fire loop: {err}");
                        self.shared.config.loop_backoff
                    }
                },
                Step::Sleep(d) => d,
            };

            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        log_debug!("fire loop: node dropped without shutdown");
                        break;
                    }
                }
            }
        }

        log_debug!("fire loop stopped");
    }

    /// Claim a due task and start its execution.
    ///
    /// On a broker error the task is put back so a later pass retries it.
    async fn fire(&self, task: DelayedTask) -> Result<()> {
        // ---
        let service = task.service.clone();
        let broker = match self.broker_for(&service) {
            Some(b) => b,
            None => {
                log_warn!("dropping delayed {service}: no route or broker");
                return Ok(());
            }
        };

        let claimed = match broker
            .hash_take(&delay_key(&service), &task.fire_at.to_string())
            .await
        {
            Ok(v) => v,
            Err(err) => {
                lock_ignore_poison(&self.pending).insert(task);
                return Err(err);
            }
        };

        let payload = match claimed {
            Some(p) if !p.is_empty() => p,
            _ => {
                log_debug!(
                    "{}: {service} at {} was cancelled or claimed elsewhere",
                    broker.name(),
                    task.fire_at
                );
                return Ok(());
            }
        };

        log_info!("{}: firing {service} at {}", broker.name(), task.fire_at);

        let registry = self.shared.registry.clone();
        let ttl = self.shared.config.reply_ttl;
        tokio::spawn(async move {
            let reply = execute(&registry, &service, payload).await;
            if let Reply::Err(ref text) = reply {
                log_warn!("delayed {service} at {} failed: {text}", task.fire_at);
            }
            let key = deferred_reply_key(&service, task.fire_at);
            rendezvous::deliver(broker.as_ref(), &key, reply, ttl).await;
        });

        Ok(())
    }

    fn broker_for(&self, service: &str) -> Option<BrokerPtr> {
        // ---
        let route = self.shared.registry.resolve(service)?;
        self.shared.brokers.get(&route.data_source).cloned()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_unix_nanos() {
        // ---
        let t = UNIX_EPOCH + Duration::from_nanos(1_500);
        assert_eq!(unix_nanos(t).unwrap(), 1_500);

        let before = UNIX_EPOCH - Duration::from_secs(1);
        assert!(matches!(unix_nanos(before), Err(RpcError::InvalidFireTime(_))));
    }
}
