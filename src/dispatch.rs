//! Dispatch/receive loop.
//!
//! One loop per broker, reading every locally handled service queue through
//! the shared consumer group with a single blocking read. Each delivered entry
//! is acknowledged as soon as it is read (at-most-once) and then routed:
//!
//! - placeholder: skipped;
//! - deferred call: handed to the delay scheduler (`add`);
//! - tombstone: handed to the delay scheduler (`remove`);
//! - immediate call: executed on its own task, reply pushed to
//!   `"{service}:reply:{entry_id}"`.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::watch;

use crate::node::Shared;
use crate::protocol::{reply_key, Reply};
use crate::scheduler::DelayScheduler;
use crate::{
    // ---
    ensure_group,
    log_debug,
    log_error,
    log_info,
    log_warn,
    rendezvous,
    BrokerPtr,
    Delivery,
    RpcError,
    ServiceRegistry,
};

/// Run the handler registered for `service` on `payload`.
///
/// Never fails: a missing handler or a handler error becomes [`Reply::Err`].
pub(crate) async fn execute(registry: &ServiceRegistry, service: &str, payload: Bytes) -> Reply {
    // ---
    let handler = match registry.resolve(service).and_then(|r| r.handler) {
        Some(h) => h,
        None => {
            log_warn!("no handler for service: {service}");
            return Reply::Err(RpcError::ServiceNotFound(service.to_string()).to_string());
        }
    };

    Reply::from_result(handler.invoke(payload).await)
}

/// Dispatch loop for one broker.
pub(crate) struct Dispatcher {
    // ---
    shared: Arc<Shared>,
    scheduler: Arc<DelayScheduler>,
    broker: BrokerPtr,
    services: Vec<String>,
}

impl Dispatcher {
    // ---
    pub(crate) fn new(
        shared: Arc<Shared>,
        scheduler: Arc<DelayScheduler>,
        broker: BrokerPtr,
        services: Vec<String>,
    ) -> Self {
        Self {
            shared,
            scheduler,
            broker,
            services,
        }
    }

    /// Provision the group on every served queue.
    pub(crate) async fn provision(&self) -> crate::Result<()> {
        // ---
        for service in &self.services {
            ensure_group(self.broker.as_ref(), service, &self.shared.config.group).await?;
        }
        Ok(())
    }

    /// Read, acknowledge and route entries until `shutdown` flips to true or
    /// its sender is dropped.
    pub(crate) async fn run(self, mut shutdown: watch::Receiver<bool>) {
        // ---
        let config = &self.shared.config;
        let name = self.broker.name().to_string();
        let consumer = self.broker.consumer().to_string();

        log_info!(
            "{name}: dispatch loop started as {consumer} in {} on {:?}",
            config.group,
            self.services
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let read = self.broker.read_group(
                &config.group,
                &consumer,
                &self.services,
                config.read_count,
                config.read_block,
            );

            let result = tokio::select! {
                r = read => r,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        log_debug!("{name}: node dropped without shutdown");
                        break;
                    }
                    continue;
                }
            };

            let deliveries = match result {
                Ok(d) => d,
                Err(RpcError::MissingQueue(queue)) => {
                    log_warn!("{name}: queue or group missing on {queue}, provisioning");
                    if let Err(err) =
                        ensure_group(self.broker.as_ref(), &queue, &config.group).await
                    {
                        log_error!("{name}: provisioning {queue} failed: {err}");
                        if !self.pause(&mut shutdown).await {
                            break;
                        }
                    }
                    continue;
                }
                Err(err) => {
                    log_error!("{name}: read failed: {err}");
                    if !self.pause(&mut shutdown).await {
                        break;
                    }
                    continue;
                }
            };

            if deliveries.is_empty() {
                continue;
            }

            self.ack_all(&deliveries).await;

            for delivery in deliveries {
                self.route(delivery).await;
            }
        }

        log_info!("{name}: dispatch loop stopped");
    }

    // Back off after a failed read; false once the shutdown sender is gone.
    async fn pause(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.shared.config.loop_backoff) => true,
            changed = shutdown.changed() => changed.is_ok(),
        }
    }

    async fn ack_all(&self, deliveries: &[Delivery]) {
        // ---
        let mut by_queue: HashMap<Arc<str>, Vec<Arc<str>>> = HashMap::new();
        for d in deliveries {
            by_queue.entry(d.queue.clone()).or_default().push(d.id.clone());
        }

        for (queue, ids) in by_queue {
            if let Err(err) = self
                .broker
                .ack(&queue, &self.shared.config.group, &ids)
                .await
            {
                log_warn!("{}: ack on {queue} failed: {err}", self.broker.name());
            }
        }
    }

    async fn route(&self, delivery: Delivery) {
        // ---
        let env = delivery.envelope;
        let service = env.service.clone();

        if env.is_placeholder() {
            return;
        }

        if let Some(fire_at) = env.fire_at {
            let res = if env.is_tombstone() {
                self.scheduler
                    .remove(self.broker.as_ref(), &service, fire_at)
                    .await
            } else {
                self.scheduler
                    .add(self.broker.as_ref(), &service, fire_at, env.payload)
                    .await
            };
            if let Err(err) = res {
                log_error!("{}: delayed {service} at {fire_at}: {err}", self.broker.name());
            }
            return;
        }

        log_debug!("{}: executing {service} ({})", self.broker.name(), delivery.id);

        let registry = self.shared.registry.clone();
        let broker = self.broker.clone();
        let ttl = self.shared.config.reply_ttl;
        let key = reply_key(&service, &delivery.id);

        tokio::spawn(async move {
            let reply = execute(&registry, &service, env.payload).await;
            rendezvous::deliver(broker.as_ref(), &key, reply, ttl).await;
        });
    }
}
