//! RPC node.
//!
//! The producer-facing entry point and owner of the worker loops. One
//! `RpcNode` per process is typical: it calls services (wherever they are
//! hosted), schedules and cancels deferred calls, and, once spawned, serves
//! the services registered locally.

use crate::dispatch::Dispatcher;
use crate::lock::lock_ignore_poison;
use crate::protocol::{deferred_reply_key, reply_key};
use crate::rendezvous::await_reply;
use crate::scheduler::{unix_nanos, DelayScheduler};
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    retry_with_backoff,
    BrokerPtr,
    CallEnvelope,
    DelayedTask,
    Result,
    RpcConfig,
    RpcError,
    ServiceRegistry,
};
use bytes::Bytes;
use futures_util::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// State shared by the node, its dispatch loops and the delay scheduler.
pub(crate) struct Shared {
    pub(crate) registry: ServiceRegistry,
    /// Brokers keyed by data source name.
    pub(crate) brokers: HashMap<String, BrokerPtr>,
    pub(crate) config: RpcConfig,
}

/// Stream-backed RPC node.
///
/// Cheap to clone; clones share brokers, the delay scheduler and workers.
///
/// # Example
///
/// ```no_run
/// use stream_rpc::{BrokerBuilder, RpcNodeBuilder, ServiceRegistry};
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Num { n: i64 }
///
/// # async fn example() -> stream_rpc::Result<()> {
/// let registry = ServiceRegistry::new();
/// registry.register("double", |req: Num| async move { Ok(Num { n: req.n * 2 }) });
///
/// let broker = BrokerBuilder::new().uri("redis://localhost:6379").build().await?;
/// let node = RpcNodeBuilder::new(registry).broker(broker).build()?;
/// node.spawn().await?;
///
/// let resp: Num = node.request("double", &Num { n: 21 }).await?;
/// assert_eq!(resp.n, 42);
///
/// node.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RpcNode {
    inner: Arc<Inner>,
}

struct Inner {
    shared: Arc<Shared>,
    scheduler: Arc<DelayScheduler>,

    spawned: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,

    // Shutdown signaling - shared across clones
    shutdown_tx: watch::Sender<bool>,
}

impl RpcNode {
    /// Create a node (internal use by RpcNodeBuilder).
    pub(crate) fn new(
        registry: ServiceRegistry,
        brokers: HashMap<String, BrokerPtr>,
        config: RpcConfig,
    ) -> Self {
        // ---
        let shared = Arc::new(Shared {
            registry,
            brokers,
            config,
        });
        let scheduler = Arc::new(DelayScheduler::new(shared.clone()));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            inner: Arc::new(Inner {
                shared,
                scheduler,
                spawned: AtomicBool::new(false),
                workers: Mutex::new(Vec::new()),
                shutdown_tx,
            }),
        }
    }

    /// The registry this node routes and executes with.
    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.shared.registry
    }

    /// The node configuration.
    pub fn config(&self) -> &RpcConfig {
        &self.inner.shared.config
    }

    /// Broker serving data source `name`.
    pub fn broker(&self, name: &str) -> Option<BrokerPtr> {
        self.inner.shared.brokers.get(name).cloned()
    }

    // Resolve the broker a service's queue lives on.
    fn broker_for(&self, service: &str) -> Result<BrokerPtr> {
        // ---
        let route = self
            .inner
            .shared
            .registry
            .resolve(service)
            .ok_or_else(|| RpcError::ServiceNotFound(service.to_string()))?;

        self.broker(&route.data_source).ok_or_else(|| {
            RpcError::MissingConfig(format!(
                "no broker for data source {} of {service}",
                route.data_source
            ))
        })
    }

    // Append with the optional enqueue retry.
    async fn enqueue(&self, broker: &BrokerPtr, env: CallEnvelope) -> Result<String> {
        // ---
        let config = &self.inner.shared.config;
        retry_with_backoff(config.retry_config.as_ref(), || {
            let broker = broker.clone();
            let env = env.clone();
            let max_len = config.max_queue_len;
            async move { broker.append(&env.service, &env, max_len).await }
        })
        .await
    }

    /// Call a service and wait for its reply, using the configured
    /// `call_timeout`.
    ///
    /// # Errors
    ///
    /// - [`RpcError::ServiceNotFound`] when the name has no route; the broker
    ///   is never touched
    /// - [`RpcError::Timeout`] when the call was enqueued but no reply came
    /// - [`RpcError::Remote`] when the handler reported an error
    /// - transport errors when the call could not be enqueued
    pub async fn call(&self, service: &str, payload: Bytes) -> Result<Bytes> {
        self.call_with_timeout(service, payload, self.inner.shared.config.call_timeout)
            .await
    }

    /// Call a service with a custom reply timeout.
    pub async fn call_with_timeout(
        &self,
        service: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes> {
        // ---
        let broker = self.broker_for(service)?;
        if payload.is_empty() {
            return Err(RpcError::EmptyPayload(service.to_string()));
        }

        let entry_id = self
            .enqueue(&broker, CallEnvelope::immediate(service, payload))
            .await?;
        log_debug!("{}: enqueued {service} as {entry_id}", broker.name());

        await_reply(broker.as_ref(), &reply_key(service, &entry_id), timeout).await
    }

    /// Typed call: encodes `req` and decodes the reply with `serde_json`.
    pub async fn request<TReq, TResp>(&self, service: &str, req: &TReq) -> Result<TResp>
    where
        TReq: Serialize,
        TResp: DeserializeOwned,
    {
        // ---
        let bytes = Bytes::from(serde_json::to_vec(req)?);
        let resp = self.call(service, bytes).await?;
        Ok(serde_json::from_slice(&resp)?)
    }

    /// Schedule a call to run at `at`; returns the fire time in unix nanos.
    ///
    /// Nothing waits for the result. It is still published and can be
    /// observed with [`await_scheduled`](Self::await_scheduled).
    ///
    /// # Errors
    ///
    /// [`RpcError::InvalidFireTime`], [`RpcError::EmptyPayload`],
    /// [`RpcError::ServiceNotFound`], or an enqueue failure.
    pub async fn schedule_at(&self, service: &str, at: SystemTime, payload: Bytes) -> Result<i64> {
        // ---
        let fire_at = unix_nanos(at)?;
        let broker = self.broker_for(service)?;
        if payload.is_empty() {
            return Err(RpcError::EmptyPayload(service.to_string()));
        }

        self.enqueue(&broker, CallEnvelope::deferred(service, fire_at, payload))
            .await?;
        log_debug!("{}: deferred {service} to {fire_at}", broker.name());
        Ok(fire_at)
    }

    /// Typed variant of [`schedule_at`](Self::schedule_at).
    pub async fn schedule_request_at<TReq>(
        &self,
        service: &str,
        at: SystemTime,
        req: &TReq,
    ) -> Result<i64>
    where
        TReq: Serialize,
    {
        let bytes = Bytes::from(serde_json::to_vec(req)?);
        self.schedule_at(service, at, bytes).await
    }

    /// Cancel the call scheduled for `service` at `at`.
    ///
    /// Sends a tombstone through the service queue; the process holding the
    /// task drops it when the tombstone is delivered. Best effort: a task
    /// already claimed by the fire loop still runs. Cancelling twice or
    /// after firing is a no-op.
    pub async fn cancel(&self, service: &str, at: SystemTime) -> Result<()> {
        // ---
        let fire_at = unix_nanos(at)?;
        let broker = self.broker_for(service)?;

        self.enqueue(&broker, CallEnvelope::tombstone(service, fire_at))
            .await?;
        log_debug!("{}: cancel of {service} at {fire_at} enqueued", broker.name());
        Ok(())
    }

    /// Wait for the result of the scheduled call of `service` at `at`.
    ///
    /// The result stays available for `reply_ttl` after the call ran and is
    /// consumed by the first waiter.
    pub async fn await_scheduled(
        &self,
        service: &str,
        at: SystemTime,
        timeout: Duration,
    ) -> Result<Bytes> {
        // ---
        let fire_at = unix_nanos(at)?;
        let broker = self.broker_for(service)?;
        await_reply(broker.as_ref(), &deferred_reply_key(service, fire_at), timeout).await
    }

    /// Start serving.
    ///
    /// Provisions the consumer group on every locally handled queue, reloads
    /// pending deferred calls from the durable store, then starts the fire
    /// loop and one dispatch loop per broker with local services.
    ///
    /// # Errors
    ///
    /// [`RpcError::ConfigConflict`] when called twice; broker errors from
    /// provisioning or the reload.
    pub async fn spawn(&self) -> Result<()> {
        // ---
        if self.inner.spawned.swap(true, Ordering::SeqCst) {
            return Err(RpcError::ConfigConflict("node already spawned".into()));
        }

        match self.start_workers().await {
            Ok(handles) => {
                lock_ignore_poison(&self.inner.workers).extend(handles);
                Ok(())
            }
            Err(err) => {
                self.inner.spawned.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    async fn start_workers(&self) -> Result<Vec<JoinHandle<()>>> {
        // ---
        let shared = &self.inner.shared;

        let mut dispatchers = Vec::new();
        for (data_source, broker) in shared.brokers.iter() {
            let services = shared.registry.services_for(data_source);
            if services.is_empty() {
                continue;
            }
            let d = Dispatcher::new(
                shared.clone(),
                self.inner.scheduler.clone(),
                broker.clone(),
                services,
            );
            d.provision().await?;
            dispatchers.push(d);
        }

        self.inner.scheduler.reload().await?;

        let mut handles = Vec::with_capacity(dispatchers.len() + 1);
        let fire = self.inner.scheduler.clone();
        handles.push(tokio::spawn(fire.run(self.inner.shutdown_tx.subscribe())));

        for d in dispatchers {
            handles.push(tokio::spawn(d.run(self.inner.shutdown_tx.subscribe())));
        }

        log_info!("node spawned with {} worker(s)", handles.len());
        Ok(handles)
    }

    /// Rebuild the pending delayed list from the durable store, replacing
    /// the local copy. Returns the number of pending tasks.
    pub async fn reload_delayed(&self) -> Result<usize> {
        self.inner.scheduler.reload().await
    }

    /// Deferred calls this process currently tracks, in firing order.
    pub fn pending_delayed(&self) -> Vec<DelayedTask> {
        self.inner.scheduler.pending()
    }

    /// Stop all worker loops, wait for them, and close the brokers.
    ///
    /// Executions already started run to completion on their own tasks.
    /// Dropping every clone of the node also stops the loops, but leaves the
    /// brokers open until their last reference goes away.
    pub async fn shutdown(&self) {
        // ---
        self.inner.shutdown_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = {
            let mut workers = lock_ignore_poison(&self.inner.workers);
            workers.drain(..).collect()
        };
        join_all(handles).await;

        for broker in self.inner.shared.brokers.values() {
            if let Err(err) = broker.close().await {
                log_warn!("{}: close failed: {err}", broker.name());
            }
        }
        log_info!("node shut down");
    }
}
