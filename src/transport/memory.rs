//! In-memory broker implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Broker` trait. It is intended primarily for testing, local execution,
//! and as a reference for broker semantics.
//!
//! ## Reference Semantics
//!
//! The in-memory broker defines the **reference behavior** for the broker
//! layer. The Redis broker is expected to match it and to document any
//! unavoidable deviations.
//!
//! In particular, the in-memory broker establishes the following expectations:
//!
//! - Entry ids are `"{millis}-{seq}"` and strictly increase per queue.
//! - `append()` trims exactly to `max_len`, evicting the oldest entries.
//! - A consumer group created on a queue only sees entries appended after
//!   its creation, and each entry is delivered to exactly one reader of the
//!   group.
//! - Reply lists expire `ttl` after the most recent push.
//! - `hash_take()` is atomic with respect to every other hub operation.
//!
//! ## Non-Goals
//!
//! This broker does not persist anything and does not emulate network
//! failures. Restart durability is simulated by keeping a `MemoryHub` alive
//! while brokers and nodes come and go.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::lock::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    Broker,
    BrokerBase,
    BrokerConfig,
    BrokerPtr,
    CallEnvelope,
    Delivery,
    Result,
    RpcError,
};

type EntryId = (u64, u64);

fn format_id(id: EntryId) -> String {
    format!("{}-{}", id.0, id.1)
}

fn now_millis() -> u64 {
    // ---
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[derive(Default)]
struct MemQueue {
    // ---
    entries: VecDeque<(EntryId, CallEnvelope)>,
    last_id: EntryId,
    /// Group name -> id of the last entry delivered to that group.
    groups: HashMap<String, EntryId>,
}

impl MemQueue {
    // ---
    fn next_id(&mut self) -> EntryId {
        let ms = now_millis();
        let id = if ms > self.last_id.0 {
            (ms, 0)
        } else {
            (self.last_id.0, self.last_id.1 + 1)
        };
        self.last_id = id;
        id
    }

    fn push(&mut self, env: CallEnvelope, max_len: usize) -> EntryId {
        // ---
        let id = self.next_id();
        self.entries.push_back((id, env));
        while self.entries.len() > max_len {
            self.entries.pop_front();
        }
        id
    }
}

struct MemList {
    values: VecDeque<Bytes>,
    expires_at: Instant,
}

#[derive(Default)]
struct HubState {
    // ---
    queues: HashMap<String, MemQueue>,
    lists: HashMap<String, MemList>,
    hashes: HashMap<String, HashMap<String, Bytes>>,
}

impl HubState {
    // ---
    /// Drop `key` if its expiry has passed, then return the live list.
    fn live_list(&mut self, key: &str) -> Option<&mut MemList> {
        let expired = matches!(self.lists.get(key), Some(l) if l.expires_at <= Instant::now());
        if expired {
            self.lists.remove(key);
        }
        self.lists.get_mut(key)
    }
}

/// Shared store for the in-memory broker.
///
/// Simulates a Redis-compatible server within a single process. All
/// `MemoryBroker` instances that share a `MemoryHub` see the same queues,
/// reply lists and hashes, exactly as processes connected to one server
/// would.
///
/// # Usage in Integration Tests
///
/// For integration tests that need isolation between parallel test cases,
/// construct a hub explicitly and pass it to [`create_memory_broker_with_hub`]:
///
/// ```
/// # use stream_rpc::{BrokerBuilder, MemoryHub};
/// # async fn example() -> stream_rpc::Result<()> {
/// let hub = MemoryHub::new();
///
/// let first = BrokerBuilder::new().memory_hub(hub.clone()).build().await?;
/// let second = BrokerBuilder::new().memory_hub(hub.clone()).build().await?;
/// # Ok(())
/// # }
/// ```
pub struct MemoryHub {
    // ---
    state: Mutex<HubState>,
    changed: Notify,
}

impl MemoryHub {
    /// Create a new, empty hub.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Delete `queue` together with its consumer groups, like `DEL` on a
    /// stream key. Returns whether the queue existed.
    ///
    /// Readers blocked on the queue wake up and report it missing.
    pub fn delete_queue(&self, queue: &str) -> bool {
        // ---
        let existed = lock_ignore_poison(&self.state).queues.remove(queue).is_some();
        self.notify();
        existed
    }

    fn notify(&self) {
        self.changed.notify_waiters();
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        // ---
        Self {
            state: Mutex::new(HubState::default()),
            changed: Notify::new(),
        }
    }
}

/// Process-global hub used by [`create_memory_broker`].
static GLOBAL_HUB: OnceLock<Arc<MemoryHub>> = OnceLock::new();

fn global_hub() -> Arc<MemoryHub> {
    GLOBAL_HUB.get_or_init(MemoryHub::new).clone()
}

/// In-memory broker.
///
/// Routes every operation through a shared [`MemoryHub`].
struct MemoryBroker {
    // ---
    base: BrokerBase,
    hub: Arc<MemoryHub>,
    closed: AtomicBool,
}

impl MemoryBroker {
    // ---
    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(RpcError::Transport(format!(
                "{}: broker closed",
                self.base.name
            )));
        }
        Ok(())
    }

    fn try_read(
        &self,
        group: &str,
        queues: &[String],
        count: usize,
    ) -> Result<Vec<Delivery>> {
        // ---
        let mut state = lock_ignore_poison(&self.hub.state);
        let mut out = Vec::new();

        // Validate every queue first so a failed read advances no cursor.
        for name in queues {
            let present = state
                .queues
                .get(name)
                .is_some_and(|q| q.groups.contains_key(group));
            if !present {
                return Err(RpcError::MissingQueue(name.clone()));
            }
        }

        for name in queues {
            let queue = state
                .queues
                .get_mut(name)
                .ok_or_else(|| RpcError::MissingQueue(name.clone()))?;

            let last = *queue
                .groups
                .get(group)
                .ok_or_else(|| RpcError::MissingQueue(name.clone()))?;

            let fresh: Vec<(EntryId, CallEnvelope)> = queue
                .entries
                .iter()
                .filter(|(id, _)| *id > last)
                .take(count)
                .cloned()
                .collect();

            if let Some((newest, _)) = fresh.last() {
                queue.groups.insert(group.to_string(), *newest);
            }

            let queue_name: Arc<str> = Arc::from(name.as_str());
            for (id, env) in fresh {
                let id: Arc<str> = Arc::from(format_id(id));
                out.push(Delivery {
                    queue: queue_name.clone(),
                    id: id.clone(),
                    envelope: env.with_entry_id(id),
                });
            }
        }

        Ok(out)
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    // ---
    fn base(&self) -> &BrokerBase {
        &self.base
    }

    async fn append(&self, queue: &str, env: &CallEnvelope, max_len: usize) -> Result<String> {
        // ---
        self.check_open()?;

        let mut stored = env.clone();
        stored.service = Arc::from(queue);
        stored.entry_id = None;

        let id = {
            let mut state = lock_ignore_poison(&self.hub.state);
            let q = state.queues.entry(queue.to_string()).or_default();
            q.push(stored, max_len.max(1))
        };
        self.hub.notify();

        Ok(format_id(id))
    }

    async fn append_placeholder(&self, queue: &str) -> Result<String> {
        // ---
        self.append(queue, &CallEnvelope::immediate(queue, Bytes::new()), usize::MAX)
            .await
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool> {
        self.check_open()?;
        Ok(lock_ignore_poison(&self.hub.state).queues.contains_key(queue))
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        // ---
        self.check_open()?;
        let state = lock_ignore_poison(&self.hub.state);
        Ok(state.queues.get(queue).map(|q| q.entries.len()).unwrap_or(0))
    }

    async fn list_groups(&self, queue: &str) -> Result<Vec<String>> {
        // ---
        self.check_open()?;
        let state = lock_ignore_poison(&self.hub.state);
        let queue = state
            .queues
            .get(queue)
            .ok_or_else(|| RpcError::MissingQueue(queue.to_string()))?;
        Ok(queue.groups.keys().cloned().collect())
    }

    async fn create_group(&self, queue: &str, group: &str) -> Result<()> {
        // ---
        self.check_open()?;
        let mut state = lock_ignore_poison(&self.hub.state);
        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| RpcError::MissingQueue(queue.to_string()))?;
        let tail = q.last_id;
        q.groups.entry(group.to_string()).or_insert(tail);
        log_debug!("{}: group {group} ready on {queue}", self.base.name);
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        _consumer: &str,
        queues: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>> {
        // ---
        let deadline = Instant::now() + block;

        loop {
            let notified = self.hub.changed.notified();
            self.check_open()?;

            let delivered = self.try_read(group, queues, count.max(1))?;
            if !delivered.is_empty() {
                return Ok(delivered);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn ack(&self, _queue: &str, _group: &str, _ids: &[Arc<str>]) -> Result<()> {
        // No pending-entry bookkeeping: delivery already advanced the group cursor.
        self.check_open()
    }

    async fn push_reply(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        // ---
        self.check_open()?;
        {
            let mut state = lock_ignore_poison(&self.hub.state);
            let expires_at = Instant::now() + ttl;
            match state.live_list(key) {
                Some(list) => {
                    list.values.push_back(value);
                    list.expires_at = expires_at;
                }
                None => {
                    state.lists.insert(
                        key.to_string(),
                        MemList {
                            values: VecDeque::from([value]),
                            expires_at,
                        },
                    );
                }
            }
        }
        self.hub.notify();
        Ok(())
    }

    async fn pop_reply(&self, key: &str, timeout: Duration) -> Result<Option<Bytes>> {
        // ---
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.hub.changed.notified();
            self.check_open()?;

            {
                let mut state = lock_ignore_poison(&self.hub.state);
                if let Some(list) = state.live_list(key) {
                    let value = list.values.pop_front();
                    if list.values.is_empty() {
                        state.lists.remove(key);
                    }
                    if value.is_some() {
                        return Ok(value);
                    }
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let _ = tokio::time::timeout(deadline - now, notified).await;
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: Bytes) -> Result<()> {
        // ---
        self.check_open()?;
        let mut state = lock_ignore_poison(&self.hub.state);
        state
            .hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_fields(&self, key: &str) -> Result<Vec<String>> {
        // ---
        self.check_open()?;
        let state = lock_ignore_poison(&self.hub.state);
        Ok(state
            .hashes
            .get(key)
            .map(|h| h.keys().cloned().collect())
            .unwrap_or_default())
    }

    async fn hash_take(&self, key: &str, field: &str) -> Result<Option<Bytes>> {
        // ---
        self.check_open()?;
        let mut state = lock_ignore_poison(&self.hub.state);
        let Some(hash) = state.hashes.get_mut(key) else {
            return Ok(None);
        };
        let value = hash.remove(field);
        if hash.is_empty() {
            state.hashes.remove(key);
        }
        Ok(value)
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        // ---
        self.hash_take(key, field).await.map(|_| ())
    }

    /// Close this broker.
    ///
    /// Only this handle is closed; the hub and every other broker sharing it
    /// keep working. Blocked reads on this handle return promptly.
    async fn close(&self) -> Result<()> {
        // ---
        log_debug!("{}: closing memory broker...", self.base.name);
        self.closed.store(true, Ordering::Release);
        self.hub.notify();
        Ok(())
    }
}

/// Create a new in-memory broker using the process-global hub.
///
/// All brokers created with this function share a single store, matching
/// the semantics of processes connected to one real server.
///
/// For isolated parallel testing, use [`create_memory_broker_with_hub`].
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_broker(config: BrokerConfig) -> Result<BrokerPtr> {
    // ---
    create_memory_broker_with_hub(config, global_hub()).await
}

/// Create a new in-memory broker using the provided hub.
///
/// # Errors
///
/// Currently infallible; always returns `Ok`.
pub async fn create_memory_broker_with_hub(
    config: BrokerConfig,
    hub: Arc<MemoryHub>,
) -> Result<BrokerPtr> {
    // ---
    log_debug!("{}: create memory broker", config.name);

    Ok(Arc::new(MemoryBroker {
        base: BrokerBase::from(&config),
        hub,
        closed: AtomicBool::new(false),
    }))
}
