//! Redis broker implementation using `redis`.
//!
//! This module provides an implementation of the `Broker` trait backed by
//! Redis streams, lists and hashes.
//!
//! ## Connections
//!
//! Redis processes the commands of one connection strictly in order, so a
//! blocking command (`XREADGROUP ... BLOCK`, `BLPOP`) stalls everything queued
//! behind it on the same socket. Three kinds of connection are therefore used:
//!
//! - `conn`: a shared `MultiplexedConnection` for every non-blocking command.
//!   It is cheap to clone and safe to use from many tasks at once.
//! - `read_conn`: a dedicated connection for `XREADGROUP`, opened lazily and
//!   reused by the (single) dispatch loop of this data source.
//! - a fresh connection per `BLPOP`, since several callers may be waiting on
//!   replies at the same time.
//!
//! ## Wire shape
//!
//! A call is one stream entry with field `data` (payload bytes) and, for
//! deferred calls and tombstones, field `timeAt` (decimal unix nanoseconds).
//! The provisioning placeholder carries only `init`.
//!
//! An entry whose `timeAt` does not parse is logged and delivered as a
//! placeholder, so it is still acknowledged but never routed.
//!
//! ## Deadlines
//!
//! Every command is bounded: blocking reads by their own timeout plus
//! [`BLOCK_GRACE`], everything else (and opening a connection) by
//! [`COMMAND_TIMEOUT`]. A stalled server surfaces as
//! [`RpcError::TransportRetryable`].
//!
//! ## Atomic claim
//!
//! `hash_take` runs `HGET` and `HDEL` inside one `MULTI`/`EXEC` transaction.
//! Two processes racing for the same due task are serialized by the server;
//! only the first sees the payload.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamInfoGroupsReply, StreamReadReply};
use redis::{RedisError, RedisResult};
use tokio::sync::Mutex;

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    log_warn,
    Broker,
    BrokerBase,
    BrokerConfig,
    BrokerPtr,
    CallEnvelope,
    Delivery,
    Result,
    RpcError,
};

const FIELD_DATA: &str = "data";
const FIELD_TIME_AT: &str = "timeAt";
const FIELD_INIT: &str = "init";

/// Extra time granted to a blocking command beyond its server-side timeout.
const BLOCK_GRACE: Duration = Duration::from_secs(2);

/// Upper bound on any non-blocking command, including connection setup.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);

/// Redis implementation of the `Broker` trait.
pub struct RedisBroker {
    // ---
    base: BrokerBase,
    client: redis::Client,
    conn: MultiplexedConnection,
    read_conn: Mutex<Option<MultiplexedConnection>>,
    closed: AtomicBool,
}

impl RedisBroker {
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

    fn conn(&self) -> Result<MultiplexedConnection> {
        self.check_open()?;
        Ok(self.conn.clone())
    }

    async fn dedicated_conn(&self) -> Result<MultiplexedConnection> {
        // ---
        self.run(
            "open dedicated connection",
            self.client.get_multiplexed_async_connection(),
        )
        .await
    }

    /// Await `fut` for at most [`COMMAND_TIMEOUT`], keeping the raw redis
    /// result for callers that inspect server error codes.
    async fn timed<T, F>(&self, what: &str, fut: F) -> Result<RedisResult<T>>
    where
        F: Future<Output = RedisResult<T>>,
    {
        within(&self.base.name, what, COMMAND_TIMEOUT, fut).await
    }

    /// Await `fut` for at most [`COMMAND_TIMEOUT`] and classify any error.
    async fn run<T, F>(&self, what: &str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        self.timed(what, fut)
            .await?
            .map_err(|err| self.map_err(what, err))
    }

    /// Classify a redis error into the crate error taxonomy.
    fn map_err(&self, what: &str, err: RedisError) -> RpcError {
        // ---
        let msg = format!("{}: {what} failed: {err}", self.base.name);
        log_error!("{msg}");

        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            RpcError::TransportRetryable(msg)
        } else {
            RpcError::Transport(msg)
        }
    }

    /// Decode one stream entry into an envelope.
    fn decode_entry(queue: &str, entry: &StreamId) -> Result<CallEnvelope> {
        // ---
        let payload: Vec<u8> = entry.get(FIELD_DATA).unwrap_or_default();

        let fire_at = match entry.get::<String>(FIELD_TIME_AT) {
            Some(raw) => Some(raw.parse::<i64>().map_err(|err| {
                RpcError::Transport(format!(
                    "entry {} on {queue}: bad {FIELD_TIME_AT} {raw:?}: {err}",
                    entry.id
                ))
            })?),
            None => None,
        };

        Ok(CallEnvelope {
            service: Arc::from(queue),
            payload: Bytes::from(payload),
            fire_at,
            entry_id: Some(Arc::from(entry.id.as_str())),
        })
    }
}

/// Await `fut` for at most `limit`; expiry is retryable.
async fn within<T, F>(name: &str, what: &str, limit: Duration, fut: F) -> Result<RedisResult<T>>
where
    F: Future<Output = RedisResult<T>>,
{
    // ---
    tokio::time::timeout(limit, fut).await.map_err(|_| {
        let msg = format!("{name}: {what} did not return within {limit:?}");
        log_error!("{msg}");
        RpcError::TransportRetryable(msg)
    })
}

/// Turn one stream entry into a delivery.
///
/// Placeholders and undecodable entries come back as placeholder envelopes:
/// the dispatch loop acknowledges them with the rest of the batch and skips
/// them.
fn decode_delivery(queue: &Arc<str>, entry: &StreamId) -> Delivery {
    // ---
    let envelope = if entry.map.contains_key(FIELD_INIT) {
        None
    } else {
        match RedisBroker::decode_entry(queue, entry) {
            Ok(env) => Some(env),
            Err(err) => {
                log_warn!("skipping undecodable entry: {err}");
                None
            }
        }
    };

    let envelope = envelope.unwrap_or_else(|| {
        CallEnvelope::immediate(queue.clone(), Bytes::new()).with_entry_id(entry.id.as_str())
    });

    Delivery {
        queue: queue.clone(),
        id: Arc::from(entry.id.as_str()),
        envelope,
    }
}

/// Pull the queue name out of a `NOGROUP` error.
///
/// Redis reports `No such key 'orders' or consumer group 'rpc' in XREADGROUP
/// with GROUP option`; the first quoted token is the queue.
fn missing_queue_name(err: &RedisError) -> Option<String> {
    // ---
    if err.code() != Some("NOGROUP") {
        return None;
    }
    let text = err.to_string();
    let start = text.find('\'')? + 1;
    let len = text[start..].find('\'')?;
    Some(text[start..start + len].to_string())
}

/// Whether a server error says the stream key does not exist.
///
/// `XINFO` answers `no such key`; `XGROUP CREATE` without `MKSTREAM` answers
/// `The XGROUP subcommand requires the key to exist`.
fn is_no_such_key(text: &str) -> bool {
    let text = text.to_ascii_lowercase();
    text.contains("no such key") || text.contains("requires the key to exist")
}

#[async_trait::async_trait]
impl Broker for RedisBroker {
    // ---

    fn base(&self) -> &BrokerBase {
        &self.base
    }

    async fn append(&self, queue: &str, env: &CallEnvelope, max_len: usize) -> Result<String> {
        // ---
        let mut conn = self.conn()?;

        let mut cmd = redis::cmd("XADD");
        cmd.arg(queue)
            .arg("MAXLEN")
            .arg(max_len)
            .arg("*")
            .arg(FIELD_DATA)
            .arg(env.payload.as_ref());
        if let Some(fire_at) = env.fire_at {
            cmd.arg(FIELD_TIME_AT).arg(fire_at.to_string());
        }

        let id: String = self
            .run(&format!("XADD {queue}"), cmd.query_async(&mut conn))
            .await?;
        Ok(id)
    }

    async fn append_placeholder(&self, queue: &str) -> Result<String> {
        // ---
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("XADD");
        cmd.arg(queue).arg("*").arg(FIELD_INIT).arg(1);
        let id: String = self
            .run(
                &format!("XADD placeholder {queue}"),
                cmd.query_async(&mut conn),
            )
            .await?;
        Ok(id)
    }

    async fn queue_exists(&self, queue: &str) -> Result<bool> {
        // ---
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("EXISTS");
        cmd.arg(queue);
        let n: i64 = self
            .run(&format!("EXISTS {queue}"), cmd.query_async(&mut conn))
            .await?;
        Ok(n > 0)
    }

    async fn queue_len(&self, queue: &str) -> Result<usize> {
        // ---
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("XLEN");
        cmd.arg(queue);
        let n: usize = self
            .run(&format!("XLEN {queue}"), cmd.query_async(&mut conn))
            .await?;
        Ok(n)
    }

    async fn list_groups(&self, queue: &str) -> Result<Vec<String>> {
        // ---
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("XINFO");
        cmd.arg("GROUPS").arg(queue);
        let reply: RedisResult<StreamInfoGroupsReply> = self
            .timed(&format!("XINFO GROUPS {queue}"), cmd.query_async(&mut conn))
            .await?;

        match reply {
            Ok(reply) => Ok(reply.groups.into_iter().map(|g| g.name).collect()),
            Err(err) if is_no_such_key(&err.to_string()) => {
                Err(RpcError::MissingQueue(queue.to_string()))
            }
            Err(err) => Err(self.map_err(&format!("XINFO GROUPS {queue}"), err)),
        }
    }

    async fn create_group(&self, queue: &str, group: &str) -> Result<()> {
        // ---
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("XGROUP");
        cmd.arg("CREATE").arg(queue).arg(group).arg("$");
        let reply: RedisResult<()> = self
            .timed(
                &format!("XGROUP CREATE {queue} {group}"),
                cmd.query_async(&mut conn),
            )
            .await?;

        match reply {
            Ok(()) => {
                log_info!("{}: created group {group} on {queue}", self.base.name);
                Ok(())
            }
            Err(err) if err.code() == Some("BUSYGROUP") => {
                log_debug!("{}: group {group} on {queue} already exists", self.base.name);
                Ok(())
            }
            Err(err) if is_no_such_key(&err.to_string()) => {
                Err(RpcError::MissingQueue(queue.to_string()))
            }
            Err(err) => Err(self.map_err(&format!("XGROUP CREATE {queue} {group}"), err)),
        }
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        queues: &[String],
        count: usize,
        block: Duration,
    ) -> Result<Vec<Delivery>> {
        // ---
        self.check_open()?;

        let mut guard = self.read_conn.lock().await;
        let cached = guard.clone();
        let mut conn = match cached {
            Some(conn) => conn,
            None => {
                let conn = self.dedicated_conn().await?;
                *guard = Some(conn.clone());
                conn
            }
        };

        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count.max(1))
            .arg("BLOCK")
            .arg(block.as_millis().max(1) as u64)
            .arg("STREAMS");
        for queue in queues {
            cmd.arg(queue);
        }
        for _ in queues {
            cmd.arg(">");
        }

        let fut = async {
            let reply: redis::RedisResult<Option<StreamReadReply>> = cmd.query_async(&mut conn).await;
            reply
        };
        let reply = match tokio::time::timeout(block + BLOCK_GRACE, fut).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(err)) => {
                if let Some(queue) = missing_queue_name(&err) {
                    return Err(RpcError::MissingQueue(queue));
                }
                // Force a reconnect on the next read.
                *guard = None;
                return Err(self.map_err("XREADGROUP", err));
            }
            Err(_) => {
                *guard = None;
                return Err(RpcError::TransportRetryable(format!(
                    "{}: XREADGROUP did not return within {:?}",
                    self.base.name,
                    block + BLOCK_GRACE
                )));
            }
        };
        drop(guard);

        // The server has already handed the whole batch to this consumer, so
        // every entry must come back for acknowledgement.
        let mut out = Vec::new();
        for key in reply.map(|r| r.keys).unwrap_or_default() {
            let queue: Arc<str> = Arc::from(key.key.as_str());
            out.extend(key.ids.iter().map(|entry| decode_delivery(&queue, entry)));
        }
        Ok(out)
    }

    async fn ack(&self, queue: &str, group: &str, ids: &[Arc<str>]) -> Result<()> {
        // ---
        if ids.is_empty() {
            return Ok(());
        }
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("XACK");
        cmd.arg(queue).arg(group);
        for id in ids {
            cmd.arg(id.as_ref());
        }
        let _acked: i64 = self
            .run(&format!("XACK {queue}"), cmd.query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn push_reply(&self, key: &str, value: Bytes, ttl: Duration) -> Result<()> {
        // ---
        let mut conn = self.conn()?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("RPUSH")
            .arg(key)
            .arg(value.as_ref())
            .ignore()
            .cmd("PEXPIRE")
            .arg(key)
            .arg(ttl.as_millis().max(1) as u64)
            .ignore();
        let () = self
            .run(&format!("RPUSH {key}"), pipe.query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn pop_reply(&self, key: &str, timeout: Duration) -> Result<Option<Bytes>> {
        // ---
        self.check_open()?;
        let mut conn = self.dedicated_conn().await?;

        // BLPOP treats 0 as "forever"; never send it.
        let secs = timeout.as_secs_f64().max(0.001);

        let fut = async {
            let reply: redis::RedisResult<Option<(String, Vec<u8>)>> = redis::cmd("BLPOP")
                .arg(key)
                .arg(secs)
                .query_async(&mut conn)
                .await;
            reply
        };

        match tokio::time::timeout(timeout + BLOCK_GRACE, fut).await {
            Ok(Ok(reply)) => Ok(reply.map(|(_, value)| Bytes::from(value))),
            Ok(Err(err)) => Err(self.map_err(&format!("BLPOP {key}"), err)),
            Err(_) => Ok(None),
        }
    }

    async fn hash_set(&self, key: &str, field: &str, value: Bytes) -> Result<()> {
        // ---
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key).arg(field).arg(value.as_ref());
        let _added: i64 = self
            .run(&format!("HSET {key} {field}"), cmd.query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn hash_fields(&self, key: &str) -> Result<Vec<String>> {
        // ---
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("HKEYS");
        cmd.arg(key);
        let fields: Vec<String> = self
            .run(&format!("HKEYS {key}"), cmd.query_async(&mut conn))
            .await?;
        Ok(fields)
    }

    async fn hash_take(&self, key: &str, field: &str) -> Result<Option<Bytes>> {
        // ---
        let mut conn = self.conn()?;
        let mut pipe = redis::pipe();
        pipe.atomic()
            .cmd("HGET")
            .arg(key)
            .arg(field)
            .cmd("HDEL")
            .arg(key)
            .arg(field);
        let (value, _removed): (Option<Vec<u8>>, i64) = self
            .run(
                &format!("HGET/HDEL {key} {field}"),
                pipe.query_async(&mut conn),
            )
            .await?;
        Ok(value.map(Bytes::from))
    }

    async fn hash_delete(&self, key: &str, field: &str) -> Result<()> {
        // ---
        let mut conn = self.conn()?;
        let mut cmd = redis::cmd("HDEL");
        cmd.arg(key).arg(field);
        let _removed: i64 = self
            .run(&format!("HDEL {key} {field}"), cmd.query_async(&mut conn))
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        // ---
        log_debug!("{}: closing redis broker", self.base.name);
        self.closed.store(true, Ordering::Release);
        self.read_conn.lock().await.take();
        Ok(())
    }
}

/// Creates a Redis broker from the given configuration.
///
/// # Errors
///
/// Returns an error if:
/// - The broker URI is missing or cannot be parsed
/// - Connection to the Redis server fails (the shared connection is eager)
pub async fn create_broker(config: BrokerConfig) -> Result<BrokerPtr> {
    // ---

    let uri = if config.uri.is_empty() {
        return Err(RpcError::MissingConfig("Redis broker requires URI".into()));
    } else {
        &config.uri
    };

    let client = redis::Client::open(uri.as_str()).map_err(|err| {
        let msg = format!("redis: failed to open client for URI {uri}: {err}");
        log_error!("{msg}");
        RpcError::Transport(msg)
    })?;

    let conn = match tokio::time::timeout(
        COMMAND_TIMEOUT,
        client.get_multiplexed_async_connection(),
    )
    .await
    {
        Ok(Ok(conn)) => conn,
        Ok(Err(err)) => {
            let msg = format!("redis: failed to connect to {uri}: {err}");
            log_error!("{msg}");
            return Err(RpcError::TransportRetryable(msg));
        }
        Err(_) => {
            let msg = format!("redis: no connection to {uri} within {COMMAND_TIMEOUT:?}");
            log_error!("{msg}");
            return Err(RpcError::TransportRetryable(msg));
        }
    };

    log_info!("{}: connected to Redis at {uri}", config.name);

    Ok(Arc::new(RedisBroker {
        base: BrokerBase::from(&config),
        client,
        conn,
        read_conn: Mutex::new(None),
        closed: AtomicBool::new(false),
    }))
}
