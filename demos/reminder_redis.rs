//! Reminder service over Redis.
//!
//! Run two or more copies to see competing consumers: each reminder is
//! delivered to one process, and a process restarted before a reminder is
//! due picks it up again from the durable delay hash.
//!
//! Run with: cargo run --example reminder_redis -- serve
//!           cargo run --example reminder_redis -- remind 10 "stand up"
//!           cargo run --example reminder_redis -- cancel <fire_at_nanos>
//!
//! Requires: Redis on localhost:6379 (override with BROKER_URI)

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use stream_rpc::{BrokerBuilder, RpcNodeBuilder, ServiceRegistry};
use tracing_subscriber::{fmt as tracing_format, EnvFilter};

#[derive(Debug, Serialize, Deserialize)]
struct Reminder {
    text: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct Ack {
    delivered_by: u32,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ---
    tracing_format()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_line_number(true)
        .init();

    let broker_uri =
        std::env::var("BROKER_URI").unwrap_or_else(|_| "redis://localhost:6379".to_string());

    let pid = std::process::id();
    let registry = ServiceRegistry::new();
    registry.register("remind", move |req: Reminder| async move {
        println!("[{pid}] reminder: {}", req.text);
        Ok(Ack { delivered_by: pid })
    });

    let broker = BrokerBuilder::new()
        .uri(&broker_uri)
        .unique_consumer()
        .build()
        .await?;
    let node = RpcNodeBuilder::new(registry)
        .broker(broker)
        .retry_max_attempts(5)
        .reload_interval(Duration::from_secs(30))
        .build()?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("remind") => {
            let secs: u64 = args.get(1).map(|s| s.parse()).transpose()?.unwrap_or(10);
            let text = args.get(2).cloned().unwrap_or_else(|| "ping".to_string());

            let at = SystemTime::now() + Duration::from_secs(secs);
            let fire_at = node
                .schedule_request_at("remind", at, &Reminder { text })
                .await?;
            println!("scheduled at {fire_at}");

            let raw = node
                .await_scheduled("remind", at, Duration::from_secs(secs + 10))
                .await?;
            let ack: Ack = serde_json::from_slice(&raw)?;
            println!("delivered by process {}", ack.delivered_by);
        }
        Some("cancel") => {
            let nanos: u64 = args
                .get(1)
                .ok_or_else(|| anyhow::anyhow!("cancel needs a fire time in nanoseconds"))?
                .parse()?;
            node.cancel("remind", UNIX_EPOCH + Duration::from_nanos(nanos))
                .await?;
            println!("cancel sent");
        }
        _ => {
            node.spawn().await?;
            println!("[{pid}] serving, {} reminder(s) pending", node.pending_delayed().len());

            tokio::signal::ctrl_c().await?;
            println!("Received Ctrl+C, shutting down...");
        }
    }

    node.shutdown().await;
    Ok(())
}
