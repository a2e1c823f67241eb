//! Doubling service over the in-memory broker.
//!
//! Serves and calls `double` in one process, then schedules a deferred call,
//! cancels a second one, and waits for the first to fire.
//!
//! Run with: RUST_LOG=stream_rpc=debug cargo run --example double_memory

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use stream_rpc::{BrokerBuilder, Result, RpcNodeBuilder, ServiceRegistry};
use tracing_subscriber::{fmt as tracing_format, EnvFilter};

#[derive(Debug, Serialize, Deserialize)]
struct Num {
    n: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    tracing_format()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .with_line_number(true)
        .init();

    let registry = ServiceRegistry::new();
    registry.register("double", |req: Num| async move { Ok(Num { n: req.n * 2 }) });

    let broker = BrokerBuilder::new().uri("memory://").build().await?;
    let node = RpcNodeBuilder::new(registry).broker(broker).build()?;
    node.spawn().await?;

    let resp: Num = node.request("double", &Num { n: 21 }).await?;
    println!("double(21) = {}", resp.n);

    let soon = SystemTime::now() + Duration::from_millis(500);
    let later = SystemTime::now() + Duration::from_secs(2);
    node.schedule_request_at("double", soon, &Num { n: 5 }).await?;
    node.schedule_request_at("double", later, &Num { n: 100 }).await?;
    node.cancel("double", later).await?;

    let raw = node
        .await_scheduled("double", soon, Duration::from_secs(3))
        .await?;
    let fired: Num = serde_json::from_slice(&raw)?;
    println!("deferred double(5) = {}", fired.n);

    tokio::time::sleep(Duration::from_millis(200)).await;
    println!("still pending: {:?}", node.pending_delayed());

    node.shutdown().await;
    Ok(())
}
