#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use stream_rpc::{BrokerBuilder, MemoryHub, Result, RpcNode, RpcNodeBuilder, ServiceRegistry};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Num {
    pub n: i64,
}

/// Node on `hub` tuned for fast tests.
pub async fn memory_node(hub: &Arc<MemoryHub>, registry: ServiceRegistry) -> Result<RpcNode> {
    // ---
    let broker = BrokerBuilder::new().memory_hub(hub.clone()).build().await?;

    RpcNodeBuilder::new(registry)
        .broker(broker)
        .call_timeout(Duration::from_secs(6))
        .read_block(Duration::from_millis(250))
        .poll_interval(Duration::from_millis(20))
        .loop_backoff(Duration::from_millis(50))
        .build()
}

/// Poll `check` every 10ms until it holds or `within` elapses.
pub async fn wait_until<F, Fut>(within: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    // ---
    let deadline = tokio::time::Instant::now() + within;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[cfg(feature = "logging")]
mod imp {
    use std::sync::Once;
    use tracing_subscriber::{fmt as tracing_format, EnvFilter};

    static INIT: Once = Once::new();

    pub fn init() {
        INIT.call_once(|| {
            let _ = tracing_format()
                .with_env_filter(EnvFilter::from_default_env())
                .with_test_writer()
                .try_init();
        });
    }
}

#[cfg(not(feature = "logging"))]
mod imp {
    #[inline]
    pub fn init() {}
}

pub fn init_logging() {
    imp::init();
}
