mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::{init_logging, memory_node, Num};
use stream_rpc::{MemoryHub, Result, RpcError, ServiceRegistry};

fn doubling_registry() -> ServiceRegistry {
    // ---
    let registry = ServiceRegistry::new();
    registry.register("double", |req: Num| async move { Ok(Num { n: req.n * 2 }) });
    registry
}

#[tokio::test]
async fn test_double_round_trip() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let node = memory_node(&hub, doubling_registry()).await?;
    node.spawn().await?;

    let started = std::time::Instant::now();
    let resp: Num = node.request("double", &Num { n: 21 }).await?;
    assert_eq!(resp, Num { n: 42 });
    assert!(started.elapsed() < Duration::from_secs(6));

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_raw_call_matches_direct_invoke() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let registry = doubling_registry();
    let node = memory_node(&hub, registry.clone()).await?;
    node.spawn().await?;

    let payload = Bytes::from_static(br#"{"n":-7}"#);
    let direct = registry
        .resolve("double")
        .and_then(|r| r.handler)
        .expect("double registered")
        .invoke(payload.clone())
        .await?;
    let remote = node.call("double", payload).await?;
    assert_eq!(remote, direct);

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_caller_and_server_in_different_nodes() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let server = memory_node(&hub, doubling_registry()).await?;
    server.spawn().await?;

    let routes = ServiceRegistry::new();
    routes.route("double", "default");
    let client = memory_node(&hub, routes).await?;

    let mut handles = Vec::new();
    for i in 0..10 {
        let c = client.clone();
        handles.push(tokio::spawn(async move {
            let resp: Num = c.request("double", &Num { n: i }).await.unwrap();
            resp.n
        }));
    }
    for (i, h) in handles.into_iter().enumerate() {
        assert_eq!(h.await.unwrap(), (i as i64) * 2);
    }

    server.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_unregistered_service_never_touches_broker() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let node = memory_node(&hub, doubling_registry()).await?;
    node.spawn().await?;

    let res = node.call("nope", Bytes::from_static(b"{}")).await;
    assert!(matches!(res, Err(RpcError::ServiceNotFound(ref s)) if s == "nope"));

    let broker = node.broker("default").expect("default broker");
    assert!(!broker.queue_exists("nope").await?);

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_handler_error_is_remote_not_timeout() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let registry = ServiceRegistry::new();
    registry.register("positive", |req: Num| async move {
        if req.n <= 0 {
            return Err(RpcError::Handler("n must be positive".into()));
        }
        Ok(req)
    });
    let node = memory_node(&hub, registry).await?;
    node.spawn().await?;

    let res = node.request::<_, Num>("positive", &Num { n: -1 }).await;
    match res {
        Err(RpcError::Remote(text)) => assert!(text.contains("n must be positive")),
        other => panic!("unexpected: {other:?}"),
    }

    // Undecodable input is reported the same way.
    let res = node.call("positive", Bytes::from_static(b"not json")).await;
    assert!(matches!(res, Err(RpcError::Remote(_))));

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_timeout_without_listener() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let registry = ServiceRegistry::new();
    registry.route("ghost", "default");
    let node = memory_node(&hub, registry).await?;

    let res = node
        .call_with_timeout("ghost", Bytes::from_static(b"{}"), Duration::from_millis(200))
        .await;
    assert!(matches!(res, Err(RpcError::Timeout)));

    // The call was enqueued; only the reply was missing.
    let broker = node.broker("default").expect("default broker");
    assert_eq!(broker.queue_len("ghost").await?, 1);
    Ok(())
}

#[tokio::test]
async fn test_empty_payload_rejected() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let node = memory_node(&hub, doubling_registry()).await?;

    let res = node.call("double", Bytes::new()).await;
    assert!(matches!(res, Err(RpcError::EmptyPayload(_))));
    Ok(())
}

#[tokio::test]
async fn test_spawn_twice_conflicts() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let node = memory_node(&hub, doubling_registry()).await?;

    node.spawn().await?;
    assert!(matches!(node.spawn().await, Err(RpcError::ConfigConflict(_))));

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_competing_consumers_execute_once() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let counts = [Arc::new(AtomicUsize::new(0)), Arc::new(AtomicUsize::new(0))];

    let mut nodes = Vec::new();
    for count in &counts {
        let registry = ServiceRegistry::new();
        let count = count.clone();
        registry.register("work", move |req: Num| {
            let count = count.clone();
            async move {
                count.fetch_add(1, Ordering::SeqCst);
                Ok(req)
            }
        });
        let node = memory_node(&hub, registry).await?;
        node.spawn().await?;
        nodes.push(node);
    }

    const CALLS: i64 = 40;
    for n in 0..CALLS {
        let resp: Num = nodes[(n % 2) as usize].request("work", &Num { n }).await?;
        assert_eq!(resp.n, n);
    }

    let total: usize = counts.iter().map(|c| c.load(Ordering::SeqCst)).sum();
    assert_eq!(total, CALLS as usize);

    for node in nodes {
        node.shutdown().await;
    }
    Ok(())
}

#[tokio::test]
async fn test_bounded_queue() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let registry = ServiceRegistry::new();
    registry.route("sink", "default");

    let broker = stream_rpc::BrokerBuilder::new()
        .memory_hub(hub.clone())
        .build()
        .await?;
    let node = stream_rpc::RpcNodeBuilder::new(registry)
        .broker(broker.clone())
        .max_queue_len(4)
        .build()?;

    let later = std::time::SystemTime::now() + Duration::from_secs(3600);
    for i in 0..10u64 {
        let at = later + Duration::from_secs(i);
        node.schedule_at("sink", at, Bytes::from_static(b"{}")).await?;
    }

    assert_eq!(broker.queue_len("sink").await?, 4);
    Ok(())
}
