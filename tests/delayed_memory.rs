mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use common::{init_logging, memory_node, wait_until, Num};
use serde::{Deserialize, Serialize};
use stream_rpc::{delay_key, unix_nanos, MemoryHub, Result, RpcError, ServiceRegistry};

#[derive(Debug, Serialize, Deserialize)]
struct Label {
    label: String,
}

fn counting_registry(count: Arc<AtomicUsize>) -> ServiceRegistry {
    // ---
    let registry = ServiceRegistry::new();
    registry.register("remind", move |req: Num| {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(Num { n: req.n * 2 })
        }
    });
    registry
}

#[tokio::test]
async fn test_scheduled_call_fires_and_is_observable() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let count = Arc::new(AtomicUsize::new(0));
    let node = memory_node(&hub, counting_registry(count.clone())).await?;
    node.spawn().await?;

    let at = SystemTime::now() + Duration::from_millis(300);
    let fire_at = node.schedule_request_at("remind", at, &Num { n: 5 }).await?;
    assert_eq!(fire_at, unix_nanos(at)?);

    let raw = node
        .await_scheduled("remind", at, Duration::from_secs(5))
        .await?;
    let resp: Num = serde_json::from_slice(&raw)?;
    assert_eq!(resp.n, 10);
    assert!(SystemTime::now() >= at);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    let broker = node.broker("default").expect("default broker");
    assert!(broker.hash_fields(&delay_key("remind")).await?.is_empty());
    assert!(node.pending_delayed().is_empty());

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_tasks_fire_in_time_order() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let seen = Arc::new(Mutex::new(Vec::<String>::new()));
    let registry = ServiceRegistry::new();
    let s = seen.clone();
    registry.register("record", move |req: Label| {
        let s = s.clone();
        async move {
            s.lock().unwrap().push(req.label.clone());
            Ok(req)
        }
    });

    let node = memory_node(&hub, registry).await?;
    node.spawn().await?;

    let now = SystemTime::now();
    // Scheduled in reverse so arrival order differs from fire order.
    let b = Label { label: "B".into() };
    let a = Label { label: "A".into() };
    node.schedule_request_at("record", now + Duration::from_millis(600), &b)
        .await?;
    node.schedule_request_at("record", now + Duration::from_millis(300), &a)
        .await?;

    let done = wait_until(Duration::from_secs(5), || {
        let seen = seen.clone();
        async move { seen.lock().unwrap().len() == 2 }
    })
    .await;
    assert!(done);
    assert_eq!(*seen.lock().unwrap(), vec!["A".to_string(), "B".to_string()]);

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_cancel_before_fire() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let count = Arc::new(AtomicUsize::new(0));
    let node = memory_node(&hub, counting_registry(count.clone())).await?;
    node.spawn().await?;

    let at = SystemTime::now() + Duration::from_millis(1500);
    node.schedule_request_at("remind", at, &Num { n: 5 }).await?;

    let n = node.clone();
    assert!(wait_until(Duration::from_secs(2), || {
        let n = n.clone();
        async move { n.pending_delayed().len() == 1 }
    })
    .await);

    tokio::time::sleep(Duration::from_millis(300)).await;
    node.cancel("remind", at).await?;

    let n = node.clone();
    assert!(wait_until(Duration::from_secs(2), || {
        let n = n.clone();
        async move { n.pending_delayed().is_empty() }
    })
    .await);

    // Well past the scheduled fire time.
    tokio::time::sleep(Duration::from_millis(1700)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);

    let broker = node.broker("default").expect("default broker");
    assert!(broker.hash_fields(&delay_key("remind")).await?.is_empty());

    let res = node
        .await_scheduled("remind", at, Duration::from_millis(100))
        .await;
    assert!(matches!(res, Err(RpcError::Timeout)));

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_cancel_is_idempotent() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let count = Arc::new(AtomicUsize::new(0));
    let node = memory_node(&hub, counting_registry(count.clone())).await?;
    node.spawn().await?;

    // Cancelling something never scheduled is fine.
    let never = SystemTime::now() + Duration::from_secs(60);
    node.cancel("remind", never).await?;
    node.cancel("remind", never).await?;

    // Cancelling after the task fired changes nothing.
    let at = SystemTime::now() + Duration::from_millis(200);
    node.schedule_request_at("remind", at, &Num { n: 1 }).await?;
    node.await_scheduled("remind", at, Duration::from_secs(5))
        .await?;
    node.cancel("remind", at).await?;
    node.cancel("remind", at).await?;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(node.pending_delayed().is_empty());

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_pending_tasks_survive_restart() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let count = Arc::new(AtomicUsize::new(0));

    let first = memory_node(&hub, counting_registry(count.clone())).await?;
    first.spawn().await?;

    let at = SystemTime::now() + Duration::from_millis(1500);
    let fire_at = first.schedule_request_at("remind", at, &Num { n: 4 }).await?;

    let n = first.clone();
    assert!(wait_until(Duration::from_secs(2), || {
        let n = n.clone();
        async move { n.pending_delayed().len() == 1 }
    })
    .await);
    first.shutdown().await;

    // A fresh process sees the task only after reloading from the durable hash.
    let second = memory_node(&hub, counting_registry(count.clone())).await?;
    assert!(second.pending_delayed().is_empty());
    assert_eq!(second.reload_delayed().await?, 1);

    let pending = second.pending_delayed();
    assert_eq!(pending[0].fire_at, fire_at);
    assert_eq!(pending[0].service.as_ref(), "remind");

    second.spawn().await?;
    let raw = second
        .await_scheduled("remind", at, Duration::from_secs(5))
        .await?;
    let resp: Num = serde_json::from_slice(&raw)?;
    assert_eq!(resp.n, 8);
    assert_eq!(count.load(Ordering::SeqCst), 1);

    second.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_due_task_fires_once_across_processes() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let count = Arc::new(AtomicUsize::new(0));

    let first = memory_node(&hub, counting_registry(count.clone())).await?;
    first.spawn().await?;

    let at = SystemTime::now() + Duration::from_millis(800);
    first.schedule_request_at("remind", at, &Num { n: 1 }).await?;

    let n = first.clone();
    assert!(wait_until(Duration::from_secs(2), || {
        let n = n.clone();
        async move { n.pending_delayed().len() == 1 }
    })
    .await);

    // The second process picks the same task up from the durable hash.
    let second = memory_node(&hub, counting_registry(count.clone())).await?;
    second.spawn().await?;
    assert_eq!(second.pending_delayed().len(), 1);

    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert!(first.pending_delayed().is_empty());
    assert!(second.pending_delayed().is_empty());

    first.shutdown().await;
    second.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_cancel_consumed_by_one_process_stops_the_other() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let count = Arc::new(AtomicUsize::new(0));

    let first = memory_node(&hub, counting_registry(count.clone())).await?;
    first.spawn().await?;

    let at = SystemTime::now() + Duration::from_millis(1200);
    first.schedule_request_at("remind", at, &Num { n: 3 }).await?;

    let n = first.clone();
    assert!(wait_until(Duration::from_secs(2), || {
        let n = n.clone();
        async move { n.pending_delayed().len() == 1 }
    })
    .await);

    // Both processes now track the task; only one of them reads the tombstone.
    let second = memory_node(&hub, counting_registry(count.clone())).await?;
    second.spawn().await?;
    assert_eq!(second.pending_delayed().len(), 1);

    second.cancel("remind", at).await?;

    let b = second.broker("default").expect("default broker");
    assert!(wait_until(Duration::from_secs(2), || {
        let b = b.clone();
        async move {
            b.hash_fields(&delay_key("remind"))
                .await
                .map(|f| f.is_empty())
                .unwrap_or(false)
        }
    })
    .await);

    let tracking = [&first, &second]
        .iter()
        .filter(|n| !n.pending_delayed().is_empty())
        .count();
    assert_eq!(tracking, 1);

    // The process that missed the tombstone finds the field gone and skips.
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(count.load(Ordering::SeqCst), 0);
    assert!(first.pending_delayed().is_empty());
    assert!(second.pending_delayed().is_empty());

    let res = second
        .await_scheduled("remind", at, Duration::from_millis(100))
        .await;
    assert!(matches!(res, Err(RpcError::Timeout)));

    first.shutdown().await;
    second.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_shared_timestamp_cancel_hits_right_service() -> Result<()> {
    // ---
    init_logging();

    let hub = MemoryHub::new();
    let hits = Arc::new(Mutex::new(Vec::<String>::new()));
    let registry = ServiceRegistry::new();
    for service in ["alpha", "beta", "gamma"] {
        let hits = hits.clone();
        registry.register(service, move |req: Label| {
            let hits = hits.clone();
            async move {
                hits.lock().unwrap().push(req.label.clone());
                Ok(req)
            }
        });
    }

    let node = memory_node(&hub, registry).await?;
    node.spawn().await?;

    let at = SystemTime::now() + Duration::from_millis(800);
    for service in ["alpha", "beta", "gamma"] {
        let label = Label {
            label: service.to_string(),
        };
        node.schedule_request_at(service, at, &label).await?;
    }

    let n = node.clone();
    assert!(wait_until(Duration::from_secs(2), || {
        let n = n.clone();
        async move { n.pending_delayed().len() == 3 }
    })
    .await);

    node.cancel("beta", at).await?;

    let h = hits.clone();
    assert!(wait_until(Duration::from_secs(3), || {
        let h = h.clone();
        async move { h.lock().unwrap().len() == 2 }
    })
    .await);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let mut fired = hits.lock().unwrap().clone();
    fired.sort();
    assert_eq!(fired, vec!["alpha".to_string(), "gamma".to_string()]);

    node.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_schedule_before_epoch_rejected() -> Result<()> {
    // ---
    let hub = MemoryHub::new();
    let node = memory_node(&hub, counting_registry(Arc::new(AtomicUsize::new(0)))).await?;

    let at = SystemTime::UNIX_EPOCH - Duration::from_secs(1);
    let res = node.schedule_request_at("remind", at, &Num { n: 1 }).await;
    assert!(matches!(res, Err(RpcError::InvalidFireTime(_))));
    Ok(())
}
