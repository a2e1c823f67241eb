//! Service registry.
//!
//! Maps a service (API) name to the handler that executes it and to the data
//! source (broker) its queue lives on. Producers use it to find the broker
//! for a call; the dispatch loop and the delay scheduler use it to execute
//! delivered calls.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::broker_builder::DEFAULT_DATA_SOURCE;
use crate::lock::lock_ignore_poison;
use crate::Result;

/// Boxed, sendable future returned by handlers.
pub type BoxFuture<'a, T> = std::pin::Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A callable service: encoded request bytes in, encoded response bytes out.
///
/// Implement this directly to work with raw payloads; typed closures
/// registered through [`ServiceRegistry::register`] are wrapped into it.
pub trait ServiceHandler: Send + Sync {
    /// Execute the service on an encoded payload.
    fn invoke(&self, payload: Bytes) -> BoxFuture<'static, Result<Bytes>>;
}

/// Shared handler pointer.
pub type HandlerPtr = Arc<dyn ServiceHandler>;

// Implementation of ServiceHandler for typed handler closures
struct TypedHandler<F, Fut, TReq, TResp>
where
    F: Fn(TReq) -> Fut + Send + Sync,
    Fut: Future<Output = Result<TResp>> + Send,
    TReq: DeserializeOwned,
    TResp: Serialize,
{
    func: F,
    _phantom: std::marker::PhantomData<fn(TReq, TResp, Fut)>,
}

impl<F, Fut, TReq, TResp> ServiceHandler for TypedHandler<F, Fut, TReq, TResp>
where
    F: Fn(TReq) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<TResp>> + Send + 'static,
    TReq: DeserializeOwned + Send + 'static,
    TResp: Serialize + Send + 'static,
{
    fn invoke(&self, payload: Bytes) -> BoxFuture<'static, Result<Bytes>> {
        // Deserialize request
        let req: TReq = match serde_json::from_slice(&payload) {
            Ok(r) => r,
            Err(e) => return Box::pin(async move { Err(e.into()) }),
        };

        // Call handler
        let fut = (self.func)(req);

        Box::pin(async move {
            let resp = fut.await?;
            let bytes = serde_json::to_vec(&resp)?;
            Ok(Bytes::from(bytes))
        })
    }
}

/// Where a service lives and, if hosted here, how to run it.
#[derive(Clone)]
pub struct Route {
    /// Local handler; `None` for services hosted by other processes.
    pub handler: Option<HandlerPtr>,
    /// Name of the data source (broker) carrying the service queue.
    pub data_source: String,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("handler", &self.handler.is_some())
            .field("data_source", &self.data_source)
            .finish()
    }
}

/// Registry of services.
///
/// Cheap to clone; all clones share one table. Registration may happen before
/// or after the node is built, but a dispatch loop only listens on the
/// services that had a local handler when [`RpcNode::spawn`](crate::RpcNode::spawn)
/// ran.
///
/// # Example
///
/// ```
/// use stream_rpc::ServiceRegistry;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Num { n: i64 }
///
/// let registry = ServiceRegistry::new();
/// registry.register("double", |req: Num| async move { Ok(Num { n: req.n * 2 }) });
/// registry.route("billing.charge", "billing-db");
///
/// assert!(registry.resolve("double").unwrap().handler.is_some());
/// assert!(registry.resolve("billing.charge").unwrap().handler.is_none());
/// assert_eq!(registry.services_for("default"), vec!["double".to_string()]);
/// ```
#[derive(Clone, Default)]
pub struct ServiceRegistry {
    routes: Arc<Mutex<HashMap<String, Route>>>,
}

impl ServiceRegistry {
    // ---
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler on the default data source.
    ///
    /// Requests are decoded and responses encoded with `serde_json`.
    pub fn register<TReq, TResp, F, Fut>(&self, service: &str, handler: F)
    where
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
        F: Fn(TReq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        self.register_on(DEFAULT_DATA_SOURCE, service, handler);
    }

    /// Register a typed handler on a named data source.
    pub fn register_on<TReq, TResp, F, Fut>(&self, data_source: &str, service: &str, handler: F)
    where
        TReq: DeserializeOwned + Send + 'static,
        TResp: Serialize + Send + 'static,
        F: Fn(TReq) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<TResp>> + Send + 'static,
    {
        let handler_obj = TypedHandler {
            func: handler,
            _phantom: std::marker::PhantomData,
        };
        self.register_raw(data_source, service, Arc::new(handler_obj));
    }

    /// Register a raw byte handler on a named data source.
    pub fn register_raw(&self, data_source: &str, service: &str, handler: HandlerPtr) {
        // ---
        let mut routes = lock_ignore_poison(&self.routes);
        routes.insert(
            service.to_string(),
            Route {
                handler: Some(handler),
                data_source: data_source.to_string(),
            },
        );
    }

    /// Declare a service hosted elsewhere so this process can call it.
    ///
    /// A routed-only service is never read by this process's dispatch loop.
    /// An existing local handler for the same name is replaced.
    pub fn route(&self, service: &str, data_source: &str) {
        // ---
        let mut routes = lock_ignore_poison(&self.routes);
        routes.insert(
            service.to_string(),
            Route {
                handler: None,
                data_source: data_source.to_string(),
            },
        );
    }

    /// Resolve a service name.
    pub fn resolve(&self, service: &str) -> Option<Route> {
        lock_ignore_poison(&self.routes).get(service).cloned()
    }

    /// Services with a local handler on `data_source`, sorted by name.
    pub fn services_for(&self, data_source: &str) -> Vec<String> {
        // ---
        let routes = lock_ignore_poison(&self.routes);
        let mut services: Vec<String> = routes
            .iter()
            .filter(|(_, r)| r.handler.is_some() && r.data_source == data_source)
            .map(|(name, _)| name.clone())
            .collect();
        services.sort();
        services
    }

    /// Every data source referenced by any route.
    pub fn data_sources(&self) -> Vec<String> {
        // ---
        let routes = lock_ignore_poison(&self.routes);
        let set: BTreeSet<&String> = routes.values().map(|r| &r.data_source).collect();
        set.into_iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::RpcError;
    use serde::Deserialize;

    #[derive(Serialize, Deserialize)]
    struct Num {
        n: i64,
    }

    #[tokio::test]
    async fn test_typed_handler_round_trip() {
        // ---
        let registry = ServiceRegistry::new();
        registry.register("double", |req: Num| async move { Ok(Num { n: req.n * 2 }) });

        let handler = registry.resolve("double").unwrap().handler.unwrap();
        let out = handler
            .invoke(Bytes::from_static(br#"{"n":21}"#))
            .await
            .unwrap();
        let num: Num = serde_json::from_slice(&out).unwrap();
        assert_eq!(num.n, 42);
    }

    #[tokio::test]
    async fn test_typed_handler_rejects_bad_payload() {
        // ---
        let registry = ServiceRegistry::new();
        registry.register("double", |req: Num| async move { Ok(Num { n: req.n * 2 }) });

        let handler = registry.resolve("double").unwrap().handler.unwrap();
        let res = handler.invoke(Bytes::from_static(b"not json")).await;
        assert!(matches!(res, Err(RpcError::Serialization(_))));
    }

    #[test]
    fn test_services_for_skips_routed_only() {
        // ---
        let registry = ServiceRegistry::new();
        registry.register_on("a", "one", |req: Num| async move { Ok(req) });
        registry.register_on("b", "two", |req: Num| async move { Ok(req) });
        registry.route("three", "a");

        assert_eq!(registry.services_for("a"), vec!["one".to_string()]);
        assert_eq!(registry.services_for("b"), vec!["two".to_string()]);
        assert_eq!(registry.data_sources(), vec!["a".to_string(), "b".to_string()]);
        assert!(registry.resolve("missing").is_none());
    }
}
