//! Route selection and publishing over a pluggable broker.

use bytes::Bytes;
use keel_config::{QueueConfig, RouteFallback};
use keel_core::queue::{Broker, DEFAULT_ROUTE};
use keel_core::{Error, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::warn;

/// Publish attempts before a dispatch is given up.
const PUBLISH_ATTEMPTS: u32 = 3;

/// Maps builds to worker routes and publishes dispatch messages.
pub struct QueueRouter {
    broker: Arc<dyn Broker>,
    routes: Vec<String>,
    fallback: RouteFallback,
    cluster: bool,
    publish_timeout: Duration,
    publish_attempts: u32,
    publish_backoff: Duration,
    fallbacks: AtomicU64,
}

impl QueueRouter {
    /// Fails with `InvalidArgument` when cluster mode is requested over a
    /// broker that only this process can see, or a route name is empty.
    pub fn new(broker: Arc<dyn Broker>, config: &QueueConfig) -> Result<Self> {
        if config.cluster && !broker.is_shared() {
            return Err(Error::InvalidArgument(format!(
                "cluster mode needs a shared broker, {} broker is process-local",
                broker.name()
            )));
        }

        let routes = config.worker_routes();
        if routes.iter().any(|r| r.trim().is_empty()) {
            return Err(Error::InvalidArgument(
                "route names must not be empty".to_string(),
            ));
        }

        Ok(Self {
            broker,
            routes,
            fallback: config.fallback,
            cluster: config.cluster,
            publish_timeout: config.publish_timeout,
            publish_attempts: PUBLISH_ATTEMPTS,
            publish_backoff: Duration::from_millis(50),
            fallbacks: AtomicU64::new(0),
        })
    }

    /// Set the base delay between publish attempts.
    pub fn with_publish_backoff(mut self, backoff: Duration) -> Self {
        self.publish_backoff = backoff;
        self
    }

    /// Configured routes, default route first.
    pub fn routes(&self) -> &[String] {
        &self.routes
    }

    pub fn is_cluster(&self) -> bool {
        self.cluster
    }

    pub fn broker_name(&self) -> &'static str {
        self.broker.name()
    }

    /// How many builds were sent to the default route instead of the route
    /// they asked for.
    pub fn fallback_count(&self) -> u64 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Pick the route for a pipeline's route hint.
    ///
    /// No hint means the default route. A hint that is not configured either
    /// falls back to the default route (recorded in the log, the metrics and
    /// the fallback counter) or fails with `DispatchFailure`, depending on
    /// the fallback policy.
    pub fn resolve(&self, hint: Option<&str>) -> Result<String> {
        let requested = match hint.map(str::trim) {
            None | Some("") => return Ok(DEFAULT_ROUTE.to_string()),
            Some(requested) => requested,
        };

        if self.routes.iter().any(|r| r == requested) {
            return Ok(requested.to_string());
        }

        match self.fallback {
            RouteFallback::Default => {
                warn!(
                    requested,
                    route = DEFAULT_ROUTE,
                    "Route not configured, falling back to default route"
                );
                self.fallbacks.fetch_add(1, Ordering::Relaxed);
                crate::metrics::route_fallback(requested, DEFAULT_ROUTE);
                Ok(DEFAULT_ROUTE.to_string())
            }
            RouteFallback::Reject => Err(Error::DispatchFailure(format!(
                "route {:?} is not configured",
                requested
            ))),
        }
    }

    /// Publish a message on `route` after resolving it, returning the route
    /// actually used.
    ///
    /// Each attempt is bounded by the publish timeout and a failed publish
    /// is retried a few times, so workers may see a message more than once.
    pub async fn publish(&self, route: &str, payload: Bytes) -> Result<String> {
        let route = self.resolve(Some(route))?;

        let mut last_error = String::new();
        for attempt in 1..=self.publish_attempts {
            match tokio::time::timeout(
                self.publish_timeout,
                self.broker.publish(&route, payload.clone()),
            )
            .await
            {
                Ok(Ok(())) => return Ok(route),
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => {
                    last_error = format!("timed out after {:?}", self.publish_timeout);
                }
            }

            warn!(route = %route, attempt, error = %last_error, "Publish failed");
            if attempt < self.publish_attempts {
                tokio::time::sleep(self.publish_backoff * attempt).await;
            }
        }

        Err(Error::DispatchFailure(format!(
            "publish to route {} failed after {} attempts: {}",
            route, self.publish_attempts, last_error
        )))
    }

    /// Take the oldest message waiting on a route.
    pub async fn pop(&self, route: &str) -> Result<Option<Bytes>> {
        self.broker.pop(route).await
    }

    /// Number of messages waiting on a route.
    pub async fn length(&self, route: &str) -> Result<u64> {
        self.broker.length(route).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MemoryBroker, SqlBroker};
    use async_trait::async_trait;
    use keel_config::QueueDriver;
    use keel_db::Database;
    use std::sync::atomic::AtomicU32;

    fn config(routes: &[&str]) -> QueueConfig {
        QueueConfig {
            routes: routes.iter().map(|r| r.to_string()).collect(),
            ..QueueConfig::default()
        }
    }

    /// Broker whose publishes fail or hang.
    struct BrokenBroker {
        hang: bool,
        publishes: AtomicU32,
    }

    impl BrokenBroker {
        fn new(hang: bool) -> Self {
            Self {
                hang,
                publishes: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Broker for BrokenBroker {
        fn name(&self) -> &'static str {
            "broken"
        }

        fn is_shared(&self) -> bool {
            false
        }

        async fn publish(&self, _route: &str, _payload: Bytes) -> Result<()> {
            self.publishes.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                tokio::time::sleep(Duration::from_secs(60)).await;
            }
            Err(Error::Unavailable("connection refused".to_string()))
        }

        async fn pop(&self, _route: &str) -> Result<Option<Bytes>> {
            Ok(None)
        }

        async fn length(&self, _route: &str) -> Result<u64> {
            Ok(0)
        }
    }

    #[test]
    fn test_resolve_configured_and_missing_hint() {
        let router = QueueRouter::new(Arc::new(MemoryBroker::new()), &config(&["gpu"])).unwrap();

        assert_eq!(router.routes(), &["vela".to_string(), "gpu".to_string()]);
        assert_eq!(router.resolve(None).unwrap(), "vela");
        assert_eq!(router.resolve(Some("")).unwrap(), "vela");
        assert_eq!(router.resolve(Some("gpu")).unwrap(), "gpu");
        assert_eq!(router.fallback_count(), 0);
    }

    #[test]
    fn test_unconfigured_route_falls_back_observably() {
        let router = QueueRouter::new(Arc::new(MemoryBroker::new()), &config(&[])).unwrap();

        assert_eq!(router.resolve(Some("gpu")).unwrap(), DEFAULT_ROUTE);
        assert_eq!(router.fallback_count(), 1);
    }

    #[test]
    fn test_reject_policy() {
        let mut cfg = config(&[]);
        cfg.fallback = RouteFallback::Reject;
        let router = QueueRouter::new(Arc::new(MemoryBroker::new()), &cfg).unwrap();

        let err = router.resolve(Some("gpu")).unwrap_err();
        assert!(matches!(err, Error::DispatchFailure(_)));
        assert_eq!(router.fallback_count(), 0);
    }

    #[tokio::test]
    async fn test_cluster_mode_needs_shared_broker() {
        let mut cfg = config(&[]);
        cfg.cluster = true;

        let err = QueueRouter::new(Arc::new(MemoryBroker::new()), &cfg)
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidArgument(_)));

        cfg.driver = QueueDriver::Database;
        let broker = SqlBroker::new(Database::in_memory().await.unwrap());
        let router = QueueRouter::new(Arc::new(broker), &cfg).unwrap();
        assert!(router.is_cluster());
    }

    #[test]
    fn test_empty_route_name_rejected() {
        let err = QueueRouter::new(Arc::new(MemoryBroker::new()), &config(&[" "]))
            .err()
            .unwrap();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_publish_and_length() {
        let router = QueueRouter::new(Arc::new(MemoryBroker::new()), &config(&["gpu"])).unwrap();

        let route = router
            .publish("gpu", Bytes::from_static(b"msg"))
            .await
            .unwrap();
        assert_eq!(route, "gpu");
        assert_eq!(router.length("gpu").await.unwrap(), 1);
        assert_eq!(router.length("vela").await.unwrap(), 0);

        let route = router
            .publish("arm64", Bytes::from_static(b"msg"))
            .await
            .unwrap();
        assert_eq!(route, "vela");
        assert_eq!(router.length("vela").await.unwrap(), 1);
        assert_eq!(router.fallback_count(), 1);

        assert_eq!(
            router.pop("gpu").await.unwrap(),
            Some(Bytes::from_static(b"msg"))
        );
    }

    #[tokio::test]
    async fn test_publish_failure_is_retried_then_reported() {
        let broker = Arc::new(BrokenBroker::new(false));
        let router = QueueRouter::new(broker.clone(), &config(&[]))
            .unwrap()
            .with_publish_backoff(Duration::from_millis(1));

        let err = router
            .publish("vela", Bytes::from_static(b"msg"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DispatchFailure(_)));
        assert_eq!(broker.publishes.load(Ordering::SeqCst), PUBLISH_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_publish_timeout() {
        let mut cfg = config(&[]);
        cfg.publish_timeout = Duration::from_millis(20);
        let router = QueueRouter::new(Arc::new(BrokenBroker::new(true)), &cfg)
            .unwrap()
            .with_publish_backoff(Duration::from_millis(1));

        let err = router
            .publish("vela", Bytes::from_static(b"msg"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"));
    }
}
