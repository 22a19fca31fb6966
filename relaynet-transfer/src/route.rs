//! Route multiplexing: `Transport` is the pluggable send primitive,
//! `Route` wraps one with liveness and latency statistics, and
//! `RouteManager`/`MultiRouteSelector` choose among several active routes
//! for a write, weighted toward the ones that have been fast and
//! reliable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use relaynet_core::shuffle::weighted_shuffle;
use relaynet_core::Id;
use tokio::sync::{Notify, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::rtt::RttWindow;
use crate::timeout::Timeout;

/// A pluggable outbound carrier. One `Transport` backs one `Route`.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, bytes: Bytes) -> Result<()>;
}

/// Rolling liveness statistics for a single route, used to compute its
/// selection weight.
#[derive(Debug, Default)]
struct RouteStats {
    rtt: std::sync::Mutex<RttWindow>,
    successes: AtomicU64,
    failures: AtomicU64,
}

impl RouteStats {
    fn record_success(&self, elapsed: Duration) {
        self.successes.fetch_add(1, Ordering::Relaxed);
        self.rtt.lock().expect("rtt lock poisoned").record(elapsed);
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Higher is better: rewards a good success ratio, penalizes latency.
    fn weight(&self) -> f64 {
        let successes = self.successes.load(Ordering::Relaxed) as f64;
        let failures = self.failures.load(Ordering::Relaxed) as f64;
        let total = successes + failures;
        if total == 0.0 {
            return 1.0;
        }
        let success_ratio = successes / total;
        let latency_ms = self
            .rtt
            .lock()
            .expect("rtt lock poisoned")
            .estimate_or(Duration::from_millis(50))
            .as_millis() as f64;
        (success_ratio / (1.0 + latency_ms / 100.0)).max(0.01)
    }
}

/// One multiplexed path to a peer.
pub struct Route {
    id: Id,
    transport: Arc<dyn Transport>,
    stats: RouteStats,
    active: AtomicBool,
}

impl Route {
    fn new(id: Id, transport: Arc<dyn Transport>) -> Self {
        Self {
            id,
            transport,
            stats: RouteStats::default(),
            active: AtomicBool::new(true),
        }
    }

    pub fn id(&self) -> Id {
        self.id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    async fn write(&self, bytes: Bytes) -> Result<()> {
        let start = Instant::now();
        match self.transport.send(bytes).await {
            Ok(()) => {
                self.stats.record_success(start.elapsed());
                Ok(())
            }
            Err(e) => {
                self.stats.record_failure();
                Err(e)
            }
        }
    }

    fn weight(&self) -> f64 {
        self.stats.weight()
    }
}

/// The set of routes available to a peer, with change notification for
/// selectors waiting on a blocking write.
#[derive(Default)]
pub struct RouteManager {
    routes: RwLock<HashMap<Id, Arc<Route>>>,
    notify: Notify,
}

impl RouteManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_route(&self, id: Id, transport: Arc<dyn Transport>) {
        self.routes.write().await.insert(id, Arc::new(Route::new(id, transport)));
        self.notify.notify_waiters();
    }

    pub async fn remove_route(&self, id: &Id) {
        self.routes.write().await.remove(id);
        self.notify.notify_waiters();
    }

    pub async fn mark_inactive(&self, id: &Id) {
        if let Some(route) = self.routes.read().await.get(id) {
            route.active.store(false, Ordering::Relaxed);
        }
        self.notify.notify_waiters();
    }

    pub async fn route_count(&self) -> usize {
        self.routes.read().await.len()
    }

    async fn active_snapshot(&self) -> Vec<Arc<Route>> {
        self.routes
            .read()
            .await
            .values()
            .filter(|r| r.is_active())
            .cloned()
            .collect()
    }

    /// Resolves once the route set has changed since the last call.
    pub async fn changed(&self) {
        self.notify.notified().await;
    }
}

/// Picks among a `RouteManager`'s active routes to carry one write,
/// preferring faster/more-reliable routes without starving the rest.
pub struct MultiRouteSelector {
    manager: Arc<RouteManager>,
}

impl MultiRouteSelector {
    pub fn new(manager: Arc<RouteManager>) -> Self {
        Self { manager }
    }

    /// Race a weighted-shuffled subset of active routes, returning the id
    /// of whichever completes the write first. Retries against newly
    /// active routes until `timeout` elapses or `cancel` fires.
    pub async fn write(
        &self,
        bytes: Bytes,
        timeout: Timeout,
        cancel: &CancellationToken,
    ) -> Result<Id> {
        let deadline = timeout.deadline();
        loop {
            let candidates = self.manager.active_snapshot().await;
            if !candidates.is_empty() {
                let mut rng = rand::thread_rng();
                let weighted: Vec<(Arc<Route>, f64)> =
                    candidates.iter().map(|r| (r.clone(), r.weight())).collect();
                let ordered = weighted_shuffle(weighted, &mut rng);

                let mut attempts: FuturesUnordered<_> = ordered
                    .into_iter()
                    .map(|route| {
                        let bytes = bytes.clone();
                        Box::pin(async move { route.write(bytes).await.map(|_| route.id()) })
                    })
                    .collect();

                while let Some(result) = attempts.next().await {
                    if let Ok(id) = result {
                        return Ok(id);
                    }
                }
            }

            if timeout.is_non_blocking() {
                return Err(Error::NoRoute);
            }

            let backoff = tokio::time::sleep(Duration::from_millis(50));
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::NoRoute),
                _ = self.manager.changed() => {}
                _ = backoff => {}
            }

            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    return Err(Error::NoRoute);
                }
            }
        }
    }
}
