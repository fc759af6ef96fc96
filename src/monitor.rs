//! Periodic resource availability probe.
//!
//! The monitor polls every registered provider on a fixed cadence, merges
//! the per-backend capacity reports into one cluster view, and publishes it
//! on a watch channel. A short rolling window of snapshots is kept for the
//! auto-scaler's sustained-utilization checks.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::provider::{Provider, ResourceAvailability};

/// Default probe cadence.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(15);

/// How many snapshots the rolling window retains.
const WINDOW_CAPACITY: usize = 20;

/// A timestamped availability observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceSnapshot {
    /// Merged availability across all providers.
    pub availability: ResourceAvailability,
    /// When the probe ran.
    pub taken_at: DateTime<Utc>,
}

/// Periodic prober over the registered providers.
pub struct ResourceMonitor {
    providers: Vec<Arc<dyn Provider>>,
    interval: Duration,
    clock: Arc<dyn Clock>,
    publisher: watch::Sender<ResourceSnapshot>,
    window: Mutex<VecDeque<ResourceSnapshot>>,
}

impl ResourceMonitor {
    /// Creates a monitor over the given providers.
    pub fn new(
        providers: Vec<Arc<dyn Provider>>,
        interval: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let initial = ResourceSnapshot {
            availability: ResourceAvailability::default(),
            taken_at: clock.now(),
        };
        let (publisher, _) = watch::channel(initial);
        Self {
            providers,
            interval,
            clock,
            publisher,
            window: Mutex::new(VecDeque::with_capacity(WINDOW_CAPACITY)),
        }
    }

    /// Subscribes to availability updates.
    pub fn subscribe(&self) -> watch::Receiver<ResourceSnapshot> {
        self.publisher.subscribe()
    }

    /// Returns the most recently published snapshot.
    pub fn latest(&self) -> ResourceSnapshot {
        *self.publisher.borrow()
    }

    /// Returns the rolling window, oldest first.
    pub fn window(&self) -> Vec<ResourceSnapshot> {
        let window = self.window.lock().expect("monitor window lock poisoned");
        window.iter().copied().collect()
    }

    /// Probes all providers once and publishes the merged snapshot.
    ///
    /// A provider that fails to answer is skipped for this round; its
    /// capacity simply drops out of the merged view until it recovers.
    pub async fn probe_once(&self) -> ResourceSnapshot {
        let mut merged = ResourceAvailability::default();

        for provider in &self.providers {
            match provider.resource_availability().await {
                Ok(availability) => {
                    merged.total_cpu_millis += availability.total_cpu_millis;
                    merged.available_cpu_millis += availability.available_cpu_millis;
                    merged.total_memory_bytes += availability.total_memory_bytes;
                    merged.available_memory_bytes += availability.available_memory_bytes;
                    merged.node_count += availability.node_count;
                }
                Err(err) => {
                    warn!(
                        provider = %provider.info().name,
                        error = %err,
                        "Resource probe failed, skipping provider this round"
                    );
                }
            }
        }

        let snapshot = ResourceSnapshot {
            availability: merged,
            taken_at: self.clock.now(),
        };

        {
            let mut window = self.window.lock().expect("monitor window lock poisoned");
            if window.len() == WINDOW_CAPACITY {
                window.pop_front();
            }
            window.push_back(snapshot);
        }

        // Publishing only fails when every receiver is gone, which is fine.
        let _ = self.publisher.send(snapshot);
        debug!(
            cpu_available = snapshot.availability.available_cpu_millis,
            memory_available = snapshot.availability.available_memory_bytes,
            nodes = snapshot.availability.node_count,
            "Published resource snapshot"
        );
        snapshot
    }

    /// Runs the probe loop until the shutdown signal fires.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.probe_once().await;
                }
                _ = shutdown.recv() => {
                    debug!("Resource monitor stopping");
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use crate::provider::mock::MockProvider;
    use crate::provider::ProviderError;

    fn monitor_over(providers: Vec<Arc<dyn Provider>>) -> ResourceMonitor {
        ResourceMonitor::new(providers, DEFAULT_PROBE_INTERVAL, Arc::new(SystemClock))
    }

    #[tokio::test]
    async fn test_probe_merges_providers() {
        let a = Arc::new(MockProvider::with_default_capacity("a"));
        let b = Arc::new(MockProvider::with_default_capacity("b"));
        let monitor = monitor_over(vec![a, b]);

        let snapshot = monitor.probe_once().await;
        assert_eq!(snapshot.availability.total_cpu_millis, 32_000);
        assert_eq!(snapshot.availability.node_count, 8);
        assert_eq!(monitor.latest(), snapshot);
    }

    #[tokio::test]
    async fn test_failed_provider_is_skipped() {
        struct BrokenProvider;

        #[async_trait::async_trait]
        impl Provider for BrokenProvider {
            async fn create_worker(
                &self,
                _: &crate::provider::WorkerTemplate,
                _: crate::job::PoolId,
            ) -> Result<crate::provider::CreateWorkerOutcome, ProviderError> {
                Err(ProviderError::Backend("down".into()))
            }
            async fn delete_worker(
                &self,
                _: crate::job::WorkerId,
                _: bool,
            ) -> Result<crate::provider::DeleteWorkerOutcome, ProviderError> {
                Err(ProviderError::Backend("down".into()))
            }
            async fn worker_status(
                &self,
                _: crate::job::WorkerId,
            ) -> Result<crate::provider::WorkerStatus, ProviderError> {
                Err(ProviderError::Backend("down".into()))
            }
            async fn list_workers(
                &self,
                _: Option<crate::job::PoolId>,
            ) -> Result<Vec<crate::provider::Worker>, ProviderError> {
                Err(ProviderError::Backend("down".into()))
            }
            async fn resource_availability(&self) -> Result<ResourceAvailability, ProviderError> {
                Err(ProviderError::Backend("down".into()))
            }
            fn info(&self) -> crate::provider::ProviderInfo {
                crate::provider::ProviderInfo {
                    name: "broken".to_string(),
                    kind: crate::provider::ProviderKind::Mock,
                    version: None,
                    capabilities: crate::provider::ProviderCapabilities {
                        worker_event_stream: false,
                        max_concurrent_creations: 1,
                    },
                }
            }
            async fn health_check(&self) -> Result<(), ProviderError> {
                Err(ProviderError::Backend("down".into()))
            }
        }

        let healthy = Arc::new(MockProvider::with_default_capacity("a"));
        let monitor = monitor_over(vec![healthy, Arc::new(BrokenProvider)]);

        let snapshot = monitor.probe_once().await;
        assert_eq!(snapshot.availability.total_cpu_millis, 16_000);
    }

    #[tokio::test]
    async fn test_window_is_bounded() {
        let provider = Arc::new(MockProvider::with_default_capacity("a"));
        let monitor = monitor_over(vec![provider]);

        for _ in 0..WINDOW_CAPACITY + 5 {
            monitor.probe_once().await;
        }
        assert_eq!(monitor.window().len(), WINDOW_CAPACITY);
    }

    #[tokio::test]
    async fn test_subscribers_see_updates() {
        let provider = Arc::new(MockProvider::with_default_capacity("a"));
        let monitor = monitor_over(vec![provider]);
        let mut rx = monitor.subscribe();

        monitor.probe_once().await;
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().availability.total_cpu_millis, 16_000);
    }
}
