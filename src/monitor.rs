//! Background health monitoring and eviction.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use log::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::pool::ProxyPool;
use crate::proxy::{HealthState, ProxyEndpoint, ProxyId};
use crate::validator::{ValidationLevel, Validator};

/// Configuration for a [`HealthMonitor`].
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub check_interval: Duration,
    /// Consecutive probe failures before a proxy is evicted.
    pub failure_threshold: u32,
    /// Concurrent probes per sweep.
    pub concurrency_cap: usize,
    pub level: ValidationLevel,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        MonitorConfig {
            check_interval: Duration::from_secs(30),
            failure_threshold: 3,
            concurrency_cap: 16,
            level: ValidationLevel::Basic,
        }
    }
}

/// Emitted when the monitor removes a proxy from the pool.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    Evicted {
        id: ProxyId,
        endpoint: ProxyEndpoint,
        consecutive_failures: u32,
    },
}

/// Totals of one monitoring sweep.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SweepSummary {
    pub checked: usize,
    pub ok: usize,
    pub failed: usize,
    pub evicted: usize,
    /// Proxies dropped by the TTL sweep before probing.
    pub expired: usize,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum MonitorStatus {
    Stopped,
    Running { last_sweep: Option<SweepSummary> },
}

/// Periodically revalidates pool members and evicts persistent failures.
///
/// One background task per rotator instance. `start` is idempotent, `stop`
/// signals shutdown and waits for the task to drain.
pub struct HealthMonitor {
    pool: Arc<ProxyPool>,
    validator: Arc<Validator>,
    config: MonitorConfig,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    events: broadcast::Sender<MonitorEvent>,
    last_sweep: RwLock<Option<SweepSummary>>,
}

impl HealthMonitor {
    pub fn new(pool: Arc<ProxyPool>, validator: Arc<Validator>, config: MonitorConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let (events, _) = broadcast::channel(64);
        HealthMonitor {
            pool,
            validator,
            config,
            handle: Mutex::new(None),
            shutdown,
            events,
            last_sweep: RwLock::new(None),
        }
    }

    /// Listen for eviction events.
    pub fn subscribe(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Spawn the monitoring loop. Calling `start` on a running monitor is
    /// a no-op.
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        self.shutdown.send_replace(false);

        let monitor = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        *handle = Some(tokio::spawn(async move {
            info!(
                "Health monitor started ({}s interval, threshold {})",
                monitor.config.check_interval.as_secs(),
                monitor.config.failure_threshold
            );
            let start = tokio::time::Instant::now() + monitor.config.check_interval;
            let mut ticker = tokio::time::interval_at(start, monitor.config.check_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let summary = monitor.sweep().await;
                        *monitor.last_sweep.write() = Some(summary);
                    }
                    result = shutdown_rx.changed() => {
                        if result.is_err() || *shutdown_rx.borrow() {
                            info!("Health monitor shutting down");
                            break;
                        }
                    }
                }
            }
        }));
    }

    /// Signal shutdown and wait for the loop to exit.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Health monitor task failed: {e}");
            }
        }
    }

    pub fn status(&self) -> MonitorStatus {
        if self.handle.lock().is_some() {
            MonitorStatus::Running {
                last_sweep: *self.last_sweep.read(),
            }
        } else {
            MonitorStatus::Stopped
        }
    }

    /// One revalidation pass over a snapshot of the membership, preceded
    /// by the TTL sweep.
    async fn sweep(&self) -> SweepSummary {
        let expired = self.pool.remove_expired(Utc::now());
        let members = self.pool.list();
        let mut summary = SweepSummary {
            checked: members.len(),
            expired,
            ..SweepSummary::default()
        };

        let validator = Arc::clone(&self.validator);
        let level = self.config.level;
        let results: Vec<_> = stream::iter(members)
            .map(|proxy| {
                let validator = Arc::clone(&validator);
                async move { validator.validate(&proxy, level).await }
            })
            .buffer_unordered(self.config.concurrency_cap.max(1))
            .collect()
            .await;

        for result in results {
            if result.success {
                // A proxy removed between snapshot and result is a no-op.
                if self
                    .pool
                    .apply_probe(result.proxy_id, true, result.latency_ms, None)
                    .is_some()
                {
                    summary.ok += 1;
                }
                continue;
            }

            summary.failed += 1;
            let updated =
                match self
                    .pool
                    .apply_probe(result.proxy_id, false, None, result.error_kind)
                {
                    Some(updated) => updated,
                    None => continue,
                };

            if updated.stats.consecutive_failures >= self.config.failure_threshold {
                self.pool.set_health(result.proxy_id, HealthState::Dead);
                if self
                    .pool
                    .remove_by_endpoint(&result.endpoint.host, result.endpoint.port)
                    .is_ok()
                {
                    warn!(
                        "Evicting proxy {} after {} consecutive failures",
                        result.endpoint, updated.stats.consecutive_failures
                    );
                    summary.evicted += 1;
                    let _ = self.events.send(MonitorEvent::Evicted {
                        id: result.proxy_id,
                        endpoint: result.endpoint,
                        consecutive_failures: updated.stats.consecutive_failures,
                    });
                }
            }
        }

        summary.finished_at = Some(Utc::now());
        info!(
            "Health sweep: {} checked, {} ok, {} failed, {} evicted",
            summary.checked, summary.ok, summary.failed, summary.evicted
        );
        summary
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validator::ValidatorConfig;

    fn monitor(pool: Arc<ProxyPool>, config: MonitorConfig) -> Arc<HealthMonitor> {
        Arc::new(HealthMonitor::new(
            pool,
            Arc::new(Validator::new(ValidatorConfig {
                timeout: Duration::from_secs(1),
                ..ValidatorConfig::default()
            })),
            config,
        ))
    }

    #[tokio::test]
    async fn start_is_idempotent_and_stop_waits() {
        let pool = Arc::new(ProxyPool::new());
        let monitor = monitor(pool, MonitorConfig::default());

        assert!(matches!(monitor.status(), MonitorStatus::Stopped));
        monitor.start();
        monitor.start();
        assert!(matches!(monitor.status(), MonitorStatus::Running { .. }));

        monitor.stop().await;
        assert!(matches!(monitor.status(), MonitorStatus::Stopped));

        // A stopped monitor can be started again.
        monitor.start();
        assert!(matches!(monitor.status(), MonitorStatus::Running { .. }));
        monitor.stop().await;
    }

    #[tokio::test]
    async fn sweep_over_an_empty_pool_is_quiet() {
        let pool = Arc::new(ProxyPool::new());
        let monitor = monitor(pool, MonitorConfig::default());

        let summary = monitor.sweep().await;
        assert_eq!(summary.checked, 0);
        assert_eq!(summary.ok, 0);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.evicted, 0);
    }

    #[tokio::test]
    async fn failing_proxy_is_evicted_after_threshold_sweeps() {
        // A port with nothing listening refuses immediately.
        let dead = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let pool = Arc::new(ProxyPool::new());
        let mut proxy =
            crate::proxy::Proxy::new(ProxyEndpoint::parse("127.0.0.1:1").unwrap());
        proxy.endpoint.host = dead_addr.ip().to_string();
        proxy.endpoint.port = dead_addr.port();
        pool.add(proxy).unwrap();

        let monitor = monitor(
            Arc::clone(&pool),
            MonitorConfig {
                failure_threshold: 3,
                ..MonitorConfig::default()
            },
        );
        let mut events = monitor.subscribe();

        let first = monitor.sweep().await;
        assert_eq!(first.failed, 1);
        assert_eq!(first.evicted, 0);
        monitor.sweep().await;
        let third = monitor.sweep().await;
        assert_eq!(third.evicted, 1);
        assert!(pool.is_empty());

        match events.try_recv().unwrap() {
            MonitorEvent::Evicted {
                consecutive_failures,
                ..
            } => assert_eq!(consecutive_failures, 3),
        }
    }
}
