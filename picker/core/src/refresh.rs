//! Telemetry Refresh Loop
//!
//! Polls every registered backend on a fixed interval and swaps in the
//! fresh snapshot. A failed or timed-out scrape keeps the previous snapshot
//! and never removes the backend; membership is the reconcilers' business.
//! So does a snapshot reporting a key with a type other than the one its
//! producer declared.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::config::RefreshConfig;
use crate::datalayer::{TelemetryContract, TelemetrySnapshot};
use crate::datastore::Datastore;
use crate::metrics::Counter;
use crate::source::{FetchError, TelemetryFetcher};

/// Consecutive failures after which a backend's scrape errors log at warn
const WARN_AFTER_FAILURES: u32 = 10;

#[derive(Debug, Default)]
pub struct RefreshStats {
    pub ticks: Counter,
    pub successes: Counter,
    pub failures: Counter,
    consecutive: DashMap<String, u32>,
}

impl RefreshStats {
    /// Failures since the backend's last successful scrape
    pub fn consecutive_failures(&self, address: &str) -> u32 {
        self.consecutive.get(address).map(|n| *n).unwrap_or(0)
    }

    /// Backends with at least one outstanding failure
    pub fn failing_backends(&self) -> usize {
        self.consecutive.len()
    }
}

/// Outcome of one refresh pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    pub refreshed: usize,
    pub failed: usize,
    /// Backends removed while their scrape was in flight
    pub skipped: usize,
}

pub struct TelemetryRefresher {
    datastore: Arc<Datastore>,
    fetcher: Arc<dyn TelemetryFetcher>,
    interval: Duration,
    fetch_timeout: Duration,
    contract: TelemetryContract,
    stats: Arc<RefreshStats>,
}

impl TelemetryRefresher {
    pub fn new(
        datastore: Arc<Datastore>,
        fetcher: Arc<dyn TelemetryFetcher>,
        config: &RefreshConfig,
    ) -> Self {
        Self {
            datastore,
            fetcher,
            interval: config.interval(),
            fetch_timeout: config.fetch_timeout(),
            contract: TelemetryContract::new(),
            stats: Arc::new(RefreshStats::default()),
        }
    }

    /// Reject snapshots whose values disagree with the declared key types
    #[must_use]
    pub fn with_contract(mut self, contract: TelemetryContract) -> Self {
        self.contract = contract;
        self
    }

    fn check(&self, snapshot: TelemetrySnapshot) -> Result<TelemetrySnapshot, FetchError> {
        let violations = snapshot.violations(&self.contract);
        if violations.is_empty() {
            Ok(snapshot)
        } else {
            Err(FetchError::Malformed(format!(
                "unexpected value type for {}",
                violations.join(", ")
            )))
        }
    }

    pub fn stats(&self) -> Arc<RefreshStats> {
        Arc::clone(&self.stats)
    }

    /// Scrape every backend once, concurrently
    pub async fn refresh_once(&self) -> RefreshReport {
        self.stats.ticks.inc();
        let backends = self.datastore.backends().list();

        let scrapes = backends.iter().map(|backend| async move {
            let previous = backend.telemetry.as_deref();
            let result =
                match tokio::time::timeout(self.fetch_timeout, self.fetcher.fetch(backend, previous))
                    .await
                {
                    Ok(result) => result.and_then(|snapshot| self.check(snapshot)),
                    Err(_) => Err(FetchError::Timeout(self.fetch_timeout)),
                };
            (backend, result)
        });

        let mut report = RefreshReport::default();
        for (backend, result) in join_all(scrapes).await {
            match result {
                Ok(snapshot) => {
                    if self
                        .datastore
                        .backends()
                        .update_telemetry(&backend.address, snapshot)
                    {
                        report.refreshed += 1;
                        self.stats.successes.inc();
                        self.stats.consecutive.remove(&backend.address);
                    } else {
                        report.skipped += 1;
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    self.stats.failures.inc();
                    let failures = {
                        let mut entry = self
                            .stats
                            .consecutive
                            .entry(backend.address.clone())
                            .or_insert(0);
                        *entry += 1;
                        *entry
                    };
                    if failures == WARN_AFTER_FAILURES {
                        tracing::warn!(address = %backend.address, failures, error = %e, "Telemetry scrape keeps failing");
                    } else {
                        tracing::debug!(address = %backend.address, failures, error = %e, "Telemetry scrape failed");
                    }
                }
            }
        }

        let backends = self.datastore.backends();
        self.stats
            .consecutive
            .retain(|address, _| backends.contains(address));

        tracing::trace!(
            refreshed = report.refreshed,
            failed = report.failed,
            skipped = report.skipped,
            "Telemetry refresh pass"
        );
        report
    }

    /// Refresh on every tick until shutdown
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            fetch_timeout_ms = self.fetch_timeout.as_millis() as u64,
            "Starting telemetry refresh loop"
        );

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait_for(|stop| *stop) => break,
                _ = async {
                    interval.tick().await;
                    self.refresh_once().await
                } => {}
            }
        }

        tracing::info!("Telemetry refresh loop stopped");
    }
}
