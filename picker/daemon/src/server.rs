//! Daemon Server Implementation
//!
//! Wires the picker core together and drives it until shutdown:
//! - Builds the telemetry dependency graph (fatal if invalid) and checks
//!   scraped snapshots against the keys its producers declare
//! - Starts the pool, model and membership reconcile loops
//! - Forwards resource change events through the dispatcher
//! - Runs the telemetry refresh loop against live backends
//! - Re-reads the resources file on request
//! - Logs readiness transitions
//!
//! ```text
//!   resources.toml ──reload──> FileResourceSource ──ChangeEvent──> ChangeDispatcher
//!                                     │                              │  │  │
//!                                     │ fetch                  pool model membership
//!                                     ▼                              ▼  ▼  ▼
//!                               ReconcileLoops ───────────────> Datastore <── TelemetryRefresher
//!                                                                                   │
//!                                                                          HttpTelemetryFetcher
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use picker_core::datalayer::default_graph;
use picker_core::{
    ChangeDispatcher, ChangeEvent, DataSourceKind, Datastore, LeastQueuePicker,
    MembershipReconciler, ModelReconciler, PickerConfig, PoolReconciler, Readiness,
    ReconcileLoop, ResourceSource, TelemetryContract, TelemetryRefresher,
};

use crate::resources::FileResourceSource;
use crate::scrape::HttpTelemetryFetcher;

/// Capacity of the change notification channel
const EVENT_CAPACITY: usize = 256;

/// How often readiness is sampled for transition logging
const READINESS_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// How long running loops get to stop after shutdown is signalled
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Requests the signal handler forwards to the server
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Control {
    Reload,
    Shutdown,
}

/// The running picker
pub struct PickerServer {
    config: PickerConfig,
    datastore: Arc<Datastore>,
    source: Arc<FileResourceSource>,
    /// Keys the refresh loop fills, with their declared types
    telemetry: TelemetryContract,
}

impl PickerServer {
    pub fn new(config: PickerConfig, source: FileResourceSource) -> Result<Self> {
        let graph = default_graph().context("Telemetry plugin graph is invalid")?;
        for node in graph.execution_order() {
            info!(
                plugin = node.name(),
                producer = node.is_producer(),
                consumes = node.consumes().len(),
                produces = node.produces().len(),
                "Registered telemetry plugin"
            );
        }
        graph
            .admit(&LeastQueuePicker)
            .context("Backend picker is not wired into the telemetry graph")?;

        Ok(Self {
            config,
            datastore: Arc::new(Datastore::new()),
            source: Arc::new(source),
            telemetry: graph.produced(DataSourceKind::PoolLevel),
        })
    }

    /// Run until a [`Control::Shutdown`] arrives or the control channel closes
    pub async fn run(self, mut control: mpsc::Receiver<Control>) -> Result<()> {
        let pool_id = self.config.pool_id();
        let membership_id = self.config.membership_id();
        let source: Arc<dyn ResourceSource> = self.source.clone();
        let reconcile = &self.config.reconcile;

        let memberships = ReconcileLoop::new(
            MembershipReconciler::new(
                Arc::clone(&self.datastore),
                Arc::clone(&source),
                membership_id.clone(),
            ),
            reconcile,
        );
        let pools = ReconcileLoop::new(
            PoolReconciler::new(
                Arc::clone(&self.datastore),
                Arc::clone(&source),
                pool_id.clone(),
            )
            .with_dependent(memberships.queue(), membership_id.clone()),
            reconcile,
        );
        let models = ReconcileLoop::new(
            ModelReconciler::new(Arc::clone(&self.datastore), source, pool_id.name.clone()),
            reconcile,
        );
        let dispatcher = ChangeDispatcher::new(pools.queue(), models.queue(), memberships.queue());

        let fetcher = HttpTelemetryFetcher::new(
            Arc::clone(&self.datastore),
            &self.config.telemetry,
            self.config.refresh.fetch_timeout(),
        )
        .context("Failed to create HTTP client")?;
        let refresher = TelemetryRefresher::new(
            Arc::clone(&self.datastore),
            Arc::new(fetcher),
            &self.config.refresh,
        )
        .with_contract(self.telemetry.clone());

        let (event_tx, event_rx) = mpsc::channel::<ChangeEvent>(EVENT_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = JoinSet::new();
        tasks.spawn(pools.run(shutdown_rx.clone()));
        tasks.spawn(models.run(shutdown_rx.clone()));
        tasks.spawn(memberships.run(shutdown_rx.clone()));
        tasks.spawn(dispatcher.run(event_rx, shutdown_rx.clone()));
        tasks.spawn(refresher.run(shutdown_rx));

        info!(pool = %pool_id, membership = %membership_id, "Picker started");
        self.publish(&event_tx, self.source.events()).await;

        let mut probe = tokio::time::interval(READINESS_PROBE_INTERVAL);
        probe.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut last = self.datastore.readiness();

        loop {
            tokio::select! {
                request = control.recv() => match request {
                    Some(Control::Reload) => self.reload(&event_tx).await,
                    Some(Control::Shutdown) | None => break,
                },
                _ = probe.tick() => {
                    let now = self.datastore.readiness();
                    log_transition(&last, &now);
                    last = now;
                }
            }
        }

        info!("Initiating graceful shutdown");
        shutdown_tx.send_replace(true);
        drop(event_tx);

        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    error!(error = %e, "Picker task failed");
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!("Picker tasks did not stop in time, aborting");
            tasks.abort_all();
        }

        let readiness = self.datastore.readiness();
        info!(
            models = readiness.models,
            backends = readiness.backends,
            "Shutdown complete"
        );
        Ok(())
    }

    async fn reload(&self, events: &mpsc::Sender<ChangeEvent>) {
        info!(path = %self.source.path().display(), "Reloading resources");
        match self.source.reload().await {
            Ok(changed) => self.publish(events, changed).await,
            Err(e) => warn!(error = %e, "Resource reload failed, keeping previous contents"),
        }
    }

    async fn publish(&self, events: &mpsc::Sender<ChangeEvent>, changed: Vec<ChangeEvent>) {
        for event in changed {
            if events.send(event).await.is_err() {
                warn!("Change dispatcher stopped, dropping notifications");
                return;
            }
        }
    }
}

fn log_transition(before: &Readiness, after: &Readiness) {
    if before.is_ready() != after.is_ready() {
        if after.is_ready() {
            info!(pool_ready = true, "Picker is ready");
        } else {
            warn!(pool_ready = false, "Picker is no longer ready");
        }
    }
    if before.is_routable() != after.is_routable() {
        info!(
            routable = after.is_routable(),
            models = after.models,
            backends = after.backends,
            backends_with_telemetry = after.backends_with_telemetry,
            "Routability changed"
        );
    }
}
