//! Periodic triggers driving the orchestrator.
//!
//! Two independent loops share the orchestrator's cycle guard:
//! - **Rotation**: rebuilds the pool at startup and then on a long period
//! - **Monitor**: checks the running count on a short period and repairs
//!   drift, deferring while a rotation is in progress

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::config::ScheduleConfig;
use crate::orchestrator::{MonitorOutcome, PoolOrchestrator, RotationOutcome};

/// Handles to the spawned scheduler loops.
pub struct SchedulerHandles {
    pub rotation: JoinHandle<()>,
    pub monitor: JoinHandle<()>,
}

impl SchedulerHandles {
    /// Wait for both loops to exit after shutdown was signalled.
    ///
    /// A loop still running after `timeout` is aborted and awaited, so no
    /// cycle can touch the runtime once this returns.
    pub async fn join(self, timeout: Duration) {
        join_or_abort("rotation", self.rotation, timeout).await;
        join_or_abort("monitor", self.monitor, timeout).await;
    }
}

async fn join_or_abort(name: &'static str, mut handle: JoinHandle<()>, timeout: Duration) {
    if tokio::time::timeout(timeout, &mut handle).await.is_ok() {
        return;
    }
    warn!(task = name, "Loop did not shut down in time, aborting");
    handle.abort();
    if let Err(e) = handle.await {
        if !e.is_cancelled() {
            warn!(task = name, error = %e, "Loop task failed");
        }
    }
}

/// Resolve once shutdown is requested or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Scheduler for the rotation and monitor loops.
pub struct PoolScheduler {
    orchestrator: Arc<PoolOrchestrator>,
    config: ScheduleConfig,
}

impl PoolScheduler {
    /// Create a new scheduler.
    pub fn new(orchestrator: Arc<PoolOrchestrator>, config: ScheduleConfig) -> Self {
        Self {
            orchestrator,
            config,
        }
    }

    /// Spawn both loops. They run until `shutdown` flips to true.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> SchedulerHandles {
        let rotation = tokio::spawn({
            let orchestrator = Arc::clone(&self.orchestrator);
            let config = self.config.clone();
            let shutdown = shutdown.clone();
            async move { run_rotation_loop(orchestrator, config, shutdown).await }
        });

        let monitor = tokio::spawn({
            let orchestrator = Arc::clone(&self.orchestrator);
            let config = self.config.clone();
            async move { run_monitor_loop(orchestrator, config, shutdown).await }
        });

        SchedulerHandles { rotation, monitor }
    }
}

/// Rotate immediately, then every `rotation_interval`.
#[instrument(skip_all)]
pub async fn run_rotation_loop(
    orchestrator: Arc<PoolOrchestrator>,
    config: ScheduleConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_secs = config.rotation_interval.as_secs(),
        "Starting rotation loop"
    );

    let mut interval = tokio::time::interval(config.rotation_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }

        // Shutdown interrupts a rotation between runtime calls; the final
        // cleanup removes whatever it had created.
        let outcome = tokio::select! {
            outcome = orchestrator.rotate() => outcome,
            _ = shutdown_requested(&mut shutdown) => {
                info!("Shutdown requested, interrupting rotation");
                break;
            }
        };

        match outcome {
            RotationOutcome::Skipped => debug!("Rotation skipped, cycle in progress"),
            RotationOutcome::Aborted { cleaned_up } => {
                debug!(cleaned_up, "Rotation aborted");
            }
            RotationOutcome::Completed { slots, failed } => {
                debug!(running = slots.len(), failed, "Rotation finished");
            }
        }
    }

    info!("Rotation loop shutting down");
}

/// Check the pool every `monitor_interval`.
#[instrument(skip_all)]
pub async fn run_monitor_loop(
    orchestrator: Arc<PoolOrchestrator>,
    config: ScheduleConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_secs = config.monitor_interval.as_secs(),
        "Starting monitor loop"
    );

    let mut interval = tokio::time::interval(config.monitor_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    // Don't tick on startup; the initial rotation owns the first cycle
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown_requested(&mut shutdown) => break,
        }

        let outcome = tokio::select! {
            outcome = orchestrator.monitor_tick() => outcome,
            _ = shutdown_requested(&mut shutdown) => {
                info!("Shutdown requested, interrupting monitor repair");
                break;
            }
        };

        if let MonitorOutcome::Repaired { running, created } = outcome {
            debug!(running, created, "Monitor repaired pool");
        }
    }

    info!("Monitor loop shutting down");
}
