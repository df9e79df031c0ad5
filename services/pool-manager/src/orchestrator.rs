//! Pool orchestrator: rotation, gap-filling reconciliation and cleanup.
//!
//! The orchestrator owns the pool's desired state for the current rotation
//! generation and converges the runtime toward it:
//!
//! - **Rotate** rebuilds the whole pool with a fresh shuffled endpoint
//!   assignment, so egress IPs churn over time.
//! - **Reconcile** repairs drift between rotations: it restarts stopped slot
//!   containers and creates missing ones, never touching healthy slots.
//! - **Cleanup** stops and force-removes every managed container.
//!
//! Rotation and reconciliation both read then write the pool, so they run
//! under a single non-blocking cycle guard. A caller that cannot take the
//! guard skips its turn; nothing ever queues behind a running cycle.
//!
//! Runtime failures never escape: each failed command is logged and the
//! pass moves on to the next container. The visible failure mode is a
//! degraded pool, which the next monitor tick notices.

use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use rand::seq::SliceRandom;
use tracing::{debug, error, info, instrument, warn};
use vpnpool_reconcile::{
    plan_cleanup, plan_reconcile, plan_rotation, running_slots, PoolLayout, Slot,
};

use crate::directory::Directory;
use crate::runtime::{ContainerRuntime, RuntimeError};

/// When a rotation destroys the current pool relative to the directory query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RotationOrder {
    /// Query candidates first; keep the current pool if none come back.
    #[default]
    FetchFirst,

    /// Destroy the pool first; an empty candidate list leaves it empty
    /// until the next rotation.
    CleanupFirst,
}

impl FromStr for RotationOrder {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fetch-first" | "fetch_first" => Ok(Self::FetchFirst),
            "cleanup-first" | "cleanup_first" => Ok(Self::CleanupFirst),
            other => Err(format!(
                "unknown rotation order {other:?} (expected fetch-first or cleanup-first)"
            )),
        }
    }
}

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    pub layout: PoolLayout,
    pub rotation_order: RotationOrder,
    pub runtime_timeout: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            layout: PoolLayout::default(),
            rotation_order: RotationOrder::default(),
            runtime_timeout: Duration::from_secs(60),
        }
    }
}

/// Result of a cleanup pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    /// Containers stopped before removal.
    pub stopped: usize,

    /// Containers removed.
    pub removed: usize,

    /// Commands that failed (stop or remove).
    pub failed: usize,
}

/// Result of a rotation request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RotationOutcome {
    /// Another cycle held the guard; nothing was done.
    Skipped,

    /// The directory returned no candidates.
    Aborted {
        /// Whether the previous pool was destroyed before the abort.
        cleaned_up: bool,
    },

    /// A new generation was built, possibly partially.
    Completed {
        /// Slots that were created successfully.
        slots: Vec<Slot>,
        /// Slots whose creation failed.
        failed: usize,
    },
}

/// Result of a monitor tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorOutcome {
    /// A cycle was in progress; the tick was skipped.
    Deferred,

    /// The running count could not be read.
    Unavailable,

    /// The running count matched capacity.
    Healthy { running: usize },

    /// The count was off and a reconciliation pass ran.
    Repaired { running: usize, created: usize },
}

/// Exclusive right to run a rotation or reconciliation cycle.
///
/// Released on drop.
pub struct CycleGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Proxy pool orchestrator.
pub struct PoolOrchestrator {
    /// Runtime for container lifecycle commands.
    runtime: Arc<dyn ContainerRuntime>,

    /// Source of candidate endpoints.
    directory: Arc<dyn Directory>,

    config: OrchestratorConfig,

    /// Set while a rotation or reconciliation cycle runs.
    cycle_busy: AtomicBool,

    /// Active slots of the current generation.
    active: ArcSwap<Vec<Slot>>,
}

impl PoolOrchestrator {
    /// Create a new orchestrator.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        directory: Arc<dyn Directory>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            runtime,
            directory,
            config,
            cycle_busy: AtomicBool::new(false),
            active: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// Pool layout.
    pub fn layout(&self) -> &PoolLayout {
        &self.config.layout
    }

    /// Pool capacity.
    pub fn capacity(&self) -> usize {
        self.config.layout.capacity()
    }

    /// Try to take the cycle guard without waiting.
    pub fn try_begin_cycle(&self) -> Option<CycleGuard<'_>> {
        self.cycle_busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| CycleGuard {
                flag: &self.cycle_busy,
            })
    }

    /// Whether a rotation or reconciliation cycle is running.
    pub fn is_cycle_in_progress(&self) -> bool {
        self.cycle_busy.load(Ordering::Acquire)
    }

    /// Snapshot of the active slots, ordered by index.
    pub fn active_slots(&self) -> Arc<Vec<Slot>> {
        self.active.load_full()
    }

    /// Host ports of the active slots.
    pub fn active_ports(&self) -> Vec<u16> {
        self.active.load().iter().map(|slot| slot.port).collect()
    }

    /// Rebuild the whole pool with a fresh endpoint assignment.
    #[instrument(skip(self))]
    pub async fn rotate(&self) -> RotationOutcome {
        let Some(_guard) = self.try_begin_cycle() else {
            debug!("Cycle already in progress, skipping rotation");
            return RotationOutcome::Skipped;
        };

        info!("Rotating containers");

        let candidates = match self.config.rotation_order {
            RotationOrder::FetchFirst => {
                let candidates = self.fetch_shuffled().await;
                if candidates.is_empty() {
                    error!("No VPN servers found, keeping current pool");
                    return RotationOutcome::Aborted { cleaned_up: false };
                }
                self.cleanup().await;
                candidates
            }
            RotationOrder::CleanupFirst => {
                self.cleanup().await;
                let candidates = self.fetch_shuffled().await;
                if candidates.is_empty() {
                    error!("No VPN servers found, pool left empty until next rotation");
                    return RotationOutcome::Aborted { cleaned_up: true };
                }
                candidates
            }
        };

        let desired = plan_rotation(&self.config.layout, &candidates);
        let count = desired.len();
        let mut slots = Vec::with_capacity(count);
        let mut failed = 0;

        for slot in &desired {
            info!(
                slot = slot.index,
                total = count,
                endpoint = %slot.endpoint,
                "Starting container {}/{}",
                slot.index + 1,
                count
            );
            match self
                .bounded("create", self.runtime.create(slot.index, &slot.endpoint))
                .await
            {
                Ok(created) => slots.push(created),
                Err(e) => {
                    failed += 1;
                    error!(
                        slot = slot.index,
                        endpoint = %slot.endpoint,
                        error = %e,
                        "Failed to create container"
                    );
                }
            }
        }

        self.active.store(Arc::new(slots.clone()));
        info!(running = slots.len(), failed, "Rotation complete");

        RotationOutcome::Completed { slots, failed }
    }

    /// Fill gaps in the pool without destroying anything.
    ///
    /// Returns `None` when another cycle holds the guard, otherwise the
    /// newly created slots. `candidates[i]` is the endpoint for a missing
    /// slot `i`.
    pub async fn reconcile(&self, candidates: &[String]) -> Option<Vec<Slot>> {
        let Some(_guard) = self.try_begin_cycle() else {
            debug!("Cycle already in progress, skipping reconciliation");
            return None;
        };
        Some(self.reconcile_locked(candidates).await)
    }

    /// Compare the running count to capacity and repair on mismatch.
    #[instrument(skip(self))]
    pub async fn monitor_tick(&self) -> MonitorOutcome {
        if self.is_cycle_in_progress() {
            debug!("Cycle in progress, deferring monitor check");
            return MonitorOutcome::Deferred;
        }

        // Only in-range slots count; a stale container from a larger pool
        // must not mask a missing slot.
        let running = match self.bounded("list", self.runtime.list_managed()).await {
            Ok(observed) => running_slots(&self.config.layout, &observed),
            Err(e) => {
                warn!(error = %e, "Failed to count running containers");
                return MonitorOutcome::Unavailable;
            }
        };

        let capacity = self.capacity();
        debug!(running, capacity, "Current servers count");
        if running == capacity {
            return MonitorOutcome::Healthy { running };
        }

        let Some(_guard) = self.try_begin_cycle() else {
            debug!("Cycle started during monitor check, deferring");
            return MonitorOutcome::Deferred;
        };

        warn!(running, capacity, "Pool below capacity, starting missing containers");

        let candidates = self.fetch_shuffled().await;
        let created = self.reconcile_locked(&candidates).await;
        info!(created = created.len(), "Started missing containers");

        MonitorOutcome::Repaired {
            running,
            created: created.len(),
        }
    }

    /// Stop and force-remove every managed container.
    ///
    /// Each container is handled independently: a failed command is logged
    /// and the pass continues with the next container.
    pub async fn cleanup(&self) -> CleanupReport {
        let mut report = CleanupReport::default();

        let observed = match self.bounded("list", self.runtime.list_managed()).await {
            Ok(observed) => observed,
            Err(e) => {
                error!(error = %e, "Failed to list managed containers for cleanup");
                return report;
            }
        };

        for step in plan_cleanup(&observed) {
            let container = &step.container;

            if step.stop_first {
                match self.bounded("stop", self.runtime.stop(&container.id)).await {
                    Ok(()) => report.stopped += 1,
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            container_id = %container.id,
                            name = %container.name,
                            error = %e,
                            "Failed to stop container"
                        );
                    }
                }
            }

            match self
                .bounded("remove", self.runtime.remove(&container.id, true))
                .await
            {
                Ok(()) => report.removed += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        container_id = %container.id,
                        name = %container.name,
                        error = %e,
                        "Failed to remove container"
                    );
                }
            }
        }

        if !observed.is_empty() {
            info!(
                stopped = report.stopped,
                removed = report.removed,
                failed = report.failed,
                "Cleanup complete"
            );
        }
        self.active.store(Arc::new(Vec::new()));

        report
    }

    /// Final cleanup on process shutdown. Runs outside the cycle guard.
    pub async fn shutdown(&self) -> CleanupReport {
        info!("Shutting down, cleaning up containers");
        self.cleanup().await
    }

    async fn reconcile_locked(&self, candidates: &[String]) -> Vec<Slot> {
        let observed = match self.bounded("list", self.runtime.list_managed()).await {
            Ok(observed) => observed,
            Err(e) => {
                error!(error = %e, "Failed to list managed containers");
                return Vec::new();
            }
        };

        let plan = plan_reconcile(&self.config.layout, &observed, candidates);
        if plan.is_empty() {
            debug!("Pool has no gaps");
            return Vec::new();
        }

        for container in &plan.starts {
            info!(
                container_id = %container.id,
                name = %container.name,
                state = %container.state,
                "Restarting stopped container"
            );
            if let Err(e) = self.bounded("start", self.runtime.start(&container.id)).await {
                warn!(container_id = %container.id, error = %e, "Failed to start container");
            }
        }

        let mut created = Vec::with_capacity(plan.creates.len());
        for slot in &plan.creates {
            info!(slot = slot.index, endpoint = %slot.endpoint, "Creating missing container");
            match self
                .bounded("create", self.runtime.create(slot.index, &slot.endpoint))
                .await
            {
                Ok(slot) => created.push(slot),
                Err(e) => {
                    error!(slot = slot.index, error = %e, "Failed to create missing container");
                }
            }
        }

        if !created.is_empty() {
            self.merge_active(&created);
        }
        created
    }

    /// Replace active entries by index with freshly created slots.
    fn merge_active(&self, created: &[Slot]) {
        let mut slots: Vec<Slot> = self
            .active
            .load()
            .iter()
            .filter(|slot| !created.iter().any(|c| c.index == slot.index))
            .cloned()
            .collect();
        slots.extend(created.iter().cloned());
        slots.sort_by_key(|slot| slot.index);
        self.active.store(Arc::new(slots));
    }

    /// Fetch candidates and shuffle them to diversify assignment.
    async fn fetch_shuffled(&self) -> Vec<String> {
        let mut candidates = self.directory.fetch_candidates().await;
        candidates.shuffle(&mut rand::rng());
        debug!(count = candidates.len(), "Fetched candidate endpoints");
        candidates
    }

    /// Bound a runtime call by the configured timeout.
    async fn bounded<T, F>(&self, op: &'static str, call: F) -> Result<T, RuntimeError>
    where
        F: Future<Output = Result<T, RuntimeError>>,
    {
        let limit = self.config.runtime_timeout;
        match tokio::time::timeout(limit, call).await {
            Ok(result) => result,
            Err(_) => Err(RuntimeError::Timeout { op, elapsed: limit }),
        }
    }
}
