//! Convergence primitives for the VPN proxy pool.
//!
//! This library holds the pure half of the pool manager: the slot model,
//! the container naming convention, and the planners that turn observed
//! runtime state into the commands needed to converge it. Key concepts:
//!
//! - **Desired state**: one slot per pool index, each bound to a host port
//!   and a VPN endpoint for the current rotation generation.
//! - **Observed state**: the managed containers the runtime reports,
//!   matched back to slots through their names.
//! - **Convergence**: rotation rebuilds the whole pool, reconciliation only
//!   fills gaps and restarts what stopped.
//!
//! # Invariants
//!
//! - Planning never performs I/O
//! - Decisions are deterministic given the same inputs
//! - No two planned slots share an index or a host port
//! - Reconcile plans never contain removals

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Default container name prefix for managed containers.
pub const DEFAULT_NAME_PREFIX: &str = "nord-vpn-";

/// Default first host port of the pool.
pub const DEFAULT_BASE_PORT: u16 = 8881;

/// Default pool capacity.
pub const DEFAULT_CAPACITY: usize = 20;

/// Default full rotation period.
pub const DEFAULT_ROTATION_INTERVAL: Duration = Duration::from_secs(10 * 60); // 10 minutes

/// Default drift check period.
pub const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);

/// Errors raised while validating a pool layout.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LayoutError {
    /// A pool must hold at least one slot.
    #[error("pool capacity must be at least 1")]
    EmptyPool,

    /// The last slot's port does not fit in the port range.
    #[error("base port {base_port} with capacity {capacity} exceeds port 65535")]
    PortRangeOverflow { base_port: u16, capacity: usize },

    /// The name prefix cannot be used as a container name.
    #[error("invalid container name prefix {0:?}")]
    InvalidPrefix(String),
}

/// The naming and port convention shared by every slot in the pool.
///
/// The layout is the only link between desired and observed state: a slot's
/// name and port are pure functions of its index, so the pool can be
/// reconstructed from the runtime at any time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolLayout {
    capacity: usize,
    base_port: u16,
    name_prefix: String,
}

impl PoolLayout {
    /// Validate and build a layout.
    pub fn new(
        capacity: usize,
        base_port: u16,
        name_prefix: impl Into<String>,
    ) -> Result<Self, LayoutError> {
        let name_prefix = name_prefix.into();

        if capacity == 0 {
            return Err(LayoutError::EmptyPool);
        }

        let last_port = usize::from(base_port).checked_add(capacity - 1);
        if last_port.is_none_or(|port| port > usize::from(u16::MAX)) {
            return Err(LayoutError::PortRangeOverflow {
                base_port,
                capacity,
            });
        }

        // Container names are [a-zA-Z0-9][a-zA-Z0-9_.-]*
        let valid_prefix = name_prefix
            .chars()
            .next()
            .is_some_and(|c| c.is_ascii_alphanumeric())
            && name_prefix
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
        if !valid_prefix {
            return Err(LayoutError::InvalidPrefix(name_prefix));
        }

        Ok(Self {
            capacity,
            base_port,
            name_prefix,
        })
    }

    /// Number of slots in the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Host port of slot 0.
    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Prefix shared by every managed container name.
    pub fn name_prefix(&self) -> &str {
        &self.name_prefix
    }

    /// Container name for a slot index.
    pub fn name_for(&self, index: usize) -> String {
        format!("{}{}", self.name_prefix, index)
    }

    /// Host port for a slot index.
    ///
    /// Indices past the capacity are clamped to the last port so the result
    /// is always a valid port; callers only pass indices below capacity.
    pub fn port_for(&self, index: usize) -> u16 {
        let offset = index.min(self.capacity - 1);
        // Fits: validated in `new`.
        self.base_port + offset as u16
    }

    /// Whether a runtime name belongs to the pool.
    ///
    /// The Docker API reports names with a leading `/`, which is ignored.
    pub fn is_managed(&self, name: &str) -> bool {
        strip_runtime_slash(name).starts_with(&self.name_prefix)
    }

    /// Recover the slot index encoded in a container name.
    ///
    /// Only canonical names round-trip: `nord-vpn-07` or `nord-vpn-+7` are
    /// managed (they match the prefix) but carry no index.
    pub fn index_from_name(&self, name: &str) -> Option<usize> {
        let rest = strip_runtime_slash(name).strip_prefix(&self.name_prefix)?;
        if rest.is_empty() || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let index: usize = rest.parse().ok()?;
        (index.to_string() == rest).then_some(index)
    }

    /// Whether an index addresses a slot of this pool.
    pub fn contains(&self, index: usize) -> bool {
        index < self.capacity
    }
}

impl Default for PoolLayout {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            base_port: DEFAULT_BASE_PORT,
            name_prefix: DEFAULT_NAME_PREFIX.to_string(),
        }
    }
}

fn strip_runtime_slash(name: &str) -> &str {
    name.strip_prefix('/').unwrap_or(name)
}

/// Desired-state record binding a pool index to a port and a VPN endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Slot {
    /// Position in the pool, `0..capacity`.
    pub index: usize,

    /// Container name derived from the index.
    pub name: String,

    /// Host port derived from the index.
    pub port: u16,

    /// VPN server hostname assigned for the current generation.
    pub endpoint: String,

    /// Runtime identifier, set once the container exists.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_id: Option<String>,
}

impl Slot {
    /// A slot that is desired but not yet backed by a container.
    pub fn desired(layout: &PoolLayout, index: usize, endpoint: impl Into<String>) -> Self {
        Self {
            index,
            name: layout.name_for(index),
            port: layout.port_for(index),
            endpoint: endpoint.into(),
            container_id: None,
        }
    }

    /// Attach the runtime identifier after successful creation.
    pub fn realized(mut self, container_id: impl Into<String>) -> Self {
        self.container_id = Some(container_id.into());
        self
    }

    /// Whether a container backs this slot.
    pub fn is_realized(&self) -> bool {
        self.container_id.is_some()
    }
}

/// Container lifecycle state as reported by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContainerState {
    Created,
    Running,
    Restarting,
    Paused,
    Exited,
    Dead,
    Removing,
    Unknown(String),
}

impl ContainerState {
    /// Classify a runtime state string.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "created" => Self::Created,
            "running" => Self::Running,
            "restarting" => Self::Restarting,
            "paused" => Self::Paused,
            "exited" => Self::Exited,
            "dead" => Self::Dead,
            "removing" => Self::Removing,
            _ => Self::Unknown(raw.to_string()),
        }
    }

    /// Running or restarting: the states cleanup must stop before removal.
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Running | Self::Restarting)
    }

    /// Only `Running` counts toward a healthy pool.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running)
    }
}

impl fmt::Display for ContainerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Restarting => "restarting",
            Self::Paused => "paused",
            Self::Exited => "exited",
            Self::Dead => "dead",
            Self::Removing => "removing",
            Self::Unknown(raw) => raw.as_str(),
        };
        f.write_str(s)
    }
}

/// A managed container as observed in the runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObservedContainer {
    /// Runtime identifier.
    pub id: String,

    /// Name without the runtime's leading slash.
    pub name: String,

    /// Lifecycle state at observation time.
    pub state: ContainerState,
}

impl ObservedContainer {
    pub fn new(id: impl Into<String>, name: impl Into<String>, state: ContainerState) -> Self {
        let name = name.into();
        let name = strip_runtime_slash(&name).to_string();
        Self {
            id: id.into(),
            name,
            state,
        }
    }

    /// Slot index encoded in the name, if any.
    pub fn index(&self, layout: &PoolLayout) -> Option<usize> {
        layout.index_from_name(&self.name)
    }
}

/// Desired slots for a fresh rotation generation.
///
/// Candidates are consumed in order: slot `i` gets `candidates[i]`, for
/// `i < min(capacity, candidates.len())`. Shuffling is the caller's job.
pub fn plan_rotation(layout: &PoolLayout, candidates: &[String]) -> Vec<Slot> {
    candidates
        .iter()
        .take(layout.capacity())
        .enumerate()
        .map(|(index, endpoint)| Slot::desired(layout, index, endpoint.clone()))
        .collect()
}

/// Commands needed to repair drift without disturbing healthy slots.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Observed slot containers that are not running.
    pub starts: Vec<ObservedContainer>,

    /// Missing slots to create.
    pub creates: Vec<Slot>,
}

impl ReconcilePlan {
    /// Returns true if the pool needs no repair.
    pub fn is_empty(&self) -> bool {
        self.starts.is_empty() && self.creates.is_empty()
    }
}

/// Plan a gap-filling pass.
///
/// Every observed in-range slot that is not running gets a start; every
/// index with no observed container gets created from the candidate at the
/// same position, when there is one. Containers whose name carries no
/// index, or an index past the capacity, are left for the next cleanup.
pub fn plan_reconcile(
    layout: &PoolLayout,
    observed: &[ObservedContainer],
    candidates: &[String],
) -> ReconcilePlan {
    let mut present = BTreeSet::new();
    let mut starts = Vec::new();

    for container in observed {
        let Some(index) = container.index(layout) else {
            continue;
        };
        if !layout.contains(index) {
            continue;
        }
        if present.insert(index) && !container.state.is_running() {
            starts.push(container.clone());
        }
    }

    let creates = (0..layout.capacity())
        .filter(|index| !present.contains(index))
        .filter_map(|index| {
            candidates
                .get(index)
                .map(|endpoint| Slot::desired(layout, index, endpoint.clone()))
        })
        .collect();

    ReconcilePlan { starts, creates }
}

/// Number of in-range slots with a running container.
///
/// Managed containers whose name carries no index, or an index past the
/// capacity, do not count: they cannot stand in for a missing slot. A slot
/// is counted once even if several containers claim it.
pub fn running_slots(layout: &PoolLayout, observed: &[ObservedContainer]) -> usize {
    observed
        .iter()
        .filter(|c| c.state.is_running())
        .filter_map(|c| c.index(layout))
        .filter(|&index| layout.contains(index))
        .collect::<BTreeSet<_>>()
        .len()
}

/// One container's teardown during cleanup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeardownStep {
    /// Container to remove.
    pub container: ObservedContainer,

    /// Stop before the forced removal.
    pub stop_first: bool,
}

/// Plan the destruction of every managed container.
pub fn plan_cleanup(observed: &[ObservedContainer]) -> Vec<TeardownStep> {
    observed
        .iter()
        .map(|container| TeardownStep {
            stop_first: container.state.is_live(),
            container: container.clone(),
        })
        .collect()
}
