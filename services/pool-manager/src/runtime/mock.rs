//! In-memory runtime for testing and development.
//!
//! Behaves like a container engine for the pool's purposes: names and host
//! ports must be unique, created containers start running, and every
//! command is recorded so tests can assert on exactly what was issued.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info};
use vpnpool_reconcile::{ContainerState, ObservedContainer, PoolLayout, Slot};

use super::{ContainerRuntime, RuntimeError};

/// A command received by the mock runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeCommand {
    List,
    Create { index: usize, endpoint: String },
    Start(String),
    Stop(String),
    Remove { id: String, force: bool },
}

impl RuntimeCommand {
    /// Whether the command can change runtime state.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Self::List)
    }
}

#[derive(Debug, Clone)]
struct MockContainer {
    name: String,
    port: u16,
    endpoint: String,
    state: ContainerState,
}

#[derive(Debug, Default)]
struct MockState {
    containers: BTreeMap<String, MockContainer>,
    commands: Vec<RuntimeCommand>,
    fail_create: HashSet<usize>,
    fail_ids: HashSet<String>,
    delay: Option<Duration>,
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    layout: PoolLayout,
    state: Mutex<MockState>,
    id_counter: AtomicU64,
}

impl MockRuntime {
    /// Create an empty mock runtime for the given pool layout.
    pub fn new(layout: PoolLayout) -> Self {
        Self {
            layout,
            state: Mutex::new(MockState::default()),
            id_counter: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn next_id(&self) -> String {
        let counter = self.id_counter.fetch_add(1, Ordering::SeqCst);
        format!("ctr_{counter:012x}")
    }

    /// Make every create for `index` fail as the engine would on a bad spec.
    pub fn fail_create_for(&self, index: usize) {
        self.lock().fail_create.insert(index);
    }

    /// Make start, stop and remove fail for a container id.
    pub fn fail_commands_for(&self, id: &str) {
        self.lock().fail_ids.insert(id.to_string());
    }

    /// Delay every command, to keep an operation in flight.
    pub fn set_delay(&self, delay: Duration) {
        self.lock().delay = Some(delay);
    }

    /// Seed a container as if something created it earlier. Returns its id.
    pub fn insert_container(&self, index: usize, endpoint: &str, state: ContainerState) -> String {
        let name = self.layout.name_for(index);
        self.insert_named(&name, self.layout.port_for(index), endpoint, state)
    }

    /// Seed a container with an arbitrary name. Returns its id.
    pub fn insert_named(
        &self,
        name: &str,
        port: u16,
        endpoint: &str,
        state: ContainerState,
    ) -> String {
        let id = self.next_id();
        self.lock().containers.insert(
            id.clone(),
            MockContainer {
                name: name.to_string(),
                port,
                endpoint: endpoint.to_string(),
                state,
            },
        );
        id
    }

    /// Force a container into a state, as an external crash or manual stop would.
    pub fn set_state(&self, id: &str, state: ContainerState) {
        if let Some(container) = self.lock().containers.get_mut(id) {
            container.state = state;
        }
    }

    /// Id of the container holding a slot's name.
    pub fn id_for_index(&self, index: usize) -> Option<String> {
        let name = self.layout.name_for(index);
        self.lock()
            .containers
            .iter()
            .find(|(_, c)| c.name == name)
            .map(|(id, _)| id.clone())
    }

    /// Endpoint assigned to a slot's container.
    pub fn endpoint_for_index(&self, index: usize) -> Option<String> {
        let name = self.layout.name_for(index);
        self.lock()
            .containers
            .values()
            .find(|c| c.name == name)
            .map(|c| c.endpoint.clone())
    }

    /// Number of containers of any state.
    pub fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    /// Every command received so far.
    pub fn commands(&self) -> Vec<RuntimeCommand> {
        self.lock().commands.clone()
    }

    /// Commands that could change runtime state.
    pub fn mutations(&self) -> Vec<RuntimeCommand> {
        self.lock()
            .commands
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    /// Forget recorded commands.
    pub fn clear_commands(&self) {
        self.lock().commands.clear();
    }

    /// Record a command and return the configured delay.
    fn record(&self, command: RuntimeCommand) -> Option<Duration> {
        let mut state = self.lock();
        state.commands.push(command);
        state.delay
    }

    async fn pause(delay: Option<Duration>) {
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    fn check_injected(&self, id: &str, op: &str) -> Result<(), RuntimeError> {
        if self.lock().fail_ids.contains(id) {
            return Err(RuntimeError::Api {
                status: 500,
                message: format!("[MOCK] {op} configured to fail for {id}"),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn list_managed(&self) -> Result<Vec<ObservedContainer>, RuntimeError> {
        let delay = self.record(RuntimeCommand::List);
        Self::pause(delay).await;

        let state = self.lock();
        Ok(state
            .containers
            .iter()
            .filter(|(_, c)| self.layout.is_managed(&c.name))
            .map(|(id, c)| ObservedContainer::new(id.clone(), c.name.clone(), c.state.clone()))
            .collect())
    }

    async fn create(&self, index: usize, endpoint: &str) -> Result<Slot, RuntimeError> {
        let delay = self.record(RuntimeCommand::Create {
            index,
            endpoint: endpoint.to_string(),
        });
        Self::pause(delay).await;

        let slot = Slot::desired(&self.layout, index, endpoint);
        let id = self.next_id();

        let mut state = self.lock();
        if state.fail_create.contains(&index) {
            return Err(RuntimeError::Creation {
                index,
                message: "[MOCK] create configured to fail".to_string(),
            });
        }
        if state.containers.values().any(|c| c.name == slot.name) {
            return Err(RuntimeError::Creation {
                index,
                message: format!("container name {} is already in use", slot.name),
            });
        }
        if state.containers.values().any(|c| c.port == slot.port) {
            return Err(RuntimeError::Creation {
                index,
                message: format!("port {} is already allocated", slot.port),
            });
        }

        state.containers.insert(
            id.clone(),
            MockContainer {
                name: slot.name.clone(),
                port: slot.port,
                endpoint: slot.endpoint.clone(),
                state: ContainerState::Running,
            },
        );

        info!(name = %slot.name, container_id = %id, "[MOCK] Container started");
        Ok(slot.realized(id))
    }

    async fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let delay = self.record(RuntimeCommand::Start(id.to_string()));
        Self::pause(delay).await;
        self.check_injected(id, "start")?;

        let mut state = self.lock();
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.state = ContainerState::Running;
        debug!(container_id = id, "[MOCK] Container running");
        Ok(())
    }

    async fn stop(&self, id: &str) -> Result<(), RuntimeError> {
        let delay = self.record(RuntimeCommand::Stop(id.to_string()));
        Self::pause(delay).await;
        self.check_injected(id, "stop")?;

        if let Some(container) = self.lock().containers.get_mut(id) {
            container.state = ContainerState::Exited;
        }
        debug!(container_id = id, "[MOCK] Container stopped");
        Ok(())
    }

    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError> {
        let delay = self.record(RuntimeCommand::Remove {
            id: id.to_string(),
            force,
        });
        Self::pause(delay).await;
        self.check_injected(id, "remove")?;

        let mut state = self.lock();
        if let Some(container) = state.containers.get(id) {
            if container.state.is_live() && !force {
                return Err(RuntimeError::Api {
                    status: 409,
                    message: format!("cannot remove running container {id}"),
                });
            }
            state.containers.remove(id);
        }
        debug!(container_id = id, "[MOCK] Container removed");
        Ok(())
    }
}
