//! Container runtime interface.
//!
//! The runtime interface is a thin command layer over the container engine:
//! list the managed containers, create a slot's container, and start, stop
//! or remove by id. The orchestrator owns every decision; implementations
//! only translate commands.
//!
//! Two implementations are provided:
//! - `DockerRuntime`: Docker Engine API over its unix socket
//! - `MockRuntime`: in-memory runtime for tests and development

pub mod docker;
pub mod mock;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use vpnpool_reconcile::{ObservedContainer, Slot};

pub use docker::DockerRuntime;
pub use mock::{MockRuntime, RuntimeCommand};

/// Errors from runtime commands.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The runtime rejected a slot's container (port conflict, missing
    /// image, resource limits).
    #[error("failed to create container for slot {index}: {message}")]
    Creation { index: usize, message: String },

    #[error("runtime API error {status}: {message}")]
    Api { status: u16, message: String },

    #[error("no such container: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The call did not complete within the configured bound.
    #[error("{op} timed out after {elapsed:?}")]
    Timeout { op: &'static str, elapsed: Duration },
}

impl From<hyper::http::Error> for RuntimeError {
    fn from(err: hyper::http::Error) -> Self {
        RuntimeError::Api {
            status: 0,
            message: err.to_string(),
        }
    }
}

/// Container runtime interface.
///
/// `start`, `stop` and `remove` are idempotent: targeting a container that
/// is already in the requested state succeeds.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Every container whose name matches the pool prefix, in any state.
    async fn list_managed(&self) -> Result<Vec<ObservedContainer>, RuntimeError>;

    /// Create and start the container for slot `index`, bound to `endpoint`.
    async fn create(&self, index: usize, endpoint: &str) -> Result<Slot, RuntimeError>;

    /// Start a container.
    async fn start(&self, id: &str) -> Result<(), RuntimeError>;

    /// Stop a container.
    async fn stop(&self, id: &str) -> Result<(), RuntimeError>;

    /// Remove a container.
    async fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    /// Number of managed containers currently running.
    async fn count_managed(&self) -> Result<usize, RuntimeError> {
        let containers = self.list_managed().await?;
        Ok(containers.iter().filter(|c| c.state.is_running()).count())
    }
}
