//! Application state shared across request handlers.

use std::sync::Arc;

use crate::directory::Directory;
use crate::orchestrator::PoolOrchestrator;

/// Shared application state.
///
/// This is passed to all request handlers via Axum's state extractor.
/// Handlers only read orchestrator snapshots; they never take the cycle
/// guard or issue runtime commands.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    orchestrator: Arc<PoolOrchestrator>,
    directory: Arc<dyn Directory>,
}

impl AppState {
    /// Create a new application state.
    pub fn new(orchestrator: Arc<PoolOrchestrator>, directory: Arc<dyn Directory>) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                orchestrator,
                directory,
            }),
        }
    }

    /// Get a reference to the orchestrator.
    pub fn orchestrator(&self) -> &PoolOrchestrator {
        &self.inner.orchestrator
    }

    /// Get a reference to the directory client.
    pub fn directory(&self) -> &dyn Directory {
        self.inner.directory.as_ref()
    }
}
