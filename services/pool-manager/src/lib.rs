//! VPN proxy pool manager library.
//!
//! This crate primarily ships a `pool-manager` binary, but we expose a small
//! library surface to enable integration testing and reuse.

pub mod api;
pub mod config;
pub mod directory;
pub mod orchestrator;
pub mod runtime;
pub mod scheduler;
pub mod state;
