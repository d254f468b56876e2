//! Container execution service
//!
//! This module provides:
//! - [`ExecutionService`] trait the launcher and drain controller drive
//! - [`HttpExecutionService`] client for the execution REST API
//! - [`InMemoryExecutionService`] scriptable double for tests

mod http;
mod memory;
mod service;

pub use http::HttpExecutionService;
pub use memory::InMemoryExecutionService;
pub use service::{
    ExecutionError, ExecutionService, ExternalHandle, LaunchSpec, TaskDescription, TaskState,
};
