//! Persistence layer for the worker pool
//!
//! This module provides:
//! - [`LeaseStore`] trait for worker record persistence
//! - [`ChangeStream`] trait for the record mutation feed
//! - [`InMemoryLeaseStore`] for testing and dev mode
//! - [`PostgresLeaseStore`] for production

mod memory;
mod postgres;
mod store;

pub use memory::InMemoryLeaseStore;
pub use postgres::{PostgresChangeFeedConfig, PostgresLeaseStore};
pub use store::{ChangeStream, LeaseStore, RecordChange, StoreError};
