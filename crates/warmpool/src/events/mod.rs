//! Pool events
//!
//! This module provides:
//! - [`PoolEvent`] the events exchanged between the change observer and the
//!   replenishment trigger
//! - [`EventBus`] trait and the broadcast-backed [`InMemoryEventBus`]
//! - [`ChangeObserver`] which turns store changes into events

mod bus;
mod observer;

pub use bus::{EventBus, EventBusError, InMemoryEventBus, PoolEvent};
pub use observer::ChangeObserver;
