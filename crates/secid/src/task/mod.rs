//! Named background tasks.
//!
//! This module provides [`TaskManager`], a registry of periodic tasks that can
//! be created, updated and removed by name from any number of callers.
//! Removal is synchronous: `remove_and_wait` returns only after the task has
//! observed its cancellation and stopped.

mod manager;

pub use manager::*;
