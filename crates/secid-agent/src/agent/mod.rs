//! Node agent components.
//!
//! - [`config`] - CLI and environment configuration.
//! - [`owner`] - the allocator owner that reacts to identity changes.
//! - [`telemetry`] - structured logging setup.

pub mod config;
pub mod owner;
pub mod telemetry;
