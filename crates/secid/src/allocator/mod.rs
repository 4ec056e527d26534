//! The identity allocation orchestrator.
//!
//! [`IdentityAllocator`] resolves label sets to identities. Reserved and
//! well-known labels resolve from a fixed table, node-scoped labels from the
//! local identity cache, and everything else through the distributed backend
//! once the initial sync has completed.
//!
//! ## Structure
//!
//! - `identity_allocator` - lifecycle, allocate/release, lookups.
//! - `config` - [`AllocatorConfig`] and its defaults.
//! - `gate` - the readiness state shared by every allocator lifetime.
//! - `owner` - the [`AllocatorOwner`] callbacks.
//! - `watcher` - forwards allocator events to the owner.
//! - `refcount` - process-local reference counts and keep-alive tasks.

mod config;
mod gate;
mod identity_allocator;
mod owner;
mod refcount;
mod watcher;

#[cfg(test)]
mod tests;

pub use config::*;
pub use gate::Readiness;
pub use identity_allocator::*;
pub use owner::*;
pub use refcount::keep_alive_task_name;
