//! Distributed allocation backends.
//!
//! A [`Backend`] hands out cluster-wide unique numeric identities for
//! canonical label keys. The allocator never constructs one directly; it asks
//! a [`BackendFactory`] during `init`, after event delivery is armed.
//!
//! ## Structure
//!
//! - `interface` - the `Backend` / `BackendFactory` traits and their config.
//! - `event` - allocation events streamed to the identity watcher.
//! - `view` - the synced id/key view a backend keeps per key space.
//! - `memory` - an in-process backend over a shared [`MemoryStore`].

mod event;
mod interface;
mod memory;
mod view;

pub use event::*;
pub use interface::*;
pub use memory::*;
pub use view::*;
