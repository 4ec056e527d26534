//! In-process allocation backend.
//!
//! A [`MemoryStore`] plays the role of a cluster's shared key-value store: it
//! holds one master key per label set and the set of nodes currently holding
//! it. Every node gets its own [`MemoryBackend`] over the same store. Remote
//! clusters are simply other stores, mirrored with
//! [`Backend::watch_remote`](crate::Backend::watch_remote).

mod backend;
mod remote;
mod store;
mod sync;

pub use backend::*;
pub use remote::*;
pub use store::*;
