//! Security identity allocation.
//!
//! `secid` assigns small numeric identities to security label sets so that
//! enforcement points can refer to a principal by number instead of carrying
//! its labels around. Label sets are resolved in one of three ways:
//!
//! - **Reserved / well-known**: fixed identities that need no coordination.
//! - **Local**: identities that only have meaning on this node, handed out by
//!   a [`LocalIdentityCache`].
//! - **Global**: cluster-wide identities coordinated through a [`Backend`],
//!   reference counted per process and kept alive in the background.
//!
//! The [`IdentityAllocator`] ties these together behind one allocate/release
//! API with an explicit init/close lifecycle.

mod allocator;
mod backend;
mod error;
mod identity;
mod labels;
mod local;
mod task;

pub use crate::allocator::*;
pub use crate::backend::*;
pub use crate::error::*;
pub use crate::identity::*;
pub use crate::labels::*;
pub use crate::local::*;
pub use crate::task::*;
