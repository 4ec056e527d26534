//! Error types for identity allocation.
//!
//! This module defines the central `Error` enum shared by the allocator, its
//! backends and the local identity cache.
//!
//! ## Error Cases
//! - `InvalidState`: The allocator lifecycle was driven out of order (double
//!   init, close without init).
//! - `NotInitialized`: An operation needed the live allocator but there was
//!   none, typically because it raced with `close`.
//! - `Cancelled`: The caller's cancellation token fired while waiting.
//! - `BackendUnavailable` / `Backend`: The distributed backend could not serve
//!   the request.
//! - `IdentitySpaceExhausted`: No free numeric identity was left.
//! - `InvalidLabel`: A label could not be parsed.
//! - `InvalidConfig`: The allocator configuration was rejected.

pub type Result<T> = core::result::Result<T, Error>;

/// Unified error type for identity allocation.
#[derive(Clone, thiserror::Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The allocator lifecycle was used incorrectly. This is a caller bug.
    #[error("invalid allocator state: {reason}")]
    InvalidState { reason: &'static str },

    /// The allocator has no live backend.
    #[error("allocator not initialized")]
    NotInitialized,

    /// The operation was cancelled before it could complete.
    #[error("{context} was cancelled")]
    Cancelled { context: &'static str },

    /// The backend cannot currently be reached.
    #[error("backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    /// The backend rejected the request.
    #[error("backend error: {reason}")]
    Backend { reason: String },

    /// Every numeric identity in the range is taken.
    #[error("out of {scope} identity space")]
    IdentitySpaceExhausted { scope: &'static str },

    /// A label string could not be parsed.
    #[error("invalid label {input:?}: {reason}")]
    InvalidLabel { input: String, reason: &'static str },

    /// The configuration was rejected during validation.
    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Returns `true` if this error only reports a cancellation.
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// Returns `true` if the allocator is gone (shut down or never started).
    pub const fn is_not_initialized(&self) -> bool {
        matches!(self, Self::NotInitialized)
    }
}
