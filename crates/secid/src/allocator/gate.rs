use crate::{Error, Result};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Whether the allocator has finished constructing its live state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Readiness {
    Unready,
    Ready,
}

/// A resettable broadcast gate.
///
/// Transitions happen only under the allocator's lifecycle lock: `Ready` once
/// per lifetime at the end of `init`, back to `Unready` at the end of `close`.
/// Waiters subscribe to the current state, so a waiter that arrives after a
/// reset waits for the next lifetime instead of passing on a stale signal.
#[derive(Debug)]
pub(crate) struct ReadinessGate {
    state: watch::Sender<Readiness>,
}

impl ReadinessGate {
    pub(crate) fn new() -> Self {
        let (state, _) = watch::channel(Readiness::Unready);
        Self { state }
    }

    pub(crate) fn mark_ready(&self) {
        self.state.send_replace(Readiness::Ready);
    }

    pub(crate) fn reset(&self) {
        self.state.send_replace(Readiness::Unready);
    }

    pub(crate) fn state(&self) -> Readiness {
        *self.state.borrow()
    }

    /// Waits for `Ready`, or fails with [`Error::Cancelled`] once `cancel`
    /// fires.
    pub(crate) async fn wait(&self, cancel: &CancellationToken) -> Result<()> {
        let mut state = self.state.subscribe();
        tokio::select! {
            biased;
            res = state.wait_for(|s| *s == Readiness::Ready) => res.map(|_| ()).map_err(|_| Error::NotInitialized),
            () = cancel.cancelled() => Err(Error::Cancelled { context: "initial identity sync" }),
        }
    }

    /// Waits for `Ready` without a way out.
    pub(crate) async fn wait_ready(&self) {
        let mut state = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = state.wait_for(|s| *s == Readiness::Ready).await;
    }
}
