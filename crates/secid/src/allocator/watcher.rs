use super::owner::{AllocatorOwner, IdentityChanges};
use crate::EventReceiver;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const POLICY_UPDATE_REASON: &str = "one or more identities created or deleted";

/// Drains allocator events and reports them to the owner in batches.
///
/// Started before the backend is constructed, so events emitted while the
/// backend populates its initial view are never dropped.
pub(crate) struct IdentityWatcher {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl IdentityWatcher {
    pub(crate) fn start(owner: Arc<dyn AllocatorOwner>, events: EventReceiver) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watch_events(owner, events, cancel.clone()));
        Self { cancel, handle }
    }

    pub(crate) async fn stop(self) {
        self.cancel.cancel();
        if let Err(err) = self.handle.await {
            tracing::error!(%err, "Identity watcher terminated abnormally");
        }
    }
}

async fn watch_events(
    owner: Arc<dyn AllocatorOwner>,
    mut events: EventReceiver,
    cancel: CancellationToken,
) {
    tracing::debug!("Identity watcher started");

    'batches: loop {
        let mut changes = IdentityChanges::default();

        // Block until the first event that changes something.
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => break 'batches,
                event = events.recv() => match event {
                    Some(event) => {
                        if changes.collect(event) {
                            break;
                        }
                    }
                    None => break 'batches,
                },
            }
        }

        // Then take whatever else is already queued.
        while let Ok(event) = events.try_recv() {
            changes.collect(event);
        }

        tracing::debug!(
            added = changes.added.len(),
            deleted = changes.deleted.len(),
            "Identities changed"
        );
        owner.update_identities(&changes);
        owner.trigger_policy_updates(true, POLICY_UPDATE_REASON);
    }

    tracing::debug!("Identity watcher stopped");
}
