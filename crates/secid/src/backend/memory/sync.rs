use super::store::{MemoryStore, StoreChange};
use crate::{AllocatorEvent, EventSender, IdentityView};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

/// Follows one key space of `store`, keeping `view` in sync and forwarding
/// every change to `events`.
///
/// `changes` must be subscribed before this is spawned so that nothing
/// published between the listing and the subscription is lost. `synced` is
/// set once the initial listing has been applied.
pub(super) async fn follow_key_space(
    store: MemoryStore,
    prefix: String,
    mut changes: broadcast::Receiver<StoreChange>,
    view: Arc<RwLock<IdentityView>>,
    events: EventSender,
    synced: Arc<watch::Sender<bool>>,
    cancel: CancellationToken,
) {
    if list_and_replace(&store, &prefix, &view, &events, &cancel)
        .await
        .is_none()
    {
        return;
    }
    synced.send_replace(true);
    tracing::debug!(prefix = %prefix, entries = view.read().len(), "Initial key space sync complete");

    loop {
        let change = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            change = changes.recv() => change,
        };

        match change {
            Ok(change) if change.prefix == prefix => {
                let changed = view.write().apply(&change.event);
                if changed {
                    forward(&events, change.event, &cancel).await;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(prefix = %prefix, skipped, "Change feed lagged, resyncing key space");
                if list_and_replace(&store, &prefix, &view, &events, &cancel)
                    .await
                    .is_none()
                {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    tracing::trace!(prefix = %prefix, "Stopped following key space");
}

/// Waits for the store, lists `prefix` and replaces the view with the result.
/// Returns `None` if cancelled first.
async fn list_and_replace(
    store: &MemoryStore,
    prefix: &str,
    view: &RwLock<IdentityView>,
    events: &EventSender,
    cancel: &CancellationToken,
) -> Option<()> {
    loop {
        store.wait_available(cancel).await.ok()?;
        match store.snapshot(prefix) {
            Ok(entries) => {
                let diff = view.write().replace(entries);
                for event in diff {
                    forward(events, event, cancel).await;
                }
                return Some(());
            }
            // The store went away between the wait and the listing.
            Err(_) => continue,
        }
    }
}

/// Delivers an event unless the receiver is gone or `cancel` fires while the
/// channel is full.
async fn forward(events: &EventSender, event: AllocatorEvent, cancel: &CancellationToken) {
    tokio::select! {
        biased;
        () = cancel.cancelled() => {}
        res = events.send(event) => {
            if res.is_err() {
                tracing::trace!("Event receiver dropped, discarding event");
            }
        }
    }
}
