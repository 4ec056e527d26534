use secid::{AllocatorOwner, IdentityChanges};
use std::sync::atomic::{AtomicU64, Ordering};

/// Reacts to identity changes on behalf of the node.
///
/// The agent has no policy engine of its own, so policy triggers are logged
/// and counted.
#[derive(Debug)]
pub struct AgentOwner {
    node_name: String,
    policy_updates: AtomicU64,
}

impl AgentOwner {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
            policy_updates: AtomicU64::new(0),
        }
    }

    pub fn policy_updates(&self) -> u64 {
        self.policy_updates.load(Ordering::Relaxed)
    }
}

impl AllocatorOwner for AgentOwner {
    fn trigger_policy_updates(&self, force: bool, reason: &str) {
        let total = self.policy_updates.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(force, reason, total, "Policy update triggered");
    }

    fn node_suffix(&self) -> String {
        self.node_name.clone()
    }

    fn update_identities(&self, changes: &IdentityChanges) {
        for (id, key) in &changes.added {
            tracing::debug!(%id, %key, "Identity added");
        }
        for id in &changes.deleted {
            tracing::debug!(%id, "Identity deleted");
        }
    }
}
