use crate::{
    DEFAULT_EVENT_BUFFER, Error, MAX_ALLOCATION_IDENTITY, MAX_CLUSTER_ID, MAX_LOCAL_IDENTITY,
    MIN_ALLOCATION_IDENTITY, NumericIdentity, Result,
};
use core::time::Duration;

/// Key space prefix under which global identities are stored.
pub const IDENTITIES_PATH: &str = "secid/state/identities/v1";

/// How long a keep-alive task sleeps between two re-assertions of an
/// identity.
pub const DEFAULT_KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// Scheduler interval of keep-alive tasks. The task body paces itself with
/// [`AllocatorConfig::keep_alive_interval`], so the scheduler restarts it
/// right away.
pub const KEEP_ALIVE_RUN_INTERVAL: Duration = Duration::from_millis(1);

/// Runtime configuration of an [`IdentityAllocator`].
///
/// [`IdentityAllocator`]: crate::IdentityAllocator
#[derive(Clone, Debug)]
pub struct AllocatorConfig {
    /// Smallest global identity within this cluster.
    pub min_id: u32,
    /// Largest global identity within this cluster.
    pub max_id: u32,
    /// Cluster ID encoded into the upper bits of every global identity.
    pub cluster_id: u32,
    /// Cluster name used to build well-known identities.
    pub cluster_name: String,
    /// Sleep between two keep-alive re-assertions of a held identity.
    pub keep_alive_interval: Duration,
    /// Capacity of the allocator event channel.
    pub event_buffer: usize,
    /// Smallest local identity (before the local flag).
    pub local_min_id: u32,
    /// Largest local identity (before the local flag).
    pub local_max_id: u32,
    /// Let the backend recreate master keys that vanished while still held.
    pub master_key_protection: bool,
    /// Key space prefix for global identities.
    pub base_path: String,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            min_id: MIN_ALLOCATION_IDENTITY,
            max_id: MAX_ALLOCATION_IDENTITY,
            cluster_id: 0,
            cluster_name: "default".to_string(),
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL,
            event_buffer: DEFAULT_EVENT_BUFFER,
            local_min_id: 1,
            local_max_id: MAX_LOCAL_IDENTITY,
            master_key_protection: true,
            base_path: IDENTITIES_PATH.to_string(),
        }
    }
}

impl AllocatorConfig {
    /// Checks the configuration for values the allocator cannot work with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidConfig`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Err(Error::InvalidConfig { reason });

        if self.cluster_id > MAX_CLUSTER_ID {
            return invalid(format!(
                "cluster ID {} exceeds the maximum of {MAX_CLUSTER_ID}",
                self.cluster_id
            ));
        }
        if self.min_id < MIN_ALLOCATION_IDENTITY || self.min_id > self.max_id {
            return invalid(format!(
                "identity range [{}, {}] is empty or overlaps the reserved identities",
                self.min_id, self.max_id
            ));
        }
        if self.max_id > MAX_ALLOCATION_IDENTITY {
            return invalid(format!(
                "maximum identity {} exceeds the per-cluster space ({MAX_ALLOCATION_IDENTITY})",
                self.max_id
            ));
        }
        if self.local_min_id == 0 || self.local_min_id > self.local_max_id {
            return invalid(format!(
                "local identity range [{}, {}] is empty or starts at zero",
                self.local_min_id, self.local_max_id
            ));
        }
        if self.local_max_id > MAX_LOCAL_IDENTITY {
            return invalid(format!(
                "maximum local identity {} exceeds {MAX_LOCAL_IDENTITY}",
                self.local_max_id
            ));
        }
        if self.event_buffer == 0 {
            return invalid("event buffer must be greater than 0".to_string());
        }
        if self.keep_alive_interval.is_zero() {
            return invalid("keep-alive interval must be greater than 0".to_string());
        }
        if self.base_path.is_empty() {
            return invalid("base path must not be empty".to_string());
        }
        Ok(())
    }

    /// Bits OR-ed into every global identity of this cluster.
    pub const fn prefix_mask(&self) -> u32 {
        NumericIdentity::cluster_prefix(self.cluster_id)
    }
}
