use core::fmt;

/// Number of bits a cluster ID is shifted by inside a global identity.
///
/// The lower [`CLUSTER_ID_SHIFT`] bits hold the per-cluster identity, the next
/// 8 bits hold the cluster ID.
pub const CLUSTER_ID_SHIFT: u32 = 16;

/// Largest cluster ID that fits in a global identity.
pub const MAX_CLUSTER_ID: u32 = 255;

/// First identity handed out by the distributed backend. Everything below is
/// reserved or well-known.
pub const MIN_ALLOCATION_IDENTITY: u32 = 256;

/// Last identity handed out by the distributed backend within one cluster.
pub const MAX_ALLOCATION_IDENTITY: u32 = (1 << CLUSTER_ID_SHIFT) - 1;

/// Bit set on every identity allocated by the local identity cache.
pub const LOCAL_IDENTITY_FLAG: u32 = 1 << 24;

/// Largest value (before the local flag is applied) of a local identity.
pub const MAX_LOCAL_IDENTITY: u32 = LOCAL_IDENTITY_FLAG - 1;

/// The numeric value of a security identity.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct NumericIdentity(u32);

impl NumericIdentity {
    /// The identity of an unknown peer.
    pub const UNKNOWN: Self = Self(0);

    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// Returns `true` if the identity was allocated by a local identity cache.
    pub const fn is_local(self) -> bool {
        self.0 & LOCAL_IDENTITY_FLAG != 0
    }

    /// Returns `true` for reserved and well-known identities, which are never
    /// handed out by a backend or a local cache.
    pub const fn is_reserved(self) -> bool {
        self.0 < MIN_ALLOCATION_IDENTITY
    }

    /// Extracts the cluster ID encoded in a global identity.
    pub const fn cluster_id(self) -> u32 {
        if self.is_local() {
            return 0;
        }
        (self.0 >> CLUSTER_ID_SHIFT) & MAX_CLUSTER_ID
    }

    /// Returns the cluster prefix mask applied to identities of `cluster_id`.
    pub const fn cluster_prefix(cluster_id: u32) -> u32 {
        cluster_id << CLUSTER_ID_SHIFT
    }
}

impl From<u32> for NumericIdentity {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl From<NumericIdentity> for u32 {
    fn from(id: NumericIdentity) -> Self {
        id.0
    }
}

impl fmt::Display for NumericIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
