use crate::Labels;

/// Source of labels with no explicit origin.
pub const SOURCE_UNSPEC: &str = "unspec";

/// Source of labels that name reserved identities (`reserved:host`, ...).
pub const SOURCE_RESERVED: &str = "reserved";

/// Source of labels derived from CIDR prefixes.
pub const SOURCE_CIDR: &str = "cidr";

/// Source of labels attached by the Kubernetes integration.
pub const SOURCE_K8S: &str = "k8s";

/// Returns `true` if the labels must be resolved to a cluster-wide identity.
///
/// Only sets made up exclusively of `cidr` and `reserved` labels have
/// node-local meaning; any other source makes the set global. An empty set is
/// global.
pub fn requires_global_identity(labels: &Labels) -> bool {
    if labels.is_empty() {
        return true;
    }
    labels
        .iter()
        .any(|label| !matches!(label.source(), SOURCE_CIDR | SOURCE_RESERVED))
}
