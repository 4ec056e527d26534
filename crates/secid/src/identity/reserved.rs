//! Reserved and well-known identities.
//!
//! Reserved identities name entities that exist on every node (`host`,
//! `world`, ...) and are selected by a single `reserved:<name>` label.
//! Well-known identities are fixed numbers for system workloads whose full
//! label set is known in advance, so their policy can be enforced before the
//! distributed backend is reachable. Neither kind requires coordination.

use crate::{CanonicalKey, Identity, Label, Labels, NumericIdentity, SOURCE_K8S, SOURCE_RESERVED};
use std::collections::HashMap;

/// Label key carrying the cluster name on Kubernetes workloads.
pub const POLICY_LABEL_CLUSTER: &str = "io.secid.k8s.policy.cluster";

/// Label key carrying the service account on Kubernetes workloads.
pub const POLICY_LABEL_SERVICE_ACCOUNT: &str = "io.secid.k8s.policy.serviceaccount";

/// Label key carrying the namespace on Kubernetes workloads.
pub const POD_NAMESPACE_LABEL: &str = "io.kubernetes.pod.namespace";

/// Reserved identities, by `reserved:` label key.
pub const RESERVED_IDENTITIES: [(&str, u32); 6] = [
    ("host", 1),
    ("world", 2),
    ("unmanaged", 3),
    ("health", 4),
    ("init", 5),
    ("remote-node", 6),
];

pub const IDENTITY_ETCD_OPERATOR: NumericIdentity = NumericIdentity::new(100);
pub const IDENTITY_KVSTORE: NumericIdentity = NumericIdentity::new(101);
pub const IDENTITY_KUBE_DNS: NumericIdentity = NumericIdentity::new(102);
pub const IDENTITY_CORE_DNS: NumericIdentity = NumericIdentity::new(104);
pub const IDENTITY_OPERATOR: NumericIdentity = NumericIdentity::new(105);

/// Lookup table for every identity that is resolved without coordination.
#[derive(Clone, Debug)]
pub struct ReservedIdentities {
    by_name: HashMap<String, Identity>,
    by_key: HashMap<CanonicalKey, Identity>,
    by_id: HashMap<NumericIdentity, Identity>,
}

impl ReservedIdentities {
    /// Builds a table containing only the reserved identities.
    ///
    /// This is what an allocator answers with before it has been initialized.
    pub fn reserved_only() -> Self {
        let mut table = Self {
            by_name: HashMap::new(),
            by_key: HashMap::new(),
            by_id: HashMap::new(),
        };
        for (name, id) in RESERVED_IDENTITIES {
            let labels = Labels::from([Label::new(SOURCE_RESERVED, name, "")]);
            let identity = Identity::new(NumericIdentity::new(id), labels);
            table.by_id.insert(identity.id(), identity.clone());
            table.by_name.insert(name.to_string(), identity);
        }
        table
    }

    /// Builds the reserved table plus the well-known identities of the
    /// workloads running in `cluster_name`.
    pub fn with_well_known(cluster_name: &str) -> Self {
        let mut table = Self::reserved_only();

        let workload = |service_account: &str, extra: &[(&str, &str)]| {
            let mut labels = Labels::from([
                Label::new(SOURCE_K8S, POLICY_LABEL_CLUSTER, cluster_name),
                Label::new(SOURCE_K8S, POLICY_LABEL_SERVICE_ACCOUNT, service_account),
                Label::new(SOURCE_K8S, POD_NAMESPACE_LABEL, "kube-system"),
            ]);
            for (key, value) in extra {
                labels.insert(Label::new(SOURCE_K8S, *key, *value));
            }
            labels
        };

        table.add_well_known(
            IDENTITY_ETCD_OPERATOR,
            workload("secid-etcd-sa", &[("io.secid/app", "etcd-operator")]),
        );
        table.add_well_known(
            IDENTITY_KVSTORE,
            workload(
                "default",
                &[
                    ("app", "etcd"),
                    ("etcd_cluster", "secid-etcd"),
                    ("io.secid/app", "etcd-operator"),
                ],
            ),
        );
        table.add_well_known(
            IDENTITY_KUBE_DNS,
            workload("kube-dns", &[("k8s-app", "kube-dns")]),
        );
        table.add_well_known(
            IDENTITY_CORE_DNS,
            workload("coredns", &[("k8s-app", "kube-dns")]),
        );
        table.add_well_known(
            IDENTITY_OPERATOR,
            workload(
                "secid-operator",
                &[("name", "secid-operator"), ("io.secid/app", "operator")],
            ),
        );

        table
    }

    fn add_well_known(&mut self, id: NumericIdentity, labels: Labels) {
        let identity = Identity::new(id, labels);
        self.by_key
            .insert(identity.labels().canonical_key(), identity.clone());
        self.by_id.insert(id, identity);
    }

    /// Resolves labels to a reserved or well-known identity.
    ///
    /// A set consisting of exactly one `reserved:` label resolves by label key;
    /// any other set must match a well-known label set exactly.
    pub fn lookup_by_labels(&self, labels: &Labels) -> Option<&Identity> {
        if let Some(label) = labels.single() {
            if label.source() == SOURCE_RESERVED {
                return self.by_name.get(label.key());
            }
        }
        if self.by_key.is_empty() {
            return None;
        }
        self.by_key.get(&labels.canonical_key())
    }

    pub fn lookup_by_id(&self, id: NumericIdentity) -> Option<&Identity> {
        self.by_id.get(&id)
    }

    /// Returns the reserved identity named `name` (e.g. `"host"`).
    pub fn reserved(&self, name: &str) -> Option<&Identity> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for ReservedIdentities {
    fn default() -> Self {
        Self::reserved_only()
    }
}
