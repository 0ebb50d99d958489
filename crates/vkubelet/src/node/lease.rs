//! The `coordination.k8s.io/v1` Lease a node renews to report liveness.
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta, OwnerReference};

/// Node leases always live in this namespace.
pub const LEASE_NAMESPACE: &str = "kube-node-lease";

/// Define a new coordination.Lease object for Kubernetes
///
/// The lease is named after the node and owned by it, so it goes away with
/// the node.
pub fn lease_definition(
    node_uid: &str,
    node_name: &str,
    duration: Duration,
    now: DateTime<Utc>,
) -> Lease {
    Lease {
        metadata: ObjectMeta {
            name: Some(node_name.to_owned()),
            namespace: Some(LEASE_NAMESPACE.to_owned()),
            owner_references: Some(vec![OwnerReference {
                api_version: "v1".to_owned(),
                kind: "Node".to_owned(),
                name: node_name.to_owned(),
                uid: node_uid.to_owned(),
                ..Default::default()
            }]),
            ..Default::default()
        },
        spec: Some(lease_spec(node_name, duration, now, true)),
    }
}

/// Defines the lease spec for an acquisition or a renewal.
///
/// Renewals leave the acquire time untouched.
pub fn lease_spec(
    node_name: &str,
    duration: Duration,
    now: DateTime<Utc>,
    acquire: bool,
) -> LeaseSpec {
    LeaseSpec {
        holder_identity: Some(node_name.to_owned()),
        acquire_time: if acquire { Some(MicroTime(now)) } else { None },
        renew_time: Some(MicroTime(now)),
        lease_duration_seconds: Some(duration.as_secs() as i32),
        ..Default::default()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lease_is_owned_by_the_node() {
        let now = Utc::now();
        let lease = lease_definition("uid-1", "vk", Duration::from_secs(40), now);
        assert_eq!(lease.metadata.name.as_deref(), Some("vk"));
        assert_eq!(lease.metadata.namespace.as_deref(), Some(LEASE_NAMESPACE));
        let owner = &lease.metadata.owner_references.unwrap()[0];
        assert_eq!(owner.kind, "Node");
        assert_eq!(owner.uid, "uid-1");

        let spec = lease.spec.unwrap();
        assert_eq!(spec.holder_identity.as_deref(), Some("vk"));
        assert_eq!(spec.lease_duration_seconds, Some(40));
        assert_eq!(spec.renew_time, Some(MicroTime(now)));
        assert_eq!(spec.acquire_time, Some(MicroTime(now)));
    }

    #[test]
    fn renewals_keep_acquire_time() {
        let spec = lease_spec("vk", Duration::from_secs(40), Utc::now(), false);
        assert!(spec.acquire_time.is_none());
        assert!(spec.renew_time.is_some());
    }
}
