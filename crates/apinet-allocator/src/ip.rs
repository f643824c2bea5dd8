//! Per-namespace IP allocator
//!
//! Hands out namespaced `IP` records to claimers. An IP is either
//! ephemeral (created for and controlled by the claimer, deleted on
//! release) or standalone (reserved by setting its claim reference under
//! optimistic concurrency, unclaimed on release).

use apinet_api::internal::{IP, IPClaimRef, IPSpec, IPType};
use apinet_api::labels::{IP_FAMILY_LABEL, IP_LABEL, dashed_ip};
use apinet_api::{ClaimRef, IPFamily};
use apinet_client::error::ignore_not_found;
use apinet_client::{ListSelector, ResourceClient, ResourceObject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::Resource;
use kube::api::ObjectMeta;
use serde_json::json;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::AllocationError;
use crate::retry::{RetryConfig, retry_with_backoff};

/// Identity of an object holding IPs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IPClaimer {
    pub api_version: String,
    pub kind: String,
    pub group: String,
    pub resource: String,
    pub namespace: String,
    pub name: String,
    pub uid: String,
}

impl IPClaimer {
    /// Claimer identity of a namespaced object. Returns `None` for objects
    /// that have not been persisted yet.
    pub fn from_object<K: ResourceObject>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        Some(Self {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
            group: K::group(&()).into_owned(),
            resource: K::plural(&()).into_owned(),
            namespace: meta.namespace.clone()?,
            name: meta.name.clone()?,
            uid: meta.uid.clone()?,
        })
    }

    pub fn ip_claim_ref(&self) -> IPClaimRef {
        IPClaimRef {
            group: self.group.clone(),
            resource: self.resource.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
        }
    }

    /// Controller reference placed on ephemeral IPs.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            api_version: self.api_version.clone(),
            kind: self.kind.clone(),
            name: self.name.clone(),
            uid: self.uid.clone(),
            controller: Some(true),
            block_owner_deletion: Some(true),
        }
    }
}

/// Claim reference an `IPAddress` leaf carries for the IP holding it.
pub fn address_claim_ref(ip: &IP) -> Option<ClaimRef> {
    Some(ClaimRef {
        group: IP::group(&()).into_owned(),
        resource: IP::plural(&()).into_owned(),
        namespace: ip.metadata.namespace.clone(),
        name: ip.metadata.name.clone()?,
        uid: ip.metadata.uid.clone()?,
    })
}

/// Whether `ip` is an ephemeral IP controlled by the object with `uid`.
pub fn is_controlled_by(ip: &IP, uid: &str) -> bool {
    ip.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.controller == Some(true) && r.uid == uid))
}

/// Whether `ip` is controlled by any object.
pub fn is_ephemeral(ip: &IP) -> bool {
    ip.metadata
        .owner_references
        .as_ref()
        .is_some_and(|refs| refs.iter().any(|r| r.controller == Some(true)))
}

/// Index labels of an IP record.
pub fn ip_labels(family: IPFamily, ip: Option<&IpAddr>) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::from([(IP_FAMILY_LABEL.to_string(), family.to_string())]);
    if let Some(ip) = ip {
        labels.insert(IP_LABEL.to_string(), dashed_ip(ip));
    }
    labels
}

/// Allocates namespaced IP records.
#[derive(Clone)]
pub struct IPAllocator {
    client: Arc<dyn ResourceClient<IP>>,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl std::fmt::Debug for IPAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IPAllocator").field("retry", &self.retry).finish_non_exhaustive()
    }
}

impl IPAllocator {
    pub fn new(client: Arc<dyn ResourceClient<IP>>, retry: RetryConfig, cancel: CancellationToken) -> Self {
        Self { client, retry, cancel }
    }

    /// IPs currently held by the claimer.
    pub async fn claimed_by(&self, claimer: &IPClaimer) -> Result<Vec<IP>, AllocationError> {
        Ok(self
            .client
            .list(Some(&claimer.namespace), &ListSelector::new())
            .await?
            .into_iter()
            .filter(|ip| ip.is_claimed_by(&claimer.uid))
            .collect())
    }

    /// Creates an ephemeral IP controlled by the claimer.
    pub async fn create_ephemeral(
        &self,
        claimer: &IPClaimer,
        family: IPFamily,
        address: Option<IpAddr>,
    ) -> Result<IP, AllocationError> {
        let ip = IP {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", claimer.name)),
                namespace: Some(claimer.namespace.clone()),
                labels: Some(ip_labels(family, address.as_ref())),
                owner_references: Some(vec![claimer.owner_reference()]),
                ..Default::default()
            },
            spec: IPSpec {
                type_: IPType::Public,
                ip_family: family,
                ip: address,
                claim_ref: Some(claimer.ip_claim_ref()),
            },
        };
        let created = self.client.create(Some(&claimer.namespace), &ip).await?;
        debug!(
            namespace = %claimer.namespace,
            claimer = %claimer.name,
            ip = ?created.metadata.name,
            "Created ephemeral IP"
        );
        Ok(created)
    }

    /// Records the allocated address on an IP.
    pub async fn set_address(&self, ip: &IP, address: IpAddr) -> Result<IP, AllocationError> {
        let name = ip.metadata.name.as_deref().unwrap_or_default();
        let patch = json!({
            "metadata": { "labels": ip_labels(ip.spec.ip_family, Some(&address)) },
            "spec": { "ip": address },
        });
        Ok(self.client.patch(ip.metadata.namespace.as_deref(), name, &patch).await?)
    }

    /// Reserves the standalone IP `name` for the claimer.
    ///
    /// Fails with `Claimed` if another object holds it. Conflicting writes
    /// are retried with a fresh read.
    pub async fn reserve(&self, claimer: &IPClaimer, name: &str) -> Result<IP, AllocationError> {
        let namespace = claimer.namespace.as_str();
        retry_with_backoff(
            &self.retry,
            "reserve_ip",
            &self.cancel,
            AllocationError::is_conflict,
            || async move {
                let ip = self.client.get(Some(namespace), name).await?;
                match &ip.spec.claim_ref {
                    Some(claim) if claim.uid == claimer.uid => return Ok(ip),
                    Some(claim) => {
                        return Err(AllocationError::Claimed {
                            name: name.to_string(),
                            claimer: format!("{}/{}", claim.resource, claim.name),
                        });
                    }
                    None => {}
                }
                let patch = json!({
                    "metadata": { "resourceVersion": ip.metadata.resource_version },
                    "spec": { "claimRef": claimer.ip_claim_ref() },
                });
                let reserved = self.client.patch(Some(namespace), name, &patch).await?;
                info!(namespace, ip = name, claimer = %claimer.name, "Reserved IP");
                Ok(reserved)
            },
        )
        .await
    }

    /// Releases `ip` from the claimer: ephemeral IPs are deleted, standalone
    /// IPs have their claim reference cleared.
    pub async fn release(&self, claimer: &IPClaimer, ip: &IP) -> Result<(), AllocationError> {
        let namespace = claimer.namespace.as_str();
        let Some(name) = ip.metadata.name.as_deref() else {
            return Ok(());
        };
        if is_controlled_by(ip, &claimer.uid) {
            ignore_not_found(self.client.delete(Some(namespace), name).await)?;
            info!(namespace, ip = name, claimer = %claimer.name, "Deleted ephemeral IP");
            return Ok(());
        }

        retry_with_backoff(
            &self.retry,
            "release_ip",
            &self.cancel,
            AllocationError::is_conflict,
            || async move {
                let Some(current) = self.client.get_opt(Some(namespace), name).await? else {
                    return Ok(());
                };
                if !current.is_claimed_by(&claimer.uid) {
                    return Ok(());
                }
                let patch = json!({
                    "metadata": { "resourceVersion": current.metadata.resource_version },
                    "spec": { "claimRef": null },
                });
                self.client.patch(Some(namespace), name, &patch).await?;
                info!(namespace, ip = name, claimer = %claimer.name, "Unclaimed IP");
                Ok(())
            },
        )
        .await
    }

    /// Deletes an IP outright.
    pub async fn delete(&self, ip: &IP) -> Result<(), AllocationError> {
        let name = ip.metadata.name.as_deref().unwrap_or_default();
        ignore_not_found(self.client.delete(ip.metadata.namespace.as_deref(), name).await)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use apinet_api::internal::LoadBalancer;
    use apinet_client::MockClient;

    fn claimer(name: &str, uid: &str) -> IPClaimer {
        IPClaimer {
            api_version: LoadBalancer::api_version(&()).into_owned(),
            kind: "LoadBalancer".to_string(),
            group: apinet_api::CORE_GROUP.to_string(),
            resource: "loadbalancers".to_string(),
            namespace: "apinet".to_string(),
            name: name.to_string(),
            uid: uid.to_string(),
        }
    }

    fn allocator() -> (IPAllocator, MockClient<IP>) {
        let client = MockClient::<IP>::new();
        let allocator = IPAllocator::new(
            Arc::new(client.clone()),
            RetryConfig::with_max_attempts(3),
            CancellationToken::new(),
        );
        (allocator, client)
    }

    fn standalone(name: &str) -> IP {
        let mut ip = IP::new(
            name,
            IPSpec {
                ip: Some("10.0.0.9".parse().unwrap()),
                ..Default::default()
            },
        );
        ip.metadata.namespace = Some("apinet".to_string());
        ip
    }

    #[test]
    fn test_claimer_from_object() {
        let mut lb = LoadBalancer::new(
            "lb",
            apinet_api::internal::LoadBalancerSpec {
                type_: apinet_api::LoadBalancerType::Public,
                network_ref: apinet_api::LocalObjectReference::new("net"),
                ips: Vec::new(),
                ports: Vec::new(),
                selector: None,
                template: apinet_api::internal::InstanceTemplate::default(),
            },
        );
        assert_eq!(IPClaimer::from_object(&lb), None);

        lb.metadata.namespace = Some("apinet".to_string());
        lb.metadata.uid = Some("uid-lb".to_string());
        let claimer = IPClaimer::from_object(&lb).unwrap();
        assert_eq!(claimer.resource, "loadbalancers");
        assert_eq!(claimer.kind, "LoadBalancer");
        assert_eq!(claimer.group, apinet_api::CORE_GROUP);
    }

    #[tokio::test]
    async fn test_ephemeral_ip_lifecycle() {
        let (allocator, client) = allocator();
        let owner = claimer("lb", "uid-lb");

        let ip = allocator.create_ephemeral(&owner, IPFamily::IPv4, None).await.unwrap();
        assert!(ip.metadata.name.as_deref().unwrap().starts_with("lb-"));
        assert!(is_controlled_by(&ip, "uid-lb"));
        assert!(ip.is_claimed_by("uid-lb"));

        let ip = allocator.set_address(&ip, "10.0.0.4".parse().unwrap()).await.unwrap();
        assert_eq!(ip.spec.ip, Some("10.0.0.4".parse().unwrap()));
        assert_eq!(
            ip.metadata.labels.as_ref().unwrap().get(IP_LABEL).map(String::as_str),
            Some("10-0-0-4")
        );

        assert_eq!(allocator.claimed_by(&owner).await.unwrap().len(), 1);
        allocator.release(&owner, &ip).await.unwrap();
        assert!(client.is_empty());
    }

    #[tokio::test]
    async fn test_reserve_standalone_ip() {
        let (allocator, client) = allocator();
        client.add(standalone("reserved")).unwrap();

        let owner = claimer("lb", "uid-lb");
        let ip = allocator.reserve(&owner, "reserved").await.unwrap();
        assert!(ip.is_claimed_by("uid-lb"));

        // Reserving again is a no-op.
        allocator.reserve(&owner, "reserved").await.unwrap();

        let other = claimer("other", "uid-other");
        assert!(matches!(
            allocator.reserve(&other, "reserved").await,
            Err(AllocationError::Claimed { .. })
        ));

        allocator.release(&owner, &ip).await.unwrap();
        let released = client.object(Some("apinet"), "reserved").unwrap();
        assert_eq!(released.spec.claim_ref, None);
    }

    #[tokio::test]
    async fn test_reserve_retries_on_conflict() {
        let (allocator, client) = allocator();
        client.add(standalone("reserved")).unwrap();

        // The first read succeeds, the first write is rejected.
        client.fail_next(apinet_client::ClientError::Conflict("stale".to_string()));
        let ip = allocator.reserve(&claimer("lb", "uid-lb"), "reserved").await.unwrap();
        assert!(ip.is_claimed_by("uid-lb"));
    }
}
