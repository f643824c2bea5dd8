//! Claim management
//!
//! A [`ClaimManager`] reconciles which objects of a kind belong to a
//! claimer. Objects matching the claimer's selector are adopted, objects
//! the claimer holds that no longer match are released, and objects held
//! by someone else are left alone. How a claim is recorded on an object is
//! up to the [`ClaimStrategy`]:
//!
//! - [`SourceLabelStrategy`]: a label set whose uid label names the claimer
//! - [`TargetRefStrategy`]: a controller owner reference
//!
//! Every write carries the resource version the decision was based on, so
//! a concurrent claimer makes the write fail with `Conflict` instead of
//! being overwritten.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use tracing::{debug, info};

use crate::error::ClientError;
use crate::resource_trait::{ResourceClient, ResourceObject};

/// Who holds an object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimState {
    Unclaimed,
    Ours,
    Theirs,
}

/// Reads and writes the claim recorded on an object.
#[async_trait::async_trait]
pub trait ClaimStrategy<K: ResourceObject>: Send + Sync {
    fn claim_state(&self, obj: &K) -> ClaimState;

    /// Records the claim. Must fail with `Conflict` if `obj` is stale.
    async fn adopt(&self, client: &dyn ResourceClient<K>, obj: &K) -> Result<K, ClientError>;

    /// Removes the claim. Must fail with `Conflict` if `obj` is stale.
    async fn release(&self, client: &dyn ResourceClient<K>, obj: &K) -> Result<K, ClientError>;
}

type Selector<'a, K> = Box<dyn Fn(&K) -> bool + Send + Sync + 'a>;

/// Adopts and releases objects on behalf of one claimer.
pub struct ClaimManager<'a, K: ResourceObject, S> {
    client: &'a dyn ResourceClient<K>,
    strategy: S,
    selector: Selector<'a, K>,
}

impl<K: ResourceObject, S> std::fmt::Debug for ClaimManager<'_, K, S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClaimManager")
            .field("kind", &K::kind(&()))
            .finish_non_exhaustive()
    }
}

impl<'a, K: ResourceObject, S: ClaimStrategy<K>> ClaimManager<'a, K, S> {
    pub fn new(client: &'a dyn ResourceClient<K>, strategy: S, selector: impl Fn(&K) -> bool + Send + Sync + 'a) -> Self {
        Self {
            client,
            strategy,
            selector: Box::new(selector),
        }
    }

    pub fn strategy(&self) -> &S {
        &self.strategy
    }

    /// Converges the claims on `objects` and returns the objects held
    /// afterwards, updated to the versions written.
    ///
    /// Objects being deleted are never adopted. Objects that vanish while
    /// being adopted or released are skipped.
    pub async fn claim(&self, objects: Vec<K>) -> Result<Vec<K>, ClientError> {
        let mut claimed = Vec::new();
        for obj in objects {
            let deleting = obj.meta().deletion_timestamp.is_some();
            let selected = (self.selector)(&obj);
            match (self.strategy.claim_state(&obj), selected) {
                (ClaimState::Ours, true) => claimed.push(obj),
                (ClaimState::Ours, false) => {
                    match self.strategy.release(self.client, &obj).await {
                        Ok(_) => debug!(kind = %K::kind(&()), name = ?obj.meta().name, "Released claim"),
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
                (ClaimState::Unclaimed, true) if !deleting => {
                    match self.strategy.adopt(self.client, &obj).await {
                        Ok(adopted) => {
                            info!(kind = %K::kind(&()), name = ?adopted.meta().name, "Adopted object");
                            claimed.push(adopted);
                        }
                        Err(e) if e.is_not_found() => {}
                        Err(e) => return Err(e),
                    }
                }
                _ => {}
            }
        }
        Ok(claimed)
    }
}

fn name_of<K: ResourceObject>(obj: &K) -> Result<&str, ClientError> {
    obj.meta()
        .name
        .as_deref()
        .ok_or_else(|| ClientError::Invalid(format!("{} without a name", K::kind(&()))))
}

/// Claim recorded as a label set, e.g. the source triple of a translated
/// record. The value of `uid_key` identifies the claimer.
#[derive(Debug, Clone)]
pub struct SourceLabelStrategy {
    labels: BTreeMap<String, String>,
    uid_key: String,
}

impl SourceLabelStrategy {
    /// `labels` must contain `uid_key`.
    pub fn new(labels: BTreeMap<String, String>, uid_key: impl Into<String>) -> Self {
        Self {
            labels,
            uid_key: uid_key.into(),
        }
    }

    fn uid(&self) -> Option<&String> {
        self.labels.get(&self.uid_key)
    }
}

#[async_trait::async_trait]
impl<K: ResourceObject> ClaimStrategy<K> for SourceLabelStrategy {
    fn claim_state(&self, obj: &K) -> ClaimState {
        match obj.meta().labels.as_ref().and_then(|l| l.get(&self.uid_key)) {
            None => ClaimState::Unclaimed,
            Some(uid) if Some(uid) == self.uid() => ClaimState::Ours,
            Some(_) => ClaimState::Theirs,
        }
    }

    async fn adopt(&self, client: &dyn ResourceClient<K>, obj: &K) -> Result<K, ClientError> {
        let patch = json!({
            "metadata": {
                "resourceVersion": obj.meta().resource_version,
                "labels": self.labels,
            }
        });
        client.patch(obj.meta().namespace.as_deref(), name_of(obj)?, &patch).await
    }

    async fn release(&self, client: &dyn ResourceClient<K>, obj: &K) -> Result<K, ClientError> {
        let labels: Map<String, Value> = self.labels.keys().map(|k| (k.clone(), Value::Null)).collect();
        let patch = json!({
            "metadata": {
                "resourceVersion": obj.meta().resource_version,
                "labels": labels,
            }
        });
        client.patch(obj.meta().namespace.as_deref(), name_of(obj)?, &patch).await
    }
}

/// Claim recorded as the controller owner reference.
#[derive(Debug, Clone)]
pub struct TargetRefStrategy {
    owner: OwnerReference,
}

impl TargetRefStrategy {
    pub fn new(owner: OwnerReference) -> Self {
        Self {
            owner: OwnerReference {
                controller: Some(true),
                ..owner
            },
        }
    }
}

fn controller_ref<K: ResourceObject>(obj: &K) -> Option<&OwnerReference> {
    obj.meta()
        .owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

#[async_trait::async_trait]
impl<K: ResourceObject> ClaimStrategy<K> for TargetRefStrategy {
    fn claim_state(&self, obj: &K) -> ClaimState {
        match controller_ref(obj) {
            None => ClaimState::Unclaimed,
            Some(r) if r.uid == self.owner.uid => ClaimState::Ours,
            Some(_) => ClaimState::Theirs,
        }
    }

    async fn adopt(&self, client: &dyn ResourceClient<K>, obj: &K) -> Result<K, ClientError> {
        let mut refs = obj.meta().owner_references.clone().unwrap_or_default();
        refs.push(self.owner.clone());
        let patch = json!({
            "metadata": {
                "resourceVersion": obj.meta().resource_version,
                "ownerReferences": refs,
            }
        });
        client.patch(obj.meta().namespace.as_deref(), name_of(obj)?, &patch).await
    }

    async fn release(&self, client: &dyn ResourceClient<K>, obj: &K) -> Result<K, ClientError> {
        let refs: Vec<_> = obj
            .meta()
            .owner_references
            .iter()
            .flatten()
            .filter(|r| r.uid != self.owner.uid)
            .cloned()
            .collect();
        let patch = json!({
            "metadata": {
                "resourceVersion": obj.meta().resource_version,
                "ownerReferences": refs,
            }
        });
        client.patch(obj.meta().namespace.as_deref(), name_of(obj)?, &patch).await
    }
}
