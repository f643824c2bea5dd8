//! Kubernetes-backed ResourceClient

use k8s_openapi::{ClusterResourceScope, NamespaceResourceScope};
use kube::Client;
use kube::Resource;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use serde_json::Value;
use std::fmt;
use tracing::debug;

use crate::error::ClientError;
use crate::resource_trait::{ResourceClient, ResourceObject};
use crate::selector::ListSelector;

/// [`ResourceClient`] over `kube::Api`.
pub struct KubeClient<K> {
    client: Client,
    api_for: fn(Client, Option<&str>) -> Api<K>,
}

impl<K> KubeClient<K>
where
    K: ResourceObject + Resource<Scope = NamespaceResourceScope>,
{
    /// Client for a namespaced kind. A `None` namespace addresses all
    /// namespaces.
    pub fn namespaced(client: Client) -> Self {
        Self {
            client,
            api_for: |client, namespace| match namespace {
                Some(ns) => Api::namespaced(client, ns),
                None => Api::all(client),
            },
        }
    }
}

impl<K> KubeClient<K>
where
    K: ResourceObject + Resource<Scope = ClusterResourceScope>,
{
    /// Client for a cluster-scoped kind. Namespaces are ignored.
    pub fn cluster(client: Client) -> Self {
        Self {
            client,
            api_for: |client, _| Api::all(client),
        }
    }
}

impl<K> KubeClient<K> {
    fn api(&self, namespace: Option<&str>) -> Api<K> {
        (self.api_for)(self.client.clone(), namespace)
    }
}

impl<K> Clone for KubeClient<K> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            api_for: self.api_for,
        }
    }
}

impl<K> fmt::Debug for KubeClient<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KubeClient")
            .field("kind", &std::any::type_name::<K>())
            .finish_non_exhaustive()
    }
}

#[async_trait::async_trait]
impl<K: ResourceObject> ResourceClient<K> for KubeClient<K> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K, ClientError> {
        Ok(self.api(namespace).get(name).await?)
    }

    async fn list(&self, namespace: Option<&str>, selector: &ListSelector) -> Result<Vec<K>, ClientError> {
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector.to_query());
        }
        let list = self.api(namespace).list(&params).await?;
        debug!(kind = %K::kind(&()), count = list.items.len(), "Listed objects");
        Ok(list.items)
    }

    async fn create(&self, namespace: Option<&str>, obj: &K) -> Result<K, ClientError> {
        Ok(self.api(namespace).create(&PostParams::default(), obj).await?)
    }

    async fn replace(&self, namespace: Option<&str>, name: &str, obj: &K) -> Result<K, ClientError> {
        Ok(self
            .api(namespace)
            .replace(name, &PostParams::default(), obj)
            .await?)
    }

    async fn patch(&self, namespace: Option<&str>, name: &str, patch: &Value) -> Result<K, ClientError> {
        Ok(self
            .api(namespace)
            .patch(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn patch_status(&self, namespace: Option<&str>, name: &str, patch: &Value) -> Result<K, ClientError> {
        Ok(self
            .api(namespace)
            .patch_status(name, &PatchParams::default(), &Patch::Merge(patch))
            .await?)
    }

    async fn apply(
        &self,
        namespace: Option<&str>,
        name: &str,
        obj: &Value,
        field_manager: &str,
    ) -> Result<K, ClientError> {
        Ok(self
            .api(namespace)
            .patch(name, &PatchParams::apply(field_manager).force(), &Patch::Apply(obj))
            .await?)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), ClientError> {
        self.api(namespace).delete(name, &DeleteParams::default()).await?;
        Ok(())
    }
}
