//! ResourceClient trait for mocking
//!
//! This trait abstracts typed access to one kind of a declarative store.
//! [`crate::KubeClient`] implements it against the API server, tests use
//! the in-memory mock.

use kube::Resource;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::fmt::Debug;

use crate::error::{ClientError, OptionalExt};
use crate::selector::ListSelector;

/// Bounds shared by every object a [`ResourceClient`] handles.
pub trait ResourceObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> ResourceObject for K where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Typed operations on one kind.
///
/// `namespace` is `None` for cluster-scoped kinds and, on `list`, to list
/// across all namespaces. All methods must be `Send` to work with Tokio's
/// work-stealing runtime.
#[async_trait::async_trait]
pub trait ResourceClient<K: ResourceObject>: Send + Sync {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K, ClientError>;

    async fn list(&self, namespace: Option<&str>, selector: &ListSelector) -> Result<Vec<K>, ClientError>;

    async fn create(&self, namespace: Option<&str>, obj: &K) -> Result<K, ClientError>;

    /// Replaces the object; fails with `Conflict` when
    /// `metadata.resourceVersion` is stale.
    async fn replace(&self, namespace: Option<&str>, name: &str, obj: &K) -> Result<K, ClientError>;

    /// JSON merge patch. A `metadata.resourceVersion` in the patch is a
    /// precondition.
    async fn patch(&self, namespace: Option<&str>, name: &str, patch: &Value) -> Result<K, ClientError>;

    /// JSON merge patch of the status subresource.
    async fn patch_status(&self, namespace: Option<&str>, name: &str, patch: &Value) -> Result<K, ClientError>;

    /// Server-side apply with force, owned by `field_manager`.
    async fn apply(
        &self,
        namespace: Option<&str>,
        name: &str,
        obj: &Value,
        field_manager: &str,
    ) -> Result<K, ClientError>;

    /// Deletes the object. Objects with finalizers get a deletion
    /// timestamp and stay until the finalizers are removed.
    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), ClientError>;

    /// `get` mapping `NotFound` to `None`.
    async fn get_opt(&self, namespace: Option<&str>, name: &str) -> Result<Option<K>, ClientError> {
        self.get(namespace, name).await.optional()
    }
}
