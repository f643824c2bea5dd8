//! Finalizer handling
//!
//! A controller adds its finalizer before performing any effect on behalf
//! of an object, and removes it once everything the object owns has been
//! cleaned up. Both writes are merge patches of `metadata.finalizers`
//! guarded by the object's resource version.

use kube::ResourceExt;
use serde_json::json;
use tracing::info;

use crate::error::ClientError;
use crate::resource_trait::{ResourceClient, ResourceObject};

pub fn has_finalizer<K: ResourceObject>(obj: &K, finalizer: &str) -> bool {
    obj.finalizers().iter().any(|f| f == finalizer)
}

/// Adds `finalizer` if missing and returns the updated object.
pub async fn add_finalizer<K: ResourceObject>(
    client: &dyn ResourceClient<K>,
    obj: &K,
    finalizer: &str,
) -> Result<K, ClientError> {
    if has_finalizer(obj, finalizer) {
        return Ok(obj.clone());
    }
    let mut finalizers = obj.finalizers().to_vec();
    finalizers.push(finalizer.to_string());
    let patch = json!({
        "metadata": {
            "resourceVersion": obj.resource_version(),
            "finalizers": finalizers,
        }
    });
    let updated = client.patch(obj.namespace().as_deref(), &obj.name_any(), &patch).await?;
    info!(kind = %K::kind(&()), name = %obj.name_any(), finalizer, "Added finalizer");
    Ok(updated)
}

/// Removes `finalizer` if present. A vanished object is not an error.
pub async fn remove_finalizer<K: ResourceObject>(
    client: &dyn ResourceClient<K>,
    obj: &K,
    finalizer: &str,
) -> Result<(), ClientError> {
    if !has_finalizer(obj, finalizer) {
        return Ok(());
    }
    let finalizers: Vec<&String> = obj.finalizers().iter().filter(|f| *f != finalizer).collect();
    let patch = json!({
        "metadata": {
            "resourceVersion": obj.resource_version(),
            "finalizers": finalizers,
        }
    });
    match client.patch(obj.namespace().as_deref(), &obj.name_any(), &patch).await {
        Ok(_) => {
            info!(kind = %K::kind(&()), name = %obj.name_any(), finalizer, "Removed finalizer");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}
