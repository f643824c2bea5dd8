//! Mock ResourceClient for unit testing
//!
//! This module provides an in-memory implementation of [`ResourceClient`]
//! that follows the API server's object lifecycle closely enough for
//! reconciler tests:
//!
//! - every write bumps a monotonically increasing resource version, no-op
//!   writes leave it untouched
//! - `uid` and `creationTimestamp` are assigned on create and immutable
//! - deleting an object with finalizers only sets `deletionTimestamp`; the
//!   object disappears once the last finalizer is removed
//! - status is a subresource: `replace` and `patch` never touch it

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::ClientError;
use crate::resource_trait::{ResourceClient, ResourceObject};
use crate::selector::ListSelector;

type ObjectKey = (String, String);

#[derive(Default)]
struct Store {
    objects: BTreeMap<ObjectKey, Value>,
    resource_version: u64,
    failures: VecDeque<ClientError>,
    writes: u64,
}

/// In-memory store for a single kind
///
/// Clones share the same store, so a test can hand one clone to the
/// reconciler under test and inspect state through another.
pub struct MockClient<K> {
    store: Arc<Mutex<Store>>,
    _kind: PhantomData<fn() -> K>,
}

impl<K> Clone for MockClient<K> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            _kind: PhantomData,
        }
    }
}

impl<K> Default for MockClient<K> {
    fn default() -> Self {
        Self {
            store: Arc::new(Mutex::new(Store::default())),
            _kind: PhantomData,
        }
    }
}

impl<K> fmt::Debug for MockClient<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockClient")
            .field("kind", &std::any::type_name::<K>())
            .finish_non_exhaustive()
    }
}

impl<K: ResourceObject> MockClient<K> {
    /// Create an empty mock store
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add an object to the mock store (for test setup)
    ///
    /// The namespace is taken from the object's metadata.
    pub fn add(&self, obj: K) -> Result<K, ClientError> {
        let namespace = obj.meta().namespace.clone();
        self.lock().create(namespace.as_deref(), &obj)
    }

    /// Make the next write operation fail with `err`
    pub fn fail_next(&self, err: ClientError) {
        self.lock().failures.push_back(err);
    }

    /// All objects, ordered by namespace and name
    pub fn objects(&self) -> Vec<K> {
        self.lock()
            .objects
            .values()
            .filter_map(|v| serde_json::from_value(v.clone()).ok())
            .collect()
    }

    /// Object by key, if present
    pub fn object(&self, namespace: Option<&str>, name: &str) -> Option<K> {
        self.lock()
            .objects
            .get(&key(namespace, name))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn len(&self) -> usize {
        self.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of writes that changed an object
    pub fn writes(&self) -> u64 {
        self.lock().writes
    }
}

fn key(namespace: Option<&str>, name: &str) -> ObjectKey {
    (namespace.unwrap_or_default().to_string(), name.to_string())
}

fn display_key((namespace, name): &ObjectKey) -> String {
    if namespace.is_empty() {
        name.clone()
    } else {
        format!("{namespace}/{name}")
    }
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

fn meta_str<'a>(obj: &'a Value, field: &str) -> Option<&'a str> {
    obj.get("metadata")?.get(field)?.as_str()
}

fn with_meta<R>(obj: &mut Value, f: impl FnOnce(&mut Map<String, Value>) -> R) -> Option<R> {
    if !obj.is_object() {
        *obj = Value::Object(Map::new());
    }
    if !obj.get("metadata").is_some_and(Value::is_object) {
        obj["metadata"] = Value::Object(Map::new());
    }
    obj.get_mut("metadata").and_then(Value::as_object_mut).map(f)
}

fn labels_of(obj: &Value) -> BTreeMap<String, String> {
    obj.get("metadata")
        .and_then(|m| m.get("labels"))
        .and_then(|l| serde_json::from_value(l.clone()).ok())
        .unwrap_or_default()
}

fn has_finalizers(obj: &Value) -> bool {
    obj.get("metadata")
        .and_then(|m| m.get("finalizers"))
        .and_then(Value::as_array)
        .is_some_and(|f| !f.is_empty())
}

/// RFC 7396 JSON merge patch.
pub(crate) fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (k, v) in patch {
            if v.is_null() {
                target.remove(k);
            } else {
                merge_patch(target.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}

fn random_suffix(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .map(|c| char::from(c).to_ascii_lowercase())
        .take(len)
        .collect()
}

impl Store {
    fn take_failure(&mut self) -> Result<(), ClientError> {
        match self.failures.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn next_version(&mut self) -> String {
        self.resource_version += 1;
        self.writes += 1;
        self.resource_version.to_string()
    }

    fn get_value(&self, key: &ObjectKey) -> Result<&Value, ClientError> {
        self.objects
            .get(key)
            .ok_or_else(|| ClientError::NotFound(display_key(key)))
    }

    fn create<K: ResourceObject>(&mut self, namespace: Option<&str>, obj: &K) -> Result<K, ClientError> {
        self.take_failure()?;
        let mut value = serde_json::to_value(obj)?;
        let name = match (meta_str(&value, "name"), meta_str(&value, "generateName")) {
            (Some(name), _) => name.to_string(),
            (None, Some(prefix)) => format!("{prefix}{}", random_suffix(5)),
            (None, None) => return Err(ClientError::Invalid("metadata.name is required".to_string())),
        };
        let key = key(namespace, &name);
        if self.objects.contains_key(&key) {
            return Err(ClientError::AlreadyExists(display_key(&key)));
        }

        let version = self.next_version();
        if let Value::Object(root) = &mut value {
            root.insert("apiVersion".to_string(), json!(K::api_version(&())));
            root.insert("kind".to_string(), json!(K::kind(&())));
        }
        with_meta(&mut value, |meta| {
            meta.insert("name".to_string(), json!(name));
            match namespace {
                Some(ns) => meta.insert("namespace".to_string(), json!(ns)),
                None => meta.remove("namespace"),
            };
            meta.insert("uid".to_string(), json!(uuid::Uuid::new_v4().to_string()));
            meta.insert("resourceVersion".to_string(), json!(version));
            meta.insert("creationTimestamp".to_string(), json!(now()));
            meta.remove("deletionTimestamp");
        });

        self.objects.insert(key, value.clone());
        Ok(serde_json::from_value(value)?)
    }

    /// Stores `updated` in place of `stored` keeping server-owned fields,
    /// unless nothing changed.
    fn commit<K: ResourceObject>(&mut self, key: ObjectKey, stored: Value, mut updated: Value) -> Result<K, ClientError> {
        with_meta(&mut updated, |meta| {
            for field in ["name", "namespace", "uid", "creationTimestamp", "deletionTimestamp", "resourceVersion"] {
                match stored.get("metadata").and_then(|m| m.get(field)) {
                    Some(v) => meta.insert(field.to_string(), v.clone()),
                    None => meta.remove(field),
                };
            }
        });
        if updated == stored {
            return Ok(serde_json::from_value(stored)?);
        }

        let version = self.next_version();
        with_meta(&mut updated, |meta| meta.insert("resourceVersion".to_string(), json!(version)));

        let deleting = meta_str(&updated, "deletionTimestamp").is_some();
        if deleting && !has_finalizers(&updated) {
            self.objects.remove(&key);
        } else {
            self.objects.insert(key, updated.clone());
        }
        Ok(serde_json::from_value(updated)?)
    }

    fn check_precondition(key: &ObjectKey, stored: &Value, requested: Option<&str>) -> Result<(), ClientError> {
        match requested {
            Some(rv) if Some(rv) != meta_str(stored, "resourceVersion") => Err(ClientError::Conflict(format!(
                "{}: the object has been modified; please apply your changes to the latest version",
                display_key(key)
            ))),
            _ => Ok(()),
        }
    }

    fn replace<K: ResourceObject>(&mut self, namespace: Option<&str>, name: &str, obj: &K) -> Result<K, ClientError> {
        self.take_failure()?;
        let key = key(namespace, name);
        let stored = self.get_value(&key)?.clone();
        let mut updated = serde_json::to_value(obj)?;
        Self::check_precondition(&key, &stored, meta_str(&updated, "resourceVersion"))?;

        if let Value::Object(root) = &mut updated {
            match stored.get("status") {
                Some(status) => root.insert("status".to_string(), status.clone()),
                None => root.remove("status"),
            };
        }
        self.commit(key, stored, updated)
    }

    fn patch<K: ResourceObject>(
        &mut self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
        status: bool,
    ) -> Result<K, ClientError> {
        self.take_failure()?;
        let key = key(namespace, name);
        let stored = self.get_value(&key)?.clone();
        Self::check_precondition(&key, &stored, meta_str(patch, "resourceVersion"))?;

        let mut patch = patch.clone();
        if let Value::Object(root) = &mut patch {
            if status {
                root.retain(|k, _| k == "status");
            } else {
                root.remove("status");
            }
        }
        let mut updated = stored.clone();
        merge_patch(&mut updated, &patch);
        self.commit(key, stored, updated)
    }

    fn apply<K: ResourceObject>(&mut self, namespace: Option<&str>, name: &str, obj: &Value) -> Result<K, ClientError> {
        let key = key(namespace, name);
        let Some(stored) = self.objects.get(&key).cloned() else {
            let mut value = obj.clone();
            with_meta(&mut value, |meta| meta.insert("name".to_string(), json!(name)));
            let obj: K = serde_json::from_value(value)?;
            return self.create(namespace, &obj);
        };
        self.take_failure()?;

        let mut updated = stored.clone();
        if let (Value::Object(target), Value::Object(applied)) = (&mut updated, obj) {
            for (k, v) in applied {
                match k.as_str() {
                    "metadata" => {
                        let mut meta = v.clone();
                        if let Value::Object(meta) = &mut meta {
                            meta.remove("resourceVersion");
                        }
                        merge_patch(target.entry("metadata").or_insert(Value::Null), &meta);
                    }
                    "status" | "apiVersion" | "kind" => {}
                    _ => {
                        target.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        self.commit(key, stored, updated)
    }

    fn delete(&mut self, namespace: Option<&str>, name: &str) -> Result<(), ClientError> {
        self.take_failure()?;
        let key = key(namespace, name);
        let stored = self.get_value(&key)?.clone();
        if !has_finalizers(&stored) {
            self.objects.remove(&key);
            self.writes += 1;
            return Ok(());
        }
        if meta_str(&stored, "deletionTimestamp").is_none() {
            let version = self.next_version();
            if let Some(obj) = self.objects.get_mut(&key) {
                with_meta(obj, |meta| {
                    meta.insert("deletionTimestamp".to_string(), json!(now()));
                    meta.insert("resourceVersion".to_string(), json!(version));
                });
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl<K: ResourceObject> ResourceClient<K> for MockClient<K> {
    async fn get(&self, namespace: Option<&str>, name: &str) -> Result<K, ClientError> {
        let store = self.lock();
        let value = store.get_value(&key(namespace, name))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    async fn list(&self, namespace: Option<&str>, selector: &ListSelector) -> Result<Vec<K>, ClientError> {
        let store = self.lock();
        store
            .objects
            .iter()
            .filter(|((ns, _), _)| namespace.is_none_or(|want| want == ns))
            .filter(|(_, v)| selector.matches(&labels_of(v)))
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(ClientError::from))
            .collect()
    }

    async fn create(&self, namespace: Option<&str>, obj: &K) -> Result<K, ClientError> {
        self.lock().create(namespace, obj)
    }

    async fn replace(&self, namespace: Option<&str>, name: &str, obj: &K) -> Result<K, ClientError> {
        self.lock().replace(namespace, name, obj)
    }

    async fn patch(&self, namespace: Option<&str>, name: &str, patch: &Value) -> Result<K, ClientError> {
        self.lock().patch(namespace, name, patch, false)
    }

    async fn patch_status(&self, namespace: Option<&str>, name: &str, patch: &Value) -> Result<K, ClientError> {
        self.lock().patch(namespace, name, patch, true)
    }

    async fn apply(
        &self,
        namespace: Option<&str>,
        name: &str,
        obj: &Value,
        _field_manager: &str,
    ) -> Result<K, ClientError> {
        self.lock().apply(namespace, name, obj)
    }

    async fn delete(&self, namespace: Option<&str>, name: &str) -> Result<(), ClientError> {
        self.lock().delete(namespace, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_patch() {
        let mut target = json!({"a": 1, "b": {"c": 2, "d": 3}, "e": [1, 2]});
        merge_patch(&mut target, &json!({"a": null, "b": {"c": 4}, "e": [3]}));
        assert_eq!(target, json!({"b": {"c": 4, "d": 3}, "e": [3]}));
    }
}
