//! Test doubles: an in-memory cluster with scriptable statuses and
//! per-identity RBAC, plus small manifest helpers. Only compiled for tests.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use kube::api::{DynamicObject, GroupVersionKind};
use kube::ResourceExt as _;
use parking_lot::Mutex;
use serde_json::Value;

use crate::cluster::{api_version_of, ClusterClient, ClusterError, ObjectKey};

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
struct StoreKey {
    api_version: String,
    kind: String,
    namespace: String,
    name: String,
}

impl StoreKey {
    fn new(api_version: &str, kind: &str, key: &ObjectKey) -> Self {
        Self {
            api_version: api_version.to_owned(),
            kind: kind.to_owned(),
            namespace: key.namespace.clone(),
            name: key.name.clone(),
        }
    }

    fn of_gvk(gvk: &GroupVersionKind, key: &ObjectKey) -> Self {
        Self::new(&api_version_of(gvk), &gvk.kind, key)
    }

    fn of_obj(obj: &DynamicObject) -> Result<Self, ClusterError> {
        let Some(types) = &obj.types else {
            return Err(ClusterError::Invalid(format!(
                "object {:?} has no type metadata",
                obj.name_any()
            )));
        };
        Ok(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.namespace().unwrap_or_default(),
            name: obj.name_any(),
        })
    }

    fn object_key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace.clone(), self.name.clone())
    }
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<StoreKey, DynamicObject>,
    // Statuses handed out on successive gets; the last one sticks.
    status_scripts: HashMap<StoreKey, VecDeque<Value>>,
    // user -> kinds it may touch. Users absent from the map may touch
    // anything, like the controller's own identity.
    rbac: HashMap<String, HashSet<String>>,
    fail_status_updates: usize,
    counter: u64,
}

impl Inner {
    fn next_counter(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }
}

/// In-memory stand-in for a cluster, shared between clones; `impersonate`
/// returns a view with a different acting user over the same state.
#[derive(Clone, Default)]
pub struct FakeCluster {
    inner: Arc<Mutex<Inner>>,
    user: Option<String>,
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// From now on `user` may only manage the given kinds.
    pub fn restrict_user(&self, user: &str, allowed_kinds: &[&str]) {
        self.inner.lock().rbac.insert(
            user.to_owned(),
            allowed_kinds.iter().map(|k| (*k).to_owned()).collect(),
        );
    }

    /// The next status write fails with a conflict, like a stale
    /// resourceVersion would.
    pub fn fail_next_status_update(&self) {
        self.inner.lock().fail_status_updates += 1;
    }

    /// Queues statuses handed out by successive gets of the object; the final
    /// entry then sticks. This is how tests simulate resources progressing
    /// (or crash-looping) after an apply.
    pub fn script_statuses(
        &self,
        api_version: &str,
        kind: &str,
        key: &ObjectKey,
        statuses: impl IntoIterator<Item = Value>,
    ) {
        self.inner
            .lock()
            .status_scripts
            .insert(StoreKey::new(api_version, kind, key), statuses.into_iter().collect());
    }

    /// Puts an object into the store directly, bypassing RBAC. Assigns a uid
    /// if the object has none.
    pub fn seed(&self, mut obj: DynamicObject) -> DynamicObject {
        let key = StoreKey::of_obj(&obj).expect("seeded object must have type metadata");
        let mut inner = self.inner.lock();
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(format!("uid-{}", inner.next_counter()));
        }
        inner.objects.insert(key, obj.clone());
        obj
    }

    /// Marks an object as being deleted, like a user deletion would when
    /// finalizers are still holding the object up.
    pub fn mark_deleted(&self, api_version: &str, kind: &str, key: &ObjectKey) {
        let store_key = StoreKey::new(api_version, kind, key);
        let mut inner = self.inner.lock();
        if let Some(obj) = inner.objects.get_mut(&store_key) {
            obj.metadata.deletion_timestamp =
                Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::Time(
                    chrono::Utc::now(),
                ));
        }
    }

    /// Raw store lookup for assertions, bypassing status scripts and RBAC.
    pub fn stored(&self, api_version: &str, kind: &str, key: &ObjectKey) -> Option<DynamicObject> {
        self.inner
            .lock()
            .objects
            .get(&StoreKey::new(api_version, kind, key))
            .cloned()
    }

    fn authorize(&self, inner: &Inner, key: &StoreKey) -> Result<(), ClusterError> {
        let Some(user) = &self.user else {
            return Ok(());
        };
        if let Some(allowed) = inner.rbac.get(user) {
            if !allowed.contains(&key.kind) {
                return Err(ClusterError::Forbidden {
                    kind: key.kind.clone(),
                    key: key.object_key().to_string(),
                    user: user.clone(),
                });
            }
        }
        Ok(())
    }

    fn not_found(key: &StoreKey) -> ClusterError {
        ClusterError::NotFound {
            kind: key.kind.clone(),
            key: key.object_key().to_string(),
        }
    }
}

impl ClusterClient for FakeCluster {
    fn impersonate(&self, user: &str) -> anyhow::Result<Self> {
        Ok(Self {
            inner: self.inner.clone(),
            user: Some(user.to_owned()),
        })
    }

    async fn get(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> Result<DynamicObject, ClusterError> {
        let store_key = StoreKey::of_gvk(gvk, key);
        let mut inner = self.inner.lock();
        self.authorize(&inner, &store_key)?;
        if !inner.objects.contains_key(&store_key) {
            return Err(Self::not_found(&store_key));
        }
        // Advance the status script, if any.
        let inner = &mut *inner;
        if let Some(script) = inner.status_scripts.get_mut(&store_key) {
            let next = if script.len() > 1 {
                script.pop_front()
            } else {
                script.front().cloned()
            };
            if let Some(status) = next {
                let obj = inner.objects.get_mut(&store_key).unwrap();
                obj.data["status"] = status;
            }
        }
        Ok(inner.objects[&store_key].clone())
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let mut obj = obj.clone();
        let mut inner = self.inner.lock();
        if obj.metadata.name.is_none() {
            if let Some(prefix) = &obj.metadata.generate_name {
                obj.metadata.name = Some(format!("{}{:05}", prefix, inner.next_counter()));
            }
        }
        let store_key = StoreKey::of_obj(&obj)?;
        self.authorize(&inner, &store_key)?;
        if inner.objects.contains_key(&store_key) {
            return Err(ClusterError::AlreadyExists {
                kind: store_key.kind.clone(),
                key: store_key.object_key().to_string(),
            });
        }
        if obj.metadata.uid.is_none() {
            obj.metadata.uid = Some(format!("uid-{}", inner.next_counter()));
        }
        let version = inner.next_counter();
        obj.metadata.resource_version = Some(version.to_string());
        inner.objects.insert(store_key, obj.clone());
        Ok(obj)
    }

    async fn apply(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let mut obj = obj.clone();
        let store_key = StoreKey::of_obj(&obj)?;
        let mut inner = self.inner.lock();
        self.authorize(&inner, &store_key)?;
        let existing = inner.objects.get(&store_key).cloned();
        match existing {
            Some(existing) => {
                // Server-side-apply-ish upsert: identity and status survive.
                obj.metadata.uid = existing.metadata.uid.clone();
                if obj.data["status"].is_null() && !existing.data["status"].is_null() {
                    obj.data["status"] = existing.data["status"].clone();
                }
            }
            None => {
                if obj.metadata.uid.is_none() {
                    obj.metadata.uid = Some(format!("uid-{}", inner.next_counter()));
                }
            }
        }
        let version = inner.next_counter();
        obj.metadata.resource_version = Some(version.to_string());
        inner.objects.insert(store_key, obj.clone());
        Ok(obj)
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let mut obj = obj.clone();
        let store_key = StoreKey::of_obj(&obj)?;
        let mut inner = self.inner.lock();
        self.authorize(&inner, &store_key)?;
        let Some(existing) = inner.objects.get(&store_key).cloned() else {
            return Err(Self::not_found(&store_key));
        };
        // The status subresource is not writable through a main update.
        obj.data["status"] = existing.data["status"].clone();
        obj.metadata.uid = existing.metadata.uid.clone();
        obj.metadata.deletion_timestamp = existing.metadata.deletion_timestamp.clone();
        // Like the real API server: dropping the last finalizer of an object
        // that is being deleted deletes it for good.
        if obj.metadata.deletion_timestamp.is_some()
            && obj.metadata.finalizers.as_deref().unwrap_or_default().is_empty()
        {
            inner.objects.remove(&store_key);
            inner.status_scripts.remove(&store_key);
            return Ok(obj);
        }
        let version = inner.next_counter();
        obj.metadata.resource_version = Some(version.to_string());
        inner.objects.insert(store_key, obj.clone());
        Ok(obj)
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let store_key = StoreKey::of_obj(obj)?;
        let mut inner = self.inner.lock();
        self.authorize(&inner, &store_key)?;
        if inner.fail_status_updates > 0 {
            inner.fail_status_updates -= 1;
            return Err(ClusterError::Conflict {
                kind: store_key.kind.clone(),
                key: store_key.object_key().to_string(),
            });
        }
        if !inner.objects.contains_key(&store_key) {
            return Err(Self::not_found(&store_key));
        }
        let version = inner.next_counter();
        let existing = inner.objects.get_mut(&store_key).unwrap();
        existing.data["status"] = obj.data["status"].clone();
        existing.metadata.resource_version = Some(version.to_string());
        Ok(existing.clone())
    }

    async fn delete(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<(), ClusterError> {
        let store_key = StoreKey::of_gvk(gvk, key);
        let mut inner = self.inner.lock();
        self.authorize(&inner, &store_key)?;
        if inner.objects.remove(&store_key).is_none() {
            return Err(Self::not_found(&store_key));
        }
        inner.status_scripts.remove(&store_key);
        Ok(())
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let api_version = api_version_of(gvk);
        let inner = self.inner.lock();
        if let Some(user) = &self.user {
            if let Some(allowed) = inner.rbac.get(user) {
                if !allowed.contains(&gvk.kind) {
                    return Err(ClusterError::Forbidden {
                        kind: gvk.kind.clone(),
                        key: namespace.to_owned(),
                        user: user.clone(),
                    });
                }
            }
        }
        Ok(inner
            .objects
            .iter()
            .filter(|(k, _)| k.api_version == api_version && k.kind == gvk.kind)
            .filter(|(k, _)| namespace.is_empty() || k.namespace == namespace)
            .filter(|(_, obj)| {
                labels
                    .iter()
                    .all(|(key, value)| obj.labels().get(key) == Some(value))
            })
            .map(|(_, obj)| obj.clone())
            .collect())
    }
}

/// Parses a single-document YAML manifest into a dynamic object.
pub fn obj_from_yaml(yaml: &str) -> DynamicObject {
    serde_yaml::from_str(yaml).expect("invalid test manifest")
}
