//! The cluster collaborator seam. Everything that touches the Kubernetes API
//! goes through [`ClusterClient`], so the whole engine can run against either
//! a real cluster ([`crate::kube_client::KubeCluster`]) or the in-memory
//! simulator used by the tests.

use core::fmt;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::future::Future;

use kube::api::{DynamicObject, GroupVersionKind};
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// Namespace/name pair identifying an object within its kind.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.namespace, self.name)
        }
    }
}

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{kind} {key} not found")]
    NotFound { kind: String, key: String },
    #[error("{kind} {key} already exists")]
    AlreadyExists { kind: String, key: String },
    // The "forbidden" wording is load-bearing: callers surface RBAC failures
    // of the impersonated service account by matching on it.
    #[error("{kind} {key} is forbidden: user {user:?} cannot manage the resource")]
    Forbidden {
        kind: String,
        key: String,
        user: String,
    },
    #[error("conflict writing {kind} {key}")]
    Conflict { kind: String, key: String },
    #[error("invalid object: {0}")]
    Invalid(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

/// Dynamic-object view of a cluster. `apply` has server-side-apply upsert
/// semantics; `update`/`update_status` are full replacements that may fail
/// with [`ClusterError::Conflict`].
///
/// `impersonate` returns a second view over the same cluster that acts as the
/// given user for every call; the original view is unaffected.
pub trait ClusterClient: Clone + Send + Sync + 'static {
    fn impersonate(&self, user: &str) -> anyhow::Result<Self>;

    fn get(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> impl Future<Output = Result<DynamicObject, ClusterError>> + Send;

    fn create(
        &self,
        obj: &DynamicObject,
    ) -> impl Future<Output = Result<DynamicObject, ClusterError>> + Send;

    fn apply(
        &self,
        obj: &DynamicObject,
    ) -> impl Future<Output = Result<DynamicObject, ClusterError>> + Send;

    fn update(
        &self,
        obj: &DynamicObject,
    ) -> impl Future<Output = Result<DynamicObject, ClusterError>> + Send;

    fn update_status(
        &self,
        obj: &DynamicObject,
    ) -> impl Future<Output = Result<DynamicObject, ClusterError>> + Send;

    fn delete(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> impl Future<Output = Result<(), ClusterError>> + Send;

    fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<Vec<DynamicObject>, ClusterError>> + Send;
}

/// GVK under which a statically-typed resource is served.
pub fn gvk_of<K>() -> GroupVersionKind
where
    K: Resource<DynamicType = ()>,
{
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

/// GVK recorded in a dynamic object's type metadata.
pub fn gvk_of_obj(obj: &DynamicObject) -> Result<GroupVersionKind, ClusterError> {
    let types = obj
        .types
        .as_ref()
        .ok_or_else(|| ClusterError::Invalid("object has no type metadata".to_owned()))?;
    Ok(parse_gvk(&types.api_version, &types.kind))
}

pub fn parse_gvk(api_version: &str, kind: &str) -> GroupVersionKind {
    match api_version.split_once('/') {
        Some((group, version)) => GroupVersionKind::gvk(group, version, kind),
        None => GroupVersionKind::gvk("", api_version, kind),
    }
}

pub fn api_version_of(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        gvk.version.clone()
    } else {
        format!("{}/{}", gvk.group, gvk.version)
    }
}

/// Convert a statically-typed resource into the dynamic representation,
/// stamping type metadata (k8s-openapi types don't serialize it themselves).
pub fn to_dynamic<K>(obj: &K) -> Result<DynamicObject, ClusterError>
where
    K: Resource<DynamicType = ()> + Serialize,
{
    let mut value =
        serde_json::to_value(obj).map_err(|e| ClusterError::Invalid(e.to_string()))?;
    value["apiVersion"] = json!(K::api_version(&()));
    value["kind"] = json!(K::kind(&()));
    serde_json::from_value(value).map_err(|e| ClusterError::Invalid(e.to_string()))
}

pub fn from_dynamic<K>(obj: &DynamicObject) -> Result<K, ClusterError>
where
    K: DeserializeOwned,
{
    let value =
        serde_json::to_value(obj).map_err(|e| ClusterError::Invalid(e.to_string()))?;
    serde_json::from_value(value).map_err(|e| ClusterError::Invalid(e.to_string()))
}

pub async fn get_as<K, C>(cluster: &C, key: &ObjectKey) -> Result<K, ClusterError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
    C: ClusterClient,
{
    from_dynamic(&cluster.get(&gvk_of::<K>(), key).await?)
}

pub async fn create_as<K, C>(cluster: &C, obj: &K) -> Result<K, ClusterError>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    C: ClusterClient,
{
    from_dynamic(&cluster.create(&to_dynamic(obj)?).await?)
}

pub async fn update_as<K, C>(cluster: &C, obj: &K) -> Result<K, ClusterError>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    C: ClusterClient,
{
    from_dynamic(&cluster.update(&to_dynamic(obj)?).await?)
}

pub async fn update_status_as<K, C>(cluster: &C, obj: &K) -> Result<K, ClusterError>
where
    K: Resource<DynamicType = ()> + Serialize + DeserializeOwned,
    C: ClusterClient,
{
    from_dynamic(&cluster.update_status(&to_dynamic(obj)?).await?)
}

pub async fn list_as<K, C>(
    cluster: &C,
    namespace: &str,
    labels: &BTreeMap<String, String>,
) -> Result<Vec<K>, ClusterError>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
    C: ClusterClient,
{
    cluster
        .list(&gvk_of::<K>(), namespace, labels)
        .await?
        .iter()
        .map(from_dynamic)
        .collect()
}
