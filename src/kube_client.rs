//! [`ClusterClient`] backed by a real cluster through `kube`. Object types
//! are resolved dynamically via API discovery, so the controller can apply
//! whatever kinds a rendered layer contains. Exercised against a live
//! cluster; the rest of the crate tests against the in-memory simulator.

use std::collections::BTreeMap;

use anyhow::Context as _;
use itertools::Itertools as _;
use kube::api::{
    Api, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch, PatchParams,
    PostParams,
};
use kube::discovery::{self, Scope};
use kube::ResourceExt as _;
use kube::{Client, Config};

use crate::cluster::{ClusterClient, ClusterError, ObjectKey};

const FIELD_MANAGER: &str = "kuberik";

#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    config: Config,
}

impl KubeCluster {
    /// Connects using the usual inference order (in-cluster config, then
    /// kubeconfig).
    pub async fn connect() -> anyhow::Result<Self> {
        Self::from_config(Config::infer().await.context("inferring kube config")?)
    }

    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let client = Client::try_from(config.clone()).context("building kube client")?;
        Ok(Self { client, config })
    }

    fn acting_user(&self) -> String {
        self.config
            .auth_info
            .impersonate
            .clone()
            .unwrap_or_else(|| "controller".to_owned())
    }

    async fn api(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
    ) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, caps) = discovery::pinned_kind(&self.client, gvk)
            .await
            .map_err(|e| {
                ClusterError::Other(
                    anyhow::Error::new(e)
                        .context(format!("discovering api resource for {}", gvk.kind)),
                )
            })?;
        Ok(if namespace.is_empty() || caps.scope == Scope::Cluster {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        })
    }

    fn convert_error(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
        err: kube::Error,
    ) -> ClusterError {
        match &err {
            kube::Error::Api(response) => match response.code {
                404 => ClusterError::NotFound {
                    kind: gvk.kind.clone(),
                    key: key.to_string(),
                },
                403 => ClusterError::Forbidden {
                    kind: gvk.kind.clone(),
                    key: key.to_string(),
                    user: self.acting_user(),
                },
                409 if response.reason == "AlreadyExists" => ClusterError::AlreadyExists {
                    kind: gvk.kind.clone(),
                    key: key.to_string(),
                },
                409 => ClusterError::Conflict {
                    kind: gvk.kind.clone(),
                    key: key.to_string(),
                },
                _ => ClusterError::Other(anyhow::Error::new(err)),
            },
            _ => ClusterError::Other(anyhow::Error::new(err)),
        }
    }

    fn obj_gvk_and_key(obj: &DynamicObject) -> Result<(GroupVersionKind, ObjectKey), ClusterError> {
        let gvk = crate::cluster::gvk_of_obj(obj)?;
        let key = ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name_any());
        Ok((gvk, key))
    }
}

impl ClusterClient for KubeCluster {
    /// A view over the same cluster acting as `user`, e.g.
    /// `system:serviceaccount:<ns>:<sa>`.
    fn impersonate(&self, user: &str) -> anyhow::Result<Self> {
        let mut config = self.config.clone();
        config.auth_info.impersonate = Some(user.to_owned());
        Self::from_config(config)
    }

    async fn get(
        &self,
        gvk: &GroupVersionKind,
        key: &ObjectKey,
    ) -> Result<DynamicObject, ClusterError> {
        let api = self.api(gvk, &key.namespace).await?;
        api.get(&key.name)
            .await
            .map_err(|e| self.convert_error(gvk, key, e))
    }

    async fn create(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let (gvk, key) = Self::obj_gvk_and_key(obj)?;
        let api = self.api(&gvk, &key.namespace).await?;
        api.create(&PostParams::default(), obj)
            .await
            .map_err(|e| self.convert_error(&gvk, &key, e))
    }

    async fn apply(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let (gvk, key) = Self::obj_gvk_and_key(obj)?;
        let api = self.api(&gvk, &key.namespace).await?;
        api.patch(
            &key.name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(obj),
        )
        .await
        .map_err(|e| self.convert_error(&gvk, &key, e))
    }

    async fn update(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let (gvk, key) = Self::obj_gvk_and_key(obj)?;
        let api = self.api(&gvk, &key.namespace).await?;
        api.replace(&key.name, &PostParams::default(), obj)
            .await
            .map_err(|e| self.convert_error(&gvk, &key, e))
    }

    async fn update_status(&self, obj: &DynamicObject) -> Result<DynamicObject, ClusterError> {
        let (gvk, key) = Self::obj_gvk_and_key(obj)?;
        let api = self.api(&gvk, &key.namespace).await?;
        let data = serde_json::to_vec(obj).map_err(|e| ClusterError::Invalid(e.to_string()))?;
        api.replace_status(&key.name, &PostParams::default(), data)
            .await
            .map_err(|e| self.convert_error(&gvk, &key, e))
    }

    async fn delete(&self, gvk: &GroupVersionKind, key: &ObjectKey) -> Result<(), ClusterError> {
        let api = self.api(gvk, &key.namespace).await?;
        api.delete(&key.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| self.convert_error(gvk, key, e))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<DynamicObject>, ClusterError> {
        let api = self.api(gvk, namespace).await?;
        let selector = labels
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .join(",");
        let mut params = ListParams::default();
        if !selector.is_empty() {
            params = params.labels(&selector);
        }
        let list = api
            .list(&params)
            .await
            .map_err(|e| self.convert_error(gvk, &ObjectKey::new(namespace, ""), e))?;
        Ok(list.items)
    }
}
