//! Rendered-resource collections and the inventory contract. Every apply is
//! accompanied by a synthetic `ResourceGroup` carrier whose labels record
//! which Live owns the applied set, kept wire-compatible with kpt/cli-utils.

use core::fmt;
use std::collections::BTreeMap;
use std::fmt::Display;

use anyhow::bail;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::core::TypeMeta;
use kube::ResourceExt as _;
use serde_json::json;

use crate::api::Live;

pub const RESOURCE_GROUP_API_VERSION: &str = "kpt.dev/v1alpha1";
pub const RESOURCE_GROUP_KIND: &str = "ResourceGroup";

/// Label on the inventory carrier recording which Live owns the set.
pub const INVENTORY_ID_LABEL: &str = "cli-utils.sigs.k8s.io/inventory-id";

/// Annotation stamped on every applied resource tying it to its inventory.
pub const OWNING_INVENTORY_ANNOTATION: &str = "config.k8s.io/owning-inventory";

/// Identity of a resource: type plus namespace/name.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Debug, Hash)]
pub struct ResourceId {
    pub api_version: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ResourceId {
    pub fn from_obj(obj: &DynamicObject) -> anyhow::Result<Self> {
        let Some(types) = &obj.types else {
            bail!("resource {:?} has no apiVersion/kind", obj.name_any());
        };
        let name = obj.name_any();
        if name.is_empty() {
            bail!("{} resource has no name", types.kind);
        }
        Ok(Self {
            api_version: types.api_version.clone(),
            kind: types.kind.clone(),
            namespace: obj.namespace().unwrap_or_default(),
            name,
        })
    }
}

impl Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = self.kind.to_lowercase();
        if self.namespace.is_empty() {
            write!(f, "{}/{}", kind, self.name)
        } else {
            write!(f, "{}/{}/{}", kind, self.namespace, self.name)
        }
    }
}

/// Ordered collection of fully-rendered resources with unique identities.
#[derive(Debug, Clone, Default)]
pub struct ResourceMap {
    resources: Vec<DynamicObject>,
}

impl ResourceMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, obj: DynamicObject) -> anyhow::Result<()> {
        let id = ResourceId::from_obj(&obj)?;
        if self.resources.iter().any(|r| {
            ResourceId::from_obj(r).map(|existing| existing == id).unwrap_or(false)
        }) {
            bail!("may not add resource with an already registered id: {id}");
        }
        self.resources.push(obj);
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DynamicObject> {
        self.resources.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DynamicObject> {
        self.resources.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn ids(&self) -> anyhow::Result<Vec<ResourceId>> {
        self.resources.iter().map(ResourceId::from_obj).collect()
    }

    /// Drops the resources the predicate rejects, preserving order.
    pub fn retain(&mut self, f: impl FnMut(&DynamicObject) -> bool) {
        self.resources.retain(f);
    }
}

impl IntoIterator for ResourceMap {
    type Item = DynamicObject;
    type IntoIter = std::vec::IntoIter<DynamicObject>;

    fn into_iter(self) -> Self::IntoIter {
        self.resources.into_iter()
    }
}

pub fn is_resource_group(obj: &DynamicObject) -> bool {
    obj.types.as_ref().is_some_and(|t| {
        t.api_version == RESOURCE_GROUP_API_VERSION && t.kind == RESOURCE_GROUP_KIND
    })
}

/// The carrier resource recording the Live's inventory: named like the Live,
/// labelled with its uid.
pub fn inventory_carrier(live: &Live) -> anyhow::Result<DynamicObject> {
    let name = live.name_any();
    if name.is_empty() {
        bail!("live resource must have a name");
    }
    let Some(namespace) = live.namespace() else {
        bail!("live resource must have a namespace");
    };
    Ok(DynamicObject {
        types: Some(TypeMeta {
            api_version: RESOURCE_GROUP_API_VERSION.to_owned(),
            kind: RESOURCE_GROUP_KIND.to_owned(),
        }),
        metadata: ObjectMeta {
            name: Some(name),
            namespace: Some(namespace),
            labels: Some(BTreeMap::from([(
                INVENTORY_ID_LABEL.to_owned(),
                live.inventory_id(),
            )])),
            ..Default::default()
        },
        data: json!({ "spec": { "resources": [] } }),
    })
}

/// A rendered resource map with the inventory carrier appended, ready for the
/// apply engine.
#[derive(Debug, Clone)]
pub struct LiveApply {
    resource_map: ResourceMap,
}

impl LiveApply {
    /// Fails if the rendered output already carries a ResourceGroup: the
    /// carrier is generated, never user-supplied.
    pub fn new(live: &Live, rendered: ResourceMap) -> anyhow::Result<Self> {
        if rendered.iter().any(is_resource_group) {
            bail!("found ResourceGroup but one should be generated automatically");
        }
        let mut resource_map = rendered;
        resource_map.push(inventory_carrier(live)?)?;
        Ok(Self { resource_map })
    }

    pub fn resource_map(&self) -> &ResourceMap {
        &self.resource_map
    }

    /// Splits into the inventory carrier and the objects to apply.
    pub fn split(&self) -> anyhow::Result<(DynamicObject, Vec<DynamicObject>)> {
        let mut carrier = None;
        let mut objects = Vec::new();
        for obj in self.resource_map.iter() {
            if is_resource_group(obj) {
                if carrier.is_some() {
                    bail!("multiple resource groups found");
                }
                carrier = Some(obj.clone());
            } else {
                objects.push(obj.clone());
            }
        }
        match carrier {
            Some(carrier) => Ok((carrier, objects)),
            None => bail!("no resource group found"),
        }
    }
}
