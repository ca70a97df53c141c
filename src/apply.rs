//! Inventory-aware apply and destroy. The engine drives two views over the
//! same cluster: its own identity manages the inventory carrier, while all
//! user-resource I/O happens through an identity impersonating the Live's
//! service account. Progress is collected into the textual report that ends
//! up in the ApplyResult condition.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context as _};
use kube::api::DynamicObject;
use kube::ResourceExt as _;
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::time::{sleep, Instant};

use crate::cluster::{gvk_of_obj, parse_gvk, ClusterClient, ObjectKey};
use crate::objstatus::{self, ResourceStatus};
use crate::resources::{
    LiveApply, ResourceId, INVENTORY_ID_LABEL, OWNING_INVENTORY_ANNOTATION,
};

#[derive(Clone, Debug)]
pub struct ApplyOptions {
    /// How long to wait for applied resources to reach their reconciled
    /// state.
    pub reconcile_timeout: Duration,
    /// How long to wait for pruned/destroyed resources to disappear.
    pub prune_timeout: Duration,
    /// Cadence of status polls while waiting.
    pub poll_interval: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            reconcile_timeout: Duration::from_secs(5 * 60),
            prune_timeout: Duration::from_secs(2 * 60),
            poll_interval: Duration::from_millis(500),
        }
    }
}

// Status events turned into the report handed back to the Live's conditions.
#[derive(Default)]
struct Progress {
    lines: Vec<String>,
}

impl Progress {
    fn event(&mut self, line: impl Into<String>) {
        let line = line.into();
        info!("{line}");
        self.lines.push(line);
    }

    fn report(self) -> String {
        self.lines.join("\n")
    }
}

/// The manifest installed for the inventory carrier's custom resource
/// definition. Installation is idempotent and re-runs when the installed
/// schema stops matching this one.
const RESOURCE_GROUP_CRD: &str = r#"
apiVersion: apiextensions.k8s.io/v1
kind: CustomResourceDefinition
metadata:
  name: resourcegroups.kpt.dev
spec:
  group: kpt.dev
  names:
    kind: ResourceGroup
    listKind: ResourceGroupList
    plural: resourcegroups
    singular: resourcegroup
  scope: Namespaced
  versions:
  - name: v1alpha1
    served: true
    storage: true
    schema:
      openAPIV3Schema:
        type: object
        properties:
          spec:
            type: object
            x-kubernetes-preserve-unknown-fields: true
          status:
            type: object
            x-kubernetes-preserve-unknown-fields: true
    subresources:
      status: {}
"#;

pub struct Engine<C> {
    inventory: C,
    resources: C,
}

impl<C: ClusterClient> Engine<C> {
    /// Both views start out as the controller's own identity.
    pub fn new(cluster: C) -> Self {
        Self {
            inventory: cluster.clone(),
            resources: cluster,
        }
    }

    /// Switches all user-resource I/O to the given service account.
    pub fn impersonate_for_resources(
        &mut self,
        service_account: &ObjectKey,
    ) -> anyhow::Result<()> {
        self.resources = self.inventory.impersonate(&format!(
            "system:serviceaccount:{}:{}",
            service_account.namespace, service_account.name
        ))?;
        Ok(())
    }

    /// Installs the ResourceGroup CRD if it's absent or its schema doesn't
    /// match the expected one.
    pub async fn install_resource_group(&self) -> anyhow::Result<()> {
        let desired: DynamicObject =
            serde_yaml::from_str(RESOURCE_GROUP_CRD).context("parsing ResourceGroup CRD")?;
        let gvk = gvk_of_obj(&desired).map_err(anyhow::Error::from)?;
        let key = ObjectKey::new("", desired.name_any());
        match self.inventory.get(&gvk, &key).await {
            Ok(existing) => {
                if existing.data["spec"] != desired.data["spec"] {
                    info!("reinstalling ResourceGroup CRD: installed schema differs");
                    self.inventory
                        .apply(&desired)
                        .await
                        .context("updating ResourceGroup CRD")?;
                }
            }
            Err(e) if e.is_not_found() => {
                info!("installing ResourceGroup CRD");
                self.inventory
                    .apply(&desired)
                    .await
                    .context("installing ResourceGroup CRD")?;
            }
            Err(e) => return Err(e).context("checking installed ResourceGroup CRD"),
        }
        Ok(())
    }

    /// Applies the resource set, pruning whatever the previous apply under
    /// the same inventory recorded but the new set no longer contains, then
    /// waits until every applied resource reconciles (or the timeout hits).
    /// Returns the progress report.
    pub async fn apply(&self, set: &LiveApply, options: &ApplyOptions) -> anyhow::Result<String> {
        let (mut carrier, objects) = set.split()?;
        let carrier_key = ObjectKey::new(carrier.namespace().unwrap_or_default(), carrier.name_any());
        let inventory_id = carrier
            .labels()
            .get(INVENTORY_ID_LABEL)
            .cloned()
            .context("inventory carrier has no inventory-id label")?;
        let mut progress = Progress::default();

        let previous = match self.inventory.get(&resource_group_gvk(), &carrier_key).await {
            Ok(existing) => {
                let existing_id = existing
                    .labels()
                    .get(INVENTORY_ID_LABEL)
                    .cloned()
                    .unwrap_or_default();
                if existing_id != inventory_id {
                    bail!(
                        "inventory {carrier_key} belongs to a different owner ({existing_id:?})"
                    );
                }
                inventory_records(&existing)?
            }
            Err(e) if e.is_not_found() => vec![],
            Err(e) => return Err(e).context("reading existing inventory"),
        };

        let current: Vec<ResourceId> = objects
            .iter()
            .map(ResourceId::from_obj)
            .collect::<Result<_, _>>()?;

        // Record the union first so a crash mid-apply can't orphan anything.
        let mut union = previous.clone();
        for id in &current {
            if !union.contains(id) {
                union.push(id.clone());
            }
        }
        set_inventory_records(&mut carrier, &union);
        self.inventory
            .apply(&carrier)
            .await
            .context("updating inventory")?;

        for obj in &objects {
            let id = ResourceId::from_obj(obj)?;
            self.apply_object(obj, &id, &inventory_id).await?;
            progress.event(format!("{id}: applied"));
        }

        let pruned: Vec<ResourceId> = previous
            .into_iter()
            .filter(|id| !current.contains(id))
            .collect();
        for id in &pruned {
            let gvk = parse_gvk(&id.api_version, &id.kind);
            let key = ObjectKey::new(&id.namespace, &id.name);
            match self.resources.delete(&gvk, &key).await {
                Ok(()) => progress.event(format!("{id}: pruned")),
                Err(e) if e.is_not_found() => progress.event(format!("{id}: already pruned")),
                Err(e) => return Err(e).context(format!("pruning {id}")),
            }
        }
        // Prune deletion propagates in the background; bounded wait only.
        self.wait_for_deletion(&pruned, options.prune_timeout, options.poll_interval)
            .await
            .context("waiting for pruned resources")?;

        set_inventory_records(&mut carrier, &current);
        self.inventory
            .apply(&carrier)
            .await
            .context("recording inventory")?;

        self.wait_for_reconcile(&objects, options, &mut progress).await?;
        Ok(progress.report())
    }

    async fn apply_object(
        &self,
        obj: &DynamicObject,
        id: &ResourceId,
        inventory_id: &str,
    ) -> anyhow::Result<()> {
        let gvk = gvk_of_obj(obj).map_err(anyhow::Error::from)?;
        let key = ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name_any());
        // Adopt-if-no-inventory: an object nobody's inventory owns is taken
        // over; one owned by a different inventory is a hard error.
        match self.resources.get(&gvk, &key).await {
            Ok(existing) => {
                if let Some(owner) = existing.annotations().get(OWNING_INVENTORY_ANNOTATION) {
                    if owner != inventory_id {
                        bail!("cannot apply {id}: object is owned by inventory {owner:?}");
                    }
                }
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e).context(format!("reading current state of {id}")),
        }
        let mut stamped = obj.clone();
        stamped
            .annotations_mut()
            .insert(OWNING_INVENTORY_ANNOTATION.to_owned(), inventory_id.to_owned());
        self.resources
            .apply(&stamped)
            .await
            .with_context(|| format!("applying {id}"))?;
        Ok(())
    }

    async fn wait_for_reconcile(
        &self,
        objects: &[DynamicObject],
        options: &ApplyOptions,
        progress: &mut Progress,
    ) -> anyhow::Result<()> {
        let deadline = Instant::now() + options.reconcile_timeout;
        let mut last_status: HashMap<ResourceId, ResourceStatus> = HashMap::new();
        loop {
            let mut pending = 0;
            for obj in objects {
                let id = ResourceId::from_obj(obj)?;
                let gvk = gvk_of_obj(obj).map_err(anyhow::Error::from)?;
                let key = ObjectKey::new(obj.namespace().unwrap_or_default(), obj.name_any());
                let status = match self.resources.get(&gvk, &key).await {
                    Ok(live_obj) => objstatus::compute(&live_obj),
                    Err(e) if e.is_not_found() => {
                        ResourceStatus::InProgress("not found".to_owned())
                    }
                    Err(e) => return Err(e).context(format!("watching status of {id}")),
                };
                if last_status.get(&id) != Some(&status) {
                    progress.event(format!("{id}: {status}"));
                    last_status.insert(id.clone(), status.clone());
                }
                match status {
                    ResourceStatus::Failed(why) => {
                        bail!("{id} failed to reconcile: {why}")
                    }
                    ResourceStatus::InProgress(_) => pending += 1,
                    ResourceStatus::Current => {}
                }
            }
            if pending == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("timed out waiting for {pending} resources to reconcile");
            }
            sleep(options.poll_interval).await;
        }
    }

    async fn wait_for_deletion(
        &self,
        ids: &[ResourceId],
        timeout: Duration,
        poll_interval: Duration,
    ) -> anyhow::Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            let mut remaining = 0;
            for id in ids {
                let gvk = parse_gvk(&id.api_version, &id.kind);
                let key = ObjectKey::new(&id.namespace, &id.name);
                match self.resources.get(&gvk, &key).await {
                    Ok(_) => remaining += 1,
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e).context(format!("watching deletion of {id}")),
                }
            }
            if remaining == 0 {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("timed out waiting for {remaining} resources to be deleted");
            }
            sleep(poll_interval).await;
        }
    }

    /// Deletes every resource recorded under the inventory, waits for them to
    /// disappear, then removes the inventory carrier itself.
    pub async fn destroy(
        &self,
        key: &ObjectKey,
        inventory_id: &str,
        options: &ApplyOptions,
    ) -> anyhow::Result<String> {
        let mut progress = Progress::default();
        let existing = match self.inventory.get(&resource_group_gvk(), key).await {
            Ok(existing) => existing,
            Err(e) if e.is_not_found() => {
                // Nothing was ever applied (or a previous destroy finished);
                // destroy is idempotent.
                progress.event(format!("no inventory for {key}, nothing to destroy"));
                return Ok(progress.report());
            }
            Err(e) => return Err(e).context("reading inventory"),
        };
        let existing_id = existing
            .labels()
            .get(INVENTORY_ID_LABEL)
            .cloned()
            .unwrap_or_default();
        if existing_id != inventory_id {
            bail!("inventory {key} belongs to a different owner ({existing_id:?})");
        }

        let records = inventory_records(&existing)?;
        for id in &records {
            let gvk = parse_gvk(&id.api_version, &id.kind);
            let object_key = ObjectKey::new(&id.namespace, &id.name);
            match self.resources.delete(&gvk, &object_key).await {
                Ok(()) => progress.event(format!("{id}: deleted")),
                Err(e) if e.is_not_found() => progress.event(format!("{id}: already deleted")),
                Err(e) => return Err(e).context(format!("deleting {id}")),
            }
        }
        self.wait_for_deletion(&records, options.prune_timeout, options.poll_interval)
            .await
            .context("waiting for destroyed resources")?;

        match self.inventory.delete(&resource_group_gvk(), key).await {
            Ok(()) | Err(crate::cluster::ClusterError::NotFound { .. }) => {}
            Err(e) => return Err(e).context("deleting inventory"),
        }
        progress.event(format!("inventory {key} deleted"));
        Ok(progress.report())
    }
}

fn resource_group_gvk() -> kube::api::GroupVersionKind {
    parse_gvk(
        crate::resources::RESOURCE_GROUP_API_VERSION,
        crate::resources::RESOURCE_GROUP_KIND,
    )
}

fn inventory_records(carrier: &DynamicObject) -> anyhow::Result<Vec<ResourceId>> {
    let Some(entries) = carrier.data["spec"]["resources"].as_array() else {
        return Ok(vec![]);
    };
    entries
        .iter()
        .map(|entry| {
            Ok(ResourceId {
                api_version: entry["apiVersion"]
                    .as_str()
                    .context("inventory record has no apiVersion")?
                    .to_owned(),
                kind: entry["kind"]
                    .as_str()
                    .context("inventory record has no kind")?
                    .to_owned(),
                namespace: entry["namespace"].as_str().unwrap_or_default().to_owned(),
                name: entry["name"]
                    .as_str()
                    .context("inventory record has no name")?
                    .to_owned(),
            })
        })
        .collect()
}

fn set_inventory_records(carrier: &mut DynamicObject, ids: &[ResourceId]) {
    let entries: Vec<Value> = ids
        .iter()
        .map(|id| {
            json!({
                "group": id.api_version.split_once('/').map(|(g, _)| g).unwrap_or_default(),
                "apiVersion": id.api_version,
                "kind": id.kind,
                "namespace": id.namespace,
                "name": id.name,
            })
        })
        .collect();
    carrier.data["spec"]["resources"] = Value::Array(entries);
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use indoc::indoc;
    use serde_json::json;

    use super::*;
    use crate::api::Live;
    use crate::resources::{ResourceMap, RESOURCE_GROUP_API_VERSION, RESOURCE_GROUP_KIND};
    use crate::testutil::{obj_from_yaml, FakeCluster};

    fn fast_options() -> ApplyOptions {
        ApplyOptions {
            reconcile_timeout: Duration::from_millis(500),
            prune_timeout: Duration::from_millis(500),
            poll_interval: Duration::from_millis(1),
        }
    }

    fn test_live() -> Live {
        let mut live = Live::default();
        live.metadata.name = Some("app".to_owned());
        live.metadata.namespace = Some("prod".to_owned());
        live.metadata.uid = Some("uid-live".to_owned());
        live
    }

    fn pod(name: &str) -> DynamicObject {
        obj_from_yaml(&format!(
            indoc! {"
                apiVersion: v1
                kind: Pod
                metadata:
                  name: {}
                  namespace: prod
                spec: {{}}
            "},
            name
        ))
    }

    fn configmap(name: &str, value: &str) -> DynamicObject {
        obj_from_yaml(&format!(
            indoc! {"
                apiVersion: v1
                kind: ConfigMap
                metadata:
                  name: {}
                  namespace: prod
                data:
                  foo: {}
            "},
            name, value
        ))
    }

    fn live_apply(objects: Vec<DynamicObject>) -> LiveApply {
        let mut map = ResourceMap::new();
        for obj in objects {
            map.push(obj).unwrap();
        }
        LiveApply::new(&test_live(), map).unwrap()
    }

    fn succeed_pod(cluster: &FakeCluster, name: &str) {
        cluster.script_statuses(
            "v1",
            "Pod",
            &ObjectKey::new("prod", name),
            [json!({"phase": "Succeeded"})],
        );
    }

    #[googletest::test]
    #[tokio::test]
    async fn test_apply_creates_resources_and_inventory() {
        let cluster = FakeCluster::new();
        let engine = Engine::new(cluster.clone());
        succeed_pod(&cluster, "a");

        let report = engine
            .apply(&live_apply(vec![pod("a")]), &fast_options())
            .await
            .unwrap();
        expect_that!(report, contains_substring("pod/prod/a: applied"));
        expect_that!(report, contains_substring("pod/prod/a: reconciled"));

        let applied = cluster
            .stored("v1", "Pod", &ObjectKey::new("prod", "a"))
            .unwrap();
        expect_that!(
            applied.annotations()[OWNING_INVENTORY_ANNOTATION],
            eq("uid-live")
        );
        let carrier = cluster
            .stored(
                RESOURCE_GROUP_API_VERSION,
                RESOURCE_GROUP_KIND,
                &ObjectKey::new("prod", "app"),
            )
            .unwrap();
        expect_that!(carrier.labels()[INVENTORY_ID_LABEL], eq("uid-live"));
        expect_that!(
            carrier.data["spec"]["resources"].as_array().unwrap().len(),
            eq(1)
        );
    }

    #[googletest::test]
    #[tokio::test]
    async fn test_apply_twice_is_idempotent() {
        let cluster = FakeCluster::new();
        let engine = Engine::new(cluster.clone());
        succeed_pod(&cluster, "a");

        let set = live_apply(vec![pod("a")]);
        engine.apply(&set, &fast_options()).await.unwrap();
        let before = cluster.stored("v1", "Pod", &ObjectKey::new("prod", "a")).unwrap();
        engine.apply(&set, &fast_options()).await.unwrap();
        let after = cluster.stored("v1", "Pod", &ObjectKey::new("prod", "a")).unwrap();
        // Same content modulo the bumped write version.
        expect_that!(after.data, eq(&before.data.clone()));
        expect_that!(after.metadata.uid, eq(&before.metadata.uid.clone()));
    }

    #[googletest::test]
    #[tokio::test]
    async fn test_apply_prunes_omitted_resources() {
        let cluster = FakeCluster::new();
        let engine = Engine::new(cluster.clone());
        succeed_pod(&cluster, "a");
        succeed_pod(&cluster, "b");

        engine
            .apply(&live_apply(vec![pod("a"), pod("b")]), &fast_options())
            .await
            .unwrap();
        let report = engine
            .apply(&live_apply(vec![pod("a")]), &fast_options())
            .await
            .unwrap();

        expect_that!(report, contains_substring("pod/prod/b: pruned"));
        expect_that!(
            cluster.stored("v1", "Pod", &ObjectKey::new("prod", "b")),
            none()
        );
        expect_that!(
            cluster.stored("v1", "Pod", &ObjectKey::new("prod", "a")),
            some(anything())
        );
        let carrier = cluster
            .stored(
                RESOURCE_GROUP_API_VERSION,
                RESOURCE_GROUP_KIND,
                &ObjectKey::new("prod", "app"),
            )
            .unwrap();
        expect_that!(
            carrier.data["spec"]["resources"].as_array().unwrap().len(),
            eq(1)
        );
    }

    #[googletest::test]
    #[tokio::test]
    async fn test_apply_updates_changed_resources() {
        let cluster = FakeCluster::new();
        let engine = Engine::new(cluster.clone());

        engine
            .apply(&live_apply(vec![configmap("cfg", "bar")]), &fast_options())
            .await
            .unwrap();
        engine
            .apply(&live_apply(vec![configmap("cfg", "bar2")]), &fast_options())
            .await
            .unwrap();

        let cm = cluster
            .stored("v1", "ConfigMap", &ObjectKey::new("prod", "cfg"))
            .unwrap();
        expect_that!(cm.data["data"]["foo"].as_str().unwrap(), eq("bar2"));
    }

    #[googletest::test]
    #[tokio::test]
    async fn test_apply_fails_on_crash_looping_pod() {
        let cluster = FakeCluster::new();
        let engine = Engine::new(cluster.clone());
        cluster.script_statuses(
            "v1",
            "Pod",
            &ObjectKey::new("prod", "a"),
            [json!({
                "phase": "Pending",
                "containerStatuses": [
                    {"name": "app", "state": {"waiting": {"reason": "CrashLoopBackOff"}}},
                ],
            })],
        );

        let err = engine
            .apply(&live_apply(vec![pod("a")]), &fast_options())
            .await
            .unwrap_err();
        expect_that!(format!("{err:#}"), contains_substring("CrashLoopBackOff"));
    }

    #[googletest::test]
    #[tokio::test]
    async fn test_apply_times_out_on_never_ready_pod() {
        let cluster = FakeCluster::new();
        let engine = Engine::new(cluster.clone());
        cluster.script_statuses(
            "v1",
            "Pod",
            &ObjectKey::new("prod", "a"),
            [json!({"phase": "Pending"})],
        );

        let err = engine
            .apply(&live_apply(vec![pod("a")]), &fast_options())
            .await
            .unwrap_err();
        expect_that!(format!("{err:#}"), contains_substring("timed out"));
    }

    #[googletest::test]
    #[tokio::test]
    async fn test_apply_forbidden_for_unauthorized_service_account() {
        let cluster = FakeCluster::new();
        cluster.restrict_user("system:serviceaccount:prod:limited", &["ConfigMap"]);
        let mut engine = Engine::new(cluster.clone());
        engine
            .impersonate_for_resources(&ObjectKey::new("prod", "limited"))
            .unwrap();

        let err = engine
            .apply(&live_apply(vec![pod("a")]), &fast_options())
            .await
            .unwrap_err();
        expect_that!(format!("{err:#}"), contains_substring("forbidden"));
        // Nothing was created in the target namespace.
        expect_that!(
            cluster.stored("v1", "Pod", &ObjectKey::new("prod", "a")),
            none()
        );
    }

    #[googletest::test]
    #[tokio::test]
    async fn test_apply_rejects_object_owned_by_other_inventory() {
        let cluster = FakeCluster::new();
        let engine = Engine::new(cluster.clone());
        let mut stolen = pod("a");
        stolen
            .annotations_mut()
            .insert(OWNING_INVENTORY_ANNOTATION.to_owned(), "someone-else".to_owned());
        cluster.seed(stolen);

        let err = engine
            .apply(&live_apply(vec![pod("a")]), &fast_options())
            .await
            .unwrap_err();
        expect_that!(
            format!("{err:#}"),
            contains_substring("owned by inventory \"someone-else\"")
        );
    }

    #[googletest::test]
    #[tokio::test]
    async fn test_apply_adopts_unowned_object() {
        let cluster = FakeCluster::new();
        let engine = Engine::new(cluster.clone());
        cluster.seed(configmap("cfg", "manual"));

        engine
            .apply(&live_apply(vec![configmap("cfg", "managed")]), &fast_options())
            .await
            .unwrap();
        let cm = cluster
            .stored("v1", "ConfigMap", &ObjectKey::new("prod", "cfg"))
            .unwrap();
        expect_that!(cm.data["data"]["foo"].as_str().unwrap(), eq("managed"));
        expect_that!(cm.annotations()[OWNING_INVENTORY_ANNOTATION], eq("uid-live"));
    }

    #[googletest::test]
    #[tokio::test]
    async fn test_destroy_deletes_recorded_resources() {
        let cluster = FakeCluster::new();
        let engine = Engine::new(cluster.clone());
        engine
            .apply(&live_apply(vec![configmap("cfg", "bar")]), &fast_options())
            .await
            .unwrap();

        let report = engine
            .destroy(&ObjectKey::new("prod", "app"), "uid-live", &fast_options())
            .await
            .unwrap();
        expect_that!(report, contains_substring("configmap/prod/cfg: deleted"));
        expect_that!(
            cluster.stored("v1", "ConfigMap", &ObjectKey::new("prod", "cfg")),
            none()
        );
        expect_that!(
            cluster.stored(
                RESOURCE_GROUP_API_VERSION,
                RESOURCE_GROUP_KIND,
                &ObjectKey::new("prod", "app"),
            ),
            none()
        );

        // Destroy of a destroyed (or never-applied) inventory succeeds.
        expect_that!(
            engine
                .destroy(&ObjectKey::new("prod", "app"), "uid-live", &fast_options())
                .await,
            ok(anything())
        );
    }

    #[googletest::test]
    #[tokio::test]
    async fn test_destroy_refuses_foreign_inventory() {
        let cluster = FakeCluster::new();
        let engine = Engine::new(cluster.clone());
        engine
            .apply(&live_apply(vec![configmap("cfg", "bar")]), &fast_options())
            .await
            .unwrap();

        let err = engine
            .destroy(&ObjectKey::new("prod", "app"), "other-uid", &fast_options())
            .await
            .unwrap_err();
        expect_that!(format!("{err:#}"), contains_substring("different owner"));
    }

    #[googletest::test]
    #[tokio::test]
    async fn test_install_resource_group_is_idempotent() {
        let cluster = FakeCluster::new();
        let engine = Engine::new(cluster.clone());
        engine.install_resource_group().await.unwrap();
        engine.install_resource_group().await.unwrap();
        let crd = cluster
            .stored(
                "apiextensions.k8s.io/v1",
                "CustomResourceDefinition",
                &ObjectKey::new("", "resourcegroups.kpt.dev"),
            )
            .unwrap();
        expect_that!(crd.data["spec"]["group"].as_str().unwrap(), eq("kpt.dev"));

        // A drifted schema gets reinstalled.
        let mut drifted = crd.clone();
        drifted.data["spec"]["scope"] = json!("Cluster");
        cluster.seed(drifted);
        engine.install_resource_group().await.unwrap();
        let repaired = cluster
            .stored(
                "apiextensions.k8s.io/v1",
                "CustomResourceDefinition",
                &ObjectKey::new("", "resourcegroups.kpt.dev"),
            )
            .unwrap();
        expect_that!(repaired.data["spec"]["scope"].as_str().unwrap(), eq("Namespaced"));
    }
}
