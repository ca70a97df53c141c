//! The two outer polling controllers: LiveDeployment keeps a child Live on
//! the tip of one branch, LiveDeploymentGroup keeps one LiveDeployment per
//! matching branch. Both are thin loops over the same git cache the Live
//! reconciler uses.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use kube::ResourceExt as _;
#[allow(unused_imports)]
use log::{debug, error, info, warn};

use crate::api::{Live, LiveDeployment, LiveDeploymentGroup, LiveTemplate};
use crate::cluster::{self, ClusterClient, ObjectKey};
use crate::config::Settings;
use crate::controller::{ReconcileResult, Reconciler};
use crate::git::GitRepository;

fn poll_requeue(poll_interval_seconds: i64) -> Option<Duration> {
    Some(Duration::from_secs((poll_interval_seconds + 1).max(1) as u64))
}

pub struct LiveDeploymentController<C: ClusterClient> {
    cluster: C,
    settings: Settings,
}

impl<C: ClusterClient> LiveDeploymentController<C> {
    pub fn new(cluster: C, settings: Settings) -> Arc<Self> {
        Arc::new(Self { cluster, settings })
    }

    async fn repo(&self, key: &ObjectKey, template: &LiveTemplate) -> anyhow::Result<GitRepository> {
        let auth = template
            .spec
            .repository
            .resolve_auth(&self.cluster, &key.namespace)
            .await
            .context("failed to get auth method")?;
        GitRepository::init(
            self.settings.repo_dir.join(&key.namespace).join(&key.name),
            &template.spec.repository.url,
            auth,
        )
        .await
        .context("failed to init git repository")
    }

    async fn reconcile_deployment(&self, key: ObjectKey) -> ReconcileResult {
        let deployment: LiveDeployment = match cluster::get_as(&self.cluster, &key).await {
            Ok(deployment) => deployment,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e).context("fetching livedeployment"),
        };
        let Some(template) = &deployment.spec.template else {
            bail!("livedeployment {key} has no template");
        };

        let repo = self.repo(&key, template).await?;
        let commit = repo
            .fetch_branch(&deployment.spec.branch)
            .await
            .context("failed to fetch branch")?;

        let child = deployment.live_for_commit(&commit);
        match cluster::create_as(&self.cluster, &child).await {
            Ok(_) => {
                debug!("created live {key} for commit {}", commit.abbrev());
            }
            Err(e) if e.is_already_exists() => {
                let mut existing: Live = cluster::get_as(&self.cluster, &key)
                    .await
                    .context("fetching existing live")?;
                existing.spec = child.spec.clone();
                cluster::update_as(&self.cluster, &existing)
                    .await
                    .context("updating live")?;
            }
            Err(e) => return Err(e).context("creating live"),
        }

        Ok(poll_requeue(deployment.spec.poll_interval_seconds))
    }
}

impl<C: ClusterClient> Reconciler for LiveDeploymentController<C> {
    async fn reconcile(&self, key: ObjectKey) -> ReconcileResult {
        self.reconcile_deployment(key).await
    }
}

pub struct LiveDeploymentGroupController<C: ClusterClient> {
    cluster: C,
    settings: Settings,
}

impl<C: ClusterClient> LiveDeploymentGroupController<C> {
    pub fn new(cluster: C, settings: Settings) -> Arc<Self> {
        Arc::new(Self { cluster, settings })
    }

    async fn reconcile_group(&self, key: ObjectKey) -> ReconcileResult {
        let group: LiveDeploymentGroup = match cluster::get_as(&self.cluster, &key).await {
            Ok(group) => group,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e).context("fetching livedeploymentgroup"),
        };
        let Some(template) = &group.spec.template else {
            bail!("livedeploymentgroup {key} has no template");
        };

        let auth = template
            .spec
            .repository
            .resolve_auth(&self.cluster, &key.namespace)
            .await
            .context("failed to get auth method")?;
        let repo = GitRepository::init(
            self.settings.repo_dir.join(&key.namespace).join(&key.name),
            &template.spec.repository.url,
            auth,
        )
        .await
        .context("failed to init git repository")?;
        let branches = repo
            .list_branches(&group.spec.branch_match)
            .await
            .context("failed to list branches")?;

        let existing: Vec<LiveDeployment> = cluster::list_as(
            &self.cluster,
            &key.namespace,
            &group.live_deployment_labels(),
        )
        .await
        .context("listing livedeployments")?;

        for branch in &branches {
            if !existing.iter().any(|ld| &ld.spec.branch == branch) {
                let created =
                    cluster::create_as(&self.cluster, &group.live_deployment_for_branch(branch))
                        .await
                        .context("creating livedeployment")?;
                debug!("created livedeployment {} for branch {branch}", created.name_any());
            }
        }
        for deployment in &existing {
            if !branches.contains(&deployment.spec.branch) {
                self.cluster
                    .delete(
                        &cluster::gvk_of::<LiveDeployment>(),
                        &ObjectKey::new(
                            deployment.namespace().unwrap_or_default(),
                            deployment.name_any(),
                        ),
                    )
                    .await
                    .context("deleting livedeployment")?;
            }
        }

        Ok(poll_requeue(group.spec.poll_interval_seconds))
    }
}

impl<C: ClusterClient> Reconciler for LiveDeploymentGroupController<C> {
    async fn reconcile(&self, key: ObjectKey) -> ReconcileResult {
        self.reconcile_group(key).await
    }
}

#[cfg(test)]
mod tests {
    use googletest::prelude::*;
    use tempfile::TempDir;

    use super::*;
    use crate::api::{LiveDeploymentSpec, LiveDeploymentGroupSpec, LiveSpec, Repository};
    use crate::git::test_utils::TempRemote;
    use crate::testutil::FakeCluster;

    struct Fixture {
        cluster: FakeCluster,
        remote: TempRemote,
        settings: Settings,
        _cache_dir: TempDir,
    }

    async fn fixture() -> Fixture {
        let remote = TempRemote::new().await.unwrap();
        let cache_dir = TempDir::new().unwrap();
        Fixture {
            cluster: FakeCluster::new(),
            settings: Settings::new(cache_dir.path()),
            remote,
            _cache_dir: cache_dir,
        }
    }

    fn template(remote: &TempRemote) -> LiveTemplate {
        LiveTemplate {
            metadata: Default::default(),
            spec: LiveSpec {
                path: "deploy".to_owned(),
                repository: Repository {
                    url: remote.url(),
                    auth: None,
                },
                ..Default::default()
            },
        }
    }

    #[googletest::test]
    #[tokio::test]
    async fn test_live_deployment_tracks_branch_tip() {
        let fixture = fixture().await;
        let first = fixture
            .remote
            .commit_files(&[("deploy/a.txt", "1")], "first")
            .await
            .unwrap();

        let mut deployment = LiveDeployment::default();
        deployment.metadata.name = Some("app".to_owned());
        deployment.metadata.namespace = Some("prod".to_owned());
        deployment.spec = LiveDeploymentSpec {
            branch: "main".to_owned(),
            template: Some(template(&fixture.remote)),
            poll_interval_seconds: 4,
        };
        fixture.cluster.seed(cluster::to_dynamic(&deployment).unwrap());

        let controller =
            LiveDeploymentController::new(fixture.cluster.clone(), fixture.settings.clone());
        let key = ObjectKey::new("prod", "app");

        let requeue = controller.reconcile_deployment(key.clone()).await.unwrap();
        expect_that!(requeue, eq(Some(Duration::from_secs(5))));
        let child: Live = cluster::get_as(&fixture.cluster, &key).await.unwrap();
        expect_that!(child.spec.commit, eq(&first.to_string()));
        expect_that!(child.spec.path, eq("deploy"));
        let owner = &child.metadata.owner_references.as_ref().unwrap()[0];
        expect_that!(owner.kind, eq("LiveDeployment"));

        // The branch moves; the child follows on the next poll.
        let second = fixture
            .remote
            .commit_files(&[("deploy/a.txt", "2")], "second")
            .await
            .unwrap();
        controller.reconcile_deployment(key.clone()).await.unwrap();
        let child: Live = cluster::get_as(&fixture.cluster, &key).await.unwrap();
        expect_that!(child.spec.commit, eq(&second.to_string()));
    }

    #[googletest::test]
    #[tokio::test]
    async fn test_live_deployment_without_template_errors() {
        let fixture = fixture().await;
        let mut deployment = LiveDeployment::default();
        deployment.metadata.name = Some("app".to_owned());
        deployment.metadata.namespace = Some("prod".to_owned());
        fixture.cluster.seed(cluster::to_dynamic(&deployment).unwrap());

        let controller =
            LiveDeploymentController::new(fixture.cluster.clone(), fixture.settings.clone());
        expect_that!(
            controller
                .reconcile_deployment(ObjectKey::new("prod", "app"))
                .await,
            err(anything())
        );
    }

    #[googletest::test]
    #[tokio::test]
    async fn test_group_maintains_one_deployment_per_branch() {
        let fixture = fixture().await;
        fixture
            .remote
            .commit_files(&[("deploy/a.txt", "1")], "first")
            .await
            .unwrap();
        fixture.remote.branch("release/a").await.unwrap();
        fixture.remote.branch("release/b").await.unwrap();

        let mut group = LiveDeploymentGroup::default();
        group.metadata.name = Some("releases".to_owned());
        group.metadata.namespace = Some("prod".to_owned());
        group.spec = LiveDeploymentGroupSpec {
            branch_match: "^release/".to_owned(),
            template: Some(template(&fixture.remote)),
            poll_interval_seconds: 2,
        };
        fixture.cluster.seed(cluster::to_dynamic(&group).unwrap());

        let controller =
            LiveDeploymentGroupController::new(fixture.cluster.clone(), fixture.settings.clone());
        let key = ObjectKey::new("prod", "releases");

        let requeue = controller.reconcile_group(key.clone()).await.unwrap();
        expect_that!(requeue, eq(Some(Duration::from_secs(3))));
        let labels = group.live_deployment_labels();
        let deployments: Vec<LiveDeployment> =
            cluster::list_as(&fixture.cluster, "prod", &labels).await.unwrap();
        let mut branches: Vec<String> =
            deployments.iter().map(|d| d.spec.branch.clone()).collect();
        branches.sort();
        expect_that!(
            branches,
            eq(&vec!["release/a".to_owned(), "release/b".to_owned()])
        );
        for deployment in &deployments {
            expect_that!(deployment.name_any(), starts_with("releases-"));
            expect_that!(
                deployment.spec.template.as_ref().unwrap().spec.path,
                eq("deploy")
            );
        }

        // Reconciling again creates no duplicates.
        controller.reconcile_group(key.clone()).await.unwrap();
        let deployments: Vec<LiveDeployment> =
            cluster::list_as(&fixture.cluster, "prod", &labels).await.unwrap();
        expect_that!(deployments.len(), eq(2));

        // A deleted branch takes its LiveDeployment with it.
        fixture.remote.delete_branch("release/b").await.unwrap();
        controller.reconcile_group(key.clone()).await.unwrap();
        let deployments: Vec<LiveDeployment> =
            cluster::list_as(&fixture.cluster, "prod", &labels).await.unwrap();
        expect_that!(deployments.len(), eq(1));
        expect_that!(deployments[0].spec.branch, eq("release/a"));
    }
}
