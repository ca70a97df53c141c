//! The `kuberik.io/v1alpha1` API group: `Live`, `LiveDeployment` and
//! `LiveDeploymentGroup`, plus the condition/phase logic the Live reconciler
//! drives.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::LocalObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, ObjectMeta, Time};
use kube::{CustomResource, Resource, ResourceExt as _};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::cluster::{self, ClusterClient, ObjectKey};
use crate::git::{CommitHash, GitAuth};

pub const GROUP: &str = "kuberik.io";
pub const VERSION: &str = "v1alpha1";

/// Finalizer deferring Live deletion until its resources are destroyed.
pub const LIVE_DESTROY_FINALIZER: &str = "kuberik.io/live-destroy";

/// Label tying a LiveDeployment to the LiveDeploymentGroup that created it.
pub const LIVE_DEPLOYMENT_GROUP_LABEL: &str = "kuberik.io/live-deployment-group";

pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_APPLY_RESULT: &str = "ApplyResult";

pub const REASON_APPLYING: &str = "Applying";
pub const REASON_SUCCEEDED: &str = "Succeeded";
pub const REASON_FAILED: &str = "Failed";
pub const REASON_APPLY_SUCCEEDED: &str = "ApplySucceeded";
pub const REASON_APPLY_FAILED: &str = "ApplyFailed";

/// Live deploys a single kustomize layer from a pinned commit in a git
/// repository. Users are expected to create Lives through a LiveDeployment or
/// LiveDeploymentGroup rather than directly.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "kuberik.io",
    version = "v1alpha1",
    kind = "Live",
    namespaced,
    status = "LiveStatus",
    shortname = "li",
    derive = "Default",
    printcolumn = r#"{"name":"Commit","type":"string","jsonPath":".spec.commit"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].reason"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LiveSpec {
    /// Relative path of the kustomize layer within the git repository.
    #[serde(default)]
    pub path: String,

    /// Commit of the git repository that will be checked out to deploy the
    /// kustomize layer from.
    #[serde(default)]
    pub commit: String,

    /// Git repository containing the kustomize layer that needs to be
    /// deployed.
    #[serde(default)]
    pub repository: Repository,

    /// Whether the Live can be updated while an apply for it is still
    /// running.
    #[serde(default)]
    pub interruptible: bool,

    /// Path, relative to the repository root, of a kustomize transformer
    /// layer applied on top of the deployed layer. The Live object itself is
    /// injected into the build annotated with
    /// `config.kubernetes.io/local-config=true` so transformers (most notably
    /// the builtin ReplacementTransformer) can read its fields, e.g. the git
    /// commit hash.
    #[serde(default)]
    pub transformers: String,

    /// Name of the ServiceAccount used for deploying the resources.
    #[serde(default)]
    pub service_account_name: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LiveStatus {
    /// Conditions describing the observed state of the Live.
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Consecutive failed applies since the last generation change.
    #[serde(default)]
    pub retries: i64,
}

/// Where a git repository lives and how to authenticate against it.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    /// URL of the git repository.
    #[serde(default)]
    pub url: String,

    /// Authentication configuration for the git repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<RepositoryAuth>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryAuth {
    /// Reference to a Secret containing a `token` field holding a git token
    /// with permission to read the repository.
    #[serde(default)]
    pub secret_ref: LocalObjectReference,
}

pub const AUTH_SECRET_TOKEN_FIELD: &str = "token";

impl Repository {
    // Resolves the referenced Secret into git credentials. The token is used
    // as an HTTPS basic-auth password; the username just has to be non-empty.
    pub async fn resolve_auth<C: ClusterClient>(
        &self,
        cluster: &C,
        namespace: &str,
    ) -> anyhow::Result<Option<GitAuth>> {
        let Some(auth) = &self.auth else {
            return Ok(None);
        };
        let name = auth.secret_ref.name.clone().unwrap_or_default();
        let secret: k8s_openapi::api::core::v1::Secret =
            cluster::get_as(cluster, &ObjectKey::new(namespace, &name)).await?;
        let token = secret
            .data
            .as_ref()
            .and_then(|data| data.get(AUTH_SECRET_TOKEN_FIELD))
            .ok_or_else(|| {
                anyhow::anyhow!("no credentials found in secret {namespace}/{name}")
            })?;
        Ok(Some(GitAuth {
            username: "dummy".to_owned(),
            password: String::from_utf8(token.0.clone())
                .map_err(|_| anyhow::anyhow!("token in secret {namespace}/{name} is not utf-8"))?,
        }))
    }
}

/// Phase the Live reconciliation is entering. Succeeded and Failed carry the
/// apply engine's report, which lands in the ApplyResult condition.
#[derive(Clone, Debug)]
pub enum LivePhase {
    Applying,
    Succeeded { report: String },
    Failed { error: String },
}

const BACKOFF_BASE: Duration = Duration::from_secs(2);
const BACKOFF_CAP: Duration = Duration::from_secs(5 * 60);

/// Delay gating the n-th retry: 2s, 4s, 8s, ... capped at 5 minutes.
/// Zero retries means no delay.
pub fn retry_delay(retries: i64) -> Duration {
    if retries <= 0 {
        return Duration::ZERO;
    }
    // Clamp the exponent; past 2s<<8 we're saturated at the cap anyway.
    let exp = (retries - 1).min(8) as u32;
    (BACKOFF_BASE * 2u32.pow(exp)).min(BACKOFF_CAP)
}

impl Live {
    pub fn ready_condition(&self) -> Option<&Condition> {
        find_condition(self.conditions(), CONDITION_READY)
    }

    fn conditions(&self) -> &[Condition] {
        self.status
            .as_ref()
            .map(|s| s.conditions.as_slice())
            .unwrap_or_default()
    }

    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or_default()
    }

    /// A Live is reconciled when the commit it currently pins has been
    /// applied: Ready is True and observed the current generation.
    pub fn reconciled(&self) -> bool {
        self.ready_condition().is_some_and(|c| {
            c.status == "True" && c.observed_generation == Some(self.generation())
        })
    }

    pub fn is_applying(&self) -> bool {
        self.ready_condition()
            .is_some_and(|c| c.reason == REASON_APPLYING)
    }

    pub fn can_interrupt(&self) -> bool {
        self.spec.interruptible || !self.is_applying()
    }

    /// Stable identifier tagging every resource applied for this Live.
    pub fn inventory_id(&self) -> String {
        self.metadata.uid.clone().unwrap_or_default()
    }

    pub fn namespaced_name(&self) -> ObjectKey {
        ObjectKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    pub fn service_account_name(&self) -> &str {
        if self.spec.service_account_name.is_empty() {
            "default"
        } else {
            &self.spec.service_account_name
        }
    }

    pub fn retries(&self) -> i64 {
        self.status.as_ref().map(|s| s.retries).unwrap_or_default()
    }

    pub fn set_phase(&mut self, phase: LivePhase) {
        let generation = self.metadata.generation.unwrap_or_default();
        let status = self.status.get_or_insert_with(Default::default);
        match phase {
            LivePhase::Applying => {
                // First Applying for a new generation starts from a clean
                // slate; retries within a generation keep their history.
                let same_generation = find_condition(&status.conditions, CONDITION_READY)
                    .is_some_and(|c| c.observed_generation == Some(generation));
                if !same_generation {
                    status.conditions.clear();
                    status.retries = 0;
                }
                set_condition(
                    &mut status.conditions,
                    Condition {
                        type_: CONDITION_READY.to_owned(),
                        status: "False".to_owned(),
                        reason: REASON_APPLYING.to_owned(),
                        message: "applying the resources".to_owned(),
                        observed_generation: Some(generation),
                        last_transition_time: Time(Utc::now()),
                    },
                );
            }
            LivePhase::Succeeded { report } => {
                set_condition(
                    &mut status.conditions,
                    Condition {
                        type_: CONDITION_READY.to_owned(),
                        status: "True".to_owned(),
                        reason: REASON_SUCCEEDED.to_owned(),
                        message: "apply complete".to_owned(),
                        observed_generation: Some(generation),
                        last_transition_time: Time(Utc::now()),
                    },
                );
                set_condition(
                    &mut status.conditions,
                    Condition {
                        type_: CONDITION_APPLY_RESULT.to_owned(),
                        status: "True".to_owned(),
                        reason: REASON_APPLY_SUCCEEDED.to_owned(),
                        message: report,
                        observed_generation: Some(generation),
                        last_transition_time: Time(Utc::now()),
                    },
                );
            }
            LivePhase::Failed { error } => {
                status.retries += 1;
                let delay = retry_delay(status.retries);
                set_condition(
                    &mut status.conditions,
                    Condition {
                        type_: CONDITION_READY.to_owned(),
                        status: "False".to_owned(),
                        reason: REASON_FAILED.to_owned(),
                        message: format!("back-off {delay:?} failed to apply the resources"),
                        observed_generation: Some(generation),
                        last_transition_time: Time(Utc::now()),
                    },
                );
                set_condition(
                    &mut status.conditions,
                    Condition {
                        type_: CONDITION_APPLY_RESULT.to_owned(),
                        status: "False".to_owned(),
                        reason: REASON_APPLY_FAILED.to_owned(),
                        message: error,
                        observed_generation: Some(generation),
                        last_transition_time: Time(Utc::now()),
                    },
                );
            }
        }
    }

    /// Time left until the backoff gate opens, measured against the Ready
    /// condition's last transition.
    pub fn backoff_remaining_at(&self, now: DateTime<Utc>) -> Duration {
        let Some(condition) = self.ready_condition() else {
            return Duration::ZERO;
        };
        let delay = retry_delay(self.retries());
        let elapsed = (now - condition.last_transition_time.0)
            .to_std()
            .unwrap_or_default();
        delay.saturating_sub(elapsed)
    }

    pub fn backoff_remaining(&self) -> Duration {
        self.backoff_remaining_at(Utc::now())
    }
}

/// LiveDeployment keeps a Live tracking the tip of a branch, re-resolving the
/// branch head on a poll interval.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "kuberik.io",
    version = "v1alpha1",
    kind = "LiveDeployment",
    namespaced,
    shortname = "ld",
    derive = "Default",
    printcolumn = r#"{"name":"Branch","type":"string","jsonPath":".spec.branch"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct LiveDeploymentSpec {
    /// Branch of the git repository that will be continuously deployed.
    #[serde(default)]
    pub branch: String,

    /// Template of the managed Live resource.
    pub template: Option<LiveTemplate>,

    /// Seconds between pollings of the git repository.
    #[serde(default)]
    pub poll_interval_seconds: i64,
}

/// Template for a Live created by a LiveDeployment or LiveDeploymentGroup.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct LiveTemplate {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: LiveSpec,
}

impl LiveDeployment {
    /// The child Live deploying `commit`, named after this LiveDeployment and
    /// owner-referenced to it.
    pub fn live_for_commit(&self, commit: &CommitHash) -> Live {
        let template = self.spec.template.clone().unwrap_or_default();
        let mut metadata = template.metadata;
        metadata.name = Some(self.name_any());
        metadata.namespace = self.namespace();
        metadata.owner_references = self.controller_owner_ref(&()).map(|r| vec![r]);
        let mut spec = template.spec;
        spec.commit = commit.to_string();
        Live {
            metadata,
            spec,
            status: None,
        }
    }
}

/// LiveDeploymentGroup maintains one LiveDeployment per branch matching a
/// regex, deploying each from the same path of the repository.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(
    group = "kuberik.io",
    version = "v1alpha1",
    kind = "LiveDeploymentGroup",
    namespaced,
    derive = "Default"
)]
#[serde(rename_all = "camelCase")]
pub struct LiveDeploymentGroupSpec {
    /// Regex matched against branch names to pick the branches that will be
    /// deployed.
    #[serde(default)]
    pub branch_match: String,

    /// Template of the managed Live resources.
    pub template: Option<LiveTemplate>,

    /// Seconds between pollings of the git repository.
    #[serde(default)]
    pub poll_interval_seconds: i64,
}

impl LiveDeploymentGroup {
    pub fn live_deployment_for_branch(&self, branch: &str) -> LiveDeployment {
        LiveDeployment {
            metadata: ObjectMeta {
                generate_name: Some(format!("{}-", self.name_any())),
                namespace: self.namespace(),
                owner_references: self.controller_owner_ref(&()).map(|r| vec![r]),
                labels: Some(self.live_deployment_labels()),
                ..Default::default()
            },
            spec: LiveDeploymentSpec {
                branch: branch.to_owned(),
                template: self.spec.template.clone(),
                poll_interval_seconds: self.spec.poll_interval_seconds,
            },
        }
    }

    pub fn live_deployment_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(LIVE_DEPLOYMENT_GROUP_LABEL.to_owned(), self.name_any())])
    }
}

pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

// Same contract as apimachinery's SetStatusCondition: replace the condition
// of the same type, keeping the previous transition time when the status
// didn't change.
pub fn set_condition(conditions: &mut Vec<Condition>, mut condition: Condition) {
    match conditions.iter_mut().find(|c| c.type_ == condition.type_) {
        Some(existing) => {
            if existing.status == condition.status {
                condition.last_transition_time = existing.last_transition_time.clone();
            }
            *existing = condition;
        }
        None => conditions.push(condition),
    }
}
