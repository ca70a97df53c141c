//! Per-resource readiness, in the spirit of kstatus: given an applied object,
//! decide whether it has reached its terminal reconciled state, is still
//! getting there, or has failed. The apply engine's wait loop is built on
//! this.

use core::fmt;
use std::fmt::Display;

use kube::api::DynamicObject;
use serde_json::Value;

#[derive(Clone, PartialEq, Eq, Debug)]
pub enum ResourceStatus {
    /// The observed state matches the desired state.
    Current,
    /// Reconciliation is underway.
    InProgress(String),
    /// Terminal failure for this apply attempt.
    Failed(String),
}

impl Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => write!(f, "reconciled"),
            Self::InProgress(why) => write!(f, "in progress: {why}"),
            Self::Failed(why) => write!(f, "failed: {why}"),
        }
    }
}

// Container-level waiting reasons that will never resolve on their own.
const FATAL_WAITING_REASONS: &[&str] = &[
    "CrashLoopBackOff",
    "ErrImagePull",
    "ImagePullBackOff",
    "CreateContainerConfigError",
];

pub fn compute(obj: &DynamicObject) -> ResourceStatus {
    if obj.metadata.deletion_timestamp.is_some() {
        return ResourceStatus::InProgress("terminating".to_owned());
    }

    let status = &obj.data["status"];
    if status.is_null() {
        // Resources that don't report status reconcile on creation.
        return ResourceStatus::Current;
    }

    if let (Some(observed), Some(generation)) = (
        status["observedGeneration"].as_i64(),
        obj.metadata.generation,
    ) {
        if observed != generation {
            return ResourceStatus::InProgress(format!(
                "observed generation {observed} behind {generation}"
            ));
        }
    }

    if obj.types.as_ref().is_some_and(|t| t.kind == "Pod") {
        return pod_status(status);
    }

    generic_status(status)
}

fn pod_status(status: &Value) -> ResourceStatus {
    if let Some(reason) = fatal_container_reason(status) {
        return ResourceStatus::Failed(reason);
    }
    match status["phase"].as_str() {
        Some("Succeeded") => ResourceStatus::Current,
        Some("Failed") => ResourceStatus::Failed("pod failed".to_owned()),
        Some("Running") => {
            if condition_is(status, "Ready", "True") {
                ResourceStatus::Current
            } else {
                ResourceStatus::InProgress("pod running, not ready".to_owned())
            }
        }
        Some(phase) => ResourceStatus::InProgress(format!("pod phase {phase}")),
        None => ResourceStatus::InProgress("pod has no phase".to_owned()),
    }
}

fn fatal_container_reason(status: &Value) -> Option<String> {
    let containers = status["containerStatuses"].as_array()?;
    for container in containers {
        if let Some(reason) = container["state"]["waiting"]["reason"].as_str() {
            if FATAL_WAITING_REASONS.contains(&reason) {
                let name = container["name"].as_str().unwrap_or("<unnamed>");
                return Some(format!("container {name} waiting: {reason}"));
            }
        }
    }
    None
}

fn generic_status(status: &Value) -> ResourceStatus {
    let Some(conditions) = status["conditions"].as_array() else {
        return ResourceStatus::Current;
    };
    for condition in conditions {
        let type_ = condition["type"].as_str().unwrap_or_default();
        let condition_status = condition["status"].as_str().unwrap_or_default();
        match (type_, condition_status) {
            ("Failed", "True") => {
                let why = condition["message"]
                    .as_str()
                    .or(condition["reason"].as_str())
                    .unwrap_or("Failed condition");
                return ResourceStatus::Failed(why.to_owned());
            }
            ("Ready" | "Available", "True") => return ResourceStatus::Current,
            ("Ready" | "Available", _) => {
                let why = condition["reason"].as_str().unwrap_or("not ready");
                return ResourceStatus::InProgress(why.to_owned());
            }
            _ => {}
        }
    }
    ResourceStatus::Current
}

fn condition_is(status: &Value, type_: &str, want: &str) -> bool {
    status["conditions"]
        .as_array()
        .into_iter()
        .flatten()
        .any(|c| c["type"] == type_ && c["status"] == want)
}
