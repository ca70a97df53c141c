use std::path::PathBuf;
use std::time::Duration;

use schemars::JsonSchema;
use serde::Deserialize;

use crate::apply::ApplyOptions;

/// Controller settings. Embedders deserialize this from whatever
/// configuration surface they expose; everything but the cache root has a
/// default.
#[derive(Deserialize, JsonSchema, Debug, Clone)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Root directory of the per-Live git caches; state under it survives
    /// controller restarts.
    pub repo_dir: PathBuf,
    /// Upper bound on concurrently reconciling objects.
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_reconcile_timeout_s")]
    /// How long an apply waits for its resources to reconcile.
    pub reconcile_timeout_s: u64,
    #[serde(default = "default_prune_timeout_s")]
    /// How long an apply or destroy waits for deleted resources to go away.
    pub prune_timeout_s: u64,
    #[serde(default = "default_status_poll_interval_ms")]
    /// Cadence of cluster status polls while waiting on an apply.
    pub status_poll_interval_ms: u64,
}

fn default_workers() -> usize {
    8
}

fn default_reconcile_timeout_s() -> u64 {
    5 * 60
}

fn default_prune_timeout_s() -> u64 {
    2 * 60
}

fn default_status_poll_interval_ms() -> u64 {
    500
}

impl Settings {
    pub fn new(repo_dir: impl Into<PathBuf>) -> Self {
        Self {
            repo_dir: repo_dir.into(),
            workers: default_workers(),
            reconcile_timeout_s: default_reconcile_timeout_s(),
            prune_timeout_s: default_prune_timeout_s(),
            status_poll_interval_ms: default_status_poll_interval_ms(),
        }
    }

    pub fn apply_options(&self) -> ApplyOptions {
        ApplyOptions {
            reconcile_timeout: Duration::from_secs(self.reconcile_timeout_s),
            prune_timeout: Duration::from_secs(self.prune_timeout_s),
            poll_interval: Duration::from_millis(self.status_poll_interval_ms),
        }
    }
}
