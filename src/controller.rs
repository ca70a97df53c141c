//! The reconcile loop. A [`Runner`] multiplexes three event sources into one
//! rate-limited queue - external watch events, worker completion wake-ups and
//! delayed requeues - and guarantees at most one in-flight reconcile per
//! `(namespace, name)` key. [`LiveController`] is the Live reconciler proper:
//! it owns the in-flight apply/destroy result slots and drives the state
//! machine in [`crate::api`].

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context as _};
use futures::future::poll_fn;
use kube::ResourceExt as _;
#[allow(unused_imports)]
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::time::DelayQueue;

use crate::api::{Live, LivePhase, LIVE_DESTROY_FINALIZER, REASON_FAILED};
use crate::apply::{ApplyOptions, Engine};
use crate::cluster::{self, ClusterClient, ObjectKey};
use crate::config::Settings;
use crate::git::{CommitHash, GitRepository};
use crate::kustomize::{Layer, LocalConfigTransformOverlay};
use crate::resources::LiveApply;
use crate::util::ResultExt as _;
use crate::vfs::DiskFs;

/// Outcome of one reconcile pass: optionally ask to be re-run after a delay.
pub type ReconcileResult = anyhow::Result<Option<Duration>>;

pub trait Reconciler: Send + Sync + 'static {
    fn reconcile(&self, key: ObjectKey) -> impl Future<Output = ReconcileResult> + Send;
}

/// Runs a [`Reconciler`] over a stream of keys with a bounded worker pool.
/// Keys are deduplicated while queued and serialised while in flight; a key
/// reported again mid-reconcile runs once more after the current pass.
pub struct Runner<R> {
    reconciler: Arc<R>,
    workers: usize,
    events: mpsc::UnboundedReceiver<ObjectKey>,
}

impl<R: Reconciler> Runner<R> {
    pub fn new(
        reconciler: Arc<R>,
        workers: usize,
        events: mpsc::UnboundedReceiver<ObjectKey>,
    ) -> Self {
        Self {
            reconciler,
            workers: workers.max(1),
            events,
        }
    }

    pub async fn run(mut self, ct: CancellationToken) {
        let mut queue: VecDeque<ObjectKey> = VecDeque::new();
        let mut queued: HashSet<ObjectKey> = HashSet::new();
        let mut in_progress: HashSet<ObjectKey> = HashSet::new();
        let mut delayed: DelayQueue<ObjectKey> = DelayQueue::new();
        let mut tasks: JoinSet<(ObjectKey, ReconcileResult)> = JoinSet::new();
        let mut error_streaks: HashMap<ObjectKey, u32> = HashMap::new();

        let enqueue = |key: ObjectKey, queue: &mut VecDeque<ObjectKey>, queued: &mut HashSet<ObjectKey>| {
            if queued.insert(key.clone()) {
                queue.push_back(key);
            }
        };

        loop {
            // Dispatch whatever the worker budget allows. Keys whose previous
            // pass is still running stay queued until it finishes.
            let mut kept_back = VecDeque::new();
            while tasks.len() < self.workers {
                let Some(key) = queue.pop_front() else { break };
                if in_progress.contains(&key) {
                    kept_back.push_back(key);
                    continue;
                }
                queued.remove(&key);
                in_progress.insert(key.clone());
                let reconciler = self.reconciler.clone();
                tasks.spawn(async move {
                    let result = reconciler.reconcile(key.clone()).await;
                    (key, result)
                });
            }
            kept_back.extend(queue.drain(..));
            queue = kept_back;

            // Handlers may not touch `delayed` or `tasks` while the select
            // borrows them, so those effects are applied after it resolves.
            let mut requeue_after: Option<(ObjectKey, Duration)> = None;
            let mut shutdown = false;
            tokio::select! {
                _ = ct.cancelled() => {
                    debug!("reconcile runner shutting down");
                    shutdown = true;
                }
                maybe_key = self.events.recv() => {
                    match maybe_key {
                        Some(key) => enqueue(key, &mut queue, &mut queued),
                        None => shutdown = true,
                    }
                }
                Some(expired) = poll_fn(|cx| delayed.poll_expired(cx)), if !delayed.is_empty() => {
                    enqueue(expired.into_inner(), &mut queue, &mut queued);
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    let (key, result) = joined.expect("reconcile task panicked");
                    in_progress.remove(&key);
                    match result {
                        Ok(None) => {
                            error_streaks.remove(&key);
                        }
                        Ok(Some(delay)) => {
                            error_streaks.remove(&key);
                            if delay.is_zero() {
                                enqueue(key, &mut queue, &mut queued);
                            } else {
                                requeue_after = Some((key, delay));
                            }
                        }
                        Err(e) => {
                            error!("reconciling {key}: {e:#}");
                            let streak = error_streaks.entry(key.clone()).or_insert(0);
                            *streak = streak.saturating_add(1);
                            requeue_after = Some((key, error_requeue_delay(*streak)));
                        }
                    }
                }
            }
            if shutdown {
                tasks.shutdown().await;
                return;
            }
            if let Some((key, delay)) = requeue_after {
                delayed.insert(key, delay);
            }
        }
    }
}

// Work-queue style rate limit for keys whose reconcile keeps erroring:
// 5ms doubling up to 30s.
fn error_requeue_delay(streak: u32) -> Duration {
    let exp = streak.saturating_sub(1).min(13);
    Duration::from_millis(5u64 << exp).min(Duration::from_secs(30))
}

type ResultSlot = mpsc::Receiver<anyhow::Result<String>>;
type ResultSlots = Mutex<HashMap<ObjectKey, ResultSlot>>;

enum SlotState {
    /// No worker was ever started for this key.
    Vacant,
    /// A worker is running, no result yet.
    Pending,
    Ready(anyhow::Result<String>),
    /// The worker died without delivering a result.
    Gone,
}

fn poll_result_slot(slots: &ResultSlots, key: &ObjectKey) -> SlotState {
    let mut slots = slots.lock();
    match slots.get_mut(key) {
        None => SlotState::Vacant,
        Some(rx) => match rx.try_recv() {
            Ok(result) => SlotState::Ready(result),
            Err(mpsc::error::TryRecvError::Empty) => SlotState::Pending,
            Err(mpsc::error::TryRecvError::Disconnected) => SlotState::Gone,
        },
    }
}

// Makes a pre-completed slot. Used both to install fresh workers' slots and
// to put a result back when status persistence fails - the side-effecting
// work must not be replayed just because a write-back lost a race.
fn stuff_result_slot(slots: &ResultSlots, key: &ObjectKey, result: anyhow::Result<String>) {
    let (tx, rx) = mpsc::channel(1);
    tx.try_send(result).expect("stuffing a fresh result slot");
    slots.lock().insert(key.clone(), rx);
}

/// The Live reconciler.
pub struct LiveController<C: ClusterClient> {
    cluster: C,
    settings: Settings,
    apply_options: ApplyOptions,
    apply_results: ResultSlots,
    destroy_results: ResultSlots,
    wakeups: mpsc::UnboundedSender<ObjectKey>,
    resource_group_installed: tokio::sync::OnceCell<()>,
}

impl<C: ClusterClient> LiveController<C> {
    /// Builds the controller and the runner that drives it. The runner's
    /// queue is fed by worker wake-ups internally; the embedder additionally
    /// wires its Live watch into [`LiveController::enqueue`].
    pub fn new(cluster: C, settings: Settings) -> (Arc<Self>, Runner<Self>) {
        let (wakeups, events) = mpsc::unbounded_channel();
        let controller = Arc::new(Self {
            cluster,
            apply_options: settings.apply_options(),
            apply_results: Mutex::default(),
            destroy_results: Mutex::default(),
            wakeups,
            resource_group_installed: tokio::sync::OnceCell::new(),
            settings,
        });
        let runner = Runner::new(controller.clone(), controller.settings.workers, events);
        (controller, runner)
    }

    /// Feeds a key into the reconcile queue, e.g. from a watch event.
    pub fn enqueue(&self, key: ObjectKey) {
        self.wakeups
            .send(key)
            .or_log_error("enqueueing into closed runner");
    }

    async fn reconcile_live(&self, key: ObjectKey) -> ReconcileResult {
        debug!("reconciling live {key}");
        let live: Live = match cluster::get_as(&self.cluster, &key).await {
            Ok(live) => live,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e).context("fetching live resource"),
        };

        if live.metadata.deletion_timestamp.is_none()
            && !live.finalizers().iter().any(|f| f == LIVE_DESTROY_FINALIZER)
        {
            let mut live = live;
            live.metadata
                .finalizers
                .get_or_insert_with(Vec::new)
                .push(LIVE_DESTROY_FINALIZER.to_owned());
            cluster::update_as(&self.cluster, &live)
                .await
                .context("failed to set finalizers")?;
            // The next pass picks up from the finalized object.
            return Ok(Some(Duration::ZERO));
        }

        if !live.reconciled() {
            return self.reconcile_apply(&key, live).await;
        }
        if live.metadata.deletion_timestamp.is_some() {
            return self.reconcile_delete(&key, live).await;
        }
        Ok(None)
    }

    async fn reconcile_apply(&self, key: &ObjectKey, live: Live) -> ReconcileResult {
        match poll_result_slot(&self.apply_results, key) {
            SlotState::Pending => return Ok(None),
            SlotState::Ready(result) => return self.finish_apply(key, live, result).await,
            SlotState::Gone => {
                self.apply_results.lock().remove(key);
                bail!("apply worker for {key} disappeared without a result");
            }
            SlotState::Vacant => {}
        }

        // A failed apply only gets retried once its backoff expires.
        if live
            .ready_condition()
            .is_some_and(|c| c.reason == REASON_FAILED)
        {
            let remaining = live.backoff_remaining();
            if remaining > Duration::ZERO {
                return Ok(Some(remaining));
            }
        }

        let commit =
            CommitHash::parse(&live.spec.commit).context("invalid commit in live spec")?;
        let auth = live
            .spec
            .repository
            .resolve_auth(&self.cluster, &key.namespace)
            .await
            .context("failed to get auth method")?;
        let repo = GitRepository::init(
            self.settings.repo_dir.join(&key.namespace).join(&key.name),
            &live.spec.repository.url,
            auth,
        )
        .await
        .context("failed to init git repository")?;
        repo.fetch_commit(&commit)
            .await
            .context("failed to fetch commit")?;
        let commit_dir = repo
            .materialise_commit(&commit)
            .await
            .context("failed to materialise commit")?;

        let base = Layer::new(Arc::new(DiskFs), commit_dir.join(&live.spec.path));
        let layer = if live.spec.transformers.is_empty() {
            base
        } else {
            LocalConfigTransformOverlay {
                base,
                local_config: &live,
                transformers: commit_dir.join(&live.spec.transformers),
            }
            .create_layer()
            .context("failed to create transform overlay")?
        };
        // Render failures are setup failures: no Failed transition, the
        // error just surfaces to the work queue.
        let rendered = layer.build().context("kustomize build failed")?;

        self.resource_group_installed
            .get_or_try_init(|| async {
                Engine::new(self.cluster.clone()).install_resource_group().await
            })
            .await
            .context("failed to install resource group")?;

        let apply_set = LiveApply::new(&live, rendered)?;
        let mut engine = Engine::new(self.cluster.clone());
        engine.impersonate_for_resources(&ObjectKey::new(
            &key.namespace,
            live.service_account_name(),
        ))?;

        let mut live = live;
        live.set_phase(LivePhase::Applying);
        cluster::update_status_as(&self.cluster, &live)
            .await
            .context("failed to set state to applying")?;

        let (tx, rx) = mpsc::channel(1);
        self.apply_results.lock().insert(key.clone(), rx);
        let wakeups = self.wakeups.clone();
        let options = self.apply_options.clone();
        let worker_key = key.clone();
        tokio::spawn(async move {
            let result = engine.apply(&apply_set, &options).await;
            tx.send(result)
                .await
                .or_log_error("delivering apply result");
            wakeups
                .send(worker_key)
                .or_log_error("emitting apply completion event");
        });
        Ok(None)
    }

    async fn finish_apply(
        &self,
        key: &ObjectKey,
        mut live: Live,
        result: anyhow::Result<String>,
    ) -> ReconcileResult {
        let failed = result.is_err();
        match &result {
            Ok(report) => {
                live.set_phase(LivePhase::Succeeded {
                    report: report.clone(),
                });
            }
            Err(e) => {
                live.set_phase(LivePhase::Failed {
                    error: format!("{e:#}"),
                });
            }
        }
        if let Err(persist_err) = cluster::update_status_as(&self.cluster, &live).await {
            stuff_result_slot(&self.apply_results, key, result);
            return Err(persist_err).context("persisting apply outcome");
        }
        self.apply_results.lock().remove(key);
        if failed {
            Ok(Some(live.backoff_remaining()))
        } else {
            Ok(None)
        }
    }

    async fn reconcile_delete(&self, key: &ObjectKey, live: Live) -> ReconcileResult {
        if !self.destroy_results.lock().contains_key(key) {
            let mut engine = Engine::new(self.cluster.clone());
            engine.impersonate_for_resources(&ObjectKey::new(
                &key.namespace,
                live.service_account_name(),
            ))?;
            let (tx, rx) = mpsc::channel(1);
            self.destroy_results.lock().insert(key.clone(), rx);
            let wakeups = self.wakeups.clone();
            let options = self.apply_options.clone();
            let inventory_id = live.inventory_id();
            let worker_key = key.clone();
            tokio::spawn(async move {
                let result = engine.destroy(&worker_key, &inventory_id, &options).await;
                tx.send(result)
                    .await
                    .or_log_error("delivering destroy result");
                wakeups
                    .send(worker_key)
                    .or_log_error("emitting destroy completion event");
            });
            return Ok(None);
        }

        match poll_result_slot(&self.destroy_results, key) {
            SlotState::Vacant | SlotState::Pending => Ok(None),
            SlotState::Gone => {
                self.destroy_results.lock().remove(key);
                bail!("destroy worker for {key} disappeared without a result");
            }
            SlotState::Ready(Err(e)) => {
                // Keep the finalizer; the destroy is retried on the next
                // pass.
                self.destroy_results.lock().remove(key);
                Err(e).context("destroying resources")
            }
            SlotState::Ready(Ok(report)) => {
                let mut live = live;
                if let Some(finalizers) = &mut live.metadata.finalizers {
                    finalizers.retain(|f| f != LIVE_DESTROY_FINALIZER);
                }
                if let Err(persist_err) = cluster::update_as(&self.cluster, &live).await {
                    stuff_result_slot(&self.destroy_results, key, Ok(report));
                    return Err(persist_err).context("removing destroy finalizer");
                }
                self.destroy_results.lock().remove(key);
                debug!("destroyed {key}: {report}");
                Ok(None)
            }
        }
    }
}

impl<C: ClusterClient> Reconciler for LiveController<C> {
    async fn reconcile(&self, key: ObjectKey) -> ReconcileResult {
        self.reconcile_live(key).await
    }
}
