//! Apply orchestrator
//!
//! Walks an [`InstallationPlan`] and drives the cluster toward it: renders
//! each resource through the manifest catalog, applies it through the
//! cluster client, waits for the readiness its dependents require, and
//! records every outcome in the reconciliation state store.
//!
//! The orchestrator is deliberately schema-agnostic: it never looks inside
//! a rendered document. Idempotence comes from content hashing — re-running
//! against an already-converged cluster performs zero mutating calls.
//!
//! # Scheduling
//!
//! The plan is a DAG, not a chain: resources whose prerequisites are all
//! satisfied apply concurrently through a bounded worker pool (default 4).
//! A resource is never applied before every resource it depends on has
//! reached the readiness its edge requires. Cancellation stops dispatching
//! new applies but lets in-flight cluster calls complete, so an
//! interrupted run is safely resumable.

mod report;

pub use report::{Outcome, RunReport, StepReport};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::catalog::{Document, ManifestCatalog};
use crate::cluster::{ClusterClient, ObservedStatus};
use crate::graph::{InstallationPlan, Readiness, ResourceKey, ResourceSpec};
use crate::retry::{retry_transient, RetryPolicy};
use crate::state::{AppliedResource, ResourcePhase, StateStore};

/// What to do with the rest of the plan when a step fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Stop dispatching on the first `Failed`/`TimedOut` outcome and
    /// report the remaining steps as skipped. Default for first install.
    FailFast,
    /// Keep applying independent branches; skip only the subtree that
    /// depended on the failed resource. Default for reconcile/upgrade.
    BestEffort,
}

/// Tuning for one orchestrator instance.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    /// Failure policy for the run
    pub policy: FailurePolicy,
    /// Backoff policy for transient cluster errors
    pub retry: RetryPolicy,
    /// Maximum concurrent apply workers
    pub concurrency: usize,
    /// Default budget for readiness polling
    pub readiness_timeout: Duration,
    /// Per-kind readiness budget overrides. CRDs establish in seconds;
    /// stateful daemons may need minutes.
    pub kind_timeouts: HashMap<String, Duration>,
    /// Interval between readiness polls
    pub poll_interval: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            policy: FailurePolicy::FailFast,
            retry: RetryPolicy::default(),
            concurrency: crate::DEFAULT_APPLY_CONCURRENCY,
            readiness_timeout: crate::DEFAULT_READINESS_TIMEOUT,
            kind_timeouts: HashMap::new(),
            poll_interval: crate::DEFAULT_POLL_INTERVAL,
        }
    }
}

impl OrchestratorConfig {
    /// Defaults for a first installation: fail fast
    pub fn install() -> Self {
        Self::default()
    }

    /// Defaults for an upgrade/reconcile pass: best effort
    pub fn reconcile() -> Self {
        Self {
            policy: FailurePolicy::BestEffort,
            ..Self::default()
        }
    }

    /// Override the readiness budget for one kind
    pub fn with_kind_timeout(mut self, kind: impl Into<String>, timeout: Duration) -> Self {
        self.kind_timeouts.insert(kind.into(), timeout);
        self
    }
}

/// Drives installation plans against a cluster.
#[derive(Clone, Debug)]
pub struct Orchestrator {
    config: OrchestratorConfig,
}

impl Orchestrator {
    /// Create an orchestrator with the given configuration
    pub fn new(config: OrchestratorConfig) -> Self {
        Self { config }
    }

    fn kind_timeout(&self, kind: &str) -> Duration {
        self.config
            .kind_timeouts
            .get(kind)
            .copied()
            .unwrap_or(self.config.readiness_timeout)
    }

    /// Execute a plan to completion (or abort, per the failure policy).
    ///
    /// Equivalent to [`Orchestrator::run_with_cancel`] with a token that
    /// is never cancelled.
    pub async fn run(
        &self,
        plan: &InstallationPlan,
        catalog: Arc<dyn ManifestCatalog>,
        cluster: Arc<dyn ClusterClient>,
        state: Arc<dyn StateStore>,
    ) -> RunReport {
        self.run_with_cancel(plan, catalog, cluster, state, CancellationToken::new())
            .await
    }

    /// Execute a plan with a run-scoped cancellation signal.
    ///
    /// Cancelling stops dispatching new applies immediately; in-flight
    /// cluster calls complete and their state is persisted, so the run
    /// can be resumed by a later invocation.
    pub async fn run_with_cancel(
        &self,
        plan: &InstallationPlan,
        catalog: Arc<dyn ManifestCatalog>,
        cluster: Arc<dyn ClusterClient>,
        state: Arc<dyn StateStore>,
        cancel: CancellationToken,
    ) -> RunReport {
        let n = plan.len();
        info!(
            resources = n,
            policy = ?self.config.policy,
            concurrency = self.config.concurrency,
            "starting orchestration run"
        );

        let mut outcomes: Vec<Option<(Outcome, Duration)>> = (0..n).map(|_| None).collect();
        let mut dispatched = vec![false; n];
        let mut satisfied = vec![false; n];
        let mut aborted = false;
        let mut tasks: JoinSet<(usize, Outcome, Duration)> = JoinSet::new();
        let mut inflight: HashMap<tokio::task::Id, usize> = HashMap::new();

        loop {
            if aborted || cancel.is_cancelled() {
                let reason = if cancel.is_cancelled() {
                    "run cancelled"
                } else {
                    "run aborted"
                };
                for i in 0..n {
                    if !dispatched[i] && outcomes[i].is_none() {
                        outcomes[i] = Some((Outcome::Skipped(reason.to_string()), Duration::ZERO));
                        dispatched[i] = true;
                    }
                }
            } else {
                // Dispatch every frontier resource the pool has room for,
                // in plan order.
                for i in 0..n {
                    if tasks.len() >= self.config.concurrency {
                        break;
                    }
                    if dispatched[i] {
                        continue;
                    }
                    if !plan.prerequisites(i).iter().all(|&(p, _)| satisfied[p]) {
                        continue;
                    }
                    dispatched[i] = true;
                    let spec = plan.specs()[i].clone();
                    debug!(key = %spec.key, "dispatching apply step");
                    let handle = tasks.spawn(execute_step(StepContext {
                        index: i,
                        required: plan.required_readiness(i),
                        readiness_timeout: self.kind_timeout(&spec.key.kind),
                        spec,
                        catalog: catalog.clone(),
                        cluster: cluster.clone(),
                        state: state.clone(),
                        retry: self.config.retry.clone(),
                        poll_interval: self.config.poll_interval,
                        cancel: cancel.clone(),
                    }));
                    inflight.insert(handle.id(), i);
                }
            }

            if tasks.is_empty() {
                let blocked: Vec<usize> = (0..n).filter(|&i| outcomes[i].is_none()).collect();
                if blocked.is_empty() {
                    break;
                }
                // Nothing in flight and nothing dispatchable: everything
                // left is downstream of a failed or skipped prerequisite.
                for i in blocked {
                    let reason = blocking_reason(plan, i, &outcomes);
                    outcomes[i] = Some((Outcome::Skipped(reason), Duration::ZERO));
                    dispatched[i] = true;
                }
                continue;
            }

            tokio::select! {
                _ = cancel.cancelled(), if !cancel.is_cancelled() => continue,
                joined = tasks.join_next_with_id() => {
                    let completed = match joined {
                        Some(Ok((id, (i, outcome, duration)))) => {
                            inflight.remove(&id);
                            Some((i, outcome, duration))
                        }
                        // A panicked worker is a step failure, not a gap
                        // in the report.
                        Some(Err(e)) => {
                            error!(error = %e, "apply worker panicked");
                            inflight.remove(&e.id()).map(|i| {
                                (
                                    i,
                                    Outcome::Failed(format!("apply worker panicked: {}", e)),
                                    Duration::ZERO,
                                )
                            })
                        }
                        None => None,
                    };
                    if let Some((i, outcome, duration)) = completed {
                        satisfied[i] = outcome.satisfies_dependents();
                        if outcome.is_failure() {
                            warn!(key = %plan.specs()[i].key, outcome = %outcome, "apply step failed");
                            match self.config.policy {
                                FailurePolicy::FailFast => aborted = true,
                                FailurePolicy::BestEffort => {
                                    let failed_key = plan.specs()[i].key.clone();
                                    for d in plan.transitive_dependents(i) {
                                        if !dispatched[d] && outcomes[d].is_none() {
                                            outcomes[d] = Some((
                                                Outcome::Skipped(format!(
                                                    "dependency {} failed",
                                                    failed_key
                                                )),
                                                Duration::ZERO,
                                            ));
                                            dispatched[d] = true;
                                        }
                                    }
                                }
                            }
                        }
                        outcomes[i] = Some((outcome, duration));
                    }
                }
            }
        }

        let steps = plan
            .specs()
            .iter()
            .zip(outcomes)
            .map(|(spec, slot)| {
                let (outcome, duration) =
                    slot.unwrap_or((Outcome::Skipped("not attempted".to_string()), Duration::ZERO));
                StepReport {
                    key: spec.key.clone(),
                    outcome,
                    duration,
                }
            })
            .collect();

        let report = RunReport::new(steps);
        info!(
            succeeded = report.succeeded(),
            skipped = report.skipped(),
            failed = report.failed(),
            "orchestration run finished"
        );
        report
    }

    /// Remove every resource in the plan from the cluster, in reverse
    /// plan order so dependents go before their prerequisites, and drop
    /// the corresponding state records once removal is confirmed.
    pub async fn uninstall(
        &self,
        plan: &InstallationPlan,
        cluster: Arc<dyn ClusterClient>,
        state: Arc<dyn StateStore>,
    ) -> RunReport {
        let cancel = CancellationToken::new();
        let mut steps = Vec::with_capacity(plan.len());

        for spec in plan.specs().iter().rev() {
            let key = spec.key.clone();
            let start = Instant::now();
            info!(key = %key, "uninstalling resource");

            let prior = state.get(&key).await.ok().flatten();
            let from_phase = prior
                .as_ref()
                .map(|p| p.observed_phase)
                .unwrap_or(ResourcePhase::Unknown);
            if !from_phase.can_transition_to(ResourcePhase::Deleting) {
                warn!(key = %key, from = ?from_phase, "irregular phase transition into Deleting");
            }
            let prior_hash = prior.map(|p| p.last_applied_hash).unwrap_or_default();
            let _ = state
                .put(AppliedResource::new(
                    key.clone(),
                    ResourcePhase::Deleting,
                    prior_hash.clone(),
                ))
                .await;

            let outcome = match retry_transient(
                &self.config.retry,
                &format!("delete {}", key),
                &cancel,
                || cluster.delete(&key),
            )
            .await
            {
                Err(e) => {
                    let _ = state
                        .put(AppliedResource::new(
                            key.clone(),
                            ResourcePhase::Failed,
                            prior_hash,
                        ))
                        .await;
                    Outcome::Failed(e.to_string())
                }
                Ok(()) => {
                    let deadline = Instant::now() + self.kind_timeout(&key.kind);
                    loop {
                        match cluster.status(&key).await {
                            Ok(ObservedStatus::Absent) => {
                                let _ = state.delete(&key).await;
                                break Outcome::Success;
                            }
                            Ok(_) => {}
                            Err(e) if e.is_transient() => {
                                debug!(key = %key, error = %e, "transient error while confirming deletion");
                            }
                            Err(e) => break Outcome::Failed(e.to_string()),
                        }
                        if Instant::now() >= deadline {
                            break Outcome::TimedOut;
                        }
                        tokio::time::sleep(self.config.poll_interval).await;
                    }
                }
            };

            steps.push(StepReport {
                key,
                outcome,
                duration: start.elapsed(),
            });
        }

        steps.reverse();
        RunReport::new(steps)
    }

    /// The upgrade delta: keys whose current catalog rendering differs
    /// from what the state store last saw applied (or that were never
    /// applied). On a catalog version bump only these need re-apply.
    pub async fn changed_resources(
        &self,
        plan: &InstallationPlan,
        catalog: &dyn ManifestCatalog,
        state: &dyn StateStore,
    ) -> crate::Result<Vec<ResourceKey>> {
        let mut rendered = Vec::with_capacity(plan.len());
        for spec in plan.specs() {
            let docs = catalog.render(&spec.template, &spec.params)?;
            rendered.push((spec.key.clone(), combined_hash(&docs)));
        }
        Ok(crate::state::changed_keys(state, &rendered).await?)
    }
}

/// Everything one apply worker needs, owned so the task is `'static`.
struct StepContext {
    index: usize,
    spec: ResourceSpec,
    required: Readiness,
    catalog: Arc<dyn ManifestCatalog>,
    cluster: Arc<dyn ClusterClient>,
    state: Arc<dyn StateStore>,
    retry: RetryPolicy,
    readiness_timeout: Duration,
    poll_interval: Duration,
    cancel: CancellationToken,
}

/// One apply step: render, hash, skip-or-apply, poll readiness, persist.
///
/// The state store is written immediately after every phase change, not
/// batched, so a crash mid-run leaves a consistent, resumable record.
async fn execute_step(ctx: StepContext) -> (usize, Outcome, Duration) {
    let start = Instant::now();
    let key = ctx.spec.key.clone();

    // 1. Render. A render failure is a configuration error: terminal for
    // this resource, never retried.
    let docs = match ctx.catalog.render(&ctx.spec.template, &ctx.spec.params) {
        Ok(docs) => docs,
        Err(e) => {
            let _ = ctx
                .state
                .put(AppliedResource::new(
                    key.clone(),
                    ResourcePhase::Failed,
                    String::new(),
                ))
                .await;
            return (ctx.index, Outcome::Failed(e.to_string()), start.elapsed());
        }
    };
    if !docs.iter().any(|d| d.key == key) {
        let reason = format!("rendered documents do not declare {}", key);
        let _ = ctx
            .state
            .put(AppliedResource::new(
                key.clone(),
                ResourcePhase::Failed,
                String::new(),
            ))
            .await;
        return (ctx.index, Outcome::Failed(reason), start.elapsed());
    }

    // 2. Idempotence check: same hash, readiness already satisfied means
    // zero mutating calls.
    let hash = combined_hash(&docs);
    let prior = match ctx.state.get(&key).await {
        Ok(prior) => prior,
        Err(e) => return (ctx.index, Outcome::Failed(e.to_string()), start.elapsed()),
    };
    if let Some(prior) = &prior {
        if prior.last_applied_hash == hash && prior.observed_phase.satisfies(ctx.required) {
            debug!(key = %key, "unchanged and ready, skipping apply");
            return (
                ctx.index,
                Outcome::Skipped("unchanged".to_string()),
                start.elapsed(),
            );
        }
    }

    // 3. Apply, with bounded backoff for transient errors only.
    let from_phase = prior
        .map(|p| p.observed_phase)
        .unwrap_or(ResourcePhase::Unknown);
    if !from_phase.can_transition_to(ResourcePhase::Applying) {
        warn!(key = %key, from = ?from_phase, "irregular phase transition into Applying");
    }
    let applying = AppliedResource::new(key.clone(), ResourcePhase::Applying, hash.clone());
    if let Err(e) = ctx.state.put(applying.clone()).await {
        return (ctx.index, Outcome::Failed(e.to_string()), start.elapsed());
    }

    let mut generation = None;
    for doc in &docs {
        let applied = retry_transient(
            &ctx.retry,
            &format!("apply {}", doc.key),
            &ctx.cancel,
            || ctx.cluster.apply(doc),
        )
        .await;
        match applied {
            Ok(meta) => {
                if doc.key == key {
                    generation = meta.generation;
                }
            }
            Err(e) => {
                let _ = ctx.state.put(applying.with_phase(ResourcePhase::Failed)).await;
                return (ctx.index, Outcome::Failed(e.to_string()), start.elapsed());
            }
        }
    }

    // 4. Poll readiness when a dependent requires more than existence.
    if matches!(ctx.required, Readiness::Established | Readiness::Ready) {
        let deadline = Instant::now() + ctx.readiness_timeout;
        let mut saw_established = false;

        loop {
            match ctx.cluster.status(&key).await {
                Ok(status) => {
                    if let ObservedStatus::Present {
                        established,
                        generation: g,
                        ..
                    } = &status
                    {
                        saw_established |= *established;
                        if g.is_some() {
                            generation = *g;
                        }
                    }
                    if status.satisfies(ctx.required) {
                        break;
                    }
                }
                Err(e) if e.is_transient() => {
                    debug!(key = %key, error = %e, "transient error while polling readiness");
                }
                Err(e) => {
                    let _ = ctx.state.put(applying.with_phase(ResourcePhase::Failed)).await;
                    return (ctx.index, Outcome::Failed(e.to_string()), start.elapsed());
                }
            }

            if Instant::now() >= deadline {
                // Applied but never reached the condition: distinct from
                // Failed so operators can tell "rejected" from "slow".
                let phase = if saw_established {
                    ResourcePhase::Established
                } else {
                    ResourcePhase::Applying
                };
                let _ = ctx.state.put(applying.with_phase(phase)).await;
                warn!(key = %key, required = %ctx.required, "readiness poll timed out");
                return (ctx.index, Outcome::TimedOut, start.elapsed());
            }
            if ctx.cancel.is_cancelled() {
                let _ = ctx.state.put(applying.clone()).await;
                return (
                    ctx.index,
                    Outcome::Skipped("run cancelled".to_string()),
                    start.elapsed(),
                );
            }

            tokio::select! {
                _ = tokio::time::sleep(ctx.poll_interval) => {}
                _ = ctx.cancel.cancelled() => {}
            }
        }
    }

    // 5. Converged: readiness satisfied and the stored hash matches the
    // catalog's current rendering.
    let mut converged = applying.with_phase(ResourcePhase::Converged);
    converged.generation = generation;
    if let Err(e) = ctx.state.put(converged).await {
        return (ctx.index, Outcome::Failed(e.to_string()), start.elapsed());
    }

    info!(key = %key, elapsed_ms = start.elapsed().as_millis(), "resource converged");
    (ctx.index, Outcome::Success, start.elapsed())
}

/// Why a never-dispatched resource could not run: name the first
/// prerequisite that failed or was skipped.
fn blocking_reason(
    plan: &InstallationPlan,
    index: usize,
    outcomes: &[Option<(Outcome, Duration)>],
) -> String {
    for &(p, _) in plan.prerequisites(index) {
        if let Some((outcome, _)) = &outcomes[p] {
            if !outcome.satisfies_dependents() {
                return format!("dependency {} failed", plan.specs()[p].key);
            }
        }
    }
    "not attempted".to_string()
}

/// Hash of a step's full rendering. Single documents hash directly; a
/// multi-document rendering hashes the concatenation with separators so
/// reordering or dropping a document changes the hash.
fn combined_hash(docs: &[Document]) -> String {
    if docs.len() == 1 {
        return docs[0].content_hash();
    }
    let mut hasher = Sha256::new();
    for doc in docs {
        hasher.update(doc.content().as_bytes());
        hasher.update(b"\n---\n");
    }
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}
