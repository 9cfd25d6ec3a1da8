//! Reconciliation scheduler: the periodic loop driving observation,
//! recommendation, policy, admission and mutation for every candidate
//! container.
//!
//! Exactly one scheduler instance is active; leader election is an
//! external precondition. A single container's failure never fails the
//! tick. Mutations run in a bounded worker pool and the scheduler drains
//! them before the tick ends.

use crate::admission::AdmissionPipeline;
use crate::annotations;
use crate::audit::{AuditEvent, AuditEventType, AuditLog, AuditMetadata, AuditStatus};
use crate::cluster::{ClusterClient, PodPhase, PodSnapshot, WorkloadId};
use crate::config::RightsizerConfig;
use crate::error::{ErrorKind, Result, RightsizerError};
use crate::executor::{MutationOutcome, ResizeExecutor, ResizeFailure};
use crate::history::{HistoryStore, MetricSample};
use crate::metrics::MetricsProvider;
use crate::policy::PolicyEngine;
use crate::recommend::RecommendationEngine;
use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of the last reconciliation of one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// A mutation was applied (or would have been, in dry-run)
    Ok,
    /// Nothing was done, with the reason
    Skipped(String),
    /// The mutation failed, with the reason
    Failed(String),
}

impl fmt::Display for ReconcileOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "ok"),
            Self::Skipped(reason) => write!(f, "skipped:{}", reason),
            Self::Failed(reason) => write!(f, "failed:{}", reason),
        }
    }
}

/// Per-container reconciliation state, kept for the process lifetime
#[derive(Debug, Clone)]
pub struct ReconcileRecord {
    /// Container identity
    pub workload: WorkloadId,
    /// Last time the container was considered
    pub last_observed_at: Option<DateTime<Utc>>,
    /// Last successful mutation
    pub last_mutated_at: Option<DateTime<Utc>>,
    /// Last failed mutation
    pub last_failed_at: Option<DateTime<Utc>>,
    /// Outcome of the last reconciliation
    pub last_outcome: Option<ReconcileOutcome>,
    /// Mutation failures since the last success
    pub consecutive_failures: u32,
}

impl ReconcileRecord {
    fn new(workload: WorkloadId) -> Self {
        Self {
            workload,
            last_observed_at: None,
            last_mutated_at: None,
            last_failed_at: None,
            last_outcome: None,
            consecutive_failures: 0,
        }
    }
}

/// Monotonic counters exposed to the shell
#[derive(Debug, Default)]
pub struct SchedulerCounters {
    ticks: AtomicU64,
    proposals: AtomicU64,
    applied: AtomicU64,
    dry_runs: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterSnapshot {
    /// Ticks started
    pub ticks: u64,
    /// Actionable proposals produced
    pub proposals: u64,
    /// Mutations applied
    pub applied: u64,
    /// Dry-run mutations logged
    pub dry_runs: u64,
    /// Containers skipped
    pub skipped: u64,
    /// Mutations failed
    pub failed: u64,
}

impl SchedulerCounters {
    /// Copy the current values
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            ticks: self.ticks.load(Ordering::Relaxed),
            proposals: self.proposals.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            dry_runs: self.dry_runs.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// What one tick did
#[derive(Debug, Clone, Default)]
pub struct TickSummary {
    /// Candidate containers after enumeration filters
    pub candidates: usize,
    /// Actionable proposals produced by the engine
    pub proposals: usize,
    /// Mutations applied
    pub applied: usize,
    /// Dry-run mutations logged
    pub dry_runs: usize,
    /// Containers skipped (cooldown, policy, no-action, invalid)
    pub skipped: usize,
    /// Proposals rejected by admission
    pub invalid: usize,
    /// Mutations failed
    pub failed: usize,
    /// The tick stopped early on cancellation or deadline overrun
    pub aborted: bool,
    /// Wall-clock duration of the tick
    pub duration: Duration,
}

struct PendingMutation {
    workload: WorkloadId,
    namespace: String,
    pod_name: String,
    pod_uid: String,
    qos_class: String,
    node_name: Option<String>,
}

struct PolicyCache {
    generation: usize,
    engine: Arc<PolicyEngine>,
}

/// The reconciliation scheduler
pub struct ReconcileScheduler {
    config: Arc<ArcSwap<RightsizerConfig>>,
    client: Arc<dyn ClusterClient>,
    metrics: Arc<dyn MetricsProvider>,
    history: Arc<HistoryStore>,
    admission: AdmissionPipeline,
    executor: Arc<ResizeExecutor>,
    audit: Arc<AuditLog>,
    records: RwLock<HashMap<WorkloadId, ReconcileRecord>>,
    counters: SchedulerCounters,
    policy_cache: Mutex<Option<PolicyCache>>,
}

impl ReconcileScheduler {
    /// Build a scheduler over the given collaborators. Fails fast when the
    /// active configuration is invalid.
    pub fn new(
        config: Arc<ArcSwap<RightsizerConfig>>,
        client: Arc<dyn ClusterClient>,
        metrics: Arc<dyn MetricsProvider>,
        history: Arc<HistoryStore>,
        audit: Arc<AuditLog>,
    ) -> Result<Self> {
        let current = config.load_full();
        current.validate()?;
        let admission = AdmissionPipeline::new(Arc::clone(&client), current.op_timeout());
        let executor = Arc::new(ResizeExecutor::new(
            Arc::clone(&client),
            Arc::clone(&audit),
            current.max_concurrent_mutations,
        ));
        Ok(Self {
            config,
            client,
            metrics,
            history,
            admission,
            executor,
            audit,
            records: RwLock::new(HashMap::new()),
            counters: SchedulerCounters::default(),
            policy_cache: Mutex::new(None),
        })
    }

    /// The admission pipeline, for cache invalidation hooks
    pub fn admission(&self) -> &AdmissionPipeline {
        &self.admission
    }

    /// Counter snapshot
    pub fn counters(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Copy of the reconcile record for one container
    pub fn record(&self, id: &WorkloadId) -> Option<ReconcileRecord> {
        self.records.read().get(id).cloned()
    }

    /// Run the periodic loop until cancelled.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        let mut period = self.config.load().resize_interval();
        let mut interval = tokio::time::interval(period);
        info!(interval = ?period, "reconciliation scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            match self.tick(&cancel).await {
                Ok(summary) => {
                    info!(
                        candidates = summary.candidates,
                        proposals = summary.proposals,
                        applied = summary.applied,
                        dry_runs = summary.dry_runs,
                        skipped = summary.skipped,
                        invalid = summary.invalid,
                        failed = summary.failed,
                        duration = ?summary.duration,
                        "tick complete"
                    );
                }
                Err(err) if err.kind() == ErrorKind::Fatal => return Err(err),
                Err(err) => warn!(%err, "tick failed, retrying next interval"),
            }
            let configured = self.config.load().resize_interval();
            if configured != period {
                period = configured;
                interval = tokio::time::interval(period);
                interval.reset();
                info!(interval = ?period, "resize interval updated");
            }
        }
        info!("reconciliation scheduler stopped");
        Ok(())
    }

    /// Run one reconciliation pass.
    pub async fn tick(&self, cancel: &CancellationToken) -> Result<TickSummary> {
        let started = Instant::now();
        let config = self.config.load_full();
        self.counters.ticks.fetch_add(1, Ordering::Relaxed);
        let mut summary = TickSummary::default();
        if !config.enabled {
            debug!("rightsizer disabled, idle tick");
            summary.duration = started.elapsed();
            return Ok(summary);
        }

        let deadline = started + config.tick_deadline();
        let engine = RecommendationEngine::new(config.engine_config());
        let policy = self.policy_for(&config)?;
        let admission_config = config.admission_config()?;
        let executor_config = config.executor_config();

        let pods = match self.list_pods_with_retry(&config).await {
            Ok(pods) => pods,
            Err(err) => {
                warn!(%err, "pod enumeration failed, tick skipped");
                summary.aborted = true;
                summary.duration = started.elapsed();
                return Ok(summary);
            }
        };
        self.ingest_metrics(&config, &pods).await;

        let now = Utc::now();
        let mut inflight: FuturesUnordered<JoinHandle<(u64, MutationOutcome)>> =
            FuturesUnordered::new();
        let mut pending: HashMap<u64, PendingMutation> = HashMap::new();
        let mut next_seq: u64 = 0;

        'pods: for pod in &pods {
            if !config.namespaces.allows(&pod.namespace) {
                continue;
            }
            if pod.phase != PodPhase::Running {
                continue;
            }
            if pod.annotations.get(annotations::DISABLE).map(String::as_str) == Some("true") {
                debug!(pod = %pod.key(), "skip annotation present");
                continue;
            }
            if let Some(started_at) = pod.started_at {
                let age = (now - started_at).to_std().unwrap_or_default();
                if age < config.min_pod_age() {
                    continue;
                }
            }
            if pod.max_restart_count() >= config.max_restart_count {
                debug!(pod = %pod.key(), restarts = pod.max_restart_count(), "restart circuit open");
                continue;
            }

            for container in &pod.containers {
                if cancel.is_cancelled() || Instant::now() >= deadline {
                    warn!("tick aborted at cooperative check");
                    summary.aborted = true;
                    break 'pods;
                }
                summary.candidates += 1;
                let id = pod.workload_id(&container.name);

                if let Some(reason) = self.gate_reason(&id, &config, now) {
                    self.set_outcome(&id, ReconcileOutcome::Skipped(reason));
                    summary.skipped += 1;
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                let stats = self.history.stats(&id, config.lookback());
                let proposal = engine.recommend(
                    id.clone(),
                    &pod.name,
                    &pod.uid,
                    container.resources,
                    stats.as_ref(),
                );
                if !proposal.is_actionable() {
                    self.set_outcome(
                        &id,
                        ReconcileOutcome::Skipped(format!("no-action: {}", proposal.reason)),
                    );
                    summary.skipped += 1;
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                summary.proposals += 1;
                self.counters.proposals.fetch_add(1, Ordering::Relaxed);

                let decision = policy.evaluate(pod, &container.name, proposal, now);
                if let Some(rule) = decision.skip {
                    self.audit.emit(
                        AuditEvent::new(
                            AuditEventType::PolicyApplication,
                            "policy",
                            AuditStatus::Skipped,
                        )
                        .with_pod(&pod.namespace, &pod.name, &container.name)
                        .with_reason(format!("rule {}", rule))
                        .with_metadata(pod_metadata(pod)),
                    );
                    self.set_outcome(&id, ReconcileOutcome::Skipped(format!("policy:{}", rule)));
                    summary.skipped += 1;
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                let proposal = decision.proposal;
                if !proposal.is_actionable() {
                    self.set_outcome(
                        &id,
                        ReconcileOutcome::Skipped("no-action: cancelled by policy".into()),
                    );
                    summary.skipped += 1;
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                // admission always runs after policy so rule-modified
                // proposals are re-validated
                let validation = self
                    .admission
                    .validate(&admission_config, pod, &container.name, &proposal.proposed)
                    .await;
                for warning in &validation.warnings {
                    warn!(pod = %pod.key(), container = %container.name, "{}", warning);
                }
                if !validation.is_valid() {
                    let message = validation.error_summary();
                    self.audit.emit(
                        AuditEvent::new(
                            AuditEventType::ResourceValidation,
                            "admission",
                            AuditStatus::Failure,
                        )
                        .with_pod(&pod.namespace, &pod.name, &container.name)
                        .with_reason("validation")
                        .with_error(message.clone())
                        .with_resources(proposal.current, proposal.proposed)
                        .with_metadata(pod_metadata(pod)),
                    );
                    self.set_outcome(&id, ReconcileOutcome::Skipped(format!("invalid: {}", message)));
                    summary.invalid += 1;
                    self.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    continue;
                }

                let seq = next_seq;
                next_seq += 1;
                pending.insert(
                    seq,
                    PendingMutation {
                        workload: id.clone(),
                        namespace: pod.namespace.clone(),
                        pod_name: pod.name.clone(),
                        pod_uid: pod.uid.clone(),
                        qos_class: pod.qos_class().to_string(),
                        node_name: pod.node_name.clone(),
                    },
                );
                let executor = Arc::clone(&self.executor);
                let exec_config = executor_config.clone();
                inflight.push(tokio::spawn(async move {
                    let outcome = executor.apply(&exec_config, &proposal).await;
                    (seq, outcome)
                }));
            }
        }

        self.drain(&config, cancel, &mut inflight, &mut pending, &mut summary).await;
        summary.duration = started.elapsed();
        Ok(summary)
    }

    async fn drain(
        &self,
        config: &RightsizerConfig,
        cancel: &CancellationToken,
        inflight: &mut FuturesUnordered<JoinHandle<(u64, MutationOutcome)>>,
        pending: &mut HashMap<u64, PendingMutation>,
        summary: &mut TickSummary,
    ) {
        while !inflight.is_empty() {
            if cancel.is_cancelled() {
                let grace = config.shutdown_grace();
                let drained = tokio::time::timeout(grace, async {
                    while let Some(result) = inflight.next().await {
                        self.finish_mutation(result, pending, summary);
                    }
                })
                .await;
                if drained.is_err() {
                    for (_, info) in pending.drain() {
                        warn!(
                            pod = %format!("{}/{}", info.namespace, info.pod_name),
                            container = %info.workload.container,
                            "mutation abandoned on shutdown"
                        );
                        self.audit.emit(
                            AuditEvent::new(
                                AuditEventType::ResourceChange,
                                "resize",
                                AuditStatus::Failure,
                            )
                            .with_pod(&info.namespace, &info.pod_name, &info.workload.container)
                            .with_reason("aborted")
                            .with_metadata(AuditMetadata {
                                pod_uid: info.pod_uid.clone(),
                                qos_class: info.qos_class.clone(),
                                node_name: info.node_name.clone(),
                            }),
                        );
                        self.set_outcome(&info.workload, ReconcileOutcome::Failed("aborted".into()));
                    }
                }
                summary.aborted = true;
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => continue,
                result = inflight.next() => match result {
                    Some(result) => self.finish_mutation(result, pending, summary),
                    None => break,
                }
            }
        }
    }

    fn finish_mutation(
        &self,
        result: std::result::Result<(u64, MutationOutcome), tokio::task::JoinError>,
        pending: &mut HashMap<u64, PendingMutation>,
        summary: &mut TickSummary,
    ) {
        let (seq, outcome) = match result {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "mutation task did not complete");
                return;
            }
        };
        let info = match pending.remove(&seq) {
            Some(info) => info,
            None => return,
        };
        match outcome {
            MutationOutcome::Applied => {
                summary.applied += 1;
                self.counters.applied.fetch_add(1, Ordering::Relaxed);
                let mut records = self.records.write();
                let record = records
                    .entry(info.workload.clone())
                    .or_insert_with(|| ReconcileRecord::new(info.workload.clone()));
                record.last_mutated_at = Some(Utc::now());
                record.consecutive_failures = 0;
                record.last_outcome = Some(ReconcileOutcome::Ok);
            }
            MutationOutcome::DryRun => {
                summary.dry_runs += 1;
                self.counters.dry_runs.fetch_add(1, Ordering::Relaxed);
                self.set_outcome(&info.workload, ReconcileOutcome::Ok);
            }
            MutationOutcome::Failed(failure) => {
                summary.failed += 1;
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                let mut records = self.records.write();
                let record = records
                    .entry(info.workload.clone())
                    .or_insert_with(|| ReconcileRecord::new(info.workload.clone()));
                record.last_failed_at = Some(Utc::now());
                record.consecutive_failures += 1;
                record.last_outcome = Some(ReconcileOutcome::Failed(failure.to_string()));
                if failure == ResizeFailure::Drift {
                    // stale view; the next tick re-observes from scratch
                    debug!(container = %info.workload, "drift recorded");
                }
            }
        }
    }

    /// Cooldown and failure-circuit gate. Also stamps the observation time.
    fn gate_reason(
        &self,
        id: &WorkloadId,
        config: &RightsizerConfig,
        now: DateTime<Utc>,
    ) -> Option<String> {
        let mut records = self.records.write();
        let record = records
            .entry(id.clone())
            .or_insert_with(|| ReconcileRecord::new(id.clone()));
        record.last_observed_at = Some(now);

        if let Some(mutated) = record.last_mutated_at {
            let since = (now - mutated).to_std().unwrap_or_default();
            if since < config.cooldown() {
                return Some("cooldown".into());
            }
        }
        if record.consecutive_failures >= config.failure_circuit_threshold {
            match record.last_failed_at {
                Some(failed)
                    if (now - failed).to_std().unwrap_or_default()
                        < config.failure_circuit_reset() =>
                {
                    return Some("failure-circuit".into());
                }
                _ => {
                    debug!(container = %id, "failure circuit reset");
                    record.consecutive_failures = 0;
                }
            }
        }
        None
    }

    fn set_outcome(&self, id: &WorkloadId, outcome: ReconcileOutcome) {
        let mut records = self.records.write();
        let record = records
            .entry(id.clone())
            .or_insert_with(|| ReconcileRecord::new(id.clone()));
        record.last_outcome = Some(outcome);
    }

    fn policy_for(&self, config: &Arc<RightsizerConfig>) -> Result<Arc<PolicyEngine>> {
        let generation = Arc::as_ptr(config) as usize;
        let mut cache = self.policy_cache.lock();
        if let Some(cached) = cache.as_ref() {
            if cached.generation == generation {
                return Ok(Arc::clone(&cached.engine));
            }
        }
        let engine = Arc::new(PolicyEngine::compile(
            config.rules.clone(),
            config.engine_config(),
        )?);
        info!(rules = engine.active_rule_count(), "policy rules compiled");
        *cache = Some(PolicyCache { generation, engine: Arc::clone(&engine) });
        Ok(engine)
    }

    async fn list_pods_with_retry(&self, config: &RightsizerConfig) -> Result<Vec<PodSnapshot>> {
        let attempt = tokio::time::timeout(config.op_timeout(), self.client.list_pods(None))
            .await
            .unwrap_or_else(|_| {
                Err(RightsizerError::Timeout {
                    operation: "list pods".into(),
                    duration: config.op_timeout(),
                })
            });
        match attempt {
            Ok(pods) => Ok(pods),
            Err(err) if err.is_retryable() => {
                debug!(%err, "retrying pod enumeration once");
                tokio::time::timeout(config.op_timeout(), self.client.list_pods(None))
                    .await
                    .unwrap_or_else(|_| {
                        Err(RightsizerError::Timeout {
                            operation: "list pods".into(),
                            duration: config.op_timeout(),
                        })
                    })
            }
            Err(err) => Err(err),
        }
    }

    async fn ingest_metrics(&self, config: &RightsizerConfig, pods: &[PodSnapshot]) {
        let usages = match tokio::time::timeout(
            config.op_timeout(),
            self.metrics.list_pod_metrics(None),
        )
        .await
        {
            Ok(Ok(usages)) => usages,
            Ok(Err(err)) => {
                warn!(%err, "metrics fetch failed, skipping ingestion this tick");
                return;
            }
            Err(_) => {
                warn!("metrics fetch timed out, skipping ingestion this tick");
                return;
            }
        };
        let by_key: HashMap<String, &PodSnapshot> =
            pods.iter().map(|p| (p.key(), p)).collect();
        let now = Utc::now();
        let mut appended = 0usize;
        for usage in &usages {
            let pod = match by_key.get(&format!("{}/{}", usage.namespace, usage.pod)) {
                Some(pod) => pod,
                None => continue,
            };
            for container in &usage.containers {
                if pod.container(&container.name).is_none() {
                    continue;
                }
                let id = pod.workload_id(&container.name);
                self.history.record(
                    &id,
                    MetricSample {
                        timestamp: now,
                        cpu_milli: container.cpu_milli,
                        mem_bytes: container.mem_bytes,
                        cpu_throttle_percent: container.throttle_percent,
                    },
                );
                appended += 1;
            }
        }
        debug!(samples = appended, "metrics ingested");
    }
}

fn pod_metadata(pod: &PodSnapshot) -> AuditMetadata {
    AuditMetadata {
        pod_uid: pod.uid.clone(),
        qos_class: pod.qos_class().to_string(),
        node_name: pod.node_name.clone(),
    }
}
