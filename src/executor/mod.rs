//! Resize executor: applies a validated proposal to the live pod through
//! the in-place resize subresource, without deleting the pod.
//!
//! Concurrency is bounded by a semaphore sized to the configured maximum,
//! and a per-pod lock prevents two concurrent mutations against the same
//! pod. A single container's failure never propagates upward; the outcome
//! is returned and audited.

use crate::annotations;
use crate::audit::{AuditEvent, AuditEventType, AuditLog, AuditMetadata, AuditStatus};
use crate::cluster::{ClusterClient, PodSnapshot, ResizePatch, ResizeStatus};
use crate::error::RightsizerError;
use crate::recommend::Proposal;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

/// Executor tuning
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How long to wait for the observed status to reflect the patch
    pub resize_timeout: Duration,
    /// Poll cadence while waiting
    pub poll_interval: Duration,
    /// Deadline for each remote call
    pub op_timeout: Duration,
    /// Ensure a NotRequired container resize policy before patching
    pub update_resize_policy: bool,
    /// Log and audit, never patch
    pub dry_run: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            resize_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_secs(1),
            op_timeout: Duration::from_secs(10),
            update_resize_policy: false,
            dry_run: false,
        }
    }
}

/// Why a mutation failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeFailure {
    /// Another agent changed the container since the proposal was computed
    Drift,
    /// The observed status never reflected the patch in time
    Timeout,
    /// The node reported the resize infeasible
    Infeasible,
    /// The API rejected or failed the patch
    ApiError,
    /// The caller is not allowed to resize the pod
    PermissionDenied,
}

impl fmt::Display for ResizeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Drift => "drift",
            Self::Timeout => "timeout",
            Self::Infeasible => "infeasible",
            Self::ApiError => "api-error",
            Self::PermissionDenied => "permission-denied",
        };
        write!(f, "{}", s)
    }
}

/// Result of one mutation attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    /// Patch applied and observed
    Applied,
    /// Dry-run, patch logged but not issued
    DryRun,
    /// Mutation failed
    Failed(ResizeFailure),
}

/// Applies proposals through the resize subresource
pub struct ResizeExecutor {
    client: Arc<dyn ClusterClient>,
    audit: Arc<AuditLog>,
    semaphore: Arc<Semaphore>,
    pod_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ResizeExecutor {
    /// New executor allowing at most `max_concurrent` in-flight mutations
    pub fn new(client: Arc<dyn ClusterClient>, audit: Arc<AuditLog>, max_concurrent: usize) -> Self {
        Self {
            client,
            audit,
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            pod_locks: DashMap::new(),
        }
    }

    /// Apply one validated proposal. Never returns an error; failures are
    /// reported in the outcome and audited.
    pub async fn apply(&self, config: &ExecutorConfig, proposal: &Proposal) -> MutationOutcome {
        let permit = match Arc::clone(&self.semaphore).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                // semaphore closed only during shutdown
                return MutationOutcome::Failed(ResizeFailure::ApiError);
            }
        };
        let pod_key = format!("{}/{}", proposal.workload.namespace, proposal.pod_name);
        let lock = self
            .pod_locks
            .entry(pod_key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _pod_guard = lock.lock().await;
        let outcome = self.apply_locked(config, proposal).await;
        drop(permit);
        outcome
    }

    async fn apply_locked(&self, config: &ExecutorConfig, proposal: &Proposal) -> MutationOutcome {
        let namespace = proposal.workload.namespace.as_str();
        let pod_name = proposal.pod_name.as_str();
        let container = proposal.workload.container.as_str();
        let started = Instant::now();

        // step 1: re-fetch and verify nothing moved underneath us
        let pod = match self.get_pod(config, namespace, pod_name).await {
            Ok(pod) => pod,
            Err(err) => {
                self.audit_failure(proposal, None, ResizeFailure::ApiError, &err.to_string(), started);
                return MutationOutcome::Failed(ResizeFailure::ApiError);
            }
        };
        let observed = match pod.container(container) {
            Some(c) => c.resources,
            None => {
                self.audit_failure(
                    proposal,
                    Some(&pod),
                    ResizeFailure::ApiError,
                    "container no longer present",
                    started,
                );
                return MutationOutcome::Failed(ResizeFailure::ApiError);
            }
        };
        if observed != proposal.current {
            debug!(
                pod = %pod_key(namespace, pod_name),
                container,
                observed = %observed.describe(),
                expected = %proposal.current.describe(),
                "allocation drifted since recommendation"
            );
            self.audit_failure(
                proposal,
                Some(&pod),
                ResizeFailure::Drift,
                "observed allocation differs from recommendation input",
                started,
            );
            return MutationOutcome::Failed(ResizeFailure::Drift);
        }

        // step 2: optional resize-policy alignment, gated by feature flag
        if config.update_resize_policy {
            let ensure = tokio::time::timeout(
                config.op_timeout,
                self.client.ensure_resize_policy(namespace, pod_name, container),
            )
            .await;
            match ensure {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(%err, "could not align resize policy, continuing"),
                Err(_) => warn!("resize policy alignment timed out, continuing"),
            }
        }

        let patch = ResizePatch {
            container: container.to_string(),
            resources: proposal.proposed,
        };

        if config.dry_run {
            info!(
                pod = %pod_key(namespace, pod_name),
                container,
                patch = %patch.to_merge_patch(),
                "dry-run, intended resize not issued"
            );
            let event = AuditEvent::new(AuditEventType::ResourceChange, "resize", AuditStatus::DryRun)
                .with_pod(namespace, pod_name, container)
                .with_reason(proposal.reason.clone())
                .with_resources(proposal.current, proposal.proposed)
                .with_duration(started.elapsed())
                .with_metadata(metadata_for(&pod));
            self.audit.emit(event);
            return MutationOutcome::DryRun;
        }

        // step 3: submit through the resize subresource, one retry for
        // retryable API failures
        if let Err(err) = self.patch_with_retry(config, namespace, pod_name, &patch).await {
            let failure = match &err {
                RightsizerError::PermissionDenied { .. } => ResizeFailure::PermissionDenied,
                _ => ResizeFailure::ApiError,
            };
            self.audit_failure(proposal, Some(&pod), failure, &err.to_string(), started);
            return MutationOutcome::Failed(failure);
        }

        // step 4: await the observed status reflecting the new values
        match self.await_observed(config, proposal, started).await {
            Ok(()) => {}
            Err(failure) => {
                self.audit_failure(proposal, Some(&pod), failure, &failure.to_string(), started);
                return MutationOutcome::Failed(failure);
            }
        }

        // step 6: annotations and audit, both best-effort
        self.annotate(namespace, pod_name, proposal).await;
        let message = format!(
            "resized {} from [{}] to [{}]",
            container,
            proposal.current.describe(),
            proposal.proposed.describe()
        );
        if let Err(err) = tokio::time::timeout(
            config.op_timeout,
            self.client.create_event(namespace, pod_name, "Resized", &message),
        )
        .await
        .unwrap_or_else(|_| Err(RightsizerError::api("event creation timed out")))
        {
            warn!(%err, "could not create orchestrator event");
        }

        let event = AuditEvent::new(AuditEventType::ResourceChange, "resize", AuditStatus::Success)
            .with_pod(namespace, pod_name, container)
            .with_reason(proposal.reason.clone())
            .with_resources(proposal.current, proposal.proposed)
            .with_duration(started.elapsed())
            .with_metadata(metadata_for(&pod));
        self.audit.emit(event);
        info!(
            pod = %pod_key(namespace, pod_name),
            container,
            direction = %proposal.direction,
            new = %proposal.proposed.describe(),
            "resize applied"
        );
        MutationOutcome::Applied
    }

    async fn get_pod(
        &self,
        config: &ExecutorConfig,
        namespace: &str,
        name: &str,
    ) -> crate::error::Result<PodSnapshot> {
        tokio::time::timeout(config.op_timeout, self.client.get_pod(namespace, name))
            .await
            .map_err(|_| RightsizerError::Timeout {
                operation: format!("get pod {}/{}", namespace, name),
                duration: config.op_timeout,
            })?
    }

    async fn patch_with_retry(
        &self,
        config: &ExecutorConfig,
        namespace: &str,
        pod_name: &str,
        patch: &ResizePatch,
    ) -> crate::error::Result<()> {
        let attempt = tokio::time::timeout(
            config.op_timeout,
            self.client.patch_pod_resize(namespace, pod_name, patch),
        )
        .await
        .unwrap_or_else(|_| {
            Err(RightsizerError::Timeout {
                operation: "resize patch".into(),
                duration: config.op_timeout,
            })
        });
        match attempt {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() => {
                debug!(%err, "retrying resize patch once");
                tokio::time::sleep(Duration::from_millis(500)).await;
                tokio::time::timeout(
                    config.op_timeout,
                    self.client.patch_pod_resize(namespace, pod_name, patch),
                )
                .await
                .unwrap_or_else(|_| {
                    Err(RightsizerError::Timeout {
                        operation: "resize patch".into(),
                        duration: config.op_timeout,
                    })
                })
            }
            Err(err) => Err(err),
        }
    }

    async fn await_observed(
        &self,
        config: &ExecutorConfig,
        proposal: &Proposal,
        started: Instant,
    ) -> std::result::Result<(), ResizeFailure> {
        let namespace = proposal.workload.namespace.as_str();
        let pod_name = proposal.pod_name.as_str();
        let container = proposal.workload.container.as_str();
        loop {
            match self.get_pod(config, namespace, pod_name).await {
                Ok(pod) => {
                    if pod.resize_status == Some(ResizeStatus::Infeasible) {
                        return Err(ResizeFailure::Infeasible);
                    }
                    if let Some(c) = pod.container(container) {
                        if c.resources == proposal.proposed {
                            return Ok(());
                        }
                    }
                }
                Err(err) => {
                    debug!(%err, "poll failed while awaiting resize");
                }
            }
            if started.elapsed() >= config.resize_timeout {
                return Err(ResizeFailure::Timeout);
            }
            tokio::time::sleep(config.poll_interval).await;
        }
    }

    async fn annotate(&self, namespace: &str, pod_name: &str, proposal: &Proposal) {
        let mut set = HashMap::new();
        set.insert(annotations::OPTIMIZED.to_string(), "true".to_string());
        set.insert(
            annotations::OPTIMIZATION_TYPE.to_string(),
            proposal.optimization_type().to_string(),
        );
        set.insert(annotations::LAST_MUTATED.to_string(), Utc::now().to_rfc3339());
        if let Err(err) = self.client.annotate_pod(namespace, pod_name, &set).await {
            warn!(%err, pod = %pod_key(namespace, pod_name), "could not annotate pod");
        }
    }

    fn audit_failure(
        &self,
        proposal: &Proposal,
        pod: Option<&PodSnapshot>,
        failure: ResizeFailure,
        error: &str,
        started: Instant,
    ) {
        let event = AuditEvent::new(AuditEventType::ResourceChange, "resize", AuditStatus::Failure)
            .with_pod(
                &proposal.workload.namespace,
                &proposal.pod_name,
                &proposal.workload.container,
            )
            .with_reason(failure.to_string())
            .with_resources(proposal.current, proposal.proposed)
            .with_error(error)
            .with_duration(started.elapsed())
            .with_metadata(pod.map(metadata_for).unwrap_or_default());
        self.audit.emit(event);
    }
}

fn metadata_for(pod: &PodSnapshot) -> AuditMetadata {
    AuditMetadata {
        pod_uid: pod.uid.clone(),
        qos_class: pod.qos_class().to_string(),
        node_name: pod.node_name.clone(),
    }
}

fn pod_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}
