//! Rightsizer - in-place resource rightsizing for container workloads.
//!
//! A closed-loop control plane that observes per-container CPU and memory
//! usage, computes right-sized requests and limits, validates every change
//! against safety rules and applies it through the orchestrator's in-place
//! resize subresource, without evicting the workload.
//!
//! The loop: the scheduler ticks, the history store serves usage stats,
//! the recommendation engine proposes a change, the policy engine adjusts
//! or skips it, the admission pipeline validates it, and the executor
//! mutates the live pod and audits the outcome.

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod admission;
pub mod audit;
pub mod cluster;
pub mod config;
pub mod error;
pub mod executor;
pub mod history;
pub mod metrics;
pub mod policy;
pub mod recommend;
pub mod resources;
pub mod scheduler;

/// Pod annotations read and written by the rightsizer
pub mod annotations {
    /// Pods carrying this annotation with value `true` are never touched
    pub const DISABLE: &str = "rightsizer.io/disable";
    /// Written after a successful mutation
    pub const OPTIMIZED: &str = "rightsizer.io/optimized";
    /// Direction of the last mutation: `up`, `down` or `both`
    pub const OPTIMIZATION_TYPE: &str = "rightsizer.io/optimization-type";
    /// RFC3339 timestamp of the last mutation
    pub const LAST_MUTATED: &str = "rightsizer.io/last-mutated";
}

pub use admission::{AdmissionConfig, AdmissionPipeline, ValidationResult};
pub use audit::{AuditEvent, AuditEventType, AuditLog, AuditSink, AuditStatus};
pub use cluster::{ClusterClient, FakeCluster, PodSnapshot, WorkloadId, WorkloadKind};
pub use config::{ConfigManager, RightsizerConfig};
pub use error::{ErrorKind, Result, RightsizerError};
pub use executor::{ExecutorConfig, MutationOutcome, ResizeExecutor, ResizeFailure};
pub use history::{HistoryConfig, HistoryStats, HistoryStore, MetricSample};
pub use metrics::MetricsProvider;
pub use policy::{PolicyEngine, Rule};
pub use recommend::{EngineConfig, Proposal, RecommendationEngine};
pub use resources::{QosClass, ResourceSpec, ScaleDirection};
pub use scheduler::{ReconcileOutcome, ReconcileRecord, ReconcileScheduler, TickSummary};
