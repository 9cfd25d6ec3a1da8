//! Metrics source seam.
//!
//! Concrete backends are injected at startup; everything downstream only
//! sees [`MetricsProvider`]. Sample windows of one minute or less are the
//! provider's responsibility.

use crate::error::{Result, RightsizerError};
use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Usage of one container at sampling time
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerUsage {
    /// Container name
    pub name: String,
    /// CPU usage in millicores
    pub cpu_milli: u64,
    /// Memory usage in bytes
    pub mem_bytes: u64,
    /// Fraction of CPU periods throttled, 0-100
    pub throttle_percent: f64,
}

/// Usage of all containers in one pod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodUsage {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Per-container usage
    pub containers: Vec<ContainerUsage>,
}

/// Aggregate usage of one node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeUsage {
    /// Node name
    pub name: String,
    /// CPU usage in millicores
    pub cpu_milli: u64,
    /// Memory usage in bytes
    pub mem_bytes: u64,
}

/// Capability set of a metrics backend
#[async_trait]
pub trait MetricsProvider: Send + Sync {
    /// Latest per-container usage, optionally restricted to one namespace
    async fn list_pod_metrics(&self, namespace: Option<&str>) -> Result<Vec<PodUsage>>;

    /// Latest per-node usage
    async fn list_node_metrics(&self) -> Result<Vec<NodeUsage>>;
}

/// Provider backed by values tests set explicitly
#[derive(Default)]
pub struct InMemoryMetricsProvider {
    pods: RwLock<HashMap<String, PodUsage>>,
    nodes: RwLock<Vec<NodeUsage>>,
}

impl InMemoryMetricsProvider {
    /// New empty provider
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the usage reported for a pod
    pub fn set_pod_usage(&self, usage: PodUsage) {
        let key = format!("{}/{}", usage.namespace, usage.pod);
        self.pods.write().insert(key, usage);
    }

    /// Remove the usage reported for a pod
    pub fn clear_pod_usage(&self, namespace: &str, pod: &str) {
        self.pods.write().remove(&format!("{}/{}", namespace, pod));
    }

    /// Set the usage reported for the nodes
    pub fn set_node_usage(&self, usage: Vec<NodeUsage>) {
        *self.nodes.write() = usage;
    }
}

#[async_trait]
impl MetricsProvider for InMemoryMetricsProvider {
    async fn list_pod_metrics(&self, namespace: Option<&str>) -> Result<Vec<PodUsage>> {
        Ok(self
            .pods
            .read()
            .values()
            .filter(|u| namespace.map_or(true, |ns| u.namespace == ns))
            .cloned()
            .collect())
    }

    async fn list_node_metrics(&self) -> Result<Vec<NodeUsage>> {
        Ok(self.nodes.read().clone())
    }
}

/// Baseline usage the simulated provider jitters around
#[derive(Debug, Clone)]
pub struct SimulatedProfile {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container name
    pub container: String,
    /// Baseline CPU usage in millicores
    pub cpu_milli: u64,
    /// Baseline memory usage in bytes
    pub mem_bytes: u64,
}

/// Provider emitting baseline usage with a few percent of jitter. Used by
/// the simulated run mode and long-running local tests.
pub struct SimulatedMetricsProvider {
    profiles: RwLock<Vec<SimulatedProfile>>,
    jitter: f64,
}

impl SimulatedMetricsProvider {
    /// New provider with ±5% jitter
    pub fn new() -> Self {
        Self { profiles: RwLock::new(Vec::new()), jitter: 0.05 }
    }

    /// Register a baseline profile
    pub fn add_profile(&self, profile: SimulatedProfile) {
        self.profiles.write().push(profile);
    }

    fn jittered(&self, base: u64) -> u64 {
        if base == 0 {
            return 0;
        }
        let mut rng = rand::thread_rng();
        let factor = 1.0 + rng.gen_range(-self.jitter..self.jitter);
        ((base as f64) * factor).round() as u64
    }
}

impl Default for SimulatedMetricsProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsProvider for SimulatedMetricsProvider {
    async fn list_pod_metrics(&self, namespace: Option<&str>) -> Result<Vec<PodUsage>> {
        let profiles = self.profiles.read();
        let mut by_pod: HashMap<String, PodUsage> = HashMap::new();
        for p in profiles
            .iter()
            .filter(|p| namespace.map_or(true, |ns| p.namespace == ns))
        {
            let entry = by_pod
                .entry(format!("{}/{}", p.namespace, p.pod))
                .or_insert_with(|| PodUsage {
                    namespace: p.namespace.clone(),
                    pod: p.pod.clone(),
                    containers: Vec::new(),
                });
            entry.containers.push(ContainerUsage {
                name: p.container.clone(),
                cpu_milli: self.jittered(p.cpu_milli),
                mem_bytes: self.jittered(p.mem_bytes),
                throttle_percent: 0.0,
            });
        }
        Ok(by_pod.into_values().collect())
    }

    async fn list_node_metrics(&self) -> Result<Vec<NodeUsage>> {
        Ok(Vec::new())
    }
}

/// Build a provider from the configured selector.
pub fn provider_from_name(name: &str) -> Result<std::sync::Arc<dyn MetricsProvider>> {
    match name {
        "simulated" => Ok(std::sync::Arc::new(SimulatedMetricsProvider::new())),
        "in-memory" => Ok(std::sync::Arc::new(InMemoryMetricsProvider::new())),
        other => Err(RightsizerError::config(format!(
            "unknown metrics provider {:?} (external backends are injected at startup)",
            other
        ))),
    }
}
