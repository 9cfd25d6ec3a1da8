//! Admission pipeline: validates a proposed resource spec against static
//! bounds, node capacity, quotas, limit ranges, QoS preservation and the
//! safety threshold.
//!
//! Every check runs so the caller sees every problem. A result is valid
//! iff it carries no errors; warnings do not block a mutation.

mod caches;

pub use caches::TtlCache;

use crate::cluster::{ClusterClient, LimitRangeInfo, NodeInfo, PodPhase, PodSnapshot, QuotaInfo};
use crate::resources::{
    format_cpu_milli, format_mem_bytes, pod_qos_class, QosClass, ResourceDimension, ResourceSpec,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Cache TTL for node, quota and limit-range lookups
const CACHE_TTL: Duration = Duration::from_secs(60);

/// Outcome of validating one proposed spec
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Blocking problems; non-empty means the mutation must not proceed
    pub errors: Vec<String>,
    /// Non-blocking problems the operator should know about
    pub warnings: Vec<String>,
    /// Informational notes
    pub infos: Vec<String>,
}

impl ValidationResult {
    /// Valid iff there are no errors
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    fn warn(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    fn info(&mut self, message: impl Into<String>) {
        self.infos.push(message.into());
    }

    /// All errors joined into one message
    pub fn error_summary(&self) -> String {
        self.errors.join("; ")
    }
}

/// Static bounds and gates the pipeline enforces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Smallest allowed CPU request, millicores
    pub min_cpu_request_milli: u64,
    /// Smallest allowed memory request, bytes
    pub min_mem_request_bytes: u64,
    /// Largest allowed CPU limit, millicores
    pub max_cpu_limit_milli: u64,
    /// Largest allowed memory limit, bytes
    pub max_mem_limit_bytes: u64,
    /// Maximum per-mutation fractional change before a safety warning
    pub safety_threshold: f64,
    /// Escalate safety-threshold violations to errors
    pub strict_safety: bool,
    /// Allow mutations that raise the pod QoS class
    pub allow_qos_upgrade: bool,
    /// Allow mutations that lower the pod QoS class
    pub allow_qos_downgrade: bool,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            min_cpu_request_milli: 10,
            min_mem_request_bytes: 16 * 1024 * 1024,
            max_cpu_limit_milli: 8000,
            max_mem_limit_bytes: 16 * 1024 * 1024 * 1024,
            safety_threshold: 0.5,
            strict_safety: false,
            allow_qos_upgrade: false,
            allow_qos_downgrade: false,
        }
    }
}

/// The admission pipeline with its lookup caches
pub struct AdmissionPipeline {
    client: Arc<dyn ClusterClient>,
    op_timeout: Duration,
    node_cache: TtlCache<String, NodeInfo>,
    quota_cache: TtlCache<String, Vec<QuotaInfo>>,
    limit_range_cache: TtlCache<String, Vec<LimitRangeInfo>>,
}

impl AdmissionPipeline {
    /// New pipeline over a cluster client
    pub fn new(client: Arc<dyn ClusterClient>, op_timeout: Duration) -> Self {
        Self {
            client,
            op_timeout,
            node_cache: TtlCache::new(CACHE_TTL),
            quota_cache: TtlCache::new(CACHE_TTL),
            limit_range_cache: TtlCache::new(CACHE_TTL),
        }
    }

    /// Drop cached state for one node
    pub fn invalidate_node(&self, name: &str) {
        self.node_cache.invalidate(&name.to_string());
    }

    /// Drop cached quota and limit-range state for one namespace
    pub fn invalidate_namespace(&self, namespace: &str) {
        self.quota_cache.invalidate(&namespace.to_string());
        self.limit_range_cache.invalidate(&namespace.to_string());
    }

    /// Drop all cached state
    pub fn invalidate_all(&self) {
        self.node_cache.invalidate_all();
        self.quota_cache.invalidate_all();
        self.limit_range_cache.invalidate_all();
    }

    /// Run every check against a proposed spec for one container.
    pub async fn validate(
        &self,
        config: &AdmissionConfig,
        pod: &PodSnapshot,
        container_name: &str,
        proposed: &ResourceSpec,
    ) -> ValidationResult {
        let mut result = ValidationResult::default();
        let current = pod
            .container(container_name)
            .map(|c| c.resources)
            .unwrap_or_default();

        self.check_basic(&mut result, proposed);
        self.check_static_bounds(config, &mut result, proposed);
        self.check_safety_threshold(config, &mut result, &current, proposed);
        self.check_node_capacity(&mut result, pod, proposed).await;
        self.check_quota(&mut result, pod, &current, proposed).await;
        self.check_limit_range(&mut result, pod, proposed).await;
        self.check_qos(config, &mut result, pod, container_name, proposed);

        debug!(
            pod = %pod.key(),
            container = container_name,
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            "admission checks complete"
        );
        result
    }

    fn check_basic(&self, result: &mut ValidationResult, proposed: &ResourceSpec) {
        if let (Some(request), Some(limit)) = (proposed.cpu_request, proposed.cpu_limit) {
            if request > limit {
                result.error(format!(
                    "CPU request {} exceeds limit {}",
                    format_cpu_milli(request),
                    format_cpu_milli(limit)
                ));
            }
        }
        if let (Some(request), Some(limit)) = (proposed.mem_request, proposed.mem_limit) {
            if request > limit {
                result.error(format!(
                    "memory request {} exceeds limit {}",
                    format_mem_bytes(request),
                    format_mem_bytes(limit)
                ));
            }
        }
    }

    fn check_static_bounds(
        &self,
        config: &AdmissionConfig,
        result: &mut ValidationResult,
        proposed: &ResourceSpec,
    ) {
        if let Some(request) = proposed.cpu_request {
            if request < config.min_cpu_request_milli {
                result.error(format!(
                    "CPU request {} below configured minimum {}",
                    format_cpu_milli(request),
                    format_cpu_milli(config.min_cpu_request_milli)
                ));
            }
        }
        if let Some(request) = proposed.mem_request {
            if request < config.min_mem_request_bytes {
                result.error(format!(
                    "memory request {} below configured minimum {}",
                    format_mem_bytes(request),
                    format_mem_bytes(config.min_mem_request_bytes)
                ));
            }
        }
        if let Some(limit) = proposed.cpu_limit {
            if limit > config.max_cpu_limit_milli {
                result.error(format!(
                    "CPU limit {} above configured maximum {}",
                    format_cpu_milli(limit),
                    format_cpu_milli(config.max_cpu_limit_milli)
                ));
            }
        }
        if let Some(limit) = proposed.mem_limit {
            if limit > config.max_mem_limit_bytes {
                result.error(format!(
                    "memory limit {} above configured maximum {}",
                    format_mem_bytes(limit),
                    format_mem_bytes(config.max_mem_limit_bytes)
                ));
            }
        }
    }

    fn check_safety_threshold(
        &self,
        config: &AdmissionConfig,
        result: &mut ValidationResult,
        current: &ResourceSpec,
        proposed: &ResourceSpec,
    ) {
        for dim in [ResourceDimension::Cpu, ResourceDimension::Memory] {
            let (cur_request, cur_limit) = current.pair(dim);
            let (new_request, new_limit) = proposed.pair(dim);
            for (label, old, new) in [
                ("request", cur_request, new_request),
                ("limit", cur_limit, new_limit),
            ] {
                let new = match new {
                    Some(v) => v,
                    None => continue,
                };
                let old = old.unwrap_or(0);
                let ratio = (new as f64 - old as f64).abs() / (old.max(1)) as f64;
                if ratio > config.safety_threshold {
                    let message = format!(
                        "{} {} change of {:.0}% exceeds safety threshold {:.0}%",
                        dim,
                        label,
                        ratio * 100.0,
                        config.safety_threshold * 100.0
                    );
                    if config.strict_safety {
                        result.error(message);
                    } else {
                        result.warn(message);
                    }
                }
            }
        }
    }

    async fn check_node_capacity(
        &self,
        result: &mut ValidationResult,
        pod: &PodSnapshot,
        proposed: &ResourceSpec,
    ) {
        let node_name = match &pod.node_name {
            Some(name) => name.clone(),
            None => {
                result.info("pod not scheduled, node capacity not checked".to_string());
                return;
            }
        };

        let node = match self.node(&node_name).await {
            Ok(node) => node,
            Err(err) => {
                result.warn(format!("node capacity check skipped: {}", err));
                return;
            }
        };

        let peers = match tokio::time::timeout(self.op_timeout, self.client.list_pods(None)).await
        {
            Ok(Ok(pods)) => pods,
            Ok(Err(err)) => {
                result.warn(format!("node capacity check skipped: {}", err));
                return;
            }
            Err(_) => {
                result.warn("node capacity check skipped: pod list timed out".to_string());
                return;
            }
        };

        let mut used_cpu = 0u64;
        let mut used_mem = 0u64;
        for peer in peers.iter().filter(|p| {
            p.node_name.as_deref() == Some(node_name.as_str())
                && matches!(p.phase, PodPhase::Running | PodPhase::Pending)
                && p.key() != pod.key()
        }) {
            used_cpu += peer.total_cpu_request();
            used_mem += peer.total_mem_request();
        }
        let available_cpu = node.allocatable_cpu_milli.saturating_sub(used_cpu);
        let available_mem = node.allocatable_mem_bytes.saturating_sub(used_mem);

        if let Some(request) = proposed.cpu_request {
            if request > available_cpu {
                result.error(format!(
                    "CPU request {} exceeds available {} on node {}",
                    format_cpu_milli(request),
                    format_cpu_milli(available_cpu),
                    node_name
                ));
            }
        }
        if let Some(request) = proposed.mem_request {
            if request > available_mem {
                result.error(format!(
                    "memory request {} exceeds available {} on node {}",
                    format_mem_bytes(request),
                    format_mem_bytes(available_mem),
                    node_name
                ));
            }
        }
        if let Some(limit) = proposed.cpu_limit {
            if limit > node.allocatable_cpu_milli {
                result.error(format!(
                    "CPU limit {} exceeds allocatable {} on node {}",
                    format_cpu_milli(limit),
                    format_cpu_milli(node.allocatable_cpu_milli),
                    node_name
                ));
            }
        }
        if let Some(limit) = proposed.mem_limit {
            if limit > node.allocatable_mem_bytes {
                result.error(format!(
                    "memory limit {} exceeds allocatable {} on node {}",
                    format_mem_bytes(limit),
                    format_mem_bytes(node.allocatable_mem_bytes),
                    node_name
                ));
            }
        }
    }

    async fn check_quota(
        &self,
        result: &mut ValidationResult,
        pod: &PodSnapshot,
        current: &ResourceSpec,
        proposed: &ResourceSpec,
    ) {
        let quotas = match self.quotas(&pod.namespace).await {
            Ok(quotas) => quotas,
            Err(err) => {
                result.warn(format!("quota check skipped: {}", err));
                return;
            }
        };
        for quota in &quotas {
            if let (Some(hard), Some(new)) = (quota.cpu_request_hard, proposed.cpu_request) {
                let old = current.cpu_request.unwrap_or(0);
                let projected = quota.cpu_request_used.saturating_sub(old) + new;
                if projected > hard {
                    result.error(format!(
                        "CPU requests would exceed quota {} in namespace {}: {} > {}",
                        quota.name,
                        pod.namespace,
                        format_cpu_milli(projected),
                        format_cpu_milli(hard)
                    ));
                }
            }
            if let (Some(hard), Some(new)) = (quota.mem_request_hard, proposed.mem_request) {
                let old = current.mem_request.unwrap_or(0);
                let projected = quota.mem_request_used.saturating_sub(old) + new;
                if projected > hard {
                    result.error(format!(
                        "memory requests would exceed quota {} in namespace {}: {} > {}",
                        quota.name,
                        pod.namespace,
                        format_mem_bytes(projected),
                        format_mem_bytes(hard)
                    ));
                }
            }
        }
    }

    async fn check_limit_range(
        &self,
        result: &mut ValidationResult,
        pod: &PodSnapshot,
        proposed: &ResourceSpec,
    ) {
        let ranges = match self.limit_ranges(&pod.namespace).await {
            Ok(ranges) => ranges,
            Err(err) => {
                result.warn(format!("limit range check skipped: {}", err));
                return;
            }
        };
        for lr in &ranges {
            if let (Some(min), Some(request)) = (lr.min_cpu_milli, proposed.cpu_request) {
                if request < min {
                    result.error(format!(
                        "CPU request {} below limit range {} minimum {}",
                        format_cpu_milli(request),
                        lr.name,
                        format_cpu_milli(min)
                    ));
                }
            }
            if let (Some(min), Some(request)) = (lr.min_mem_bytes, proposed.mem_request) {
                if request < min {
                    result.error(format!(
                        "memory request {} below limit range {} minimum {}",
                        format_mem_bytes(request),
                        lr.name,
                        format_mem_bytes(min)
                    ));
                }
            }
            if let (Some(max), Some(limit)) = (lr.max_cpu_milli, proposed.cpu_limit) {
                if limit > max {
                    result.error(format!(
                        "CPU limit {} above limit range {} maximum {}",
                        format_cpu_milli(limit),
                        lr.name,
                        format_cpu_milli(max)
                    ));
                }
            }
            if let (Some(max), Some(limit)) = (lr.max_mem_bytes, proposed.mem_limit) {
                if limit > max {
                    result.error(format!(
                        "memory limit {} above limit range {} maximum {}",
                        format_mem_bytes(limit),
                        lr.name,
                        format_mem_bytes(max)
                    ));
                }
            }
            if let (Some(max_ratio), Some(request), Some(limit)) =
                (lr.max_limit_request_ratio_cpu, proposed.cpu_request, proposed.cpu_limit)
            {
                if request > 0 && limit as f64 / request as f64 > max_ratio {
                    result.error(format!(
                        "CPU limit/request ratio {:.2} above limit range {} maximum {:.2}",
                        limit as f64 / request as f64,
                        lr.name,
                        max_ratio
                    ));
                }
            }
            if let (Some(max_ratio), Some(request), Some(limit)) =
                (lr.max_limit_request_ratio_mem, proposed.mem_request, proposed.mem_limit)
            {
                if request > 0 && limit as f64 / request as f64 > max_ratio {
                    result.error(format!(
                        "memory limit/request ratio {:.2} above limit range {} maximum {:.2}",
                        limit as f64 / request as f64,
                        lr.name,
                        max_ratio
                    ));
                }
            }
        }
    }

    fn check_qos(
        &self,
        config: &AdmissionConfig,
        result: &mut ValidationResult,
        pod: &PodSnapshot,
        container_name: &str,
        proposed: &ResourceSpec,
    ) {
        let current_qos = pod.qos_class();
        let specs: Vec<ResourceSpec> = pod
            .containers
            .iter()
            .map(|c| if c.name == container_name { *proposed } else { c.resources })
            .collect();
        let proposed_qos = pod_qos_class(&specs);

        if proposed_qos == current_qos {
            return;
        }
        let upgrade = proposed_qos.rank() > current_qos.rank();
        if upgrade && config.allow_qos_upgrade {
            result.info(format!("QoS upgrade {} -> {} allowed by gate", current_qos, proposed_qos));
            return;
        }
        if !upgrade && config.allow_qos_downgrade {
            result.info(format!(
                "QoS downgrade {} -> {} allowed by gate",
                current_qos, proposed_qos
            ));
            return;
        }
        if current_qos == QosClass::Guaranteed {
            result.error(format!(
                "Guaranteed QoS requires request==limit for every declared resource \
                 (change would move pod to {})",
                proposed_qos
            ));
        } else {
            let verb = if upgrade { "upgrade" } else { "downgrade" };
            result.error(format!(
                "QoS {} from {} to {} is not allowed",
                verb, current_qos, proposed_qos
            ));
        }
    }

    async fn node(&self, name: &str) -> crate::error::Result<NodeInfo> {
        if let Some(node) = self.node_cache.get(&name.to_string()) {
            return Ok(node);
        }
        let node = tokio::time::timeout(self.op_timeout, self.client.get_node(name))
            .await
            .map_err(|_| crate::error::RightsizerError::Timeout {
                operation: format!("get node {}", name),
                duration: self.op_timeout,
            })??;
        self.node_cache.insert(name.to_string(), node.clone());
        Ok(node)
    }

    async fn quotas(&self, namespace: &str) -> crate::error::Result<Vec<QuotaInfo>> {
        if let Some(quotas) = self.quota_cache.get(&namespace.to_string()) {
            return Ok(quotas);
        }
        let quotas = tokio::time::timeout(self.op_timeout, self.client.list_quotas(namespace))
            .await
            .map_err(|_| crate::error::RightsizerError::Timeout {
                operation: format!("list quotas in {}", namespace),
                duration: self.op_timeout,
            })??;
        self.quota_cache.insert(namespace.to_string(), quotas.clone());
        Ok(quotas)
    }

    async fn limit_ranges(&self, namespace: &str) -> crate::error::Result<Vec<LimitRangeInfo>> {
        if let Some(ranges) = self.limit_range_cache.get(&namespace.to_string()) {
            return Ok(ranges);
        }
        let ranges =
            tokio::time::timeout(self.op_timeout, self.client.list_limit_ranges(namespace))
                .await
                .map_err(|_| crate::error::RightsizerError::Timeout {
                    operation: format!("list limit ranges in {}", namespace),
                    duration: self.op_timeout,
                })??;
        if ranges.is_empty() {
            // cache the miss too, most namespaces carry no limit range
            self.limit_range_cache.insert(namespace.to_string(), Vec::new());
        } else {
            self.limit_range_cache.insert(namespace.to_string(), ranges.clone());
        }
        Ok(ranges)
    }
}

impl std::fmt::Debug for AdmissionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionPipeline")
            .field("cached_nodes", &self.node_cache.len())
            .field("cached_quota_namespaces", &self.quota_cache.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{ContainerInfo, FakeCluster};
    use crate::resources::BYTES_PER_MIB;
    use chrono::Utc;
    use std::collections::HashMap;

    fn pod_on_node(name: &str, node: Option<&str>, resources: ResourceSpec) -> PodSnapshot {
        PodSnapshot {
            namespace: "default".into(),
            name: name.into(),
            uid: format!("uid-{}", name),
            node_name: node.map(|n| n.to_string()),
            phase: PodPhase::Running,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            owner: None,
            containers: vec![ContainerInfo {
                name: "app".into(),
                resources,
                restart_count: 0,
            }],
            started_at: Some(Utc::now()),
            resize_status: None,
        }
    }

    fn pipeline(cluster: &Arc<FakeCluster>) -> AdmissionPipeline {
        AdmissionPipeline::new(cluster.clone() as Arc<dyn ClusterClient>, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn request_above_limit_is_rejected() {
        let cluster = Arc::new(FakeCluster::new());
        let pod = pod_on_node("a", None, ResourceSpec::default());
        let proposed = ResourceSpec {
            cpu_request: Some(300),
            cpu_limit: Some(200),
            ..Default::default()
        };
        let result = pipeline(&cluster)
            .validate(&AdmissionConfig::default(), &pod, "app", &proposed)
            .await;
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("CPU request 300m exceeds limit 200m"));
    }

    #[tokio::test]
    async fn static_bounds_are_enforced() {
        let cluster = Arc::new(FakeCluster::new());
        let current = ResourceSpec {
            cpu_request: Some(100),
            mem_request: Some(32 * 1024 * 1024),
            ..Default::default()
        };
        let pod = pod_on_node("a", None, current);
        let proposed = ResourceSpec {
            cpu_request: Some(5),
            cpu_limit: Some(9000),
            mem_request: Some(1024 * 1024),
            mem_limit: Some(32 * 1024 * 1024 * 1024),
        };
        let result = pipeline(&cluster)
            .validate(&AdmissionConfig::default(), &pod, "app", &proposed)
            .await;
        assert_eq!(result.errors.len(), 4);
    }

    #[tokio::test]
    async fn safety_threshold_warns_but_passes() {
        let cluster = Arc::new(FakeCluster::new());
        let current = ResourceSpec { cpu_request: Some(100), ..Default::default() };
        let pod = pod_on_node("a", None, current);
        let proposed = ResourceSpec { cpu_request: Some(250), ..Default::default() };
        let result = pipeline(&cluster)
            .validate(&AdmissionConfig::default(), &pod, "app", &proposed)
            .await;
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("150%"));
    }

    #[tokio::test]
    async fn strict_safety_escalates_to_error() {
        let cluster = Arc::new(FakeCluster::new());
        let current = ResourceSpec { cpu_request: Some(100), ..Default::default() };
        let pod = pod_on_node("a", None, current);
        let proposed = ResourceSpec { cpu_request: Some(250), ..Default::default() };
        let config = AdmissionConfig { strict_safety: true, ..Default::default() };
        let result = pipeline(&cluster).validate(&config, &pod, "app", &proposed).await;
        assert!(!result.is_valid());
    }

    #[tokio::test]
    async fn node_capacity_rejects_oversized_request() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_node(NodeInfo {
            name: "node-1".into(),
            allocatable_cpu_milli: 2000,
            allocatable_mem_bytes: 8 * 1024 * 1024 * 1024,
        });
        // neighbours consume 1800m
        let neighbour = pod_on_node(
            "busy",
            Some("node-1"),
            ResourceSpec {
                cpu_request: Some(1800),
                mem_request: Some(1024 * BYTES_PER_MIB),
                ..Default::default()
            },
        );
        cluster.add_pod(neighbour);
        let subject = pod_on_node(
            "subject",
            Some("node-1"),
            ResourceSpec { cpu_request: Some(100), ..Default::default() },
        );
        cluster.add_pod(subject.clone());

        let proposed = ResourceSpec { cpu_request: Some(300), ..Default::default() };
        let result = pipeline(&cluster)
            .validate(&AdmissionConfig::default(), &subject, "app", &proposed)
            .await;
        assert!(!result.is_valid());
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("CPU request 300m exceeds available 200m")));
    }

    #[tokio::test]
    async fn quota_projection_is_enforced() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_quota(QuotaInfo {
            name: "compute".into(),
            namespace: "default".into(),
            cpu_request_hard: Some(2000),
            cpu_request_used: 1900,
            mem_request_hard: None,
            mem_request_used: 0,
        });
        let current = ResourceSpec { cpu_request: Some(100), ..Default::default() };
        let pod = pod_on_node("a", None, current);
        // projected: 1900 - 100 + 400 = 2200 > 2000
        let proposed = ResourceSpec { cpu_request: Some(400), ..Default::default() };
        let result = pipeline(&cluster)
            .validate(&AdmissionConfig::default(), &pod, "app", &proposed)
            .await;
        assert!(result.errors.iter().any(|e| e.contains("exceed quota")));

        // 1900 - 100 + 200 = 2000 fits exactly
        let proposed = ResourceSpec { cpu_request: Some(200), ..Default::default() };
        let result = pipeline(&cluster)
            .validate(&AdmissionConfig::default(), &pod, "app", &proposed)
            .await;
        assert!(result.is_valid());
    }

    #[tokio::test]
    async fn limit_range_ratio_is_enforced() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_limit_range(LimitRangeInfo {
            name: "lr".into(),
            namespace: "default".into(),
            min_cpu_milli: Some(50),
            min_mem_bytes: None,
            max_cpu_milli: Some(4000),
            max_mem_bytes: None,
            max_limit_request_ratio_cpu: Some(2.0),
            max_limit_request_ratio_mem: None,
        });
        let pod = pod_on_node("a", None, ResourceSpec::default());
        let proposed = ResourceSpec {
            cpu_request: Some(100),
            cpu_limit: Some(300),
            ..Default::default()
        };
        let result = pipeline(&cluster)
            .validate(&AdmissionConfig::default(), &pod, "app", &proposed)
            .await;
        assert!(result.errors.iter().any(|e| e.contains("limit/request ratio")));
    }

    #[tokio::test]
    async fn guaranteed_qos_shape_is_required() {
        let cluster = Arc::new(FakeCluster::new());
        let current = ResourceSpec::new(500, 500, 512 * BYTES_PER_MIB, 512 * BYTES_PER_MIB);
        let pod = pod_on_node("a", None, current);
        // request raised without the limit: pod would drop out of Guaranteed
        let proposed = ResourceSpec::new(600, 650, 512 * BYTES_PER_MIB, 512 * BYTES_PER_MIB);
        let result = pipeline(&cluster)
            .validate(&AdmissionConfig::default(), &pod, "app", &proposed)
            .await;
        assert!(!result.is_valid());
        assert!(result
            .errors
            .iter()
            .any(|e| e.contains("Guaranteed QoS requires request==limit")));

        // the equality-preserving resize is allowed
        let proposed = ResourceSpec::new(600, 600, 512 * BYTES_PER_MIB, 512 * BYTES_PER_MIB);
        let result = pipeline(&cluster)
            .validate(&AdmissionConfig::default(), &pod, "app", &proposed)
            .await;
        assert!(result.is_valid());
    }

    #[tokio::test]
    async fn qos_downgrade_allowed_by_gate() {
        let cluster = Arc::new(FakeCluster::new());
        let current = ResourceSpec::new(500, 500, 512 * BYTES_PER_MIB, 512 * BYTES_PER_MIB);
        let pod = pod_on_node("a", None, current);
        let proposed = ResourceSpec::new(500, 750, 512 * BYTES_PER_MIB, 512 * BYTES_PER_MIB);
        let config = AdmissionConfig { allow_qos_downgrade: true, ..Default::default() };
        let result = pipeline(&cluster).validate(&config, &pod, "app", &proposed).await;
        assert!(result.is_valid());
        assert!(!result.infos.is_empty());
    }

    #[tokio::test]
    async fn node_cache_serves_until_invalidated() {
        let cluster = Arc::new(FakeCluster::new());
        cluster.add_node(NodeInfo {
            name: "node-1".into(),
            allocatable_cpu_milli: 2000,
            allocatable_mem_bytes: 1 << 33,
        });
        let pipeline = pipeline(&cluster);
        let first = pipeline.node("node-1").await.unwrap();
        assert_eq!(first.allocatable_cpu_milli, 2000);

        // grow the node; the cache still answers with the old value
        cluster.add_node(NodeInfo {
            name: "node-1".into(),
            allocatable_cpu_milli: 4000,
            allocatable_mem_bytes: 1 << 33,
        });
        assert_eq!(pipeline.node("node-1").await.unwrap().allocatable_cpu_milli, 2000);

        pipeline.invalidate_node("node-1");
        assert_eq!(pipeline.node("node-1").await.unwrap().allocatable_cpu_milli, 4000);
    }
}
