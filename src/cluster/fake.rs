//! In-memory cluster used by tests and the simulated run mode.
//!
//! Resize behaviour is scriptable so executor and scheduler paths can be
//! driven through success, drift, timeout, infeasible and error outcomes
//! without a live control plane.

use super::client::ClusterClient;
use super::types::{LimitRangeInfo, NodeInfo, PodSnapshot, QuotaInfo, ResizePatch};
use crate::error::{Result, RightsizerError};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

/// How the fake cluster reacts to a resize patch
#[derive(Debug, Clone)]
pub enum ResizeBehavior {
    /// Apply the patch to the pod spec immediately
    Immediate,
    /// Accept the patch but never reflect it in the observed status
    AcceptNoStatus,
    /// Mark the pod resize status infeasible without applying
    Infeasible,
    /// Fail every patch with an API error
    Error {
        /// Error message returned to the caller
        message: String,
        /// Whether the error is flagged retryable
        retryable: bool,
    },
    /// Fail the first patch with a retryable error, then apply immediately
    ErrorOnceThenImmediate,
    /// Reject every patch as permission denied
    PermissionDenied,
}

/// An orchestrator event recorded by the fake
#[derive(Debug, Clone)]
pub struct RecordedEvent {
    /// Namespace of the pod the event is attached to
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Short machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
}

/// In-memory [`ClusterClient`] implementation
pub struct FakeCluster {
    pods: RwLock<HashMap<String, PodSnapshot>>,
    nodes: RwLock<HashMap<String, NodeInfo>>,
    quotas: RwLock<HashMap<String, Vec<QuotaInfo>>>,
    limit_ranges: RwLock<HashMap<String, Vec<LimitRangeInfo>>>,
    behavior: RwLock<ResizeBehavior>,
    resize_latency: RwLock<Duration>,
    failed_once: AtomicBool,
    patches: RwLock<Vec<(String, ResizePatch)>>,
    events: RwLock<Vec<RecordedEvent>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeCluster {
    /// New empty cluster applying resizes immediately
    pub fn new() -> Self {
        Self {
            pods: RwLock::new(HashMap::new()),
            nodes: RwLock::new(HashMap::new()),
            quotas: RwLock::new(HashMap::new()),
            limit_ranges: RwLock::new(HashMap::new()),
            behavior: RwLock::new(ResizeBehavior::Immediate),
            resize_latency: RwLock::new(Duration::ZERO),
            failed_once: AtomicBool::new(false),
            patches: RwLock::new(Vec::new()),
            events: RwLock::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Insert or replace a pod
    pub fn add_pod(&self, pod: PodSnapshot) {
        self.pods.write().insert(pod.key(), pod);
    }

    /// Insert or replace a node
    pub fn add_node(&self, node: NodeInfo) {
        self.nodes.write().insert(node.name.clone(), node);
    }

    /// Insert a quota into its namespace
    pub fn add_quota(&self, quota: QuotaInfo) {
        self.quotas
            .write()
            .entry(quota.namespace.clone())
            .or_default()
            .push(quota);
    }

    /// Insert a limit range into its namespace
    pub fn add_limit_range(&self, lr: LimitRangeInfo) {
        self.limit_ranges
            .write()
            .entry(lr.namespace.clone())
            .or_default()
            .push(lr);
    }

    /// Replace the scripted resize behaviour
    pub fn set_resize_behavior(&self, behavior: ResizeBehavior) {
        self.failed_once.store(false, Ordering::SeqCst);
        *self.behavior.write() = behavior;
    }

    /// Artificial latency added to every resize patch
    pub fn set_resize_latency(&self, latency: Duration) {
        *self.resize_latency.write() = latency;
    }

    /// All patches submitted so far, keyed by `namespace/pod`
    pub fn patches(&self) -> Vec<(String, ResizePatch)> {
        self.patches.read().clone()
    }

    /// All orchestrator events recorded so far
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.read().clone()
    }

    /// Current copy of a pod, if present
    pub fn pod(&self, namespace: &str, name: &str) -> Option<PodSnapshot> {
        self.pods.read().get(&format!("{}/{}", namespace, name)).cloned()
    }

    /// Highest number of concurrently in-flight resize patches observed
    pub fn max_in_flight_resizes(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn apply_patch(&self, key: &str, patch: &ResizePatch) {
        let mut pods = self.pods.write();
        if let Some(pod) = pods.get_mut(key) {
            if let Some(container) = pod.containers.iter_mut().find(|c| c.name == patch.container)
            {
                if let Some(v) = patch.resources.cpu_request {
                    container.resources.cpu_request = Some(v);
                }
                if let Some(v) = patch.resources.cpu_limit {
                    container.resources.cpu_limit = Some(v);
                }
                if let Some(v) = patch.resources.mem_request {
                    container.resources.mem_request = Some(v);
                }
                if let Some(v) = patch.resources.mem_limit {
                    container.resources.mem_limit = Some(v);
                }
            }
            pod.resize_status = None;
        }
    }
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<PodSnapshot>> {
        let pods = self.pods.read();
        Ok(pods
            .values()
            .filter(|p| namespace.map_or(true, |ns| p.namespace == ns))
            .cloned()
            .collect())
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodSnapshot> {
        self.pod(namespace, name).ok_or_else(|| RightsizerError::PodNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })
    }

    async fn get_node(&self, name: &str) -> Result<NodeInfo> {
        self.nodes
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RightsizerError::NodeNotFound { name: name.to_string() })
    }

    async fn list_quotas(&self, namespace: &str) -> Result<Vec<QuotaInfo>> {
        Ok(self.quotas.read().get(namespace).cloned().unwrap_or_default())
    }

    async fn list_limit_ranges(&self, namespace: &str) -> Result<Vec<LimitRangeInfo>> {
        Ok(self
            .limit_ranges
            .read()
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }

    async fn patch_pod_resize(
        &self,
        namespace: &str,
        name: &str,
        patch: &ResizePatch,
    ) -> Result<()> {
        let key = format!("{}/{}", namespace, name);
        if !self.pods.read().contains_key(&key) {
            return Err(RightsizerError::PodNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            });
        }

        let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
        let latency = *self.resize_latency.read();
        if latency > Duration::ZERO {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        self.patches.write().push((key.clone(), patch.clone()));

        let behavior = self.behavior.read().clone();
        match behavior {
            ResizeBehavior::Immediate => {
                self.apply_patch(&key, patch);
                Ok(())
            }
            ResizeBehavior::AcceptNoStatus => Ok(()),
            ResizeBehavior::Infeasible => {
                if let Some(pod) = self.pods.write().get_mut(&key) {
                    pod.resize_status = Some(super::types::ResizeStatus::Infeasible);
                }
                Ok(())
            }
            ResizeBehavior::Error { message, retryable } => {
                Err(RightsizerError::Api { message, retryable })
            }
            ResizeBehavior::ErrorOnceThenImmediate => {
                if !self.failed_once.swap(true, Ordering::SeqCst) {
                    Err(RightsizerError::api_retryable("transient 503"))
                } else {
                    self.apply_patch(&key, patch);
                    Ok(())
                }
            }
            ResizeBehavior::PermissionDenied => Err(RightsizerError::PermissionDenied {
                operation: format!("resize {}", key),
            }),
        }
    }

    async fn ensure_resize_policy(
        &self,
        _namespace: &str,
        _name: &str,
        _container: &str,
    ) -> Result<()> {
        Ok(())
    }

    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        annotations: &HashMap<String, String>,
    ) -> Result<()> {
        let key = format!("{}/{}", namespace, name);
        let mut pods = self.pods.write();
        let pod = pods.get_mut(&key).ok_or_else(|| RightsizerError::PodNotFound {
            namespace: namespace.to_string(),
            name: name.to_string(),
        })?;
        for (k, v) in annotations {
            pod.annotations.insert(k.clone(), v.clone());
        }
        Ok(())
    }

    async fn create_event(
        &self,
        namespace: &str,
        pod: &str,
        reason: &str,
        message: &str,
    ) -> Result<()> {
        self.events.write().push(RecordedEvent {
            namespace: namespace.to_string(),
            pod: pod.to_string(),
            reason: reason.to_string(),
            message: message.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::types::{ContainerInfo, PodPhase};
    use crate::resources::ResourceSpec;
    use chrono::Utc;

    fn pod(namespace: &str, name: &str) -> PodSnapshot {
        PodSnapshot {
            namespace: namespace.into(),
            name: name.into(),
            uid: format!("uid-{}", name),
            node_name: Some("node-1".into()),
            phase: PodPhase::Running,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            owner: None,
            containers: vec![ContainerInfo {
                name: "app".into(),
                resources: ResourceSpec::new(500, 1000, 1 << 28, 1 << 29),
                restart_count: 0,
            }],
            started_at: Some(Utc::now()),
            resize_status: None,
        }
    }

    #[tokio::test]
    async fn immediate_resize_is_observed() {
        let cluster = FakeCluster::new();
        cluster.add_pod(pod("default", "a"));
        let patch = ResizePatch {
            container: "app".into(),
            resources: ResourceSpec {
                cpu_request: Some(250),
                cpu_limit: Some(375),
                ..Default::default()
            },
        };
        cluster.patch_pod_resize("default", "a", &patch).await.unwrap();
        let updated = cluster.pod("default", "a").unwrap();
        assert_eq!(updated.containers[0].resources.cpu_request, Some(250));
        // untouched fields survive the merge
        assert_eq!(updated.containers[0].resources.mem_request, Some(1 << 28));
    }

    #[tokio::test]
    async fn error_once_then_succeeds() {
        let cluster = FakeCluster::new();
        cluster.add_pod(pod("default", "a"));
        cluster.set_resize_behavior(ResizeBehavior::ErrorOnceThenImmediate);
        let patch = ResizePatch {
            container: "app".into(),
            resources: ResourceSpec { cpu_request: Some(100), ..Default::default() },
        };
        let first = cluster.patch_pod_resize("default", "a", &patch).await;
        assert!(first.unwrap_err().is_retryable());
        cluster.patch_pod_resize("default", "a", &patch).await.unwrap();
    }

    #[tokio::test]
    async fn namespace_filter_applies() {
        let cluster = FakeCluster::new();
        cluster.add_pod(pod("default", "a"));
        cluster.add_pod(pod("kube-system", "b"));
        assert_eq!(cluster.list_pods(Some("default")).await.unwrap().len(), 1);
        assert_eq!(cluster.list_pods(None).await.unwrap().len(), 2);
    }
}
