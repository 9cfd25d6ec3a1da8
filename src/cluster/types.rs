//! Typed orchestrator model used by the reconciliation loop.
//!
//! These are read-only snapshots of cluster state. Ownership is carried as
//! identity tuples, never as strong references back into a cache.

use crate::resources::{
    format_cpu_milli, format_mem_bytes, pod_qos_class, QosClass, ResourceSpec,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Kind of the parent workload controller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadKind {
    /// Deployment-managed pods
    Deployment,
    /// StatefulSet-managed pods
    StatefulSet,
    /// DaemonSet-managed pods
    DaemonSet,
    /// Job-managed pods
    Job,
    /// CronJob-managed pods
    CronJob,
    /// Bare ReplicaSet-managed pods
    ReplicaSet,
    /// Standalone pod with no owner
    Pod,
}

impl fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Deployment => "Deployment",
            Self::StatefulSet => "StatefulSet",
            Self::DaemonSet => "DaemonSet",
            Self::Job => "Job",
            Self::CronJob => "CronJob",
            Self::ReplicaSet => "ReplicaSet",
            Self::Pod => "Pod",
        };
        write!(f, "{}", s)
    }
}

impl FromStr for WorkloadKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Deployment" => Ok(Self::Deployment),
            "StatefulSet" => Ok(Self::StatefulSet),
            "DaemonSet" => Ok(Self::DaemonSet),
            "Job" => Ok(Self::Job),
            "CronJob" => Ok(Self::CronJob),
            "ReplicaSet" => Ok(Self::ReplicaSet),
            "Pod" => Ok(Self::Pod),
            other => Err(format!("unknown workload kind: {}", other)),
        }
    }
}

/// Owner reference on a pod
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRef {
    /// Controller kind
    pub kind: WorkloadKind,
    /// Controller name
    pub name: String,
}

/// Identity of one container within a parent workload
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkloadId {
    /// Pod namespace
    pub namespace: String,
    /// Parent workload kind
    pub kind: WorkloadKind,
    /// Parent workload name (the pod name for standalone pods)
    pub name: String,
    /// Container name
    pub container: String,
}

impl fmt::Display for WorkloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.namespace, self.kind, self.name, self.container
        )
    }
}

/// Pod lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    /// Accepted but not all containers started
    Pending,
    /// Bound to a node, containers running
    Running,
    /// All containers terminated successfully
    Succeeded,
    /// At least one container terminated in failure
    Failed,
    /// State could not be obtained
    Unknown,
}

/// Observed in-place resize state reported on the pod
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResizeStatus {
    /// The resize is being actuated
    InProgress,
    /// The node has deferred the resize
    Deferred,
    /// The node cannot satisfy the resize
    Infeasible,
}

/// One container inside a pod snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerInfo {
    /// Container name
    pub name: String,
    /// Declared requests and limits
    pub resources: ResourceSpec,
    /// Restart count from the container status
    pub restart_count: u32,
}

/// Read-only snapshot of one pod
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodSnapshot {
    /// Namespace
    pub namespace: String,
    /// Pod name
    pub name: String,
    /// Unique id of the pod object
    pub uid: String,
    /// Node the pod is scheduled on, if any
    pub node_name: Option<String>,
    /// Lifecycle phase
    pub phase: PodPhase,
    /// Pod labels
    pub labels: HashMap<String, String>,
    /// Pod annotations
    pub annotations: HashMap<String, String>,
    /// Controller owner reference, if owned
    pub owner: Option<OwnerRef>,
    /// Containers with their declared resources
    pub containers: Vec<ContainerInfo>,
    /// When the pod started
    pub started_at: Option<DateTime<Utc>>,
    /// In-place resize state, if a resize is pending
    pub resize_status: Option<ResizeStatus>,
}

impl PodSnapshot {
    /// `namespace/name` key
    pub fn key(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Look up a container by name
    pub fn container(&self, name: &str) -> Option<&ContainerInfo> {
        self.containers.iter().find(|c| c.name == name)
    }

    /// Pod QoS class derived from all containers
    pub fn qos_class(&self) -> QosClass {
        let specs: Vec<ResourceSpec> = self.containers.iter().map(|c| c.resources).collect();
        pod_qos_class(&specs)
    }

    /// Workload identity for one of this pod's containers.
    ///
    /// Resolved by walking the owner reference; an unowned pod is its own
    /// workload.
    pub fn workload_id(&self, container: &str) -> WorkloadId {
        match &self.owner {
            Some(owner) => WorkloadId {
                namespace: self.namespace.clone(),
                kind: owner.kind,
                name: owner.name.clone(),
                container: container.to_string(),
            },
            None => WorkloadId {
                namespace: self.namespace.clone(),
                kind: WorkloadKind::Pod,
                name: self.name.clone(),
                container: container.to_string(),
            },
        }
    }

    /// Highest restart count across containers
    pub fn max_restart_count(&self) -> u32 {
        self.containers.iter().map(|c| c.restart_count).max().unwrap_or(0)
    }

    /// Sum of declared CPU requests across containers, in millicores
    pub fn total_cpu_request(&self) -> u64 {
        self.containers
            .iter()
            .filter_map(|c| c.resources.cpu_request)
            .sum()
    }

    /// Sum of declared memory requests across containers, in bytes
    pub fn total_mem_request(&self) -> u64 {
        self.containers
            .iter()
            .filter_map(|c| c.resources.mem_request)
            .sum()
    }
}

/// Node capacity snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Node name
    pub name: String,
    /// Allocatable CPU in millicores
    pub allocatable_cpu_milli: u64,
    /// Allocatable memory in bytes
    pub allocatable_mem_bytes: u64,
}

/// Namespace resource quota snapshot (requests only)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaInfo {
    /// Quota object name
    pub name: String,
    /// Namespace the quota applies to
    pub namespace: String,
    /// Hard cap on summed CPU requests, millicores
    pub cpu_request_hard: Option<u64>,
    /// Currently used summed CPU requests, millicores
    pub cpu_request_used: u64,
    /// Hard cap on summed memory requests, bytes
    pub mem_request_hard: Option<u64>,
    /// Currently used summed memory requests, bytes
    pub mem_request_used: u64,
}

/// Container-type limit range snapshot for a namespace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitRangeInfo {
    /// Limit range object name
    pub name: String,
    /// Namespace the limit range applies to
    pub namespace: String,
    /// Minimum CPU request, millicores
    pub min_cpu_milli: Option<u64>,
    /// Minimum memory request, bytes
    pub min_mem_bytes: Option<u64>,
    /// Maximum CPU limit, millicores
    pub max_cpu_milli: Option<u64>,
    /// Maximum memory limit, bytes
    pub max_mem_bytes: Option<u64>,
    /// Maximum allowed limit/request ratio for CPU
    pub max_limit_request_ratio_cpu: Option<f64>,
    /// Maximum allowed limit/request ratio for memory
    pub max_limit_request_ratio_mem: Option<f64>,
}

/// Patch applied through the resize subresource. Restricted to one
/// container's requests and limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResizePatch {
    /// Target container name
    pub container: String,
    /// Desired requests and limits
    pub resources: ResourceSpec,
}

impl ResizePatch {
    /// JSON-merge-patch body for the resize subresource
    pub fn to_merge_patch(&self) -> serde_json::Value {
        let mut requests = serde_json::Map::new();
        let mut limits = serde_json::Map::new();
        if let Some(v) = self.resources.cpu_request {
            requests.insert("cpu".into(), format_cpu_milli(v).into());
        }
        if let Some(v) = self.resources.mem_request {
            requests.insert("memory".into(), format_mem_bytes(v).into());
        }
        if let Some(v) = self.resources.cpu_limit {
            limits.insert("cpu".into(), format_cpu_milli(v).into());
        }
        if let Some(v) = self.resources.mem_limit {
            limits.insert("memory".into(), format_mem_bytes(v).into());
        }
        serde_json::json!({
            "spec": {
                "containers": [{
                    "name": self.container,
                    "resources": {
                        "requests": requests,
                        "limits": limits,
                    }
                }]
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::BYTES_PER_MIB;

    fn pod_with_owner(owner: Option<OwnerRef>) -> PodSnapshot {
        PodSnapshot {
            namespace: "default".into(),
            name: "web-abc123".into(),
            uid: "uid-1".into(),
            node_name: Some("node-1".into()),
            phase: PodPhase::Running,
            labels: HashMap::new(),
            annotations: HashMap::new(),
            owner,
            containers: vec![ContainerInfo {
                name: "app".into(),
                resources: ResourceSpec::new(500, 1000, 256 * BYTES_PER_MIB, 512 * BYTES_PER_MIB),
                restart_count: 0,
            }],
            started_at: Some(Utc::now()),
            resize_status: None,
        }
    }

    #[test]
    fn workload_id_walks_owner() {
        let pod = pod_with_owner(Some(OwnerRef {
            kind: WorkloadKind::Deployment,
            name: "web".into(),
        }));
        let id = pod.workload_id("app");
        assert_eq!(id.kind, WorkloadKind::Deployment);
        assert_eq!(id.name, "web");
        assert_eq!(id.to_string(), "default/Deployment/web/app");
    }

    #[test]
    fn unowned_pod_is_its_own_workload() {
        let pod = pod_with_owner(None);
        let id = pod.workload_id("app");
        assert_eq!(id.kind, WorkloadKind::Pod);
        assert_eq!(id.name, "web-abc123");
    }

    #[test]
    fn merge_patch_shape() {
        let patch = ResizePatch {
            container: "app".into(),
            resources: ResourceSpec::new(165, 248, 256 * BYTES_PER_MIB, 512 * BYTES_PER_MIB),
        };
        let value = patch.to_merge_patch();
        let containers = &value["spec"]["containers"];
        assert_eq!(containers[0]["name"], "app");
        assert_eq!(containers[0]["resources"]["requests"]["cpu"], "165m");
        assert_eq!(containers[0]["resources"]["requests"]["memory"], "256Mi");
        assert_eq!(containers[0]["resources"]["limits"]["cpu"], "248m");
    }

    #[test]
    fn pod_request_totals() {
        let pod = pod_with_owner(None);
        assert_eq!(pod.total_cpu_request(), 500);
        assert_eq!(pod.total_mem_request(), 256 * BYTES_PER_MIB);
    }
}
