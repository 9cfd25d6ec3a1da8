//! Typed orchestrator model and client seam.

pub mod client;
pub mod fake;
pub mod types;

pub use client::ClusterClient;
pub use fake::{FakeCluster, RecordedEvent, ResizeBehavior};
pub use types::{
    ContainerInfo, LimitRangeInfo, NodeInfo, OwnerRef, PodPhase, PodSnapshot, QuotaInfo,
    ResizePatch, ResizeStatus, WorkloadId, WorkloadKind,
};
