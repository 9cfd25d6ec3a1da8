//! Orchestrator client seam.
//!
//! The reconciliation loop only sees this trait; concrete implementations
//! are injected at startup.

use super::types::{LimitRangeInfo, NodeInfo, PodSnapshot, QuotaInfo, ResizePatch};
use crate::error::Result;
use async_trait::async_trait;
use std::collections::HashMap;

/// Operations the rightsizer needs from the orchestrator API.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// List pods, optionally restricted to one namespace
    async fn list_pods(&self, namespace: Option<&str>) -> Result<Vec<PodSnapshot>>;

    /// Fetch one pod
    async fn get_pod(&self, namespace: &str, name: &str) -> Result<PodSnapshot>;

    /// Fetch one node
    async fn get_node(&self, name: &str) -> Result<NodeInfo>;

    /// List resource quotas in a namespace
    async fn list_quotas(&self, namespace: &str) -> Result<Vec<QuotaInfo>>;

    /// List container-type limit ranges in a namespace
    async fn list_limit_ranges(&self, namespace: &str) -> Result<Vec<LimitRangeInfo>>;

    /// Patch a pod through the in-place resize subresource
    async fn patch_pod_resize(
        &self,
        namespace: &str,
        name: &str,
        patch: &ResizePatch,
    ) -> Result<()>;

    /// Ensure the container resize policy does not restart on CPU or memory
    /// changes. Only called when the `update_resize_policy` gate is on.
    async fn ensure_resize_policy(
        &self,
        namespace: &str,
        name: &str,
        container: &str,
    ) -> Result<()>;

    /// Merge annotations onto a pod
    async fn annotate_pod(
        &self,
        namespace: &str,
        name: &str,
        annotations: &HashMap<String, String>,
    ) -> Result<()>;

    /// Create an orchestrator event attached to a pod
    async fn create_event(
        &self,
        namespace: &str,
        pod: &str,
        reason: &str,
        message: &str,
    ) -> Result<()>;
}
