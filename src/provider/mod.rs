//! Capability-set abstraction over the cloud provider's block storage,
//! snapshot, and object storage APIs (C1, §4.2).
//!
//! A hosted backend (AWS EBS, GCP PD, ...) is an external collaborator
//! per §1 and is expected to be wired in behind this same trait; this
//! crate ships `local::LocalDiskProvider` as the filesystem-backed
//! stand-in for single-node deployments, the same role
//! `orchestrator::DockerOrchestrator` plays for the cluster orchestrator.
//! Tests exercise the trait through `fake::FakeProvider` instead, which
//! keeps everything in memory.

pub mod local;

#[cfg(test)]
pub mod fake;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// A block volume as reported by the provider, independent of which
/// cloud backs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeInfo {
    pub volume_id: String,
    pub size_gb: i32,
    pub state: VolumeState,
    pub attached_to: Option<String>,
    pub tags: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeState {
    Creating,
    Available,
    InUse,
    Deleting,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub snapshot_id: String,
    pub volume_id: String,
    pub state: SnapshotState,
    pub tags: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotState {
    Pending,
    Completed,
    Error,
}

/// The tagged error hierarchy every `CloudProvider` call returns (§4.2).
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("in use: {0}")]
    InUse(String),
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("throttled: {0}")]
    Throttled(String),
    #[error("auth failed: {0}")]
    AuthFailed(String),
    #[error("provider error: {0}")]
    Other(String),
}

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Capability-set interface to block storage, snapshots, object storage,
/// and compute inventory (§4.2). No shared base state between
/// implementations — concrete backends each own their own client handle.
#[async_trait]
pub trait CloudProvider: Send + Sync {
    async fn create_volume(
        &self,
        size_gb: i32,
        availability_zone: &str,
        tags: HashMap<String, String>,
    ) -> ProviderResult<VolumeInfo>;

    async fn delete_volume(&self, volume_id: &str) -> ProviderResult<()>;

    async fn attach_volume(&self, volume_id: &str, instance_id: &str) -> ProviderResult<()>;

    async fn detach_volume(&self, volume_id: &str) -> ProviderResult<()>;

    async fn get_volume(&self, volume_id: &str) -> ProviderResult<VolumeInfo>;

    async fn list_volumes(&self) -> ProviderResult<Vec<VolumeInfo>>;

    /// Tag-scoped inventory fetch, used by C6/C9 to enumerate volumes
    /// belonging to this system (`gpu-dev-user` tag) without pulling every
    /// volume in the account.
    async fn list_volumes_by_tag(&self, key: &str, value: &str) -> ProviderResult<Vec<VolumeInfo>>;

    async fn tag_volume(&self, volume_id: &str, tags: HashMap<String, String>) -> ProviderResult<()>;

    async fn untag_volume(&self, volume_id: &str, keys: &[String]) -> ProviderResult<()>;

    async fn create_snapshot(
        &self,
        volume_id: &str,
        tags: HashMap<String, String>,
    ) -> ProviderResult<SnapshotInfo>;

    async fn delete_snapshot(&self, snapshot_id: &str) -> ProviderResult<()>;

    async fn get_snapshot(&self, snapshot_id: &str) -> ProviderResult<SnapshotInfo>;

    async fn list_snapshots(&self) -> ProviderResult<Vec<SnapshotInfo>>;

    async fn list_snapshots_by_volume(&self, volume_id: &str) -> ProviderResult<Vec<SnapshotInfo>>;

    /// Block until `snapshot_id` leaves `Pending`, or the deadline elapses.
    async fn wait_for_snapshot(
        &self,
        snapshot_id: &str,
        timeout: std::time::Duration,
    ) -> ProviderResult<SnapshotInfo>;

    async fn upload_object(&self, key: &str, body: Vec<u8>, content_type: &str) -> ProviderResult<String>;

    async fn download_object(&self, key: &str) -> ProviderResult<Vec<u8>>;
}

/// Retry a provider call up to 5 attempts with exponential backoff and
/// jitter, but only when it fails with `Throttled` — every other error
/// kind is returned immediately to the caller (§4.2, §7).
pub async fn with_retry<T, F, Fut>(mut f: F) -> ProviderResult<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = ProviderResult<T>>,
{
    const MAX_ATTEMPTS: u32 = 5;
    let mut attempt = 0;

    loop {
        attempt += 1;
        match f().await {
            Ok(v) => return Ok(v),
            Err(ProviderError::Throttled(msg)) if attempt < MAX_ATTEMPTS => {
                let base_ms = 100u64 * 2u64.pow(attempt - 1);
                let jitter_ms = rand::rng().random_range(0..base_ms.max(1));
                tracing::warn!(attempt, %msg, "provider throttled, backing off");
                tokio::time::sleep(std::time::Duration::from_millis(base_ms + jitter_ms)).await;
            }
            Err(e) => return Err(e),
        }
    }
}

impl From<ProviderError> for crate::CoreError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::NotFound(m) => crate::CoreError::ProviderPermanent(format!("not found: {m}")),
            ProviderError::InUse(m) => crate::CoreError::Conflict(format!("volume in use: {m}")),
            ProviderError::QuotaExceeded(m) => {
                crate::CoreError::ProviderPermanent(format!("quota exceeded: {m}"))
            }
            ProviderError::Throttled(m) => crate::CoreError::ProviderThrottled(m),
            ProviderError::AuthFailed(m) => crate::CoreError::ProviderPermanent(format!("auth failed: {m}")),
            ProviderError::Other(m) => crate::CoreError::ProviderTransient(m),
        }
    }
}
