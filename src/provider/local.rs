//! Filesystem-backed `CloudProvider`: the provider-side counterpart to
//! `orchestrator::DockerOrchestrator` - a single-node stand-in good enough
//! to run this system end to end without a real cloud account. Volumes are
//! directories under `<base_dir>/volumes/<id>`, snapshots are directory
//! copies under `<base_dir>/snapshots/<id>`, and objects are plain files
//! under `<base_dir>/objects/<key>`. Tags, attachment and state live in
//! memory and are mirrored to `<base_dir>/manifest.json` on every mutation
//! so they survive a restart.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{CloudProvider, ProviderError, ProviderResult, SnapshotInfo, SnapshotState, VolumeInfo, VolumeState};

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    volumes: HashMap<String, VolumeInfo>,
    snapshots: HashMap<String, SnapshotInfo>,
}

/// Filesystem-backed stand-in for a hosted block/object-storage provider.
/// A hosted backend should implement `CloudProvider` directly against its
/// own SDK rather than reuse this one.
#[derive(Debug)]
pub struct LocalDiskProvider {
    base_dir: PathBuf,
    manifest: Mutex<Manifest>,
}

impl LocalDiskProvider {
    pub fn open(base_dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let base_dir = base_dir.into();
        std::fs::create_dir_all(base_dir.join("volumes"))?;
        std::fs::create_dir_all(base_dir.join("snapshots"))?;
        std::fs::create_dir_all(base_dir.join("objects"))?;

        let manifest = std::fs::read_to_string(base_dir.join("manifest.json"))
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default();

        Ok(Self { base_dir, manifest: Mutex::new(manifest) })
    }

    fn persist(&self) -> ProviderResult<()> {
        let raw = {
            let manifest = self.manifest.lock().unwrap();
            serde_json::to_string_pretty(&*manifest).map_err(|e| ProviderError::Other(e.to_string()))?
        };
        std::fs::write(self.base_dir.join("manifest.json"), raw).map_err(|e| ProviderError::Other(e.to_string()))
    }

    fn volume_dir(&self, volume_id: &str) -> PathBuf {
        self.base_dir.join("volumes").join(volume_id)
    }

    fn snapshot_dir(&self, snapshot_id: &str) -> PathBuf {
        self.base_dir.join("snapshots").join(snapshot_id)
    }

    fn object_path(&self, key: &str) -> PathBuf {
        self.base_dir.join("objects").join(key)
    }
}

fn copy_dir_all(src: &Path, dst: &Path) -> std::io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

#[async_trait]
impl CloudProvider for LocalDiskProvider {
    async fn create_volume(
        &self,
        size_gb: i32,
        _availability_zone: &str,
        tags: HashMap<String, String>,
    ) -> ProviderResult<VolumeInfo> {
        let volume_id = format!("vol-{}", Uuid::new_v4().simple());
        std::fs::create_dir_all(self.volume_dir(&volume_id)).map_err(|e| ProviderError::Other(e.to_string()))?;

        let info = VolumeInfo {
            volume_id: volume_id.clone(),
            size_gb,
            state: VolumeState::Available,
            attached_to: None,
            tags,
            created_at: Utc::now(),
        };
        self.manifest.lock().unwrap().volumes.insert(volume_id, info.clone());
        self.persist()?;
        Ok(info)
    }

    async fn delete_volume(&self, volume_id: &str) -> ProviderResult<()> {
        {
            let mut manifest = self.manifest.lock().unwrap();
            match manifest.volumes.get(volume_id) {
                Some(v) if v.attached_to.is_some() => return Err(ProviderError::InUse(volume_id.to_string())),
                Some(_) => {
                    manifest.volumes.remove(volume_id);
                }
                None => return Err(ProviderError::NotFound(volume_id.to_string())),
            }
        }
        self.persist()?;
        let _ = std::fs::remove_dir_all(self.volume_dir(volume_id));
        Ok(())
    }

    async fn attach_volume(&self, volume_id: &str, instance_id: &str) -> ProviderResult<()> {
        {
            let mut manifest = self.manifest.lock().unwrap();
            let v = manifest
                .volumes
                .get_mut(volume_id)
                .ok_or_else(|| ProviderError::NotFound(volume_id.to_string()))?;
            v.attached_to = Some(instance_id.to_string());
            v.state = VolumeState::InUse;
        }
        self.persist()
    }

    async fn detach_volume(&self, volume_id: &str) -> ProviderResult<()> {
        {
            let mut manifest = self.manifest.lock().unwrap();
            let v = manifest
                .volumes
                .get_mut(volume_id)
                .ok_or_else(|| ProviderError::NotFound(volume_id.to_string()))?;
            v.attached_to = None;
            v.state = VolumeState::Available;
        }
        self.persist()
    }

    async fn get_volume(&self, volume_id: &str) -> ProviderResult<VolumeInfo> {
        self.manifest
            .lock()
            .unwrap()
            .volumes
            .get(volume_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(volume_id.to_string()))
    }

    async fn list_volumes(&self) -> ProviderResult<Vec<VolumeInfo>> {
        Ok(self.manifest.lock().unwrap().volumes.values().cloned().collect())
    }

    async fn list_volumes_by_tag(&self, key: &str, value: &str) -> ProviderResult<Vec<VolumeInfo>> {
        Ok(self
            .manifest
            .lock()
            .unwrap()
            .volumes
            .values()
            .filter(|v| v.tags.get(key).map(String::as_str) == Some(value))
            .cloned()
            .collect())
    }

    async fn tag_volume(&self, volume_id: &str, tags: HashMap<String, String>) -> ProviderResult<()> {
        {
            let mut manifest = self.manifest.lock().unwrap();
            let v = manifest
                .volumes
                .get_mut(volume_id)
                .ok_or_else(|| ProviderError::NotFound(volume_id.to_string()))?;
            v.tags.extend(tags);
        }
        self.persist()
    }

    async fn untag_volume(&self, volume_id: &str, keys: &[String]) -> ProviderResult<()> {
        {
            let mut manifest = self.manifest.lock().unwrap();
            let v = manifest
                .volumes
                .get_mut(volume_id)
                .ok_or_else(|| ProviderError::NotFound(volume_id.to_string()))?;
            for k in keys {
                v.tags.remove(k);
            }
        }
        self.persist()
    }

    async fn create_snapshot(&self, volume_id: &str, tags: HashMap<String, String>) -> ProviderResult<SnapshotInfo> {
        if !self.manifest.lock().unwrap().volumes.contains_key(volume_id) {
            return Err(ProviderError::NotFound(volume_id.to_string()));
        }
        let snapshot_id = format!("snap-{}", Uuid::new_v4().simple());
        copy_dir_all(&self.volume_dir(volume_id), &self.snapshot_dir(&snapshot_id))
            .map_err(|e| ProviderError::Other(e.to_string()))?;

        let info = SnapshotInfo {
            snapshot_id: snapshot_id.clone(),
            volume_id: volume_id.to_string(),
            state: SnapshotState::Completed,
            tags,
            created_at: Utc::now(),
        };
        self.manifest.lock().unwrap().snapshots.insert(snapshot_id, info.clone());
        self.persist()?;
        Ok(info)
    }

    async fn delete_snapshot(&self, snapshot_id: &str) -> ProviderResult<()> {
        {
            let mut manifest = self.manifest.lock().unwrap();
            if manifest.snapshots.remove(snapshot_id).is_none() {
                return Err(ProviderError::NotFound(snapshot_id.to_string()));
            }
        }
        self.persist()?;
        let _ = std::fs::remove_dir_all(self.snapshot_dir(snapshot_id));
        Ok(())
    }

    async fn get_snapshot(&self, snapshot_id: &str) -> ProviderResult<SnapshotInfo> {
        self.manifest
            .lock()
            .unwrap()
            .snapshots
            .get(snapshot_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(snapshot_id.to_string()))
    }

    async fn list_snapshots(&self) -> ProviderResult<Vec<SnapshotInfo>> {
        Ok(self.manifest.lock().unwrap().snapshots.values().cloned().collect())
    }

    async fn list_snapshots_by_volume(&self, volume_id: &str) -> ProviderResult<Vec<SnapshotInfo>> {
        Ok(self
            .manifest
            .lock()
            .unwrap()
            .snapshots
            .values()
            .filter(|s| s.volume_id == volume_id)
            .cloned()
            .collect())
    }

    async fn wait_for_snapshot(&self, snapshot_id: &str, _timeout: std::time::Duration) -> ProviderResult<SnapshotInfo> {
        // A snapshot is just a directory copy, taken synchronously at
        // creation - there's never anything left to wait for.
        self.get_snapshot(snapshot_id).await
    }

    async fn upload_object(&self, key: &str, body: Vec<u8>, _content_type: &str) -> ProviderResult<String> {
        let path = self.object_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| ProviderError::Other(e.to_string()))?;
        }
        tokio::fs::write(&path, body).await.map_err(|e| ProviderError::Other(e.to_string()))?;
        Ok(format!("s3://local-bucket/{key}"))
    }

    async fn download_object(&self, key: &str) -> ProviderResult<Vec<u8>> {
        tokio::fs::read(self.object_path(key))
            .await
            .map_err(|_| ProviderError::NotFound(key.to_string()))
    }
}
