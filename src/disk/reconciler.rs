//! Background cloud-volume reconciliation (C9, §4.8): keeps `disks` rows
//! converged with the provider's actual inventory, resolves duplicate
//! volumes left behind by retried creates, and ages out quarantined
//! volumes after their grace period. Grounded in the disk-reconciliation
//! job this system's devserver predecessor ran as a periodic Lambda.
//!
//! Runs under a cluster-wide advisory lock so only one instance reconciles
//! at a time; a tick that loses the lock race just skips itself rather than
//! waiting.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::db::disks::NewDisk;
use crate::db::queue::lock_keys;
use crate::error::CoreError;
use crate::notify::NotificationChannel;
use crate::provider::{ProviderError, VolumeInfo, VolumeState};

const GPU_DEV_USER_TAG: &str = "gpu-dev-user";
const DISK_NAME_TAG: &str = "disk_name";
const RESERVATION_ID_TAG: &str = "reservation_id";
const QUARANTINE_TAG: &str = "gpu-dev-quarantined";
const QUARANTINE_REASON_TAG: &str = "gpu-dev-quarantine-reason";
const QUARANTINE_BACKUP_TAG: &str = "gpu-dev-quarantine-backup";
const ORIGINAL_VOLUME_ID_TAG: &str = "original-volume-id";
const RETENTION_DAYS_TAG: &str = "retention-days";

/// One reconciliation pass. Acquires the advisory lock for the duration of
/// the run and always releases it on the way out, success or failure.
pub async fn tick_reconciliation(ctx: &AppContext) -> crate::error::CoreResult<()> {
    let acquired = ctx.db.try_advisory_lock(lock_keys::DISK_RECONCILER).await.map_err(CoreError::Internal)?;
    if !acquired {
        info!("disk reconciliation already running elsewhere, skipping this tick");
        return Ok(());
    }

    let result = run(ctx).await;

    if let Err(e) = ctx.db.advisory_unlock(lock_keys::DISK_RECONCILER).await {
        warn!(error = %e, "failed to release disk reconciliation advisory lock");
    }

    result
}

async fn run(ctx: &AppContext) -> crate::error::CoreResult<()> {
    let cloud_volumes = match fetch_gpu_dev_volumes(ctx).await {
        Ok(v) => v,
        Err(e) => {
            // Never treat a fetch failure as "there are no volumes" -
            // that would orphan every disk row in one bad tick.
            warn!(error = %e, "failed to list cloud volumes, aborting this reconciliation tick");
            return Ok(());
        }
    };

    let db_disks = ctx.db.list_all().await.map_err(CoreError::Internal)?;

    let mut db_by_volume: HashMap<String, crate::db::models::Disk> = HashMap::new();
    let mut db_by_user_disk: HashMap<(String, String), crate::db::models::Disk> = HashMap::new();
    for disk in db_disks {
        if let Some(volume_id) = disk.provider_volume_id.clone() {
            if let Some(existing) = db_by_volume.insert(volume_id.clone(), disk.clone()) {
                warn!(volume_id, a = %existing.disk_id, b = %disk.disk_id, "two disk rows reference the same volume id");
            }
        }
        let key = (disk.user_id.clone(), disk.disk_name.clone());
        db_by_user_disk.insert(key, disk);
    }

    let mut cloud_by_user_disk: HashMap<(String, String), Vec<VolumeInfo>> = HashMap::new();
    for v in &cloud_volumes {
        let Some(user_id) = v.tags.get(GPU_DEV_USER_TAG).cloned() else { continue };
        let Some(disk_name) = v.tags.get(DISK_NAME_TAG).cloned() else { continue };
        cloud_by_user_disk.entry((user_id, disk_name)).or_default().push(v.clone());
    }

    let mut canonical: HashMap<(String, String), VolumeInfo> = HashMap::new();
    for (key, mut group) in cloud_by_user_disk {
        if group.len() == 1 {
            canonical.insert(key, group.pop().unwrap());
            continue;
        }

        if let Some(winner) = resolve_conflict(ctx, &key, group).await {
            canonical.insert(key, winner);
        }
    }

    for (key, volume) in &canonical {
        sync_or_import(ctx, key, volume, &db_by_user_disk).await;
    }

    let live_volume_ids: std::collections::HashSet<&str> =
        cloud_volumes.iter().map(|v| v.volume_id.as_str()).collect();
    for (volume_id, disk) in &db_by_volume {
        if disk.is_deleted || live_volume_ids.contains(volume_id.as_str()) {
            continue;
        }
        // The volume vanished from the cloud. Clear the in-use flag but
        // keep the row (and its reservation history) around - an orphaned
        // record is evidence, not garbage.
        if let Err(e) = ctx.db.set_disk_attachment(&disk.user_id, &disk.disk_name, None).await {
            warn!(disk_id = %disk.disk_id, error = %e, "failed to clear in_use on an orphaned disk row");
        }
    }

    cleanup_quarantined(ctx, &cloud_volumes).await;

    Ok(())
}

async fn fetch_gpu_dev_volumes(ctx: &AppContext) -> Result<Vec<VolumeInfo>, ProviderError> {
    Ok(ctx
        .provider
        .list_volumes()
        .await?
        .into_iter()
        .filter(|v| v.tags.contains_key(GPU_DEV_USER_TAG))
        .collect())
}

fn is_attached(v: &VolumeInfo) -> bool {
    v.state == VolumeState::InUse || v.attached_to.is_some()
}

/// Resolve a group of cloud volumes that all carry the same (user, disk
/// name) tags down to one canonical volume, quarantining the rest.
/// Returns `None` if the conflict could not be safely resolved - the
/// caller leaves every volume in the group untouched in that case.
async fn resolve_conflict(
    ctx: &AppContext,
    key: &(String, String),
    group: Vec<VolumeInfo>,
) -> Option<VolumeInfo> {
    let (user_id, disk_name) = key;
    let attached: Vec<&VolumeInfo> = group.iter().filter(|v| is_attached(v)).collect();

    let current = if attached.len() > 1 {
        error!(
            user_id,
            disk_name, count = attached.len(), "more than one attached volume for the same disk, manual intervention required"
        );
        return None;
    } else if attached.len() == 1 {
        attached[0].clone()
    } else {
        let existing_ref = ctx
            .db
            .get_disk(user_id, disk_name)
            .await
            .ok()
            .flatten()
            .and_then(|d| d.provider_volume_id);
        if let Some(preferred_id) = existing_ref.as_deref() {
            if let Some(v) = group.iter().find(|v| v.volume_id == preferred_id) {
                v.clone()
            } else {
                choose_best(ctx, &group).await
            }
        } else {
            choose_best(ctx, &group).await
        }
    };

    let others: Vec<&VolumeInfo> = group.iter().filter(|v| v.volume_id != current.volume_id).collect();
    let mut quarantined: Vec<String> = Vec::new();

    for other in &others {
        // Re-check right before tagging - the attachment picture may have
        // changed since the listing was fetched.
        let fresh = match ctx.provider.get_volume(&other.volume_id).await {
            Ok(v) => v,
            Err(e) => {
                warn!(volume_id = %other.volume_id, error = %e, "failed to re-verify volume before quarantine, skipping");
                continue;
            }
        };
        if is_attached(&fresh) {
            warn!(volume_id = %other.volume_id, "volume became attached since the listing was taken, skipping quarantine");
            continue;
        }

        let mut tags = HashMap::new();
        tags.insert(QUARANTINE_TAG.to_string(), Utc::now().to_rfc3339());
        tags.insert(
            QUARANTINE_REASON_TAG.to_string(),
            format!("duplicate disk {disk_name} for user {user_id}, superseded by {}", current.volume_id),
        );

        match crate::provider::with_retry(|| {
            let tags = tags.clone();
            async { ctx.provider.tag_volume(&other.volume_id, tags).await }
        })
        .await
        {
            Ok(()) => quarantined.push(other.volume_id.clone()),
            Err(e) => warn!(volume_id = %other.volume_id, error = %e, "failed to quarantine duplicate volume"),
        }
    }

    if quarantined.len() < others.len() {
        // Partial failure: back every successful tag out and leave the
        // conflict for the next tick rather than half-resolving it.
        for volume_id in &quarantined {
            let _ = ctx
                .provider
                .untag_volume(volume_id, &[QUARANTINE_TAG.to_string(), QUARANTINE_REASON_TAG.to_string()])
                .await;
        }
        error!(user_id, disk_name, "could not quarantine every duplicate volume, leaving conflict unresolved");
        return None;
    }

    if let Some(db_disk) = ctx.db.get_disk(user_id, disk_name).await.ok().flatten() {
        if let Err(e) = ctx.db.set_provider_volume_id(db_disk.disk_id, &current.volume_id).await {
            for volume_id in &quarantined {
                let _ = ctx
                    .provider
                    .untag_volume(volume_id, &[QUARANTINE_TAG.to_string(), QUARANTINE_REASON_TAG.to_string()])
                    .await;
            }
            warn!(user_id, disk_name, error = %e, "failed to record resolved volume id, rolled back quarantine tags");
            return None;
        }
    }

    for volume_id in &quarantined {
        ctx.notifier
            .notify(
                user_id,
                NotificationChannel::DiskQuarantine,
                &format!("a duplicate volume for disk {disk_name} was quarantined"),
                serde_json::json!({"disk_name": disk_name, "volume_id": volume_id, "current_volume_id": current.volume_id}),
            )
            .await;
    }

    Some(current)
}

/// Size desc, snapshot count desc, created-at desc, volume id as a
/// deterministic final tiebreak.
async fn choose_best(ctx: &AppContext, group: &[VolumeInfo]) -> VolumeInfo {
    let mut scored = Vec::with_capacity(group.len());
    for v in group {
        let snapshot_count = ctx.provider.list_snapshots_by_volume(&v.volume_id).await.map(|s| s.len()).unwrap_or(0);
        scored.push((v.size_gb, snapshot_count, v.created_at, v.volume_id.clone(), v.clone()));
    }
    scored.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then(b.1.cmp(&a.1))
            .then(b.2.cmp(&a.2))
            .then(a.3.cmp(&b.3))
    });
    scored.into_iter().next().map(|(_, _, _, _, v)| v).expect("group is never empty")
}

async fn sync_or_import(
    ctx: &AppContext,
    key: &(String, String),
    volume: &VolumeInfo,
    db_by_user_disk: &HashMap<(String, String), crate::db::models::Disk>,
) {
    let (user_id, disk_name) = key;

    let Some(db_disk) = db_by_user_disk.get(key) else {
        let disk_id = Uuid::new_v4();
        if let Err(e) = ctx
            .db
            .create_disk(&NewDisk {
                disk_id,
                user_id: user_id.clone(),
                disk_name: disk_name.clone(),
                size_gb: volume.size_gb,
            })
            .await
        {
            warn!(user_id, disk_name, error = %e, "failed to import orphaned cloud volume");
            return;
        }
        if let Err(e) = ctx.db.set_provider_volume_id(disk_id, &volume.volume_id).await {
            warn!(user_id, disk_name, error = %e, "failed to record volume id for imported disk");
            return;
        }

        if is_attached(volume) {
            if let Some(reservation_id) =
                volume.tags.get(RESERVATION_ID_TAG).and_then(|s| Uuid::parse_str(s).ok())
            {
                let _ = ctx.db.set_disk_attachment(user_id, disk_name, Some(reservation_id)).await;
            }
        }

        info!(user_id, disk_name, volume_id = %volume.volume_id, "imported orphaned cloud volume into the disk table");
        return;
    };

    if db_disk.provider_volume_id.as_deref() != Some(volume.volume_id.as_str()) {
        if let Err(e) = ctx.db.set_provider_volume_id(db_disk.disk_id, &volume.volume_id).await {
            warn!(disk_id = %db_disk.disk_id, error = %e, "failed to sync volume id onto disk row");
        }
    }
}

/// Safety-snapshot, then hard-delete volumes that have sat in quarantine
/// past the grace period. Never touches an attached volume.
async fn cleanup_quarantined(ctx: &AppContext, cloud_volumes: &[VolumeInfo]) {
    let max_age = chrono::Duration::days(ctx.config.quarantine_max_age_days);

    for v in cloud_volumes {
        let Some(tagged_at) = v.tags.get(QUARANTINE_TAG).and_then(|s| DateTime::parse_from_rfc3339(s).ok()) else {
            continue;
        };
        let age = Utc::now() - tagged_at.with_timezone(&Utc);
        if age < max_age {
            continue;
        }

        if is_attached(v) {
            error!(volume_id = %v.volume_id, "quarantined volume is still attached, refusing to delete it");
            continue;
        }

        let mut backup_tags = HashMap::new();
        backup_tags.insert(QUARANTINE_BACKUP_TAG.to_string(), "true".to_string());
        backup_tags.insert(ORIGINAL_VOLUME_ID_TAG.to_string(), v.volume_id.clone());
        backup_tags.insert(RETENTION_DAYS_TAG.to_string(), ctx.config.quarantine_backup_retention_days.to_string());
        if let Some(disk_name) = v.tags.get(DISK_NAME_TAG) {
            backup_tags.insert(DISK_NAME_TAG.to_string(), disk_name.clone());
        }
        if let Some(user_id) = v.tags.get(GPU_DEV_USER_TAG) {
            backup_tags.insert(GPU_DEV_USER_TAG.to_string(), user_id.clone());
        }

        if let Err(e) = ctx.provider.create_snapshot(&v.volume_id, backup_tags).await {
            warn!(volume_id = %v.volume_id, error = %e, "failed to take safety snapshot before quarantine cleanup, leaving volume in place");
            continue;
        }

        match ctx.provider.delete_volume(&v.volume_id).await {
            Ok(()) => info!(volume_id = %v.volume_id, "deleted quarantined volume past its grace period"),
            Err(ProviderError::NotFound(_)) => {}
            Err(e) => warn!(volume_id = %v.volume_id, error = %e, "failed to delete quarantined volume"),
        }
    }
}
