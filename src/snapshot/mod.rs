//! De-duplicated snapshot creation tied atomically to recorded disk
//! counters, retention policy, and per-disk content catalog (C10, §4.9).

use std::collections::HashMap;

use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{CoreError, CoreResult};
use crate::provider::{SnapshotInfo, SnapshotState};

/// What triggered the snapshot, carried as the `SnapshotType` cloud tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotKind {
    Shutdown,
    Manual,
    Scheduled,
}

impl SnapshotKind {
    fn as_str(&self) -> &'static str {
        match self {
            SnapshotKind::Shutdown => "shutdown",
            SnapshotKind::Manual => "manual",
            SnapshotKind::Scheduled => "scheduled",
        }
    }
}

pub struct CreateSnapshotRequest<'a> {
    pub volume_id: &'a str,
    pub disk_id: Option<uuid::Uuid>,
    pub user_id: &'a str,
    pub kind: SnapshotKind,
    pub disk_name: Option<&'a str>,
    pub content_uri: Option<&'a str>,
    pub disk_size: Option<&'a str>,
}

pub struct CreateSnapshotOutcome {
    pub snapshot_id: String,
    pub was_created: bool,
}

/// §4.9 step 1-3: reuse an existing pending snapshot for this volume if
/// one exists; otherwise create and tag a new one, atomically bumping the
/// owning disk's pending counter when `disk_name` is given.
pub async fn create_snapshot(ctx: &AppContext, req: CreateSnapshotRequest<'_>) -> CoreResult<CreateSnapshotOutcome> {
    let pending = ctx
        .provider
        .list_snapshots_by_volume(req.volume_id)
        .await
        .map_err(CoreError::from)?;

    if let Some(existing) = pending
        .iter()
        .filter(|s| s.state == SnapshotState::Pending)
        .max_by_key(|s| s.created_at)
    {
        info!(snapshot_id = %existing.snapshot_id, volume_id = req.volume_id, "reusing pending snapshot");
        return Ok(CreateSnapshotOutcome {
            snapshot_id: existing.snapshot_id.clone(),
            was_created: false,
        });
    }

    let mut tags: HashMap<String, String> = HashMap::new();
    tags.insert("gpu-dev-user".to_string(), req.user_id.to_string());
    tags.insert("SnapshotType".to_string(), req.kind.as_str().to_string());
    tags.insert("created_at".to_string(), Utc::now().to_rfc3339());
    if let Some(name) = req.disk_name {
        tags.insert("disk_name".to_string(), name.to_string());
    }
    if let Some(uri) = req.content_uri {
        tags.insert("snapshot_content_s3".to_string(), uri.to_string());
    }
    if let Some(size) = req.disk_size {
        tags.insert("disk_size".to_string(), size.to_string());
    }

    let snapshot = ctx
        .provider
        .create_snapshot(req.volume_id, tags)
        .await
        .map_err(CoreError::from)?;

    if let (Some(disk_name), Some(disk_id)) = (req.disk_name, req.disk_id) {
        if let Err(e) = ctx.db.adjust_snapshot_counts(disk_id, 0, 1, false).await {
            warn!(disk_name, error = %e, "failed to record pending snapshot, rolling back cloud snapshot");
            let _ = ctx.provider.delete_snapshot(&snapshot.snapshot_id).await;
            return Err(CoreError::Internal(e));
        }
        sqlx_set_backing_up(ctx, disk_id).await?;
    }

    Ok(CreateSnapshotOutcome {
        snapshot_id: snapshot.snapshot_id,
        was_created: true,
    })
}

async fn sqlx_set_backing_up(ctx: &AppContext, disk_id: Uuid) -> CoreResult<()> {
    // `adjust_snapshot_counts` only clears `is_backing_up`; setting it true
    // is a direct flag write, grounded in `disk_db.py`'s
    // `mark_disk_backing_up` helper.
    sqlx::query("UPDATE disks SET is_backing_up = TRUE WHERE disk_id = $1")
        .bind(disk_id)
        .execute(&ctx.db.pool)
        .await
        .map_err(|e| CoreError::Internal(anyhow::Error::new(e)))?;
    Ok(())
}

/// §4.9 completion: increment `snapshot_count`, clamp-decrement
/// `pending_snapshot_count`, clear `is_backing_up` if the clamp reached
/// zero, refresh `last_used`, and optionally refresh content/size fields.
pub async fn complete_snapshot(
    ctx: &AppContext,
    disk_id: Uuid,
    content_uri: Option<&str>,
    disk_size: Option<&str>,
    size_gb: Option<i32>,
) -> CoreResult<()> {
    let disk = ctx
        .db
        .get_disk_by_id(disk_id)
        .await
        .map_err(CoreError::Internal)?
        .ok_or_else(|| CoreError::Validation(format!("disk {disk_id} not found")))?;

    let will_clear = disk.pending_snapshot_count <= 1;

    ctx.db
        .adjust_snapshot_counts(disk_id, 1, -1, will_clear)
        .await
        .map_err(CoreError::Internal)?;

    if content_uri.is_some() || disk_size.is_some() || size_gb.is_some() {
        sqlx::query(
            r#"
            UPDATE disks
            SET latest_snapshot_content_s3 = COALESCE($1, latest_snapshot_content_s3),
                disk_size = COALESCE($2, disk_size),
                size_gb = COALESCE($3, size_gb)
            WHERE disk_id = $4
            "#,
        )
        .bind(content_uri)
        .bind(disk_size)
        .bind(size_gb)
        .bind(disk_id)
        .execute(&ctx.db.pool)
        .await
        .map_err(|e| CoreError::Internal(anyhow::Error::new(e)))?;
    }

    Ok(())
}

/// §4.9 content capture: a bounded listing inside the workload, uploaded
/// as a text object. Invoked during teardown before workload deletion;
/// failures never block snapshot creation (best-effort).
pub async fn capture_content(
    ctx: &AppContext,
    pod_name: &str,
    user_id: &str,
    disk_name: &str,
    snapshot_id: &str,
) -> Option<String> {
    const MAX_ENTRIES: usize = 1000;

    let cmd = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("du -sh /workspace 2>/dev/null; find /workspace -maxdepth 3 2>/dev/null | head -n {MAX_ENTRIES}"),
    ];

    let output = match ctx.orchestrator.exec(pod_name, cmd).await {
        Ok(out) => out,
        Err(e) => {
            warn!(pod_name, error = %e, "content capture exec failed, continuing teardown");
            return None;
        }
    };

    let truncated: String = output.lines().take(MAX_ENTRIES).collect::<Vec<_>>().join("\n");
    let key = format!("snapshot-content/{user_id}/{disk_name}/{snapshot_id}.txt");

    match ctx
        .provider
        .upload_object(&key, truncated.into_bytes(), "text/plain")
        .await
    {
        Ok(uri) => Some(uri),
        Err(e) => {
            warn!(pod_name, error = %e, "content capture upload failed, continuing teardown");
            None
        }
    }
}

/// §4.9 retention: per user, keep the newest `keep_count` completed
/// snapshots and delete anything older than `max_age_days`, capped at
/// `per_user_cap` deletions across at most `user_cap` users per run.
pub async fn enforce_retention(ctx: &AppContext) -> CoreResult<usize> {
    let keep_count = ctx.config.snapshot_keep_count as usize;
    let max_age = chrono::Duration::days(ctx.config.snapshot_max_age_days);
    let per_user_cap = 10usize;
    let user_cap = 20usize;

    let all_snapshots = ctx.provider.list_snapshots().await.map_err(CoreError::from)?;

    let mut by_user: HashMap<String, Vec<SnapshotInfo>> = HashMap::new();
    for s in all_snapshots.into_iter().filter(|s| s.state == SnapshotState::Completed) {
        let user = s.tags.get("gpu-dev-user").cloned().unwrap_or_default();
        by_user.entry(user).or_default().push(s);
    }

    let mut deleted = 0usize;
    let now = Utc::now();

    for (user, mut snaps) in by_user.into_iter().take(user_cap) {
        snaps.sort_by_key(|s| std::cmp::Reverse(s.created_at));

        let mut user_deleted = 0usize;
        for (idx, s) in snaps.iter().enumerate() {
            if user_deleted >= per_user_cap {
                break;
            }
            let too_old = now - s.created_at > max_age;
            let beyond_keep_count = idx >= keep_count;
            if too_old || beyond_keep_count {
                match ctx.provider.delete_snapshot(&s.snapshot_id).await {
                    Ok(()) => {
                        deleted += 1;
                        user_deleted += 1;
                    }
                    Err(e) => warn!(user, snapshot_id = %s.snapshot_id, error = %e, "retention delete failed"),
                }
            }
        }
    }

    Ok(deleted)
}
