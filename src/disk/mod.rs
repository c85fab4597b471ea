//! Persistent disk lifecycle (C9, §4.8): user-owned named volumes that
//! outlive any single reservation. Creation only ever writes the DB row —
//! the backing cloud volume is materialized lazily, the first time a
//! reservation actually attaches the disk (`reservation::allocate_storage`).
//! The reconciler (`reconciler`) is the other half of C9: it keeps the DB
//! row and the cloud volume converged in the background.

pub mod reconciler;

use std::collections::HashMap;

use chrono::Utc;
use uuid::Uuid;

use crate::context::{AppContext, ChangeEvent};
use crate::db::disks::NewDisk;
use crate::db::models::Disk;
use crate::error::{CoreError, CoreResult};

const MAX_DISK_NAME_LEN: usize = 64;
const DELETE_GRACE_PERIOD: chrono::Duration = chrono::Duration::days(30);

/// disk names are DNS-label-ish: ASCII letters, digits, `_` and `-`, 1-64
/// characters. No regex crate in the dependency stack, so this is a plain
/// character scan rather than a compiled pattern.
fn validate_disk_name(name: &str) -> CoreResult<()> {
    if name.is_empty() || name.len() > MAX_DISK_NAME_LEN {
        return Err(CoreError::Validation(format!(
            "disk name must be 1-{MAX_DISK_NAME_LEN} characters"
        )));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
        return Err(CoreError::Validation(
            "disk name may only contain letters, digits, '_' and '-'".to_string(),
        ));
    }
    Ok(())
}

/// Create a new disk row for `user_id`. Does not touch the cloud provider —
/// the volume is created on first attach. Rejects a name already in use by
/// this user, including a soft-deleted one still inside its grace period.
pub async fn create_disk(ctx: &AppContext, user_id: &str, disk_name: &str, size_gb: i32) -> CoreResult<Disk> {
    validate_disk_name(disk_name)?;
    if size_gb <= 0 {
        return Err(CoreError::Validation("size_gb must be positive".to_string()));
    }

    if ctx.db.get_disk(user_id, disk_name).await.map_err(CoreError::Internal)?.is_some() {
        return Err(CoreError::Conflict(format!("disk {disk_name} already exists")));
    }

    let disk_id = Uuid::new_v4();
    ctx.db
        .create_disk(&NewDisk {
            disk_id,
            user_id: user_id.to_string(),
            disk_name: disk_name.to_string(),
            size_gb,
        })
        .await
        .map_err(CoreError::Internal)?;

    let disk = ctx
        .db
        .get_disk(user_id, disk_name)
        .await
        .map_err(CoreError::Internal)?
        .ok_or_else(|| CoreError::Conflict(format!("disk {disk_name} already exists")))?;

    ctx.emit(ChangeEvent::DiskChanged);
    Ok(disk)
}

/// Soft-delete a disk: it stays in the DB, flagged `is_deleted`, for a
/// 30-day grace period before the reconciler's quarantine-cleanup path (or
/// an equivalent hard-delete sweep) removes the underlying volume for good.
/// Refuses while the disk is attached to a live reservation.
pub async fn delete_disk(ctx: &AppContext, user_id: &str, disk_name: &str) -> CoreResult<()> {
    let disk = ctx
        .db
        .get_disk(user_id, disk_name)
        .await
        .map_err(CoreError::Internal)?
        .ok_or_else(|| CoreError::Validation(format!("no such disk: {disk_name}")))?;

    if disk.is_deleted {
        return Ok(());
    }
    if disk.in_use {
        return Err(CoreError::Conflict(format!("disk {disk_name} is attached to a reservation")));
    }

    ctx.db
        .mark_disk_deleted(user_id, disk_name, Utc::now() + DELETE_GRACE_PERIOD)
        .await
        .map_err(CoreError::Internal)?;

    ctx.emit(ChangeEvent::DiskChanged);
    Ok(())
}

/// Rename a disk in place. Refuses while attached. If a cloud volume
/// already backs the disk, its `disk_name` tag is updated first so the
/// reconciler's (user_id, disk_name) index stays consistent; if the DB
/// rename then fails, the tag change is rolled back.
pub async fn rename_disk(ctx: &AppContext, user_id: &str, old_name: &str, new_name: &str) -> CoreResult<()> {
    validate_disk_name(new_name)?;

    let disk = ctx
        .db
        .get_disk(user_id, old_name)
        .await
        .map_err(CoreError::Internal)?
        .ok_or_else(|| CoreError::Validation(format!("no such disk: {old_name}")))?;

    if disk.in_use {
        return Err(CoreError::Conflict(format!("disk {old_name} is attached to a reservation")));
    }
    if ctx.db.get_disk(user_id, new_name).await.map_err(CoreError::Internal)?.is_some() {
        return Err(CoreError::Conflict(format!("disk {new_name} already exists")));
    }

    if let Some(volume_id) = disk.provider_volume_id.clone() {
        let mut tags = HashMap::new();
        tags.insert("disk_name".to_string(), new_name.to_string());
        ctx.provider.tag_volume(&volume_id, tags).await?;

        match ctx.db.rename_disk(user_id, old_name, new_name).await {
            Ok(true) => {}
            Ok(false) => {
                let mut rollback = HashMap::new();
                rollback.insert("disk_name".to_string(), old_name.to_string());
                let _ = ctx.provider.tag_volume(&volume_id, rollback).await;
                return Err(CoreError::Validation(format!("no such disk: {old_name}")));
            }
            Err(e) => {
                let mut rollback = HashMap::new();
                rollback.insert("disk_name".to_string(), old_name.to_string());
                let _ = ctx.provider.tag_volume(&volume_id, rollback).await;
                return Err(CoreError::Internal(e));
            }
        }
    } else {
        ctx.db.rename_disk(user_id, old_name, new_name).await.map_err(CoreError::Internal)?;
    }

    ctx.emit(ChangeEvent::DiskChanged);
    Ok(())
}

/// The object key an uploaded listing is reachable under is recovered from
/// the URI `upload_object` handed back at capture time
/// (`s3://<bucket>/<key>`) by dropping the scheme and bucket segments.
fn object_key_from_uri(uri: &str) -> &str {
    uri.splitn(4, '/').last().unwrap_or(uri)
}

/// Fetch the most recent directory-listing snapshot taken for a disk
/// (`snapshot::capture_content`), if one exists.
pub async fn list_content(ctx: &AppContext, user_id: &str, disk_name: &str) -> CoreResult<Option<String>> {
    let disk = ctx
        .db
        .get_disk(user_id, disk_name)
        .await
        .map_err(CoreError::Internal)?
        .ok_or_else(|| CoreError::Validation(format!("no such disk: {disk_name}")))?;

    let Some(uri) = disk.latest_snapshot_content_s3 else {
        return Ok(None);
    };

    let key = object_key_from_uri(&uri);
    let bytes = ctx.provider.download_object(key).await?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    #[tokio::test]
    async fn create_disk_then_fetch() {
        let ctx = test_context().await;
        let disk = create_disk(&ctx, "u1", "scratch", 100).await.unwrap();
        assert_eq!(disk.size_gb, 100);
        assert!(!disk.in_use);
        assert!(disk.provider_volume_id.is_none());
    }

    #[tokio::test]
    async fn create_disk_rejects_bad_name() {
        let ctx = test_context().await;
        let err = create_disk(&ctx, "u1", "bad name!", 100).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn create_disk_rejects_duplicate_name() {
        let ctx = test_context().await;
        create_disk(&ctx, "u1", "scratch", 100).await.unwrap();
        let err = create_disk(&ctx, "u1", "scratch", 50).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_disk_refuses_while_attached() {
        let ctx = test_context().await;
        create_disk(&ctx, "u1", "scratch", 100).await.unwrap();
        ctx.db.set_disk_attachment("u1", "scratch", Some(Uuid::new_v4())).await.unwrap();

        let err = delete_disk(&ctx, "u1", "scratch").await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn delete_disk_soft_deletes_with_grace_period() {
        let ctx = test_context().await;
        create_disk(&ctx, "u1", "scratch", 100).await.unwrap();
        let before = Utc::now();

        delete_disk(&ctx, "u1", "scratch").await.unwrap();

        let disk = ctx.db.get_disk("u1", "scratch").await.unwrap().unwrap();
        assert!(disk.is_deleted);
        let delete_date = disk.delete_date.unwrap();
        assert!(delete_date > before + chrono::Duration::days(29));
        assert!(delete_date < before + chrono::Duration::days(31));
    }

    #[tokio::test]
    async fn delete_disk_is_idempotent() {
        let ctx = test_context().await;
        create_disk(&ctx, "u1", "scratch", 100).await.unwrap();
        delete_disk(&ctx, "u1", "scratch").await.unwrap();
        delete_disk(&ctx, "u1", "scratch").await.unwrap();

        let disk = ctx.db.get_disk("u1", "scratch").await.unwrap().unwrap();
        assert!(disk.is_deleted);
        assert!(disk.delete_date.is_some());
    }

    #[tokio::test]
    async fn rename_disk_without_volume_is_db_only() {
        let ctx = test_context().await;
        create_disk(&ctx, "u1", "scratch", 100).await.unwrap();
        rename_disk(&ctx, "u1", "scratch", "scratch2").await.unwrap();

        assert!(ctx.db.get_disk("u1", "scratch").await.unwrap().is_none());
        assert!(ctx.db.get_disk("u1", "scratch2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn rename_disk_retags_backing_volume() {
        let ctx = test_context().await;
        let disk = create_disk(&ctx, "u1", "scratch", 100).await.unwrap();
        let volume = ctx.provider.create_volume(100, "us-east-1a", HashMap::new()).await.unwrap();
        ctx.db.set_provider_volume_id(disk.disk_id, &volume.volume_id).await.unwrap();

        rename_disk(&ctx, "u1", "scratch", "scratch2").await.unwrap();

        let got = ctx.provider.get_volume(&volume.volume_id).await.unwrap();
        assert_eq!(got.tags.get("disk_name").map(String::as_str), Some("scratch2"));
    }

    #[tokio::test]
    async fn rename_disk_refuses_while_attached() {
        let ctx = test_context().await;
        create_disk(&ctx, "u1", "scratch", 100).await.unwrap();
        ctx.db.set_disk_attachment("u1", "scratch", Some(Uuid::new_v4())).await.unwrap();

        let err = rename_disk(&ctx, "u1", "scratch", "scratch2").await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn list_content_returns_none_without_a_snapshot() {
        let ctx = test_context().await;
        create_disk(&ctx, "u1", "scratch", 100).await.unwrap();
        let content = list_content(&ctx, "u1", "scratch").await.unwrap();
        assert!(content.is_none());
    }

    #[tokio::test]
    async fn list_content_downloads_the_recorded_listing() {
        let ctx = test_context().await;
        let disk = create_disk(&ctx, "u1", "scratch", 100).await.unwrap();
        let key = "snapshot-content/u1/scratch/snap-1.txt";
        let uri = ctx.provider.upload_object(key, b"4.0K\t/workspace".to_vec(), "text/plain").await.unwrap();
        sqlx::query("UPDATE disks SET latest_snapshot_content_s3 = $1 WHERE disk_id = $2")
            .bind(&uri)
            .bind(disk.disk_id)
            .execute(&ctx.db.pool)
            .await
            .unwrap();

        let content = list_content(&ctx, "u1", "scratch").await.unwrap().unwrap();
        assert_eq!(content, "4.0K\t/workspace");
    }
}
