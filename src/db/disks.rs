use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::Disk;
use super::Database;

#[derive(Debug, Clone)]
pub struct NewDisk {
    pub disk_id: Uuid,
    pub user_id: String,
    pub disk_name: String,
    pub size_gb: i32,
}

impl Database {
    pub async fn create_disk(&self, d: &NewDisk) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO disks (disk_id, user_id, disk_name, size_gb)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, disk_name) DO NOTHING
            "#,
        )
        .bind(d.disk_id)
        .bind(&d.user_id)
        .bind(&d.disk_name)
        .bind(d.size_gb)
        .execute(&self.pool)
        .await
        .context("failed to insert disk")?;

        Ok(())
    }

    pub async fn get_disk(&self, user_id: &str, disk_name: &str) -> Result<Option<Disk>> {
        let row = sqlx::query_as::<_, Disk>(
            "SELECT * FROM disks WHERE user_id = $1 AND disk_name = $2",
        )
        .bind(user_id)
        .bind(disk_name)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch disk")?;

        Ok(row)
    }

    pub async fn get_disk_by_id(&self, disk_id: Uuid) -> Result<Option<Disk>> {
        let row = sqlx::query_as::<_, Disk>("SELECT * FROM disks WHERE disk_id = $1")
            .bind(disk_id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch disk by id")?;

        Ok(row)
    }

    pub async fn get_disk_by_volume_id(&self, provider_volume_id: &str) -> Result<Option<Disk>> {
        let row = sqlx::query_as::<_, Disk>(
            "SELECT * FROM disks WHERE provider_volume_id = $1",
        )
        .bind(provider_volume_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch disk by volume id")?;

        Ok(row)
    }

    pub async fn list_disks_by_user(&self, user_id: &str, include_deleted: bool) -> Result<Vec<Disk>> {
        let rows = if include_deleted {
            sqlx::query_as::<_, Disk>(
                "SELECT * FROM disks WHERE user_id = $1 ORDER BY created_at DESC",
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
        } else {
            sqlx::query_as::<_, Disk>(
                "SELECT * FROM disks WHERE user_id = $1 AND is_deleted = FALSE ORDER BY created_at DESC",
            )
            .bind(user_id)
            .fetch_all(&self.pool)
            .await
        }
        .context("failed to list disks by user")?;

        Ok(rows)
    }

    pub async fn list_disks_in_use(&self) -> Result<Vec<Disk>> {
        let rows = sqlx::query_as::<_, Disk>(
            "SELECT * FROM disks WHERE in_use = TRUE AND is_deleted = FALSE ORDER BY last_used DESC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list disks in use")?;

        Ok(rows)
    }

    pub async fn list_all(&self) -> Result<Vec<Disk>> {
        let rows = sqlx::query_as::<_, Disk>("SELECT * FROM disks ORDER BY created_at ASC")
            .fetch_all(&self.pool)
            .await
            .context("failed to list all disks")?;

        Ok(rows)
    }

    pub async fn list_pending_deletion(&self) -> Result<Vec<Disk>> {
        let rows = sqlx::query_as::<_, Disk>(
            "SELECT * FROM disks WHERE is_deleted = TRUE ORDER BY delete_date ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list disks pending deletion")?;

        Ok(rows)
    }

    /// Atomically set or clear `in_use`/`attached_to_reservation`. Passing
    /// `reservation_id = None` frees the disk.
    pub async fn set_disk_attachment(
        &self,
        user_id: &str,
        disk_name: &str,
        reservation_id: Option<Uuid>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE disks
            SET in_use = $1, attached_to_reservation = $2, last_used = NOW()
            WHERE user_id = $3 AND disk_name = $4
            "#,
        )
        .bind(reservation_id.is_some())
        .bind(reservation_id)
        .bind(user_id)
        .bind(disk_name)
        .execute(&self.pool)
        .await
        .context("failed to set disk attachment")?
        .rows_affected();

        Ok(rows > 0)
    }

    pub async fn mark_disk_deleted(
        &self,
        user_id: &str,
        disk_name: &str,
        delete_date: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE disks
            SET is_deleted = TRUE, delete_date = $1, in_use = FALSE, attached_to_reservation = NULL
            WHERE user_id = $2 AND disk_name = $3
            "#,
        )
        .bind(delete_date)
        .bind(user_id)
        .bind(disk_name)
        .execute(&self.pool)
        .await
        .context("failed to mark disk deleted")?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Rename a disk in place. Callers must already have checked `in_use`;
    /// this only performs the store-side half of the rename (re-tagging
    /// cloud snapshots is the caller's responsibility, in the same
    /// transaction scope per §4.8).
    pub async fn rename_disk(&self, user_id: &str, old_name: &str, new_name: &str) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE disks SET disk_name = $1 WHERE user_id = $2 AND disk_name = $3",
        )
        .bind(new_name)
        .bind(user_id)
        .bind(old_name)
        .execute(&self.pool)
        .await
        .context("failed to rename disk")?
        .rows_affected();

        Ok(rows > 0)
    }

    pub async fn delete_disk(&self, user_id: &str, disk_name: &str) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM disks WHERE user_id = $1 AND disk_name = $2")
            .bind(user_id)
            .bind(disk_name)
            .execute(&self.pool)
            .await
            .context("failed to delete disk")?
            .rows_affected();

        Ok(rows > 0)
    }

    pub async fn update_disk_operation(
        &self,
        user_id: &str,
        disk_name: &str,
        operation_id: &str,
        operation_status: &str,
        operation_error: Option<&str>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE disks
            SET operation_id = $1, operation_status = $2, operation_error = $3
            WHERE user_id = $4 AND disk_name = $5
            "#,
        )
        .bind(operation_id)
        .bind(operation_status)
        .bind(operation_error)
        .bind(user_id)
        .bind(disk_name)
        .execute(&self.pool)
        .await
        .context("failed to update disk operation")?
        .rows_affected();

        Ok(rows > 0)
    }

    pub async fn set_provider_volume_id(
        &self,
        disk_id: Uuid,
        provider_volume_id: &str,
    ) -> Result<()> {
        sqlx::query("UPDATE disks SET provider_volume_id = $1 WHERE disk_id = $2")
            .bind(provider_volume_id)
            .bind(disk_id)
            .execute(&self.pool)
            .await
            .context("failed to set provider volume id")?;

        Ok(())
    }

    pub async fn set_quarantined(&self, disk_id: Uuid, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE disks
            SET operation_status = 'quarantined', operation_error = $1
            WHERE disk_id = $2
            "#,
        )
        .bind(reason)
        .bind(disk_id)
        .execute(&self.pool)
        .await
        .context("failed to quarantine disk")?;

        Ok(())
    }

    /// Atomically bump `snapshot_count`/`pending_snapshot_count`, clamping
    /// at zero so a stray decrement can never go negative (§9).
    pub async fn adjust_snapshot_counts(
        &self,
        disk_id: Uuid,
        snapshot_delta: i32,
        pending_delta: i32,
        clear_backing_up: bool,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE disks
            SET snapshot_count = GREATEST(0, snapshot_count + $1),
                pending_snapshot_count = GREATEST(0, pending_snapshot_count + $2),
                last_snapshot_at = CASE WHEN $1 > 0 THEN NOW() ELSE last_snapshot_at END,
                is_backing_up = CASE WHEN $3 THEN FALSE ELSE is_backing_up END
            WHERE disk_id = $4
            "#,
        )
        .bind(snapshot_delta)
        .bind(pending_delta)
        .bind(clear_backing_up)
        .bind(disk_id)
        .execute(&self.pool)
        .await
        .context("failed to adjust snapshot counts")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_disk(user_id: &str, name: &str) -> NewDisk {
        NewDisk {
            disk_id: Uuid::new_v4(),
            user_id: user_id.into(),
            disk_name: name.into(),
            size_gb: 100,
        }
    }

    #[tokio::test]
    async fn create_then_get_round_trips() {
        let db = Database::test_db().await;
        let d = new_disk("u1", "scratch");
        db.create_disk(&d).await.unwrap();

        let got = db.get_disk("u1", "scratch").await.unwrap().unwrap();
        assert_eq!(got.size_gb, 100);
        assert!(!got.in_use);
    }

    #[tokio::test]
    async fn set_disk_attachment_attach_and_release() {
        let db = Database::test_db().await;
        let d = new_disk("u1", "scratch");
        db.create_disk(&d).await.unwrap();

        let reservation_id = Uuid::new_v4();
        db.set_disk_attachment("u1", "scratch", Some(reservation_id)).await.unwrap();
        let got = db.get_disk("u1", "scratch").await.unwrap().unwrap();
        assert!(got.in_use);
        assert_eq!(got.attached_to_reservation, Some(reservation_id));

        db.set_disk_attachment("u1", "scratch", None).await.unwrap();
        let got = db.get_disk("u1", "scratch").await.unwrap().unwrap();
        assert!(!got.in_use);
        assert_eq!(got.attached_to_reservation, None);
    }

    #[tokio::test]
    async fn adjust_snapshot_counts_never_goes_negative() {
        let db = Database::test_db().await;
        let d = new_disk("u1", "scratch");
        db.create_disk(&d).await.unwrap();

        db.adjust_snapshot_counts(d.disk_id, -5, -5, false).await.unwrap();
        let got = db.get_disk_by_id(d.disk_id).await.unwrap().unwrap();
        assert_eq!(got.snapshot_count, 0);
        assert_eq!(got.pending_snapshot_count, 0);
    }

    #[tokio::test]
    async fn adjust_snapshot_counts_clears_backing_up_flag() {
        let db = Database::test_db().await;
        let d = new_disk("u1", "scratch");
        db.create_disk(&d).await.unwrap();
        db.update_disk_operation("u1", "scratch", "op1", "in_progress", None).await.unwrap();
        db.adjust_snapshot_counts(d.disk_id, 0, 1, false).await.unwrap();

        db.adjust_snapshot_counts(d.disk_id, 1, -1, true).await.unwrap();
        let got = db.get_disk_by_id(d.disk_id).await.unwrap().unwrap();
        assert_eq!(got.snapshot_count, 1);
        assert_eq!(got.pending_snapshot_count, 0);
        assert!(!got.is_backing_up);
    }

    #[tokio::test]
    async fn rename_disk_updates_name() {
        let db = Database::test_db().await;
        let d = new_disk("u1", "scratch");
        db.create_disk(&d).await.unwrap();

        let renamed = db.rename_disk("u1", "scratch", "scratch2").await.unwrap();
        assert!(renamed);
        assert!(db.get_disk("u1", "scratch").await.unwrap().is_none());
        assert!(db.get_disk("u1", "scratch2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn mark_disk_deleted_clears_attachment() {
        let db = Database::test_db().await;
        let d = new_disk("u1", "scratch");
        db.create_disk(&d).await.unwrap();
        db.set_disk_attachment("u1", "scratch", Some(Uuid::new_v4())).await.unwrap();

        db.mark_disk_deleted("u1", "scratch", Utc::now()).await.unwrap();
        let got = db.get_disk("u1", "scratch").await.unwrap().unwrap();
        assert!(got.is_deleted);
        assert!(!got.in_use);
        assert_eq!(got.attached_to_reservation, None);
    }
}
