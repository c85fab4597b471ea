use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::Reservation;
use super::Database;

/// Fields accepted when creating a reservation (§4.5 admission).
#[derive(Debug, Clone)]
pub struct NewReservation {
    pub reservation_id: Uuid,
    pub user_id: String,
    pub gpu_type: String,
    pub gpu_count: i32,
    pub duration_hours: f64,
    pub name: Option<String>,
    pub disk_name: Option<String>,
    pub image_reference: Option<String>,
    pub notebook_enabled: bool,
    pub secondary_users: Vec<String>,
    pub is_multinode: bool,
    pub master_reservation_id: Option<Uuid>,
    pub node_index: i32,
    pub total_nodes: i32,
    pub cli_version: Option<String>,
}

impl Database {
    pub async fn create_reservation(&self, r: &NewReservation) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO reservations (
                reservation_id, user_id, gpu_type, gpu_count, duration_hours,
                name, disk_name, image_reference, notebook_enabled, secondary_users,
                status, status_history, is_multinode, master_reservation_id,
                node_index, total_nodes, cli_version
            ) VALUES (
                $1, $2, $3, $4, $5,
                $6, $7, $8, $9, $10,
                'queued', '[]'::jsonb, $11, $12,
                $13, $14, $15
            )
            "#,
        )
        .bind(r.reservation_id)
        .bind(&r.user_id)
        .bind(&r.gpu_type)
        .bind(r.gpu_count)
        .bind(r.duration_hours)
        .bind(&r.name)
        .bind(&r.disk_name)
        .bind(&r.image_reference)
        .bind(r.notebook_enabled)
        .bind(serde_json::to_value(&r.secondary_users)?)
        .bind(r.is_multinode)
        .bind(r.master_reservation_id)
        .bind(r.node_index)
        .bind(r.total_nodes)
        .bind(&r.cli_version)
        .execute(&self.pool)
        .await
        .context("failed to insert reservation")?;

        Ok(())
    }

    /// Insert every row in `rows` inside a single transaction, so a
    /// multinode group's master and children either all commit or none do
    /// (§4.6 "creation is transactional across C3").
    pub async fn create_reservations_batch(&self, rows: &[NewReservation]) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        for r in rows {
            sqlx::query(
                r#"
                INSERT INTO reservations (
                    reservation_id, user_id, gpu_type, gpu_count, duration_hours,
                    name, disk_name, image_reference, notebook_enabled, secondary_users,
                    status, status_history, is_multinode, master_reservation_id,
                    node_index, total_nodes, cli_version
                ) VALUES (
                    $1, $2, $3, $4, $5,
                    $6, $7, $8, $9, $10,
                    'queued', '[]'::jsonb, $11, $12,
                    $13, $14, $15
                )
                "#,
            )
            .bind(r.reservation_id)
            .bind(&r.user_id)
            .bind(&r.gpu_type)
            .bind(r.gpu_count)
            .bind(r.duration_hours)
            .bind(&r.name)
            .bind(&r.disk_name)
            .bind(&r.image_reference)
            .bind(r.notebook_enabled)
            .bind(serde_json::to_value(&r.secondary_users)?)
            .bind(r.is_multinode)
            .bind(r.master_reservation_id)
            .bind(r.node_index)
            .bind(r.total_nodes)
            .bind(&r.cli_version)
            .execute(&mut *tx)
            .await
            .context("failed to insert reservation in batch")?;
        }

        tx.commit().await?;
        Ok(())
    }

    pub async fn get_reservation(&self, reservation_id: Uuid) -> Result<Option<Reservation>> {
        let row = sqlx::query_as::<_, Reservation>(
            "SELECT * FROM reservations WHERE reservation_id = $1",
        )
        .bind(reservation_id)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch reservation")?;

        Ok(row)
    }

    pub async fn list_reservations_by_user(&self, user_id: &str, limit: i64) -> Result<Vec<Reservation>> {
        let rows = sqlx::query_as::<_, Reservation>(
            r#"
            SELECT * FROM reservations
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list reservations by user")?;

        Ok(rows)
    }

    pub async fn count_active_by_gpu_type(&self, gpu_type: &str) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*) FROM reservations
            WHERE gpu_type = $1
              AND status IN ('active', 'pending', 'preparing', 'queued')
            "#,
        )
        .bind(gpu_type)
        .fetch_one(&self.pool)
        .await
        .context("failed to count active reservations")?;

        Ok(count)
    }

    /// Reservations past `expires_at` that are still occupying capacity.
    pub async fn list_expired(&self, limit: i64) -> Result<Vec<Reservation>> {
        let rows = sqlx::query_as::<_, Reservation>(
            r#"
            SELECT * FROM reservations
            WHERE expires_at IS NOT NULL
              AND expires_at < NOW()
              AND status IN ('active', 'pending', 'preparing')
            ORDER BY expires_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("failed to list expired reservations")?;

        Ok(rows)
    }

    /// Launched, non-terminal reservations, the candidate set for the
    /// expiry warning scan (§4.7).
    pub async fn list_launched_non_terminal(&self) -> Result<Vec<Reservation>> {
        let rows = sqlx::query_as::<_, Reservation>(
            r#"
            SELECT * FROM reservations
            WHERE expires_at IS NOT NULL
              AND status NOT IN ('cancelled', 'completed', 'failed')
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list launched non-terminal reservations")?;

        Ok(rows)
    }

    /// Queued or claimed-but-not-yet-launching reservations that have been
    /// stuck past `max_age`, candidates for the stale-pending sweep (§4.7).
    pub async fn list_stale_pending(&self, max_age: chrono::Duration) -> Result<Vec<Reservation>> {
        let cutoff = Utc::now() - max_age;
        let rows = sqlx::query_as::<_, Reservation>(
            r#"
            SELECT * FROM reservations
            WHERE status IN ('queued', 'pending')
              AND created_at < $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .context("failed to list stale pending reservations")?;

        Ok(rows)
    }

    /// All nodes belonging to a multinode group, master first.
    pub async fn list_multinode_group(&self, master_reservation_id: Uuid) -> Result<Vec<Reservation>> {
        let rows = sqlx::query_as::<_, Reservation>(
            r#"
            SELECT * FROM reservations
            WHERE master_reservation_id = $1 OR reservation_id = $1
            ORDER BY node_index ASC
            "#,
        )
        .bind(master_reservation_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list multinode group")?;

        Ok(rows)
    }

    /// Atomically append an entry to `status_history` using Postgres's
    /// jsonb `||` operator, so concurrent writers never clobber each other.
    pub async fn append_status_history(
        &self,
        reservation_id: Uuid,
        status: &str,
        message: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<bool> {
        let entry = serde_json::json!([{
            "status": status,
            "timestamp": Utc::now(),
            "message": message,
            "failure_reason": failure_reason,
        }]);

        let rows = sqlx::query(
            r#"
            UPDATE reservations
            SET status_history = COALESCE(status_history, '[]'::jsonb) || $1::jsonb
            WHERE reservation_id = $2
            "#,
        )
        .bind(entry)
        .bind(reservation_id)
        .execute(&self.pool)
        .await
        .context("failed to append status history")?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Transition `status` and append the corresponding history entry in
    /// one round trip.
    pub async fn update_status(
        &self,
        reservation_id: Uuid,
        new_status: &str,
        detailed_status: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE reservations
            SET status = $1,
                current_detailed_status = COALESCE($2, current_detailed_status),
                failure_reason = COALESCE($3, failure_reason),
                status_history = COALESCE(status_history, '[]'::jsonb) || jsonb_build_array(
                    jsonb_build_object(
                        'status', $1::text,
                        'timestamp', NOW(),
                        'message', $2::text,
                        'failure_reason', $3::text
                    )
                )
            WHERE reservation_id = $4
            "#,
        )
        .bind(new_status)
        .bind(detailed_status)
        .bind(failure_reason)
        .bind(reservation_id)
        .execute(&self.pool)
        .await
        .context("failed to update reservation status")?
        .rows_affected();

        Ok(rows > 0)
    }

    /// Record the pod/workload placement once the orchestrator schedules it.
    pub async fn set_placement(
        &self,
        reservation_id: Uuid,
        pod_name: &str,
        namespace: &str,
        node_ip: Option<&str>,
        node_port: Option<i32>,
        instance_type: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE reservations
            SET pod_name = $1, namespace = $2, node_ip = $3, node_port = $4, instance_type = $5
            WHERE reservation_id = $6
            "#,
        )
        .bind(pod_name)
        .bind(namespace)
        .bind(node_ip)
        .bind(node_port)
        .bind(instance_type)
        .bind(reservation_id)
        .execute(&self.pool)
        .await
        .context("failed to set placement")?;

        Ok(())
    }

    pub async fn set_ssh_command(&self, reservation_id: Uuid, ssh_command: &str) -> Result<()> {
        sqlx::query("UPDATE reservations SET ssh_command = $1 WHERE reservation_id = $2")
            .bind(ssh_command)
            .bind(reservation_id)
            .execute(&self.pool)
            .await
            .context("failed to set ssh command")?;

        Ok(())
    }

    pub async fn set_launched(&self, reservation_id: Uuid, expires_at: DateTime<Utc>) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE reservations
            SET launched_at = NOW(), expires_at = $1
            WHERE reservation_id = $2
            "#,
        )
        .bind(expires_at)
        .bind(reservation_id)
        .execute(&self.pool)
        .await
        .context("failed to set launched_at")?;

        Ok(())
    }

    /// Mark one of the graduated expiry warnings (§4.8) so it is not
    /// re-sent on the next tick.
    pub async fn mark_warned(&self, reservation_id: Uuid, minutes: i32) -> Result<()> {
        let column = match minutes {
            30 => "warned_30",
            15 => "warned_15",
            5 => "warned_5",
            _ => anyhow::bail!("unsupported warning threshold: {minutes}"),
        };

        sqlx::query(&format!(
            "UPDATE reservations SET {column} = TRUE WHERE reservation_id = $1"
        ))
        .bind(reservation_id)
        .execute(&self.pool)
        .await
        .context("failed to mark warning sent")?;

        Ok(())
    }

    /// §4.4 `extend`: set a new `expires_at` and clear any already-sent
    /// warning flag whose threshold no longer applies to the new deadline.
    pub async fn extend_reservation(&self, reservation_id: Uuid, new_expires_at: DateTime<Utc>) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE reservations
            SET expires_at = $1,
                warned_30 = CASE WHEN $1 - NOW() > INTERVAL '30 minutes' THEN FALSE ELSE warned_30 END,
                warned_15 = CASE WHEN $1 - NOW() > INTERVAL '15 minutes' THEN FALSE ELSE warned_15 END,
                warned_5  = CASE WHEN $1 - NOW() > INTERVAL '5 minutes'  THEN FALSE ELSE warned_5  END
            WHERE reservation_id = $2
            "#,
        )
        .bind(new_expires_at)
        .bind(reservation_id)
        .execute(&self.pool)
        .await
        .context("failed to extend reservation")?
        .rows_affected();

        Ok(rows > 0)
    }

    /// §4.4 `add_user`: append a collaborator handle to the secondary-user
    /// set in one statement, same jsonb-concatenation idiom as status history.
    pub async fn add_secondary_user(&self, reservation_id: Uuid, handle: &str) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE reservations
            SET secondary_users = COALESCE(secondary_users, '[]'::jsonb) || to_jsonb(ARRAY[$1::text])
            WHERE reservation_id = $2
            "#,
        )
        .bind(handle)
        .bind(reservation_id)
        .execute(&self.pool)
        .await
        .context("failed to add secondary user")?
        .rows_affected();

        Ok(rows > 0)
    }

    /// §4.4 notebook toggle: set the flag and, on enable, the connection
    /// fields; on disable, clear them.
    pub async fn set_notebook_state(
        &self,
        reservation_id: Uuid,
        enabled: bool,
        notebook_url: Option<&str>,
        notebook_port: Option<i32>,
        notebook_token: Option<&str>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE reservations
            SET notebook_enabled = $1,
                notebook_url = $2,
                notebook_port = $3,
                notebook_token = $4,
                notebook_error = NULL
            WHERE reservation_id = $5
            "#,
        )
        .bind(enabled)
        .bind(notebook_url)
        .bind(notebook_port)
        .bind(notebook_token)
        .bind(reservation_id)
        .execute(&self.pool)
        .await
        .context("failed to set notebook state")?
        .rows_affected();

        Ok(rows > 0)
    }

    pub async fn delete_reservation(&self, reservation_id: Uuid) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM reservations WHERE reservation_id = $1")
            .bind(reservation_id)
            .execute(&self.pool)
            .await
            .context("failed to delete reservation")?
            .rows_affected();

        Ok(rows > 0)
    }
}
