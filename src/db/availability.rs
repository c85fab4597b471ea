use anyhow::{Context, Result};

use super::models::GpuTypeRow;
use super::Database;

/// Snapshot of a tick's aggregated availability numbers for one GPU type
/// (§4.6), ready to be written back with `update_gpu_availability`.
#[derive(Debug, Clone)]
pub struct AvailabilityUpdate {
    pub gpu_type: String,
    pub total_gpus: i32,
    pub available_gpus: i32,
    pub max_reservable: i32,
    pub full_nodes_available: i32,
    pub running_instances: i32,
    pub desired_capacity: i32,
    pub gpus_per_instance: i32,
}

impl Database {
    pub async fn get_gpu_type(&self, gpu_type: &str) -> Result<Option<GpuTypeRow>> {
        let row = sqlx::query_as::<_, GpuTypeRow>(
            "SELECT * FROM gpu_types WHERE gpu_type = $1",
        )
        .bind(gpu_type)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch gpu type")?;

        Ok(row)
    }

    /// All active GPU types, the table this crate treats as the live
    /// availability source (§4.6, Open Question resolution in DESIGN.md).
    pub async fn list_active_gpu_types(&self) -> Result<Vec<GpuTypeRow>> {
        let rows = sqlx::query_as::<_, GpuTypeRow>(
            "SELECT * FROM gpu_types WHERE is_active = TRUE ORDER BY gpu_type",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list active gpu types")?;

        Ok(rows)
    }

    pub async fn list_multinode_capable_gpu_types(&self) -> Result<Vec<GpuTypeRow>> {
        let rows = sqlx::query_as::<_, GpuTypeRow>(
            "SELECT * FROM gpu_types WHERE is_active = TRUE AND supports_multinode = TRUE ORDER BY gpu_type",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to list multinode-capable gpu types")?;

        Ok(rows)
    }

    /// Overwrite the dynamic availability columns for one GPU type,
    /// preserving the static configuration columns untouched.
    pub async fn update_gpu_availability(&self, u: &AvailabilityUpdate, updated_by: &str) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE gpu_types SET
                total_cluster_gpus = $1,
                available_gpus = $2,
                max_reservable = $3,
                full_nodes_available = $4,
                running_instances = $5,
                desired_capacity = $6,
                max_per_node = $7,
                last_availability_update = NOW(),
                last_availability_updated_by = $8
            WHERE gpu_type = $9
            "#,
        )
        .bind(u.total_gpus)
        .bind(u.available_gpus)
        .bind(u.max_reservable)
        .bind(u.full_nodes_available)
        .bind(u.running_instances)
        .bind(u.desired_capacity)
        .bind(u.gpus_per_instance)
        .bind(updated_by)
        .bind(&u.gpu_type)
        .execute(&self.pool)
        .await
        .context("failed to update gpu availability")?
        .rows_affected();

        Ok(rows > 0)
    }
}
