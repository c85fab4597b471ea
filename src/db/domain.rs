use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::models::DomainMapping;
use super::Database;

impl Database {
    pub async fn upsert_domain_mapping(
        &self,
        subdomain: &str,
        node_ip: &str,
        node_port: i32,
        reservation_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO domain_mappings (subdomain, node_ip, node_port, reservation_id, expires_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (subdomain) DO UPDATE SET
                node_ip = EXCLUDED.node_ip,
                node_port = EXCLUDED.node_port,
                reservation_id = EXCLUDED.reservation_id,
                expires_at = EXCLUDED.expires_at
            "#,
        )
        .bind(subdomain)
        .bind(node_ip)
        .bind(node_port)
        .bind(reservation_id)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .context("failed to upsert domain mapping")?;

        Ok(())
    }

    pub async fn get_domain_mapping(&self, subdomain: &str) -> Result<Option<DomainMapping>> {
        let row = sqlx::query_as::<_, DomainMapping>(
            "SELECT * FROM domain_mappings WHERE subdomain = $1",
        )
        .bind(subdomain)
        .fetch_optional(&self.pool)
        .await
        .context("failed to fetch domain mapping")?;

        Ok(row)
    }

    /// Best-effort cleanup during teardown (§4.10 step 7): a reservation
    /// may never have had a mapping (notebook disabled throughout), so the
    /// caller does not treat zero rows affected as an error.
    pub async fn delete_domain_mappings_by_reservation(&self, reservation_id: Uuid) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM domain_mappings WHERE reservation_id = $1")
            .bind(reservation_id)
            .execute(&self.pool)
            .await
            .context("failed to delete domain mappings")?
            .rows_affected();

        Ok(rows)
    }
}
