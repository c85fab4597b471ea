use anyhow::{Context, Result};
use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::models::ApiKey;
use super::Database;

/// Hash a presented key for lookup. Keys are never stored in plaintext.
pub fn hash_key(plaintext: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(plaintext.as_bytes());
    format!("{:x}", hasher.finalize())
}

impl Database {
    /// Issue a new API key row (issuance over HTTP is out of scope; this is
    /// the persistence half the out-of-scope handler would call into).
    pub async fn create_api_key(
        &self,
        user_id: &str,
        key_hash: &str,
        ttl_hours: u32,
    ) -> Result<Uuid> {
        let key_id = Uuid::new_v4();
        let expires_at = Utc::now() + chrono::Duration::hours(ttl_hours as i64);

        sqlx::query(
            r#"
            INSERT INTO api_keys (key_id, user_id, key_hash, expires_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(key_id)
        .bind(user_id)
        .bind(key_hash)
        .bind(expires_at)
        .execute(&self.pool)
        .await
        .context("failed to insert api key")?;

        Ok(key_id)
    }

    /// Validate a presented plaintext key: must exist, be unrevoked, and
    /// unexpired. Returns the owning `user_id` on success.
    pub async fn validate_api_key(&self, plaintext: &str) -> Result<Option<String>> {
        let hash = hash_key(plaintext);

        let row = sqlx::query_as::<_, ApiKey>(
            "SELECT * FROM api_keys WHERE key_hash = $1",
        )
        .bind(&hash)
        .fetch_optional(&self.pool)
        .await
        .context("failed to look up api key")?;

        let Some(key) = row else {
            return Ok(None);
        };

        if key.revoked {
            return Ok(None);
        }
        if let Some(expires_at) = key.expires_at {
            if expires_at < Utc::now() {
                return Ok(None);
            }
        }

        Ok(Some(key.user_id))
    }

    pub async fn revoke_api_key(&self, key_id: Uuid) -> Result<bool> {
        let rows = sqlx::query("UPDATE api_keys SET revoked = TRUE WHERE key_id = $1")
            .bind(key_id)
            .execute(&self.pool)
            .await
            .context("failed to revoke api key")?
            .rows_affected();

        Ok(rows > 0)
    }

    pub async fn upsert_api_user(&self, user_id: &str, username: &str, is_admin: bool) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO api_users (user_id, username, is_admin)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET username = EXCLUDED.username
            "#,
        )
        .bind(user_id)
        .bind(username)
        .bind(is_admin)
        .execute(&self.pool)
        .await
        .context("failed to upsert api user")?;

        Ok(())
    }
}
