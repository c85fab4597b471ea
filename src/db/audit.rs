use anyhow::{Context, Result};
use uuid::Uuid;

use super::Database;

/// One append-only audit entry (§3). `details` carries action-specific
/// fields as opaque JSON so this table never needs a migration to record a
/// new kind of event.
#[derive(Debug, Clone)]
pub struct NewAuditEvent<'a> {
    pub user_id: Option<&'a str>,
    pub username: Option<&'a str>,
    pub event_type: &'a str,
    pub resource_type: &'a str,
    pub resource_id: Option<&'a str>,
    pub action: &'a str,
    pub details: serde_json::Value,
    pub ip: Option<&'a str>,
    pub user_agent: Option<&'a str>,
}

impl Database {
    pub async fn log_audit_event(&self, e: NewAuditEvent<'_>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO audit_log (
                event_id, user_id, username, event_type, resource_type,
                resource_id, action, details, ip, user_agent
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(e.user_id)
        .bind(e.username)
        .bind(e.event_type)
        .bind(e.resource_type)
        .bind(e.resource_id)
        .bind(e.action)
        .bind(e.details)
        .bind(e.ip)
        .bind(e.user_agent)
        .execute(&self.pool)
        .await
        .context("failed to log audit event")?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn log_audit_event_inserts_a_row() {
        let db = Database::test_db().await;
        db.log_audit_event(NewAuditEvent {
            user_id: Some("u1"),
            username: Some("alice"),
            event_type: "reservation",
            resource_type: "reservation",
            resource_id: Some("r1"),
            action: "cancel",
            details: serde_json::json!({"reason": "user requested"}),
            ip: Some("127.0.0.1"),
            user_agent: Some("cli/1.0"),
        })
        .await
        .unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM audit_log")
            .fetch_one(&db.pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
