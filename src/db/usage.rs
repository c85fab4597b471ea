use anyhow::{Context, Result};
use uuid::Uuid;

use super::Database;

#[derive(Debug, Clone)]
pub struct NewTokenUsage<'a> {
    pub user_id: &'a str,
    pub model: &'a str,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cost: i64,
    pub request_id: Option<&'a str>,
}

impl Database {
    pub async fn log_usage(&self, u: NewTokenUsage<'_>) -> Result<()> {
        let total_tokens = u.input_tokens + u.output_tokens;

        sqlx::query(
            r#"
            INSERT INTO token_usage (
                usage_id, user_id, model, input_tokens, output_tokens,
                total_tokens, cost, request_id
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(u.user_id)
        .bind(u.model)
        .bind(u.input_tokens)
        .bind(u.output_tokens)
        .bind(total_tokens)
        .bind(u.cost)
        .bind(u.request_id)
        .execute(&self.pool)
        .await
        .context("failed to log token usage")?;

        Ok(())
    }

    pub async fn total_cost_for_user(&self, user_id: &str) -> Result<i64> {
        let (total,): (Option<i64>,) =
            sqlx::query_as("SELECT SUM(cost) FROM token_usage WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.pool)
                .await
                .context("failed to sum usage cost")?;

        Ok(total.unwrap_or(0))
    }
}
