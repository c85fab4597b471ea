//! The queue runtime (C4, §4.3): a single poller pulling batches off
//! `reservation_queue`, one in-process worker task per message under a
//! `MAX_CONCURRENT_JOBS` ceiling, each bounded by a deadline equal to its
//! own visibility window. Workers are `tokio::spawn`ed tasks rather than
//! subprocesses - a worker that blows its deadline is simply dropped
//! without acking, which redelivers the message exactly like a killed
//! process would.

mod worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::AppContext;
use crate::error::{CoreError, CoreResult};
use crate::orchestrator::OrchestratorClient;

/// One poll cycle: pull up to `batch_size` visible messages, archive
/// anything already past `max_retries`, and run the rest concurrently
/// (bounded by `max_concurrent_jobs`), deleting each on success and
/// leaving it for redelivery on failure or timeout.
pub async fn tick(ctx: &AppContext) -> CoreResult<()> {
    let messages = ctx
        .db
        .read_queue(ctx.config.visibility_timeout_seconds as i64, ctx.config.batch_size)
        .await
        .map_err(CoreError::Internal)?;

    let semaphore = Arc::new(Semaphore::new(ctx.config.max_concurrent_jobs.max(1) as usize));
    let mut handles = Vec::with_capacity(messages.len());

    for message in messages {
        let msg_id = message.msg_id;

        if message.read_ct >= ctx.config.max_retries {
            warn!(msg_id, read_ct = message.read_ct, "message exceeded its retry budget, archiving");
            if let Err(e) = ctx.db.archive_message(msg_id).await {
                warn!(msg_id, error = %e, "failed to archive dead-lettered message");
            }
            continue;
        }

        let permit = semaphore.clone().acquire_owned().await.expect("semaphore is never closed");
        let worker_ctx = ctx.clone();
        let deadline = Duration::from_secs(ctx.config.visibility_timeout_seconds);

        let handle = tokio::spawn(async move {
            let _permit = permit;
            match tokio::time::timeout(deadline, worker::process(&worker_ctx, message)).await {
                Ok(inner) => inner,
                Err(_) => Err(CoreError::DeadlineExceeded("worker exceeded its visibility window".to_string())),
            }
        });
        handles.push((msg_id, handle));
    }

    for (msg_id, handle) in handles {
        match handle.await {
            Ok(Ok(())) => {
                if let Err(e) = ctx.db.delete_message(msg_id).await {
                    warn!(msg_id, error = %e, "failed to delete a processed message");
                }
            }
            Ok(Err(e)) => {
                warn!(msg_id, error = %e, "message failed, leaving it for redelivery");
            }
            Err(e) => {
                warn!(msg_id, error = %e, "worker task panicked, leaving the message for redelivery");
            }
        }
    }

    Ok(())
}

/// Best-effort startup recovery: log workloads that were already running
/// before this process started (their name is the reservation id, per
/// `reservation::create_workload_and_wait`), so an operator can see at a
/// glance how many in-flight reservations survived the restart. Purely
/// informational - every C5 entry point is itself safe to re-run from a
/// redelivered message, so this never gates dispatch.
async fn log_recovered_workers(ctx: &AppContext) {
    match ctx.orchestrator.list_workload_names().await {
        Ok(names) => {
            let recovered = names.iter().filter(|n| Uuid::parse_str(n).is_ok()).count();
            if recovered > 0 {
                info!(recovered, "found workloads already running from before this restart");
            }
        }
        Err(e) => warn!(error = %e, "failed to list existing workloads during startup recovery"),
    }
}

/// The runtime's top-level task: recover, then poll forever on
/// `poll_interval_seconds`.
pub async fn run(ctx: AppContext) {
    log_recovered_workers(&ctx).await;

    let mut interval = tokio::time::interval(Duration::from_secs(ctx.config.poll_interval_seconds));
    interval.tick().await;

    loop {
        interval.tick().await;
        if let Err(e) = tick(&ctx).await {
            warn!(error = %e, "queue runtime tick failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;

    #[tokio::test]
    async fn tick_processes_a_disk_create_message() {
        let ctx = test_context().await;
        ctx.db
            .enqueue(&serde_json::json!({
                "action": "disk.create",
                "user_id": "u1",
                "disk_name": "scratch",
                "size_gb": 20,
            }))
            .await
            .unwrap();

        tick(&ctx).await.unwrap();

        let disk = ctx.db.get_disk("u1", "scratch").await.unwrap().unwrap();
        assert_eq!(disk.size_gb, 20);
        assert!(ctx.db.read_queue(0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tick_archives_a_message_past_its_retry_budget() {
        let ctx = test_context().await;
        let msg_id = ctx.db.enqueue(&serde_json::json!({"action": "disk.create"})).await.unwrap();
        for _ in 0..ctx.config.max_retries {
            ctx.db.read_queue(0, 10).await.unwrap();
        }

        tick(&ctx).await.unwrap();

        assert!(ctx.db.read_queue(0, 10).await.unwrap().is_empty());
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM reservation_queue_archive WHERE msg_id = $1")
            .bind(msg_id)
            .fetch_one(&ctx.db.pool)
            .await
            .unwrap();
        assert_eq!(row.0, 1);
    }

    #[tokio::test]
    async fn tick_leaves_an_unrecognized_but_well_formed_message_alone_only_when_processed_ok() {
        let ctx = test_context().await;
        ctx.db.enqueue(&serde_json::json!({"action": "noop.unused"})).await.unwrap();

        tick(&ctx).await.unwrap();

        // Unrecognized actions are logged and dropped, same as success.
        assert!(ctx.db.read_queue(0, 10).await.unwrap().is_empty());
    }
}
