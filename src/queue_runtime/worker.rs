//! Decodes one queue message into a typed request and dispatches it to
//! the C5 (reservation) or C9 (disk) entry point that owns it.
//!
//! Returning `Err` here always means "leave this message for redelivery".
//! `run_create` already distinguishes permanent vs. retryable failure
//! internally and only ever returns `Err` for the retryable case; the
//! other entry points raise a plain `CoreError` for both, so
//! [`permanent_or_redeliver`] does that classification here instead.

use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::context::AppContext;
use crate::db::queue::QueueMessage;
use crate::disk;
use crate::error::{CoreError, CoreResult};
use crate::reservation::{self, CreateRequest};

#[derive(Debug, Deserialize)]
struct CancelRequest {
    reservation_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
enum ActionKind {
    Extend,
    AddUser,
    EnableNotebook,
    DisableNotebook,
}

#[derive(Debug, Deserialize)]
struct ActionRequest {
    reservation_id: Uuid,
    kind: ActionKind,
    #[serde(default)]
    additional_hours: Option<i64>,
    #[serde(default)]
    handle: Option<String>,
}

#[derive(Debug, Deserialize)]
struct DiskCreateRequest {
    user_id: String,
    disk_name: String,
    size_gb: i32,
}

#[derive(Debug, Deserialize)]
struct DiskDeleteRequest {
    user_id: String,
    disk_name: String,
}

pub async fn process(ctx: &AppContext, message: QueueMessage) -> CoreResult<()> {
    let msg_id = message.msg_id;
    let action = message.body.get("action").and_then(|v| v.as_str()).unwrap_or("").to_string();

    // A message that doesn't even parse into its expected shape will
    // never parse on redelivery either, so decode failures are always
    // dropped rather than left for retry.
    match action.as_str() {
        "reservation.create" => match decode::<CreateRequest>(message.body) {
            Ok(req) => reservation::run_create(ctx, req).await,
            Err(e) => drop_malformed(&action, e),
        },
        "reservation.cancel" => match decode::<CancelRequest>(message.body) {
            Ok(req) => permanent_or_redeliver(reservation::cancel(ctx, req.reservation_id).await),
            Err(e) => drop_malformed(&action, e),
        },
        "reservation.action" => match decode::<ActionRequest>(message.body) {
            Ok(req) => permanent_or_redeliver(dispatch_action(ctx, req).await),
            Err(e) => drop_malformed(&action, e),
        },
        "disk.create" => match decode::<DiskCreateRequest>(message.body) {
            Ok(req) => {
                permanent_or_redeliver(disk::create_disk(ctx, &req.user_id, &req.disk_name, req.size_gb).await.map(|_| ()))
            }
            Err(e) => drop_malformed(&action, e),
        },
        "disk.delete" => match decode::<DiskDeleteRequest>(message.body) {
            Ok(req) => permanent_or_redeliver(disk::delete_disk(ctx, &req.user_id, &req.disk_name).await),
            Err(e) => drop_malformed(&action, e),
        },
        other => {
            warn!(msg_id, action = other, "unrecognized queue message action, dropping");
            Ok(())
        }
    }
}

fn drop_malformed(action: &str, e: CoreError) -> CoreResult<()> {
    warn!(action, error = %e, "malformed queue message body, dropping");
    Ok(())
}

async fn dispatch_action(ctx: &AppContext, req: ActionRequest) -> CoreResult<()> {
    match req.kind {
        ActionKind::Extend => {
            let hours = req
                .additional_hours
                .ok_or_else(|| CoreError::Validation("extend action requires additional_hours".to_string()))?;
            reservation::extend(ctx, req.reservation_id, hours).await
        }
        ActionKind::AddUser => {
            let handle = req
                .handle
                .ok_or_else(|| CoreError::Validation("add_user action requires handle".to_string()))?;
            reservation::add_user(ctx, req.reservation_id, &handle).await
        }
        ActionKind::EnableNotebook => reservation::set_notebook(ctx, req.reservation_id, true).await,
        ActionKind::DisableNotebook => reservation::set_notebook(ctx, req.reservation_id, false).await,
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: serde_json::Value) -> CoreResult<T> {
    serde_json::from_value(body).map_err(|e| CoreError::Validation(format!("malformed queue message: {e}")))
}

fn permanent_or_redeliver(result: CoreResult<()>) -> CoreResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_retryable() => Err(e),
        Err(e) => {
            warn!(error = %e, "queue action failed permanently, dropping the message");
            Ok(())
        }
    }
}
