//! The reservation state machine (C5, §4.4): admission, storage
//! allocation, workload creation with readiness polling, user actions on
//! an active reservation, and cancellation. Each stage is a single
//! `status` transition plus a `status_history` append in the same
//! statement, mirroring the teacher's tick-function shape — a
//! periodic/queue-triggered async function that reads state, decides,
//! and writes back through `Database`.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::{AppContext, ChangeEvent};
use crate::db::reservations::NewReservation;
use crate::error::{CoreError, CoreResult};
use crate::orchestrator::{WorkloadSpec, WorkloadStatus};
use crate::provider::with_retry;
use crate::teardown;

const READINESS_TIMEOUT: Duration = Duration::from_secs(15 * 60);
const READINESS_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// The `reservation.create` message body (§6), already validated as JSON
/// by the queue runtime before it reaches this module.
#[derive(Debug, Clone, Deserialize)]
pub struct CreateRequest {
    pub reservation_id: Uuid,
    pub user_id: String,
    pub gpu_type: String,
    pub gpu_count: i32,
    pub duration_hours: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub disk_name: Option<String>,
    #[serde(default)]
    pub image_reference: Option<String>,
    #[serde(default)]
    pub notebook_enabled: bool,
    #[serde(default)]
    pub cli_version: Option<String>,
    #[serde(default)]
    pub is_multinode: bool,
    #[serde(default)]
    pub master_reservation_id: Option<Uuid>,
    #[serde(default)]
    pub node_index: i32,
    #[serde(default)]
    pub total_nodes: i32,
}

/// Internal control-flow error: `Permanent` means the reservation is
/// already recorded as `failed` and the message should simply be
/// deleted; `Retryable` propagates to the caller so the queue lets the
/// visibility window elapse (§7).
#[derive(Debug)]
enum Stage {
    Permanent { reason: &'static str, message: String },
    Retryable(CoreError),
}

impl From<CoreError> for Stage {
    fn from(e: CoreError) -> Self {
        if e.is_retryable() {
            Stage::Retryable(e)
        } else {
            Stage::Permanent {
                reason: e.reason_tag(),
                message: e.to_string(),
            }
        }
    }
}

/// Entry point for a `reservation.create` message. Never propagates a
/// permanent failure as `Err` — those are recorded in the row and the
/// function returns `Ok(())` so the caller deletes the message. Only a
/// `Retryable` stage error surfaces, so the queue redelivers.
pub async fn run_create(ctx: &AppContext, req: CreateRequest) -> CoreResult<()> {
    ensure_reservation_row(ctx, &req).await?;

    match execute_create(ctx, &req).await {
        Ok(()) => {
            ctx.emit(ChangeEvent::ReservationChanged);
            Ok(())
        }
        Err(Stage::Retryable(e)) => {
            let _ = ctx
                .db
                .append_status_history(req.reservation_id, "queued", None, Some(&e.to_string()))
                .await;
            Err(e)
        }
        Err(Stage::Permanent { reason, message }) => {
            record_permanent_failure(ctx, &req, reason, &message).await;
            Ok(())
        }
    }
}

async fn ensure_reservation_row(ctx: &AppContext, req: &CreateRequest) -> CoreResult<()> {
    if ctx
        .db
        .get_reservation(req.reservation_id)
        .await
        .map_err(CoreError::Internal)?
        .is_some()
    {
        return Ok(());
    }

    ctx.db
        .create_reservation(&NewReservation {
            reservation_id: req.reservation_id,
            user_id: req.user_id.clone(),
            gpu_type: req.gpu_type.clone(),
            gpu_count: req.gpu_count,
            duration_hours: req.duration_hours,
            name: req.name.clone(),
            disk_name: req.disk_name.clone(),
            image_reference: req.image_reference.clone(),
            notebook_enabled: req.notebook_enabled,
            secondary_users: Vec::new(),
            is_multinode: req.is_multinode,
            master_reservation_id: req.master_reservation_id,
            node_index: req.node_index,
            total_nodes: req.total_nodes,
            cli_version: req.cli_version.clone(),
        })
        .await
        .map_err(CoreError::Internal)
}

async fn execute_create(ctx: &AppContext, req: &CreateRequest) -> Result<(), Stage> {
    admit(ctx, req).await?;
    let volume_id = allocate_storage(ctx, req).await?;
    create_workload_and_wait(ctx, req, volume_id).await?;
    Ok(())
}

async fn record_permanent_failure(ctx: &AppContext, req: &CreateRequest, reason: &str, message: &str) {
    if let Err(e) = ctx
        .db
        .update_status(req.reservation_id, "failed", Some(message), Some(reason))
        .await
    {
        warn!(reservation_id = %req.reservation_id, error = %e, "failed to record permanent create failure");
    }

    if let Some(disk_name) = &req.disk_name {
        if let Err(e) = ctx.db.set_disk_attachment(&req.user_id, disk_name, None).await {
            warn!(reservation_id = %req.reservation_id, disk_name, error = %e, "failed to release disk after permanent failure");
        }
    }

    ctx.emit(ChangeEvent::ReservationChanged);

    if req.is_multinode {
        let master_id = req.master_reservation_id.unwrap_or(req.reservation_id);
        crate::multinode::cascade_terminal(ctx, master_id, req.reservation_id).await;
    }
}

/// §4.4 admission (`queued → pending`).
async fn admit(ctx: &AppContext, req: &CreateRequest) -> Result<(), Stage> {
    let gpu_row = ctx
        .db
        .get_gpu_type(&req.gpu_type)
        .await
        .map_err(CoreError::Internal)?
        .ok_or_else(|| Stage::Permanent {
            reason: "validation",
            message: format!("unknown gpu type {}", req.gpu_type),
        })?;

    if !gpu_row.is_active {
        return Err(Stage::Permanent {
            reason: "validation",
            message: format!("gpu type {} is not active", req.gpu_type),
        });
    }

    if !req.is_multinode {
        let max = gpu_row.gpus_per_instance();
        if req.gpu_count == 0 && !gpu_row.is_cpu_only() {
            return Err(Stage::Permanent {
                reason: "validation",
                message: "gpu_count=0 is only valid for cpu-only types".to_string(),
            });
        }
        if req.gpu_count < 0 || req.gpu_count > max {
            return Err(Stage::Permanent {
                reason: "validation",
                message: format!("gpu_count {} outside [0,{max}]", req.gpu_count),
            });
        }
    }

    if req.duration_hours <= 0.0 || req.duration_hours > ctx.config.max_reservation_hours {
        return Err(Stage::Permanent {
            reason: "validation",
            message: format!(
                "duration_hours {} outside (0,{}]",
                req.duration_hours, ctx.config.max_reservation_hours
            ),
        });
    }

    if let Some(client_version) = &req.cli_version {
        if !version_at_least(client_version, &ctx.config.min_cli_version) {
            return Err(Stage::Permanent {
                reason: "validation",
                message: format!(
                    "cli version {client_version} is below the required {}",
                    ctx.config.min_cli_version
                ),
            });
        }
    }

    if let Some(disk_name) = &req.disk_name {
        if let Some(disk) = ctx
            .db
            .get_disk(&req.user_id, disk_name)
            .await
            .map_err(CoreError::Internal)?
        {
            if disk.is_deleted {
                return Err(Stage::Permanent {
                    reason: "validation",
                    message: format!("disk {disk_name} is deleted"),
                });
            }
        }
    }

    if gpu_row.available_gpus < req.gpu_count {
        return Err(Stage::Permanent {
            reason: "capacity_exhausted",
            message: format!(
                "requested {} gpus, {} available for {}",
                req.gpu_count, gpu_row.available_gpus, req.gpu_type
            ),
        });
    }

    ctx.db
        .update_status(req.reservation_id, "pending", Some("admission passed"), None)
        .await
        .map_err(CoreError::Internal)?;

    Ok(())
}

/// §4.4 storage allocation (`pending → preparing`). Returns the volume id
/// to attach to the workload, if any.
async fn allocate_storage(ctx: &AppContext, req: &CreateRequest) -> Result<Option<String>, Stage> {
    let Some(disk_name) = &req.disk_name else {
        ctx.db
            .update_status(req.reservation_id, "preparing", Some("no storage requested"), None)
            .await
            .map_err(CoreError::Internal)?;
        return Ok(None);
    };

    let disk = ctx
        .db
        .get_disk(&req.user_id, disk_name)
        .await
        .map_err(CoreError::Internal)?
        .ok_or_else(|| Stage::Permanent {
            reason: "validation",
            message: format!("disk {disk_name} does not exist"),
        })?;

    if disk.in_use {
        return Err(Stage::Permanent {
            reason: "disk_in_use",
            message: format!("disk {disk_name} is already in use"),
        });
    }

    let volume_id = if let Some(volume_id) = disk.provider_volume_id.clone() {
        volume_id
    } else {
        let mut tags = HashMap::new();
        tags.insert("gpu-dev-user".to_string(), req.user_id.clone());
        tags.insert("disk_name".to_string(), disk_name.clone());

        let size_gb = disk.size_gb;
        let zone = ctx.config.primary_availability_zone.clone();
        let volume = with_retry(|| ctx.provider.create_volume(size_gb, &zone, tags.clone()))
            .await
            .map_err(CoreError::from)?;

        ctx.db
            .set_provider_volume_id(disk.disk_id, &volume.volume_id)
            .await
            .map_err(CoreError::Internal)?;

        volume.volume_id
    };

    ctx.db
        .set_disk_attachment(&req.user_id, disk_name, Some(req.reservation_id))
        .await
        .map_err(CoreError::Internal)?;

    ctx.db
        .update_status(req.reservation_id, "preparing", Some("storage allocated"), None)
        .await
        .map_err(CoreError::Internal)?;

    Ok(Some(volume_id))
}

/// §4.4 workload creation (`preparing → active`).
async fn create_workload_and_wait(
    ctx: &AppContext,
    req: &CreateRequest,
    volume_id: Option<String>,
) -> Result<(), Stage> {
    let gpu_row = ctx
        .db
        .get_gpu_type(&req.gpu_type)
        .await
        .map_err(CoreError::Internal)?
        .ok_or_else(|| Stage::Permanent {
            reason: "validation",
            message: "gpu type vanished mid-create".to_string(),
        })?;

    let (cpu_millis, memory_mb) = if req.gpu_count > 0 {
        let cpu_per_gpu = (gpu_row.cpus / gpu_row.max_gpus).max(1);
        let mem_per_gpu = (gpu_row.memory_gb / gpu_row.max_gpus).max(1);
        (
            cpu_per_gpu as i64 * req.gpu_count as i64 * 1000,
            mem_per_gpu as i64 * req.gpu_count as i64 * 1024,
        )
    } else {
        (gpu_row.cpus as i64 * 1000, gpu_row.memory_gb as i64 * 1024)
    };

    let mut env = HashMap::new();
    env.insert("GPU_DEV_USER".to_string(), req.user_id.clone());
    env.insert("NOTEBOOK_ENABLED".to_string(), req.notebook_enabled.to_string());
    if let Some(image) = &req.image_reference {
        env.insert("IMAGE_REFERENCE".to_string(), image.clone());
    }
    if let Some(disk_name) = &req.disk_name {
        env.insert("DISK_NAME".to_string(), disk_name.clone());
    }
    if req.is_multinode {
        env.insert(
            "MULTINODE_MASTER".to_string(),
            req.master_reservation_id.unwrap_or(req.reservation_id).to_string(),
        );
        env.insert("MULTINODE_NODE_INDEX".to_string(), req.node_index.to_string());
        env.insert("MULTINODE_TOTAL_NODES".to_string(), req.total_nodes.to_string());
    }

    let mut node_selector = HashMap::new();
    node_selector.insert("GpuType".to_string(), req.gpu_type.clone());

    let workload_name = req.reservation_id.to_string();

    ctx.orchestrator
        .create_workload(WorkloadSpec {
            name: workload_name.clone(),
            namespace: "default".to_string(),
            image: req
                .image_reference
                .clone()
                .unwrap_or_else(|| "gpu-dev/base:latest".to_string()),
            gpu_count: req.gpu_count,
            cpu_millis,
            memory_mb,
            node_selector,
            env,
            volume_name: volume_id,
            labels: HashMap::new(),
        })
        .await
        .map_err(CoreError::from)?;

    let status = match poll_until_ready(ctx, &workload_name, READINESS_TIMEOUT).await {
        Ok(status) => status,
        Err(stage) => {
            let _ = ctx.orchestrator.delete_workload(&workload_name).await;
            if let Some(disk_name) = &req.disk_name {
                let _ = ctx.db.set_disk_attachment(&req.user_id, disk_name, None).await;
            }
            return Err(stage);
        }
    };

    ctx.db
        .set_placement(
            req.reservation_id,
            &workload_name,
            "default",
            status.node_ip.as_deref(),
            status.node_port,
            None,
        )
        .await
        .map_err(CoreError::Internal)?;

    if let (Some(ip), Some(port)) = (&status.node_ip, status.node_port) {
        ctx.db
            .set_ssh_command(req.reservation_id, &format!("ssh -p {port} user@{ip}"))
            .await
            .map_err(CoreError::Internal)?;
    }

    let expires_at = chrono::Utc::now() + chrono::Duration::milliseconds((req.duration_hours * 3_600_000.0) as i64);
    ctx.db
        .set_launched(req.reservation_id, expires_at)
        .await
        .map_err(CoreError::Internal)?;
    ctx.db
        .update_status(req.reservation_id, "active", Some("workload ready"), None)
        .await
        .map_err(CoreError::Internal)?;

    info!(reservation_id = %req.reservation_id, %workload_name, "reservation active");
    Ok(())
}

async fn poll_until_ready(ctx: &AppContext, workload_name: &str, timeout: Duration) -> Result<WorkloadStatus, Stage> {
    let poll_interval = (timeout / 20).max(Duration::from_millis(1)).min(READINESS_POLL_INTERVAL);
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        match ctx.orchestrator.describe_workload(workload_name).await {
            Ok(status) if status.ready => return Ok(status),
            Ok(_) => {
                if tokio::time::Instant::now() >= deadline {
                    return Err(Stage::Permanent {
                        reason: "preparing_timeout",
                        message: "workload did not become ready before the deadline".to_string(),
                    });
                }
                tokio::time::sleep(poll_interval).await;
            }
            Err(e) => return Err(CoreError::from(e).into()),
        }
    }
}

/// Naive dotted-version comparison, permissive on parse failure (an
/// unparseable floor never blocks a client — it is treated as `0.0.0`).
fn version_at_least(client: &str, floor: &str) -> bool {
    fn parts(v: &str) -> Vec<u32> {
        v.split('.').map(|p| p.parse().unwrap_or(0)).collect()
    }
    let mut client_parts = parts(client);
    let mut floor_parts = parts(floor);
    let len = client_parts.len().max(floor_parts.len());
    client_parts.resize(len, 0);
    floor_parts.resize(len, 0);
    client_parts >= floor_parts
}

/// §4.4 `extend(hours)`.
pub async fn extend(ctx: &AppContext, reservation_id: Uuid, additional_hours: i64) -> CoreResult<()> {
    let reservation = ctx
        .db
        .get_reservation(reservation_id)
        .await
        .map_err(CoreError::Internal)?
        .ok_or_else(|| CoreError::Validation("reservation not found".to_string()))?;

    if reservation.is_terminal() {
        return Err(CoreError::Validation("cannot extend a terminal reservation".to_string()));
    }

    let current_expiry = reservation
        .expires_at
        .ok_or_else(|| CoreError::Validation("reservation has not launched yet".to_string()))?;
    let new_expiry = current_expiry + chrono::Duration::hours(additional_hours);

    let ceiling_ms = (ctx.config.max_reservation_hours * 3_600_000.0) as i64;
    if new_expiry > reservation.created_at + chrono::Duration::milliseconds(ceiling_ms) {
        return Err(CoreError::Validation(
            "extension would exceed MAX_RESERVATION_HOURS".to_string(),
        ));
    }

    ctx.db
        .extend_reservation(reservation_id, new_expiry)
        .await
        .map_err(CoreError::Internal)?;
    ctx.db
        .append_status_history(
            reservation_id,
            &reservation.status,
            Some(&format!("extended by {additional_hours}h")),
            None,
        )
        .await
        .map_err(CoreError::Internal)?;

    ctx.emit(ChangeEvent::ReservationChanged);
    Ok(())
}

/// §4.4 `add_user(handle)`.
pub async fn add_user(ctx: &AppContext, reservation_id: Uuid, handle: &str) -> CoreResult<()> {
    let updated = ctx
        .db
        .add_secondary_user(reservation_id, handle)
        .await
        .map_err(CoreError::Internal)?;

    if !updated {
        return Err(CoreError::Validation("reservation not found".to_string()));
    }

    ctx.emit(ChangeEvent::ReservationChanged);
    Ok(())
}

/// §4.4 `enable_notebook` / `disable_notebook`.
pub async fn set_notebook(ctx: &AppContext, reservation_id: Uuid, enabled: bool) -> CoreResult<()> {
    let reservation = ctx
        .db
        .get_reservation(reservation_id)
        .await
        .map_err(CoreError::Internal)?
        .ok_or_else(|| CoreError::Validation("reservation not found".to_string()))?;

    if !enabled {
        ctx.db
            .set_notebook_state(reservation_id, false, None, None, None)
            .await
            .map_err(CoreError::Internal)?;
        ctx.emit(ChangeEvent::ReservationChanged);
        return Ok(());
    }

    let pod_name = reservation
        .pod_name
        .ok_or_else(|| CoreError::Validation("reservation has no running workload".to_string()))?;

    let (ip, port) = ctx.orchestrator.port_forward(&pod_name).await.map_err(CoreError::from)?;
    let url = format!("https://{ip}:{port}/notebook");
    let token = Uuid::new_v4().simple().to_string();

    ctx.db
        .set_notebook_state(reservation_id, true, Some(&url), Some(port), Some(&token))
        .await
        .map_err(CoreError::Internal)?;

    ctx.emit(ChangeEvent::ReservationChanged);
    Ok(())
}

/// §4.4 cancel: `active|earlier → cancelling → cancelled`, idempotent on
/// a reservation already in a sink status.
pub async fn cancel(ctx: &AppContext, reservation_id: Uuid) -> CoreResult<()> {
    let reservation = ctx
        .db
        .get_reservation(reservation_id)
        .await
        .map_err(CoreError::Internal)?
        .ok_or_else(|| CoreError::Validation("reservation not found".to_string()))?;

    if reservation.is_terminal() {
        return Ok(());
    }

    ctx.db
        .update_status(reservation_id, "cancelling", Some("user requested cancel"), None)
        .await
        .map_err(CoreError::Internal)?;

    let reservation = ctx
        .db
        .get_reservation(reservation_id)
        .await
        .map_err(CoreError::Internal)?
        .ok_or_else(|| CoreError::Validation("reservation vanished during cancel".to_string()))?;

    teardown::teardown(ctx, &reservation, "cancelled", Some("cancelled by user")).await;

    if reservation.is_multinode {
        let master_id = reservation.master_reservation_id.unwrap_or(reservation.reservation_id);
        crate::multinode::cascade_terminal(ctx, master_id, reservation.reservation_id).await;
    }

    Ok(())
}
