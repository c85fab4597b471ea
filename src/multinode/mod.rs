//! The multinode coordinator (C7, §4.6): joint admission for a reservation
//! spanning several whole nodes of the same GPU type, transactional
//! creation of one reservation row per node sharing a `master_reservation_id`,
//! independent per-node enqueue onto the create queue, and cascade
//! cancel/fail across the group.

use serde::Deserialize;
use tracing::warn;
use uuid::Uuid;

use crate::context::{AppContext, ChangeEvent};
use crate::db::models::Reservation;
use crate::db::reservations::NewReservation;
use crate::error::{CoreError, CoreResult};

/// A request to create a reservation spanning `total_nodes` whole nodes.
/// `gpu_count` is the caller's stated aggregate GPU count across the
/// group and must equal `total_nodes * gpus_per_instance()` for the
/// requested type — a mismatch usually means the caller miscounted nodes.
#[derive(Debug, Clone, Deserialize)]
pub struct MultinodeCreateRequest {
    pub user_id: String,
    pub gpu_type: String,
    pub gpu_count: i32,
    pub total_nodes: i32,
    pub duration_hours: f64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub image_reference: Option<String>,
    #[serde(default)]
    pub notebook_enabled: bool,
    #[serde(default)]
    pub cli_version: Option<String>,
}

/// Validate and create every member row of a multinode group, enqueueing
/// one `reservation.create` message per node. Returns the master
/// reservation id. The group is only ever joint in its lifecycle
/// (cascade cancel/fail) — each member still runs the full C5 state
/// machine independently once queued.
pub async fn create_group(ctx: &AppContext, req: MultinodeCreateRequest) -> CoreResult<Uuid> {
    let gpu_row = ctx
        .db
        .get_gpu_type(&req.gpu_type)
        .await
        .map_err(CoreError::Internal)?
        .ok_or_else(|| CoreError::Validation(format!("unknown gpu type {}", req.gpu_type)))?;

    if !gpu_row.is_active || !gpu_row.supports_multinode {
        return Err(CoreError::Validation(format!(
            "{} does not support multinode reservations",
            req.gpu_type
        )));
    }

    if req.total_nodes < 2 {
        return Err(CoreError::Validation(
            "multinode reservations require at least 2 nodes".to_string(),
        ));
    }

    if req.total_nodes > ctx.config.max_multinode_nodes {
        return Err(CoreError::Validation(format!(
            "total_nodes {} exceeds the {}-node ceiling",
            req.total_nodes, ctx.config.max_multinode_nodes
        )));
    }

    let per_node = gpu_row.gpus_per_instance();
    if req.gpu_count != req.total_nodes * per_node {
        return Err(CoreError::Validation(format!(
            "gpu_count {} does not equal total_nodes ({}) * {per_node} gpus/node",
            req.gpu_count, req.total_nodes
        )));
    }

    if gpu_row.full_nodes_available < req.total_nodes {
        return Err(CoreError::CapacityExhausted {
            gpu_type: req.gpu_type.clone(),
            requested: req.total_nodes,
            available: gpu_row.full_nodes_available,
        });
    }

    let master_reservation_id = Uuid::new_v4();

    let mut reservation_ids = Vec::with_capacity(req.total_nodes as usize);
    let mut rows = Vec::with_capacity(req.total_nodes as usize);
    for node_index in 0..req.total_nodes {
        let reservation_id = if node_index == 0 { master_reservation_id } else { Uuid::new_v4() };
        reservation_ids.push(reservation_id);
        rows.push(NewReservation {
            reservation_id,
            user_id: req.user_id.clone(),
            gpu_type: req.gpu_type.clone(),
            gpu_count: per_node,
            duration_hours: req.duration_hours,
            name: req.name.clone(),
            disk_name: None,
            image_reference: req.image_reference.clone(),
            notebook_enabled: req.notebook_enabled,
            secondary_users: Vec::new(),
            is_multinode: true,
            master_reservation_id: Some(master_reservation_id),
            node_index,
            total_nodes: req.total_nodes,
            cli_version: req.cli_version.clone(),
        });
    }

    // All N rows commit together or not at all - a partial group would
    // leave a master with missing children, breaking P4.
    ctx.db.create_reservations_batch(&rows).await.map_err(CoreError::Internal)?;

    for (node_index, reservation_id) in reservation_ids.into_iter().enumerate() {
        let body = serde_json::json!({
            "action": "reservation.create",
            "reservation_id": reservation_id,
            "user_id": req.user_id,
            "gpu_type": req.gpu_type,
            "gpu_count": per_node,
            "duration_hours": req.duration_hours,
            "name": req.name,
            "image_reference": req.image_reference,
            "notebook_enabled": req.notebook_enabled,
            "cli_version": req.cli_version,
            "is_multinode": true,
            "master_reservation_id": master_reservation_id,
            "node_index": node_index as i32,
            "total_nodes": req.total_nodes,
        });
        ctx.db.enqueue(&body).await.map_err(CoreError::Internal)?;
    }

    ctx.emit(ChangeEvent::ReservationChanged);
    Ok(master_reservation_id)
}

/// Cascade a member's terminal transition (failure or user cancel) to the
/// rest of its group: a child failing or being cancelled takes down the
/// master and every sibling, and cancelling the master takes down every
/// child. Already-terminal members and the triggering member itself are
/// skipped. Best-effort — failures are logged, never propagated, since
/// the triggering member's own transition has already been committed.
pub async fn cascade_terminal(ctx: &AppContext, master_reservation_id: Uuid, triggering_reservation_id: Uuid) {
    let group: Vec<Reservation> = match ctx.db.list_multinode_group(master_reservation_id).await {
        Ok(g) => g,
        Err(e) => {
            warn!(%master_reservation_id, error = %e, "failed to load multinode group for cascade");
            return;
        }
    };

    for member in group {
        if member.reservation_id == triggering_reservation_id || member.is_terminal() {
            continue;
        }
        if let Err(e) = crate::reservation::cancel(ctx, member.reservation_id).await {
            warn!(reservation_id = %member.reservation_id, error = %e, "cascade cancel of multinode sibling failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::db::availability::AvailabilityUpdate;

    async fn make_full_nodes_available(ctx: &AppContext, gpu_type: &str, full_nodes: i32) {
        let row = ctx.db.get_gpu_type(gpu_type).await.unwrap().unwrap();
        ctx.db
            .update_gpu_availability(
                &AvailabilityUpdate {
                    gpu_type: gpu_type.to_string(),
                    total_gpus: row.max_gpus * full_nodes,
                    available_gpus: row.max_gpus * full_nodes,
                    max_reservable: row.max_gpus * full_nodes.min(4),
                    full_nodes_available: full_nodes,
                    running_instances: full_nodes,
                    desired_capacity: full_nodes,
                    gpus_per_instance: row.gpus_per_instance(),
                },
                "test",
            )
            .await
            .unwrap();
    }

    fn base_request(total_nodes: i32, gpu_count: i32) -> MultinodeCreateRequest {
        MultinodeCreateRequest {
            user_id: "u1".into(),
            gpu_type: "h100".into(),
            gpu_count,
            total_nodes,
            duration_hours: 2.0,
            name: None,
            image_reference: None,
            notebook_enabled: false,
            cli_version: None,
        }
    }

    #[tokio::test]
    async fn creates_one_row_per_node_and_enqueues_each() {
        let ctx = test_context().await;
        make_full_nodes_available(&ctx, "h100", 4).await;

        let master_id = create_group(&ctx, base_request(2, 16)).await.unwrap();

        let group = ctx.db.list_multinode_group(master_id).await.unwrap();
        assert_eq!(group.len(), 2);
        assert!(group.iter().all(|r| r.gpu_count == 8));
        assert_eq!(group[0].reservation_id, master_id);

        let queued = ctx.db.read_queue(900, 10).await.unwrap();
        assert_eq!(queued.len(), 2);
    }

    #[tokio::test]
    async fn rejects_gpu_count_inconsistent_with_node_count() {
        let ctx = test_context().await;
        make_full_nodes_available(&ctx, "h100", 4).await;

        let err = create_group(&ctx, base_request(2, 8)).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn rejects_a_single_node_group() {
        let ctx = test_context().await;
        make_full_nodes_available(&ctx, "h100", 4).await;

        let err = create_group(&ctx, base_request(1, 8)).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn rejects_when_not_enough_full_nodes() {
        let ctx = test_context().await;
        make_full_nodes_available(&ctx, "h100", 1).await;

        let err = create_group(&ctx, base_request(2, 16)).await.unwrap_err();
        assert!(matches!(err, CoreError::CapacityExhausted { .. }));
    }

    #[tokio::test]
    async fn rejects_non_multinode_capable_type() {
        let ctx = test_context().await;
        let mut req = base_request(2, 2);
        req.gpu_type = "t4".into();
        let err = create_group(&ctx, req).await.unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
    }

    #[tokio::test]
    async fn cascade_cancels_every_untouched_sibling() {
        let ctx = test_context().await;
        make_full_nodes_available(&ctx, "h100", 4).await;
        let master_id = create_group(&ctx, base_request(3, 24)).await.unwrap();

        let group = ctx.db.list_multinode_group(master_id).await.unwrap();
        let failing_child = group[1].reservation_id;
        ctx.db.update_status(failing_child, "failed", None, Some("capacity_exhausted")).await.unwrap();

        cascade_terminal(&ctx, master_id, failing_child).await;

        let group = ctx.db.list_multinode_group(master_id).await.unwrap();
        assert!(group.iter().all(|r| r.is_terminal()));
    }
}
