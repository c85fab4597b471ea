//! The fixed seven-step best-effort teardown sequence (§4.10), shared by
//! C5's user cancel and C8's expiry transition. Every step logs and
//! continues on failure — a teardown that cannot fully clean up must
//! still leave the reservation in a sink status, since that invariant
//! (§8 P2) is what the reconciler (C9) repairs for anything teardown
//! could not reach.

use tracing::warn;

use crate::context::AppContext;
use crate::db::models::Reservation;
use crate::snapshot::{self, SnapshotKind};

/// Run the full sequence and transition `reservation` to `sink_status`
/// (`"cancelled"` or `"completed"`). Never returns an error: every step is
/// independently best-effort, matching the original's "log and continue"
/// teardown semantics.
pub async fn teardown(ctx: &AppContext, reservation: &Reservation, sink_status: &str, detail: Option<&str>) {
    let reservation_id = reservation.reservation_id;

    // 1. Shutdown snapshot, before the workload is touched.
    let mut snapshot_id: Option<String> = None;
    if let Some(disk_name) = &reservation.disk_name {
        match ctx.db.get_disk(&reservation.user_id, disk_name).await {
            Ok(Some(disk)) => {
                if let Some(volume_id) = &disk.provider_volume_id {
                    match snapshot::create_snapshot(
                        ctx,
                        snapshot::CreateSnapshotRequest {
                            volume_id,
                            disk_id: Some(disk.disk_id),
                            user_id: &reservation.user_id,
                            kind: SnapshotKind::Shutdown,
                            disk_name: Some(disk_name),
                            content_uri: None,
                            disk_size: disk.disk_size.as_deref(),
                        },
                    )
                    .await
                    {
                        Ok(outcome) => snapshot_id = Some(outcome.snapshot_id),
                        Err(e) => warn!(%reservation_id, error = %e, "teardown: shutdown snapshot failed"),
                    }
                }
            }
            Ok(None) => {}
            Err(e) => warn!(%reservation_id, error = %e, "teardown: failed to look up disk for shutdown snapshot"),
        }
    }

    // 2. Content capture, best-effort, only meaningful if step 1 produced a
    // pod name and snapshot id.
    if let (Some(pod_name), Some(disk_name), Some(snapshot_id)) =
        (&reservation.pod_name, &reservation.disk_name, &snapshot_id)
    {
        let content_uri =
            snapshot::capture_content(ctx, pod_name, &reservation.user_id, disk_name, snapshot_id).await;
        if let Some(uri) = content_uri {
            if let Ok(Some(disk)) = ctx.db.get_disk(&reservation.user_id, disk_name).await {
                if let Err(e) = snapshot::complete_snapshot(ctx, disk.disk_id, Some(&uri), None, None).await {
                    warn!(%reservation_id, error = %e, "teardown: failed to record captured content uri");
                }
            }
        }
    }

    // 3. Delete the workload object.
    if let Some(pod_name) = &reservation.pod_name {
        if let Err(e) = ctx.orchestrator.delete_workload(pod_name).await {
            warn!(%reservation_id, pod_name, error = %e, "teardown: workload delete failed");
        }

        // 4. Delete the associated service, if any.
        if let Err(e) = ctx.orchestrator.delete_service(pod_name).await {
            warn!(%reservation_id, pod_name, error = %e, "teardown: service delete failed");
        }
    }

    // 5. Sink transition with history entry.
    if let Err(e) = ctx
        .db
        .update_status(reservation_id, sink_status, detail, reservation.failure_reason.as_deref())
        .await
    {
        warn!(%reservation_id, error = %e, "teardown: failed to record sink status");
    }

    // 6. Release the disk.
    if let Some(disk_name) = &reservation.disk_name {
        if let Err(e) = ctx.db.set_disk_attachment(&reservation.user_id, disk_name, None).await {
            warn!(%reservation_id, disk_name, error = %e, "teardown: failed to release disk");
        }
    }

    // 7. Domain mapping cleanup.
    if let Err(e) = ctx.db.delete_domain_mappings_by_reservation(reservation_id).await {
        warn!(%reservation_id, error = %e, "teardown: failed to delete domain mapping");
    }

    ctx.emit(crate::context::ChangeEvent::ReservationChanged);
    ctx.emit(crate::context::ChangeEvent::DiskChanged);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::test_context;
    use crate::db::disks::NewDisk;
    use crate::db::reservations::NewReservation;
    use crate::orchestrator::OrchestratorClient;
    use crate::orchestrator::WorkloadSpec;
    use std::collections::HashMap;

    async fn active_reservation_with_disk(ctx: &AppContext) -> Reservation {
        let disk_id = uuid::Uuid::new_v4();
        ctx.db
            .create_disk(&NewDisk {
                disk_id,
                user_id: "u1".into(),
                disk_name: "scratch".into(),
                size_gb: 50,
            })
            .await
            .unwrap();

        let vol = ctx
            .provider
            .create_volume(50, "us-east-1a", HashMap::new())
            .await
            .unwrap();
        ctx.db.set_provider_volume_id(disk_id, &vol.volume_id).await.unwrap();

        let reservation_id = uuid::Uuid::new_v4();
        ctx.db
            .create_reservation(&NewReservation {
                reservation_id,
                user_id: "u1".into(),
                gpu_type: "h100".into(),
                gpu_count: 1,
                duration_hours: 1.0,
                name: None,
                disk_name: Some("scratch".into()),
                image_reference: None,
                notebook_enabled: false,
                secondary_users: vec![],
                is_multinode: false,
                master_reservation_id: None,
                node_index: 0,
                total_nodes: 1,
                cli_version: None,
            })
            .await
            .unwrap();
        ctx.db.set_disk_attachment("u1", "scratch", Some(reservation_id)).await.unwrap();

        ctx.orchestrator
            .create_workload(WorkloadSpec {
                name: reservation_id.to_string(),
                namespace: "default".into(),
                image: "img".into(),
                gpu_count: 1,
                cpu_millis: 1000,
                memory_mb: 1024,
                node_selector: HashMap::new(),
                env: HashMap::new(),
                volume_name: Some(vol.volume_id.clone()),
                labels: HashMap::new(),
            })
            .await
            .unwrap();
        ctx.db
            .set_placement(reservation_id, &reservation_id.to_string(), "default", None, None, None)
            .await
            .unwrap();

        ctx.db.get_reservation(reservation_id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn teardown_releases_disk_and_deletes_workload() {
        let ctx = test_context().await;
        let reservation = active_reservation_with_disk(&ctx).await;
        let pod_name = reservation.pod_name.clone().unwrap();

        teardown(&ctx, &reservation, "cancelled", Some("user requested")).await;

        let got = ctx.db.get_reservation(reservation.reservation_id).await.unwrap().unwrap();
        assert_eq!(got.status, "cancelled");

        let disk = ctx.db.get_disk("u1", "scratch").await.unwrap().unwrap();
        assert!(!disk.in_use);
        assert_eq!(disk.attached_to_reservation, None);
        assert_eq!(disk.snapshot_count, 0); // completion is observed separately, not inline

        let err = ctx.orchestrator.describe_workload(&pod_name).await.unwrap_err();
        assert!(matches!(err, crate::orchestrator::OrchestratorError::NotFound(_)));
    }

    #[tokio::test]
    async fn teardown_without_a_disk_still_reaches_sink_status() {
        let ctx = test_context().await;
        let reservation_id = uuid::Uuid::new_v4();
        ctx.db
            .create_reservation(&NewReservation {
                reservation_id,
                user_id: "u1".into(),
                gpu_type: "cpu".into(),
                gpu_count: 0,
                duration_hours: 1.0,
                name: None,
                disk_name: None,
                image_reference: None,
                notebook_enabled: false,
                secondary_users: vec![],
                is_multinode: false,
                master_reservation_id: None,
                node_index: 0,
                total_nodes: 1,
                cli_version: None,
            })
            .await
            .unwrap();
        let reservation = ctx.db.get_reservation(reservation_id).await.unwrap().unwrap();

        teardown(&ctx, &reservation, "completed", None).await;

        let got = ctx.db.get_reservation(reservation_id).await.unwrap().unwrap();
        assert_eq!(got.status, "completed");
    }
}
