//! The availability engine (C6, §4.5): periodic derivation of per-GPU-type
//! schedulable capacity from the orchestrator, written back to the
//! `gpu_types` row's dynamic columns. Runs as an independent scheduled
//! loop (§5) — availability reads are lock-free, consumers tolerate a
//! stale value between ticks.

use tracing::warn;

use crate::context::{AppContext, ChangeEvent};
use crate::db::availability::AvailabilityUpdate;
use crate::db::models::GpuTypeRow;
use crate::error::{CoreError, CoreResult};
use crate::orchestrator::NodeInfo;

const SLOTS_PER_CPU_NODE: i32 = 3;
const MAX_MULTINODE_BATCH: i32 = 4;

/// One tick: recompute and persist availability for every active GPU
/// type. A per-type orchestrator failure is logged and skipped rather
/// than aborting the whole tick — a single bad label query should not
/// stall every other type's availability.
pub async fn tick_availability(ctx: &AppContext) -> CoreResult<()> {
    let types = ctx.db.list_active_gpu_types().await.map_err(CoreError::Internal)?;

    for gpu_type in types {
        match compute_update(ctx, &gpu_type).await {
            Ok(update) => {
                if let Err(e) = ctx.db.update_gpu_availability(&update, "availability-tick").await {
                    warn!(gpu_type = %gpu_type.gpu_type, error = %e, "failed to persist availability update");
                }
            }
            Err(e) => warn!(gpu_type = %gpu_type.gpu_type, error = %e, "failed to compute availability"),
        }
    }

    ctx.emit(ChangeEvent::AvailabilityChanged);
    Ok(())
}

async fn compute_update(ctx: &AppContext, gpu_type: &GpuTypeRow) -> CoreResult<AvailabilityUpdate> {
    let nodes = ctx
        .orchestrator
        .list_nodes_by_label("GpuType", &gpu_type.gpu_type)
        .await
        .map_err(CoreError::from)?;

    let ready_nodes: Vec<&NodeInfo> = nodes.iter().filter(|n| n.ready && n.schedulable).collect();

    let mut single_node_max = 0;
    let mut full_nodes_available = 0;
    let mut available_gpus = 0;
    let mut total_pods_observed = 0;

    for node in &ready_nodes {
        let pods = ctx
            .orchestrator
            .list_pods_by_node(&node.name)
            .await
            .map_err(CoreError::from)?;
        let requested: i32 = pods
            .iter()
            .filter(|p| matches!(p.phase, crate::orchestrator::PodPhase::Running | crate::orchestrator::PodPhase::Pending))
            .map(|p| p.gpu_request)
            .sum();
        total_pods_observed += pods.len() as i32;

        let available_on_node = (node.allocatable_gpus - requested).max(0);
        available_gpus += available_on_node;
        single_node_max = single_node_max.max(available_on_node);
        if available_on_node == node.allocatable_gpus {
            full_nodes_available += 1;
        }
    }

    let running_instances = ready_nodes.len() as i32;
    let desired_capacity = nodes.len() as i32;
    let total_gpus = ready_nodes.len() as i32 * gpu_type.max_gpus;

    let max_reservable = if gpu_type.is_cpu_only() {
        (running_instances * SLOTS_PER_CPU_NODE - total_pods_observed).max(0)
    } else if gpu_type.supports_multinode {
        if full_nodes_available > 0 {
            full_nodes_available.min(MAX_MULTINODE_BATCH) * gpu_type.gpus_per_instance()
        } else {
            single_node_max
        }
    } else {
        single_node_max
    };

    let available_gpus = if gpu_type.is_cpu_only() { max_reservable } else { available_gpus };

    Ok(AvailabilityUpdate {
        gpu_type: gpu_type.gpu_type.clone(),
        total_gpus,
        available_gpus,
        max_reservable,
        full_nodes_available,
        running_instances,
        desired_capacity,
        gpus_per_instance: gpu_type.gpus_per_instance(),
    })
}
