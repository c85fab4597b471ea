use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One entry in a reservation's append-only `status_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub message: Option<String>,
    pub failure_reason: Option<String>,
}

/// The central record (§3).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Reservation {
    pub reservation_id: Uuid,
    pub user_id: String,

    pub gpu_type: String,
    pub gpu_count: i32,
    pub duration_hours: f64,
    pub name: Option<String>,
    pub disk_name: Option<String>,
    pub image_reference: Option<String>,
    pub notebook_enabled: bool,
    pub secondary_users: serde_json::Value,

    pub status: String,
    pub current_detailed_status: Option<String>,
    pub status_history: serde_json::Value,
    pub failure_reason: Option<String>,

    pub pod_name: Option<String>,
    pub namespace: Option<String>,
    pub node_ip: Option<String>,
    pub node_port: Option<i32>,
    pub ssh_command: Option<String>,
    pub ebs_volume_id: Option<String>,
    pub instance_type: Option<String>,

    pub notebook_url: Option<String>,
    pub notebook_port: Option<i32>,
    pub notebook_token: Option<String>,
    pub notebook_error: Option<String>,

    pub is_multinode: bool,
    pub master_reservation_id: Option<Uuid>,
    pub node_index: i32,
    pub total_nodes: i32,

    pub created_at: DateTime<Utc>,
    pub launched_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub warned_30: bool,
    pub warned_15: bool,
    pub warned_5: bool,

    pub cli_version: Option<String>,
}

impl Reservation {
    pub fn is_terminal(&self) -> bool {
        matches!(self.status.as_str(), "cancelled" | "completed" | "failed")
    }

    pub fn is_master(&self) -> bool {
        self.master_reservation_id == Some(self.reservation_id)
    }
}

/// A named persistent block volume (§3).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Disk {
    pub disk_id: Uuid,
    pub user_id: String,
    pub disk_name: String,

    pub size_gb: i32,
    pub provider_volume_id: Option<String>,
    pub disk_size: Option<String>,
    pub latest_snapshot_content_s3: Option<String>,

    pub created_at: DateTime<Utc>,
    pub last_used: Option<DateTime<Utc>>,
    pub in_use: bool,
    pub attached_to_reservation: Option<Uuid>,
    pub is_backing_up: bool,
    pub is_deleted: bool,
    pub delete_date: Option<DateTime<Utc>>,

    pub operation_id: Option<String>,
    pub operation_status: Option<String>,
    pub operation_error: Option<String>,

    pub snapshot_count: i32,
    pub pending_snapshot_count: i32,
    pub last_snapshot_at: Option<DateTime<Utc>>,
}

/// Per-GPU-type configuration + live availability, one row each (§3).
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct GpuTypeRow {
    pub gpu_type: String,
    pub instance_type: String,
    pub max_gpus: i32,
    pub cpus: i32,
    pub memory_gb: i32,
    /// `None` means "column absent"; `Some(0)` means a CPU-only type.
    /// These must never be conflated — see `gpus_per_instance`.
    pub max_per_node: Option<i32>,
    pub description: String,
    pub is_active: bool,
    pub supports_multinode: bool,

    pub total_cluster_gpus: i32,
    pub available_gpus: i32,
    pub max_reservable: i32,
    pub full_nodes_available: i32,
    pub running_instances: i32,
    pub desired_capacity: i32,
    pub last_availability_update: Option<DateTime<Utc>>,
    pub last_availability_updated_by: Option<String>,
}

impl GpuTypeRow {
    /// GPUs per instance, falling back to `max_gpus` only when
    /// `max_per_node` is genuinely absent — never when it is zero.
    pub fn gpus_per_instance(&self) -> i32 {
        match self.max_per_node {
            Some(v) => v,
            None => self.max_gpus,
        }
    }

    pub fn is_cpu_only(&self) -> bool {
        self.max_per_node == Some(0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DomainMapping {
    pub subdomain: String,
    pub node_ip: String,
    pub node_port: i32,
    pub reservation_id: Uuid,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApiUser {
    pub user_id: String,
    pub username: String,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ApiKey {
    pub key_id: Uuid,
    pub user_id: String,
    pub key_hash: String,
    pub expires_at: Option<DateTime<Utc>>,
    pub revoked: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AuditEvent {
    pub event_id: Uuid,
    pub user_id: Option<String>,
    pub username: Option<String>,
    pub event_type: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub action: String,
    pub details: serde_json::Value,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TokenUsageEntry {
    pub usage_id: Uuid,
    pub user_id: String,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cost: i64,
    pub request_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_gpu_type(max_per_node: Option<i32>) -> GpuTypeRow {
        GpuTypeRow {
            gpu_type: "h100".into(),
            instance_type: "p5.48xlarge".into(),
            max_gpus: 8,
            cpus: 192,
            memory_gb: 2048,
            max_per_node,
            description: "".into(),
            is_active: true,
            supports_multinode: true,
            total_cluster_gpus: 0,
            available_gpus: 0,
            max_reservable: 0,
            full_nodes_available: 0,
            running_instances: 0,
            desired_capacity: 0,
            last_availability_update: None,
            last_availability_updated_by: None,
        }
    }

    #[test]
    fn gpus_per_instance_zero_is_not_confused_with_absent() {
        let cpu_type = base_gpu_type(Some(0));
        assert_eq!(cpu_type.gpus_per_instance(), 0);
        assert!(cpu_type.is_cpu_only());
    }

    #[test]
    fn gpus_per_instance_falls_back_only_when_none() {
        let legacy_row = base_gpu_type(None);
        assert_eq!(legacy_row.gpus_per_instance(), 8);
        assert!(!legacy_row.is_cpu_only());
    }

    #[test]
    fn reservation_master_detection() {
        let id = Uuid::new_v4();
        let mut r = sample_reservation(id);
        r.master_reservation_id = Some(id);
        assert!(r.is_master());

        r.master_reservation_id = Some(Uuid::new_v4());
        assert!(!r.is_master());
    }

    fn sample_reservation(id: Uuid) -> Reservation {
        Reservation {
            reservation_id: id,
            user_id: "u1".into(),
            gpu_type: "h100".into(),
            gpu_count: 1,
            duration_hours: 1.0,
            name: None,
            disk_name: None,
            image_reference: None,
            notebook_enabled: false,
            secondary_users: serde_json::json!([]),
            status: "queued".into(),
            current_detailed_status: None,
            status_history: serde_json::json!([]),
            failure_reason: None,
            pod_name: None,
            namespace: None,
            node_ip: None,
            node_port: None,
            ssh_command: None,
            ebs_volume_id: None,
            instance_type: None,
            notebook_url: None,
            notebook_port: None,
            notebook_token: None,
            notebook_error: None,
            is_multinode: false,
            master_reservation_id: None,
            node_index: 0,
            total_nodes: 1,
            created_at: Utc::now(),
            launched_at: None,
            expires_at: None,
            warned_30: false,
            warned_15: false,
            warned_5: false,
            cli_version: None,
        }
    }

    #[test]
    fn terminal_statuses_are_sinks() {
        let mut r = sample_reservation(Uuid::new_v4());
        for status in ["cancelled", "completed", "failed"] {
            r.status = status.into();
            assert!(r.is_terminal());
        }
        r.status = "active".into();
        assert!(!r.is_terminal());
    }
}
