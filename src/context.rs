//! The explicit context object called for in §9 ("global mutable state
//! becomes an explicit context object threaded through the core"). Owns
//! every shared collaborator the components need; cheap to clone since
//! every field is an `Arc` (or already-`Clone` pool wrapper), matching
//! the teacher's `Scheduler` composition-of-Arc-wrapped-parts shape.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::AppConfig;
use crate::db::Database;
use crate::notify::NotificationSink;
use crate::orchestrator::OrchestratorClient;
use crate::provider::CloudProvider;

/// Emitted whenever a periodic tick or worker changes reservation/disk
/// state, so co-located observers (tests, a future status endpoint) can
/// react without polling. Carries no payload — subscribers re-read from
/// `Database`, the single source of truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeEvent {
    ReservationChanged,
    DiskChanged,
    AvailabilityChanged,
}

#[derive(Clone)]
pub struct AppContext {
    pub db: Database,
    pub provider: Arc<dyn CloudProvider>,
    pub orchestrator: Arc<dyn OrchestratorClient>,
    pub notifier: Arc<dyn NotificationSink>,
    pub config: Arc<AppConfig>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl AppContext {
    pub fn new(
        db: Database,
        provider: Arc<dyn CloudProvider>,
        orchestrator: Arc<dyn OrchestratorClient>,
        notifier: Arc<dyn NotificationSink>,
        config: AppConfig,
    ) -> Self {
        let (changes, _) = broadcast::channel(64);
        Self {
            db,
            provider,
            orchestrator,
            notifier,
            config: Arc::new(config),
            changes,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }

    pub fn emit(&self, event: ChangeEvent) {
        let _ = self.changes.send(event);
    }
}

#[cfg(test)]
pub async fn test_context() -> AppContext {
    use crate::notify::LoggingNotificationSink;
    use crate::orchestrator::fake::FakeOrchestrator;
    use crate::provider::fake::FakeProvider;

    AppContext::new(
        Database::test_db().await,
        Arc::new(FakeProvider::new()),
        Arc::new(FakeOrchestrator::new()),
        Arc::new(LoggingNotificationSink),
        AppConfig::from_env().unwrap_or_else(|_| test_config()),
    )
}

#[cfg(test)]
pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "postgres://test".into(),
        docker_host: "unix:///var/run/docker.sock".into(),
        max_reservation_hours: 48.0,
        default_timeout_hours: 8.0,
        poll_interval_seconds: 5,
        visibility_timeout_seconds: 900,
        batch_size: 1,
        max_concurrent_jobs: 50,
        max_retries: 3,
        api_key_ttl_hours: 2,
        snapshot_keep_count: 3,
        snapshot_max_age_days: 7,
        quarantine_max_age_days: 30,
        quarantine_backup_retention_days: 90,
        min_cli_version: "0.0.0".into(),
        primary_availability_zone: "us-east-1a".into(),
        max_multinode_nodes: 4,
        provider_local_base_dir: "./data/provider".into(),
    }
}
