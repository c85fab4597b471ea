pub mod availability;
pub mod config;
pub mod context;
pub mod db;
pub mod disk;
pub mod error;
pub mod expiry;
pub mod multinode;
pub mod notify;
pub mod orchestrator;
pub mod provider;
pub mod queue_runtime;
pub mod reservation;
pub mod snapshot;
pub mod teardown;

pub use context::AppContext;
pub use error::CoreError;
