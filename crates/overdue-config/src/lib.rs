//! KDL configuration parsing for overdue.
//!
//! This crate handles parsing of:
//! - Database connection settings
//! - The claim policy (stage, prerequisite, staleness, batch size)
//! - Worker loop tuning

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    DatabaseConfig, SystemConfig, WorkerConfig, load_system_config, parse_system_config,
};
