//! System configuration parsing.

use crate::{ConfigError, ConfigResult};
use kdl::{KdlDocument, KdlNode};
use overdue_core::{ClaimPolicy, StageKind};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

static SCHEMA_NAME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z_][a-z0-9_]*$").expect("valid schema regex"));

pub const DEFAULT_DATABASE_URL: &str = "postgres://postgres@localhost:5432/postgres";

/// System-wide configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemConfig {
    pub database: DatabaseConfig,
    pub claim: ClaimPolicy,
    pub worker: WorkerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    /// Schema holding the tables, used as the connection `search_path`.
    pub schema: Option<String>,
    pub max_connections: u32,
    /// Server-side cap on how long a claim may sit idle inside its transaction.
    pub idle_transaction_timeout: Option<Duration>,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_DATABASE_URL.to_string(),
            schema: None,
            max_connections: 10,
            idle_transaction_timeout: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent workers started by `overdue work`.
    pub count: usize,
    /// Sleep between polls when nothing is eligible.
    pub poll_interval: Duration,
    /// Sleep after a failed claim attempt.
    pub error_backoff: Duration,
    /// How long a handler may hold a claim before it is rolled back.
    pub handler_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: 1,
            poll_interval: Duration::from_secs(1),
            error_backoff: Duration::from_secs(5),
            handler_timeout: Duration::from_secs(30),
        }
    }
}

/// Read and parse a configuration file.
pub fn load_system_config(path: impl AsRef<Path>) -> ConfigResult<SystemConfig> {
    let content = std::fs::read_to_string(path)?;
    parse_system_config(&content)
}

/// Parse system configuration from KDL text.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut database = DatabaseConfig::default();
    let mut claim = None;
    let mut worker = WorkerConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "database" => database = parse_database(node)?,
            "claim" => claim = Some(parse_claim(node)?),
            "worker" => worker = parse_worker(node)?,
            _ => {} // Ignore unknown nodes
        }
    }

    let claim = claim.ok_or_else(|| ConfigError::MissingField("claim".to_string()))?;

    Ok(SystemConfig {
        database,
        claim,
        worker,
    })
}

fn parse_database(node: &KdlNode) -> ConfigResult<DatabaseConfig> {
    let mut config = DatabaseConfig::default();

    for child in children(node) {
        match child.name().value() {
            "url" => {
                config.url = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("database url".to_string()))?;
            }
            "schema" => {
                let schema = get_first_string_arg(child)
                    .ok_or_else(|| ConfigError::MissingField("database schema".to_string()))?;
                if !SCHEMA_NAME.is_match(&schema) {
                    return Err(ConfigError::invalid(
                        "database schema",
                        format!("'{}' is not a plain lowercase identifier", schema),
                    ));
                }
                config.schema = Some(schema);
            }
            "max-connections" | "max_connections" => {
                config.max_connections = get_positive_int(child, "database max-connections")?;
            }
            "idle-transaction-timeout" | "idle_transaction_timeout" => {
                config.idle_transaction_timeout =
                    Some(get_duration(child, "database idle-transaction-timeout")?);
            }
            _ => {}
        }
    }

    Ok(config)
}

fn parse_claim(node: &KdlNode) -> ConfigResult<ClaimPolicy> {
    let mut stage = None;
    let mut prerequisite = None;
    let mut staleness = None;
    let mut batch_size = None;

    for child in children(node) {
        match child.name().value() {
            "stage" => stage = Some(get_stage(child, "claim stage")?),
            "prerequisite" => prerequisite = Some(get_stage(child, "claim prerequisite")?),
            "staleness" => staleness = Some(get_duration(child, "claim staleness")?),
            "batch-size" | "batch_size" => {
                batch_size = Some(get_positive_int(child, "claim batch-size")?);
            }
            _ => {}
        }
    }

    let stage = stage.ok_or_else(|| ConfigError::MissingField("claim stage".to_string()))?;
    let mut policy = ClaimPolicy::new(stage);
    if let Some(prerequisite) = prerequisite {
        policy = policy.with_prerequisite(prerequisite);
    }
    if let Some(staleness) = staleness {
        policy = policy.with_staleness(staleness);
    }
    if let Some(batch_size) = batch_size {
        policy = policy.with_batch_size(batch_size);
    }

    policy
        .validate()
        .map_err(|e| ConfigError::invalid("claim", e.to_string()))?;

    Ok(policy)
}

fn parse_worker(node: &KdlNode) -> ConfigResult<WorkerConfig> {
    let mut config = WorkerConfig::default();

    for child in children(node) {
        match child.name().value() {
            "count" => config.count = get_positive_int::<usize>(child, "worker count")?,
            "poll-interval" | "poll_interval" => {
                config.poll_interval = get_duration(child, "worker poll-interval")?;
            }
            "error-backoff" | "error_backoff" => {
                config.error_backoff = get_duration(child, "worker error-backoff")?;
            }
            "handler-timeout" | "handler_timeout" => {
                config.handler_timeout = get_duration(child, "worker handler-timeout")?;
            }
            _ => {}
        }
    }

    Ok(config)
}

// Helper functions for extracting values from KDL nodes

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children()
        .map(|doc| doc.nodes().iter())
        .into_iter()
        .flatten()
}

fn get_first_string_arg(node: &KdlNode) -> Option<String> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
}

fn get_first_int_arg(node: &KdlNode) -> Option<i128> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_integer())
}

fn get_positive_int<T: TryFrom<i128>>(node: &KdlNode, field: &str) -> ConfigResult<T> {
    let value =
        get_first_int_arg(node).ok_or_else(|| ConfigError::invalid(field, "expected an integer"))?;
    if value < 1 {
        return Err(ConfigError::invalid(field, "must be at least 1"));
    }
    T::try_from(value)
        .map_err(|_| ConfigError::invalid(field, format!("{} is out of range", value)))
}

fn get_duration(node: &KdlNode, field: &str) -> ConfigResult<Duration> {
    let raw = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::invalid(field, "expected a duration string like \"10m\""))?;
    humantime::parse_duration(&raw)
        .map_err(|e| ConfigError::invalid(field, format!("bad duration '{}': {}", raw, e)))
}

fn get_stage(node: &KdlNode, field: &str) -> ConfigResult<StageKind> {
    let raw = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField(field.to_string()))?;
    StageKind::new(raw).map_err(|e| ConfigError::invalid(field, e.to_string()))
}
