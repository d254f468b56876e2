// Pool configuration
//
// Loaded from environment variables. Everything has a default except the
// launch target (TASK_DEFINITION) and the endpoints (DATABASE_URL,
// EXECUTION_API_URL), which are only demanded by the operations that need
// them.

use std::time::Duration;

use crate::execution::LaunchSpec;
use crate::launcher::{LauncherConfig, ReadinessPolicy};
use crate::persistence::PostgresChangeFeedConfig;
use crate::record::DEFAULT_PARTITION;
use crate::replenish::DEFAULT_MAX_IN_FLIGHT;

const DEFAULT_CLUSTER: &str = "warmpool";

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required variable not set
    #[error("{0} must be set")]
    Missing(&'static str),

    /// Variable set to something unusable
    #[error("invalid {var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Complete pool configuration
#[derive(Debug, Clone, PartialEq)]
pub struct PoolConfig {
    /// Postgres connection string (`DATABASE_URL`)
    pub database_url: Option<String>,

    /// Partition holding this pool's records (`WARMPOOL_PARTITION`)
    pub partition: String,

    /// Execution service endpoint (`EXECUTION_API_URL`)
    pub execution_api_url: Option<String>,

    /// Cluster workers are started in (`CLUSTER_NAME`)
    pub cluster: String,

    /// Worker definition to start (`TASK_DEFINITION`)
    pub task_definition: Option<String>,

    /// Subnets for worker network interfaces (`SUBNET_IDS`)
    pub subnets: Vec<String>,

    /// Security groups for worker network interfaces (`SECURITY_GROUP_IDS`)
    pub security_groups: Vec<String>,

    /// Whether workers get a public address (`ASSIGN_PUBLIC_IP`)
    pub assign_public_ip: bool,

    /// Readiness polling (`READINESS_*`)
    pub readiness: ReadinessPolicy,

    /// Concurrent replenishment launches (`REPLENISH_MAX_IN_FLIGHT`)
    pub replenish_max_in_flight: usize,

    /// Postgres change feed polling and retention (`CHANGE_FEED_*`)
    pub change_feed: PostgresChangeFeedConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            partition: DEFAULT_PARTITION.to_string(),
            execution_api_url: None,
            cluster: DEFAULT_CLUSTER.to_string(),
            task_definition: None,
            subnets: vec![],
            security_groups: vec![],
            assign_public_ip: true,
            readiness: ReadinessPolicy::default(),
            replenish_max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            change_feed: PostgresChangeFeedConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `DATABASE_URL`: Postgres connection string
    /// - `WARMPOOL_PARTITION`: record partition (default: pool)
    /// - `EXECUTION_API_URL`: execution service base URL
    /// - `CLUSTER_NAME`: cluster to start workers in (default: warmpool)
    /// - `TASK_DEFINITION`: worker definition (required to launch)
    /// - `SUBNET_IDS`, `SECURITY_GROUP_IDS`: comma separated lists
    /// - `ASSIGN_PUBLIC_IP`: true/false (default: true)
    /// - `READINESS_INITIAL_DELAY_MS` (2000), `READINESS_POLL_INTERVAL_MS` (1000),
    ///   `READINESS_MAX_INTERVAL_MS` (10000), `READINESS_DEADLINE_SECS` (300)
    /// - `REPLENISH_MAX_IN_FLIGHT` (32)
    /// - `CHANGE_FEED_POLL_INTERVAL_MS` (500), `CHANGE_FEED_RETENTION_SECS` (86400)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Create configuration from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |name: &str| {
            lookup(name)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let defaults = Self::default();

        let readiness = defaults
            .readiness
            .with_initial_delay(millis(&var, "READINESS_INITIAL_DELAY_MS", 2_000)?)
            .with_poll_interval(millis(&var, "READINESS_POLL_INTERVAL_MS", 1_000)?)
            .with_max_interval(millis(&var, "READINESS_MAX_INTERVAL_MS", 10_000)?)
            .with_deadline(Duration::from_secs(number(
                &var,
                "READINESS_DEADLINE_SECS",
                300,
            )?));

        let change_feed = defaults
            .change_feed
            .with_min_interval(millis(&var, "CHANGE_FEED_POLL_INTERVAL_MS", 500)?)
            .with_retention(Duration::from_secs(number(
                &var,
                "CHANGE_FEED_RETENTION_SECS",
                86_400,
            )?));

        Ok(Self {
            database_url: var("DATABASE_URL"),
            partition: var("WARMPOOL_PARTITION").unwrap_or(defaults.partition),
            execution_api_url: var("EXECUTION_API_URL"),
            cluster: var("CLUSTER_NAME").unwrap_or(defaults.cluster),
            task_definition: var("TASK_DEFINITION"),
            subnets: list(var("SUBNET_IDS")),
            security_groups: list(var("SECURITY_GROUP_IDS")),
            assign_public_ip: flag(&var, "ASSIGN_PUBLIC_IP", true)?,
            readiness,
            replenish_max_in_flight: number(&var, "REPLENISH_MAX_IN_FLIGHT", 32)?.max(1)
                as usize,
            change_feed,
        })
    }

    pub fn with_database_url(mut self, url: impl Into<String>) -> Self {
        self.database_url = Some(url.into());
        self
    }

    pub fn with_execution_api_url(mut self, url: impl Into<String>) -> Self {
        self.execution_api_url = Some(url.into());
        self
    }

    pub fn with_task_definition(mut self, definition: impl Into<String>) -> Self {
        self.task_definition = Some(definition.into());
        self
    }

    pub fn with_partition(mut self, partition: impl Into<String>) -> Self {
        self.partition = partition.into();
        self
    }

    pub fn database_url(&self) -> Result<&str, ConfigError> {
        self.database_url
            .as_deref()
            .ok_or(ConfigError::Missing("DATABASE_URL"))
    }

    pub fn execution_api_url(&self) -> Result<&str, ConfigError> {
        self.execution_api_url
            .as_deref()
            .ok_or(ConfigError::Missing("EXECUTION_API_URL"))
    }

    /// What the launcher starts
    pub fn launch_spec(&self) -> Result<LaunchSpec, ConfigError> {
        let definition = self
            .task_definition
            .as_deref()
            .ok_or(ConfigError::Missing("TASK_DEFINITION"))?;

        Ok(LaunchSpec::new(&self.cluster, definition)
            .with_subnets(self.subnets.clone())
            .with_security_groups(self.security_groups.clone())
            .with_public_ip(self.assign_public_ip))
    }

    pub fn launcher_config(&self) -> Result<LauncherConfig, ConfigError> {
        Ok(LauncherConfig::new(self.launch_spec()?)
            .with_partition(&self.partition)
            .with_readiness(self.readiness.clone()))
    }
}

fn number<V>(var: &V, name: &'static str, default: u64) -> Result<u64, ConfigError>
where
    V: Fn(&str) -> Option<String>,
{
    match var(name) {
        None => Ok(default),
        Some(value) => value.parse().map_err(|e: std::num::ParseIntError| ConfigError::Invalid {
            var: name,
            value,
            reason: e.to_string(),
        }),
    }
}

fn millis<V>(var: &V, name: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    V: Fn(&str) -> Option<String>,
{
    number(var, name, default).map(Duration::from_millis)
}

fn flag<V>(var: &V, name: &'static str, default: bool) -> Result<bool, ConfigError>
where
    V: Fn(&str) -> Option<String>,
{
    match var(name).map(|v| v.to_lowercase()) {
        None => Ok(default),
        Some(v) if v == "true" || v == "1" || v == "yes" => Ok(true),
        Some(v) if v == "false" || v == "0" || v == "no" => Ok(false),
        Some(value) => Err(ConfigError::Invalid {
            var: name,
            value,
            reason: "expected true or false".to_string(),
        }),
    }
}

fn list(value: Option<String>) -> Vec<String> {
    value
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
