//! ExecutionService trait definition

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Error type for execution service calls
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    /// The service refused to start the worker
    #[error("start rejected: {0}")]
    StartRejected(String),

    /// Unknown task or network interface
    #[error("not found: {0}")]
    NotFound(String),

    /// The service answered with an unexpected status
    #[error("execution API error ({status}): {message}")]
    Api { status: u16, message: String },

    /// Network or protocol failure talking to the service
    #[error("transport error: {0}")]
    Transport(String),
}

/// Opaque reference to a worker process owned by the execution service
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExternalHandle(String);

impl ExternalHandle {
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Short task id: the last `/`-separated segment
    ///
    /// ARN-style handles (`arn:...:task/cluster/abc123`) reduce to `abc123`;
    /// plain ids are returned unchanged.
    pub fn task_id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }
}

impl fmt::Display for ExternalHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What to start: the execution target plus its network placement
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchSpec {
    pub cluster: String,
    pub task_definition: String,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default = "default_assign_public_ip")]
    pub assign_public_ip: bool,
}

fn default_assign_public_ip() -> bool {
    true
}

impl LaunchSpec {
    pub fn new(cluster: impl Into<String>, task_definition: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            task_definition: task_definition.into(),
            subnets: vec![],
            security_groups: vec![],
            assign_public_ip: true,
        }
    }

    pub fn with_subnets(mut self, subnets: Vec<String>) -> Self {
        self.subnets = subnets;
        self
    }

    pub fn with_security_groups(mut self, groups: Vec<String>) -> Self {
        self.security_groups = groups;
        self
    }

    pub fn with_public_ip(mut self, assign: bool) -> Self {
        self.assign_public_ip = assign;
        self
    }
}

/// Last known lifecycle state reported for a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Provisioning,
    Pending,
    Activating,
    Running,
    Deactivating,
    Stopping,
    Deprovisioning,
    Stopped,
    #[serde(other)]
    Unknown,
}

impl TaskState {
    /// States from which the task will never become ready
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Deactivating | Self::Stopping | Self::Deprovisioning | Self::Stopped
        )
    }
}

/// Snapshot returned by [`ExecutionService::describe`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescription {
    pub last_status: TaskState,
    /// Network interface attached to the task, once it has one
    #[serde(default, rename = "networkInterfaceId")]
    pub network_interface: Option<String>,
    #[serde(default, rename = "stoppedReason")]
    pub stop_reason: Option<String>,
    #[serde(default)]
    pub failures: Vec<String>,
}

impl TaskDescription {
    pub fn new(last_status: TaskState) -> Self {
        Self {
            last_status,
            network_interface: None,
            stop_reason: None,
            failures: vec![],
        }
    }

    pub fn with_network_interface(mut self, interface: impl Into<String>) -> Self {
        self.network_interface = Some(interface.into());
        self
    }

    pub fn with_stop_reason(mut self, reason: impl Into<String>) -> Self {
        self.stop_reason = Some(reason.into());
        self
    }

    pub fn with_failure(mut self, failure: impl Into<String>) -> Self {
        self.failures.push(failure.into());
        self
    }

    /// Running with a network interface attached
    pub fn is_ready(&self) -> bool {
        self.last_status == TaskState::Running && self.network_interface.is_some()
    }

    /// Best available explanation of why the task is not running: explicit
    /// stop reason, else the failure list, else "unknown"
    pub fn failure_detail(&self) -> String {
        if let Some(reason) = self.stop_reason.as_deref().filter(|r| !r.is_empty()) {
            return reason.to_string();
        }
        if !self.failures.is_empty() {
            return self.failures.join("; ");
        }
        "unknown".to_string()
    }
}

/// External container execution service
///
/// Starts, inspects and stops the workers the pool hands out.
#[async_trait]
pub trait ExecutionService: Send + Sync + 'static {
    /// Ask the service to start one worker
    ///
    /// A refusal is [`ExecutionError::StartRejected`] carrying the service's
    /// explanation.
    async fn start(&self, spec: &LaunchSpec) -> Result<ExternalHandle, ExecutionError>;

    /// Stop a worker
    async fn stop(&self, handle: &ExternalHandle, reason: &str) -> Result<(), ExecutionError>;

    /// Current state of a worker
    async fn describe(&self, handle: &ExternalHandle) -> Result<TaskDescription, ExecutionError>;

    /// Reachable address behind a network interface reference
    async fn resolve_network_address(&self, interface: &str) -> Result<String, ExecutionError>;
}
