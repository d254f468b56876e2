//! Scriptable in-memory ExecutionService for testing and local runs

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use parking_lot::Mutex;

use super::service::*;

/// In-memory execution service
///
/// Every started task replays a describe script: the n-th `describe` call
/// returns the n-th entry, and the last entry repeats forever. Stop calls
/// are recorded so tests can assert on them.
///
/// # Example
///
/// ```
/// use warmpool::execution::{InMemoryExecutionService, TaskDescription, TaskState};
///
/// let service = InMemoryExecutionService::new()
///     .with_describe_script(vec![
///         TaskDescription::new(TaskState::Pending),
///         TaskDescription::new(TaskState::Running).with_network_interface("eni-1"),
///     ])
///     .with_interface("eni-1", "1.2.3.4");
/// ```
pub struct InMemoryExecutionService {
    state: Mutex<ServiceState>,
}

struct ServiceState {
    next_task: u64,
    reject_starts: Option<String>,
    script: Vec<TaskDescription>,
    tasks: HashMap<ExternalHandle, usize>,
    interfaces: HashMap<String, String>,
    failing_stops: HashSet<ExternalHandle>,
    stops: Vec<(ExternalHandle, String)>,
}

impl InMemoryExecutionService {
    /// Service whose tasks are ready on the first describe, on `eni-1`
    /// resolving to `1.2.3.4`
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ServiceState {
                next_task: 1,
                reject_starts: None,
                script: vec![TaskDescription::new(TaskState::Running).with_network_interface("eni-1")],
                tasks: HashMap::new(),
                interfaces: HashMap::from([("eni-1".to_string(), "1.2.3.4".to_string())]),
                failing_stops: HashSet::new(),
                stops: vec![],
            }),
        }
    }

    /// Refuse every start with `reason`
    pub fn rejecting_starts(self, reason: impl Into<String>) -> Self {
        self.state.lock().reject_starts = Some(reason.into());
        self
    }

    /// Replace the describe script for tasks started from now on
    pub fn with_describe_script(self, script: Vec<TaskDescription>) -> Self {
        self.state.lock().script = script;
        self
    }

    /// Map a network interface to an address
    pub fn with_interface(self, interface: impl Into<String>, address: impl Into<String>) -> Self {
        self.state
            .lock()
            .interfaces
            .insert(interface.into(), address.into());
        self
    }

    /// Make `stop` fail for this handle
    pub fn failing_stop(self, handle: impl Into<String>) -> Self {
        self.state
            .lock()
            .failing_stops
            .insert(ExternalHandle::new(handle));
        self
    }

    /// Number of tasks started so far
    pub fn started(&self) -> usize {
        self.state.lock().tasks.len()
    }

    /// How many times `handle` was described
    pub fn describe_count(&self, handle: &ExternalHandle) -> usize {
        self.state.lock().tasks.get(handle).copied().unwrap_or(0)
    }

    /// Every stop call made so far, in order
    pub fn stop_calls(&self) -> Vec<(ExternalHandle, String)> {
        self.state.lock().stops.clone()
    }

    /// How many times `handle` was stopped
    pub fn stop_count(&self, handle: &str) -> usize {
        self.state
            .lock()
            .stops
            .iter()
            .filter(|(h, _)| h.as_str() == handle)
            .count()
    }
}

impl Default for InMemoryExecutionService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionService for InMemoryExecutionService {
    async fn start(&self, spec: &LaunchSpec) -> Result<ExternalHandle, ExecutionError> {
        let mut state = self.state.lock();
        if let Some(reason) = &state.reject_starts {
            return Err(ExecutionError::StartRejected(reason.clone()));
        }

        let handle = ExternalHandle::new(format!(
            "arn:warmpool:task/{}/{}",
            spec.cluster, state.next_task
        ));
        state.next_task += 1;
        state.tasks.insert(handle.clone(), 0);
        Ok(handle)
    }

    async fn stop(&self, handle: &ExternalHandle, reason: &str) -> Result<(), ExecutionError> {
        let mut state = self.state.lock();
        state.stops.push((handle.clone(), reason.to_string()));
        if state.failing_stops.contains(handle) {
            return Err(ExecutionError::Transport(format!(
                "stop failed for {}",
                handle.task_id()
            )));
        }
        Ok(())
    }

    async fn describe(&self, handle: &ExternalHandle) -> Result<TaskDescription, ExecutionError> {
        let mut state = self.state.lock();
        let ServiceState { tasks, script, .. } = &mut *state;
        let polls = tasks
            .get_mut(handle)
            .ok_or_else(|| ExecutionError::NotFound(handle.to_string()))?;

        let index = (*polls).min(script.len().saturating_sub(1));
        *polls += 1;
        Ok(script
            .get(index)
            .cloned()
            .unwrap_or_else(|| TaskDescription::new(TaskState::Unknown)))
    }

    async fn resolve_network_address(&self, interface: &str) -> Result<String, ExecutionError> {
        self.state
            .lock()
            .interfaces
            .get(interface)
            .cloned()
            .ok_or_else(|| ExecutionError::NotFound(interface.to_string()))
    }
}
