//! Bounded readiness polling
//!
//! Waits for a freshly started task to report RUNNING with a network
//! interface. The wait starts with a fixed delay (the execution service may
//! not know about a task it just accepted), then polls with exponential
//! backoff until the task is ready, stops, or the deadline passes. The
//! deadline also bounds each in-flight describe call.

use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, trace};

use crate::execution::{ExecutionError, ExecutionService, ExternalHandle, TaskDescription};

/// Shortest delay between two polls, whatever the policy says
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Polling schedule for worker readiness
///
/// # Example
///
/// ```
/// use warmpool::ReadinessPolicy;
/// use std::time::Duration;
///
/// let policy = ReadinessPolicy::default()
///     .with_initial_delay(Duration::from_secs(2))
///     .with_deadline(Duration::from_secs(120));
///
/// // First poll after 2s, then 1s, 1.5s, 2.25s ... capped at 10s,
/// // giving up 120s after the wait began.
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReadinessPolicy {
    /// Delay before the first poll
    #[serde(with = "duration_millis")]
    pub initial_delay: Duration,

    /// Delay between the first and second poll
    #[serde(with = "duration_millis")]
    pub poll_interval: Duration,

    /// Ceiling for the delay between polls
    #[serde(with = "duration_millis")]
    pub max_interval: Duration,

    /// Growth factor applied to the delay after every unready poll
    pub backoff_coefficient: f64,

    /// Jitter factor (0.0-1.0); 0.1 means ±10%
    pub jitter: f64,

    /// Total time allowed, measured from the start of the wait
    #[serde(with = "duration_millis")]
    pub deadline: Duration,
}

impl Default for ReadinessPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            poll_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(10),
            backoff_coefficient: 1.5,
            jitter: 0.1,
            deadline: Duration::from_secs(300),
        }
    }
}

impl ReadinessPolicy {
    /// Fixed interval polling, no backoff or jitter
    pub fn fixed(interval: Duration, deadline: Duration) -> Self {
        Self {
            initial_delay: Duration::ZERO,
            poll_interval: interval,
            max_interval: interval,
            backoff_coefficient: 1.0,
            jitter: 0.0,
            deadline,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_max_interval(mut self, interval: Duration) -> Self {
        self.max_interval = interval;
        self
    }

    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = coefficient.max(1.0);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Delay after the `poll`-th unready poll (1-based), before jitter
    ///
    /// Never shorter than [`MIN_POLL_INTERVAL`].
    pub fn delay_after_poll(&self, poll: u32) -> Duration {
        let base = self.poll_interval.as_secs_f64()
            * self.backoff_coefficient.powi(poll.saturating_sub(1) as i32);
        Duration::from_secs_f64(base.min(self.max_interval.as_secs_f64())).max(MIN_POLL_INTERVAL)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let secs = delay.as_secs_f64();
        let range = secs * self.jitter;
        if range <= 0.0 {
            return delay;
        }
        let offset = rand::thread_rng().gen_range(-range..range);
        Duration::from_secs_f64((secs + offset).max(0.0))
    }
}

/// Why a worker never became ready
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReadinessError {
    /// The task reached a state it will not recover from
    #[error("worker stopped before becoming ready: {}", .0.failure_detail())]
    Stopped(TaskDescription),

    /// The deadline passed first
    #[error("{}", deadline_detail(.deadline, .last.as_ref()))]
    DeadlineExceeded {
        deadline: Duration,
        last: Option<TaskDescription>,
    },

    /// Describing the task failed
    #[error("describe failed: {0}")]
    Execution(ExecutionError),
}

fn deadline_detail(deadline: &Duration, last: Option<&TaskDescription>) -> String {
    match last {
        Some(description) => format!(
            "worker not ready within {}s (last status {:?}, detail: {})",
            deadline.as_secs(),
            description.last_status,
            description.failure_detail()
        ),
        None => format!(
            "worker not ready within {}s (never described)",
            deadline.as_secs()
        ),
    }
}

/// Poll `handle` until it is ready or `policy` gives up
///
/// Returns the ready description (which carries the network interface).
/// `NotFound` from the service is treated as "not visible yet".
pub async fn wait_until_ready(
    execution: &dyn ExecutionService,
    handle: &ExternalHandle,
    policy: &ReadinessPolicy,
) -> Result<TaskDescription, ReadinessError> {
    let deadline = Instant::now() + policy.deadline;
    let exceeded = |last: Option<TaskDescription>| ReadinessError::DeadlineExceeded {
        deadline: policy.deadline,
        last,
    };

    let mut last = None;
    let mut polls = 0u32;
    let mut wake = Instant::now() + policy.initial_delay;

    loop {
        sleep_until(wake.min(deadline)).await;
        if wake >= deadline {
            return Err(exceeded(last));
        }

        polls += 1;
        match timeout_at(deadline, execution.describe(handle)).await {
            Err(_) => return Err(exceeded(last)),
            Ok(Ok(description)) if description.is_ready() => {
                debug!(polls, task = %handle.task_id(), "worker ready");
                return Ok(description);
            }
            Ok(Ok(description)) if description.last_status.is_terminal() => {
                return Err(ReadinessError::Stopped(description));
            }
            Ok(Ok(description)) => {
                trace!(polls, status = ?description.last_status, "worker not ready yet");
                last = Some(description);
            }
            Ok(Err(ExecutionError::NotFound(_))) => {
                trace!(polls, "task not visible yet");
            }
            Ok(Err(e)) => return Err(ReadinessError::Execution(e)),
        }

        let delay = policy.jittered(policy.delay_after_poll(polls));
        wake = Instant::now() + delay.max(MIN_POLL_INTERVAL);
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::{InMemoryExecutionService, LaunchSpec, TaskState};

    async fn started(service: &InMemoryExecutionService) -> ExternalHandle {
        service
            .start(&LaunchSpec::new("cluster", "worker:1"))
            .await
            .unwrap()
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = ReadinessPolicy::default().with_jitter(0.0);

        assert_eq!(policy.delay_after_poll(1), Duration::from_secs(1));
        assert_eq!(policy.delay_after_poll(2), Duration::from_millis(1500));
        assert_eq!(policy.delay_after_poll(3), Duration::from_millis(2250));
        assert_eq!(policy.delay_after_poll(50), Duration::from_secs(10));
    }

    #[test]
    fn test_fixed_policy_has_no_jitter() {
        let policy = ReadinessPolicy::fixed(Duration::from_secs(3), Duration::from_secs(30));
        assert_eq!(policy.jittered(Duration::from_secs(3)), Duration::from_secs(3));
        assert_eq!(policy.delay_after_poll(7), Duration::from_secs(3));
    }

    #[test]
    fn test_zero_interval_is_floored() {
        let policy = ReadinessPolicy::default()
            .with_poll_interval(Duration::ZERO)
            .with_max_interval(Duration::ZERO);

        assert_eq!(policy.delay_after_poll(1), MIN_POLL_INTERVAL);
        assert_eq!(policy.delay_after_poll(9), MIN_POLL_INTERVAL);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_polls_a_bounded_number_of_times() {
        let service = InMemoryExecutionService::new()
            .with_describe_script(vec![TaskDescription::new(TaskState::Pending)]);
        let handle = started(&service).await;
        let policy = ReadinessPolicy::fixed(Duration::ZERO, Duration::from_secs(1));

        let err = wait_until_ready(&service, &handle, &policy)
            .await
            .unwrap_err();

        assert!(matches!(err, ReadinessError::DeadlineExceeded { .. }));
        let polls = service.describe_count(&handle);
        assert!(polls > 1 && polls <= 101, "{polls} polls");
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_a_few_polls() {
        let service = InMemoryExecutionService::new().with_describe_script(vec![
            TaskDescription::new(TaskState::Provisioning),
            TaskDescription::new(TaskState::Pending),
            TaskDescription::new(TaskState::Running).with_network_interface("eni-1"),
        ]);
        let handle = started(&service).await;
        let policy = ReadinessPolicy::fixed(Duration::from_secs(1), Duration::from_secs(30))
            .with_initial_delay(Duration::from_secs(2));

        let begin = Instant::now();
        let description = wait_until_ready(&service, &handle, &policy).await.unwrap();

        assert_eq!(description.network_interface.as_deref(), Some("eni-1"));
        // initial delay + two intervals
        assert_eq!(begin.elapsed(), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_exceeded_reports_last_status() {
        let service = InMemoryExecutionService::new()
            .with_describe_script(vec![TaskDescription::new(TaskState::Pending)]);
        let handle = started(&service).await;
        let policy = ReadinessPolicy::fixed(Duration::from_secs(1), Duration::from_secs(10));

        let begin = Instant::now();
        let err = wait_until_ready(&service, &handle, &policy)
            .await
            .unwrap_err();

        assert!(begin.elapsed() <= Duration::from_secs(10));
        match &err {
            ReadinessError::DeadlineExceeded { last, .. } => {
                assert_eq!(last.as_ref().unwrap().last_status, TaskState::Pending);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(err.to_string().contains("not ready within 10s"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_initial_delay_past_deadline_never_polls() {
        let service = InMemoryExecutionService::new();
        let handle = started(&service).await;
        let policy = ReadinessPolicy::fixed(Duration::from_secs(1), Duration::from_secs(1))
            .with_initial_delay(Duration::from_secs(5));

        let err = wait_until_ready(&service, &handle, &policy)
            .await
            .unwrap_err();

        assert_eq!(
            err,
            ReadinessError::DeadlineExceeded {
                deadline: Duration::from_secs(1),
                last: None
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_task_fails_fast() {
        let service = InMemoryExecutionService::new().with_describe_script(vec![
            TaskDescription::new(TaskState::Stopped).with_stop_reason("CannotPullContainerError"),
        ]);
        let handle = started(&service).await;
        let policy = ReadinessPolicy::fixed(Duration::from_secs(1), Duration::from_secs(60));

        let err = wait_until_ready(&service, &handle, &policy)
            .await
            .unwrap_err();

        assert!(matches!(err, ReadinessError::Stopped(_)));
        assert!(err.to_string().contains("CannotPullContainerError"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_handle_keeps_polling_until_deadline() {
        let service = InMemoryExecutionService::new();
        let policy = ReadinessPolicy::fixed(Duration::from_secs(1), Duration::from_secs(3));

        let err = wait_until_ready(&service, &ExternalHandle::new("ghost"), &policy)
            .await
            .unwrap_err();

        assert!(matches!(err, ReadinessError::DeadlineExceeded { last: None, .. }));
    }
}
