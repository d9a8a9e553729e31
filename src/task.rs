//! Retry-aware task execution.
//!
//! Each provisioning step is a `TaskSpec`: a named opaque action plus the
//! retry policy governing it. The executor runs specs in order, absorbing
//! transient failures with sleep-and-retry, and short-circuits the sequence
//! on the first outcome that blocks the run. Undoing already-applied tasks
//! is deliberately not its job; that belongs to the rollback handler.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use strum::Display;
use thiserror::Error;
use tracing::debug;

use crate::logger::RunLogger;

/// Failure modes an action can report.
///
/// Transient errors are retried per policy and stay inside the executor;
/// fatal errors end the task (and the run) immediately.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
    #[error("{0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

/// Attempt count, inter-attempt delay and optional total wait bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
    pub total_timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
            total_timeout: None,
        }
    }

    pub fn with_total_timeout(mut self, bound: Duration) -> Self {
        self.total_timeout = Some(bound);
        self
    }

    /// One attempt, no retry, for steps that are all-or-nothing
    pub fn single_attempt() -> Self {
        Self::new(1, Duration::ZERO)
    }

    /// Package installation: 3 attempts, 10s apart, 30s total
    pub fn package_install() -> Self {
        Self::new(3, Duration::from_secs(10)).with_total_timeout(Duration::from_secs(30))
    }

    /// Certificate issuance: 3 attempts, 30s apart, 90s total
    pub fn certificate() -> Self {
        Self::new(3, Duration::from_secs(30)).with_total_timeout(Duration::from_secs(90))
    }

    /// Health/readiness poll: tight interval, high ceiling, bounded wait
    pub fn health_poll() -> Self {
        Self::new(60, Duration::from_secs(2)).with_total_timeout(Duration::from_secs(120))
    }
}

/// Final status of one task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Display)]
#[strum(serialize_all = "lowercase")]
pub enum TaskStatus {
    Succeeded,
    Exhausted,
    Fatal,
}

/// What happened to one task
#[derive(Debug, Clone)]
pub struct TaskOutcome {
    pub name: String,
    pub attempts: u32,
    pub status: TaskStatus,
    pub elapsed: Duration,
    pub last_error: Option<String>,
    pub critical: bool,
}

impl TaskOutcome {
    /// Whether this outcome stops the run.
    ///
    /// Exhausted retries block only for critical tasks; an explicit fatal
    /// error always blocks.
    pub fn blocks_run(&self) -> bool {
        match self.status {
            TaskStatus::Fatal => true,
            TaskStatus::Exhausted => self.critical,
            TaskStatus::Succeeded => false,
        }
    }
}

/// Opaque operation handle executed by the task executor
pub type TaskAction = Box<dyn FnMut() -> std::result::Result<(), TaskError> + Send>;

/// One provisioning step: a named action wrapped in a retry policy.
pub struct TaskSpec {
    pub name: String,
    pub policy: RetryPolicy,
    /// Whether exhausting retries aborts the run
    pub critical: bool,
    /// Whether the action is safe to re-run after a prior success
    pub idempotent: bool,
    action: TaskAction,
}

impl TaskSpec {
    pub fn new<F>(name: impl Into<String>, policy: RetryPolicy, action: F) -> Self
    where
        F: FnMut() -> std::result::Result<(), TaskError> + Send + 'static,
    {
        Self {
            name: name.into(),
            policy,
            critical: true,
            idempotent: false,
            action: Box::new(action),
        }
    }

    /// Mark the task as non-critical: exhausted retries log and continue
    pub fn non_critical(mut self) -> Self {
        self.critical = false;
        self
    }

    /// Mark the action as safe to re-run without further side effects
    pub fn idempotent(mut self) -> Self {
        self.idempotent = true;
        self
    }
}

/// Runs an ordered task list with per-task retry and short-circuiting.
pub struct TaskExecutor {
    logger: RunLogger,
    cancel: Arc<AtomicBool>,
}

impl TaskExecutor {
    pub fn new(logger: RunLogger, cancel: Arc<AtomicBool>) -> Self {
        Self { logger, cancel }
    }

    /// Execute tasks in order; stop at the first blocking outcome.
    ///
    /// Already-succeeded tasks are not undone here.
    pub fn run(&self, tasks: Vec<TaskSpec>) -> Vec<TaskOutcome> {
        let mut outcomes = Vec::with_capacity(tasks.len());

        for mut task in tasks {
            self.logger.info(
                "executor",
                &format!(
                    "task '{}' starting (max {} attempt(s))",
                    task.name, task.policy.max_attempts
                ),
            );
            let outcome = self.run_task(&mut task);

            match outcome.status {
                TaskStatus::Succeeded => self.logger.success(
                    "executor",
                    &format!(
                        "task '{}' succeeded on attempt {} ({:.1}s)",
                        outcome.name,
                        outcome.attempts,
                        outcome.elapsed.as_secs_f64()
                    ),
                ),
                TaskStatus::Exhausted if !outcome.critical => self.logger.warning(
                    "executor",
                    &format!(
                        "task '{}' exhausted {} attempt(s) ({}); non-critical, continuing",
                        outcome.name,
                        outcome.attempts,
                        outcome.last_error.as_deref().unwrap_or("no error recorded")
                    ),
                ),
                _ => self.logger.error(
                    "executor",
                    &format!(
                        "task '{}' {} after {} attempt(s): {}",
                        outcome.name,
                        outcome.status,
                        outcome.attempts,
                        outcome.last_error.as_deref().unwrap_or("no error recorded")
                    ),
                ),
            }

            let blocks = outcome.blocks_run();
            outcomes.push(outcome);
            if blocks {
                self.logger
                    .error("executor", "aborting remaining tasks after fatal outcome");
                break;
            }
        }

        outcomes
    }

    fn run_task(&self, task: &mut TaskSpec) -> TaskOutcome {
        let start = Instant::now();
        let mut attempts = 0u32;
        let mut last_error: Option<String> = None;

        let status = loop {
            if self.cancel.load(Ordering::SeqCst) {
                last_error = Some("cancelled by operator".to_string());
                break TaskStatus::Fatal;
            }

            attempts += 1;
            match (task.action)() {
                Ok(()) => break TaskStatus::Succeeded,
                Err(TaskError::Fatal(msg)) => {
                    last_error = Some(msg);
                    break TaskStatus::Fatal;
                }
                Err(TaskError::Transient(msg)) => {
                    debug!(
                        "task '{}' attempt {}/{} failed: {}",
                        task.name, attempts, task.policy.max_attempts, msg
                    );
                    last_error = Some(msg);

                    if attempts >= task.policy.max_attempts {
                        break TaskStatus::Exhausted;
                    }
                    if let Some(bound) = task.policy.total_timeout {
                        if start.elapsed() + task.policy.delay >= bound {
                            last_error = last_error.map(|e| {
                                format!("{} (total wait bound of {:?} reached)", e, bound)
                            });
                            break TaskStatus::Exhausted;
                        }
                    }
                    thread::sleep(task.policy.delay);
                }
            }
        };

        TaskOutcome {
            name: task.name.clone(),
            attempts,
            status,
            elapsed: start.elapsed(),
            last_error,
            critical: task.critical,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn executor() -> TaskExecutor {
        let (logger, _) = RunLogger::memory();
        TaskExecutor::new(logger, Arc::new(AtomicBool::new(false)))
    }

    fn fail_n_times(n: u32) -> (TaskAction, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let action = Box::new(move || {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= n {
                Err(TaskError::Transient(format!("failure {}", call)))
            } else {
                Ok(())
            }
        });
        (action, calls)
    }

    #[test]
    fn test_succeeds_on_attempt_k() {
        let (action, calls) = fail_n_times(2);
        let task = TaskSpec {
            name: "flaky".to_string(),
            policy: RetryPolicy::new(5, Duration::from_millis(10)),
            critical: true,
            idempotent: false,
            action,
        };

        let outcomes = executor().run(vec![task]);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].status, TaskStatus::Succeeded);
        assert_eq!(outcomes[0].attempts, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        // Two sleeps of 10ms happened before the success
        assert!(outcomes[0].elapsed >= Duration::from_millis(20));
    }

    #[test]
    fn test_always_failing_exhausts_max_attempts() {
        let (action, calls) = fail_n_times(u32::MAX);
        let task = TaskSpec {
            name: "doomed".to_string(),
            policy: RetryPolicy::new(4, Duration::from_millis(1)),
            critical: true,
            idempotent: false,
            action,
        };

        let outcomes = executor().run(vec![task]);
        assert_eq!(outcomes[0].status, TaskStatus::Exhausted);
        assert_eq!(outcomes[0].attempts, 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(outcomes[0].last_error.as_deref().unwrap().contains("failure 4"));
    }

    #[test]
    fn test_fatal_outcome_short_circuits() {
        let executed = Arc::new(AtomicU32::new(0));
        let later = Arc::clone(&executed);

        let tasks = vec![
            TaskSpec::new("ok", RetryPolicy::single_attempt(), || Ok(())),
            TaskSpec::new("explodes", RetryPolicy::single_attempt(), || {
                Err(TaskError::Fatal("unrecoverable".to_string()))
            }),
            TaskSpec::new("never-runs", RetryPolicy::single_attempt(), move || {
                later.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        ];

        let outcomes = executor().run(tasks);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[1].status, TaskStatus::Fatal);
        assert_eq!(executed.load(Ordering::SeqCst), 0, "third task must not run");
    }

    #[test]
    fn test_non_critical_exhaustion_continues() {
        let tasks = vec![
            TaskSpec::new("optional", RetryPolicy::new(2, Duration::from_millis(1)), || {
                Err(TaskError::Transient("still down".to_string()))
            })
            .non_critical(),
            TaskSpec::new("required", RetryPolicy::single_attempt(), || Ok(())),
        ];

        let outcomes = executor().run(tasks);
        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].status, TaskStatus::Exhausted);
        assert!(!outcomes[0].blocks_run());
        assert_eq!(outcomes[1].status, TaskStatus::Succeeded);
    }

    #[test]
    fn test_total_timeout_bounds_the_wait() {
        let (action, _) = fail_n_times(u32::MAX);
        let task = TaskSpec {
            name: "slow-poll".to_string(),
            policy: RetryPolicy::new(1000, Duration::from_millis(20))
                .with_total_timeout(Duration::from_millis(60)),
            critical: true,
            idempotent: false,
            action,
        };

        let start = Instant::now();
        let outcomes = executor().run(vec![task]);
        assert_eq!(outcomes[0].status, TaskStatus::Exhausted);
        assert!(outcomes[0].attempts < 1000);
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(outcomes[0]
            .last_error
            .as_deref()
            .unwrap()
            .contains("total wait bound"));
    }

    #[test]
    fn test_cancellation_yields_fatal_outcome() {
        let (logger, _) = RunLogger::memory();
        let cancel = Arc::new(AtomicBool::new(true));
        let executor = TaskExecutor::new(logger, cancel);

        let outcomes = executor.run(vec![TaskSpec::new(
            "never-starts",
            RetryPolicy::single_attempt(),
            || Ok(()),
        )]);
        assert_eq!(outcomes[0].status, TaskStatus::Fatal);
        assert_eq!(outcomes[0].attempts, 0);
        assert_eq!(
            outcomes[0].last_error.as_deref(),
            Some("cancelled by operator")
        );
    }

    #[test]
    fn test_reference_policies() {
        let pkg = RetryPolicy::package_install();
        assert_eq!(pkg.max_attempts, 3);
        assert_eq!(pkg.delay, Duration::from_secs(10));
        assert_eq!(pkg.total_timeout, Some(Duration::from_secs(30)));

        let cert = RetryPolicy::certificate();
        assert_eq!(cert.max_attempts, 3);
        assert_eq!(cert.delay, Duration::from_secs(30));

        let poll = RetryPolicy::health_poll();
        assert_eq!(poll.max_attempts, 60);
        assert_eq!(poll.total_timeout, Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_builder_flags() {
        let task = TaskSpec::new("t", RetryPolicy::single_attempt(), || Ok(()))
            .non_critical()
            .idempotent();
        assert!(!task.critical);
        assert!(task.idempotent);
    }
}
