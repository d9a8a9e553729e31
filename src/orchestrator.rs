//! Run sequencing: validate, back up, execute, roll back on fatal failure.
//!
//! The orchestrator is the only component that decides whether to invoke
//! rollback, and the only place the five terminal run statuses are
//! assigned. Control flow is strictly sequential; the exclusive run lock is
//! held from before the backup stage until the run terminates.

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use strum::Display;

use crate::backup::{Backup, BackupManager};
use crate::config::DeployConfig;
use crate::error::Result;
use crate::lock::RunLock;
use crate::logger::{RunLogger, RunSummary};
use crate::probe::SystemProbe;
use crate::rollback::RollbackHandler;
use crate::steps;
use crate::task::{TaskExecutor, TaskOutcome, TaskSpec};
use crate::validator::{CheckSeverity, ValidationReport, Validator};

/// Terminal status of a deployment run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Display)]
#[strum(serialize_all = "snake_case")]
pub enum RunStatus {
    Success,
    ValidationFailed,
    TaskFailedRolledBack,
    TaskFailedNoBackup,
    RollbackFailed,
}

impl RunStatus {
    /// Process exit code for automated callers; each status is distinct
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::ValidationFailed => 2,
            Self::TaskFailedNoBackup => 3,
            Self::TaskFailedRolledBack => 4,
            Self::RollbackFailed => 5,
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

/// Record of one deployment run.
#[derive(Debug, Clone)]
pub struct DeploymentRun {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report: ValidationReport,
    pub outcomes: Vec<TaskOutcome>,
    pub backup: Option<Backup>,
    pub status: RunStatus,
}

/// Root component sequencing one deployment run.
pub struct Orchestrator<'a> {
    config: &'a DeployConfig,
    probe: &'a dyn SystemProbe,
    logger: RunLogger,
    cancel: Arc<AtomicBool>,
}

impl<'a> Orchestrator<'a> {
    pub fn new(
        config: &'a DeployConfig,
        probe: &'a dyn SystemProbe,
        logger: RunLogger,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            config,
            probe,
            logger,
            cancel,
        }
    }

    /// Run the full deployment pipeline over the given task list.
    ///
    /// Returns the completed `DeploymentRun` for any of the five terminal
    /// statuses; lock contention and backup-creation failure surface as
    /// errors since they abort before the pipeline has a terminal status.
    pub fn run(&self, tasks: Vec<TaskSpec>) -> Result<DeploymentRun> {
        let started_at = Utc::now();
        let id = format!("run-{}", started_at.format("%Y%m%d_%H%M%S"));

        // Held until this function returns, covering every outcome path
        let _lock = RunLock::acquire(&self.config.backup_dir)?;

        self.logger.info(
            "orchestrator",
            &format!(
                "{} starting: domain {}, hostname {}",
                id, self.config.domain, self.config.hostname
            ),
        );

        // Stage 1: pre-flight validation
        let report = Validator::new(self.probe, self.config).validate();
        for check in &report.checks {
            if check.passed() {
                self.logger
                    .info("validator", &format!("{}: {}", check.name, check.message));
            } else if check.severity == CheckSeverity::Warning {
                self.logger
                    .warning("validator", &format!("{}: {}", check.name, check.message));
            } else {
                self.logger
                    .error("validator", &format!("{}: {}", check.name, check.message));
            }
        }

        if !report.may_proceed() {
            let run = DeploymentRun {
                id,
                started_at,
                finished_at: Utc::now(),
                report,
                outcomes: Vec::new(),
                backup: None,
                status: RunStatus::ValidationFailed,
            };
            self.summarize(&run);
            return Ok(run);
        }

        // Stage 2: backup iff the target is not provably clean
        let backup_manager = BackupManager::new(self.config, self.logger.clone());
        let backup = if steps::is_dry_run() {
            self.logger
                .info("orchestrator", "dry-run: skipping backup creation");
            None
        } else {
            match backup_manager.maybe_backup(self.probe) {
                Ok(backup) => backup,
                Err(e) => {
                    // No task has run yet; the target is untouched
                    self.logger.error(
                        "orchestrator",
                        &format!("backup creation failed, aborting before any task: {}", e),
                    );
                    self.logger.finish(&RunSummary {
                        status_label: "aborted".to_string(),
                        succeeded: false,
                        facts: vec![("failed stage".to_string(), "backup".to_string())],
                        troubleshooting: vec![
                            "no provisioning task was executed; the target is unchanged"
                                .to_string(),
                        ],
                    });
                    return Err(e);
                }
            }
        };

        // Stage 3: ordered task execution with per-task retry
        let executor = TaskExecutor::new(self.logger.clone(), Arc::clone(&self.cancel));
        let outcomes = executor.run(tasks);
        let blocking = outcomes.iter().find(|o| o.blocks_run()).cloned();

        // Stage 4: rollback, only with both a backup and a fatal outcome
        let status = match (&blocking, &backup) {
            (None, _) => RunStatus::Success,
            (Some(_), Some(backup_ref)) => {
                let handler = RollbackHandler::new(self.probe, self.logger.clone());
                match handler.rollback(backup_ref) {
                    Ok(_) => RunStatus::TaskFailedRolledBack,
                    Err(e) => {
                        self.logger
                            .error("orchestrator", &format!("rollback failed: {}", e));
                        RunStatus::RollbackFailed
                    }
                }
            }
            (Some(_), None) => {
                if self.cancel.load(Ordering::SeqCst) {
                    self.logger.info(
                        "orchestrator",
                        "cancelled with no backup taken: no changes requiring rollback",
                    );
                }
                RunStatus::TaskFailedNoBackup
            }
        };

        let run = DeploymentRun {
            id,
            started_at,
            finished_at: Utc::now(),
            report,
            outcomes,
            backup,
            status,
        };
        self.summarize(&run);
        Ok(run)
    }

    fn summarize(&self, run: &DeploymentRun) {
        let mut facts = vec![
            ("run".to_string(), run.id.clone()),
            ("domain".to_string(), self.config.domain.clone()),
            ("hostname".to_string(), self.config.hostname.clone()),
            (
                "checks".to_string(),
                format!(
                    "{}/{} passed",
                    run.report.checks.iter().filter(|c| c.passed()).count(),
                    run.report.checks.len()
                ),
            ),
            (
                "tasks".to_string(),
                format!(
                    "{}/{} succeeded",
                    run.outcomes
                        .iter()
                        .filter(|o| o.status == crate::task::TaskStatus::Succeeded)
                        .count(),
                    run.outcomes.len()
                ),
            ),
        ];
        if let Some(ref backup) = run.backup {
            facts.push(("backup".to_string(), backup.id().to_string()));
        }
        if let Some(failed) = run.outcomes.iter().find(|o| o.blocks_run()) {
            facts.push((
                "failed task".to_string(),
                format!(
                    "{} ({} attempt(s): {})",
                    failed.name,
                    failed.attempts,
                    failed.last_error.as_deref().unwrap_or("no error recorded")
                ),
            ));
        }

        let troubleshooting = match run.status {
            RunStatus::Success => Vec::new(),
            RunStatus::ValidationFailed => {
                let mut items: Vec<String> = run
                    .report
                    .fatal_failures()
                    .iter()
                    .map(|c| format!("fix {}: {}", c.name, c.message))
                    .collect();
                items.push("re-run once the checks above pass; nothing was mutated".to_string());
                items
            }
            RunStatus::TaskFailedNoBackup => vec![
                "the target had no prior installation, so nothing was rolled back".to_string(),
                "partially applied steps may remain; re-running after fixing the cause is safe"
                    .to_string(),
            ],
            RunStatus::TaskFailedRolledBack => vec![
                "the previous installation was restored from the backup above".to_string(),
                "fix the failed task's cause and re-run the deployment".to_string(),
            ],
            RunStatus::RollbackFailed => {
                let mut items = vec![
                    "automatic restore failed; manual recovery is required".to_string(),
                ];
                if let Some(ref backup) = run.backup {
                    items.extend(backup.meta.restore_steps.iter().cloned());
                }
                items
            }
        };

        self.logger.finish(&RunSummary {
            status_label: run.status.to_string(),
            succeeded: run.status.is_success(),
            facts,
            troubleshooting,
        });
    }
}
