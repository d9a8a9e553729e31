//! Restores the target from its most recent backup after a fatal failure.
//!
//! Service ordering is owned here as an explicit list: application-layer
//! services stop before the database they depend on, and restart in the
//! reverse order. Every step is best-effort and individually logged; only a
//! failed archive extraction makes the rollback itself a failure, and that
//! is the one case where the operator must recover manually.

use std::fs;
use std::process::Command;

use crate::backup::Backup;
use crate::error::{DeployError, Result};
use crate::logger::RunLogger;
use crate::probe::SystemProbe;

/// Stop order for the managed stack: application layer before the database.
/// Restart happens in reverse.
pub const SERVICE_STOP_ORDER: &[&str] =
    &["nginx", "postfix", "dovecot", "opendkim", "postgresql"];

/// What the rollback managed to do, step by step.
#[derive(Debug, Clone, Default)]
pub struct RollbackReport {
    pub stopped: Vec<String>,
    pub restored: bool,
    pub restarted: Vec<String>,
    /// Individual step failures that did not abort the rollback
    pub errors: Vec<String>,
}

/// Restores a referenced backup over the live paths.
pub struct RollbackHandler<'a> {
    probe: &'a dyn SystemProbe,
    logger: RunLogger,
}

impl<'a> RollbackHandler<'a> {
    pub fn new(probe: &'a dyn SystemProbe, logger: RunLogger) -> Self {
        Self { probe, logger }
    }

    /// Stop the stack, extract the archive over the live paths, restart.
    ///
    /// Preconditions (enforced by the orchestrator): the run has a backup
    /// reference and a fatal task outcome.
    pub fn rollback(&self, backup: &Backup) -> Result<RollbackReport> {
        let mut report = RollbackReport::default();
        self.logger.warning(
            "rollback",
            &format!("restoring {} over the live state", backup.id()),
        );

        for unit in SERVICE_STOP_ORDER {
            match self.probe.stop_service(unit) {
                Ok(()) => {
                    self.logger.info("rollback", &format!("stopped {}", unit));
                    report.stopped.push(unit.to_string());
                }
                Err(e) => {
                    let msg = format!("stop {}: {}", unit, e);
                    self.logger.warning("rollback", &msg);
                    report.errors.push(msg);
                }
            }
        }

        let restore_result = self.restore_archive(backup);
        report.restored = restore_result.is_ok();

        // Services come back up regardless of the restore outcome
        for unit in SERVICE_STOP_ORDER.iter().rev() {
            match self.probe.start_service(unit) {
                Ok(()) => {
                    self.logger.info("rollback", &format!("restarted {}", unit));
                    report.restarted.push(unit.to_string());
                }
                Err(e) => {
                    let msg = format!("start {}: {}", unit, e);
                    self.logger.warning("rollback", &msg);
                    report.errors.push(msg);
                }
            }
        }

        match restore_result {
            Ok(()) => {
                self.logger.success(
                    "rollback",
                    &format!("restored {} path(s) from {}", backup.meta.manifest.len(), backup.id()),
                );
                Ok(report)
            }
            Err(e) => {
                self.logger.error(
                    "rollback",
                    &format!("{}; manual recovery required, follow these steps:", e),
                );
                for step in &backup.meta.restore_steps {
                    self.logger.error("rollback", step);
                }
                Err(e)
            }
        }
    }

    fn restore_archive(&self, backup: &Backup) -> Result<()> {
        if !backup.archive_path.exists() {
            return Err(DeployError::rollback(format!(
                "archive {} is missing",
                backup.archive_path.display()
            )));
        }

        // Clear the archived paths first so the extract is an exact restore
        // rather than a merge with files created after the capture
        for path in &backup.meta.manifest {
            let result = if path.is_dir() {
                fs::remove_dir_all(path)
            } else if path.exists() {
                fs::remove_file(path)
            } else {
                Ok(())
            };
            if let Err(e) = result {
                let msg = format!("clearing {} before restore: {}", path.display(), e);
                self.logger.warning("rollback", &msg);
            }
        }

        let output = Command::new("tar")
            .arg("-xzf")
            .arg(&backup.archive_path)
            .arg("-C")
            .arg("/")
            .output()
            .map_err(|e| DeployError::rollback(format!("failed to run tar: {}", e)))?;

        if !output.status.success() {
            return Err(DeployError::rollback(format!(
                "tar extraction exited {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::{BackupManager, ARCHIVE_PREFIX};
    use crate::config::DeployConfig;
    use crate::probe::FakeProbe;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn staged_backup(root: &TempDir) -> (Backup, PathBuf) {
        let mut config = DeployConfig {
            domain: "example.com".to_string(),
            hostname: "mail.example.com".to_string(),
            ..DeployConfig::default()
        };
        config.backup_dir = root.path().join("backups");
        let data_dir = root.path().join("etc/postfix");
        fs::create_dir_all(&data_dir).unwrap();
        fs::write(data_dir.join("main.cf"), "original contents").unwrap();

        let (logger, _) = RunLogger::memory();
        let manager = BackupManager::new(&config, logger);
        let backup = manager.create(vec![data_dir.clone()]).unwrap();
        (backup, data_dir)
    }

    #[test]
    fn test_rollback_restores_mutated_files() {
        let root = TempDir::new().unwrap();
        let (backup, data_dir) = staged_backup(&root);

        // Mutate the live state after the capture
        fs::write(data_dir.join("main.cf"), "clobbered").unwrap();
        fs::write(data_dir.join("extra.cf"), "new file").unwrap();

        let probe = FakeProbe::healthy();
        let (logger, _) = RunLogger::memory();
        let report = RollbackHandler::new(&probe, logger)
            .rollback(&backup)
            .unwrap();

        assert!(report.restored);
        assert_eq!(
            fs::read_to_string(data_dir.join("main.cf")).unwrap(),
            "original contents"
        );
        // Files created after the capture are gone
        assert!(!data_dir.join("extra.cf").exists());
    }

    #[test]
    fn test_rollback_orders_services_correctly() {
        let root = TempDir::new().unwrap();
        let (backup, _) = staged_backup(&root);

        let probe = FakeProbe::healthy();
        let (logger, _) = RunLogger::memory();
        let report = RollbackHandler::new(&probe, logger)
            .rollback(&backup)
            .unwrap();

        assert_eq!(
            report.stopped,
            vec!["nginx", "postfix", "dovecot", "opendkim", "postgresql"]
        );
        assert_eq!(
            report.restarted,
            vec!["postgresql", "opendkim", "dovecot", "postfix", "nginx"]
        );
        assert_eq!(probe.stopped_services(), report.stopped);
        assert_eq!(probe.started_services(), report.restarted);
    }

    #[test]
    fn test_missing_archive_is_a_rollback_error() {
        let root = TempDir::new().unwrap();
        let (mut backup, _) = staged_backup(&root);
        fs::remove_file(&backup.archive_path).unwrap();
        backup.archive_path = root
            .path()
            .join("backups")
            .join(format!("{}gone.tar.gz", ARCHIVE_PREFIX));

        let probe = FakeProbe::healthy();
        let (logger, entries) = RunLogger::memory();
        let err = RollbackHandler::new(&probe, logger)
            .rollback(&backup)
            .unwrap_err();

        assert!(matches!(err, DeployError::Rollback(_)));
        // Services were still restarted best-effort
        assert_eq!(probe.started_services().len(), SERVICE_STOP_ORDER.len());
        // Restore instructions were surfaced to the operator
        let entries = entries.lock().unwrap();
        assert!(entries
            .iter()
            .any(|e| e.message.contains("manual recovery required")));
    }
}
