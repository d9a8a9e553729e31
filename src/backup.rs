//! Backup creation, listing and retention.
//!
//! Before mutating a target that already carries mail-server state, the
//! orchestrator archives the stack's configuration directories and mailbox
//! root. Archives are tarballs written to a `.partial` name and renamed into
//! place, so a crash mid-write never leaves a half-archive that looks valid.
//! Each archive is paired with a JSON metadata record carrying the target
//! identity and human-readable restore steps.
//!
//! Retention is FIFO by creation time: creating a backup past the cap
//! evicts the oldest archive and its metadata together.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::warn;

use crate::config::DeployConfig;
use crate::error::{DeployError, Result};
use crate::logger::RunLogger;
use crate::probe::SystemProbe;

pub const ARCHIVE_PREFIX: &str = "mailrice-backup-";
const STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Metadata record stored next to each archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub domain: String,
    pub hostname: String,
    #[serde(default)]
    pub target_host: Option<String>,
    /// Paths captured in the archive, in manifest order
    pub manifest: Vec<PathBuf>,
    pub size_bytes: u64,
    /// Human-readable recovery procedure for manual restoration
    pub restore_steps: Vec<String>,
}

/// One point-in-time capture. Immutable after creation.
#[derive(Debug, Clone)]
pub struct Backup {
    pub archive_path: PathBuf,
    pub meta: BackupMetadata,
}

impl Backup {
    pub fn id(&self) -> &str {
        &self.meta.id
    }
}

/// Owns the backup directory for one target.
pub struct BackupManager {
    backup_dir: PathBuf,
    config: DeployConfig,
    logger: RunLogger,
}

impl BackupManager {
    pub fn new(config: &DeployConfig, logger: RunLogger) -> Self {
        Self {
            backup_dir: config.backup_dir.clone(),
            config: config.clone(),
            logger,
        }
    }

    /// Archive the target if and only if pre-existing installation state is
    /// detected. A provably clean target gets no backup.
    pub fn maybe_backup(&self, probe: &dyn SystemProbe) -> Result<Option<Backup>> {
        let markers: Vec<PathBuf> = self
            .config
            .paths
            .detection_markers()
            .into_iter()
            .filter(|path| probe.path_exists(path))
            .map(Path::to_path_buf)
            .collect();

        if markers.is_empty() {
            self.logger.info(
                "backup",
                "no existing installation detected; skipping backup on clean target",
            );
            return Ok(None);
        }

        self.logger.info(
            "backup",
            &format!(
                "existing installation detected ({}); creating backup",
                markers
                    .iter()
                    .map(|p| p.display().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        );

        let manifest: Vec<PathBuf> = self
            .config
            .paths
            .all()
            .into_iter()
            .filter(|path| probe.path_exists(path))
            .map(Path::to_path_buf)
            .collect();

        let backup = self.create(manifest)?;
        let evicted = self.prune()?;
        if evicted > 0 {
            self.logger.info(
                "backup",
                &format!("evicted {} archive(s) past the retention cap", evicted),
            );
        }
        Ok(Some(backup))
    }

    /// Create an archive covering `manifest` and write its metadata record.
    pub fn create(&self, manifest: Vec<PathBuf>) -> Result<Backup> {
        if manifest.is_empty() {
            return Err(DeployError::backup("nothing to archive: empty manifest"));
        }
        fs::create_dir_all(&self.backup_dir)?;

        let id = self.unique_id();
        let archive_path = self.backup_dir.join(format!("{}.tar.gz", id));
        let partial_path = self.backup_dir.join(format!("{}.tar.gz.partial", id));

        // Members are archived relative to / so one extract restores them
        // all in place
        let mut cmd = Command::new("tar");
        cmd.arg("-czf").arg(&partial_path).arg("-C").arg("/");
        for path in &manifest {
            cmd.arg(path.strip_prefix("/").unwrap_or(path));
        }

        let output = cmd.output()?;
        if !output.status.success() {
            let _ = fs::remove_file(&partial_path);
            return Err(DeployError::backup(format!(
                "tar exited {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let size_bytes = fs::metadata(&partial_path)?.len();
        // Atomic rename: the archive only becomes visible once complete
        fs::rename(&partial_path, &archive_path)?;

        let meta = BackupMetadata {
            id: id.clone(),
            created_at: Utc::now(),
            domain: self.config.domain.clone(),
            hostname: self.config.hostname.clone(),
            target_host: self.config.host.clone(),
            manifest,
            size_bytes,
            restore_steps: restore_steps(&archive_path),
        };
        self.write_metadata(&meta)?;

        self.logger.success(
            "backup",
            &format!(
                "created {} ({} paths, {} bytes)",
                id,
                meta.manifest.len(),
                size_bytes
            ),
        );

        Ok(Backup { archive_path, meta })
    }

    fn write_metadata(&self, meta: &BackupMetadata) -> Result<()> {
        let final_path = self.metadata_path(&meta.id);
        let partial_path = self.backup_dir.join(format!("{}.meta.json.partial", meta.id));
        fs::write(&partial_path, serde_json::to_string_pretty(meta)?)?;
        fs::rename(&partial_path, &final_path)?;
        Ok(())
    }

    fn metadata_path(&self, id: &str) -> PathBuf {
        self.backup_dir.join(format!("{}.meta.json", id))
    }

    /// Pick an archive id that is not already taken.
    ///
    /// Two runs inside the same second would otherwise collide on the stamp.
    fn unique_id(&self) -> String {
        let stamp = Utc::now().format(STAMP_FORMAT).to_string();
        let base = format!("{}{}", ARCHIVE_PREFIX, stamp);
        let mut id = base.clone();
        let mut counter = 2;
        while self.backup_dir.join(format!("{}.tar.gz", id)).exists()
            || self.metadata_path(&id).exists()
        {
            id = format!("{}-{}", base, counter);
            counter += 1;
        }
        id
    }

    /// All valid backups, newest first.
    ///
    /// A backup is valid only when both its metadata record and its fully
    /// renamed archive exist; `.partial` leftovers are invisible here.
    pub fn list(&self) -> Result<Vec<Backup>> {
        let mut backups = Vec::new();
        if !self.backup_dir.exists() {
            return Ok(backups);
        }

        for entry in fs::read_dir(&self.backup_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if !name.starts_with(ARCHIVE_PREFIX) || !name.ends_with(".meta.json") {
                continue;
            }

            let meta: BackupMetadata = match fs::read_to_string(entry.path())
                .map_err(DeployError::from)
                .and_then(|content| serde_json::from_str(&content).map_err(DeployError::from))
            {
                Ok(meta) => meta,
                Err(e) => {
                    warn!("Skipping unreadable backup metadata {:?}: {}", entry.path(), e);
                    continue;
                }
            };

            let archive_path = self.backup_dir.join(format!("{}.tar.gz", meta.id));
            if !archive_path.exists() {
                warn!("Skipping backup {} with missing archive", meta.id);
                continue;
            }

            backups.push(Backup { archive_path, meta });
        }

        backups.sort_by(|a, b| {
            b.meta
                .created_at
                .cmp(&a.meta.created_at)
                .then_with(|| b.meta.id.cmp(&a.meta.id))
        });
        Ok(backups)
    }

    /// Most recent valid backup, if any
    pub fn latest(&self) -> Result<Option<Backup>> {
        Ok(self.list()?.into_iter().next())
    }

    /// Delete everything beyond the `max_backups` newest archives.
    pub fn prune(&self) -> Result<usize> {
        let backups = self.list()?;
        let mut removed = 0;

        for backup in backups.iter().skip(self.config.max_backups) {
            if let Err(e) = self.delete(backup) {
                warn!("Failed to delete backup {}: {}", backup.id(), e);
            } else {
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Remove one backup's archive and metadata record.
    pub fn delete(&self, backup: &Backup) -> Result<()> {
        fs::remove_file(&backup.archive_path)?;
        fs::remove_file(self.metadata_path(backup.id()))?;
        Ok(())
    }

    /// Combined size of all valid archives, in bytes
    pub fn total_size(&self) -> Result<u64> {
        Ok(self.list()?.iter().map(|b| b.meta.size_bytes).sum())
    }
}

/// Manual recovery procedure recorded in every metadata file.
fn restore_steps(archive_path: &Path) -> Vec<String> {
    vec![
        "stop the mail stack: systemctl stop nginx postfix dovecot opendkim postgresql".to_string(),
        format!(
            "extract the archive over the live paths: tar -xzf {} -C /",
            archive_path.display()
        ),
        "restart the stack: systemctl start postgresql opendkim dovecot postfix nginx".to_string(),
    ]
}
