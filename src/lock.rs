//! Exclusive per-target run lock.
//!
//! Two runs against the same host must not interleave writes to the same
//! backup directory. The lock is a marker file created with `create_new`
//! inside the backup directory, held for the whole run and released on drop
//! (success, failure or rollback alike). The holder's pid is recorded so a
//! lock left behind by a crashed run can be detected and cleared.

use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::{DeployError, Result};

const LOCK_FILE: &str = ".deploy.lock";

/// Held lock on a backup directory. Released on drop.
#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
}

impl RunLock {
    /// Acquire the exclusive lock for `backup_dir`, clearing a stale lock
    /// whose holder is no longer alive.
    pub fn acquire(backup_dir: &Path) -> Result<Self> {
        fs::create_dir_all(backup_dir)?;
        let path = backup_dir.join(LOCK_FILE);

        match Self::try_create(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                let holder = fs::read_to_string(&path).unwrap_or_default();
                if let Ok(pid) = holder.trim().parse::<i32>() {
                    if pid_alive(pid) {
                        return Err(DeployError::lock(format!(
                            "another deployment (pid {}) holds {}",
                            pid,
                            path.display()
                        )));
                    }
                }
                warn!("Removing stale run lock {:?} (holder is gone)", path);
                fs::remove_file(&path)?;
                Self::try_create(&path).map_err(|e| {
                    DeployError::lock(format!("failed to take over stale lock: {}", e))
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn try_create(path: &Path) -> std::io::Result<Self> {
        let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
        writeln!(file, "{}", std::process::id())?;
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    /// Path of the lock marker file
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!("Failed to release run lock {:?}: {}", self.path, e);
        }
    }
}

fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}
