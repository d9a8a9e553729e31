//! Error handling module for the deployment orchestrator
//!
//! Provides centralized error handling with proper error types using thiserror.
//! All errors in the application should use these types for consistency.
//!
//! The taxonomy mirrors how failures are handled: transient task errors never
//! appear here (the executor absorbs them via retry); everything below is a
//! decision point for the orchestrator or the operator.

use thiserror::Error;

/// Main error type for the deployment orchestrator
#[derive(Error, Debug)]
pub enum DeployError {
    /// IO errors (file operations, archives, log files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration errors (loading, parsing, invalid values)
    #[error("Configuration error: {0}")]
    Config(String),

    /// A fatal pre-flight check failed; nothing was mutated
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Archive creation failed on a non-clean target
    #[error("Backup error: {0}")]
    Backup(String),

    /// A task failed after exhausting retries or hit a non-retryable error
    #[error("Task '{task}' failed after {attempts} attempt(s): {message}")]
    FatalTask {
        task: String,
        attempts: u32,
        message: String,
    },

    /// Restoring the backup failed; manual recovery is required
    #[error("Rollback error: {0}")]
    Rollback(String),

    /// Another run holds the exclusive lock on the backup directory
    #[error("Lock error: {0}")]
    Lock(String),
}

/// Result type alias for deployment operations
pub type Result<T> = std::result::Result<T, DeployError>;

// Convenient error constructors
impl DeployError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a backup error
    pub fn backup(msg: impl Into<String>) -> Self {
        Self::Backup(msg.into())
    }

    /// Create a fatal task error
    pub fn fatal_task(task: impl Into<String>, attempts: u32, message: impl Into<String>) -> Self {
        Self::FatalTask {
            task: task.into(),
            attempts,
            message: message.into(),
        }
    }

    /// Create a rollback error
    pub fn rollback(msg: impl Into<String>) -> Self {
        Self::Rollback(msg.into())
    }

    /// Create a lock error
    pub fn lock(msg: impl Into<String>) -> Self {
        Self::Lock(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DeployError::config("max_backups must be at least 1");
        assert_eq!(
            err.to_string(),
            "Configuration error: max_backups must be at least 1"
        );

        let err = DeployError::validation("hostname is not a FQDN");
        assert_eq!(err.to_string(), "Validation failed: hostname is not a FQDN");
    }

    #[test]
    fn test_fatal_task_display_includes_attempts() {
        let err = DeployError::fatal_task("install-mail-packages", 3, "apt-get exited 100");
        let msg = err.to_string();
        assert!(msg.contains("install-mail-packages"));
        assert!(msg.contains("3 attempt(s)"));
        assert!(msg.contains("apt-get exited 100"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: DeployError = io_err.into();
        assert!(matches!(err, DeployError::Io(_)));
    }

    #[test]
    fn test_error_constructors() {
        let err = DeployError::backup("tar exited 2");
        assert!(matches!(err, DeployError::Backup(_)));

        let err = DeployError::lock("held by pid 4242");
        assert!(matches!(err, DeployError::Lock(_)));
    }
}
