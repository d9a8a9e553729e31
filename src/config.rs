//! Deployment configuration handling for saving and loading target descriptors.
//!
//! A `DeployConfig` describes one target: the mail domain and hostname being
//! provisioned, the on-disk locations of the stack's configuration and data,
//! and the operational knobs (retention, thresholds, remediation policy).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Locations of the mail stack's configuration directories and data root.
///
/// The orchestrator treats every one of these as an opaque blob: they are
/// archived and restored byte-for-byte, never parsed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServicePaths {
    /// Mail transfer agent configuration (Postfix)
    pub postfix_config: PathBuf,
    /// IMAP/POP server configuration (Dovecot)
    pub dovecot_config: PathBuf,
    /// Database configuration (PostgreSQL)
    pub postgres_config: PathBuf,
    /// DKIM signer configuration (OpenDKIM)
    pub opendkim_config: PathBuf,
    /// Web-proxy site configuration (nginx)
    pub nginx_sites: PathBuf,
    /// Mailbox data root
    pub vmail_root: PathBuf,
}

impl Default for ServicePaths {
    fn default() -> Self {
        Self {
            postfix_config: PathBuf::from("/etc/postfix"),
            dovecot_config: PathBuf::from("/etc/dovecot"),
            postgres_config: PathBuf::from("/etc/postgresql"),
            opendkim_config: PathBuf::from("/etc/opendkim"),
            nginx_sites: PathBuf::from("/etc/nginx/sites-available"),
            vmail_root: PathBuf::from("/var/vmail"),
        }
    }
}

impl ServicePaths {
    /// All archive-covered paths, in the fixed manifest order.
    pub fn all(&self) -> Vec<&Path> {
        vec![
            &self.postfix_config,
            &self.dovecot_config,
            &self.postgres_config,
            &self.opendkim_config,
            &self.nginx_sites,
            &self.vmail_root,
        ]
    }

    /// Paths whose presence marks a pre-existing installation.
    ///
    /// Deliberately narrower than `all()`: a stock nginx or PostgreSQL
    /// install does not make the target a mail server.
    pub fn detection_markers(&self) -> Vec<&Path> {
        vec![
            &self.postfix_config,
            &self.dovecot_config,
            &self.vmail_root,
        ]
    }
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/var/backups/mailrice")
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("/var/log/mailrice")
}

fn default_max_backups() -> usize {
    5
}

fn default_log_retention_days() -> u64 {
    14
}

// 2 GiB expressed in KiB, matching /proc/meminfo units
fn default_min_memory_kib() -> u64 {
    2 * 1024 * 1024
}

fn default_min_disk_bytes() -> u64 {
    10 * 1024 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_pause_secs() -> u64 {
    10
}

/// Target descriptor for one deployment run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    /// Mail domain being provisioned (e.g., "example.com")
    pub domain: String,
    /// Mail server hostname (e.g., "mail.example.com")
    pub hostname: String,
    /// Target host address, recorded in backup metadata
    #[serde(default)]
    pub host: Option<String>,
    /// Administrative contact email (certificate registration, DMARC reports)
    #[serde(default)]
    pub admin_email: Option<String>,
    /// Administrative credential for the provisioned stack, forwarded to
    /// step subprocesses and never logged
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_password: Option<String>,
    /// DNS-provider API credential, passed through to step subprocesses
    #[serde(default)]
    pub dns_api_token: Option<String>,
    /// DNS zone identifier, passed through to step subprocesses
    #[serde(default)]
    pub dns_zone_id: Option<String>,
    /// Free-form extra parameter forwarded to step subprocesses
    #[serde(default)]
    pub extra: Option<String>,

    #[serde(default)]
    pub paths: ServicePaths,

    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,

    /// How many archives to retain; creating one more evicts the oldest
    #[serde(default = "default_max_backups")]
    pub max_backups: usize,
    /// Run logs older than this many days are pruned at startup
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u64,

    /// Hard minimum available memory, in KiB
    #[serde(default = "default_min_memory_kib")]
    pub min_memory_kib: u64,
    /// Hard minimum free disk space on the backup mount, in bytes
    #[serde(default = "default_min_disk_bytes")]
    pub min_disk_bytes: u64,

    /// Whether port validation may stop a known conflicting web server
    #[serde(default = "default_true")]
    pub stop_conflicting_services: bool,
    /// Operator-interrupt window after an existing install is detected, in
    /// seconds; zero disables the pause
    #[serde(default = "default_pause_secs")]
    pub existing_install_pause_secs: u64,
    /// Skip the root privilege check (for unprivileged test environments)
    #[serde(default)]
    pub skip_root_check: bool,
}

impl Default for DeployConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            hostname: String::new(),
            host: None,
            admin_email: None,
            admin_password: None,
            dns_api_token: None,
            dns_zone_id: None,
            extra: None,
            paths: ServicePaths::default(),
            backup_dir: default_backup_dir(),
            log_dir: default_log_dir(),
            max_backups: default_max_backups(),
            log_retention_days: default_log_retention_days(),
            min_memory_kib: default_min_memory_kib(),
            min_disk_bytes: default_min_disk_bytes(),
            stop_conflicting_services: default_true(),
            existing_install_pause_secs: default_pause_secs(),
            skip_root_check: false,
        }
    }
}

impl DeployConfig {
    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration values that gate a run.
    ///
    /// Format rules for the domain and hostname are the validator's job;
    /// this only rejects configurations the orchestrator cannot act on.
    pub fn validate(&self) -> Result<()> {
        if self.domain.trim().is_empty() {
            anyhow::bail!("Mail domain must be specified");
        }
        if self.hostname.trim().is_empty() {
            anyhow::bail!("Mail server hostname must be specified");
        }
        if self.max_backups == 0 {
            anyhow::bail!("max_backups must be at least 1");
        }
        if self.backup_dir.as_os_str().is_empty() {
            anyhow::bail!("Backup directory must be specified");
        }
        if self.log_dir.as_os_str().is_empty() {
            anyhow::bail!("Log directory must be specified");
        }
        Ok(())
    }

    /// Convert to environment variables for step subprocesses.
    ///
    /// Credentials are forwarded verbatim; their provider semantics stay
    /// external to the orchestrator.
    pub fn to_env_vars(&self) -> Vec<(String, String)> {
        let mut vars = vec![
            ("MAIL_DOMAIN".to_string(), self.domain.clone()),
            ("MAIL_HOSTNAME".to_string(), self.hostname.clone()),
            (
                "ADMIN_EMAIL".to_string(),
                self.admin_email
                    .clone()
                    .unwrap_or_else(|| format!("postmaster@{}", self.domain)),
            ),
            (
                "VMAIL_ROOT".to_string(),
                self.paths.vmail_root.display().to_string(),
            ),
        ];
        if let Some(ref host) = self.host {
            vars.push(("TARGET_HOST".to_string(), host.clone()));
        }
        if let Some(ref password) = self.admin_password {
            vars.push(("ADMIN_PASSWORD".to_string(), password.clone()));
        }
        if let Some(ref token) = self.dns_api_token {
            vars.push(("DNS_API_TOKEN".to_string(), token.clone()));
        }
        if let Some(ref zone) = self.dns_zone_id {
            vars.push(("DNS_ZONE_ID".to_string(), zone.clone()));
        }
        if let Some(ref extra) = self.extra {
            vars.push(("DEPLOY_EXTRA".to_string(), extra.clone()));
        }
        vars
    }
}
