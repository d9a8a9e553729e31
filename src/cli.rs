use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::config::DeployConfig;

/// Mailrice Deploy - provision and manage the Mailrice mail-server stack
#[derive(Parser)]
#[command(name = "mailrice-deploy")]
#[command(about = "Deployment orchestrator for the Mailrice mail-server stack")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: log every provisioning step without executing it.
    ///
    /// Mutating commands (package installs, service restarts, backups) are
    /// skipped; the run still validates and sequences normally.
    #[arg(long, global = true)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Target selection shared by the subcommands.
///
/// Values from a `--config` file are the baseline; any flag given on the
/// command line overrides the file.
#[derive(Args, Debug, Clone, Default)]
pub struct TargetArgs {
    /// Mail domain to provision (e.g., example.com)
    #[arg(long)]
    pub domain: Option<String>,

    /// Mail server hostname (e.g., mail.example.com)
    #[arg(long)]
    pub hostname: Option<String>,

    /// Target host address, recorded in backup metadata
    #[arg(long)]
    pub host: Option<String>,

    /// Administrative contact email (certificate registration)
    #[arg(long)]
    pub admin_email: Option<String>,

    /// Administrative credential for the provisioned stack
    #[arg(long)]
    pub admin_password: Option<String>,

    /// DNS-provider API credential, forwarded to provisioning steps
    #[arg(long)]
    pub dns_api_token: Option<String>,

    /// DNS zone identifier, forwarded to provisioning steps
    #[arg(long)]
    pub dns_zone_id: Option<String>,

    /// Extra parameter forwarded to provisioning steps
    #[arg(long)]
    pub extra: Option<String>,

    /// Path to a JSON configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

impl TargetArgs {
    /// Build the effective configuration: file first, flags override.
    pub fn resolve(&self) -> anyhow::Result<DeployConfig> {
        let mut config = match &self.config {
            Some(path) => DeployConfig::load_from_file(path)?,
            None => DeployConfig::default(),
        };
        if let Some(ref domain) = self.domain {
            config.domain = domain.clone();
        }
        if let Some(ref hostname) = self.hostname {
            config.hostname = hostname.clone();
        }
        if let Some(ref host) = self.host {
            config.host = Some(host.clone());
        }
        if let Some(ref email) = self.admin_email {
            config.admin_email = Some(email.clone());
        }
        if let Some(ref password) = self.admin_password {
            config.admin_password = Some(password.clone());
        }
        if let Some(ref token) = self.dns_api_token {
            config.dns_api_token = Some(token.clone());
        }
        if let Some(ref zone) = self.dns_zone_id {
            config.dns_zone_id = Some(zone.clone());
        }
        if let Some(ref extra) = self.extra {
            config.extra = Some(extra.clone());
        }
        Ok(config)
    }
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a full deployment against the target
    Deploy {
        #[command(flatten)]
        target: TargetArgs,

        /// Skip the operator-interrupt pause when an existing installation
        /// is detected
        #[arg(long)]
        yes: bool,
    },
    /// Run the read-only pre-flight checks and report, without deploying
    Validate {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Restore the target from the most recent backup
    Rollback {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Inspect or trim the backup archive set
    Backup {
        #[command(subcommand)]
        backup: BackupCommands,
    },
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// List archives, newest first
    List {
        #[command(flatten)]
        target: TargetArgs,
    },
    /// Delete archives beyond the retention cap
    Prune {
        #[command(flatten)]
        target: TargetArgs,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        <Self as clap::Parser>::parse()
    }
}
