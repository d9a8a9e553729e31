//! Mailrice Deploy - Main entry point
//!
//! Parses the CLI, wires up signal handling and the run logger, and maps
//! terminal run statuses to distinct process exit codes.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::warn;

use mailrice_deploy::cli::{BackupCommands, Cli, Commands};
use mailrice_deploy::{
    steps, BackupManager, HostProbe, Orchestrator, RollbackHandler, RunLogger, Validator,
};

/// Initialize the diagnostic logger with appropriate settings
fn init_logging() {
    use tracing_subscriber::EnvFilter;

    tracing_subscriber::fmt()
        .with_env_filter(
            // RUST_LOG overrides the default level
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();
}

fn main() {
    init_logging();

    let cli = Cli::parse_args();
    if cli.dry_run {
        steps::enable_dry_run();
    }

    // A single flag carries the cancellation request into the executor; the
    // orchestrator decides whether rollback is needed on the way out
    let cancel = Arc::new(AtomicBool::new(false));
    {
        let cancel = Arc::clone(&cancel);
        if let Err(e) = ctrlc::set_handler(move || {
            cancel.store(true, Ordering::SeqCst);
            eprintln!("cancellation requested; finishing the current attempt");
        }) {
            warn!("Failed to install signal handler: {}", e);
        }
    }

    let exit_code = match run_command(cli, cancel) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {:#}", e);
            1
        }
    };
    std::process::exit(exit_code);
}

fn run_command(cli: Cli, cancel: Arc<AtomicBool>) -> anyhow::Result<i32> {
    match cli.command {
        Commands::Deploy { target, yes } => {
            let mut config = target.resolve()?;
            config.validate()?;
            if yes {
                config.existing_install_pause_secs = 0;
            }

            let probe = HostProbe::new();
            let logger = RunLogger::open(&config.log_dir, config.log_retention_days)?;
            let tasks = steps::build_provisioning_tasks(&config);
            let orchestrator = Orchestrator::new(&config, &probe, logger, cancel);
            let run = orchestrator.run(tasks)?;
            Ok(run.status.exit_code())
        }
        Commands::Validate { target } => {
            let mut config = target.resolve()?;
            config.validate()?;
            // A bare validate is strictly read-only: no remediation, no
            // operator pause
            config.stop_conflicting_services = false;
            config.existing_install_pause_secs = 0;

            let probe = HostProbe::new();
            let report = Validator::new(&probe, &config).validate();
            for check in &report.checks {
                println!(
                    "[{}] {} ({}): {}",
                    check.status, check.name, check.severity, check.message
                );
            }
            if report.may_proceed() {
                println!("pre-flight checks passed for {}", config.hostname);
                Ok(0)
            } else {
                eprintln!("pre-flight checks failed; nothing was mutated");
                Ok(2)
            }
        }
        Commands::Rollback { target } => {
            let config = target.resolve()?;
            let probe = HostProbe::new();
            let logger = RunLogger::open(&config.log_dir, config.log_retention_days)?;
            let manager = BackupManager::new(&config, logger.clone());

            match manager.latest()? {
                None => {
                    eprintln!("no backup available to restore");
                    Ok(1)
                }
                Some(backup) => {
                    let handler = RollbackHandler::new(&probe, logger);
                    match handler.rollback(&backup) {
                        Ok(report) => {
                            println!(
                                "restored {} ({} service(s) restarted)",
                                backup.id(),
                                report.restarted.len()
                            );
                            Ok(0)
                        }
                        Err(e) => {
                            eprintln!("error: {}", e);
                            Ok(5)
                        }
                    }
                }
            }
        }
        Commands::Backup { backup } => match backup {
            BackupCommands::List { target } => {
                let config = target.resolve()?;
                let (logger, _) = RunLogger::memory();
                let manager = BackupManager::new(&config, logger);

                let backups = manager.list()?;
                if backups.is_empty() {
                    println!("no backups in {}", config.backup_dir.display());
                } else {
                    for backup in backups {
                        println!(
                            "{}  {}  {} bytes  {} ({})",
                            backup.id(),
                            backup.meta.created_at.format("%Y-%m-%d %H:%M:%S"),
                            backup.meta.size_bytes,
                            backup.meta.domain,
                            backup.meta.hostname
                        );
                    }
                }
                Ok(0)
            }
            BackupCommands::Prune { target } => {
                let config = target.resolve()?;
                let (logger, _) = RunLogger::memory();
                let manager = BackupManager::new(&config, logger);

                let removed = manager.prune()?;
                println!(
                    "removed {} archive(s); {} retained",
                    removed,
                    manager.list()?.len()
                );
                Ok(0)
            }
        },
    }
}
