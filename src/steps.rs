//! The concrete provisioning task list for the mail stack.
//!
//! Every step shells out to the standard system tools (apt-get, useradd,
//! systemctl, certbot) through `run_step_command`, the single sanctioned way
//! to execute a mutating step. Each step carries the retry policy matching
//! its failure profile; health polls use pure TCP connects instead of
//! shelling out.
//!
//! A process-wide dry-run flag skips every mutating command while keeping
//! the full sequencing observable in the logs.

use std::net::{SocketAddr, TcpStream};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::info;

use crate::config::DeployConfig;
use crate::rollback::SERVICE_STOP_ORDER;
use crate::task::{RetryPolicy, TaskError, TaskSpec};
use crate::validator::VMAIL_USER;

static DRY_RUN: AtomicBool = AtomicBool::new(false);

/// Enable dry-run mode: step commands are logged and skipped.
pub fn enable_dry_run() {
    DRY_RUN.store(true, Ordering::SeqCst);
}

/// Disable dry-run mode (primarily for tests).
pub fn disable_dry_run() {
    DRY_RUN.store(false, Ordering::SeqCst);
}

/// Whether dry-run mode is active.
pub fn is_dry_run() -> bool {
    DRY_RUN.load(Ordering::SeqCst)
}

/// Packages the stack needs, installed in one transaction
const MAIL_PACKAGES: &[&str] = &[
    "postfix",
    "postfix-pgsql",
    "dovecot-imapd",
    "dovecot-pop3d",
    "dovecot-lmtpd",
    "postgresql",
    "opendkim",
    "opendkim-tools",
    "nginx",
    "certbot",
];

/// Execute one step command, mapping failure to a transient task error.
///
/// This is the only sanctioned way a provisioning step runs a subprocess:
/// dry-run gating and uniform error text live here, nowhere else.
pub fn run_step_command(
    program: &str,
    args: &[&str],
    env: &[(String, String)],
) -> std::result::Result<(), TaskError> {
    if is_dry_run() {
        info!("dry-run: skipping `{} {}`", program, args.join(" "));
        return Ok(());
    }

    let mut cmd = Command::new(program);
    cmd.args(args);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let output = cmd
        .output()
        .map_err(|e| TaskError::Transient(format!("failed to spawn {}: {}", program, e)))?;

    if output.status.success() {
        Ok(())
    } else {
        Err(TaskError::Transient(format!(
            "{} exited {}: {}",
            program,
            output.status.code().unwrap_or(-1),
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

/// One readiness probe: can we open a TCP connection to the local port?
fn poll_port(port: u16) -> std::result::Result<(), TaskError> {
    if is_dry_run() {
        return Ok(());
    }
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    match TcpStream::connect_timeout(&addr, Duration::from_secs(1)) {
        Ok(_) => Ok(()),
        Err(e) => Err(TaskError::Transient(format!(
            "port {} not accepting connections yet: {}",
            port, e
        ))),
    }
}

fn command_task(
    name: &str,
    policy: RetryPolicy,
    program: &'static str,
    args: Vec<String>,
    env: Vec<(String, String)>,
) -> TaskSpec {
    TaskSpec::new(name, policy, move || {
        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        run_step_command(program, &arg_refs, &env)
    })
}

/// Build the ordered provisioning task list for one target.
pub fn build_provisioning_tasks(config: &DeployConfig) -> Vec<TaskSpec> {
    let env = config.to_env_vars();
    let hostname = config.hostname.clone();
    let admin_email = config
        .admin_email
        .clone()
        .unwrap_or_else(|| format!("postmaster@{}", config.domain));
    let vmail_home = config.paths.vmail_root.display().to_string();

    let mut tasks = Vec::new();

    tasks.push(
        command_task(
            "refresh-package-index",
            RetryPolicy::package_install(),
            "apt-get",
            vec!["update".to_string(), "-q".to_string()],
            env.clone(),
        )
        .idempotent(),
    );

    let mut install_args = vec![
        "install".to_string(),
        "-y".to_string(),
        "-q".to_string(),
    ];
    install_args.extend(MAIL_PACKAGES.iter().map(|p| p.to_string()));
    tasks.push(
        command_task(
            "install-mail-packages",
            RetryPolicy::package_install(),
            "apt-get",
            install_args,
            env.clone(),
        )
        .idempotent(),
    );

    tasks.push(
        TaskSpec::new(
            "provision-vmail-user",
            RetryPolicy::single_attempt(),
            move || {
                if is_dry_run() {
                    info!("dry-run: skipping useradd {}", VMAIL_USER);
                    return Ok(());
                }
                let output = Command::new("useradd")
                    .args([
                        "--system",
                        "--user-group",
                        "--create-home",
                        "--home-dir",
                        vmail_home.as_str(),
                        "--shell",
                        "/usr/sbin/nologin",
                        VMAIL_USER,
                    ])
                    .output()
                    .map_err(|e| TaskError::Transient(format!("failed to spawn useradd: {}", e)))?;
                match output.status.code() {
                    // 9: the account already exists
                    Some(0) | Some(9) => Ok(()),
                    code => Err(TaskError::Transient(format!(
                        "useradd exited {}: {}",
                        code.unwrap_or(-1),
                        String::from_utf8_lossy(&output.stderr).trim()
                    ))),
                }
            },
        )
        .idempotent(),
    );

    let mut enable_args = vec!["enable".to_string(), "--quiet".to_string()];
    enable_args.extend(SERVICE_STOP_ORDER.iter().map(|s| s.to_string()));
    tasks.push(
        command_task(
            "enable-stack-services",
            RetryPolicy::single_attempt(),
            "systemctl",
            enable_args,
            Vec::new(),
        )
        .idempotent(),
    );

    tasks.push(
        command_task(
            "issue-tls-certificate",
            RetryPolicy::certificate(),
            "certbot",
            vec![
                "certonly".to_string(),
                "--standalone".to_string(),
                "--non-interactive".to_string(),
                "--agree-tos".to_string(),
                "--keep-until-expiring".to_string(),
                "-m".to_string(),
                admin_email,
                "-d".to_string(),
                hostname,
            ],
            env.clone(),
        )
        .idempotent(),
    );

    // Start order is the reverse of the stop order: database first
    tasks.push(TaskSpec::new(
        "restart-stack-services",
        RetryPolicy::new(2, Duration::from_secs(5)),
        move || {
            for &unit in SERVICE_STOP_ORDER.iter().rev() {
                run_step_command("systemctl", &["restart", unit], &[])?;
            }
            Ok(())
        },
    ));

    tasks.push(
        TaskSpec::new("wait-smtp-ready", RetryPolicy::health_poll(), || {
            poll_port(25)
        })
        .idempotent(),
    );

    tasks.push(
        TaskSpec::new("wait-imap-ready", RetryPolicy::health_poll(), || {
            poll_port(143)
        })
        .idempotent()
        .non_critical(),
    );

    tasks
}
