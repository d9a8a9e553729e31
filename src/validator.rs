//! Pre-flight validation battery.
//!
//! Runs a fixed sequence of independent checks against the target and
//! aggregates them into a `ValidationReport`. No check depends on another's
//! outcome, and nothing here mutates the target, with one sanctioned
//! exception: the port-availability check may stop a known conflicting web
//! server as remediation when the configuration allows it.
//!
//! Any fatal check failing means the run terminates before a backup is
//! taken or a task executes.

use std::thread;
use std::time::Duration;
use strum::Display;
use tracing::{debug, warn};

use crate::config::DeployConfig;
use crate::probe::SystemProbe;

/// What a check probes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Display)]
#[strum(serialize_all = "lowercase")]
pub enum CheckCategory {
    Resource,
    Format,
    Availability,
    Conflict,
}

/// Whether a failing check blocks the run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Display)]
#[strum(serialize_all = "lowercase")]
pub enum CheckSeverity {
    Fatal,
    Warning,
}

/// Evaluation result of one check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[derive(Display)]
#[strum(serialize_all = "lowercase")]
pub enum CheckStatus {
    Pass,
    Fail,
}

/// One evaluated pre-flight check. Immutable once built.
#[derive(Debug, Clone)]
pub struct ValidationCheck {
    pub name: &'static str,
    pub category: CheckCategory,
    pub severity: CheckSeverity,
    pub status: CheckStatus,
    pub message: String,
}

impl ValidationCheck {
    fn pass(
        name: &'static str,
        category: CheckCategory,
        severity: CheckSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name,
            category,
            severity,
            status: CheckStatus::Pass,
            message: message.into(),
        }
    }

    fn fail(
        name: &'static str,
        category: CheckCategory,
        severity: CheckSeverity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            name,
            category,
            severity,
            status: CheckStatus::Fail,
            message: message.into(),
        }
    }

    pub fn passed(&self) -> bool {
        self.status == CheckStatus::Pass
    }

    /// True for the only combination that blocks a run
    pub fn is_fatal_failure(&self) -> bool {
        self.severity == CheckSeverity::Fatal && self.status == CheckStatus::Fail
    }
}

/// Ordered results of one validation run.
#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    pub checks: Vec<ValidationCheck>,
}

impl ValidationReport {
    /// True iff no fatal check failed
    pub fn may_proceed(&self) -> bool {
        !self.checks.iter().any(|c| c.is_fatal_failure())
    }

    /// Fatal failures, in check order
    pub fn fatal_failures(&self) -> Vec<&ValidationCheck> {
        self.checks.iter().filter(|c| c.is_fatal_failure()).collect()
    }

    /// Warning-severity failures, in check order
    pub fn warnings(&self) -> Vec<&ValidationCheck> {
        self.checks
            .iter()
            .filter(|c| c.severity == CheckSeverity::Warning && !c.passed())
            .collect()
    }
}

/// Ports the mail stack needs to own
pub const REQUIRED_PORTS: &[(u16, &str)] = &[
    (25, "smtp"),
    (80, "http"),
    (110, "pop3"),
    (143, "imap"),
    (443, "https"),
    (465, "smtps"),
    (587, "submission"),
    (993, "imaps"),
    (995, "pop3s"),
];

/// Binaries the provisioning steps shell out to
const REQUIRED_BINARIES: &[&str] = &[
    "tar",       // Archive creation and restore
    "systemctl", // Service management
    "apt-get",   // Package installation
];

/// Reserved account owning the mailbox data root
pub const VMAIL_USER: &str = "vmail";

/// Web server known to squat the HTTP ports on unmanaged hosts
const CONFLICTING_WEB_SERVER: &str = "apache2";

/// Validate a domain or fully-qualified hostname.
///
/// Requires at least one dot, labels of 1-63 alphanumeric/hyphen characters
/// with no leading or trailing hyphen, a total length within 253, and an
/// alphabetic top-level label of at least two characters.
pub fn is_valid_domain_name(name: &str) -> bool {
    let name = name.trim();
    if name.is_empty() || name.len() > 253 {
        return false;
    }
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    for label in &labels {
        if label.is_empty() || label.len() > 63 {
            return false;
        }
        if !label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
            return false;
        }
        if label.starts_with('-') || label.ends_with('-') {
            return false;
        }
    }
    let tld = labels.last().expect("split always yields at least one label");
    tld.len() >= 2 && tld.chars().all(|c| c.is_ascii_alphabetic())
}

/// Pre-flight validator for one target.
pub struct Validator<'a> {
    probe: &'a dyn SystemProbe,
    config: &'a DeployConfig,
}

impl<'a> Validator<'a> {
    pub fn new(probe: &'a dyn SystemProbe, config: &'a DeployConfig) -> Self {
        Self { probe, config }
    }

    /// Run the full battery in fixed order and aggregate the results.
    pub fn validate(&self) -> ValidationReport {
        let checks = vec![
            self.check_root(),
            self.check_binaries(),
            self.check_memory(),
            self.check_disk(),
            self.check_hostname(),
            self.check_domain(),
            self.check_vmail_user(),
            self.check_existing_install(),
            self.check_ports(),
        ];

        for check in &checks {
            debug!(
                "check {}: {} ({}) - {}",
                check.name, check.status, check.severity, check.message
            );
        }

        ValidationReport { checks }
    }

    fn check_root(&self) -> ValidationCheck {
        if self.config.skip_root_check {
            return ValidationCheck::pass(
                "root-privileges",
                CheckCategory::Resource,
                CheckSeverity::Fatal,
                "root check skipped by configuration",
            );
        }
        if self.probe.is_root() {
            ValidationCheck::pass(
                "root-privileges",
                CheckCategory::Resource,
                CheckSeverity::Fatal,
                "running with root privileges",
            )
        } else {
            ValidationCheck::fail(
                "root-privileges",
                CheckCategory::Resource,
                CheckSeverity::Fatal,
                "root privileges required to manage packages and services; re-run with sudo",
            )
        }
    }

    fn check_binaries(&self) -> ValidationCheck {
        let missing: Vec<&str> = REQUIRED_BINARIES
            .iter()
            .copied()
            .filter(|name| !self.probe.binary_exists(name))
            .collect();
        if missing.is_empty() {
            ValidationCheck::pass(
                "required-binaries",
                CheckCategory::Availability,
                CheckSeverity::Fatal,
                "all required binaries present",
            )
        } else {
            ValidationCheck::fail(
                "required-binaries",
                CheckCategory::Availability,
                CheckSeverity::Fatal,
                format!(
                    "missing required binaries: {}; install them before deploying",
                    missing.join(", ")
                ),
            )
        }
    }

    fn check_memory(&self) -> ValidationCheck {
        let available = match self.probe.available_memory_kib() {
            Ok(kib) => kib,
            Err(e) => {
                return ValidationCheck::fail(
                    "memory",
                    CheckCategory::Resource,
                    CheckSeverity::Fatal,
                    format!("could not determine available memory: {}", e),
                )
            }
        };
        let minimum = self.config.min_memory_kib;
        if available >= minimum {
            ValidationCheck::pass(
                "memory",
                CheckCategory::Resource,
                CheckSeverity::Fatal,
                format!("{} MiB available", available / 1024),
            )
        } else {
            ValidationCheck::fail(
                "memory",
                CheckCategory::Resource,
                CheckSeverity::Fatal,
                format!(
                    "{} MiB available, below the {} MiB minimum; upgrade the instance before deploying",
                    available / 1024,
                    minimum / 1024
                ),
            )
        }
    }

    fn check_disk(&self) -> ValidationCheck {
        let free = match self.probe.free_disk_bytes(&self.config.backup_dir) {
            Ok(bytes) => bytes,
            Err(e) => {
                return ValidationCheck::fail(
                    "disk-space",
                    CheckCategory::Resource,
                    CheckSeverity::Fatal,
                    format!("could not determine free disk space: {}", e),
                )
            }
        };
        let minimum = self.config.min_disk_bytes;
        let gib = 1024 * 1024 * 1024;
        if free >= minimum {
            ValidationCheck::pass(
                "disk-space",
                CheckCategory::Resource,
                CheckSeverity::Fatal,
                format!("{} GiB free on the backup mount", free / gib),
            )
        } else {
            ValidationCheck::fail(
                "disk-space",
                CheckCategory::Resource,
                CheckSeverity::Fatal,
                format!(
                    "{} GiB free, below the {} GiB minimum; free up space before deploying",
                    free / gib,
                    minimum / gib
                ),
            )
        }
    }

    fn check_hostname(&self) -> ValidationCheck {
        if is_valid_domain_name(&self.config.hostname) {
            ValidationCheck::pass(
                "hostname-format",
                CheckCategory::Format,
                CheckSeverity::Fatal,
                format!("'{}' is a fully-qualified hostname", self.config.hostname),
            )
        } else {
            ValidationCheck::fail(
                "hostname-format",
                CheckCategory::Format,
                CheckSeverity::Fatal,
                format!(
                    "'{}' is not a fully-qualified hostname (expected something like mail.example.com)",
                    self.config.hostname
                ),
            )
        }
    }

    fn check_domain(&self) -> ValidationCheck {
        if is_valid_domain_name(&self.config.domain) {
            ValidationCheck::pass(
                "domain-format",
                CheckCategory::Format,
                CheckSeverity::Fatal,
                format!("'{}' is a valid mail domain", self.config.domain),
            )
        } else {
            ValidationCheck::fail(
                "domain-format",
                CheckCategory::Format,
                CheckSeverity::Fatal,
                format!(
                    "'{}' is not a valid mail domain (expected a registrable name like example.com)",
                    self.config.domain
                ),
            )
        }
    }

    fn check_vmail_user(&self) -> ValidationCheck {
        if self.probe.user_exists(VMAIL_USER) {
            ValidationCheck::fail(
                "vmail-uid",
                CheckCategory::Availability,
                CheckSeverity::Warning,
                format!(
                    "user '{}' already exists; it will be reused as the mailbox owner",
                    VMAIL_USER
                ),
            )
        } else {
            ValidationCheck::pass(
                "vmail-uid",
                CheckCategory::Availability,
                CheckSeverity::Warning,
                format!("user '{}' is available", VMAIL_USER),
            )
        }
    }

    fn check_existing_install(&self) -> ValidationCheck {
        let present: Vec<String> = self
            .config
            .paths
            .detection_markers()
            .into_iter()
            .filter(|path| self.probe.path_exists(path))
            .map(|path| path.display().to_string())
            .collect();

        if present.is_empty() {
            return ValidationCheck::pass(
                "existing-install",
                CheckCategory::Conflict,
                CheckSeverity::Warning,
                "no existing mail-server state found",
            );
        }

        let check = ValidationCheck::fail(
            "existing-install",
            CheckCategory::Conflict,
            CheckSeverity::Warning,
            format!(
                "existing mail-server state at {}; it will be archived before any change",
                present.join(", ")
            ),
        );

        let pause = self.config.existing_install_pause_secs;
        if pause > 0 {
            warn!(
                "Existing installation detected; continuing in {}s (Ctrl-C to abort)",
                pause
            );
            thread::sleep(Duration::from_secs(pause));
        }

        check
    }

    fn check_ports(&self) -> ValidationCheck {
        let mut occupied = Vec::new();
        for &(port, proto) in REQUIRED_PORTS {
            if !self.probe.port_in_use(port) {
                continue;
            }
            // The one sanctioned remediation: a known conflicting web server
            // on the HTTP ports is stopped rather than failing the run
            if (port == 80 || port == 443)
                && self.config.stop_conflicting_services
                && self.probe.service_active(CONFLICTING_WEB_SERVER)
            {
                warn!(
                    "Port {} is held by {}; stopping it to free the web ports",
                    port, CONFLICTING_WEB_SERVER
                );
                if let Err(e) = self.probe.stop_service(CONFLICTING_WEB_SERVER) {
                    warn!("Failed to stop {}: {}", CONFLICTING_WEB_SERVER, e);
                }
                if !self.probe.port_in_use(port) {
                    continue;
                }
            }
            occupied.push(format!("{}/{}", port, proto));
        }

        if occupied.is_empty() {
            ValidationCheck::pass(
                "port-availability",
                CheckCategory::Conflict,
                CheckSeverity::Fatal,
                "all mail-stack ports are free",
            )
        } else {
            ValidationCheck::fail(
                "port-availability",
                CheckCategory::Conflict,
                CheckSeverity::Fatal,
                format!(
                    "ports already in use: {}; stop the listening services before deploying",
                    occupied.join(", ")
                ),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::FakeProbe;

    fn test_config() -> DeployConfig {
        DeployConfig {
            domain: "example.com".to_string(),
            hostname: "mail.example.com".to_string(),
            existing_install_pause_secs: 0,
            ..DeployConfig::default()
        }
    }

    // =========================================================================
    // Domain name parsing
    // =========================================================================

    #[test]
    fn test_valid_domain_names() {
        assert!(is_valid_domain_name("example.com"));
        assert!(is_valid_domain_name("mail.example.com"));
        assert!(is_valid_domain_name("a-b.example.co"));
        assert!(is_valid_domain_name("xn--80ak6aa92e.com"));
    }

    #[test]
    fn test_invalid_domain_names() {
        assert!(!is_valid_domain_name(""));
        assert!(!is_valid_domain_name("localhost"));
        assert!(!is_valid_domain_name("example."));
        assert!(!is_valid_domain_name(".example.com"));
        assert!(!is_valid_domain_name("exa mple.com"));
        assert!(!is_valid_domain_name("-example.com"));
        assert!(!is_valid_domain_name("example-.com"));
        assert!(!is_valid_domain_name("example.c"));
        assert!(!is_valid_domain_name("example.123"));
        assert!(!is_valid_domain_name("example.com-"));
    }

    #[test]
    fn test_domain_name_length_limits() {
        let long_label = "a".repeat(64);
        assert!(!is_valid_domain_name(&format!("{}.com", long_label)));
        let ok_label = "a".repeat(63);
        assert!(is_valid_domain_name(&format!("{}.com", ok_label)));

        let long_name = format!("{}.{}.{}.{}.com", "a".repeat(63), "b".repeat(63), "c".repeat(63), "d".repeat(63));
        assert!(!is_valid_domain_name(&long_name));
    }

    // =========================================================================
    // Individual checks
    // =========================================================================

    #[test]
    fn test_healthy_target_may_proceed() {
        let probe = FakeProbe::healthy();
        let config = test_config();
        let report = Validator::new(&probe, &config).validate();
        assert!(report.may_proceed(), "report: {:?}", report);
        assert!(report.fatal_failures().is_empty());
    }

    #[test]
    fn test_low_memory_is_fatal() {
        let mut probe = FakeProbe::healthy();
        probe.memory_kib = 1024 * 1024; // 1 GiB
        let config = test_config();
        let report = Validator::new(&probe, &config).validate();
        assert!(!report.may_proceed());
        let fatal = report.fatal_failures();
        assert_eq!(fatal.len(), 1);
        assert_eq!(fatal[0].name, "memory");
        assert!(fatal[0].message.contains("upgrade"));
    }

    #[test]
    fn test_low_disk_is_fatal() {
        let mut probe = FakeProbe::healthy();
        probe.disk_bytes = 1024 * 1024 * 1024; // 1 GiB
        let config = test_config();
        let report = Validator::new(&probe, &config).validate();
        assert!(!report.may_proceed());
        assert!(report.fatal_failures().iter().any(|c| c.name == "disk-space"));
    }

    #[test]
    fn test_bad_hostname_is_fatal() {
        let probe = FakeProbe::healthy();
        let mut config = test_config();
        config.hostname = "mailserver".to_string();
        let report = Validator::new(&probe, &config).validate();
        assert!(!report.may_proceed());
        assert!(report
            .fatal_failures()
            .iter()
            .any(|c| c.name == "hostname-format"));
    }

    #[test]
    fn test_missing_root_is_fatal_unless_skipped() {
        let mut probe = FakeProbe::healthy();
        probe.root = false;
        let mut config = test_config();

        let report = Validator::new(&probe, &config).validate();
        assert!(!report.may_proceed());

        config.skip_root_check = true;
        let report = Validator::new(&probe, &config).validate();
        assert!(report.may_proceed());
    }

    #[test]
    fn test_vmail_user_taken_is_warning_only() {
        let probe = FakeProbe::healthy();
        probe.add_user(VMAIL_USER);
        let config = test_config();
        let report = Validator::new(&probe, &config).validate();
        assert!(report.may_proceed(), "a taken vmail uid must not block the run");
        assert!(report.warnings().iter().any(|c| c.name == "vmail-uid"));
    }

    #[test]
    fn test_conflicting_web_server_is_stopped() {
        let probe = FakeProbe::healthy();
        probe.occupy_port(80, "apache2");
        probe.occupy_port(443, "apache2");
        let config = test_config();

        let report = Validator::new(&probe, &config).validate();
        assert!(report.may_proceed(), "report: {:?}", report);
        assert_eq!(probe.stopped_services(), vec!["apache2".to_string()]);
    }

    #[test]
    fn test_remediation_disabled_leaves_ports_fatal() {
        let probe = FakeProbe::healthy();
        probe.occupy_port(80, "apache2");
        let mut config = test_config();
        config.stop_conflicting_services = false;

        let report = Validator::new(&probe, &config).validate();
        assert!(!report.may_proceed());
        assert!(probe.stopped_services().is_empty());
    }

    #[test]
    fn test_unknown_port_holder_is_fatal() {
        let probe = FakeProbe::healthy();
        probe.occupy_port(25, "exim4");
        let config = test_config();

        let report = Validator::new(&probe, &config).validate();
        assert!(!report.may_proceed());
        let fatal = report.fatal_failures();
        assert!(fatal.iter().any(|c| c.name == "port-availability"
            && c.message.contains("25/smtp")));
    }

    #[test]
    fn test_existing_install_is_warning() {
        let dir = tempfile::tempdir().unwrap();
        let probe = FakeProbe::healthy();
        let mut config = test_config();
        config.paths.postfix_config = dir.path().join("postfix");
        config.paths.dovecot_config = dir.path().join("dovecot");
        config.paths.vmail_root = dir.path().join("vmail");
        std::fs::create_dir_all(&config.paths.postfix_config).unwrap();

        let report = Validator::new(&probe, &config).validate();
        assert!(report.may_proceed());
        assert!(report
            .warnings()
            .iter()
            .any(|c| c.name == "existing-install" && c.message.contains("postfix")));
    }

    #[test]
    fn test_report_orders_checks_as_run() {
        let probe = FakeProbe::healthy();
        let config = test_config();
        let report = Validator::new(&probe, &config).validate();
        let names: Vec<&str> = report.checks.iter().map(|c| c.name).collect();
        assert_eq!(
            names,
            vec![
                "root-privileges",
                "required-binaries",
                "memory",
                "disk-space",
                "hostname-format",
                "domain-format",
                "vmail-uid",
                "existing-install",
                "port-availability",
            ]
        );
    }
}
