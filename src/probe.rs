//! Read-only system probes behind a trait seam.
//!
//! The validator and backup detection ask questions about the target host
//! (memory, disk, users, ports, services) through `SystemProbe` so tests can
//! simulate any host state without a live system. `HostProbe` is the real
//! implementation; `FakeProbe` is the scripted one used by the test suites.
//!
//! Everything here is diagnostic except `stop_service`/`start_service`,
//! which exist for the port-conflict remediation and the rollback path.

use anyhow::{bail, Context, Result};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::net::TcpListener;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;

/// Questions the orchestrator asks about the target host.
pub trait SystemProbe {
    /// Available memory in KiB, as the kernel reports it
    fn available_memory_kib(&self) -> Result<u64>;
    /// Free bytes on the filesystem holding `path`
    fn free_disk_bytes(&self, path: &Path) -> Result<u64>;
    /// Whether a local account with this name exists
    fn user_exists(&self, name: &str) -> bool;
    /// Whether something is already listening on the port
    fn port_in_use(&self, port: u16) -> bool;
    /// Whether the path exists on the target
    fn path_exists(&self, path: &Path) -> bool;
    /// Whether the systemd unit is currently active
    fn service_active(&self, unit: &str) -> bool;
    /// Stop a systemd unit
    fn stop_service(&self, unit: &str) -> Result<()>;
    /// Start a systemd unit
    fn start_service(&self, unit: &str) -> Result<()>;
    /// Whether we are running with EUID 0
    fn is_root(&self) -> bool;
    /// Whether a binary is available in PATH
    fn binary_exists(&self, name: &str) -> bool;
}

/// Probe implementation for the live host.
#[derive(Debug, Default)]
pub struct HostProbe;

impl HostProbe {
    pub fn new() -> Self {
        Self
    }
}

/// Extract a field such as `MemAvailable` from /proc/meminfo content.
///
/// Lines look like `MemAvailable:    8049148 kB`.
fn parse_meminfo_field(meminfo: &str, field: &str) -> Option<u64> {
    let prefix = format!("{}:", field);
    meminfo
        .lines()
        .find(|line| line.starts_with(&prefix))
        .and_then(|line| line.split_whitespace().nth(1))
        .and_then(|value| value.parse().ok())
}

/// Nearest existing ancestor of a path that may not exist yet.
fn nearest_existing(path: &Path) -> &Path {
    let mut current = path;
    while !current.exists() {
        match current.parent() {
            Some(parent) => current = parent,
            None => return Path::new("/"),
        }
    }
    current
}

impl SystemProbe for HostProbe {
    fn available_memory_kib(&self) -> Result<u64> {
        let meminfo = fs::read_to_string("/proc/meminfo").context("Failed to read /proc/meminfo")?;
        parse_meminfo_field(&meminfo, "MemAvailable")
            .or_else(|| parse_meminfo_field(&meminfo, "MemFree"))
            .context("No MemAvailable or MemFree field in /proc/meminfo")
    }

    fn free_disk_bytes(&self, path: &Path) -> Result<u64> {
        let target = nearest_existing(path);
        let stat = nix::sys::statvfs::statvfs(target)
            .with_context(|| format!("statvfs failed for {:?}", target))?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }

    fn user_exists(&self, name: &str) -> bool {
        let Ok(passwd) = fs::read_to_string("/etc/passwd") else {
            return false;
        };
        let prefix = format!("{}:", name);
        passwd.lines().any(|line| line.starts_with(&prefix))
    }

    fn port_in_use(&self, port: u16) -> bool {
        // A bind failure with AddrInUse is the only definitive signal; a
        // PermissionDenied on a privileged port tells us nothing
        match TcpListener::bind(("0.0.0.0", port)) {
            Ok(_) => false,
            Err(e) => e.kind() == std::io::ErrorKind::AddrInUse,
        }
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn service_active(&self, unit: &str) -> bool {
        Command::new("systemctl")
            .args(["is-active", "--quiet", unit])
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn stop_service(&self, unit: &str) -> Result<()> {
        let output = Command::new("systemctl")
            .args(["stop", unit])
            .output()
            .with_context(|| format!("Failed to run systemctl stop {}", unit))?;
        if !output.status.success() {
            bail!(
                "systemctl stop {} failed: {}",
                unit,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn start_service(&self, unit: &str) -> Result<()> {
        let output = Command::new("systemctl")
            .args(["start", unit])
            .output()
            .with_context(|| format!("Failed to run systemctl start {}", unit))?;
        if !output.status.success() {
            bail!(
                "systemctl start {} failed: {}",
                unit,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    fn is_root(&self) -> bool {
        nix::unistd::geteuid().is_root()
    }

    fn binary_exists(&self, name: &str) -> bool {
        Command::new("which")
            .arg(name)
            .output()
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

/// Scripted probe for tests.
///
/// Filesystem questions (`path_exists`) are answered from the real
/// filesystem so tests can stage state in temporary directories; everything
/// else is served from the fields below.
pub struct FakeProbe {
    pub memory_kib: u64,
    pub disk_bytes: u64,
    pub root: bool,
    pub binaries_present: bool,
    users: Mutex<HashSet<String>>,
    /// port -> unit that owns it; stopping the unit frees its ports
    ports: Mutex<HashMap<u16, String>>,
    active_units: Mutex<HashSet<String>>,
    stop_calls: Mutex<Vec<String>>,
    start_calls: Mutex<Vec<String>>,
}

impl FakeProbe {
    /// A target that passes every check: plenty of memory and disk, root,
    /// all binaries, nothing listening.
    pub fn healthy() -> Self {
        Self {
            memory_kib: 8 * 1024 * 1024,
            disk_bytes: 100 * 1024 * 1024 * 1024,
            root: true,
            binaries_present: true,
            users: Mutex::new(HashSet::new()),
            ports: Mutex::new(HashMap::new()),
            active_units: Mutex::new(HashSet::new()),
            stop_calls: Mutex::new(Vec::new()),
            start_calls: Mutex::new(Vec::new()),
        }
    }

    pub fn add_user(&self, name: &str) {
        self.users.lock().unwrap().insert(name.to_string());
    }

    /// Mark a port as held by a unit; the unit is also marked active.
    pub fn occupy_port(&self, port: u16, unit: &str) {
        self.ports.lock().unwrap().insert(port, unit.to_string());
        self.active_units.lock().unwrap().insert(unit.to_string());
    }

    pub fn activate_service(&self, unit: &str) {
        self.active_units.lock().unwrap().insert(unit.to_string());
    }

    pub fn stopped_services(&self) -> Vec<String> {
        self.stop_calls.lock().unwrap().clone()
    }

    pub fn started_services(&self) -> Vec<String> {
        self.start_calls.lock().unwrap().clone()
    }
}

impl SystemProbe for FakeProbe {
    fn available_memory_kib(&self) -> Result<u64> {
        Ok(self.memory_kib)
    }

    fn free_disk_bytes(&self, _path: &Path) -> Result<u64> {
        Ok(self.disk_bytes)
    }

    fn user_exists(&self, name: &str) -> bool {
        self.users.lock().unwrap().contains(name)
    }

    fn port_in_use(&self, port: u16) -> bool {
        self.ports.lock().unwrap().contains_key(&port)
    }

    fn path_exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn service_active(&self, unit: &str) -> bool {
        self.active_units.lock().unwrap().contains(unit)
    }

    fn stop_service(&self, unit: &str) -> Result<()> {
        self.stop_calls.lock().unwrap().push(unit.to_string());
        self.active_units.lock().unwrap().remove(unit);
        self.ports
            .lock()
            .unwrap()
            .retain(|_, owner| owner != unit);
        Ok(())
    }

    fn start_service(&self, unit: &str) -> Result<()> {
        self.start_calls.lock().unwrap().push(unit.to_string());
        self.active_units.lock().unwrap().insert(unit.to_string());
        Ok(())
    }

    fn is_root(&self) -> bool {
        self.root
    }

    fn binary_exists(&self, _name: &str) -> bool {
        self.binaries_present
    }
}
