//! Integration tests for archive creation and retention
//!
//! These run the real tar pipeline against staged directories and verify:
//! - Archive + metadata pairing and atomic naming
//! - FIFO eviction at the retention cap
//! - The archive actually restores the captured bytes

use std::fs;
use std::process::Command;
use tempfile::TempDir;

use mailrice_deploy::{BackupManager, DeployConfig, FakeProbe, RunLogger};

fn test_config(root: &TempDir) -> DeployConfig {
    let mut config = DeployConfig {
        domain: "example.com".to_string(),
        hostname: "mail.example.com".to_string(),
        ..DeployConfig::default()
    };
    config.backup_dir = root.path().join("backups");
    config.paths.postfix_config = root.path().join("etc/postfix");
    config.paths.dovecot_config = root.path().join("etc/dovecot");
    config.paths.postgres_config = root.path().join("etc/postgresql");
    config.paths.opendkim_config = root.path().join("etc/opendkim");
    config.paths.nginx_sites = root.path().join("etc/nginx-sites");
    config.paths.vmail_root = root.path().join("vmail");
    config
}

fn stage_install(config: &DeployConfig) {
    fs::create_dir_all(&config.paths.postfix_config).unwrap();
    fs::write(config.paths.postfix_config.join("main.cf"), "mydomain = example.com\n").unwrap();
    fs::create_dir_all(&config.paths.vmail_root).unwrap();
    fs::write(config.paths.vmail_root.join("inbox"), "mail bytes").unwrap();
}

fn manager(config: &DeployConfig) -> BackupManager {
    let (logger, _) = RunLogger::memory();
    BackupManager::new(config, logger)
}

#[test]
fn maybe_backup_pairs_archive_with_metadata() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    stage_install(&config);
    let probe = FakeProbe::healthy();

    let backup = manager(&config)
        .maybe_backup(&probe)
        .unwrap()
        .expect("existing install should be archived");

    assert!(backup.archive_path.exists());
    let meta_path = config
        .backup_dir
        .join(format!("{}.meta.json", backup.id()));
    assert!(meta_path.exists());

    // Metadata round-trips through JSON with the target identity intact
    let meta: mailrice_deploy::BackupMetadata =
        serde_json::from_str(&fs::read_to_string(&meta_path).unwrap()).unwrap();
    assert_eq!(meta.id, backup.id());
    assert_eq!(meta.domain, "example.com");
    assert_eq!(meta.hostname, "mail.example.com");
    assert_eq!(meta.manifest.len(), 2);
    assert!(meta.restore_steps.iter().any(|s| s.contains("tar -xzf")));
}

#[test]
fn sixth_backup_evicts_the_oldest() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    stage_install(&config);
    let probe = FakeProbe::healthy();
    let manager = manager(&config);

    // maybe_backup prunes after each creation, so the cap holds throughout
    let mut ids = Vec::new();
    for _ in 0..6 {
        let backup = manager.maybe_backup(&probe).unwrap().unwrap();
        ids.push(backup.id().to_string());
    }

    let remaining = manager.list().unwrap();
    assert_eq!(remaining.len(), 5);

    let remaining_ids: Vec<&str> = remaining.iter().map(|b| b.id()).collect();
    // The five most recent survive; the very first creation is gone
    for id in &ids[1..] {
        assert!(remaining_ids.contains(&id.as_str()), "{} should survive", id);
    }
    assert!(!remaining_ids.contains(&ids[0].as_str()), "{} should be evicted", ids[0]);
}

#[test]
fn archive_restores_captured_bytes() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    stage_install(&config);
    let probe = FakeProbe::healthy();

    let backup = manager(&config).maybe_backup(&probe).unwrap().unwrap();

    // Clobber and delete, then extract the archive the way rollback does
    fs::write(config.paths.postfix_config.join("main.cf"), "clobbered").unwrap();
    fs::remove_file(config.paths.vmail_root.join("inbox")).unwrap();

    let status = Command::new("tar")
        .arg("-xzf")
        .arg(&backup.archive_path)
        .arg("-C")
        .arg("/")
        .status()
        .unwrap();
    assert!(status.success());

    assert_eq!(
        fs::read_to_string(config.paths.postfix_config.join("main.cf")).unwrap(),
        "mydomain = example.com\n"
    );
    assert_eq!(
        fs::read_to_string(config.paths.vmail_root.join("inbox")).unwrap(),
        "mail bytes"
    );
}

#[test]
fn clean_target_is_never_archived() {
    let root = TempDir::new().unwrap();
    let config = test_config(&root);
    let probe = FakeProbe::healthy();

    let backup = manager(&config).maybe_backup(&probe).unwrap();
    assert!(backup.is_none());
    assert!(!config.backup_dir.exists() || fs::read_dir(&config.backup_dir).unwrap().count() == 0);
}
