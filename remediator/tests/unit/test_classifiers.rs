//! Backup type, rollback strategy and undo derivation tests

use remediator::backup::{classify_backup_type, extract_paths};
use remediator::models::backup::BackupType;
use remediator::models::patch::Patch;
use remediator::models::rollback::RollbackStrategy;
use remediator::rollback::packages::extract_install_packages;
use remediator::rollback::{select_strategy, synthesize_undo};

#[test]
fn test_package_content_wins_over_paths() {
    let content = "apt-get install -y nginx\ncp nginx.conf /etc/nginx/nginx.conf";
    assert_eq!(classify_backup_type(content), BackupType::Packages);
}

#[test]
fn test_config_path_only() {
    let content = "sed -i 's/worker_processes 1/worker_processes 4/' /etc/nginx/nginx.conf";
    assert_eq!(classify_backup_type(content), BackupType::Configuration);
    assert_eq!(extract_paths(content), vec!["/etc/nginx/nginx.conf"]);
}

#[test]
fn test_system_state_and_plain_files() {
    assert_eq!(
        classify_backup_type("systemctl restart nginx"),
        BackupType::SystemState
    );
    assert_eq!(classify_backup_type("echo done > ~/notes.txt"), BackupType::Files);
    assert_eq!(classify_backup_type(""), BackupType::Files);
}

#[test]
fn test_paths_are_deduplicated_in_order() {
    let content = "cp a /etc/app/a.conf\ncp b /opt/app/b.conf\nchmod 600 /etc/app/a.conf";
    assert_eq!(
        extract_paths(content),
        vec!["/etc/app/a.conf", "/opt/app/b.conf"]
    );
}

#[test]
fn test_undo_script_beats_package_content() {
    let mut patch = Patch::script("p1", "apt-get install -y openssl");
    assert_eq!(select_strategy(&patch), RollbackStrategy::PackageDowngrade);

    patch.undo_script = Some("apt-get install -y --allow-downgrades openssl=1.1".to_string());
    assert_eq!(select_strategy(&patch), RollbackStrategy::UndoScript);

    // Blank undo scripts do not count
    patch.undo_script = Some("   \n".to_string());
    assert_eq!(select_strategy(&patch), RollbackStrategy::PackageDowngrade);
}

#[test]
fn test_explicit_strategy_is_honored() {
    let mut patch = Patch::script("p1", "apt-get install -y openssl");
    patch.undo_script = Some("echo undo".to_string());
    patch.rollback_strategy = Some(RollbackStrategy::Snapshot);
    assert_eq!(select_strategy(&patch), RollbackStrategy::Snapshot);
}

#[test]
fn test_snapshot_and_file_restore_fallbacks() {
    let patch = Patch::script("p1", "take-snapshot vm-42 && echo ok");
    assert_eq!(select_strategy(&patch), RollbackStrategy::Snapshot);

    let patch = Patch::script("p2", "cp app.conf /etc/app/app.conf");
    assert_eq!(select_strategy(&patch), RollbackStrategy::FileRestore);
}

#[test]
fn test_synthesized_undo_flags_unreversible_lines() {
    let content = "systemctl stop cron\nrm -rf /var/cache/app\nsystemctl enable nginx";
    let undo = synthesize_undo(content);

    assert!(!undo.reversible);
    assert_eq!(undo.flagged, vec!["rm -rf /var/cache/app"]);
    assert_eq!(undo.commands, 2);
    assert!(undo.script.contains("# UNREVERSIBLE: rm -rf /var/cache/app"));

    // Flagged lines are comments, never commands
    let runnable: Vec<&str> = undo
        .script
        .lines()
        .filter(|l| !l.starts_with('#'))
        .collect();
    assert_eq!(runnable, vec!["systemctl disable nginx", "systemctl start cron"]);
}

#[test]
fn test_neutral_lines_need_no_undo() {
    let undo = synthesize_undo("# comment\nsystemctl restart nginx\necho patched\n");
    assert!(undo.reversible);
    assert_eq!(undo.commands, 0);
}

#[test]
fn test_install_packages_strip_versions() {
    let packages = extract_install_packages("apt-get install -y openssl=3.0.2 libssl3\napt-get install openssl");
    assert_eq!(packages, vec!["openssl", "libssl3"]);
}
