/*!
End-to-end backup, restore and retention scenarios through `BackupVault`.
*/

mod common;

use std::thread;
use std::time::Duration;

use common::{Harness, RestoreMode};
use divevault_core::{BackupKind, BackupStatus, RestoreState, VaultError};

#[test]
fn test_manual_backup_of_ten_megabytes() {
    let h = Harness::new();
    let row = "INSERT INTO dives VALUES (42, 'Blue Hole', 'Dahab', 31.5);\n";
    h.write_live(&row.repeat(10 * 1024 * 1024 / row.len()));

    let record = h.vault.create_backup(BackupKind::Manual, Some("alice")).unwrap();

    assert_eq!(record.status, BackupStatus::Completed);
    assert_eq!(record.created_by.as_deref(), Some("alice"));
    assert!(record.size_bytes.unwrap() > 0);
    // Highly repetitive dumps compress well
    assert!(record.size_bytes.unwrap() < 1024 * 1024);
    assert_eq!(record.checksum.as_ref().map(String::len), Some(64));
    assert!(record.filename.starts_with("backup_manual_"));
    assert!(record.filename.ends_with(".sql.gz"));
    assert!(record.storage_path.exists());
}

#[test]
fn test_dump_failure_records_tool_output() {
    let h = Harness::new();
    h.dump.fail_with(1, "mysqldump: Got error: 1045: Access denied for user 'backup'");

    let err = h.vault.create_backup(BackupKind::Manual, Some("alice")).unwrap_err();
    assert!(err.create_failure_message().contains("Access denied"));

    let record = h.vault.list_backups(None).unwrap().remove(0);
    assert_eq!(record.status, BackupStatus::Failed);
    assert!(record.error_message.unwrap().contains("Access denied"));
    assert!(!record.storage_path.exists());
    assert!(h.artifacts().is_empty());
}

#[test]
fn test_corrupted_artifact_aborts_before_safety_backup() {
    let h = Harness::new();
    let target = h.vault.create_backup(BackupKind::Manual, None).unwrap();
    let mut bytes = std::fs::read(&target.storage_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&target.storage_path, bytes).unwrap();

    let err = h.vault.restore_backup(target.id, Some("bob")).unwrap_err();
    assert!(matches!(err, VaultError::ChecksumMismatch { .. }));
    assert!(h
        .vault
        .list_backups(Some(BackupKind::PreRestore))
        .unwrap()
        .is_empty());
    assert_eq!(h.vault.get_backup(target.id).unwrap().status, BackupStatus::Completed);

    let history = h.vault.restore_history(Some(target.id)).unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, RestoreState::Aborted);
    assert_eq!(history[0].safety_backup, None);
    assert_eq!(history[0].actor.as_deref(), Some("bob"));
}

#[test]
fn test_successful_restore_end_to_end() {
    let h = Harness::new();
    let target = h.vault.create_backup(BackupKind::Manual, None).unwrap();
    h.write_live("INSERT INTO dives VALUES (7, 'Shark and Yolanda');\n");

    let outcome = h.vault.restore_backup(target.id, Some("alice")).unwrap();

    assert_eq!(outcome.state, RestoreState::Finalized);
    assert_eq!(
        h.live_contents(),
        b"INSERT INTO dives VALUES (1, 'Blue Hole');\n".to_vec()
    );
    let restored = h.vault.get_backup(target.id).unwrap();
    assert_eq!(restored.status, BackupStatus::Restored);
    assert_eq!(restored.restored_at, Some(outcome.restored_at));

    let safety = h.vault.get_backup(outcome.safety_backup_id).unwrap();
    assert_eq!(safety.kind, BackupKind::PreRestore);
    assert_eq!(safety.created_by.as_deref(), Some("alice"));

    // Staging is cleaned up once the restore is finalized
    let staged = std::fs::read_dir(h.vault.store().staging_dir()).unwrap().count();
    assert_eq!(staged, 0);

    let history = h.vault.restore_history(None).unwrap();
    assert_eq!(history[0].state, RestoreState::Finalized);
    assert_eq!(history[0].safety_backup, Some(outcome.safety_backup_id));
}

#[test]
fn test_prune_keeps_most_recent_five() {
    let h = Harness::new();
    let mut created = Vec::new();
    for _ in 0..8 {
        created.push(h.vault.create_backup(BackupKind::Automatic, None).unwrap());
    }
    let manual = h.vault.create_backup(BackupKind::Manual, None).unwrap();

    assert_eq!(h.vault.prune(BackupKind::Automatic, 5).unwrap(), 3);

    for old in &created[..3] {
        let record = h.vault.get_backup(old.id).unwrap();
        assert_eq!(record.status, BackupStatus::Deleted);
        assert!(record.deleted_at.is_some());
        assert!(!record.storage_path.exists());
    }
    for recent in &created[3..] {
        assert_eq!(h.vault.get_backup(recent.id).unwrap().status, BackupStatus::Completed);
    }
    assert_eq!(h.vault.get_backup(manual.id).unwrap().status, BackupStatus::Completed);
}

#[test]
fn test_simultaneous_restores_one_is_busy() {
    let h = Harness::new();
    let target = h.vault.create_backup(BackupKind::Manual, None).unwrap();
    h.restore.set_delay(Duration::from_millis(400));

    let vault = h.vault.clone();
    let first = thread::spawn(move || vault.restore_backup(target.id, Some("alice")));
    thread::sleep(Duration::from_millis(150));
    let second = h.vault.restore_backup(target.id, Some("bob"));

    assert!(matches!(second, Err(VaultError::Busy { holder: Some(id) }) if id == target.id));
    assert!(first.join().unwrap().is_ok());

    let states: Vec<_> = h
        .vault
        .restore_history(Some(target.id))
        .unwrap()
        .into_iter()
        .map(|e| e.state)
        .collect();
    assert!(states.contains(&RestoreState::Finalized));
    assert!(states.contains(&RestoreState::Aborted));
}

#[test]
fn test_interrupted_restore_is_degraded_and_recoverable() {
    let h = Harness::new();
    let target = h.vault.create_backup(BackupKind::Manual, None).unwrap();
    h.write_live("INSERT INTO dives VALUES (12, 'Thistlegorm');\n");
    let before = h.live_contents();

    h.restore.set_mode(RestoreMode::FailMidway);
    let err = h.vault.restore_backup(target.id, None).unwrap_err();

    let safety_id = err.safety_backup_id().unwrap();
    assert!(err.is_degraded());
    assert_eq!(
        err.restore_failure_message(),
        format!("restore did not complete cleanly — recover from backup #{safety_id}")
    );
    // Target is untouched by a failed restore
    assert_eq!(h.vault.get_backup(target.id).unwrap().status, BackupStatus::Completed);
    let event = h.vault.restore_history(Some(target.id)).unwrap().remove(0);
    assert_eq!(event.state, RestoreState::Degraded);
    assert!(event.error_message.unwrap().contains("Lost connection"));

    h.restore.set_mode(RestoreMode::Apply);
    h.vault.restore_backup(safety_id, Some("ops")).unwrap();
    assert_eq!(h.live_contents(), before);
}

#[test]
fn test_empty_export_is_refused() {
    let h = Harness::new();
    h.write_live("");

    let err = h.vault.create_backup(BackupKind::Manual, None).unwrap_err();
    assert!(matches!(err, VaultError::EmptyExport));
    assert_eq!(h.vault.list_backups(None).unwrap()[0].status, BackupStatus::Failed);
    assert!(h.artifacts().is_empty());
}

#[test]
fn test_failed_probe_degrades_restore() {
    let h = Harness::new();
    let target = h.vault.create_backup(BackupKind::Manual, None).unwrap();

    h.restore.set_mode(RestoreMode::ApplyThenCrash);
    let err = h.vault.restore_backup(target.id, None).unwrap_err();

    assert!(err.is_degraded());
    assert!(err.safety_backup_id().is_some());
    let event = h.vault.restore_history(None).unwrap().remove(0);
    assert_eq!(event.state, RestoreState::Degraded);
    assert!(event.error_message.unwrap().contains("store is empty"));
}

#[test]
fn test_delete_and_restore_interplay() {
    let h = Harness::new();
    let target = h.vault.create_backup(BackupKind::Manual, None).unwrap();
    h.restore.set_delay(Duration::from_millis(400));

    let vault = h.vault.clone();
    let restoring = thread::spawn(move || vault.restore_backup(target.id, None));
    thread::sleep(Duration::from_millis(150));

    let err = h.vault.delete_backup(target.id).unwrap_err();
    assert!(err.is_busy());
    // Prune skips the held backup rather than failing
    assert_eq!(h.vault.prune(BackupKind::Manual, 0).unwrap(), 0);
    restoring.join().unwrap().unwrap();

    let deleted = h.vault.delete_backup(target.id).unwrap();
    assert_eq!(deleted.status, BackupStatus::Deleted);
    let err = h.vault.restore_backup(target.id, None).unwrap_err();
    assert!(matches!(err, VaultError::NotRestorable { .. }));
    assert!(matches!(
        h.vault.delete_backup(target.id),
        Err(VaultError::InvalidTransition { .. })
    ));
}

#[test]
fn test_age_based_retention() {
    let h = Harness::new();
    let old = h.vault.create_backup(BackupKind::Automatic, None).unwrap();
    let old_manual = h.vault.create_backup(BackupKind::Manual, None).unwrap();
    h.clock.advance(chrono::Duration::days(40));
    let fresh = h.vault.create_backup(BackupKind::Automatic, None).unwrap();

    let deleted = h
        .vault
        .prune_older_than(Some(BackupKind::Automatic), chrono::Duration::days(30))
        .unwrap();
    assert_eq!(deleted, 1);
    assert_eq!(h.vault.get_backup(old.id).unwrap().status, BackupStatus::Deleted);
    assert_eq!(h.vault.get_backup(old_manual.id).unwrap().status, BackupStatus::Completed);
    assert_eq!(h.vault.get_backup(fresh.id).unwrap().status, BackupStatus::Completed);

    assert_eq!(
        h.vault
            .prune_older_than(None, chrono::Duration::days(30))
            .unwrap(),
        1
    );
}

#[test]
fn test_verify_and_export() {
    let h = Harness::new();
    let backup = h.vault.create_backup(BackupKind::Manual, None).unwrap();
    assert_eq!(h.vault.verify_backup(backup.id).unwrap().id, backup.id);

    let dest = h.dir.path().join("download.sql.gz");
    let written = h.vault.export_backup(backup.id, &dest).unwrap();
    assert_eq!(Some(written), backup.size_bytes);

    std::fs::remove_file(&backup.storage_path).unwrap();
    assert!(matches!(
        h.vault.verify_backup(backup.id),
        Err(VaultError::ArtifactMissing { .. })
    ));
}

#[cfg(feature = "async-rt")]
mod async_workers {
    use super::*;

    #[tokio::test]
    async fn test_spawned_create_and_restore() {
        let h = Harness::new();
        let record = h
            .vault
            .spawn_create(BackupKind::Manual, Some("alice".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.status, BackupStatus::Completed);

        let outcome = h
            .vault
            .spawn_restore(record.id, Some("alice".to_string()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome.target, record.id);
        assert_eq!(outcome.state, RestoreState::Finalized);
    }
}
