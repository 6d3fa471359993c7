/*!
Tests for the error taxonomy and its user-facing messages.
*/

#[cfg(test)]
mod tests {
    use crate::error::VaultError;
    use crate::record::{BackupId, BackupStatus};
    use std::error::Error as _;
    use std::io;
    use std::path::PathBuf;
    use std::time::Duration;

    fn degraded() -> VaultError {
        VaultError::Degraded {
            target: BackupId(7),
            safety_backup_id: BackupId(12),
            source: Box::new(VaultError::ExternalToolFailed {
                tool: "restore".to_string(),
                code: Some(1),
                output: "ERROR 2013: Lost connection".to_string(),
            }),
        }
    }

    #[test]
    fn test_degraded_message_is_verbatim() {
        let error = degraded();
        assert_eq!(
            error.restore_failure_message(),
            "restore did not complete cleanly — recover from backup #12"
        );
        assert_eq!(error.to_string(), error.restore_failure_message());
        assert_eq!(error.safety_backup_id(), Some(BackupId(12)));
        assert!(error.is_degraded());
        assert!(!error.is_retryable());
    }

    #[test]
    fn test_degraded_keeps_tool_diagnostic_as_source() {
        let error = degraded();
        let source = error.source().expect("degraded carries its cause");
        assert!(source.to_string().contains("Lost connection"));
        assert!(source.to_string().contains("exit code 1"));
    }

    #[test]
    fn test_aborted_message() {
        let error = VaultError::ChecksumMismatch {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };
        let message = error.restore_failure_message();
        assert!(message.starts_with("restore aborted, no changes made: "));
        assert!(message.contains("abc123"));
        assert!(message.contains("def456"));
        assert_eq!(error.safety_backup_id(), None);
    }

    #[test]
    fn test_create_failure_message_carries_diagnostic() {
        let error = VaultError::ExternalToolFailed {
            tool: "dump".to_string(),
            code: Some(2),
            output: "mysqldump: Got error: 1049: Unknown database 'shop'".to_string(),
        };
        let message = error.create_failure_message();
        assert!(message.starts_with("backup not created: "));
        assert!(message.contains("Unknown database"));
    }

    #[test]
    fn test_taxonomy_retryability() {
        let retryable = vec![
            VaultError::NotFound(BackupId(1)),
            VaultError::ArtifactMissing {
                id: BackupId(1),
                path: PathBuf::from("/var/backups/artifacts/x.sql.gz"),
            },
            VaultError::ChecksumMismatch {
                expected: "a".to_string(),
                actual: "b".to_string(),
            },
            VaultError::Busy { holder: None },
            VaultError::ExternalToolFailed {
                tool: "dump".to_string(),
                code: None,
                output: String::new(),
            },
            VaultError::Timeout {
                tool: "dump".to_string(),
                after: Duration::from_secs(60),
            },
            VaultError::SafetyBackupFailed(Box::new(VaultError::EmptyExport)),
            VaultError::staging("disk full"),
        ];
        for error in retryable {
            assert!(error.is_retryable(), "{error} should be retryable");
            assert!(!error.is_degraded());
        }

        assert!(!VaultError::validation("bad prefix").is_retryable());
        assert!(!VaultError::InvalidTransition {
            id: BackupId(1),
            from: BackupStatus::Failed,
            to: BackupStatus::Completed,
        }
        .is_retryable());
    }

    #[test]
    fn test_busy_display() {
        assert_eq!(
            VaultError::Busy {
                holder: Some(BackupId(3))
            }
            .to_string(),
            "restore lock is held by backup #3"
        );
        assert_eq!(VaultError::Busy { holder: None }.to_string(), "restore lock is held");
        assert!(VaultError::Busy { holder: None }.is_busy());
    }

    #[test]
    fn test_only_busy_is_transient_for_retry() {
        use divevault_retry::{RetryError, RetryableError};

        assert!(VaultError::Busy { holder: None }.is_transient());
        assert!(degraded().is_permanent());
        assert!(VaultError::NotFound(BackupId(1)).is_permanent());

        let wrapped = RetryError::classify("restore", degraded());
        let source = wrapped.into_source();
        let inner = source.downcast_ref::<VaultError>().unwrap();
        assert_eq!(inner.safety_backup_id(), Some(BackupId(12)));
    }

    #[test]
    fn test_timeout_display() {
        let error = VaultError::Timeout {
            tool: "restore".to_string(),
            after: Duration::from_secs(90),
        };
        assert_eq!(error.to_string(), "restore timed out after 90s");
    }

    #[test]
    fn test_error_from_io_error() {
        let root_cause = io::Error::new(io::ErrorKind::PermissionDenied, "Access denied");
        match VaultError::from(root_cause) {
            VaultError::Io(ref io_err) => {
                assert_eq!(io_err.kind(), io::ErrorKind::PermissionDenied);
            }
            other => panic!("Expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn test_error_from_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert!(matches!(VaultError::from(json_error), VaultError::Json(_)));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<VaultError>();
        assert_sync::<VaultError>();
    }
}
