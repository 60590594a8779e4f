/*!
Tests for error types and their classification.
*/

#[cfg(test)]
mod tests {
    use crate::error::PersistError;
    use crate::memento::{MementoKind, MementoRef};
    use crate::rebind::{RebindProblem, RebindReport};
    use memento_retry::Retryable;
    use std::io;
    use std::time::Duration;

    #[test]
    fn test_persist_error_display() {
        let error = PersistError::invalid_state("builder already consumed");
        assert_eq!(error.to_string(), "Invalid state: builder already consumed");

        let error = PersistError::compression("test compression error");
        assert_eq!(error.to_string(), "Compression error: test compression error");

        let error = PersistError::persistence("disk full");
        assert_eq!(error.to_string(), "Persistence failure: disk full");
    }

    #[test]
    fn test_persist_error_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let persist_error = PersistError::from(io_error);

        match persist_error {
            PersistError::Io(_) => {}
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_persist_error_from_json_error() {
        let json_error = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let persist_error = PersistError::from(json_error);

        match persist_error {
            PersistError::Json(_) => {}
            _ => panic!("Expected Json error variant"),
        }
    }

    #[test]
    fn test_integrity_check_failed_error() {
        let error = PersistError::IntegrityCheckFailed {
            expected: "abc123".to_string(),
            actual: "def456".to_string(),
        };

        assert!(error.to_string().contains("abc123"));
        assert!(error.to_string().contains("def456"));
    }

    #[test]
    fn test_not_serializable_names_memento() {
        let error = PersistError::not_serializable(
            MementoKind::Location,
            "l1",
            "field 'config.ratio' holds a non-finite float",
        );
        assert_eq!(
            error.to_string(),
            "location 'l1' is not serializable: field 'config.ratio' holds a non-finite float"
        );
    }

    #[test]
    fn test_unresolved_reference_lists_missing_ids() {
        let mut report = RebindReport::default();
        report.push(
            MementoRef::entity("e1"),
            RebindProblem::UnresolvedReference {
                relation: "children".to_string(),
                target: MementoRef::entity("e2"),
            },
        );
        let error = PersistError::UnresolvedReference(report);

        let message = error.to_string();
        assert!(message.starts_with("Unresolved references: 1 issue(s)"));
        assert!(message.contains("entity 'e1'"));
        assert!(message.contains("entity 'e2'"));
    }

    #[test]
    fn test_timeout_reports_pending_writes() {
        let error = PersistError::Timeout {
            pending: 3,
            waited: Duration::from_millis(250),
        };
        assert!(error.to_string().contains("3 write(s) outstanding"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<PersistError>();
        assert_sync::<PersistError>();
    }

    #[test]
    fn test_transient_classification() {
        assert!(PersistError::persistence("connection reset").is_transient());
        assert!(PersistError::Timeout {
            pending: 1,
            waited: Duration::from_secs(1)
        }
        .is_transient());
        assert!(PersistError::Io(io::Error::new(io::ErrorKind::Other, "test")).is_transient());

        assert!(!PersistError::invalid_format("bad record").is_transient());
        assert!(!PersistError::IntegrityCheckFailed {
            expected: "a".to_string(),
            actual: "b".to_string(),
        }
        .is_transient());
        assert!(!PersistError::UnresolvedReference(RebindReport::default()).is_transient());

        let error = PersistError::persistence("flaky");
        assert!(Retryable::is_transient(&error));
    }

    #[test]
    fn test_error_result_type() {
        fn returns_error() -> crate::Result<()> {
            Err(PersistError::invalid_state("test error"))
        }

        assert!(returns_error().is_err());
    }
}
