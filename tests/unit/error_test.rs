//! Tests for error types

use prometheus_jobservice::core::{ErrorKind, JobServiceError, Status};

#[test]
fn test_bad_request_error() {
    let err = JobServiceError::BadRequest("empty job name".to_string());
    assert_eq!(format!("{err}"), "bad request: empty job name");
    assert_eq!(err.kind(), ErrorKind::BadRequest);
}

#[test]
fn test_not_found_error() {
    let err = JobServiceError::NotFound("job abc".to_string());
    assert_eq!(format!("{err}"), "not found: job abc");
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn test_conflict_error() {
    let err = JobServiceError::Conflict("duplicate".to_string());
    assert_eq!(err.kind(), ErrorKind::Conflict);
}

#[test]
fn test_status_mismatch_error() {
    let err = JobServiceError::StatusMismatch {
        current: Status::Success,
        target: Status::Running,
    };
    assert_eq!(
        format!("{err}"),
        "status mismatch: current status Success does not accept Running"
    );
    assert!(err.is_status_mismatch());
    assert_eq!(err.kind(), ErrorKind::Internal);
}

#[test]
fn test_backend_error() {
    let err = JobServiceError::Backend("connection refused".to_string());
    assert_eq!(format!("{err}"), "backend error: connection refused");
    assert_eq!(err.kind(), ErrorKind::Internal);
}

#[test]
fn test_serialization_error_from_serde() {
    let serde_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
    let err: JobServiceError = serde_err.into();
    assert!(format!("{err}").starts_with("serialization error:"));
    assert_eq!(err.kind(), ErrorKind::Internal);
}
