//! Tests for error types

use std::path::PathBuf;

use perfex::{Error, ErrorKind};

#[test]
fn test_invalid_operand_error() {
    let error = Error::InvalidOperand("missing -f".to_string());
    let error_str = format!("{error}");
    assert!(error_str.contains("Invalid operand"));
    assert!(error_str.contains("missing -f"));
    assert_eq!(error.kind(), ErrorKind::UserError);
}

#[test]
fn test_experiment_not_found_error() {
    let error = Error::ExperimentNotFound(12);
    assert_eq!(format!("{error}"), "There is no experiment with identifier 12");
    assert_eq!(error.kind(), ErrorKind::UserError);
}

#[test]
fn test_store_errors_are_store_unavailable() {
    let error = Error::StoreUnavailable("no space left".to_string());
    assert!(format!("{error}").contains("no space left"));
    assert_eq!(error.kind(), ErrorKind::StoreUnavailable);

    let sqlite: Error = rusqlite::Error::InvalidQuery.into();
    assert_eq!(sqlite.kind(), ErrorKind::StoreUnavailable);
}

#[test]
fn test_redirect_error_keeps_source() {
    let error = Error::Redirect {
        path: PathBuf::from("/root/forbidden.txt"),
        source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
    };
    assert_eq!(format!("{error}"), "Could not open file /root/forbidden.txt");
    assert!(std::error::Error::source(&error).is_some());
    assert_eq!(error.kind(), ErrorKind::UserError);
}

#[test]
fn test_aborted_error() {
    let error = Error::Aborted;
    assert_eq!(format!("{error}"), "Command aborted");
    assert_eq!(error.kind(), ErrorKind::Aborted);
}

#[test]
fn test_backend_and_queue_errors() {
    let error = Error::Backend("attach refused".to_string());
    assert!(format!("{error}").contains("attach refused"));
    assert_eq!(error.kind(), ErrorKind::UserError);

    assert!(format!("{}", Error::QueueClosed).contains("Ingestion queue closed"));
    assert!(format!("{}", Error::ShutDown).contains("shut down"));
}

#[test]
fn test_config_error() {
    let error = Error::Config("max_workers must be at least 1".to_string());
    assert!(format!("{error}").contains("Configuration error"));
}

#[test]
fn test_io_error_from() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
    let error: Error = io_error.into();
    let error_str = format!("{error}");
    assert!(error_str.contains("IO error"));
    assert!(error_str.contains("file not found"));
}

#[test]
fn test_other_error() {
    let error = Error::Other("custom error message".to_string());
    assert_eq!(format!("{error}"), "custom error message");
}
