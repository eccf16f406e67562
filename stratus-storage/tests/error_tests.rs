//! Error classification and configuration validation.

use pretty_assertions::assert_eq;
use std::io;
use stratus_storage::{StorageConfig, StorageError};

// ── Status mapping ──

#[test]
fn http_statuses_map_to_typed_errors() {
    assert!(matches!(StorageError::from_status(404, "x"), StorageError::NotFound(_)));
    assert!(matches!(StorageError::from_status(409, "x"), StorageError::Conflict(_)));
    assert!(matches!(StorageError::from_status(403, "x"), StorageError::Authorization(_)));
    assert!(matches!(StorageError::from_status(401, "x"), StorageError::Authorization(_)));
    assert!(matches!(StorageError::from_status(400, "x"), StorageError::Validation(_)));
    assert!(matches!(StorageError::from_status(503, "x"), StorageError::Transport(_)));
    assert!(matches!(StorageError::from_status(429, "x"), StorageError::Transport(_)));
    assert!(matches!(StorageError::from_status(302, "x"), StorageError::Provider(_)));
}

#[test]
fn io_errors_keep_their_kind() {
    let missing = StorageError::from_io(io::Error::from(io::ErrorKind::NotFound), "/tmp/a");
    assert!(missing.is_not_found());
    assert!(missing.to_string().contains("/tmp/a"));

    let denied = StorageError::from_io(io::Error::from(io::ErrorKind::PermissionDenied), "/x");
    assert!(matches!(denied, StorageError::Authorization(_)));

    let reset = StorageError::from_io(io::Error::from(io::ErrorKind::ConnectionReset), "/x");
    assert!(reset.is_transient());
}

// ── Classification ──

#[test]
fn only_transport_errors_are_transient() {
    assert!(StorageError::Transport("t".into()).is_transient());
    assert!(!StorageError::NotFound("n".into()).is_transient());
    assert!(!StorageError::Authorization("a".into()).is_transient());
    assert!(!StorageError::Cancelled.is_transient());
}

#[test]
fn per_entry_errors_are_not_fatal() {
    for err in [
        StorageError::NotFound("n".into()),
        StorageError::Conflict("c".into()),
        StorageError::IsADirectory("d".into()),
        StorageError::NotADirectory("d".into()),
        StorageError::Validation("v".into()),
        StorageError::Authorization("a".into()),
        StorageError::Credential("c".into()),
    ] {
        assert!(!err.is_fatal(), "{err}");
    }
    for err in [StorageError::Transport("t".into()), StorageError::Cancelled] {
        assert!(err.is_fatal(), "{err}");
    }
}

// ── Config ──

#[test]
fn default_and_test_configs_validate() {
    StorageConfig::default().validate().unwrap();
    StorageConfig::test().validate().unwrap();
}

#[test]
fn partial_config_fills_defaults() {
    let config: StorageConfig =
        serde_json::from_str(r#"{ "retry_attempts": 4, "chunk_size": 1024 }"#).unwrap();
    assert_eq!(config.retry_attempts, 4);
    assert_eq!(config.chunk_size, 1024);
    assert_eq!(config.max_open_handles, StorageConfig::default().max_open_handles);
    config.validate().unwrap();
}

#[test]
fn invalid_sizes_are_rejected() {
    let bad_chunk = StorageConfig {
        gcs_chunk_size: 1000,
        ..StorageConfig::default()
    };
    assert!(matches!(bad_chunk.validate(), Err(StorageError::Config(_))));

    let tiny_parts = StorageConfig {
        s3_part_size: 1024,
        ..StorageConfig::default()
    };
    assert!(matches!(tiny_parts.validate(), Err(StorageError::Config(_))));

    let no_retries = StorageConfig {
        retry_attempts: 0,
        ..StorageConfig::default()
    };
    assert!(no_retries.validate().is_err());
}
