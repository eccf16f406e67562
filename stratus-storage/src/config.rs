//! Storage layer configuration.

use crate::error::{StorageError, StorageResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Smallest part S3 accepts for all but the last part of a multipart upload.
pub const S3_MIN_PART_SIZE: usize = 5 * 1024 * 1024;

/// GCS resumable chunks must be multiples of this size.
pub const GCS_CHUNK_GRANULARITY: usize = 256 * 1024;

/// Configuration for the storage layer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Concurrent open handles across one transfer engine.
    pub max_open_handles: usize,

    /// Concurrent open files in the local adapter.
    pub local_max_open_files: usize,

    /// Read chunk size for streamed bodies.
    pub chunk_size: usize,

    /// Attempts per logical operation before a transient failure surfaces.
    pub retry_attempts: u32,

    /// Linear backoff step between attempts (milliseconds).
    pub retry_delay_ms: u64,

    pub connect_timeout_secs: u64,

    /// Body inactivity timeout; large bodies have no total timeout.
    pub read_timeout_secs: u64,

    /// Whole-request timeout applied to metadata calls only.
    pub request_timeout_secs: u64,

    /// Credential refresh margin in seconds (refresh before expiry).
    pub credential_refresh_margin_secs: i64,

    pub s3_part_size: usize,

    pub azure_block_size: usize,

    /// Bytes batched before each resumable-upload PUT.
    pub gcs_chunk_size: usize,

    /// Page size requested from listing endpoints.
    pub list_page_size: usize,

    /// Tolerance for backends that truncate modification times to seconds.
    pub mtime_tolerance_secs: f64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            max_open_handles: 20,
            local_max_open_files: 20,
            chunk_size: 256 * 1024,
            retry_attempts: 10,
            retry_delay_ms: 100,
            connect_timeout_secs: 30,
            read_timeout_secs: 300,
            request_timeout_secs: 60,
            credential_refresh_margin_secs: 60,
            s3_part_size: 8 * 1024 * 1024,
            azure_block_size: 4 * 1024 * 1024,
            gcs_chunk_size: 8 * 1024 * 1024,
            list_page_size: 1000,
            mtime_tolerance_secs: 1.0,
        }
    }
}

impl StorageConfig {
    /// Creates a config with small buffers and no retry delay, for tests.
    pub fn test() -> Self {
        Self {
            chunk_size: 4 * 1024,
            retry_attempts: 3,
            retry_delay_ms: 0,
            connect_timeout_secs: 5,
            read_timeout_secs: 10,
            request_timeout_secs: 10,
            gcs_chunk_size: GCS_CHUNK_GRANULARITY,
            azure_block_size: 64 * 1024,
            list_page_size: 2,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> StorageResult<()> {
        if self.max_open_handles == 0 || self.local_max_open_files == 0 {
            return Err(StorageError::Config(
                "handle pools must allow at least one open handle".to_string(),
            ));
        }
        if self.chunk_size == 0 {
            return Err(StorageError::Config("chunk_size must be positive".to_string()));
        }
        if self.retry_attempts == 0 {
            return Err(StorageError::Config("retry_attempts must be positive".to_string()));
        }
        if self.s3_part_size < S3_MIN_PART_SIZE {
            return Err(StorageError::Config(format!(
                "s3_part_size must be at least {S3_MIN_PART_SIZE} bytes"
            )));
        }
        if self.gcs_chunk_size == 0 || self.gcs_chunk_size % GCS_CHUNK_GRANULARITY != 0 {
            return Err(StorageError::Config(format!(
                "gcs_chunk_size must be a positive multiple of {GCS_CHUNK_GRANULARITY}"
            )));
        }
        if self.azure_block_size == 0 || self.list_page_size == 0 {
            return Err(StorageError::Config(
                "block and page sizes must be positive".to_string(),
            ));
        }
        if self.mtime_tolerance_secs < 0.0 {
            return Err(StorageError::Config(
                "mtime_tolerance_secs must not be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}
