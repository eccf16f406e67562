//! Storage layer for Stratus.
//!
//! Moves file trees between the local disk, the platform's own storage and
//! third-party buckets:
//! - Transfer engine with resume/skip decisions and bounded concurrency
//! - Filesystem adapters for local, platform and bucket backends
//! - S3-compatible, Azure and GCS bucket providers with credential refresh
//! - Clock-skew estimation for timestamp comparisons across servers
//! - Ordered progress reporting and progress-aware retries

pub mod clock_skew;
pub mod collaborators;
pub mod config;
pub mod credential_manager;
pub mod error;
pub mod fs;
pub mod http;
pub mod progress;
pub mod provider;
pub mod retry;
pub mod storage;
pub mod transfer;
pub mod types;

pub use clock_skew::ClockSkew;
pub use collaborators::{BearerTokenSigner, ClusterResolver, CredentialIssuer, RequestSigner};
pub use config::StorageConfig;
pub use credential_manager::CredentialManager;
pub use error::{StorageError, StorageResult};
pub use fs::{BucketFs, FileSystem, LocalFs, PlatformFs};
pub use progress::{NoopProgress, ProgressReporter, ProgressSink, run_with_progress};
pub use provider::{BlobBody, BucketProvider, MemoryProvider, ProviderRegistry, glob_blobs};
pub use retry::{RetryPolicy, RetrySignal, retry};
pub use storage::{RemoteUri, Storage};
pub use transfer::{
    FileOutcome, ResumeDecision, TransferEngine, TransferOptions, TransferSummary,
    resume_decision,
};
pub use types::*;
