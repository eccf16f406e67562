//! Bucket providers: one strategy per third-party object store.
//!
//! Every provider normalizes its backend's pagination into a lazy
//! [`BlobStream`], reports `NotFound` as a typed condition, renews
//! credentials through a shared [`CredentialManager`](crate::CredentialManager)
//! and folds response `Date` headers into its own clock-skew estimate.

mod azure;
mod gcs;
mod glob;
mod memory;
mod registry;
mod s3;

pub use azure::AzureProvider;
pub use gcs::GcsProvider;
pub use glob::glob_blobs;
pub use memory::{MemoryProvider, ProviderCall};
pub use registry::{ProviderFactory, ProviderRegistry};
pub use s3::S3Provider;

use crate::error::StorageResult;
use crate::types::{BlobEntry, BlobStream, Bucket, ByteStream};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::{StreamExt, stream};

/// Payload for [`BucketProvider::put_blob`].
pub enum BlobBody {
    /// A fixed buffer of known length.
    Bytes(Bytes),
    /// Chunks delivered incrementally; total length unknown up front.
    Stream(ByteStream),
}

impl BlobBody {
    pub fn into_stream(self) -> ByteStream {
        match self {
            BlobBody::Bytes(bytes) => stream::once(async move { Ok(bytes) }).boxed(),
            BlobBody::Stream(stream) => stream,
        }
    }
}

impl From<Bytes> for BlobBody {
    fn from(bytes: Bytes) -> Self {
        BlobBody::Bytes(bytes)
    }
}

impl From<Vec<u8>> for BlobBody {
    fn from(bytes: Vec<u8>) -> Self {
        BlobBody::Bytes(Bytes::from(bytes))
    }
}

impl From<ByteStream> for BlobBody {
    fn from(stream: ByteStream) -> Self {
        BlobBody::Stream(stream)
    }
}

#[async_trait]
pub trait BucketProvider: Send + Sync {
    fn bucket(&self) -> &Bucket;

    /// `(min, max)` estimate of `server_time - client_time` in seconds.
    fn clock_skew(&self) -> (f64, f64);

    /// Lists keys under `prefix`. Non-recursive listings fold deeper keys
    /// into [`BlobEntry::CommonPrefix`] entries. At most `limit` entries are
    /// produced when set.
    fn list_blobs<'a>(
        &'a self,
        prefix: &'a str,
        recursive: bool,
        limit: Option<usize>,
    ) -> BlobStream<'a>;

    /// Fails with `NotFound` if the key does not exist.
    async fn head_blob(&self, key: &str) -> StorageResult<BlobEntry>;

    /// Stores `body` under `key`, replacing any existing object. Returns the
    /// number of bytes stored.
    async fn put_blob(&self, key: &str, body: BlobBody) -> StorageResult<u64>;

    async fn fetch_blob(&self, key: &str, offset: u64) -> StorageResult<ByteStream>;

    async fn delete_blob(&self, key: &str) -> StorageResult<()>;
}

/// Applies an optional result cap to a listing.
pub(crate) fn capped(listing: BlobStream<'_>, limit: Option<usize>) -> BlobStream<'_> {
    match limit {
        Some(limit) => listing.take(limit).boxed(),
        None => listing,
    }
}

/// Pulls chunks from `body` until at least `threshold` bytes are buffered
/// or the body ends. Returns `false` if the body ended first.
pub(crate) async fn fill_buffer(
    body: &mut ByteStream,
    buffer: &mut BytesMut,
    threshold: usize,
) -> StorageResult<bool> {
    while buffer.len() < threshold {
        match body.next().await {
            Some(chunk) => buffer.extend_from_slice(&chunk?),
            None => return Ok(false),
        }
    }
    Ok(true)
}
