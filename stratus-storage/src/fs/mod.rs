//! Filesystem capability abstraction.
//!
//! One sync algorithm drives unrelated backends through [`FileSystem`]:
//! the local disk ([`LocalFs`]), the platform's own storage API
//! ([`PlatformFs`]) and third-party buckets ([`BucketFs`]).

mod bucket;
mod local;
mod platform;

pub use bucket::BucketFs;
pub use local::LocalFs;
pub use platform::PlatformFs;

use crate::error::StorageResult;
use crate::types::{ByteStream, Stat};
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;
use url::Url;

/// Lazy listing of a directory's children.
pub type StatStream<'a, P> = BoxStream<'a, StorageResult<Stat<P>>>;

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Native path type: `PathBuf` locally, [`RemotePath`](crate::RemotePath) remotely.
    type Path: Clone + fmt::Debug + Send + Sync + 'static;

    /// Whether `read_chunks` honours a non-zero offset.
    fn supports_offset_read(&self) -> bool;

    /// Whether `write_chunks` can append at a non-zero offset. Backends that
    /// cannot reject such writes with `Validation`.
    fn supports_offset_write(&self) -> bool;

    /// Whether directories exist implicitly through the paths beneath them,
    /// so writing a file needs no prior `mkdir`.
    fn implicit_directories(&self) -> bool {
        false
    }

    async fn stat(&self, path: &Self::Path) -> StorageResult<Stat<Self::Path>>;

    async fn exists(&self, path: &Self::Path) -> StorageResult<bool> {
        match self.stat(path).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_dir(&self, path: &Self::Path) -> StorageResult<bool> {
        match self.stat(path).await {
            Ok(stat) => Ok(stat.is_dir()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn is_file(&self, path: &Self::Path) -> StorageResult<bool> {
        match self.stat(path).await {
            Ok(stat) => Ok(stat.is_file()),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Opens a forward-only byte stream starting at `offset`. The stream is
    /// not restartable; resume by calling again with a later offset.
    async fn read_chunks(&self, path: &Self::Path, offset: u64) -> StorageResult<ByteStream>;

    /// Writes `body` starting at `offset`, truncating anything after it.
    /// Returns the number of bytes written by this call.
    async fn write_chunks(
        &self,
        path: &Self::Path,
        body: ByteStream,
        offset: u64,
    ) -> StorageResult<u64>;

    /// Lists the direct children of a directory.
    fn iter_dir<'a>(&'a self, path: &'a Self::Path) -> StatStream<'a, Self::Path>;

    async fn mkdir(&self, path: &Self::Path, parents: bool, exist_ok: bool) -> StorageResult<()>;

    async fn rm(&self, path: &Self::Path) -> StorageResult<()>;

    async fn rmdir(&self, path: &Self::Path, recursive: bool) -> StorageResult<()>;

    /// Canonical URI of `path`, as reported to progress sinks.
    fn to_url(&self, path: &Self::Path) -> StorageResult<Url>;

    fn parent(&self, path: &Self::Path) -> Self::Path;

    fn name(&self, path: &Self::Path) -> String;

    fn child(&self, path: &Self::Path, name: &str) -> Self::Path;

    /// `(min, max)` estimate of `server_time - client_time` in seconds.
    fn clock_skew(&self) -> (f64, f64);
}
