//! Filesystem view over a bucket.
//!
//! POSIX paths map onto keys directly; a directory is either a zero-byte
//! marker key ending in exactly one `/`, or is inferred from keys sharing
//! its prefix.

use super::{FileSystem, StatStream};
use crate::error::{StorageError, StorageResult};
use crate::provider::{BlobBody, BucketProvider};
use crate::types::{BlobEntry, ByteStream, EntryKind, RemotePath, Stat};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

pub struct BucketFs {
    provider: Arc<dyn BucketProvider>,
}

impl BucketFs {
    pub fn new(provider: Arc<dyn BucketProvider>) -> Self {
        Self { provider }
    }

    pub fn provider(&self) -> &Arc<dyn BucketProvider> {
        &self.provider
    }

    fn dir_stat(path: &RemotePath, entry: Option<&BlobEntry>) -> Stat<RemotePath> {
        Stat {
            name: path.name().to_string(),
            path: path.clone(),
            size: 0,
            modification_time: entry.and_then(BlobEntry::modified_at),
            kind: EntryKind::Directory,
        }
    }

    /// Deletes every key under a directory prefix, marker last.
    async fn remove_tree(&self, prefix: &str) -> StorageResult<()> {
        let mut keys = Vec::new();
        {
            let mut listing = self.provider.list_blobs(prefix, true, None);
            while let Some(entry) = listing.next().await {
                let entry = entry?;
                if entry.key() != prefix {
                    keys.push(entry.key().to_string());
                }
            }
        }
        // deepest keys first so markers outlive their contents
        keys.sort_by(|a, b| b.cmp(a));
        for key in &keys {
            self.provider.delete_blob(key).await?;
        }
        self.provider.delete_blob(prefix).await?;
        info!("removed {} keys under {prefix}", keys.len());
        Ok(())
    }
}

#[async_trait]
impl FileSystem for BucketFs {
    type Path = RemotePath;

    fn supports_offset_read(&self) -> bool {
        true
    }

    fn supports_offset_write(&self) -> bool {
        false
    }

    fn implicit_directories(&self) -> bool {
        true
    }

    async fn stat(&self, path: &RemotePath) -> StorageResult<Stat<RemotePath>> {
        if path.is_root() {
            return Ok(Self::dir_stat(path, None));
        }

        match self.provider.head_blob(path.as_str()).await {
            Ok(entry) => {
                return Ok(Stat {
                    name: path.name().to_string(),
                    path: path.clone(),
                    size: entry.size(),
                    modification_time: entry.modified_at(),
                    kind: EntryKind::File,
                });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let marker = path.dir_prefix();
        match self.provider.head_blob(&marker).await {
            Ok(entry) => return Ok(Self::dir_stat(path, Some(&entry))),
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let mut probe = self.provider.list_blobs(&marker, false, Some(1));
        match probe.next().await {
            Some(Ok(_)) => Ok(Self::dir_stat(path, None)),
            Some(Err(e)) => Err(e),
            None => Err(StorageError::NotFound(format!(
                "{}/{path}",
                self.provider.bucket().uri()
            ))),
        }
    }

    async fn read_chunks(&self, path: &RemotePath, offset: u64) -> StorageResult<ByteStream> {
        self.provider.fetch_blob(path.as_str(), offset).await
    }

    async fn write_chunks(
        &self,
        path: &RemotePath,
        body: ByteStream,
        offset: u64,
    ) -> StorageResult<u64> {
        if offset != 0 {
            return Err(StorageError::Validation(format!(
                "{path}: blob backends cannot write at offset {offset}"
            )));
        }
        if path.is_root() {
            return Err(StorageError::IsADirectory("bucket root".to_string()));
        }
        self.provider
            .put_blob(path.as_str(), BlobBody::Stream(body))
            .await
    }

    fn iter_dir<'a>(&'a self, path: &'a RemotePath) -> StatStream<'a, RemotePath> {
        let stream = async_stream::try_stream! {
            let prefix = path.dir_prefix();
            let mut listing = self.provider.list_blobs(&prefix, false, None);
            while let Some(entry) = listing.next().await {
                let entry = entry?;
                let Some(rest) = entry.key().strip_prefix(prefix.as_str()) else {
                    continue;
                };
                let name = rest.trim_end_matches('/');
                if name.is_empty() {
                    continue;
                }
                let child = path.child(name);
                let stat = if entry.is_dir() || rest.ends_with('/') {
                    Self::dir_stat(&child, Some(&entry))
                } else {
                    Stat {
                        name: name.to_string(),
                        path: child,
                        size: entry.size(),
                        modification_time: entry.modified_at(),
                        kind: EntryKind::File,
                    }
                };
                yield stat;
            }
        };
        stream.boxed()
    }

    async fn mkdir(&self, path: &RemotePath, parents: bool, exist_ok: bool) -> StorageResult<()> {
        match self.stat(path).await {
            Ok(stat) if stat.is_dir() => {
                return if exist_ok {
                    Ok(())
                } else {
                    Err(StorageError::Conflict(format!("{path}: directory already exists")))
                };
            }
            Ok(_) => {
                return Err(StorageError::Conflict(format!(
                    "{path}: exists and is not a directory"
                )));
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let parent = path.parent();
        if !parent.is_root() {
            match self.stat(&parent).await {
                Ok(stat) if stat.is_dir() => {}
                Ok(_) => return Err(StorageError::NotADirectory(parent.to_string())),
                Err(e) if e.is_not_found() && parents => {}
                Err(e) => return Err(e),
            }
        }

        self.provider
            .put_blob(&path.dir_prefix(), BlobBody::Bytes(Bytes::new()))
            .await?;
        debug!("created directory marker {}", path.dir_prefix());
        Ok(())
    }

    async fn rm(&self, path: &RemotePath) -> StorageResult<()> {
        if self.stat(path).await?.is_dir() {
            return Err(StorageError::IsADirectory(path.to_string()));
        }
        self.provider.delete_blob(path.as_str()).await
    }

    async fn rmdir(&self, path: &RemotePath, recursive: bool) -> StorageResult<()> {
        if !self.stat(path).await?.is_dir() {
            return Err(StorageError::NotADirectory(path.to_string()));
        }
        let prefix = path.dir_prefix();
        if recursive {
            return self.remove_tree(&prefix).await;
        }

        let mut children = self.iter_dir(path);
        if children.next().await.transpose()?.is_some() {
            return Err(StorageError::Conflict(format!("{path}: directory not empty")));
        }
        drop(children);
        self.provider.delete_blob(&prefix).await
    }

    fn to_url(&self, path: &RemotePath) -> StorageResult<Url> {
        let base = self.provider.bucket().uri();
        Ok(Url::parse(&format!("{base}/{path}"))?)
    }

    fn parent(&self, path: &RemotePath) -> RemotePath {
        path.parent()
    }

    fn name(&self, path: &RemotePath) -> String {
        path.name().to_string()
    }

    fn child(&self, path: &RemotePath, name: &str) -> RemotePath {
        path.child(name)
    }

    fn clock_skew(&self) -> (f64, f64) {
        self.provider.clock_skew()
    }
}
