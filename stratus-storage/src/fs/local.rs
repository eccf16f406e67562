//! Local disk adapter.

use super::{FileSystem, StatStream};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::types::{ByteStream, EntryKind, Stat};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::fs::Metadata;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Semaphore;
use tracing::debug;
use url::Url;

/// Local filesystem with a cap on concurrently open files.
#[derive(Clone)]
pub struct LocalFs {
    open_files: Arc<Semaphore>,
    chunk_size: usize,
}

impl LocalFs {
    pub fn new(config: &StorageConfig) -> Self {
        Self {
            open_files: Arc::new(Semaphore::new(config.local_max_open_files.max(1))),
            chunk_size: config.chunk_size.max(1),
        }
    }

    async fn acquire(&self) -> StorageResult<tokio::sync::OwnedSemaphorePermit> {
        self.open_files
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| StorageError::Cancelled)
    }
}

impl Default for LocalFs {
    fn default() -> Self {
        Self::new(&StorageConfig::default())
    }
}

fn entry_kind(meta: &Metadata) -> EntryKind {
    if meta.is_file() {
        EntryKind::File
    } else if meta.is_dir() {
        EntryKind::Directory
    } else {
        EntryKind::Other
    }
}

fn to_stat(path: PathBuf, meta: &Metadata) -> Stat<PathBuf> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    Stat {
        name,
        size: if meta.is_file() { meta.len() } else { 0 },
        modification_time: meta.modified().ok().map(DateTime::<Utc>::from),
        kind: entry_kind(meta),
        path,
    }
}

#[async_trait]
impl FileSystem for LocalFs {
    type Path = PathBuf;

    fn supports_offset_read(&self) -> bool {
        true
    }

    fn supports_offset_write(&self) -> bool {
        true
    }

    async fn stat(&self, path: &PathBuf) -> StorageResult<Stat<PathBuf>> {
        let meta = fs::metadata(path)
            .await
            .map_err(|e| StorageError::from_io(e, path.display()))?;
        Ok(to_stat(path.clone(), &meta))
    }

    async fn read_chunks(&self, path: &PathBuf, offset: u64) -> StorageResult<ByteStream> {
        let permit = self.acquire().await?;
        let mut file = fs::File::open(path)
            .await
            .map_err(|e| StorageError::from_io(e, path.display()))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .await
                .map_err(|e| StorageError::from_io(e, path.display()))?;
        }

        let chunk_size = self.chunk_size;
        let display = path.display().to_string();
        let stream = async_stream::try_stream! {
            let _permit = permit;
            loop {
                let mut buf = BytesMut::with_capacity(chunk_size);
                let n = file
                    .read_buf(&mut buf)
                    .await
                    .map_err(|e| StorageError::from_io(e, &display))?;
                if n == 0 {
                    break;
                }
                yield buf.freeze();
            }
        };
        Ok(stream.boxed())
    }

    async fn write_chunks(
        &self,
        path: &PathBuf,
        mut body: ByteStream,
        offset: u64,
    ) -> StorageResult<u64> {
        let _permit = self.acquire().await?;
        let io_err = |e| StorageError::from_io(e, path.display());

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(offset == 0)
            .open(path)
            .await
            .map_err(io_err)?;

        if offset > 0 {
            let len = file.metadata().await.map_err(io_err)?.len();
            if len < offset {
                return Err(StorageError::Validation(format!(
                    "{}: cannot write at offset {offset}, file has {len} bytes",
                    path.display()
                )));
            }
            file.set_len(offset).await.map_err(io_err)?;
            file.seek(SeekFrom::Start(offset)).await.map_err(io_err)?;
        }

        let mut written = 0u64;
        let copied: StorageResult<()> = async {
            while let Some(chunk) = body.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await.map_err(io_err)?;
                written += chunk.len() as u64;
            }
            Ok(())
        }
        .await;
        // whatever arrived stays on disk so a retry can resume after it
        file.flush().await.map_err(io_err)?;
        copied?;
        debug!(path = %path.display(), offset, written, "wrote local file");
        Ok(written)
    }

    fn iter_dir<'a>(&'a self, path: &'a PathBuf) -> StatStream<'a, PathBuf> {
        let stream = async_stream::try_stream! {
            let mut entries = fs::read_dir(path)
                .await
                .map_err(|e| StorageError::from_io(e, path.display()))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| StorageError::from_io(e, path.display()))?
            {
                let child = entry.path();
                // follow symlinks; a dangling link is reported as a non-regular entry
                let stat = match fs::metadata(&child).await {
                    Ok(meta) => to_stat(child, &meta),
                    Err(_) => Stat {
                        name: entry.file_name().to_string_lossy().into_owned(),
                        path: child,
                        size: 0,
                        modification_time: None,
                        kind: EntryKind::Other,
                    },
                };
                yield stat;
            }
        };
        stream.boxed()
    }

    async fn mkdir(&self, path: &PathBuf, parents: bool, exist_ok: bool) -> StorageResult<()> {
        match fs::metadata(path).await {
            Ok(meta) if meta.is_dir() => {
                return if exist_ok {
                    Ok(())
                } else {
                    Err(StorageError::Conflict(format!(
                        "{}: directory already exists",
                        path.display()
                    )))
                };
            }
            Ok(_) => {
                return Err(StorageError::Conflict(format!(
                    "{}: exists and is not a directory",
                    path.display()
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::from_io(e, path.display())),
        }

        let created = if parents {
            fs::create_dir_all(path).await
        } else {
            fs::create_dir(path).await
        };
        created.map_err(|e| StorageError::from_io(e, path.display()))
    }

    async fn rm(&self, path: &PathBuf) -> StorageResult<()> {
        fs::remove_file(path)
            .await
            .map_err(|e| StorageError::from_io(e, path.display()))
    }

    async fn rmdir(&self, path: &PathBuf, recursive: bool) -> StorageResult<()> {
        let removed = if recursive {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_dir(path).await
        };
        removed.map_err(|e| StorageError::from_io(e, path.display()))
    }

    fn to_url(&self, path: &PathBuf) -> StorageResult<Url> {
        let absolute = std::path::absolute(path)
            .map_err(|e| StorageError::from_io(e, path.display()))?;
        Url::from_file_path(&absolute).map_err(|()| {
            StorageError::Validation(format!("{}: not representable as a URL", path.display()))
        })
    }

    fn parent(&self, path: &PathBuf) -> PathBuf {
        path.parent().map(Path::to_path_buf).unwrap_or_default()
    }

    fn name(&self, path: &PathBuf) -> String {
        path.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn child(&self, path: &PathBuf, name: &str) -> PathBuf {
        path.join(name)
    }

    fn clock_skew(&self) -> (f64, f64) {
        (0.0, 0.0)
    }
}
