//! Adapter for the platform's own storage REST API.
//!
//! The API is file-oriented (`?op=` style): metadata lookups return a
//! `FileStatus` document, listings stream one status per line as NDJSON,
//! and writes may resume at an offset.

use super::{FileSystem, StatStream};
use crate::error::{StorageError, StorageResult};
use crate::http::HttpClient;
use crate::types::{ByteStream, EntryKind, RemotePath, Stat};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::DateTime;
use futures::{StreamExt, TryStreamExt};
use reqwest::Method;
use reqwest::header::ACCEPT;
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use url::Url;

const NDJSON: &str = "application/x-ndjson";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileStatus {
    #[serde(default)]
    path_suffix: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    length: u64,
    #[serde(default)]
    modification_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct FileStatusResponse {
    #[serde(rename = "FileStatus")]
    file_status: FileStatus,
}

impl FileStatus {
    fn into_stat(self, path: RemotePath) -> Stat<RemotePath> {
        let kind = match self.kind.as_str() {
            "FILE" => EntryKind::File,
            "DIRECTORY" => EntryKind::Directory,
            _ => EntryKind::Other,
        };
        Stat {
            name: path.name().to_string(),
            size: if kind == EntryKind::File { self.length } else { 0 },
            modification_time: self
                .modification_time
                .and_then(DateTime::from_timestamp_millis),
            kind,
            path,
        }
    }
}

/// Platform storage for one owner on one cluster.
pub struct PlatformFs {
    http: HttpClient,
    endpoint: Url,
    cluster: String,
    owner: String,
}

impl PlatformFs {
    /// `endpoint` is the cluster's storage API base, as returned by
    /// [`ClusterResolver::storage_endpoint`](crate::ClusterResolver::storage_endpoint).
    pub fn new(http: HttpClient, endpoint: Url, cluster: &str, owner: &str) -> Self {
        Self {
            http,
            endpoint,
            cluster: cluster.to_string(),
            owner: owner.to_string(),
        }
    }

    fn op_url(&self, path: &RemotePath, op: &str) -> StorageResult<Url> {
        let mut url = self.endpoint.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                StorageError::Config(format!("{}: not a usable base URL", self.endpoint))
            })?;
            segments.pop_if_empty().push("v1").push(&self.owner);
            if !path.is_root() {
                segments.extend(path.as_str().split('/'));
            }
        }
        url.query_pairs_mut().append_pair("op", op);
        Ok(url)
    }

    fn parse_status_line(&self, dir: &RemotePath, line: &[u8]) -> StorageResult<Option<Stat<RemotePath>>> {
        let line = line.trim_ascii();
        if line.is_empty() {
            return Ok(None);
        }
        let status: FileStatus = serde_json::from_slice(line)?;
        if status.path_suffix.is_empty() {
            return Ok(None);
        }
        let child = dir.child(&status.path_suffix);
        Ok(Some(status.into_stat(child)))
    }
}

/// Upload body that counts bytes and keeps the first stream error, so a
/// failure in the local source is not reported as a transport error.
struct TrackedBody {
    sent: Arc<AtomicU64>,
    error: Arc<Mutex<Option<StorageError>>>,
}

impl TrackedBody {
    fn wrap(body: ByteStream) -> (reqwest::Body, Self) {
        let sent = Arc::new(AtomicU64::new(0));
        let error = Arc::new(Mutex::new(None));
        let tracker = Self {
            sent: sent.clone(),
            error: error.clone(),
        };
        let stream = body
            .inspect_ok(move |chunk| {
                sent.fetch_add(chunk.len() as u64, Ordering::Relaxed);
            })
            .map_err(move |e| {
                let message = e.to_string();
                if let Ok(mut slot) = error.lock() {
                    slot.get_or_insert(e);
                }
                std::io::Error::other(message)
            });
        (reqwest::Body::wrap_stream(stream), tracker)
    }

    fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }

    fn take_error(&self) -> Option<StorageError> {
        self.error.lock().ok().and_then(|mut slot| slot.take())
    }
}

#[async_trait]
impl FileSystem for PlatformFs {
    type Path = RemotePath;

    fn supports_offset_read(&self) -> bool {
        true
    }

    fn supports_offset_write(&self) -> bool {
        true
    }

    async fn stat(&self, path: &RemotePath) -> StorageResult<Stat<RemotePath>> {
        let url = self.op_url(path, "GETFILESTATUS")?;
        let resp = self.http.send(self.http.request(Method::GET, url)).await?;
        let body: FileStatusResponse = resp.json().await?;
        Ok(body.file_status.into_stat(path.clone()))
    }

    async fn read_chunks(&self, path: &RemotePath, offset: u64) -> StorageResult<ByteStream> {
        let mut url = self.op_url(path, "OPEN")?;
        if offset > 0 {
            url.query_pairs_mut().append_pair("offset", &offset.to_string());
        }
        let resp = self
            .http
            .send_streaming(self.http.request(Method::GET, url))
            .await?;
        Ok(resp.bytes_stream().map_err(StorageError::from).boxed())
    }

    async fn write_chunks(
        &self,
        path: &RemotePath,
        body: ByteStream,
        offset: u64,
    ) -> StorageResult<u64> {
        let (method, url) = if offset == 0 {
            let mut url = self.op_url(path, "CREATE")?;
            url.query_pairs_mut().append_pair("overwrite", "true");
            (Method::PUT, url)
        } else {
            let mut url = self.op_url(path, "WRITE")?;
            url.query_pairs_mut().append_pair("offset", &offset.to_string());
            (Method::PATCH, url)
        };

        let (body, tracker) = TrackedBody::wrap(body);
        let req = self
            .http
            .request(method, url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body);
        if let Err(err) = self.http.send_streaming(req).await {
            return Err(tracker.take_error().unwrap_or(err));
        }
        let written = tracker.sent();
        debug!(path = %path, offset, written, "wrote platform file");
        Ok(written)
    }

    fn iter_dir<'a>(&'a self, path: &'a RemotePath) -> StatStream<'a, RemotePath> {
        let stream = async_stream::try_stream! {
            let url = self.op_url(path, "LISTSTATUS")?;
            let resp = self
                .http
                .send_streaming(self.http.request(Method::GET, url).header(ACCEPT, NDJSON))
                .await?;

            let mut body = resp.bytes_stream();
            let mut pending = BytesMut::new();
            while let Some(chunk) = body.next().await {
                let chunk: Bytes = chunk?;
                pending.extend_from_slice(&chunk);
                while let Some(pos) = pending.iter().position(|b| *b == b'\n') {
                    let line = pending.split_to(pos + 1);
                    if let Some(stat) = self.parse_status_line(path, &line)? {
                        yield stat;
                    }
                }
            }
            if let Some(stat) = self.parse_status_line(path, &pending)? {
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

        if !parents && !path.is_root() {
            let parent = path.parent();
            let stat = self.stat(&parent).await?;
            if !stat.is_dir() {
                return Err(StorageError::NotADirectory(parent.to_string()));
            }
        }

        let url = self.op_url(path, "MKDIRS")?;
        self.http.send(self.http.request(Method::PUT, url)).await?;
        info!(path = %path, "created platform directory");
        Ok(())
    }

    async fn rm(&self, path: &RemotePath) -> StorageResult<()> {
        if self.stat(path).await?.is_dir() {
            return Err(StorageError::IsADirectory(path.to_string()));
        }
        let mut url = self.op_url(path, "DELETE")?;
        url.query_pairs_mut().append_pair("recursive", "false");
        self.http.send(self.http.request(Method::DELETE, url)).await?;
        Ok(())
    }

    async fn rmdir(&self, path: &RemotePath, recursive: bool) -> StorageResult<()> {
        if !self.stat(path).await?.is_dir() {
            return Err(StorageError::NotADirectory(path.to_string()));
        }
        let mut url = self.op_url(path, "DELETE")?;
        url.query_pairs_mut()
            .append_pair("recursive", if recursive { "true" } else { "false" });
        self.http.send(self.http.request(Method::DELETE, url)).await?;
        Ok(())
    }

    fn to_url(&self, path: &RemotePath) -> StorageResult<Url> {
        Ok(Url::parse(&format!(
            "storage://{}/{}/{}",
            self.cluster, self.owner, path
        ))?)
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
        self.http.clock_skew().estimate()
    }
}
