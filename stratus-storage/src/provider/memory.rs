//! In-process bucket provider.
//!
//! Keeps objects in a sorted map and records every call, which makes it a
//! stand-in backend for dry runs and for tests that assert on the exact
//! requests a transfer issued.

use super::{BlobBody, BucketProvider, capped};
use crate::error::{StorageError, StorageResult};
use crate::types::{BlobEntry, BlobStream, Bucket, ByteStream};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, stream};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Mutex;

/// A call observed by [`MemoryProvider`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProviderCall {
    List { prefix: String, recursive: bool },
    Head { key: String },
    Put { key: String, size: u64 },
    Fetch { key: String, offset: u64 },
    Delete { key: String },
}

#[derive(Clone, Debug)]
struct MemoryObject {
    data: Bytes,
    created_at: DateTime<Utc>,
    modified_at: DateTime<Utc>,
}

impl MemoryObject {
    fn entry(&self, key: &str) -> BlobEntry {
        BlobEntry::Object {
            key: key.to_string(),
            size: self.data.len() as u64,
            created_at: Some(self.created_at),
            modified_at: Some(self.modified_at),
        }
    }
}

pub struct MemoryProvider {
    bucket: Bucket,
    objects: Mutex<BTreeMap<String, MemoryObject>>,
    calls: Mutex<Vec<ProviderCall>>,
    /// Byte counts after which upcoming fetches break with a transport error.
    fetch_failures: Mutex<VecDeque<usize>>,
    /// Keys whose fetches are refused as unauthorized.
    denied: Mutex<BTreeSet<String>>,
    skew: (f64, f64),
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MemoryProvider {
    pub fn new(bucket: Bucket) -> Self {
        Self {
            bucket,
            objects: Mutex::new(BTreeMap::new()),
            calls: Mutex::new(Vec::new()),
            fetch_failures: Mutex::new(VecDeque::new()),
            denied: Mutex::new(BTreeSet::new()),
            skew: (0.0, 0.0),
        }
    }

    /// Reports a fixed clock-skew estimate.
    pub fn with_clock_skew(mut self, min: f64, max: f64) -> Self {
        self.skew = (min.min(max), min.max(max));
        self
    }

    /// Stores an object with both timestamps set to now.
    pub fn insert(&self, key: &str, data: impl Into<Bytes>) {
        self.insert_at(key, data, Utc::now());
    }

    /// Stores an object with an explicit modification time.
    pub fn insert_at(&self, key: &str, data: impl Into<Bytes>, modified_at: DateTime<Utc>) {
        lock(&self.objects).insert(
            key.to_string(),
            MemoryObject {
                data: data.into(),
                created_at: modified_at,
                modified_at,
            },
        );
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        lock(&self.objects).get(key).map(|o| o.data.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.objects).keys().cloned().collect()
    }

    pub fn calls(&self) -> Vec<ProviderCall> {
        lock(&self.calls).clone()
    }

    pub fn clear_calls(&self) {
        lock(&self.calls).clear();
    }

    /// Makes the next fetch fail with a transport error after `after_bytes`.
    pub fn fail_next_fetch(&self, after_bytes: usize) {
        lock(&self.fetch_failures).push_back(after_bytes);
    }

    /// Makes every fetch of `key` fail with an authorization error.
    pub fn deny_fetch(&self, key: &str) {
        lock(&self.denied).insert(key.to_string());
    }

    fn record(&self, call: ProviderCall) {
        lock(&self.calls).push(call);
    }

    fn snapshot(&self, prefix: &str, recursive: bool) -> Vec<BlobEntry> {
        let objects = lock(&self.objects);
        let mut entries: Vec<BlobEntry> = Vec::new();
        for (key, object) in objects.range(prefix.to_string()..) {
            let Some(rest) = key.strip_prefix(prefix) else {
                break;
            };
            if !recursive {
                if let Some(pos) = rest.find('/') {
                    let common = format!("{prefix}{}", &rest[..=pos]);
                    let seen = matches!(
                        entries.last(),
                        Some(BlobEntry::CommonPrefix { key }) if *key == common
                    );
                    if !seen {
                        entries.push(BlobEntry::CommonPrefix { key: common });
                    }
                    continue;
                }
            }
            entries.push(object.entry(key));
        }
        entries
    }
}

#[async_trait]
impl BucketProvider for MemoryProvider {
    fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    fn clock_skew(&self) -> (f64, f64) {
        self.skew
    }

    fn list_blobs<'a>(
        &'a self,
        prefix: &'a str,
        recursive: bool,
        limit: Option<usize>,
    ) -> BlobStream<'a> {
        self.record(ProviderCall::List {
            prefix: prefix.to_string(),
            recursive,
        });
        let entries = self.snapshot(prefix, recursive);
        capped(stream::iter(entries.into_iter().map(Ok)).boxed(), limit)
    }

    async fn head_blob(&self, key: &str) -> StorageResult<BlobEntry> {
        self.record(ProviderCall::Head { key: key.to_string() });
        lock(&self.objects)
            .get(key)
            .map(|o| o.entry(key))
            .ok_or_else(|| StorageError::NotFound(format!("{}: {key}", self.bucket.uri())))
    }

    async fn put_blob(&self, key: &str, body: BlobBody) -> StorageResult<u64> {
        let data = match body {
            BlobBody::Bytes(bytes) => bytes,
            BlobBody::Stream(mut stream) => {
                let mut buffer = BytesMut::new();
                while let Some(chunk) = stream.next().await {
                    buffer.extend_from_slice(&chunk?);
                }
                buffer.freeze()
            }
        };
        let size = data.len() as u64;
        self.record(ProviderCall::Put {
            key: key.to_string(),
            size,
        });

        let now = Utc::now();
        let mut objects = lock(&self.objects);
        let created_at = objects.get(key).map_or(now, |o| o.created_at);
        objects.insert(
            key.to_string(),
            MemoryObject {
                data,
                created_at,
                modified_at: now,
            },
        );
        Ok(size)
    }

    async fn fetch_blob(&self, key: &str, offset: u64) -> StorageResult<ByteStream> {
        self.record(ProviderCall::Fetch {
            key: key.to_string(),
            offset,
        });
        if lock(&self.denied).contains(key) {
            return Err(StorageError::Authorization(format!(
                "{}: access to {key} denied",
                self.bucket.uri()
            )));
        }
        let data = self
            .object(key)
            .ok_or_else(|| StorageError::NotFound(format!("{}: {key}", self.bucket.uri())))?;
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        if start > data.len() {
            return Err(StorageError::Validation(format!(
                "{key}: offset {offset} beyond object size {}",
                data.len()
            )));
        }
        let tail = data.slice(start..);

        let failure = lock(&self.fetch_failures).pop_front();
        let chunks: Vec<StorageResult<Bytes>> = match failure {
            Some(after) => {
                let cut = after.min(tail.len());
                let mut chunks = Vec::new();
                if cut > 0 {
                    chunks.push(Ok(tail.slice(..cut)));
                }
                chunks.push(Err(StorageError::Transport(format!(
                    "{key}: connection reset"
                ))));
                chunks
            }
            None if tail.is_empty() => Vec::new(),
            None => vec![Ok(tail)],
        };
        Ok(stream::iter(chunks).boxed())
    }

    async fn delete_blob(&self, key: &str) -> StorageResult<()> {
        self.record(ProviderCall::Delete { key: key.to_string() });
        lock(&self.objects).remove(key);
        Ok(())
    }
}
