//! Shared types for storage operations.

use crate::error::StorageResult;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Lazy, finite, forward-only byte sequence. Not restartable: resume by
/// requesting a new stream at a later offset.
pub type ByteStream = BoxStream<'static, StorageResult<Bytes>>;

/// Lazy listing of blob entries.
pub type BlobStream<'a> = BoxStream<'a, StorageResult<BlobEntry>>;

/// Kind of a filesystem entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    File,
    Directory,
    /// Sockets, devices, fifos and anything else that is not a regular file.
    Other,
}

/// Metadata for one entry of a filesystem adapter.
#[derive(Clone, Debug, PartialEq)]
pub struct Stat<P> {
    pub name: String,
    pub path: P,
    pub size: u64,
    pub modification_time: Option<DateTime<Utc>>,
    pub kind: EntryKind,
}

impl<P> Stat<P> {
    pub fn is_file(&self) -> bool {
        self.kind == EntryKind::File
    }

    pub fn is_dir(&self) -> bool {
        self.kind == EntryKind::Directory
    }

    /// Modification time as fractional epoch seconds.
    pub fn mtime_secs(&self) -> Option<f64> {
        self.modification_time
            .map(|t| t.timestamp_millis() as f64 / 1000.0)
    }
}

/// POSIX-style key relative to a remote root. Never has leading or trailing
/// separators; the root is the empty path.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemotePath(String);

impl RemotePath {
    pub fn new(path: &str) -> Self {
        let joined = path
            .split('/')
            .filter(|segment| !segment.is_empty() && *segment != ".")
            .collect::<Vec<_>>()
            .join("/");
        Self(joined)
    }

    pub fn root() -> Self {
        Self(String::new())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn parent(&self) -> Self {
        match self.0.rfind('/') {
            Some(idx) => Self(self.0[..idx].to_string()),
            None => Self::root(),
        }
    }

    pub fn name(&self) -> &str {
        match self.0.rfind('/') {
            Some(idx) => &self.0[idx + 1..],
            None => &self.0,
        }
    }

    pub fn child(&self, name: &str) -> Self {
        if self.is_root() {
            Self::new(name)
        } else {
            Self::new(&format!("{}/{name}", self.0))
        }
    }

    /// Key prefix for listing this path's children (`""` or `"a/b/"`).
    pub fn dir_prefix(&self) -> String {
        if self.is_root() {
            String::new()
        } else {
            format!("{}/", self.0)
        }
    }
}

impl fmt::Display for RemotePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RemotePath {
    fn from(path: &str) -> Self {
        Self::new(path)
    }
}

/// Third-party object-store flavour behind a bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    Aws,
    Minio,
    OpenStack,
    Azure,
    Gcp,
}

impl ProviderKind {
    /// True for backends spoken to through the S3 API.
    pub fn is_s3_compatible(&self) -> bool {
        matches!(self, ProviderKind::Aws | ProviderKind::Minio | ProviderKind::OpenStack)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::Aws => "aws",
            ProviderKind::Minio => "minio",
            ProviderKind::OpenStack => "open_stack",
            ProviderKind::Azure => "azure",
            ProviderKind::Gcp => "gcp",
        };
        f.write_str(name)
    }
}

/// A bucket imported into or created by the platform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bucket {
    pub id: String,
    pub owner: String,
    pub cluster_name: String,
    pub provider: ProviderKind,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub public: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Bucket {
    /// Human name if set, otherwise the id.
    pub fn name_or_id(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    /// Canonical `blob://cluster/owner/bucket` URI.
    pub fn uri(&self) -> String {
        format!("blob://{}/{}/{}", self.cluster_name, self.owner, self.name_or_id())
    }
}

/// One entry of a bucket listing.
#[derive(Clone, Debug, PartialEq)]
pub enum BlobEntry {
    Object {
        key: String,
        size: u64,
        created_at: Option<DateTime<Utc>>,
        modified_at: Option<DateTime<Utc>>,
    },
    /// Inferred directory; only produced by non-recursive listings.
    CommonPrefix { key: String },
}

impl BlobEntry {
    pub fn key(&self) -> &str {
        match self {
            BlobEntry::Object { key, .. } | BlobEntry::CommonPrefix { key } => key,
        }
    }

    pub fn size(&self) -> u64 {
        match self {
            BlobEntry::Object { size, .. } => *size,
            BlobEntry::CommonPrefix { .. } => 0,
        }
    }

    /// True for common prefixes and zero-length keys ending in `/`.
    pub fn is_dir(&self) -> bool {
        match self {
            BlobEntry::Object { key, size, .. } => *size == 0 && key.ends_with('/'),
            BlobEntry::CommonPrefix { .. } => true,
        }
    }

    pub fn modified_at(&self) -> Option<DateTime<Utc>> {
        match self {
            BlobEntry::Object { modified_at, .. } => *modified_at,
            BlobEntry::CommonPrefix { .. } => None,
        }
    }
}

/// Short-lived delegated credentials for one bucket.
///
/// Immutable: renewal produces a new value which replaces the cached one by
/// reference.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BucketCredentials {
    pub bucket_id: String,
    pub provider: ProviderKind,
    pub credentials: HashMap<String, String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl BucketCredentials {
    /// Returns true if credentials will expire within the given seconds.
    pub fn expires_within_secs(&self, secs: i64) -> bool {
        self.expires_at
            .is_some_and(|at| Utc::now() + chrono::Duration::seconds(secs) >= at)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.credentials.get(key).map(String::as_str)
    }

    /// Looks up a required value.
    pub fn require(&self, key: &str) -> StorageResult<&str> {
        self.get(key).ok_or_else(|| {
            crate::error::StorageError::Credential(format!(
                "{} credentials for bucket {} lack `{key}`",
                self.provider, self.bucket_id
            ))
        })
    }
}
