//! Top-level storage facade.
//!
//! Resolves `storage://` and `blob://` URIs onto filesystem adapters and
//! bucket providers, and exposes the copy and blob-level operations that
//! bucket and copy commands are built on.

use crate::clock_skew::ClockSkew;
use crate::collaborators::{ClusterResolver, CredentialIssuer, RequestSigner};
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::fs::{BucketFs, FileSystem, LocalFs, PlatformFs};
use crate::http::HttpClient;
use crate::progress::{ProgressReporter, ProgressSink, run_with_progress};
use crate::provider::{BlobBody, BucketProvider, ProviderRegistry, glob_blobs};
use crate::transfer::{FileOutcome, TransferEngine, TransferOptions, TransferSummary};
use crate::types::{BlobEntry, BlobStream, ByteStream, RemotePath};
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};
use url::Url;

/// A parsed remote URI.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RemoteUri {
    /// `storage://cluster/owner/path`
    Platform {
        cluster: String,
        owner: String,
        path: RemotePath,
    },
    /// `blob://cluster/owner/bucket/key`
    Blob {
        cluster: String,
        owner: String,
        bucket: String,
        key: RemotePath,
    },
}

impl RemoteUri {
    pub fn parse(uri: &Url) -> StorageResult<Self> {
        let cluster = uri
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| StorageError::Validation(format!("{uri}: missing cluster name")))?
            .to_string();
        let segments = uri
            .path_segments()
            .map(|s| {
                s.filter(|seg| !seg.is_empty())
                    .map(|seg| urlencoding::decode(seg).map(|d| d.into_owned()))
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()
            .map_err(|e| StorageError::Validation(format!("{uri}: {e}")))?
            .unwrap_or_default();
        let mut segments = segments.into_iter();
        let owner = segments
            .next()
            .ok_or_else(|| StorageError::Validation(format!("{uri}: missing owner")))?;

        match uri.scheme() {
            "storage" => Ok(RemoteUri::Platform {
                cluster,
                owner,
                path: RemotePath::new(&segments.collect::<Vec<_>>().join("/")),
            }),
            "blob" => {
                let bucket = segments
                    .next()
                    .ok_or_else(|| StorageError::Validation(format!("{uri}: missing bucket")))?;
                Ok(RemoteUri::Blob {
                    cluster,
                    owner,
                    bucket,
                    key: RemotePath::new(&segments.collect::<Vec<_>>().join("/")),
                })
            }
            other => Err(StorageError::Validation(format!(
                "{uri}: unsupported scheme `{other}`"
            ))),
        }
    }
}

enum Remote {
    Platform(PlatformFs, RemotePath),
    Bucket(BucketFs, RemotePath),
}

/// Entry point for copy and bucket operations.
pub struct Storage {
    config: StorageConfig,
    resolver: Arc<dyn ClusterResolver>,
    signer: Option<Arc<dyn RequestSigner>>,
    registry: ProviderRegistry,
    engine: TransferEngine,
    local: LocalFs,
    /// One estimate per platform cluster, kept across calls.
    platform_skew: Mutex<HashMap<String, Arc<ClockSkew>>>,
}

impl Storage {
    pub fn new(
        config: StorageConfig,
        resolver: Arc<dyn ClusterResolver>,
        issuer: Arc<dyn CredentialIssuer>,
        signer: Option<Arc<dyn RequestSigner>>,
    ) -> StorageResult<Self> {
        let registry = ProviderRegistry::new(issuer, config.clone());
        Self::with_registry(config, resolver, registry, signer)
    }

    /// Builds a facade around a pre-populated provider registry.
    pub fn with_registry(
        config: StorageConfig,
        resolver: Arc<dyn ClusterResolver>,
        registry: ProviderRegistry,
        signer: Option<Arc<dyn RequestSigner>>,
    ) -> StorageResult<Self> {
        config.validate()?;
        Ok(Self {
            engine: TransferEngine::new(config.clone()),
            local: LocalFs::new(&config),
            config,
            resolver,
            signer,
            registry,
            platform_skew: Mutex::new(HashMap::new()),
        })
    }

    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }

    fn skew_for(&self, cluster: &str) -> Arc<ClockSkew> {
        let mut skews = self.platform_skew.lock().unwrap_or_else(|e| e.into_inner());
        skews.entry(cluster.to_string()).or_default().clone()
    }

    async fn platform_fs(&self, cluster: &str, owner: &str) -> StorageResult<PlatformFs> {
        let endpoint = self.resolver.storage_endpoint(cluster).await?;
        let http = HttpClient::new(&self.config, self.skew_for(cluster), self.signer.clone())?;
        Ok(PlatformFs::new(http, endpoint, cluster, owner))
    }

    async fn provider(
        &self,
        cluster: &str,
        owner: &str,
        bucket: &str,
    ) -> StorageResult<Arc<dyn BucketProvider>> {
        let bucket = self.resolver.resolve_bucket(cluster, owner, bucket).await?;
        self.registry.provider_for(&bucket).await
    }

    async fn remote(&self, uri: &Url) -> StorageResult<Remote> {
        match RemoteUri::parse(uri)? {
            RemoteUri::Platform {
                cluster,
                owner,
                path,
            } => Ok(Remote::Platform(self.platform_fs(&cluster, &owner).await?, path)),
            RemoteUri::Blob {
                cluster,
                owner,
                bucket,
                key,
            } => {
                let provider = self.provider(&cluster, &owner, &bucket).await?;
                Ok(Remote::Bucket(BucketFs::new(provider), key))
            }
        }
    }

    async fn blob(&self, uri: &Url) -> StorageResult<(Arc<dyn BucketProvider>, RemotePath)> {
        match RemoteUri::parse(uri)? {
            RemoteUri::Blob {
                cluster,
                owner,
                bucket,
                key,
            } => Ok((self.provider(&cluster, &owner, &bucket).await?, key)),
            RemoteUri::Platform { .. } => Err(StorageError::Validation(format!(
                "{uri}: expected a blob:// URI"
            ))),
        }
    }

    // ── Copy operations ──

    pub async fn upload_file(
        &self,
        src: &Path,
        dst: &Url,
        options: &TransferOptions,
        sink: &mut dyn ProgressSink,
    ) -> StorageResult<FileOutcome> {
        let src = src.to_path_buf();
        let remote = self.remote(dst).await?;
        run_with_progress(sink, |progress| async move {
            match &remote {
                Remote::Platform(fs, path) => {
                    self.engine
                        .transfer_file(&self.local, &src, fs, path, options, &progress)
                        .await
                }
                Remote::Bucket(fs, path) => {
                    self.engine
                        .transfer_file(&self.local, &src, fs, path, options, &progress)
                        .await
                }
            }
        })
        .await
    }

    pub async fn download_file(
        &self,
        src: &Url,
        dst: &Path,
        options: &TransferOptions,
        sink: &mut dyn ProgressSink,
    ) -> StorageResult<FileOutcome> {
        let dst = dst.to_path_buf();
        let remote = self.remote(src).await?;
        run_with_progress(sink, |progress| async move {
            match &remote {
                Remote::Platform(fs, path) => {
                    self.engine
                        .transfer_file(fs, path, &self.local, &dst, options, &progress)
                        .await
                }
                Remote::Bucket(fs, path) => {
                    self.engine
                        .transfer_file(fs, path, &self.local, &dst, options, &progress)
                        .await
                }
            }
        })
        .await
    }

    pub async fn upload_dir(
        &self,
        src: &Path,
        dst: &Url,
        options: &TransferOptions,
        sink: &mut dyn ProgressSink,
    ) -> StorageResult<TransferSummary> {
        let src = src.to_path_buf();
        let remote = self.remote(dst).await?;
        info!("uploading {} to {dst}", src.display());
        run_with_progress(sink, |progress| async move {
            match &remote {
                Remote::Platform(fs, path) => {
                    self.engine
                        .transfer_dir(&self.local, &src, fs, path, options, &progress)
                        .await
                }
                Remote::Bucket(fs, path) => {
                    self.engine
                        .transfer_dir(&self.local, &src, fs, path, options, &progress)
                        .await
                }
            }
        })
        .await
    }

    pub async fn download_dir(
        &self,
        src: &Url,
        dst: &Path,
        options: &TransferOptions,
        sink: &mut dyn ProgressSink,
    ) -> StorageResult<TransferSummary> {
        let dst: PathBuf = dst.to_path_buf();
        let remote = self.remote(src).await?;
        info!("downloading {src} to {}", dst.display());
        run_with_progress(sink, |progress| async move {
            match &remote {
                Remote::Platform(fs, path) => {
                    self.engine
                        .transfer_dir(fs, path, &self.local, &dst, options, &progress)
                        .await
                }
                Remote::Bucket(fs, path) => {
                    self.engine
                        .transfer_dir(fs, path, &self.local, &dst, options, &progress)
                        .await
                }
            }
        })
        .await
    }

    // ── Blob operations ──

    pub async fn head_blob(&self, uri: &Url) -> StorageResult<BlobEntry> {
        let (provider, key) = self.blob(uri).await?;
        provider.head_blob(key.as_str()).await
    }

    pub async fn put_blob(&self, uri: &Url, body: BlobBody) -> StorageResult<u64> {
        let (provider, key) = self.blob(uri).await?;
        provider.put_blob(key.as_str(), body).await
    }

    pub async fn fetch_blob(&self, uri: &Url, offset: u64) -> StorageResult<ByteStream> {
        let (provider, key) = self.blob(uri).await?;
        provider.fetch_blob(key.as_str(), offset).await
    }

    pub async fn delete_blob(&self, uri: &Url) -> StorageResult<()> {
        let (provider, key) = self.blob(uri).await?;
        provider.delete_blob(key.as_str()).await
    }

    /// Lists keys under the key prefix of `uri`. A URI ending in `/` lists
    /// inside that directory.
    pub async fn list_blobs(
        &self,
        uri: &Url,
        recursive: bool,
        limit: Option<usize>,
    ) -> StorageResult<BlobStream<'static>> {
        let (provider, key) = self.blob(uri).await?;
        let prefix = if uri.path().ends_with('/') {
            key.dir_prefix()
        } else {
            key.as_str().to_string()
        };
        let stream = async_stream::try_stream! {
            let mut listing = provider.list_blobs(&prefix, recursive, limit);
            while let Some(entry) = listing.next().await {
                yield entry?;
            }
        };
        Ok(stream.boxed())
    }

    /// Expands the glob in the key part of `uri`.
    pub async fn glob_blobs(&self, uri: &Url) -> StorageResult<BlobStream<'static>> {
        let (provider, _) = self.blob(uri).await?;
        let pattern = glob_pattern(uri)?;
        let stream = async_stream::try_stream! {
            let mut matches = glob_blobs(provider.as_ref(), &pattern);
            while let Some(entry) = matches.next().await {
                yield entry?;
            }
        };
        Ok(stream.boxed())
    }

    /// Creates a directory on a remote backend.
    pub async fn mkdir(&self, uri: &Url, parents: bool, exist_ok: bool) -> StorageResult<()> {
        match self.remote(uri).await? {
            Remote::Platform(fs, path) => fs.mkdir(&path, parents, exist_ok).await,
            Remote::Bucket(fs, path) => fs.mkdir(&path, parents, exist_ok).await,
        }
    }

    /// Removes a file, or a directory when `recursive` is set.
    pub async fn rm(
        &self,
        uri: &Url,
        recursive: bool,
        sink: &mut dyn ProgressSink,
    ) -> StorageResult<()> {
        let remote = self.remote(uri).await?;
        run_with_progress(sink, |progress| async move {
            match &remote {
                Remote::Platform(fs, path) => remove(fs, path, recursive, &progress).await,
                Remote::Bucket(fs, path) => remove(fs, path, recursive, &progress).await,
            }
        })
        .await
    }
}

async fn remove<F: FileSystem>(
    fs: &F,
    path: &F::Path,
    recursive: bool,
    progress: &ProgressReporter,
) -> StorageResult<()> {
    let url = fs.to_url(path)?;
    let is_dir = fs.is_dir(path).await?;
    if is_dir {
        if !recursive {
            return Err(StorageError::IsADirectory(url.to_string()));
        }
        fs.rmdir(path, true).await?;
    } else {
        fs.rm(path).await?;
    }
    debug!("removed {url}");
    progress.delete(&url, is_dir);
    Ok(())
}

/// The key part of a `blob://` URI with glob characters left unescaped.
fn glob_pattern(uri: &Url) -> StorageResult<String> {
    let segments: Vec<String> = uri
        .path_segments()
        .into_iter()
        .flatten()
        .skip(2)
        .map(|seg| {
            urlencoding::decode(seg)
                .map(|d| d.into_owned())
                .map_err(|e| StorageError::Validation(format!("{uri}: {e}")))
        })
        .collect::<StorageResult<_>>()?;
    Ok(segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_blob_uris() {
        let uri = Url::parse("blob://default/alice/photos/2024/a%20b.jpg").unwrap();
        assert_eq!(
            RemoteUri::parse(&uri).unwrap(),
            RemoteUri::Blob {
                cluster: "default".into(),
                owner: "alice".into(),
                bucket: "photos".into(),
                key: RemotePath::new("2024/a b.jpg"),
            }
        );
    }

    #[test]
    fn parses_storage_uris() {
        let uri = Url::parse("storage://default/alice/data/").unwrap();
        assert_eq!(
            RemoteUri::parse(&uri).unwrap(),
            RemoteUri::Platform {
                cluster: "default".into(),
                owner: "alice".into(),
                path: RemotePath::new("data"),
            }
        );
    }

    #[test]
    fn rejects_unknown_schemes() {
        let uri = Url::parse("ftp://default/alice/x").unwrap();
        assert!(matches!(
            RemoteUri::parse(&uri),
            Err(StorageError::Validation(_))
        ));
    }

    #[test]
    fn glob_pattern_keeps_trailing_slash() {
        let uri = Url::parse("blob://default/alice/photos/*/raw/").unwrap();
        assert_eq!(glob_pattern(&uri).unwrap(), "*/raw/");
    }
}
