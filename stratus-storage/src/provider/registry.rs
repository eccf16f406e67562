//! Provider selection and caching.

use super::{AzureProvider, BucketProvider, GcsProvider, S3Provider};
use crate::collaborators::CredentialIssuer;
use crate::config::StorageConfig;
use crate::credential_manager::CredentialManager;
use crate::error::{StorageError, StorageResult};
use crate::types::{Bucket, ProviderKind};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// Builds a provider for one bucket from its credential manager.
pub type ProviderFactory = Arc<
    dyn Fn(Arc<CredentialManager>, &StorageConfig) -> StorageResult<Arc<dyn BucketProvider>>
        + Send
        + Sync,
>;

/// Maps provider kinds to factories and caches one provider per bucket.
///
/// Owned by the [`Storage`](crate::Storage) facade; providers are built on
/// first use and reused for every later call against the same bucket.
pub struct ProviderRegistry {
    factories: HashMap<ProviderKind, ProviderFactory>,
    providers: Mutex<HashMap<String, Arc<dyn BucketProvider>>>,
    issuer: Arc<dyn CredentialIssuer>,
    config: StorageConfig,
}

impl ProviderRegistry {
    /// A registry with the built-in S3, Azure and GCS providers.
    pub fn new(issuer: Arc<dyn CredentialIssuer>, config: StorageConfig) -> Self {
        let mut registry = Self::empty(issuer, config);

        let s3: ProviderFactory = Arc::new(build_s3);
        for kind in [ProviderKind::Aws, ProviderKind::Minio, ProviderKind::OpenStack] {
            registry.register(kind, s3.clone());
        }
        registry.register(ProviderKind::Azure, Arc::new(build_azure));
        registry.register(ProviderKind::Gcp, Arc::new(build_gcs));
        registry
    }

    /// A registry with no factories registered.
    pub fn empty(issuer: Arc<dyn CredentialIssuer>, config: StorageConfig) -> Self {
        Self {
            factories: HashMap::new(),
            providers: Mutex::new(HashMap::new()),
            issuer,
            config,
        }
    }

    pub fn register(&mut self, kind: ProviderKind, factory: ProviderFactory) {
        self.factories.insert(kind, factory);
    }

    /// Seeds the cache with a ready-made provider for its bucket.
    pub async fn insert(&self, provider: Arc<dyn BucketProvider>) {
        let id = provider.bucket().id.clone();
        self.providers.lock().await.insert(id, provider);
    }

    /// Returns the cached provider for `bucket`, building it if needed.
    pub async fn provider_for(&self, bucket: &Bucket) -> StorageResult<Arc<dyn BucketProvider>> {
        let mut providers = self.providers.lock().await;
        if let Some(provider) = providers.get(&bucket.id) {
            return Ok(provider.clone());
        }

        let factory = self.factories.get(&bucket.provider).ok_or_else(|| {
            StorageError::Config(format!("no provider registered for {}", bucket.provider))
        })?;
        let credentials = Arc::new(CredentialManager::new(
            self.issuer.clone(),
            bucket.clone(),
            self.config.credential_refresh_margin_secs,
        ));
        let provider = factory(credentials, &self.config)?;
        debug!(bucket = %bucket.id, kind = %bucket.provider, "created bucket provider");
        providers.insert(bucket.id.clone(), provider.clone());
        Ok(provider)
    }

    /// Drops the cached provider for a bucket, e.g. after it was deleted.
    pub async fn evict(&self, bucket_id: &str) -> bool {
        self.providers.lock().await.remove(bucket_id).is_some()
    }
}

fn build_s3(
    credentials: Arc<CredentialManager>,
    config: &StorageConfig,
) -> StorageResult<Arc<dyn BucketProvider>> {
    Ok(Arc::new(S3Provider::new(credentials, config)))
}

fn build_azure(
    credentials: Arc<CredentialManager>,
    config: &StorageConfig,
) -> StorageResult<Arc<dyn BucketProvider>> {
    Ok(Arc::new(AzureProvider::new(credentials, config)?))
}

fn build_gcs(
    credentials: Arc<CredentialManager>,
    config: &StorageConfig,
) -> StorageResult<Arc<dyn BucketProvider>> {
    Ok(Arc::new(GcsProvider::new(credentials, config)?))
}
