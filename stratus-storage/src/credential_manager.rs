//! Bucket credential lifecycle management with auto-refresh.
//!
//! Holds one immutable credential snapshot per bucket and asks the issuer
//! for a new one whenever the cached snapshot is within the refresh margin
//! of its expiry.

use crate::collaborators::CredentialIssuer;
use crate::error::{StorageError, StorageResult};
use crate::types::{Bucket, BucketCredentials};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Manages bucket credentials with auto-refresh.
pub struct CredentialManager {
    issuer: Arc<dyn CredentialIssuer>,
    bucket: Bucket,
    credentials: RwLock<Option<Arc<BucketCredentials>>>,
    /// Serializes refreshes so concurrent callers share one issuer round-trip.
    refresh_lock: Mutex<()>,
    refresh_margin_secs: i64,
}

impl CredentialManager {
    pub fn new(issuer: Arc<dyn CredentialIssuer>, bucket: Bucket, refresh_margin_secs: i64) -> Self {
        Self {
            issuer,
            bucket,
            credentials: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refresh_margin_secs,
        }
    }

    pub fn bucket(&self) -> &Bucket {
        &self.bucket
    }

    /// Gets valid credentials, refreshing if needed.
    pub async fn get_credentials(&self) -> StorageResult<Arc<BucketCredentials>> {
        if let Some(creds) = self.cached_valid().await {
            return Ok(creds);
        }

        let _guard = self.refresh_lock.lock().await;
        // another caller may have refreshed while we waited
        if let Some(creds) = self.cached_valid().await {
            return Ok(creds);
        }
        self.fetch().await
    }

    /// Forces a credential refresh.
    pub async fn refresh(&self) -> StorageResult<Arc<BucketCredentials>> {
        let _guard = self.refresh_lock.lock().await;
        self.fetch().await
    }

    /// Clears cached credentials.
    pub async fn clear(&self) {
        *self.credentials.write().await = None;
    }

    /// Returns true if credentials are currently cached and valid.
    pub async fn has_valid_credentials(&self) -> bool {
        self.cached_valid().await.is_some()
    }

    async fn cached_valid(&self) -> Option<Arc<BucketCredentials>> {
        let creds = self.credentials.read().await;
        match creds.as_ref() {
            Some(c) if !c.expires_within_secs(self.refresh_margin_secs) => Some(c.clone()),
            Some(_) => {
                debug!(
                    bucket = %self.bucket.id,
                    "credentials expiring within {}s, refreshing", self.refresh_margin_secs
                );
                None
            }
            None => None,
        }
    }

    async fn fetch(&self) -> StorageResult<Arc<BucketCredentials>> {
        let fresh = self
            .issuer
            .request_temporary_credentials(&self.bucket)
            .await
            .inspect_err(|e| warn!("credential request for bucket {} failed: {e}", self.bucket.id))?;

        if fresh.provider != self.bucket.provider {
            return Err(StorageError::Credential(format!(
                "issuer returned {} credentials for {} bucket {}",
                fresh.provider, self.bucket.provider, self.bucket.id
            )));
        }

        debug!(
            bucket = %self.bucket.id,
            expires_at = ?fresh.expires_at,
            "refreshed bucket credentials"
        );

        let fresh = Arc::new(fresh);
        *self.credentials.write().await = Some(fresh.clone());
        Ok(fresh)
    }
}
