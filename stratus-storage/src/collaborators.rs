//! Collaborators the storage layer consumes but does not own.
//!
//! Authentication, cluster lookup and credential issuance live elsewhere in
//! the platform; the core only talks to them through these traits.

use crate::error::{StorageError, StorageResult};
use crate::types::{Bucket, BucketCredentials};
use async_trait::async_trait;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use reqwest::Method;
use url::Url;

/// Adds authentication to outgoing platform requests. The core never holds
/// platform secrets itself.
#[async_trait]
pub trait RequestSigner: Send + Sync {
    async fn sign(&self, method: &Method, url: &Url, headers: &mut HeaderMap) -> StorageResult<()>;
}

/// Signs requests with a fixed bearer token.
pub struct BearerTokenSigner {
    header: HeaderValue,
}

impl BearerTokenSigner {
    pub fn new(token: &str) -> StorageResult<Self> {
        let mut header = HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| StorageError::Validation("token contains invalid characters".into()))?;
        header.set_sensitive(true);
        Ok(Self { header })
    }
}

#[async_trait]
impl RequestSigner for BearerTokenSigner {
    async fn sign(&self, _method: &Method, _url: &Url, headers: &mut HeaderMap) -> StorageResult<()> {
        headers.insert(AUTHORIZATION, self.header.clone());
        Ok(())
    }
}

/// Maps human URIs onto concrete endpoints and bucket identities.
#[async_trait]
pub trait ClusterResolver: Send + Sync {
    /// Base URL of the platform storage API for a cluster.
    async fn storage_endpoint(&self, cluster: &str) -> StorageResult<Url>;

    /// Resolves a bucket by human name or id.
    async fn resolve_bucket(
        &self,
        cluster: &str,
        owner: &str,
        name_or_id: &str,
    ) -> StorageResult<Bucket>;
}

/// Issues short-lived delegated credentials for a bucket.
///
/// Failures are propagated unchanged; retrying the whole operation re-issues
/// credentials.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn request_temporary_credentials(&self, bucket: &Bucket)
    -> StorageResult<BucketCredentials>;
}
