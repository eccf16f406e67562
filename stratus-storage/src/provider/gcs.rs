//! Google Cloud Storage provider over the JSON API.
//!
//! Credentials carry either a ready `access_token` or a service-account
//! `key_data` document; the latter is exchanged for an access token through
//! the JWT-bearer OAuth flow and renewed before it expires.

use super::{BlobBody, BucketProvider, capped, fill_buffer};
use crate::clock_skew::ClockSkew;
use crate::config::StorageConfig;
use crate::credential_manager::CredentialManager;
use crate::error::{StorageError, StorageResult};
use crate::http::{HttpClient, check_status};
use crate::types::{BlobEntry, BlobStream, Bucket, BucketCredentials, ByteStream};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Duration, Utc};
use futures::{StreamExt, TryStreamExt};
use jsonwebtoken::{Algorithm, EncodingKey, Header, encode};
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, LOCATION, RANGE};
use reqwest::{Method, RequestBuilder, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const TOKEN_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GcsObject {
    name: String,
    /// Sizes are encoded as decimal strings.
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    time_created: Option<DateTime<Utc>>,
    #[serde(default)]
    updated: Option<DateTime<Utc>>,
}

impl GcsObject {
    fn into_entry(self) -> BlobEntry {
        BlobEntry::Object {
            size: self.size.and_then(|s| s.parse().ok()).unwrap_or(0),
            created_at: self.time_created,
            modified_at: self.updated,
            key: self.name,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListResponse {
    #[serde(default)]
    items: Vec<GcsObject>,
    #[serde(default)]
    prefixes: Vec<String>,
    #[serde(default)]
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default)]
    token_uri: Option<String>,
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<i64>,
}

struct CachedToken {
    credentials: Arc<BucketCredentials>,
    token: String,
    expires_at: DateTime<Utc>,
}

/// Everything one request needs: where to go and how to authenticate.
#[derive(Clone)]
struct Session {
    endpoint: String,
    bucket: String,
    token: String,
}

impl Session {
    fn object_url(&self, key: &str) -> StorageResult<Url> {
        Ok(Url::parse(&format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            urlencoding::encode(&self.bucket),
            urlencoding::encode(key)
        ))?)
    }

    fn list_url(&self) -> StorageResult<Url> {
        Ok(Url::parse(&format!(
            "{}/storage/v1/b/{}/o",
            self.endpoint,
            urlencoding::encode(&self.bucket)
        ))?)
    }

    fn upload_url(&self, key: &str, upload_type: &str) -> StorageResult<Url> {
        let mut url = Url::parse(&format!(
            "{}/upload/storage/v1/b/{}/o",
            self.endpoint,
            urlencoding::encode(&self.bucket)
        ))?;
        url.query_pairs_mut()
            .append_pair("uploadType", upload_type)
            .append_pair("name", key);
        Ok(url)
    }
}

/// Provider for Google Cloud Storage buckets.
pub struct GcsProvider {
    credentials: Arc<CredentialManager>,
    http: HttpClient,
    token: Mutex<Option<CachedToken>>,
    chunk_size: usize,
    page_size: usize,
    refresh_margin_secs: i64,
}

impl GcsProvider {
    pub fn new(credentials: Arc<CredentialManager>, config: &StorageConfig) -> StorageResult<Self> {
        Ok(Self {
            credentials,
            http: HttpClient::new(config, Arc::new(ClockSkew::new()), None)?,
            token: Mutex::new(None),
            chunk_size: config.gcs_chunk_size,
            page_size: config.list_page_size,
            refresh_margin_secs: config.credential_refresh_margin_secs,
        })
    }

    async fn session(&self, creds: &Arc<BucketCredentials>) -> StorageResult<Session> {
        Ok(Session {
            endpoint: creds
                .get("endpoint_url")
                .unwrap_or(DEFAULT_ENDPOINT)
                .trim_end_matches('/')
                .to_string(),
            bucket: creds
                .get("bucket_name")
                .unwrap_or_else(|| self.bucket().name_or_id())
                .to_string(),
            token: self.access_token(creds).await?,
        })
    }

    async fn access_token(&self, creds: &Arc<BucketCredentials>) -> StorageResult<String> {
        if let Some(token) = creds.get("access_token") {
            return Ok(token.to_string());
        }

        let mut cached = self.token.lock().await;
        if let Some(c) = cached.as_ref()
            && Arc::ptr_eq(&c.credentials, creds)
            && Utc::now() + Duration::seconds(self.refresh_margin_secs) < c.expires_at
        {
            return Ok(c.token.clone());
        }

        let key: ServiceAccountKey = serde_json::from_str(creds.require("key_data")?)
            .map_err(|e| StorageError::Credential(format!("malformed service account key: {e}")))?;
        let (token, expires_at) = self.exchange_jwt(&key).await?;
        *cached = Some(CachedToken {
            credentials: creds.clone(),
            token: token.clone(),
            expires_at,
        });
        Ok(token)
    }

    /// Trades a self-signed service-account assertion for an access token.
    async fn exchange_jwt(&self, key: &ServiceAccountKey) -> StorageResult<(String, DateTime<Utc>)> {
        let token_uri = key.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &key.client_email,
            scope: SCOPE,
            aud: token_uri,
            iat: now,
            exp: now + TOKEN_LIFETIME_SECS,
        };
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| StorageError::Credential(format!("invalid service account key: {e}")))?;
        let assertion = encode(&Header::new(Algorithm::RS256), &claims, &signing_key)
            .map_err(|e| StorageError::Credential(format!("failed to sign assertion: {e}")))?;

        let form = format!(
            "grant_type={}&assertion={}",
            urlencoding::encode(JWT_BEARER_GRANT),
            urlencoding::encode(&assertion)
        );
        let req = self
            .http
            .request(Method::POST, Url::parse(token_uri)?)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(form);
        let resp: TokenResponse = self
            .http
            .send(req)
            .await
            .map_err(|e| StorageError::Credential(format!("token exchange failed: {e}")))?
            .json()
            .await?;

        let lifetime = resp.expires_in.unwrap_or(TOKEN_LIFETIME_SECS);
        debug!(account = %key.client_email, "exchanged service account assertion for token");
        Ok((resp.access_token, Utc::now() + Duration::seconds(lifetime)))
    }

    fn authorized(&self, method: Method, url: Url, session: &Session) -> RequestBuilder {
        self.http.request(method, url).bearer_auth(&session.token)
    }

    /// Runs `op` with a live session, renewing credentials once on rejection.
    async fn call<T, F, Fut>(&self, op: F) -> StorageResult<T>
    where
        F: Fn(Session) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let creds = self.credentials.get_credentials().await?;
        let session = self.session(&creds).await?;
        match op(session).await {
            Err(StorageError::Authorization(message)) => {
                warn!(bucket = %self.bucket().id, "gcs rejected token, refreshing: {message}");
                *self.token.lock().await = None;
                let creds = self.credentials.refresh().await?;
                let session = self.session(&creds).await?;
                op(session).await
            }
            other => other,
        }
    }

    async fn put_single(&self, key: &str, data: Bytes) -> StorageResult<u64> {
        let size = data.len() as u64;
        self.call(|session| {
            let data = data.clone();
            async move {
                let url = session.upload_url(key, "media")?;
                let req = self
                    .authorized(Method::POST, url, &session)
                    .header(CONTENT_TYPE, "application/octet-stream")
                    .header(CONTENT_LENGTH, data.len())
                    .body(data);
                self.http.send_streaming(req).await
            }
        })
        .await?;
        debug!("uploaded {size} bytes to gcs object {key}");
        Ok(size)
    }

    /// Streams `body` through a resumable upload session.
    ///
    /// Chunks are batched to `chunk_size` (a multiple of 256 KiB) before each
    /// PUT; the cumulative offset is tracked across PUTs and the last one
    /// declares the total length.
    async fn put_resumable(
        &self,
        key: &str,
        mut body: ByteStream,
        mut buffer: BytesMut,
    ) -> StorageResult<u64> {
        let (session, upload_url) = self
            .call(|session| async move {
                let start = self
                    .authorized(Method::POST, session.upload_url(key, "resumable")?, &session)
                    .header(CONTENT_LENGTH, 0);
                let resp = self.http.send(start).await?;
                let location = resp
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                    .ok_or_else(|| {
                        StorageError::Provider(format!("{key}: no resumable session URI"))
                    })?;
                let upload_url = Url::parse(location)?;
                Ok::<_, StorageError>((session, upload_url))
            })
            .await?;

        let mut offset = 0u64;
        let mut more = true;
        loop {
            if more {
                more = fill_buffer(&mut body, &mut buffer, self.chunk_size + 1).await?;
            }
            let chunk = if more {
                buffer.split_to(self.chunk_size).freeze()
            } else {
                std::mem::take(&mut buffer).freeze()
            };
            let len = chunk.len() as u64;
            // the threshold above leaves at least one byte for the final PUT
            let range = if more {
                format!("bytes {offset}-{}/*", offset + len - 1)
            } else {
                let total = offset + len;
                format!("bytes {offset}-{}/{total}", total - 1)
            };

            let req = self
                .authorized(Method::PUT, upload_url.clone(), &session)
                .header(CONTENT_RANGE, range)
                .header(CONTENT_LENGTH, chunk.len())
                .body(chunk);
            let resp = self.http.execute(req).await?;
            offset += len;

            if more {
                if resp.status() != StatusCode::PERMANENT_REDIRECT {
                    check_status(resp).await?;
                    return Err(StorageError::Provider(format!(
                        "{key}: upload session closed early at {offset} bytes"
                    )));
                }
            } else {
                check_status(resp).await?;
                break;
            }
        }

        debug!("uploaded {offset} bytes to gcs object {key} via resumable session");
        Ok(offset)
    }
}

#[async_trait]
impl BucketProvider for GcsProvider {
    fn bucket(&self) -> &Bucket {
        self.credentials.bucket()
    }

    fn clock_skew(&self) -> (f64, f64) {
        self.http.clock_skew().estimate()
    }

    fn list_blobs<'a>(
        &'a self,
        prefix: &'a str,
        recursive: bool,
        limit: Option<usize>,
    ) -> BlobStream<'a> {
        let stream = async_stream::try_stream! {
            let page_size = self.page_size.to_string();
            let mut page_token: Option<String> = None;
            loop {
                let page: ListResponse = self
                    .call(|session| {
                        let page_token = page_token.clone();
                        let page_size = page_size.clone();
                        async move {
                            let mut url = session.list_url()?;
                            {
                                let mut query = url.query_pairs_mut();
                                query
                                    .append_pair("prefix", prefix)
                                    .append_pair("maxResults", &page_size);
                                if !recursive {
                                    query.append_pair("delimiter", "/");
                                }
                                if let Some(token) = page_token.as_deref() {
                                    query.append_pair("pageToken", token);
                                }
                            }
                            let resp = self
                                .http
                                .send(self.authorized(Method::GET, url, &session))
                                .await?;
                            Ok(resp.json().await?)
                        }
                    })
                    .await?;

                for object in page.items {
                    yield object.into_entry();
                }
                for key in page.prefixes {
                    yield BlobEntry::CommonPrefix { key };
                }

                match page.next_page_token.filter(|t| !t.is_empty()) {
                    Some(next) => page_token = Some(next),
                    None => break,
                }
            }
        };
        capped(stream.boxed(), limit)
    }

    async fn head_blob(&self, key: &str) -> StorageResult<BlobEntry> {
        let object: GcsObject = self
            .call(|session| async move {
                let url = session.object_url(key)?;
                let resp = self
                    .http
                    .send(self.authorized(Method::GET, url, &session))
                    .await?;
                Ok(resp.json().await?)
            })
            .await?;
        Ok(object.into_entry())
    }

    async fn put_blob(&self, key: &str, body: BlobBody) -> StorageResult<u64> {
        match body {
            BlobBody::Bytes(data) => self.put_single(key, data).await,
            BlobBody::Stream(mut body) => {
                let mut buffer = BytesMut::new();
                if fill_buffer(&mut body, &mut buffer, self.chunk_size + 1).await? {
                    self.put_resumable(key, body, buffer).await
                } else {
                    self.put_single(key, buffer.freeze()).await
                }
            }
        }
    }

    async fn fetch_blob(&self, key: &str, offset: u64) -> StorageResult<ByteStream> {
        let resp = self
            .call(|session| async move {
                let mut url = session.object_url(key)?;
                url.query_pairs_mut().append_pair("alt", "media");
                let mut req = self.authorized(Method::GET, url, &session);
                if offset > 0 {
                    req = req.header(RANGE, format!("bytes={offset}-"));
                }
                self.http.send_streaming(req).await
            })
            .await?;
        Ok(resp.bytes_stream().map_err(StorageError::from).boxed())
    }

    async fn delete_blob(&self, key: &str) -> StorageResult<()> {
        self.call(|session| async move {
            let url = session.object_url(key)?;
            self.http
                .send(self.authorized(Method::DELETE, url, &session))
                .await
        })
        .await?;
        debug!("deleted gcs object {key}");
        Ok(())
    }
}
