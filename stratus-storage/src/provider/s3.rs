//! S3-compatible provider (AWS, MinIO, OpenStack Swift S3 API).
//!
//! Uses delegated credentials from the credential manager. A client is built
//! per credential snapshot and reused until the manager hands out a new one.

use super::{BlobBody, BucketProvider, capped, fill_buffer};
use crate::clock_skew::ClockSkew;
use crate::config::StorageConfig;
use crate::credential_manager::CredentialManager;
use crate::error::{StorageError, StorageResult};
use crate::types::{BlobEntry, BlobStream, Bucket, BucketCredentials, ByteStream};
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::config::interceptors::{
    BeforeDeserializationInterceptorContextRef, BeforeTransmitInterceptorContextRef,
};
use aws_sdk_s3::config::retry::RetryConfig;
use aws_sdk_s3::config::timeout::TimeoutConfig;
use aws_sdk_s3::config::{ConfigBag, Intercept, RuntimeComponents};
use aws_sdk_s3::error::{BoxError, DisplayErrorContext, SdkError};
use aws_sdk_s3::primitives::{ByteStream as S3ByteStream, DateTime as S3DateTime};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_smithy_types::config_bag::{Storable, StoreReplace};
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const DEFAULT_REGION: &str = "us-east-1";

/// Folds the `Date` header of every S3 response into the clock-skew estimate.
#[derive(Debug)]
struct ClockSkewInterceptor {
    skew: Arc<ClockSkew>,
}

#[derive(Debug, Clone, Copy)]
struct SentAt(SystemTime);

impl Storable for SentAt {
    type Storer = StoreReplace<Self>;
}

impl Intercept for ClockSkewInterceptor {
    fn name(&self) -> &'static str {
        "ClockSkewInterceptor"
    }

    fn read_before_transmit(
        &self,
        _context: &BeforeTransmitInterceptorContextRef<'_>,
        _runtime_components: &RuntimeComponents,
        cfg: &mut ConfigBag,
    ) -> Result<(), BoxError> {
        cfg.interceptor_state().store_put(SentAt(SystemTime::now()));
        Ok(())
    }

    fn read_after_transmit(
        &self,
        context: &BeforeDeserializationInterceptorContextRef<'_>,
        _runtime_components: &RuntimeComponents,
        cfg: &mut ConfigBag,
    ) -> Result<(), BoxError> {
        let received = SystemTime::now();
        let sent = cfg.load::<SentAt>().map_or(received, |s| s.0);
        if let Some(date) = context.response().headers().get("date") {
            self.skew.observe_header(sent, received, date);
        }
        Ok(())
    }
}

/// Maps an SDK failure onto the storage taxonomy.
fn sdk_error<E>(err: SdkError<E, HttpResponse>, context: &str) -> StorageError
where
    E: std::error::Error + Send + Sync + 'static,
{
    let message = format!("{context}: {}", DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            StorageError::Transport(message)
        }
        SdkError::ConstructionFailure(_) => StorageError::Validation(message),
        _ => match err.raw_response() {
            Some(resp) => StorageError::from_status(resp.status().as_u16(), message),
            None => StorageError::Provider(message),
        },
    }
}

fn to_chrono(time: Option<&S3DateTime>) -> Option<DateTime<Utc>> {
    time.and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
}

struct CachedClient {
    credentials: Arc<BucketCredentials>,
    client: S3Client,
    bucket_name: String,
}

/// Provider for S3-compatible buckets.
pub struct S3Provider {
    credentials: Arc<CredentialManager>,
    cached: Mutex<Option<CachedClient>>,
    skew: Arc<ClockSkew>,
    timeouts: TimeoutConfig,
    part_size: usize,
    page_size: i32,
}

impl S3Provider {
    pub fn new(credentials: Arc<CredentialManager>, config: &StorageConfig) -> Self {
        let timeouts = TimeoutConfig::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .build();
        Self {
            credentials,
            cached: Mutex::new(None),
            skew: Arc::new(ClockSkew::new()),
            timeouts,
            part_size: config.s3_part_size,
            page_size: i32::try_from(config.list_page_size).unwrap_or(1000),
        }
    }

    /// Returns a client for the current credential snapshot.
    async fn client(&self) -> StorageResult<(S3Client, String)> {
        let creds = self.credentials.get_credentials().await?;
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref()
            && Arc::ptr_eq(&c.credentials, &creds)
        {
            return Ok((c.client.clone(), c.bucket_name.clone()));
        }

        let client = self.build_client(&creds)?;
        let bucket_name = creds
            .get("bucket_name")
            .unwrap_or_else(|| self.bucket().name_or_id())
            .to_string();
        debug!(bucket = %self.bucket().id, "built s3 client for new credentials");
        *cached = Some(CachedClient {
            credentials: creds,
            client: client.clone(),
            bucket_name: bucket_name.clone(),
        });
        Ok((client, bucket_name))
    }

    fn build_client(&self, creds: &BucketCredentials) -> StorageResult<S3Client> {
        let credentials = aws_credential_types::Credentials::new(
            creds.require("access_key_id")?,
            creds.require("secret_access_key")?,
            creds.get("session_token").map(str::to_string),
            None,
            "stratus-bucket",
        );
        let region = creds.get("region").unwrap_or(DEFAULT_REGION).to_string();

        // retries are owned by the transfer layer
        let mut builder = aws_sdk_s3::Config::builder()
            .region(aws_types::region::Region::new(region))
            .credentials_provider(credentials)
            .behavior_version_latest()
            .retry_config(RetryConfig::disabled())
            .timeout_config(self.timeouts.clone())
            .interceptor(ClockSkewInterceptor {
                skew: self.skew.clone(),
            });

        if let Some(endpoint) = creds.get("endpoint_url") {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        Ok(S3Client::from_conf(builder.build()))
    }

    /// Runs `op`, refreshing credentials once if the backend rejects them.
    async fn call<T, F, Fut>(&self, op: F) -> StorageResult<T>
    where
        F: Fn(S3Client, String) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let (client, bucket) = self.client().await?;
        match op(client, bucket).await {
            Err(StorageError::Authorization(message)) => {
                warn!(bucket = %self.bucket().id, "s3 rejected credentials, refreshing: {message}");
                self.credentials.refresh().await?;
                let (client, bucket) = self.client().await?;
                op(client, bucket).await
            }
            other => other,
        }
    }

    async fn put_single(&self, key: &str, data: Bytes) -> StorageResult<u64> {
        let size = data.len() as u64;
        self.call(|client, bucket| {
            let data = data.clone();
            async move {
                client
                    .put_object()
                    .bucket(bucket)
                    .key(key)
                    .body(S3ByteStream::from(data))
                    .send()
                    .await
                    .map_err(|e| sdk_error(e, &format!("put {key}")))
            }
        })
        .await?;
        debug!("uploaded {size} bytes to s3 key {key}");
        Ok(size)
    }

    async fn put_multipart(
        &self,
        key: &str,
        body: ByteStream,
        buffer: BytesMut,
    ) -> StorageResult<u64> {
        // parts reuse whichever client opened the upload
        let (client, bucket, upload_id) = self
            .call(|client, bucket| async move {
                let created = client
                    .create_multipart_upload()
                    .bucket(&bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| sdk_error(e, &format!("create multipart upload {key}")))?;
                let upload_id = created
                    .upload_id()
                    .ok_or_else(|| StorageError::Provider(format!("{key}: no multipart upload id")))?
                    .to_string();
                Ok::<_, StorageError>((client, bucket, upload_id))
            })
            .await?;

        match self
            .upload_parts(&client, &bucket, key, &upload_id, body, buffer)
            .await
        {
            Ok(total) => Ok(total),
            Err(err) => {
                if let Err(abort) = client
                    .abort_multipart_upload()
                    .bucket(&bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!("failed to abort multipart upload {upload_id} for {key}: {}", DisplayErrorContext(&abort));
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        client: &S3Client,
        bucket: &str,
        key: &str,
        upload_id: &str,
        mut body: ByteStream,
        mut buffer: BytesMut,
    ) -> StorageResult<u64> {
        let mut parts = Vec::new();
        let mut total = 0u64;
        // one byte past a full part is held back so the last part is never empty
        let mut more = true;
        loop {
            if more {
                more = fill_buffer(&mut body, &mut buffer, self.part_size + 1).await?;
            }
            let chunk = if more {
                buffer.split_to(self.part_size).freeze()
            } else {
                std::mem::take(&mut buffer).freeze()
            };
            let number = i32::try_from(parts.len() + 1)
                .map_err(|_| StorageError::Validation(format!("{key}: too many parts")))?;
            total += chunk.len() as u64;

            let part = client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(number)
                .body(S3ByteStream::from(chunk))
                .send()
                .await
                .map_err(|e| sdk_error(e, &format!("upload part {number} of {key}")))?;
            parts.push(
                CompletedPart::builder()
                    .e_tag(part.e_tag().unwrap_or_default())
                    .part_number(number)
                    .build(),
            );

            if !more {
                break;
            }
        }

        let count = parts.len();
        client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| sdk_error(e, &format!("complete multipart upload {key}")))?;
        debug!("uploaded {total} bytes to s3 key {key} in {count} parts");
        Ok(total)
    }
}

#[async_trait]
impl BucketProvider for S3Provider {
    fn bucket(&self) -> &Bucket {
        self.credentials.bucket()
    }

    fn clock_skew(&self) -> (f64, f64) {
        self.skew.estimate()
    }

    fn list_blobs<'a>(
        &'a self,
        prefix: &'a str,
        recursive: bool,
        limit: Option<usize>,
    ) -> BlobStream<'a> {
        let stream = async_stream::try_stream! {
            let mut token: Option<String> = None;
            loop {
                let page = self
                    .call(|client, bucket| {
                        let token = token.clone();
                        async move {
                            let mut req = client
                                .list_objects_v2()
                                .bucket(bucket)
                                .prefix(prefix)
                                .max_keys(self.page_size)
                                .set_continuation_token(token);
                            if !recursive {
                                req = req.delimiter("/");
                            }
                            req.send()
                                .await
                                .map_err(|e| sdk_error(e, &format!("list {prefix}")))
                        }
                    })
                    .await?;

                for object in page.contents() {
                    let Some(key) = object.key() else { continue };
                    yield BlobEntry::Object {
                        key: key.to_string(),
                        size: object.size().unwrap_or(0).max(0) as u64,
                        created_at: None,
                        modified_at: to_chrono(object.last_modified()),
                    };
                }
                for common in page.common_prefixes() {
                    if let Some(key) = common.prefix() {
                        yield BlobEntry::CommonPrefix { key: key.to_string() };
                    }
                }

                match page.next_continuation_token() {
                    Some(next) if page.is_truncated().unwrap_or(false) => {
                        token = Some(next.to_string());
                    }
                    _ => break,
                }
            }
        };
        capped(stream.boxed(), limit)
    }

    async fn head_blob(&self, key: &str) -> StorageResult<BlobEntry> {
        let head = self
            .call(|client, bucket| async move {
                client
                    .head_object()
                    .bucket(bucket)
                    .key(key)
                    .send()
                    .await
                    .map_err(|e| sdk_error(e, &format!("head {key}")))
            })
            .await?;
        Ok(BlobEntry::Object {
            key: key.to_string(),
            size: head.content_length().unwrap_or(0).max(0) as u64,
            created_at: None,
            modified_at: to_chrono(head.last_modified()),
        })
    }

    async fn put_blob(&self, key: &str, body: BlobBody) -> StorageResult<u64> {
        match body {
            BlobBody::Bytes(data) if data.len() <= self.part_size => self.put_single(key, data).await,
            body => {
                let mut body = body.into_stream();
                let mut buffer = BytesMut::new();
                if fill_buffer(&mut body, &mut buffer, self.part_size + 1).await? {
                    self.put_multipart(key, body, buffer).await
                } else {
                    self.put_single(key, buffer.freeze()).await
                }
            }
        }
    }

    async fn fetch_blob(&self, key: &str, offset: u64) -> StorageResult<ByteStream> {
        let range = (offset > 0).then(|| format!("bytes={offset}-"));
        let output = self
            .call(|client, bucket| {
                let range = range.clone();
                async move {
                    client
                        .get_object()
                        .bucket(bucket)
                        .key(key)
                        .set_range(range)
                        .send()
                        .await
                        .map_err(|e| sdk_error(e, &format!("get {key}")))
                }
            })
            .await?;

        let key = key.to_string();
        let mut body = output.body;
        let stream = async_stream::try_stream! {
            while let Some(chunk) = body.next().await {
                let chunk: Bytes = chunk
                    .map_err(|e| StorageError::Transport(format!("reading {key}: {e}")))?;
                yield chunk;
            }
        };
        Ok(stream.boxed())
    }

    async fn delete_blob(&self, key: &str) -> StorageResult<()> {
        self.call(|client, bucket| async move {
            client
                .delete_object()
                .bucket(bucket)
                .key(key)
                .send()
                .await
                .map_err(|e| sdk_error(e, &format!("delete {key}")))
        })
        .await?;
        debug!("deleted s3 key {key}");
        Ok(())
    }
}
