//! Azure Blob Storage provider, authorized by a delegated SAS URL.

use super::{BlobBody, BucketProvider, capped, fill_buffer};
use crate::clock_skew::ClockSkew;
use crate::config::StorageConfig;
use crate::credential_manager::CredentialManager;
use crate::error::{StorageError, StorageResult};
use crate::http::HttpClient;
use crate::types::{BlobEntry, BlobStream, Bucket, BucketCredentials, ByteStream};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use futures::{StreamExt, TryStreamExt};
use reqwest::header::{CONTENT_LENGTH, HeaderMap, LAST_MODIFIED};
use reqwest::{Method, RequestBuilder};
use serde::Deserialize;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};
use url::Url;

const API_VERSION: &str = "2021-08-06";

// ── Listing XML ──

#[derive(Debug, Deserialize)]
struct EnumerationResults {
    #[serde(rename = "Blobs", default)]
    blobs: BlobList,
    #[serde(rename = "NextMarker", default)]
    next_marker: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct BlobList {
    #[serde(rename = "Blob", default)]
    blobs: Vec<BlobItem>,
    #[serde(rename = "BlobPrefix", default)]
    prefixes: Vec<BlobPrefixItem>,
}

#[derive(Debug, Deserialize)]
struct BlobItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Properties")]
    properties: BlobProperties,
}

#[derive(Debug, Deserialize)]
struct BlobProperties {
    #[serde(rename = "Creation-Time", default)]
    creation_time: Option<String>,
    #[serde(rename = "Last-Modified", default)]
    last_modified: Option<String>,
    #[serde(rename = "Content-Length", default)]
    content_length: u64,
}

#[derive(Debug, Deserialize)]
struct BlobPrefixItem {
    #[serde(rename = "Name")]
    name: String,
}

fn parse_date(value: Option<&str>) -> Option<DateTime<Utc>> {
    value
        .and_then(|v| DateTime::parse_from_rfc2822(v.trim()).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn header<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn block_id(index: usize) -> String {
    STANDARD.encode(format!("block-{index:08}"))
}

fn block_list_xml(ids: &[String]) -> String {
    let mut xml = String::from(r#"<?xml version="1.0" encoding="utf-8"?><BlockList>"#);
    for id in ids {
        xml.push_str("<Latest>");
        xml.push_str(id);
        xml.push_str("</Latest>");
    }
    xml.push_str("</BlockList>");
    xml
}

/// Provider for Azure Blob containers.
pub struct AzureProvider {
    credentials: Arc<CredentialManager>,
    http: HttpClient,
    block_size: usize,
    page_size: usize,
}

impl AzureProvider {
    pub fn new(credentials: Arc<CredentialManager>, config: &StorageConfig) -> StorageResult<Self> {
        Ok(Self {
            credentials,
            http: HttpClient::new(config, Arc::new(ClockSkew::new()), None)?,
            block_size: config.azure_block_size,
            page_size: config.list_page_size,
        })
    }

    /// Builds a URL for the container (no key) or one blob, SAS attached.
    fn url(
        creds: &BucketCredentials,
        key: Option<&str>,
        params: &[(&str, &str)],
    ) -> StorageResult<Url> {
        let mut url = Url::parse(creds.require("sas_url")?)?;
        let sas = url.query().map(str::to_string);
        url.set_query(None);
        if let Some(key) = key {
            let mut segments = url.path_segments_mut().map_err(|()| {
                StorageError::Credential("sas_url cannot carry a blob path".to_string())
            })?;
            segments.pop_if_empty().extend(key.split('/'));
        }
        url.set_query(sas.as_deref());
        if !params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (name, value) in params {
                query.append_pair(name, value);
            }
        }
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.http
            .request(method, url)
            .header("x-ms-version", API_VERSION)
    }

    /// Runs `op` with current credentials, renewing them once on rejection.
    async fn call<T, F, Fut>(&self, op: F) -> StorageResult<T>
    where
        F: Fn(Arc<BucketCredentials>) -> Fut,
        Fut: Future<Output = StorageResult<T>>,
    {
        let creds = self.credentials.get_credentials().await?;
        match op(creds).await {
            Err(StorageError::Authorization(message)) => {
                warn!(bucket = %self.bucket().id, "azure rejected SAS token, refreshing: {message}");
                let creds = self.credentials.refresh().await?;
                op(creds).await
            }
            other => other,
        }
    }

    async fn put_single(&self, key: &str, data: Bytes) -> StorageResult<u64> {
        let size = data.len() as u64;
        self.call(|creds| {
            let data = data.clone();
            async move {
                let url = Self::url(&creds, Some(key), &[])?;
                let req = self
                    .request(Method::PUT, url)
                    .header("x-ms-blob-type", "BlockBlob")
                    .header(CONTENT_LENGTH, data.len())
                    .body(data);
                self.http.send_streaming(req).await
            }
        })
        .await?;
        debug!("uploaded {size} bytes to azure blob {key}");
        Ok(size)
    }

    async fn put_blocks(
        &self,
        key: &str,
        mut body: ByteStream,
        mut buffer: BytesMut,
    ) -> StorageResult<u64> {
        let mut ids = Vec::new();
        let mut total = 0u64;
        let mut more = true;
        loop {
            if more {
                more = fill_buffer(&mut body, &mut buffer, self.block_size + 1).await?;
            }
            let chunk = if more {
                buffer.split_to(self.block_size).freeze()
            } else {
                std::mem::take(&mut buffer).freeze()
            };
            let id = block_id(ids.len());
            total += chunk.len() as u64;
            // staged blocks survive a token refresh, so each one renews alone
            self.call(|creds| {
                let chunk = chunk.clone();
                let id = id.as_str();
                async move {
                    let url = Self::url(&creds, Some(key), &[("comp", "block"), ("blockid", id)])?;
                    let req = self
                        .request(Method::PUT, url)
                        .header(CONTENT_LENGTH, chunk.len())
                        .body(chunk);
                    self.http.send_streaming(req).await
                }
            })
            .await?;
            ids.push(id);
            if !more {
                break;
            }
        }

        let block_list = block_list_xml(&ids);
        self.call(|creds| {
            let block_list = block_list.clone();
            async move {
                let url = Self::url(&creds, Some(key), &[("comp", "blocklist")])?;
                let req = self
                    .request(Method::PUT, url)
                    .header(reqwest::header::CONTENT_TYPE, "application/xml")
                    .body(block_list);
                self.http.send(req).await
            }
        })
        .await?;
        debug!("uploaded {total} bytes to azure blob {key} in {} blocks", ids.len());
        Ok(total)
    }
}

#[async_trait]
impl BucketProvider for AzureProvider {
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
            let mut marker: Option<String> = None;
            loop {
                let page: EnumerationResults = self
                    .call(|creds| {
                        let marker = marker.clone();
                        let page_size = page_size.clone();
                        async move {
                            let mut params = vec![
                                ("restype", "container"),
                                ("comp", "list"),
                                ("prefix", prefix),
                                ("maxresults", page_size.as_str()),
                            ];
                            if !recursive {
                                params.push(("delimiter", "/"));
                            }
                            if let Some(marker) = marker.as_deref() {
                                params.push(("marker", marker));
                            }
                            let url = Self::url(&creds, None, &params)?;
                            let body = self
                                .http
                                .send(self.request(Method::GET, url))
                                .await?
                                .text()
                                .await?;
                            Ok(quick_xml::de::from_str(&body)?)
                        }
                    })
                    .await?;

                for blob in page.blobs.blobs {
                    yield BlobEntry::Object {
                        key: blob.name,
                        size: blob.properties.content_length,
                        created_at: parse_date(blob.properties.creation_time.as_deref()),
                        modified_at: parse_date(blob.properties.last_modified.as_deref()),
                    };
                }
                for common in page.blobs.prefixes {
                    yield BlobEntry::CommonPrefix { key: common.name };
                }

                match page.next_marker.filter(|m| !m.is_empty()) {
                    Some(next) => marker = Some(next),
                    None => break,
                }
            }
        };
        capped(stream.boxed(), limit)
    }

    async fn head_blob(&self, key: &str) -> StorageResult<BlobEntry> {
        let headers = self
            .call(|creds| async move {
                let url = Self::url(&creds, Some(key), &[])?;
                let resp = self.http.send(self.request(Method::HEAD, url)).await?;
                Ok(resp.headers().clone())
            })
            .await?;

        let size = header(&headers, CONTENT_LENGTH.as_str())
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(BlobEntry::Object {
            key: key.to_string(),
            size,
            created_at: parse_date(header(&headers, "x-ms-creation-time")),
            modified_at: parse_date(header(&headers, LAST_MODIFIED.as_str())),
        })
    }

    async fn put_blob(&self, key: &str, body: BlobBody) -> StorageResult<u64> {
        match body {
            BlobBody::Bytes(data) => self.put_single(key, data).await,
            BlobBody::Stream(mut body) => {
                let mut buffer = BytesMut::new();
                if fill_buffer(&mut body, &mut buffer, self.block_size + 1).await? {
                    self.put_blocks(key, body, buffer).await
                } else {
                    self.put_single(key, buffer.freeze()).await
                }
            }
        }
    }

    async fn fetch_blob(&self, key: &str, offset: u64) -> StorageResult<ByteStream> {
        let resp = self
            .call(|creds| async move {
                let url = Self::url(&creds, Some(key), &[])?;
                let mut req = self.request(Method::GET, url);
                if offset > 0 {
                    req = req.header("x-ms-range", format!("bytes={offset}-"));
                }
                self.http.send_streaming(req).await
            })
            .await?;
        Ok(resp.bytes_stream().map_err(StorageError::from).boxed())
    }

    async fn delete_blob(&self, key: &str) -> StorageResult<()> {
        self.call(|creds| async move {
            let url = Self::url(&creds, Some(key), &[])?;
            self.http.send(self.request(Method::DELETE, url)).await
        })
        .await?;
        debug!("deleted azure blob {key}");
        Ok(())
    }
}
