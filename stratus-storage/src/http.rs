//! Shared HTTP plumbing for REST backends.
//!
//! [`HttpClient`] wraps a `reqwest::Client` once at construction: every
//! request is signed (when a signer is configured), timed, and its `Date`
//! header folded into the backend's [`ClockSkew`] estimate.

use crate::clock_skew::ClockSkew;
use crate::collaborators::RequestSigner;
use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use reqwest::header::DATE;
use reqwest::{Client, Method, RequestBuilder, Response};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::debug;
use url::Url;

/// Longest error body quoted back in an error message.
const MAX_ERROR_BODY: usize = 512;

/// HTTP client with clock-skew tracking and optional request signing.
#[derive(Clone)]
pub struct HttpClient {
    client: Client,
    skew: Arc<ClockSkew>,
    signer: Option<Arc<dyn RequestSigner>>,
    request_timeout: Duration,
}

impl HttpClient {
    pub fn new(
        config: &StorageConfig,
        skew: Arc<ClockSkew>,
        signer: Option<Arc<dyn RequestSigner>>,
    ) -> StorageResult<Self> {
        // No total timeout on the client: large bodies are bounded by the
        // inactivity timeout only. Metadata calls add one per request.
        let client = Client::builder()
            .connect_timeout(config.connect_timeout())
            .read_timeout(config.read_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| StorageError::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            skew,
            signer,
            request_timeout: config.request_timeout(),
        })
    }

    pub fn clock_skew(&self) -> &Arc<ClockSkew> {
        &self.skew
    }

    pub fn request(&self, method: Method, url: Url) -> RequestBuilder {
        self.client.request(method, url)
    }

    /// Sends a metadata request and maps non-success statuses to errors.
    pub async fn send(&self, req: RequestBuilder) -> StorageResult<Response> {
        let resp = self.execute(req.timeout(self.request_timeout)).await?;
        check_status(resp).await
    }

    /// Sends a request whose body may be large; no total timeout applies.
    pub async fn send_streaming(&self, req: RequestBuilder) -> StorageResult<Response> {
        let resp = self.execute(req).await?;
        check_status(resp).await
    }

    /// Sends a request and returns the response whatever its status.
    pub async fn execute(&self, req: RequestBuilder) -> StorageResult<Response> {
        let mut request = req.build()?;
        if let Some(signer) = &self.signer {
            let method = request.method().clone();
            let url = request.url().clone();
            signer.sign(&method, &url, request.headers_mut()).await?;
        }

        debug!(method = %request.method(), url = %redact(request.url()), "sending request");
        let sent = SystemTime::now();
        let resp = self.client.execute(request).await?;
        let received = SystemTime::now();

        if let Some(date) = resp.headers().get(DATE).and_then(|v| v.to_str().ok()) {
            self.skew.observe_header(sent, received, date);
        }
        Ok(resp)
    }
}

/// Converts a non-success response into a typed error.
pub async fn check_status(resp: Response) -> StorageResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let url = redact(resp.url());
    let mut body = resp.text().await.unwrap_or_default();
    if body.len() > MAX_ERROR_BODY {
        let mut cut = MAX_ERROR_BODY;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(StorageError::from_status(
        status.as_u16(),
        format!("{url} returned {status}: {}", body.trim()),
    ))
}

/// Drops the query string, which may carry SAS signatures.
pub fn redact(url: &Url) -> String {
    let mut url = url.clone();
    url.set_query(None);
    url.to_string()
}
