//! Shared test helpers for stratus-storage integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use stratus_storage::{
    Bucket, BucketCredentials, ClusterResolver, CredentialIssuer, MemoryProvider, ProgressSink,
    ProviderKind, ProviderRegistry, Storage, StorageConfig, StorageError, StorageResult,
};
use tracing_subscriber::EnvFilter;
use url::Url;

/// A bucket on the default cluster owned by alice.
pub fn test_bucket(provider: ProviderKind) -> Bucket {
    Bucket {
        id: "bkt-1".into(),
        owner: "alice".into(),
        cluster_name: "default".into(),
        provider,
        name: Some("photos".into()),
        public: false,
        created_at: Utc::now(),
    }
}

/// Credentials that expire `expires_in` seconds from now.
pub fn make_creds(
    provider: ProviderKind,
    values: &[(&str, &str)],
    expires_in: i64,
) -> BucketCredentials {
    BucketCredentials {
        bucket_id: "bkt-1".into(),
        provider,
        credentials: values
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
        expires_at: Some(Utc::now() + Duration::seconds(expires_in)),
    }
}

/// Issuer handing out queued credential sets and counting requests. The
/// last set keeps being returned once the queue is drained.
pub struct StaticIssuer {
    credentials: Mutex<VecDeque<BucketCredentials>>,
    calls: AtomicUsize,
}

impl StaticIssuer {
    pub fn new(credentials: BucketCredentials) -> Arc<Self> {
        Self::sequence(vec![credentials])
    }

    pub fn sequence(credentials: Vec<BucketCredentials>) -> Arc<Self> {
        Arc::new(Self {
            credentials: Mutex::new(credentials.into()),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Replaces whatever is queued with a single set.
    pub fn set(&self, credentials: BucketCredentials) {
        *self.credentials.lock().unwrap() = VecDeque::from([credentials]);
    }
}

#[async_trait]
impl CredentialIssuer for StaticIssuer {
    async fn request_temporary_credentials(
        &self,
        _bucket: &Bucket,
    ) -> StorageResult<BucketCredentials> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.credentials.lock().unwrap();
        let next = if queue.len() > 1 {
            queue.pop_front()
        } else {
            queue.front().cloned()
        };
        next.ok_or_else(|| StorageError::Credential("issuer has nothing to hand out".into()))
    }
}

/// Issuer that always refuses.
pub struct DenyingIssuer;

#[async_trait]
impl CredentialIssuer for DenyingIssuer {
    async fn request_temporary_credentials(
        &self,
        bucket: &Bucket,
    ) -> StorageResult<BucketCredentials> {
        Err(StorageError::Authorization(format!("no access to {}", bucket.id)))
    }
}

/// Resolver serving one platform endpoint and one bucket.
pub struct StaticResolver {
    pub endpoint: Url,
    pub bucket: Bucket,
}

#[async_trait]
impl ClusterResolver for StaticResolver {
    async fn storage_endpoint(&self, _cluster: &str) -> StorageResult<Url> {
        Ok(self.endpoint.clone())
    }

    async fn resolve_bucket(
        &self,
        _cluster: &str,
        _owner: &str,
        name_or_id: &str,
    ) -> StorageResult<Bucket> {
        if name_or_id == self.bucket.name_or_id() || name_or_id == self.bucket.id {
            Ok(self.bucket.clone())
        } else {
            Err(StorageError::NotFound(format!("bucket {name_or_id}")))
        }
    }
}

/// Storage facade whose only bucket is served by `provider`.
pub async fn memory_storage(provider: Arc<MemoryProvider>) -> Storage {
    memory_storage_with(provider, StorageConfig::test()).await
}

pub async fn memory_storage_with(provider: Arc<MemoryProvider>, config: StorageConfig) -> Storage {
    let bucket = test_bucket(ProviderKind::Aws);
    let issuer = StaticIssuer::new(make_creds(ProviderKind::Aws, &[], 3600));
    let registry = ProviderRegistry::empty(issuer, config.clone());
    registry.insert(provider).await;
    let resolver = Arc::new(StaticResolver {
        endpoint: Url::parse("http://127.0.0.1:9").unwrap(),
        bucket,
    });
    Storage::with_registry(config, resolver, registry, None).unwrap()
}

/// `blob://default/alice/photos/<key>`
pub fn blob_url(key: &str) -> Url {
    Url::parse(&format!("blob://default/alice/photos/{key}")).unwrap()
}

/// Writes `files` (relative path, contents) under `root`, creating parents.
pub fn write_tree(root: &Path, files: &[(&str, &[u8])]) {
    for (rel, data) in files {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        std::fs::write(path, data).unwrap();
    }
}

pub fn an_hour_ago() -> DateTime<Utc> {
    Utc::now() - Duration::hours(1)
}

/// One progress callback as observed by [`RecordingSink`].
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Start { src: String, dst: String, size: u64 },
    Step { src: String, current: u64, size: u64 },
    Complete { src: String, size: u64 },
    EnterDir { src: String },
    LeaveDir { src: String },
    Fail { src: String, message: String },
    Delete { uri: String, is_dir: bool },
}

/// Sink recording every callback in delivery order.
#[derive(Default)]
pub struct RecordingSink {
    pub events: Vec<Event>,
}

impl RecordingSink {
    pub fn failures(&self) -> Vec<&Event> {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Fail { .. }))
            .collect()
    }

    pub fn completed(&self) -> usize {
        self.events
            .iter()
            .filter(|e| matches!(e, Event::Complete { .. }))
            .count()
    }
}

impl ProgressSink for RecordingSink {
    fn start(&mut self, src: &Url, dst: &Url, size: u64) {
        self.events.push(Event::Start {
            src: src.to_string(),
            dst: dst.to_string(),
            size,
        });
    }

    fn step(&mut self, src: &Url, _dst: &Url, current: u64, size: u64) {
        self.events.push(Event::Step {
            src: src.to_string(),
            current,
            size,
        });
    }

    fn complete(&mut self, src: &Url, _dst: &Url, size: u64) {
        self.events.push(Event::Complete {
            src: src.to_string(),
            size,
        });
    }

    fn enter_dir(&mut self, src: &Url, _dst: &Url) {
        self.events.push(Event::EnterDir {
            src: src.to_string(),
        });
    }

    fn leave_dir(&mut self, src: &Url, _dst: &Url) {
        self.events.push(Event::LeaveDir {
            src: src.to_string(),
        });
    }

    fn fail(&mut self, src: &Url, _dst: &Url, message: &str) {
        self.events.push(Event::Fail {
            src: src.to_string(),
            message: message.to_string(),
        });
    }

    fn delete(&mut self, uri: &Url, is_dir: bool) {
        self.events.push(Event::Delete {
            uri: uri.to_string(),
            is_dir,
        });
    }
}

/// Routes crate logs to the test harness. Safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new("stratus_storage=debug"))
        .with_test_writer()
        .try_init();
}

/// An HTTP `Date` header value `offset_secs` away from now.
pub fn http_date(offset_secs: i64) -> String {
    (Utc::now() + Duration::seconds(offset_secs))
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}
