//! Platform storage adapter against a mock `?op=` REST API, driven through
//! the storage facade.

mod support;

use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use stratus_storage::http::HttpClient;
use stratus_storage::{
    BearerTokenSigner, ClockSkew, FileOutcome, FileSystem, NoopProgress, PlatformFs,
    ProviderKind, RemotePath, Storage, StorageConfig, StorageError, TransferOptions,
};
use support::{
    Event, RecordingSink, StaticIssuer, StaticResolver, http_date, init_tracing, make_creds,
    test_bucket, write_tree,
};
use url::Url;
use wiremock::matchers::{header, method, path, query_param, query_param_is_missing};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn storage(server: &MockServer) -> Storage {
    init_tracing();
    let resolver = Arc::new(StaticResolver {
        endpoint: Url::parse(&server.uri()).unwrap(),
        bucket: test_bucket(ProviderKind::Aws),
    });
    let issuer = StaticIssuer::new(make_creds(ProviderKind::Aws, &[], 3600));
    let signer = Arc::new(BearerTokenSigner::new("tok").unwrap());
    Storage::new(StorageConfig::test(), resolver, issuer, Some(signer)).unwrap()
}

fn storage_url(path: &str) -> Url {
    Url::parse(&format!("storage://default/alice/{path}")).unwrap()
}

fn file_status(kind: &str, length: u64, suffix: &str) -> serde_json::Value {
    json!({
        "pathSuffix": suffix,
        "type": kind,
        "length": length,
        "modificationTime": chrono::Utc::now().timestamp_millis(),
    })
}

async fn mount_status(server: &MockServer, at: &str, status: serde_json::Value) {
    Mock::given(method("GET"))
        .and(path(at))
        .and(query_param("op", "GETFILESTATUS"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "FileStatus": status })))
        .mount(server)
        .await;
}

async fn mount_missing(server: &MockServer, at: &str) {
    Mock::given(method("GET"))
        .and(path(at))
        .and(query_param("op", "GETFILESTATUS"))
        .respond_with(ResponseTemplate::new(404).set_body_string("File does not exist"))
        .mount(server)
        .await;
}

// ── Files ──

#[tokio::test]
async fn download_file_opens_from_start() {
    let server = MockServer::start().await;
    mount_status(&server, "/v1/alice/data/hello.txt", file_status("FILE", 5, "")).await;
    Mock::given(method("GET"))
        .and(path("/v1/alice/data/hello.txt"))
        .and(query_param("op", "OPEN"))
        .and(query_param_is_missing("offset"))
        .and(header("authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"hello".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let dst = dir.path().join("hello.txt");
    let outcome = storage(&server)
        .download_file(&storage_url("data/hello.txt"), &dst, &TransferOptions::default(), &mut NoopProgress)
        .await
        .unwrap();

    assert_eq!(outcome, FileOutcome::Copied { offset: 0, bytes: 5 });
    assert_eq!(std::fs::read(&dst).unwrap(), b"hello");
}

#[tokio::test]
async fn continue_upload_appends_the_missing_tail() {
    let server = MockServer::start().await;
    mount_status(&server, "/v1/alice/data/log.txt", file_status("FILE", 4, "")).await;
    Mock::given(method("PATCH"))
        .and(path("/v1/alice/data/log.txt"))
        .and(query_param("op", "WRITE"))
        .and(query_param("offset", "4"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/v1/alice/data/log.txt"))
        .and(query_param("op", "CREATE"))
        .respond_with(ResponseTemplate::new(201))
        .expect(0)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path(), &[("log.txt", b"abcdefgh")]);
    let src = dir.path().join("log.txt");
    std::fs::File::options()
        .write(true)
        .open(&src)
        .unwrap()
        .set_modified(SystemTime::now() - Duration::from_secs(3600))
        .unwrap();

    let options = TransferOptions {
        continue_transfer: true,
        ..TransferOptions::default()
    };
    let outcome = storage(&server)
        .upload_file(&src, &storage_url("data/log.txt"), &options, &mut NoopProgress)
        .await
        .unwrap();
    assert_eq!(outcome, FileOutcome::Copied { offset: 4, bytes: 4 });

    let requests = server.received_requests().await.unwrap();
    let patch = requests
        .iter()
        .find(|r| r.method.as_str() == "PATCH")
        .unwrap();
    assert_eq!(patch.body, b"efgh");
}

#[tokio::test]
async fn new_upload_creates_with_overwrite() {
    let server = MockServer::start().await;
    mount_missing(&server, "/v1/alice/data/new.txt").await;
    mount_status(&server, "/v1/alice/data", file_status("DIRECTORY", 0, "")).await;
    Mock::given(method("PUT"))
        .and(path("/v1/alice/data/new.txt"))
        .and(query_param("op", "CREATE"))
        .and(query_param("overwrite", "true"))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    write_tree(dir.path(), &[("new.txt", b"fresh")]);
    let outcome = storage(&server)
        .upload_file(
            &dir.path().join("new.txt"),
            &storage_url("data/new.txt"),
            &TransferOptions::default(),
            &mut NoopProgress,
        )
        .await
        .unwrap();
    assert_eq!(outcome, FileOutcome::Copied { offset: 0, bytes: 5 });
}

// ── Directories ──

#[tokio::test]
async fn download_dir_walks_ndjson_listings() {
    let server = MockServer::start().await;
    mount_status(&server, "/v1/alice/data", file_status("DIRECTORY", 0, "")).await;
    let top = [
        file_status("FILE", 3, "a.txt").to_string(),
        file_status("DIRECTORY", 0, "sub").to_string(),
    ]
    .join("\n");
    Mock::given(method("GET"))
        .and(path("/v1/alice/data"))
        .and(query_param("op", "LISTSTATUS"))
        .and(header("accept", "application/x-ndjson"))
        .respond_with(ResponseTemplate::new(200).set_body_string(top))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/alice/data/sub"))
        .and(query_param("op", "LISTSTATUS"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string(format!("{}\n", file_status("FILE", 2, "b.txt"))),
        )
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/alice/data/a.txt"))
        .and(query_param("op", "OPEN"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"aaa".to_vec()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/alice/data/sub/b.txt"))
        .and(query_param("op", "OPEN"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"bb".to_vec()))
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let out = dir.path().join("out");
    let summary = storage(&server)
        .download_dir(&storage_url("data"), &out, &TransferOptions::default(), &mut NoopProgress)
        .await
        .unwrap();

    assert_eq!(summary.files_copied, 2);
    assert_eq!(summary.bytes_copied, 5);
    assert_eq!(std::fs::read(out.join("a.txt")).unwrap(), b"aaa");
    assert_eq!(std::fs::read(out.join("sub/b.txt")).unwrap(), b"bb");
}

#[tokio::test]
async fn mkdir_checks_parent_then_creates() {
    let server = MockServer::start().await;
    mount_missing(&server, "/v1/alice/data/new").await;
    mount_status(&server, "/v1/alice/data", file_status("DIRECTORY", 0, "")).await;
    Mock::given(method("PUT"))
        .and(path("/v1/alice/data/new"))
        .and(query_param("op", "MKDIRS"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "boolean": true })))
        .expect(1)
        .mount(&server)
        .await;

    storage(&server)
        .mkdir(&storage_url("data/new"), false, false)
        .await
        .unwrap();
}

#[tokio::test]
async fn mkdir_under_a_file_is_rejected() {
    let server = MockServer::start().await;
    mount_missing(&server, "/v1/alice/notes.txt/new").await;
    mount_status(&server, "/v1/alice/notes.txt", file_status("FILE", 9, "")).await;
    Mock::given(method("PUT"))
        .and(query_param("op", "MKDIRS"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = storage(&server)
        .mkdir(&storage_url("notes.txt/new"), false, false)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::NotADirectory(_)));
}

#[tokio::test]
async fn rm_refuses_directories_without_recursive() {
    let server = MockServer::start().await;
    mount_status(&server, "/v1/alice/data", file_status("DIRECTORY", 0, "")).await;
    Mock::given(method("DELETE"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let err = storage(&server)
        .rm(&storage_url("data"), false, &mut NoopProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, StorageError::IsADirectory(_)));
}

#[tokio::test]
async fn rm_file_reports_the_deletion() {
    let server = MockServer::start().await;
    mount_status(&server, "/v1/alice/data/old.txt", file_status("FILE", 1, "")).await;
    Mock::given(method("DELETE"))
        .and(path("/v1/alice/data/old.txt"))
        .and(query_param("op", "DELETE"))
        .and(query_param("recursive", "false"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "boolean": true })))
        .expect(1)
        .mount(&server)
        .await;

    let mut sink = RecordingSink::default();
    storage(&server)
        .rm(&storage_url("data/old.txt"), false, &mut sink)
        .await
        .unwrap();
    assert_eq!(
        sink.events,
        vec![Event::Delete {
            uri: "storage://default/alice/data/old.txt".into(),
            is_dir: false,
        }]
    );
}

// ── Clock skew ──

#[tokio::test]
async fn server_dates_feed_the_skew_estimate() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v1/alice/data"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("date", http_date(-3600))
                .set_body_json(json!({ "FileStatus": file_status("DIRECTORY", 0, "") })),
        )
        .mount(&server)
        .await;

    let config = StorageConfig::test();
    let http = HttpClient::new(&config, Arc::new(ClockSkew::new()), None).unwrap();
    let fs = PlatformFs::new(http, Url::parse(&server.uri()).unwrap(), "default", "alice");
    let stat = fs.stat(&RemotePath::new("data")).await.unwrap();

    assert!(stat.is_dir());
    let (min, max) = fs.clock_skew();
    assert!(min <= max);
    assert!(max < -300.0, "max {max}");
}
