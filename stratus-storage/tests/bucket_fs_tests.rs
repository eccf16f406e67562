//! Filesystem semantics over a bucket: directory markers, inferred
//! directories and the mkdir / rm / rmdir rules.

mod support;

use bytes::Bytes;
use futures::{StreamExt, TryStreamExt, stream};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use stratus_storage::{
    BucketFs, EntryKind, FileSystem, MemoryProvider, ProviderKind, RemotePath, Stat,
    StorageError,
};
use support::test_bucket;

fn bucket_fs(keys: &[(&str, &'static [u8])]) -> (Arc<MemoryProvider>, BucketFs) {
    let provider = Arc::new(MemoryProvider::new(test_bucket(ProviderKind::Minio)));
    for (key, data) in keys {
        provider.insert(key, Bytes::from_static(data));
    }
    (provider.clone(), BucketFs::new(provider))
}

fn path(p: &str) -> RemotePath {
    RemotePath::new(p)
}

async fn children(fs: &BucketFs, dir: &str) -> Vec<(String, EntryKind)> {
    let dir = path(dir);
    let stats: Vec<Stat<RemotePath>> = fs.iter_dir(&dir).try_collect().await.unwrap();
    stats.into_iter().map(|s| (s.name, s.kind)).collect()
}

// ── stat ──

#[tokio::test]
async fn stat_distinguishes_files_markers_and_inferred_dirs() {
    let (_, fs) = bucket_fs(&[
        ("file.txt", b"12345"),
        ("marked/", b""),
        ("implied/child.txt", b"x"),
    ]);

    let file = fs.stat(&path("file.txt")).await.unwrap();
    assert_eq!(file.kind, EntryKind::File);
    assert_eq!(file.size, 5);
    assert!(file.modification_time.is_some());

    assert!(fs.stat(&path("marked")).await.unwrap().is_dir());
    assert!(fs.stat(&path("implied")).await.unwrap().is_dir());
    assert!(fs.stat(&RemotePath::root()).await.unwrap().is_dir());

    let err = fs.stat(&path("nope")).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(!fs.exists(&path("nope")).await.unwrap());
}

#[tokio::test]
async fn iter_dir_lists_one_level() {
    let (_, fs) = bucket_fs(&[
        ("d/", b""),
        ("d/a.txt", b"a"),
        ("d/sub/b.txt", b"b"),
        ("d/sub/deeper/c.txt", b"c"),
    ]);

    assert_eq!(
        children(&fs, "d").await,
        vec![
            ("a.txt".to_string(), EntryKind::File),
            ("sub".to_string(), EntryKind::Directory),
        ]
    );
}

// ── mkdir ──

#[tokio::test]
async fn mkdir_writes_a_marker_once() {
    let (provider, fs) = bucket_fs(&[]);

    fs.mkdir(&path("new"), false, false).await.unwrap();
    assert_eq!(provider.keys(), vec!["new/".to_string()]);
    assert!(fs.is_dir(&path("new")).await.unwrap());

    fs.mkdir(&path("new"), false, true).await.unwrap();
    let err = fs.mkdir(&path("new"), false, false).await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict(_)));
}

#[tokio::test]
async fn mkdir_on_a_file_conflicts() {
    let (_, fs) = bucket_fs(&[("taken", b"x")]);
    let err = fs.mkdir(&path("taken"), true, true).await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict(_)));
}

#[tokio::test]
async fn mkdir_requires_parent_unless_parents() {
    let (provider, fs) = bucket_fs(&[]);

    let err = fs.mkdir(&path("a/b"), false, false).await.unwrap_err();
    assert!(err.is_not_found());
    assert!(provider.keys().is_empty());

    fs.mkdir(&path("a/b"), true, false).await.unwrap();
    assert!(fs.is_dir(&path("a/b")).await.unwrap());
}

#[tokio::test]
async fn mkdir_under_a_file_is_not_a_directory() {
    let (_, fs) = bucket_fs(&[("f", b"x")]);
    let err = fs.mkdir(&path("f/child"), false, false).await.unwrap_err();
    assert!(matches!(err, StorageError::NotADirectory(_)));
}

// ── write / read ──

#[tokio::test]
async fn write_then_read_with_offset() {
    let (_, fs) = bucket_fs(&[]);
    let body = stream::iter(vec![
        Ok(Bytes::from_static(b"hello ")),
        Ok(Bytes::from_static(b"bucket")),
    ])
    .boxed();

    let written = fs.write_chunks(&path("greeting"), body, 0).await.unwrap();
    assert_eq!(written, 12);

    let tail: Vec<Bytes> = fs
        .read_chunks(&path("greeting"), 6)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();
    assert_eq!(tail.concat(), b"bucket");
}

#[tokio::test]
async fn offset_writes_are_rejected() {
    let (_, fs) = bucket_fs(&[("f", b"abc")]);
    assert!(!fs.supports_offset_write());

    let body = stream::iter(vec![Ok(Bytes::from_static(b"d"))]).boxed();
    let err = fs.write_chunks(&path("f"), body, 3).await.unwrap_err();
    assert!(matches!(err, StorageError::Validation(_)));
}

// ── rm / rmdir ──

#[tokio::test]
async fn rm_refuses_directories() {
    let (_, fs) = bucket_fs(&[("d/x", b"1")]);
    let err = fs.rm(&path("d")).await.unwrap_err();
    assert!(matches!(err, StorageError::IsADirectory(_)));
}

#[tokio::test]
async fn rmdir_refuses_files_and_non_empty_dirs() {
    let (_, fs) = bucket_fs(&[("f", b"1"), ("d/", b""), ("d/x", b"1")]);

    let err = fs.rmdir(&path("f"), false).await.unwrap_err();
    assert!(matches!(err, StorageError::NotADirectory(_)));

    let err = fs.rmdir(&path("d"), false).await.unwrap_err();
    assert!(matches!(err, StorageError::Conflict(_)));
}

#[tokio::test]
async fn rmdir_of_empty_marker_removes_it() {
    let (provider, fs) = bucket_fs(&[("empty/", b""), ("other", b"1")]);
    fs.rmdir(&path("empty"), false).await.unwrap();
    assert_eq!(provider.keys(), vec!["other".to_string()]);
}

#[tokio::test]
async fn recursive_rmdir_removes_the_whole_tree() {
    let (provider, fs) = bucket_fs(&[
        ("t/", b""),
        ("t/a", b"1"),
        ("t/sub/", b""),
        ("t/sub/b", b"2"),
        ("tail", b"keep"),
    ]);

    fs.rmdir(&path("t"), true).await.unwrap();
    assert_eq!(provider.keys(), vec!["tail".to_string()]);
}

#[tokio::test]
async fn to_url_uses_the_bucket_uri() {
    let (_, fs) = bucket_fs(&[]);
    let url = fs.to_url(&path("a/b.txt")).unwrap();
    assert_eq!(url.as_str(), "blob://default/alice/photos/a/b.txt");
}
