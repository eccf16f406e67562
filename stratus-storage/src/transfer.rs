//! Transfer engine: file and directory sync between two [`FileSystem`]s.
//!
//! Each file goes through `resume decision -> body transfer -> complete`.
//! The decision compares source and destination metadata, correcting
//! modification times by each side's measured clock skew; the body is
//! streamed chunk by chunk with progress reported through a
//! [`ProgressReporter`] and the whole attempt wrapped in [`retry`].
//!
//! Directories are walked depth-first. All entries of one level run
//! concurrently and are awaited together; the first fatal failure drops the
//! in-flight siblings. A shared semaphore caps open handles across the whole
//! engine.

use crate::config::StorageConfig;
use crate::error::{StorageError, StorageResult};
use crate::fs::FileSystem;
use crate::progress::ProgressReporter;
use crate::retry::{RetryPolicy, RetrySignal, retry};
use crate::types::{ByteStream, EntryKind, Stat};
use futures::future::{BoxFuture, try_join_all};
use futures::{FutureExt, StreamExt, TryStreamExt};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use stratus_pattern::FileFilter;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use url::Url;

/// Caller intent for one transfer.
#[derive(Clone, Debug)]
pub struct TransferOptions {
    /// Skip files whose destination is at least as new as the source.
    pub update: bool,
    /// Like `update`, and resume partially written destinations.
    pub continue_transfer: bool,
    /// Replace existing destinations when neither `update` nor
    /// `continue_transfer` is set. When false such a file fails `Conflict`.
    pub overwrite: bool,
    /// Relative-path filter for directory transfers.
    pub filter: Option<Arc<FileFilter>>,
    /// Names of ignore files loaded automatically at every directory level.
    pub ignore_file_names: Vec<String>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            update: false,
            continue_transfer: false,
            overwrite: true,
            filter: None,
            ignore_file_names: Vec::new(),
        }
    }
}

/// Where a file transfer should start, if at all.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResumeDecision {
    Skip,
    Start(u64),
}

/// Result of one file transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FileOutcome {
    Skipped,
    Copied { offset: u64, bytes: u64 },
}

/// Counters for a directory transfer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TransferSummary {
    pub files_copied: u64,
    pub files_skipped: u64,
    pub bytes_copied: u64,
    /// Entries reported through `fail` without aborting the transfer.
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    copied: AtomicU64,
    skipped: AtomicU64,
    bytes: AtomicU64,
    failures: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Skipped => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
            }
            FileOutcome::Copied { bytes, .. } => {
                self.copied.fetch_add(1, Ordering::Relaxed);
                self.bytes.fetch_add(bytes, Ordering::Relaxed);
            }
        }
    }

    fn failed(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self) -> TransferSummary {
        TransferSummary {
            files_copied: self.copied.load(Ordering::Relaxed),
            files_skipped: self.skipped.load(Ordering::Relaxed),
            bytes_copied: self.bytes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}

/// True if the destination is certainly at least as new as the source.
///
/// Each mtime is moved onto the local clock using the skew bounds of the
/// server that stamped it, taking the least favourable end of each range;
/// `tolerance` covers backends that truncate timestamps.
fn destination_is_newer<S, D>(
    source: &Stat<S>,
    source_skew: (f64, f64),
    destination: &Stat<D>,
    destination_skew: (f64, f64),
    tolerance: f64,
) -> bool {
    let (Some(src), Some(dst)) = (source.mtime_secs(), destination.mtime_secs()) else {
        return false;
    };
    let destination_earliest = dst - destination_skew.1;
    let source_latest = src + tolerance - source_skew.0;
    destination_earliest >= source_latest
}

/// Picks the resume offset for one file.
pub fn resume_decision<S, D>(
    source: &Stat<S>,
    source_skew: (f64, f64),
    destination: Option<&Stat<D>>,
    destination_skew: (f64, f64),
    options: &TransferOptions,
    tolerance: f64,
) -> StorageResult<ResumeDecision> {
    let Some(destination) = destination else {
        return Ok(ResumeDecision::Start(0));
    };

    if !options.update && !options.continue_transfer {
        return if options.overwrite {
            Ok(ResumeDecision::Start(0))
        } else {
            Err(StorageError::Conflict(format!(
                "{}: destination already exists",
                destination.name
            )))
        };
    }

    let newer = destination_is_newer(
        source,
        source_skew,
        destination,
        destination_skew,
        tolerance,
    );
    if !newer {
        return Ok(ResumeDecision::Start(0));
    }
    if !options.continue_transfer || destination.size == source.size {
        return Ok(ResumeDecision::Skip);
    }
    if destination.size < source.size {
        return Ok(ResumeDecision::Start(destination.size));
    }
    Ok(ResumeDecision::Start(0))
}

/// Reports chunk progress and signals the retry helper once bytes flow.
fn track_progress(
    body: ByteStream,
    signal: RetrySignal,
    progress: ProgressReporter,
    urls: (Url, Url),
    offset: u64,
    size: u64,
) -> ByteStream {
    let mut current = offset;
    let mut first = true;
    body.inspect_ok(move |chunk| {
        if first && !chunk.is_empty() {
            signal.reset();
            first = false;
        }
        current += chunk.len() as u64;
        progress.step(&urls.0, &urls.1, current, size);
    })
    .boxed()
}

async fn read_text<S: FileSystem>(fs: &S, path: &S::Path) -> StorageResult<String> {
    let mut body = fs.read_chunks(path, 0).await?;
    let mut data = Vec::new();
    while let Some(chunk) = body.next().await {
        data.extend_from_slice(&chunk?);
    }
    String::from_utf8(data)
        .map_err(|_| StorageError::Validation(format!("{path:?}: ignore file is not UTF-8")))
}

/// Drives file and directory transfers with bounded concurrency.
pub struct TransferEngine {
    handles: Arc<Semaphore>,
    retry: RetryPolicy,
    config: StorageConfig,
}

impl TransferEngine {
    pub fn new(config: StorageConfig) -> Self {
        Self {
            handles: Arc::new(Semaphore::new(config.max_open_handles.max(1))),
            retry: RetryPolicy::from_config(&config),
            config,
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    /// Copies one file from `src` to `dst`.
    pub async fn transfer_file<S, D>(
        &self,
        src_fs: &S,
        src: &S::Path,
        dst_fs: &D,
        dst: &D::Path,
        options: &TransferOptions,
        progress: &ProgressReporter,
    ) -> StorageResult<FileOutcome>
    where
        S: FileSystem,
        D: FileSystem,
    {
        let stat = src_fs.stat(src).await?;
        match stat.kind {
            EntryKind::File => {}
            EntryKind::Directory => {
                return Err(StorageError::IsADirectory(src_fs.to_url(src)?.to_string()));
            }
            EntryKind::Other => {
                return Err(StorageError::Validation(format!(
                    "{}: not a regular file",
                    src_fs.to_url(src)?
                )));
            }
        }
        self.copy_file(src_fs, &stat, dst_fs, dst, options, progress)
            .await
    }

    /// Copies the tree under `src` into `dst`, creating `dst` if needed.
    pub async fn transfer_dir<S, D>(
        &self,
        src_fs: &S,
        src: &S::Path,
        dst_fs: &D,
        dst: &D::Path,
        options: &TransferOptions,
        progress: &ProgressReporter,
    ) -> StorageResult<TransferSummary>
    where
        S: FileSystem,
        D: FileSystem,
    {
        if !src_fs.stat(src).await?.is_dir() {
            return Err(StorageError::NotADirectory(src_fs.to_url(src)?.to_string()));
        }
        let filter = options
            .filter
            .clone()
            .unwrap_or_else(|| Arc::new(FileFilter::new()));
        let counters = Counters::default();

        self.walk(
            Level {
                src_fs,
                dst_fs,
                options,
                progress,
                counters: &counters,
            },
            src.clone(),
            dst.clone(),
            String::new(),
            filter,
            true,
        )
        .await?;

        let summary = counters.summary();
        info!(
            copied = summary.files_copied,
            skipped = summary.files_skipped,
            failed = summary.failures,
            bytes = summary.bytes_copied,
            "directory transfer finished"
        );
        Ok(summary)
    }

    /// Destination metadata, or `None` if absent. Fails on a shape mismatch.
    async fn destination_state<D: FileSystem>(
        dst_fs: &D,
        dst: &D::Path,
        dst_url: &Url,
    ) -> StorageResult<Option<Stat<D::Path>>> {
        match dst_fs.stat(dst).await {
            Ok(stat) if stat.is_dir() => Err(StorageError::IsADirectory(dst_url.to_string())),
            Ok(stat) => Ok(Some(stat)),
            Err(e) if e.is_not_found() => {
                let parent = dst_fs.parent(dst);
                match dst_fs.stat(&parent).await {
                    Ok(p) if !p.is_dir() => Err(StorageError::NotADirectory(format!(
                        "parent of {dst_url}"
                    ))),
                    Err(e) if !e.is_not_found() => Err(e),
                    _ => Ok(None),
                }
            }
            Err(e) => Err(e),
        }
    }

    /// Offset for a retried attempt: the bytes already written when resuming
    /// is allowed, otherwise a rewrite from the start.
    async fn retry_offset<D: FileSystem>(
        dst_fs: &D,
        dst: &D::Path,
        size: u64,
        resume: bool,
    ) -> StorageResult<u64> {
        if !resume {
            return Ok(0);
        }
        match dst_fs.stat(dst).await {
            Ok(stat) if stat.is_file() && stat.size <= size => Ok(stat.size),
            Ok(_) => Ok(0),
            Err(e) if e.is_not_found() => Ok(0),
            Err(e) => Err(e),
        }
    }

    async fn copy_file<S, D>(
        &self,
        src_fs: &S,
        src_stat: &Stat<S::Path>,
        dst_fs: &D,
        dst: &D::Path,
        options: &TransferOptions,
        progress: &ProgressReporter,
    ) -> StorageResult<FileOutcome>
    where
        S: FileSystem,
        D: FileSystem,
    {
        let src_url = &src_fs.to_url(&src_stat.path)?;
        let dst_url = &dst_fs.to_url(dst)?;
        let what = format!("{src_url} -> {dst_url}");
        let size = src_stat.size;

        let resumable = src_fs.supports_offset_read() && dst_fs.supports_offset_write();
        let dst_stat = retry(&self.retry, &format!("stat {dst_url}"), |_| {
            Self::destination_state(dst_fs, dst, dst_url)
        })
        .await?;
        let decision = resume_decision(
            src_stat,
            src_fs.clock_skew(),
            dst_stat.as_ref(),
            dst_fs.clock_skew(),
            options,
            self.config.mtime_tolerance_secs,
        )?;
        let first_offset = match decision {
            ResumeDecision::Skip => {
                debug!("skipping {src_url}: destination is up to date");
                return Ok(FileOutcome::Skipped);
            }
            ResumeDecision::Start(offset) if offset > 0 && !resumable => {
                debug!("{dst_url} cannot be resumed, rewriting from the start");
                0
            }
            ResumeDecision::Start(offset) => offset,
        };

        let mut first_offset = Some(first_offset);
        let started = &AtomicBool::new(false);

        retry(&self.retry, &what, |signal| {
            let first_offset = first_offset.take();
            async move {
                // the destination now holds our own partial write, so later
                // attempts only pick the offset and never skip or conflict
                let offset = match first_offset {
                    Some(offset) => offset,
                    None => {
                        let resume = resumable && options.continue_transfer;
                        Self::retry_offset(dst_fs, dst, size, resume).await?
                    }
                };

                let _permit = self
                    .handles
                    .acquire()
                    .await
                    .map_err(|_| StorageError::Cancelled)?;
                if !started.swap(true, Ordering::Relaxed) {
                    progress.start(src_url, dst_url, size);
                }
                if offset > 0 {
                    info!("resuming {dst_url} at byte {offset} of {size}");
                }

                let body = src_fs.read_chunks(&src_stat.path, offset).await?;
                let body = track_progress(
                    body,
                    signal,
                    progress.clone(),
                    (src_url.clone(), dst_url.clone()),
                    offset,
                    size,
                );
                let bytes = dst_fs.write_chunks(dst, body, offset).await?;
                if offset + bytes != size {
                    warn!("{src_url} changed during transfer: expected {size} bytes, wrote {}", offset + bytes);
                }
                progress.complete(src_url, dst_url, offset + bytes);
                Ok(FileOutcome::Copied { offset, bytes })
            }
        })
        .await
    }

    fn walk<'a, S, D>(
        &'a self,
        level: Level<'a, S, D>,
        src: S::Path,
        dst: D::Path,
        rel: String,
        filter: Arc<FileFilter>,
        top: bool,
    ) -> BoxFuture<'a, StorageResult<()>>
    where
        S: FileSystem,
        D: FileSystem,
    {
        async move {
            let src_url = level.src_fs.to_url(&src)?;
            let dst_url = level.dst_fs.to_url(&dst)?;
            match self.walk_level(level, &src, &dst, &rel, filter).await {
                // a broken subtree is reported and skipped; fatal errors and
                // failures of the root itself abort the transfer
                Err(e) if !top && !e.is_fatal() => {
                    warn!("skipping {src_url}: {e}");
                    level.counters.failed();
                    level.progress.fail(&src_url, &dst_url, &e.to_string());
                    Ok(())
                }
                other => other,
            }
        }
        .boxed()
    }

    async fn walk_level<'a, S, D>(
        &'a self,
        level: Level<'a, S, D>,
        src: &S::Path,
        dst: &D::Path,
        rel: &str,
        filter: Arc<FileFilter>,
    ) -> StorageResult<()>
    where
        S: FileSystem,
        D: FileSystem,
    {
        let Level {
            src_fs,
            dst_fs,
            options,
            progress,
            counters,
        } = level;
        let src_url = src_fs.to_url(src)?;
        let dst_url = dst_fs.to_url(dst)?;
        progress.enter_dir(&src_url, &dst_url);

        if dst_fs.implicit_directories() {
            if dst_fs.is_file(dst).await? {
                return Err(StorageError::NotADirectory(dst_url.to_string()));
            }
        } else {
            retry(&self.retry, &format!("mkdir {dst_url}"), |_| {
                dst_fs.mkdir(dst, true, true)
            })
            .await?;
        }
        let entries: Vec<Stat<S::Path>> = retry(&self.retry, &format!("list {src_url}"), |_| {
            src_fs.iter_dir(src).try_collect()
        })
        .await?;

        let is_ignore_file = |entry: &Stat<S::Path>| {
            entry.is_file() && options.ignore_file_names.iter().any(|n| *n == entry.name)
        };
        let mut filter = filter;
        if entries.iter().any(is_ignore_file) {
            let mut nested = FileFilter::chain(filter.clone());
            for entry in entries.iter().filter(|e| is_ignore_file(e)) {
                let text = read_text(src_fs, &entry.path).await?;
                nested.read_from_str(&text, rel)?;
                debug!("loaded ignore file {}{}", rel, entry.name);
            }
            filter = Arc::new(nested);
        }

        let mut tasks: Vec<BoxFuture<'a, StorageResult<()>>> = Vec::new();
        for entry in entries {
            if is_ignore_file(&entry) {
                continue;
            }
            let child_rel = if entry.is_dir() {
                format!("{rel}{}/", entry.name)
            } else {
                format!("{rel}{}", entry.name)
            };
            if !filter.matches(&child_rel) {
                debug!("excluded {child_rel}");
                continue;
            }
            let dst_child = dst_fs.child(dst, &entry.name);

            match entry.kind {
                EntryKind::Directory => {
                    tasks.push(self.walk(
                        level,
                        entry.path,
                        dst_child,
                        child_rel,
                        filter.clone(),
                        false,
                    ));
                }
                EntryKind::File => {
                    tasks.push(self.file_task(level, entry, dst_child).boxed());
                }
                EntryKind::Other => {
                    let src_child = src_fs.to_url(&entry.path)?;
                    let dst_child = dst_fs.to_url(&dst_child)?;
                    warn!("skipping {src_child}: not a regular file");
                    counters.failed();
                    progress.fail(&src_child, &dst_child, "not a regular file");
                }
            }
        }

        try_join_all(tasks).await?;
        progress.leave_dir(&src_url, &dst_url);
        Ok(())
    }

    async fn file_task<'a, S, D>(
        &'a self,
        level: Level<'a, S, D>,
        entry: Stat<S::Path>,
        dst: D::Path,
    ) -> StorageResult<()>
    where
        S: FileSystem,
        D: FileSystem,
    {
        match self
            .copy_file(level.src_fs, &entry, level.dst_fs, &dst, level.options, level.progress)
            .await
        {
            Ok(outcome) => {
                level.counters.record(outcome);
                Ok(())
            }
            Err(e) if !e.is_fatal() => {
                let src_url = level.src_fs.to_url(&entry.path)?;
                let dst_url = level.dst_fs.to_url(&dst)?;
                warn!("failed to copy {src_url}: {e}");
                level.counters.failed();
                level.progress.fail(&src_url, &dst_url, &e.to_string());
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Borrowed context shared by every level of one directory transfer.
struct Level<'a, S, D> {
    src_fs: &'a S,
    dst_fs: &'a D,
    options: &'a TransferOptions,
    progress: &'a ProgressReporter,
    counters: &'a Counters,
}

impl<S, D> Clone for Level<'_, S, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<S, D> Copy for Level<'_, S, D> {}
