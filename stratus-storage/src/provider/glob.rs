//! Glob expansion over bucket keys.

use super::BucketProvider;
use crate::types::{BlobEntry, BlobStream};
use futures::StreamExt;
use std::collections::BTreeSet;
use stratus_pattern::{compile, is_magic};

/// Expands a shell glob against the keys of a bucket.
///
/// The pattern is walked one segment at a time: literal segments extend the
/// listing prefix without a request, magic segments list a single level and
/// keep the matching children, and a `**` segment switches to one recursive
/// listing matched against the rest of the pattern. A trailing `/` restricts
/// the final matches to directories.
pub fn glob_blobs<'a>(provider: &'a dyn BucketProvider, pattern: &'a str) -> BlobStream<'a> {
    let stream = async_stream::try_stream! {
        let trimmed = pattern.trim_start_matches('/');
        let dirs_only = trimmed.ends_with('/');
        let trimmed = trimmed.trim_end_matches('/');
        let segments: Vec<&str> = trimmed.split('/').collect();
        let mut prefixes = vec![String::new()];

        for (i, segment) in segments.iter().enumerate() {
            let last = i + 1 == segments.len();

            if *segment == "**" {
                let rest = compile(&segments[i..].join("/"))?;
                for prefix in &prefixes {
                    let mut listing = provider.list_blobs(prefix, true, None);
                    while let Some(entry) = listing.next().await {
                        let entry = entry?;
                        let matched = entry
                            .key()
                            .strip_prefix(prefix.as_str())
                            .is_some_and(|rel| !rel.is_empty() && rest.is_match(rel));
                        if matched && (!dirs_only || entry.is_dir()) {
                            yield entry;
                        }
                    }
                }
                break;
            }

            if !is_magic(segment) {
                if !last {
                    prefixes = prefixes.iter().map(|p| format!("{p}{segment}/")).collect();
                    continue;
                }
                for prefix in &prefixes {
                    let key = format!("{prefix}{segment}");
                    match provider.head_blob(&key).await {
                        Ok(entry) if !dirs_only || entry.is_dir() => yield entry,
                        Ok(_) => {}
                        Err(e) if e.is_not_found() => {
                            // no object; the name may still be an inferred directory
                            let dir = format!("{key}/");
                            let mut probe = provider.list_blobs(&dir, false, Some(1));
                            if let Some(found) = probe.next().await {
                                found?;
                                yield BlobEntry::CommonPrefix { key: dir.clone() };
                            }
                        }
                        Err(e) => Err::<(), _>(e)?,
                    }
                }
                break;
            }

            let matcher = compile(segment)?;
            let mut next = BTreeSet::new();
            for prefix in &prefixes {
                let mut listing = provider.list_blobs(prefix, false, None);
                while let Some(entry) = listing.next().await {
                    let entry = entry?;
                    let name = match entry.key().strip_prefix(prefix.as_str()) {
                        Some(rel) => rel.trim_end_matches('/').to_string(),
                        None => continue,
                    };
                    if name.is_empty() || !matcher.is_match(&name) {
                        continue;
                    }
                    if last {
                        if !dirs_only || entry.is_dir() {
                            yield entry;
                        }
                    } else if entry.is_dir() {
                        next.insert(format!("{prefix}{name}/"));
                    }
                }
            }
            prefixes = next.into_iter().collect();
        }
    };
    stream.boxed()
}
