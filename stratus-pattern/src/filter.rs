//! Ordered include/exclude rule stack.
//!
//! Paths handed to [`FileFilter::matches`] are relative and `/`-separated;
//! directories carry a trailing `/`. Rules are evaluated newest-first and the
//! first rule whose prefix and pattern both match decides. Paths no rule
//! matches fall through to the default predicate.

use crate::error::{PatternError, PatternResult};
use crate::translate::compile;
use regex::Regex;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Fallback decision for paths no rule matches.
pub type DefaultPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// A single compiled rule.
#[derive(Clone)]
pub struct FilterRule {
    pub exclude: bool,
    /// Directory prefix (empty or ending in `/`) the rule is scoped under.
    pub prefix: String,
    pub pattern: String,
    matcher: Regex,
}

impl FilterRule {
    fn new(exclude: bool, pattern: &str, prefix: &str) -> PatternResult<Self> {
        // Patterns without an inner separator match at any depth; anchored
        // ones are relative to the prefix.
        let anchored = if pattern.trim_end_matches('/').contains('/') {
            pattern.trim_start_matches('/').to_string()
        } else {
            format!("**/{pattern}")
        };
        Ok(Self {
            exclude,
            prefix: normalize_prefix(prefix),
            pattern: pattern.to_string(),
            matcher: compile(&anchored)?,
        })
    }

    /// Returns true if the rule applies to `path`.
    pub fn applies_to(&self, path: &str) -> bool {
        path.strip_prefix(self.prefix.as_str())
            .is_some_and(|rest| self.matcher.is_match(rest))
    }
}

impl fmt::Debug for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FilterRule")
            .field("exclude", &self.exclude)
            .field("prefix", &self.prefix)
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Include/exclude filter over relative paths.
#[derive(Clone)]
pub struct FileFilter {
    rules: Vec<FilterRule>,
    default: DefaultPredicate,
    root: String,
}

impl Default for FileFilter {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FileFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileFilter")
            .field("rules", &self.rules)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

impl FileFilter {
    /// Creates a filter that includes everything no rule excludes.
    pub fn new() -> Self {
        Self::with_default(Arc::new(|_| true))
    }

    /// Creates a filter with a custom fallback predicate.
    pub fn with_default(default: DefaultPredicate) -> Self {
        Self {
            rules: Vec::new(),
            default,
            root: String::new(),
        }
    }

    /// Creates a child filter that defers to `parent` for unmatched paths.
    ///
    /// Rules added to the child are checked before anything in the parent,
    /// so an ignore file nested deeper in a tree takes precedence.
    pub fn chain(parent: Arc<FileFilter>) -> Self {
        Self::with_default(Arc::new(move |path| parent.matches(path)))
    }

    /// Remaps incoming paths under `root` before evaluation.
    ///
    /// Lets a filter built against one logical root be reused for paths
    /// relative to a subdirectory of it.
    pub fn rooted_at(mut self, root: &str) -> Self {
        self.root = normalize_prefix(root);
        self
    }

    /// Appends an exclusion rule.
    pub fn exclude(&mut self, pattern: &str) -> PatternResult<()> {
        self.append(true, pattern, "")
    }

    /// Appends an inclusion rule.
    pub fn include(&mut self, pattern: &str) -> PatternResult<()> {
        self.append(false, pattern, "")
    }

    /// Appends a rule scoped under `prefix`.
    pub fn append(&mut self, exclude: bool, pattern: &str, prefix: &str) -> PatternResult<()> {
        let rule = FilterRule::new(exclude, pattern, prefix)?;
        debug!(exclude, pattern, prefix = %rule.prefix, "added filter rule");
        self.rules.push(rule);
        Ok(())
    }

    /// Loads rules from an ignore file, scoped under `prefix`.
    pub fn read_from_file(&mut self, path: &Path, prefix: &str) -> PatternResult<()> {
        let data = std::fs::read(path).map_err(|source| PatternError::ReadFile {
            path: path.display().to_string(),
            source,
        })?;
        let text = String::from_utf8(data)
            .map_err(|_| PatternError::Encoding(path.display().to_string()))?;
        self.read_from_str(&text, prefix)
    }

    /// Loads rules from ignore-file contents, scoped under `prefix`.
    ///
    /// One rule per line. Blank lines and `#` comments are skipped, a leading
    /// `!` turns the rule into an inclusion, and unescaped trailing
    /// whitespace is stripped.
    pub fn read_from_str(&mut self, text: &str, prefix: &str) -> PatternResult<()> {
        for line in text.lines() {
            let line = line.strip_suffix('\r').unwrap_or(line);
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = strip_trailing_spaces(line);
            if line.is_empty() {
                continue;
            }
            match line.strip_prefix('!') {
                Some(pattern) => self.append(false, pattern, prefix)?,
                None => self.append(true, line, prefix)?,
            }
        }
        Ok(())
    }

    /// Returns true if `path` is included.
    pub fn matches(&self, path: &str) -> bool {
        let remapped;
        let path = if self.root.is_empty() {
            path
        } else {
            remapped = format!("{}{path}", self.root);
            remapped.as_str()
        };

        for rule in self.rules.iter().rev() {
            if rule.applies_to(path) {
                return !rule.exclude;
            }
        }
        (self.default)(path)
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_start_matches('/');
    if trimmed.is_empty() || trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    }
}

/// Strips trailing spaces and tabs unless escaped with a backslash.
fn strip_trailing_spaces(line: &str) -> &str {
    let bytes = line.as_bytes();
    let mut end = bytes.len();
    while end > 0 && matches!(bytes[end - 1], b' ' | b'\t') {
        let mut backslashes = 0;
        while backslashes < end - 1 && bytes[end - 2 - backslashes] == b'\\' {
            backslashes += 1;
        }
        if backslashes % 2 == 1 {
            break;
        }
        end -= 1;
    }
    &line[..end]
}
