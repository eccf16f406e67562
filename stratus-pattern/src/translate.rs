//! Shell glob to regular expression translation.
//!
//! Semantics follow POSIX shell globbing over `/`-separated paths:
//!
//! - `*` matches any run of characters except `/`
//! - `?` matches exactly one character except `/`
//! - `**` as a whole segment matches zero or more segments
//! - `[...]` is a bracket expression; `[!...]` negates it
//! - `\x` matches `x` literally
//!
//! A pattern ending in `/` only matches directories (paths ending in `/`);
//! without it the trailing separator is optional.

use crate::error::{PatternError, PatternResult};
use regex::Regex;

/// Matches nothing. Used for bracket expressions whose ranges are all empty.
const NEVER: &str = r"(?:\b\B)";

/// Translates a shell glob into an unanchored regular expression source.
///
/// Malformed bracket expressions degrade to a literal `[`.
pub fn translate(pattern: &str) -> String {
    let pat: Vec<char> = pattern.chars().collect();
    let n = pat.len();
    let mut res = String::with_capacity(pattern.len() * 2);
    let mut i = 0;

    while i < n {
        let c = pat[i];
        i += 1;
        match c {
            '*' => {
                let segment_start = i == 1 || pat[i - 2] == '/';
                let whole_segment =
                    segment_start && i < n && pat[i] == '*' && (i + 1 == n || pat[i + 1] == '/');
                if whole_segment {
                    if i + 1 == n {
                        // trailing `**` swallows everything, including the separator
                        res.push_str(".*");
                        return res;
                    }
                    res.push_str("(?:.+/)?");
                    i += 2;
                } else {
                    while i < n && pat[i] == '*' {
                        i += 1;
                    }
                    res.push_str("[^/]*");
                }
            }
            '?' => res.push_str("[^/]"),
            '/' => res.push('/'),
            '[' => match bracket(&pat, i) {
                Some((class, next)) => {
                    res.push_str(&class);
                    i = next;
                }
                None => res.push_str(r"\["),
            },
            '\\' if i < n => {
                push_literal(&mut res, pat[i]);
                i += 1;
            }
            _ => push_literal(&mut res, c),
        }
    }

    if !pattern.ends_with('/') {
        res.push_str("/?");
    }
    res
}

/// Compiles a shell glob into a regex that must match the whole input.
pub fn compile(pattern: &str) -> PatternResult<Regex> {
    let source = format!("^(?s:{})$", translate(pattern));
    Regex::new(&source).map_err(|source| PatternError::InvalidPattern {
        pattern: pattern.to_string(),
        source,
    })
}

/// Returns true if the pattern contains glob metacharacters.
pub fn is_magic(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn push_literal(res: &mut String, c: char) {
    let mut buf = [0u8; 4];
    res.push_str(&regex::escape(c.encode_utf8(&mut buf)));
}

/// Parses a bracket expression whose body starts at `start` (just past `[`).
///
/// Returns the regex class and the index just past the closing `]`, or
/// `None` when the expression is unterminated.
fn bracket(pat: &[char], start: usize) -> Option<(String, usize)> {
    let n = pat.len();
    let mut j = start;
    if j < n && pat[j] == '!' {
        j += 1;
    }
    if j < n && pat[j] == ']' {
        j += 1;
    }
    while j < n && pat[j] != ']' {
        j += 1;
    }
    if j >= n {
        return None;
    }

    let body = &pat[start..j];
    let (negated, items) = match body.split_first() {
        Some(('!', rest)) => (true, rest),
        _ => (false, body),
    };

    // A `-` between two characters is a range operator. Everything else,
    // including a leading or trailing `-` and the second `-` in `a--z`-style
    // set differences, is literal.
    let mut members = String::new();
    let mut k = 0;
    while k < items.len() {
        let lo = items[k];
        if k + 2 < items.len() && items[k + 1] == '-' {
            let hi = items[k + 2];
            if lo <= hi {
                push_class_char(&mut members, lo);
                members.push('-');
                push_class_char(&mut members, hi);
            }
            k += 3;
        } else {
            push_class_char(&mut members, lo);
            k += 1;
        }
    }

    let class = match (negated, members.is_empty()) {
        (true, true) => "[^/]".to_string(),
        (false, true) => NEVER.to_string(),
        (true, false) => format!("[^/{members}]"),
        (false, false) => format!("[{members}]"),
    };
    Some((class, j + 1))
}

fn push_class_char(out: &mut String, c: char) {
    if matches!(c, '\\' | '[' | ']' | '^' | '-' | '&' | '~') {
        out.push('\\');
    }
    out.push(c);
}
