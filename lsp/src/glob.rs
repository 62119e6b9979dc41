//! Glob expansion for multi-file diagnostics.
//!
//! Bare patterns (`*.rs`) match at any depth. Unclosed `{` groups are
//! closed. `.git` is always skipped and `node_modules` is skipped unless the
//! pattern names it. Ignore files are honored; when that leaves nothing, the
//! walk is repeated once without them.

use std::path::{Component, Path, PathBuf};

use globset::{GlobBuilder, GlobMatcher};
use ignore::WalkBuilder;

use crate::error::{LspError, Result};

/// Files matched by a pattern, capped at the requested maximum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobExpansion {
    pub files: Vec<PathBuf>,
    /// Matches found before the cap was applied.
    pub total: usize,
    /// False when the matches came from the retry without ignore rules.
    pub ignore_rules_applied: bool,
}

impl GlobExpansion {
    #[must_use]
    pub fn truncated(&self) -> bool {
        self.total > self.files.len()
    }
}

/// Normalize separators, add `**/` to bare patterns, and close any unclosed
/// `{` groups.
#[must_use]
pub fn normalize_pattern(pattern: &str) -> String {
    let normalized = pattern.trim().replace('\\', "/");
    let mut pattern = if normalized.contains('/') || normalized.starts_with("**") {
        normalized
    } else {
        format!("**/{normalized}")
    };
    let opens = pattern.matches('{').count();
    let closes = pattern.matches('}').count();
    for _ in closes..opens {
        pattern.push('}');
    }
    pattern
}

fn has_glob_meta(component: &str) -> bool {
    component.contains(['*', '?', '[', '{'])
}

/// Split a normalized pattern into its literal leading directory and the
/// glob remainder matched relative to it.
fn split_base(root: &Path, pattern: &str) -> (PathBuf, String) {
    let absolute = pattern.starts_with('/') || Path::new(pattern).is_absolute();
    let mut base = if absolute { PathBuf::new() } else { root.to_path_buf() };
    let parts: Vec<&str> = pattern.split('/').collect();
    let mut literal = 0;
    // The last component always stays in the remainder.
    while literal + 1 < parts.len() && !has_glob_meta(parts[literal]) {
        let part = parts[literal];
        if part.is_empty() && literal == 0 {
            base.push("/");
        } else if !part.is_empty() && part != "." {
            base.push(part);
        }
        literal += 1;
    }
    (base, parts[literal..].join("/"))
}

fn compile(pattern: &str, original: &str) -> Result<GlobMatcher> {
    let mut glob = GlobBuilder::new(pattern);
    glob.literal_separator(true);
    if cfg!(windows) {
        glob.case_insensitive(true);
    }
    glob.build()
        .map(|g| g.compile_matcher())
        .map_err(|e| LspError::Glob {
            pattern: original.to_string(),
            message: e.to_string(),
        })
}

/// Expand `pattern` under `root` into at most `max_targets` files, sorted by
/// path. Blocking: run it off the async executor.
pub fn expand(root: &Path, pattern: &str, max_targets: usize) -> Result<GlobExpansion> {
    let literal = if Path::new(pattern).is_absolute() {
        PathBuf::from(pattern)
    } else {
        root.join(pattern)
    };
    if !has_glob_meta(pattern) && literal.is_file() {
        return Ok(GlobExpansion {
            files: vec![literal],
            total: 1,
            ignore_rules_applied: true,
        });
    }

    let normalized = normalize_pattern(pattern);
    let (base, remainder) = split_base(root, &normalized);
    let matcher = compile(&remainder, pattern)?;
    let include_node_modules = normalized.contains("node_modules");

    let (matches, ignore_rules_applied) = match walk(&base, &matcher, include_node_modules, true) {
        found if !found.is_empty() => (found, true),
        _ => {
            tracing::debug!(pattern, "no matches with ignore rules; retrying without them");
            (walk(&base, &matcher, include_node_modules, false), false)
        }
    };

    let total = matches.len();
    let files = matches.into_iter().take(max_targets).collect();
    Ok(GlobExpansion {
        files,
        total,
        ignore_rules_applied,
    })
}

fn walk(base: &Path, matcher: &GlobMatcher, include_node_modules: bool, respect_ignore: bool) -> Vec<PathBuf> {
    if !base.is_dir() {
        return Vec::new();
    }
    let mut builder = WalkBuilder::new(base);
    builder
        .hidden(true)
        .git_ignore(respect_ignore)
        .git_global(respect_ignore)
        .git_exclude(respect_ignore)
        .ignore(respect_ignore)
        .parents(respect_ignore)
        .require_git(false)
        .sort_by_file_name(std::cmp::Ord::cmp)
        .filter_entry(move |entry| {
            let name = entry.file_name();
            name != ".git" && (include_node_modules || name != "node_modules")
        });

    let mut out = Vec::new();
    for entry in builder.build().flatten() {
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(base) else {
            continue;
        };
        if matcher.is_match(slash_path(relative)) {
            out.push(entry.into_path());
        }
    }
    out
}

fn slash_path(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
