// src/cli/context.rs — Context ingestion for `--context` paths
//
// A file is read as-is. A directory is walked: hidden and vendored
// directories are pruned, `.gitignore` at the walk root is honoured, and
// binary files are skipped. Files come back sorted by relative path.

use std::path::Path;

use glob::{MatchOptions, Pattern};
use walkdir::WalkDir;

use crate::infra::errors::RlmError;
use crate::tools::{is_skipped_dir, looks_binary};

const SEPARATOR: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

#[derive(Debug, Clone)]
pub struct ContextOptions {
    /// Lower-case extensions without the dot; empty keeps every file.
    pub extensions: Vec<String>,
    /// Globs matched against the path relative to the walk root.
    pub exclude: Vec<String>,
    pub respect_gitignore: bool,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            exclude: Vec::new(),
            respect_gitignore: true,
        }
    }
}

impl ContextOptions {
    fn keeps_extension(&self, path: &Path) -> bool {
        if self.extensions.is_empty() {
            return true;
        }
        path.extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .is_some_and(|e| {
                self.extensions
                    .iter()
                    .any(|want| want.trim_start_matches('.').eq_ignore_ascii_case(&e))
            })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ContextFile {
    /// Path relative to the walk root, `/`-separated.
    pub relative: String,
    pub text: String,
}

// ─── .gitignore ─────────────────────────────────────────────────

#[derive(Debug)]
struct IgnoreRule {
    pattern: Pattern,
    dir_only: bool,
    /// Matched against the whole relative path instead of the file name.
    anchored: bool,
}

/// The subset of `.gitignore` syntax that covers ordinary repositories:
/// globs, `**`, a leading `/` and a trailing `/`. Negations are ignored.
#[derive(Debug, Default)]
struct GitIgnore {
    rules: Vec<IgnoreRule>,
}

impl GitIgnore {
    fn load(root: &Path) -> Self {
        match std::fs::read_to_string(root.join(".gitignore")) {
            Ok(text) => Self::parse(&text),
            Err(_) => Self::default(),
        }
    }

    fn parse(text: &str) -> Self {
        let mut rules = Vec::new();
        for line in text.lines() {
            let line = line.trim_end();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if line.starts_with('!') {
                tracing::debug!("Negated .gitignore rule not supported: {}", line);
                continue;
            }
            let dir_only = line.ends_with('/');
            let body = line.trim_end_matches('/');
            let anchored = body.contains('/');
            let body = body.trim_start_matches('/');
            match Pattern::new(body) {
                Ok(pattern) => rules.push(IgnoreRule {
                    pattern,
                    dir_only,
                    anchored,
                }),
                Err(e) => tracing::debug!("Skipping .gitignore rule '{}': {}", line, e),
            }
        }
        Self { rules }
    }

    fn is_ignored(&self, relative: &str, is_dir: bool) -> bool {
        let name = relative.rsplit('/').next().unwrap_or(relative);
        self.rules.iter().any(|rule| {
            if rule.dir_only && !is_dir {
                return false;
            }
            if rule.anchored {
                rule.pattern.matches_with(relative, SEPARATOR)
            } else {
                rule.pattern.matches_with(name, SEPARATOR)
            }
        })
    }
}

// ─── Walk ───────────────────────────────────────────────────────

fn relative_path(root: &Path, path: &Path) -> String {
    path.strip_prefix(root)
        .unwrap_or(path)
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Collect the text files under `root`.
pub fn collect_directory(root: &Path, options: &ContextOptions) -> Result<Vec<ContextFile>, RlmError> {
    let exclude = options
        .exclude
        .iter()
        .map(|g| {
            Pattern::new(g)
                .map_err(|e| RlmError::Configuration(format!("invalid exclude glob '{g}': {e}")))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let ignore = if options.respect_gitignore {
        GitIgnore::load(root)
    } else {
        GitIgnore::default()
    };

    // Surface an unreadable root instead of returning nothing.
    std::fs::read_dir(root)?;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            if e.depth() == 0 || !e.file_type().is_dir() {
                return true;
            }
            !is_skipped_dir(&e.file_name().to_string_lossy())
                && !ignore.is_ignored(&relative_path(root, e.path()), true)
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!("Skipping unreadable context entry: {}", e);
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') || name.ends_with(".lock") {
            continue;
        }
        let relative = relative_path(root, entry.path());
        if !options.keeps_extension(entry.path())
            || ignore.is_ignored(&relative, false)
            || exclude.iter().any(|g| g.matches_with(&relative, SEPARATOR))
        {
            continue;
        }
        let bytes = match std::fs::read(entry.path()) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("Skipping context file {}: {}", relative, e);
                continue;
            }
        };
        if looks_binary(&bytes) {
            tracing::debug!("Skipping binary context file {}", relative);
            continue;
        }
        files.push(ContextFile {
            relative,
            text: String::from_utf8_lossy(&bytes).into_owned(),
        });
    }
    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    Ok(files)
}
