// src/tools/pattern.rs — Local line-level pattern search

use std::path::{Path, PathBuf};

use regex::RegexBuilder;
use walkdir::WalkDir;

use super::{is_skipped_dir, looks_binary, PatternHit, PatternOptions, PatternSearch};
use crate::infra::errors::RlmError;

/// Literal or regex search over files under a root directory. Hits come
/// back in walk order (files sorted by name within each directory).
pub struct LocalPatternSearch {
    root: PathBuf,
    max_hits: usize,
}

impl LocalPatternSearch {
    pub fn new(root: &Path, max_hits: usize) -> Self {
        Self {
            root: root.to_path_buf(),
            max_hits: max_hits.max(1),
        }
    }

    fn resolve(&self, p: &str) -> PathBuf {
        let path = Path::new(p);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    fn display_path(&self, p: &Path) -> String {
        p.strip_prefix(&self.root)
            .unwrap_or(p)
            .to_string_lossy()
            .to_string()
    }
}

fn glob_filters(globs: &[String]) -> Result<Vec<glob::Pattern>, RlmError> {
    globs
        .iter()
        .map(|g| {
            glob::Pattern::new(g)
                .map_err(|e| RlmError::Other(anyhow::anyhow!("invalid glob '{g}': {e}")))
        })
        .collect()
}

fn passes_globs(filters: &[glob::Pattern], relative: &str, file_name: &str) -> bool {
    filters.is_empty()
        || filters
            .iter()
            .any(|g| g.matches(file_name) || g.matches(relative))
}

impl PatternSearch for LocalPatternSearch {
    fn search(
        &self,
        pattern: &str,
        paths: &[String],
        options: &PatternOptions,
    ) -> Result<Vec<PatternHit>, RlmError> {
        let source = if options.regex {
            pattern.to_string()
        } else {
            regex::escape(pattern)
        };
        let case_sensitive = options
            .case_sensitive
            .unwrap_or_else(|| pattern.chars().any(char::is_uppercase));
        let re = RegexBuilder::new(&source)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| RlmError::Other(anyhow::anyhow!("invalid pattern: {e}")))?;

        let filters = glob_filters(&options.globs)?;
        let max_hits = options.max_hits.unwrap_or(self.max_hits).min(self.max_hits);

        let targets: Vec<PathBuf> = if paths.is_empty() {
            vec![self.root.clone()]
        } else {
            paths.iter().map(|p| self.resolve(p)).collect()
        };

        let mut hits = Vec::new();
        for target in targets {
            if !target.exists() {
                return Err(RlmError::Other(anyhow::anyhow!(
                    "path not found: {}",
                    target.display()
                )));
            }

            let walker = WalkDir::new(&target)
                .follow_links(false)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| {
                    e.depth() == 0
                        || !e.file_type().is_dir()
                        || !is_skipped_dir(&e.file_name().to_string_lossy())
                });

            for entry in walker.filter_map(|e| e.ok()) {
                if !entry.file_type().is_file() {
                    continue;
                }
                let relative = self.display_path(entry.path());
                let file_name = entry.file_name().to_string_lossy();
                if !passes_globs(&filters, &relative, &file_name) {
                    continue;
                }
                let bytes = match std::fs::read(entry.path()) {
                    Ok(b) => b,
                    Err(_) => continue,
                };
                if looks_binary(&bytes) {
                    continue;
                }
                let content = String::from_utf8_lossy(&bytes);
                for (i, line) in content.lines().enumerate() {
                    if re.is_match(line) {
                        hits.push(PatternHit {
                            path: relative.clone(),
                            line: i + 1,
                            text: line.to_string(),
                        });
                        if hits.len() >= max_hits {
                            return Ok(hits);
                        }
                    }
                }
            }
        }

        Ok(hits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fixture() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join(".git")).unwrap();
        std::fs::write(
            dir.path().join("src/main.rs"),
            "fn main() {\n    // TODO: wire args\n    run();\n}\n",
        )
        .unwrap();
        std::fs::write(dir.path().join("src/lib.py"), "def run():\n    pass  # todo\n").unwrap();
        std::fs::write(dir.path().join(".git/HEAD"), "TODO hidden\n").unwrap();
        std::fs::write(dir.path().join("blob.bin"), b"TODO\0\x01").unwrap();
        dir
    }

    #[test]
    fn test_literal_smart_case() {
        let dir = fixture();
        let search = LocalPatternSearch::new(dir.path(), 200);
        let hits = search.search("todo", &[], &PatternOptions::default()).unwrap();
        let paths: Vec<&str> = hits.iter().map(|h| h.path.as_str()).collect();
        assert_eq!(paths, vec!["src/lib.py", "src/main.rs"]);

        let hits = search.search("TODO", &[], &PatternOptions::default()).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].line, 2);
    }

    #[test]
    fn test_regex_and_globs() {
        let dir = fixture();
        let search = LocalPatternSearch::new(dir.path(), 200);
        let opts = PatternOptions {
            regex: true,
            globs: vec!["*.py".into()],
            ..Default::default()
        };
        let hits = search.search(r"def\s+\w+", &[], &opts).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].text, "def run():");
    }

    #[test]
    fn test_literal_escapes_metacharacters() {
        let dir = fixture();
        let search = LocalPatternSearch::new(dir.path(), 200);
        let hits = search.search("run()", &[], &PatternOptions::default()).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_max_hits_cap() {
        let dir = fixture();
        let search = LocalPatternSearch::new(dir.path(), 1);
        let opts = PatternOptions {
            max_hits: Some(50),
            ..Default::default()
        };
        let hits = search.search("run", &[], &opts).unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[test]
    fn test_missing_path_is_error() {
        let dir = fixture();
        let search = LocalPatternSearch::new(dir.path(), 10);
        let result = search.search("x", &["nope".into()], &PatternOptions::default());
        assert!(result.is_err());
    }
}
