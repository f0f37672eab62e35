// src/tools/mod.rs — Tool capabilities exposed to snippets
//
// Each capability is independently optional. The bridge is a typed
// name → capability mapping built once per run and bound into every
// sandbox at context creation.

pub mod document;
pub mod pattern;
pub mod ranked;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::infra::config::ToolsConfig;
use crate::infra::errors::RlmError;

// ─── Capability contracts ───────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternHit {
    pub path: String,
    /// 1-indexed.
    pub line: usize,
    pub text: String,
}

#[derive(Debug, Clone, Default)]
pub struct PatternOptions {
    /// Treat the pattern as a regex instead of a literal.
    pub regex: bool,
    /// File-name globs; empty means every file.
    pub globs: Vec<String>,
    pub max_hits: Option<usize>,
    /// `None` is smart case: insensitive unless the pattern has uppercase.
    pub case_sensitive: Option<bool>,
}

pub trait PatternSearch: Send + Sync {
    fn search(
        &self,
        pattern: &str,
        paths: &[String],
        options: &PatternOptions,
    ) -> Result<Vec<PatternHit>, RlmError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedHit {
    pub path: String,
    pub score: f64,
}

/// Results are ordered by descending score.
pub trait RankedSearch: Send + Sync {
    fn search(&self, query: &str, limit: usize) -> Result<Vec<RankedHit>, RlmError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebResult {
    pub title: String,
    pub url: String,
    pub excerpt: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WebFilters {
    pub site: Option<String>,
    pub recency_days: Option<u32>,
}

pub trait WebSearch: Send + Sync {
    fn search(
        &self,
        query: &str,
        limit: usize,
        filters: &WebFilters,
    ) -> Result<Vec<WebResult>, RlmError>;
}

/// A section of a document. Identifiers are sequential in traversal order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocNode {
    pub title: String,
    pub node_id: String,
    pub start_offset: usize,
    pub end_offset: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<DocNode>,
}

pub trait DocumentNavigator: Send + Sync {
    fn tree(&self, path: &str) -> Result<Vec<DocNode>, RlmError>;
}

// ─── Bridge ─────────────────────────────────────────────────────

/// Name and usage line advertised to the model.
#[derive(Debug, Clone, PartialEq)]
pub struct ToolDeclaration {
    pub name: &'static str,
    pub usage: &'static str,
    pub description: &'static str,
}

#[derive(Clone)]
pub struct ToolBridge {
    pattern: Option<Arc<dyn PatternSearch>>,
    ranked: Option<Arc<dyn RankedSearch>>,
    web: Option<Arc<dyn WebSearch>>,
    documents: Option<Arc<dyn DocumentNavigator>>,
    default_limit: usize,
}

impl Default for ToolBridge {
    fn default() -> Self {
        Self::empty()
    }
}

impl ToolBridge {
    pub fn empty() -> Self {
        Self {
            pattern: None,
            ranked: None,
            web: None,
            documents: None,
            default_limit: 20,
        }
    }

    /// Build the local tools enabled in config, rooted at `tools.root` or `cwd`.
    pub fn from_config(cfg: &ToolsConfig, cwd: &Path) -> Self {
        let root = cfg
            .root
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| cwd.to_path_buf());

        let mut bridge = Self::empty().with_default_limit(cfg.default_limit);
        if cfg.pattern_search {
            bridge = bridge.with_pattern_search(Arc::new(pattern::LocalPatternSearch::new(
                &root,
                cfg.max_hits,
            )));
        }
        if cfg.ranked_search {
            bridge = bridge.with_ranked_search(Arc::new(ranked::Bm25Index::new(&root)));
        }
        if cfg.documents {
            bridge = bridge.with_documents(Arc::new(document::MarkdownNavigator::new(&root)));
        }
        bridge
    }

    pub fn with_pattern_search(mut self, tool: Arc<dyn PatternSearch>) -> Self {
        self.pattern = Some(tool);
        self
    }

    pub fn with_ranked_search(mut self, tool: Arc<dyn RankedSearch>) -> Self {
        self.ranked = Some(tool);
        self
    }

    pub fn with_web_search(mut self, tool: Arc<dyn WebSearch>) -> Self {
        self.web = Some(tool);
        self
    }

    pub fn with_documents(mut self, tool: Arc<dyn DocumentNavigator>) -> Self {
        self.documents = Some(tool);
        self
    }

    pub fn with_default_limit(mut self, limit: usize) -> Self {
        self.default_limit = limit.max(1);
        self
    }

    pub fn pattern(&self) -> Option<&Arc<dyn PatternSearch>> {
        self.pattern.as_ref()
    }

    pub fn ranked(&self) -> Option<&Arc<dyn RankedSearch>> {
        self.ranked.as_ref()
    }

    pub fn web(&self) -> Option<&Arc<dyn WebSearch>> {
        self.web.as_ref()
    }

    pub fn documents(&self) -> Option<&Arc<dyn DocumentNavigator>> {
        self.documents.as_ref()
    }

    pub fn default_limit(&self) -> usize {
        self.default_limit
    }

    /// Declarations for the configured capabilities only.
    pub fn declarations(&self) -> Vec<ToolDeclaration> {
        let mut out = Vec::new();
        if self.pattern.is_some() {
            out.push(ToolDeclaration {
                name: "scan",
                usage: "scan(pattern) / scan(pattern, paths) / scan(pattern, paths, #{regex, globs, max_hits, case_sensitive})",
                description: "exact or regex line search over files; returns [#{path, line, text}]",
            });
        }
        if self.ranked.is_some() {
            out.push(ToolDeclaration {
                name: "recall",
                usage: "recall(query) / recall(query, limit)",
                description: "BM25 ranked file search; returns [#{path, score}] best first",
            });
        }
        if self.web.is_some() {
            out.push(ToolDeclaration {
                name: "web_search",
                usage: "web_search(query) / web_search(query, limit) / web_search(query, limit, #{site, recency_days})",
                description: "web search; returns [#{title, url, excerpt}]",
            });
        }
        if self.documents.is_some() {
            out.push(ToolDeclaration {
                name: "doc_tree",
                usage: "doc_tree(path)",
                description: "section tree of a markdown document; returns [#{title, node_id, start_offset, end_offset, summary?, children?}]",
            });
        }
        out
    }

    /// Subset of this bridge keeping only the named tools. Names that are
    /// not configured here are ignored; a child can never gain a tool its
    /// parent lacks.
    pub fn restricted(&self, names: &[String]) -> Self {
        let keep = |name: &str| names.iter().any(|n| n == name);
        for name in names {
            if !self.declarations().iter().any(|d| d.name == name) {
                tracing::debug!(tool = %name, "Requested tool not available, ignoring");
            }
        }
        Self {
            pattern: self.pattern.clone().filter(|_| keep("scan")),
            ranked: self.ranked.clone().filter(|_| keep("recall")),
            web: self.web.clone().filter(|_| keep("web_search")),
            documents: self.documents.clone().filter(|_| keep("doc_tree")),
            default_limit: self.default_limit,
        }
    }
}

impl std::fmt::Debug for ToolBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.declarations().iter().map(|d| d.name).collect();
        f.debug_struct("ToolBridge")
            .field("tools", &names)
            .field("default_limit", &self.default_limit)
            .finish()
    }
}

/// Directories never descended into by the local tools.
pub(crate) const SKIPPED_DIRS: &[&str] = &[
    "node_modules",
    "target",
    "__pycache__",
    "dist",
    "build",
    "venv",
];

pub(crate) fn is_skipped_dir(name: &str) -> bool {
    name.starts_with('.') || SKIPPED_DIRS.contains(&name)
}

/// Heuristic: a NUL byte in the first 8 KiB marks a binary file.
pub(crate) fn looks_binary(bytes: &[u8]) -> bool {
    bytes.iter().take(8192).any(|b| *b == 0)
}
