// src/tools/ranked.rs — In-memory BM25 ranked file search

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use walkdir::WalkDir;

use super::{is_skipped_dir, looks_binary, RankedHit, RankedSearch};
use crate::infra::errors::RlmError;

const K1: f64 = 1.2;
const B: f64 = 0.75;
/// Files larger than this are not indexed.
const MAX_FILE_BYTES: u64 = 2 * 1_048_576;

struct Document {
    path: String,
    length: usize,
    term_freqs: HashMap<String, usize>,
}

struct Index {
    docs: Vec<Document>,
    doc_freqs: HashMap<String, usize>,
    avg_len: f64,
}

/// BM25 index over the text files under a root, built on first query.
pub struct Bm25Index {
    root: PathBuf,
    index: Mutex<Option<Arc<Index>>>,
}

impl Bm25Index {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
            index: Mutex::new(None),
        }
    }

    fn index(&self) -> Result<Arc<Index>, RlmError> {
        let mut guard = self
            .index
            .lock()
            .map_err(|_| RlmError::Other(anyhow::anyhow!("ranked index lock poisoned")))?;
        if let Some(idx) = guard.as_ref() {
            return Ok(idx.clone());
        }
        let built = Arc::new(build_index(&self.root)?);
        tracing::debug!(docs = built.docs.len(), "Built ranked search index");
        *guard = Some(built.clone());
        Ok(built)
    }
}

fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.len() > 1)
        .map(str::to_lowercase)
}

fn build_index(root: &Path) -> Result<Index, RlmError> {
    if !root.is_dir() {
        return Err(RlmError::Other(anyhow::anyhow!(
            "search root is not a directory: {}",
            root.display()
        )));
    }

    let mut docs = Vec::new();
    let mut doc_freqs: HashMap<String, usize> = HashMap::new();

    let walker = WalkDir::new(root)
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
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        let Ok(bytes) = std::fs::read(entry.path()) else {
            continue;
        };
        if looks_binary(&bytes) {
            continue;
        }
        let content = String::from_utf8_lossy(&bytes);

        let mut term_freqs: HashMap<String, usize> = HashMap::new();
        let mut length = 0;
        for token in tokenize(&content) {
            *term_freqs.entry(token).or_default() += 1;
            length += 1;
        }
        // File names are searchable too.
        for token in tokenize(&entry.file_name().to_string_lossy()) {
            *term_freqs.entry(token).or_default() += 1;
            length += 1;
        }
        for term in term_freqs.keys() {
            *doc_freqs.entry(term.clone()).or_default() += 1;
        }

        let path = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .to_string();
        docs.push(Document {
            path,
            length,
            term_freqs,
        });
    }

    let total: usize = docs.iter().map(|d| d.length).sum();
    let avg_len = if docs.is_empty() {
        0.0
    } else {
        total as f64 / docs.len() as f64
    };

    Ok(Index {
        docs,
        doc_freqs,
        avg_len,
    })
}

impl Index {
    fn score(&self, query_terms: &[String]) -> Vec<RankedHit> {
        let n = self.docs.len() as f64;
        let mut hits: Vec<RankedHit> = self
            .docs
            .iter()
            .filter_map(|doc| {
                let mut score = 0.0;
                for term in query_terms {
                    let Some(&tf) = doc.term_freqs.get(term) else {
                        continue;
                    };
                    let df = self.doc_freqs.get(term).copied().unwrap_or(0) as f64;
                    let idf = ((n - df + 0.5) / (df + 0.5) + 1.0).ln();
                    let tf = tf as f64;
                    let norm = 1.0 - B + B * (doc.length as f64 / self.avg_len.max(1.0));
                    score += idf * (tf * (K1 + 1.0)) / (tf + K1 * norm);
                }
                (score > 0.0).then(|| RankedHit {
                    path: doc.path.clone(),
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.path.cmp(&b.path))
        });
        hits
    }
}

impl RankedSearch for Bm25Index {
    fn search(&self, query: &str, limit: usize) -> Result<Vec<RankedHit>, RlmError> {
        let terms: Vec<String> = tokenize(query).collect();
        if terms.is_empty() {
            return Ok(Vec::new());
        }
        let mut hits = self.index()?.score(&terms);
        hits.truncate(limit);
        Ok(hits)
    }
}
