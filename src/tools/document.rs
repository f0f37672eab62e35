// src/tools/document.rs — Markdown section tree navigation

use std::path::{Path, PathBuf};

use pulldown_cmark::{Event, Parser, Tag, TagEnd};

use super::{DocNode, DocumentNavigator};
use crate::infra::errors::RlmError;
use crate::util::preview;

const SUMMARY_CHARS: usize = 200;

/// Builds a heading tree for markdown files under a root. Node ids are
/// four-digit sequence numbers in document order; offsets are byte offsets
/// into the file, a section spanning to the next heading of the same or a
/// higher level.
pub struct MarkdownNavigator {
    root: PathBuf,
}

impl MarkdownNavigator {
    pub fn new(root: &Path) -> Self {
        Self {
            root: root.to_path_buf(),
        }
    }
}

struct FlatSection {
    level: u8,
    title: String,
    start: usize,
    end: usize,
    summary: Option<String>,
}

enum Capture {
    None,
    Title,
    Summary,
}

fn flat_sections(text: &str) -> Vec<FlatSection> {
    let mut sections: Vec<FlatSection> = Vec::new();
    let mut capture = Capture::None;
    let mut buf = String::new();

    for (event, range) in Parser::new(text).into_offset_iter() {
        match event {
            Event::Start(Tag::Heading { level, .. }) => {
                sections.push(FlatSection {
                    level: level as u8,
                    title: String::new(),
                    start: range.start,
                    end: text.len(),
                    summary: None,
                });
                buf.clear();
                capture = Capture::Title;
            }
            Event::End(TagEnd::Heading(_)) => {
                if let Some(s) = sections.last_mut() {
                    s.title = buf.trim().to_string();
                }
                buf.clear();
                capture = Capture::None;
            }
            Event::Start(Tag::Paragraph) => {
                if sections.last().is_some_and(|s| s.summary.is_none()) {
                    buf.clear();
                    capture = Capture::Summary;
                }
            }
            Event::End(TagEnd::Paragraph) => {
                if let Capture::Summary = capture {
                    if let Some(s) = sections.last_mut() {
                        let t = buf.trim();
                        if !t.is_empty() {
                            s.summary = Some(preview(t, SUMMARY_CHARS));
                        }
                    }
                    buf.clear();
                    capture = Capture::None;
                }
            }
            Event::Text(t) | Event::Code(t) => {
                if !matches!(capture, Capture::None) {
                    buf.push_str(&t);
                }
            }
            Event::SoftBreak | Event::HardBreak => {
                if !matches!(capture, Capture::None) {
                    buf.push(' ');
                }
            }
            _ => {}
        }
    }

    for i in 0..sections.len() {
        let level = sections[i].level;
        if let Some(next) = sections[i + 1..].iter().find(|s| s.level <= level) {
            sections[i].end = next.start;
        }
    }
    sections
}

fn nest(flat: &[FlatSection], idx: &mut usize, parent_level: u8) -> Vec<DocNode> {
    let mut out = Vec::new();
    while *idx < flat.len() && flat[*idx].level > parent_level {
        let i = *idx;
        *idx += 1;
        let children = nest(flat, idx, flat[i].level);
        out.push(DocNode {
            title: flat[i].title.clone(),
            node_id: format!("{i:04}"),
            start_offset: flat[i].start,
            end_offset: flat[i].end,
            summary: flat[i].summary.clone(),
            children,
        });
    }
    out
}

/// Section tree of a markdown string.
pub fn markdown_tree(text: &str) -> Vec<DocNode> {
    let flat = flat_sections(text);
    let mut idx = 0;
    let mut roots = Vec::new();
    // A document may open with a deeper heading than later ones.
    while idx < flat.len() {
        roots.extend(nest(&flat, &mut idx, 0));
    }
    roots
}

impl DocumentNavigator for MarkdownNavigator {
    fn tree(&self, path: &str) -> Result<Vec<DocNode>, RlmError> {
        let p = Path::new(path);
        let full = if p.is_absolute() {
            p.to_path_buf()
        } else {
            self.root.join(p)
        };
        let text = std::fs::read_to_string(&full).map_err(|e| {
            RlmError::Other(anyhow::anyhow!("cannot read {}: {e}", full.display()))
        })?;
        Ok(markdown_tree(&text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = "# Guide\n\nIntro paragraph\nspans lines.\n\n## Install\n\nRun the installer.\n\n## Usage\n\n### Flags\n\nUse `--json`.\n\n# Appendix\n";

    #[test]
    fn test_sequential_ids_in_traversal_order() {
        let tree = markdown_tree(DOC);
        assert_eq!(tree.len(), 2);
        let guide = &tree[0];
        assert_eq!(guide.node_id, "0000");
        assert_eq!(guide.children[0].node_id, "0001");
        assert_eq!(guide.children[1].node_id, "0002");
        assert_eq!(guide.children[1].children[0].node_id, "0003");
        assert_eq!(tree[1].node_id, "0004");
        assert_eq!(tree[1].title, "Appendix");
    }

    #[test]
    fn test_titles_summaries_offsets() {
        let tree = markdown_tree(DOC);
        let guide = &tree[0];
        assert_eq!(guide.title, "Guide");
        assert_eq!(guide.summary.as_deref(), Some("Intro paragraph spans lines."));
        assert_eq!(guide.start_offset, 0);
        assert_eq!(guide.end_offset, DOC.find("# Appendix").unwrap());

        let install = &guide.children[0];
        assert_eq!(install.end_offset, DOC.find("## Usage").unwrap());
        assert_eq!(
            guide.children[1].children[0].summary.as_deref(),
            Some("Use --json.")
        );
        assert_eq!(tree[1].end_offset, DOC.len());
        assert!(tree[1].summary.is_none());
    }

    #[test]
    fn test_no_headings() {
        assert!(markdown_tree("just text").is_empty());
    }

    #[test]
    fn test_navigator_reads_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("doc.md"), DOC).unwrap();
        let nav = MarkdownNavigator::new(dir.path());
        assert_eq!(nav.tree("doc.md").unwrap().len(), 2);
        assert!(nav.tree("missing.md").is_err());
    }
}
