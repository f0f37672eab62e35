// src/core/inject.rs — State injection from a watched file
//
// The file holds a snippet. Whenever its modification time changes the
// controller runs it in the root environment before the next request, so
// variables can be updated from outside while a run is in progress.

use std::path::{Path, PathBuf};
use std::time::SystemTime;

#[derive(Debug)]
pub struct InjectWatcher {
    path: PathBuf,
    last_seen: Option<SystemTime>,
}

impl InjectWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last_seen: None,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return the file contents if it changed since the previous poll.
    /// A file that exists on the first poll counts as changed. A missing or
    /// unreadable file yields `None` and leaves the timestamp untouched.
    pub fn poll(&mut self) -> Option<String> {
        let modified = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok()?;
        if self.last_seen == Some(modified) {
            return None;
        }
        match std::fs::read_to_string(&self.path) {
            Ok(contents) => {
                self.last_seen = Some(modified);
                Some(contents)
            }
            Err(e) => {
                tracing::warn!(path = %self.path.display(), "Failed to read inject file: {}", e);
                None
            }
        }
    }
}
