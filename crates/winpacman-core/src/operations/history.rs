use std::path::PathBuf;

use tracing::warn;

use crate::models::HistoryEntry;

const MAX_ENTRIES: usize = 100;

/// Operation history: one JSON array in `history.json`, truncated to the
/// last 100 entries. Writes are best-effort by contract; an unwritable
/// history never fails an operation.
pub struct HistoryLog {
    path: PathBuf,
}

impl HistoryLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };
        match serde_json::from_str(&text) {
            Ok(entries) => entries,
            Err(error) => {
                warn!(path = %self.path.display(), error = %error, "history file is unreadable, starting fresh");
                Vec::new()
            }
        }
    }

    pub fn append(&self, entry: HistoryEntry) {
        let mut entries = self.entries();
        entries.push(entry);
        let overflow = entries.len().saturating_sub(MAX_ENTRIES);
        if overflow > 0 {
            entries.drain(..overflow);
        }

        if let Some(parent) = self.path.parent()
            && let Err(error) = std::fs::create_dir_all(parent)
        {
            warn!(path = %self.path.display(), error = %error, "cannot create history directory");
            return;
        }

        let json = match serde_json::to_string_pretty(&entries) {
            Ok(json) => json,
            Err(error) => {
                warn!(error = %error, "history serialization failed");
                return;
            }
        };
        if let Err(error) = std::fs::write(&self.path, json) {
            warn!(path = %self.path.display(), error = %error, "history write failed");
        }
    }
}
