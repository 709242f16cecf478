//! Parse journals
//!
//! A journal records how far a feed source has been parsed and which
//! observables it already emitted. The parser loads it at the start of every
//! `parse` call and writes it back before returning, so a crash loses at most
//! the batch that was in flight.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeSet, HashMap};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use cif_common::{CifError, Result};

/// Per-source parse state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Objects counted against the feed: skipped-by-start plus emitted
    pub total_objects: u64,

    /// Raw records read from the source across all runs
    #[serde(default)]
    pub consumed: u64,

    /// Records to skip before counting
    pub start: u64,

    /// Stop once `total_objects` reaches this bound
    pub end: Option<u64>,

    /// False once the source is exhausted or `end` was reached
    pub parsing: bool,

    /// Expected field count per record
    pub valuecount: usize,

    #[serde(default)]
    pub fingerprints: BTreeSet<String>,

    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl JournalEntry {
    pub fn new(start: u64, end: Option<u64>, valuecount: usize) -> Self {
        Self {
            total_objects: 0,
            consumed: 0,
            start,
            end,
            parsing: true,
            valuecount,
            fingerprints: BTreeSet::new(),
            updated_at: None,
        }
    }

    /// Whether the configured `end` bound has been hit
    pub fn end_reached(&self) -> bool {
        self.end.is_some_and(|end| self.total_objects >= end)
    }

    pub fn has_seen(&self, fingerprint: &str) -> bool {
        self.fingerprints.contains(fingerprint)
    }

    /// Record a newly emitted fingerprint; returns false if it was already known
    pub fn record(&mut self, fingerprint: String) -> bool {
        self.fingerprints.insert(fingerprint)
    }
}

/// Persistence for journal entries keyed by source name
pub trait JournalStore: Send + Sync {
    fn load(&self, source: &str) -> Result<Option<JournalEntry>>;

    /// Durably store `entry`; must not return before the write is flushed
    fn save(&self, source: &str, entry: &JournalEntry) -> Result<()>;
}

/// One JSON document per source inside a directory
#[derive(Debug, Clone)]
pub struct FileJournalStore {
    dir: PathBuf,
}

impl FileJournalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Journal file for `source`.
    ///
    /// Names that are not already filesystem safe are sanitized and suffixed
    /// with a short hash of the raw name, so two sources never share a file.
    pub fn path_for(&self, source: &str) -> PathBuf {
        let name: String = source
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
            .collect();

        if name == source && !name.starts_with('.') {
            return self.dir.join(format!("{}.journal.json", name));
        }

        let digest = hex::encode(Sha256::digest(source.as_bytes()));
        self.dir.join(format!("{}-{}.journal.json", name, &digest[..8]))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl JournalStore for FileJournalStore {
    fn load(&self, source: &str) -> Result<Option<JournalEntry>> {
        let path = self.path_for(source);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let entry = serde_json::from_slice(&data).map_err(|e| {
            CifError::Journal(format!("Corrupt journal {}: {}", path.display(), e))
        })?;
        Ok(Some(entry))
    }

    fn save(&self, source: &str, entry: &JournalEntry) -> Result<()> {
        let path = self.path_for(source);

        // Write to a sibling temp file and rename so readers never see a torn journal
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        serde_json::to_writer(&mut tmp, entry)?;
        tmp.flush()?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path)
            .map_err(|e| CifError::Journal(format!("Failed to persist {}: {}", path.display(), e)))?;

        tracing::debug!(
            source = %source,
            path = %path.display(),
            total_objects = entry.total_objects,
            parsing = entry.parsing,
            "Journal written"
        );
        Ok(())
    }
}

/// In-process journal store, used by tests and dry runs
#[derive(Debug, Default)]
pub struct MemoryJournalStore {
    entries: Mutex<HashMap<String, JournalEntry>>,
}

impl MemoryJournalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl JournalStore for MemoryJournalStore {
    fn load(&self, source: &str) -> Result<Option<JournalEntry>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| CifError::Journal("journal store lock poisoned".to_string()))?;
        Ok(entries.get(source).cloned())
    }

    fn save(&self, source: &str, entry: &JournalEntry) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| CifError::Journal("journal store lock poisoned".to_string()))?;
        entries.insert(source.to_string(), entry.clone());
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_end_reached() {
        let mut entry = JournalEntry::new(0, Some(2), 1);
        assert!(!entry.end_reached());
        entry.total_objects = 2;
        assert!(entry.end_reached());

        let unbounded = JournalEntry::new(0, None, 1);
        assert!(!unbounded.end_reached());
    }

    #[test]
    fn test_file_store_round_trip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJournalStore::new(dir.path()).unwrap();

        assert!(store.load("spamhaus-drop").unwrap().is_none());

        let mut entry = JournalEntry::new(3, Some(10), 2);
        entry.total_objects = 5;
        entry.record("abc".to_string());
        store.save("spamhaus-drop", &entry).unwrap();

        let loaded = store.load("spamhaus-drop").unwrap().unwrap();
        assert_eq!(loaded, entry);
        assert!(loaded.has_seen("abc"));
    }

    #[test]
    fn test_file_store_sanitizes_source_names() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJournalStore::new(dir.path()).unwrap();
        let path = store.path_for("feeds/../abuse.ch urlhaus");
        assert_eq!(path.parent().unwrap(), dir.path());
        assert!(path.file_name().unwrap().to_str().unwrap().ends_with(".journal.json"));
    }

    #[test]
    fn test_distinct_sources_never_share_a_journal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJournalStore::new(dir.path()).unwrap();

        assert_eq!(store.path_for("a_b"), dir.path().join("a_b.journal.json"));
        assert_ne!(store.path_for("a/b"), store.path_for("a_b"));
        assert_ne!(store.path_for("a/b"), store.path_for("a b"));

        let mut slashed = JournalEntry::new(0, None, 1);
        slashed.consumed = 7;
        store.save("a/b", &slashed).unwrap();
        assert!(store.load("a_b").unwrap().is_none());
        assert_eq!(store.load("a/b").unwrap().unwrap().consumed, 7);
    }

    #[test]
    fn test_journal_is_written_compact() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJournalStore::new(dir.path()).unwrap();

        let mut entry = JournalEntry::new(0, None, 1);
        entry.record("f00d".to_string());
        entry.record("beef".to_string());
        store.save("compact", &entry).unwrap();

        let raw = std::fs::read_to_string(store.path_for("compact")).unwrap();
        assert!(!raw.contains('\n'));
        assert!(raw.contains(r#""fingerprints":["beef","f00d"]"#));
    }

    #[test]
    fn test_corrupt_journal_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileJournalStore::new(dir.path()).unwrap();
        std::fs::write(store.path_for("broken"), b"{ not json").unwrap();
        assert!(matches!(store.load("broken"), Err(CifError::Journal(_))));
    }
}
