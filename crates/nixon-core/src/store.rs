//! Recording metadata store contract.
//!
//! The control plane creates a record when a recording starts and finalizes
//! it when the recording stops. Where the records live is up to the
//! implementation; [`MemoryStore`] keeps them in process.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// Identifier assigned by the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RecordingId(pub u64);

impl fmt::Display for RecordingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A persisted recording record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recording {
    pub id: RecordingId,
    pub filename: String,
    /// Where the audio file was written
    pub path: PathBuf,
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    pub duration: Option<Duration>,
    pub size_bytes: Option<u64>,
    pub notes: String,
    pub genre: String,
}

/// Values computed when a recording stops.
#[derive(Debug, Clone, PartialEq)]
pub struct Finalized {
    pub end_time: DateTime<Local>,
    pub duration: Duration,
    pub size_bytes: u64,
    /// Why the recording ended, empty for a manual stop
    pub notes: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("recording {0} not found")]
    NotFound(RecordingId),

    #[error("a recording named {0} already exists")]
    DuplicateFilename(String),

    #[error("store backend failed: {0}")]
    Backend(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// CRUD contract for recording metadata, keyed by id.
pub trait RecordingStore: Send + Sync {
    /// Create a record for a recording that just started.
    fn create_recording(
        &self,
        filename: &str,
        path: &Path,
        start_time: DateTime<Local>,
    ) -> Result<RecordingId>;

    /// Fill in the values known once the recording has stopped.
    ///
    /// Notes and genre annotated while recording are kept; the stop notes
    /// are appended to the existing notes.
    fn finalize_recording(&self, id: RecordingId, finalized: &Finalized) -> Result<()>;

    /// Replace the user-editable notes and genre.
    fn annotate_recording(&self, id: RecordingId, notes: &str, genre: &str) -> Result<()>;

    fn delete_recording(&self, id: RecordingId) -> Result<()>;

    /// All records, newest first.
    fn list_recordings(&self) -> Result<Vec<Recording>>;
}

/// Join user notes and stop notes, skipping whichever is empty.
fn append_notes(notes: &str, stop_notes: &str) -> String {
    match (notes.is_empty(), stop_notes.is_empty()) {
        (_, true) => notes.to_string(),
        (true, false) => stop_notes.to_string(),
        (false, false) => format!("{notes}; {stop_notes}"),
    }
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    next_id: u64,
    records: BTreeMap<RecordingId, Recording>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: RecordingId) -> Option<Recording> {
        self.inner.lock().records.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RecordingStore for MemoryStore {
    fn create_recording(
        &self,
        filename: &str,
        path: &Path,
        start_time: DateTime<Local>,
    ) -> Result<RecordingId> {
        let mut inner = self.inner.lock();
        if inner.records.values().any(|r| r.filename == filename) {
            return Err(StoreError::DuplicateFilename(filename.to_string()));
        }

        inner.next_id += 1;
        let id = RecordingId(inner.next_id);
        inner.records.insert(
            id,
            Recording {
                id,
                filename: filename.to_string(),
                path: path.to_path_buf(),
                start_time,
                end_time: None,
                duration: None,
                size_bytes: None,
                notes: String::new(),
                genre: String::new(),
            },
        );
        debug!(%id, filename, "recording record created");
        Ok(id)
    }

    fn finalize_recording(&self, id: RecordingId, finalized: &Finalized) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.end_time = Some(finalized.end_time);
        record.duration = Some(finalized.duration);
        record.size_bytes = Some(finalized.size_bytes);
        record.notes = append_notes(&record.notes, &finalized.notes);
        Ok(())
    }

    fn annotate_recording(&self, id: RecordingId, notes: &str, genre: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let record = inner.records.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        record.notes = notes.to_string();
        record.genre = genre.to_string();
        Ok(())
    }

    fn delete_recording(&self, id: RecordingId) -> Result<()> {
        self.inner
            .lock()
            .records
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound(id))
    }

    fn list_recordings(&self) -> Result<Vec<Recording>> {
        let mut records: Vec<Recording> = self.inner.lock().records.values().cloned().collect();
        records.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeDelta;

    use super::*;

    #[test]
    fn test_create_and_finalize() {
        let store = MemoryStore::new();
        let start = Local::now();
        let id = store
            .create_recording("rec_1.wav", Path::new("/srv/rec/rec_1.wav"), start)
            .unwrap();

        let finalized = Finalized {
            end_time: start + TimeDelta::seconds(12),
            duration: Duration::from_secs(12),
            size_bytes: 4096,
            notes: "silence".to_string(),
        };
        store.finalize_recording(id, &finalized).unwrap();

        let record = store.get(id).unwrap();
        assert_eq!(record.duration, Some(Duration::from_secs(12)));
        assert_eq!(record.size_bytes, Some(4096));
        assert_eq!(record.notes, "silence");
        assert_eq!(record.path, Path::new("/srv/rec/rec_1.wav"));
    }

    #[test]
    fn test_finalize_keeps_annotations() {
        let store = MemoryStore::new();
        let start = Local::now();
        let id = store.create_recording("rec.wav", Path::new("rec.wav"), start).unwrap();
        store.annotate_recording(id, "interview", "talk").unwrap();

        let finalized = Finalized {
            end_time: start + TimeDelta::seconds(30),
            duration: Duration::from_secs(30),
            size_bytes: 1,
            notes: "pipeline fault".to_string(),
        };
        store.finalize_recording(id, &finalized).unwrap();

        let record = store.get(id).unwrap();
        assert_eq!(record.notes, "interview; pipeline fault");
        assert_eq!(record.genre, "talk");
    }

    #[test]
    fn test_append_notes() {
        assert_eq!(append_notes("", ""), "");
        assert_eq!(append_notes("", "pipeline stopped"), "pipeline stopped");
        assert_eq!(append_notes("interview", ""), "interview");
        assert_eq!(append_notes("a", "b"), "a; b");
    }

    #[test]
    fn test_duplicate_filename_rejected() {
        let store = MemoryStore::new();
        let path = Path::new("rec.wav");
        store.create_recording("rec.wav", path, Local::now()).unwrap();
        let err = store.create_recording("rec.wav", path, Local::now()).unwrap_err();
        assert!(matches!(err, StoreError::DuplicateFilename(_)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_list_is_newest_first() {
        let store = MemoryStore::new();
        let now = Local::now();
        store
            .create_recording("old.wav", Path::new("old.wav"), now - TimeDelta::hours(1))
            .unwrap();
        store.create_recording("new.wav", Path::new("new.wav"), now).unwrap();

        let names: Vec<_> = store
            .list_recordings()
            .unwrap()
            .into_iter()
            .map(|r| r.filename)
            .collect();
        assert_eq!(names, vec!["new.wav", "old.wav"]);
    }

    #[test]
    fn test_missing_ids() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.delete_recording(RecordingId(7)),
            Err(StoreError::NotFound(RecordingId(7)))
        ));
        assert!(store.annotate_recording(RecordingId(7), "n", "g").is_err());

        let id = store.create_recording("a.wav", Path::new("a.wav"), Local::now()).unwrap();
        store.annotate_recording(id, "interview", "talk").unwrap();
        assert_eq!(store.get(id).unwrap().genre, "talk");
        store.delete_recording(id).unwrap();
        assert!(store.is_empty());
    }
}
