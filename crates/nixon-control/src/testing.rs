//! Test fixtures shared by the controller modules.

use std::path::Path;
use std::sync::Arc;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Local};
use nixon_core::{
    DiskMonitor, Finalized, MemoryStore, Notification, PipelineState, Recording, RecordingId,
    RecordingStore, Settings, SharedSettings, StatusSink, StatusSnapshot, StoreError,
};
use nixon_graph::topology::VAD_ELEMENT;
use nixon_graph::{EngineEvent, GraphHandle, SimEngine};
use parking_lot::{Mutex, RwLock};
use tempfile::TempDir;
use tokio::runtime::Handle;

use crate::{Collaborators, Controller};

/// Sink that keeps every notification it receives.
#[derive(Clone, Default)]
pub struct Collector {
    seen: Arc<Mutex<Vec<Notification>>>,
}

impl Collector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sink(&self) -> Arc<dyn StatusSink> {
        let seen = self.seen.clone();
        Arc::new(move |notification: Notification| seen.lock().push(notification))
    }

    pub fn all(&self) -> Vec<Notification> {
        self.seen.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn statuses(&self) -> Vec<StatusSnapshot> {
        self.all()
            .into_iter()
            .filter_map(|n| match n {
                Notification::Status(status) => Some(status),
                _ => None,
            })
            .collect()
    }

    /// Published pipeline states with repeats collapsed.
    pub fn states(&self) -> Vec<PipelineState> {
        let mut states: Vec<PipelineState> =
            self.statuses().iter().map(|s| s.pipeline_state).collect();
        states.dedup();
        states
    }
}

/// Memory store that counts calls and can refuse new records.
#[derive(Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_creates: AtomicBool,
    creates: AtomicUsize,
    finalizes: AtomicUsize,
}

impl FlakyStore {
    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn fail_creates(&self, fail: bool) {
        self.fail_creates.store(fail, Ordering::SeqCst);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn finalizes(&self) -> usize {
        self.finalizes.load(Ordering::SeqCst)
    }
}

impl RecordingStore for FlakyStore {
    fn create_recording(
        &self,
        filename: &str,
        path: &Path,
        start_time: DateTime<Local>,
    ) -> Result<RecordingId, StoreError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("disk full".to_string()));
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        self.inner.create_recording(filename, path, start_time)
    }

    fn finalize_recording(&self, id: RecordingId, finalized: &Finalized) -> Result<(), StoreError> {
        self.finalizes.fetch_add(1, Ordering::SeqCst);
        self.inner.finalize_recording(id, finalized)
    }

    fn annotate_recording(
        &self,
        id: RecordingId,
        notes: &str,
        genre: &str,
    ) -> Result<(), StoreError> {
        self.inner.annotate_recording(id, notes, genre)
    }

    fn delete_recording(&self, id: RecordingId) -> Result<(), StoreError> {
        self.inner.delete_recording(id)
    }

    fn list_recordings(&self) -> Result<Vec<Recording>, StoreError> {
        self.inner.list_recordings()
    }
}

/// Disk monitor reporting a settable usage, 42% to begin with.
pub struct FixedDisk {
    percent: AtomicU8,
    failing: AtomicBool,
    checks: AtomicUsize,
}

impl Default for FixedDisk {
    fn default() -> Self {
        Self {
            percent: AtomicU8::new(42),
            failing: AtomicBool::new(false),
            checks: AtomicUsize::new(0),
        }
    }
}

impl FixedDisk {
    pub fn set_percent(&self, percent: u8) {
        self.percent.store(percent, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }
}

impl DiskMonitor for FixedDisk {
    fn usage_percent(&self, _path: &Path) -> io::Result<u8> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(io::Error::other("statvfs failed"));
        }
        Ok(self.percent.load(Ordering::SeqCst))
    }
}

/// A controller wired to a simulated engine. Must be created on a runtime.
pub struct Harness {
    pub controller: Controller,
    pub engine: Arc<SimEngine>,
    pub store: Arc<FlakyStore>,
    pub disk: Arc<FixedDisk>,
    pub settings: SharedSettings,
    pub collector: Collector,
    pub dir: TempDir,
}

impl Harness {
    pub fn new(configure: impl FnOnce(&mut Settings)) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = Settings::default();
        settings.recording.directory = dir.path().to_path_buf();
        configure(&mut settings);

        let settings: SharedSettings = Arc::new(RwLock::new(settings));
        let engine = Arc::new(SimEngine::new());
        let store = Arc::new(FlakyStore::default());
        let disk = Arc::new(FixedDisk::default());
        let collector = Collector::new();

        let controller = Controller::new(
            Collaborators {
                engine: engine.clone(),
                settings: settings.clone(),
                store: store.clone(),
                sink: collector.sink(),
                disk: disk.clone(),
            },
            Handle::current(),
        );

        Self {
            controller,
            engine,
            store,
            disk,
            settings,
            collector,
            dir,
        }
    }

    pub fn graph(&self) -> GraphHandle {
        self.controller.current_graph().expect("no live graph")
    }

    /// Post a stereo level measurement from the VAD element.
    pub fn level(&self, db: f64) {
        self.engine.emit_latest(EngineEvent::Level {
            element: VAD_ELEMENT.to_string(),
            rms_db: vec![db - 6.0, db],
        });
    }
}

/// Let the status forwarder catch up.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

pub fn with_streams(settings: &mut Settings) {
    settings.srt.enabled = true;
    settings.srt.host = "10.0.0.2".to_string();
    settings.icecast.enabled = true;
    settings.icecast.password = "hackme".to_string();
}

pub fn auto_record(settings: &mut Settings) {
    settings.auto_record.enabled = true;
    settings.auto_record.smart_split_timeout_secs = 10;
}
