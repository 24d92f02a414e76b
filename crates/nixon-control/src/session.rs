//! Recording sessions.
//!
//! A session exists exactly while the recording valve is open. Starting one
//! points the file sink at a fresh timestamped file, opens the valve and
//! creates the store record; stopping closes the valve and finalizes it.

use std::fs;
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Local};
use nixon_core::{Branch, Finalized, PipelineState, Recording, RecordingId, StoreError};
use tracing::{debug, error, info, warn};

use crate::controller::{Core, Shared};
use crate::{ControlError, Controller, Result};

/// An active recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordingSession {
    pub id: RecordingId,
    pub filename: String,
    pub path: PathBuf,
    pub started_at: DateTime<Local>,
}

/// Why a recording ended. Stored in the record's notes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StopReason {
    Manual,
    Silence { timeout: Duration, smart_split: bool },
    Teardown,
    Fault,
}

impl StopReason {
    pub fn notes(&self) -> String {
        match self {
            StopReason::Manual => String::new(),
            StopReason::Silence {
                timeout,
                smart_split: true,
            } => format!("smart split after {}s of silence", timeout.as_secs()),
            StopReason::Silence { timeout, .. } => {
                format!("stopped after {}s of silence", timeout.as_secs())
            }
            StopReason::Teardown => "pipeline stopped".to_string(),
            StopReason::Fault => "pipeline fault".to_string(),
        }
    }
}

impl RecordingSession {
    pub fn finalize(
        &self,
        ended_at: DateTime<Local>,
        size_bytes: u64,
        reason: StopReason,
    ) -> Finalized {
        Finalized {
            end_time: ended_at,
            duration: (ended_at - self.started_at).to_std().unwrap_or_default(),
            size_bytes,
            notes: reason.notes(),
        }
    }
}

/// Timestamped file names, suffixed when two land in the same second.
#[derive(Debug, Default)]
pub(crate) struct FilenameSeq {
    last_stamp: Option<String>,
    repeats: u32,
}

impl FilenameSeq {
    pub fn next(&mut self, at: DateTime<Local>) -> String {
        let stamp = at.format("rec_%Y%m%d_%H%M%S").to_string();
        if self.last_stamp.as_deref() == Some(stamp.as_str()) {
            self.repeats += 1;
            format!("{stamp}_{}.wav", self.repeats)
        } else {
            self.repeats = 0;
            let filename = format!("{stamp}.wav");
            self.last_stamp = Some(stamp);
            filename
        }
    }
}

impl Shared {
    pub(crate) fn start_recording_locked(self: &Arc<Self>, core: &mut Core) -> Result<()> {
        if core.state != PipelineState::Running {
            return Err(ControlError::NotRunning(core.state));
        }
        if core.session.is_some() {
            debug!("recording already active");
            return Ok(());
        }

        let Some(graph) = core.graph.as_ref() else {
            return Err(ControlError::NotRunning(core.state));
        };
        let (true, Some(valve), Some(sink)) = (
            graph.gates.contains_key(&Branch::Recording),
            Branch::Recording.valve_name(),
            Branch::Recording.sink_name(),
        ) else {
            warn!("recording branch is not configured");
            return Err(ControlError::BranchUnavailable(Branch::Recording));
        };
        let handle = graph.handle;
        let directory = graph.settings.recording.directory.clone();

        let started_at = Local::now();
        let filename = core.filenames.next(started_at);
        let path = directory.join(&filename);

        if let Err(e) = self
            .engine
            .set_property(handle, &sink, "location", &path.to_string_lossy())
        {
            return Err(self.engine_failure(core, e));
        }
        if let Err(e) = self.engine.set_valve(handle, &valve, true) {
            return Err(self.engine_failure(core, e));
        }
        core.set_gate(Branch::Recording, true);

        let id = match self.store.create_recording(&filename, &path, started_at) {
            Ok(id) => id,
            Err(e) => {
                error!(%filename, error = %e, "could not create recording record");
                if let Err(close) = self.engine.set_valve(handle, &valve, false) {
                    warn!(error = %close, "recording valve did not close");
                }
                core.set_gate(Branch::Recording, false);
                self.publish(core);
                return Err(e.into());
            }
        };

        info!(%id, %filename, "recording started");
        core.session = Some(RecordingSession {
            id,
            filename,
            path,
            started_at,
        });
        self.publish(core);
        Ok(())
    }

    /// Close the recording valve and finalize the record. No-op when idle.
    pub(crate) fn stop_recording_locked(
        self: &Arc<Self>,
        core: &mut Core,
        reason: StopReason,
    ) -> Result<()> {
        let Some(session) = core.session.take() else {
            return Ok(());
        };
        core.vad.cancel_timer();

        let mut valve_error = None;
        if let Some(handle) = core.graph.as_ref().map(|g| g.handle) {
            if let Some(valve) = Branch::Recording.valve_name() {
                if let Err(e) = self.engine.set_valve(handle, &valve, false) {
                    valve_error = Some(e);
                }
            }
            core.set_gate(Branch::Recording, false);
        }

        let ended_at = Local::now();
        let size_bytes = match fs::metadata(&session.path) {
            Ok(meta) => meta.len(),
            Err(e) => {
                warn!(path = %session.path.display(), error = %e, "recording size unavailable");
                0
            }
        };
        let finalized = session.finalize(ended_at, size_bytes, reason);
        info!(
            id = %session.id,
            filename = %session.filename,
            duration = ?finalized.duration,
            ?reason,
            "recording stopped"
        );
        let stored = self.store.finalize_recording(session.id, &finalized);
        self.publish(core);

        if let Some(e) = valve_error {
            if core.state == PipelineState::Running {
                return Err(self.engine_failure(core, e));
            }
            debug!(error = %e, "recording valve not closed during teardown");
        }
        stored.map_err(|e| {
            error!(id = %session.id, error = %e, "could not finalize recording");
            ControlError::Storage(e)
        })
    }
}

impl Controller {
    /// Open the recording valve and start a new recording.
    ///
    /// Already recording is a no-op. A store failure closes the valve again.
    pub fn start_recording(&self) -> Result<()> {
        let mut core = self.shared.core.lock();
        self.shared.start_recording_locked(&mut core)
    }

    /// Close the recording valve and finalize the record. No-op when idle.
    pub fn stop_recording(&self) -> Result<()> {
        let mut core = self.shared.core.lock();
        self.shared.stop_recording_locked(&mut core, StopReason::Manual)
    }

    pub fn recording_session(&self) -> Option<RecordingSession> {
        self.shared.core.lock().session.clone()
    }

    /// All recordings, newest first.
    pub fn list_recordings(&self) -> Result<Vec<Recording>> {
        Ok(self.shared.store.list_recordings()?)
    }

    /// Set notes and genre. Allowed while recording; the values survive the stop.
    pub fn annotate_recording(&self, id: RecordingId, notes: &str, genre: &str) -> Result<()> {
        self.shared.store.annotate_recording(id, notes, genre)?;
        info!(%id, "recording annotated");
        Ok(())
    }

    /// Delete a finished recording and its file.
    pub fn delete_recording(&self, id: RecordingId) -> Result<()> {
        let core = self.shared.core.lock();
        if core.session.as_ref().is_some_and(|s| s.id == id) {
            return Err(ControlError::RecordingActive(id));
        }

        let record = self
            .shared
            .store
            .list_recordings()?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or(StoreError::NotFound(id))?;
        self.shared.store.delete_recording(id)?;
        drop(core);

        let path = record.path;
        match fs::remove_file(&path) {
            Ok(()) => info!(%id, path = %path.display(), "recording deleted"),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                info!(%id, "recording deleted, file was already gone");
            }
            Err(e) => warn!(%id, path = %path.display(), error = %e, "recording file not removed"),
        }
        Ok(())
    }
}
