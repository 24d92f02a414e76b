//! Pipeline lifecycle.
//!
//! Every transition runs with the structural lock held: it is taken by the
//! public API, by engine callbacks, and by the silence and restart tasks after
//! they wake up. Engine calls are made under the lock too, which is why
//! engines must never invoke their callback from inside one.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::Local;
use nixon_core::{
    Branch, DiskMonitor, LevelReading, PipelineState, RecordingStore, Settings, SettingsProvider,
    StatusSink, StatusSnapshot,
};
use nixon_graph::topology::VAD_ELEMENT;
use nixon_graph::{
    EngineError, EngineEvent, EventCallback, GraphHandle, GraphState, MediaEngine, Topology,
};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::backoff::Backoff;
use crate::broadcast::Broadcaster;
use crate::monitor::disk_monitor;
use crate::session::{FilenameSeq, RecordingSession, StopReason};
use crate::vad::{SilenceTimer, VadInputs, VadIntent, VadState};
use crate::{ControlError, Result};

/// Everything the controller talks to.
pub struct Collaborators {
    pub engine: Arc<dyn MediaEngine>,
    pub settings: Arc<dyn SettingsProvider>,
    pub store: Arc<dyn RecordingStore>,
    pub sink: Arc<dyn StatusSink>,
    pub disk: Arc<dyn DiskMonitor>,
}

/// Handle to the control plane. Clones share the same pipeline.
#[derive(Clone)]
pub struct Controller {
    pub(crate) shared: Arc<Shared>,
}

pub(crate) struct Shared {
    pub engine: Arc<dyn MediaEngine>,
    pub settings: Arc<dyn SettingsProvider>,
    pub store: Arc<dyn RecordingStore>,
    pub disk: Arc<dyn DiskMonitor>,
    pub status: Broadcaster,
    runtime: Handle,
    pub core: Mutex<Core>,
}

/// The graph currently handed to the engine.
pub(crate) struct LiveGraph {
    pub handle: GraphHandle,
    pub topology: Topology,
    /// Settings the graph was built from
    pub settings: Settings,
    /// Gated branches present in the graph and whether their valve is open
    pub gates: BTreeMap<Branch, bool>,
}

impl LiveGraph {
    pub fn is_open(&self, branch: Branch) -> bool {
        self.gates.get(&branch).copied().unwrap_or(false)
    }

    fn open_streams(&self) -> BTreeSet<Branch> {
        self.gates
            .iter()
            .filter(|(branch, open)| **open && **branch != Branch::Recording)
            .map(|(branch, _)| *branch)
            .collect()
    }
}

struct RestartTask {
    generation: u64,
    task: JoinHandle<()>,
}

#[derive(Default)]
pub(crate) struct Core {
    pub state: PipelineState,
    pub graph: Option<LiveGraph>,
    pub vad: VadState,
    pub session: Option<RecordingSession>,
    pub filenames: FilenameSeq,
    pub restart_attempts: u32,
    /// Last measured usage of the recording volume
    pub disk_usage_percent: Option<u8>,
    restart: Option<RestartTask>,
    /// Stream gates to reopen once the next graph is running
    resume_streams: BTreeSet<Branch>,
    next_generation: u64,
}

impl Core {
    pub fn next_generation(&mut self) -> u64 {
        self.next_generation += 1;
        self.next_generation
    }

    pub fn set_gate(&mut self, branch: Branch, open: bool) {
        if let Some(gate) = self.graph.as_mut().and_then(|g| g.gates.get_mut(&branch)) {
            *gate = open;
        }
    }

    fn cancel_restart(&mut self) {
        if let Some(restart) = self.restart.take() {
            restart.task.abort();
            debug!(generation = restart.generation, "scheduled restart cancelled");
        }
    }

    fn restart_current(&self, generation: u64) -> bool {
        self.restart.as_ref().map(|r| r.generation) == Some(generation)
    }

    /// Status as implied by the ground truth held here.
    pub fn snapshot(&self) -> StatusSnapshot {
        let open = |branch| self.graph.as_ref().is_some_and(|g| g.is_open(branch));
        StatusSnapshot {
            is_recording: self.session.is_some(),
            is_streaming_a: open(Branch::StreamA),
            is_streaming_b: open(Branch::StreamB),
            vad_active: self.vad.is_active(),
            last_vad_time: self.vad.last_event_time(),
            current_recording_filename: self.session.as_ref().map(|s| s.filename.clone()),
            pipeline_state: self.state,
            restart_attempts: self.restart_attempts,
            disk_usage_percent: self.disk_usage_percent,
        }
    }
}

impl Controller {
    /// Create a stopped controller. Timers, disk checks and status delivery
    /// run on `runtime`.
    pub fn new(collaborators: Collaborators, runtime: Handle) -> Self {
        let status = Broadcaster::new(collaborators.sink, &runtime);
        let shared = Arc::new(Shared {
            engine: collaborators.engine,
            settings: collaborators.settings,
            store: collaborators.store,
            disk: collaborators.disk,
            status,
            runtime: runtime.clone(),
            core: Mutex::new(Core::default()),
        });
        runtime.spawn(disk_monitor(Arc::downgrade(&shared)));
        Self { shared }
    }

    /// Build the graph from current settings and set it playing.
    ///
    /// No-op when already running. Supersedes a scheduled restart.
    pub fn start(&self) -> Result<()> {
        let mut core = self.shared.core.lock();
        core.cancel_restart();
        self.shared.start_locked(&mut core, PipelineState::Stopped)
    }

    /// Tear the graph down and finalize any recording. Idempotent.
    pub fn stop(&self) {
        let mut core = self.shared.core.lock();
        core.cancel_restart();
        core.resume_streams.clear();
        core.restart_attempts = 0;
        self.shared.teardown(&mut core, StopReason::Teardown);
    }

    /// Rebuild the graph from fresh settings.
    ///
    /// Open stream gates are reopened on the new graph when their branch is
    /// still configured. An active recording is finalized and not resumed.
    /// When the rebuild fails the error is returned and the restart loop
    /// keeps retrying in the background.
    pub fn restart(&self) -> Result<()> {
        let mut core = self.shared.core.lock();
        core.cancel_restart();
        core.restart_attempts = 0;
        if let Some(resume) = core.graph.as_ref().map(LiveGraph::open_streams) {
            core.resume_streams = resume;
        }

        info!("restarting pipeline on request");
        self.shared.teardown(&mut core, StopReason::Teardown);
        match self.shared.start_locked(&mut core, PipelineState::Restarting) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.shared.schedule_restart(&mut core);
                Err(e)
            }
        }
    }

    /// Copy of the latest published status.
    pub fn snapshot(&self) -> StatusSnapshot {
        self.shared.status.snapshot()
    }

    pub fn pipeline_state(&self) -> PipelineState {
        self.shared.core.lock().state
    }

    /// Handle of the live graph, if any.
    pub fn current_graph(&self) -> Option<GraphHandle> {
        self.shared.core.lock().graph.as_ref().map(|g| g.handle)
    }

    /// Settings the live graph was built from.
    pub fn graph_settings(&self) -> Option<Settings> {
        self.shared
            .core
            .lock()
            .graph
            .as_ref()
            .map(|g| g.settings.clone())
    }

    /// Redacted description of the live graph.
    pub fn describe_graph(&self) -> Option<String> {
        self.shared
            .core
            .lock()
            .graph
            .as_ref()
            .map(|g| g.topology.describe_redacted())
    }

    /// Notifications dropped because the sink fell behind.
    pub fn dropped_notifications(&self) -> u64 {
        self.shared.status.dropped()
    }

    /// Feed an engine event as if the engine had posted it for `graph`.
    pub fn handle_event(&self, graph: GraphHandle, event: EngineEvent) {
        self.shared.dispatch(graph, event);
    }
}

impl Shared {
    pub(crate) fn publish(&self, core: &Core) {
        self.status.update(core.snapshot());
    }

    /// Build, subscribe and play. On failure the state becomes `fallback`.
    fn start_locked(self: &Arc<Self>, core: &mut Core, fallback: PipelineState) -> Result<()> {
        if core.state == PipelineState::Running {
            debug!("pipeline already running");
            return Ok(());
        }

        core.state = PipelineState::Starting;
        self.publish(core);

        let settings = self.settings.settings();
        let topology = match Topology::build(&settings) {
            Ok(topology) => topology,
            Err(e) => {
                error!(error = %e, "invalid pipeline settings");
                core.state = fallback;
                self.publish(core);
                return Err(e.into());
            }
        };

        if topology.has_branch(Branch::Recording) {
            if let Err(e) = fs::create_dir_all(&settings.recording.directory) {
                warn!(
                    directory = %settings.recording.directory.display(),
                    error = %e,
                    "could not create recording directory"
                );
            }
        }

        info!(pipeline = %topology, "building pipeline");
        let handle = match self.engine.build_graph(&topology.describe()) {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "pipeline build failed");
                core.state = fallback;
                self.publish(core);
                return Err(e.into());
            }
        };

        let weak = Arc::downgrade(self);
        let callback: EventCallback = Arc::new(move |event| {
            if let Some(shared) = weak.upgrade() {
                shared.dispatch(handle, event);
            }
        });
        let played = self
            .engine
            .subscribe(handle, callback)
            .and_then(|()| self.engine.set_state(handle, GraphState::Playing));
        if let Err(e) = played {
            error!(graph = %handle, error = %e, "pipeline failed to play");
            self.engine.release(handle);
            core.state = fallback;
            self.publish(core);
            return Err(e.into());
        }

        let gates = topology
            .outputs()
            .iter()
            .map(|output| (output.branch, false))
            .collect();
        core.graph = Some(LiveGraph {
            handle,
            topology,
            settings,
            gates,
        });
        core.vad.reset();
        core.state = PipelineState::Running;
        core.restart_attempts = 0;
        info!(graph = %handle, "pipeline running");
        self.publish(core);

        let resume = std::mem::take(&mut core.resume_streams);
        self.reopen_streams(core, resume);
        Ok(())
    }

    /// Close every gate, finalize the recording and release the graph.
    fn teardown(self: &Arc<Self>, core: &mut Core, reason: StopReason) {
        if core.graph.is_none() && core.session.is_none() {
            if core.state != PipelineState::Stopped {
                core.state = PipelineState::Stopped;
                self.publish(core);
            }
            return;
        }

        core.state = PipelineState::Stopping;
        self.publish(core);

        core.vad.reset();
        if let Err(e) = self.stop_recording_locked(core, reason) {
            warn!(error = %e, "recording not finalized cleanly");
        }

        if let Some(graph) = core.graph.take() {
            for (branch, _) in graph.gates.iter().filter(|(_, open)| **open) {
                let Some(valve) = branch.valve_name() else {
                    continue;
                };
                if let Err(e) = self.engine.set_valve(graph.handle, &valve, false) {
                    debug!(%branch, error = %e, "valve not closed during teardown");
                }
            }
            if let Err(e) = self.engine.set_state(graph.handle, GraphState::Null) {
                warn!(graph = %graph.handle, error = %e, "graph did not reach null state");
            }
            self.engine.release(graph.handle);
            info!(graph = %graph.handle, ?reason, "pipeline stopped");
        }

        core.state = PipelineState::Stopped;
        self.publish(core);
    }

    /// Tear down after a fatal fault and schedule recovery.
    pub(crate) fn fail(self: &Arc<Self>, core: &mut Core, source: &str, message: &str) {
        if core.state != PipelineState::Running {
            debug!(state = %core.state, source, "fault ignored, pipeline not running");
            return;
        }

        error!(source, message, "pipeline fault");
        self.status.error(source, message);
        if let Some(graph) = &core.graph {
            core.resume_streams = graph.open_streams();
        }
        self.teardown(core, StopReason::Fault);
        self.schedule_restart(core);
    }

    /// Turn a failed engine call on the live graph into a fault.
    pub(crate) fn engine_failure(
        self: &Arc<Self>,
        core: &mut Core,
        err: EngineError,
    ) -> ControlError {
        let source = match &err {
            EngineError::ElementMissing(name) => name.clone(),
            _ => "engine".to_string(),
        };
        self.fail(core, &source, &err.to_string());
        match err {
            EngineError::ElementMissing(name) => ControlError::ElementMissing(name),
            other => ControlError::Engine(other),
        }
    }

    fn schedule_restart(self: &Arc<Self>, core: &mut Core) {
        core.cancel_restart();
        core.state = PipelineState::Restarting;

        let generation = core.next_generation();
        let task = self
            .runtime
            .spawn(restart_loop(Arc::downgrade(self), generation));
        core.restart = Some(RestartTask { generation, task });
        self.publish(core);
    }

    /// One restart attempt. Returns whether the loop should keep going.
    fn attempt_restart(self: &Arc<Self>, generation: u64) -> bool {
        let mut core = self.core.lock();
        if !core.restart_current(generation) || core.state != PipelineState::Restarting {
            return false;
        }

        let attempt = core.restart_attempts + 1;
        info!(attempt, "restarting pipeline");
        match self.start_locked(&mut core, PipelineState::Restarting) {
            Ok(()) => {
                info!(attempt, "pipeline recovered");
                if core.restart_current(generation) {
                    core.restart = None;
                }
                false
            }
            Err(e) => {
                core.restart_attempts = attempt;
                let policy = self.settings.settings().restart;
                let next = Backoff::from_settings(&policy).delay(attempt);
                if attempt >= policy.alert_after {
                    error!(attempt, error = %e, next_delay = ?next, "pipeline still down");
                    self.status.error(
                        "pipeline",
                        &format!("restart failed {attempt} times: {e}"),
                    );
                } else {
                    warn!(attempt, error = %e, next_delay = ?next, "restart attempt failed");
                }
                self.publish(&core);
                true
            }
        }
    }

    pub(crate) fn dispatch(self: &Arc<Self>, graph: GraphHandle, event: EngineEvent) {
        let mut core = self.core.lock();
        if core.graph.as_ref().map(|g| g.handle) != Some(graph) {
            trace!(%graph, ?event, "event from retired graph ignored");
            return;
        }

        match event {
            EngineEvent::Level { ref element, .. } if element == VAD_ELEMENT => {
                if let Some(level_db) = event.peak_rms_db() {
                    self.observe_level(&mut core, level_db);
                }
            }
            EngineEvent::Level { element, .. } => {
                trace!(%element, "level from unexpected element");
            }
            EngineEvent::Error {
                source,
                message,
                debug: details,
            } => {
                if let Some(details) = details {
                    debug!(%source, %details, "engine error details");
                }
                self.fail(&mut core, &source, &message);
            }
            EngineEvent::Warning { source, message } => {
                warn!(%source, %message, "engine warning");
                self.status.warning(&source, &message);
            }
            EngineEvent::EndOfStream => {
                self.fail(&mut core, "pipeline", "unexpected end of stream");
            }
            EngineEvent::StateChanged { old, new } => {
                debug!(?old, ?new, "graph state changed");
            }
        }
    }

    fn observe_level(self: &Arc<Self>, core: &mut Core, level_db: f64) {
        let Some(graph) = &core.graph else {
            return;
        };
        let vad = &graph.settings.vad;
        let auto_record = &graph.settings.auto_record;
        let inputs = VadInputs {
            threshold_db: vad.threshold_db,
            auto_record: auto_record.enabled,
            recording: core.session.is_some(),
            silence_timeout: auto_record.smart_split_timeout(),
        };
        self.status.level(LevelReading {
            level_db,
            threshold_db: vad.threshold_db,
            hysteresis_db: vad.hysteresis_db,
        });

        for intent in core.vad.observe(level_db, Local::now(), &inputs) {
            match intent {
                VadIntent::StartRecording => {
                    if let Err(e) = self.start_recording_locked(core) {
                        warn!(error = %e, "automatic recording did not start");
                    }
                }
                VadIntent::CancelSilenceTimer => {
                    if core.vad.cancel_timer() {
                        debug!("silence timer cancelled");
                    }
                }
                VadIntent::ArmSilenceTimer(timeout) => self.arm_silence_timer(core, timeout),
            }
        }
        self.publish(core);
    }

    fn arm_silence_timer(self: &Arc<Self>, core: &mut Core, timeout: Duration) {
        let generation = core.next_generation();
        let weak = Arc::downgrade(self);
        let task = self.runtime.spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(shared) = weak.upgrade() {
                shared.silence_elapsed(generation);
            }
        });
        core.vad.arm(SilenceTimer::new(generation, task));
        info!(?timeout, "silence timer armed");
    }

    fn silence_elapsed(self: &Arc<Self>, generation: u64) {
        let mut core = self.core.lock();
        if core.state != PipelineState::Running || !core.vad.take_expired(generation) {
            debug!(generation, "stale silence timer ignored");
            return;
        }

        let Some(auto_record) = core.graph.as_ref().map(|g| g.settings.auto_record.clone()) else {
            return;
        };
        let reason = StopReason::Silence {
            timeout: auto_record.smart_split_timeout(),
            smart_split: auto_record.smart_split_enabled,
        };
        info!(?reason, "silence timeout, stopping recording");
        if let Err(e) = self.stop_recording_locked(&mut core, reason) {
            warn!(error = %e, "silence stop failed");
        }
    }
}

async fn restart_loop(weak: Weak<Shared>, generation: u64) {
    loop {
        let delay = {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            let policy = shared.settings.settings().restart;
            let core = shared.core.lock();
            if !core.restart_current(generation) {
                return;
            }
            Backoff::from_settings(&policy).delay(core.restart_attempts)
        };

        debug!(?delay, generation, "restart scheduled");
        tokio::time::sleep(delay).await;

        let Some(shared) = weak.upgrade() else {
            return;
        };
        if !shared.attempt_restart(generation) {
            return;
        }
    }
}
