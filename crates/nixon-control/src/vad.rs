//! Voice activity decisions.
//!
//! [`VadState::observe`] turns one level measurement into a list of
//! [`VadIntent`]s without touching the graph or the clock; the controller
//! carries them out while it holds the structural lock.

use std::time::Duration;

use chrono::{DateTime, Local};
use tokio::task::JoinHandle;
use tracing::debug;

/// What the controller knows when a level measurement arrives.
#[derive(Debug, Clone, Copy)]
pub(crate) struct VadInputs {
    pub threshold_db: f64,
    pub auto_record: bool,
    pub recording: bool,
    pub silence_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum VadIntent {
    StartRecording,
    CancelSilenceTimer,
    ArmSilenceTimer(Duration),
}

/// Pending silence-stop timer.
///
/// Dropping it aborts the sleeping task. The generation guards against a
/// task that already woke up and is waiting for the lock.
#[derive(Debug)]
pub(crate) struct SilenceTimer {
    generation: u64,
    task: Option<JoinHandle<()>>,
}

impl SilenceTimer {
    pub fn new(generation: u64, task: JoinHandle<()>) -> Self {
        Self {
            generation,
            task: Some(task),
        }
    }

    #[cfg(test)]
    pub fn detached(generation: u64) -> Self {
        Self {
            generation,
            task: None,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for SilenceTimer {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct VadState {
    active: bool,
    last_event_time: Option<DateTime<Local>>,
    pending: Option<SilenceTimer>,
}

impl VadState {
    /// Feed one measurement. Levels at the threshold count as silence.
    pub fn observe(
        &mut self,
        level_db: f64,
        now: DateTime<Local>,
        inputs: &VadInputs,
    ) -> Vec<VadIntent> {
        let voice = level_db > inputs.threshold_db;
        let mut intents = Vec::new();

        match (self.active, voice) {
            (false, true) => {
                self.active = true;
                self.last_event_time = Some(now);
                debug!(level_db, "voice detected");

                if self.pending.is_some() {
                    intents.push(VadIntent::CancelSilenceTimer);
                }
                if inputs.auto_record && !inputs.recording {
                    intents.push(VadIntent::StartRecording);
                }
            }
            (true, false) => {
                self.active = false;
                self.last_event_time = Some(now);
                debug!(level_db, "silence detected");

                if inputs.auto_record && inputs.recording && self.pending.is_none() {
                    intents.push(VadIntent::ArmSilenceTimer(inputs.silence_timeout));
                }
            }
            _ => {}
        }

        intents
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn last_event_time(&self) -> Option<DateTime<Local>> {
        self.last_event_time
    }

    pub fn has_pending_timer(&self) -> bool {
        self.pending.is_some()
    }

    /// Install `timer`, aborting any timer it replaces.
    pub fn arm(&mut self, timer: SilenceTimer) {
        if let Some(previous) = self.pending.replace(timer) {
            debug!(generation = previous.generation(), "silence timer superseded");
        }
    }

    pub fn cancel_timer(&mut self) -> bool {
        self.pending.take().is_some()
    }

    /// Claim the pending timer if `generation` is still the current one.
    pub fn take_expired(&mut self, generation: u64) -> bool {
        match &self.pending {
            Some(timer) if timer.generation() == generation => {
                self.pending = None;
                true
            }
            _ => false,
        }
    }

    /// Go idle and cancel any pending timer. The last event time is kept.
    pub fn reset(&mut self) {
        self.active = false;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(auto_record: bool, recording: bool) -> VadInputs {
        VadInputs {
            threshold_db: -40.0,
            auto_record,
            recording,
            silence_timeout: Duration::from_secs(10),
        }
    }

    #[test]
    fn test_voice_starts_recording_once() {
        let mut vad = VadState::default();
        let now = Local::now();

        let intents = vad.observe(-35.0, now, &inputs(true, false));
        assert_eq!(intents, vec![VadIntent::StartRecording]);
        assert!(vad.is_active());
        assert_eq!(vad.last_event_time(), Some(now));

        // Still voice: no transition, nothing to do.
        assert!(vad.observe(-35.0, Local::now(), &inputs(true, true)).is_empty());
        assert_eq!(vad.last_event_time(), Some(now));
    }

    #[test]
    fn test_threshold_is_silence() {
        let mut vad = VadState::default();
        assert!(vad.observe(-40.0, Local::now(), &inputs(true, false)).is_empty());
        assert!(!vad.is_active());
        assert_eq!(vad.last_event_time(), None);
    }

    #[test]
    fn test_manual_mode_only_tracks_activity() {
        let mut vad = VadState::default();
        assert!(vad.observe(-10.0, Local::now(), &inputs(false, false)).is_empty());
        assert!(vad.is_active());
        assert!(vad.observe(-80.0, Local::now(), &inputs(false, true)).is_empty());
        assert!(!vad.is_active());
    }

    #[test]
    fn test_silence_arms_only_while_recording() {
        let mut vad = VadState::default();
        vad.observe(-10.0, Local::now(), &inputs(true, true));
        assert_eq!(
            vad.observe(-80.0, Local::now(), &inputs(true, true)),
            vec![VadIntent::ArmSilenceTimer(Duration::from_secs(10))]
        );

        let mut idle = VadState::default();
        idle.observe(-10.0, Local::now(), &inputs(true, false));
        assert!(idle.observe(-80.0, Local::now(), &inputs(true, false)).is_empty());
    }

    #[test]
    fn test_voice_cancels_pending_timer() {
        let mut vad = VadState::default();
        vad.observe(-10.0, Local::now(), &inputs(true, true));
        vad.observe(-80.0, Local::now(), &inputs(true, true));
        vad.arm(SilenceTimer::detached(1));

        assert_eq!(
            vad.observe(-10.0, Local::now(), &inputs(true, true)),
            vec![VadIntent::CancelSilenceTimer]
        );
        assert!(vad.cancel_timer());
        assert!(!vad.has_pending_timer());
    }

    #[test]
    fn test_pending_timer_is_not_rearmed() {
        let mut vad = VadState::default();
        vad.observe(-10.0, Local::now(), &inputs(true, true));
        vad.observe(-80.0, Local::now(), &inputs(true, true));
        vad.arm(SilenceTimer::detached(1));

        // A stale timer left behind by a racing voice event must not double up.
        vad.active = true;
        assert!(vad.observe(-80.0, Local::now(), &inputs(true, true)).is_empty());
    }

    #[test]
    fn test_generations() {
        let mut vad = VadState::default();
        vad.arm(SilenceTimer::detached(1));
        vad.arm(SilenceTimer::detached(2));

        assert!(!vad.take_expired(1));
        assert!(vad.has_pending_timer());
        assert!(vad.take_expired(2));
        assert!(!vad.take_expired(2));
    }

    #[test]
    fn test_reset_clears_timer() {
        let mut vad = VadState::default();
        let now = Local::now();
        vad.observe(-10.0, now, &inputs(false, false));
        vad.arm(SilenceTimer::detached(7));
        vad.reset();

        assert!(!vad.is_active());
        assert!(!vad.has_pending_timer());
        assert_eq!(vad.last_event_time(), Some(now));
    }
}
