//! Output gates.
//!
//! Gated branches run continuously behind a valve; enabling a branch only
//! opens its valve, so toggling never rebuilds the graph.

use std::collections::BTreeSet;
use std::sync::Arc;

use nixon_core::{Branch, PipelineState};
use tracing::{info, warn};

use crate::controller::{Core, Shared};
use crate::session::StopReason;
use crate::{ControlError, Controller, Result};

impl Controller {
    /// Open or close the gate of `branch`.
    ///
    /// The recording branch goes through the session manager so a record is
    /// created or finalized along with the valve.
    pub fn toggle_branch(&self, branch: Branch, enable: bool) -> Result<()> {
        let mut core = self.shared.core.lock();
        self.shared.toggle_locked(&mut core, branch, enable)
    }
}

impl Shared {
    pub(crate) fn toggle_locked(
        self: &Arc<Self>,
        core: &mut Core,
        branch: Branch,
        enable: bool,
    ) -> Result<()> {
        if core.state != PipelineState::Running {
            return Err(ControlError::NotRunning(core.state));
        }
        if branch == Branch::Recording {
            return if enable {
                self.start_recording_locked(core)
            } else {
                self.stop_recording_locked(core, StopReason::Manual)
            };
        }

        let Some(graph) = core.graph.as_ref() else {
            return Err(ControlError::NotRunning(core.state));
        };
        let (Some(&open), Some(valve)) = (graph.gates.get(&branch), branch.valve_name()) else {
            warn!(%branch, "branch is not configured");
            return Err(ControlError::BranchUnavailable(branch));
        };
        if open == enable {
            return Ok(());
        }

        if let Err(e) = self.engine.set_valve(graph.handle, &valve, enable) {
            return Err(self.engine_failure(core, e));
        }
        core.set_gate(branch, enable);
        info!(%branch, open = enable, "branch gate toggled");
        self.publish(core);
        Ok(())
    }

    /// Reopen stream gates carried over from the previous graph.
    pub(crate) fn reopen_streams(self: &Arc<Self>, core: &mut Core, streams: BTreeSet<Branch>) {
        for branch in streams {
            let present = core.graph.as_ref().is_some_and(|g| g.gates.contains_key(&branch));
            if !present {
                info!(%branch, "branch no longer configured, gate reset");
                continue;
            }
            if let Err(e) = self.toggle_locked(core, branch, true) {
                warn!(%branch, error = %e, "could not reopen gate");
            }
        }
    }
}
