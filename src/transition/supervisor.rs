use tokio::sync::watch;
use tokio::time::{sleep_until, Instant};
use tracing::debug;

use super::controller::TransitionController;
use super::record::{NavigationId, Phase, TransitionRecord};

/// How the navigation pipeline got to resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resumption {
    pub phase: Phase,
    pub at: Instant,
    pub timed_out: bool,
}

/// Races settlement of a transition against its deadline.
pub struct TimeoutSupervisor {
    navigation: NavigationId,
    deadline: Instant,
    phases: watch::Receiver<Phase>,
}

impl TimeoutSupervisor {
    pub fn start(record: &TransitionRecord) -> Self {
        Self {
            navigation: record.navigation(),
            deadline: record.deadline(),
            phases: record.subscribe(),
        }
    }

    /// Wait until the transition either becomes resumable or its deadline
    /// passes. On the deadline the controller is told to time out, which
    /// abandons every outstanding extension.
    pub async fn supervise(&mut self, controller: &TransitionController) -> Resumption {
        let current = *self.phases.borrow();
        if current.is_resumable() {
            return self.resumed(current, false);
        }

        let deadline = self.deadline;
        let settled = tokio::select! {
            biased;
            changed = self.phases.wait_for(|phase| phase.is_resumable()) => {
                // An error means the record was dropped; nothing left to wait for.
                Some(changed.map(|phase| *phase).ok())
            }
            _ = sleep_until(deadline) => None,
        };

        match settled {
            Some(Some(phase)) => self.resumed(phase, false),
            Some(None) => self.resumed(controller.phase(), false),
            None => {
                let phase = controller.time_out();
                self.resumed(phase, phase == Phase::TimedOut)
            }
        }
    }

    fn resumed(&self, phase: Phase, timed_out: bool) -> Resumption {
        debug!(
            target: "transition",
            navigation = %self.navigation,
            ?phase,
            timed_out,
            "navigation pipeline resuming"
        );
        Resumption {
            phase,
            at: Instant::now(),
            timed_out,
        }
    }
}
