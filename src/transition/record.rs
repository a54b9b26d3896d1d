use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

pub type SharedRecord = Rc<RefCell<TransitionRecord>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Dispatching,
    Open,
    Settling,
    Committed,
    Canceled,
    TimedOut,
    Failed,
}

impl Phase {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Committed | Phase::Canceled | Phase::TimedOut | Phase::Failed
        )
    }

    /// Counts towards the one-active-record-per-context limit.
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != Phase::Idle
    }

    pub fn accepts_extensions(self) -> bool {
        matches!(self, Phase::Dispatching | Phase::Open)
    }

    pub fn composites(self) -> bool {
        matches!(self, Phase::Dispatching | Phase::Open | Phase::Settling)
    }

    /// The pipeline may stop waiting and resume unload/commit processing.
    pub fn is_resumable(self) -> bool {
        self == Phase::Settling || self.is_terminal()
    }

    pub fn can_advance_to(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Idle, Dispatching)
                | (Dispatching, Open | Committed | Canceled | TimedOut | Failed)
                | (Open, Settling | Canceled | TimedOut | Failed)
                | (Settling, Committed | Canceled)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NavigationReason {
    Back,
    Forward,
    Reload,
    Normal,
}

impl NavigationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            NavigationReason::Back => "back",
            NavigationReason::Forward => "forward",
            NavigationReason::Reload => "reload",
            NavigationReason::Normal => "normal",
        }
    }
}

impl fmt::Display for NavigationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown navigation reason: {0}")]
pub struct ParseReasonError(String);

impl FromStr for NavigationReason {
    type Err = ParseReasonError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "back" => Ok(NavigationReason::Back),
            "forward" => Ok(NavigationReason::Forward),
            "reload" => Ok(NavigationReason::Reload),
            "normal" => Ok(NavigationReason::Normal),
            other => Err(ParseReasonError(other.to_string())),
        }
    }
}

/// Identifies one navigation attempt within a browsing context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct NavigationId(pub u64);

impl fmt::Display for NavigationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nav-{}", self.0)
    }
}

/// Bookkeeping for promises registered through the extension entry point.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtensionSet {
    pending: usize,
    registered: usize,
    closed: bool,
}

impl ExtensionSet {
    pub fn pending(&self) -> usize {
        self.pending
    }

    pub fn registered(&self) -> usize {
        self.registered
    }

    pub fn is_drained(&self) -> bool {
        self.pending == 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn add(&mut self) -> bool {
        if self.closed {
            return false;
        }
        self.pending += 1;
        self.registered += 1;
        true
    }

    pub(crate) fn settle_one(&mut self) {
        self.pending = self.pending.saturating_sub(1);
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }
}

#[derive(Debug)]
pub struct TransitionRecord {
    navigation: NavigationId,
    phase: Phase,
    reason: NavigationReason,
    target_url: Rc<RefCell<String>>,
    extensions: ExtensionSet,
    created_at: Instant,
    deadline: Instant,
    phase_tx: watch::Sender<Phase>,
}

impl TransitionRecord {
    pub(crate) fn new(
        navigation: NavigationId,
        reason: NavigationReason,
        target_url: String,
        timeout: Duration,
    ) -> Self {
        let created_at = Instant::now();
        let (phase_tx, _) = watch::channel(Phase::Dispatching);
        Self {
            navigation,
            phase: Phase::Dispatching,
            reason,
            target_url: Rc::new(RefCell::new(target_url)),
            extensions: ExtensionSet::default(),
            created_at,
            deadline: created_at + timeout,
            phase_tx,
        }
    }

    pub fn navigation(&self) -> NavigationId {
        self.navigation
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn reason(&self) -> NavigationReason {
        self.reason
    }

    pub fn target_url(&self) -> String {
        self.target_url.borrow().clone()
    }

    pub(crate) fn shared_target_url(&self) -> Rc<RefCell<String>> {
        Rc::clone(&self.target_url)
    }

    /// Forget the destination once any hop turned out to be cross-origin.
    pub(crate) fn redact_target(&mut self) {
        let mut url = self.target_url.borrow_mut();
        if !url.is_empty() {
            debug!(target: "transition", navigation = %self.navigation, "redacting cross-origin target URL");
            url.clear();
        }
    }

    pub fn extensions(&self) -> ExtensionSet {
        self.extensions
    }

    pub(crate) fn extensions_mut(&mut self) -> &mut ExtensionSet {
        &mut self.extensions
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase_tx.subscribe()
    }

    /// Move to `next` if the lifecycle allows it. Leaving the registration
    /// phases closes the extension set for good.
    pub(crate) fn advance(&mut self, next: Phase) -> bool {
        if !self.phase.can_advance_to(next) {
            debug!(
                target: "transition",
                navigation = %self.navigation,
                from = ?self.phase,
                to = ?next,
                "ignoring phase change"
            );
            return false;
        }

        info!(
            target: "transition",
            navigation = %self.navigation,
            from = ?self.phase,
            to = ?next,
            "transition phase changed"
        );
        self.phase = next;
        if !next.accepts_extensions() {
            self.extensions.close();
        }
        self.phase_tx.send_replace(next);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> TransitionRecord {
        TransitionRecord::new(
            NavigationId(1),
            NavigationReason::Normal,
            "https://example.com/next".into(),
            Duration::from_millis(4_000),
        )
    }

    #[test]
    fn terminal_phases_are_sticky() {
        for terminal in [
            Phase::Committed,
            Phase::Canceled,
            Phase::TimedOut,
            Phase::Failed,
        ] {
            for next in [
                Phase::Idle,
                Phase::Dispatching,
                Phase::Open,
                Phase::Settling,
                Phase::Committed,
                Phase::Canceled,
                Phase::TimedOut,
                Phase::Failed,
            ] {
                assert!(!terminal.can_advance_to(next), "{terminal:?} -> {next:?}");
            }
        }
    }

    #[test]
    fn settling_cannot_time_out() {
        assert!(!Phase::Settling.can_advance_to(Phase::TimedOut));
        assert!(Phase::Settling.can_advance_to(Phase::Committed));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_is_creation_plus_timeout() {
        let record = record();
        assert_eq!(
            record.deadline() - record.created_at(),
            Duration::from_millis(4_000)
        );
        assert_eq!(record.phase(), Phase::Dispatching);
    }

    #[tokio::test]
    async fn leaving_open_closes_registration() {
        let mut record = record();
        let rx = record.subscribe();
        assert!(record.extensions_mut().add());
        assert!(record.advance(Phase::Open));
        assert!(record.extensions_mut().add());
        assert!(record.advance(Phase::Settling));
        assert!(!record.extensions_mut().add());
        assert_eq!(record.extensions().registered(), 2);
        assert_eq!(*rx.borrow(), Phase::Settling);
    }

    #[tokio::test]
    async fn redaction_is_visible_through_shared_url() {
        let mut record = record();
        let shared = record.shared_target_url();
        record.redact_target();
        assert_eq!(record.target_url(), "");
        assert!(shared.borrow().is_empty());
    }

    #[test]
    fn parses_reasons() {
        assert_eq!(
            "Back".parse::<NavigationReason>().unwrap(),
            NavigationReason::Back
        );
        assert!("sideways".parse::<NavigationReason>().is_err());
    }
}
