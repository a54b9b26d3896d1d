use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use super::dispatcher::{
    DispatchContext, DispatchError, Dispatched, EventDispatcher, TransitionListener, UrlInfo,
};
use super::lifetime::{LifetimeTracker, TrackerVerdict, VerdictSink};
use super::record::{ExtensionSet, NavigationId, NavigationReason, Phase, SharedRecord};
use super::supervisor::{Resumption, TimeoutSupervisor};
use super::window_proxy::{CancelReason, NavigationError, WindowProxyHandle, WindowProxyResolver};
use crate::compositor::{DocumentCompositor, DocumentId, Slot};
use crate::config::TransitionConfig;
use crate::origin::{OriginClass, RedirectGuard};
use crate::promise::JobQueue;

#[derive(Debug, Clone)]
pub struct NavigationRequest {
    pub id: NavigationId,
    pub url: Url,
    pub reason: NavigationReason,
    /// Hops already known when the hook runs.
    pub redirects: Vec<Url>,
}

impl NavigationRequest {
    pub fn new(id: NavigationId, url: Url, reason: NavigationReason) -> Self {
        Self {
            id,
            url,
            reason,
            redirects: Vec::new(),
        }
    }

    pub fn with_redirects(mut self, redirects: Vec<Url>) -> Self {
        self.redirects = redirects;
        self
    }
}

/// What the pipeline should do right after the hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    /// Keep loading, but defer unloading the outgoing document.
    Open,
    /// Nothing registered; proceed without delay.
    Committed,
}

struct ActiveTransition {
    record: SharedRecord,
    tracker: LifetimeTracker,
    window: WindowProxyResolver,
    guard: RedirectGuard,
}

struct ControllerInner {
    timeout: Duration,
    queue: JobQueue,
    compositor: Rc<RefCell<DocumentCompositor>>,
    dispatcher: RefCell<EventDispatcher>,
    active: RefCell<Option<ActiveTransition>>,
}

/// Owns the transition record of one top-level browsing context and wires
/// pipeline signals into the dispatcher, tracker, window resolver and
/// compositor.
#[derive(Clone)]
pub struct TransitionController {
    inner: Rc<ControllerInner>,
}

impl TransitionController {
    pub fn new(
        config: &TransitionConfig,
        queue: JobQueue,
        compositor: Rc<RefCell<DocumentCompositor>>,
    ) -> Self {
        Self {
            inner: Rc::new(ControllerInner {
                timeout: config.timeout(),
                queue,
                compositor,
                dispatcher: RefCell::new(EventDispatcher::new()),
                active: RefCell::new(None),
            }),
        }
    }

    pub fn add_listener<L>(&self, listener: L)
    where
        L: TransitionListener + 'static,
    {
        self.inner.dispatcher.borrow_mut().add_listener(listener);
    }

    pub fn queue(&self) -> &JobQueue {
        &self.inner.queue
    }

    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    pub fn compositor(&self) -> Rc<RefCell<DocumentCompositor>> {
        Rc::clone(&self.inner.compositor)
    }

    pub fn is_active(&self) -> bool {
        self.phase().is_active()
    }

    /// Phase of the current record, `Idle` when there is none.
    pub fn phase(&self) -> Phase {
        self.with_active(|active| active.record.borrow().phase())
            .unwrap_or(Phase::Idle)
    }

    pub fn navigation(&self) -> Option<NavigationId> {
        self.with_active(|active| active.record.borrow().navigation())
    }

    pub fn target_url(&self) -> Option<String> {
        self.with_active(|active| active.record.borrow().target_url())
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.with_active(|active| active.record.borrow().deadline())
    }

    pub fn extensions(&self) -> Option<ExtensionSet> {
        self.with_active(|active| active.record.borrow().extensions())
    }

    pub fn window(&self) -> Option<WindowProxyHandle> {
        self.with_active(|active| active.window.handle().clone())
    }

    pub fn origin_class(&self) -> Option<OriginClass> {
        self.with_active(|active| active.guard.class())
    }

    /// The pipeline hook. Called once the pipeline has committed to replacing
    /// the current document and before the old one unloads. A transition
    /// still in flight for this context is canceled first.
    pub fn begin(
        &self,
        current: &Url,
        request: NavigationRequest,
    ) -> Result<HookOutcome, DispatchError> {
        if self.inner.active.borrow().is_some() {
            debug!(
                target: "transition",
                navigation = %request.id,
                "new navigation supersedes the active transition"
            );
            self.cancel(CancelReason::Superseded);
            self.finish();
        }

        let guard = RedirectGuard::new(current, &request.url, &request.redirects);
        let class = guard.class();
        let mut window = WindowProxyResolver::new(&self.inner.queue);
        window.observe_origin(class);
        let handle = window.handle().clone();

        let reveal = self.inner.compositor.borrow_mut().begin_transition();
        let navigation = request.id;
        let weak = Rc::downgrade(&self.inner);
        let sink: VerdictSink = Rc::new(move |verdict| {
            if let Some(controller) = Self::upgrade(&weak) {
                controller.on_tracker_verdict(navigation, verdict);
            }
        });
        let cx = DispatchContext {
            queue: &self.inner.queue,
            timeout: self.inner.timeout,
            sink,
            reveal,
            compositor: Rc::downgrade(&self.inner.compositor),
        };

        let dispatched = self
            .inner
            .dispatcher
            .try_borrow_mut()
            .map_err(|_| DispatchError::TransitionActive)
            .and_then(|mut dispatcher| {
                dispatcher.dispatch(
                    navigation,
                    request.reason,
                    UrlInfo::new(request.url.clone(), class),
                    &handle,
                    cx,
                )
            });
        let Dispatched { record, tracker } = match dispatched {
            Ok(dispatched) => dispatched,
            Err(err) => {
                self.inner.compositor.borrow_mut().revert(Slot::Outgoing);
                return Err(err);
            }
        };

        let outcome = if record.borrow().phase() == Phase::Committed {
            self.inner.compositor.borrow_mut().revert(Slot::Outgoing);
            HookOutcome::Committed
        } else {
            HookOutcome::Open
        };

        *self.inner.active.borrow_mut() = Some(ActiveTransition {
            record,
            tracker,
            window,
            guard,
        });
        self.inner.queue.checkpoint();

        info!(target: "transition", %navigation, ?outcome, "navigation hook returned");
        Ok(outcome)
    }

    /// A redirect hop was observed while the transition is live.
    pub fn redirected(&self, hop: &Url) {
        let observed = self.with_active_mut(|active| {
            let was = active.guard.class();
            let class = active.guard.observe(hop);
            debug!(target: "transition", %hop, hops = active.guard.hops(), ?class, "redirect observed");
            if class == OriginClass::CrossOrigin && was == OriginClass::SameOrigin {
                active.record.borrow_mut().redact_target();
            }
            active.window.observe_origin(class);
        });
        if observed.is_some() {
            self.inner.queue.checkpoint();
        }
    }

    /// The incoming document finished loading at `url`.
    pub fn response_ready(&self, document: DocumentId, url: &Url) {
        let observed = self.with_active_mut(|active| {
            let was = active.guard.class();
            if active.guard.last_url() != url
                && active.guard.observe(url) == OriginClass::CrossOrigin
                && was == OriginClass::SameOrigin
            {
                active.record.borrow_mut().redact_target();
                active.window.observe_origin(OriginClass::CrossOrigin);
            }
            active.window.navigation_completed(document, url.clone());
        });
        if observed.is_some() {
            self.inner.compositor.borrow_mut().attach_incoming(document);
            self.inner.queue.checkpoint();
        }
    }

    /// The load failed. Author handlers observe the rejection first; whatever
    /// they do, the transition ends up `Failed` without further waiting.
    pub fn navigation_failed(&self, error: &NavigationError) {
        let observed = self.with_active_mut(|active| {
            active.window.navigation_failed(error);
        });
        if observed.is_none() {
            return;
        }
        self.inner.queue.checkpoint();
        self.fail(&error.to_string());
    }

    /// Cancel the navigation. Registration closes and compositing reverts
    /// before this returns.
    pub fn cancel(&self, reason: CancelReason) -> bool {
        let Some((record, tracker)) = self.with_active_mut(|active| {
            active.window.navigation_canceled(reason);
            (Rc::clone(&active.record), active.tracker.clone())
        }) else {
            return false;
        };

        let canceled = record.borrow_mut().advance(Phase::Canceled);
        tracker.close();
        self.inner.compositor.borrow_mut().revert(Slot::Outgoing);
        if canceled {
            info!(
                target: "transition",
                navigation = %record.borrow().navigation(),
                %reason,
                "transition canceled"
            );
        }
        self.inner.queue.checkpoint();
        canceled
    }

    /// Force the deadline outcome. Returns the phase the record ends up in,
    /// which stays as-is if it had already become resumable.
    pub fn time_out(&self) -> Phase {
        let Some((record, tracker)) = self.active_parts() else {
            return Phase::Idle;
        };

        let timed_out = record.borrow_mut().advance(Phase::TimedOut);
        if timed_out {
            let (navigation, pending) = {
                let record = record.borrow();
                (record.navigation(), record.extensions().pending())
            };
            warn!(
                target: "transition",
                %navigation,
                pending,
                "transition timed out; abandoning outstanding extensions"
            );
            tracker.close();
            self.inner.compositor.borrow_mut().revert(Slot::Outgoing);
        }
        let phase = record.borrow().phase();
        phase
    }

    /// Suspend until the active transition is resumable or its deadline
    /// passes. Returns `None` when there is nothing to wait for.
    pub async fn await_settlement(&self) -> Option<Resumption> {
        let (record, _) = self.active_parts()?;
        let mut supervisor = TimeoutSupervisor::start(&record.borrow());
        drop(record);
        Some(supervisor.supervise(self).await)
    }

    /// The pipeline is done with this attempt: commit a settling transition,
    /// drop back to single-document rendering and destroy the record.
    pub fn finish(&self) -> Option<Phase> {
        let active = self.inner.active.borrow_mut().take()?;
        let phase = {
            let mut record = active.record.borrow_mut();
            match record.phase() {
                Phase::Settling => {
                    record.advance(Phase::Committed);
                }
                phase if phase.is_active() => {
                    record.advance(Phase::Canceled);
                }
                _ => {}
            }
            record.phase()
        };
        active.tracker.close();

        let mut compositor = self.inner.compositor.borrow_mut();
        if compositor.is_compositing() {
            compositor.revert(Slot::Outgoing);
        }
        drop(compositor);

        info!(
            target: "transition",
            navigation = %active.record.borrow().navigation(),
            ?phase,
            "transition finished"
        );
        Some(phase)
    }

    fn on_tracker_verdict(&self, navigation: NavigationId, verdict: TrackerVerdict) {
        let Some((record, _)) = self.active_parts() else {
            return;
        };
        if record.borrow().navigation() != navigation {
            debug!(target: "transition", %navigation, "dropping verdict for a finished transition");
            return;
        }

        match verdict {
            TrackerVerdict::Drained => {
                record.borrow_mut().advance(Phase::Settling);
            }
            TrackerVerdict::Rejected(rejection) => self.fail(rejection.message()),
        }
    }

    fn fail(&self, cause: &str) {
        let Some((record, tracker)) = self.active_parts() else {
            return;
        };
        if !record.borrow_mut().advance(Phase::Failed) {
            return;
        }
        warn!(
            target: "transition",
            navigation = %record.borrow().navigation(),
            cause,
            "transition failed; resuming navigation"
        );
        tracker.close();
        self.inner.compositor.borrow_mut().revert(Slot::Outgoing);
    }

    fn active_parts(&self) -> Option<(SharedRecord, LifetimeTracker)> {
        self.with_active(|active| (Rc::clone(&active.record), active.tracker.clone()))
    }

    fn with_active<R>(&self, f: impl FnOnce(&ActiveTransition) -> R) -> Option<R> {
        self.inner.active.borrow().as_ref().map(f)
    }

    fn with_active_mut<R>(&self, f: impl FnOnce(&mut ActiveTransition) -> R) -> Option<R> {
        self.inner.active.borrow_mut().as_mut().map(f)
    }

    fn upgrade(weak: &Weak<ControllerInner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }
}
