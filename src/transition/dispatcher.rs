use std::cell::RefCell;
use std::rc::{Rc, Weak};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use super::lifetime::{LifetimeTracker, Registration, VerdictSink};
use super::record::{NavigationId, NavigationReason, Phase, SharedRecord, TransitionRecord};
use super::window_proxy::{NewWindow, WindowProxyHandle};
use crate::compositor::{DocumentCompositor, RevealGate, RevealHold, Slot};
use crate::origin::{redact, OriginClass};
use crate::promise::{JobQueue, Promise};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("transition event already dispatched for {0}")]
    AlreadyDispatched(NavigationId),
    #[error("a transition event is already being dispatched")]
    TransitionActive,
}

/// Destination as classified by the Origin Guard.
#[derive(Debug, Clone)]
pub struct UrlInfo {
    url: Url,
    class: OriginClass,
}

impl UrlInfo {
    pub fn new(url: Url, class: OriginClass) -> Self {
        Self { url, class }
    }

    pub fn class(&self) -> OriginClass {
        self.class
    }

    /// What script is allowed to see.
    pub fn exposed(&self) -> String {
        redact(&self.url, self.class)
    }
}

/// The object handed to transition listeners.
#[derive(Clone)]
pub struct TransitionEvent {
    reason: NavigationReason,
    url: Rc<RefCell<String>>,
    new_window: Promise<NewWindow>,
    tracker: LifetimeTracker,
    reveal: RevealGate,
    record: Weak<RefCell<TransitionRecord>>,
    compositor: Weak<RefCell<DocumentCompositor>>,
}

impl TransitionEvent {
    pub fn reason(&self) -> NavigationReason {
        self.reason
    }

    /// Empty whenever any hop of the navigation has been cross-origin, even if
    /// that hop was only seen after dispatch.
    pub fn url(&self) -> String {
        self.url.borrow().clone()
    }

    pub fn new_window(&self) -> Promise<NewWindow> {
        self.new_window.clone()
    }

    /// Keep the outgoing document alive until `promise` settles. Silently
    /// ignored once registration has closed.
    pub fn transition_until<T: Clone + 'static>(&self, promise: &Promise<T>) {
        self.register(promise);
    }

    /// Same as [`transition_until`](Self::transition_until) but reports
    /// whether the registration was taken.
    pub fn register<T: Clone + 'static>(&self, promise: &Promise<T>) -> Registration {
        self.tracker.extend(promise)
    }

    /// Delay revealing the incoming document until the returned hold is
    /// released. Script bindings use this so their own continuations on
    /// `newWindow` run before real content paints.
    pub fn hold_reveal(&self) -> RevealHold {
        self.reveal.hold()
    }

    /// Paint `content` in the incoming root until the real document is
    /// revealed.
    pub fn insert_placeholder(&self, content: impl Into<String>) {
        self.with_compositor(|compositor| compositor.insert_placeholder(content));
    }

    pub fn set_z_index(&self, slot: Slot, z_index: i32) {
        self.with_compositor(|compositor| compositor.set_z_index(slot, z_index));
    }

    pub fn set_offset(&self, slot: Slot, dx: f32, dy: f32) {
        self.with_compositor(|compositor| compositor.set_offset(slot, dx, dy));
    }

    /// Effects only reach the compositor while this event's transition is
    /// still compositing.
    fn with_compositor(&self, effect: impl FnOnce(&mut DocumentCompositor)) {
        let live = self
            .record
            .upgrade()
            .is_some_and(|record| record.borrow().phase().composites());
        let compositor = self.compositor.upgrade().filter(|_| live);
        match compositor {
            Some(compositor) => effect(&mut *compositor.borrow_mut()),
            None => debug!(target: "compositor", "effect ignored: transition no longer composites"),
        }
    }
}

pub trait TransitionListener {
    fn handle_transition(&mut self, event: &TransitionEvent);
}

impl<F> TransitionListener for F
where
    F: FnMut(&TransitionEvent),
{
    fn handle_transition(&mut self, event: &TransitionEvent) {
        self(event)
    }
}

pub struct DispatchContext<'a> {
    pub queue: &'a JobQueue,
    pub timeout: Duration,
    pub sink: VerdictSink,
    pub reveal: RevealGate,
    pub compositor: Weak<RefCell<DocumentCompositor>>,
}

pub struct Dispatched {
    pub record: SharedRecord,
    pub tracker: LifetimeTracker,
}

#[derive(Default)]
pub struct EventDispatcher {
    listeners: Vec<Box<dyn TransitionListener>>,
    last_dispatched: Option<NavigationId>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_listener<L>(&mut self, listener: L)
    where
        L: TransitionListener + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Fire the transition event for `navigation`. Runs listeners
    /// synchronously and leaves the returned record in `Open` if anything was
    /// registered during the turn, `Committed` otherwise.
    pub fn dispatch(
        &mut self,
        navigation: NavigationId,
        reason: NavigationReason,
        url_info: UrlInfo,
        window: &WindowProxyHandle,
        cx: DispatchContext<'_>,
    ) -> Result<Dispatched, DispatchError> {
        if self.last_dispatched == Some(navigation) {
            return Err(DispatchError::AlreadyDispatched(navigation));
        }
        self.last_dispatched = Some(navigation);

        let record = Rc::new(RefCell::new(TransitionRecord::new(
            navigation,
            reason,
            url_info.exposed(),
            cx.timeout,
        )));
        window.bind(Rc::downgrade(&record));
        let tracker = LifetimeTracker::new(Rc::downgrade(&record), cx.queue.clone(), cx.sink);

        let event = TransitionEvent {
            reason,
            url: record.borrow().shared_target_url(),
            new_window: window.promise(),
            tracker: tracker.clone(),
            reveal: cx.reveal.clone(),
            record: Rc::downgrade(&record),
            compositor: cx.compositor,
        };

        info!(
            target: "transition",
            %navigation,
            %reason,
            origin = ?url_info.class(),
            listeners = self.listeners.len(),
            "dispatching navigation transition event"
        );
        for listener in self.listeners.iter_mut() {
            listener.handle_transition(&event);
        }

        // Queued after every continuation listeners attached during dispatch.
        let hold = cx.reveal.hold();
        window.promise().react(move |_| hold.release());

        let registered = record.borrow().extensions().registered();
        let next = if registered > 0 {
            Phase::Open
        } else {
            Phase::Committed
        };
        record.borrow_mut().advance(next);
        if next == Phase::Open {
            tracker.dispatch_finished();
        }

        Ok(Dispatched { record, tracker })
    }
}
