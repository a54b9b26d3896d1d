//! Aggregates every promise registered through `transitionUntil` into one
//! settlement verdict.
//!
//! Registration never has an explicit "done" call. The tracker infers closure
//! by drain-to-fixpoint: once every registered promise has settled it waits
//! until the whole scheduling turn has drained, and only if nothing new was
//! registered by then does it report [`TrackerVerdict::Drained`].

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use tracing::{debug, warn};

use super::record::{Phase, TransitionRecord};
use crate::promise::{JobQueue, Promise, Rejection, Settled};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerVerdict {
    Drained,
    Rejected(Rejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Accepted,
    /// Registration had already closed. Not an error.
    Ignored,
}

pub type VerdictSink = Rc<dyn Fn(TrackerVerdict)>;

struct TrackerInner {
    record: Weak<RefCell<TransitionRecord>>,
    queue: JobQueue,
    sink: VerdictSink,
    check_scheduled: Cell<bool>,
    finished: Cell<bool>,
    /// Rejection seen while listeners were still running.
    deferred: RefCell<Option<Rejection>>,
}

#[derive(Clone)]
pub struct LifetimeTracker {
    inner: Rc<TrackerInner>,
}

impl LifetimeTracker {
    pub fn new(record: Weak<RefCell<TransitionRecord>>, queue: JobQueue, sink: VerdictSink) -> Self {
        Self {
            inner: Rc::new(TrackerInner {
                record,
                queue,
                sink,
                check_scheduled: Cell::new(false),
                finished: Cell::new(false),
                deferred: RefCell::new(None),
            }),
        }
    }

    /// Register `promise` as keeping the transition open. Safe to call from
    /// inside continuations of earlier registrations.
    pub fn extend<T: Clone + 'static>(&self, promise: &Promise<T>) -> Registration {
        let Some(record) = self.inner.record.upgrade() else {
            debug!(target: "transition", "extension ignored: transition already destroyed");
            return Registration::Ignored;
        };

        let (navigation, pending) = {
            let mut record = record.borrow_mut();
            if self.inner.finished.get()
                || record.extensions().is_closed()
                || !record.phase().accepts_extensions()
            {
                debug!(
                    target: "transition",
                    navigation = %record.navigation(),
                    phase = ?record.phase(),
                    "extension ignored: registration closed"
                );
                return Registration::Ignored;
            }
            record.extensions_mut().add();
            (record.navigation(), record.extensions().pending())
        };

        debug!(target: "transition", %navigation, pending, "extension registered");

        let tracker = self.clone();
        promise.react(move |settled| tracker.observe(settled));
        Registration::Accepted
    }

    pub fn is_finished(&self) -> bool {
        self.inner.finished.get()
    }

    /// Dispatch has left `Dispatching`. Verdicts reached while listeners were
    /// still running are delivered from the next checkpoint, once the owner
    /// has taken the record.
    pub(crate) fn dispatch_finished(&self) {
        if self.inner.finished.get() {
            return;
        }
        let deferred = self.inner.deferred.borrow_mut().take();
        if let Some(rejection) = deferred {
            let tracker = self.clone();
            self.inner
                .queue
                .enqueue(move || tracker.finish(TrackerVerdict::Rejected(rejection)));
            return;
        }
        let drained = self.inner.record.upgrade().is_some_and(|record| {
            let record = record.borrow();
            record.phase() == Phase::Open && record.extensions().is_drained()
        });
        if drained {
            self.schedule_closure_check();
        }
    }

    /// Stop reporting. Later settlements are observed and dropped.
    pub(crate) fn close(&self) {
        self.inner.finished.set(true);
        if let Some(record) = self.inner.record.upgrade() {
            record.borrow_mut().extensions_mut().close();
        }
    }

    fn observe<T>(&self, settled: Settled<T>) {
        let record = match self.inner.record.upgrade() {
            Some(record) if !self.inner.finished.get() => record,
            _ => {
                debug!(target: "transition", "late extension settlement observed after the transition ended");
                return;
            }
        };

        match settled {
            Settled::Rejected(rejection) => {
                if record.borrow().phase() == Phase::Dispatching {
                    debug!(target: "transition", error = %rejection, "extension rejected during dispatch");
                    self.inner.deferred.borrow_mut().get_or_insert(rejection);
                    return;
                }
                warn!(
                    target: "transition",
                    navigation = %record.borrow().navigation(),
                    error = %rejection,
                    "extension promise rejected; abandoning outstanding extensions"
                );
                self.finish(TrackerVerdict::Rejected(rejection));
            }
            Settled::Fulfilled(_) | Settled::Canceled => {
                let drained = {
                    let mut record = record.borrow_mut();
                    record.extensions_mut().settle_one();
                    record.extensions().is_drained()
                };
                if drained {
                    self.schedule_closure_check();
                }
            }
        }
    }

    /// Settled-with-nothing-pending is only final once the turn that emptied
    /// the set has run to completion without a new registration.
    fn schedule_closure_check(&self) {
        if self.inner.check_scheduled.replace(true) {
            return;
        }
        let tracker = self.clone();
        self.inner.queue.on_idle(move || {
            tracker.inner.check_scheduled.set(false);
            tracker.closure_check();
        });
    }

    fn closure_check(&self) {
        if self.inner.finished.get() {
            return;
        }
        let Some(record) = self.inner.record.upgrade() else {
            return;
        };
        let drained = {
            let record = record.borrow();
            record.phase() == Phase::Open && record.extensions().is_drained()
        };
        if drained {
            self.finish(TrackerVerdict::Drained);
        }
    }

    fn finish(&self, verdict: TrackerVerdict) {
        if self.inner.finished.replace(true) {
            return;
        }
        (self.inner.sink)(verdict);
    }
}
