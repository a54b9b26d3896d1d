use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::record::{Phase, TransitionRecord};
use crate::compositor::DocumentId;
use crate::origin::OriginClass;
use crate::promise::{JobQueue, Promise, Rejection, Resolver};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NavigationError {
    #[error("network error: {0}")]
    Network(String),
    #[error("navigation blocked: {0}")]
    Blocked(String),
    #[error("load aborted with HTTP status {0}")]
    HttpStatus(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    #[error("superseded by a newer navigation")]
    Superseded,
    #[error("response handed to a different disposition")]
    Download,
    #[error("navigation aborted")]
    Aborted,
}

/// A usable handle on the new window. Only ever handed out for navigations
/// that stayed same-origin through every hop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowHandle {
    pub url: Url,
    pub document: DocumentId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NewWindow {
    Window(WindowHandle),
    /// Cross-origin involvement somewhere in the redirect chain.
    Absent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowProxyState {
    Pending,
    ResolvedSameOrigin,
    ResolvedUndefined,
    Rejected,
    Canceled,
}

/// Script-facing view of the eventual new window.
#[derive(Clone)]
pub struct WindowProxyHandle {
    promise: Promise<NewWindow>,
    state: Rc<Cell<WindowProxyState>>,
    record: Rc<RefCell<Weak<RefCell<TransitionRecord>>>>,
}

impl WindowProxyHandle {
    pub fn promise(&self) -> Promise<NewWindow> {
        self.promise.clone()
    }

    pub fn state(&self) -> WindowProxyState {
        self.state.get()
    }

    /// Phase of the transition this handle belongs to, if it still exists.
    pub fn transition_phase(&self) -> Option<Phase> {
        self.record
            .borrow()
            .upgrade()
            .map(|record| record.borrow().phase())
    }

    pub(crate) fn bind(&self, record: Weak<RefCell<TransitionRecord>>) {
        *self.record.borrow_mut() = record;
    }
}

/// Produces the `newWindow` promise and settles it exactly once from
/// navigation-pipeline signals.
pub struct WindowProxyResolver {
    handle: WindowProxyHandle,
    resolver: Resolver<NewWindow>,
    cross_origin: bool,
}

impl WindowProxyResolver {
    pub fn new(queue: &JobQueue) -> Self {
        let (promise, resolver) = Promise::pending(queue);
        Self {
            handle: WindowProxyHandle {
                promise,
                state: Rc::new(Cell::new(WindowProxyState::Pending)),
                record: Rc::new(RefCell::new(Weak::new())),
            },
            resolver,
            cross_origin: false,
        }
    }

    pub fn handle(&self) -> &WindowProxyHandle {
        &self.handle
    }

    /// Feed an Origin Guard verdict. The first cross-origin signal resolves
    /// the handle to [`NewWindow::Absent`] on the spot.
    pub fn observe_origin(&mut self, class: OriginClass) -> bool {
        if class == OriginClass::SameOrigin {
            return false;
        }
        self.cross_origin = true;
        self.settle(
            WindowProxyState::ResolvedUndefined,
            |resolver| resolver.resolve(NewWindow::Absent),
        )
    }

    pub fn navigation_completed(&mut self, document: DocumentId, url: Url) -> bool {
        if self.cross_origin {
            return self.settle(
                WindowProxyState::ResolvedUndefined,
                |resolver| resolver.resolve(NewWindow::Absent),
            );
        }
        if self.handle.transition_phase() == Some(Phase::Canceled) {
            return self.navigation_canceled(CancelReason::Aborted);
        }
        self.settle(WindowProxyState::ResolvedSameOrigin, |resolver| {
            resolver.resolve(NewWindow::Window(WindowHandle { url, document }))
        })
    }

    pub fn navigation_failed(&mut self, error: &NavigationError) -> bool {
        let rejection = Rejection::new(error.to_string());
        self.settle(WindowProxyState::Rejected, |resolver| {
            resolver.reject(rejection)
        })
    }

    pub fn navigation_canceled(&mut self, reason: CancelReason) -> bool {
        debug!(target: "transition", %reason, "canceling new window handle");
        self.settle(WindowProxyState::Canceled, |resolver| resolver.cancel())
    }

    fn settle(
        &mut self,
        state: WindowProxyState,
        apply: impl FnOnce(&Resolver<NewWindow>) -> bool,
    ) -> bool {
        if !apply(&self.resolver) {
            return false;
        }
        debug!(target: "transition", ?state, "new window handle settled");
        self.handle.state.set(state);
        true
    }
}
