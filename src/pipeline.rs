//! Drives one navigation of a top-level browsing context through the
//! transition hook.
//!
//! Fetch keeps running while the controller waits on author extensions. Only
//! the switch to the incoming document is gated on settlement.

use std::cell::RefCell;
use std::rc::Rc;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use tracing::{debug, info};
use url::Url;

use crate::compositor::{DocumentCompositor, DocumentId, Frame};
use crate::config::TransitionConfig;
use crate::origin::OriginClass;
use crate::promise::JobQueue;
use crate::transition::{
    CancelReason, DispatchError, NavigationError, NavigationId, NavigationReason,
    NavigationRequest, Phase, Resumption, TransitionController, WindowProxyState,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingDocument {
    pub id: DocumentId,
    pub url: Url,
}

/// What the fetch side reports while a navigation is in flight.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadEvent {
    Redirect(Url),
    Response(IncomingDocument),
    Failed(NavigationError),
    Canceled(CancelReason),
}

#[derive(Debug, Clone, Serialize)]
pub struct NavigationSummary {
    pub navigation: NavigationId,
    pub reason: NavigationReason,
    pub outcome: Phase,
    pub window: WindowProxyState,
    /// `None` when no transition record was created.
    pub origin: Option<OriginClass>,
    /// As exposed to script at the end of the attempt.
    pub target_url: String,
    pub resumed_after_ms: u128,
    pub timed_out: bool,
    pub switched: bool,
    pub active_document: DocumentId,
}

pub struct BrowsingContext {
    queue: JobQueue,
    controller: TransitionController,
    compositor: Rc<RefCell<DocumentCompositor>>,
    current_url: Url,
    current_document: DocumentId,
    next_navigation: u64,
}

impl BrowsingContext {
    pub fn new(config: &TransitionConfig, document: IncomingDocument) -> Self {
        let queue = JobQueue::new();
        let compositor = DocumentCompositor::shared(config.viewport, document.id);
        let controller = TransitionController::new(config, queue.clone(), Rc::clone(&compositor));
        Self {
            queue,
            controller,
            compositor,
            current_url: document.url,
            current_document: document.id,
            next_navigation: 0,
        }
    }

    pub fn queue(&self) -> &JobQueue {
        &self.queue
    }

    pub fn controller(&self) -> &TransitionController {
        &self.controller
    }

    pub fn compositor(&self) -> Rc<RefCell<DocumentCompositor>> {
        Rc::clone(&self.compositor)
    }

    pub fn current_url(&self) -> &Url {
        &self.current_url
    }

    pub fn current_document(&self) -> DocumentId {
        self.current_document
    }

    /// Composite a frame, as a rendering opportunity would.
    pub fn paint(&self) -> Frame {
        self.compositor.borrow_mut().paint()
    }

    /// Navigate to `url`, consuming load events from `loads` until the
    /// attempt is over. A closed channel before the load finished counts as
    /// an abort.
    pub async fn navigate(
        &mut self,
        url: Url,
        reason: NavigationReason,
        mut loads: UnboundedReceiver<LoadEvent>,
    ) -> Result<NavigationSummary, DispatchError> {
        let started = Instant::now();
        self.next_navigation += 1;
        let navigation = NavigationId(self.next_navigation);

        info!(target: "pipeline", %navigation, %url, %reason, "starting navigation");
        let hook = self.controller.begin(
            &self.current_url,
            NavigationRequest::new(navigation, url, reason),
        )?;
        debug!(target: "pipeline", %navigation, ?hook, "unload deferred until settlement");
        let window = self.controller.window();
        self.paint();

        let mut resumption: Option<Resumption> = None;
        let mut incoming: Option<IncomingDocument> = None;
        let mut load_finished = false;

        while resumption.is_none() || !load_finished {
            tokio::select! {
                biased;
                event = loads.recv(), if !load_finished => {
                    load_finished = match event {
                        Some(event) => self.apply(event, &mut incoming),
                        None => {
                            debug!(target: "pipeline", %navigation, "load channel closed early");
                            self.controller.cancel(CancelReason::Aborted);
                            true
                        }
                    };
                    self.paint();
                }
                resumed = self.controller.await_settlement(), if resumption.is_none() => {
                    resumption = Some(resumed.unwrap_or(Resumption {
                        phase: self.controller.phase(),
                        at: Instant::now(),
                        timed_out: false,
                    }));
                }
            }
        }

        let resumed_at = resumption.map(|resumed| resumed.at).unwrap_or_else(Instant::now);
        let timed_out = resumption.is_some_and(|resumed| resumed.timed_out);
        let phase = self.controller.phase();
        let target_url = self.controller.target_url().unwrap_or_default();
        let origin = self.controller.origin_class();

        let switched = match incoming {
            Some(document) if phase != Phase::Canceled => {
                self.compositor.borrow_mut().present(document.id);
                self.current_url = document.url;
                self.current_document = document.id;
                true
            }
            _ => false,
        };
        let outcome = self.controller.finish().unwrap_or(phase);
        self.paint();

        let summary = NavigationSummary {
            navigation,
            reason,
            outcome,
            window: window
                .map(|window| window.state())
                .unwrap_or(WindowProxyState::Pending),
            origin,
            target_url,
            resumed_after_ms: (resumed_at - started).as_millis(),
            timed_out,
            switched,
            active_document: self.current_document,
        };
        info!(
            target: "pipeline",
            %navigation,
            outcome = ?summary.outcome,
            switched,
            resumed_after_ms = summary.resumed_after_ms,
            "navigation finished"
        );
        Ok(summary)
    }

    /// Returns whether the load is over.
    fn apply(&self, event: LoadEvent, incoming: &mut Option<IncomingDocument>) -> bool {
        match event {
            LoadEvent::Redirect(hop) => {
                debug!(target: "pipeline", %hop, "redirect");
                self.controller.redirected(&hop);
                false
            }
            LoadEvent::Response(document) => {
                debug!(target: "pipeline", document = %document.id, url = %document.url, "response ready");
                self.controller.response_ready(document.id, &document.url);
                *incoming = Some(document);
                true
            }
            LoadEvent::Failed(error) => {
                debug!(target: "pipeline", %error, "load failed");
                self.controller.navigation_failed(&error);
                true
            }
            LoadEvent::Canceled(reason) => {
                self.controller.cancel(reason);
                true
            }
        }
    }
}
