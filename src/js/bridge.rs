//! Exposes the navigation transition event to page script.
//!
//! Script sees a `navigationtransition` event with `reason`, `url`,
//! `newWindow` and `transitionUntil(promise)`. Script promises passed to
//! `transitionUntil` are mirrored by crate promises keyed by a small integer
//! id, and the crate-side `newWindow` outcome is replayed into the script
//! promise from [`JobSource::run_pending`], so both job queues take part in the
//! same drain-to-fixpoint turn.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::rc::{Rc, Weak};

use anyhow::Result;
use rquickjs::{Function, Object};
use tokio::time::Duration;
use tracing::{debug, error};

use super::runtime::QuickJsEngine;
use super::timers::{TimerRegistry, TIMER_BOOTSTRAP};
use crate::compositor::{RevealHold, Slot};
use crate::promise::{JobQueue, JobSource, Promise, Rejection, Resolver, Settled};
use crate::transition::{NewWindow, Registration, TransitionEvent, TransitionListener};

/// What `newWindow` settled to, waiting to be replayed into script.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WindowUpdate {
    Window(String),
    Absent,
    Rejected(String),
}

impl WindowUpdate {
    /// Canceled handles have no script-visible outcome.
    fn from_settled(settled: Settled<NewWindow>) -> Option<Self> {
        match settled {
            Settled::Fulfilled(NewWindow::Window(handle)) => {
                Some(WindowUpdate::Window(handle.url.to_string()))
            }
            Settled::Fulfilled(NewWindow::Absent) => Some(WindowUpdate::Absent),
            Settled::Rejected(rejection) => {
                Some(WindowUpdate::Rejected(rejection.message().to_string()))
            }
            Settled::Canceled => None,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            WindowUpdate::Window(_) => "window",
            WindowUpdate::Absent => "absent",
            WindowUpdate::Rejected(_) => "rejected",
        }
    }

    fn detail(&self) -> Option<String> {
        match self {
            WindowUpdate::Window(url) => Some(url.clone()),
            WindowUpdate::Absent => None,
            WindowUpdate::Rejected(message) => Some(message.clone()),
        }
    }
}

struct ActiveEvent {
    generation: u32,
    event: TransitionEvent,
    extensions: HashMap<i32, Resolver<()>>,
    reveal: Option<RevealHold>,
}

struct ScriptShared {
    engine: QuickJsEngine,
    queue: JobQueue,
    timers: TimerRegistry,
    generation: Cell<u32>,
    active: RefCell<Option<ActiveEvent>>,
    outbox: RefCell<VecDeque<WindowUpdate>>,
}

impl ScriptShared {
    /// Runs `f` against the event script knows as `generation`. Events kept
    /// around from an earlier dispatch get `None`.
    fn with_event<R>(&self, generation: u32, f: impl FnOnce(&mut ActiveEvent) -> R) -> Option<R> {
        let mut active = self.active.borrow_mut();
        match active.as_mut() {
            Some(active) if active.generation == generation => Some(f(active)),
            _ => {
                debug!(target: "quickjs", generation, "call on a stale navigationtransition event");
                None
            }
        }
    }

    fn extend(&self, generation: u32, id: i32) -> bool {
        let queue = &self.queue;
        self.with_event(generation, |active| {
            let (promise, resolver) = Promise::<()>::pending(queue);
            match active.event.register(&promise) {
                Registration::Accepted => {
                    active.extensions.insert(id, resolver);
                    true
                }
                Registration::Ignored => false,
            }
        })
        .unwrap_or(false)
    }

    fn settle(&self, id: i32, fulfilled: bool, reason: Option<String>) {
        let resolver = self
            .active
            .borrow_mut()
            .as_mut()
            .and_then(|active| active.extensions.remove(&id));
        let Some(resolver) = resolver else {
            debug!(target: "quickjs", id, "settlement for unknown extension");
            return;
        };
        if fulfilled {
            resolver.resolve(());
        } else {
            resolver.reject(Rejection::new(
                reason.unwrap_or_else(|| "transition extension rejected".to_string()),
            ));
        }
    }

    fn release_reveal(&self, generation: u32) {
        if let Some(Some(hold)) = self.with_event(generation, |active| active.reveal.take()) {
            hold.release();
        }
    }

    fn target_url(&self, generation: u32) -> Option<String> {
        self.with_event(generation, |active| active.event.url())
    }

    fn insert_placeholder(&self, generation: u32, content: String) {
        self.with_event(generation, |active| active.event.insert_placeholder(content));
    }

    fn set_z_index(&self, generation: u32, root: &str, z_index: i32) -> bool {
        let Some(slot) = Slot::from_name(root) else {
            return false;
        };
        self.with_event(generation, |active| active.event.set_z_index(slot, z_index));
        true
    }

    fn set_offset(&self, generation: u32, root: &str, dx: f64, dy: f64) -> bool {
        let Some(slot) = Slot::from_name(root) else {
            return false;
        };
        self.with_event(generation, |active| {
            active.event.set_offset(slot, dx as f32, dy as f32)
        });
        true
    }

    /// Runs as its own task: the callback, then a checkpoint.
    fn fire_timer(&self, timer_id: u32) {
        if !self.timers.complete(timer_id) {
            return;
        }
        debug!(target: "quickjs", timer_id, pending = self.timers.pending(), "timer fired");
        let fired = self.engine.with_context(|ctx| {
            let frontier: Object = ctx.globals().get("frontier")?;
            let fire: Function = frontier.get("__fireTimer")?;
            fire.call::<_, ()>((timer_id,))
        });
        if let Err(err) = fired {
            error!(target: "quickjs", timer_id, "failed to run timer callback: {err}");
        }
        self.queue.checkpoint();
    }

    fn deliver(&self, update: &WindowUpdate) -> Result<()> {
        self.engine.with_context(|ctx| {
            let frontier: Object = ctx.globals().get("frontier")?;
            let settle: Function = frontier.get("__settleWindow")?;
            settle.call::<_, ()>((update.kind(), update.detail()))
        })
    }
}

impl JobSource for ScriptShared {
    fn run_pending(&self) -> bool {
        let updates: Vec<WindowUpdate> = self.outbox.borrow_mut().drain(..).collect();
        let mut ran = !updates.is_empty();
        for update in &updates {
            if let Err(err) = self.deliver(update) {
                error!(target: "quickjs", "failed to settle newWindow in script: {err}");
            }
        }

        match self.engine.drain_jobs() {
            Ok(jobs) => ran |= jobs,
            Err(err) => error!(target: "quickjs", "failed to drain script jobs: {err}"),
        }
        ran
    }
}

/// Delivers transition events to script listeners running in a QuickJS
/// engine.
#[derive(Clone)]
pub struct ScriptTransitionListener {
    shared: Rc<ScriptShared>,
}

impl ScriptTransitionListener {
    pub fn new(queue: &JobQueue) -> Result<Self> {
        let engine = QuickJsEngine::new()?;
        let shared = Rc::new(ScriptShared {
            engine,
            queue: queue.clone(),
            timers: TimerRegistry::new(),
            generation: Cell::new(0),
            active: RefCell::new(None),
            outbox: RefCell::new(VecDeque::new()),
        });
        install_natives(&shared)?;
        shared.engine.eval(TIMER_BOOTSTRAP, "frontier-timers.js")?;
        shared.engine.eval(TRANSITION_BOOTSTRAP, "frontier-transition.js")?;

        let source: Rc<dyn JobSource> = shared.clone();
        queue.add_source(&source);
        Ok(Self { shared })
    }

    /// Run page script, then drain the turn it started.
    pub fn eval(&self, source: &str, filename: &str) -> Result<()> {
        self.shared.engine.eval(source, filename)?;
        self.shared.queue.checkpoint();
        Ok(())
    }

    pub fn eval_with<V>(&self, source: &str, filename: &str) -> Result<V>
    where
        V: for<'js> rquickjs::FromJs<'js>,
    {
        let value = self.shared.engine.eval_with(source, filename)?;
        self.shared.queue.checkpoint();
        Ok(value)
    }

}

impl TransitionListener for ScriptTransitionListener {
    fn handle_transition(&mut self, event: &TransitionEvent) {
        let weak = Rc::downgrade(&self.shared);
        event.new_window().react(move |settled| {
            let Some(shared) = weak.upgrade() else {
                return;
            };
            match WindowUpdate::from_settled(settled) {
                Some(update) => shared.outbox.borrow_mut().push_back(update),
                None => debug!(target: "quickjs", "newWindow canceled; script promise stays pending"),
            }
        });

        let generation = self.shared.generation.get().wrapping_add(1);
        self.shared.generation.set(generation);
        *self.shared.active.borrow_mut() = Some(ActiveEvent {
            generation,
            event: event.clone(),
            extensions: HashMap::new(),
            reveal: Some(event.hold_reveal()),
        });

        let reason = event.reason().as_str();
        let url = event.url();
        let dispatched = self.shared.engine.with_context(|ctx| {
            let frontier: Object = ctx.globals().get("frontier")?;
            let dispatch: Function = frontier.get("__dispatchTransition")?;
            dispatch.call::<_, ()>((generation, reason, url))
        });

        if let Err(err) = dispatched {
            error!(target: "quickjs", "failed to dispatch navigationtransition: {err}");
            self.shared.release_reveal(generation);
        }
    }
}

fn install_natives(shared: &Rc<ScriptShared>) -> Result<()> {
    let weak = Rc::downgrade(shared);
    shared.engine.with_context(|ctx| {
        let global = ctx.globals();

        {
            let state = Weak::clone(&weak);
            let func = Function::new(
                ctx.clone(),
                move |generation: u32, id: i32| -> rquickjs::Result<bool> {
                    Ok(state
                        .upgrade()
                        .is_some_and(|shared| shared.extend(generation, id)))
                },
            )?
            .with_name("__frontier_transition_extend")?;
            global.set("__frontier_transition_extend", func)?;
        }

        {
            let state = Weak::clone(&weak);
            let func = Function::new(
                ctx.clone(),
                move |id: i32, fulfilled: bool, reason: Option<String>| -> rquickjs::Result<()> {
                    if let Some(shared) = state.upgrade() {
                        shared.settle(id, fulfilled, reason);
                    }
                    Ok(())
                },
            )?
            .with_name("__frontier_transition_settle")?;
            global.set("__frontier_transition_settle", func)?;
        }

        {
            let state = Weak::clone(&weak);
            let func = Function::new(ctx.clone(), move |generation: u32| -> rquickjs::Result<()> {
                if let Some(shared) = state.upgrade() {
                    shared.release_reveal(generation);
                }
                Ok(())
            })?
            .with_name("__frontier_transition_reveal")?;
            global.set("__frontier_transition_reveal", func)?;
        }

        {
            let state = Weak::clone(&weak);
            let func = Function::new(
                ctx.clone(),
                move |generation: u32, content: String| -> rquickjs::Result<()> {
                    if let Some(shared) = state.upgrade() {
                        shared.insert_placeholder(generation, content);
                    }
                    Ok(())
                },
            )?
            .with_name("__frontier_transition_placeholder")?;
            global.set("__frontier_transition_placeholder", func)?;
        }

        {
            let state = Weak::clone(&weak);
            let func = Function::new(
                ctx.clone(),
                move |generation: u32, root: String, z_index: i32| -> rquickjs::Result<bool> {
                    Ok(state
                        .upgrade()
                        .is_some_and(|shared| shared.set_z_index(generation, &root, z_index)))
                },
            )?
            .with_name("__frontier_transition_z_index")?;
            global.set("__frontier_transition_z_index", func)?;
        }

        {
            let state = Weak::clone(&weak);
            let func = Function::new(
                ctx.clone(),
                move |generation: u32, root: String, dx: f64, dy: f64| -> rquickjs::Result<bool> {
                    Ok(state
                        .upgrade()
                        .is_some_and(|shared| shared.set_offset(generation, &root, dx, dy)))
                },
            )?
            .with_name("__frontier_transition_offset")?;
            global.set("__frontier_transition_offset", func)?;
        }

        {
            let state = Weak::clone(&weak);
            let func = Function::new(
                ctx.clone(),
                move |generation: u32| -> rquickjs::Result<Option<String>> {
                    Ok(state
                        .upgrade()
                        .and_then(|shared| shared.target_url(generation)))
                },
            )?
            .with_name("__frontier_transition_url")?;
            global.set("__frontier_transition_url", func)?;
        }

        {
            let state = Weak::clone(&weak);
            let func = Function::new(ctx.clone(), move |delay_ms: f64| -> rquickjs::Result<u32> {
                let Some(shared) = state.upgrade() else {
                    return Ok(0);
                };
                let timer_state = Weak::clone(&state);
                let delay = Duration::from_millis(delay_ms.max(0.0) as u64);
                Ok(shared.timers.set_timeout(delay, move |timer_id| {
                    if let Some(shared) = timer_state.upgrade() {
                        shared.fire_timer(timer_id);
                    }
                }))
            })?
            .with_name("__frontier_timer_schedule")?;
            global.set("__frontier_timer_schedule", func)?;
        }

        {
            let state = Weak::clone(&weak);
            let func = Function::new(ctx.clone(), move |timer_id: u32| -> rquickjs::Result<()> {
                if let Some(shared) = state.upgrade() {
                    shared.timers.clear_timer(timer_id);
                }
                Ok(())
            })?
            .with_name("__frontier_timer_clear")?;
            global.set("__frontier_timer_clear", func)?;
        }

        Ok(())
    })
}

const TRANSITION_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const EVENT_TYPE = 'navigationtransition';
    const listeners = [];
    let pendingWindow = null;
    let nextExtension = 0;

    const describe = (err) => {
        if (err && typeof err === 'object' && 'message' in err) {
            return String(err.message);
        }
        return String(err);
    };

    global.addEventListener = function addEventListener(type, listener) {
        if (type !== EVENT_TYPE || typeof listener !== 'function') {
            return;
        }
        if (!listeners.includes(listener)) {
            listeners.push(listener);
        }
    };

    global.removeEventListener = function removeEventListener(type, listener) {
        if (type !== EVENT_TYPE) {
            return;
        }
        const index = listeners.indexOf(listener);
        if (index !== -1) {
            listeners.splice(index, 1);
        }
    };

    if (!('onnavigationtransition' in global)) {
        global.onnavigationtransition = null;
    }

    const frontier = global.frontier || (global.frontier = {});

    frontier.__settleWindow = (kind, detail) => {
        const pending = pendingWindow;
        if (!pending) {
            return;
        }
        pendingWindow = null;
        if (kind === 'window') {
            pending.resolve(Object.freeze({ url: detail }));
        } else if (kind === 'absent') {
            pending.resolve(undefined);
        } else {
            pending.reject(new Error(detail));
        }
    };

    const checkRoot = (accepted, root) => {
        if (!accepted) {
            throw new TypeError('unknown render root: ' + root);
        }
    };

    frontier.__dispatchTransition = (generation, reason, url) => {
        let resolveWindow;
        let rejectWindow;
        const newWindow = new Promise((resolve, reject) => {
            resolveWindow = resolve;
            rejectWindow = reject;
        });
        pendingWindow = { resolve: resolveWindow, reject: rejectWindow };

        let lastUrl = url;
        const event = Object.freeze({
            type: EVENT_TYPE,
            reason,
            get url() {
                const current = global.__frontier_transition_url(generation);
                if (current !== undefined) {
                    lastUrl = current;
                }
                return lastUrl;
            },
            newWindow,
            transitionUntil(promise) {
                const id = ++nextExtension;
                if (!global.__frontier_transition_extend(generation, id)) {
                    return;
                }
                Promise.resolve(promise).then(
                    () => global.__frontier_transition_settle(id, true, undefined),
                    (err) => global.__frontier_transition_settle(id, false, describe(err)),
                );
            },
            insertPlaceholder(content) {
                global.__frontier_transition_placeholder(generation, String(content));
            },
            setZIndex(root, zIndex) {
                checkRoot(global.__frontier_transition_z_index(generation, String(root), zIndex | 0), root);
            },
            setOffset(root, x, y) {
                checkRoot(
                    global.__frontier_transition_offset(generation, String(root), Number(x) || 0, Number(y) || 0),
                    root,
                );
            },
        });

        const handlers = listeners.slice();
        if (typeof global.onnavigationtransition === 'function') {
            handlers.push(global.onnavigationtransition);
        }
        for (const handler of handlers) {
            try {
                handler.call(global, event);
            } catch (err) {
                console.error('navigationtransition listener threw: ' + describe(err));
            }
        }

        const reveal = () => global.__frontier_transition_reveal(generation);
        newWindow.then(reveal, reveal);
    };
})();
"#;
