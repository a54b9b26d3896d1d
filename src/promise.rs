//! Cooperative job queue and settle-once promises.
//!
//! Everything a browsing context does during a transition runs on one
//! [`JobQueue`]. Promise reactions are queued as microtasks and run when the
//! owner of the queue performs a checkpoint, mirroring how the page's script
//! engine drains its own job queue after every task.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::{Rc, Weak};

use thiserror::Error;
use tracing::warn;

const MAX_JOBS_PER_CHECKPOINT: usize = 10_000;

type Job = Box<dyn FnOnce()>;

/// Work queued somewhere other than the [`JobQueue`] itself, e.g. a script
/// engine's pending promise jobs. Sources are polled during every checkpoint
/// so their work counts towards the same scheduling turn.
pub trait JobSource {
    /// Run whatever is pending. Returns `true` if any work ran.
    fn run_pending(&self) -> bool;
}

#[derive(Default)]
struct QueueState {
    microtasks: VecDeque<Job>,
    idle: Vec<Job>,
    sources: Vec<Weak<dyn JobSource>>,
    running: bool,
}

#[derive(Clone, Default)]
pub struct JobQueue {
    state: Rc<RefCell<QueueState>>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue<F>(&self, job: F)
    where
        F: FnOnce() + 'static,
    {
        self.state.borrow_mut().microtasks.push_back(Box::new(job));
    }

    /// Run `job` once the current turn has fully drained: no microtasks left
    /// and no source reporting work.
    pub fn on_idle<F>(&self, job: F)
    where
        F: FnOnce() + 'static,
    {
        self.state.borrow_mut().idle.push(Box::new(job));
    }

    pub fn add_source(&self, source: &Rc<dyn JobSource>) {
        self.state.borrow_mut().sources.push(Rc::downgrade(source));
    }

    /// Run a task and perform a checkpoint afterwards.
    pub fn run_task<R>(&self, task: impl FnOnce() -> R) -> R {
        let result = task();
        self.checkpoint();
        result
    }

    /// Drain microtasks and job sources until both are quiet, then run idle
    /// observers, repeating until nothing new was queued. Returns the number of
    /// jobs that ran. A nested call from inside a job is a no-op.
    pub fn checkpoint(&self) -> usize {
        {
            let mut state = self.state.borrow_mut();
            if state.running {
                return 0;
            }
            state.running = true;
        }

        let mut ran = 0usize;
        'turn: loop {
            loop {
                let job = self.state.borrow_mut().microtasks.pop_front();
                let Some(job) = job else {
                    break;
                };
                job();
                ran += 1;
                if ran >= MAX_JOBS_PER_CHECKPOINT {
                    warn!(
                        target: "transition",
                        "Stopped processing jobs after {} iterations (possible infinite loop)",
                        MAX_JOBS_PER_CHECKPOINT
                    );
                    break 'turn;
                }
            }

            if self.poll_sources() {
                continue;
            }

            let idle = std::mem::take(&mut self.state.borrow_mut().idle);
            if idle.is_empty() {
                break;
            }
            for job in idle {
                job();
                ran += 1;
            }
        }

        self.state.borrow_mut().running = false;
        ran
    }

    fn poll_sources(&self) -> bool {
        let sources = {
            let mut state = self.state.borrow_mut();
            state.sources.retain(|source| source.strong_count() > 0);
            state.sources.clone()
        };

        let mut ran = false;
        for source in sources {
            if let Some(source) = source.upgrade() {
                ran |= source.run_pending();
            }
        }
        ran
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct Rejection {
    message: String,
}

impl Rejection {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PromiseState<T> {
    Pending,
    Fulfilled(T),
    Rejected(Rejection),
    /// Terminal dead end. Not an error, and never observed by fulfilment or
    /// rejection handlers.
    Canceled,
}

impl<T: Clone> PromiseState<T> {
    fn settled(&self) -> Option<Settled<T>> {
        match self {
            PromiseState::Pending => None,
            PromiseState::Fulfilled(value) => Some(Settled::Fulfilled(value.clone())),
            PromiseState::Rejected(rejection) => Some(Settled::Rejected(rejection.clone())),
            PromiseState::Canceled => Some(Settled::Canceled),
        }
    }
}

impl<T> PromiseState<T> {
    pub fn label(&self) -> &'static str {
        match self {
            PromiseState::Pending => "pending",
            PromiseState::Fulfilled(_) => "fulfilled",
            PromiseState::Rejected(_) => "rejected",
            PromiseState::Canceled => "canceled",
        }
    }
}

/// The outcome a reaction observes.
#[derive(Debug, Clone, PartialEq)]
pub enum Settled<T> {
    Fulfilled(T),
    Rejected(Rejection),
    Canceled,
}

type Reaction<T> = Box<dyn FnOnce(Settled<T>)>;

struct Core<T> {
    state: PromiseState<T>,
    reactions: Vec<Reaction<T>>,
}

pub struct Promise<T> {
    core: Rc<RefCell<Core<T>>>,
    queue: JobQueue,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
            queue: self.queue.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.core.borrow().state.label())
            .finish()
    }
}

impl<T: Clone + 'static> Promise<T> {
    pub fn pending(queue: &JobQueue) -> (Self, Resolver<T>) {
        let core = Rc::new(RefCell::new(Core {
            state: PromiseState::Pending,
            reactions: Vec::new(),
        }));
        let promise = Self {
            core: Rc::clone(&core),
            queue: queue.clone(),
        };
        let resolver = Resolver {
            core,
            queue: queue.clone(),
        };
        (promise, resolver)
    }

    pub fn fulfilled(queue: &JobQueue, value: T) -> Self {
        let (promise, resolver) = Self::pending(queue);
        resolver.resolve(value);
        promise
    }

    pub fn rejected(queue: &JobQueue, rejection: Rejection) -> Self {
        let (promise, resolver) = Self::pending(queue);
        resolver.reject(rejection);
        promise
    }

    pub fn state(&self) -> PromiseState<T> {
        self.core.borrow().state.clone()
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self.core.borrow().state, PromiseState::Pending)
    }

    /// Observe settlement. The reaction always runs as a microtask, in
    /// registration order, even when the promise is already settled.
    pub fn react<F>(&self, reaction: F)
    where
        F: FnOnce(Settled<T>) + 'static,
    {
        let settled = {
            let mut core = self.core.borrow_mut();
            match core.state.settled() {
                Some(settled) => settled,
                None => {
                    core.reactions.push(Box::new(reaction));
                    return;
                }
            }
        };
        self.queue.enqueue(move || reaction(settled));
    }

    /// Chain a fulfilment handler. Rejection and cancellation pass through to
    /// the derived promise untouched.
    pub fn then<U, F>(&self, on_fulfilled: F) -> Promise<U>
    where
        U: Clone + 'static,
        F: FnOnce(T) -> U + 'static,
    {
        let (derived, resolver) = Promise::pending(&self.queue);
        self.react(move |settled| match settled {
            Settled::Fulfilled(value) => {
                resolver.resolve(on_fulfilled(value));
            }
            Settled::Rejected(rejection) => {
                resolver.reject(rejection);
            }
            Settled::Canceled => {
                resolver.cancel();
            }
        });
        derived
    }

    /// Recover from a rejection. Cancellation is not recoverable.
    pub fn catch<F>(&self, on_rejected: F) -> Promise<T>
    where
        F: FnOnce(Rejection) -> T + 'static,
    {
        let (derived, resolver) = Promise::pending(&self.queue);
        self.react(move |settled| match settled {
            Settled::Fulfilled(value) => {
                resolver.resolve(value);
            }
            Settled::Rejected(rejection) => {
                resolver.resolve(on_rejected(rejection));
            }
            Settled::Canceled => {
                resolver.cancel();
            }
        });
        derived
    }
}

/// Settles the paired [`Promise`] exactly once. Every call after the first
/// returns `false` and changes nothing.
pub struct Resolver<T> {
    core: Rc<RefCell<Core<T>>>,
    queue: JobQueue,
}

impl<T> Clone for Resolver<T> {
    fn clone(&self) -> Self {
        Self {
            core: Rc::clone(&self.core),
            queue: self.queue.clone(),
        }
    }
}

impl<T: Clone + 'static> Resolver<T> {
    pub fn resolve(&self, value: T) -> bool {
        self.settle(PromiseState::Fulfilled(value))
    }

    pub fn reject(&self, rejection: Rejection) -> bool {
        self.settle(PromiseState::Rejected(rejection))
    }

    pub fn cancel(&self) -> bool {
        self.settle(PromiseState::Canceled)
    }

    pub fn is_settled(&self) -> bool {
        !matches!(self.core.borrow().state, PromiseState::Pending)
    }

    fn settle(&self, next: PromiseState<T>) -> bool {
        let Some(settled) = next.settled() else {
            return false;
        };

        let reactions = {
            let mut core = self.core.borrow_mut();
            if !matches!(core.state, PromiseState::Pending) {
                return false;
            }
            core.state = next;
            std::mem::take(&mut core.reactions)
        };

        for reaction in reactions {
            let settled = settled.clone();
            self.queue.enqueue(move || reaction(settled));
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn recorder() -> (Rc<RefCell<Vec<String>>>, impl Fn(&str) + Clone) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&log);
        (log, move |entry: &str| sink.borrow_mut().push(entry.to_string()))
    }

    #[test]
    fn reactions_run_as_microtasks_in_order() {
        let queue = JobQueue::new();
        let (promise, resolver) = Promise::<u32>::pending(&queue);
        let (log, push) = recorder();

        let first = push.clone();
        promise.react(move |_| first("first"));
        let second = push.clone();
        promise.react(move |_| second("second"));

        assert!(resolver.resolve(7));
        assert!(log.borrow().is_empty(), "reactions must not run synchronously");

        queue.checkpoint();
        assert_eq!(*log.borrow(), vec!["first", "second"]);
    }

    #[test]
    fn settles_only_once() {
        let queue = JobQueue::new();
        let (promise, resolver) = Promise::<u32>::pending(&queue);

        assert!(resolver.resolve(1));
        assert!(!resolver.resolve(2));
        assert!(!resolver.reject(Rejection::new("late")));
        assert!(!resolver.cancel());
        assert_eq!(promise.state(), PromiseState::Fulfilled(1));
    }

    #[test]
    fn then_maps_and_propagates_cancellation() {
        let queue = JobQueue::new();
        let (promise, resolver) = Promise::<u32>::pending(&queue);
        let doubled = promise.then(|value| value * 2);
        let (canceled_source, canceled_resolver) = Promise::<u32>::pending(&queue);
        let dead_end = canceled_source.then(|value| value + 1).catch(|_| 0);

        resolver.resolve(21);
        canceled_resolver.cancel();
        queue.checkpoint();

        assert_eq!(doubled.state(), PromiseState::Fulfilled(42));
        assert_eq!(dead_end.state(), PromiseState::Canceled);
    }

    #[test]
    fn catch_recovers_rejection() {
        let queue = JobQueue::new();
        let promise = Promise::<String>::rejected(&queue, Rejection::new("boom"));
        let recovered = promise.catch(|rejection| format!("recovered: {rejection}"));
        queue.checkpoint();
        assert_eq!(
            recovered.state(),
            PromiseState::Fulfilled("recovered: boom".to_string())
        );
    }

    #[test]
    fn idle_observers_run_after_microtasks_drain() {
        let queue = JobQueue::new();
        let (log, push) = recorder();

        let idle_push = push.clone();
        queue.on_idle(move || idle_push("idle"));
        let inner_queue = queue.clone();
        let micro_push = push.clone();
        queue.enqueue(move || {
            micro_push("micro");
            let nested = micro_push.clone();
            inner_queue.enqueue(move || nested("nested"));
        });

        queue.checkpoint();
        assert_eq!(*log.borrow(), vec!["micro", "nested", "idle"]);
    }

    struct CountingSource {
        remaining: Cell<u32>,
    }

    impl JobSource for CountingSource {
        fn run_pending(&self) -> bool {
            let remaining = self.remaining.get();
            if remaining == 0 {
                return false;
            }
            self.remaining.set(remaining - 1);
            true
        }
    }

    #[test]
    fn sources_are_drained_before_idle_observers() {
        let queue = JobQueue::new();
        let concrete = Rc::new(CountingSource {
            remaining: Cell::new(3),
        });
        let source: Rc<dyn JobSource> = concrete.clone();
        queue.add_source(&source);

        let observed = Rc::new(Cell::new(u32::MAX));
        let seen = Rc::clone(&observed);
        let counter = Rc::clone(&concrete);
        queue.on_idle(move || seen.set(counter.remaining.get()));

        queue.checkpoint();
        assert_eq!(observed.get(), 0);
    }

    #[test]
    fn nested_checkpoint_is_a_no_op() {
        let queue = JobQueue::new();
        let inner = queue.clone();
        let nested_ran = Rc::new(Cell::new(usize::MAX));
        let slot = Rc::clone(&nested_ran);
        queue.enqueue(move || slot.set(inner.checkpoint()));

        assert_eq!(queue.checkpoint(), 1);
        assert_eq!(nested_ran.get(), 0);
    }
}
