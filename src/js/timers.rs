use std::cell::{Cell, RefCell};
use std::collections::HashMap;

use tokio::sync::oneshot;
use tokio::time::{sleep, Duration};

/// `setTimeout` bookkeeping for one script engine.
///
/// Each timer is a local task racing its delay against cancellation, so the
/// registry must be used from inside a `tokio::task::LocalSet`. Firing is a
/// task of its own: the callback runs outside any job checkpoint.
#[derive(Default)]
pub(crate) struct TimerRegistry {
    next_id: Cell<u32>,
    timers: RefCell<HashMap<u32, oneshot::Sender<()>>>,
}

impl TimerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_timeout<F>(&self, delay: Duration, on_fire: F) -> u32
    where
        F: FnOnce(u32) + 'static,
    {
        let timer_id = self.next_id.get().wrapping_add(1).max(1);
        self.next_id.set(timer_id);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();

        tokio::task::spawn_local(async move {
            tokio::select! {
                _ = sleep(delay) => on_fire(timer_id),
                _ = cancel_rx => {
                    // cleared or registry dropped
                }
            }
        });

        self.timers.borrow_mut().insert(timer_id, cancel_tx);
        timer_id
    }

    pub fn clear_timer(&self, timer_id: u32) {
        if let Some(cancel_tx) = self.timers.borrow_mut().remove(&timer_id) {
            let _ = cancel_tx.send(());
        }
    }

    /// Claim a fired timer. `false` if it was cleared in the meantime.
    pub fn complete(&self, timer_id: u32) -> bool {
        self.timers.borrow_mut().remove(&timer_id).is_some()
    }

    pub fn pending(&self) -> usize {
        self.timers.borrow().len()
    }

    pub fn clear_all(&self) {
        let mut timers = self.timers.borrow_mut();
        for (_, cancel_tx) in timers.drain() {
            let _ = cancel_tx.send(());
        }
    }
}

impl Drop for TimerRegistry {
    fn drop(&mut self) {
        self.clear_all();
    }
}

pub(crate) const TIMER_BOOTSTRAP: &str = r#"
(() => {
    const global = globalThis;
    const callbacks = new Map();
    const frontier = global.frontier || (global.frontier = {});

    global.setTimeout = function setTimeout(callback, delay, ...args) {
        if (typeof callback !== 'function') {
            return 0;
        }
        const id = global.__frontier_timer_schedule(Math.max(0, Number(delay) || 0));
        callbacks.set(id, () => callback.apply(global, args));
        return id;
    };

    global.clearTimeout = function clearTimeout(id) {
        if (callbacks.delete(id)) {
            global.__frontier_timer_clear(id);
        }
    };

    frontier.__fireTimer = (id) => {
        const callback = callbacks.get(id);
        if (!callback) {
            return;
        }
        callbacks.delete(id);
        try {
            callback();
        } catch (err) {
            console.error('timer callback threw: ' + (err && err.message !== undefined ? err.message : err));
        }
    };
})();
"#;
