//! Trailing-edge throttle.
//!
//! The first call in a quiet period starts a timer; calls made while it runs
//! only replace the pending argument. When the timer fires the action runs
//! once with the latest argument. There is no leading-edge invocation, and
//! later calls never push the deadline out.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

type Action<A> = Arc<dyn Fn(A) + Send + Sync>;

struct Slot<A> {
    pending: Option<A>,
    timer: Option<JoinHandle<()>>,
    /// Bumped on every arm and cancel; a firing timer from an older epoch is void.
    epoch: u64,
}

/// Throttled invocation of a single action.
pub struct Throttle<A> {
    wait: Duration,
    runtime: Handle,
    action: Action<A>,
    slot: Arc<Mutex<Slot<A>>>,
}

impl<A: Send + 'static> Throttle<A> {
    /// Throttle `action` to at most one run per `wait`.
    pub fn new(wait: Duration, runtime: Handle, action: impl Fn(A) + Send + Sync + 'static) -> Self {
        Self {
            wait,
            runtime,
            action: Arc::new(action),
            slot: Arc::new(Mutex::new(Slot {
                pending: None,
                timer: None,
                epoch: 0,
            })),
        }
    }

    /// The configured window.
    pub fn wait(&self) -> Duration {
        self.wait
    }

    /// Record `arg` and arm the timer if it is not already running.
    pub fn call(&self, arg: A) {
        let mut slot = self.slot.lock();
        slot.pending = Some(arg);
        if slot.timer.is_some() {
            return;
        }
        slot.epoch += 1;
        let epoch = slot.epoch;
        let weak = Arc::downgrade(&self.slot);
        let action = Arc::clone(&self.action);
        let wait = self.wait;
        slot.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(wait).await;
            let Some(slot) = weak.upgrade() else { return };
            let pending = {
                let mut slot = slot.lock();
                if slot.epoch != epoch {
                    return;
                }
                slot.timer = None;
                slot.pending.take()
            };
            if let Some(arg) = pending {
                action(arg);
            }
        }));
    }

    /// Drop the pending argument and disarm the timer.
    pub fn cancel(&self) {
        let mut slot = self.slot.lock();
        slot.pending = None;
        slot.epoch += 1;
        if let Some(timer) = slot.timer.take() {
            timer.abort();
        }
    }

    /// Whether an invocation is scheduled.
    pub fn is_pending(&self) -> bool {
        self.slot.lock().timer.is_some()
    }
}

impl<A> Drop for Throttle<A> {
    fn drop(&mut self) {
        if let Some(timer) = self.slot.lock().timer.take() {
            timer.abort();
        }
    }
}
