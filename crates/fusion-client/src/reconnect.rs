//! Deferred subscription setup.
//!
//! Subscriptions that cannot run (consumer hidden, network offline, or a
//! terminal bootstrap error) park a resume action here. Every environment
//! event drains the whole set at once, but only while the environment is
//! available.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::environment::{EnvironmentEvent, EnvironmentProbe};

/// Action that restarts one parked subscription.
pub type ResumeAction = Box<dyn FnOnce() + Send>;

/// Set of parked subscriptions, keyed by subscription id.
pub struct ReconnectCoordinator {
    environment: Arc<dyn EnvironmentProbe>,
    pending: Mutex<HashMap<u64, ResumeAction>>,
}

impl ReconnectCoordinator {
    /// Coordinator gated on `environment`.
    pub fn new(environment: Arc<dyn EnvironmentProbe>) -> Self {
        Self {
            environment,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Park `action` for subscription `id`, replacing any earlier one.
    pub fn park(&self, id: u64, action: ResumeAction) {
        let mut pending = self.pending.lock();
        if pending.insert(id, action).is_some() {
            debug!(subscription_id = id, "replaced parked resume action");
        }
    }

    /// Forget the parked action for `id`.
    pub fn remove(&self, id: u64) -> bool {
        self.pending.lock().remove(&id).is_some()
    }

    /// Whether `id` is parked.
    pub fn is_parked(&self, id: u64) -> bool {
        self.pending.lock().contains_key(&id)
    }

    /// Number of parked subscriptions.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// React to an environment event.
    ///
    /// When the environment is available, takes every parked action and runs
    /// each once. Returns how many ran.
    pub fn handle_event(&self, event: EnvironmentEvent) -> usize {
        if !self.environment.is_available() {
            debug!(?event, "environment unavailable, keeping subscriptions parked");
            return 0;
        }
        let drained = std::mem::take(&mut *self.pending.lock());
        if drained.is_empty() {
            return 0;
        }
        let count = drained.len();
        info!(?event, count, "resuming parked subscriptions");
        for action in drained.into_values() {
            action();
        }
        count
    }

    /// Feed events from `events` into [`handle_event`](Self::handle_event)
    /// until the channel closes.
    pub fn spawn_listener(
        self: &Arc<Self>,
        runtime: &Handle,
        mut events: mpsc::UnboundedReceiver<EnvironmentEvent>,
    ) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        runtime.spawn(async move {
            while let Some(event) = events.recv().await {
                let _ = coordinator.handle_event(event);
            }
            debug!("environment event channel closed");
        })
    }
}
