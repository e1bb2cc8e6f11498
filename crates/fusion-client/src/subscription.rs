//! Subscriptions: one consumer's view of one publication.
//!
//! ```text
//! Initializing ──fetch──▶ Fetching ──attach──▶ Subscribed ◀──update── RefetchPending
//!      ▲  │                  │                     │  └──invalidate──────▲
//!      │  └─unavailable─▶ (parked)                 │
//!      │                     │ terminal error      │ connection lost
//!      │                     ▼                     ▼
//!      └──────────── ErrorWaitingReconnect ◀───────┘
//! ```
//!
//! Every state change is delivered to the consumer as a
//! [`SubscriptionResult`]. Errors keep the last good value. Invalidations
//! are coalesced by a trailing throttle before a single *RequestUpdate* is
//! sent, and only one of the subscriptions sharing a publication sends it.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::Stream;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use fusion_core::{FusionError, IncomingFrame, PublicationRef};

use crate::bootstrap::fetch_initial;
use crate::connection::{Connection, PublicationListener};
use crate::context::{ContextInner, OptionsOverride};
use crate::fetcher::{FetchParams, Fetcher};
use crate::throttle::Throttle;

/// What to subscribe to.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionRequest {
    /// Bootstrap URL. `None` keeps the subscription idle.
    pub url: Option<String>,
    /// Headers and query for the bootstrap request.
    pub params: FetchParams,
    /// Per-subscription option overrides.
    pub options: Option<OptionsOverride>,
}

impl SubscriptionRequest {
    /// Subscribe to `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Self::default()
        }
    }

    /// A request that never fetches.
    pub fn idle() -> Self {
        Self::default()
    }

    /// Replace the bootstrap parameters.
    #[must_use]
    pub fn with_params(mut self, params: FetchParams) -> Self {
        self.params = params;
        self
    }

    /// Set per-subscription options.
    #[must_use]
    pub fn with_options(mut self, options: OptionsOverride) -> Self {
        self.options = Some(options);
        self
    }
}

/// What the consumer sees.
#[derive(Clone, Debug)]
pub struct SubscriptionResult<T> {
    /// No value has been fetched yet.
    pub loading: bool,
    /// The most recent error, cleared by the next good value.
    pub error: Option<Arc<FusionError>>,
    /// The last good value, or the default.
    pub data: T,
}

/// Lifecycle phase of a subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SubscriptionPhase {
    /// About to fetch, or parked until the environment is available.
    Initializing,
    /// Bootstrap request and connection in flight.
    Fetching,
    /// Attached and current.
    Subscribed,
    /// Invalidated; an update request is scheduled or in flight.
    RefetchPending,
    /// Failed; restarting or parked until an environment event.
    ErrorWaitingReconnect,
    /// Ended by the consumer. Terminal.
    Unsubscribed,
}

#[derive(Clone)]
struct Binding {
    connection: Arc<Connection>,
    publication: PublicationRef,
}

struct CoreState<T> {
    phase: SubscriptionPhase,
    loading: bool,
    error: Option<Arc<FusionError>>,
    data: T,
    binding: Option<Binding>,
    /// Bumped on every (re)start; stale async work compares against it.
    run: u64,
}

impl<T: Clone> CoreState<T> {
    fn snapshot(&self) -> SubscriptionResult<T> {
        SubscriptionResult {
            loading: self.loading,
            error: self.error.clone(),
            data: self.data.clone(),
        }
    }
}

pub(crate) struct SubscriptionCore<T> {
    id: u64,
    this: Weak<Self>,
    context: Arc<ContextInner>,
    url: Option<String>,
    params: FetchParams,
    uri: String,
    fetcher: Arc<dyn Fetcher>,
    throttle: Throttle<PublicationRef>,
    cancel: CancellationToken,
    state: Mutex<CoreState<T>>,
    events: mpsc::UnboundedSender<SubscriptionResult<T>>,
}

impl<T> SubscriptionCore<T> {
    fn unsubscribe(&self) -> bool {
        let binding = {
            let mut state = self.state.lock();
            if state.phase == SubscriptionPhase::Unsubscribed {
                return false;
            }
            state.phase = SubscriptionPhase::Unsubscribed;
            state.run += 1;
            state.binding.take()
        };
        self.cancel.cancel();
        self.throttle.cancel();
        let _ = self.context.reconnect.remove(self.id);
        if let Some(binding) = binding {
            let _ = binding
                .connection
                .detach(&binding.publication.publication_id, self.id);
        }
        debug!(subscription_id = self.id, "unsubscribed");
        true
    }

    fn phase(&self) -> SubscriptionPhase {
        self.state.lock().phase
    }
}

impl<T> SubscriptionCore<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn emit(&self, state: &CoreState<T>) {
        let _ = self.events.send(state.snapshot());
    }

    fn enter_initializing(self: &Arc<Self>) {
        if self.url.is_none() {
            return;
        }
        let run = {
            let mut state = self.state.lock();
            if state.phase == SubscriptionPhase::Unsubscribed {
                return;
            }
            state.phase = SubscriptionPhase::Initializing;
            state.run += 1;
            state.run
        };
        if self.context.environment.is_available() {
            self.start_setup(run);
        } else {
            debug!(subscription_id = self.id, "environment unavailable, parking");
            self.park(run);
        }
    }

    fn park(self: &Arc<Self>, run: u64) {
        let core = Arc::downgrade(self);
        self.context.reconnect.park(
            self.id,
            Box::new(move || {
                if let Some(core) = core.upgrade() {
                    core.resume(run);
                }
            }),
        );
    }

    fn resume(self: &Arc<Self>, run: u64) {
        {
            let state = self.state.lock();
            let parked = matches!(
                state.phase,
                SubscriptionPhase::Initializing | SubscriptionPhase::ErrorWaitingReconnect
            );
            if state.run != run || !parked {
                debug!(subscription_id = self.id, "ignoring stale resume");
                return;
            }
        }
        self.enter_initializing();
    }

    fn start_setup(self: &Arc<Self>, run: u64) {
        {
            let mut state = self.state.lock();
            if state.run != run || state.phase != SubscriptionPhase::Initializing {
                return;
            }
            state.phase = SubscriptionPhase::Fetching;
        }
        let core = Arc::clone(self);
        let cancel = self.cancel.clone();
        drop(self.context.runtime.spawn(async move {
            tokio::select! {
                () = cancel.cancelled() => debug!(subscription_id = core.id, "setup cancelled"),
                () = core.setup(run) => {}
            }
        }));
    }

    async fn setup(self: &Arc<Self>, run: u64) {
        let Some(url) = self.url.as_deref() else { return };
        let bootstrapped = match fetch_initial(self.fetcher.as_ref(), url, &self.params).await {
            Ok(bootstrapped) => bootstrapped,
            Err(err) => {
                self.park_on_error(run, err);
                return;
            }
        };
        let data = match T::deserialize(&bootstrapped.data) {
            Ok(data) => data,
            Err(err) => {
                self.park_on_error(run, err.into());
                return;
            }
        };
        {
            let mut state = self.state.lock();
            if state.run != run || state.phase != SubscriptionPhase::Fetching {
                return;
            }
            state.data = data;
            state.loading = false;
            state.error = None;
            self.emit(&state);
        }

        let publication = bootstrapped.publication;
        let connection = match self
            .context
            .registry
            .acquire(&publication.publisher_id, &self.uri)
            .await
        {
            Ok(connection) => connection,
            Err(err) => {
                self.fail(run, err);
                return;
            }
        };

        let listener: Arc<dyn PublicationListener> = Arc::clone(self) as Arc<dyn PublicationListener>;
        let attached = {
            let mut state = self.state.lock();
            if state.run != run || state.phase != SubscriptionPhase::Fetching {
                return;
            }
            let attached = connection.attach(&publication.publication_id, listener);
            if attached.is_ok() {
                state.binding = Some(Binding {
                    connection,
                    publication: publication.clone(),
                });
                state.phase = SubscriptionPhase::Subscribed;
            }
            attached
        };
        match attached {
            Ok(()) => info!(subscription_id = self.id, %publication, "subscribed"),
            Err(err) => self.fail(run, err),
        }
    }

    /// Terminal bootstrap failure: report and wait for an environment event.
    fn park_on_error(self: &Arc<Self>, run: u64, err: FusionError) {
        warn!(subscription_id = self.id, error = %err, "subscription parked after terminal error");
        {
            let mut state = self.state.lock();
            if state.run != run || state.phase == SubscriptionPhase::Unsubscribed {
                return;
            }
            state.phase = SubscriptionPhase::ErrorWaitingReconnect;
            state.loading = false;
            state.error = Some(Arc::new(err));
            self.emit(&state);
        }
        self.park(run);
    }

    /// Transport failure: clean up, report, start over.
    fn fail(self: &Arc<Self>, run: u64, err: FusionError) {
        warn!(subscription_id = self.id, error = %err, "subscription failed");
        let binding = {
            let mut state = self.state.lock();
            if state.run != run || state.phase == SubscriptionPhase::Unsubscribed {
                return;
            }
            state.phase = SubscriptionPhase::ErrorWaitingReconnect;
            state.loading = false;
            state.error = Some(Arc::new(err));
            self.emit(&state);
            state.binding.take()
        };
        self.throttle.cancel();
        if let Some(binding) = binding {
            let _ = binding
                .connection
                .detach(&binding.publication.publication_id, self.id);
        }
        self.enter_initializing();
    }

    fn send_request_update(&self, publication: &PublicationRef) {
        let connection = {
            let state = self.state.lock();
            if state.phase == SubscriptionPhase::Unsubscribed {
                return;
            }
            state
                .binding
                .as_ref()
                .filter(|b| b.publication == *publication)
                .map(|b| Arc::clone(&b.connection))
        };
        if let Some(connection) = connection {
            let _ = connection.request_update(publication);
        }
    }

    fn request_update_now(&self) -> bool {
        let binding = {
            let state = self.state.lock();
            if !matches!(
                state.phase,
                SubscriptionPhase::Subscribed | SubscriptionPhase::RefetchPending
            ) {
                return false;
            }
            state.binding.clone()
        };
        let Some(binding) = binding else { return false };
        self.throttle.cancel();
        binding.connection.request_update(&binding.publication)
    }
}

impl<T> PublicationListener for SubscriptionCore<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn listener_id(&self) -> u64 {
        self.id
    }

    fn on_frame(&self, frame: &IncomingFrame) {
        let mut state = self.state.lock();
        if !matches!(
            state.phase,
            SubscriptionPhase::Subscribed | SubscriptionPhase::RefetchPending
        ) {
            return;
        }
        let bound = state
            .binding
            .as_ref()
            .is_some_and(|b| b.publication.publication_id == frame.publication_id);
        if !bound {
            return;
        }

        if frame.is_invalidation() {
            state.phase = SubscriptionPhase::RefetchPending;
            self.throttle.call(frame.publication_ref());
            debug!(subscription_id = self.id, "invalidated");
        }
        if let Some(value) = frame.value() {
            match T::deserialize(value) {
                Ok(data) => {
                    state.data = data;
                    state.error = None;
                    if !frame.is_invalidation() {
                        state.phase = SubscriptionPhase::Subscribed;
                    }
                }
                Err(err) => {
                    warn!(subscription_id = self.id, error = %err, "dropping undecodable update");
                    state.error = Some(Arc::new(FusionError::Decode(err.to_string())));
                }
            }
            state.loading = false;
            self.emit(&state);
        }
    }

    fn on_connection_lost(&self, code: u16, reason: &str) {
        let run = {
            let state = self.state.lock();
            if !matches!(
                state.phase,
                SubscriptionPhase::Subscribed | SubscriptionPhase::RefetchPending
            ) {
                return;
            }
            state.run
        };
        if let Some(core) = self.this.upgrade() {
            core.fail(
                run,
                FusionError::ConnectionClosed {
                    code,
                    reason: reason.to_owned(),
                },
            );
        }
    }

    fn cancel_refetch(&self) {
        self.throttle.cancel();
    }
}

trait Refetch: Send + Sync {
    fn request_update_now(&self) -> bool;
}

impl<T> Refetch for SubscriptionCore<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn request_update_now(&self) -> bool {
        SubscriptionCore::request_update_now(self)
    }
}

/// Detached trigger for an immediate update request.
///
/// Holds the subscription weakly: once the subscription is gone every call
/// returns `false`.
#[derive(Clone)]
pub struct RefetchHandle {
    target: Weak<dyn Refetch>,
}

impl RefetchHandle {
    /// Request a fresh value now, bypassing the throttle.
    pub fn request_update_now(&self) -> bool {
        self.target
            .upgrade()
            .is_some_and(|target| target.request_update_now())
    }
}

impl fmt::Debug for RefetchHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RefetchHandle")
            .field("live", &(self.target.strong_count() > 0))
            .finish()
    }
}

/// Consumer handle of a subscription.
///
/// Yields every state change, starting with `{loading: true, data:
/// default}`. Dropping the handle unsubscribes.
pub struct Subscription<T> {
    core: Arc<SubscriptionCore<T>>,
    events: mpsc::UnboundedReceiver<SubscriptionResult<T>>,
}

impl<T> Subscription<T>
where
    T: DeserializeOwned + Clone + Send + Sync + 'static,
{
    pub(crate) fn start(
        context: Arc<ContextInner>,
        default_data: T,
        request: SubscriptionRequest,
        uri: String,
        wait: Duration,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        let id = context.next_subscription_id();
        let runtime = context.runtime.clone();
        let (events, receiver) = mpsc::unbounded_channel();
        let core = Arc::new_cyclic(|this: &Weak<SubscriptionCore<T>>| {
            let target = this.clone();
            SubscriptionCore {
                id,
                this: this.clone(),
                context,
                url: request.url,
                params: request.params,
                uri,
                fetcher,
                throttle: Throttle::new(wait, runtime, move |publication: PublicationRef| {
                    if let Some(core) = target.upgrade() {
                        core.send_request_update(&publication);
                    }
                }),
                cancel: CancellationToken::new(),
                state: Mutex::new(CoreState {
                    phase: SubscriptionPhase::Initializing,
                    loading: true,
                    error: None,
                    data: default_data,
                    binding: None,
                    run: 0,
                }),
                events,
            }
        });
        debug!(subscription_id = id, url = ?core.url, wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX), "subscription created");
        core.emit(&core.state.lock());
        core.enter_initializing();
        Self {
            core,
            events: receiver,
        }
    }

    /// Identifier of this subscription within its context.
    pub fn id(&self) -> u64 {
        self.core.id
    }

    /// Current lifecycle phase.
    pub fn phase(&self) -> SubscriptionPhase {
        self.core.phase()
    }

    /// The latest state, regardless of what has been consumed.
    pub fn current(&self) -> SubscriptionResult<T> {
        self.core.state.lock().snapshot()
    }

    /// The publication this subscription is attached to, if any.
    pub fn publication(&self) -> Option<PublicationRef> {
        self.core
            .state
            .lock()
            .binding
            .as_ref()
            .map(|b| b.publication.clone())
    }

    /// Next state change. `None` once unsubscribed and drained.
    pub async fn next_update(&mut self) -> Option<SubscriptionResult<T>> {
        self.events.recv().await
    }

    /// Next already-delivered state change, without waiting.
    pub fn try_next_update(&mut self) -> Option<SubscriptionResult<T>> {
        self.events.try_recv().ok()
    }

    /// Ask the server for a fresh value now, skipping the throttle.
    ///
    /// Returns `false` when not attached to a live connection.
    #[doc(alias = "cancel")]
    pub fn request_update_now(&self) -> bool {
        self.core.request_update_now()
    }

    /// A cloneable trigger for [`request_update_now`](Self::request_update_now).
    pub fn refetch_handle(&self) -> RefetchHandle {
        let target: Weak<dyn Refetch> = Arc::downgrade(&self.core) as Weak<dyn Refetch>;
        RefetchHandle { target }
    }
}

impl<T> Subscription<T> {
    /// Stop the subscription. Idempotent; no state change is delivered
    /// after the first call returns.
    pub fn unsubscribe(&mut self) -> bool {
        let first = self.core.unsubscribe();
        self.events.close();
        while self.events.try_recv().is_ok() {}
        first
    }

    /// Whether [`unsubscribe`](Self::unsubscribe) has not been called.
    pub fn is_active(&self) -> bool {
        self.core.phase() != SubscriptionPhase::Unsubscribed
    }
}

impl<T> Stream for Subscription<T> {
    type Item = SubscriptionResult<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.events.poll_recv(cx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        let _ = self.core.unsubscribe();
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.core.id)
            .field("phase", &self.core.phase())
            .finish_non_exhaustive()
    }
}
