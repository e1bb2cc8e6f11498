//! The runtime context: configuration, connection pool, reconnect queue.
//!
//! Everything that was process-global in a browser client is an explicit
//! object here. Contexts are cheap to clone and fully independent of each
//! other; tests build one per case.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use fusion_core::{ClientId, FrameCodec};
use fusion_settings::{FusionSettings, merge_settings};

use crate::environment::{AlwaysAvailable, EnvironmentEvent, EnvironmentProbe};
use crate::fetcher::{Fetcher, HttpFetcher};
use crate::reconnect::ReconnectCoordinator;
use crate::registry::{ConnectionRegistry, ConnectionTimings};
use crate::subscription::{Subscription, SubscriptionRequest};
use crate::transport::{Transport, TungsteniteTransport};

/// Per-subscription option overrides.
#[derive(Clone, Default)]
pub struct OptionsOverride {
    /// Throttle window in milliseconds.
    pub wait: Option<u64>,
    /// Fetcher used for the bootstrap request.
    pub fetcher: Option<Arc<dyn Fetcher>>,
}

impl OptionsOverride {
    /// Override the throttle window.
    #[must_use]
    pub fn wait(mut self, wait_ms: u64) -> Self {
        self.wait = Some(wait_ms);
        self
    }

    /// Override the fetcher.
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }
}

impl fmt::Debug for OptionsOverride {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OptionsOverride")
            .field("wait", &self.wait)
            .field("fetcher", &self.fetcher.as_ref().map(|_| "<fetcher>"))
            .finish()
    }
}

/// Partial configuration passed to [`FusionContext::configure`].
#[derive(Clone, Debug, Default)]
pub struct ConfigOverride {
    /// Socket endpoint.
    pub uri: Option<String>,
    /// Subscription options.
    pub options: Option<OptionsOverride>,
}

impl ConfigOverride {
    /// Override the socket endpoint.
    #[must_use]
    pub fn uri(mut self, uri: impl Into<String>) -> Self {
        self.uri = Some(uri.into());
        self
    }

    /// Override the throttle window.
    #[must_use]
    pub fn wait(mut self, wait_ms: u64) -> Self {
        self.options = Some(self.options.unwrap_or_default().wait(wait_ms));
        self
    }

    /// Override the default fetcher.
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.options = Some(self.options.unwrap_or_default().fetcher(fetcher));
        self
    }

    fn settings_json(&self) -> serde_json::Value {
        json!({
            "uri": self.uri,
            "options": { "wait": self.options.as_ref().and_then(|o| o.wait) },
        })
    }
}

pub(crate) struct ContextInner {
    pub(crate) environment: Arc<dyn EnvironmentProbe>,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) reconnect: Arc<ReconnectCoordinator>,
    pub(crate) runtime: Handle,
    defaults: FusionSettings,
    settings: RwLock<FusionSettings>,
    default_fetcher: Arc<dyn Fetcher>,
    fetcher: RwLock<Arc<dyn Fetcher>>,
    events: mpsc::UnboundedSender<EnvironmentEvent>,
    listener: JoinHandle<()>,
    next_subscription_id: AtomicU64,
}

impl ContextInner {
    pub(crate) fn next_subscription_id(&self) -> u64 {
        self.next_subscription_id.fetch_add(1, Ordering::Relaxed)
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Builder for [`FusionContext`].
pub struct FusionContextBuilder {
    settings: FusionSettings,
    client_id: Option<ClientId>,
    fetcher: Option<Arc<dyn Fetcher>>,
    transport: Option<Arc<dyn Transport>>,
    environment: Option<Arc<dyn EnvironmentProbe>>,
    codec: FrameCodec,
    timings: ConnectionTimings,
    runtime: Option<Handle>,
}

impl FusionContextBuilder {
    /// Base settings. [`FusionContext::configure`] merges over these.
    #[must_use]
    pub fn settings(mut self, settings: FusionSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Fixed client identity instead of a generated one.
    #[must_use]
    pub fn client_id(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }

    /// Default bootstrap fetcher (an [`HttpFetcher`] otherwise).
    #[must_use]
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Socket transport (a [`TungsteniteTransport`] otherwise).
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Environment probe ([`AlwaysAvailable`] otherwise).
    #[must_use]
    pub fn environment(mut self, environment: Arc<dyn EnvironmentProbe>) -> Self {
        self.environment = Some(environment);
        self
    }

    /// Frame codec (the standard message header otherwise).
    #[must_use]
    pub fn codec(mut self, codec: FrameCodec) -> Self {
        self.codec = codec;
        self
    }

    /// Socket open timeout and idle close grace.
    #[must_use]
    pub fn timings(mut self, timings: ConnectionTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Runtime to spawn onto (the current one otherwise).
    #[must_use]
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Build the context.
    ///
    /// # Panics
    ///
    /// Without an explicit [`runtime`](Self::runtime), panics when called
    /// outside a tokio runtime.
    pub fn build(self) -> FusionContext {
        let runtime = self.runtime.unwrap_or_else(Handle::current);
        let environment = self
            .environment
            .unwrap_or_else(|| Arc::new(AlwaysAvailable));
        let client_id = self.client_id.unwrap_or_else(ClientId::generate);
        let transport = self
            .transport
            .unwrap_or_else(|| Arc::new(TungsteniteTransport));
        let default_fetcher = self
            .fetcher
            .unwrap_or_else(|| Arc::new(HttpFetcher::new()));

        let reconnect = Arc::new(ReconnectCoordinator::new(Arc::clone(&environment)));
        let (events, events_rx) = mpsc::unbounded_channel();
        let listener = reconnect.spawn_listener(&runtime, events_rx);

        debug!(%client_id, uri = %self.settings.uri, "fusion context created");
        FusionContext {
            inner: Arc::new(ContextInner {
                environment,
                registry: ConnectionRegistry::new(transport, client_id, self.codec, self.timings, runtime.clone()),
                reconnect,
                runtime,
                settings: RwLock::new(self.settings.clone()),
                defaults: self.settings,
                fetcher: RwLock::new(Arc::clone(&default_fetcher)),
                default_fetcher,
                events,
                listener,
                next_subscription_id: AtomicU64::new(1),
            }),
        }
    }
}

/// Handle to a subscription runtime.
#[derive(Clone)]
pub struct FusionContext {
    inner: Arc<ContextInner>,
}

impl FusionContext {
    /// Start building a context.
    pub fn builder() -> FusionContextBuilder {
        FusionContextBuilder {
            settings: FusionSettings::default(),
            client_id: None,
            fetcher: None,
            transport: None,
            environment: None,
            codec: FrameCodec::default(),
            timings: ConnectionTimings::default(),
            runtime: None,
        }
    }

    /// Context with default settings on the current runtime.
    ///
    /// # Panics
    ///
    /// Outside a tokio runtime.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Replace the configuration with `overrides` deep-merged over the base
    /// settings.
    ///
    /// Each call starts again from the base: settings set by an earlier call
    /// and not repeated are reset. Only subscriptions created afterwards see
    /// the change.
    pub fn configure(&self, overrides: ConfigOverride) {
        match merge_settings(&self.inner.defaults, overrides.settings_json()) {
            Ok(settings) => {
                debug!(uri = %settings.uri, wait_ms = settings.options.wait_ms, "configured");
                *self.inner.settings.write() = settings;
            }
            Err(err) => warn!(error = %err, "ignoring invalid configuration"),
        }
        let fetcher = overrides
            .options
            .and_then(|o| o.fetcher)
            .unwrap_or_else(|| Arc::clone(&self.inner.default_fetcher));
        *self.inner.fetcher.write() = fetcher;
    }

    /// The effective settings.
    pub fn settings(&self) -> FusionSettings {
        self.inner.settings.read().clone()
    }

    /// This context's client identity.
    pub fn client_id(&self) -> &ClientId {
        self.inner.registry.client_id()
    }

    /// Subscribe to `request`, starting from `default_data`.
    ///
    /// The returned handle immediately yields `{loading: true, data:
    /// default_data}`, then every state change.
    pub fn subscribe<T>(&self, default_data: T, request: SubscriptionRequest) -> Subscription<T>
    where
        T: DeserializeOwned + Clone + Send + Sync + 'static,
    {
        let settings = self.settings();
        let options = request.options.clone().unwrap_or_default();
        let wait_ms = options.wait.unwrap_or(settings.options.wait_ms);
        let fetcher = options
            .fetcher
            .unwrap_or_else(|| Arc::clone(&*self.inner.fetcher.read()));
        Subscription::start(
            Arc::clone(&self.inner),
            default_data,
            request,
            settings.uri,
            std::time::Duration::from_millis(wait_ms),
            fetcher,
        )
    }

    /// Report an environment transition synchronously. Returns how many
    /// parked subscriptions resumed.
    pub fn notify_environment(&self, event: EnvironmentEvent) -> usize {
        self.inner.reconnect.handle_event(event)
    }

    /// Sender for environment transitions, processed on the runtime.
    pub fn environment_events(&self) -> mpsc::UnboundedSender<EnvironmentEvent> {
        self.inner.events.clone()
    }

    /// Number of registered connections.
    pub fn connection_count(&self) -> usize {
        self.inner.registry.len()
    }

    /// Number of subscriptions parked until the environment is available.
    pub fn pending_reconnects(&self) -> usize {
        self.inner.reconnect.pending_count()
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Close every connection. Subscriptions still attached see a
    /// connection error.
    pub fn close_connections(&self) -> usize {
        self.inner.registry.close_all()
    }
}

impl Default for FusionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for FusionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FusionContext")
            .field("client_id", self.client_id())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environment::ManualEnvironment;
    use crate::testutil::{MockTransport, ScriptedFetcher, settle};
    use fusion_core::PublicationRef;
    use serde_json::json;

    fn context() -> FusionContext {
        FusionContext::builder()
            .client_id(ClientId::from("c1"))
            .transport(MockTransport::new())
            .fetcher(ScriptedFetcher::new())
            .build()
    }

    #[tokio::test]
    async fn configure_merges_over_base_not_previous() {
        let ctx = context();
        ctx.configure(ConfigOverride::default().uri("ws://a/fusion/ws").wait(50));
        assert_eq!(ctx.settings().uri, "ws://a/fusion/ws");
        assert_eq!(ctx.settings().options.wait_ms, 50);

        ctx.configure(ConfigOverride::default().wait(75));
        assert_eq!(ctx.settings().uri, FusionSettings::default().uri);
        assert_eq!(ctx.settings().options.wait_ms, 75);
    }

    #[tokio::test]
    async fn configure_keeps_builder_base() {
        let base = FusionSettings::for_origin("https://example.com").unwrap();
        let ctx = FusionContext::builder()
            .settings(base)
            .transport(MockTransport::new())
            .build();
        ctx.configure(ConfigOverride::default().wait(10));
        assert_eq!(ctx.settings().uri, "wss://example.com/fusion/ws");
    }

    #[tokio::test(start_paused = true)]
    async fn configured_fetcher_applies_to_new_subscriptions() {
        let transport = MockTransport::new();
        let default_fetcher = ScriptedFetcher::publishing(json!(1), PublicationRef::new("P", "U"));
        let override_fetcher = ScriptedFetcher::publishing(json!(2), PublicationRef::new("P", "U"));
        let ctx = FusionContext::builder()
            .transport(transport)
            .fetcher(default_fetcher.clone())
            .build();

        ctx.configure(ConfigOverride::default().fetcher(override_fetcher.clone()));
        let _a = ctx.subscribe(0_i64, SubscriptionRequest::new("/a"));
        settle().await;
        assert_eq!(override_fetcher.call_count(), 1);
        assert_eq!(default_fetcher.call_count(), 0);

        ctx.configure(ConfigOverride::default());
        let _b = ctx.subscribe(0_i64, SubscriptionRequest::new("/b"));
        settle().await;
        assert_eq!(default_fetcher.call_count(), 1);
    }

    #[tokio::test]
    async fn contexts_are_independent() {
        let a = context();
        let b = FusionContext::builder().transport(MockTransport::new()).build();
        assert_ne!(a.client_id(), b.client_id());
        a.configure(ConfigOverride::default().wait(1));
        assert_eq!(b.settings().options.wait_ms, 300);
    }

    #[tokio::test(start_paused = true)]
    async fn environment_events_drive_reconnects() {
        let env = Arc::new(ManualEnvironment::with_state(true, false));
        let ctx = FusionContext::builder()
            .transport(MockTransport::new())
            .fetcher(ScriptedFetcher::new())
            .environment(env.clone())
            .build();
        let _sub = ctx.subscribe(0_i64, SubscriptionRequest::new("/x"));
        assert_eq!(ctx.pending_reconnects(), 1);
        assert_eq!(ctx.notify_environment(EnvironmentEvent::Online), 0);

        env.set_online(true);
        ctx.environment_events().send(EnvironmentEvent::Online).unwrap();
        settle().await;
        assert_eq!(ctx.pending_reconnects(), 0);
    }
}
