//! # fusion-client
//!
//! Client runtime for invalidate-then-refetch subscriptions.
//!
//! A subscription fetches its initial value over HTTP. The response names a
//! publication, and the client subscribes to it over a `WebSocket` shared by
//! every subscription on the same publisher. When the server invalidates the
//! publication the client asks for a fresh value, throttled per
//! subscription, and publishes it to the caller.
//!
//! - [`FusionContext`]: entry point holding settings, the connection
//!   registry and the reconnect coordinator
//! - [`Subscription`]: one live value, consumed as a stream of
//!   [`SubscriptionResult`]s
//! - [`bindings`]: `watch`-channel and named-field adapters
//! - [`Fetcher`] and [`Transport`]: the HTTP and socket seams

#![deny(unsafe_code)]

pub mod bindings;
pub mod bootstrap;
pub mod connection;
pub mod context;
pub mod environment;
pub mod fetcher;
pub mod reconnect;
pub mod registry;
pub mod subscription;
pub mod throttle;
pub mod transport;

#[cfg(test)]
mod testutil;

pub use bindings::{FieldMode, FieldSpec, FieldUpdate, FieldValue, ObservedFields, WatchedSubscription};
pub use context::{ConfigOverride, FusionContext, FusionContextBuilder, OptionsOverride};
pub use environment::{AlwaysAvailable, EnvironmentEvent, EnvironmentProbe, ManualEnvironment};
pub use fetcher::{FetchParams, FetchResponse, Fetcher, HttpFetcher, PublicationHeader, fetcher_fn};
pub use registry::ConnectionTimings;
pub use subscription::{RefetchHandle, Subscription, SubscriptionPhase, SubscriptionRequest, SubscriptionResult};
pub use transport::{Transport, TungsteniteTransport};

pub use fusion_core::{ClientId, FusionError, PublicationId, PublicationRef, PublisherId, Result};
pub use fusion_settings::FusionSettings;
