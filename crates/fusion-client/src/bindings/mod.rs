//! Adapters from subscriptions to state containers.
//!
//! - [`WatchedSubscription`]: one retargetable subscription mirrored into a
//!   `tokio::sync::watch` channel
//! - [`ObservedFields`]: named fields, each backed by its own subscription,
//!   reporting into one update channel

mod observed;
mod watch;

pub use observed::{FieldMode, FieldSpec, FieldUpdate, FieldValue, ObservedFields};
pub use watch::WatchedSubscription;
