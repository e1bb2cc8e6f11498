//! # fusion-core
//!
//! Foundation types shared by every fusion crate:
//!
//! - **Branded IDs**: [`ClientId`], [`PublisherId`], [`PublicationId`] as newtypes,
//!   plus the [`PublicationRef`] pair that keys a subscription
//! - **Wire codec**: [`codec::FrameCodec`] for the `header|json` frame format
//! - **Errors**: [`FusionError`] with a transport / protocol / timeout taxonomy
//! - **Backoff**: [`retry::calculate_backoff_delay`] for bootstrap retries
//! - **Logging**: [`logging::init_subscriber`] for `tracing` setup

#![deny(unsafe_code)]

pub mod codec;
pub mod constants;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod retry;

pub use codec::{FrameCodec, FrameOutput, IncomingFrame};
pub use errors::{ErrorKind, FusionError, Result};
pub use ids::{ClientId, PublicationId, PublicationRef, PublisherId};
