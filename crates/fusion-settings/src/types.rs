//! Settings types.
//!
//! The JSON shape mirrors the client's configuration surface:
//!
//! ```json
//! { "uri": "wss://example.com/fusion/ws", "options": { "wait": 300 } }
//! ```

use std::time::Duration;

use fusion_core::constants::DEFAULT_WAIT_MS;
use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Path of the publisher socket endpoint on the server.
pub const SOCKET_PATH: &str = "/fusion/ws";

/// Default socket endpoint when no origin is known.
pub const DEFAULT_URI: &str = "ws://127.0.0.1:5005/fusion/ws";

/// Root settings for a client context.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FusionSettings {
    /// Socket endpoint; `publisherId` and `clientId` are appended as query.
    pub uri: String,
    /// Subscription options.
    pub options: OptionsSettings,
}

impl Default for FusionSettings {
    fn default() -> Self {
        Self {
            uri: DEFAULT_URI.to_string(),
            options: OptionsSettings::default(),
        }
    }
}

impl FusionSettings {
    /// Defaults with the socket endpoint derived from an HTTP origin.
    ///
    /// `https://host` maps to `wss://host/fusion/ws`, `http://host` to
    /// `ws://host/fusion/ws`. Any path on the origin is discarded.
    pub fn for_origin(origin: &str) -> Result<Self> {
        Ok(Self {
            uri: socket_uri_for_origin(origin)?,
            options: OptionsSettings::default(),
        })
    }

    /// The throttle window as a [`Duration`].
    #[must_use]
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.options.wait_ms)
    }
}

/// Per-subscription behavior.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptionsSettings {
    /// Throttle window for refetch requests, in milliseconds.
    #[serde(rename = "wait", alias = "waitMs")]
    pub wait_ms: u64,
}

impl Default for OptionsSettings {
    fn default() -> Self {
        Self {
            wait_ms: DEFAULT_WAIT_MS,
        }
    }
}

/// Derive the socket endpoint for an HTTP(S) origin.
pub fn socket_uri_for_origin(origin: &str) -> Result<String> {
    let (scheme, rest) = if let Some(rest) = origin.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = origin.strip_prefix("http://") {
        ("ws", rest)
    } else {
        return Err(SettingsError::InvalidOrigin {
            origin: origin.to_owned(),
            reason: "scheme must be http or https",
        });
    };
    let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
    if host.is_empty() {
        return Err(SettingsError::InvalidOrigin {
            origin: origin.to_owned(),
            reason: "no host",
        });
    }
    Ok(format!("{scheme}://{host}{SOCKET_PATH}"))
}
