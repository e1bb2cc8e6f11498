//! # fusion-settings
//!
//! Configuration for the fusion subscription client.
//!
//! Settings are resolved from three layers (in priority order):
//! 1. **Compiled defaults**: [`FusionSettings::default()`]
//! 2. **Settings file**: JSON deep-merged over defaults
//! 3. **Environment variables**: `FUSION_*` overrides (highest priority)
//!
//! At runtime a client context may be reconfigured with an override that is
//! deep-merged over the defaults again; see [`deep_merge`].

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{
    apply_env_overrides, deep_merge, load_settings_from_path, merge_over_defaults, merge_settings,
};
pub use types::{FusionSettings, OptionsSettings};
