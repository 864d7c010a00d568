//! # relay-settings
//!
//! Layered configuration for the relay gateway.
//!
//! Settings are resolved from three layers, lowest priority first:
//! 1. **Compiled defaults**: [`GatewaySettings::default()`]
//! 2. **Settings file**: `~/.relay/settings.json` or an explicit path,
//!    deep-merged over the defaults
//! 3. **Environment**: `RELAY_*` overrides
//!
//! There is no global instance. The binary loads settings once and passes
//! the pieces each component needs into its constructor.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
