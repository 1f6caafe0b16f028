//! # convo-settings
//!
//! Layered configuration for the sync client: compiled defaults, then
//! `~/.convo/settings.json` deep-merged over them, then `CONVO_*`
//! environment variables. Credentials are never read from the file.

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
