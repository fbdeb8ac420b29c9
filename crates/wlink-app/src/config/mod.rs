//! Configuration file parsing for widget-link
//!
//! Supports:
//! - `<config dir>/widget-link/config.toml` - Connection, timing and groups

pub mod settings;
pub mod types;

pub use settings::{default_settings_path, load_settings, parse_settings};
pub use types::*;
