//! # wlink-core - Core Domain Types
//!
//! Foundation crate for widget-link. Provides the error taxonomy, logging
//! bootstrap, and the domain types shared by the session and app layers.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, thiserror, tracing, url).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`Partition`] - Sandbox vs production broker a device is deployed to
//! - [`ConnectionConfig`] - Credentials and broker endpoints for one user
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Custom error enum with `is_fatal` classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use wlink_core::prelude::*;
//! ```

pub mod error;
pub mod logging;
pub mod prelude;
pub mod types;

pub use error::{Error, Result};
pub use types::{ConnectionConfig, Partition};
