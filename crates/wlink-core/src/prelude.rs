//! Prelude for common imports used throughout all widget-link crates

pub use crate::error::{Error, Result};
pub use tracing::{debug, error, info, instrument, trace, warn};
