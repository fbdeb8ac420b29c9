//! widget-link Library
//!
//! Device-session client for IoT home-screen widgets. The workspace crates
//! do the work; this package adds the headless `wlink` runner.

pub mod headless;

// Re-export main entry points
pub use headless::runner::run_headless;
pub use headless::HeadlessEvent;
