//! widget-link - Device-session client for IoT home-screen widgets
//!
//! This is the binary entry point. All logic lives in the library.

use std::path::PathBuf;

use clap::Parser;
use wlink_app::config::{default_settings_path, load_settings};
use wlink_core::prelude::*;
use widget_link::HeadlessEvent;

/// widget-link - Keep widget device state in sync with the IoT broker
#[derive(Parser, Debug)]
#[command(name = "wlink")]
#[command(about = "Keep widget device state in sync with the IoT broker", long_about = None)]
struct Args {
    /// Path to the settings file (defaults to <config dir>/widget-link/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    wlink_core::logging::init()?;

    let Some(path) = args.config.or_else(default_settings_path) else {
        let message = "no config directory on this platform; pass --config".to_string();
        HeadlessEvent::error(message.clone(), true).emit();
        return Err(Error::config(message).into());
    };

    let settings = match load_settings(&path) {
        Ok(settings) => settings,
        Err(e) => {
            error!("Failed to load settings from {}: {}", path.display(), e);
            HeadlessEvent::error(e.to_string(), e.is_fatal()).emit();
            return Err(e.into());
        }
    };

    widget_link::run_headless(settings).await?;
    Ok(())
}
