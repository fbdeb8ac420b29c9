//! Headless mode runner - main event loop
//!
//! Connects the widget service, registers the configured groups and prints
//! their events until Ctrl-C or a `quit` command on stdin.

use std::sync::Arc;

use tokio::sync::mpsc;

use wlink_app::{ControlKind, ControlSpec, GroupKind, Settings, StaticCloud, WidgetService};
use wlink_core::prelude::*;

use super::HeadlessEvent;

type Service = WidgetService<StaticCloud>;

/// Commands accepted on stdin, one per line
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StdinCommand {
    /// Toggle a boolean attribute on a device
    Tap { device_id: String, attr_key: String },
    Scene { home_id: i64, scene_id: i64 },
    /// Re-fetch the device directory and refresh
    Refresh,
    Quit,
}

/// Parse one stdin line. `None` for blank lines.
pub fn parse_command(line: &str) -> Option<std::result::Result<StdinCommand, String>> {
    let mut words = line.split_whitespace();
    let command = words.next()?;
    let args: Vec<&str> = words.collect();

    let parsed = match (command, args.as_slice()) {
        ("tap" | "t", [device_id, attr_key]) => Ok(StdinCommand::Tap {
            device_id: device_id.to_string(),
            attr_key: attr_key.to_string(),
        }),
        ("scene" | "s", [home_id, scene_id]) => match (home_id.parse::<i64>(), scene_id.parse::<i64>()) {
            (Ok(home_id), Ok(scene_id)) => Ok(StdinCommand::Scene { home_id, scene_id }),
            _ => Err(format!("scene ids must be integers: {}", line.trim())),
        },
        ("refresh" | "r", []) => Ok(StdinCommand::Refresh),
        ("quit" | "q", []) => Ok(StdinCommand::Quit),
        _ => Err(format!("unknown command: {}", line.trim())),
    };
    Some(parsed)
}

/// Run in headless mode - output JSON events to stdout
pub async fn run_headless(settings: Settings) -> Result<()> {
    info!("═══════════════════════════════════════════════════════");
    info!("widget-link starting in HEADLESS mode");
    info!("App: {}, user: {}", settings.connection.app_id, settings.connection.user_id);
    info!("═══════════════════════════════════════════════════════");

    let service = Arc::new(WidgetService::new(
        StaticCloud::new(settings.devices.clone()),
        settings.timing.service_timing(),
    ));
    let mut sessions = service.subscribe_sessions();
    service.attach(&settings.connection);

    let mut control = service
        .register_group(GroupKind::Control, settings.groups.control.clone())
        .await;
    let mut state = service
        .register_group(GroupKind::State, settings.groups.state.clone())
        .await;

    let (cmd_tx, mut cmd_rx) = mpsc::channel(16);
    std::thread::spawn(move || {
        spawn_stdin_reader_blocking(cmd_tx);
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            result = &mut ctrl_c => {
                if let Err(e) = result {
                    error!("Failed to listen for Ctrl-C: {}", e);
                }
                info!("Ctrl-C received");
                break;
            }
            Some(event) = sessions.recv() => {
                if let Some(event) = HeadlessEvent::from_session_event(&event) {
                    event.emit();
                }
            }
            Some(event) = control.recv() => {
                HeadlessEvent::from_device_event(GroupKind::Control, &event).emit();
            }
            Some(event) = state.recv() => {
                HeadlessEvent::from_device_event(GroupKind::State, &event).emit();
            }
            Some(command) = cmd_rx.recv() => {
                if command == StdinCommand::Quit {
                    info!("Quit requested");
                    break;
                }
                handle_command(&service, command);
            }
        }
    }

    service.detach().await;
    info!("widget-link headless mode exiting");
    Ok(())
}

/// Run a command in the background; its outcome is emitted when it lands.
fn handle_command(service: &Arc<Service>, command: StdinCommand) {
    let service = Arc::clone(service);
    match command {
        StdinCommand::Tap {
            device_id,
            attr_key,
        } => {
            tokio::spawn(async move {
                let spec = ControlSpec {
                    control_id: attr_key.clone(),
                    attr_key: attr_key.clone(),
                    kind: ControlKind::Boolean,
                };
                let outcome = service.execute_control(&device_id, &spec).await;
                HeadlessEvent::control_result(&device_id, &attr_key, outcome).emit();
            });
        }
        StdinCommand::Scene { home_id, scene_id } => {
            tokio::spawn(async move {
                let outcome = service.execute_scene(home_id, scene_id).await;
                HeadlessEvent::scene_result(home_id, scene_id, outcome).emit();
            });
        }
        StdinCommand::Refresh => {
            tokio::spawn(async move { service.sync_devices().await });
        }
        StdinCommand::Quit => {}
    }
}

/// Read stdin lines into the command channel (blocking, own thread)
fn spawn_stdin_reader_blocking(cmd_tx: mpsc::Sender<StdinCommand>) {
    use std::io::BufRead;

    let stdin = std::io::stdin();
    let reader = stdin.lock();

    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to read stdin: {}", e);
                break;
            }
        };
        match parse_command(&line) {
            Some(Ok(command)) => {
                let quit = command == StdinCommand::Quit;
                if cmd_tx.blocking_send(command).is_err() || quit {
                    break;
                }
            }
            Some(Err(message)) => {
                warn!("Stdin: {}", message);
                HeadlessEvent::error(message, false).emit();
            }
            None => {}
        }
    }

    info!("Stdin reader exiting");
}
