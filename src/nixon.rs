use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use nixon::alert::{AlertLayer, AlertLog, DEFAULT_CAPACITY};
use nixon::command::{Command, HELP};
use nixon::{
    APP_NAME_PRETTY, Collaborators, ConfigManager, Controller, DEFAULT_LOG_LEVEL, EngineEvent,
    LOG_ENV, LogSink, MemoryStore, SharedSettings, SimEngine, StatusSnapshot, StatvfsMonitor,
    VERSION,
};
use nixon_graph::topology::VAD_ELEMENT;
use parking_lot::RwLock;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Everything a console command can act on.
struct Console {
    controller: Controller,
    engine: Arc<SimEngine>,
    settings: SharedSettings,
    config_manager: ConfigManager,
    alerts: AlertLog,
}

fn main() -> Result<()> {
    // Initialize the logger
    let alert_layer = AlertLayer::new(DEFAULT_CAPACITY);
    let alerts = alert_layer.log();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_LEVEL)),
        )
        .with_writer(io::stderr)
        .finish()
        .with(alert_layer)
        .init();

    // Load config, from the first argument if given
    let config_manager = match std::env::args().nth(1) {
        Some(path) => ConfigManager::with_path(path),
        None => ConfigManager::new()?,
    };
    let settings: SharedSettings = Arc::new(RwLock::new(config_manager.load()?));
    // save back the config to create the file if it doesn't exist
    config_manager.save(&settings.read())?;
    info!(path = %config_manager.config_path().display(), "config loaded");

    // Timers and status delivery run here
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(1)
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    let engine = Arc::new(SimEngine::new());
    let controller = Controller::new(
        Collaborators {
            engine: engine.clone(),
            settings: settings.clone(),
            store: Arc::new(MemoryStore::new()),
            sink: Arc::new(LogSink),
            disk: Arc::new(StatvfsMonitor),
        },
        runtime.handle().clone(),
    );

    if let Err(e) = controller.start() {
        error!(error = %e, "pipeline did not start");
    }
    info!(version = VERSION, "{APP_NAME_PRETTY} ready, type `help` for commands");

    let console = Console {
        controller,
        engine,
        settings,
        config_manager,
        alerts,
    };

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line.context("Failed to read stdin")?;
        if line.trim().is_empty() {
            continue;
        }
        match line.parse::<Command>() {
            Ok(Command::Quit) => break,
            Ok(command) => console.run(command),
            Err(e) => warn!("{e}"),
        }
        io::stdout().flush().ok();
    }

    console.controller.stop();
    runtime.shutdown_timeout(Duration::from_secs(1));
    info!("{APP_NAME_PRETTY} stopped");
    Ok(())
}

impl Console {
    fn run(&self, command: Command) {
        let result = match command {
            Command::Level(db) => {
                self.emit(EngineEvent::Level {
                    element: VAD_ELEMENT.to_string(),
                    rms_db: vec![db],
                });
                Ok(())
            }
            Command::Error(message) => {
                self.emit(EngineEvent::Error {
                    source: "console".to_string(),
                    message,
                    debug: None,
                });
                Ok(())
            }
            Command::Warn(message) => {
                self.emit(EngineEvent::Warning {
                    source: "console".to_string(),
                    message,
                });
                Ok(())
            }
            Command::EndOfStream => {
                self.emit(EngineEvent::EndOfStream);
                Ok(())
            }
            Command::Toggle(branch, enable) => self.controller.toggle_branch(branch, enable),
            Command::Record(true) => self.controller.start_recording(),
            Command::Record(false) => self.controller.stop_recording(),
            Command::Status => {
                print_status(&self.controller.snapshot());
                Ok(())
            }
            Command::Recordings => self.controller.list_recordings().map(|recordings| {
                if recordings.is_empty() {
                    println!("no recordings");
                }
                for r in recordings {
                    let duration = r
                        .duration
                        .map_or("recording".to_string(), |d| format!("{}s", d.as_secs()));
                    println!(
                        "{:>4}  {}  {}  {:>10}  {}  {}",
                        r.id,
                        r.start_time.format("%Y-%m-%d %H:%M:%S"),
                        r.filename,
                        duration,
                        r.genre,
                        r.notes
                    );
                }
            }),
            Command::Annotate { id, genre, notes } => {
                self.controller.annotate_recording(id, &notes, &genre)
            }
            Command::Delete(id) => self.controller.delete_recording(id),
            Command::Start => self.controller.start(),
            Command::Stop => {
                self.controller.stop();
                Ok(())
            }
            Command::Restart => self.controller.restart(),
            Command::Reload => {
                match self.config_manager.load() {
                    Ok(settings) => {
                        *self.settings.write() = settings;
                        info!("config reloaded");
                        self.controller.restart()
                    }
                    Err(e) => {
                        error!(error = %e, "config not reloaded");
                        Ok(())
                    }
                }
            }
            Command::Graph => {
                match self.controller.describe_graph() {
                    Some(description) => println!("{description}"),
                    None => println!("no live graph"),
                }
                Ok(())
            }
            Command::Alerts => {
                let alerts = self.alerts.recent();
                if alerts.is_empty() {
                    println!("no alerts");
                }
                for alert in alerts {
                    println!("{alert}");
                }
                Ok(())
            }
            Command::Help => {
                println!("{HELP}");
                Ok(())
            }
            Command::Quit => Ok(()),
        };

        if let Err(e) = result {
            warn!("{e}");
        }
    }

    fn emit(&self, event: EngineEvent) {
        if !self.engine.emit_latest(event) {
            warn!("no live graph to post the event to");
        }
    }
}

fn print_status(status: &StatusSnapshot) {
    let flag = |on: bool| if on { "on" } else { "off" };
    println!("pipeline   {}", status.pipeline_state);
    if status.restart_attempts > 0 {
        println!("restarts   {}", status.restart_attempts);
    }
    println!("recording  {}", flag(status.is_recording));
    if let Some(filename) = &status.current_recording_filename {
        println!("file       {filename}");
    }
    println!("stream a   {}", flag(status.is_streaming_a));
    println!("stream b   {}", flag(status.is_streaming_b));
    println!("voice      {}", flag(status.vad_active));
    if let Some(at) = status.last_vad_time {
        println!("last vad   {}", at.format("%H:%M:%S"));
    }
    if let Some(percent) = status.disk_usage_percent {
        println!("disk       {percent}% used");
    }
}
