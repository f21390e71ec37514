use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::Level;

use huddle_server::HuddleSettings;
use huddle_store::{Database, RoomStore, SqliteRoomStore};
use huddle_telemetry::{init_telemetry, LogFormat, TelemetryConfig};

/// Room presence and WebRTC signaling relay.
#[derive(Debug, Parser)]
#[command(name = "huddle", version)]
struct Args {
    /// JSON settings file, deep-merged over the defaults.
    #[arg(long, short)]
    config: Option<PathBuf>,

    #[arg(long)]
    host: Option<String>,

    #[arg(long, short)]
    port: Option<u16>,

    /// SQLite database path.
    #[arg(long)]
    db: Option<PathBuf>,

    /// `json` or `compact`.
    #[arg(long)]
    log_format: Option<String>,

    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn apply(self, settings: &mut HuddleSettings) {
        if let Some(host) = self.host {
            settings.server.host = host;
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(db) = self.db {
            settings.storage.database_path = db;
        }
        if let Some(format) = self.log_format {
            settings.logging.format = format;
        }
        if let Some(level) = self.log_level {
            settings.logging.level = level;
        }
    }
}

fn telemetry_config(settings: &HuddleSettings) -> anyhow::Result<TelemetryConfig> {
    let log_level: Level = settings
        .logging
        .level
        .parse()
        .with_context(|| format!("invalid log level {:?}", settings.logging.level))?;
    let format: LogFormat = settings.logging.format.parse()?;
    Ok(TelemetryConfig {
        log_level,
        format,
        ..Default::default()
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let mut settings =
        HuddleSettings::load(args.config.as_deref()).context("failed to load settings")?;
    args.apply(&mut settings);
    settings.validate()?;

    init_telemetry(&telemetry_config(&settings)?)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting huddle");

    let db = Database::open(&settings.storage.database_path).context("failed to open database")?;
    let store: Arc<dyn RoomStore> = Arc::new(SqliteRoomStore::new(db));

    let handle = huddle_server::start(settings, store)
        .await
        .context("failed to start server")?;
    tracing::info!(port = handle.port, "Huddle server ready");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;

    tracing::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
