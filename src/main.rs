//! Region Capture - Main entry point
//!
//! This binary runs the capture/dedup/route pipeline as a daemon.

use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use region_capture::{Config, ConfigOrigin, Mode, Orchestrator, ScreenSource};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration first so the log level can come from it; the load
    // outcome is logged below, once the subscriber exists
    let (config, origin) = Config::load();

    let level = match config.general.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let _subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .init();

    info!("Starting region capture pipeline");
    match &origin {
        ConfigOrigin::File(path) => info!("Loaded configuration from {:?}", path),
        ConfigOrigin::Missing(path) => {
            info!("No config file found at {:?}, using defaults", path)
        }
        ConfigOrigin::Invalid { path, error } => {
            warn!(
                "Failed to parse config file {:?}: {}, using defaults",
                path, error
            )
        }
    }

    if !config.general.enabled {
        info!("Pipeline is disabled in configuration, exiting");
        return Ok(());
    }

    let source = Box::new(ScreenSource::new());
    let mut orchestrator = Orchestrator::new(config, source).await;
    orchestrator.set_mode(Mode::Capturing);

    // Ctrl-C flips the pipeline into shutdown
    let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
    ctrlc::set_handler(move || {
        if stop_tx.send(true).is_err() {
            eprintln!("Shutdown already in progress");
        }
    })?;

    info!("Pipeline running, Ctrl-C to stop");

    while !*stop_rx.borrow() {
        if stop_rx.changed().await.is_err() {
            warn!("Signal handler dropped, shutting down");
            break;
        }
    }

    info!("Shutdown requested");
    orchestrator.shutdown().await;

    Ok(())
}
