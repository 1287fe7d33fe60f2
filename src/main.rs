//! Paste Server - lifecycle-managed backend for a paste and image host
//!
//! This is the main entry point for the paste-server application.

use tracing::{error, info, warn};

use paste_server::{config::Config, DrainOutcome, Lifecycle, OsSignals};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::parse();

    // Initialize tracing with appropriate log level
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        format!("paste_server={},tower_http=info", config.log_level()).into()
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting paste-server v{}", env!("CARGO_PKG_VERSION"));

    let settings = match config.load_settings() {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            std::process::exit(1);
        }
    };
    info!(
        address = %settings.server.address(),
        upload_dir = %settings.storage.upload_dir.display(),
        reap_interval_secs = settings.reaper.interval_secs,
        "Configuration loaded"
    );

    let mut lifecycle = Lifecycle::new();
    if let Err(e) = lifecycle.initialize(&settings).await {
        error!("{}", e);
        std::process::exit(1);
    }

    // Register before serving so an early signal is not lost
    let mut signals = OsSignals::new()?;

    let exit = lifecycle.run(&mut signals).await?;
    info!("Shutdown Server ...");

    let report = lifecycle.shutdown().await?;
    if report.drain == DrainOutcome::Forced {
        warn!("Request server did not drain before the deadline");
    }

    if let Some(e) = &report.server_error {
        error!("Exiting after server failure: {}", e);
    }

    info!(?exit, "Server shutdown complete");
    let code = report.exit_code();
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
