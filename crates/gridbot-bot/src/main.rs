//! Grid trading bot entry point.

use anyhow::Result;
use clap::Parser;
use tracing::info;

use gridbot_bot::{init_logging, AppConfig, Application};

/// Multi-grid spot trading bot with risk supervision.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Configuration file path (also via GRIDBOT_CONFIG env var)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging()?;
    info!("Starting gridbot v{}", env!("CARGO_PKG_VERSION"));

    let config_path = args
        .config
        .or_else(|| std::env::var("GRIDBOT_CONFIG").ok());
    let config = match config_path {
        Some(path) => {
            info!(path = %path, "Loading configuration");
            AppConfig::from_file(&path)?
        }
        None => {
            info!("No config file given, using defaults");
            AppConfig::default()
        }
    };

    let app = Application::new(config).await?;
    app.run().await?;

    Ok(())
}
