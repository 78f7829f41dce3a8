mod app;
mod event;

use clap::Parser;
use clinic_sync::{config, logging};
use color_eyre::Result;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "clinic-sync")]
#[command(about = "Keeps clinic dashboard views in sync with the backend")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/clinic-sync/config.yaml)
  #[arg(short, long)]
  config: Option<PathBuf>,

  /// Backend base URL, overriding the config file
  #[arg(short, long)]
  backend: Option<String>,

  /// Directory for log files (default: $XDG_DATA_HOME/clinic-sync/logs)
  #[arg(long)]
  log_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Load configuration
  let mut config = config::Config::load(args.config.as_deref())?;

  // Override backend if specified on command line
  if let Some(url) = args.backend {
    config.backend.url = url;
  }

  let _log_guard = logging::init(args.log_dir.as_deref())?;

  let mut app = app::App::new(config)?;
  app.run().await?;

  Ok(())
}
