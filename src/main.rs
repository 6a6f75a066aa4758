use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::info;

use lidar_modectl::logging::init_logging;
use lidar_modectl::{Config, LidarMode, Session, SessionError, SimulatedLink};

#[derive(Parser, Debug)]
#[command(name = "lidar-modectl", about = "Discover a LiDAR and switch its operating mode")]
struct Args {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Only connect to this broadcast code (repeatable)
    #[arg(short, long = "broadcast-code")]
    broadcast_code: Vec<String>,
    /// Apply this mode once and exit instead of prompting
    #[arg(short, long, value_enum)]
    mode: Option<LidarMode>,
    /// Seconds to wait for devices to connect after discovery starts
    #[arg(long)]
    discovery_window: Option<u64>,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

fn main() {
    // The process always exits 0; failures are reported on stderr.
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    let level = init_logging(args.log_level.as_deref());
    info!("log level {}", level);

    let config = match &args.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    let mut session_config = config.session_config();
    if !args.broadcast_code.is_empty() {
        session_config.allow_list = args.broadcast_code;
    }
    if let Some(secs) = args.discovery_window {
        session_config.discovery_window = Duration::from_secs(secs);
    }
    session_config.target_mode = args.mode;

    let link = Arc::new(SimulatedLink::new(config.simulator));
    let session = Session::new(link, session_config);

    match session.run(&mut io::stdin().lock(), &mut io::stdout()) {
        Ok(report) => {
            info!(
                "session finished on handle {} after {} mode change(s)",
                report.handle, report.mode_changes
            );
            Ok(())
        }
        Err(e) if e.no_device() => {
            info!("giving up: {}", e);
            Ok(())
        }
        Err(SessionError::LinkInit(e)) => {
            Err(anyhow::Error::new(e).context("lidar link unavailable"))
        }
        Err(e) => Err(e.into()),
    }
}
