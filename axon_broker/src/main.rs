use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;

use axon_broker::{logger, run, BrokerError};
use axon_core::BrokerConfig;

// Exit codes: 0 clean shutdown, each failure class distinct so supervisors
// can tell a bad config from an exhausted machine.
const EXIT_ABNORMAL: u8 = 1;
const EXIT_SEGMENT_ALLOCATION: u8 = 2;
const EXIT_CONFIG: u8 = 3;

#[derive(Parser)]
#[command(name = "axond")]
#[command(about = "AXON broker: shared-memory provisioning and discovery")]
#[command(version)]
struct Cli {
    /// Path to the TOML configuration (defaults are used when omitted)
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Override the control socket path
    #[arg(short = 's', long = "socket")]
    socket: Option<PathBuf>,

    /// Show debug messages
    #[arg(short = 'v', long = "verbose")]
    verbose: bool,
}

fn load_config(cli: &Cli) -> Result<BrokerConfig, BrokerError> {
    let mut cfg = match &cli.config {
        Some(path) => {
            let text = std::fs::read_to_string(path).map_err(|e| {
                BrokerError::Config(format!("cannot read {}: {e}", path.display()))
            })?;
            toml::from_str(&text)
                .map_err(|e| BrokerError::Config(format!("{}: {e}", path.display())))?
        }
        None => BrokerConfig::default(),
    };
    if let Some(socket) = &cli.socket {
        cfg.control_socket = Some(socket.clone());
    }
    Ok(cfg)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    logger::init(cli.verbose);

    let cfg = match load_config(&cli) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("{} {e}", "axond:".red().bold());
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let shutdown = Arc::clone(&shutdown);
        if let Err(e) = ctrlc::set_handler(move || {
            shutdown.store(true, Ordering::Release);
        }) {
            eprintln!("{} cannot install signal handler: {e}", "axond:".red().bold());
            return ExitCode::from(EXIT_ABNORMAL);
        }
    }

    eprintln!(
        "{} {}",
        "AXON".bold(),
        format!("broker v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );

    match run(cfg, shutdown) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e @ BrokerError::Config(_)) => {
            log::error!("{e}");
            ExitCode::from(EXIT_CONFIG)
        }
        Err(e @ BrokerError::SegmentAllocation(_)) => {
            log::error!("{e}");
            ExitCode::from(EXIT_SEGMENT_ALLOCATION)
        }
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(EXIT_ABNORMAL)
        }
    }
}
