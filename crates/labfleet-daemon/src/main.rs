//! Labfleet Daemon - Main entry point
//!
//! Loads the device inventory, starts one HTTPS server per instrument and
//! keeps them running until a termination signal or the watchdog ends the run.

mod api;
mod config;
mod logging;
mod power;
mod server;
mod state;
mod supervisor;
mod traffic;
mod watchdog;

use anyhow::Result;
use clap::{ArgAction, Parser};
use labfleet_core::{LogLevel, OptionOverrides};
use labfleet_registry::CapabilityRegistry;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::{error, info, warn};

use crate::config::{LaunchOptions, Settings};
use crate::power::{PowerControl, ShutdownCommand};
use crate::supervisor::Supervisor;
use crate::watchdog::Trigger;

#[derive(Parser, Debug)]
#[command(name = "labfleet")]
#[command(about = "Runs one device server per laboratory instrument")]
#[command(version, disable_version_flag = true)]
struct Args {
    /// Device inventory (JSON, `//` comment lines allowed)
    #[arg(short = 'c', long)]
    config_file: Option<PathBuf>,

    /// CETONI device configuration folder
    #[arg(long)]
    device_config: Option<PathBuf>,

    /// Address the device servers bind to
    #[arg(short = 'i', long)]
    server_ip: Option<IpAddr>,

    /// Port of the first server; later servers count up from here
    #[arg(short = 'p', long)]
    server_base_port: Option<u16>,

    /// Issue new certificates for every server
    #[arg(long)]
    regenerate_certificates: bool,

    /// Log level (debug, info, warning, error, critical)
    #[arg(short = 'l', long)]
    log_level: Option<LogLevel>,

    /// Also write daily log files into this directory
    #[arg(long)]
    log_file_dir: Option<PathBuf>,

    /// Look for attached instruments
    #[arg(long, overrides_with = "no_scan_devices")]
    scan_devices: bool,

    #[arg(long, overrides_with = "scan_devices")]
    no_scan_devices: bool,

    /// Simulate devices that cannot be reached
    #[arg(long, overrides_with = "no_simulate_missing")]
    simulate_missing: bool,

    #[arg(long, overrides_with = "simulate_missing")]
    no_simulate_missing: bool,

    /// Advertise the servers for discovery
    #[arg(long, overrides_with = "disable_discovery")]
    enable_discovery: bool,

    #[arg(long, overrides_with = "enable_discovery")]
    disable_discovery: bool,

    /// Directory for server records (default: user config dir)
    #[arg(long)]
    record_dir: Option<PathBuf>,

    /// Worker threads per device server
    #[arg(long)]
    workers: Option<usize>,

    /// Print version
    #[arg(short = 'v', long, action = ArgAction::Version)]
    version: Option<bool>,
}

/// `Some` only when one of the two flags was given
fn flag_pair(on: bool, off: bool) -> Option<bool> {
    match (on, off) {
        (true, _) => Some(true),
        (_, true) => Some(false),
        _ => None,
    }
}

impl Args {
    fn overrides(&self) -> OptionOverrides {
        OptionOverrides {
            server_ip: self.server_ip,
            server_base_port: self.server_base_port,
            enable_discovery: flag_pair(self.enable_discovery, self.disable_discovery),
            regenerate_certificates: self.regenerate_certificates.then_some(true),
            log_level: self.log_level,
            log_file_dir: self.log_file_dir.clone(),
            scan_devices: flag_pair(self.scan_devices, self.no_scan_devices),
            simulate_missing: flag_pair(self.simulate_missing, self.no_simulate_missing),
            device_config_path: self.device_config.clone(),
        }
    }

    fn launch(&self) -> LaunchOptions {
        LaunchOptions {
            config_file: self.config_file.clone(),
            record_dir: self.record_dir.clone(),
            workers: self.workers,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let registry = Arc::new(CapabilityRegistry::discover());
    let schema = registry.schema()?;
    let settings = Settings::load(&args.launch(), &args.overrides(), &schema)?;

    let options = &settings.inventory.options;
    let _log_guard = logging::init(options.log_level, options.log_file_dir.as_deref())?;

    info!("Labfleet v{}", env!("CARGO_PKG_VERSION"));
    info!(
        handlers = registry.handlers().len(),
        device_kinds = registry.supported_types().len(),
        "Device handlers installed"
    );

    // Signals that arrive during startup are acted on once start returns
    let signal = tokio::spawn(shutdown_signal());

    let supervisor = Supervisor::new(settings, registry);
    let report = match supervisor.start().await {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Fleet failed to start");
            signal.abort();
            supervisor.shutdown().await;
            return Err(e.into());
        }
    };
    for identity in &report.running {
        info!(server = %identity, "Serving");
    }
    if !report.failed.is_empty() {
        warn!(failed = ?report.failed, "Some servers did not start");
    }

    let trigger = tokio::select! {
        _ = signal => {
            info!("Termination signal received");
            None
        }
        trigger = watchdog_fired(report.watchdog) => Some(trigger),
    };

    supervisor.shutdown().await;

    if let Some(trigger) = trigger {
        warn!(trigger = %trigger, "Fleet stopped by watchdog");
        if let Err(e) = ShutdownCommand.power_off().await {
            error!(error = %e, "Host power-off failed");
        }
    }
    Ok(())
}

/// Resolves with the watchdog trigger; never resolves without a watchdog
async fn watchdog_fired(receiver: Option<oneshot::Receiver<Trigger>>) -> Trigger {
    if let Some(receiver) = receiver {
        if let Ok(trigger) = receiver.await {
            return trigger;
        }
    }
    std::future::pending().await
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
