use std::env;
use std::sync::Arc;
use std::time::Duration;

use dpm_control::bus::RtuLink;
use dpm_control::config::EngineConfig;
use dpm_control::notify::TracingNotifier;
use dpm_control::persistence::JsonFileStore;
use dpm_control::scheduler::Scheduler;
use dpm_control::serial::HostPort;
use inquire::Select;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

// Where operator settings survive restarts.
const SETTINGS_PATH: &str = "dpm-settings.json";
const SNAPSHOT_PERIOD: Duration = Duration::from_secs(5);

/// Usage: `serial [PORT] [CONFIG.json]`
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Serial port from the command line, or pick one interactively.
    let port_name = match env::args().nth(1) {
        Some(name) => name,
        None => {
            let ports = serialport::available_ports()?;
            if ports.is_empty() {
                return Err("no serial ports found".into());
            }
            let names: Vec<String> = ports.into_iter().map(|p| p.port_name).collect();
            Select::new("Select a serial port:", names).prompt()?
        }
    };

    let config = match env::args().nth(2) {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    let port = HostPort::open(&port_name, config.transaction_timeout())?;
    info!(port = %port_name, "serial port open");

    let handle = Scheduler::spawn(
        RtuLink::new(port),
        config,
        Arc::new(TracingNotifier),
        Arc::new(JsonFileStore::new(SETTINGS_PATH)),
    )?;

    let snapshots = handle.snapshots();
    let mut ticker = tokio::time::interval(SNAPSHOT_PERIOD);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let snapshot = snapshots.borrow().clone();
                match serde_json::to_string_pretty(&snapshot) {
                    Ok(json) => println!("{json}"),
                    Err(e) => warn!(error = %e, "snapshot not serializable"),
                }
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}
