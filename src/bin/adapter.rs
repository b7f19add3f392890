//! EVSE load balancing adapter
//!
//! Usage: `evse-adapter [settings.yaml]`
//!
//! Without a settings file the defaults of `AdapterSettings` are used.

use anyhow::{Context, Result};
use log::{info, warn};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::signal;
use tokio::sync::mpsc;
use tokio::time::sleep;

use evse_loadbalancer::adapter::Adapter;
use evse_loadbalancer::config::{AdapterSettings, ConfigStore, FileConfigStore};
use evse_loadbalancer::meter::spawn_p1_reader;
use evse_loadbalancer::registers::{Controller, DeviceCommand};
use evse_loadbalancer::transport::{rx_channel, Clock, MonotonicClock, SerialLink, SerialSettings};
use evse_loadbalancer::utils::format::format_duration;
use evse_loadbalancer::{logging, BusLink, ModbusError, RtuClient, RtuServer, TransportStats};

const RX_QUEUE_CAPACITY: usize = 1024;

/// Pause before another attempt when a restart cannot open its devices
const RESTART_RETRY_DELAY: Duration = Duration::from_secs(5);

enum Exit {
    Command(DeviceCommand),
    Shutdown,
}

fn load_settings() -> Result<AdapterSettings> {
    match std::env::args().nth(1) {
        Some(path) => AdapterSettings::from_yaml_file(&path)
            .with_context(|| format!("loading settings from {}", path)),
        None => Ok(AdapterSettings::default()),
    }
}

/// Open the buses, run until a device command or Ctrl-C
async fn run_once(settings: &AdapterSettings, clock: Arc<dyn Clock>) -> Result<Exit> {
    let mut store = FileConfigStore::new(&settings.config_path);
    let config = store.load().context("loading device configuration")?;

    let (master_tx, master_rx) = rx_channel(RX_QUEUE_CAPACITY);
    let master_link = SerialLink::open(
        "master",
        &SerialSettings::new(&settings.master_bus.port, settings.master_bus.baud_rate),
        clock.clone(),
        master_tx,
    )
    .context("opening the master bus")?;

    let (charger_tx, charger_rx) = rx_channel(RX_QUEUE_CAPACITY);
    let charger_link = SerialLink::open(
        "charger",
        &SerialSettings::new(&settings.charger_bus.port, settings.charger_bus.baud_rate),
        clock.clone(),
        charger_tx,
    )
    .context("opening the charger bus")?;

    let mut server = RtuServer::new(config.address, master_link, master_rx);
    server.set_logging_mode(settings.logging_mode);
    let mut client = RtuClient::new(charger_link, charger_rx);
    client.set_timeout_ms(settings.request_timeout_ms);
    client.set_logging_mode(settings.logging_mode);

    let controller = Controller::new(&config, Box::new(store));
    let mut adapter = Adapter::new(server, client, controller, settings.charger_address);

    let meter = match &settings.meter_port {
        Some(port) => {
            let (tx, rx) = mpsc::channel(32);
            let handle = spawn_p1_reader(port, clock.clone(), tx).context("opening the meter port")?;
            adapter = adapter.with_samples(rx);
            Some(handle)
        }
        None => {
            warn!("No meter port configured, grid samples will not arrive");
            None
        }
    };

    let started = Instant::now();
    let exit = tokio::select! {
        command = adapter.run(clock.as_ref()) => Exit::Command(command),
        _ = signal::ctrl_c() => Exit::Shutdown,
    };

    info!("Ran for {}", format_duration(started.elapsed()));
    let stats = adapter.server().stats();
    info!(
        "📊 Server: {} frames, {} responses, {} exceptions, {} forwarded, {} CRC errors",
        stats.frames_received,
        stats.responses_sent,
        stats.exceptions_sent,
        stats.frames_forwarded,
        stats.crc_errors
    );
    let stats = adapter.client().stats();
    info!(
        "📊 Client: {} requests, {} responses, {} timeouts, {} exceptions",
        stats.requests_sent, stats.responses_received, stats.timeouts, stats.exceptions
    );
    log_transport("master", &adapter.server().link().stats());
    log_transport("charger", &adapter.client().link().stats());

    adapter.close().await;
    if let Some(handle) = meter {
        handle.abort();
        if let Err(e) = handle.await {
            if e.is_panic() {
                warn!("Meter reader panicked");
            }
        }
    }

    Ok(exit)
}

fn log_transport(bus: &str, stats: &TransportStats) {
    info!(
        "📊 {} bus: {} frames / {} bytes sent, {} bytes received, {} errors, {} write timeouts",
        bus, stats.frames_sent, stats.bytes_sent, stats.bytes_received, stats.errors, stats.timeouts
    );
}

/// Whether a failed start can be retried
fn is_recoverable(err: &anyhow::Error) -> bool {
    err.downcast_ref::<ModbusError>()
        .is_some_and(ModbusError::is_recoverable)
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = load_settings()?;
    logging::init(&settings.log_level);
    info!("{}", evse_loadbalancer::info());

    let clock: Arc<dyn Clock> = Arc::new(MonotonicClock::new());

    // Only a failed restart is retried
    let mut restarting = false;
    loop {
        let exit = match run_once(&settings, clock.clone()).await {
            Ok(exit) => exit,
            Err(e) if restarting && is_recoverable(&e) => {
                warn!(
                    "Restart failed: {:#}, retrying in {}",
                    e,
                    format_duration(RESTART_RETRY_DELAY)
                );
                tokio::select! {
                    _ = sleep(RESTART_RETRY_DELAY) => continue,
                    _ = signal::ctrl_c() => Exit::Shutdown,
                }
            }
            Err(e) => return Err(e),
        };

        match exit {
            Exit::Command(DeviceCommand::Restart) => {
                info!("🔄 Restarting with the stored configuration");
                restarting = true;
            }
            Exit::Shutdown => {
                info!("👋 Shutting down");
                return Ok(());
            }
        }
    }
}
