//! # EVSE Load Balancer - Modbus RTU Charger Adapter
//!
//! Keeps an EV charger's current draw within the limits of the grid
//! connection. Per-phase grid currents come from a P1 smart meter; the
//! allowed charger current is written to the charger over Modbus RTU.
//!
//! ## Features
//!
//! - **⚖️ Load Balancing**: hysteretic control loop with ratcheting ramps,
//!   an alarm state and a stale-data fallback
//! - **🔌 Modbus RTU Master**: 10-slot request queue, one request in flight,
//!   timeout recovery and write echo checks
//! - **🛰️ Modbus RTU Slave**: holding register table for status and
//!   configuration, exception responses
//! - **🔀 Transparent Gateway**: requests for other units are relayed to the
//!   charger bus and their responses returned verbatim
//! - **💾 Persistent Configuration**: CRC protected record, apply and factory
//!   reset through registers
//!
//! ## Supported Function Codes
//!
//! | Code | Function | Client | Server |
//! |------|----------|--------|--------|
//! | 0x01 | Read Coils | ✅ | ✅ |
//! | 0x02 | Read Discrete Inputs | ✅ | ✅ |
//! | 0x03 | Read Holding Registers | ✅ | ✅ |
//! | 0x04 | Read Input Registers | ✅ | ✅ |
//! | 0x05 | Write Single Coil | ✅ | ✅ |
//! | 0x06 | Write Single Register | ✅ | ✅ |
//! | 0x0F | Write Multiple Coils | ✅ | ✅ |
//! | 0x10 | Write Multiple Registers | ✅ | ✅ |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use evse_loadbalancer::adapter::Adapter;
//! use evse_loadbalancer::client::RtuClient;
//! use evse_loadbalancer::config::{ConfigStore, FileConfigStore};
//! use evse_loadbalancer::registers::Controller;
//! use evse_loadbalancer::server::RtuServer;
//! use evse_loadbalancer::transport::{rx_channel, MonotonicClock, SerialLink, SerialSettings};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> evse_loadbalancer::ModbusResult<()> {
//!     let mut store = FileConfigStore::new("evse-config.json");
//!     let config = store.load()?;
//!     let clock = Arc::new(MonotonicClock::new());
//!
//!     let (master_tx, master_rx) = rx_channel(1024);
//!     let master = SerialLink::open("master", &SerialSettings::new("/dev/ttyACM0", 9600), clock.clone(), master_tx)?;
//!     let (charger_tx, charger_rx) = rx_channel(1024);
//!     let charger = SerialLink::open("charger", &SerialSettings::new("/dev/ttyUSB0", 9600), clock.clone(), charger_tx)?;
//!
//!     let server = RtuServer::new(config.address, master, master_rx);
//!     let client = RtuClient::new(charger, charger_rx);
//!     let controller = Controller::new(&config, Box::new(store));
//!
//!     let mut adapter = Adapter::new(server, client, controller, 1);
//!     let command = adapter.run(clock.as_ref()).await;
//!     println!("{:?}", command);
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │  Modbus Server  │───►│     Adapter     │◄───│   P1 Meter      │
//! │  (master bus)   │◄───│   (run loop)    │    │   (samples)     │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!          │                 │          │
//! ┌─────────────────┐    ┌─────────────────┐    ┌─────────────────┐
//! │   Controller    │───►│  Load Balancer  │───►│  Modbus Client  │
//! │   (registers)   │    │   (control)     │    │  (charger bus)  │
//! └─────────────────┘    └─────────────────┘    └─────────────────┘
//!          │                                             │
//! ┌─────────────────┐                           ┌─────────────────┐
//! │  Config Store   │                           │   Transport     │
//! │  (persistence)  │                           │  (serial/fake)  │
//! └─────────────────┘                           └─────────────────┘
//! ```

/// Core error types and result handling
pub mod error;

/// Modbus RTU framing, function and exception codes
pub mod protocol;

/// Bus links, receive queues and the clock
pub mod transport;

/// Modbus RTU master engine
pub mod client;

/// Modbus RTU slave engine
pub mod server;

/// Grid load balancing control loop
pub mod loadbalancer;

/// Holding register table
pub mod registers;

/// Device configuration and host settings
pub mod config;

/// Charger specific limit writers
pub mod charger;

/// P1 smart meter reader
pub mod meter;

/// Run loop wiring all components
pub mod adapter;

/// Validation and formatting helpers
pub mod utils;

/// Logger setup and frame logging
pub mod logging;

// Re-export main types for convenience
pub use adapter::Adapter;
pub use client::{ClientObserver, ClientStatus, RtuClient};
pub use config::{AdapterSettings, ConfigStore, DeviceConfig, FileConfigStore};
pub use error::{ModbusError, ModbusResult};
pub use loadbalancer::{LbState, LoadBalancer, LoadBalancerConfig, Phase};
pub use logging::LoggingMode;
pub use protocol::{ModbusException, ModbusFunction, RtuFrame};
pub use registers::{Controller, DeviceCommand};
pub use server::{RegisterHandler, RtuServer, ServerStats};
pub use transport::{BusLink, TransportStats};

/// Maximum Modbus RTU frame size
pub const MAX_RTU_FRAME_SIZE: usize = 256;

/// Highest unicast slave address
pub const MAX_SLAVE_ID: u8 = 247;

/// Maximum number of coils or inputs in one read
pub const MAX_READ_BITS: u16 = 2000;

/// Maximum number of registers in one read
pub const MAX_READ_REGISTERS: u16 = 125;

/// Maximum number of coils in one write
pub const MAX_WRITE_BITS: u16 = 1968;

/// Maximum number of registers in one write
pub const MAX_WRITE_REGISTERS: u16 = 123;

/// Number of request slots of the client
pub const CLIENT_QUEUE_SIZE: usize = 10;

/// Gap between bytes after which the server drops a partial frame
pub const SERVER_RECEIVE_TIMEOUT_MS: u64 = 100;

/// Default client request timeout
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 1000;

/// Load balancer check interval
pub const CHECK_INTERVAL_MS: u64 = 1000;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Get library information
pub fn info() -> String {
    format!("EVSE Load Balancer v{} - Modbus RTU charger adapter", VERSION)
}
