//! Device configuration and runtime settings
//!
//! Two kinds of configuration exist:
//!
//! - [`DeviceConfig`] is the record the device owns: its slave address and
//!   the load balancer parameters. It is edited through the holding
//!   registers and persisted through a [`ConfigStore`].
//! - [`AdapterSettings`] describe the host: serial ports, the charger's
//!   address, timeouts and logging. They are read once from a YAML file.

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::error::{ModbusError, ModbusResult};
use crate::loadbalancer::LoadBalancerConfig;
use crate::logging::LoggingMode;
use crate::protocol::{crc16, SlaveId};

/// Persisted device record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Own slave address; 0 makes the device a pure pass-through
    pub address: SlaveId,
    pub load_balancer: LoadBalancerConfig,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            address: 10,
            load_balancer: LoadBalancerConfig::default(),
        }
    }
}

impl DeviceConfig {
    pub fn validate(&self) -> ModbusResult<()> {
        if self.address > crate::MAX_SLAVE_ID {
            return Err(ModbusError::configuration(format!(
                "slave address must be 0-{}, got {}",
                crate::MAX_SLAVE_ID,
                self.address
            )));
        }
        self.load_balancer.validate()
    }
}

/// Non-volatile storage of the device record
pub trait ConfigStore: Send {
    /// Load the stored record, falling back to factory defaults
    fn load(&mut self) -> ModbusResult<DeviceConfig>;

    fn save(&mut self, config: &DeviceConfig) -> ModbusResult<()>;

    /// Replace the stored record with factory defaults
    fn factory_reset(&mut self) -> ModbusResult<DeviceConfig> {
        let config = DeviceConfig::default();
        self.save(&config)?;
        Ok(config)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    config: DeviceConfig,
    crc: u16,
}

/// JSON file with a CRC16 over the serialised record
#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read(&self) -> ModbusResult<DeviceConfig> {
        let text = fs::read_to_string(&self.path)?;
        let record: StoredRecord = serde_json::from_str(&text)?;
        let body = serde_json::to_vec(&record.config)?;
        let expected = crc16(&body);
        if expected != record.crc {
            return Err(ModbusError::crc_mismatch(expected, record.crc));
        }
        Ok(record.config)
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&mut self) -> ModbusResult<DeviceConfig> {
        if !self.path.exists() {
            info!("No configuration at {}, writing factory defaults", self.path.display());
            return self.factory_reset();
        }

        match self.read() {
            Ok(config) => {
                info!("📋 Loaded configuration from {}", self.path.display());
                Ok(config)
            }
            Err(e) => {
                warn!(
                    "Configuration at {} is invalid ({}), restoring factory defaults",
                    self.path.display(),
                    e
                );
                self.factory_reset()
            }
        }
    }

    fn save(&mut self, config: &DeviceConfig) -> ModbusResult<()> {
        let body = serde_json::to_vec(config)?;
        let record = StoredRecord {
            config: config.clone(),
            crc: crc16(&body),
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(&self.path, serde_json::to_string_pretty(&record)?)?;
        info!("💾 Saved configuration to {}", self.path.display());
        Ok(())
    }
}

/// Store kept in memory; clones share the same record
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    record: Arc<Mutex<Option<DeviceConfig>>>,
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The saved record, if any
    pub fn saved(&self) -> Option<DeviceConfig> {
        self.record.lock().ok().and_then(|record| record.clone())
    }
}

impl ConfigStore for MemoryConfigStore {
    fn load(&mut self) -> ModbusResult<DeviceConfig> {
        match self.saved() {
            Some(config) => Ok(config),
            None => self.factory_reset(),
        }
    }

    fn save(&mut self, config: &DeviceConfig) -> ModbusResult<()> {
        let mut record = self
            .record
            .lock()
            .map_err(|_| ModbusError::internal("config store lock poisoned"))?;
        *record = Some(config.clone());
        Ok(())
    }
}

/// Serial port of one bus
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusSettings {
    pub port: String,
    pub baud_rate: u32,
}

/// Host settings loaded from YAML
///
/// ```yaml
/// charger_bus:
///   port: /dev/ttyUSB0
///   baud_rate: 9600
/// master_bus:
///   port: /dev/ttyACM0
///   baud_rate: 9600
/// meter_port: /dev/ttyUSB1
/// charger_address: 1
/// request_timeout_ms: 1000
/// logging_mode: interpreted
/// log_level: info
/// config_path: /var/lib/evse/config.json
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdapterSettings {
    /// RS-485 bus with the charger, this device is master
    pub charger_bus: BusSettings,
    /// Bus with the external master, this device is slave
    pub master_bus: BusSettings,
    /// P1 smart meter port, 115200 baud; none disables sampling
    pub meter_port: Option<String>,
    pub charger_address: SlaveId,
    pub request_timeout_ms: u64,
    pub logging_mode: LoggingMode,
    pub log_level: String,
    pub config_path: PathBuf,
}

impl Default for AdapterSettings {
    fn default() -> Self {
        Self {
            charger_bus: BusSettings {
                port: "/dev/ttyUSB0".to_string(),
                baud_rate: 9600,
            },
            master_bus: BusSettings {
                port: "/dev/ttyACM0".to_string(),
                baud_rate: 9600,
            },
            meter_port: None,
            charger_address: crate::charger::ABB_TERRA_AC_ADDRESS,
            request_timeout_ms: crate::DEFAULT_REQUEST_TIMEOUT_MS,
            logging_mode: LoggingMode::default(),
            log_level: "info".to_string(),
            config_path: PathBuf::from("evse-config.json"),
        }
    }
}

impl AdapterSettings {
    pub fn from_yaml_str(yaml: &str) -> ModbusResult<Self> {
        let settings: Self = serde_yaml::from_str(yaml)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> ModbusResult<Self> {
        let text = fs::read_to_string(path.as_ref()).map_err(|e| {
            ModbusError::configuration(format!(
                "Cannot read settings {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> ModbusResult<()> {
        crate::utils::validation::validate_slave_id(self.charger_address)?;
        if self.request_timeout_ms == 0 {
            return Err(ModbusError::configuration("request_timeout_ms must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("evse-{}-{}.json", name, std::process::id()))
    }

    #[test]
    fn test_factory_defaults() {
        let config = DeviceConfig::default();
        assert_eq!(config.address, 10);
        assert_eq!(config.load_balancer.charger_limit, 16000);
        assert_eq!(config.load_balancer.number_of_phases, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_file_store_round_trip() {
        let path = temp_path("round-trip");
        let _ = fs::remove_file(&path);
        let mut store = FileConfigStore::new(&path);

        assert_eq!(store.load().unwrap(), DeviceConfig::default());
        assert!(path.exists());

        let mut config = DeviceConfig::default();
        config.address = 12;
        config.load_balancer.charger_limit = 10000;
        store.save(&config).unwrap();
        assert_eq!(FileConfigStore::new(&path).load().unwrap(), config);

        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_file_store_rejects_tampered_record() {
        let path = temp_path("tampered");
        let mut store = FileConfigStore::new(&path);
        let mut config = DeviceConfig::default();
        config.address = 33;
        store.save(&config).unwrap();

        let mut record: StoredRecord = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let crc = record.crc;
        record.config.address = 34;
        fs::write(&path, serde_json::to_string_pretty(&record).unwrap()).unwrap();

        let stored: StoredRecord = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(stored.crc, crc);
        assert_eq!(stored.config.address, 34);

        assert_eq!(store.load().unwrap(), DeviceConfig::default());
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_memory_store() {
        let mut store = MemoryConfigStore::new();
        let handle = store.clone();
        assert!(handle.saved().is_none());

        let config = store.load().unwrap();
        assert_eq!(handle.saved(), Some(config));
    }

    #[test]
    fn test_settings_from_yaml() {
        let yaml = r#"
charger_bus:
  port: /dev/ttyS1
  baud_rate: 19200
charger_address: 2
logging_mode: both
"#;
        let settings = AdapterSettings::from_yaml_str(yaml).unwrap();
        assert_eq!(settings.charger_bus.port, "/dev/ttyS1");
        assert_eq!(settings.charger_bus.baud_rate, 19200);
        assert_eq!(settings.charger_address, 2);
        assert_eq!(settings.logging_mode, LoggingMode::Both);
        assert_eq!(settings.request_timeout_ms, 1000);
        assert_eq!(settings.master_bus, AdapterSettings::default().master_bus);
    }

    #[test]
    fn test_settings_validation() {
        assert!(AdapterSettings::from_yaml_str("charger_address: 0").is_err());
        assert!(AdapterSettings::from_yaml_str("request_timeout_ms: 0").is_err());
        assert!(AdapterSettings::from_yaml_str("charger_bus: [").is_err());
    }
}
