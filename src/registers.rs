//! Holding register table exposed to the external master
//!
//! | Register | Access | Content |
//! |----------|--------|---------|
//! | 1000 | RW | charger limit override (mA) |
//! | 1001 | R  | computed charger limit (mA) |
//! | 1002 | R  | load balancer state |
//! | 1003 | RW | system error bits, write 0 to clear |
//! | 1004-1006 | R | grid current L1-L3 (mA) |
//! | 1007 | R  | grid sample age (s) |
//! | 1010 | RW | charger limit |
//! | 1011 | RW | number of phases (1-3) |
//! | 1012-1014 | RW | alarm limit, wait time, change amount |
//! | 1015-1017 | RW | upper limit, wait time, change amount |
//! | 1018-1020 | RW | lower limit, wait time, change amount |
//! | 1021-1022 | RW | fallback limit, wait time |
//! | 1099 | RW | slave address, effective after apply |
//! | 1100 | W  | write 1 to save the configuration and restart |
//! | 1101 | W  | write 1 to restore factory defaults and restart |
//!
//! Configuration writes reach the running load balancer immediately. They
//! only survive a restart once applied.

use log::{debug, error, info, warn};

use crate::client::ClientStatus;
use crate::config::{ConfigStore, DeviceConfig};
use crate::loadbalancer::{LoadBalancer, Phase};
use crate::protocol::{ModbusException, SlaveId};
use crate::server::RegisterHandler;

pub const REG_CHARGER_LIMIT_OVERRIDE: u16 = 1000;
pub const REG_CURRENT_LIMIT: u16 = 1001;
pub const REG_LB_STATE: u16 = 1002;
pub const REG_SYSTEM_ERROR: u16 = 1003;
pub const REG_GRID_CURRENT_L1: u16 = 1004;
pub const REG_GRID_CURRENT_L2: u16 = 1005;
pub const REG_GRID_CURRENT_L3: u16 = 1006;
pub const REG_GRID_CURRENT_AGE: u16 = 1007;
pub const REG_CONFIG_CHARGER_LIMIT: u16 = 1010;
pub const REG_CONFIG_NUMBER_OF_PHASES: u16 = 1011;
pub const REG_CONFIG_ALARM_LIMIT: u16 = 1012;
pub const REG_CONFIG_ALARM_LIMIT_WAIT_TIME: u16 = 1013;
pub const REG_CONFIG_ALARM_LIMIT_CHANGE_AMOUNT: u16 = 1014;
pub const REG_CONFIG_UPPER_LIMIT: u16 = 1015;
pub const REG_CONFIG_UPPER_LIMIT_WAIT_TIME: u16 = 1016;
pub const REG_CONFIG_UPPER_LIMIT_CHANGE_AMOUNT: u16 = 1017;
pub const REG_CONFIG_LOWER_LIMIT: u16 = 1018;
pub const REG_CONFIG_LOWER_LIMIT_WAIT_TIME: u16 = 1019;
pub const REG_CONFIG_LOWER_LIMIT_CHANGE_AMOUNT: u16 = 1020;
pub const REG_CONFIG_FALLBACK_LIMIT: u16 = 1021;
pub const REG_CONFIG_FALLBACK_LIMIT_WAIT_TIME: u16 = 1022;
pub const REG_CONFIG_ADDRESS: u16 = 1099;
pub const REG_CONFIG_APPLY: u16 = 1100;
pub const REG_CONFIG_FACTORY_RESET: u16 = 1101;

/// Request raised through the register table for the owner of the run loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Configuration was committed, re-initialise from the store
    Restart,
}

/// Register table over the load balancer and the device configuration
pub struct Controller {
    load_balancer: LoadBalancer,
    address: SlaveId,
    store: Box<dyn ConfigStore>,
    system_error: u16,
    command: Option<DeviceCommand>,
}

impl Controller {
    pub fn new(config: &DeviceConfig, store: Box<dyn ConfigStore>) -> Self {
        Self {
            load_balancer: LoadBalancer::new(config.load_balancer.clone()),
            address: config.address,
            store,
            system_error: 0,
            command: None,
        }
    }

    pub fn load_balancer(&self) -> &LoadBalancer {
        &self.load_balancer
    }

    pub fn load_balancer_mut(&mut self) -> &mut LoadBalancer {
        &mut self.load_balancer
    }

    /// Address written to the table, not yet applied
    pub fn pending_address(&self) -> SlaveId {
        self.address
    }

    /// Configuration as it would be persisted now
    pub fn device_config(&self) -> DeviceConfig {
        DeviceConfig {
            address: self.address,
            load_balancer: self.load_balancer.config().clone(),
        }
    }

    pub fn system_error(&self) -> u16 {
        self.system_error
    }

    /// Fold a charger bus status into the system error register
    pub fn record_client_status(&mut self, status: ClientStatus) {
        self.system_error |= status.code() as u16;
    }

    /// Pending device command, cleared on read
    pub fn take_command(&mut self) -> Option<DeviceCommand> {
        self.command.take()
    }

    fn read_register(&self, reg: u16) -> Result<u16, ModbusException> {
        let lb = &self.load_balancer;
        let cfg = lb.config();
        let value = match reg {
            REG_CHARGER_LIMIT_OVERRIDE => lb.charger_limit_override(),
            REG_CURRENT_LIMIT => lb.limit(),
            REG_LB_STATE => lb.state().to_u16(),
            REG_SYSTEM_ERROR => self.system_error,
            REG_GRID_CURRENT_L1 => lb.grid_current(Phase::L1),
            REG_GRID_CURRENT_L2 => lb.grid_current(Phase::L2),
            REG_GRID_CURRENT_L3 => lb.grid_current(Phase::L3),
            REG_GRID_CURRENT_AGE => lb.grid_current_age() as u16,
            REG_CONFIG_CHARGER_LIMIT => cfg.charger_limit,
            REG_CONFIG_NUMBER_OF_PHASES => cfg.number_of_phases as u16,
            REG_CONFIG_ALARM_LIMIT => cfg.alarm_limit,
            REG_CONFIG_ALARM_LIMIT_WAIT_TIME => cfg.alarm_limit_wait_time as u16,
            REG_CONFIG_ALARM_LIMIT_CHANGE_AMOUNT => cfg.alarm_limit_change_amount,
            REG_CONFIG_UPPER_LIMIT => cfg.upper_limit,
            REG_CONFIG_UPPER_LIMIT_WAIT_TIME => cfg.upper_limit_wait_time as u16,
            REG_CONFIG_UPPER_LIMIT_CHANGE_AMOUNT => cfg.upper_limit_change_amount,
            REG_CONFIG_LOWER_LIMIT => cfg.lower_limit,
            REG_CONFIG_LOWER_LIMIT_WAIT_TIME => cfg.lower_limit_wait_time as u16,
            REG_CONFIG_LOWER_LIMIT_CHANGE_AMOUNT => cfg.lower_limit_change_amount,
            REG_CONFIG_FALLBACK_LIMIT => cfg.fallback_limit,
            REG_CONFIG_FALLBACK_LIMIT_WAIT_TIME => cfg.fallback_limit_wait_time as u16,
            REG_CONFIG_ADDRESS => self.address as u16,
            _ => return Err(ModbusException::IllegalDataAddress),
        };
        Ok(value)
    }

    fn write_register(&mut self, reg: u16, value: u16) -> Result<(), ModbusException> {
        match reg {
            REG_CHARGER_LIMIT_OVERRIDE => {
                self.load_balancer.set_charger_limit_override(value);
            }
            REG_SYSTEM_ERROR => {
                if value != 0 {
                    return Err(ModbusException::IllegalDataValue);
                }
                self.system_error = 0;
            }
            REG_CONFIG_CHARGER_LIMIT => self.load_balancer.config_mut().charger_limit = value,
            REG_CONFIG_NUMBER_OF_PHASES => {
                if !(1..=3).contains(&value) {
                    return Err(ModbusException::IllegalDataValue);
                }
                self.load_balancer.config_mut().number_of_phases = value as u8;
            }
            REG_CONFIG_ALARM_LIMIT => self.load_balancer.config_mut().alarm_limit = value,
            REG_CONFIG_ALARM_LIMIT_WAIT_TIME => {
                self.load_balancer.config_mut().alarm_limit_wait_time = wait_time(value)?;
            }
            REG_CONFIG_ALARM_LIMIT_CHANGE_AMOUNT => {
                self.load_balancer.config_mut().alarm_limit_change_amount = value;
            }
            REG_CONFIG_UPPER_LIMIT => self.load_balancer.config_mut().upper_limit = value,
            REG_CONFIG_UPPER_LIMIT_WAIT_TIME => {
                self.load_balancer.config_mut().upper_limit_wait_time = wait_time(value)?;
            }
            REG_CONFIG_UPPER_LIMIT_CHANGE_AMOUNT => {
                self.load_balancer.config_mut().upper_limit_change_amount = value;
            }
            REG_CONFIG_LOWER_LIMIT => self.load_balancer.config_mut().lower_limit = value,
            REG_CONFIG_LOWER_LIMIT_WAIT_TIME => {
                self.load_balancer.config_mut().lower_limit_wait_time = wait_time(value)?;
            }
            REG_CONFIG_LOWER_LIMIT_CHANGE_AMOUNT => {
                self.load_balancer.config_mut().lower_limit_change_amount = value;
            }
            REG_CONFIG_FALLBACK_LIMIT => self.load_balancer.config_mut().fallback_limit = value,
            REG_CONFIG_FALLBACK_LIMIT_WAIT_TIME => {
                self.load_balancer.config_mut().fallback_limit_wait_time = wait_time(value)?;
            }
            REG_CONFIG_ADDRESS => {
                if value > crate::MAX_SLAVE_ID as u16 {
                    return Err(ModbusException::IllegalDataValue);
                }
                self.address = value as SlaveId;
            }
            REG_CONFIG_APPLY => {
                if value != 1 {
                    return Err(ModbusException::IllegalDataValue);
                }
                self.apply()?;
            }
            REG_CONFIG_FACTORY_RESET => {
                if value != 1 {
                    return Err(ModbusException::IllegalDataValue);
                }
                self.factory_reset()?;
            }
            _ => return Err(ModbusException::IllegalDataAddress),
        }
        debug!("Register {} <- {}", reg, value);
        Ok(())
    }

    fn apply(&mut self) -> Result<(), ModbusException> {
        let config = self.device_config();
        if let Err(e) = config.validate() {
            warn!("Refusing to apply configuration: {}", e);
            return Err(ModbusException::IllegalDataValue);
        }
        self.store.save(&config).map_err(|e| {
            error!("Saving configuration failed: {}", e);
            ModbusException::ServerDeviceFailure
        })?;
        info!("✅ Configuration applied, restart requested");
        self.command = Some(DeviceCommand::Restart);
        Ok(())
    }

    fn factory_reset(&mut self) -> Result<(), ModbusException> {
        self.store.factory_reset().map_err(|e| {
            error!("Factory reset failed: {}", e);
            ModbusException::ServerDeviceFailure
        })?;
        info!("🔄 Factory defaults restored, restart requested");
        self.command = Some(DeviceCommand::Restart);
        Ok(())
    }
}

fn wait_time(value: u16) -> Result<u8, ModbusException> {
    if value >= u8::MAX as u16 {
        return Err(ModbusException::IllegalDataValue);
    }
    Ok(value as u8)
}

impl RegisterHandler for Controller {
    fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, ModbusException> {
        (0..count)
            .map(|offset| self.read_register(start.wrapping_add(offset)))
            .collect()
    }

    fn write_registers(&mut self, start: u16, values: &[u16]) -> Result<(), ModbusException> {
        for (offset, value) in values.iter().enumerate() {
            self.write_register(start.wrapping_add(offset as u16), *value)?;
        }
        Ok(())
    }
}
