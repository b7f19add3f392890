/// Request validation and formatting helpers

use std::time::Duration;

use crate::error::{ModbusError, ModbusResult};

/// Data validation utilities
pub mod validation {
    use super::*;

    /// Validate a unicast slave ID (1-247)
    pub fn validate_slave_id(slave_id: u8) -> ModbusResult<()> {
        if slave_id == 0 || slave_id > crate::MAX_SLAVE_ID {
            return Err(ModbusError::invalid_data(format!(
                "Invalid slave ID: {} (must be 1-{})",
                slave_id,
                crate::MAX_SLAVE_ID
            )));
        }
        Ok(())
    }

    /// Validate address range
    pub fn validate_address_range(start: u16, count: u16) -> ModbusResult<()> {
        if count == 0 || (start as u32 + count as u32) > 65536 {
            return Err(ModbusError::invalid_address(start, count));
        }
        Ok(())
    }

    /// Validate an item count against the per-request limit `max`
    pub fn validate_quantity(count: u16, max: u16) -> ModbusResult<()> {
        if count == 0 || count > max {
            return Err(ModbusError::invalid_data(format!(
                "Invalid quantity: {} (must be 1-{})",
                count, max
            )));
        }
        Ok(())
    }
}

/// Formatting and display utilities
pub mod format {
    use super::*;

    /// Format register values as hex
    pub fn registers_to_hex(registers: &[u16]) -> String {
        registers
            .iter()
            .map(|r| format!("{:04X}", r))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// Format duration in a human-readable way
    pub fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis < 1000 {
            format!("{}ms", millis)
        } else if millis < 60_000 {
            format!("{:.2}s", duration.as_secs_f64())
        } else {
            let mins = millis / 60_000;
            let secs = (millis % 60_000) as f64 / 1000.0;
            format!("{}m {:.1}s", mins, secs)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation() {
        assert!(validation::validate_slave_id(1).is_ok());
        assert!(validation::validate_slave_id(247).is_ok());
        assert!(validation::validate_slave_id(0).is_err());
        assert!(validation::validate_slave_id(248).is_err());

        assert!(validation::validate_address_range(0, 10).is_ok());
        assert!(validation::validate_address_range(65530, 6).is_ok());
        assert!(validation::validate_address_range(65530, 10).is_err());

        assert!(validation::validate_quantity(125, crate::MAX_READ_REGISTERS).is_ok());
        assert!(validation::validate_quantity(126, crate::MAX_READ_REGISTERS).is_err());
        assert!(validation::validate_quantity(0, crate::MAX_READ_BITS).is_err());
    }

    #[test]
    fn test_formatting() {
        assert_eq!(format::registers_to_hex(&[0x1234, 0x3E80]), "1234 3E80");
        assert_eq!(format::format_duration(Duration::from_millis(1500)), "1.50s");
        assert_eq!(format::format_duration(Duration::from_millis(90_000)), "1m 30.0s");
    }
}
