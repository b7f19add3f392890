//! Logger initialisation and RTU frame logging
//!
//! Frames are rendered in one of three [`LoggingMode`]s. `Raw` prints the
//! wire bytes as hex, `Interpreted` decodes the fields, and `Both` prints the
//! interpretation at `debug` and the hex dump at `trace`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;

use crate::protocol::{ModbusException, ModbusFunction, RtuFrame};

/// Logging mode for frame display
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoggingMode {
    /// Show raw frame bytes only
    #[default]
    Raw,
    /// Show interpreted frame fields
    Interpreted,
    /// Show both raw and interpreted data
    Both,
}

/// Direction of a frame relative to this device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Rx => write!(f, "<-"),
            Direction::Tx => write!(f, "->"),
        }
    }
}

/// Whether a frame is a master request or a slave response
///
/// Reads share a function code between both directions but not a layout,
/// so interpretation needs to know which side sent the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Request,
    Response,
}

/// Initialise `env_logger` with `level` as the default filter
///
/// `RUST_LOG` still takes precedence. Calling this more than once is harmless.
pub fn init(level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format(|buf, record| {
            let timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S%.3f");
            writeln!(buf, "[{}] {:<5} {}: {}", timestamp, record.level(), record.target(), record.args())
        })
        .try_init();
}

/// Render bytes as spaced upper-case hex
pub fn hex_dump(data: &[u8]) -> String {
    let encoded = hex::encode_upper(data);
    encoded
        .as_bytes()
        .chunks(2)
        .filter_map(|pair| std::str::from_utf8(pair).ok())
        .collect::<Vec<_>>()
        .join(" ")
}

/// Decode and describe an RTU frame, CRC included
pub fn describe_frame(frame: &[u8], kind: FrameKind) -> String {
    let decoded = match RtuFrame::decode(frame) {
        Ok(decoded) => decoded,
        Err(e) => return format!("undecodable frame ({})", e),
    };

    if let Some(code) = decoded.exception_code() {
        let reason = ModbusException::from_u8(code)
            .map(|e| format!("{:?}", e))
            .unwrap_or_else(|| "Unknown".to_string());
        return format!(
            "Slave: {}, Exception for 0x{:02X}: {} (0x{:02X})",
            decoded.address,
            decoded.base_function(),
            reason,
            code
        );
    }

    let function = match ModbusFunction::from_u8(decoded.function) {
        Ok(function) => function,
        Err(_) => {
            return format!(
                "Slave: {}, Function: 0x{:02X}, Data: {}",
                decoded.address,
                decoded.function,
                hex::encode(&decoded.data)
            )
        }
    };

    let fields = interpret_data(function, kind, &decoded.data);
    format!("Slave: {}, Function: {}, {}", decoded.address, function, fields)
}

fn word(data: &[u8], offset: usize) -> Option<u16> {
    data.get(offset..offset + 2)
        .map(|b| u16::from_be_bytes([b[0], b[1]]))
}

fn interpret_data(function: ModbusFunction, kind: FrameKind, data: &[u8]) -> String {
    use ModbusFunction::*;

    match (function, kind) {
        (ReadCoils | ReadDiscreteInputs | ReadHoldingRegisters | ReadInputRegisters, FrameKind::Request) => {
            match (word(data, 0), word(data, 2)) {
                (Some(address), Some(quantity)) => format!("Address: {}, Quantity: {}", address, quantity),
                _ => format!("Data: {}", hex::encode(data)),
            }
        }
        (ReadCoils | ReadDiscreteInputs, FrameKind::Response) => {
            let byte_count = data.first().copied().unwrap_or(0) as usize;
            let bits = crate::protocol::data_utils::unpack_bits(&data[1.min(data.len())..], byte_count * 8);
            format!("Byte count: {}, Bits: {:?}", byte_count, &bits[..bits.len().min(16)])
        }
        (ReadHoldingRegisters | ReadInputRegisters, FrameKind::Response) => {
            let byte_count = data.first().copied().unwrap_or(0);
            let registers: Vec<u16> = (1..data.len())
                .step_by(2)
                .filter_map(|i| word(data, i))
                .collect();
            format!("Byte count: {}, Registers: {:?}", byte_count, &registers[..registers.len().min(8)])
        }
        (WriteSingleCoil, _) => match (word(data, 0), word(data, 2)) {
            (Some(address), Some(value)) => format!(
                "Address: {}, Value: 0x{:04X} ({})",
                address,
                value,
                if value == 0xFF00 { "ON" } else { "OFF" }
            ),
            _ => format!("Data: {}", hex::encode(data)),
        },
        (WriteSingleRegister, _) => match (word(data, 0), word(data, 2)) {
            (Some(address), Some(value)) => format!("Address: {}, Value: {}", address, value),
            _ => format!("Data: {}", hex::encode(data)),
        },
        (WriteMultipleCoils | WriteMultipleRegisters, FrameKind::Request) => {
            match (word(data, 0), word(data, 2), data.get(5..)) {
                (Some(address), Some(quantity), Some(values)) => format!(
                    "Address: {}, Quantity: {}, Values: {}",
                    address,
                    quantity,
                    hex::encode(values)
                ),
                _ => format!("Data: {}", hex::encode(data)),
            }
        }
        (WriteMultipleCoils | WriteMultipleRegisters, FrameKind::Response) => {
            match (word(data, 0), word(data, 2)) {
                (Some(address), Some(quantity)) => format!("Address: {}, Quantity: {}", address, quantity),
                _ => format!("Data: {}", hex::encode(data)),
            }
        }
    }
}

/// Log a frame on `bus` in the given mode
pub fn log_frame(mode: LoggingMode, bus: &str, direction: Direction, kind: FrameKind, frame: &[u8]) {
    match mode {
        LoggingMode::Raw => {
            tracing::debug!("[{}] {} {}", bus, direction, hex_dump(frame));
        }
        LoggingMode::Interpreted => {
            tracing::debug!("[{}] {} {}", bus, direction, describe_frame(frame, kind));
        }
        LoggingMode::Both => {
            tracing::debug!("[{}] {} {}", bus, direction, describe_frame(frame, kind));
            tracing::trace!("[{}] {} Raw: {}", bus, direction, hex_dump(frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(address: u8, function: u8, data: &[u8]) -> Vec<u8> {
        RtuFrame::new(address, function, data.to_vec()).encode().unwrap()
    }

    #[test]
    fn test_hex_dump() {
        assert_eq!(hex_dump(&[0x01, 0xAB, 0x0F]), "01 AB 0F");
        assert_eq!(hex_dump(&[]), "");
    }

    #[test]
    fn test_describe_read_request_and_response() {
        let request = frame(10, 0x03, &[0x03, 0xE8, 0x00, 0x02]);
        let text = describe_frame(&request, FrameKind::Request);
        assert!(text.contains("Slave: 10"));
        assert!(text.contains("Read Holding Registers"));
        assert!(text.contains("Address: 1000, Quantity: 2"));

        let response = frame(10, 0x03, &[0x04, 0x3E, 0x80, 0x00, 0x01]);
        let text = describe_frame(&response, FrameKind::Response);
        assert!(text.contains("Registers: [16000, 1]"));
    }

    #[test]
    fn test_describe_exception() {
        let exception = frame(10, 0x86, &[0x03]);
        let text = describe_frame(&exception, FrameKind::Response);
        assert!(text.contains("IllegalDataValue"));
        assert!(text.contains("0x06"));
    }

    #[test]
    fn test_describe_bad_crc() {
        let mut bad = frame(1, 0x06, &[0x00, 0x01, 0x00, 0x02]);
        bad[7] ^= 0xFF;
        assert!(describe_frame(&bad, FrameKind::Request).starts_with("undecodable"));
    }

    #[test]
    fn test_logging_mode_serde() {
        let mode: LoggingMode = serde_yaml::from_str("both").unwrap();
        assert_eq!(mode, LoggingMode::Both);
        assert_eq!(LoggingMode::default(), LoggingMode::Raw);
    }
}
