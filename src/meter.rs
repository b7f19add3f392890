//! P1 smart meter reader
//!
//! The meter sends a telegram of text lines every second. Only the per-phase
//! current objects are of interest:
//!
//! ```text
//! 1-0:31.7.0(002*A)
//! 1-0:51.7.0(011*A)
//! 1-0:71.7.0(000*A)
//! ```

use log::{debug, info, warn};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{ModbusError, ModbusResult};
use crate::loadbalancer::Phase;
use crate::transport::Clock;

/// Baud rate of the P1 port
pub const P1_BAUD_RATE: u32 = 115_200;

const CURRENT_OBJECTS: [(&str, Phase); 3] = [
    ("1-0:31.7.0", Phase::L1),
    ("1-0:51.7.0", Phase::L2),
    ("1-0:71.7.0", Phase::L3),
];

/// One current reading
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSample {
    pub phase: Phase,
    pub current_ma: u16,
    pub at_ms: u64,
}

/// Parse a telegram line into a phase current in mA
pub fn parse_line(line: &str) -> Option<(Phase, u16)> {
    let line = line.trim();
    let (phase, rest) = CURRENT_OBJECTS
        .iter()
        .find_map(|(obis, phase)| line.strip_prefix(obis).map(|rest| (*phase, rest)))?;

    let value = rest.strip_prefix('(')?;
    let end = value.find(['*', ')'])?;
    let amps: f32 = value[..end].trim().parse().ok()?;
    if !amps.is_finite() || amps < 0.0 {
        return None;
    }

    let milliamps = (amps * 1000.0).round().min(u16::MAX as f32);
    Some((phase, milliamps as u16))
}

/// Read the P1 port and send current samples until the port or the
/// receiver closes
pub fn spawn_p1_reader(
    port: &str,
    clock: Arc<dyn Clock>,
    samples: mpsc::Sender<GridSample>,
) -> ModbusResult<JoinHandle<()>> {
    let builder = tokio_serial::new(port, P1_BAUD_RATE);
    let stream = tokio_serial::SerialStream::open(&builder).map_err(|e| {
        ModbusError::connection(format!("Failed to open meter port {}: {}", port, e))
    })?;
    info!("📈 Reading P1 telegrams from {}", port);

    let port = port.to_string();
    Ok(tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let Some((phase, current_ma)) = parse_line(&line) else {
                        continue;
                    };
                    debug!("Meter {:?}: {} mA", phase, current_ma);
                    let sample = GridSample {
                        phase,
                        current_ma,
                        at_ms: clock.now_ms(),
                    };
                    if samples.send(sample).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    warn!("Meter port {} closed", port);
                    break;
                }
                Err(e) => {
                    warn!("Meter port {} read error: {}", port, e);
                    break;
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_current_lines() {
        assert_eq!(parse_line("1-0:31.7.0(002*A)"), Some((Phase::L1, 2000)));
        assert_eq!(parse_line("1-0:51.7.0(011*A)\r"), Some((Phase::L2, 11000)));
        assert_eq!(parse_line("1-0:71.7.0(1.5*A)"), Some((Phase::L3, 1500)));
    }

    #[test]
    fn test_ignore_other_objects() {
        assert_eq!(parse_line("1-0:32.7.0(230.1*V)"), None);
        assert_eq!(parse_line("1-0:1.8.1(001234.567*kWh)"), None);
        assert_eq!(parse_line("/ISK5\\2M550T-1012"), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn test_reject_malformed_values() {
        assert_eq!(parse_line("1-0:31.7.0"), None);
        assert_eq!(parse_line("1-0:31.7.0(abc*A)"), None);
        assert_eq!(parse_line("1-0:31.7.0(-2*A)"), None);
        assert_eq!(parse_line("1-0:31.7.0(999*A)"), Some((Phase::L1, u16::MAX)));
    }
}
