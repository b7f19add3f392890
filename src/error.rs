//! # Error Handling
//!
//! Error types shared by the bus engines, the load balancer and the
//! configuration layer.
//!
//! ## Error Categories
//!
//! ### Transport Errors
//! - **I/O Errors**: serial port read/write failures
//! - **Connection Errors**: a serial port that cannot be opened
//! - **Timeout Errors**: a request that received no answer in time
//!
//! ### Protocol Errors
//! - **Frame Errors**: malformed or over-long RTU frames
//! - **CRC Errors**: checksum mismatch on a received frame
//! - **Invalid Function**: unsupported function codes
//!
//! ### Resource Errors
//! - **Queue Full**: every client request slot is occupied; retry later
//!
//! None of these abort the run loop. The engines resolve them into an
//! exception frame on the wire or a status report to an observer and
//! release whatever slot or buffer the failed exchange held.
//!
//! ```rust
//! use evse_loadbalancer::ModbusError;
//!
//! let err = ModbusError::queue_full(10);
//! assert!(err.is_recoverable());
//! assert!(!err.is_protocol_error());
//! ```

use thiserror::Error;

/// Result type alias for Modbus operations
pub type ModbusResult<T> = Result<T, ModbusError>;

/// Errors raised by the adapter
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModbusError {
    /// I/O related errors (serial port, config file)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// A transport could not be opened or was lost
    #[error("Connection error: {message}")]
    Connection { message: String },

    /// Timeout errors
    ///
    /// Raised when a client request receives no complete response within
    /// the request timeout.
    #[error("Timeout after {timeout_ms}ms: {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Invalid function code
    #[error("Invalid function code: 0x{code:02X}")]
    InvalidFunction { code: u8 },

    /// Invalid address range or quantity
    #[error("Invalid address: start={start}, count={count}")]
    InvalidAddress { start: u16, count: u16 },

    /// Invalid data value
    #[error("Invalid data: {message}")]
    InvalidData { message: String },

    /// CRC validation failure
    ///
    /// `expected` is the CRC computed over the frame body, `actual` the
    /// value carried on the wire.
    #[error("CRC validation failed: expected={expected:04X}, actual={actual:04X}")]
    CrcMismatch { expected: u16, actual: u16 },

    /// Frame parsing errors
    #[error("Frame error: {message}")]
    Frame { message: String },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Every request slot of the client pool is in use
    #[error("Request queue full ({capacity} slots in use)")]
    QueueFull { capacity: usize },

    /// Internal errors (should not occur in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl ModbusError {
    /// Create a new I/O error
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::Io { message: message.into() }
    }

    /// Create a new connection error
    pub fn connection<S: Into<String>>(message: S) -> Self {
        Self::Connection { message: message.into() }
    }

    /// Create a new timeout error
    ///
    /// # Arguments
    ///
    /// * `operation` - Description of the operation that timed out
    /// * `timeout_ms` - Timeout duration in milliseconds
    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create an invalid function error
    pub fn invalid_function(code: u8) -> Self {
        Self::InvalidFunction { code }
    }

    /// Create an invalid address error
    pub fn invalid_address(start: u16, count: u16) -> Self {
        Self::InvalidAddress { start, count }
    }

    /// Create an invalid data error
    pub fn invalid_data<S: Into<String>>(message: S) -> Self {
        Self::InvalidData { message: message.into() }
    }

    /// Create a CRC mismatch error
    pub fn crc_mismatch(expected: u16, actual: u16) -> Self {
        Self::CrcMismatch { expected, actual }
    }

    /// Create a frame error
    pub fn frame<S: Into<String>>(message: S) -> Self {
        Self::Frame { message: message.into() }
    }

    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Create a queue-full error for a pool of `capacity` slots
    pub fn queue_full(capacity: usize) -> Self {
        Self::QueueFull { capacity }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Check if the error is recoverable (can retry)
    ///
    /// A restart that fails with a recoverable error is retried instead of
    /// ending the process.
    ///
    /// ```rust
    /// use evse_loadbalancer::ModbusError;
    ///
    /// assert!(ModbusError::timeout("read holding registers", 1000).is_recoverable());
    /// assert!(!ModbusError::invalid_function(0x2B).is_recoverable());
    /// ```
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Io { .. } => true,
            Self::Connection { .. } => true,
            Self::Timeout { .. } => true,
            Self::QueueFull { .. } => true,
            Self::CrcMismatch { .. } => true,
            _ => false,
        }
    }

    /// Check if the error is a serial/transport issue
    pub fn is_transport_error(&self) -> bool {
        matches!(
            self,
            Self::Io { .. } | Self::Connection { .. } | Self::Timeout { .. }
        )
    }

    /// Check if the error is a protocol issue
    pub fn is_protocol_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidFunction { .. }
                | Self::Frame { .. }
                | Self::CrcMismatch { .. }
        )
    }
}

/// Convert from std::io::Error
impl From<std::io::Error> for ModbusError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}

/// Convert from serde JSON errors
impl From<serde_json::Error> for ModbusError {
    fn from(err: serde_json::Error) -> Self {
        Self::configuration(format!("JSON error: {}", err))
    }
}

/// Convert from serde YAML errors
impl From<serde_yaml::Error> for ModbusError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::configuration(format!("YAML error: {}", err))
    }
}
