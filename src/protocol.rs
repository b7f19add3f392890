/// Modbus RTU protocol definitions and framing
///
/// This module contains the function and exception codes, the CRC16 used by
/// RTU framing, the typed `RtuFrame` with its encoder/decoder, and the
/// function-specific rules that tell when a receive buffer holds a complete
/// frame.
///
/// ## Wire format
///
/// ```text
/// [address:1][function:1][data:0..252][crc_lo:1][crc_hi:1]
/// ```
///
/// The CRC is transmitted low byte first by both engines. Running the CRC
/// over a whole received frame, checksum included, leaves a residue of 0.

use byteorder::{BigEndian, ByteOrder};
use crc::{Crc, CRC_16_MODBUS};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{ModbusError, ModbusResult};
use crate::MAX_RTU_FRAME_SIZE;

/// Modbus address type (0-65535)
pub type ModbusAddress = u16;

/// Modbus slave/unit identifier (0 = broadcast, 1-247)
pub type SlaveId = u8;

/// Bit set in the function code of an exception response
pub const EXCEPTION_FLAG: u8 = 0x80;

/// Address, function and the two CRC bytes
const MIN_FRAME_SIZE: usize = 4;

/// CRC-16/MODBUS: poly 0xA001 (reflected 0x8005), seed 0xFFFF
const CRC_MODBUS: Crc<u16> = Crc::<u16>::new(&CRC_16_MODBUS);

/// Modbus function codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ModbusFunction {
    /// Read Coils (0x01)
    ReadCoils = 0x01,
    /// Read Discrete Inputs (0x02)
    ReadDiscreteInputs = 0x02,
    /// Read Holding Registers (0x03)
    ReadHoldingRegisters = 0x03,
    /// Read Input Registers (0x04)
    ReadInputRegisters = 0x04,
    /// Write Single Coil (0x05)
    WriteSingleCoil = 0x05,
    /// Write Single Register (0x06)
    WriteSingleRegister = 0x06,
    /// Write Multiple Coils (0x0F)
    WriteMultipleCoils = 0x0F,
    /// Write Multiple Registers (0x10)
    WriteMultipleRegisters = 0x10,
}

impl ModbusFunction {
    /// Convert from u8 to ModbusFunction
    pub fn from_u8(value: u8) -> ModbusResult<Self> {
        match value {
            0x01 => Ok(ModbusFunction::ReadCoils),
            0x02 => Ok(ModbusFunction::ReadDiscreteInputs),
            0x03 => Ok(ModbusFunction::ReadHoldingRegisters),
            0x04 => Ok(ModbusFunction::ReadInputRegisters),
            0x05 => Ok(ModbusFunction::WriteSingleCoil),
            0x06 => Ok(ModbusFunction::WriteSingleRegister),
            0x0F => Ok(ModbusFunction::WriteMultipleCoils),
            0x10 => Ok(ModbusFunction::WriteMultipleRegisters),
            _ => Err(ModbusError::invalid_function(value)),
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ModbusFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ModbusFunction::ReadCoils => "Read Coils",
            ModbusFunction::ReadDiscreteInputs => "Read Discrete Inputs",
            ModbusFunction::ReadHoldingRegisters => "Read Holding Registers",
            ModbusFunction::ReadInputRegisters => "Read Input Registers",
            ModbusFunction::WriteSingleCoil => "Write Single Coil",
            ModbusFunction::WriteSingleRegister => "Write Single Register",
            ModbusFunction::WriteMultipleCoils => "Write Multiple Coils",
            ModbusFunction::WriteMultipleRegisters => "Write Multiple Registers",
        };
        write!(f, "{} (0x{:02X})", name, *self as u8)
    }
}

/// Modbus exception codes carried on the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ModbusException {
    IllegalFunction = 0x01,
    IllegalDataAddress = 0x02,
    IllegalDataValue = 0x03,
    ServerDeviceFailure = 0x04,
    Acknowledge = 0x05,
    ServerDeviceBusy = 0x06,
    NegativeAcknowledge = 0x07,
    MemoryParityError = 0x08,
    GatewayPathUnavailable = 0x0A,
    GatewayTargetDeviceFailedToRespond = 0x0B,
}

impl ModbusException {
    /// Convert from u8 to ModbusException
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0x01 => Some(ModbusException::IllegalFunction),
            0x02 => Some(ModbusException::IllegalDataAddress),
            0x03 => Some(ModbusException::IllegalDataValue),
            0x04 => Some(ModbusException::ServerDeviceFailure),
            0x05 => Some(ModbusException::Acknowledge),
            0x06 => Some(ModbusException::ServerDeviceBusy),
            0x07 => Some(ModbusException::NegativeAcknowledge),
            0x08 => Some(ModbusException::MemoryParityError),
            0x0A => Some(ModbusException::GatewayPathUnavailable),
            0x0B => Some(ModbusException::GatewayTargetDeviceFailedToRespond),
            _ => None,
        }
    }

    /// Convert to u8
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Get human-readable description
    pub fn description(self) -> &'static str {
        match self {
            ModbusException::IllegalFunction => "The function code received in the query is not an allowable action for the server",
            ModbusException::IllegalDataAddress => "The data address received in the query is not an allowable address for the server",
            ModbusException::IllegalDataValue => "A value contained in the query data field is not an allowable value for server",
            ModbusException::ServerDeviceFailure => "An unrecoverable error occurred while the server was attempting to perform the requested action",
            ModbusException::Acknowledge => "The server has accepted the request and is processing it, but a long duration of time will be required to do so",
            ModbusException::ServerDeviceBusy => "The server is engaged in processing a long-duration program command",
            ModbusException::NegativeAcknowledge => "The server cannot perform the program function received in the query",
            ModbusException::MemoryParityError => "The server attempted to read record file, but detected a parity error in the memory",
            ModbusException::GatewayPathUnavailable => "Gateway was unable to allocate an internal communication path",
            ModbusException::GatewayTargetDeviceFailedToRespond => "No response was obtained from the target device",
        }
    }
}

impl fmt::Display for ModbusException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Modbus Exception 0x{:02X}: {}", self.to_u8(), self.description())
    }
}

/// Calculate the Modbus CRC16 of `data`
pub fn crc16(data: &[u8]) -> u16 {
    CRC_MODBUS.checksum(data)
}

/// Append the CRC of `frame` to it, low byte first
pub fn append_crc(frame: &mut Vec<u8>) {
    let crc = crc16(frame);
    frame.extend_from_slice(&crc.to_le_bytes());
}

/// Check a received frame (CRC included) for a zero residue
pub fn crc_is_valid(frame: &[u8]) -> bool {
    frame.len() >= MIN_FRAME_SIZE && crc16(frame) == 0
}

/// Completeness of a receive buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStatus {
    /// More bytes are needed
    Incomplete,
    /// The first `n` bytes of the buffer form a complete frame
    Ready(usize),
    /// The function code has no framing rule
    InvalidFunction(u8),
    /// The declared length exceeds the maximum RTU frame size
    Oversized(usize),
}

fn complete_at(buf: &[u8], expected: usize) -> FrameStatus {
    if expected > MAX_RTU_FRAME_SIZE {
        FrameStatus::Oversized(expected)
    } else if buf.len() < expected {
        FrameStatus::Incomplete
    } else {
        FrameStatus::Ready(expected)
    }
}

/// Evaluate a buffer holding a request sent by a bus master
///
/// Codes 0x01-0x06 are always 8 bytes; 0x0F and 0x10 carry a byte count at
/// offset 6 and occupy `9 + byte_count` bytes.
pub fn request_frame_status(buf: &[u8]) -> FrameStatus {
    if buf.len() < 2 {
        return FrameStatus::Incomplete;
    }

    match buf[1] {
        0x01..=0x06 => complete_at(buf, 8),
        0x0F | 0x10 => match buf.get(6) {
            Some(&byte_count) => complete_at(buf, 9 + byte_count as usize),
            None => FrameStatus::Incomplete,
        },
        code => FrameStatus::InvalidFunction(code),
    }
}

/// Evaluate a buffer holding a response sent by a bus slave
///
/// Read responses carry a byte count at offset 2 and occupy
/// `5 + byte_count` bytes; write echoes are 8 bytes; exceptions are 5.
pub fn response_frame_status(buf: &[u8]) -> FrameStatus {
    if buf.len() < 2 {
        return FrameStatus::Incomplete;
    }

    match buf[1] {
        code if code & EXCEPTION_FLAG != 0 => complete_at(buf, 5),
        0x01..=0x04 => match buf.get(2) {
            Some(&byte_count) => complete_at(buf, 5 + byte_count as usize),
            None => FrameStatus::Incomplete,
        },
        0x05 | 0x06 | 0x0F | 0x10 => complete_at(buf, 8),
        code => FrameStatus::InvalidFunction(code),
    }
}

/// A decoded RTU frame without its CRC
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtuFrame {
    pub address: SlaveId,
    pub function: u8,
    pub data: Vec<u8>,
}

impl RtuFrame {
    /// Create a frame
    pub fn new(address: SlaveId, function: u8, data: Vec<u8>) -> Self {
        Self { address, function, data }
    }

    /// Create an exception frame for `function`
    pub fn exception(address: SlaveId, function: u8, exception: ModbusException) -> Self {
        Self {
            address,
            function: function | EXCEPTION_FLAG,
            data: vec![exception.to_u8()],
        }
    }

    /// Check if the exception bit is set
    pub fn is_exception(&self) -> bool {
        self.function & EXCEPTION_FLAG != 0
    }

    /// Function code with the exception bit cleared
    pub fn base_function(&self) -> u8 {
        self.function & !EXCEPTION_FLAG
    }

    /// Exception code of an exception frame
    pub fn exception_code(&self) -> Option<u8> {
        if self.is_exception() {
            self.data.first().copied()
        } else {
            None
        }
    }

    /// Cursor over the data field
    pub fn reader(&self) -> FrameReader<'_> {
        FrameReader::new(&self.data)
    }

    /// Encode to wire bytes with the CRC appended
    pub fn encode(&self) -> ModbusResult<Vec<u8>> {
        let len = self.data.len() + MIN_FRAME_SIZE;
        if len > MAX_RTU_FRAME_SIZE {
            return Err(ModbusError::frame(format!(
                "RTU frame of {} bytes exceeds {} bytes",
                len, MAX_RTU_FRAME_SIZE
            )));
        }

        let mut frame = Vec::with_capacity(len);
        frame.push(self.address);
        frame.push(self.function);
        frame.extend_from_slice(&self.data);
        append_crc(&mut frame);
        Ok(frame)
    }

    /// Decode wire bytes, verifying length and CRC
    pub fn decode(bytes: &[u8]) -> ModbusResult<Self> {
        if bytes.len() < MIN_FRAME_SIZE {
            return Err(ModbusError::frame("RTU frame too short"));
        }
        if bytes.len() > MAX_RTU_FRAME_SIZE {
            return Err(ModbusError::frame("RTU frame too large"));
        }

        let body_len = bytes.len() - 2;
        let expected = crc16(&bytes[..body_len]);
        let actual = u16::from_le_bytes([bytes[body_len], bytes[body_len + 1]]);
        if expected != actual {
            return Err(ModbusError::crc_mismatch(expected, actual));
        }

        Ok(Self {
            address: bytes[0],
            function: bytes[1],
            data: bytes[2..body_len].to_vec(),
        })
    }
}

/// Bounds-checked cursor over a frame's data field
///
/// Multi-byte fields are big-endian Modbus words.
#[derive(Debug)]
pub struct FrameReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> FrameReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not consumed yet
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> ModbusResult<u8> {
        let bytes = self.read_bytes(1)?;
        Ok(bytes[0])
    }

    pub fn read_u16(&mut self) -> ModbusResult<u16> {
        let bytes = self.read_bytes(2)?;
        Ok(BigEndian::read_u16(bytes))
    }

    pub fn read_bytes(&mut self, len: usize) -> ModbusResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(ModbusError::frame(format!(
                "Need {} bytes at offset {}, only {} left",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}

/// Data conversion utilities
pub mod data_utils {
    use super::*;

    /// Convert register values to bytes (big-endian)
    pub fn registers_to_bytes(registers: &[u16]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(registers.len() * 2);
        for &register in registers {
            bytes.extend_from_slice(&register.to_be_bytes());
        }
        bytes
    }

    /// Convert big-endian bytes to host-order register values
    pub fn bytes_to_registers(bytes: &[u8]) -> ModbusResult<Vec<u16>> {
        if bytes.len() % 2 != 0 {
            return Err(ModbusError::invalid_data("Byte array length must be even"));
        }

        Ok(bytes.chunks_exact(2).map(BigEndian::read_u16).collect())
    }

    /// Pack boolean values into bytes, LSB first
    pub fn pack_bits(bits: &[bool]) -> Vec<u8> {
        let byte_count = (bits.len() + 7) / 8;
        let mut bytes = vec![0u8; byte_count];

        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                bytes[i / 8] |= 1 << (i % 8);
            }
        }

        bytes
    }

    /// Unpack `bit_count` booleans from bytes, LSB first
    pub fn unpack_bits(bytes: &[u8], bit_count: usize) -> Vec<bool> {
        (0..bit_count)
            .map(|i| {
                bytes
                    .get(i / 8)
                    .map(|byte| byte & (1 << (i % 8)) != 0)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Convert u32 to two u16 registers (most significant first)
    pub fn u32_to_registers(value: u32) -> [u16; 2] {
        [(value >> 16) as u16, value as u16]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_function_conversion() {
        assert_eq!(ModbusFunction::from_u8(0x03).unwrap(), ModbusFunction::ReadHoldingRegisters);
        assert_eq!(ModbusFunction::WriteMultipleRegisters.to_u8(), 0x10);
        assert!(ModbusFunction::from_u8(0x2B).is_err());
    }

    #[test]
    fn test_exception_conversion() {
        assert_eq!(ModbusException::from_u8(0x02), Some(ModbusException::IllegalDataAddress));
        assert_eq!(ModbusException::IllegalDataValue.to_u8(), 0x03);
        assert_eq!(ModbusException::from_u8(0xF0), None);
    }

    #[test]
    fn test_crc_known_vector() {
        let mut frame = vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02];
        append_crc(&mut frame);
        assert_eq!(frame, vec![0x01, 0x03, 0x00, 0x00, 0x00, 0x02, 0xC4, 0x0B]);
        assert!(crc_is_valid(&frame));
    }

    #[test]
    fn test_crc_residue_is_zero() {
        let payloads: [&[u8]; 5] = [
            &[0x00],
            &[0x0A, 0x06, 0x03, 0xF2, 0x3E, 0x80],
            &[0xFF; 40],
            &[0x01, 0x10, 0x41, 0x00, 0x00, 0x02, 0x04, 0x3D, 0x22, 0x00, 0x00],
            b"residue check over arbitrary bytes",
        ];

        for payload in payloads {
            let mut frame = payload.to_vec();
            append_crc(&mut frame);
            assert_eq!(crc16(&frame), 0, "payload {:02X?}", payload);
        }
    }

    #[test]
    fn test_corrupted_frame_fails_residue() {
        let mut frame = vec![0x0A, 0x03, 0x03, 0xE8, 0x00, 0x01];
        append_crc(&mut frame);
        frame[3] ^= 0x01;
        assert!(!crc_is_valid(&frame));
        assert!(matches!(
            RtuFrame::decode(&frame),
            Err(ModbusError::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_request_frame_status_fixed_length() {
        let frame = RtuFrame::new(1, 0x03, vec![0x03, 0xE8, 0x00, 0x02]).encode().unwrap();
        for len in 0..frame.len() {
            assert_eq!(request_frame_status(&frame[..len]), FrameStatus::Incomplete);
        }
        assert_eq!(request_frame_status(&frame), FrameStatus::Ready(8));
    }

    #[test]
    fn test_request_frame_status_byte_count() {
        let data = vec![0x03, 0xF2, 0x00, 0x02, 0x04, 0x3E, 0x80, 0x00, 0x03];
        let frame = RtuFrame::new(10, 0x10, data).encode().unwrap();
        assert_eq!(frame.len(), 13);
        for len in 0..frame.len() {
            assert_eq!(request_frame_status(&frame[..len]), FrameStatus::Incomplete);
        }
        assert_eq!(request_frame_status(&frame), FrameStatus::Ready(13));
    }

    #[test]
    fn test_request_frame_status_invalid_function() {
        assert_eq!(request_frame_status(&[0x01, 0x2B]), FrameStatus::InvalidFunction(0x2B));
        assert_eq!(request_frame_status(&[0x01]), FrameStatus::Incomplete);
    }

    #[test]
    fn test_response_frame_status() {
        let read = RtuFrame::new(1, 0x03, vec![0x04, 0x00, 0x0A, 0x00, 0x0B]).encode().unwrap();
        assert_eq!(response_frame_status(&read[..2]), FrameStatus::Incomplete);
        assert_eq!(response_frame_status(&read[..8]), FrameStatus::Incomplete);
        assert_eq!(response_frame_status(&read), FrameStatus::Ready(9));

        let echo = RtuFrame::new(1, 0x06, vec![0x00, 0x01, 0x00, 0x03]).encode().unwrap();
        assert_eq!(response_frame_status(&echo[..7]), FrameStatus::Incomplete);
        assert_eq!(response_frame_status(&echo), FrameStatus::Ready(8));

        let exception = RtuFrame::exception(1, 0x03, ModbusException::IllegalDataAddress)
            .encode()
            .unwrap();
        assert_eq!(response_frame_status(&exception), FrameStatus::Ready(5));

        assert_eq!(response_frame_status(&[0x01, 0x07, 0x00]), FrameStatus::InvalidFunction(0x07));
    }

    fn assert_completes_at(status: fn(&[u8]) -> FrameStatus, frame: &[u8]) {
        for len in 0..frame.len() {
            assert_eq!(status(&frame[..len]), FrameStatus::Incomplete, "{:02X?} at {}", frame, len);
        }
        assert_eq!(status(frame), FrameStatus::Ready(frame.len()), "{:02X?}", frame);

        let mut longer = frame.to_vec();
        longer.extend_from_slice(&[0x0A, 0x03]);
        assert_eq!(status(&longer), FrameStatus::Ready(frame.len()));
    }

    #[test]
    fn test_frame_status_every_function_code() {
        let requests: [(u8, Vec<u8>); 8] = [
            (0x01, vec![0x00, 0x13, 0x00, 0x25]),
            (0x02, vec![0x00, 0xC4, 0x00, 0x16]),
            (0x03, vec![0x41, 0x00, 0x00, 0x02]),
            (0x04, vec![0x00, 0x08, 0x00, 0x01]),
            (0x05, vec![0x00, 0xAC, 0xFF, 0x00]),
            (0x06, vec![0x03, 0xEC, 0x00, 0x01]),
            (0x0F, vec![0x00, 0x13, 0x00, 0x0A, 0x02, 0xCD, 0x01]),
            (0x10, vec![0x41, 0x00, 0x00, 0x02, 0x04, 0x00, 0x00, 0x3D, 0x22]),
        ];
        for (function, data) in requests {
            let frame = RtuFrame::new(10, function, data).encode().unwrap();
            assert_completes_at(request_frame_status, &frame);
        }

        let responses: [(u8, Vec<u8>); 8] = [
            (0x01, vec![0x05, 0xCD, 0x6B, 0xB2, 0x0E, 0x1B]),
            (0x02, vec![0x03, 0xAC, 0xDB, 0x35]),
            (0x03, vec![0x04, 0x00, 0x00, 0x3D, 0x22]),
            (0x04, vec![0x02, 0x00, 0x0A]),
            (0x05, vec![0x00, 0xAC, 0xFF, 0x00]),
            (0x06, vec![0x03, 0xEC, 0x00, 0x01]),
            (0x0F, vec![0x00, 0x13, 0x00, 0x0A]),
            (0x10, vec![0x41, 0x00, 0x00, 0x02]),
        ];
        for (function, data) in responses {
            let frame = RtuFrame::new(1, function, data).encode().unwrap();
            assert_completes_at(response_frame_status, &frame);

            let exception = RtuFrame::exception(1, function, ModbusException::ServerDeviceBusy)
                .encode()
                .unwrap();
            assert_completes_at(response_frame_status, &exception);
        }
    }

    #[test]
    fn test_oversized_declared_length() {
        let buf = [0x01, 0x03, 0xFE];
        assert_eq!(response_frame_status(&buf), FrameStatus::Oversized(0xFE + 5));
    }

    #[test]
    fn test_frame_decode() {
        let bytes = [0x01, 0x03, 0x04, 0x00, 0x0A, 0x00, 0x0B];
        let mut wire = bytes.to_vec();
        append_crc(&mut wire);

        let frame = RtuFrame::decode(&wire).unwrap();
        assert_eq!(frame.address, 1);
        assert_eq!(frame.function, 0x03);

        let mut reader = frame.reader();
        assert_eq!(reader.read_u8().unwrap(), 4);
        assert_eq!(reader.read_u16().unwrap(), 0x000A);
        assert_eq!(reader.read_u16().unwrap(), 0x000B);
        assert!(reader.read_u8().is_err());
    }

    #[test]
    fn test_exception_frame() {
        let frame = RtuFrame::exception(10, 0x06, ModbusException::IllegalDataValue);
        assert!(frame.is_exception());
        assert_eq!(frame.base_function(), 0x06);
        assert_eq!(frame.exception_code(), Some(0x03));
        assert_eq!(frame.encode().unwrap().len(), 5);
    }

    #[test]
    fn test_data_utils() {
        let registers = vec![0x1234, 0x5678];
        let bytes = data_utils::registers_to_bytes(&registers);
        assert_eq!(bytes, vec![0x12, 0x34, 0x56, 0x78]);
        assert_eq!(data_utils::bytes_to_registers(&bytes).unwrap(), registers);
        assert!(data_utils::bytes_to_registers(&[0x01]).is_err());

        let bits = vec![true, false, true, true, false, false, false, false, true];
        let packed = data_utils::pack_bits(&bits);
        assert_eq!(packed, vec![0b0000_1101, 0b0000_0001]);
        assert_eq!(data_utils::unpack_bits(&packed, bits.len()), bits);

        assert_eq!(data_utils::u32_to_registers(15650), [0x0000, 0x3D22]);
    }
}
