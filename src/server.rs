/// Modbus RTU server (bus slave) engine
///
/// The server collects bytes from its receive queue into a request buffer,
/// validates complete frames and dispatches the ones addressed to this
/// device to a [`RegisterHandler`]. Frames for other units are handed back
/// to the caller as [`ServerEvent::Forwarded`] so they can be repeated on
/// the other bus.

use log::{debug, error, info, warn};

use crate::error::ModbusResult;
use crate::logging::{log_frame, Direction, FrameKind, LoggingMode};
use crate::protocol::{
    crc_is_valid, data_utils, request_frame_status, FrameReader, FrameStatus, ModbusException,
    ModbusFunction, RtuFrame, SlaveId,
};
use crate::transport::{BusLink, RxConsumer};
use crate::{MAX_READ_BITS, MAX_READ_REGISTERS, MAX_WRITE_BITS, MAX_WRITE_REGISTERS, SERVER_RECEIVE_TIMEOUT_MS};

/// Register table collaborator
///
/// Every callback returns the Modbus exception to answer with on failure.
/// Tables that do not expose a data type keep the default, which answers
/// ILLEGAL_DATA_ADDRESS.
pub trait RegisterHandler {
    fn read_coils(&mut self, start: u16, count: u16) -> Result<Vec<bool>, ModbusException> {
        let _ = (start, count);
        Err(ModbusException::IllegalDataAddress)
    }

    fn read_discrete_inputs(&mut self, start: u16, count: u16) -> Result<Vec<bool>, ModbusException> {
        let _ = (start, count);
        Err(ModbusException::IllegalDataAddress)
    }

    fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, ModbusException>;

    fn read_input_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, ModbusException> {
        let _ = (start, count);
        Err(ModbusException::IllegalDataAddress)
    }

    fn write_coils(&mut self, start: u16, values: &[bool]) -> Result<(), ModbusException> {
        let _ = (start, values);
        Err(ModbusException::IllegalDataAddress)
    }

    /// Write consecutive holding registers starting at `start`
    fn write_registers(&mut self, start: u16, values: &[u16]) -> Result<(), ModbusException>;
}

/// Why a received frame was discarded without an answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Partial frame abandoned after the inter-byte timeout
    InterByteTimeout,
    CrcError,
    Oversized,
    /// Unsupported function code in a frame for another unit
    InvalidFunction,
}

/// Outcome of one received frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// A normal response was transmitted
    Responded { function: u8 },
    /// An exception response was transmitted
    Exception { function: u8, exception: ModbusException },
    /// A valid frame for another unit, to be repeated verbatim
    Forwarded(Vec<u8>),
    Dropped(DropReason),
}

/// Server statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub frames_received: u64,
    pub responses_sent: u64,
    pub exceptions_sent: u64,
    pub crc_errors: u64,
    pub frames_forwarded: u64,
    pub frames_dropped: u64,
    pub raw_frames_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
}

/// Response payload accumulator
///
/// For read responses the first byte is the byte count, bumped by every
/// value appended after it.
struct ResponseBuilder {
    data: Vec<u8>,
    counted: bool,
}

impl ResponseBuilder {
    fn echo(data: &[u8]) -> Self {
        Self { data: data.to_vec(), counted: false }
    }

    fn read() -> Self {
        Self { data: vec![0], counted: true }
    }

    fn push_u8(&mut self, value: u8) {
        self.data.push(value);
        if self.counted {
            self.data[0] = self.data[0].wrapping_add(1);
        }
    }

    fn push_u16(&mut self, value: u16) {
        for byte in value.to_be_bytes() {
            self.push_u8(byte);
        }
    }

    fn finish(self) -> Vec<u8> {
        self.data
    }
}

fn check_range(start: u16, count: u16, max: u16) -> Result<(), ModbusException> {
    if count == 0 || count > max {
        return Err(ModbusException::IllegalDataValue);
    }
    if start as u32 + count as u32 > 0x1_0000 {
        return Err(ModbusException::IllegalDataAddress);
    }
    Ok(())
}

fn malformed<T>(_: T) -> ModbusException {
    ModbusException::IllegalDataValue
}

/// Modbus RTU server engine
pub struct RtuServer<L: BusLink> {
    address: SlaveId,
    link: L,
    rx: RxConsumer,
    buffer: Vec<u8>,
    last_byte_ms: Option<u64>,
    logging_mode: LoggingMode,
    stats: ServerStats,
}

impl<L: BusLink> RtuServer<L> {
    /// Create a server answering to `address` (0 disables slave behaviour)
    pub fn new(address: SlaveId, link: L, rx: RxConsumer) -> Self {
        if address == 0 {
            info!("🔁 RTU server running in pass-through mode");
        } else {
            info!("🚀 RTU server listening as slave {}", address);
        }

        Self {
            address,
            link,
            rx,
            buffer: Vec::with_capacity(crate::MAX_RTU_FRAME_SIZE),
            last_byte_ms: None,
            logging_mode: LoggingMode::default(),
            stats: ServerStats::default(),
        }
    }

    pub fn address(&self) -> SlaveId {
        self.address
    }

    pub fn set_address(&mut self, address: SlaveId) {
        self.address = address;
    }

    pub fn set_logging_mode(&mut self, mode: LoggingMode) {
        self.logging_mode = mode;
    }

    pub fn stats(&self) -> ServerStats {
        self.stats.clone()
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Release the bus link
    pub async fn close(&mut self) {
        self.link.close().await;
    }

    /// Transmit an already framed byte sequence verbatim
    pub async fn send_raw(&mut self, frame: &[u8]) -> ModbusResult<()> {
        log_frame(self.logging_mode, "server", Direction::Tx, FrameKind::Response, frame);
        self.link.transmit(frame).await?;
        self.stats.raw_frames_sent += 1;
        self.stats.bytes_sent += frame.len() as u64;
        Ok(())
    }

    /// Drain received bytes and process every complete frame
    pub async fn poll(&mut self, now_ms: u64, handler: &mut dyn RegisterHandler) -> Vec<ServerEvent> {
        let mut events = Vec::new();

        for rx in self.rx.drain() {
            if let Some(last) = self.last_byte_ms {
                if !self.buffer.is_empty() && rx.at_ms.saturating_sub(last) > SERVER_RECEIVE_TIMEOUT_MS {
                    debug!("Discarding {} stale bytes after inter-byte timeout", self.buffer.len());
                    self.discard(&mut events, DropReason::InterByteTimeout);
                }
            }
            self.last_byte_ms = Some(rx.at_ms);
            self.stats.bytes_received += 1;

            if self.buffer.len() >= crate::MAX_RTU_FRAME_SIZE {
                self.discard(&mut events, DropReason::Oversized);
            }
            self.buffer.push(rx.byte);

            self.evaluate(handler, &mut events).await;
        }

        if let Some(last) = self.last_byte_ms {
            if !self.buffer.is_empty() && now_ms.saturating_sub(last) > SERVER_RECEIVE_TIMEOUT_MS {
                debug!("Discarding {} bytes of an unfinished frame", self.buffer.len());
                self.discard(&mut events, DropReason::InterByteTimeout);
            }
        }

        events
    }

    fn discard(&mut self, events: &mut Vec<ServerEvent>, reason: DropReason) {
        self.buffer.clear();
        self.stats.frames_dropped += 1;
        events.push(ServerEvent::Dropped(reason));
    }

    async fn evaluate(&mut self, handler: &mut dyn RegisterHandler, events: &mut Vec<ServerEvent>) {
        match request_frame_status(&self.buffer) {
            FrameStatus::Incomplete => {}
            FrameStatus::Oversized(len) => {
                warn!("Request declares {} bytes, discarding", len);
                self.discard(events, DropReason::Oversized);
            }
            FrameStatus::InvalidFunction(code) => {
                let target = self.buffer[0];
                self.buffer.clear();
                if self.address != 0 && target == self.address {
                    let reply = RtuFrame::exception(self.address, code, ModbusException::IllegalFunction);
                    events.push(self.reply(reply).await);
                } else {
                    self.stats.frames_dropped += 1;
                    events.push(ServerEvent::Dropped(DropReason::InvalidFunction));
                }
            }
            FrameStatus::Ready(len) => {
                let frame: Vec<u8> = self.buffer.drain(..len).collect();
                self.buffer.clear();
                events.push(self.process_frame(frame, handler).await);
            }
        }
    }

    async fn process_frame(&mut self, frame: Vec<u8>, handler: &mut dyn RegisterHandler) -> ServerEvent {
        if !crc_is_valid(&frame) {
            self.stats.crc_errors += 1;
            self.stats.frames_dropped += 1;
            debug!("Dropping request with bad CRC");
            return ServerEvent::Dropped(DropReason::CrcError);
        }

        self.stats.frames_received += 1;
        log_frame(self.logging_mode, "server", Direction::Rx, FrameKind::Request, &frame);

        if self.address == 0 || frame[0] != self.address {
            self.stats.frames_forwarded += 1;
            return ServerEvent::Forwarded(frame);
        }

        let request = match RtuFrame::decode(&frame) {
            Ok(request) => request,
            Err(e) => {
                error!("Failed to decode request: {}", e);
                self.stats.frames_dropped += 1;
                return ServerEvent::Dropped(DropReason::CrcError);
            }
        };

        let reply = match Self::dispatch(&request, handler) {
            Ok(data) => RtuFrame::new(self.address, request.function, data),
            Err(exception) => RtuFrame::exception(self.address, request.function, exception),
        };
        self.reply(reply).await
    }

    async fn reply(&mut self, reply: RtuFrame) -> ServerEvent {
        let event = match reply.exception_code().and_then(ModbusException::from_u8) {
            Some(exception) => {
                self.stats.exceptions_sent += 1;
                ServerEvent::Exception { function: reply.base_function(), exception }
            }
            None => {
                self.stats.responses_sent += 1;
                ServerEvent::Responded { function: reply.function }
            }
        };

        match reply.encode() {
            Ok(bytes) => {
                log_frame(self.logging_mode, "server", Direction::Tx, FrameKind::Response, &bytes);
                match self.link.transmit(&bytes).await {
                    Ok(()) => self.stats.bytes_sent += bytes.len() as u64,
                    Err(e) => error!("Failed to send response: {}", e),
                }
            }
            Err(e) => error!("Failed to encode response: {}", e),
        }

        event
    }

    fn dispatch(request: &RtuFrame, handler: &mut dyn RegisterHandler) -> Result<Vec<u8>, ModbusException> {
        let function =
            ModbusFunction::from_u8(request.function).map_err(|_| ModbusException::IllegalFunction)?;
        let mut reader = request.reader();

        match function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
                let start = reader.read_u16().map_err(malformed)?;
                let count = reader.read_u16().map_err(malformed)?;
                check_range(start, count, MAX_READ_BITS)?;

                let bits = if function == ModbusFunction::ReadCoils {
                    handler.read_coils(start, count)?
                } else {
                    handler.read_discrete_inputs(start, count)?
                };
                if bits.len() != count as usize {
                    return Err(ModbusException::ServerDeviceFailure);
                }

                let mut builder = ResponseBuilder::read();
                for byte in data_utils::pack_bits(&bits) {
                    builder.push_u8(byte);
                }
                Ok(builder.finish())
            }
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                let start = reader.read_u16().map_err(malformed)?;
                let count = reader.read_u16().map_err(malformed)?;
                check_range(start, count, MAX_READ_REGISTERS)?;

                let registers = if function == ModbusFunction::ReadHoldingRegisters {
                    handler.read_holding_registers(start, count)?
                } else {
                    handler.read_input_registers(start, count)?
                };
                if registers.len() != count as usize {
                    return Err(ModbusException::ServerDeviceFailure);
                }

                let mut builder = ResponseBuilder::read();
                for register in registers {
                    builder.push_u16(register);
                }
                Ok(builder.finish())
            }
            ModbusFunction::WriteSingleCoil => {
                let start = reader.read_u16().map_err(malformed)?;
                let value = match reader.read_u16().map_err(malformed)? {
                    0xFF00 => true,
                    0x0000 => false,
                    _ => return Err(ModbusException::IllegalDataValue),
                };
                handler.write_coils(start, &[value])?;
                Ok(ResponseBuilder::echo(&request.data).finish())
            }
            ModbusFunction::WriteSingleRegister => {
                let start = reader.read_u16().map_err(malformed)?;
                let value = reader.read_u16().map_err(malformed)?;
                handler.write_registers(start, &[value])?;
                Ok(ResponseBuilder::echo(&request.data).finish())
            }
            ModbusFunction::WriteMultipleCoils => {
                let (start, count, payload) = Self::read_multiple(&mut reader, MAX_WRITE_BITS)?;
                if payload.len() != (count as usize + 7) / 8 {
                    return Err(ModbusException::IllegalDataValue);
                }
                let values = data_utils::unpack_bits(payload, count as usize);
                handler.write_coils(start, &values)?;
                Ok(ResponseBuilder::echo(&request.data[..4]).finish())
            }
            ModbusFunction::WriteMultipleRegisters => {
                let (start, count, payload) = Self::read_multiple(&mut reader, MAX_WRITE_REGISTERS)?;
                if payload.len() != count as usize * 2 {
                    return Err(ModbusException::IllegalDataValue);
                }
                let values = data_utils::bytes_to_registers(payload).map_err(malformed)?;
                handler.write_registers(start, &values)?;
                Ok(ResponseBuilder::echo(&request.data[..4]).finish())
            }
        }
    }

    fn read_multiple<'a>(
        reader: &mut FrameReader<'a>,
        max: u16,
    ) -> Result<(u16, u16, &'a [u8]), ModbusException> {
        let start = reader.read_u16().map_err(malformed)?;
        let count = reader.read_u16().map_err(malformed)?;
        check_range(start, count, max)?;
        let byte_count = reader.read_u8().map_err(malformed)?;
        let payload = reader.read_bytes(byte_count as usize).map_err(malformed)?;
        Ok((start, count, payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{rx_channel, MemoryLink, RxProducer};
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct Table {
        registers: BTreeMap<u16, u16>,
        coils: BTreeMap<u16, bool>,
    }

    impl RegisterHandler for Table {
        fn read_coils(&mut self, start: u16, count: u16) -> Result<Vec<bool>, ModbusException> {
            Ok((start..start + count).map(|a| *self.coils.get(&a).unwrap_or(&false)).collect())
        }

        fn read_holding_registers(&mut self, start: u16, count: u16) -> Result<Vec<u16>, ModbusException> {
            (start..start + count)
                .map(|a| self.registers.get(&a).copied().ok_or(ModbusException::IllegalDataAddress))
                .collect()
        }

        fn write_coils(&mut self, start: u16, values: &[bool]) -> Result<(), ModbusException> {
            for (i, v) in values.iter().enumerate() {
                self.coils.insert(start + i as u16, *v);
            }
            Ok(())
        }

        fn write_registers(&mut self, start: u16, values: &[u16]) -> Result<(), ModbusException> {
            for (i, v) in values.iter().enumerate() {
                let address = start + i as u16;
                if !self.registers.contains_key(&address) {
                    return Err(ModbusException::IllegalDataAddress);
                }
                self.registers.insert(address, *v);
            }
            Ok(())
        }
    }

    fn setup(address: u8) -> (RtuServer<MemoryLink>, MemoryLink, RxProducer, Table) {
        let link = MemoryLink::new();
        let (producer, consumer) = rx_channel(512);
        let server = RtuServer::new(address, link.clone(), consumer);
        let mut table = Table::default();
        table.registers.insert(1000, 16000);
        table.registers.insert(1001, 42);
        (server, link, producer, table)
    }

    fn request(address: u8, function: u8, data: &[u8]) -> Vec<u8> {
        RtuFrame::new(address, function, data.to_vec()).encode().unwrap()
    }

    #[tokio::test]
    async fn test_read_holding_registers() {
        let (mut server, link, producer, mut table) = setup(10);
        producer.push_all(&request(10, 0x03, &[0x03, 0xE8, 0x00, 0x02]), 0);

        let events = server.poll(0, &mut table).await;
        assert_eq!(events, vec![ServerEvent::Responded { function: 0x03 }]);

        let sent = link.take_sent();
        assert_eq!(sent.len(), 1);
        let reply = RtuFrame::decode(&sent[0]).unwrap();
        assert_eq!(reply.address, 10);
        assert_eq!(reply.data, vec![0x04, 0x3E, 0x80, 0x00, 0x2A]);
    }

    #[tokio::test]
    async fn test_frame_split_across_polls() {
        let (mut server, link, producer, mut table) = setup(10);
        let frame = request(10, 0x06, &[0x03, 0xE8, 0x00, 0x07]);

        producer.push_all(&frame[..3], 0);
        assert!(server.poll(5, &mut table).await.is_empty());
        producer.push_all(&frame[3..], 20);
        let events = server.poll(20, &mut table).await;

        assert_eq!(events, vec![ServerEvent::Responded { function: 0x06 }]);
        assert_eq!(link.take_sent()[0], frame);
        assert_eq!(table.registers[&1000], 7);
    }

    #[tokio::test]
    async fn test_inter_byte_timeout_discards_partial_frame() {
        let (mut server, link, producer, mut table) = setup(10);
        let frame = request(10, 0x03, &[0x03, 0xE8, 0x00, 0x01]);

        producer.push_all(&frame[..4], 0);
        producer.push_all(&frame, 150);

        let events = server.poll(150, &mut table).await;
        assert_eq!(
            events,
            vec![
                ServerEvent::Dropped(DropReason::InterByteTimeout),
                ServerEvent::Responded { function: 0x03 },
            ]
        );
        assert_eq!(link.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_partial_frame_discarded_on_poll() {
        let (mut server, _link, producer, mut table) = setup(10);
        producer.push_all(&[0x0A, 0x03, 0x03], 0);

        assert!(server.poll(50, &mut table).await.is_empty());
        assert_eq!(
            server.poll(101, &mut table).await,
            vec![ServerEvent::Dropped(DropReason::InterByteTimeout)]
        );
    }

    #[tokio::test]
    async fn test_bad_crc_dropped_silently() {
        let (mut server, link, producer, mut table) = setup(10);
        let mut frame = request(10, 0x03, &[0x03, 0xE8, 0x00, 0x01]);
        frame[7] ^= 0x55;
        producer.push_all(&frame, 0);

        let events = server.poll(0, &mut table).await;
        assert_eq!(events, vec![ServerEvent::Dropped(DropReason::CrcError)]);
        assert!(link.sent().is_empty());
        assert_eq!(server.stats().crc_errors, 1);
    }

    #[tokio::test]
    async fn test_frame_for_other_unit_forwarded() {
        let (mut server, link, producer, mut table) = setup(10);
        let frame = request(1, 0x03, &[0x41, 0x00, 0x00, 0x02]);
        producer.push_all(&frame, 0);

        let events = server.poll(0, &mut table).await;
        assert_eq!(events, vec![ServerEvent::Forwarded(frame)]);
        assert!(link.sent().is_empty());
    }

    #[tokio::test]
    async fn test_pass_through_mode_forwards_everything() {
        let (mut server, link, producer, mut table) = setup(0);
        let frame = request(10, 0x03, &[0x03, 0xE8, 0x00, 0x01]);
        producer.push_all(&frame, 0);

        assert_eq!(server.poll(0, &mut table).await, vec![ServerEvent::Forwarded(frame)]);
        assert!(link.sent().is_empty());
    }

    #[tokio::test]
    async fn test_illegal_function() {
        let (mut server, link, producer, mut table) = setup(10);
        producer.push_all(&[0x0A, 0x2B], 0);

        let events = server.poll(0, &mut table).await;
        assert_eq!(
            events,
            vec![ServerEvent::Exception {
                function: 0x2B,
                exception: ModbusException::IllegalFunction
            }]
        );
        assert_eq!(link.take_sent()[0], request(10, 0xAB, &[0x01]));

        producer.push_all(&[0x01, 0x2B], 1);
        assert_eq!(
            server.poll(1, &mut table).await,
            vec![ServerEvent::Dropped(DropReason::InvalidFunction)]
        );
        assert!(link.sent().is_empty());
    }

    #[tokio::test]
    async fn test_exceptions_from_table_and_validation() {
        let (mut server, link, producer, mut table) = setup(10);

        producer.push_all(&request(10, 0x03, &[0x00, 0x00, 0x00, 0x01]), 0);
        producer.push_all(&request(10, 0x03, &[0x03, 0xE8, 0x00, 0x00]), 0);
        producer.push_all(&request(10, 0x05, &[0x00, 0x01, 0x12, 0x34]), 0);

        let events = server.poll(0, &mut table).await;
        assert_eq!(
            events,
            vec![
                ServerEvent::Exception { function: 0x03, exception: ModbusException::IllegalDataAddress },
                ServerEvent::Exception { function: 0x03, exception: ModbusException::IllegalDataValue },
                ServerEvent::Exception { function: 0x05, exception: ModbusException::IllegalDataValue },
            ]
        );
        let sent = link.take_sent();
        assert_eq!(sent[0], request(10, 0x83, &[0x02]));
        assert_eq!(server.stats().exceptions_sent, 3);
    }

    #[tokio::test]
    async fn test_write_multiple_registers_stops_at_first_error() {
        let (mut server, link, producer, mut table) = setup(10);
        producer.push_all(
            &request(10, 0x10, &[0x03, 0xE9, 0x00, 0x02, 0x04, 0x00, 0x05, 0x00, 0x06]),
            0,
        );

        let events = server.poll(0, &mut table).await;
        assert_eq!(
            events,
            vec![ServerEvent::Exception { function: 0x10, exception: ModbusException::IllegalDataAddress }]
        );
        assert_eq!(table.registers[&1001], 5);
        assert_eq!(link.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_write_multiple_coils() {
        let (mut server, link, producer, mut table) = setup(10);
        producer.push_all(&request(10, 0x0F, &[0x00, 0x10, 0x00, 0x0A, 0x02, 0b0000_0101, 0b0000_0010]), 0);

        let events = server.poll(0, &mut table).await;
        assert_eq!(events, vec![ServerEvent::Responded { function: 0x0F }]);
        assert_eq!(link.take_sent()[0], request(10, 0x0F, &[0x00, 0x10, 0x00, 0x0A]));
        assert!(table.coils[&16]);
        assert!(!table.coils[&17]);
        assert!(table.coils[&18]);
        assert!(table.coils[&25]);

        producer.push_all(&request(10, 0x01, &[0x00, 0x10, 0x00, 0x03]), 1);
        server.poll(1, &mut table).await;
        assert_eq!(link.take_sent()[0], request(10, 0x01, &[0x01, 0b0000_0101]));
    }

    #[tokio::test]
    async fn test_write_multiple_byte_count_mismatch() {
        let (mut server, _link, producer, mut table) = setup(10);
        producer.push_all(&request(10, 0x10, &[0x03, 0xE8, 0x00, 0x02, 0x02, 0x00, 0x05]), 0);

        assert_eq!(
            server.poll(0, &mut table).await,
            vec![ServerEvent::Exception { function: 0x10, exception: ModbusException::IllegalDataValue }]
        );
    }

    #[tokio::test]
    async fn test_send_raw() {
        let (mut server, link, _producer, _table) = setup(10);
        let frame = request(1, 0x10, &[0x41, 0x00, 0x00, 0x02]);
        server.send_raw(&frame).await.unwrap();
        assert_eq!(link.sent(), vec![frame]);
        assert_eq!(server.stats().raw_frames_sent, 1);
    }
}
