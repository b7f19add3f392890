/// Modbus RTU client (bus master) engine
///
/// Requests are queued into a fixed pool of slots, each holding its fully
/// framed bytes. The bus is half-duplex, so at most one request is on the
/// wire at a time: `poll` transmits the first queued request only when the
/// previous one has been answered or has timed out.
///
/// Results are delivered to a [`ClientObserver`]. Nothing is returned to
/// the caller that enqueued the request.

use log::{debug, error, warn};

use crate::error::{ModbusError, ModbusResult};
use crate::logging::{log_frame, Direction, FrameKind, LoggingMode};
use crate::protocol::{
    crc_is_valid, data_utils, response_frame_status, FrameStatus, ModbusException,
    ModbusFunction, RtuFrame, SlaveId,
};
use crate::transport::{BusLink, RxConsumer};
use crate::utils::validation;
use crate::{
    CLIENT_QUEUE_SIZE, DEFAULT_REQUEST_TIMEOUT_MS, MAX_READ_BITS, MAX_READ_REGISTERS,
    MAX_RTU_FRAME_SIZE, MAX_WRITE_BITS, MAX_WRITE_REGISTERS,
};

/// Outcome reported for a request that did not produce data
///
/// Only `Exception` codes come from the wire. The others are raised locally
/// and are never transmitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientStatus {
    /// The device answered with this exception code
    Exception(u8),
    /// No complete response before the request timeout
    Timeout,
    /// A complete response failed its CRC check
    InvalidCrc,
    /// A response did not match its request
    UnexpectedResponse,
}

impl ClientStatus {
    /// Status code as stored in the system error register
    pub fn code(self) -> u8 {
        match self {
            ClientStatus::Exception(code) => code,
            ClientStatus::Timeout => 0xF0,
            ClientStatus::InvalidCrc => 0xF1,
            ClientStatus::UnexpectedResponse => 0xF2,
        }
    }
}

/// Decoded payload of a successful response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseData {
    Bits(Vec<bool>),
    /// Register values in host order
    Registers(Vec<u16>),
    /// Write echoed as requested
    WriteAck,
}

/// What a response or status refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestInfo {
    pub address: SlaveId,
    pub function: u8,
    pub start: u16,
    pub count: u16,
    /// Injected through `send_raw`
    pub raw: bool,
}

/// Consumer of client results
pub trait ClientObserver {
    fn on_response(&mut self, request: &RequestInfo, data: &ResponseData);

    fn on_status(&mut self, request: &RequestInfo, status: ClientStatus);

    /// Complete response to a raw request, CRC included
    fn on_raw_response(&mut self, frame: &[u8]) {
        let _ = frame;
    }
}

/// Client statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientStats {
    pub requests_sent: u64,
    pub responses_received: u64,
    pub exceptions: u64,
    pub timeouts: u64,
    pub crc_errors: u64,
    pub unexpected_responses: u64,
    pub bytes_discarded: u64,
}

#[derive(Debug, Clone)]
struct ClientRequest {
    info: RequestInfo,
    frame: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    slot: usize,
    sent_ms: u64,
}

/// Modbus RTU client engine
pub struct RtuClient<L: BusLink> {
    link: L,
    rx: RxConsumer,
    slots: Vec<Option<ClientRequest>>,
    in_flight: Option<InFlight>,
    response: Vec<u8>,
    timeout_ms: u64,
    logging_mode: LoggingMode,
    stats: ClientStats,
}

impl<L: BusLink> RtuClient<L> {
    pub fn new(link: L, rx: RxConsumer) -> Self {
        Self {
            link,
            rx,
            slots: vec![None; CLIENT_QUEUE_SIZE],
            in_flight: None,
            response: Vec::with_capacity(MAX_RTU_FRAME_SIZE),
            timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            logging_mode: LoggingMode::default(),
            stats: ClientStats::default(),
        }
    }

    pub fn set_timeout_ms(&mut self, timeout_ms: u64) {
        self.timeout_ms = timeout_ms;
    }

    pub fn set_logging_mode(&mut self, mode: LoggingMode) {
        self.logging_mode = mode;
    }

    pub fn stats(&self) -> ClientStats {
        self.stats.clone()
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    /// Release the bus link
    pub async fn close(&mut self) {
        self.link.close().await;
    }

    /// Number of occupied slots, including the one in flight
    pub fn pending(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Whether a request is waiting for its response
    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Read coils (0x01)
    pub fn read_coils(&mut self, address: SlaveId, start: u16, count: u16) -> ModbusResult<()> {
        validation::validate_quantity(count, MAX_READ_BITS)?;
        self.enqueue_read(ModbusFunction::ReadCoils, address, start, count)
    }

    /// Read discrete inputs (0x02)
    pub fn read_discrete_inputs(&mut self, address: SlaveId, start: u16, count: u16) -> ModbusResult<()> {
        validation::validate_quantity(count, MAX_READ_BITS)?;
        self.enqueue_read(ModbusFunction::ReadDiscreteInputs, address, start, count)
    }

    /// Read holding registers (0x03)
    pub fn read_holding_registers(&mut self, address: SlaveId, start: u16, count: u16) -> ModbusResult<()> {
        validation::validate_quantity(count, MAX_READ_REGISTERS)?;
        self.enqueue_read(ModbusFunction::ReadHoldingRegisters, address, start, count)
    }

    /// Read input registers (0x04)
    pub fn read_input_registers(&mut self, address: SlaveId, start: u16, count: u16) -> ModbusResult<()> {
        validation::validate_quantity(count, MAX_READ_REGISTERS)?;
        self.enqueue_read(ModbusFunction::ReadInputRegisters, address, start, count)
    }

    /// Write single coil (0x05)
    pub fn write_single_coil(&mut self, address: SlaveId, start: u16, value: bool) -> ModbusResult<()> {
        let encoded: u16 = if value { 0xFF00 } else { 0x0000 };
        let mut data = start.to_be_bytes().to_vec();
        data.extend_from_slice(&encoded.to_be_bytes());
        self.enqueue(ModbusFunction::WriteSingleCoil, address, start, 1, data)
    }

    /// Write single register (0x06)
    pub fn write_single_register(&mut self, address: SlaveId, start: u16, value: u16) -> ModbusResult<()> {
        let mut data = start.to_be_bytes().to_vec();
        data.extend_from_slice(&value.to_be_bytes());
        self.enqueue(ModbusFunction::WriteSingleRegister, address, start, 1, data)
    }

    /// Write multiple coils (0x0F)
    pub fn write_multiple_coils(&mut self, address: SlaveId, start: u16, values: &[bool]) -> ModbusResult<()> {
        let count = u16::try_from(values.len())
            .map_err(|_| ModbusError::invalid_data("Too many coils"))?;
        validation::validate_quantity(count, MAX_WRITE_BITS)?;

        let packed = data_utils::pack_bits(values);
        let mut data = start.to_be_bytes().to_vec();
        data.extend_from_slice(&count.to_be_bytes());
        data.push(packed.len() as u8);
        data.extend_from_slice(&packed);
        self.enqueue(ModbusFunction::WriteMultipleCoils, address, start, count, data)
    }

    /// Write multiple registers (0x10)
    pub fn write_multiple_registers(&mut self, address: SlaveId, start: u16, values: &[u16]) -> ModbusResult<()> {
        let request = multiple_registers_request(address, start, values)?;
        self.store(request)
    }

    /// Write multiple registers (0x10), superseding a queued write
    ///
    /// A write to the same slave and registers that is still waiting in the
    /// pool takes the new values and keeps its place. A write already on the
    /// bus is left alone and the new one is queued behind it.
    pub fn replace_multiple_registers(&mut self, address: SlaveId, start: u16, values: &[u16]) -> ModbusResult<()> {
        let request = multiple_registers_request(address, start, values)?;
        let in_flight = self.in_flight.map(|in_flight| in_flight.slot);

        let queued = self
            .slots
            .iter_mut()
            .enumerate()
            .filter(|(index, _)| Some(*index) != in_flight)
            .find_map(|(_, slot)| slot.as_mut().filter(|queued| queued.info == request.info));

        match queued {
            Some(queued) => {
                *queued = request;
                Ok(())
            }
            None => self.store(request),
        }
    }

    /// Queue an already framed request, CRC included
    ///
    /// Its response is handed verbatim to [`ClientObserver::on_raw_response`].
    /// Broadcast frames (address 0) expect no response and complete once sent.
    pub fn send_raw(&mut self, frame: &[u8]) -> ModbusResult<()> {
        if frame.len() < 4 || frame.len() > MAX_RTU_FRAME_SIZE {
            return Err(ModbusError::frame(format!("Raw frame of {} bytes", frame.len())));
        }

        let info = RequestInfo {
            address: frame[0],
            function: frame[1],
            start: 0,
            count: 0,
            raw: true,
        };
        self.store(ClientRequest { info, frame: frame.to_vec() })
    }

    fn enqueue_read(&mut self, function: ModbusFunction, address: SlaveId, start: u16, count: u16) -> ModbusResult<()> {
        let mut data = start.to_be_bytes().to_vec();
        data.extend_from_slice(&count.to_be_bytes());
        self.enqueue(function, address, start, count, data)
    }

    fn enqueue(
        &mut self,
        function: ModbusFunction,
        address: SlaveId,
        start: u16,
        count: u16,
        data: Vec<u8>,
    ) -> ModbusResult<()> {
        let request = build_request(function, address, start, count, data)?;
        self.store(request)
    }

    fn store(&mut self, request: ClientRequest) -> ModbusResult<()> {
        match self.slots.iter_mut().find(|slot| slot.is_none()) {
            Some(slot) => {
                *slot = Some(request);
                Ok(())
            }
            None => Err(ModbusError::queue_full(CLIENT_QUEUE_SIZE)),
        }
    }

    /// Process received bytes, expire a timed out request and start the
    /// next queued one
    pub async fn poll(&mut self, now_ms: u64, observer: &mut dyn ClientObserver) {
        for rx in self.rx.drain() {
            if self.in_flight.is_none() || self.response.len() >= MAX_RTU_FRAME_SIZE {
                self.stats.bytes_discarded += 1;
                continue;
            }
            self.response.push(rx.byte);
        }

        if let Some(in_flight) = self.in_flight {
            self.check_response(in_flight, observer);
        }

        if let Some(in_flight) = self.in_flight {
            if now_ms.saturating_sub(in_flight.sent_ms) > self.timeout_ms {
                if let Some(request) = self.current() {
                    warn!(
                        "Request 0x{:02X} to slave {} timed out",
                        request.info.function, request.info.address
                    );
                    observer.on_status(&request.info, ClientStatus::Timeout);
                }
                self.stats.timeouts += 1;
                self.finish();
            }
        }

        if self.in_flight.is_none() {
            self.start_next(now_ms).await;
        }
    }

    fn current(&self) -> Option<ClientRequest> {
        self.in_flight
            .and_then(|in_flight| self.slots.get(in_flight.slot))
            .and_then(|slot| slot.clone())
    }

    /// Free the in-flight slot and reset the response buffer
    fn finish(&mut self) {
        if let Some(in_flight) = self.in_flight.take() {
            if let Some(slot) = self.slots.get_mut(in_flight.slot) {
                *slot = None;
            }
        }
        self.response.clear();
    }

    async fn start_next(&mut self, now_ms: u64) {
        let next = self
            .slots
            .iter()
            .enumerate()
            .find_map(|(index, slot)| slot.as_ref().map(|request| (index, request.clone())));

        let Some((slot, request)) = next else {
            return;
        };

        self.response.clear();
        log_frame(self.logging_mode, "client", Direction::Tx, FrameKind::Request, &request.frame);
        if let Err(e) = self.link.transmit(&request.frame).await {
            error!("Failed to send request: {}", e);
        }
        self.stats.requests_sent += 1;

        if request.info.raw && request.info.address == 0 {
            self.slots[slot] = None;
            return;
        }

        self.in_flight = Some(InFlight { slot, sent_ms: now_ms });
    }

    fn check_response(&mut self, in_flight: InFlight, observer: &mut dyn ClientObserver) {
        let Some(request) = self.slots.get(in_flight.slot).and_then(|slot| slot.clone()) else {
            self.finish();
            return;
        };

        let len = match response_frame_status(&self.response) {
            FrameStatus::Incomplete => return,
            FrameStatus::Ready(len) => len,
            FrameStatus::InvalidFunction(code) => {
                debug!("Discarding response with function 0x{:02X}", code);
                self.stats.bytes_discarded += self.response.len() as u64;
                self.response.clear();
                return;
            }
            FrameStatus::Oversized(len) => {
                debug!("Discarding response declaring {} bytes", len);
                self.stats.bytes_discarded += self.response.len() as u64;
                self.response.clear();
                return;
            }
        };

        let frame: Vec<u8> = self.response[..len].to_vec();
        if frame[0] != request.info.address {
            debug!(
                "Discarding response from slave {} while waiting for {}",
                frame[0], request.info.address
            );
            self.stats.bytes_discarded += self.response.len() as u64;
            self.response.clear();
            return;
        }

        if !crc_is_valid(&frame) {
            self.stats.crc_errors += 1;
            self.response.clear();
            observer.on_status(&request.info, ClientStatus::InvalidCrc);
            return;
        }

        log_frame(self.logging_mode, "client", Direction::Rx, FrameKind::Response, &frame);
        self.stats.responses_received += 1;

        if request.info.raw {
            observer.on_raw_response(&frame);
        } else {
            match RtuFrame::decode(&frame) {
                Ok(response) => self.dispatch(&request, &response, observer),
                Err(e) => {
                    error!("Failed to decode response: {}", e);
                    observer.on_status(&request.info, ClientStatus::UnexpectedResponse);
                }
            }
        }

        self.finish();
    }

    fn dispatch(&mut self, request: &ClientRequest, response: &RtuFrame, observer: &mut dyn ClientObserver) {
        let info = &request.info;

        if response.base_function() != info.function {
            self.unexpected(info, observer);
            return;
        }

        if let Some(code) = response.exception_code() {
            self.stats.exceptions += 1;
            match ModbusException::from_u8(code) {
                Some(exception) => debug!("Slave {} answered {}", info.address, exception),
                None => debug!("Slave {} answered exception 0x{:02X}", info.address, code),
            }
            observer.on_status(info, ClientStatus::Exception(code));
            return;
        }

        let function = match ModbusFunction::from_u8(info.function) {
            Ok(function) => function,
            Err(_) => {
                self.unexpected(info, observer);
                return;
            }
        };

        let decoded = match function {
            ModbusFunction::ReadCoils | ModbusFunction::ReadDiscreteInputs => {
                let payload = response.data.get(1..).unwrap_or_default();
                if payload.len() != (info.count as usize + 7) / 8 {
                    None
                } else {
                    Some(ResponseData::Bits(data_utils::unpack_bits(payload, info.count as usize)))
                }
            }
            ModbusFunction::ReadHoldingRegisters | ModbusFunction::ReadInputRegisters => {
                let payload = response.data.get(1..).unwrap_or_default();
                if payload.len() != info.count as usize * 2 {
                    None
                } else {
                    data_utils::bytes_to_registers(payload).ok().map(ResponseData::Registers)
                }
            }
            _ => {
                // Writes echo the first four data bytes of the request
                let echoed = response.data.get(..4);
                let requested = request.frame.get(2..6);
                if echoed.is_some() && echoed == requested {
                    Some(ResponseData::WriteAck)
                } else {
                    None
                }
            }
        };

        match decoded {
            Some(data) => observer.on_response(info, &data),
            None => self.unexpected(info, observer),
        }
    }

    fn unexpected(&mut self, info: &RequestInfo, observer: &mut dyn ClientObserver) {
        self.stats.unexpected_responses += 1;
        observer.on_status(info, ClientStatus::UnexpectedResponse);
    }
}

fn build_request(
    function: ModbusFunction,
    address: SlaveId,
    start: u16,
    count: u16,
    data: Vec<u8>,
) -> ModbusResult<ClientRequest> {
    validation::validate_slave_id(address)?;
    validation::validate_address_range(start, count)?;

    let frame = RtuFrame::new(address, function.to_u8(), data).encode()?;
    let info = RequestInfo {
        address,
        function: function.to_u8(),
        start,
        count,
        raw: false,
    };
    Ok(ClientRequest { info, frame })
}

fn multiple_registers_request(address: SlaveId, start: u16, values: &[u16]) -> ModbusResult<ClientRequest> {
    let count = u16::try_from(values.len())
        .map_err(|_| ModbusError::invalid_data("Too many registers"))?;
    validation::validate_quantity(count, MAX_WRITE_REGISTERS)?;

    let mut data = start.to_be_bytes().to_vec();
    data.extend_from_slice(&count.to_be_bytes());
    data.push((count * 2) as u8);
    data.extend_from_slice(&data_utils::registers_to_bytes(values));
    build_request(ModbusFunction::WriteMultipleRegisters, address, start, count, data)
}
