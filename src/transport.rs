//! # Bus Transport Layer
//!
//! The protocol engines never touch a serial port directly. They transmit
//! through the [`BusLink`] capability and consume received bytes from a
//! bounded single-producer/single-consumer queue created by [`rx_channel`].
//!
//! ## Implementations
//!
//! ### `SerialLink`
//! - RS-485 bus over `tokio-serial`
//! - A reader task stamps every received byte with the [`Clock`] time and
//!   pushes it into the receive queue
//! - `transmit` writes the whole frame and flushes before returning, so the
//!   bus is released only after the frame has left the port
//!
//! ### `MemoryLink`
//! - In-memory fake recording every transmitted frame
//! - Clones share the same record, so a test keeps one handle while the
//!   engine owns the other
//!
//! ## Receive queue
//!
//! ```rust
//! use evse_loadbalancer::transport::rx_channel;
//!
//! let (producer, mut consumer) = rx_channel(64);
//! producer.push_all(&[0x0A, 0x03], 1_000);
//!
//! let bytes = consumer.drain();
//! assert_eq!(bytes.len(), 2);
//! assert_eq!(bytes[1].at_ms, 1_000);
//! ```
//!
//! The consumer must drain the queue completely before an engine evaluates
//! its frame buffer; the engines do this at the start of every poll.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};

use crate::error::{ModbusError, ModbusResult};

/// Source of monotonic milliseconds for byte timestamps and deadlines
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}

/// Clock counting from its creation
#[derive(Debug, Clone)]
pub struct MonotonicClock {
    start: Instant,
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for MonotonicClock {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// A received byte and the time it arrived
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxByte {
    pub byte: u8,
    pub at_ms: u64,
}

/// Create a bounded receive queue holding at most `capacity` bytes
pub fn rx_channel(capacity: usize) -> (RxProducer, RxConsumer) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (RxProducer { tx }, RxConsumer { rx })
}

/// Producing end of the receive queue, owned by the byte reader
#[derive(Debug)]
pub struct RxProducer {
    tx: mpsc::Sender<RxByte>,
}

impl RxProducer {
    /// Queue one byte. Returns `false` if the queue is full or closed; the
    /// byte is dropped and the frame it belonged to will fail its CRC.
    pub fn push(&self, byte: u8, at_ms: u64) -> bool {
        match self.tx.try_send(RxByte { byte, at_ms }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Receive queue full, dropping byte 0x{:02X}", byte);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Queue a run of bytes that arrived together. Returns the number queued.
    pub fn push_all(&self, bytes: &[u8], at_ms: u64) -> usize {
        bytes.iter().take_while(|&&b| self.push(b, at_ms)).count()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consuming end of the receive queue, owned by a protocol engine
#[derive(Debug)]
pub struct RxConsumer {
    rx: mpsc::Receiver<RxByte>,
}

impl RxConsumer {
    /// Take the next byte without waiting
    pub fn try_next(&mut self) -> Option<RxByte> {
        self.rx.try_recv().ok()
    }

    /// Take every byte currently queued
    pub fn drain(&mut self) -> Vec<RxByte> {
        let mut bytes = Vec::new();
        while let Some(byte) = self.try_next() {
            bytes.push(byte);
        }
        bytes
    }
}

/// Transport layer statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub frames_sent: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub timeouts: u64,
}

/// Transmit capability of one half-duplex bus
///
/// Implementations must not return before the frame has been handed to the
/// hardware completely. Engines call `transmit` at most once per frame and
/// never concurrently.
#[async_trait]
pub trait BusLink: Send {
    /// Transmit one complete RTU frame (CRC included)
    async fn transmit(&mut self, frame: &[u8]) -> ModbusResult<()>;

    /// Communication statistics
    fn stats(&self) -> TransportStats;

    /// Release the bus
    ///
    /// Returns once the underlying port can be opened again.
    async fn close(&mut self) {}
}

#[derive(Debug, Default)]
struct MemoryLinkInner {
    frames: Vec<Vec<u8>>,
    stats: TransportStats,
    closed: bool,
}

/// In-memory link recording transmitted frames
#[derive(Debug, Clone, Default)]
pub struct MemoryLink {
    inner: Arc<Mutex<MemoryLinkInner>>,
}

impl MemoryLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every frame transmitted so far
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .map(|inner| inner.frames.clone())
            .unwrap_or_default()
    }

    /// Remove and return the frames transmitted so far
    pub fn take_sent(&self) -> Vec<Vec<u8>> {
        self.inner
            .lock()
            .map(|mut inner| std::mem::take(&mut inner.frames))
            .unwrap_or_default()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().map(|inner| inner.closed).unwrap_or(false)
    }
}

#[async_trait]
impl BusLink for MemoryLink {
    async fn transmit(&mut self, frame: &[u8]) -> ModbusResult<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| ModbusError::internal("memory link lock poisoned"))?;
        if inner.closed {
            inner.stats.errors += 1;
            return Err(ModbusError::connection("memory link closed"));
        }
        inner.stats.frames_sent += 1;
        inner.stats.bytes_sent += frame.len() as u64;
        inner.frames.push(frame.to_vec());
        Ok(())
    }

    fn stats(&self) -> TransportStats {
        self.inner
            .lock()
            .map(|inner| inner.stats.clone())
            .unwrap_or_default()
    }

    async fn close(&mut self) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.closed = true;
        }
    }
}

/// Serial port settings of one bus
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub data_bits: tokio_serial::DataBits,
    pub stop_bits: tokio_serial::StopBits,
    pub parity: tokio_serial::Parity,
    /// Upper bound for writing one frame
    pub write_timeout: Duration,
}

impl SerialSettings {
    /// 8N1 settings for `port` at `baud_rate`
    pub fn new(port: &str, baud_rate: u32) -> Self {
        Self {
            port: port.to_string(),
            baud_rate,
            data_bits: tokio_serial::DataBits::Eight,
            stop_bits: tokio_serial::StopBits::One,
            parity: tokio_serial::Parity::None,
            write_timeout: Duration::from_millis(1000),
        }
    }
}

/// RS-485 bus on a serial port
pub struct SerialLink {
    name: String,
    writer: WriteHalf<tokio_serial::SerialStream>,
    reader: JoinHandle<()>,
    write_timeout: Duration,
    stats: TransportStats,
    bytes_received: Arc<Mutex<u64>>,
}

impl SerialLink {
    /// Open the port and start the reader task feeding `producer`
    pub fn open(
        name: &str,
        settings: &SerialSettings,
        clock: Arc<dyn Clock>,
        producer: RxProducer,
    ) -> ModbusResult<Self> {
        let builder = tokio_serial::new(&settings.port, settings.baud_rate)
            .data_bits(settings.data_bits)
            .stop_bits(settings.stop_bits)
            .parity(settings.parity);

        let port = tokio_serial::SerialStream::open(&builder).map_err(|e| {
            ModbusError::connection(format!(
                "Failed to open serial port {}: {}",
                settings.port, e
            ))
        })?;

        let (mut read_half, writer) = tokio::io::split(port);
        let bytes_received = Arc::new(Mutex::new(0u64));
        let counter = Arc::clone(&bytes_received);
        let bus = name.to_string();

        let reader = tokio::spawn(async move {
            let mut buffer = [0u8; 256];
            loop {
                match read_half.read(&mut buffer).await {
                    Ok(0) => {
                        log::warn!("[{}] serial port closed", bus);
                        break;
                    }
                    Ok(n) => {
                        let at_ms = clock.now_ms();
                        producer.push_all(&buffer[..n], at_ms);
                        if let Ok(mut count) = counter.lock() {
                            *count += n as u64;
                        }
                    }
                    Err(e) => {
                        log::error!("[{}] serial read error: {}", bus, e);
                        break;
                    }
                }
                if producer.is_closed() {
                    break;
                }
            }
        });

        log::info!(
            "🔌 [{}] opened {} at {} baud",
            name,
            settings.port,
            settings.baud_rate
        );

        Ok(Self {
            name: name.to_string(),
            writer,
            reader,
            write_timeout: settings.write_timeout,
            stats: TransportStats::default(),
            bytes_received,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

#[async_trait]
impl BusLink for SerialLink {
    async fn transmit(&mut self, frame: &[u8]) -> ModbusResult<()> {
        let write = async {
            self.writer.write_all(frame).await?;
            self.writer.flush().await
        };

        match timeout(self.write_timeout, write).await {
            Ok(Ok(())) => {
                self.stats.frames_sent += 1;
                self.stats.bytes_sent += frame.len() as u64;
                tracing::trace!(bus = %self.name, bytes = frame.len(), "frame written");
                Ok(())
            }
            Ok(Err(e)) => {
                self.stats.errors += 1;
                Err(ModbusError::io(format!(
                    "Failed to send RTU frame on {}: {}",
                    self.name, e
                )))
            }
            Err(_) => {
                self.stats.timeouts += 1;
                self.stats.errors += 1;
                Err(ModbusError::timeout(
                    "serial write",
                    self.write_timeout.as_millis() as u64,
                ))
            }
        }
    }

    fn stats(&self) -> TransportStats {
        let mut stats = self.stats.clone();
        if let Ok(count) = self.bytes_received.lock() {
            stats.bytes_received = *count;
        }
        stats
    }

    /// Stop the reader task and wait until it has dropped its half of the
    /// port. The file descriptor closes when the link is dropped.
    async fn close(&mut self) {
        if self.reader.is_finished() {
            return;
        }
        self.reader.abort();
        match (&mut self.reader).await {
            Err(e) if e.is_panic() => log::error!("[{}] serial reader panicked", self.name),
            _ => log::debug!("[{}] serial reader stopped", self.name),
        }
    }
}

impl Drop for SerialLink {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rx_channel_preserves_order_and_timestamps() {
        let (producer, mut consumer) = rx_channel(8);
        assert!(producer.push(0x01, 10));
        assert_eq!(producer.push_all(&[0x02, 0x03], 25), 2);

        let bytes = consumer.drain();
        assert_eq!(
            bytes,
            vec![
                RxByte { byte: 0x01, at_ms: 10 },
                RxByte { byte: 0x02, at_ms: 25 },
                RxByte { byte: 0x03, at_ms: 25 },
            ]
        );
        assert!(consumer.try_next().is_none());
    }

    #[test]
    fn test_rx_channel_bounded() {
        let (producer, mut consumer) = rx_channel(4);
        assert_eq!(producer.push_all(&[1, 2, 3, 4, 5, 6], 0), 4);
        assert_eq!(consumer.drain().len(), 4);
        assert!(producer.push(7, 1));
    }

    #[test]
    fn test_rx_channel_closed() {
        let (producer, consumer) = rx_channel(4);
        drop(consumer);
        assert!(producer.is_closed());
        assert!(!producer.push(1, 0));
    }

    #[tokio::test]
    async fn test_memory_link_records_frames() {
        let mut link = MemoryLink::new();
        let handle = link.clone();

        link.transmit(&[0x01, 0x03, 0x00]).await.unwrap();
        link.transmit(&[0x02]).await.unwrap();

        assert_eq!(handle.sent().len(), 2);
        assert_eq!(handle.stats().bytes_sent, 4);
        assert_eq!(handle.take_sent()[0], vec![0x01, 0x03, 0x00]);
        assert!(handle.sent().is_empty());
        assert_eq!(link.stats().frames_sent, 2);
    }

    #[tokio::test]
    async fn test_closed_memory_link_refuses_frames() {
        let mut link = MemoryLink::new();
        let handle = link.clone();
        assert!(!handle.is_closed());

        link.close().await;
        assert!(handle.is_closed());
        assert!(matches!(
            link.transmit(&[0x01]).await,
            Err(ModbusError::Connection { .. })
        ));
        assert!(handle.sent().is_empty());
        assert_eq!(handle.stats().errors, 1);
    }

    #[test]
    fn test_monotonic_clock() {
        let clock = MonotonicClock::new();
        let first = clock.now_ms();
        assert!(clock.now_ms() >= first);
    }
}
