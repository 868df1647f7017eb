//! Serial interface
//!
//! Owns the byte transport, runs the frame receiver on a dedicated thread for
//! the lifetime of a connection and serializes outgoing frames.

use std::io;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Span};

use super::{
    ByteTransport, FrameReceiver, Packet, ProtocolError, ReceivedPacket, ReceiverStats,
    DEFAULT_BAUD_RATE, DEFAULT_READ_TIMEOUT_MS, FRAME_PAYLOAD_SIZE, INTER_FRAME_DELAY,
};

/// Callback invoked on the receiver thread for every reassembled frame
pub type PacketHandler = Arc<dyn Fn(ReceivedPacket) + Send + Sync>;

/// Link timing configuration
#[derive(Debug, Clone)]
pub struct InterfaceConfig {
    /// Baud rate
    pub baud_rate: u32,
    /// Receiver read timeout
    pub read_timeout: Duration,
    /// Pause after every sent frame
    pub inter_frame_delay: Duration,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            baud_rate: DEFAULT_BAUD_RATE,
            read_timeout: Duration::from_millis(DEFAULT_READ_TIMEOUT_MS),
            inter_frame_delay: INTER_FRAME_DELAY,
        }
    }
}

#[derive(Debug, Default)]
struct Counters {
    transmitted: AtomicU32,
    received: AtomicU32,
    skipped_bytes: AtomicU64,
    checksum_failures: AtomicU32,
}

struct SendState {
    transport: Box<dyn ByteTransport>,
    next_index: u8,
}

struct ReceiverTask {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Framed packet interface over a [`ByteTransport`]
pub struct SerialInterface {
    config: InterfaceConfig,
    sender: Mutex<SendState>,
    receiver: Mutex<Option<ReceiverTask>>,
    handler: PacketHandler,
    counters: Arc<Counters>,
    span: Span,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl SerialInterface {
    /// Create an interface; nothing is opened until [`connect`](Self::connect)
    pub fn new(
        transport: Box<dyn ByteTransport>,
        config: InterfaceConfig,
        handler: PacketHandler,
    ) -> Self {
        Self {
            config,
            sender: Mutex::new(SendState {
                transport,
                next_index: 0,
            }),
            receiver: Mutex::new(None),
            handler,
            counters: Arc::new(Counters::default()),
            span: Span::none(),
        }
    }

    /// Attribute the receiver thread's log output to `span`
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    /// Open the transport and start the receiver thread.
    ///
    /// Returns once the transport is open; it does not wait for traffic.
    pub fn connect(&self, path: &str) -> Result<(), ProtocolError> {
        let mut receiver = lock(&self.receiver);
        if receiver.is_some() {
            return Err(ProtocolError::AlreadyConnected);
        }

        let reader = {
            let mut sender = lock(&self.sender);
            if let Err(e) = sender.transport.open(path, self.config.baud_rate) {
                error!(target: "svh::interface", path, "failed to open transport: {e}");
                return Err(ProtocolError::SerialError(e.to_string()));
            }
            match sender.transport.try_clone() {
                Ok(reader) => reader,
                Err(e) => {
                    error!(target: "svh::interface", path, "failed to clone transport: {e}");
                    sender.transport.close();
                    return Err(ProtocolError::SerialError(e.to_string()));
                }
            }
        };

        let cancel = CancellationToken::new();
        let handle = {
            let cancel = cancel.clone();
            let handler = Arc::clone(&self.handler);
            let counters = Arc::clone(&self.counters);
            let timeout = self.config.read_timeout;
            let span = self.span.clone();
            let spawned = thread::Builder::new()
                .name("svh-receiver".into())
                .spawn(move || {
                    span.in_scope(|| receive_loop(reader, cancel, handler, counters, timeout))
                });
            match spawned {
                Ok(handle) => handle,
                Err(e) => {
                    lock(&self.sender).transport.close();
                    return Err(e.into());
                }
            }
        };

        info!(target: "svh::interface", path, baud = self.config.baud_rate, "serial interface connected");
        *receiver = Some(ReceiverTask { cancel, handle });
        Ok(())
    }

    /// Check if the interface is connected
    pub fn is_connected(&self) -> bool {
        lock(&self.receiver).is_some() && lock(&self.sender).transport.is_open()
    }

    /// Send one packet.
    ///
    /// The payload is padded to the fixed frame size and the next packet index
    /// is assigned. Senders are serialized, including the inter-frame delay.
    pub fn send(&self, packet: Packet) -> Result<(), ProtocolError> {
        if lock(&self.receiver).is_none() {
            return Err(ProtocolError::NotConnected);
        }

        let mut sender = lock(&self.sender);
        let mut packet = packet.padded(FRAME_PAYLOAD_SIZE)?;
        packet.index = sender.next_index;
        sender.next_index = sender.next_index.wrapping_add(1);

        let bytes = packet.to_bytes();
        let mut written = 0;
        while written < bytes.len() {
            match sender.transport.write(&bytes[written..]) {
                Ok(0) => {
                    error!(target: "svh::interface", index = packet.index, "transport accepted no bytes");
                    return Err(ProtocolError::TransportClosed);
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!(target: "svh::interface", index = packet.index, "write failed: {e}");
                    return Err(e.into());
                }
            }
        }

        self.counters.transmitted.fetch_add(1, Ordering::SeqCst);
        thread::sleep(self.config.inter_frame_delay);
        Ok(())
    }

    /// Packets sent since connect or the last counter reset
    pub fn transmitted_count(&self) -> u32 {
        self.counters.transmitted.load(Ordering::SeqCst)
    }

    /// Valid packets received since connect or the last counter reset
    pub fn received_count(&self) -> u32 {
        self.counters.received.load(Ordering::SeqCst)
    }

    /// Receiver counters
    pub fn receiver_stats(&self) -> ReceiverStats {
        ReceiverStats {
            received: self.counters.received.load(Ordering::SeqCst),
            skipped_bytes: self.counters.skipped_bytes.load(Ordering::SeqCst),
            checksum_failures: self.counters.checksum_failures.load(Ordering::SeqCst),
        }
    }

    /// Zero the transmit and receive counters
    pub fn reset_counters(&self) {
        self.counters.transmitted.store(0, Ordering::SeqCst);
        self.counters.received.store(0, Ordering::SeqCst);
        self.counters.skipped_bytes.store(0, Ordering::SeqCst);
        self.counters.checksum_failures.store(0, Ordering::SeqCst);
    }

    /// Stop the receiver thread and close the transport. Idempotent.
    pub fn close(&self) {
        let task = lock(&self.receiver).take();
        if let Some(task) = task {
            task.cancel.cancel();
            if task.handle.join().is_err() {
                error!(target: "svh::interface", "receiver thread panicked");
            }
            debug!(target: "svh::interface", "receiver thread stopped");
        }
        let mut sender = lock(&self.sender);
        if sender.transport.is_open() {
            sender.transport.close();
            info!(target: "svh::interface", "serial interface closed");
        }
    }
}

impl Drop for SerialInterface {
    fn drop(&mut self) {
        self.close();
    }
}

fn receive_loop(
    mut reader: Box<dyn ByteTransport>,
    cancel: CancellationToken,
    handler: PacketHandler,
    counters: Arc<Counters>,
    timeout: Duration,
) {
    let mut receiver = FrameReceiver::new();
    let mut buf = [0u8; 256];
    let mut last_error: Option<String> = None;

    while !cancel.is_cancelled() {
        let n = match reader.read(&mut buf, timeout) {
            Ok(n) => n,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ) =>
            {
                continue
            }
            Err(e) => {
                let message = e.to_string();
                if last_error.as_deref() != Some(message.as_str()) {
                    error!(target: "svh::receiver", "read failed: {message}");
                    last_error = Some(message);
                }
                thread::sleep(timeout);
                continue;
            }
        };
        if n == 0 {
            continue;
        }
        last_error = None;

        let before = receiver.stats();
        receiver.feed_all(&buf[..n], |mut received| {
            if received.checksum_ok {
                received.received_count = counters.received.fetch_add(1, Ordering::SeqCst) + 1;
            } else {
                counters.checksum_failures.fetch_add(1, Ordering::SeqCst);
                received.received_count = counters.received.load(Ordering::SeqCst);
            }
            handler(received);
        });
        let skipped = receiver.stats().skipped_bytes - before.skipped_bytes;
        if skipped > 0 {
            counters.skipped_bytes.fetch_add(skipped, Ordering::SeqCst);
        }
    }

    reader.close();
}
