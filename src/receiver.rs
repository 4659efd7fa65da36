//! Datagram reader loop.
//!
//! A single thread owns the socket and a fixed receive buffer. Each packet is
//! normalized by the transport and then checked, in order, for a size matching what
//! was read, zero legacy peer ids and a well-formed host trailer. Anything that fails
//! is counted and dropped; logging of each class of failure is throttled.
use std::{
    io,
    net::UdpSocket,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{debug, error, info, warn};

use crate::{
    error::NetError,
    handlers::{Dispatch, Handlers},
    protocol::{CodecError, EnvelopeRef, RecvBuffer},
    registry::HostRegistry,
    stats::Stats,
    throttle::Throttle,
    transport::DatagramTransport,
};

/// How long a blocked read waits before the shutdown flag is rechecked.
pub const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Why a packet was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejected {
    /// The transport's normalization rejected it.
    Normalized,
    /// Declared sizes disagree with the bytes read.
    LenMismatch,
    /// Legacy `from`/`to` ids were set.
    DestMismatch,
    /// Bad host trailer or undecodable payload.
    Malformed,
    /// Valid message whose handler failed after decoding, e.g. a reply that could
    /// not be sent.
    Handler,
}

pub struct Receiver {
    transport: Arc<dyn DatagramTransport>,
    registry: Arc<HostRegistry>,
    handlers: Arc<Handlers>,
    stats: Arc<Stats>,
    buf: RecvBuffer,
    recv_log: Throttle,
    len_log: Throttle,
    dest_log: Throttle,
    malformed_log: Throttle,
    unknown_log: Throttle,
}

impl Receiver {
    pub fn new(
        transport: Arc<dyn DatagramTransport>,
        registry: Arc<HostRegistry>,
        handlers: Arc<Handlers>,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            transport,
            registry,
            handlers,
            stats,
            buf: RecvBuffer::new(),
            recv_log: Throttle::per_second(),
            len_log: Throttle::per_second(),
            dest_log: Throttle::per_second(),
            malformed_log: Throttle::per_second(),
            unknown_log: Throttle::per_second(),
        }
    }

    /// Starts the reader thread. It exits within [`POLL_INTERVAL`] of `shutdown`
    /// being set.
    pub fn spawn(
        mut self,
        socket: UdpSocket,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<JoinHandle<()>> {
        socket.set_read_timeout(Some(POLL_INTERVAL))?;

        thread::Builder::new()
            .name("repnet-udp-reader".into())
            .spawn(move || {
                info!("udp reader listening on {:?}", socket.local_addr());
                while !shutdown.load(Ordering::Relaxed) {
                    self.poll(&socket);
                }
                info!("udp reader stopped");
            })
    }

    /// Blocks for at most the socket's read timeout. `None` means nothing was read.
    pub fn poll(&mut self, socket: &UdpSocket) -> Option<Result<Dispatch, Rejected>> {
        match socket.recv_from(self.buf.as_mut_slice()) {
            Ok((n, _)) => {
                self.stats.record_received();
                Some(self.process(n))
            }
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) =>
            {
                None
            }
            Err(e) => {
                if self.recv_log.ready() {
                    error!("udp reader: recvfrom failed: {e}");
                }
                None
            }
        }
    }

    /// Handles a packet that arrived by some other means, as if it had been read
    /// from the socket.
    pub fn feed(&mut self, packet: &[u8]) -> Result<Dispatch, Rejected> {
        let n = self.buf.fill(packet);
        self.stats.record_received();
        self.process(n)
    }

    /// Validates and dispatches the first `received` bytes of the buffer.
    fn process(&mut self, received: usize) -> Result<Dispatch, Rejected> {
        let len = self.transport.normalize(self.buf.as_mut_slice(), received);
        if len == 0 {
            return Err(Rejected::Normalized);
        }

        let Some(packet) = self.buf.packet(len) else {
            self.stats.record_len_mismatch();
            return Err(Rejected::LenMismatch);
        };

        let envelope = match EnvelopeRef::parse(packet) {
            Ok(envelope) => envelope,
            Err(e @ (CodecError::Truncated { .. } | CodecError::SizeMismatch { .. })) => {
                self.stats.record_len_mismatch();
                if self.len_log.ready() {
                    warn!("udp reader: {e}");
                }
                return Err(Rejected::LenMismatch);
            }
            Err(e @ CodecError::UnexpectedPeerIds { .. }) => {
                self.stats.record_dest_mismatch();
                if self.dest_log.ready() {
                    warn!("udp reader: {e}");
                }
                return Err(Rejected::DestMismatch);
            }
            Err(e) => {
                self.stats.record_malformed();
                if self.malformed_log.ready() {
                    warn!("udp reader: malformed packet: {e}");
                }
                return Err(Rejected::Malformed);
            }
        };

        let from = self.registry.intern(envelope.source_host);
        match self.handlers.on_datagram(&from, &envelope) {
            Ok(Dispatch::Unknown(kind)) => {
                if self.unknown_log.ready() {
                    warn!("udp reader: recd unknown packet type {kind} from {from}");
                }
                Ok(Dispatch::Unknown(kind))
            }
            Ok(dispatch) => Ok(dispatch),
            Err(NetError::Codec(e)) => {
                self.stats.record_malformed();
                if self.malformed_log.ready() {
                    warn!(
                        "udp reader: bad payload for type {} from {from}: {e}",
                        envelope.header.message_type
                    );
                }
                Err(Rejected::Malformed)
            }
            Err(e) => {
                debug!("udp reader: handling message from {from} failed: {e}");
                Err(Rejected::Handler)
            }
        }
    }
}
