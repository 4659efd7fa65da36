//! Datagram and stream transports.
//!
//! The datagram side is a strategy seam: [`DatagramTransport`] decides how an
//! [`Envelope`] reaches a named host and how a just-received packet is normalized
//! before validation. [`UdpTransport`] is the default; tests and alternate addressing
//! schemes plug in their own implementation without touching any caller.
//!
//! The stream side ([`StreamTransport`]) is the reliable channel. Its connection and
//! topology management belong to the implementation; this crate only needs to send a
//! typed message to a host and to list connected and commissioned peers.
mod sender;
mod stream;

use std::{
    collections::HashMap,
    io,
    net::{IpAddr, SocketAddr, ToSocketAddrs, UdpSocket},
    sync::{Mutex, MutexGuard, PoisonError},
};

use log::debug;
use thiserror::Error;

use crate::protocol::{CodecError, Envelope};

pub use sender::DatagramSender;
pub use stream::{
    Frame, FrameTransport, StreamOptions, StreamServer, StreamTransport, TcpStreamTransport,
};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport io error: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Soft failure: the message was dropped without touching the network.
    #[error("no route to '{0}', message discarded")]
    Discarded(String),

    #[error("failed to encode frame: {0}")]
    FrameEncode(#[from] bincode::error::EncodeError),

    #[error("failed to decode frame: {0}")]
    FrameDecode(#[from] bincode::error::DecodeError),
}

impl TransportError {
    /// Soft failures are counted but not logged.
    pub fn is_soft(&self) -> bool {
        matches!(self, TransportError::Discarded(_))
    }
}

/// Pluggable datagram delivery.
pub trait DatagramTransport: Send + Sync {
    /// Delivers `envelope` to `to`, returning the number of bytes written.
    fn send(&self, to: &str, envelope: &Envelope) -> Result<usize, TransportError>;

    /// Rewrites a received packet in place and returns the length to validate.
    /// Zero drops the packet.
    fn normalize(&self, _packet: &mut [u8], received: usize) -> usize {
        received
    }
}

/// Resolves `host` to an address. Accepts `ip:port`, bare IPs, `name:port` and bare
/// names; the latter two go through the system resolver.
pub fn resolve_host(host: &str, default_port: u16) -> Option<SocketAddr> {
    if let Ok(addr) = host.parse::<SocketAddr>() {
        return Some(addr);
    }
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, default_port));
    }

    let found = if host.contains(':') {
        host.to_socket_addrs()
    } else {
        (host, default_port).to_socket_addrs()
    };
    match found {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            debug!("failed to resolve '{host}': {e}");
            None
        }
    }
}

/// Default datagram transport over a bound UDP socket.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
    default_port: u16,
    routes: Mutex<HashMap<String, SocketAddr>>,
}

impl UdpTransport {
    pub fn bind<A: ToSocketAddrs>(addr: A, default_port: u16) -> io::Result<Self> {
        Ok(Self::from_socket(UdpSocket::bind(addr)?, default_port))
    }

    pub fn from_socket(socket: UdpSocket, default_port: u16) -> Self {
        Self {
            socket,
            default_port,
            routes: Mutex::new(HashMap::new()),
        }
    }

    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<String, SocketAddr>> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cached address for `host`. Resolution runs without the cache lock held.
    fn route(&self, host: &str) -> Option<SocketAddr> {
        if let Some(addr) = self.routes().get(host) {
            return Some(*addr);
        }

        let addr = resolve_host(host, self.default_port)?;
        self.routes().insert(host.to_string(), addr);
        Some(addr)
    }
}

impl DatagramTransport for UdpTransport {
    fn send(&self, to: &str, envelope: &Envelope) -> Result<usize, TransportError> {
        let bytes = envelope.to_bytes()?;
        let addr = self
            .route(to)
            .ok_or_else(|| TransportError::Discarded(to.to_string()))?;
        Ok(self.socket.send_to(&bytes, addr)?)
    }
}
