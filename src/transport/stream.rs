//! Reliable stream channel.
//!
//! [`StreamTransport`] is what the rest of the crate depends on. [`TcpStreamTransport`]
//! and [`StreamServer`] are a small reference implementation: one TCP connection per
//! message, each carrying a single bincode-encoded [`Frame`]. Clusters with their own
//! connection management implement the trait over that instead.
use std::{
    collections::HashSet,
    io::{self, Read, Write},
    net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use bincode::{
    Decode, Encode,
    config::{BigEndian, Configuration, Fixint, Limit},
    decode_from_std_read, encode_into_std_write,
};
use log::{debug, info, warn};

use crate::{
    Node, pool::WorkerPool, protocol::MessageType, receiver::POLL_INTERVAL,
    registry::HostName,
};

use super::{TransportError, resolve_host};

/// Largest frame a peer may send.
pub const MAX_FRAME_LEN: usize = 64 * 1024;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamOptions {
    /// Flush immediately rather than batching with later messages.
    pub nodelay: bool,
    /// Upper bound on connecting and writing; `None` uses the transport default.
    pub timeout: Option<Duration>,
}

pub trait StreamTransport: Send + Sync {
    fn send(
        &self,
        to: &str,
        message_type: MessageType,
        payload: &[u8],
        options: StreamOptions,
    ) -> Result<(), TransportError>;

    /// Peers with a live connection, in the transport's own order.
    fn connected_hosts(&self) -> Vec<HostName>;

    /// Every peer expected to be part of the cluster.
    fn commissioned_hosts(&self) -> Vec<HostName>;
}

/// One message on the stream channel.
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Frame {
    pub message_type: i32,
    pub from: String,
    pub payload: Vec<u8>,
}

pub struct FrameTransport<T: Read + Write> {
    stream: T,
    config: Configuration<BigEndian, Fixint, Limit<MAX_FRAME_LEN>>,
}

impl<T: Read + Write> FrameTransport<T> {
    pub fn new(stream: T) -> Self {
        let config = bincode::config::standard()
            .with_big_endian()
            .with_fixed_int_encoding()
            .with_limit::<MAX_FRAME_LEN>();
        Self { stream, config }
    }

    pub fn write_frame(&mut self, frame: &Frame) -> Result<(), TransportError> {
        encode_into_std_write(frame, &mut self.stream, self.config)?;
        self.stream.flush()?;
        Ok(())
    }

    pub fn read_frame(&mut self) -> Result<Frame, TransportError> {
        let frame: Frame = decode_from_std_read(&mut self.stream, self.config)?;
        Ok(frame)
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }
}

/// Connect-per-message TCP transport over a static peer list.
#[derive(Debug)]
pub struct TcpStreamTransport {
    me: HostName,
    peers: Vec<HostName>,
    default_port: u16,
    unreachable: Mutex<HashSet<HostName>>,
}

impl TcpStreamTransport {
    /// `peers` are the commissioned hosts; `me` is skipped if listed.
    pub fn new(me: HostName, peers: Vec<HostName>, default_port: u16) -> Self {
        let peers = peers.into_iter().filter(|p| *p != me).collect();
        Self {
            me,
            peers,
            default_port,
            unreachable: Mutex::new(HashSet::new()),
        }
    }

    fn mark(&self, host: &str, reachable: bool) {
        let mut unreachable = self
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if reachable {
            if unreachable.remove(host) {
                info!("stream connection to {host} restored");
            }
        } else if let Some(peer) = self.peers.iter().find(|p| &***p == host) {
            if unreachable.insert(Arc::clone(peer)) {
                warn!("stream connection to {host} lost");
            }
        }
    }

    fn connect(&self, to: &str, timeout: Duration) -> Result<TcpStream, TransportError> {
        let addr = resolve_host(to, self.default_port)
            .ok_or_else(|| TransportError::Discarded(to.to_string()))?;
        let stream = TcpStream::connect_timeout(&addr, timeout)?;
        stream.set_write_timeout(Some(timeout))?;
        Ok(stream)
    }
}

impl StreamTransport for TcpStreamTransport {
    fn send(
        &self,
        to: &str,
        message_type: MessageType,
        payload: &[u8],
        options: StreamOptions,
    ) -> Result<(), TransportError> {
        let timeout = options.timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let frame = Frame {
            message_type: message_type.into(),
            from: self.me.to_string(),
            payload: payload.to_vec(),
        };

        let result = self.connect(to, timeout).and_then(|stream| {
            stream.set_nodelay(options.nodelay)?;
            FrameTransport::new(stream).write_frame(&frame)
        });
        self.mark(to, result.is_ok());
        result
    }

    fn connected_hosts(&self) -> Vec<HostName> {
        let unreachable = self
            .unreachable
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.peers
            .iter()
            .filter(|p| !unreachable.contains(*p))
            .cloned()
            .collect()
    }

    fn commissioned_hosts(&self) -> Vec<HostName> {
        self.peers.clone()
    }
}

/// Accepts stream connections and feeds their frames into a [`Node`].
pub struct StreamServer {
    listener: TcpListener,
    pool: WorkerPool,
}

impl StreamServer {
    pub fn bind<A: ToSocketAddrs>(address: A, pool: WorkerPool) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(address)?;
        listener.set_nonblocking(true)?;
        Ok(Self { listener, pool })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Runs until `shutdown` is set. Open connections notice the flag within
    /// [`POLL_INTERVAL`], so this returns promptly even if a peer stays idle.
    pub fn serve(self, node: Arc<Node>, shutdown: Arc<AtomicBool>) -> Result<(), TransportError> {
        info!("stream channel listening at {}", self.listener.local_addr()?);

        while !shutdown.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if let Err(e) = stream
                        .set_nonblocking(false)
                        .and_then(|()| stream.set_read_timeout(Some(POLL_INTERVAL)))
                    {
                        warn!("dropping stream connection from {peer}: {e}");
                        continue;
                    }
                    let node = Arc::clone(&node);
                    let shutdown = Arc::clone(&shutdown);
                    if let Err(e) = self
                        .pool
                        .execute(move || handle_connection(stream, peer, &node, &shutdown))
                    {
                        warn!("dropping stream connection from {peer}: {e}");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_BACKOFF),
                Err(e) => warn!("broken connection: {e:?}"),
            }
        }
        Ok(())
    }
}

/// Waits for the first byte of the next frame. `false` once the peer closes or
/// shutdown begins.
fn frame_pending(stream: &TcpStream, peer: SocketAddr, shutdown: &AtomicBool) -> bool {
    let mut byte = [0; 1];
    while !shutdown.load(Ordering::Relaxed) {
        match stream.peek(&mut byte) {
            Ok(0) => return false,
            Ok(_) => return true,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                ) => {}
            Err(e) => {
                debug!("stream from {peer} failed: {e}");
                return false;
            }
        }
    }
    false
}

fn handle_connection(stream: TcpStream, peer: SocketAddr, node: &Node, shutdown: &AtomicBool) {
    let mut transport = FrameTransport::new(stream);

    while frame_pending(transport.get_ref(), peer, shutdown) {
        let frame = match transport.read_frame() {
            Ok(frame) => frame,
            Err(e) => {
                debug!("stream from {peer} closed: {e}");
                return;
            }
        };

        if let Err(e) = node.on_stream_message(&frame.from, frame.message_type, &frame.payload) {
            warn!(
                "failed to handle stream message type {} from {}: {e}",
                frame.message_type, frame.from
            );
        }
    }
}
