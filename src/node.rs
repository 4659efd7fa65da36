//! Public entry points of the control plane.
//!
//! A [`Node`] ties one host identity to its transports, its replication engine and the
//! shared host registry. Send-side operations run synchronously on the caller's
//! thread; the only thread this crate starts on its own is the datagram reader.
use std::{
    io,
    net::{SocketAddr, UdpSocket},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::JoinHandle,
    time::Duration,
};

use log::{debug, error, info, warn};

use crate::{
    clock::{Clock, SystemClock},
    config::Config,
    error::NetError,
    handlers::{Dispatch, Handlers, Probe},
    lease::LeaseBroadcaster,
    protocol::{
        Envelope, FilePageHint, Lsn, MessageType, PAGE_COMPACT_MAX_LEN, PageCompactRequest,
        Payload, SequenceAck,
    },
    receiver::Receiver,
    registry::{HostName, HostRegistry, host_checksum},
    replication::Replication,
    stats::{Counters, Stats},
    throttle::Throttle,
    transport::{DatagramSender, DatagramTransport, StreamOptions, StreamTransport},
};

/// Upper bound on delivering a truncate request to the coordinator.
pub const TRUNCATE_TIMEOUT: Duration = Duration::from_secs(10);

const URGENT: StreamOptions = StreamOptions {
    nodelay: true,
    timeout: None,
};

pub struct Node {
    config: Config,
    me: HostName,
    registry: Arc<HostRegistry>,
    stats: Arc<Stats>,
    transport: Arc<dyn DatagramTransport>,
    sender: Arc<DatagramSender>,
    stream: Arc<dyn StreamTransport>,
    replication: Arc<dyn Replication>,
    clock: Arc<dyn Clock>,
    handlers: Arc<Handlers>,
    leases: LeaseBroadcaster,
    acks_sent: AtomicU64,
    ack_log: Throttle,
    sequence_log: Throttle,
}

impl Node {
    pub fn new(
        config: Config,
        me: &str,
        transport: Arc<dyn DatagramTransport>,
        stream: Arc<dyn StreamTransport>,
        replication: Arc<dyn Replication>,
    ) -> Self {
        Self::with_clock(
            config,
            me,
            transport,
            stream,
            replication,
            Arc::new(SystemClock),
        )
    }

    pub fn with_clock(
        config: Config,
        me: &str,
        transport: Arc<dyn DatagramTransport>,
        stream: Arc<dyn StreamTransport>,
        replication: Arc<dyn Replication>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let registry = Arc::new(HostRegistry::new());
        let me = registry.intern(me);
        let stats = Arc::new(Stats::new());
        let sender = Arc::new(DatagramSender::new(
            Arc::clone(&transport),
            Arc::clone(&stats),
        ));
        let handlers = Arc::new(Handlers::new(
            Arc::clone(&me),
            Arc::clone(&sender),
            Arc::clone(&stream),
            Arc::clone(&replication),
            Arc::clone(&clock),
        ));
        let leases = LeaseBroadcaster::new(
            config.clone(),
            Arc::clone(&me),
            Arc::clone(&registry),
            Arc::clone(&sender),
            Arc::clone(&stream),
            Arc::clone(&replication),
            Arc::clone(&clock),
        );

        Self {
            config,
            me,
            registry,
            stats,
            transport,
            sender,
            stream,
            replication,
            clock,
            handlers,
            leases,
            acks_sent: AtomicU64::new(0),
            ack_log: Throttle::per_second(),
            sequence_log: Throttle::per_second(),
        }
    }

    pub fn me(&self) -> &HostName {
        &self.me
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &Arc<HostRegistry> {
        &self.registry
    }

    pub fn is_coordinator(&self) -> bool {
        self.replication.master().as_deref() == Some(&*self.me)
    }

    fn coordinator(&self) -> Result<HostName, NetError> {
        self.replication.master().ok_or(NetError::NoCoordinator)
    }

    /// Acknowledges durability of `lsn` to the coordinator.
    ///
    /// `generation` is the commit generation the caller observed; the current
    /// replication generation is stamped alongside it. An LSN with file number zero
    /// is refused with [`NetError::InvalidLsn`], which callers must treat as fatal.
    pub fn send_ack(&self, lsn: Lsn, generation: u32) -> Result<(), NetError> {
        if !lsn.is_valid() {
            error!("refusing to send ack for illegal lsn {lsn}");
            return Err(NetError::InvalidLsn(lsn));
        }

        let master = self.coordinator()?;
        let ack = SequenceAck {
            lsn,
            generation: self.replication.generation(),
            commit_generation: generation,
        };

        let count = self.acks_sent.fetch_add(1, Ordering::Relaxed) + 1;
        if self.config.ack_trace && self.ack_log.ready() {
            info!(
                "ack {lsn} gen {} commit gen {generation} to {master}, {count} sent",
                ack.generation
            );
        }

        self.send_sequence(&master, &ack)
    }

    /// Re-sends this node's current sequence record to the coordinator.
    pub fn send_current_sequence(&self) -> Result<(), NetError> {
        let Some(ack) = self.replication.current_sequence() else {
            if self.sequence_log.ready() {
                warn!("no current sequence number to send");
            }
            return Err(NetError::NoSequence);
        };
        let master = self.coordinator()?;

        let envelope = Envelope::with_payload(MessageType::SequenceAck, &ack, &self.me)?;
        self.sender.send(&master, &envelope)?;
        Ok(())
    }

    fn send_sequence(&self, master: &str, ack: &SequenceAck) -> Result<(), NetError> {
        if self.config.udp {
            let envelope = Envelope::with_payload(MessageType::SequenceAck, ack, &self.me)?;
            self.sender.send(master, &envelope)?;
        } else {
            self.stream
                .send(master, MessageType::SequenceAck, &ack.to_bytes()?, URGENT)?;
        }
        Ok(())
    }

    /// Runs one coherency lease round. Returns `true` if any peer went unleased.
    pub fn broadcast_leases(&self, lease_duration_ms: i32) -> bool {
        self.leases.broadcast(lease_duration_ms)
    }

    pub fn send_probe(&self, host: &str, probe: Probe) -> Result<(), NetError> {
        let envelope =
            Envelope::with_payload(probe.request_type(), &self.clock.timestamp(), &self.me)?;

        match probe {
            Probe::Datagram => {
                self.sender.send(host, &envelope)?;
            }
            Probe::Stream | Probe::StreamWithDatagramReply => {
                self.stream
                    .send(host, probe.request_type(), &envelope.to_bytes()?, URGENT)?;
            }
        }
        Ok(())
    }

    /// Probes every commissioned peer, returning how many probes left this node.
    pub fn probe_all(&self, probe: Probe) -> usize {
        self.stream
            .commissioned_hosts()
            .iter()
            .filter(|host| match self.send_probe(host, probe) {
                Ok(()) => true,
                Err(e) => {
                    debug!("{} probe to {host} failed: {e}", probe.label());
                    false
                }
            })
            .count()
    }

    pub fn ping(&self, host: &str) -> Result<(), NetError> {
        self.send_probe(host, Probe::Datagram)
    }

    pub fn ping_all(&self) -> usize {
        self.probe_all(Probe::Datagram)
    }

    pub fn tcp_ping(&self, host: &str) -> Result<(), NetError> {
        self.send_probe(host, Probe::Stream)
    }

    pub fn tcp_ping_all(&self) -> usize {
        self.probe_all(Probe::Stream)
    }

    pub fn mixed_ping_all(&self) -> usize {
        self.probe_all(Probe::StreamWithDatagramReply)
    }

    /// Datagram probe to a raw address rather than a peer name.
    pub fn ping_addr(&self, addr: SocketAddr) -> Result<(), NetError> {
        self.ping(&addr.to_string())
    }

    /// Fans a prefetch hint out to every connected peer. Only the coordinator does
    /// this, and only when prefetch hints are enabled; otherwise nothing is sent.
    pub fn request_prefetch_all(&self, file_id: u32, page_no: u32) -> usize {
        if !self.config.prefault_udp || !self.is_coordinator() {
            return 0;
        }

        let hint = FilePageHint { file_id, page_no };
        let envelope = match Envelope::with_payload(MessageType::UdpPrefault, &hint, &self.me) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("failed to encode prefetch hint: {e}");
                return 0;
            }
        };

        self.stream
            .connected_hosts()
            .iter()
            .filter(|host| self.sender.send(host, &envelope).is_ok())
            .count()
    }

    /// Asks the coordinator to compact pages of `file_id`, or queues the work
    /// locally when this node is the coordinator.
    pub fn request_compaction(&self, file_id: i32, data: &[u8]) -> Result<(), NetError> {
        if data.len() > PAGE_COMPACT_MAX_LEN {
            return Err(NetError::TooLarge {
                size: data.len(),
                max: PAGE_COMPACT_MAX_LEN,
            });
        }
        let request = PageCompactRequest::new(file_id, data.to_vec())?;

        let master = self.coordinator()?;
        if master == self.me {
            self.replication.enqueue_compaction_work(&request)?;
            return Ok(());
        }

        if self.config.page_compact_udp {
            let envelope = Envelope::with_payload(MessageType::PageCompact, &request, &self.me)?;
            self.sender.send(&master, &envelope)?;
        } else {
            self.stream
                .send(&master, MessageType::PageCompact, &request.to_bytes()?, URGENT)?;
        }
        Ok(())
    }

    /// Asks the coordinator to truncate its log at `lsn`. Always uses the stream
    /// channel; fails with [`NetError::IsCoordinator`] on the coordinator itself.
    pub fn send_truncate_request(&self, lsn: Lsn) -> Result<(), NetError> {
        let master = self.coordinator()?;
        if master == self.me {
            error!("truncate to {lsn} requested on the coordinator itself");
            return Err(NetError::IsCoordinator);
        }

        self.stream.send(
            &master,
            MessageType::TruncateLog,
            &lsn.to_bytes()?,
            StreamOptions {
                nodelay: true,
                timeout: Some(TRUNCATE_TIMEOUT),
            },
        )?;
        Ok(())
    }

    /// Finds the host whose name checksums to `hash`, checking this node first and
    /// then every commissioned peer. The first match wins.
    pub fn resolve_host_by_hash(&self, hash: u32) -> Option<HostName> {
        if host_checksum(&self.me) == hash {
            return Some(Arc::clone(&self.me));
        }
        self.stream
            .commissioned_hosts()
            .into_iter()
            .find(|host| host_checksum(host) == hash)
    }

    /// Builds a datagram reader sharing this node's handlers and counters.
    pub fn receiver(&self) -> Receiver {
        Receiver::new(
            Arc::clone(&self.transport),
            Arc::clone(&self.registry),
            Arc::clone(&self.handlers),
            Arc::clone(&self.stats),
        )
    }

    /// Starts the datagram reader thread on `socket`.
    pub fn start_receiver(
        &self,
        socket: UdpSocket,
        shutdown: Arc<AtomicBool>,
    ) -> io::Result<JoinHandle<()>> {
        self.receiver().spawn(socket, shutdown)
    }

    /// Entry point for control messages arriving over the stream channel.
    pub fn on_stream_message(
        &self,
        from: &str,
        message_type: i32,
        payload: &[u8],
    ) -> Result<Dispatch, NetError> {
        let from = self.registry.intern(from);
        let dispatch = self.handlers.on_stream(&from, message_type, payload)?;
        if let Dispatch::Unknown(kind) = dispatch {
            debug!("ignoring stream message type {kind} from {from}");
        }
        Ok(dispatch)
    }

    pub fn counters(&self) -> Counters {
        self.stats.snapshot()
    }

    pub fn reset_counters(&self) {
        self.stats.reset();
    }
}
