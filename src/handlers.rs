//! Per-type handling of validated control messages.
//!
//! Datagrams and stream frames converge here. Payload records go to the
//! [`Replication`] collaborator, pings and timestamp probes are answered straight away,
//! and timestamp acknowledgements close an RTT measurement.
use std::sync::Arc;

use log::{info, trace, warn};

use crate::{
    clock::Clock,
    error::NetError,
    protocol::{
        CoherencyLease, Envelope, EnvelopeRef, FilePageHint, Lsn, MessageType,
        PageCompactRequest, Payload, SequenceAck, Timestamp,
    },
    registry::HostName,
    replication::Replication,
    throttle::Throttle,
    transport::{DatagramSender, StreamOptions, StreamTransport},
};

/// RTT probe variants; the reply type tells the prober which one came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Datagram probe answered by datagram.
    Datagram,
    /// Stream probe answered over the stream.
    Stream,
    /// Stream probe answered by datagram.
    StreamWithDatagramReply,
}

impl Probe {
    pub fn request_type(self) -> MessageType {
        match self {
            Probe::Datagram => MessageType::UdpTimestamp,
            Probe::Stream => MessageType::TcpTimestamp,
            Probe::StreamWithDatagramReply => MessageType::PingTimestamp,
        }
    }

    pub fn reply_type(self) -> MessageType {
        match self {
            Probe::Datagram => MessageType::UdpTimestampAck,
            Probe::Stream => MessageType::TcpTimestampAck,
            Probe::StreamWithDatagramReply => MessageType::PingTimestampAck,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Probe::Datagram => "UDP",
            Probe::Stream => "TCP",
            Probe::StreamWithDatagramReply => "TCP->UDP",
        }
    }
}

/// What a handler did with a message.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Dispatch {
    /// Decoded and handed to the replication collaborator.
    Delivered(MessageType),
    /// Answered with a message of this type.
    Replied(MessageType),
    /// Closed an RTT measurement.
    Rtt { probe: Probe, millis: f64 },
    /// Bare acknowledgement, nothing to do.
    Acked,
    /// Not handled on this channel.
    Unknown(i32),
}

pub struct Handlers {
    me: HostName,
    sender: Arc<DatagramSender>,
    stream: Arc<dyn StreamTransport>,
    replication: Arc<dyn Replication>,
    clock: Arc<dyn Clock>,
    enqueue_log: Throttle,
}

impl Handlers {
    pub fn new(
        me: HostName,
        sender: Arc<DatagramSender>,
        stream: Arc<dyn StreamTransport>,
        replication: Arc<dyn Replication>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            me,
            sender,
            stream,
            replication,
            clock,
            enqueue_log: Throttle::per_second(),
        }
    }

    pub fn on_datagram(
        &self,
        from: &HostName,
        envelope: &EnvelopeRef<'_>,
    ) -> Result<Dispatch, NetError> {
        let kind = match envelope.message_type() {
            Ok(kind) => kind,
            Err(raw) => return Ok(Dispatch::Unknown(raw)),
        };

        match kind {
            MessageType::SequenceAck
            | MessageType::UdpPrefault
            | MessageType::CoherencyLease
            | MessageType::PageCompact => self.deliver(from, kind, envelope.payload),
            MessageType::UdpAck => {
                trace!("received ack from {from}");
                Ok(Dispatch::Acked)
            }
            MessageType::UdpPing => {
                self.sender
                    .send(from, &Envelope::bare(MessageType::UdpAck, &self.me))?;
                Ok(Dispatch::Replied(MessageType::UdpAck))
            }
            MessageType::UdpTimestamp => {
                let reply = envelope.echo(MessageType::UdpTimestampAck, &self.me);
                self.sender.send(from, &reply)?;
                trace!("recd timestamp from {from}");
                Ok(Dispatch::Replied(MessageType::UdpTimestampAck))
            }
            MessageType::UdpTimestampAck => self.rtt(from, Probe::Datagram, envelope.payload),
            MessageType::PingTimestampAck => {
                self.rtt(from, Probe::StreamWithDatagramReply, envelope.payload)
            }
            _ => Ok(Dispatch::Unknown(kind.into())),
        }
    }

    /// Stream frames carry bare payloads, except timestamp probes which carry a whole
    /// envelope so the echo can travel back unchanged.
    pub fn on_stream(
        &self,
        from: &HostName,
        message_type: i32,
        payload: &[u8],
    ) -> Result<Dispatch, NetError> {
        let kind = match MessageType::try_from(message_type) {
            Ok(kind) => kind,
            Err(_) => return Ok(Dispatch::Unknown(message_type)),
        };

        match kind {
            MessageType::SequenceAck
            | MessageType::UdpPrefault
            | MessageType::CoherencyLease
            | MessageType::PageCompact
            | MessageType::TruncateLog => self.deliver(from, kind, payload),
            MessageType::TcpTimestamp => {
                let probe = EnvelopeRef::parse(payload)?;
                let reply = probe.echo(MessageType::TcpTimestampAck, &self.me);
                self.stream.send(
                    from,
                    MessageType::TcpTimestampAck,
                    &reply.to_bytes()?,
                    StreamOptions {
                        nodelay: true,
                        timeout: None,
                    },
                )?;
                Ok(Dispatch::Replied(MessageType::TcpTimestampAck))
            }
            MessageType::TcpTimestampAck => {
                let ack = EnvelopeRef::parse(payload)?;
                self.rtt(from, Probe::Stream, ack.payload)
            }
            MessageType::PingTimestamp => {
                let probe = EnvelopeRef::parse(payload)?;
                let reply = probe.echo(MessageType::PingTimestampAck, &self.me);
                self.sender.send(from, &reply)?;
                Ok(Dispatch::Replied(MessageType::PingTimestampAck))
            }
            _ => Ok(Dispatch::Unknown(message_type)),
        }
    }

    fn deliver(
        &self,
        from: &HostName,
        kind: MessageType,
        payload: &[u8],
    ) -> Result<Dispatch, NetError> {
        match kind {
            MessageType::SequenceAck => {
                let ack = SequenceAck::decode(payload)?;
                trace!("received lsn {} from {from}", ack.lsn);
                self.replication.on_sequence_ack(from, ack);
            }
            MessageType::UdpPrefault => {
                let hint = FilePageHint::decode(payload)?;
                if let Err(e) = self.replication.enqueue_prefetch(hint) {
                    if self.enqueue_log.ready() {
                        warn!(
                            "dropped prefetch of {}:{} from {from}: {e}",
                            hint.file_id, hint.page_no
                        );
                    }
                }
            }
            MessageType::CoherencyLease => {
                let lease = CoherencyLease::decode(payload)?;
                self.replication.on_lease(from, lease);
            }
            MessageType::PageCompact => {
                let request = PageCompactRequest::decode(payload)?;
                self.replication.on_compaction_request(from, request);
            }
            MessageType::TruncateLog => {
                let lsn = Lsn::decode(payload)?;
                self.replication.on_truncate_request(from, lsn);
            }
            _ => return Ok(Dispatch::Unknown(kind.into())),
        }
        Ok(Dispatch::Delivered(kind))
    }

    fn rtt(&self, from: &HostName, probe: Probe, payload: &[u8]) -> Result<Dispatch, NetError> {
        let sent = Timestamp::decode(payload)?;
        let now = self.clock.timestamp();
        let millis = now.as_micros().saturating_sub(sent.as_micros()) as f64 / 1000.0;

        info!("NODE:{from} {} time:{millis:.3}ms", probe.label());
        Ok(Dispatch::Rtt { probe, millis })
    }
}
