//! Coherency lease rounds issued by the coordinator.
use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use log::{debug, info, warn};

use crate::{
    clock::Clock,
    config::Config,
    protocol::{CoherencyLease, Envelope, MessageType},
    registry::{CoherentState, HostName, HostRegistry},
    replication::Replication,
    throttle::Throttle,
    transport::{DatagramSender, StreamOptions, StreamTransport},
};

pub struct LeaseBroadcaster {
    config: Config,
    me: HostName,
    registry: Arc<HostRegistry>,
    sender: Arc<DatagramSender>,
    stream: Arc<dyn StreamTransport>,
    replication: Arc<dyn Replication>,
    clock: Arc<dyn Clock>,
    last_count: AtomicUsize,
    base_log: Throttle,
    connectivity_log: Throttle,
    skip_log: Throttle,
}

impl LeaseBroadcaster {
    pub fn new(
        config: Config,
        me: HostName,
        registry: Arc<HostRegistry>,
        sender: Arc<DatagramSender>,
        stream: Arc<dyn StreamTransport>,
        replication: Arc<dyn Replication>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            config,
            me,
            registry,
            sender,
            stream,
            replication,
            clock,
            last_count: AtomicUsize::new(0),
            base_log: Throttle::per_second(),
            connectivity_log: Throttle::per_second(),
            skip_log: Throttle::per_second(),
        }
    }

    /// Sends one lease round to every connected coherent peer.
    ///
    /// Returns `true` if any commissioned peer was left without a lease, either
    /// because it is not connected, is not coherent, or this node failed its own
    /// master lease check.
    pub fn broadcast(&self, lease_duration_ms: i32) -> bool {
        let lease = CoherencyLease {
            issue_time_ms: self.clock.now_ms(),
            lease_duration_ms,
        };
        if self.config.lease_base_trace && self.base_log.ready() {
            info!(
                "lease base {} duration {}ms",
                lease.issue_time_ms, lease.lease_duration_ms
            );
        }

        let envelope = match Envelope::with_payload(MessageType::CoherencyLease, &lease, &self.me)
        {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("failed to encode coherency lease: {e}");
                return true;
            }
        };

        let connected = self.stream.connected_hosts();
        let commissioned = self.stream.commissioned_hosts();
        let last = self.last_count.swap(connected.len(), Ordering::Relaxed);

        let mut incoherent = false;
        if connected.len() != commissioned.len() {
            incoherent = true;
            if self.config.verbose_leases
                && (last != connected.len() || self.connectivity_log.ready())
            {
                let missing: Vec<&str> = commissioned
                    .iter()
                    .filter(|h| !connected.contains(*h))
                    .map(|h| &**h)
                    .collect();
                info!(
                    "only {} of {} nodes are connected, not leasing to {}",
                    connected.len(),
                    commissioned.len(),
                    missing.join(" ")
                );
            }
        } else if last != connected.len() {
            info!("sending coherency leases to all {} nodes", connected.len());
        }

        let master_ok =
            !self.config.master_lease || self.replication.verify_master_lease(&commissioned);

        for host in &connected {
            let state = self.registry.coherent_state(host);
            if !master_ok || state != CoherentState::Coherent {
                incoherent = true;
                if self.config.verbose_leases && self.skip_log.ready() {
                    info!(
                        "not sending lease to {host}: master lease ok {master_ok}, state {state:?}"
                    );
                }
                continue;
            }

            if self.config.coherency_lease_udp {
                if let Err(e) = self.sender.send(host, &envelope) {
                    debug!("lease to {host} over udp failed: {e}");
                }
            } else if let Err(e) = self.stream.send(
                host,
                MessageType::CoherencyLease,
                envelope.payload(),
                StreamOptions::default(),
            ) {
                debug!("lease to {host} over stream failed: {e}");
            }
        }

        incoherent
    }
}
