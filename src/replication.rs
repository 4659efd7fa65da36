//! Boundary to the replication engine.
//!
//! Everything this crate learns from the network is handed to a [`Replication`]
//! implementation, and everything it needs to know about the cluster's write state
//! (the current coordinator, the replication generation, the master lease) comes from
//! it. Callbacks run on the receiver thread and must not block.
use log::debug;

use crate::{
    error::QueueError,
    protocol::{CoherencyLease, FilePageHint, Lsn, PageCompactRequest, SequenceAck},
    registry::HostName,
};

pub trait Replication: Send + Sync {
    /// Node currently accepting writes, if one is known.
    fn master(&self) -> Option<HostName>;

    /// Replication generation stamped on outgoing acknowledgements.
    fn generation(&self) -> u32;

    /// This node's latest durable sequence record, if it has one.
    fn current_sequence(&self) -> Option<SequenceAck> {
        None
    }

    /// Whether this node still holds the master lease for `commissioned`.
    fn verify_master_lease(&self, commissioned: &[HostName]) -> bool;

    fn on_sequence_ack(&self, from: &HostName, ack: SequenceAck);

    fn on_lease(&self, from: &HostName, lease: CoherencyLease);

    fn on_compaction_request(&self, from: &HostName, request: PageCompactRequest);

    fn on_truncate_request(&self, _from: &HostName, _lsn: Lsn) {}

    fn enqueue_prefetch(&self, hint: FilePageHint) -> Result<(), QueueError>;

    fn enqueue_compaction_work(&self, request: &PageCompactRequest) -> Result<(), QueueError>;
}

/// Collaborator for tools that talk to a cluster without replicating anything: no
/// coordinator, inbound records are logged and dropped, work queues refuse requests.
#[derive(Debug, Default, Clone, Copy)]
pub struct Detached;

impl Replication for Detached {
    fn master(&self) -> Option<HostName> {
        None
    }

    fn generation(&self) -> u32 {
        0
    }

    fn verify_master_lease(&self, _commissioned: &[HostName]) -> bool {
        false
    }

    fn on_sequence_ack(&self, from: &HostName, ack: SequenceAck) {
        debug!("ignoring ack {} from {from}", ack.lsn);
    }

    fn on_lease(&self, from: &HostName, lease: CoherencyLease) {
        debug!("ignoring lease from {from} until {}", lease.expires_at_ms());
    }

    fn on_compaction_request(&self, from: &HostName, request: PageCompactRequest) {
        debug!("ignoring compaction of file {} from {from}", request.file_id);
    }

    fn enqueue_prefetch(&self, _hint: FilePageHint) -> Result<(), QueueError> {
        Err(QueueError("detached node has no prefetch queue".into()))
    }

    fn enqueue_compaction_work(&self, _request: &PageCompactRequest) -> Result<(), QueueError> {
        Err(QueueError("detached node has no compaction queue".into()))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    };

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub(crate) enum Event {
        SequenceAck(String, SequenceAck),
        Lease(String, CoherencyLease),
        Compaction(String, PageCompactRequest),
        Truncate(String, Lsn),
        Prefetch(FilePageHint),
        CompactionWork(PageCompactRequest),
    }

    /// Replication collaborator that records every callback.
    #[derive(Debug)]
    pub(crate) struct RecordingReplication {
        pub(crate) master: Mutex<Option<HostName>>,
        pub(crate) lease_valid: AtomicBool,
        pub(crate) sequence: Mutex<Option<SequenceAck>>,
        events: Mutex<Vec<Event>>,
    }

    impl RecordingReplication {
        pub(crate) fn with_master(master: &str) -> Self {
            Self {
                master: Mutex::new(Some(Arc::from(master))),
                lease_valid: AtomicBool::new(true),
                sequence: Mutex::new(None),
                events: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn events(&self) -> Vec<Event> {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        fn push(&self, event: Event) {
            self.events
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(event);
        }
    }

    impl Replication for RecordingReplication {
        fn master(&self) -> Option<HostName> {
            self.master
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
        }

        fn generation(&self) -> u32 {
            7
        }

        fn current_sequence(&self) -> Option<SequenceAck> {
            *self.sequence.lock().unwrap_or_else(PoisonError::into_inner)
        }

        fn verify_master_lease(&self, _commissioned: &[HostName]) -> bool {
            self.lease_valid.load(Ordering::SeqCst)
        }

        fn on_sequence_ack(&self, from: &HostName, ack: SequenceAck) {
            self.push(Event::SequenceAck(from.to_string(), ack));
        }

        fn on_lease(&self, from: &HostName, lease: CoherencyLease) {
            self.push(Event::Lease(from.to_string(), lease));
        }

        fn on_compaction_request(&self, from: &HostName, request: PageCompactRequest) {
            self.push(Event::Compaction(from.to_string(), request));
        }

        fn on_truncate_request(&self, from: &HostName, lsn: Lsn) {
            self.push(Event::Truncate(from.to_string(), lsn));
        }

        fn enqueue_prefetch(&self, hint: FilePageHint) -> Result<(), QueueError> {
            self.push(Event::Prefetch(hint));
            Ok(())
        }

        fn enqueue_compaction_work(&self, request: &PageCompactRequest) -> Result<(), QueueError> {
            self.push(Event::CompactionWork(request.clone()));
            Ok(())
        }
    }
}
