//! Datagram channel counters.
//!
//! Counters are advisory: they are bumped with relaxed atomics from the sender and the
//! receiver loop and must never drive correctness decisions. A [`Stats`] instance is
//! injected into each sender and receiver so tests can observe one node in isolation.
use std::{
    fmt,
    sync::atomic::{AtomicU32, Ordering},
};

#[derive(Debug, Default)]
pub struct Stats {
    sent: AtomicU32,
    failed: AtomicU32,
    received: AtomicU32,
    len_mismatch: AtomicU32,
    dest_mismatch: AtomicU32,
    malformed: AtomicU32,
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counters {
    pub sent: u32,
    pub failed: u32,
    pub received: u32,
    pub len_mismatch: u32,
    pub dest_mismatch: u32,
    pub malformed: u32,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self) {
        self.sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self) {
        self.received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_len_mismatch(&self) {
        self.len_mismatch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_dest_mismatch(&self) {
        self.dest_mismatch.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_malformed(&self) {
        self.malformed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Counters {
        Counters {
            sent: self.sent.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            len_mismatch: self.len_mismatch.load(Ordering::Relaxed),
            dest_mismatch: self.dest_mismatch.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.sent,
            &self.failed,
            &self.received,
            &self.len_mismatch,
            &self.dest_mismatch,
            &self.malformed,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl fmt::Display for Counters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "udp packets sent: {}", self.sent)?;
        writeln!(f, "udp packets failed to send: {}", self.failed)?;
        writeln!(f, "udp packets received: {}", self.received)?;
        writeln!(
            f,
            "udp packets received with len mismatch: {}",
            self.len_mismatch
        )?;
        writeln!(
            f,
            "udp packets received with destination mismatch: {}",
            self.dest_mismatch
        )?;
        write!(f, "udp packets received malformed: {}", self.malformed)
    }
}
