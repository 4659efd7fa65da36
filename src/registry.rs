//! Per-peer coherency state keyed by interned host names.
//!
//! Host names are interned as `Arc<str>`: every lookup of an equal name hands back the
//! same allocation, so comparisons and repeated logging stay cheap. The registry's
//! mutex is the only way to reach a host's `coherent_state`; it is held for the read or
//! update alone and never across a network call.
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

/// Canonical host identity.
pub type HostName = Arc<str>;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum CoherentState {
    Coherent,
    #[default]
    Incoherent,
    IncoherentSlow,
    IncoherentWait,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostEntry {
    pub host: HostName,
    pub coherent_state: CoherentState,
}

#[derive(Debug, Default)]
pub struct HostRegistry {
    hosts: Mutex<HashMap<HostName, HostEntry>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<HostName, HostEntry>> {
        self.hosts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the canonical name for `name`, registering the host on first sighting.
    pub fn intern(&self, name: &str) -> HostName {
        let mut hosts = self.lock();
        if let Some(entry) = hosts.get(name) {
            return Arc::clone(&entry.host);
        }

        let host: HostName = Arc::from(name);
        hosts.insert(
            Arc::clone(&host),
            HostEntry {
                host: Arc::clone(&host),
                coherent_state: CoherentState::default(),
            },
        );
        host
    }

    /// Unknown hosts read as [`CoherentState::Incoherent`].
    pub fn coherent_state(&self, name: &str) -> CoherentState {
        self.lock()
            .get(name)
            .map(|entry| entry.coherent_state)
            .unwrap_or_default()
    }

    pub fn set_coherent_state(&self, name: &str, state: CoherentState) {
        let mut hosts = self.lock();
        match hosts.get_mut(name) {
            Some(entry) => entry.coherent_state = state,
            None => {
                let host: HostName = Arc::from(name);
                hosts.insert(
                    Arc::clone(&host),
                    HostEntry {
                        host,
                        coherent_state: state,
                    },
                );
            }
        }
    }

    pub fn entry(&self, name: &str) -> Option<HostEntry> {
        self.lock().get(name).cloned()
    }

    pub fn hosts(&self) -> Vec<HostName> {
        self.lock().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// Compact host identifier used where a full name does not fit: CRC-32C
/// (Castagnoli) of the name bytes.
pub fn host_checksum(name: &str) -> u32 {
    crc32c::crc32c(name.as_bytes())
}
