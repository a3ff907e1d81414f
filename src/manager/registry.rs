use std::collections::HashMap;

use crate::device::DeviceRecord;
use crate::hw::PeerId;
use crate::session::DeviceSession;

/// Sessions keyed by lock address, plus the transport peer bound to each.
#[derive(Debug, Default)]
pub(crate) struct DeviceRegistry {
    sessions: HashMap<String, DeviceSession>,
    peers: HashMap<PeerId, String>,
    names: HashMap<PeerId, String>,
}

impl DeviceRegistry {
    /// Inserts a new lock. Returns `false` if the address is already known.
    pub(crate) fn insert(&mut self, record: DeviceRecord) -> bool {
        if self.sessions.contains_key(record.address()) {
            return false;
        }
        let address = record.address().to_string();
        self.sessions.insert(address, DeviceSession::new(record));
        true
    }

    pub(crate) fn remove(&mut self, address: &str) -> Option<DeviceSession> {
        let session = self.sessions.remove(address)?;
        if let Some(peer) = session.peer() {
            self.peers.remove(peer);
        }
        Some(session)
    }

    pub(crate) fn contains(&self, address: &str) -> bool {
        self.sessions.contains_key(address)
    }

    pub(crate) fn get(&self, address: &str) -> Option<&DeviceSession> {
        self.sessions.get(address)
    }

    pub(crate) fn get_mut(&mut self, address: &str) -> Option<&mut DeviceSession> {
        self.sessions.get_mut(address)
    }

    pub(crate) fn address_for_peer(&self, peer: &PeerId) -> Option<&str> {
        self.peers.get(peer).map(String::as_str)
    }

    /// Associates a transport peer with a lock, replacing any stale binding.
    pub(crate) fn bind_peer(&mut self, address: &str, peer: PeerId) {
        let Some(session) = self.sessions.get_mut(address) else {
            return;
        };
        if session.peer() == Some(&peer) {
            return;
        }
        if let Some(previous) = session.peer() {
            self.peers.remove(previous);
        }
        self.peers.insert(peer.clone(), address.to_string());
        session.set_peer(peer);
    }

    /// Last lock name seen from `peer`, used when an advertisement omits it.
    pub(crate) fn cached_name(&self, peer: &PeerId) -> Option<&str> {
        self.names.get(peer).map(String::as_str)
    }

    pub(crate) fn remember_name(&mut self, peer: &PeerId, name: &str) {
        if self.names.get(peer).is_some_and(|cached| cached == name) {
            return;
        }
        self.names.insert(peer.clone(), name.to_string());
    }

    pub(crate) fn records(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self
            .sessions
            .values()
            .map(|session| session.record().clone())
            .collect();
        records.sort_by(|left, right| left.address().cmp(right.address()));
        records
    }

    /// Address of the lock holding the admission slot. Locks in firmware-update
    /// mode never hold it.
    pub(crate) fn active_device(&self) -> Option<String> {
        self.sessions
            .values()
            .find(|session| session.state().is_active() && !session.is_firmware_update())
            .map(|session| session.address().to_string())
    }
}
