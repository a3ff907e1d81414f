use async_trait::async_trait;
use derive_more::{Display, From, Into};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::Packet;
use crate::error::TransportError;
use crate::protocol::LockCharacteristic;

/// Transport-level handle for one peripheral.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Display, From, Into, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One advertisement as reported by the radio.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Advertisement {
    pub peer: PeerId,
    pub local_name: Option<String>,
    /// Manufacturer data including the leading company identifier.
    pub manufacturer_data: Vec<u8>,
    pub rssi: Option<i16>,
}

/// Asynchronous input from the radio.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportEvent {
    Advertisement(Advertisement),
    Notification {
        peer: PeerId,
        characteristic: LockCharacteristic,
        value: Vec<u8>,
    },
    Disconnected {
        peer: PeerId,
    },
}

/// Radio operations the device manager drives.
///
/// Implementations report advertisements, notifications and disconnects on
/// the event channel handed out at construction.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn start_scan(&self, services: &[Uuid], allow_duplicates: bool)
    -> Result<(), TransportError>;

    async fn stop_scan(&self) -> Result<(), TransportError>;

    async fn connect(&self, peer: &PeerId) -> Result<(), TransportError>;

    async fn disconnect(&self, peer: &PeerId) -> Result<(), TransportError>;

    /// Discovers services and returns the lock characteristics present.
    async fn discover_characteristics(
        &self,
        peer: &PeerId,
    ) -> Result<Vec<LockCharacteristic>, TransportError>;

    async fn write_without_response(
        &self,
        peer: &PeerId,
        characteristic: LockCharacteristic,
        packet: &Packet,
    ) -> Result<(), TransportError>;

    async fn read_value(
        &self,
        peer: &PeerId,
        characteristic: LockCharacteristic,
    ) -> Result<Vec<u8>, TransportError>;

    async fn subscribe(
        &self,
        peer: &PeerId,
        characteristic: LockCharacteristic,
    ) -> Result<(), TransportError>;
}
