use std::collections::HashSet;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use bon::Builder;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info};
use uuid::Uuid;

use super::transport::{Advertisement, PeerId, Transport, TransportEvent};
use crate::codec::Packet;
use crate::error::{FixtureError, TransportError};
use crate::protocol::{LockCharacteristic, PACKET_SIZE};

const DEFAULT_SESSION: [u8; PACKET_SIZE] = [
    0x01, 0x02, 0xB8, 0x0B, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
    0x10, 0x11, 0x12, 0x13, 0x14,
];

/// Parsed fake advertisement fixture records.
///
/// Records are `peer|local_name|rssi|manufacturer_hex` separated by `;`. Use
/// `-` for an absent name or RSSI.
#[derive(Debug, Clone, derive_more::Into)]
pub struct AdvertisementFixture {
    advertisements: Vec<Advertisement>,
}

impl FromStr for AdvertisementFixture {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let advertisements = parse_advertisement_fixture(value)?;
        Ok(Self { advertisements })
    }
}

/// Parsed fake hex payload.
#[derive(Debug, Clone, derive_more::Into)]
pub struct HexPayload {
    payload: Vec<u8>,
}

impl FromStr for HexPayload {
    type Err = FixtureError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let payload = parse_hex(value)?;
        Ok(Self { payload })
    }
}

/// How the fake radio answers connection requests.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Default)]
pub enum ConnectBehaviour {
    #[default]
    Succeed,
    Fail,
    /// Never completes.
    Hang,
}

/// Settings for constructing a fake transport.
#[derive(Debug, Builder)]
pub struct FakeTransportConfig {
    advertisements: AdvertisementFixture,
    session: Option<HexPayload>,
    #[builder(default)]
    connect_behaviour: ConnectBehaviour,
    /// Peers that expose only the bootloader characteristics.
    #[builder(default)]
    firmware_peers: Vec<PeerId>,
    #[builder(default)]
    connect_delay: Duration,
}

/// One recorded transport call.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum TransportCall {
    StartScan,
    StopScan,
    Connect(PeerId),
    Disconnect(PeerId),
    Discover(PeerId),
    Write {
        peer: PeerId,
        characteristic: LockCharacteristic,
        packet: Packet,
    },
    Read {
        peer: PeerId,
        characteristic: LockCharacteristic,
    },
    Subscribe {
        peer: PeerId,
        characteristic: LockCharacteristic,
    },
}

/// Fixture-driven transport for tests and hardware-less runs.
#[derive(Debug, Clone)]
pub struct FakeTransport {
    inner: Arc<FakeInner>,
}

#[derive(Debug)]
struct FakeInner {
    advertisements: Vec<Advertisement>,
    session: Vec<u8>,
    connect_behaviour: ConnectBehaviour,
    firmware_peers: Vec<PeerId>,
    connect_delay: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
    calls: Mutex<Vec<TransportCall>>,
    connected: Mutex<HashSet<PeerId>>,
}

impl FakeTransport {
    /// Creates a fake transport and the event stream it reports on.
    #[must_use]
    pub fn new(config: FakeTransportConfig) -> (Self, mpsc::UnboundedReceiver<TransportEvent>) {
        info!("using fake BLE transport");
        let (events, receiver) = mpsc::unbounded_channel();
        let session = config
            .session
            .map_or_else(|| DEFAULT_SESSION.to_vec(), Into::into);
        let inner = FakeInner {
            advertisements: config.advertisements.into(),
            session,
            connect_behaviour: config.connect_behaviour,
            firmware_peers: config.firmware_peers,
            connect_delay: config.connect_delay,
            events,
            calls: Mutex::new(Vec::new()),
            connected: Mutex::new(HashSet::new()),
        };
        (
            Self {
                inner: Arc::new(inner),
            },
            receiver,
        )
    }

    /// Every call made so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<TransportCall> {
        lock(&self.inner.calls).clone()
    }

    /// Packets written to `peer`, in order.
    #[must_use]
    pub fn writes(&self, peer: &PeerId) -> Vec<Packet> {
        lock(&self.inner.calls)
            .iter()
            .filter_map(|call| match call {
                TransportCall::Write {
                    peer: written,
                    packet,
                    ..
                } if written == peer => Some(*packet),
                _ => None,
            })
            .collect()
    }

    #[must_use]
    pub fn is_connected(&self, peer: &PeerId) -> bool {
        lock(&self.inner.connected).contains(peer)
    }

    /// Delivers a packet from the lock on the receive characteristic.
    pub fn notify(&self, peer: &PeerId, value: &[u8]) {
        self.emit(TransportEvent::Notification {
            peer: peer.clone(),
            characteristic: LockCharacteristic::Receive,
            value: value.to_vec(),
        });
    }

    /// Simulates the lock dropping the link.
    pub fn drop_connection(&self, peer: &PeerId) {
        if lock(&self.inner.connected).remove(peer) {
            self.emit(TransportEvent::Disconnected { peer: peer.clone() });
        }
    }

    fn record(&self, call: TransportCall) {
        lock(&self.inner.calls).push(call);
    }

    fn emit(&self, event: TransportEvent) {
        if self.inner.events.send(event).is_err() {
            debug!("fake transport event receiver dropped");
        }
    }

    fn ensure_connected(&self, peer: &PeerId) -> Result<(), TransportError> {
        if self.is_connected(peer) {
            Ok(())
        } else {
            Err(TransportError::UnknownPeer {
                peer: peer.to_string(),
            })
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn start_scan(
        &self,
        _services: &[Uuid],
        _allow_duplicates: bool,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::StartScan);
        for advertisement in &self.inner.advertisements {
            self.emit(TransportEvent::Advertisement(advertisement.clone()));
        }
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.record(TransportCall::StopScan);
        Ok(())
    }

    async fn connect(&self, peer: &PeerId) -> Result<(), TransportError> {
        self.record(TransportCall::Connect(peer.clone()));
        if !self.inner.connect_delay.is_zero() {
            sleep(self.inner.connect_delay).await;
        }

        match self.inner.connect_behaviour {
            ConnectBehaviour::Succeed => {
                lock(&self.inner.connected).insert(peer.clone());
                Ok(())
            }
            ConnectBehaviour::Fail => Err(TransportError::ConnectionRefused {
                peer: peer.to_string(),
            }),
            ConnectBehaviour::Hang => std::future::pending().await,
        }
    }

    async fn disconnect(&self, peer: &PeerId) -> Result<(), TransportError> {
        self.record(TransportCall::Disconnect(peer.clone()));
        self.drop_connection(peer);
        Ok(())
    }

    async fn discover_characteristics(
        &self,
        peer: &PeerId,
    ) -> Result<Vec<LockCharacteristic>, TransportError> {
        self.record(TransportCall::Discover(peer.clone()));
        self.ensure_connected(peer)?;

        if self.inner.firmware_peers.contains(peer) {
            return Ok(vec![
                LockCharacteristic::BootloaderWrite,
                LockCharacteristic::BootloaderReceive,
            ]);
        }
        Ok(vec![
            LockCharacteristic::Write,
            LockCharacteristic::Receive,
            LockCharacteristic::Session,
        ])
    }

    async fn write_without_response(
        &self,
        peer: &PeerId,
        characteristic: LockCharacteristic,
        packet: &Packet,
    ) -> Result<(), TransportError> {
        self.ensure_connected(peer)?;
        self.record(TransportCall::Write {
            peer: peer.clone(),
            characteristic,
            packet: *packet,
        });
        Ok(())
    }

    async fn read_value(
        &self,
        peer: &PeerId,
        characteristic: LockCharacteristic,
    ) -> Result<Vec<u8>, TransportError> {
        self.record(TransportCall::Read {
            peer: peer.clone(),
            characteristic,
        });
        self.ensure_connected(peer)?;
        match characteristic {
            LockCharacteristic::Session => Ok(self.inner.session.clone()),
            _ => Ok(Vec::new()),
        }
    }

    async fn subscribe(
        &self,
        peer: &PeerId,
        characteristic: LockCharacteristic,
    ) -> Result<(), TransportError> {
        self.record(TransportCall::Subscribe {
            peer: peer.clone(),
            characteristic,
        });
        self.ensure_connected(peer)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

fn parse_advertisement_fixture(raw_fixture: &str) -> Result<Vec<Advertisement>, FixtureError> {
    if raw_fixture.trim().is_empty() {
        return Err(FixtureError::EmptyFixture);
    }

    raw_fixture
        .split(';')
        .map(parse_advertisement_record)
        .collect::<Result<Vec<_>, _>>()
}

fn parse_advertisement_record(raw_record: &str) -> Result<Advertisement, FixtureError> {
    let fields: Vec<&str> = raw_record.split('|').map(str::trim).collect();
    if fields.len() != 4 {
        return Err(FixtureError::InvalidRecordFieldCount);
    }
    if fields.iter().any(|field| field.is_empty()) {
        return Err(FixtureError::EmptyRecordField);
    }

    let local_name = if fields[1] == "-" {
        None
    } else {
        Some(fields[1].to_string())
    };
    let rssi = if fields[2] == "-" {
        None
    } else {
        Some(fields[2].parse::<i16>()?)
    };

    Ok(Advertisement {
        peer: PeerId::new(fields[0]),
        local_name,
        manufacturer_data: parse_hex(fields[3])?,
        rssi,
    })
}

fn parse_hex(raw_value: &str) -> Result<Vec<u8>, FixtureError> {
    let cleaned: String = raw_value.chars().filter(|c| !c.is_whitespace()).collect();
    hex::decode(&cleaned).map_err(|source| FixtureError::InvalidHex {
        value: cleaned,
        source,
    })
}
