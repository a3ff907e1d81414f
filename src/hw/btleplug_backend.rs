use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties,
    ScanFilter, ValueNotification, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use tokio::sync::mpsc;
use tokio_stream::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

use super::transport::{Advertisement, PeerId, Transport, TransportEvent};
use crate::codec::Packet;
use crate::error::TransportError;
use crate::protocol::{self, LockCharacteristic};

/// Radio transport backed by `btleplug`, using the first adapter found.
#[derive(Debug)]
pub struct BtleplugTransport {
    adapter: Adapter,
    events: mpsc::UnboundedSender<TransportEvent>,
    forwarders: NotificationForwarders,
}

/// At most one live notification forwarder per peer.
#[derive(Debug, Clone, Default)]
struct NotificationForwarders {
    tokens: Arc<Mutex<HashMap<PeerId, CancellationToken>>>,
}

impl NotificationForwarders {
    /// Registers a new forwarder for `peer`, stopping the one it replaces.
    fn replace(&self, peer: &PeerId) -> CancellationToken {
        let token = CancellationToken::new();
        let previous = self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(peer.clone(), token.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }
        token
    }

    fn cancel(&self, peer: &PeerId) {
        let removed = self
            .tokens
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(peer);
        if let Some(token) = removed {
            trace!(%peer, "stopping notification forwarder");
            token.cancel();
        }
    }
}

impl BtleplugTransport {
    /// Opens the first BLE adapter and starts forwarding its events.
    ///
    /// # Errors
    ///
    /// Returns an error if the platform manager cannot be created or no
    /// adapter is available.
    #[instrument(level = "debug")]
    pub async fn new() -> Result<(Self, mpsc::UnboundedReceiver<TransportEvent>), TransportError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or(TransportError::NoAdapters)?;
        info!(adapter = %adapter.adapter_info().await?, "using BLE adapter");

        let (events, receiver) = mpsc::unbounded_channel();
        let forwarders = NotificationForwarders::default();
        let central_events = adapter.events().await?;
        tokio::spawn(forward_central_events(
            adapter.clone(),
            central_events,
            events.clone(),
            forwarders.clone(),
        ));

        Ok((
            Self {
                adapter,
                events,
                forwarders,
            },
            receiver,
        ))
    }

    async fn peripheral(&self, peer: &PeerId) -> Result<Peripheral, TransportError> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|peripheral| peripheral.id().to_string() == peer.as_str())
            .ok_or_else(|| TransportError::UnknownPeer {
                peer: peer.to_string(),
            })
    }

    async fn characteristic(
        &self,
        peer: &PeerId,
        characteristic: LockCharacteristic,
    ) -> Result<(Peripheral, Characteristic), TransportError> {
        let peripheral = self.peripheral(peer).await?;
        let metadata = protocol::characteristic_metadata(characteristic);
        let resolved = peripheral
            .characteristics()
            .into_iter()
            .find(|candidate| {
                candidate.uuid == metadata.uuid() && candidate.service_uuid == metadata.service()
            })
            .ok_or(TransportError::MissingCharacteristic { characteristic })?;
        Ok((peripheral, resolved))
    }
}

#[async_trait]
impl Transport for BtleplugTransport {
    #[instrument(skip(self), level = "debug")]
    async fn start_scan(
        &self,
        services: &[Uuid],
        allow_duplicates: bool,
    ) -> Result<(), TransportError> {
        // btleplug always reports repeated advertisements as updates.
        let _ = allow_duplicates;
        self.adapter
            .start_scan(ScanFilter {
                services: services.to_vec(),
            })
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug")]
    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(%peer))]
    async fn connect(&self, peer: &PeerId) -> Result<(), TransportError> {
        let peripheral = self.peripheral(peer).await?;
        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(%peer))]
    async fn disconnect(&self, peer: &PeerId) -> Result<(), TransportError> {
        self.forwarders.cancel(peer);
        let peripheral = self.peripheral(peer).await?;
        if peripheral.is_connected().await? {
            peripheral.disconnect().await?;
        }
        Ok(())
    }

    #[instrument(skip(self), level = "debug", fields(%peer))]
    async fn discover_characteristics(
        &self,
        peer: &PeerId,
    ) -> Result<Vec<LockCharacteristic>, TransportError> {
        let peripheral = self.peripheral(peer).await?;
        peripheral.discover_services().await?;
        let found: Vec<LockCharacteristic> = peripheral
            .characteristics()
            .into_iter()
            .filter_map(|characteristic| protocol::characteristic_for_uuid(characteristic.uuid))
            .collect();
        debug!(?found, "resolved lock characteristics");
        Ok(found)
    }

    #[instrument(skip(self, packet), level = "trace", fields(%peer, %characteristic))]
    async fn write_without_response(
        &self,
        peer: &PeerId,
        characteristic: LockCharacteristic,
        packet: &Packet,
    ) -> Result<(), TransportError> {
        let (peripheral, resolved) = self.characteristic(peer, characteristic).await?;
        peripheral
            .write(&resolved, packet.as_bytes(), WriteType::WithoutResponse)
            .await?;
        Ok(())
    }

    #[instrument(skip(self), level = "trace", fields(%peer, %characteristic))]
    async fn read_value(
        &self,
        peer: &PeerId,
        characteristic: LockCharacteristic,
    ) -> Result<Vec<u8>, TransportError> {
        let (peripheral, resolved) = self.characteristic(peer, characteristic).await?;
        Ok(peripheral.read(&resolved).await?)
    }

    #[instrument(skip(self), level = "debug", fields(%peer, %characteristic))]
    async fn subscribe(
        &self,
        peer: &PeerId,
        characteristic: LockCharacteristic,
    ) -> Result<(), TransportError> {
        let (peripheral, resolved) = self.characteristic(peer, characteristic).await?;
        let notifications = peripheral.notifications().await?;
        peripheral.subscribe(&resolved).await?;
        tokio::spawn(forward_notifications(
            peer.clone(),
            notifications,
            self.events.clone(),
            self.forwarders.replace(peer),
        ));
        Ok(())
    }
}

async fn forward_central_events(
    adapter: Adapter,
    mut central_events: Pin<Box<dyn Stream<Item = CentralEvent> + Send>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    forwarders: NotificationForwarders,
) {
    while let Some(event) = central_events.next().await {
        let forwarded = match event {
            CentralEvent::DeviceDiscovered(id)
            | CentralEvent::DeviceUpdated(id)
            | CentralEvent::ManufacturerDataAdvertisement { id, .. } => {
                advertisement_for(&adapter, &id)
                    .await
                    .map(TransportEvent::Advertisement)
            }
            CentralEvent::DeviceDisconnected(id) => {
                let peer = PeerId::new(id.to_string());
                forwarders.cancel(&peer);
                Some(TransportEvent::Disconnected { peer })
            }
            _ => None,
        };
        let Some(forwarded) = forwarded else {
            continue;
        };
        if events.send(forwarded).is_err() {
            debug!("transport event receiver dropped; stopping adapter event forwarding");
            return;
        }
    }
}

async fn advertisement_for(adapter: &Adapter, id: &PeripheralId) -> Option<Advertisement> {
    let peripheral = match adapter.peripheral(id).await {
        Ok(peripheral) => peripheral,
        Err(error) => {
            trace!(?error, "advertising peripheral vanished");
            return None;
        }
    };
    let properties = match peripheral.properties().await {
        Ok(Some(properties)) => properties,
        Ok(None) => return None,
        Err(error) => {
            warn!(?error, "failed to read advertisement properties");
            return None;
        }
    };
    Some(advertisement_from_properties(
        PeerId::new(id.to_string()),
        &properties,
    ))
}

fn advertisement_from_properties(peer: PeerId, properties: &PeripheralProperties) -> Advertisement {
    Advertisement {
        peer,
        local_name: properties.local_name.clone(),
        manufacturer_data: manufacturer_data(properties),
        rssi: properties.rssi,
    }
}

/// Re-attaches the company identifier that btleplug splits off, so offsets
/// match the raw advertisement.
fn manufacturer_data(properties: &PeripheralProperties) -> Vec<u8> {
    let Some((company_id, payload)) = properties.manufacturer_data.iter().min_by_key(|(id, _)| **id)
    else {
        return Vec::new();
    };
    let mut reconstructed = Vec::with_capacity(payload.len() + 2);
    reconstructed.extend_from_slice(&company_id.to_le_bytes());
    reconstructed.extend_from_slice(payload);
    reconstructed
}

async fn forward_notifications(
    peer: PeerId,
    mut notifications: Pin<Box<dyn Stream<Item = ValueNotification> + Send>>,
    events: mpsc::UnboundedSender<TransportEvent>,
    cancel: CancellationToken,
) {
    loop {
        let notification = tokio::select! {
            () = cancel.cancelled() => {
                debug!(%peer, "notification forwarder stopped");
                return;
            }
            notification = notifications.next() => match notification {
                Some(notification) => notification,
                None => break,
            },
        };
        let Some(characteristic) = protocol::characteristic_for_uuid(notification.uuid) else {
            trace!(uuid = %notification.uuid, "ignoring notification from unknown characteristic");
            continue;
        };
        let event = TransportEvent::Notification {
            peer: peer.clone(),
            characteristic,
            value: notification.value,
        };
        if events.send(event).is_err() {
            return;
        }
    }
    debug!(%peer, "notification stream closed");
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn properties(manufacturer: HashMap<u16, Vec<u8>>) -> PeripheralProperties {
        PeripheralProperties {
            local_name: Some("NOKE3P_001122334455".to_string()),
            rssi: Some(-51),
            manufacturer_data: manufacturer,
            ..PeripheralProperties::default()
        }
    }

    #[test]
    fn manufacturer_data_prepends_company_id() {
        let mut manufacturer = HashMap::new();
        manufacturer.insert(0x0A5D, vec![0x60, 0x02, 0x0A]);

        let advertisement =
            advertisement_from_properties(PeerId::new("p1"), &properties(manufacturer));

        assert_eq!(
            vec![0x5D, 0x0A, 0x60, 0x02, 0x0A],
            advertisement.manufacturer_data
        );
        assert_eq!(Some(-51), advertisement.rssi);
    }

    #[test]
    fn missing_manufacturer_data_is_empty() {
        let advertisement =
            advertisement_from_properties(PeerId::new("p1"), &properties(HashMap::new()));
        assert_eq!(Vec::<u8>::new(), advertisement.manufacturer_data);
    }

    #[test]
    fn replacing_a_forwarder_stops_the_previous_one() {
        let forwarders = NotificationForwarders::default();
        let peer = PeerId::new("p1");

        let first = forwarders.replace(&peer);
        let second = forwarders.replace(&peer);
        assert_eq!(true, first.is_cancelled());
        assert_eq!(false, second.is_cancelled());

        forwarders.cancel(&peer);
        assert_eq!(true, second.is_cancelled());
    }

    #[tokio::test]
    async fn cancelled_forwarder_stops_on_an_open_stream() {
        let receive = protocol::characteristic_metadata(LockCharacteristic::Receive).uuid();
        let notifications = tokio_stream::iter(vec![ValueNotification {
            uuid: receive,
            value: vec![0x51, 0x60],
        }])
        .chain(tokio_stream::pending());
        let (events, mut receiver) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let forwarder = tokio::spawn(forward_notifications(
            PeerId::new("p1"),
            Box::pin(notifications),
            events,
            cancel.clone(),
        ));

        let forwarded = receiver.recv().await;
        assert_eq!(
            Some(TransportEvent::Notification {
                peer: PeerId::new("p1"),
                characteristic: LockCharacteristic::Receive,
                value: vec![0x51, 0x60],
            }),
            forwarded
        );

        cancel.cancel();
        forwarder.await.expect("forwarder should not panic");
        assert_eq!(None, receiver.recv().await);
    }
}
