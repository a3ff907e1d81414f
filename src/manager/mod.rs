mod config;
mod registry;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};
use tracing::{debug, info, instrument, trace, warn};

pub use self::config::ManagerConfig;
use self::registry::DeviceRegistry;
use crate::advertisement::{LockName, decode_advertisement};
use crate::codec::{self, Packet};
use crate::device::{ConnectionState, DeviceRecord, LockState};
use crate::error::{Error, ErrorKind, ManagerError, OfflineUnlockError, TransportError};
use crate::events::{LockEvent, LockObserver};
use crate::hw::{Advertisement, PeerId, Transport, TransportEvent};
use crate::ledger::{LedgerBackend, UploadBatch, UploadLedger};
use crate::offline::{OfflineKey, OfflineUnlockCommand, SessionValue, derive_offline_packet};
use crate::protocol::{FIRMWARE_SERVICE_UUID, LOCK_SERVICE_UUID, LockCharacteristic};
use crate::session::{ConnectAttempt, DeviceSession, SessionEffect};
use crate::utils::format_hex;

/// How a `connect` call ended.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnectOutcome {
    Connected,
    /// The lock exposed only its bootloader.
    FirmwareUpdate,
    AlreadyConnected,
    /// Another attempt for the same lock is still running.
    InProgress,
    /// Another lock holds the admission slot; the connect will be retried.
    Deferred,
    TimedOut,
    Failed,
    /// The attempt was superseded or the lock disconnected first.
    Cancelled,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ScanOutcome {
    Started,
    Deferred,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum FlushOutcome {
    Uploaded { batches: usize },
    NothingToUpload,
    AlreadyInFlight,
}

/// Owns every registered lock and drives them over a `Transport`.
///
/// Cloning yields another handle to the same manager.
#[derive(Clone)]
pub struct DeviceManager {
    inner: Arc<Inner>,
}

struct Inner {
    config: ManagerConfig,
    transport: Arc<dyn Transport>,
    backend: Arc<dyn LedgerBackend>,
    observer: Arc<dyn LockObserver>,
    state: Mutex<ManagerState>,
    next_attempt: AtomicU64,
}

#[derive(Debug, Default)]
struct ManagerState {
    registry: DeviceRegistry,
    ledger: UploadLedger,
    deferred: DeferredRequests,
}

/// Scan and connect requests parked behind the admission gate.
#[derive(Debug, Default)]
struct DeferredRequests {
    scan: bool,
    connects: Vec<String>,
    retry_scheduled: bool,
}

impl DeferredRequests {
    fn defer_connect(&mut self, address: &str) {
        if !self.connects.iter().any(|queued| queued == address) {
            self.connects.push(address.to_string());
        }
    }

    fn take(&mut self) -> (bool, Vec<String>) {
        self.retry_scheduled = false;
        (std::mem::take(&mut self.scan), std::mem::take(&mut self.connects))
    }
}

enum Admission {
    Admit(PeerId, ConnectAttempt),
    Resolved(ConnectOutcome),
    Defer,
}

impl DeviceManager {
    #[must_use]
    pub fn new(
        config: ManagerConfig,
        transport: Arc<dyn Transport>,
        backend: Arc<dyn LedgerBackend>,
        observer: Arc<dyn LockObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                transport,
                backend,
                observer,
                state: Mutex::new(ManagerState::default()),
                next_attempt: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a lock. Returns `false` if its address is already known.
    pub fn add_device(&self, record: DeviceRecord) -> bool {
        let address = record.address().to_string();
        let added = self.state().registry.insert(record);
        debug!(%address, added, "add device");
        added
    }

    /// Unregisters a lock and returns its last known record. A lock that is
    /// connected or connecting is disconnected first, freeing the admission
    /// slot.
    #[instrument(skip(self), level = "debug")]
    pub async fn remove_device(&self, address: &str) -> Option<DeviceRecord> {
        let mut session = {
            let mut state = self.state();
            state.deferred.connects.retain(|queued| queued != address);
            state.registry.remove(address)?
        };
        let linked = session.state().is_active();
        let peer = session.peer().cloned();
        let _ = session.disconnected();

        if linked && let Some(peer) = peer {
            info!(%address, %peer, "disconnecting removed lock");
            if let Err(error) = self.inner.transport.disconnect(&peer).await {
                warn!(%address, %error, "failed to disconnect removed lock");
            }
        }
        Some(session.record().clone())
    }

    #[must_use]
    pub fn device(&self, address: &str) -> Option<DeviceRecord> {
        self.state()
            .registry
            .get(address)
            .map(|session| session.record().clone())
    }

    /// Snapshot of every registered lock, ordered by address.
    #[must_use]
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.state().registry.records()
    }

    /// Number of packets still waiting in a lock's command queue.
    #[must_use]
    pub fn queued_commands(&self, address: &str) -> Option<usize> {
        self.state()
            .registry
            .get(address)
            .map(|session| session.queue().len())
    }

    /// Starts scanning for locks, unless another lock holds the admission slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the transport refuses to scan.
    #[instrument(skip(self), level = "debug")]
    pub async fn start_scan(&self) -> Result<ScanOutcome, Error> {
        let busy = {
            let mut state = self.state();
            let busy = state.registry.active_device();
            if busy.is_some() {
                state.deferred.scan = true;
            }
            busy
        };
        if let Some(active) = busy {
            debug!(%active, "admission slot busy; deferring scan");
            self.schedule_retry();
            return Ok(ScanOutcome::Deferred);
        }

        self.inner
            .transport
            .start_scan(
                &[LOCK_SERVICE_UUID, FIRMWARE_SERVICE_UUID],
                self.inner.config.allow_duplicates(),
            )
            .await?;
        info!("scanning for locks");
        Ok(ScanOutcome::Started)
    }

    /// # Errors
    ///
    /// Returns an error if the transport fails to stop scanning.
    pub async fn stop_scan(&self) -> Result<(), Error> {
        self.state().deferred.scan = false;
        self.inner.transport.stop_scan().await?;
        Ok(())
    }

    /// Connects to a discovered lock and reads its session value.
    ///
    /// Runtime failures (refusal, timeout) are reported to the observer and
    /// reflected in the returned outcome.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is unknown or has not been discovered.
    #[instrument(skip(self), level = "debug")]
    pub async fn connect(&self, address: &str) -> Result<ConnectOutcome, Error> {
        let admission = self.admit(address)?;
        let (peer, attempt) = match admission {
            Admission::Admit(peer, attempt) => (peer, attempt),
            Admission::Resolved(outcome) => return Ok(outcome),
            Admission::Defer => {
                self.schedule_retry();
                return Ok(ConnectOutcome::Deferred);
            }
        };
        self.emit(LockEvent::Connecting {
            address: address.to_string(),
        });

        let cancel = attempt.cancel_token();
        let attempt_id = attempt.id();
        let outcome = tokio::select! {
            () = cancel.cancelled() => ConnectOutcome::Cancelled,
            result = timeout(
                self.inner.config.connect_timeout(),
                self.establish_session(address, &peer, attempt_id),
            ) => match result {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(error)) => {
                    self.connect_failed(address, &peer, attempt_id, &error).await;
                    ConnectOutcome::Failed
                }
                Err(_elapsed) => {
                    self.connect_timed_out(address, &peer, attempt_id).await;
                    ConnectOutcome::TimedOut
                }
            },
        };
        debug!(%address, ?outcome, "connect finished");
        Ok(outcome)
    }

    /// Disconnects a lock, dropping any commands still queued.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is unknown or the transport fails.
    #[instrument(skip(self), level = "debug")]
    pub async fn disconnect(&self, address: &str) -> Result<(), Error> {
        let peer = {
            let state = self.state();
            let session = state
                .registry
                .get(address)
                .ok_or_else(|| unknown_device(address))?;
            session.peer().cloned()
        };
        let result = match peer {
            Some(peer) => self.inner.transport.disconnect(&peer).await,
            None => Ok(()),
        };
        self.on_disconnected(address, true);
        result?;
        Ok(())
    }

    /// Queues a `+`-delimited hex command string for a connected lock.
    ///
    /// # Errors
    ///
    /// Returns an error if any segment is malformed, in which case nothing is
    /// queued, or if the lock has no active session.
    #[instrument(skip(self, commands), level = "debug")]
    pub async fn send_commands(&self, address: &str, commands: &str) -> Result<(), Error> {
        let packets = codec::parse_command_string(commands)?;
        self.enqueue(address, packets, false).await
    }

    /// Stores the offline key and unlock command issued for a lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is unknown or either value is malformed.
    pub fn set_offline_values(&self, address: &str, key: &str, command: &str) -> Result<(), Error> {
        let key: OfflineKey = key.parse()?;
        let command: OfflineUnlockCommand = command.parse()?;
        let mut state = self.state();
        let session = state
            .registry
            .get_mut(address)
            .ok_or_else(|| unknown_device(address))?;
        session.record_mut().set_offline_values(key, command);
        Ok(())
    }

    /// Unlocks with the stored offline values. Returns the embedded Unix
    /// timestamp as a decimal string, or an empty string when none was used.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock is unknown, has no session, or has no
    /// offline values.
    #[instrument(skip(self), level = "debug")]
    pub async fn offline_unlock(
        &self,
        address: &str,
        with_timestamp: bool,
    ) -> Result<String, Error> {
        let timestamp = with_timestamp.then(unix_timestamp);
        let effects = {
            let mut state = self.state();
            let session = state
                .registry
                .get_mut(address)
                .ok_or_else(|| unknown_device(address))?;
            let record = session.record();
            let (Some(key), Some(command)) =
                (record.offline_key(), record.offline_unlock_command())
            else {
                return Err(OfflineUnlockError::MissingOfflineValues {
                    address: address.to_string(),
                }
                .into());
            };
            let value = match record.session() {
                Some(value) if session.accepts_commands() => value,
                _ => return Err(not_connected(address)),
            };
            let packet = derive_offline_packet(key, command, value, timestamp);
            session.enqueue([packet], false)
        };
        self.apply(address, effects).await;
        Ok(timestamp.map(|timestamp| timestamp.to_string()).unwrap_or_default())
    }

    /// Fetches restore commands for the current session from the backend and
    /// sends them to the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock has no session, the backend rejects the
    /// request, or the session changed while the request was in flight.
    #[instrument(skip(self), level = "debug")]
    pub async fn restore_device(&self, address: &str) -> Result<(), Error> {
        let value = {
            let state = self.state();
            let session = state
                .registry
                .get(address)
                .ok_or_else(|| unknown_device(address))?;
            match session.record().session() {
                Some(value) if session.accepts_commands() => *value,
                _ => return Err(not_connected(address)),
            }
        };

        let commands = self.inner.backend.restore(&value, address).await?;
        let packets = codec::parse_command_string(&commands)?;

        let effects = {
            let mut state = self.state();
            let session = state
                .registry
                .get_mut(address)
                .ok_or_else(|| unknown_device(address))?;
            if session.record().session() != Some(&value) || !session.accepts_commands() {
                return Err(not_connected(address));
            }
            session.enqueue(packets, true)
        };
        self.apply(address, effects).await;
        Ok(())
    }

    /// Uploads every pending batch in one request.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend rejects the upload; the batches stay
    /// queued.
    #[instrument(skip(self), level = "debug")]
    pub async fn flush_uploads(&self) -> Result<FlushOutcome, Error> {
        let sent = {
            let mut state = self.state();
            if state.ledger.is_empty() {
                return Ok(FlushOutcome::NothingToUpload);
            }
            match state.ledger.begin_flush() {
                Some(sent) => sent,
                None => return Ok(FlushOutcome::AlreadyInFlight),
            }
        };

        let result = self.inner.backend.upload(&sent).await;
        self.state().ledger.finish_flush(&sent, result.is_ok());
        result?;

        info!(batches = sent.len(), "uploaded lock responses");
        self.emit(LockEvent::UploadsFlushed {
            batches: sent.len(),
        });
        Ok(FlushOutcome::Uploaded {
            batches: sent.len(),
        })
    }

    /// Batches not yet accepted by the backend, for persisting across runs.
    #[must_use]
    pub fn pending_uploads(&self) -> Vec<UploadBatch> {
        self.state().ledger.batches().to_vec()
    }

    /// Merges batches persisted by an earlier run back into the ledger.
    pub fn restore_pending_uploads(&self, batches: Vec<UploadBatch>) {
        self.state().ledger.load(batches);
    }

    /// Processes transport events until the stream closes.
    pub async fn run(&self, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        debug!("transport event stream closed");
    }

    pub async fn handle_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Advertisement(advertisement) => self.on_advertisement(advertisement),
            TransportEvent::Notification {
                peer,
                characteristic,
                value,
            } => self.on_notification(&peer, characteristic, &value).await,
            TransportEvent::Disconnected { peer } => {
                let address = self
                    .state()
                    .registry
                    .address_for_peer(&peer)
                    .map(str::to_string);
                match address {
                    Some(address) => self.on_disconnected(&address, false),
                    None => trace!(%peer, "disconnect from unknown peer"),
                }
            }
        }
    }

    fn admit(&self, address: &str) -> Result<Admission, Error> {
        let mut state = self.state();
        let active = state.registry.active_device();
        let session = state
            .registry
            .get_mut(address)
            .ok_or_else(|| unknown_device(address))?;
        let Some(peer) = session.peer().cloned() else {
            return Err(ManagerError::NotDiscovered {
                address: address.to_string(),
            }
            .into());
        };
        if session.state().has_session() {
            return Ok(Admission::Resolved(ConnectOutcome::AlreadyConnected));
        }
        if session.state() == ConnectionState::Connecting {
            return Ok(Admission::Resolved(ConnectOutcome::InProgress));
        }
        if let Some(active) = active
            && active != address
        {
            debug!(%address, %active, "admission slot busy; deferring connect");
            state.deferred.defer_connect(address);
            return Ok(Admission::Defer);
        }

        let attempt = ConnectAttempt::new(self.inner.next_attempt.fetch_add(1, Ordering::Relaxed));
        session.begin_connect(attempt.clone());
        Ok(Admission::Admit(peer, attempt))
    }

    async fn establish_session(
        &self,
        address: &str,
        peer: &PeerId,
        attempt_id: u64,
    ) -> Result<ConnectOutcome, TransportError> {
        let transport = &self.inner.transport;
        transport.connect(peer).await?;
        let characteristics = transport.discover_characteristics(peer).await?;

        if characteristics.iter().any(|found| found.is_bootloader())
            && !characteristics.contains(&LockCharacteristic::Write)
        {
            let current = self.with_current_attempt(address, attempt_id, |session| {
                session.finish_connect();
                session.set_firmware_update(true);
                session.set_state(ConnectionState::Connected);
            });
            if current.is_none() {
                return Ok(ConnectOutcome::Cancelled);
            }
            info!(%address, "lock is in firmware update mode");
            self.emit(LockEvent::ReadyForFirmwareUpdate {
                address: address.to_string(),
            });
            return Ok(ConnectOutcome::FirmwareUpdate);
        }

        for required in [
            LockCharacteristic::Write,
            LockCharacteristic::Receive,
            LockCharacteristic::Session,
        ] {
            if !characteristics.contains(&required) {
                return Err(TransportError::MissingCharacteristic {
                    characteristic: required,
                });
            }
        }
        transport
            .subscribe(peer, LockCharacteristic::Receive)
            .await?;
        let raw = transport
            .read_value(peer, LockCharacteristic::Session)
            .await?;
        trace!(%address, session = %format_hex(&raw), "read session characteristic");
        let value = SessionValue::try_from(raw.as_slice())
            .map_err(|_| TransportError::InvalidSession { actual: raw.len() })?;

        let Some(effects) = self.with_current_attempt(address, attempt_id, |session| {
            session.session_established(value)
        }) else {
            debug!(%address, "dropping stale connection result");
            return Ok(ConnectOutcome::Cancelled);
        };
        self.apply(address, effects).await;
        Ok(ConnectOutcome::Connected)
    }

    fn with_current_attempt<T>(
        &self,
        address: &str,
        attempt_id: u64,
        update: impl FnOnce(&mut DeviceSession) -> T,
    ) -> Option<T> {
        let mut state = self.state();
        let session = state.registry.get_mut(address)?;
        session
            .is_current_attempt(attempt_id)
            .then(|| update(session))
    }

    async fn connect_failed(
        &self,
        address: &str,
        peer: &PeerId,
        attempt_id: u64,
        error: &TransportError,
    ) {
        if self
            .with_current_attempt(address, attempt_id, DeviceSession::fail_connect)
            .is_none()
        {
            return;
        }
        warn!(%address, %error, "connection failed");
        if let Err(error) = self.inner.transport.disconnect(peer).await {
            debug!(%address, %error, "cleanup disconnect failed");
        }
        self.emit(LockEvent::error(
            ErrorKind::Transport,
            error.to_string(),
            Some(address),
        ));
    }

    async fn connect_timed_out(&self, address: &str, peer: &PeerId, attempt_id: u64) {
        if self
            .with_current_attempt(address, attempt_id, DeviceSession::abandon_connect)
            .is_none()
        {
            return;
        }
        let limit = self.inner.config.connect_timeout();
        warn!(%address, ?limit, "connection timed out");
        if let Err(error) = self.inner.transport.disconnect(peer).await {
            debug!(%address, %error, "cleanup disconnect failed");
        }
        self.emit(LockEvent::error(
            ErrorKind::ConnectionTimeout,
            format!("no session within {limit:?}"),
            Some(address),
        ));
    }

    async fn enqueue(
        &self,
        address: &str,
        packets: Vec<Packet>,
        restoring: bool,
    ) -> Result<(), Error> {
        let effects = {
            let mut state = self.state();
            let session = state
                .registry
                .get_mut(address)
                .ok_or_else(|| unknown_device(address))?;
            if !session.accepts_commands() {
                return Err(not_connected(address));
            }
            session.enqueue(packets, restoring)
        };
        self.apply(address, effects).await;
        Ok(())
    }

    fn on_advertisement(&self, advertisement: Advertisement) {
        // Locks sometimes advertise without their name; fall back to the last
        // lock name this peer advertised.
        let advertised = advertisement
            .local_name
            .as_deref()
            .filter(|name| LockName::parse(name).is_some())
            .map(str::to_string);
        let Some(local_name) = advertised.or_else(|| {
            self.state()
                .registry
                .cached_name(&advertisement.peer)
                .map(str::to_string)
        }) else {
            trace!(peer = %advertisement.peer, "ignoring advertisement without a lock name");
            return;
        };
        let Some(info) = decode_advertisement(&local_name, &advertisement.manufacturer_data) else {
            trace!(%local_name, "ignoring non-lock advertisement");
            return;
        };
        if let (Some(threshold), Some(rssi)) =
            (self.inner.config.rssi_threshold(), advertisement.rssi)
            && rssi < threshold
        {
            trace!(address = %info.address, rssi, threshold, "advertisement below RSSI threshold");
            return;
        }

        let event = {
            let mut state = self.state();
            if !state.registry.contains(&info.address) {
                if !self.inner.config.open_discovery() {
                    trace!(address = %info.address, "ignoring unregistered lock");
                    return;
                }
                info!(address = %info.address, %local_name, "registering discovered lock");
                state.registry.insert(
                    DeviceRecord::builder()
                        .address(info.address.clone())
                        .name(local_name.clone())
                        .build(),
                );
            }
            state
                .registry
                .bind_peer(&info.address, advertisement.peer.clone());
            state
                .registry
                .remember_name(&advertisement.peer, &local_name);
            let Some(session) = state.registry.get_mut(&info.address) else {
                return;
            };

            let record = session.record_mut();
            record.set_name(local_name);
            if let Some(version) = &info.hardware_version {
                record.set_hardware_version(version.clone());
            }
            record.record_sighting(advertisement.rssi, self.inner.config.rssi_history());
            if info.lock_state != LockState::Unknown {
                record.set_lock_state(info.lock_state);
            }
            if matches!(
                session.state(),
                ConnectionState::Disconnected | ConnectionState::Error
            ) {
                session.set_state(ConnectionState::Discovered);
            }

            LockEvent::Discovered {
                address: info.address.clone(),
                lock_state: session.record().lock_state(),
                hardware_version: info.hardware_version.clone(),
                rssi: advertisement.rssi,
                can_auto_unlock: info.can_auto_unlock,
            }
        };
        self.emit(event);
    }

    async fn on_notification(
        &self,
        peer: &PeerId,
        characteristic: LockCharacteristic,
        value: &[u8],
    ) {
        if characteristic != LockCharacteristic::Receive {
            trace!(%peer, %characteristic, "ignoring notification");
            return;
        }
        let received = {
            let mut state = self.state();
            let address = state.registry.address_for_peer(peer).map(str::to_string);
            address.and_then(|address| {
                let session = state.registry.get_mut(&address)?;
                let effects = session.receive(value);
                Some((address, effects))
            })
        };
        match received {
            Some((address, effects)) => self.apply(&address, effects).await,
            None => trace!(%peer, "notification from unknown peer"),
        }
    }

    fn on_disconnected(&self, address: &str, requested: bool) {
        let (changed, dropped) = {
            let mut state = self.state();
            match state.registry.get_mut(address) {
                Some(session) => {
                    let dropped = session.queue().len();
                    (session.disconnected(), dropped)
                }
                None => (false, 0),
            }
        };
        if !changed {
            return;
        }

        info!(%address, requested, "lock disconnected");
        if !requested && dropped > 0 {
            self.emit(LockEvent::error(
                ErrorKind::UnexpectedDisconnect,
                format!("link lost with {dropped} command(s) pending"),
                Some(address),
            ));
        }
        self.emit(LockEvent::Disconnected {
            address: address.to_string(),
        });
        self.spawn_flush();
    }

    async fn apply(&self, address: &str, effects: Vec<SessionEffect>) {
        for effect in effects {
            match effect {
                SessionEffect::Transmit(packet) => self.transmit(address, packet).await,
                SessionEffect::RecordResponse { response, session } => {
                    let received_time = OffsetDateTime::now_utc().unix_timestamp();
                    self.state()
                        .ledger
                        .add_entry(response, session, address, received_time);
                }
                SessionEffect::ClearUploads => {
                    self.state().ledger.clear();
                }
                SessionEffect::FlushUploads => self.spawn_flush(),
                SessionEffect::ConfirmRestore { command_id } => {
                    self.spawn_confirm_restore(address.to_string(), command_id);
                }
                SessionEffect::Disconnect => {
                    if let Err(error) = self.disconnect(address).await {
                        self.report(&error, Some(address));
                    }
                }
                SessionEffect::Emit(event) => self.emit(event),
            }
        }
    }

    async fn transmit(&self, address: &str, packet: Packet) {
        let peer = self
            .state()
            .registry
            .get(address)
            .and_then(|session| session.peer().cloned());
        let Some(peer) = peer else {
            warn!(%address, "no peer to transmit to");
            return;
        };

        trace!(%address, payload = %format_hex(packet.as_bytes()), "writing packet");
        let result = self
            .inner
            .transport
            .write_without_response(&peer, LockCharacteristic::Write, &packet)
            .await;
        if let Err(error) = result {
            warn!(%address, %error, "write failed; dropping connection");
            self.report(&Error::from(error), Some(address));
            if let Err(error) = self.inner.transport.disconnect(&peer).await {
                debug!(%address, %error, "cleanup disconnect failed");
            }
            self.on_disconnected(address, true);
        }
    }

    fn spawn_flush(&self) {
        let manager = self.clone();
        tokio::spawn(async move {
            if let Err(error) = manager.flush_uploads().await {
                warn!(%error, "upload flush failed");
                manager.report(&error, None);
            }
        });
    }

    fn spawn_confirm_restore(&self, address: String, command_id: u8) {
        let manager = self.clone();
        tokio::spawn(async move {
            match manager
                .inner
                .backend
                .confirm_restore(command_id, &address)
                .await
            {
                Ok(()) => manager.emit(LockEvent::RestoreConfirmed {
                    address,
                    command_id,
                }),
                Err(error) => {
                    warn!(%address, %error, "restore confirmation failed");
                    manager.report(&Error::from(error), Some(&address));
                }
            }
        });
    }

    fn schedule_retry(&self) {
        {
            let mut state = self.state();
            if state.deferred.retry_scheduled {
                return;
            }
            state.deferred.retry_scheduled = true;
        }
        let manager = self.clone();
        tokio::spawn(async move { manager.retry_deferred().await });
    }

    /// Waits for the admission slot to free up, then reissues parked requests.
    async fn retry_deferred(&self) {
        let backoff = self.inner.config.admission_backoff();
        let (scan, connects) = loop {
            sleep(backoff).await;
            let ready = {
                let mut state = self.state();
                match state.registry.active_device() {
                    Some(active) => {
                        trace!(%active, "admission slot still busy");
                        None
                    }
                    None => Some(state.deferred.take()),
                }
            };
            if let Some(requests) = ready {
                break requests;
            }
        };

        if scan && let Err(error) = self.start_scan().await {
            self.report(&error, None);
        }
        for address in connects {
            debug!(%address, "reissuing deferred connect");
            if let Err(error) = self.connect(&address).await {
                self.report(&error, Some(&address));
            }
        }
    }

    fn report(&self, error: &Error, address: Option<&str>) {
        self.emit(LockEvent::error(error.kind(), error.to_string(), address));
    }

    fn emit(&self, event: LockEvent) {
        trace!(?event, "emitting lock event");
        self.inner.observer.on_event(event);
    }

    fn state(&self) -> MutexGuard<'_, ManagerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for DeviceManager {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("DeviceManager")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

fn unknown_device(address: &str) -> ManagerError {
    ManagerError::UnknownDevice {
        address: address.to_string(),
    }
}

fn not_connected(address: &str) -> Error {
    ManagerError::NotConnected {
        address: address.to_string(),
    }
    .into()
}

fn unix_timestamp() -> u32 {
    u32::try_from(OffsetDateTime::now_utc().unix_timestamp()).unwrap_or(u32::MAX)
}
