#![allow(dead_code)]

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub const LOCK_A: &str = "A1:B2:C3:D4:E5:F6";
pub const LOCK_B: &str = "0A:0B:0C:0D:0E:0F";
pub const SESSION_HEX: &str = "0102b80b05060708090a0b0c0d0e0f1011121314";

/// U-lock advertising "locked" plus a padlock advertising "unlocked".
pub const TWO_LOCKS: &str =
    "p1|NOKE2U_A1B2C3D4E5F6|-60|0000600203;p2|NOKE3P_0A0B0C0D0E0F|-70|0000000101";

pub fn peer_a() -> noke::PeerId {
    noke::PeerId::new("p1")
}

pub fn peer_b() -> noke::PeerId {
    noke::PeerId::new("p2")
}

pub fn command(fill: u8) -> String {
    hex::encode([fill; noke::PACKET_SIZE])
}

pub fn packet(fill: u8) -> noke::Packet {
    noke::Packet::new([fill; noke::PACKET_SIZE])
}

/// An `App` result packet.
pub fn app_result(code: u8, byte2: u8, byte3: u8) -> Vec<u8> {
    let mut bytes = vec![0u8; noke::PACKET_SIZE];
    bytes[0] = noke::Destination::App as u8;
    bytes[1] = code;
    bytes[2] = byte2;
    bytes[3] = byte3;
    bytes
}

pub fn success() -> Vec<u8> {
    app_result(noke::ResultCode::Success as u8, 0, 0)
}

/// A log packet addressed to the backend.
pub fn server_log(fill: u8) -> Vec<u8> {
    let mut bytes = vec![fill; noke::PACKET_SIZE];
    bytes[0] = noke::Destination::Server as u8;
    bytes
}

/// Backend double that records every request.
#[derive(Debug, Default)]
pub struct RecordingBackend {
    uploads: Mutex<Vec<Vec<noke::UploadBatch>>>,
    upload_error: Mutex<Option<i64>>,
    restore_commands: Mutex<Option<String>>,
    confirmations: Mutex<Vec<(u8, String)>>,
}

impl RecordingBackend {
    pub fn fail_uploads_with(&self, code: i64) {
        *lock(&self.upload_error) = Some(code);
    }

    pub fn accept_uploads(&self) {
        *lock(&self.upload_error) = None;
    }

    pub fn set_restore_commands(&self, commands: &str) {
        *lock(&self.restore_commands) = Some(commands.to_string());
    }

    pub fn uploads(&self) -> Vec<Vec<noke::UploadBatch>> {
        lock(&self.uploads).clone()
    }

    pub fn confirmations(&self) -> Vec<(u8, String)> {
        lock(&self.confirmations).clone()
    }
}

#[async_trait]
impl noke::LedgerBackend for RecordingBackend {
    async fn upload(&self, batches: &[noke::UploadBatch]) -> Result<(), noke::BackendError> {
        lock(&self.uploads).push(batches.to_vec());
        match *lock(&self.upload_error) {
            Some(code) => Err(noke::BackendError::Api {
                code,
                message: "rejected".to_string(),
            }),
            None => Ok(()),
        }
    }

    async fn restore(
        &self,
        _session: &noke::SessionValue,
        _mac: &str,
    ) -> Result<String, noke::BackendError> {
        lock(&self.restore_commands)
            .clone()
            .ok_or(noke::BackendError::MissingCommands)
    }

    async fn confirm_restore(&self, command_id: u8, mac: &str) -> Result<(), noke::BackendError> {
        lock(&self.confirmations).push((command_id, mac.to_string()));
        Ok(())
    }
}

pub struct Harness {
    pub manager: noke::DeviceManager,
    pub transport: noke::FakeTransport,
    pub backend: Arc<RecordingBackend>,
    pub events: mpsc::UnboundedReceiver<noke::LockEvent>,
}

impl Harness {
    pub fn new(
        config: noke::ManagerConfig,
        fake_config: noke::FakeTransportConfig,
    ) -> anyhow::Result<Self> {
        let (transport, transport_events) = noke::FakeTransport::new(fake_config);
        let backend = Arc::new(RecordingBackend::default());
        let (observer, events) = mpsc::unbounded_channel();
        let manager = noke::DeviceManager::new(
            config,
            Arc::new(transport.clone()),
            backend.clone(),
            Arc::new(observer),
        );

        let runner = manager.clone();
        tokio::spawn(async move { runner.run(transport_events).await });

        Ok(Self {
            manager,
            transport,
            backend,
            events,
        })
    }

    /// Two registered locks behind a fake radio that connects instantly.
    pub fn with_two_locks() -> anyhow::Result<Self> {
        let harness = Self::new(noke::ManagerConfig::default(), fake_config()?)?;
        harness.register(LOCK_A);
        harness.register(LOCK_B);
        Ok(harness)
    }

    pub fn register(&self, address: &str) {
        self.manager
            .add_device(noke::DeviceRecord::builder().address(address).build());
    }

    /// Scans so both locks are discovered, then connects lock A.
    pub async fn connect_a(&mut self) -> anyhow::Result<()> {
        self.manager.start_scan().await?;
        settle().await;
        let outcome = self.manager.connect(LOCK_A).await?;
        anyhow::ensure!(
            outcome == noke::ConnectOutcome::Connected,
            "unexpected connect outcome {outcome:?}"
        );
        settle().await;
        self.drain_events();
        Ok(())
    }

    pub fn drain_events(&mut self) -> Vec<noke::LockEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }

    pub fn connection_state(&self, address: &str) -> Option<noke::ConnectionState> {
        self.manager
            .device(address)
            .map(|record| record.connection_state())
    }
}

pub fn fake_config() -> anyhow::Result<noke::FakeTransportConfig> {
    Ok(noke::FakeTransportConfig::builder()
        .advertisements(TWO_LOCKS.parse()?)
        .session(SESSION_HEX.parse()?)
        .build())
}

/// Lets the event loop and any spawned tasks run to completion. Tests use a
/// paused clock, so this only advances once every task is idle.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub fn error_kinds(events: &[noke::LockEvent]) -> Vec<noke::ErrorKind> {
    events
        .iter()
        .filter_map(|event| match event {
            noke::LockEvent::Error { kind, .. } => Some(*kind),
            _ => None,
        })
        .collect()
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
