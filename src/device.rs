use std::collections::VecDeque;

use bon::Builder;
use serde::{Deserialize, Serialize};
use strum_macros::Display;
use time::OffsetDateTime;

use crate::offline::{OfflineKey, OfflineUnlockCommand, SessionValue};

/// Physical state of the lock mechanism.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LockState {
    #[default]
    Unknown,
    Unlocked,
    Unshackled,
    Locked,
    Unshackling,
    Unlocking,
    LockedNoMagnet,
    JammedLocking,
    JammedUnlocking,
}

impl LockState {
    /// Decodes the firmware's numeric lock state.
    #[must_use]
    pub fn from_firmware(value: u8) -> Self {
        match value {
            0 => Self::Unlocked,
            2 => Self::Unshackled,
            3 => Self::Locked,
            4 => Self::Unshackling,
            5 => Self::Unlocking,
            7 => Self::LockedNoMagnet,
            _ => Self::Unknown,
        }
    }
}

/// Connection lifecycle of one lock.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Default, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Discovered,
    Connecting,
    Connected,
    Syncing,
    Unlocked,
    /// The transport refused the last connection attempt.
    Error,
}

impl ConnectionState {
    /// States that hold the single-connection admission slot.
    #[must_use]
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Self::Connecting | Self::Connected | Self::Syncing | Self::Unlocked
        )
    }

    /// States in which a session value has been read from the lock.
    #[must_use]
    pub fn has_session(self) -> bool {
        matches!(self, Self::Connected | Self::Syncing | Self::Unlocked)
    }
}

/// Identity and operational state of one lock.
///
/// Records round-trip through serde so callers can persist the roster and
/// hand it back through `DeviceManager::add_device`.
#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Colon-separated MAC address. Never changes.
    #[builder(into)]
    address: String,
    #[builder(into)]
    name: Option<String>,
    #[builder(into)]
    serial: Option<String>,
    #[builder(into)]
    hardware_version: Option<String>,
    #[builder(into)]
    firmware_version: Option<String>,
    #[builder(into)]
    tracking_key: Option<String>,
    #[builder(skip)]
    #[serde(default)]
    session: Option<SessionValue>,
    #[builder(skip)]
    #[serde(default)]
    battery_millivolts: Option<u16>,
    #[builder(default)]
    #[serde(default)]
    lock_state: LockState,
    #[builder(skip)]
    #[serde(default)]
    connection_state: ConnectionState,
    offline_key: Option<OfflineKey>,
    offline_unlock_command: Option<OfflineUnlockCommand>,
    /// Unix seconds of the latest advertisement.
    #[builder(skip)]
    #[serde(default)]
    last_seen_at: Option<i64>,
    #[builder(skip)]
    #[serde(default)]
    rssi_samples: VecDeque<i16>,
}

impl DeviceRecord {
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    #[must_use]
    pub fn serial(&self) -> Option<&str> {
        self.serial.as_deref()
    }

    /// Hardware/firmware version string such as `3P-2.10`.
    #[must_use]
    pub fn hardware_version(&self) -> Option<&str> {
        self.hardware_version.as_deref()
    }

    #[must_use]
    pub fn firmware_version(&self) -> Option<&str> {
        self.firmware_version.as_deref()
    }

    #[must_use]
    pub fn tracking_key(&self) -> Option<&str> {
        self.tracking_key.as_deref()
    }

    #[must_use]
    pub fn session(&self) -> Option<&SessionValue> {
        self.session.as_ref()
    }

    #[must_use]
    pub fn battery_millivolts(&self) -> Option<u16> {
        self.battery_millivolts
    }

    #[must_use]
    pub fn lock_state(&self) -> LockState {
        self.lock_state
    }

    #[must_use]
    pub fn connection_state(&self) -> ConnectionState {
        self.connection_state
    }

    #[must_use]
    pub fn offline_key(&self) -> Option<&OfflineKey> {
        self.offline_key.as_ref()
    }

    #[must_use]
    pub fn offline_unlock_command(&self) -> Option<&OfflineUnlockCommand> {
        self.offline_unlock_command.as_ref()
    }

    #[must_use]
    pub fn last_seen_at(&self) -> Option<i64> {
        self.last_seen_at
    }

    /// Most recent RSSI samples, oldest first.
    #[must_use]
    pub fn rssi_samples(&self) -> &VecDeque<i16> {
        &self.rssi_samples
    }

    /// Mean of the retained RSSI samples.
    #[must_use]
    pub fn average_rssi(&self) -> Option<i16> {
        if self.rssi_samples.is_empty() {
            return None;
        }
        let total: i64 = self.rssi_samples.iter().copied().map(i64::from).sum();
        let count = i64::try_from(self.rssi_samples.len()).ok()?;
        i16::try_from(total / count).ok()
    }

    pub(crate) fn set_lock_state(&mut self, lock_state: LockState) {
        self.lock_state = lock_state;
    }

    pub(crate) fn set_connection_state(&mut self, connection_state: ConnectionState) {
        self.connection_state = connection_state;
    }

    pub(crate) fn set_hardware_version(&mut self, version: String) {
        self.hardware_version = Some(version);
    }

    pub(crate) fn set_name(&mut self, name: String) {
        self.name = Some(name);
    }

    pub(crate) fn set_session(&mut self, session: SessionValue) {
        self.battery_millivolts = Some(session.battery_millivolts());
        self.session = Some(session);
    }

    pub(crate) fn clear_session(&mut self) {
        self.session = None;
    }

    pub(crate) fn set_offline_values(&mut self, key: OfflineKey, command: OfflineUnlockCommand) {
        self.offline_key = Some(key);
        self.offline_unlock_command = Some(command);
    }

    /// Records an advertisement sighting, keeping at most `history` samples.
    pub(crate) fn record_sighting(&mut self, rssi: Option<i16>, history: usize) {
        self.last_seen_at = Some(OffsetDateTime::now_utc().unix_timestamp());
        let Some(rssi) = rssi else {
            return;
        };
        self.rssi_samples.push_back(rssi);
        while self.rssi_samples.len() > history {
            self.rssi_samples.pop_front();
        }
    }

    /// Drops per-connection state carried over from a persisted snapshot.
    pub(crate) fn reset_connection(&mut self) {
        self.session = None;
        self.connection_state = ConnectionState::Disconnected;
    }
}
