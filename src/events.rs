use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::trace;

use crate::device::LockState;
use crate::error::ErrorKind;

/// Everything a `DeviceManager` reports to its observer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockEvent {
    /// A registered (or openly discovered) lock advertised.
    Discovered {
        address: String,
        lock_state: LockState,
        hardware_version: Option<String>,
        rssi: Option<i16>,
        can_auto_unlock: bool,
    },
    Connecting {
        address: String,
    },
    /// The session value was read and the lock accepts commands.
    Connected {
        address: String,
        battery_millivolts: u16,
    },
    Syncing {
        address: String,
    },
    /// The command queue drained after a success acknowledgment.
    Unlocked {
        address: String,
    },
    Disconnected {
        address: String,
    },
    ShutDown {
        address: String,
        is_locked: bool,
        did_timeout: bool,
    },
    /// The lock booted into its bootloader.
    ReadyForFirmwareUpdate {
        address: String,
    },
    UploadsFlushed {
        batches: usize,
    },
    RestoreConfirmed {
        address: String,
        command_id: u8,
    },
    Error {
        kind: ErrorKind,
        message: String,
        address: Option<String>,
    },
}

impl LockEvent {
    /// Address of the lock the event concerns, if any.
    #[must_use]
    pub fn address(&self) -> Option<&str> {
        match self {
            Self::Discovered { address, .. }
            | Self::Connecting { address }
            | Self::Connected { address, .. }
            | Self::Syncing { address }
            | Self::Unlocked { address }
            | Self::Disconnected { address }
            | Self::ShutDown { address, .. }
            | Self::ReadyForFirmwareUpdate { address }
            | Self::RestoreConfirmed { address, .. } => Some(address),
            Self::Error { address, .. } => address.as_deref(),
            Self::UploadsFlushed { .. } => None,
        }
    }

    pub(crate) fn error(
        kind: ErrorKind,
        message: impl Into<String>,
        address: Option<&str>,
    ) -> Self {
        Self::Error {
            kind,
            message: message.into(),
            address: address.map(str::to_string),
        }
    }
}

/// Receives every event emitted by a `DeviceManager`.
pub trait LockObserver: Send + Sync {
    fn on_event(&self, event: LockEvent);
}

impl LockObserver for mpsc::UnboundedSender<LockEvent> {
    fn on_event(&self, event: LockEvent) {
        if self.send(event).is_err() {
            trace!("lock event receiver dropped");
        }
    }
}
