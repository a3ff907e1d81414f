use std::collections::HashMap;
use std::sync::LazyLock;

use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, FromRepr};
use uuid::Uuid;

/// Size of every packet exchanged with a lock, in both directions.
pub const PACKET_SIZE: usize = 20;
/// Length of a backend-issued offline key, in hex characters.
pub const OFFLINE_KEY_HEX_LENGTH: usize = 32;
/// Length of a backend-issued offline unlock command, in hex characters.
pub const OFFLINE_COMMAND_HEX_LENGTH: usize = 40;
/// Number of bytes of the session value mixed into the offline key.
pub(crate) const COMBINED_KEY_LENGTH: usize = 16;
/// Unencrypted header prefix of an offline unlock command.
pub(crate) const COMMAND_HEADER_LENGTH: usize = 4;

/// Primary lock GATT service.
pub const LOCK_SERVICE_UUID: Uuid = Uuid::from_u128(0x1bc5_0001_0200_d29e_e511_446c_609d_b825);
/// Bootloader service exposed while the lock is in firmware-update mode.
pub const FIRMWARE_SERVICE_UUID: Uuid = Uuid::from_u128(0x0000_fe59_0000_1000_8000_0080_5f9b_34fb);

/// First byte of every packet: who the payload is addressed to.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, FromRepr, Display)]
#[repr(u8)]
pub enum Destination {
    /// Opaque log data relayed to the backend ledger.
    #[strum(to_string = "server")]
    Server = 0x50,
    /// Result consumed by the client.
    #[strum(to_string = "app")]
    App = 0x51,
    /// Command addressed to the lock.
    #[strum(to_string = "lock")]
    Lock = 0x52,
    #[strum(to_string = "invalid")]
    Invalid = 0xFF,
}

/// Second byte of an `App` packet.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, FromRepr, Display)]
#[repr(u8)]
pub enum ResultCode {
    #[strum(to_string = "success")]
    Success = 0x60,
    #[strum(to_string = "invalid key")]
    InvalidKey = 0x61,
    #[strum(to_string = "invalid command")]
    InvalidCmd = 0x62,
    #[strum(to_string = "invalid permission")]
    InvalidPermission = 0x63,
    #[strum(to_string = "shutdown")]
    Shutdown = 0x64,
    #[strum(to_string = "invalid data")]
    InvalidData = 0x65,
    #[strum(to_string = "battery data")]
    BatteryData = 0x66,
    #[strum(to_string = "failed to lock")]
    FailedToLock = 0x68,
    #[strum(to_string = "failed to unlock")]
    FailedToUnlock = 0x69,
    #[strum(to_string = "failed to unshackle")]
    FailedToUnshackle = 0x6A,
    #[strum(to_string = "invalid result")]
    Invalid = 0xFF,
}

/// Logical GATT characteristics used to talk to a lock.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, Display)]
pub enum LockCharacteristic {
    /// Outbound command packets.
    #[strum(to_string = "write")]
    Write,
    /// Inbound notifications.
    #[strum(to_string = "receive")]
    Receive,
    /// Per-connection session value, read once.
    #[strum(to_string = "session")]
    Session,
    #[strum(to_string = "bootloader_write")]
    BootloaderWrite,
    #[strum(to_string = "bootloader_receive")]
    BootloaderReceive,
}

impl LockCharacteristic {
    /// Whether the characteristic only exists while the lock runs its bootloader.
    #[must_use]
    pub fn is_bootloader(self) -> bool {
        matches!(self, Self::BootloaderWrite | Self::BootloaderReceive)
    }
}

/// Descriptive metadata for one characteristic.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub(crate) struct CharacteristicMetadata {
    name: &'static str,
    uuid: Uuid,
    service: Uuid,
}

impl CharacteristicMetadata {
    /// Human-readable characteristic name.
    pub(crate) fn name(self) -> &'static str {
        self.name
    }

    pub(crate) fn uuid(self) -> Uuid {
        self.uuid
    }

    /// Owning service UUID.
    pub(crate) fn service(self) -> Uuid {
        self.service
    }
}

static CHARACTERISTICS_BY_ID: LazyLock<HashMap<LockCharacteristic, CharacteristicMetadata>> =
    LazyLock::new(|| {
        LockCharacteristic::iter()
            .map(|characteristic| (characteristic, metadata_for(characteristic)))
            .collect()
    });

static CHARACTERISTICS_BY_UUID: LazyLock<HashMap<Uuid, LockCharacteristic>> =
    LazyLock::new(|| {
        LockCharacteristic::iter()
            .map(|characteristic| (metadata_for(characteristic).uuid, characteristic))
            .collect()
    });

/// Returns metadata for one characteristic.
pub(crate) fn characteristic_metadata(
    characteristic: LockCharacteristic,
) -> CharacteristicMetadata {
    *CHARACTERISTICS_BY_ID
        .get(&characteristic)
        .unwrap_or(&metadata_for(characteristic))
}

/// Resolves a discovered GATT characteristic UUID to its logical role.
pub(crate) fn characteristic_for_uuid(uuid: Uuid) -> Option<LockCharacteristic> {
    CHARACTERISTICS_BY_UUID.get(&uuid).copied()
}

fn metadata_for(characteristic: LockCharacteristic) -> CharacteristicMetadata {
    match characteristic {
        LockCharacteristic::Write => CharacteristicMetadata {
            name: "lock write",
            uuid: Uuid::from_u128(0x1bc5_0002_0200_d29e_e511_446c_609d_b825),
            service: LOCK_SERVICE_UUID,
        },
        LockCharacteristic::Receive => CharacteristicMetadata {
            name: "lock receive",
            uuid: Uuid::from_u128(0x1bc5_0003_0200_d29e_e511_446c_609d_b825),
            service: LOCK_SERVICE_UUID,
        },
        LockCharacteristic::Session => CharacteristicMetadata {
            name: "lock session",
            uuid: Uuid::from_u128(0x1bc5_0004_0200_d29e_e511_446c_609d_b825),
            service: LOCK_SERVICE_UUID,
        },
        LockCharacteristic::BootloaderWrite => CharacteristicMetadata {
            name: "bootloader write",
            uuid: Uuid::from_u128(0x8ec9_0001_f315_4f60_9fb8_8388_30da_ea50),
            service: FIRMWARE_SERVICE_UUID,
        },
        LockCharacteristic::BootloaderReceive => CharacteristicMetadata {
            name: "bootloader receive",
            uuid: Uuid::from_u128(0x8ec9_0002_f315_4f60_9fb8_8388_30da_ea50),
            service: FIRMWARE_SERVICE_UUID,
        },
    }
}
