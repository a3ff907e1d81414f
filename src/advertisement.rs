use std::collections::HashMap;
use std::sync::LazyLock;

use serde::Serialize;
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

use crate::device::LockState;

/// Prefix of every lock's advertised local name.
pub const LOCK_NAME_PREFIX: &str = "NOKE";
const LOCK_NAME_LENGTH: usize = 19;
const HARDWARE_TAG_RANGE: std::ops::Range<usize> = 4..6;
const MAC_OFFSET: usize = 7;

const STATUS_BYTE: usize = 2;
const MAJOR_VERSION_BYTE: usize = 3;
const MINOR_VERSION_BYTE: usize = 4;
const AUTO_UNLOCK_BIT: u8 = 0b0001_0000;
const STATE_SHIFT: u8 = 5;

/// Hardware family, resolved once from the advertised hardware tag.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, EnumIter, Display, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HardwareFamily {
    /// `2P` and `3P` padlocks. No state in the broadcast.
    Padlock,
    /// `2U` U-lock.
    ULock,
    /// HD lock, any tag containing `I`.
    HdLock,
    /// `2E` door controller.
    DoorController,
    /// `1C` PB12.
    Pb12,
    Unknown,
}

impl HardwareFamily {
    /// Resolves the two-character hardware tag from a lock name.
    #[must_use]
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "2P" | "3P" => Self::Padlock,
            "2U" => Self::ULock,
            "2E" => Self::DoorController,
            "1C" => Self::Pb12,
            tag if tag.contains('I') => Self::HdLock,
            _ => Self::Unknown,
        }
    }
}

type StateDecoder = fn(u8) -> LockState;

static STATE_DECODERS: LazyLock<HashMap<HardwareFamily, StateDecoder>> = LazyLock::new(|| {
    HardwareFamily::iter()
        .filter_map(|family| decoder_for(family).map(|decoder| (family, decoder)))
        .collect()
});

fn decoder_for(family: HardwareFamily) -> Option<StateDecoder> {
    match family {
        HardwareFamily::ULock => Some(decode_ulock_state),
        HardwareFamily::DoorController => Some(decode_door_controller_state),
        HardwareFamily::HdLock => Some(decode_hd_lock_state),
        HardwareFamily::Padlock | HardwareFamily::Pb12 | HardwareFamily::Unknown => None,
    }
}

fn decode_ulock_state(status: u8) -> LockState {
    match (status >> STATE_SHIFT) & 0x03 {
        0 => LockState::Unlocked,
        1 => LockState::Unshackled,
        2 => LockState::LockedNoMagnet,
        _ => LockState::Locked,
    }
}

fn decode_door_controller_state(status: u8) -> LockState {
    match (status >> STATE_SHIFT) & 0x03 {
        0 => LockState::Unlocked,
        1 => LockState::JammedUnlocking,
        2 => LockState::JammedLocking,
        _ => LockState::Locked,
    }
}

fn decode_hd_lock_state(status: u8) -> LockState {
    LockState::from_firmware((status >> STATE_SHIFT) & 0x07)
}

/// Identity carried in a lock's local name.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct LockName {
    address: String,
    hardware_tag: String,
}

impl LockName {
    /// Parses `NOKE<tag>_<12 hex digits>` into a colon-separated address.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        if name.len() != LOCK_NAME_LENGTH || !name.is_ascii() || !name.starts_with(LOCK_NAME_PREFIX)
        {
            return None;
        }
        let hardware_tag = name.get(HARDWARE_TAG_RANGE)?.to_string();
        let mac = name.get(MAC_OFFSET..)?;
        if !mac.chars().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }

        let address = mac
            .as_bytes()
            .chunks(2)
            .map(|pair| String::from_utf8_lossy(pair).into_owned())
            .collect::<Vec<_>>()
            .join(":");
        Some(Self {
            address,
            hardware_tag,
        })
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    #[must_use]
    pub fn hardware_tag(&self) -> &str {
        &self.hardware_tag
    }
}

/// Pre-connection hints decoded from one advertisement.
#[derive(Debug, Clone, Eq, PartialEq, Serialize)]
pub struct BroadcastInfo {
    pub address: String,
    pub family: HardwareFamily,
    /// `<tag>-<major>.<minor>`, when the manufacturer data carries a version.
    pub hardware_version: Option<String>,
    pub lock_state: LockState,
    pub can_auto_unlock: bool,
}

/// Decodes a lock advertisement. Returns `None` when the name does not follow
/// lock framing.
#[must_use]
pub fn decode_advertisement(local_name: &str, manufacturer_data: &[u8]) -> Option<BroadcastInfo> {
    let name = LockName::parse(local_name)?;
    let family = HardwareFamily::from_tag(name.hardware_tag());

    let hardware_version = match (
        manufacturer_data.get(MAJOR_VERSION_BYTE),
        manufacturer_data.get(MINOR_VERSION_BYTE),
    ) {
        (Some(major), Some(minor)) => Some(format!("{}-{major}.{minor}", name.hardware_tag())),
        _ => None,
    };

    let status = manufacturer_data.get(STATUS_BYTE).copied();
    let lock_state = match (status, STATE_DECODERS.get(&family)) {
        (Some(status), Some(decoder)) => decoder(status),
        _ => LockState::Unknown,
    };
    let can_auto_unlock = status.is_some_and(|status| status & AUTO_UNLOCK_BIT != 0);

    Some(BroadcastInfo {
        address: name.address,
        family,
        hardware_version,
        lock_state,
        can_auto_unlock,
    })
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    fn manufacturer(status: u8) -> Vec<u8> {
        vec![0x00, 0x00, status, 0x02, 0x0A]
    }

    #[test]
    fn ulock_broadcast_with_state_three_is_locked() {
        let info = decode_advertisement("NOKE2U_A1B2C3D4E5F6", &manufacturer(0b0110_0000))
            .expect("lock name should parse");

        assert_eq!(HardwareFamily::ULock, info.family);
        assert_eq!(LockState::Locked, info.lock_state);
        assert_eq!("A1:B2:C3:D4:E5:F6", info.address);
        assert_eq!(Some("2U-2.10".to_string()), info.hardware_version);
        assert_eq!(false, info.can_auto_unlock);
    }

    #[rstest]
    #[case("2U", 0b0000_0000, LockState::Unlocked)]
    #[case("2U", 0b0010_0000, LockState::Unshackled)]
    #[case("2U", 0b0100_0000, LockState::LockedNoMagnet)]
    #[case("2E", 0b0000_0000, LockState::Unlocked)]
    #[case("2E", 0b0010_0000, LockState::JammedUnlocking)]
    #[case("2E", 0b0100_0000, LockState::JammedLocking)]
    #[case("2E", 0b0110_0000, LockState::Locked)]
    #[case("1I", 0b0110_0000, LockState::Locked)]
    #[case("1I", 0b1010_0000, LockState::Unlocking)]
    #[case("1I", 0b1110_0000, LockState::LockedNoMagnet)]
    #[case("1I", 0b0010_0000, LockState::Unknown)]
    #[case("3P", 0b0110_0000, LockState::Unknown)]
    #[case("1C", 0b0110_0000, LockState::Unknown)]
    fn family_decoders_map_status_bits(
        #[case] tag: &str,
        #[case] status: u8,
        #[case] expected: LockState,
    ) {
        let name = format!("NOKE{tag}_001122334455");
        let info = decode_advertisement(&name, &manufacturer(status)).expect("name should parse");
        assert_eq!(expected, info.lock_state);
    }

    #[test]
    fn auto_unlock_bit_is_reported() {
        let info = decode_advertisement("NOKE3P_001122334455", &manufacturer(0b0001_0000))
            .expect("name should parse");
        assert_eq!(true, info.can_auto_unlock);
    }

    #[test]
    fn short_manufacturer_data_yields_no_version_or_state() {
        let info =
            decode_advertisement("NOKE2U_001122334455", &[0x00]).expect("name should parse");
        assert_eq!(None, info.hardware_version);
        assert_eq!(LockState::Unknown, info.lock_state);
    }

    #[rstest]
    #[case("NOKE3P_00112233445")]
    #[case("LOCK3P_001122334455")]
    #[case("NOKE3P_00112233445Z")]
    #[case("")]
    fn non_lock_names_are_rejected(#[case] name: &str) {
        assert_eq!(None, LockName::parse(name));
    }

    #[rstest]
    #[case("2P", HardwareFamily::Padlock)]
    #[case("3P", HardwareFamily::Padlock)]
    #[case("2U", HardwareFamily::ULock)]
    #[case("2E", HardwareFamily::DoorController)]
    #[case("1C", HardwareFamily::Pb12)]
    #[case("4I", HardwareFamily::HdLock)]
    #[case("9Z", HardwareFamily::Unknown)]
    fn hardware_tags_resolve_to_families(#[case] tag: &str, #[case] expected: HardwareFamily) {
        assert_eq!(expected, HardwareFamily::from_tag(tag));
    }
}
