use std::fmt;
use std::str::FromStr;

use serde_with::{DeserializeFromStr, SerializeDisplay};

use crate::codec::{self, Packet};
use crate::error::{CodecError, OfflineUnlockError};
use crate::protocol::{
    COMBINED_KEY_LENGTH, COMMAND_HEADER_LENGTH, OFFLINE_COMMAND_HEX_LENGTH,
    OFFLINE_KEY_HEX_LENGTH, PACKET_SIZE,
};

const BLOCK_LENGTH: usize = PACKET_SIZE - COMMAND_HEADER_LENGTH;
const TIMESTAMP_OFFSET: usize = 2;
const CHECKSUM_OFFSET: usize = BLOCK_LENGTH - 1;

/// Backend-issued 16-byte offline key.
#[derive(Clone, Copy, Eq, PartialEq, SerializeDisplay, DeserializeFromStr)]
pub struct OfflineKey([u8; COMBINED_KEY_LENGTH]);

impl FromStr for OfflineKey {
    type Err = OfflineUnlockError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.len() != OFFLINE_KEY_HEX_LENGTH {
            return Err(OfflineUnlockError::InvalidKeyLength {
                actual: value.len(),
            });
        }
        let mut bytes = [0u8; COMBINED_KEY_LENGTH];
        hex::decode_to_slice(value, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for OfflineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for OfflineKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OfflineKey(..)")
    }
}

/// Backend-issued 20-byte offline unlock command template.
#[derive(Clone, Copy, Eq, PartialEq, SerializeDisplay, DeserializeFromStr)]
pub struct OfflineUnlockCommand([u8; PACKET_SIZE]);

impl OfflineUnlockCommand {
    #[must_use]
    pub fn header(&self) -> [u8; COMMAND_HEADER_LENGTH] {
        let mut header = [0u8; COMMAND_HEADER_LENGTH];
        header.copy_from_slice(&self.0[..COMMAND_HEADER_LENGTH]);
        header
    }

    fn block(&self) -> [u8; BLOCK_LENGTH] {
        let mut block = [0u8; BLOCK_LENGTH];
        block.copy_from_slice(&self.0[COMMAND_HEADER_LENGTH..]);
        block
    }
}

impl FromStr for OfflineUnlockCommand {
    type Err = OfflineUnlockError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value.len() != OFFLINE_COMMAND_HEX_LENGTH {
            return Err(OfflineUnlockError::InvalidCommandLength {
                actual: value.len(),
            });
        }
        let mut bytes = [0u8; PACKET_SIZE];
        hex::decode_to_slice(value, &mut bytes)?;
        Ok(Self(bytes))
    }
}

impl fmt::Display for OfflineUnlockCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for OfflineUnlockCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("OfflineUnlockCommand(..)")
    }
}

/// Per-connection session value read from the lock.
#[derive(Clone, Copy, Eq, PartialEq, Hash, SerializeDisplay, DeserializeFromStr)]
pub struct SessionValue([u8; PACKET_SIZE]);

impl SessionValue {
    #[must_use]
    pub fn new(bytes: [u8; PACKET_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PACKET_SIZE] {
        &self.0
    }

    /// Battery voltage reported in bytes 2 and 3, little-endian.
    #[must_use]
    pub fn battery_millivolts(&self) -> u16 {
        u16::from_le_bytes([self.0[2], self.0[3]])
    }
}

impl TryFrom<&[u8]> for SessionValue {
    type Error = CodecError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; PACKET_SIZE] = value
            .try_into()
            .map_err(|_| CodecError::InvalidSessionLength {
                actual: value.len(),
            })?;
        Ok(Self(bytes))
    }
}

impl FromStr for SessionValue {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = codec::decode_hex(value)?;
        Self::try_from(bytes.as_slice())
    }
}

impl fmt::Display for SessionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for SessionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SessionValue({self})")
    }
}

/// Builds the encrypted offline unlock packet.
///
/// The first four command bytes are sent in the clear. The remaining block is
/// optionally stamped with `timestamp` (little-endian at block offset 2, plus
/// a checksum in the last byte) and encrypted with the offline key combined
/// with the session value.
#[must_use]
pub fn derive_offline_packet(
    key: &OfflineKey,
    command: &OfflineUnlockCommand,
    session: &SessionValue,
    timestamp: Option<u32>,
) -> Packet {
    let combined_key = codec::combine_key(&key.0, session.as_bytes());

    let mut block = command.block();
    if let Some(timestamp) = timestamp {
        block[TIMESTAMP_OFFSET..TIMESTAMP_OFFSET + 4].copy_from_slice(&timestamp.to_le_bytes());
        block[CHECKSUM_OFFSET] = codec::checksum(&block[..CHECKSUM_OFFSET]);
    }
    let ciphertext = codec::encrypt_block(&combined_key, &block);

    let mut packet = [0u8; PACKET_SIZE];
    packet[..COMMAND_HEADER_LENGTH].copy_from_slice(&command.header());
    packet[COMMAND_HEADER_LENGTH..].copy_from_slice(&ciphertext);
    Packet::new(packet)
}
