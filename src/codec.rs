use std::fmt;
use std::str::FromStr;

use aes::Aes128;
use aes::cipher::{BlockEncrypt, KeyInit};
use serde::{Deserialize, Serialize};
use serde_with::hex::Hex;
use serde_with::serde_as;

use crate::error::CodecError;
use crate::protocol::{COMBINED_KEY_LENGTH, Destination, PACKET_SIZE};

/// Separator between commands in a backend-issued command string.
const COMMAND_SEPARATOR: char = '+';

/// One 20-byte packet as exchanged with a lock.
///
/// Outbound packets are opaque and already encrypted. The queue never looks
/// inside them.
#[serde_as]
#[derive(Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Packet(#[serde_as(as = "Hex")] [u8; PACKET_SIZE]);

impl Packet {
    #[must_use]
    pub fn new(bytes: [u8; PACKET_SIZE]) -> Self {
        Self(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8; PACKET_SIZE] {
        &self.0
    }

    /// Decoded destination tag, if byte 0 is a known tag.
    #[must_use]
    pub fn destination(&self) -> Option<Destination> {
        Destination::from_repr(self.0[0])
    }
}

impl TryFrom<&[u8]> for Packet {
    type Error = CodecError;

    fn try_from(value: &[u8]) -> Result<Self, Self::Error> {
        let bytes: [u8; PACKET_SIZE] = value
            .try_into()
            .map_err(|_| CodecError::InvalidPacketLength {
                actual: value.len(),
            })?;
        Ok(Self(bytes))
    }
}

impl FromStr for Packet {
    type Err = CodecError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex(value)?;
        Self::try_from(bytes.as_slice())
    }
}

impl fmt::Display for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({self})")
    }
}

/// Decodes a hex string, ignoring surrounding whitespace.
pub fn decode_hex(value: &str) -> Result<Vec<u8>, CodecError> {
    let trimmed = value.trim();
    hex::decode(trimmed).map_err(|source| CodecError::InvalidHex {
        value: trimmed.to_string(),
        source,
    })
}

/// Splits a `+`-delimited command string into packets.
///
/// Empty segments are skipped. Fails fast on the first malformed command so
/// nothing is queued from a partially valid string.
pub fn parse_command_string(commands: &str) -> Result<Vec<Packet>, CodecError> {
    let packets = commands
        .split(COMMAND_SEPARATOR)
        .map(str::trim)
        .filter(|command| !command.is_empty())
        .map(Packet::from_str)
        .collect::<Result<Vec<_>, _>>()?;

    if packets.is_empty() {
        return Err(CodecError::EmptyCommandString);
    }
    Ok(packets)
}

/// Truncating 8-bit sum of all bytes.
#[must_use]
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, byte| sum.wrapping_add(*byte))
}

/// Mixes the session value into a 16-byte key by mod-256 addition.
#[must_use]
pub fn combine_key(
    key: &[u8; COMBINED_KEY_LENGTH],
    session: &[u8; PACKET_SIZE],
) -> [u8; COMBINED_KEY_LENGTH] {
    let mut combined = [0u8; COMBINED_KEY_LENGTH];
    for (index, value) in combined.iter_mut().enumerate() {
        *value = key[index].wrapping_add(session[index]);
    }
    combined
}

/// Encrypts exactly one 16-byte block with AES-128.
#[must_use]
pub fn encrypt_block(key: &[u8; 16], block: &[u8; 16]) -> [u8; 16] {
    let cipher = Aes128::new(key.into());
    let mut output = *block;
    cipher.encrypt_block(output.as_mut_slice().into());
    output
}
