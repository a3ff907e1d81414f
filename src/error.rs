use derive_more::{Display, From};
use serde::{Deserialize, Serialize};
use strum_macros::FromRepr;
use thiserror::Error;

use crate::protocol::{
    LockCharacteristic, OFFLINE_COMMAND_HEX_LENGTH, OFFLINE_KEY_HEX_LENGTH, PACKET_SIZE,
    ResultCode, characteristic_metadata,
};

/// Errors returned when encoding or decoding wire payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("`{value}` is not valid hexadecimal")]
    InvalidHex {
        value: String,
        source: hex::FromHexError,
    },
    #[error("packets must be exactly {expected} bytes, got {actual}", expected = PACKET_SIZE)]
    InvalidPacketLength { actual: usize },
    #[error(
        "session values must be exactly {expected} bytes, got {actual}",
        expected = PACKET_SIZE
    )]
    InvalidSessionLength { actual: usize },
    #[error("the command string contains no commands")]
    EmptyCommandString,
}

/// Errors returned while preparing an offline unlock.
#[derive(Debug, Error)]
pub enum OfflineUnlockError {
    #[error(
        "offline keys must be {expected} hex characters, got {actual}",
        expected = OFFLINE_KEY_HEX_LENGTH
    )]
    InvalidKeyLength { actual: usize },
    #[error(
        "offline unlock commands must be {expected} hex characters, got {actual}",
        expected = OFFLINE_COMMAND_HEX_LENGTH
    )]
    InvalidCommandLength { actual: usize },
    #[error("offline value is not valid hexadecimal")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("no offline key and unlock command are stored for `{address}`")]
    MissingOfflineValues { address: String },
}

/// Errors returned by the radio transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("BLE operation failed")]
    Ble(#[from] btleplug::Error),
    #[error("no BLE adapters were found")]
    NoAdapters,
    #[error("peer `{peer}` is not known to the transport")]
    UnknownPeer { peer: String },
    #[error("peer `{peer}` refused the connection")]
    ConnectionRefused { peer: String },
    #[error(
        "required characteristic `{name}` ({uuid}) was not found on the connected lock",
        name = characteristic_metadata(*characteristic).name(),
        uuid = characteristic_metadata(*characteristic).uuid()
    )]
    MissingCharacteristic { characteristic: LockCharacteristic },
    #[error("the session characteristic returned {actual} bytes")]
    InvalidSession { actual: usize },
    #[error(transparent)]
    Fixture(#[from] FixtureError),
}

/// Errors returned by the upload/restore backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend request failed")]
    Http(#[from] reqwest::Error),
    #[error("backend rejected the request with error code {code}: {message}")]
    Api { code: i64, message: String },
    #[error("restore response did not contain any commands")]
    MissingCommands,
    #[error("backend URL `{url}` must start with http:// or https://")]
    InvalidUrl { url: String },
}

impl BackendError {
    /// Backend error code, with transport failures reported as unknown.
    #[must_use]
    pub fn code(&self) -> i64 {
        match self {
            Self::Api { code, .. } => *code,
            Self::Http(_) | Self::MissingCommands | Self::InvalidUrl { .. } => {
                ApiErrorCode::Unknown as i64
            }
        }
    }
}

/// Error codes documented by the lock backend.
#[derive(Debug, Clone, Copy, Eq, PartialEq, FromRepr, strum_macros::Display)]
#[repr(i64)]
pub enum ApiErrorCode {
    #[strum(to_string = "internal server error")]
    InternalServer = 1,
    #[strum(to_string = "invalid API key")]
    ApiKey = 2,
    #[strum(to_string = "invalid input")]
    Input = 3,
    #[strum(to_string = "invalid request method")]
    RequestMethod = 4,
    #[strum(to_string = "invalid endpoint")]
    InvalidEndpoint = 5,
    #[strum(to_string = "company not found")]
    CompanyNotFound = 6,
    #[strum(to_string = "lock not found")]
    LockNotFound = 7,
    #[strum(to_string = "unknown error")]
    Unknown = 99,
}

/// Errors returned by device registry operations.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("no lock with address `{address}` is registered")]
    UnknownDevice { address: String },
    #[error("lock `{address}` has no active session")]
    NotConnected { address: String },
    #[error("lock `{address}` has not been discovered by a scan yet")]
    NotDiscovered { address: String },
}

/// Errors returned when parsing fake transport fixtures.
#[derive(Debug, Error)]
pub enum FixtureError {
    #[error("the fake advertisement fixture is empty")]
    EmptyFixture,
    #[error("fixture records must contain four pipe-delimited fields")]
    InvalidRecordFieldCount,
    #[error("fixture records cannot contain empty mandatory fields")]
    EmptyRecordField,
    #[error("failed to parse RSSI value")]
    InvalidRssi(#[from] std::num::ParseIntError),
    #[error("fixture payload `{value}` is not valid hexadecimal")]
    InvalidHex {
        value: String,
        source: hex::FromHexError,
    },
}

/// Errors returned by telemetry initialisation.
#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("failed to install tracing subscriber")]
    Subscriber(#[from] tracing_subscriber::util::TryInitError),
}

/// Top-level error wrapping module-specific error types.
#[derive(Debug, Error, From)]
pub enum Error {
    #[error(transparent)]
    #[from(CodecError, Box<CodecError>)]
    Codec(Box<CodecError>),
    #[error(transparent)]
    #[from(OfflineUnlockError, Box<OfflineUnlockError>)]
    OfflineUnlock(Box<OfflineUnlockError>),
    #[error(transparent)]
    #[from(TransportError, Box<TransportError>)]
    Transport(Box<TransportError>),
    #[error(transparent)]
    #[from(BackendError, Box<BackendError>)]
    Backend(Box<BackendError>),
    #[error(transparent)]
    #[from(ManagerError, Box<ManagerError>)]
    Manager(Box<ManagerError>),
}

impl Error {
    /// Classifies the error into the taxonomy carried by observer events.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Codec(error) => match error.as_ref() {
                CodecError::InvalidPacketLength { .. } => ErrorKind::InvalidPacket,
                _ => ErrorKind::InvalidCommandString,
            },
            Self::OfflineUnlock(_) => ErrorKind::InvalidOfflineKey,
            Self::Transport(_) => ErrorKind::Transport,
            Self::Backend(error) => ErrorKind::BackendError(error.code()),
            Self::Manager(error) => match error.as_ref() {
                ManagerError::UnknownDevice { .. } => ErrorKind::UnknownDevice,
                ManagerError::NotConnected { .. } | ManagerError::NotDiscovered { .. } => {
                    ErrorKind::NotConnected
                }
            },
        }
    }
}

/// Error taxonomy reported to observers.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Display, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ErrorKind {
    #[display("backend error {_0}")]
    BackendError(i64),
    #[display("invalid key")]
    InvalidKey,
    #[display("invalid command")]
    InvalidCmd,
    #[display("invalid permission")]
    InvalidPermission,
    #[display("invalid data")]
    InvalidData,
    #[display("failed to lock")]
    FailedToLock,
    #[display("failed to unlock")]
    FailedToUnlock,
    #[display("failed to unshackle")]
    FailedToUnshackle,
    #[display("invalid result")]
    InvalidResult,
    #[display("unknown result 0x{_0:02x}")]
    UnknownResult(u8),
    #[display("invalid packet")]
    InvalidPacket,
    #[display("invalid offline key")]
    InvalidOfflineKey,
    #[display("invalid command string")]
    InvalidCommandString,
    #[display("connection timeout")]
    ConnectionTimeout,
    #[display("unexpected disconnect")]
    UnexpectedDisconnect,
    #[display("transport failure")]
    Transport,
    #[display("not connected")]
    NotConnected,
    #[display("unknown device")]
    UnknownDevice,
}

impl ErrorKind {
    /// Maps a lock result code to its error kind. `None` for non-error results.
    #[must_use]
    pub fn from_result_code(code: ResultCode) -> Option<Self> {
        match code {
            ResultCode::Success | ResultCode::Shutdown => None,
            ResultCode::InvalidKey => Some(Self::InvalidKey),
            ResultCode::InvalidCmd => Some(Self::InvalidCmd),
            ResultCode::InvalidPermission => Some(Self::InvalidPermission),
            ResultCode::InvalidData => Some(Self::InvalidData),
            ResultCode::FailedToLock => Some(Self::FailedToLock),
            ResultCode::FailedToUnlock => Some(Self::FailedToUnlock),
            ResultCode::FailedToUnshackle => Some(Self::FailedToUnshackle),
            ResultCode::Invalid => Some(Self::InvalidResult),
            ResultCode::BatteryData => Some(Self::UnknownResult(code as u8)),
        }
    }

    /// Numeric code shared with the lock firmware and backend, where one exists.
    #[must_use]
    pub fn code(self) -> Option<i64> {
        match self {
            Self::BackendError(code) => Some(code),
            Self::InvalidKey => Some(261),
            Self::InvalidCmd => Some(262),
            Self::InvalidPermission => Some(263),
            Self::InvalidData => Some(265),
            Self::InvalidResult => Some(267),
            Self::FailedToLock
            | Self::FailedToUnlock
            | Self::FailedToUnshackle
            | Self::UnknownResult(_)
            | Self::InvalidPacket => Some(268),
            Self::InvalidOfflineKey => Some(301),
            Self::ConnectionTimeout => Some(317),
            Self::InvalidCommandString
            | Self::UnexpectedDisconnect
            | Self::Transport
            | Self::NotConnected
            | Self::UnknownDevice => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    use super::*;

    #[test]
    fn backend_api_errors_keep_their_code() {
        let error = Error::from(BackendError::Api {
            code: 7,
            message: "bad session".to_string(),
        });

        assert_eq!(ErrorKind::BackendError(7), error.kind());
        assert_eq!(
            "backend rejected the request with error code 7: bad session",
            error.to_string()
        );
    }

    #[test]
    fn offline_unlock_errors_classify_as_invalid_offline_key() {
        let error = Error::from(OfflineUnlockError::InvalidKeyLength { actual: 3 });
        assert_eq!(ErrorKind::InvalidOfflineKey, error.kind());
        assert_eq!(Some(301), error.kind().code());
    }

    #[rstest]
    #[case(ResultCode::Success, None)]
    #[case(ResultCode::Shutdown, None)]
    #[case(ResultCode::InvalidKey, Some(ErrorKind::InvalidKey))]
    #[case(ResultCode::BatteryData, Some(ErrorKind::UnknownResult(0x66)))]
    #[case(ResultCode::Invalid, Some(ErrorKind::InvalidResult))]
    fn result_codes_map_to_error_kinds(
        #[case] code: ResultCode,
        #[case] expected: Option<ErrorKind>,
    ) {
        assert_eq!(expected, ErrorKind::from_result_code(code));
    }

    #[test]
    fn api_error_codes_resolve_from_backend_values() {
        assert_matches!(ApiErrorCode::from_repr(7), Some(ApiErrorCode::LockNotFound));
        assert_eq!(None, ApiErrorCode::from_repr(42));
    }
}
