mod advertisement;
mod codec;
mod device;
mod error;
mod events;
mod hw;
mod ledger;
mod manager;
mod offline;
mod protocol;
mod session;
mod telemetry;
mod utils;

pub use advertisement::{
    BroadcastInfo, HardwareFamily, LOCK_NAME_PREFIX, LockName, decode_advertisement,
};
pub use codec::{Packet, checksum, combine_key, decode_hex, encrypt_block, parse_command_string};
pub use device::{ConnectionState, DeviceRecord, LockState};
pub use error::{
    ApiErrorCode, BackendError, CodecError, Error, ErrorKind, FixtureError, ManagerError,
    OfflineUnlockError, TelemetryError, TransportError,
};
pub use events::{LockEvent, LockObserver};
pub use hw::{
    Advertisement, AdvertisementFixture, BtleplugTransport, ConnectBehaviour, FakeTransport,
    FakeTransportConfig, HexPayload, PeerId, Transport, TransportCall, TransportEvent,
};
pub use ledger::{
    ApiEnvironment, BackendConfig, HttpBackend, LedgerBackend, UploadBatch, UploadLedger,
};
pub use manager::{ConnectOutcome, DeviceManager, FlushOutcome, ManagerConfig, ScanOutcome};
pub use offline::{OfflineKey, OfflineUnlockCommand, SessionValue, derive_offline_packet};
pub use protocol::{
    Destination, FIRMWARE_SERVICE_UUID, LOCK_SERVICE_UUID, LockCharacteristic,
    OFFLINE_COMMAND_HEX_LENGTH, OFFLINE_KEY_HEX_LENGTH, PACKET_SIZE, ResultCode,
};
pub use telemetry::{LogFormat, initialise_tracing};
