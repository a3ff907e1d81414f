mod btleplug_backend;
mod fake_backend;
mod transport;

pub use self::btleplug_backend::BtleplugTransport;
pub use self::fake_backend::{
    AdvertisementFixture, ConnectBehaviour, FakeTransport, FakeTransportConfig, HexPayload,
    TransportCall,
};
pub use self::transport::{Advertisement, PeerId, Transport, TransportEvent};
