use std::time::Duration;

use bon::Builder;

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_ADMISSION_BACKOFF: Duration = Duration::from_secs(1);
const DEFAULT_RSSI_HISTORY: usize = 10;

/// Settings for a `DeviceManager`.
#[derive(Debug, Clone, Builder)]
pub struct ManagerConfig {
    /// Time allowed for a connection to reach `Connected`.
    #[builder(default = DEFAULT_CONNECT_TIMEOUT)]
    connect_timeout: Duration,
    /// Delay before a deferred scan or connect is retried.
    #[builder(default = DEFAULT_ADMISSION_BACKOFF)]
    admission_backoff: Duration,
    /// Advertisements weaker than this are ignored.
    rssi_threshold: Option<i16>,
    /// Register unknown locks on first sighting.
    #[builder(default)]
    open_discovery: bool,
    #[builder(default = DEFAULT_RSSI_HISTORY)]
    rssi_history: usize,
    #[builder(default = true)]
    allow_duplicates: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl ManagerConfig {
    pub(crate) fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    pub(crate) fn admission_backoff(&self) -> Duration {
        self.admission_backoff
    }

    pub(crate) fn rssi_threshold(&self) -> Option<i16> {
        self.rssi_threshold
    }

    pub(crate) fn open_discovery(&self) -> bool {
        self.open_discovery
    }

    pub(crate) fn rssi_history(&self) -> usize {
        self.rssi_history
    }

    pub(crate) fn allow_duplicates(&self) -> bool {
        self.allow_duplicates
    }
}
