//! BLE scanner abstraction for environmental-sensing beacons.
//!
//! Each backend turns raw Bluetooth advertisements into backend-independent
//! [`Advertisement`] values and forwards the ones whose name passes the
//! configured [`NameFilter`].

#[cfg(feature = "bluer")]
pub mod bluer;

#[cfg(feature = "hci")]
pub mod hci;

use crate::advertisement::{Advertisement, NameFilter};
use thiserror::Error;
use tokio::sync::mpsc;

/// Error type for scanner operations.
#[derive(Error, Debug)]
pub enum ScanError {
    /// Bluetooth/adapter related error
    #[error("Bluetooth error: {0}")]
    Bluetooth(String),
}

/// An advertisement, or the failure that ended the scan.
///
/// A backend sends at most one `Err`, after which the channel closes.
pub type ScanEvent = Result<Advertisement, ScanError>;

/// Bluetooth AD type for 16-bit UUID service data.
#[cfg(any(feature = "bluer", feature = "hci"))]
pub const SERVICE_DATA_16_TYPE: u8 = 0x16;

/// Channel buffer size for scan events.
pub const SCAN_CHANNEL_BUFFER_SIZE: usize = 100;

/// Available scanner backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Backend {
    /// BlueZ D-Bus backend (requires bluetoothd daemon)
    #[cfg(feature = "bluer")]
    Bluer,
    /// Raw HCI socket backend (direct kernel access, no daemon required)
    #[cfg(feature = "hci")]
    Hci,
}

impl Default for Backend {
    fn default() -> Self {
        #[cfg(feature = "bluer")]
        return Backend::Bluer;
        #[cfg(all(feature = "hci", not(feature = "bluer")))]
        return Backend::Hci;
        #[cfg(not(any(feature = "bluer", feature = "hci")))]
        compile_error!("At least one backend feature must be enabled");
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            #[cfg(feature = "bluer")]
            Backend::Bluer => write!(f, "bluer"),
            #[cfg(feature = "hci")]
            Backend::Hci => write!(f, "hci"),
        }
    }
}

/// Start scanning for advertisements using the specified backend.
///
/// # Arguments
/// * `backend` - The scanner backend to use
/// * `filter` - Only advertisements whose name passes this filter are sent
///
/// # Returns
/// A receiver of advertisements. A fatal backend failure arrives as the last
/// item before the channel closes.
pub async fn start_scan(
    backend: Backend,
    filter: NameFilter,
) -> Result<mpsc::Receiver<ScanEvent>, ScanError> {
    match backend {
        #[cfg(feature = "bluer")]
        Backend::Bluer => bluer::start_scan(filter).await,
        #[cfg(feature = "hci")]
        Backend::Hci => hci::start_scan(filter).await,
    }
}
