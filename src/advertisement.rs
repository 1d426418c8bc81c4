//! Backend-independent view of a BLE advertisement.

use uuid::Uuid;

/// An advertisement observed by a scanner backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    /// Local name broadcast by the device (empty when it sent none)
    pub name: String,
    /// Device address, e.g. "AA:BB:CC:DD:EE:FF"
    pub address: String,
    /// Service data blobs tagged with their service UUID
    pub service_data: Vec<(Uuid, Vec<u8>)>,
}

impl Advertisement {
    /// Service data blobs tagged with `uuid`, in broadcast order.
    pub fn service_data_for(&self, uuid: Uuid) -> impl Iterator<Item = &[u8]> {
        self.service_data
            .iter()
            .filter(move |(id, _)| *id == uuid)
            .map(|(_, data)| data.as_slice())
    }
}

/// Device name filter applied by the scanner backends.
///
/// An empty prefix lets every advertisement through.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameFilter {
    prefix: String,
}

impl NameFilter {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        name.starts_with(&self.prefix)
    }
}

/// Format a 6-byte device address as upper-case colon-separated hex.
pub fn format_address(bytes: [u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5]
    )
}
