use crate::advertisement::Advertisement;
use crate::measurement::Measurement;
use crate::payload::ENV_SENSING_UUID;
use chrono::DateTime;

/// A stable device address for unit tests.
pub const TEST_ADDRESS: &str = "AA:BB:CC:DD:EE:FF";

/// 2021-09-17 09:52:13 UTC, 25.34 degC, 59.93 %.
pub const SAMPLE_PAYLOAD: [u8; 12] = [
    0x4D, 0x65, 0x44, 0x61, 0x00, 0x00, 0x00, 0x00, 0xE7, 0x66, 0x68, 0x99,
];

/// Build a `Measurement` taken `secs` seconds after the epoch.
pub fn measurement_at(secs: i64) -> Measurement {
    Measurement {
        timestamp: DateTime::from_timestamp(secs, 0).unwrap(),
        temperature: 21.5,
        humidity: 40.0,
    }
}

/// Encode a payload with the given epoch seconds and raw readings.
pub fn payload(epoch: u64, raw_temperature: u16, raw_humidity: u16) -> Vec<u8> {
    let mut data = Vec::with_capacity(12);
    data.extend_from_slice(&epoch.to_le_bytes());
    data.extend_from_slice(&raw_temperature.to_le_bytes());
    data.extend_from_slice(&raw_humidity.to_le_bytes());
    data
}

/// An advertisement from `name` carrying `data` under the environmental-sensing UUID.
pub fn env_advertisement(name: &str, data: Vec<u8>) -> Advertisement {
    Advertisement {
        name: name.to_string(),
        address: TEST_ADDRESS.to_string(),
        service_data: vec![(ENV_SENSING_UUID, data)],
    }
}
