//! Decoder for the environmental-sensing service payload.
//!
//! The payload is a fixed 12-byte little-endian record:
//!
//! | offset | size | field                         |
//! |--------|------|-------------------------------|
//! | 0      | 8    | timestamp, unix epoch seconds |
//! | 8      | 2    | raw temperature               |
//! | 10     | 2    | raw humidity                  |
//!
//! Any bytes after the record are ignored.

use crate::measurement::Measurement;
use chrono::DateTime;
use std::fmt;
use std::io::{self, Read};
use thiserror::Error;
use uuid::Uuid;

/// GATT service 0x181a, environmental sensing.
pub const ENV_SENSING_UUID: Uuid = Uuid::from_u128(0x0000181a_0000_1000_8000_00805f9b34fb);

/// The 16-bit short form of [`ENV_SENSING_UUID`].
pub const ENV_SENSING_UUID16: u16 = 0x181a;

/// Number of bytes a payload must have to decode.
pub const PAYLOAD_LEN: usize = 12;

/// Temperature range covered by the raw 16-bit value, in Celsius.
const TEMPERATURE_MIN: f32 = -45.0;
const TEMPERATURE_SPAN: f32 = 175.0;

const RAW_FULL_SCALE: f32 = 65535.0;

/// Field of the payload record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Timestamp,
    Temperature,
    Humidity,
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Field::Timestamp => write!(f, "timestamp"),
            Field::Temperature => write!(f, "temperature"),
            Field::Humidity => write!(f, "humidity"),
        }
    }
}

/// Error types for decoding a payload.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The payload ended before `field` could be read
    #[error("failed to parse {field}: {source}")]
    Truncated {
        field: Field,
        #[source]
        source: io::Error,
    },
    /// The epoch seconds value does not fit a calendar date
    #[error("timestamp {0} is out of range")]
    TimestampOutOfRange(u64),
}

impl DecodeError {
    /// The field that could not be decoded.
    pub fn field(&self) -> Field {
        match self {
            DecodeError::Truncated { field, .. } => *field,
            DecodeError::TimestampOutOfRange(_) => Field::Timestamp,
        }
    }
}

fn read_le<const N: usize>(reader: &mut impl Read, field: Field) -> Result<[u8; N], DecodeError> {
    let mut buf = [0u8; N];
    reader
        .read_exact(&mut buf)
        .map_err(|source| DecodeError::Truncated { field, source })?;
    Ok(buf)
}

fn scale(raw: u16) -> f32 {
    f32::from(raw) / RAW_FULL_SCALE
}

/// Decode an environmental-sensing payload into a [`Measurement`].
///
/// # Errors
/// Returns [`DecodeError::Truncated`] naming the first field that did not fit
/// in `data`, or [`DecodeError::TimestampOutOfRange`] for an epoch value that
/// cannot be represented.
///
/// # Example
/// ```
/// use envsense_listener::payload::decode;
///
/// let m = decode(&[0x4D, 0x65, 0x44, 0x61, 0, 0, 0, 0, 0xE7, 0x66, 0x68, 0x99]).unwrap();
/// assert_eq!(m.timestamp.timestamp(), 1_631_872_333);
/// ```
pub fn decode(data: &[u8]) -> Result<Measurement, DecodeError> {
    let mut reader = data;

    let epoch = u64::from_le_bytes(read_le(&mut reader, Field::Timestamp)?);
    let raw_temperature = u16::from_le_bytes(read_le(&mut reader, Field::Temperature)?);
    let raw_humidity = u16::from_le_bytes(read_le(&mut reader, Field::Humidity)?);

    let timestamp = i64::try_from(epoch)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or(DecodeError::TimestampOutOfRange(epoch))?;

    Ok(Measurement {
        timestamp,
        temperature: TEMPERATURE_MIN + TEMPERATURE_SPAN * scale(raw_temperature),
        humidity: 100.0 * scale(raw_humidity),
    })
}
