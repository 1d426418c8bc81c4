//! Environmental measurement data structure.

use chrono::{DateTime, Local, SecondsFormat, Utc};
use std::fmt;

/// A measurement decoded from an environmental-sensing service payload.
///
/// Values are in the units the sensor reports:
/// - Temperature in Celsius
/// - Humidity in percent (0-100)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    /// Instant the sensor took the reading, at one second resolution
    pub timestamp: DateTime<Utc>,
    /// Temperature in Celsius
    pub temperature: f32,
    /// Relative humidity in percent (0-100)
    pub humidity: f32,
}

impl Measurement {
    /// Whether this measurement supersedes `stored`.
    ///
    /// Only a strictly later timestamp counts; a repeated broadcast of the
    /// same reading is not newer.
    pub fn is_newer_than(&self, stored: &Measurement) -> bool {
        self.timestamp > stored.timestamp
    }
}

/// Timezone used when rendering measurement timestamps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeZoneChoice {
    #[default]
    Local,
    Utc,
}

impl TimeZoneChoice {
    /// Render `timestamp` as RFC 3339 in this timezone.
    pub fn render(self, timestamp: DateTime<Utc>) -> String {
        match self {
            TimeZoneChoice::Local => timestamp
                .with_timezone(&Local)
                .to_rfc3339_opts(SecondsFormat::Secs, true),
            TimeZoneChoice::Utc => timestamp.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

/// Borrowing adapter that displays a measurement in a chosen timezone.
///
/// Produces `<timestamp>\t<temperature>℃\t<humidity>%`.
pub struct Rendered<'a> {
    pub measurement: &'a Measurement,
    pub tz: TimeZoneChoice,
}

impl fmt::Display for Rendered<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{:.2}\u{2103}\t{:.2}%",
            self.tz.render(self.measurement.timestamp),
            self.measurement.temperature,
            self.measurement.humidity
        )
    }
}
