//! Ingestion of advertisements into the measurement store.

use crate::advertisement::Advertisement;
use crate::measurement::{Measurement, TimeZoneChoice};
use crate::payload::{self, ENV_SENSING_UUID};
use crate::store::MeasurementStore;
use log::{info, warn};
use std::sync::Arc;

/// Decodes environmental-sensing payloads and records fresh measurements.
///
/// Cheap to clone; clones share the same store.
#[derive(Debug, Clone)]
pub struct Ingestor {
    store: Arc<MeasurementStore>,
    tz: TimeZoneChoice,
}

impl Ingestor {
    pub fn new(store: Arc<MeasurementStore>, tz: TimeZoneChoice) -> Self {
        Self { store, tz }
    }

    /// Process one advertisement and return how many measurements it updated.
    ///
    /// Only service data tagged with [`ENV_SENSING_UUID`] is decoded. Payloads
    /// that fail to decode are logged and skipped. Accepted updates are logged;
    /// stale or repeated readings are dropped silently.
    pub fn ingest(&self, adv: &Advertisement) -> usize {
        let mut accepted = 0;

        for data in adv.service_data_for(ENV_SENSING_UUID) {
            let measurement = match payload::decode(data) {
                Ok(m) => m,
                Err(e) => {
                    warn!(
                        "failed to decode payload from {} ({}): {}",
                        adv.name, adv.address, e
                    );
                    continue;
                }
            };

            if self.store.upsert_if_newer(&adv.name, measurement) {
                info!("{}", update_line(adv, &measurement, self.tz));
                accepted += 1;
            }
        }

        accepted
    }
}

fn update_line(adv: &Advertisement, m: &Measurement, tz: TimeZoneChoice) -> String {
    format!(
        "Update report from {} ({}). ts={}, temp={:.2}, humi={:.2}",
        adv.name,
        adv.address,
        tz.render(m.timestamp),
        m.temperature,
        m.humidity
    )
}
