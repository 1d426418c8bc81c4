//! On-demand report of the latest measurement per device.

use crate::measurement::{Rendered, TimeZoneChoice};
use crate::store::MeasurementStore;
use log::info;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Render one line per device from a snapshot of `store`.
///
/// Lines have the form `<name>\t<timestamp>\t<temperature>℃\t<humidity>%`.
pub fn report_lines(store: &MeasurementStore, tz: TimeZoneChoice) -> Vec<String> {
    store
        .snapshot()
        .iter()
        .map(|(name, measurement)| format!("{name}\t{}", Rendered { measurement, tz }))
        .collect()
}

/// Wait for report triggers and log the store contents on each one.
///
/// Exits when `shutdown` flips to `true`, when its sender is dropped, or when
/// the trigger channel closes. Returns the number of reports produced.
pub async fn run_reporter(
    store: Arc<MeasurementStore>,
    tz: TimeZoneChoice,
    mut triggers: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) -> usize {
    let mut reports = 0;

    loop {
        if *shutdown.borrow_and_update() {
            break;
        }

        tokio::select! {
            trigger = triggers.recv() => {
                if trigger.is_none() {
                    break;
                }
                info!("showing current environment reported");
                for line in report_lines(&store, tz) {
                    info!("{line}");
                }
                reports += 1;
            }
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    reports
}
