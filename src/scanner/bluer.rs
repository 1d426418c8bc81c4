//! BlueZ D-Bus backend for environmental-sensing scanning.
//!
//! This backend uses the `bluer` crate to communicate with the BlueZ daemon
//! via D-Bus. It requires the `bluetoothd` daemon to be running.

use super::{SCAN_CHANNEL_BUFFER_SIZE, SERVICE_DATA_16_TYPE, ScanError, ScanEvent};
use crate::advertisement::{Advertisement, NameFilter, format_address};
use crate::payload::{ENV_SENSING_UUID, ENV_SENSING_UUID16};
use bluer::monitor::{Monitor, MonitorEvent, Pattern};
use bluer::{Adapter, Address, Device, DeviceEvent, DeviceProperty, Session};
use futures::StreamExt;
use log::debug;
use std::collections::HashMap;
use std::pin::pin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

impl From<bluer::Error> for ScanError {
    fn from(err: bluer::Error) -> Self {
        ScanError::Bluetooth(err.to_string())
    }
}

/// Service data AD structures start with the little-endian 16-bit UUID.
fn env_sensing_pattern() -> Pattern {
    Pattern {
        data_type: SERVICE_DATA_16_TYPE,
        start_position: 0,
        content: ENV_SENSING_UUID16.to_le_bytes().to_vec(),
    }
}

/// Start scanning for environmental-sensing advertisements using BlueZ.
///
/// Registers an advertisement monitor that matches 16-bit service data for
/// the environmental-sensing service. Every matching device is read once when
/// found and then followed through its name and service data property
/// changes. The name filter is applied to each advertisement, so a device
/// whose name BlueZ resolves late is still picked up.
pub async fn start_scan(filter: NameFilter) -> Result<mpsc::Receiver<ScanEvent>, ScanError> {
    let session = Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    let (tx, rx) = mpsc::channel(SCAN_CHANNEL_BUFFER_SIZE);

    let monitor_manager = adapter.monitor().await?;
    let mut monitor_handle = monitor_manager
        .register(Monitor {
            patterns: Some(vec![env_sensing_pattern()]),
            ..Default::default()
        })
        .await?;

    // Spawn a task that owns all Bluetooth state and runs the event loop
    tokio::spawn(async move {
        let _session = session;
        let _monitor_manager = monitor_manager;
        let mut followed = HashMap::new();

        while let Some(event) = monitor_handle.next().await {
            let MonitorEvent::DeviceFound(device_id) = event else {
                continue;
            };
            let address = device_id.device;
            if let Err(e) = process_device(&adapter, address, &filter, &tx, &mut followed).await {
                debug!("skipping device {address}: {e}");
            }
            if tx.is_closed() {
                return;
            }
        }

        let _ = tx
            .send(Err(ScanError::Bluetooth(
                "advertisement monitor stopped".into(),
            )))
            .await;
    });

    Ok(rx)
}

/// Read a found device, forward its advertisement and start following it.
async fn process_device(
    adapter: &Adapter,
    address: Address,
    filter: &NameFilter,
    tx: &mpsc::Sender<ScanEvent>,
    followed: &mut HashMap<Address, JoinHandle<()>>,
) -> Result<(), ScanError> {
    let device = adapter.device(address)?;
    let name = device.name().await?.unwrap_or_default();
    let mut tracker = DeviceTracker::new(address, name, filter.clone());

    if let Some(service_data) = device.service_data().await?
        && let Some(adv) = tracker.apply(DeviceProperty::ServiceData(service_data))
    {
        let _ = tx.send(Ok(adv)).await;
    }

    // A follower ends when BlueZ drops the device; a later sighting restarts it
    followed.retain(|_, handle| !handle.is_finished());
    if !followed.contains_key(&address) {
        followed.insert(address, tokio::spawn(follow_device(device, tracker, tx.clone())));
    }

    Ok(())
}

/// Forward every service data update of an already found device.
///
/// BlueZ reports repeated broadcasts from a known device as property changes
/// rather than new monitor events.
async fn follow_device(device: Device, mut tracker: DeviceTracker, tx: mpsc::Sender<ScanEvent>) {
    let address = device.address();
    let events = match device.events().await {
        Ok(events) => events,
        Err(e) => {
            debug!("cannot follow {address}: {e}");
            return;
        }
    };
    let mut events = pin!(events);

    while let Some(event) = events.next().await {
        let DeviceEvent::PropertyChanged(property) = event;
        if let Some(adv) = tracker.apply(property)
            && tx.send(Ok(adv)).await.is_err()
        {
            return;
        }
    }
    debug!("stopped following {address}");
}

/// The name and filter state of one followed device.
#[derive(Debug)]
struct DeviceTracker {
    address: Address,
    name: String,
    filter: NameFilter,
}

impl DeviceTracker {
    fn new(address: Address, name: String, filter: NameFilter) -> Self {
        Self {
            address,
            name,
            filter,
        }
    }

    /// Update from a property change, returning an advertisement to forward.
    fn apply(&mut self, property: DeviceProperty) -> Option<Advertisement> {
        match property {
            DeviceProperty::Name(name) => {
                if name != self.name {
                    debug!("{} is now named {name:?}", self.address);
                    self.name = name;
                }
                None
            }
            DeviceProperty::ServiceData(service_data)
                if service_data.contains_key(&ENV_SENSING_UUID) =>
            {
                if !self.filter.matches(&self.name) {
                    return None;
                }
                Some(advertisement(&self.name, self.address, service_data))
            }
            _ => None,
        }
    }
}

fn advertisement(name: &str, address: Address, service_data: HashMap<Uuid, Vec<u8>>) -> Advertisement {
    Advertisement {
        name: name.to_string(),
        address: format_address(address.0),
        service_data: service_data.into_iter().collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_sensing_pattern() {
        let pattern = env_sensing_pattern();
        assert_eq!(pattern.data_type, 0x16);
        assert_eq!(pattern.start_position, 0);
        assert_eq!(pattern.content, vec![0x1A, 0x18]);
    }

    #[test]
    fn test_advertisement_from_bluer_parts() {
        let address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let service_data = HashMap::from([(ENV_SENSING_UUID, vec![1, 2, 3])]);

        let adv = advertisement("ENV-kitchen", address, service_data);
        assert_eq!(adv.name, "ENV-kitchen");
        assert_eq!(adv.address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(adv.service_data, vec![(ENV_SENSING_UUID, vec![1, 2, 3])]);
    }

    fn env_service_data() -> HashMap<Uuid, Vec<u8>> {
        HashMap::from([(ENV_SENSING_UUID, vec![1, 2, 3])])
    }

    #[test]
    fn test_device_tracker_picks_up_late_name() {
        let address = Address([0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);
        let mut tracker = DeviceTracker::new(address, String::new(), NameFilter::new("ENV-"));

        // Unnamed devices do not pass a prefix filter
        assert_eq!(tracker.apply(DeviceProperty::ServiceData(env_service_data())), None);

        assert_eq!(tracker.apply(DeviceProperty::Name("ENV-kitchen".into())), None);
        let adv = tracker
            .apply(DeviceProperty::ServiceData(env_service_data()))
            .unwrap();
        assert_eq!(adv.name, "ENV-kitchen");
        assert_eq!(adv.address, "AA:BB:CC:DD:EE:FF");
    }

    #[test]
    fn test_device_tracker_applies_filter_per_event() {
        let address = Address([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let mut tracker = DeviceTracker::new(address, "ENV-kitchen".into(), NameFilter::new("ENV-"));
        assert!(tracker.apply(DeviceProperty::ServiceData(env_service_data())).is_some());

        tracker.apply(DeviceProperty::Name("Phone".into()));
        assert_eq!(tracker.apply(DeviceProperty::ServiceData(env_service_data())), None);
    }

    #[test]
    fn test_device_tracker_renames_without_filter() {
        let address = Address([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let mut tracker = DeviceTracker::new(address, String::new(), NameFilter::default());
        assert_eq!(
            tracker
                .apply(DeviceProperty::ServiceData(env_service_data()))
                .unwrap()
                .name,
            ""
        );

        tracker.apply(DeviceProperty::Name("ENV-bedroom".into()));
        assert_eq!(
            tracker
                .apply(DeviceProperty::ServiceData(env_service_data()))
                .unwrap()
                .name,
            "ENV-bedroom"
        );
    }

    #[test]
    fn test_device_tracker_ignores_foreign_service_data() {
        let address = Address([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
        let mut tracker = DeviceTracker::new(address, "ENV-kitchen".into(), NameFilter::default());
        let foreign = HashMap::from([(Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb), vec![0x64])]);
        assert_eq!(tracker.apply(DeviceProperty::ServiceData(foreign)), None);
        assert_eq!(tracker.apply(DeviceProperty::Rssi(-60)), None);
    }
}
