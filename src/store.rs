//! Latest-measurement store shared by the ingestion and reporting paths.
//!
//! Each device name owns a slot guarded by its own mutex. The index of slots
//! sits behind a read-write lock that is only taken for writing when a device
//! is seen for the first time, so updates for different devices proceed
//! without waiting on each other.

use crate::measurement::Measurement;
use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

type Slot = Arc<Mutex<Measurement>>;

/// Per-device latest measurements, keyed by device name.
///
/// Two physical devices broadcasting the same name share one entry.
#[derive(Debug, Default)]
pub struct MeasurementStore {
    slots: RwLock<HashMap<String, Slot>>,
}

impl MeasurementStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `candidate` for `name` if it is newer than what is stored.
    ///
    /// Returns `true` when the candidate was accepted. A candidate whose
    /// timestamp equals or precedes the stored one is rejected and the stored
    /// value is left untouched.
    pub fn upsert_if_newer(&self, name: &str, candidate: Measurement) -> bool {
        if let Some(slot) = self.slot(name) {
            return replace_if_newer(&slot, candidate);
        }

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        match slots.entry(name.to_owned()) {
            Entry::Vacant(entry) => {
                entry.insert(Arc::new(Mutex::new(candidate)));
                true
            }
            // Another caller inserted the device between our read and write locks
            Entry::Occupied(entry) => {
                let slot = Arc::clone(entry.get());
                drop(slots);
                replace_if_newer(&slot, candidate)
            }
        }
    }

    /// The latest accepted measurement for `name`, if any.
    pub fn get(&self, name: &str) -> Option<Measurement> {
        self.slot(name)
            .map(|slot| *slot.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Copy out every entry, sorted by device name.
    ///
    /// Each entry is read under its own lock, so no entry is ever observed
    /// half-written. Entries are independent, so the copy is not atomic
    /// across devices.
    pub fn snapshot(&self) -> Vec<(String, Measurement)> {
        let mut entries: Vec<(String, Measurement)> = {
            let slots = self.slots.read().unwrap_or_else(PoisonError::into_inner);
            slots
                .iter()
                .map(|(name, slot)| {
                    let measurement = *slot.lock().unwrap_or_else(PoisonError::into_inner);
                    (name.clone(), measurement)
                })
                .collect()
        };
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn slot(&self, name: &str) -> Option<Slot> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
    }
}

fn replace_if_newer(slot: &Mutex<Measurement>, candidate: Measurement) -> bool {
    let mut stored = slot.lock().unwrap_or_else(PoisonError::into_inner);
    if candidate.is_newer_than(&stored) {
        *stored = candidate;
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::measurement_at;
    use std::sync::Barrier;
    use std::thread;

    #[test]
    fn test_first_measurement_accepted() {
        let store = MeasurementStore::new();
        assert!(store.is_empty());
        assert!(store.upsert_if_newer("sensor-1", measurement_at(10)));
        assert_eq!(store.get("sensor-1"), Some(measurement_at(10)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_older_and_equal_rejected() {
        let store = MeasurementStore::new();
        let a = measurement_at(100);
        assert!(store.upsert_if_newer("sensor-1", a));

        let mut same_time = measurement_at(100);
        same_time.temperature = 99.0;
        assert!(!store.upsert_if_newer("sensor-1", same_time));
        assert!(!store.upsert_if_newer("sensor-1", measurement_at(99)));

        assert_eq!(store.get("sensor-1"), Some(a));
    }

    #[test]
    fn test_newer_accepted_and_visible_in_snapshot() {
        let store = MeasurementStore::new();
        assert!(store.upsert_if_newer("sensor-1", measurement_at(100)));
        assert!(store.upsert_if_newer("sensor-1", measurement_at(101)));

        assert_eq!(
            store.snapshot(),
            vec![("sensor-1".to_string(), measurement_at(101))]
        );
    }

    #[test]
    fn test_snapshot_two_devices_sorted() {
        let store = MeasurementStore::new();
        assert!(store.upsert_if_newer("kitchen", measurement_at(5)));
        assert!(store.upsert_if_newer("bedroom", measurement_at(3)));
        assert!(store.upsert_if_newer("kitchen", measurement_at(6)));

        assert_eq!(
            store.snapshot(),
            vec![
                ("bedroom".to_string(), measurement_at(3)),
                ("kitchen".to_string(), measurement_at(6)),
            ]
        );
    }

    #[test]
    fn test_get_unknown_device() {
        let store = MeasurementStore::new();
        assert_eq!(store.get("nobody"), None);
    }

    #[test]
    fn test_concurrent_same_device_keeps_maximum() {
        const THREADS: i64 = 16;
        const PER_THREAD: i64 = 50;

        let store = Arc::new(MeasurementStore::new());
        let barrier = Arc::new(Barrier::new(THREADS as usize));

        let handles: Vec<_> = (0..THREADS)
            .map(|t| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    // Interleave timestamps across threads so they race on the same slot
                    for i in 0..PER_THREAD {
                        store.upsert_if_newer("shared", measurement_at(i * THREADS + t));
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let max = THREADS * PER_THREAD - 1;
        assert_eq!(store.get("shared"), Some(measurement_at(max)));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_concurrent_accepts_never_go_backwards() {
        let store = Arc::new(MeasurementStore::new());
        let accepted = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let store = Arc::clone(&store);
                let accepted = Arc::clone(&accepted);
                thread::spawn(move || {
                    for i in 0..100 {
                        let m = measurement_at(i * 8 + t);
                        if store.upsert_if_newer("shared", m) {
                            accepted.lock().unwrap().push(m.timestamp);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        // Every accepted timestamp is unique: two racing upserts never both win
        let mut accepted = accepted.lock().unwrap().clone();
        let total = accepted.len();
        accepted.sort();
        accepted.dedup();
        assert_eq!(accepted.len(), total);
        assert_eq!(store.get("shared"), Some(measurement_at(799)));
    }

    #[test]
    fn test_distinct_devices_do_not_block() {
        let store = MeasurementStore::new();
        assert!(store.upsert_if_newer("a", measurement_at(1)));
        assert!(store.upsert_if_newer("b", measurement_at(1)));

        // Hold device "a" locked and update device "b" meanwhile
        let slot_a = store.slot("a").unwrap();
        let _guard = slot_a.lock().unwrap();
        assert!(store.upsert_if_newer("b", measurement_at(2)));
        assert!(store.upsert_if_newer("c", measurement_at(1)));
    }

    #[test]
    fn test_concurrent_distinct_devices_all_accepted() {
        let store = Arc::new(MeasurementStore::new());
        let handles: Vec<_> = (0..32)
            .map(|t| {
                let store = Arc::clone(&store);
                thread::spawn(move || store.upsert_if_newer(&format!("sensor-{t}"), measurement_at(t)))
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(store.len(), 32);
    }
}
