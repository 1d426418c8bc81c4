//! `envsense-listener` library.
//!
//! The binary (`src/main.rs`) is responsible for CLI parsing, OS signals and
//! process exit codes. The core logic lives in [`crate::app`], where it can be
//! tested deterministically with an injected scanner and injected trigger and
//! shutdown channels.

pub mod advertisement;
pub mod app;
pub mod ingest;
pub mod measurement;
pub mod payload;
pub mod report;
pub mod scanner;
pub mod store;

#[cfg(test)]
mod test_utils;

// Re-export commonly used types at the crate root
pub use advertisement::{Advertisement, NameFilter};
pub use ingest::Ingestor;
pub use measurement::{Measurement, TimeZoneChoice};
pub use payload::{DecodeError, ENV_SENSING_UUID, decode};
pub use scanner::{Backend, ScanError, ScanEvent};
pub use store::MeasurementStore;
