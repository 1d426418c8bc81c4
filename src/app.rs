//! Core application runner (business logic) for `envsense-listener`.
//!
//! This module is intentionally decoupled from CLI parsing, OS signals and
//! process exit codes so it can be tested deterministically.

use crate::advertisement::NameFilter;
use crate::ingest::Ingestor;
use crate::measurement::TimeZoneChoice;
use crate::report::run_reporter;
use crate::scanner::{Backend, ScanError, ScanEvent};
use crate::store::MeasurementStore;
use clap::Parser;
use log::info;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// Configuration for the core run loop.
#[derive(Parser, Debug, Clone, Default)]
#[command(author, about, version)]
pub struct Options {
    /// Only track devices whose name starts with this prefix
    #[arg(long, default_value = "")]
    pub prefix: String,

    /// Bluetooth scanner backend to use
    #[arg(long, default_value_t, value_enum)]
    pub backend: Backend,

    /// Render timestamps in UTC instead of local time
    #[arg(long)]
    pub utc: bool,

    /// Verbose output, log scanner diagnostics
    #[arg(short = 'v', long = "verbose")]
    pub verbose: bool,
}

impl Options {
    pub fn time_zone(&self) -> TimeZoneChoice {
        if self.utc {
            TimeZoneChoice::Utc
        } else {
            TimeZoneChoice::Local
        }
    }
}

/// Errors returned by the core run loop.
#[derive(Error, Debug)]
pub enum RunError {
    #[error("scan failed: {0}")]
    Scan(#[from] ScanError),
}

/// Scanner abstraction to enable deterministic unit tests without Bluetooth hardware.
pub trait Scanner: Send + Sync {
    fn start_scan(
        &self,
        backend: Backend,
        filter: NameFilter,
    ) -> Pin<Box<dyn Future<Output = Result<mpsc::Receiver<ScanEvent>, ScanError>> + Send + '_>>;
}

/// Real scanner implementation that delegates to the compiled-in backends.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealScanner;

impl Scanner for RealScanner {
    fn start_scan(
        &self,
        backend: Backend,
        filter: NameFilter,
    ) -> Pin<Box<dyn Future<Output = Result<mpsc::Receiver<ScanEvent>, ScanError>> + Send + '_>>
    {
        Box::pin(async move { crate::scanner::start_scan(backend, filter).await })
    }
}

/// Run ingestion and reporting until shutdown or scan failure.
///
/// - Every advertisement from `scanner` goes through the [`Ingestor`].
/// - Every message on `triggers` logs a report of the current store.
/// - Flipping `shutdown` to `true` stops both; the advertisement being
///   processed at that moment is finished first.
///
/// Returns the store so callers can inspect the final state.
///
/// # Errors
/// Returns [`RunError::Scan`] if the scanner cannot start or fails while running.
pub async fn run(
    options: Options,
    scanner: &dyn Scanner,
    triggers: mpsc::Receiver<()>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<Arc<MeasurementStore>, RunError> {
    let store = Arc::new(MeasurementStore::new());
    let tz = options.time_zone();
    let ingestor = Ingestor::new(Arc::clone(&store), tz);

    let reporter = tokio::spawn(run_reporter(
        Arc::clone(&store),
        tz,
        triggers,
        shutdown.clone(),
    ));

    let backend = options.backend;
    let filter = NameFilter::new(options.prefix);

    info!("start scan");
    let result: Result<(), RunError> = async {
        let mut events = scanner.start_scan(backend, filter).await?;

        loop {
            if *shutdown.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                event = events.recv() => match event {
                    Some(Ok(adv)) => {
                        ingestor.ingest(&adv);
                    }
                    Some(Err(e)) => return Err(RunError::Scan(e)),
                    None => return Ok(()),
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }
    .await;
    info!("scan finished");

    // The reporter outlives the scan only until shutdown is requested
    reporter.abort();
    let _ = reporter.await;

    result.map(|()| store)
}
