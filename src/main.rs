use clap::Parser;
use envsense_listener::app::{Options, RealScanner, run};
use log::{debug, error, info};
use std::io;
use std::panic::{self, PanicHookInfo};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{mpsc, watch};

/// Exit codes for the application
const EXIT_SUCCESS: i32 = 0;
const EXIT_ERROR: i32 = 1;
const EXIT_PANIC: i32 = 2;

fn init_logger(verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

/// Route OS signals into the report trigger and shutdown channels.
///
/// SIGUSR1 requests a report; SIGINT and SIGTERM request shutdown.
fn spawn_signal_handlers(
    triggers: mpsc::Sender<()>,
    shutdown: watch::Sender<bool>,
) -> io::Result<()> {
    let mut usr1 = signal(SignalKind::user_defined1())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = usr1.recv() => {
                    debug!("SIGUSR1 received");
                    // A report already queued will show the same data
                    let _ = triggers.try_send(());
                }
                _ = interrupt.recv() => break,
                _ = terminate.recv() => break,
            }
        }
        info!("signal received, terminating...");
        let _ = shutdown.send(true);
    });

    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Set up panic hook to ensure clean exit codes for process managers
    panic::set_hook(Box::new(move |info: &PanicHookInfo| {
        eprintln!("Panic! {}", info);
        std::process::exit(EXIT_PANIC);
    }));

    let options = Options::parse();
    init_logger(options.verbose);

    let (trigger_tx, trigger_rx) = mpsc::channel(1);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(why) = spawn_signal_handlers(trigger_tx, shutdown_tx) {
        error!("failed to set up signal handlers: {}", why);
        std::process::exit(EXIT_ERROR);
    }

    match run(options, &RealScanner, trigger_rx, shutdown_rx).await {
        Ok(_) => std::process::exit(EXIT_SUCCESS),
        Err(why) => {
            error!("{}", why);
            std::process::exit(EXIT_ERROR);
        }
    }
}
