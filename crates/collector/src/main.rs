//! Wires the collector together: loads config and credentials, builds the
//! symbol selector and writer sink, runs the Supervisor, and tears
//! everything down cleanly on SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use collector_core::{Config, Credentials, StaticSymbolSelector, Symbol, SymbolSelector, VolatilitySymbolSelector, WriterSink};
use log::{error, info};
use tokio::sync::mpsc;

mod supervisor;
mod worker;

use supervisor::Supervisor;

const RECORDS_CHANNEL_CAPACITY: usize = 4096;

/// Always streamed regardless of selection, mirroring the source's
/// guaranteed-inclusion fallback when fewer than 4 qualifiers are found.
const ALWAYS_PINNED: &str = "bnbusdt";

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Comma-separated symbols to pin regardless of selection (e.g. btcusdt,ethusdt)
    #[arg(long, value_delimiter = ',')]
    pinned: Vec<String>,

    /// Run with a fixed symbol set instead of the volume/amplitude selection policy
    #[arg(long, value_delimiter = ',')]
    static_symbols: Option<Vec<String>>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    let config = Config::from_env().context("invalid configuration")?;
    info!("output directory: {}", config.data_save_path.display());

    let _credentials = Credentials::load_or_create(&config.key_file_path)
        .context("failed to load API credentials")?;

    let writer = WriterSink::spawn(&config.data_save_path).context("failed to start writer sink")?;
    let (records_tx, mut records_rx) = mpsc::channel(RECORDS_CHANNEL_CAPACITY);
    let sender = writer.sender();
    let writer_bridge = tokio::task::spawn_blocking(move || {
        while let Some(record) = records_rx.blocking_recv() {
            if sender.send(record).is_err() {
                break;
            }
        }
    });

    let selector: Box<dyn SymbolSelector> = match args.static_symbols {
        Some(symbols) => Box::new(StaticSymbolSelector::new(symbols)),
        None => Box::new(
            VolatilitySymbolSelector::new(config.min_volume, config.min_amplitude)
                .context("failed to build selection policy")?,
        ),
    };

    let mut pinned: Vec<Symbol> = args.pinned.into_iter().map(Symbol::from).collect();
    pinned.push(Symbol::new(ALWAYS_PINNED));

    let supervisor = Supervisor::new(selector, pinned, records_tx);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let supervisor_task = tokio::spawn(supervisor.run(shutdown_rx));

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, stopping workers");
    let _ = shutdown_tx.send(true);

    // The records channel's only senders live inside the Supervisor and the
    // workers it owns; once `supervisor_task` below has returned, every
    // clone has been dropped and `writer_bridge` drains the rest and exits.
    let drain = async {
        if let Err(e) = supervisor_task.await {
            error!("supervisor task panicked: {e}");
        }
        let _ = writer_bridge.await;
        writer.shutdown();
    };

    tokio::select! {
        _ = drain => {}
        _ = wait_for_shutdown_signal() => {
            error!("second shutdown signal received, forcing exit");
            std::process::exit(130);
        }
    }

    info!("shutdown complete");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
