//! Periodically re-evaluates the desired symbol set and starts/stops
//! `StreamWorker`s to match it, exclusively owning the registry of running
//! workers.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use collector_core::{OutputRecord, Symbol, SymbolSelector};
use log::{error, info, warn};
use tokio::sync::mpsc;

use crate::worker::{self, WorkerHandle};

const TICK_PERIOD: Duration = Duration::from_secs(30 * 60);
const SELECTION_RETRY_DELAY: Duration = Duration::from_secs(5);

pub struct Supervisor {
    selector: Box<dyn SymbolSelector>,
    pinned: HashSet<Symbol>,
    registry: HashMap<Symbol, WorkerHandle>,
    records_tx: mpsc::Sender<OutputRecord>,
}

impl Supervisor {
    pub fn new(
        selector: Box<dyn SymbolSelector>,
        pinned: impl IntoIterator<Item = Symbol>,
        records_tx: mpsc::Sender<OutputRecord>,
    ) -> Self {
        Self {
            selector,
            pinned: pinned.into_iter().collect(),
            registry: HashMap::new(),
            records_tx,
        }
    }

    pub fn running_symbols(&self) -> HashSet<Symbol> {
        self.registry.keys().cloned().collect()
    }

    /// Runs the tick loop until `shutdown` resolves, then cancels every
    /// registered worker (not just the one most recently iterated — the
    /// source's partial-shutdown behaviour is a bug, not a contract).
    pub async fn run(mut self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.selector.select().await {
                Ok(selected) => {
                    self.reconcile(selected).await;
                    if wait_or_shutdown(TICK_PERIOD, &mut shutdown).await {
                        break;
                    }
                }
                Err(e) => {
                    error!(target: "collector::supervisor", "symbol selection failed: {e}");
                    if wait_or_shutdown(SELECTION_RETRY_DELAY, &mut shutdown).await {
                        break;
                    }
                    // selection failure does not advance the tick clock
                }
            }
        }

        self.shutdown_all().await;
    }

    async fn reconcile(&mut self, selected: Vec<Symbol>) {
        let selected: HashSet<Symbol> = selected.into_iter().collect();
        let running: HashSet<Symbol> = self.registry.keys().cloned().collect();

        let to_add: Vec<Symbol> = selected.difference(&running).cloned().collect();
        let to_remove: Vec<Symbol> = running
            .difference(&selected)
            .filter(|s| !self.pinned.contains(s))
            .cloned()
            .collect();

        for symbol in to_remove {
            if let Some(handle) = self.registry.remove(&symbol) {
                info!(target: "collector::supervisor", "stopping worker for {symbol}");
                handle.cancel().await;
            }
        }

        for symbol in to_add {
            info!(target: "collector::supervisor", "starting worker for {symbol}");
            let handle = worker::spawn(symbol.clone(), self.records_tx.clone());
            self.registry.insert(symbol, handle);
        }
    }

    async fn shutdown_all(self) {
        for (symbol, handle) in self.registry {
            warn!(target: "collector::supervisor", "cancelling worker for {symbol} on shutdown");
            handle.cancel().await;
        }
    }
}

async fn wait_or_shutdown(duration: Duration, shutdown: &mut tokio::sync::watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => *shutdown.borrow(),
        _ = shutdown.changed() => *shutdown.borrow(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use collector_core::{CollectorError, Result};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct SequencedSelector {
        ticks: Vec<Vec<Symbol>>,
        cursor: AtomicUsize,
    }

    #[async_trait]
    impl SymbolSelector for SequencedSelector {
        async fn select(&self) -> Result<Vec<Symbol>> {
            let idx = self.cursor.fetch_add(1, Ordering::SeqCst).min(self.ticks.len() - 1);
            Ok(self.ticks[idx].clone())
        }
    }

    struct FailingSelector {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl SymbolSelector for FailingSelector {
        async fn select(&self) -> Result<Vec<Symbol>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CollectorError::Selection("boom".to_string()))
        }
    }

    #[tokio::test]
    async fn reconcile_computes_to_add_and_to_remove_respecting_pinned() {
        let (tx, _rx) = mpsc::channel(16);
        let selector = Box::new(SequencedSelector {
            ticks: vec![vec![]],
            cursor: AtomicUsize::new(0),
        });
        let mut supervisor = Supervisor::new(selector, [Symbol::new("ethusdt")], tx);

        supervisor.reconcile(vec![Symbol::new("ethusdt"), Symbol::new("solusdt")]).await;
        assert_eq!(
            supervisor.running_symbols(),
            [Symbol::new("ethusdt"), Symbol::new("solusdt")].into_iter().collect()
        );

        supervisor
            .reconcile(vec![Symbol::new("solusdt"), Symbol::new("bnbusdt")])
            .await;
        assert_eq!(
            supervisor.running_symbols(),
            [Symbol::new("ethusdt"), Symbol::new("solusdt"), Symbol::new("bnbusdt")]
                .into_iter()
                .collect()
        );
    }

    #[tokio::test]
    async fn selection_failure_does_not_change_registry() {
        let (tx, _rx) = mpsc::channel(16);
        let calls = Arc::new(AtomicUsize::new(0));
        let selector = Box::new(FailingSelector { calls: calls.clone() });
        let supervisor = Supervisor::new(selector, [], tx);

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = tokio::spawn(supervisor.run(shutdown_rx));

        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = shutdown_tx.send(true);
        let _ = handle.await;

        assert!(calls.load(Ordering::SeqCst) >= 1);
    }
}
