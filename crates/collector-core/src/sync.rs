//! Per-symbol depth-diff / snapshot reconciliation state machine.
//!
//! This is intentionally synchronous and I/O-free: it owns no socket and
//! makes no HTTP calls. It is driven by a StreamWorker, which feeds it
//! decoded messages and is told (via [`Effect::FetchSnapshot`]) when to go
//! fetch a new snapshot. Keeping the state machine free of `async` makes it
//! exhaustively unit-testable against literal message sequences (see §8 of
//! the design).

use std::collections::VecDeque;
use std::time::{SystemTime, UNIX_EPOCH};

use log::warn;

use crate::model::{DepthUpdate, OutputRecord, PendingBuffer, Snapshot, Symbol, SymbolState};

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Side effects a caller must perform in response to feeding the
/// synchronizer a message. `emit` always carries zero or more records that
/// must be pushed to the shared channel, in order.
#[derive(Debug, Default)]
pub struct Effects {
    pub emit: Vec<OutputRecord>,
    pub fetch_snapshot: bool,
    pub fatal: Option<PendingOverflow>,
}

#[derive(Debug)]
pub struct PendingOverflow;

pub struct DepthSynchronizer {
    symbol: Symbol,
    state: SymbolState,
}

impl DepthSynchronizer {
    pub fn new(symbol: Symbol) -> Self {
        Self {
            symbol,
            state: SymbolState::Uninitialized,
        }
    }

    pub fn symbol(&self) -> &Symbol {
        &self.symbol
    }

    #[cfg(test)]
    pub fn state(&self) -> &SymbolState {
        &self.state
    }

    /// Feed one decoded depth diff. Never blocks; may request a snapshot
    /// fetch via `Effects::fetch_snapshot`.
    pub fn on_depth_update(&mut self, diff: DepthUpdate) -> Effects {
        let mut effects = Effects::default();
        match &mut self.state {
            SymbolState::Uninitialized => {
                warn!(
                    target: "collector::sync",
                    "mismatch on the book for {}: no prior state, requesting snapshot",
                    self.symbol
                );
                let mut pending = PendingBuffer::new();
                // Cannot overflow on the very first diff.
                let _ = pending.push(diff);
                self.state = SymbolState::Reconciling {
                    pending,
                    snapshot_l: None,
                };
                effects.fetch_snapshot = true;
            }
            SymbolState::Reconciling {
                pending,
                snapshot_l,
            } => {
                if pending.push(diff).is_err() {
                    effects.fatal = Some(PendingOverflow);
                    return effects;
                }
                if let Some(l) = *snapshot_l {
                    self.attempt_walk(l, &mut effects);
                }
            }
            SymbolState::Streaming { prev_u } => {
                if diff.u_first == *prev_u + 1 {
                    let new_prev_u = diff.u_last;
                    effects
                        .emit
                        .push(OutputRecord::message(self.symbol.clone(), now_secs(), diff.payload));
                    *prev_u = new_prev_u;
                } else {
                    warn!(
                        target: "collector::sync",
                        "gap detected for {}: prev_u={} next U={}",
                        self.symbol, prev_u, diff.u_first
                    );
                    let mut pending = PendingBuffer::new();
                    let _ = pending.push(diff);
                    self.state = SymbolState::Reconciling {
                        pending,
                        snapshot_l: None,
                    };
                    effects.fetch_snapshot = true;
                }
            }
        }
        effects
    }

    /// Feed the (single, awaited) snapshot this symbol's fetch task produced.
    /// A no-op if the symbol is no longer `Reconciling` without a known `L`
    /// (can happen if a second gap re-triggered reconciliation before the
    /// first fetch completed — only one fetch is ever in flight per symbol
    /// by construction, so this path is defensive, not load-bearing).
    pub fn on_snapshot(&mut self, snapshot: Snapshot) -> Effects {
        let mut effects = Effects::default();
        let l = snapshot.last_update_id;
        match &mut self.state {
            SymbolState::Reconciling { snapshot_l, .. } if snapshot_l.is_none() => {
                effects
                    .emit
                    .push(OutputRecord::message(self.symbol.clone(), now_secs(), snapshot.payload));
                *snapshot_l = Some(l);
            }
            _ => return effects,
        }
        self.attempt_walk(l, &mut effects);
        effects
    }

    /// Re-attempt the bridging walk without new input. Safe to call on a
    /// timer while `Reconciling` with a known snapshot; a no-op otherwise.
    pub fn retry_pending_walk(&mut self) -> Effects {
        let mut effects = Effects::default();
        if let SymbolState::Reconciling {
            snapshot_l: Some(l),
            ..
        } = &self.state
        {
            let l = *l;
            self.attempt_walk(l, &mut effects);
        }
        effects
    }

    fn attempt_walk(&mut self, l: i64, effects: &mut Effects) {
        let pending = match &mut self.state {
            SymbolState::Reconciling { pending, .. } => pending.drain(),
            _ => return,
        };
        if let Some(prev_u) = self.walk(pending, l, effects) {
            self.state = SymbolState::Streaming { prev_u };
        }
        // else: stays Reconciling with snapshot_l retained, pending now empty,
        // waiting for the next diff or periodic nudge.
    }

    /// Drains `pending` in order, emitting the bridging diff and everything
    /// after it. Returns the resulting `prev_u` if a bridge was found.
    fn walk(&self, pending: VecDeque<DepthUpdate>, l: i64, effects: &mut Effects) -> Option<i64> {
        let mut prev_u: Option<i64> = None;
        for diff in pending {
            match prev_u {
                None => {
                    if diff.u_last < l + 1 || diff.u_first > l + 1 {
                        continue;
                    }
                    effects
                        .emit
                        .push(OutputRecord::message(self.symbol.clone(), now_secs(), diff.payload));
                    prev_u = Some(diff.u_last);
                }
                Some(pu) => {
                    if diff.u_first != pu + 1 {
                        warn!(
                            target: "collector::sync",
                            "update id does not match for {}: prev_u={} U={}",
                            self.symbol, pu, diff.u_first
                        );
                    }
                    effects
                        .emit
                        .push(OutputRecord::message(self.symbol.clone(), now_secs(), diff.payload));
                    prev_u = Some(diff.u_last);
                }
            }
        }
        prev_u
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff(u_first: i64, u_last: i64) -> DepthUpdate {
        DepthUpdate {
            u_first,
            u_last,
            payload: format!("{{\"U\":{u_first},\"u\":{u_last}}}"),
        }
    }

    fn snapshot(last_update_id: i64) -> Snapshot {
        Snapshot {
            last_update_id,
            payload: format!("{{\"lastUpdateId\":{last_update_id}}}"),
        }
    }

    #[test]
    fn clean_stream_no_gaps() {
        let mut sync = DepthSynchronizer::new(Symbol::new("btcusdt"));
        let effects = sync.on_depth_update(diff(101, 110));
        assert!(effects.fetch_snapshot);
        assert!(effects.emit.is_empty());

        let effects = sync.on_snapshot(snapshot(100));
        assert_eq!(effects.emit.len(), 2); // snapshot + bridging diff (101,110)

        let effects = sync.on_depth_update(diff(111, 120));
        assert_eq!(effects.emit.len(), 1);
        let effects = sync.on_depth_update(diff(121, 130));
        assert_eq!(effects.emit.len(), 1);

        match sync.state() {
            SymbolState::Streaming { prev_u } => assert_eq!(*prev_u, 130),
            other => panic!("expected Streaming, got {other:?}"),
        }
    }

    #[test]
    fn pre_snapshot_prefix_is_discarded() {
        let mut sync = DepthSynchronizer::new(Symbol::new("ethusdt"));
        sync.on_depth_update(diff(50, 60));
        sync.on_depth_update(diff(61, 70));
        sync.on_depth_update(diff(95, 105));
        sync.on_depth_update(diff(106, 115));

        let effects = sync.on_snapshot(snapshot(100));
        // snapshot + (95,105) + (106,115); the first two diffs are discarded.
        assert_eq!(effects.emit.len(), 3);
        match sync.state() {
            SymbolState::Streaming { prev_u } => assert_eq!(*prev_u, 115),
            other => panic!("expected Streaming, got {other:?}"),
        }
    }

    #[test]
    fn snapshot_beyond_all_pending_waits_for_more() {
        let mut sync = DepthSynchronizer::new(Symbol::new("solusdt"));
        sync.on_depth_update(diff(1, 10));
        sync.on_depth_update(diff(11, 20));

        // Snapshot is far ahead of everything buffered so far: no bridge yet.
        let effects = sync.on_snapshot(snapshot(500));
        assert_eq!(effects.emit.len(), 1); // just the snapshot record
        assert!(matches!(
            sync.state(),
            SymbolState::Reconciling { snapshot_l: Some(500), .. }
        ));

        // A fresh diff that does bridge arrives later.
        let effects = sync.on_depth_update(diff(495, 505));
        assert_eq!(effects.emit.len(), 1);
        match sync.state() {
            SymbolState::Streaming { prev_u } => assert_eq!(*prev_u, 505),
            other => panic!("expected Streaming, got {other:?}"),
        }
    }

    #[test]
    fn mid_stream_gap_restarts_reconciliation() {
        let mut sync = DepthSynchronizer::new(Symbol::new("bnbusdt"));
        sync.on_depth_update(diff(1, 10));
        sync.on_snapshot(snapshot(0));
        assert!(matches!(sync.state(), SymbolState::Streaming { prev_u: 10 }));

        let effects = sync.on_depth_update(diff(140, 150));
        assert!(effects.fetch_snapshot);
        assert!(effects.emit.is_empty());
        assert!(matches!(
            sync.state(),
            SymbolState::Reconciling { snapshot_l: None, .. }
        ));

        let effects = sync.on_snapshot(snapshot(139));
        assert_eq!(effects.emit.len(), 2); // snapshot + (140,150)
        match sync.state() {
            SymbolState::Streaming { prev_u } => assert_eq!(*prev_u, 150),
            other => panic!("expected Streaming, got {other:?}"),
        }
    }

    #[test]
    fn pending_overflow_is_fatal() {
        let mut sync = DepthSynchronizer::new(Symbol::new("dogeusdt"));
        sync.on_depth_update(diff(1, 1));
        for i in 1..crate::model::PENDING_BUFFER_CAP as i64 {
            let effects = sync.on_depth_update(diff(i + 1, i + 1));
            assert!(effects.fatal.is_none());
        }
        let effects = sync.on_depth_update(diff(99_999, 99_999));
        assert!(effects.fatal.is_some());
    }

    #[test]
    fn out_of_order_diff_after_bridge_is_emitted_best_effort() {
        let mut sync = DepthSynchronizer::new(Symbol::new("xrpusdt"));
        sync.on_depth_update(diff(101, 110));
        sync.on_depth_update(diff(115, 120)); // gap relative to (101,110), still best-effort emitted
        let effects = sync.on_snapshot(snapshot(100));
        assert_eq!(effects.emit.len(), 3); // snapshot, (101,110), (115,120)
        match sync.state() {
            SymbolState::Streaming { prev_u } => assert_eq!(*prev_u, 120),
            other => panic!("expected Streaming, got {other:?}"),
        }
    }
}
