use std::collections::VecDeque;
use std::fmt;

/// Maximum diffs buffered per symbol while waiting on a snapshot. Exceeding
/// this fails the symbol rather than growing without bound.
pub const PENDING_BUFFER_CAP: usize = 2048;

/// A lowercase exchange symbol, e.g. `btcusdt`. Used both as a stream
/// subscription key and as a filename prefix; kept distinct from a plain
/// `String` so call sites can't accidentally pass an uppercased REST-query
/// form where a subscription key is expected.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(raw: impl AsRef<str>) -> Self {
        Symbol(raw.as_ref().to_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_upper(&self) -> String {
        self.0.to_uppercase()
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(value: &str) -> Self {
        Symbol::new(value)
    }
}

impl From<String> for Symbol {
    fn from(value: String) -> Self {
        Symbol::new(value)
    }
}

/// A decoded depth-diff message. `payload` is the raw frame text, preserved
/// verbatim so persistence never has to re-serialize what the exchange sent.
#[derive(Debug, Clone)]
pub struct DepthUpdate {
    pub u_first: i64,
    pub u_last: i64,
    pub payload: String,
}

/// A decoded REST snapshot reply.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub last_update_id: i64,
    pub payload: String,
}

/// Per-symbol buffer of diffs held while a snapshot fetch is in flight.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    diffs: VecDeque<DepthUpdate>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a diff, failing if doing so would exceed `PENDING_BUFFER_CAP`.
    pub fn push(&mut self, diff: DepthUpdate) -> Result<(), ()> {
        if self.diffs.len() >= PENDING_BUFFER_CAP {
            return Err(());
        }
        self.diffs.push_back(diff);
        Ok(())
    }

    pub fn drain(&mut self) -> VecDeque<DepthUpdate> {
        std::mem::take(&mut self.diffs)
    }

    pub fn is_empty(&self) -> bool {
        self.diffs.is_empty()
    }
}

/// State of one symbol's depth reconciliation, owned exclusively by that
/// symbol's StreamWorker — never shared, never locked.
#[derive(Debug)]
pub enum SymbolState {
    Uninitialized,
    /// `snapshot_l` is `None` until the in-flight snapshot fetch resolves;
    /// once set, every newly buffered diff (or a periodic nudge) re-attempts
    /// the bridging walk against it.
    Reconciling {
        pending: PendingBuffer,
        snapshot_l: Option<i64>,
    },
    Streaming {
        prev_u: i64,
    },
}

impl Default for SymbolState {
    fn default() -> Self {
        SymbolState::Uninitialized
    }
}

/// One line destined for a `<symbol>_<date>.dat` file, or the sentinel that
/// tells the WriterSink to flush and exit.
#[derive(Debug, Clone)]
pub enum OutputRecord {
    Message {
        symbol: Symbol,
        timestamp: f64,
        raw_text: String,
    },
    Shutdown,
}

impl OutputRecord {
    pub fn message(symbol: Symbol, timestamp: f64, raw_text: impl Into<String>) -> Self {
        OutputRecord::Message {
            symbol,
            timestamp,
            raw_text: raw_text.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn symbol_normalizes_to_lowercase() {
        assert_eq!(Symbol::new("BTCUSDT").as_str(), "btcusdt");
        assert_eq!(Symbol::new("btcusdt").to_upper(), "BTCUSDT");
    }

    #[test]
    fn pending_buffer_rejects_past_cap() {
        let mut buf = PendingBuffer::new();
        for i in 0..PENDING_BUFFER_CAP {
            buf.push(DepthUpdate {
                u_first: i as i64,
                u_last: i as i64,
                payload: String::new(),
            })
            .unwrap();
        }
        let overflow = buf.push(DepthUpdate {
            u_first: 99999,
            u_last: 99999,
            payload: String::new(),
        });
        assert!(overflow.is_err());
    }
}
