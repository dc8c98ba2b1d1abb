use std::fmt;

/// The closed set of error kinds callers need to match on. Transport-level
/// noise (timeouts, resets) is retried away before it ever reaches here; what
/// survives to this type is either expected-but-fatal-for-one-symbol, or
/// fatal for the whole process.
#[derive(Debug)]
pub enum CollectorError {
    /// Non-retryable 4xx from the REST API (other than 429).
    Client { status: u16, body: String },
    /// A non-2xx response this client has no specific handling for.
    Unhandled { status: u16, body: String },
    /// A symbol's pending-diff buffer grew past its cap while waiting on a snapshot.
    PendingOverflow { symbol: String },
    /// Every retry of a snapshot fetch for a symbol was exhausted.
    SnapshotExhausted { symbol: String, source: String },
    /// The symbol selection policy failed.
    Selection(String),
    /// Bad/missing configuration at startup.
    Config(String),
    /// Writer sink I/O failure or channel corruption; terminates the process.
    FatalInternal(String),
}

impl fmt::Display for CollectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectorError::Client { status, body } => {
                write!(f, "client error {status}: {body}")
            }
            CollectorError::Unhandled { status, body } => {
                write!(f, "unhandled response {status}: {body}")
            }
            CollectorError::PendingOverflow { symbol } => {
                write!(f, "pending buffer overflow for {symbol}")
            }
            CollectorError::SnapshotExhausted { symbol, source } => {
                write!(f, "snapshot fetch exhausted for {symbol}: {source}")
            }
            CollectorError::Selection(msg) => write!(f, "symbol selection failed: {msg}"),
            CollectorError::Config(msg) => write!(f, "configuration error: {msg}"),
            CollectorError::FatalInternal(msg) => write!(f, "fatal internal error: {msg}"),
        }
    }
}

impl std::error::Error for CollectorError {}

pub type Result<T> = std::result::Result<T, CollectorError>;
