//! Order-book synchronization engine and persistence primitives for the
//! Binance market-data collector.
//!
//! This crate is I/O-adjacent but not I/O-driving: [`sync::DepthSynchronizer`]
//! is a pure state machine, [`rest::RestClient`] and [`selector`] do the
//! network calls, and [`writer::WriterSink`] does the blocking file I/O on
//! its own thread. The binary crate (`collector`) wires these into the
//! running WebSocket workers and the supervisor loop.

pub mod config;
pub mod error;
pub mod model;
pub mod rest;
pub mod selector;
pub mod sync;
pub mod writer;

pub use config::{Config, Credentials};
pub use error::{CollectorError, Result};
pub use model::{DepthUpdate, OutputRecord, Snapshot, Symbol, SymbolState};
pub use rest::RestClient;
pub use selector::{StaticSymbolSelector, SymbolSelector, VolatilitySymbolSelector};
pub use sync::{DepthSynchronizer, Effects};
pub use writer::WriterSink;
