//! One WebSocket connection per symbol: subscribes to the combined stream,
//! dispatches inbound frames by stream type, hosts a `DepthSynchronizer`,
//! and runs a keepalive task alongside the frame pump.

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use collector_core::{CollectorError, DepthSynchronizer, DepthUpdate, OutputRecord, RestClient, Snapshot, Symbol};
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

const COMBINED_STREAM_HOST: &str = "stream.binance.com:9443";
const SNAPSHOT_LIMIT: u32 = 1000;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// The closed set of stream types this worker subscribes to. `markPrice` is
/// dispatched upstream in spot-market feeds from other exchanges but is
/// never subscribed here: spot markets don't publish mark price.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    Depth,
    AggTrade,
    Trade,
    BookTicker,
    Kline1m,
    Ticker4h,
    Depth20,
}

impl StreamKind {
    fn from_stream_name(stream: &str) -> Option<Self> {
        let mut tokens = stream.split('@');
        let _symbol = tokens.next()?;
        match tokens.next()? {
            "depth" => Some(StreamKind::Depth),
            "aggTrade" => Some(StreamKind::AggTrade),
            "trade" => Some(StreamKind::Trade),
            "bookTicker" => Some(StreamKind::BookTicker),
            "kline_1m" => Some(StreamKind::Kline1m),
            "ticker_4h" => Some(StreamKind::Ticker4h),
            "depth20" => Some(StreamKind::Depth20),
            other => {
                warn!(target: "collector::worker", "unknown stream type {other} in {stream}, dropping");
                None
            }
        }
    }
}

fn subscribed_streams(symbol: &Symbol) -> Vec<String> {
    let s = symbol.as_str();
    vec![
        format!("{s}@depth@1000ms"),
        format!("{s}@aggTrade"),
        format!("{s}@trade"),
        format!("{s}@bookTicker"),
        format!("{s}@kline_1m"),
        format!("{s}@ticker_4h"),
        format!("{s}@depth20@1000ms"),
    ]
}

fn now_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// Holds at most one non-depth record this worker couldn't deliver because
/// the shared channel was full. Depth/snapshot records carry synchronisation
/// state and are never staged here — they use a blocking send instead.
#[derive(Default)]
struct NonDepthStage {
    held: Option<OutputRecord>,
}

impl NonDepthStage {
    /// Tries to flush whatever is staged, then tries to send `record`
    /// directly. On renewed backpressure, the staged record (the older one)
    /// is dropped in favour of staging `record` instead.
    fn offer(&mut self, tx: &mpsc::Sender<OutputRecord>, record: OutputRecord) {
        if let Some(held) = self.held.take() {
            if let Err(TrySendError::Full(_)) = tx.try_send(held) {
                // channel still backed up: the held record was already the
                // oldest, drop it rather than the new one.
            }
        }
        match tx.try_send(record) {
            Ok(()) | Err(TrySendError::Closed(_)) => {}
            Err(TrySendError::Full(record)) => self.held = Some(record),
        }
    }
}

pub struct WorkerHandle {
    cancel: tokio::sync::watch::Sender<bool>,
    join: tokio::task::JoinHandle<()>,
}

impl WorkerHandle {
    /// Requests cancellation and waits for the worker task to unwind.
    pub async fn cancel(self) {
        let _ = self.cancel.send(true);
        let _ = self.join.await;
    }
}

/// Spawns the worker task for `symbol`, forwarding every produced
/// `OutputRecord` onto `records_tx`.
pub fn spawn(symbol: Symbol, records_tx: mpsc::Sender<OutputRecord>) -> WorkerHandle {
    let (cancel_tx, cancel_rx) = tokio::sync::watch::channel(false);
    let join = tokio::spawn(run(symbol, records_tx, cancel_rx));
    WorkerHandle {
        cancel: cancel_tx,
        join,
    }
}

async fn run(symbol: Symbol, records_tx: mpsc::Sender<OutputRecord>, mut cancel_rx: tokio::sync::watch::Receiver<bool>) {
    let rest = match RestClient::new() {
        Ok(r) => r,
        Err(e) => {
            error!(target: "collector::worker", "failed to build REST client for {symbol}: {e}");
            return;
        }
    };

    'connect: loop {
        if *cancel_rx.borrow() {
            return;
        }

        let ws_stream = match connect_and_subscribe(&symbol).await {
            Ok(s) => s,
            Err(e) => {
                warn!(target: "collector::worker", "connect failed for {symbol}: {e}, retrying in 1s");
                if wait_or_cancel(RECONNECT_DELAY, &mut cancel_rx).await {
                    return;
                }
                continue 'connect;
            }
        };
        info!(target: "collector::worker", "connected {symbol}");

        let (sink, mut stream) = ws_stream.split();
        let sink = Arc::new(Mutex::new(sink));

        let keepalive_cancel = cancel_rx.clone();
        let keepalive_sink = sink.clone();
        let keepalive_symbol = symbol.clone();
        let keepalive = tokio::spawn(run_keepalive(keepalive_symbol, keepalive_sink, keepalive_cancel));

        let mut sync = DepthSynchronizer::new(symbol.clone());
        let (snapshot_tx, mut snapshot_rx) = mpsc::channel::<Result<Snapshot, CollectorError>>(1);
        let mut snapshot_in_flight = false;
        let mut non_depth_stage = NonDepthStage::default();

        loop {
            tokio::select! {
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        keepalive.abort();
                        let _ = sink.lock().await.send(Message::Close(None)).await;
                        return;
                    }
                }
                frame = stream.next() => {
                    match frame {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(fatal) = handle_text_frame(
                                &symbol, &text, &mut sync, &records_tx, &mut snapshot_in_flight,
                                &rest, &snapshot_tx, &mut non_depth_stage,
                            ).await {
                                error!(target: "collector::worker", "{symbol} failed fatally: {fatal}");
                                keepalive.abort();
                                return;
                            }
                        }
                        Some(Ok(Message::Ping(payload))) => {
                            if sink.lock().await.send(Message::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Pong(_))) => {
                            debug!(target: "collector::worker", "unsolicited pong from server for {symbol}");
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!(target: "collector::worker", "{symbol} connection closed by peer");
                            break;
                        }
                        Some(Ok(_)) => {} // binary/frame frames ignored
                        Some(Err(e)) => {
                            error!(target: "collector::worker", "ws error for {symbol}: {e}");
                            break;
                        }
                    }
                }
                Some(result) = snapshot_rx.recv() => {
                    snapshot_in_flight = false;
                    match result {
                        Ok(snapshot) => {
                            let effects = sync.on_snapshot(snapshot);
                            for record in effects.emit {
                                let _ = records_tx.send(record).await;
                            }
                            if effects.fetch_snapshot {
                                snapshot_in_flight = true;
                                spawn_snapshot_fetch(&rest, symbol.clone(), snapshot_tx.clone());
                            }
                        }
                        Err(e) => {
                            error!(target: "collector::worker", "snapshot fetch exhausted for {symbol}: {e}");
                            keepalive.abort();
                            return;
                        }
                    }
                }
            }
        }

        keepalive.abort();
        if wait_or_cancel(RECONNECT_DELAY, &mut cancel_rx).await {
            return;
        }
    }
}

async fn handle_text_frame(
    symbol: &Symbol,
    text: &str,
    sync: &mut DepthSynchronizer,
    records_tx: &mpsc::Sender<OutputRecord>,
    snapshot_in_flight: &mut bool,
    rest: &RestClient,
    snapshot_tx: &mpsc::Sender<Result<Snapshot, CollectorError>>,
    non_depth_stage: &mut NonDepthStage,
) -> Result<(), String> {
    let frame: Value = match serde_json::from_str(text) {
        Ok(v) => v,
        Err(e) => {
            warn!(target: "collector::worker", "malformed frame for {symbol}: {e}");
            return Ok(());
        }
    };
    let stream_name = match frame.get("stream").and_then(Value::as_str) {
        Some(s) => s,
        None => return Ok(()),
    };
    let Some(kind) = StreamKind::from_stream_name(stream_name) else {
        return Ok(());
    };
    let data = frame.get("data").cloned().unwrap_or(Value::Null);

    match kind {
        StreamKind::Depth => {
            let u_first = data.get("U").and_then(Value::as_i64).unwrap_or_default();
            let u_last = data.get("u").and_then(Value::as_i64).unwrap_or_default();
            let diff = DepthUpdate {
                u_first,
                u_last,
                payload: text.to_string(),
            };
            let effects = sync.on_depth_update(diff);
            for record in effects.emit {
                let _ = records_tx.send(record).await;
            }
            if effects.fatal.is_some() {
                return Err(format!("pending buffer overflow for {symbol}"));
            }
            if effects.fetch_snapshot && !*snapshot_in_flight {
                *snapshot_in_flight = true;
                spawn_snapshot_fetch(rest, symbol.clone(), snapshot_tx.clone());
            }
        }
        StreamKind::AggTrade
        | StreamKind::Trade
        | StreamKind::BookTicker
        | StreamKind::Kline1m
        | StreamKind::Ticker4h
        | StreamKind::Depth20 => {
            non_depth_stage.offer(records_tx, OutputRecord::message(symbol.clone(), now_secs(), text.to_string()));
        }
    }
    Ok(())
}

fn spawn_snapshot_fetch(rest: &RestClient, symbol: Symbol, tx: mpsc::Sender<Result<Snapshot, CollectorError>>) {
    let rest = rest.clone();
    tokio::spawn(async move {
        let result = rest.fetch_snapshot(&symbol.to_upper(), SNAPSHOT_LIMIT).await;
        let _ = tx.send(result).await;
    });
}

async fn run_keepalive(symbol: Symbol, sink: Arc<Mutex<WsSink>>, mut cancel_rx: tokio::sync::watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(KEEPALIVE_INTERVAL);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if sink.lock().await.send(Message::Pong(Vec::new())).await.is_err() {
                    return;
                }
            }
            _ = cancel_rx.changed() => {
                if *cancel_rx.borrow() {
                    return;
                }
            }
        }
        debug!(target: "collector::worker", "keepalive pong sent for {symbol}");
    }
}

async fn wait_or_cancel(duration: Duration, cancel_rx: &mut tokio::sync::watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = cancel_rx.changed() => *cancel_rx.borrow(),
    }
}

async fn connect_and_subscribe(
    symbol: &Symbol,
) -> anyhow::Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
    let streams = subscribed_streams(symbol).join("/");
    let url = Url::parse(&format!("wss://{COMBINED_STREAM_HOST}/stream?streams={streams}"))?;
    let (ws_stream, _) = connect_async(url).await?;
    Ok(ws_stream)
}
