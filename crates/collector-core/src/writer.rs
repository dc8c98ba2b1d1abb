//! Dedicated-thread sink that appends records to per-(symbol, date) files.
//!
//! Modeled on the original collector's writer process: isolating blocking
//! file I/O onto its own OS thread so a slow disk never stalls the async
//! runtime driving the WebSocket connections.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::mpsc::{sync_channel, Receiver, SyncSender};
use std::thread::JoinHandle;

use chrono::{DateTime, Local, Utc};

use crate::error::{CollectorError, Result};
use crate::model::OutputRecord;

const CHANNEL_CAPACITY: usize = 4096;

pub struct WriterSink {
    sender: SyncSender<OutputRecord>,
    handle: Option<JoinHandle<()>>,
}

impl WriterSink {
    /// Spawns the writer thread, rooted at `output_dir` (created if missing).
    pub fn spawn(output_dir: impl Into<PathBuf>) -> Result<Self> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir).map_err(|e| {
            CollectorError::Config(format!(
                "failed to create output directory {}: {e}",
                output_dir.display()
            ))
        })?;

        let (sender, receiver) = sync_channel(CHANNEL_CAPACITY);
        let handle = std::thread::Builder::new()
            .name("writer-sink".to_string())
            .spawn(move || run(output_dir, receiver))
            .map_err(|e| CollectorError::FatalInternal(format!("failed to spawn writer thread: {e}")))?;

        Ok(Self {
            sender,
            handle: Some(handle),
        })
    }

    pub fn sender(&self) -> SyncSender<OutputRecord> {
        self.sender.clone()
    }

    /// Sends the shutdown sentinel and blocks until the writer thread drains
    /// and exits.
    pub fn shutdown(mut self) {
        let _ = self.sender.send(OutputRecord::Shutdown);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

struct OpenFiles {
    root: PathBuf,
    handles: HashMap<String, BufWriter<File>>,
}

impl OpenFiles {
    fn new(root: PathBuf) -> Self {
        Self {
            root,
            handles: HashMap::new(),
        }
    }

    fn writer_for(&mut self, symbol: &str, timestamp: f64) -> std::io::Result<&mut BufWriter<File>> {
        let date = date_str(timestamp);
        let key = format!("{symbol}_{date}");
        if !self.handles.contains_key(&key) {
            let path = self.path_for(symbol, &date);
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            self.handles.insert(key.clone(), BufWriter::new(file));
        }
        Ok(self.handles.get_mut(&key).expect("just inserted"))
    }

    fn path_for(&self, symbol: &str, date: &str) -> PathBuf {
        self.root.join(format!("{symbol}_{date}.dat"))
    }

    fn flush_all(&mut self) {
        for w in self.handles.values_mut() {
            let _ = w.flush();
        }
    }
}

/// Local date of `timestamp`, not UTC: records roll into the next day's file
/// at local midnight, matching the original writer process.
fn date_str(timestamp: f64) -> String {
    let secs = timestamp.trunc() as i64;
    let nanos = ((timestamp.fract()) * 1_000_000_000.0) as u32;
    DateTime::<Utc>::from_timestamp(secs, nanos)
        .map(|dt| dt.with_timezone(&Local))
        .unwrap_or_else(Local::now)
        .format("%Y%m%d")
        .to_string()
}

fn run(output_dir: PathBuf, receiver: Receiver<OutputRecord>) {
    let mut files = OpenFiles::new(output_dir);
    loop {
        match receiver.recv() {
            Ok(OutputRecord::Message {
                symbol,
                timestamp,
                raw_text,
            }) => {
                let micros = (timestamp * 1_000_000.0) as i64;
                let line = format!("{micros} {raw_text}\n");
                match files.writer_for(symbol.as_str(), timestamp) {
                    Ok(w) => {
                        if let Err(e) = w.write_all(line.as_bytes()) {
                            log::error!(target: "collector::writer", "write failed for {symbol}: {e}");
                        }
                    }
                    Err(e) => {
                        log::error!(target: "collector::writer", "failed to open file for {symbol}: {e}");
                    }
                }
            }
            Ok(OutputRecord::Shutdown) | Err(_) => {
                files.flush_all();
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{OutputRecord, Symbol};
    use std::io::Read;
    use std::time::Duration;

    #[test]
    fn writes_one_line_per_message_and_flushes_on_shutdown() {
        let dir = tempfile::tempdir().unwrap();
        let sink = WriterSink::spawn(dir.path()).unwrap();
        let sender = sink.sender();

        let ts = 1_700_000_000.123456_f64;
        sender
            .send(OutputRecord::message(Symbol::new("btcusdt"), ts, "{\"e\":\"depthUpdate\"}"))
            .unwrap();
        sender
            .send(OutputRecord::message(Symbol::new("btcusdt"), ts, "{\"e\":\"depthUpdate\",\"u\":2}"))
            .unwrap();

        sink.shutdown();

        let date = date_str(ts);
        let path = dir.path().join(format!("btcusdt_{date}.dat"));
        let mut contents = String::new();
        File::open(&path).unwrap().read_to_string(&mut contents).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("1700000000123456 "));
    }

    #[test]
    fn separate_symbols_get_separate_files() {
        let dir = tempfile::tempdir().unwrap();
        let sink = WriterSink::spawn(dir.path()).unwrap();
        let sender = sink.sender();
        let ts = 1_700_000_000.0;
        sender
            .send(OutputRecord::message(Symbol::new("btcusdt"), ts, "a"))
            .unwrap();
        sender
            .send(OutputRecord::message(Symbol::new("ethusdt"), ts, "b"))
            .unwrap();
        sink.shutdown();

        let date = date_str(ts);
        assert!(dir.path().join(format!("btcusdt_{date}.dat")).exists());
        assert!(dir.path().join(format!("ethusdt_{date}.dat")).exists());
    }

    #[test]
    fn appends_across_multiple_sink_lifetimes() {
        let dir = tempfile::tempdir().unwrap();
        let ts = 1_700_000_000.0;

        let sink = WriterSink::spawn(dir.path()).unwrap();
        sink.sender()
            .send(OutputRecord::message(Symbol::new("btcusdt"), ts, "first"))
            .unwrap();
        sink.shutdown();

        std::thread::sleep(Duration::from_millis(10));

        let sink = WriterSink::spawn(dir.path()).unwrap();
        sink.sender()
            .send(OutputRecord::message(Symbol::new("btcusdt"), ts, "second"))
            .unwrap();
        sink.shutdown();

        let date = date_str(ts);
        let mut contents = String::new();
        File::open(dir.path().join(format!("btcusdt_{date}.dat")))
            .unwrap()
            .read_to_string(&mut contents)
            .unwrap();
        assert_eq!(contents.lines().count(), 2);
    }
}
