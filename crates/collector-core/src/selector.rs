//! Symbol selection policy: decides which symbols the Supervisor should be
//! streaming at any given tick.

use async_trait::async_trait;
use log::warn;
use reqwest::Client;
use serde::Deserialize;

use crate::error::{CollectorError, Result};
use crate::model::Symbol;

const EXCHANGE_INFO_URL: &str = "https://api.binance.com/api/v3/ticker/24hr";
const KLINES_URL: &str = "https://api.binance.com/api/v3/klines";
const TOP_TICKERS_BY_VOLUME: usize = 100;
const AMPLITUDE_CANDLES: u32 = 20;
const AMPLITUDE_INTERVAL: &str = "3m";
const AMPLITUDE_UPPER_BOUND: f64 = 200.0;
const GUARANTEED_SYMBOL: &str = "BNBUSDT";

#[async_trait]
pub trait SymbolSelector: Send + Sync {
    async fn select(&self) -> Result<Vec<Symbol>>;
}

/// Fixed-set selector: returns the same symbols every tick. Useful for
/// tests and for operators who want to pin symbols instead of running the
/// volume/amplitude policy.
pub struct StaticSymbolSelector {
    symbols: Vec<Symbol>,
}

impl StaticSymbolSelector {
    pub fn new(symbols: impl IntoIterator<Item = impl Into<Symbol>>) -> Self {
        Self {
            symbols: symbols.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl SymbolSelector for StaticSymbolSelector {
    async fn select(&self) -> Result<Vec<Symbol>> {
        Ok(self.symbols.clone())
    }
}

#[derive(Debug, Deserialize)]
struct Ticker24h {
    symbol: String,
    #[serde(rename = "quoteVolume")]
    quote_volume: String,
}

#[derive(Debug, Deserialize)]
struct Kline(
    i64,    // open time
    String, // open
    String, // high
    String, // low
    String, // close
    serde_json::Value,
    serde_json::Value,
    serde_json::Value,
    serde_json::Value,
    serde_json::Value,
    serde_json::Value,
    serde_json::Value,
);

/// Top-100-by-volume, then top-4-by-amplitude selection, mirroring the
/// original collector's ticker scan: pull 24h tickers for all USDT pairs,
/// keep the highest-volume subset, then rank that subset by recent
/// high/low amplitude and take the most volatile few. Falls back to
/// including BNBUSDT if fewer than 4 symbols qualify.
pub struct VolatilitySymbolSelector {
    client: Client,
    min_volume: f64,
    min_amplitude: f64,
    top_n: usize,
}

impl VolatilitySymbolSelector {
    pub fn new(min_volume: f64, min_amplitude: f64) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .map_err(|e| CollectorError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            min_volume,
            min_amplitude,
            top_n: 4,
        })
    }

    async fn fetch_tickers(&self) -> Result<Vec<Ticker24h>> {
        let resp = self
            .client
            .get(EXCHANGE_INFO_URL)
            .send()
            .await
            .map_err(|e| CollectorError::Selection(format!("24hr ticker request failed: {e}")))?;
        resp.json::<Vec<Ticker24h>>()
            .await
            .map_err(|e| CollectorError::Selection(format!("24hr ticker response malformed: {e}")))
    }

    /// `(high - low) / open * 100` over the window, matching the original
    /// collector's amplitude definition (percent, not a fraction).
    async fn amplitude(&self, symbol: &str) -> Result<f64> {
        let url = format!(
            "{KLINES_URL}?symbol={symbol}&interval={AMPLITUDE_INTERVAL}&limit={AMPLITUDE_CANDLES}"
        );
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| CollectorError::Selection(format!("klines request failed for {symbol}: {e}")))?;
        let klines: Vec<Kline> = resp
            .json()
            .await
            .map_err(|e| CollectorError::Selection(format!("klines response malformed for {symbol}: {e}")))?;

        let open: f64 = klines.first().and_then(|k| k.1.parse().ok()).unwrap_or(0.0);
        let mut high = f64::MIN;
        let mut low = f64::MAX;
        for k in &klines {
            let h: f64 = k.2.parse().unwrap_or(f64::MIN);
            let l: f64 = k.3.parse().unwrap_or(f64::MAX);
            high = high.max(h);
            low = low.min(l);
        }
        if open <= 0.0 || low == f64::MAX || high == f64::MIN {
            return Ok(0.0);
        }
        Ok((high - low) / open * 100.0)
    }
}

#[async_trait]
impl SymbolSelector for VolatilitySymbolSelector {
    async fn select(&self) -> Result<Vec<Symbol>> {
        let tickers = self.fetch_tickers().await?;

        let mut usdt_pairs: Vec<(String, f64)> = tickers
            .into_iter()
            .filter(|t| t.symbol.ends_with("USDT"))
            .filter_map(|t| {
                let volume: f64 = t.quote_volume.parse().ok()?;
                Some((t.symbol, volume))
            })
            .filter(|(_, volume)| *volume >= self.min_volume)
            .collect();

        usdt_pairs.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        usdt_pairs.truncate(TOP_TICKERS_BY_VOLUME);

        let mut scored = Vec::with_capacity(usdt_pairs.len());
        for (symbol, _) in usdt_pairs {
            match self.amplitude(&symbol).await {
                Ok(a) if a >= self.min_amplitude && a < AMPLITUDE_UPPER_BOUND => scored.push((symbol, a)),
                Ok(_) => {}
                Err(e) => warn!(target: "collector::selector", "amplitude fetch failed for {symbol}: {e}"),
            }
        }

        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(self.top_n);

        if scored.is_empty() {
            return Err(CollectorError::Selection(
                "no symbols met volume/amplitude thresholds".to_string(),
            ));
        }

        let mut selected: Vec<Symbol> = scored.into_iter().map(|(s, _)| Symbol::from(s)).collect();
        if selected.len() < self.top_n && !selected.iter().any(|s| s.to_upper() == GUARANTEED_SYMBOL) {
            selected.push(Symbol::new(GUARANTEED_SYMBOL.to_lowercase()));
        }
        Ok(selected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn static_selector_returns_fixed_set() {
        let selector = StaticSymbolSelector::new(["btcusdt", "ethusdt"]);
        let symbols = selector.select().await.unwrap();
        assert_eq!(symbols, vec![Symbol::new("btcusdt"), Symbol::new("ethusdt")]);
    }
}
