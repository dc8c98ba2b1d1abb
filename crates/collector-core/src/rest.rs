//! REST snapshot fetching with the exchange's documented retry taxonomy.

use std::time::Duration;

use log::warn;
use reqwest::{Client, StatusCode};

use crate::error::{CollectorError, Result};
use crate::model::Snapshot;

const SNAPSHOT_URL: &str = "https://api.binance.com/api/v3/depth";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(7);
const MAX_RETRIES: u32 = 5;

#[derive(Clone)]
pub struct RestClient {
    client: Client,
}

impl RestClient {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| CollectorError::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Fetches a depth snapshot for `symbol` at the given `limit` (the
    /// exchange's order-book depth page size, e.g. 1000).
    ///
    /// Retry taxonomy, straight off the exchange's documented behaviour:
    /// - 429 (rate limited): wait 5s, retry.
    /// - 502/503 (gateway/unavailable): wait 3s, retry.
    /// - request timeout: retry immediately.
    /// - 400 and other 4xx: no retry, returned as `Client`.
    /// - anything else non-2xx: no retry, returned as `Unhandled`.
    pub async fn fetch_snapshot(&self, symbol: &str, limit: u32) -> Result<Snapshot> {
        let url = format!("{SNAPSHOT_URL}?symbol={symbol}&limit={limit}");
        let mut retries = 0u32;

        loop {
            let attempt = self.client.get(&url).send().await;

            let response = match attempt {
                Ok(resp) => resp,
                Err(e) if e.is_timeout() => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(CollectorError::SnapshotExhausted {
                            symbol: symbol.to_string(),
                            source: "request timed out repeatedly".to_string(),
                        });
                    }
                    warn!(target: "collector::rest", "timeout fetching snapshot for {symbol}, retrying immediately");
                    continue;
                }
                Err(e) => {
                    return Err(CollectorError::SnapshotExhausted {
                        symbol: symbol.to_string(),
                        source: e.to_string(),
                    });
                }
            };

            let status = response.status();
            if status.is_success() {
                let body = response
                    .text()
                    .await
                    .map_err(|e| CollectorError::SnapshotExhausted {
                        symbol: symbol.to_string(),
                        source: e.to_string(),
                    })?;
                let last_update_id = parse_last_update_id(&body).ok_or_else(|| {
                    CollectorError::SnapshotExhausted {
                        symbol: symbol.to_string(),
                        source: "response missing lastUpdateId".to_string(),
                    }
                })?;
                return Ok(Snapshot {
                    last_update_id,
                    payload: body,
                });
            }

            match status {
                StatusCode::TOO_MANY_REQUESTS => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(CollectorError::SnapshotExhausted {
                            symbol: symbol.to_string(),
                            source: "rate limited repeatedly".to_string(),
                        });
                    }
                    warn!(target: "collector::rest", "429 fetching snapshot for {symbol}, backing off 5s");
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE => {
                    retries += 1;
                    if retries > MAX_RETRIES {
                        return Err(CollectorError::SnapshotExhausted {
                            symbol: symbol.to_string(),
                            source: format!("{status} repeatedly"),
                        });
                    }
                    warn!(target: "collector::rest", "{status} fetching snapshot for {symbol}, backing off 3s");
                    tokio::time::sleep(Duration::from_secs(3)).await;
                }
                StatusCode::BAD_REQUEST => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(CollectorError::Client {
                        status: status.as_u16(),
                        body,
                    });
                }
                s if s.is_client_error() => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(CollectorError::Client {
                        status: status.as_u16(),
                        body,
                    });
                }
                _ => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(CollectorError::Unhandled {
                        status: status.as_u16(),
                        body,
                    });
                }
            }
        }
    }
}

fn parse_last_update_id(body: &str) -> Option<i64> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    value.get("lastUpdateId")?.as_i64()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_last_update_id_from_snapshot_body() {
        let body = r#"{"lastUpdateId":123456,"bids":[],"asks":[]}"#;
        assert_eq!(parse_last_update_id(body), Some(123456));
    }

    #[test]
    fn missing_field_is_none() {
        let body = r#"{"bids":[],"asks":[]}"#;
        assert_eq!(parse_last_update_id(body), None);
    }
}
