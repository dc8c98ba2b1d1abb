//! Environment-driven configuration and on-disk API credentials.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CollectorError, Result};

const DEFAULT_KEY_FILE: &str = "/root/data/binanceKeys.json";
const DEFAULT_DATA_DIR: &str = "/root/data";
const DEFAULT_MIN_VOLUME: f64 = 10_000_000.0;
const DEFAULT_MIN_AMPLITUDE: f64 = 5.0;

#[derive(Debug, Clone)]
pub struct Config {
    pub key_file_path: PathBuf,
    pub data_save_path: PathBuf,
    pub min_volume: f64,
    pub min_amplitude: f64,
}

impl Config {
    /// Reads configuration from environment variables, falling back to the
    /// same defaults as the original collector:
    /// `BINANCE_KEY_FILE_PATH`, `DATA_SAVE_PATH`, `MIN_VOLUME`, `MIN_AMPLITUDE`.
    pub fn from_env() -> Result<Self> {
        let key_file_path = std::env::var("BINANCE_KEY_FILE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_KEY_FILE));
        let data_save_path = std::env::var("DATA_SAVE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_DATA_DIR));
        let min_volume = parse_env_f64("MIN_VOLUME", DEFAULT_MIN_VOLUME)?;
        let min_amplitude = parse_env_f64("MIN_AMPLITUDE", DEFAULT_MIN_AMPLITUDE)?;

        Ok(Self {
            key_file_path,
            data_save_path,
            min_volume,
            min_amplitude,
        })
    }
}

fn parse_env_f64(name: &str, default: f64) -> Result<f64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| CollectorError::Config(format!("{name} is not a valid number: {raw:?}"))),
        Err(std::env::VarError::NotPresent) => Ok(default),
        Err(std::env::VarError::NotUnicode(raw)) => Err(CollectorError::Config(format!(
            "{name} is not valid unicode: {raw:?}"
        ))),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub binance_api_key: String,
    pub binance_api_secret: String,
}

impl Credentials {
    /// Loads credentials from `path`, writing a placeholder file if one
    /// doesn't already exist so the operator has something to edit.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if !path.exists() {
            let placeholder = Credentials {
                binance_api_key: "your_api_key".to_string(),
                binance_api_secret: "your_api_secret".to_string(),
            };
            let body = serde_json::to_string_pretty(&placeholder).map_err(|e| {
                CollectorError::Config(format!("failed to serialize placeholder credentials: {e}"))
            })?;
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent).map_err(|e| {
                        CollectorError::Config(format!(
                            "failed to create directory for {}: {e}",
                            path.display()
                        ))
                    })?;
                }
            }
            fs::write(path, body).map_err(|e| {
                CollectorError::Config(format!("failed to write placeholder credentials to {}: {e}", path.display()))
            })?;
            return Err(CollectorError::Config(format!(
                "no credentials found; wrote a placeholder to {} — fill it in and restart",
                path.display()
            )));
        }

        let raw = fs::read_to_string(path)
            .map_err(|e| CollectorError::Config(format!("failed to read {}: {e}", path.display())))?;
        serde_json::from_str(&raw)
            .map_err(|e| CollectorError::Config(format!("failed to parse {}: {e}", path.display())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_credentials_file_is_created_as_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");

        let result = Credentials::load_or_create(&path);
        assert!(result.is_err());
        assert!(path.exists());

        let loaded = Credentials::load_or_create(&path).unwrap();
        assert_eq!(loaded.binance_api_key, "your_api_key");
    }

    #[test]
    fn existing_credentials_file_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("creds.json");
        fs::write(&path, r#"{"binance_api_key":"abc","binance_api_secret":"def"}"#).unwrap();

        let loaded = Credentials::load_or_create(&path).unwrap();
        assert_eq!(loaded.binance_api_key, "abc");
        assert_eq!(loaded.binance_api_secret, "def");
    }
}
