use std::{str::FromStr, time::Duration};

use anyhow::{Context, Result};

use crate::{
    history::{alpaca::DEFAULT_DATA_BASE_URL, FetchLimits},
    upstream::{
        alpaca::{DEFAULT_CRYPTO_WS_URL, DEFAULT_STOCK_WS_URL},
        ReconnectPolicy,
    },
};

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub alpaca_api_key: String,
    pub alpaca_secret_key: String,
    pub stock_ws_url: String,
    pub crypto_ws_url: String,
    pub data_base_url: String,
    pub request_timeout_ms: u64,
    pub reconnect_base_delay_ms: u64,
    pub reconnect_max_attempts: u32,
    pub history_page_limit: usize,
    pub history_max_pages: usize,
    pub history_max_bars: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let host = std::env::var("HOST")
            .unwrap_or_else(|_| "0.0.0.0".to_string())
            .trim()
            .to_string();

        let port = parse_env("PORT", 8080)?;

        let alpaca_api_key = std::env::var("ALPACA_API_KEY")
            .context("ALPACA_API_KEY must be set")?
            .trim()
            .to_string();
        let alpaca_secret_key = std::env::var("ALPACA_SECRET_KEY")
            .context("ALPACA_SECRET_KEY must be set")?
            .trim()
            .to_string();

        let stock_ws_url = url_env("ALPACA_STOCK_WS_URL", DEFAULT_STOCK_WS_URL);
        let crypto_ws_url = url_env("ALPACA_CRYPTO_WS_URL", DEFAULT_CRYPTO_WS_URL);
        let data_base_url = url_env("ALPACA_DATA_BASE_URL", DEFAULT_DATA_BASE_URL);

        let defaults = ReconnectPolicy::default();
        let limits = FetchLimits::default();

        Ok(Self {
            host,
            port,
            alpaca_api_key,
            alpaca_secret_key,
            stock_ws_url,
            crypto_ws_url,
            data_base_url,
            request_timeout_ms: parse_env("REQUEST_TIMEOUT_MS", 10_000)?,
            reconnect_base_delay_ms: parse_env(
                "RECONNECT_BASE_DELAY_MS",
                defaults.base_delay.as_millis() as u64,
            )?,
            reconnect_max_attempts: parse_env("RECONNECT_MAX_ATTEMPTS", defaults.max_attempts)?,
            history_page_limit: parse_env("HISTORY_PAGE_LIMIT", limits.page_limit)?,
            history_max_pages: parse_env("HISTORY_MAX_PAGES", limits.max_pages)?,
            history_max_bars: parse_env("HISTORY_MAX_BARS", limits.max_bars)?,
        })
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            max_attempts: self.reconnect_max_attempts,
        }
    }

    pub fn fetch_limits(&self) -> FetchLimits {
        FetchLimits {
            page_limit: self.history_page_limit,
            max_pages: self.history_max_pages,
            max_bars: self.history_max_bars,
        }
    }
}

fn url_env(name: &str, default: &str) -> String {
    std::env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .trim()
        .trim_end_matches('/')
        .to_string()
}

fn parse_env<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid {name} value: {value}")),
        Err(_) => Ok(default),
    }
}
