pub mod alpaca;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    models::{normalize_series, normalize_symbol, AssetKind, Bar, Timeframe},
    normalize::window_before,
};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HistoryFetchError {
    #[error("invalid history request: {0}")]
    InvalidRequest(String),
    #[error("history request failed: {0}")]
    Request(String),
    #[error("history provider returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("history response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryQuery {
    pub symbol: String,
    pub kind: AssetKind,
    pub timeframe: Timeframe,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl HistoryQuery {
    pub fn new(
        symbol: &str,
        kind: AssetKind,
        timeframe: Timeframe,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            kind,
            timeframe,
            start,
            end,
        }
    }

    pub fn default_window(
        symbol: &str,
        kind: AssetKind,
        timeframe: Timeframe,
        now: DateTime<Utc>,
    ) -> Self {
        Self::new(symbol, kind, timeframe, now - timeframe.default_lookback(), now)
    }

    pub fn before(
        symbol: &str,
        kind: AssetKind,
        timeframe: Timeframe,
        earliest_display_time: i64,
    ) -> Option<Self> {
        let (start, end) = window_before(earliest_display_time, timeframe.default_lookback())?;
        Some(Self::new(symbol, kind, timeframe, start, end))
    }

    pub fn validate(&self) -> Result<(), HistoryFetchError> {
        if self.symbol.is_empty() {
            return Err(HistoryFetchError::InvalidRequest(
                "symbol cannot be empty".to_string(),
            ));
        }
        if self.start >= self.end {
            return Err(HistoryFetchError::InvalidRequest(format!(
                "start {} must be before end {}",
                self.start, self.end
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BarPage {
    pub bars: Vec<Bar>,
    pub next_page_token: Option<String>,
}

#[async_trait]
pub trait HistoryProvider: Send + Sync {
    async fn fetch_page(
        &self,
        query: &HistoryQuery,
        page_token: Option<&str>,
        limit: usize,
    ) -> Result<BarPage, HistoryFetchError>;
}

#[async_trait]
pub trait HistorySource: Send + Sync {
    async fn load(&self, query: &HistoryQuery) -> Result<Vec<Bar>, HistoryFetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchLimits {
    pub page_limit: usize,
    pub max_pages: usize,
    pub max_bars: usize,
}

impl Default for FetchLimits {
    fn default() -> Self {
        Self {
            page_limit: 2_000,
            max_pages: 500,
            max_bars: 1_000_000,
        }
    }
}

pub struct HistoryFetcher {
    provider: Arc<dyn HistoryProvider>,
    limits: FetchLimits,
}

impl HistoryFetcher {
    pub fn new(provider: Arc<dyn HistoryProvider>, limits: FetchLimits) -> Self {
        Self { provider, limits }
    }

    pub async fn fetch_range(&self, query: &HistoryQuery) -> Result<Vec<Bar>, HistoryFetchError> {
        query.validate()?;

        let mut bars = Vec::new();
        let mut page_token: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let page = self
                .provider
                .fetch_page(query, page_token.as_deref(), self.limits.page_limit)
                .await?;
            pages += 1;

            let page_len = page.bars.len();
            bars.extend(page.bars);
            tracing::debug!(
                symbol = %query.symbol,
                timeframe = %query.timeframe,
                page = pages,
                page_len,
                total = bars.len(),
                "fetched history page"
            );

            if page_len == 0 {
                break;
            }
            if bars.len() >= self.limits.max_bars || pages >= self.limits.max_pages {
                tracing::warn!(
                    symbol = %query.symbol,
                    pages,
                    bars = bars.len(),
                    "history pagination stopped at safety cap"
                );
                break;
            }

            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        normalize_series(&mut bars);
        Ok(bars)
    }
}

#[async_trait]
impl HistorySource for HistoryFetcher {
    async fn load(&self, query: &HistoryQuery) -> Result<Vec<Bar>, HistoryFetchError> {
        self.fetch_range(query).await
    }
}
