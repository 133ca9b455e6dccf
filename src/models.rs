use std::fmt;

use chrono::TimeDelta;
use serde::{Deserialize, Serialize};

use crate::upstream::ConnectionState;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    pub fn absorb(&mut self, trade: &Bar) {
        self.high = self.high.max(trade.high);
        self.low = self.low.min(trade.low);
        self.close = trade.close;
        self.volume += trade.volume;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Stock,
    Crypto,
}

impl AssetKind {
    pub const ALL: [AssetKind; 2] = [AssetKind::Stock, AssetKind::Crypto];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stock => "stock",
            Self::Crypto => "crypto",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "stock" | "stocks" | "equity" => Ok(Self::Stock),
            "crypto" => Ok(Self::Crypto),
            other => Err(format!(
                "unsupported kind `{other}`; expected `stock` or `crypto`"
            )),
        }
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Timeframe {
    #[serde(rename = "1Min")]
    Min1,
    #[serde(rename = "5Min")]
    Min5,
    #[serde(rename = "15Min")]
    Min15,
    #[serde(rename = "1Hour")]
    Hour1,
    #[serde(rename = "1Day")]
    Day1,
    #[serde(rename = "1Week")]
    Week1,
    #[serde(rename = "1Month")]
    Month1,
}

impl Timeframe {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Min1 => "1Min",
            Self::Min5 => "5Min",
            Self::Min15 => "15Min",
            Self::Hour1 => "1Hour",
            Self::Day1 => "1Day",
            Self::Week1 => "1Week",
            Self::Month1 => "1Month",
        }
    }

    pub fn parse(value: &str) -> Result<Self, String> {
        match value.trim().to_ascii_lowercase().as_str() {
            "1min" | "1m" => Ok(Self::Min1),
            "5min" | "5m" => Ok(Self::Min5),
            "15min" | "15m" => Ok(Self::Min15),
            "1hour" | "1h" => Ok(Self::Hour1),
            "1day" | "1d" => Ok(Self::Day1),
            "1week" | "1w" => Ok(Self::Week1),
            "1month" | "1mo" => Ok(Self::Month1),
            _ => Err(format!("unsupported timeframe `{}`", value.trim())),
        }
    }

    pub fn default_lookback(self) -> TimeDelta {
        match self {
            Self::Min1 => TimeDelta::days(5),
            Self::Min5 => TimeDelta::days(14),
            Self::Min15 => TimeDelta::days(45),
            Self::Hour1 => TimeDelta::days(180),
            Self::Day1 => TimeDelta::days(4 * 365),
            Self::Week1 | Self::Month1 => TimeDelta::days(20 * 365),
        }
    }

    pub fn is_live_granularity(self) -> bool {
        self == Self::Min1
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionKey {
    pub symbol: String,
    pub kind: AssetKind,
}

impl SubscriptionKey {
    pub fn new(symbol: &str, kind: AssetKind) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            kind,
        }
    }
}

impl fmt::Display for SubscriptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.symbol)
    }
}

pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_ascii_uppercase()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BarSource {
    Bar,
    Trade,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LiveBar {
    pub symbol: String,
    pub kind: AssetKind,
    pub bar: Bar,
    pub source: BarSource,
}

impl LiveBar {
    pub fn key(&self) -> SubscriptionKey {
        SubscriptionKey {
            symbol: self.symbol.clone(),
            kind: self.kind,
        }
    }
}

/// Sorts ascending by time and keeps the first bar of every run of equal
/// times. Callers put resident bars ahead of incoming ones so that the
/// resident bar wins a tie.
pub fn normalize_series(bars: &mut Vec<Bar>) {
    bars.sort_by_key(|bar| bar.time);
    bars.dedup_by_key(|bar| bar.time);
}

pub fn is_strictly_ordered(bars: &[Bar]) -> bool {
    bars.windows(2).all(|pair| pair[0].time < pair[1].time)
}

#[derive(Debug, Deserialize)]
pub struct BarsQuery {
    pub symbol: String,
    #[serde(alias = "type")]
    pub kind: Option<String>,
    pub timeframe: Option<String>,
    pub start: Option<String>,
    pub end: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub symbol: String,
    pub kind: AssetKind,
    pub timeframe: Timeframe,
    pub data: Vec<Bar>,
    pub total_bars: usize,
    pub is_empty: bool,
    pub earliest_timestamp: Option<String>,
    pub latest_timestamp: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub feeds: FeedsHealth,
}

#[derive(Debug, Serialize)]
pub struct FeedsHealth {
    pub stock: ConnectionState,
    pub crypto: ConnectionState,
}
