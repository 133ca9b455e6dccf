use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_json::Value;

use crate::{models::AssetKind, normalize::parse_history_bar};

use super::{BarPage, HistoryFetchError, HistoryProvider, HistoryQuery};

pub const DEFAULT_DATA_BASE_URL: &str = "https://data.alpaca.markets";

pub struct AlpacaHistoryProvider {
    http_client: reqwest::Client,
    base_url: String,
    api_key: String,
    secret_key: String,
}

impl AlpacaHistoryProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
        timeout_ms: u64,
    ) -> Result<Self, HistoryFetchError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| {
                HistoryFetchError::Request(format!("failed to build history client: {err}"))
            })?;

        Ok(Self {
            http_client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            secret_key: secret_key.into(),
        })
    }

    fn request_url(&self, query: &HistoryQuery) -> String {
        match query.kind {
            AssetKind::Stock => format!("{}/v2/stocks/{}/bars", self.base_url, query.symbol),
            AssetKind::Crypto => format!("{}/v1beta3/crypto/us/bars", self.base_url),
        }
    }
}

fn request_params(
    query: &HistoryQuery,
    page_token: Option<&str>,
    limit: usize,
) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("timeframe", query.timeframe.as_str().to_string()),
        (
            "start",
            query.start.to_rfc3339_opts(SecondsFormat::Secs, true),
        ),
        ("end", query.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ("limit", limit.to_string()),
    ];

    match query.kind {
        AssetKind::Stock => {
            params.push(("feed", "iex".to_string()));
            params.push(("adjustment", "split".to_string()));
        }
        AssetKind::Crypto => params.push(("symbols", query.symbol.clone())),
    }

    if let Some(token) = page_token {
        params.push(("page_token", token.to_string()));
    }
    params
}

#[async_trait]
impl HistoryProvider for AlpacaHistoryProvider {
    async fn fetch_page(
        &self,
        query: &HistoryQuery,
        page_token: Option<&str>,
        limit: usize,
    ) -> Result<BarPage, HistoryFetchError> {
        let response = self
            .http_client
            .get(self.request_url(query))
            .header("APCA-API-KEY-ID", &self.api_key)
            .header("APCA-API-SECRET-KEY", &self.secret_key)
            .query(&request_params(query, page_token, limit))
            .send()
            .await
            .map_err(|err| HistoryFetchError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(HistoryFetchError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let payload = response
            .json::<Value>()
            .await
            .map_err(|err| HistoryFetchError::Decode(err.to_string()))?;
        parse_bars_page(&payload, &query.symbol)
    }
}

pub fn parse_bars_page(payload: &Value, symbol: &str) -> Result<BarPage, HistoryFetchError> {
    let rows = match payload.get("bars") {
        None | Some(Value::Null) => None,
        Some(Value::Array(rows)) => Some(rows),
        Some(Value::Object(by_symbol)) => by_symbol.get(symbol).and_then(Value::as_array),
        Some(other) => {
            return Err(HistoryFetchError::Decode(format!(
                "unexpected `bars` shape: {other}"
            )))
        }
    };

    let mut bars = Vec::new();
    let mut skipped = 0usize;
    for row in rows.into_iter().flatten() {
        match parse_history_bar(row) {
            Some(bar) => bars.push(bar),
            None => skipped += 1,
        }
    }
    if skipped > 0 {
        tracing::warn!(symbol, skipped, "skipped malformed history rows");
    }

    let next_page_token = payload
        .get("next_page_token")
        .and_then(Value::as_str)
        .filter(|token| !token.is_empty())
        .map(str::to_string);

    Ok(BarPage {
        bars,
        next_page_token,
    })
}
