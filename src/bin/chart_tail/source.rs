use std::time::Duration;

use async_trait::async_trait;
use chrono::SecondsFormat;
use market_bar_relay::{
    history::{HistoryFetchError, HistoryQuery, HistorySource},
    models::{Bar, HistoryResponse},
};
use serde::Deserialize;

pub(crate) struct HttpHistorySource {
    http_client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    code: String,
    message: String,
}

impl HttpHistorySource {
    pub(crate) fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let http_client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http_client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

pub(crate) fn bars_query_params(query: &HistoryQuery) -> Vec<(&'static str, String)> {
    vec![
        ("symbol", query.symbol.clone()),
        ("kind", query.kind.as_str().to_string()),
        ("timeframe", query.timeframe.as_str().to_string()),
        ("start", query.start.to_rfc3339_opts(SecondsFormat::Secs, true)),
        ("end", query.end.to_rfc3339_opts(SecondsFormat::Secs, true)),
    ]
}

#[async_trait]
impl HistorySource for HttpHistorySource {
    async fn load(&self, query: &HistoryQuery) -> Result<Vec<Bar>, HistoryFetchError> {
        let response = self
            .http_client
            .get(format!("{}/v1/bars", self.base_url))
            .query(&bars_query_params(query))
            .send()
            .await
            .map_err(|err| HistoryFetchError::Request(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = match serde_json::from_str::<ErrorBody>(&text) {
                Ok(body) => format!("{}: {}", body.code, body.message),
                Err(_) => text,
            };
            return Err(HistoryFetchError::Status {
                status: status.as_u16(),
                message,
            });
        }

        let body = response
            .json::<HistoryResponse>()
            .await
            .map_err(|err| HistoryFetchError::Decode(err.to_string()))?;
        Ok(body.data)
    }
}
