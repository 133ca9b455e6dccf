use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, SecondsFormat, Utc};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::{
    sync::{
        broadcast,
        mpsc::{channel, error::TrySendError, Sender},
    },
    task::JoinHandle,
};
use tracing::warn;

use crate::{
    errors::ApiError,
    history::{HistoryFetcher, HistoryQuery},
    models::{
        AssetKind, BarsQuery, FeedsHealth, HealthResponse, HistoryResponse, SubscriptionKey,
        Timeframe,
    },
    normalize::{display_to_utc, parse_rfc3339},
    relay::{RelayMessage, RelayServer},
    upstream::{ConnectorNotice, UpstreamConnector},
};

#[derive(Clone)]
pub struct AppState {
    relay: RelayServer,
    connector: UpstreamConnector,
    history: Arc<HistoryFetcher>,
}

impl AppState {
    pub fn new(relay: RelayServer, connector: UpstreamConnector, history: Arc<HistoryFetcher>) -> Self {
        Self {
            relay,
            connector,
            history,
        }
    }
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        feeds: FeedsHealth {
            stock: state.connector.state(AssetKind::Stock),
            crypto: state.connector.state(AssetKind::Crypto),
        },
    })
}

pub async fn fetch_bars(
    State(state): State<AppState>,
    Query(request): Query<BarsQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let query = history_query_from_request(&request, Utc::now())?;
    let bars = state.history.fetch_range(&query).await?;

    let earliest_timestamp = bars.first().and_then(|bar| utc_label(bar.time));
    let latest_timestamp = bars.last().and_then(|bar| utc_label(bar.time));

    Ok(Json(HistoryResponse {
        symbol: query.symbol,
        kind: query.kind,
        timeframe: query.timeframe,
        total_bars: bars.len(),
        is_empty: bars.is_empty(),
        data: bars,
        earliest_timestamp,
        latest_timestamp,
    }))
}

fn history_query_from_request(
    request: &BarsQuery,
    now: DateTime<Utc>,
) -> Result<HistoryQuery, ApiError> {
    if request.symbol.trim().is_empty() {
        return Err(ApiError::Validation("symbol is required".to_string()));
    }

    let kind = match request.kind.as_deref() {
        Some(kind) => AssetKind::parse(kind).map_err(ApiError::Validation)?,
        None => AssetKind::Stock,
    };
    let timeframe = match request.timeframe.as_deref() {
        Some(timeframe) => Timeframe::parse(timeframe).map_err(ApiError::Validation)?,
        None => Timeframe::Min1,
    };

    let end = match request.end.as_deref() {
        Some(end) => parse_rfc3339(end)
            .ok_or_else(|| ApiError::Validation(format!("invalid end timestamp `{end}`")))?,
        None => now,
    };
    let start = match request.start.as_deref() {
        Some(start) => parse_rfc3339(start)
            .ok_or_else(|| ApiError::Validation(format!("invalid start timestamp `{start}`")))?,
        None => end - timeframe.default_lookback(),
    };

    if start >= end {
        return Err(ApiError::Validation(
            "start must be earlier than end".to_string(),
        ));
    }

    Ok(HistoryQuery::new(&request.symbol, kind, timeframe, start, end))
}

fn utc_label(display_time: i64) -> Option<String> {
    display_to_utc(display_time).map(|value| value.to_rfc3339_opts(SecondsFormat::Secs, true))
}

#[derive(Debug, Deserialize)]
struct ClientStreamCommand {
    op: String,
    symbol: Option<String>,
    #[serde(alias = "type")]
    kind: Option<String>,
}

#[derive(Debug, PartialEq, Eq)]
enum ParsedStreamCommand {
    Subscribe(SubscriptionKey),
    Unsubscribe(SubscriptionKey),
    Ping,
}

const CLIENT_OUTGOING_QUEUE_CAPACITY: usize = 256;

pub async fn bars_stream_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_bars_stream_socket(socket, state))
}

async fn handle_bars_stream_socket(socket: WebSocket, state: AppState) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (outgoing_sender, mut outgoing_receiver) =
        channel::<RelayMessage>(CLIENT_OUTGOING_QUEUE_CAPACITY);

    let writer_task = tokio::spawn(async move {
        while let Some(message) = outgoing_receiver.recv().await {
            let encoded = match serde_json::to_string(&message) {
                Ok(encoded) => encoded,
                Err(err) => {
                    warn!(error = %err, "failed to serialize relay message");
                    continue;
                }
            };
            if ws_sender.send(Message::Text(encoded.into())).await.is_err() {
                break;
            }
        }
    });

    let mut session = state.relay.open_session(outgoing_sender.clone());
    let session_id = session.id();

    send_relay(&outgoing_sender, greeting(&state.connector));
    let notice_task = spawn_notice_forwarder(state.connector.notices(), outgoing_sender.clone());

    loop {
        let Some(next_message) = ws_receiver.next().await else {
            break;
        };

        let message = match next_message {
            Ok(message) => message,
            Err(err) => {
                warn!(session_id, error = %err, "client websocket read error");
                break;
            }
        };

        let text = match message {
            Message::Text(text) => text.as_str().to_string(),
            Message::Binary(binary) => match String::from_utf8(binary.to_vec()) {
                Ok(text) => text,
                Err(err) => {
                    if !send_relay(
                        &outgoing_sender,
                        RelayMessage::error(format!("invalid UTF-8 websocket payload: {err}")),
                    ) {
                        break;
                    }
                    continue;
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };

        let reply = match parse_stream_command(&text) {
            Ok(ParsedStreamCommand::Subscribe(key)) => session.subscribe(key),
            Ok(ParsedStreamCommand::Unsubscribe(key)) => session.unsubscribe(key),
            Ok(ParsedStreamCommand::Ping) => RelayMessage::Pong,
            Err(err) => RelayMessage::error(err),
        };

        if !send_relay(&outgoing_sender, reply) {
            break;
        }
    }

    notice_task.abort();
    session.close();
    drop(outgoing_sender);
    let _ = writer_task.await;
    tracing::debug!(session_id, "client websocket closed");
}

fn greeting(connector: &UpstreamConnector) -> RelayMessage {
    let degraded: Vec<AssetKind> = AssetKind::ALL
        .into_iter()
        .filter(|kind| connector.failure(*kind).is_some())
        .collect();

    if degraded.is_empty() {
        return RelayMessage::Connected {
            message: "Connected to market data relay".to_string(),
        };
    }

    let kinds: Vec<&str> = degraded.iter().map(|kind| kind.as_str()).collect();
    RelayMessage::error(format!(
        "Real-time {} data is unavailable; historical data is still browsable",
        kinds.join(" and ")
    ))
}

fn notice_message(notice: ConnectorNotice) -> Option<RelayMessage> {
    match notice {
        ConnectorNotice::Connected { kind } => Some(RelayMessage::Connected {
            message: format!("Real-time {kind} data connected"),
        }),
        ConnectorNotice::Degraded { kind, message } => Some(RelayMessage::error(format!(
            "Real-time {kind} data is unavailable: {message}"
        ))),
        ConnectorNotice::Reconnecting { .. } => None,
    }
}

fn spawn_notice_forwarder(
    mut notices: broadcast::Receiver<ConnectorNotice>,
    outgoing_sender: Sender<RelayMessage>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match notices.recv().await {
                Ok(notice) => {
                    if let Some(message) = notice_message(notice) {
                        if !send_relay(&outgoing_sender, message) {
                            return;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "client lagged behind connector notices");
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
    })
}

fn parse_stream_command(payload: &str) -> Result<ParsedStreamCommand, String> {
    let command = serde_json::from_str::<ClientStreamCommand>(payload)
        .map_err(|err| format!("invalid JSON command: {err}"))?;

    let op = command.op.trim().to_ascii_lowercase();
    match op.as_str() {
        "ping" => Ok(ParsedStreamCommand::Ping),
        "subscribe" | "unsubscribe" => {
            let symbol = command.symbol.unwrap_or_default();
            if symbol.trim().is_empty() {
                return Err(format!("`{op}` requires a symbol"));
            }
            let kind = match command.kind.as_deref() {
                Some(kind) => AssetKind::parse(kind)?,
                None => AssetKind::Stock,
            };

            let key = SubscriptionKey::new(&symbol, kind);
            if op == "subscribe" {
                Ok(ParsedStreamCommand::Subscribe(key))
            } else {
                Ok(ParsedStreamCommand::Unsubscribe(key))
            }
        }
        other => Err(format!(
            "unsupported op `{other}`; expected `subscribe`, `unsubscribe`, or `ping`"
        )),
    }
}

/// Queues a message for the client. A full queue drops the message; only a
/// closed queue ends the session.
fn send_relay(outgoing_sender: &Sender<RelayMessage>, message: RelayMessage) -> bool {
    match outgoing_sender.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("client outgoing queue is full; dropping message");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}
