use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message as AxumWsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use futures_util::{SinkExt, StreamExt};
use market_bar_relay::{
    history::{BarPage, FetchLimits, HistoryFetchError, HistoryFetcher, HistoryProvider, HistoryQuery},
    models::{AssetKind, Bar, SubscriptionKey},
    registry::SubscriptionRegistry,
    relay::RelayServer,
    upstream::{alpaca::AlpacaFeedTransport, ReconnectPolicy, UpstreamConnector},
    web::{self, AppState},
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::{
    net::TcpListener,
    sync::{broadcast, mpsc, oneshot},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::{connect_async, tungstenite::Message as TungsteniteMessage};

type ClientStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone, PartialEq, Eq)]
struct UpstreamAction {
    feed: &'static str,
    action: String,
    symbols: Vec<String>,
}

#[derive(Clone)]
struct MockUpstreamState {
    actions: Arc<Mutex<Vec<UpstreamAction>>>,
    outbound: broadcast::Sender<(&'static str, String)>,
}

impl MockUpstreamState {
    fn count(&self, feed: &str, action: &str, symbol: &str) -> usize {
        self.actions
            .lock()
            .iter()
            .filter(|entry| {
                entry.feed == feed
                    && entry.action == action
                    && entry.symbols.iter().any(|value| value == symbol)
            })
            .count()
    }
}

async fn spawn_server(app: Router) -> (String, oneshot::Sender<()>, JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener
        .local_addr()
        .expect("listener should expose address");
    let (shutdown_sender, shutdown_receiver) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_receiver.await;
            })
            .await
            .expect("server should run");
    });

    (format!("127.0.0.1:{}", addr.port()), shutdown_sender, task)
}

async fn upstream_ws_handler(socket: WebSocket, state: MockUpstreamState, feed: &'static str) {
    let (mut sender, mut receiver) = socket.split();
    let (reply_sender, mut reply_receiver) = mpsc::unbounded_channel::<String>();

    let mut outbound = state.outbound.subscribe();
    let outbound_sender = reply_sender.clone();
    let forwarder = tokio::spawn(async move {
        while let Ok((target, payload)) = outbound.recv().await {
            if target == feed && outbound_sender.send(payload).is_err() {
                break;
            }
        }
    });

    let writer = tokio::spawn(async move {
        while let Some(payload) = reply_receiver.recv().await {
            if sender
                .send(AxumWsMessage::Text(payload.into()))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    let _ = reply_sender.send(json!([{"T": "success", "msg": "connected"}]).to_string());

    while let Some(Ok(message)) = receiver.next().await {
        let text = match message {
            AxumWsMessage::Text(text) => text.as_str().to_string(),
            AxumWsMessage::Close(_) => break,
            _ => continue,
        };
        let Ok(value) = serde_json::from_str::<Value>(&text) else {
            continue;
        };

        match value.get("action").and_then(Value::as_str) {
            Some("auth") => {
                let reply = if value.get("key").and_then(Value::as_str) == Some("test-key") {
                    json!([{"T": "success", "msg": "authenticated"}])
                } else {
                    json!([{"T": "error", "code": 402, "msg": "auth failed"}])
                };
                let _ = reply_sender.send(reply.to_string());
            }
            Some(action @ ("subscribe" | "unsubscribe")) => {
                let symbols = value
                    .get("bars")
                    .and_then(Value::as_array)
                    .map(|values| {
                        values
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    })
                    .unwrap_or_default();
                state.actions.lock().push(UpstreamAction {
                    feed,
                    action: action.to_string(),
                    symbols,
                });
                let _ = reply_sender
                    .send(json!([{"T": "subscription", "bars": value.get("bars")}]).to_string());
            }
            _ => {}
        }
    }

    forwarder.abort();
    writer.abort();
}

async fn stock_route(ws: WebSocketUpgrade, State(state): State<MockUpstreamState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| upstream_ws_handler(socket, state, "stock"))
}

async fn crypto_route(ws: WebSocketUpgrade, State(state): State<MockUpstreamState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| upstream_ws_handler(socket, state, "crypto"))
}

struct FixedHistory {
    bars: Vec<Bar>,
}

#[async_trait]
impl HistoryProvider for FixedHistory {
    async fn fetch_page(
        &self,
        _query: &HistoryQuery,
        _page_token: Option<&str>,
        _limit: usize,
    ) -> Result<BarPage, HistoryFetchError> {
        Ok(BarPage {
            bars: self.bars.clone(),
            next_page_token: None,
        })
    }
}

struct Harness {
    upstream: MockUpstreamState,
    relay_bind: String,
    relay: RelayServer,
    connector: UpstreamConnector,
    shutdowns: Vec<(oneshot::Sender<()>, JoinHandle<()>)>,
}

impl Harness {
    async fn start(history_bars: Vec<Bar>) -> Self {
        let (outbound, _) = broadcast::channel(32);
        let upstream = MockUpstreamState {
            actions: Arc::new(Mutex::new(Vec::new())),
            outbound,
        };
        let upstream_app = Router::new()
            .route("/stock", get(stock_route))
            .route("/crypto", get(crypto_route))
            .with_state(upstream.clone());
        let (upstream_bind, upstream_shutdown, upstream_task) = spawn_server(upstream_app).await;

        let transport = Arc::new(AlpacaFeedTransport::new(
            format!("ws://{upstream_bind}/stock"),
            format!("ws://{upstream_bind}/crypto"),
            "test-key",
            "test-secret",
        ));
        let (connector, bars) = UpstreamConnector::new(
            transport,
            ReconnectPolicy {
                base_delay: Duration::from_millis(50),
                max_attempts: 5,
            },
        );
        let registry = Arc::new(SubscriptionRegistry::new(Arc::new(connector.clone())));
        tokio::spawn(registry.clone().run_dispatch(bars));
        let relay = RelayServer::new(registry);
        let history = Arc::new(HistoryFetcher::new(
            Arc::new(FixedHistory { bars: history_bars }),
            FetchLimits::default(),
        ));

        let app = Router::new()
            .route("/healthz", get(web::health))
            .route("/v1/bars", get(web::fetch_bars))
            .route("/v1/ws", get(web::bars_stream_ws))
            .with_state(AppState::new(relay.clone(), connector.clone(), history));
        let (relay_bind, relay_shutdown, relay_task) = spawn_server(app).await;

        Self {
            upstream,
            relay_bind,
            relay,
            connector,
            shutdowns: vec![
                (relay_shutdown, relay_task),
                (upstream_shutdown, upstream_task),
            ],
        }
    }

    async fn connect_upstream(&self) {
        timeout(Duration::from_secs(5), self.connector.connect())
            .await
            .expect("upstream connect should not hang")
            .expect("upstream feeds should connect");
    }

    async fn client(&self) -> ClientStream {
        let (mut stream, _) = connect_async(format!("ws://{}/v1/ws", self.relay_bind))
            .await
            .expect("client should connect");
        let _ = recv_message_of_type(&mut stream, &["connected", "error"]).await;
        stream
    }

    async fn stop(self) {
        self.connector.shutdown().await;
        for (shutdown, task) in self.shutdowns {
            let _ = shutdown.send(());
            let _ = timeout(Duration::from_secs(3), task).await;
        }
    }
}

async fn send_command(stream: &mut ClientStream, command: Value) {
    stream
        .send(TungsteniteMessage::Text(command.to_string().into()))
        .await
        .expect("command should send");
}

async fn recv_message_of_type(stream: &mut ClientStream, expected_types: &[&str]) -> Value {
    timeout(Duration::from_secs(3), async {
        loop {
            let message = stream
                .next()
                .await
                .expect("websocket should stay open")
                .expect("websocket frame should decode");

            let text = match message {
                TungsteniteMessage::Text(text) => text.as_str().to_string(),
                TungsteniteMessage::Ping(payload) => {
                    stream
                        .send(TungsteniteMessage::Pong(payload))
                        .await
                        .expect("pong should send");
                    continue;
                }
                TungsteniteMessage::Close(_) => panic!("websocket closed before expected message"),
                _ => continue,
            };

            let value = serde_json::from_str::<Value>(&text).expect("ws payload should be JSON");
            if value
                .get("type")
                .and_then(Value::as_str)
                .is_some_and(|value| expected_types.contains(&value))
            {
                return value;
            }
        }
    })
    .await
    .expect("timed out waiting for websocket message")
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let result = timeout(Duration::from_secs(3), async {
        while !condition() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {what}");
}

fn display_seconds(rfc3339: &str) -> i64 {
    DateTime::parse_from_rfc3339(rfc3339)
        .expect("timestamp should parse")
        .with_timezone(&Utc)
        .timestamp()
        - 5 * 3600
}

#[tokio::test]
async fn viewers_of_one_symbol_share_an_upstream_subscription() {
    let harness = Harness::start(Vec::new()).await;
    harness.connect_upstream().await;

    let mut first = harness.client().await;
    let mut second = harness.client().await;
    for client in [&mut first, &mut second] {
        send_command(client, json!({"op": "subscribe", "symbol": "aapl", "kind": "stock"})).await;
        let ack = recv_message_of_type(client, &["subscribed"]).await;
        assert_eq!(ack["symbol"], "AAPL");
    }

    let upstream = harness.upstream.clone();
    wait_until("upstream subscribe", || upstream.count("stock", "subscribe", "AAPL") == 1).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(upstream.count("stock", "subscribe", "AAPL"), 1);

    let frame = json!([{
        "T": "b", "S": "AAPL", "o": 187.1, "h": 187.9, "l": 186.8, "c": 187.5, "v": 1200,
        "t": "2026-01-02T15:00:00Z"
    }]);
    harness
        .upstream
        .outbound
        .send(("stock", frame.to_string()))
        .expect("mock upstream should have a listener");

    for client in [&mut first, &mut second] {
        let message = recv_message_of_type(client, &["bar"]).await;
        assert_eq!(message["symbol"], "AAPL");
        assert_eq!(message["kind"], "stock");
        assert_eq!(message["source"], "bar");
        assert_eq!(message["bar"]["close"], 187.5);
        assert_eq!(
            message["bar"]["time"].as_i64(),
            Some(display_seconds("2026-01-02T15:00:00Z"))
        );
    }

    first.close(None).await.expect("client should close");
    let key = SubscriptionKey::new("AAPL", AssetKind::Stock);
    let registry = harness.relay.registry().clone();
    wait_until("first viewer teardown", || registry.listener_count(&key) == 1).await;
    assert_eq!(upstream.count("stock", "unsubscribe", "AAPL"), 0);

    send_command(&mut second, json!({"op": "unsubscribe", "symbol": "AAPL", "kind": "stock"})).await;
    recv_message_of_type(&mut second, &["unsubscribed"]).await;
    wait_until("upstream unsubscribe", || upstream.count("stock", "unsubscribe", "AAPL") == 1).await;
    assert_eq!(registry.listener_count(&key), 0);

    harness.stop().await;
}

#[tokio::test]
async fn dropped_viewer_releases_its_upstream_subscriptions() {
    let harness = Harness::start(Vec::new()).await;
    harness.connect_upstream().await;

    let mut client = harness.client().await;
    send_command(&mut client, json!({"op": "subscribe", "symbol": "BTC/USD", "type": "crypto"})).await;
    recv_message_of_type(&mut client, &["subscribed"]).await;
    send_command(&mut client, json!({"op": "subscribe", "symbol": "MSFT"})).await;
    recv_message_of_type(&mut client, &["subscribed"]).await;

    let upstream = harness.upstream.clone();
    wait_until("crypto subscribe", || upstream.count("crypto", "subscribe", "BTC/USD") == 1).await;
    wait_until("stock subscribe", || upstream.count("stock", "subscribe", "MSFT") == 1).await;

    drop(client);

    let relay = harness.relay.clone();
    wait_until("session teardown", || relay.open_sessions() == 0).await;
    assert!(relay.registry().active_keys().is_empty());
    wait_until("crypto unsubscribe", || upstream.count("crypto", "unsubscribe", "BTC/USD") == 1).await;
    wait_until("stock unsubscribe", || upstream.count("stock", "unsubscribe", "MSFT") == 1).await;

    harness.stop().await;
}

#[tokio::test]
async fn subscribe_without_upstream_is_a_recoverable_notice() {
    let harness = Harness::start(Vec::new()).await;

    let mut client = harness.client().await;
    send_command(&mut client, json!({"op": "subscribe", "symbol": "AAPL", "kind": "stock"})).await;
    let notice = recv_message_of_type(&mut client, &["error", "subscribed"]).await;
    assert_eq!(notice["type"], "error");
    assert_eq!(notice["message"], "Real-time data not available for AAPL");

    send_command(&mut client, json!({"op": "ping"})).await;
    recv_message_of_type(&mut client, &["pong"]).await;

    send_command(&mut client, json!({"op": "subscribe", "kind": "stock"})).await;
    let invalid = recv_message_of_type(&mut client, &["error"]).await;
    assert!(invalid["message"]
        .as_str()
        .is_some_and(|message| message.contains("requires a symbol")));

    assert!(harness.relay.registry().active_keys().is_empty());
    harness.stop().await;
}

#[tokio::test]
async fn bars_endpoint_returns_normalized_history() {
    let bars = vec![
        Bar { time: 300, open: 3.0, high: 3.0, low: 3.0, close: 3.0, volume: 1.0 },
        Bar { time: 100, open: 1.0, high: 1.0, low: 1.0, close: 1.0, volume: 1.0 },
        Bar { time: 100, open: 9.0, high: 9.0, low: 9.0, close: 9.0, volume: 1.0 },
    ];
    let harness = Harness::start(bars).await;
    let client = reqwest::Client::new();

    let response = client
        .get(format!("http://{}/v1/bars", harness.relay_bind))
        .query(&[("symbol", "aapl"), ("timeframe", "1Day")])
        .send()
        .await
        .expect("request should succeed");
    assert!(response.status().is_success());
    let body: Value = response.json().await.expect("body should be JSON");

    assert_eq!(body["symbol"], "AAPL");
    assert_eq!(body["kind"], "stock");
    assert_eq!(body["timeframe"], "1Day");
    assert_eq!(body["totalBars"], 2);
    assert_eq!(body["isEmpty"], false);
    assert_eq!(body["data"][0]["time"], 100);
    assert_eq!(body["data"][0]["close"], 1.0);
    assert_eq!(body["earliestTimestamp"], "1970-01-01T05:01:40Z");

    let response = client
        .get(format!("http://{}/v1/bars", harness.relay_bind))
        .query(&[("symbol", "aapl"), ("timeframe", "2Min")])
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status().as_u16(), 400);
    let body: Value = response.json().await.expect("body should be JSON");
    assert_eq!(body["code"], "VALIDATION_ERROR");

    let health: Value = client
        .get(format!("http://{}/healthz", harness.relay_bind))
        .send()
        .await
        .expect("request should succeed")
        .json()
        .await
        .expect("body should be JSON");
    assert_eq!(health["status"], "ok");
    assert_eq!(health["feeds"]["stock"], "disconnected");

    harness.stop().await;
}
