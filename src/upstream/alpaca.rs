use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::{net::TcpStream, time::timeout};
use tokio_tungstenite::{
    connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream,
};

use crate::{
    models::AssetKind,
    normalize::{auth_message, parse_stream_frame, subscription_message, StreamMessage},
};

use super::{
    traits::{FeedLink, FeedTransport, LinkEvent},
    ConnectError,
};

pub const DEFAULT_STOCK_WS_URL: &str = "wss://stream.data.alpaca.markets/v2/iex";
pub const DEFAULT_CRYPTO_WS_URL: &str = "wss://stream.data.alpaca.markets/v1beta3/crypto/us";

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub struct AlpacaFeedTransport {
    stock_url: String,
    crypto_url: String,
    api_key: String,
    secret_key: String,
}

impl AlpacaFeedTransport {
    pub fn new(
        stock_url: impl Into<String>,
        crypto_url: impl Into<String>,
        api_key: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Self {
        Self {
            stock_url: stock_url.into(),
            crypto_url: crypto_url.into(),
            api_key: api_key.into(),
            secret_key: secret_key.into(),
        }
    }

    fn url_for(&self, kind: AssetKind) -> &str {
        match kind {
            AssetKind::Stock => &self.stock_url,
            AssetKind::Crypto => &self.crypto_url,
        }
    }
}

#[async_trait]
impl FeedTransport for AlpacaFeedTransport {
    async fn open(&self, kind: AssetKind) -> Result<Box<dyn FeedLink>, ConnectError> {
        let url = self.url_for(kind);
        let (mut stream, _response) = connect_async(url)
            .await
            .map_err(|err| ConnectError::Transport(format!("{kind} feed connect failed: {err}")))?;

        let handshake = async {
            expect_control(&mut stream, kind, Expected::Connected).await?;
            stream
                .send(Message::Text(
                    auth_message(&self.api_key, &self.secret_key).into(),
                ))
                .await
                .map_err(|err| ConnectError::Transport(format!("failed to send auth: {err}")))?;
            expect_control(&mut stream, kind, Expected::Authenticated).await
        };

        match timeout(HANDSHAKE_TIMEOUT, handshake).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                let _ = stream.close(None).await;
                return Err(err);
            }
            Err(_) => {
                let _ = stream.close(None).await;
                return Err(ConnectError::Transport(format!(
                    "{kind} feed handshake timed out"
                )));
            }
        }

        tracing::info!(kind = %kind, url = %url, "authenticated upstream feed");
        Ok(Box::new(AlpacaFeedLink { kind, stream }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expected {
    Connected,
    Authenticated,
}

async fn expect_control(
    stream: &mut WsStream,
    kind: AssetKind,
    expected: Expected,
) -> Result<(), ConnectError> {
    loop {
        let message = match stream.next().await {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                return Err(ConnectError::Transport(format!(
                    "{kind} feed handshake failed: {err}"
                )))
            }
            None => {
                return Err(ConnectError::Transport(format!(
                    "{kind} feed closed during handshake"
                )))
            }
        };

        let text = match message {
            Message::Text(text) => text.as_str().to_string(),
            Message::Binary(binary) => match String::from_utf8(binary.to_vec()) {
                Ok(text) => text,
                Err(_) => continue,
            },
            Message::Ping(payload) => {
                let _ = stream.send(Message::Pong(payload)).await;
                continue;
            }
            Message::Close(_) => {
                return Err(ConnectError::Transport(format!(
                    "{kind} feed closed during handshake"
                )))
            }
            _ => continue,
        };

        let Ok(items) = parse_stream_frame(&text, kind) else {
            continue;
        };
        for item in items {
            match (item, expected) {
                (StreamMessage::Error { code, message }, _) => {
                    return Err(ConnectError::Rejected(match code {
                        Some(code) => format!("{message} (code {code})"),
                        None => message,
                    }))
                }
                (StreamMessage::Connected, Expected::Connected)
                | (StreamMessage::Authenticated, Expected::Authenticated) => return Ok(()),
                _ => {}
            }
        }
    }
}

struct AlpacaFeedLink {
    kind: AssetKind,
    stream: WsStream,
}

impl AlpacaFeedLink {
    async fn send_action(&mut self, action: &str, symbols: &[String]) -> Result<(), ConnectError> {
        if symbols.is_empty() {
            return Ok(());
        }
        let payload = subscription_message(action, self.kind, symbols);
        self.stream
            .send(Message::Text(payload.into()))
            .await
            .map_err(|err| ConnectError::Transport(format!("failed to send {action}: {err}")))
    }

    fn decode(&self, text: &str) -> Option<LinkEvent> {
        let items = match parse_stream_frame(text, self.kind) {
            Ok(items) => items,
            Err(err) => return Some(LinkEvent::Malformed(err)),
        };

        let mut bars = Vec::new();
        let mut problems = Vec::new();
        for item in items {
            match item {
                StreamMessage::Bar(bar) => bars.push(bar),
                StreamMessage::Malformed(reason) => problems.push(reason),
                StreamMessage::Error { code, message } => {
                    problems.push(format!("provider error {code:?}: {message}"))
                }
                _ => {}
            }
        }

        for problem in &problems {
            tracing::warn!(kind = %self.kind, reason = %problem, "dropping upstream message");
        }

        if bars.is_empty() {
            None
        } else {
            Some(LinkEvent::Bars(bars))
        }
    }
}

#[async_trait]
impl FeedLink for AlpacaFeedLink {
    async fn subscribe(&mut self, symbols: &[String]) -> Result<(), ConnectError> {
        self.send_action("subscribe", symbols).await
    }

    async fn unsubscribe(&mut self, symbols: &[String]) -> Result<(), ConnectError> {
        self.send_action("unsubscribe", symbols).await
    }

    async fn next_event(&mut self) -> LinkEvent {
        loop {
            match self.stream.next().await {
                Some(Ok(Message::Text(text))) => {
                    if let Some(event) = self.decode(text.as_str()) {
                        return event;
                    }
                }
                Some(Ok(Message::Binary(binary))) => match String::from_utf8(binary.to_vec()) {
                    Ok(text) => {
                        if let Some(event) = self.decode(&text) {
                            return event;
                        }
                    }
                    Err(err) => return LinkEvent::Malformed(format!("invalid UTF-8 frame: {err}")),
                },
                Some(Ok(Message::Ping(payload))) => {
                    if let Err(err) = self.stream.send(Message::Pong(payload)).await {
                        return LinkEvent::Closed(Some(err.to_string()));
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    return LinkEvent::Closed(frame.map(|frame| frame.reason.to_string()));
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => return LinkEvent::Closed(Some(err.to_string())),
                None => return LinkEvent::Closed(None),
            }
        }
    }

    async fn close(&mut self) {
        let _ = self.stream.close(None).await;
    }
}
