use async_trait::async_trait;

use crate::models::{AssetKind, LiveBar};

use super::ConnectError;

#[derive(Debug)]
pub enum LinkEvent {
    Bars(Vec<LiveBar>),
    Malformed(String),
    Closed(Option<String>),
}

#[async_trait]
pub trait FeedTransport: Send + Sync {
    async fn open(&self, kind: AssetKind) -> Result<Box<dyn FeedLink>, ConnectError>;
}

/// `next_event` must be cancel safe: the feed task races it against commands
/// and shutdown.
#[async_trait]
pub trait FeedLink: Send {
    async fn subscribe(&mut self, symbols: &[String]) -> Result<(), ConnectError>;

    async fn unsubscribe(&mut self, symbols: &[String]) -> Result<(), ConnectError>;

    async fn next_event(&mut self) -> LinkEvent;

    async fn close(&mut self);
}
