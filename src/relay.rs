use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{error::TrySendError, Sender};

use crate::{
    models::{AssetKind, Bar, BarSource, LiveBar, SubscriptionKey},
    registry::{BarListener, DeliveryError, ListenerId, SubscriptionRegistry},
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum RelayMessage {
    Bar {
        symbol: String,
        kind: AssetKind,
        bar: Bar,
        source: BarSource,
    },
    Connected {
        message: String,
    },
    Error {
        message: String,
    },
    Subscribed {
        symbol: String,
        kind: AssetKind,
    },
    Unsubscribed {
        symbol: String,
        kind: AssetKind,
    },
    Pong,
}

impl RelayMessage {
    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }

    fn from_live(bar: &LiveBar) -> Self {
        Self::Bar {
            symbol: bar.symbol.clone(),
            kind: bar.kind,
            bar: bar.bar,
            source: bar.source,
        }
    }
}

struct RelayInner {
    registry: Arc<SubscriptionRegistry>,
    next_session_id: AtomicU64,
    open_sessions: AtomicUsize,
}

#[derive(Clone)]
pub struct RelayServer {
    inner: Arc<RelayInner>,
}

impl RelayServer {
    pub fn new(registry: Arc<SubscriptionRegistry>) -> Self {
        Self {
            inner: Arc::new(RelayInner {
                registry,
                next_session_id: AtomicU64::new(1),
                open_sessions: AtomicUsize::new(0),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.inner.registry
    }

    pub fn open_sessions(&self) -> usize {
        self.inner.open_sessions.load(Ordering::SeqCst)
    }

    pub fn open_session(&self, outgoing: Sender<RelayMessage>) -> ViewerSession {
        let id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);
        self.inner.open_sessions.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(session_id = id, "viewer session opened");

        ViewerSession {
            id,
            relay: self.inner.clone(),
            listener: Arc::new(SessionListener {
                session_id: id,
                outgoing,
            }),
            subscriptions: HashSet::new(),
        }
    }
}

/// One viewer connection. Dropping the session unregisters every one of its
/// subscriptions before the drop returns.
pub struct ViewerSession {
    id: ListenerId,
    relay: Arc<RelayInner>,
    listener: Arc<SessionListener>,
    subscriptions: HashSet<SubscriptionKey>,
}

impl ViewerSession {
    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn is_subscribed(&self, key: &SubscriptionKey) -> bool {
        self.subscriptions.contains(key)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn subscribe(&mut self, key: SubscriptionKey) -> RelayMessage {
        if !self.subscriptions.contains(&key) {
            if let Err(err) =
                self.relay
                    .registry
                    .register(&key, self.id, self.listener.clone())
            {
                tracing::warn!(session_id = self.id, key = %key, error = %err, "viewer subscribe failed");
                return RelayMessage::error(format!(
                    "Real-time data not available for {}",
                    key.symbol
                ));
            }
            tracing::debug!(session_id = self.id, key = %key, "viewer subscribed");
            self.subscriptions.insert(key.clone());
        }

        RelayMessage::Subscribed {
            symbol: key.symbol,
            kind: key.kind,
        }
    }

    pub fn unsubscribe(&mut self, key: SubscriptionKey) -> RelayMessage {
        if self.subscriptions.remove(&key) {
            self.relay.registry.unregister(&key, self.id);
            tracing::debug!(session_id = self.id, key = %key, "viewer unsubscribed");
        }

        RelayMessage::Unsubscribed {
            symbol: key.symbol,
            kind: key.kind,
        }
    }

    pub fn close(self) {}

    fn teardown(&mut self) {
        for key in self.subscriptions.drain() {
            self.relay.registry.unregister(&key, self.id);
        }
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        let subscriptions = self.subscriptions.len();
        self.teardown();
        self.relay.open_sessions.fetch_sub(1, Ordering::SeqCst);
        tracing::debug!(session_id = self.id, subscriptions, "viewer session closed");
    }
}

struct SessionListener {
    session_id: ListenerId,
    outgoing: Sender<RelayMessage>,
}

impl BarListener for SessionListener {
    fn on_bar(&self, bar: &LiveBar) -> Result<(), DeliveryError> {
        match self.outgoing.try_send(RelayMessage::from_live(bar)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                tracing::warn!(session_id = self.session_id, symbol = %bar.symbol, "viewer queue is full; dropping bar");
                Err(DeliveryError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(DeliveryError::Closed),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use serde_json::json;
    use tokio::sync::mpsc::channel;

    use super::*;
    use crate::registry::tests::CountingUpstream;

    fn relay_with_upstream() -> (RelayServer, Arc<CountingUpstream>) {
        let upstream = Arc::new(CountingUpstream::default());
        let registry = Arc::new(SubscriptionRegistry::new(upstream.clone()));
        (RelayServer::new(registry), upstream)
    }

    fn live(symbol: &str, time: i64) -> LiveBar {
        LiveBar {
            symbol: symbol.to_string(),
            kind: AssetKind::Stock,
            bar: Bar {
                time,
                open: 1.0,
                high: 2.0,
                low: 0.5,
                close: 1.5,
                volume: 10.0,
            },
            source: BarSource::Bar,
        }
    }

    #[test]
    fn resubscribing_same_key_keeps_one_registration() {
        let (relay, upstream) = relay_with_upstream();
        let (sender, _receiver) = channel(8);
        let mut session = relay.open_session(sender);
        let key = SubscriptionKey::new("AAPL", AssetKind::Stock);

        assert!(matches!(
            session.subscribe(key.clone()),
            RelayMessage::Subscribed { .. }
        ));
        assert!(matches!(
            session.subscribe(key.clone()),
            RelayMessage::Subscribed { .. }
        ));

        assert_eq!(relay.registry().listener_count(&key), 1);
        assert_eq!(upstream.subscribe_calls.load(Ordering::SeqCst), 1);
        assert_eq!(session.subscription_count(), 1);
    }

    #[test]
    fn dropping_session_unregisters_every_subscription() {
        let (relay, upstream) = relay_with_upstream();
        let (first_sender, _first_receiver) = channel(8);
        let (second_sender, _second_receiver) = channel(8);
        let mut first = relay.open_session(first_sender);
        let mut second = relay.open_session(second_sender);
        let first_id = first.id();

        let aapl = SubscriptionKey::new("AAPL", AssetKind::Stock);
        let btc = SubscriptionKey::new("BTC/USD", AssetKind::Crypto);
        first.subscribe(aapl.clone());
        first.subscribe(btc.clone());
        second.subscribe(aapl.clone());

        drop(first);

        assert!(!relay.registry().has_listener(first_id));
        assert_eq!(relay.registry().listener_count(&aapl), 1);
        assert_eq!(relay.registry().listener_count(&btc), 0);
        assert_eq!(upstream.net(&aapl), 1);
        assert_eq!(upstream.net(&btc), 0);
        assert_eq!(relay.open_sessions(), 1);

        second.close();
        assert!(relay.registry().active_keys().is_empty());
        assert_eq!(upstream.net(&aapl), 0);
        assert_eq!(relay.open_sessions(), 0);
    }

    #[test]
    fn unavailable_upstream_is_a_recoverable_notice() {
        let (relay, upstream) = relay_with_upstream();
        let (sender, _receiver) = channel(8);
        let mut session = relay.open_session(sender);

        upstream.unavailable.store(true, Ordering::SeqCst);
        let reply = session.subscribe(SubscriptionKey::new("TSLA", AssetKind::Stock));
        assert_eq!(
            reply,
            RelayMessage::error("Real-time data not available for TSLA")
        );
        assert_eq!(session.subscription_count(), 0);

        upstream.unavailable.store(false, Ordering::SeqCst);
        let reply = session.subscribe(SubscriptionKey::new("TSLA", AssetKind::Stock));
        assert!(matches!(reply, RelayMessage::Subscribed { .. }));
    }

    #[test]
    fn joining_a_held_key_while_upstream_is_down_reports_unavailable() {
        let (relay, upstream) = relay_with_upstream();
        let (first_sender, _first_receiver) = channel(8);
        let (second_sender, _second_receiver) = channel(8);
        let mut first = relay.open_session(first_sender);
        let mut second = relay.open_session(second_sender);
        let aapl = SubscriptionKey::new("AAPL", AssetKind::Stock);

        assert!(matches!(
            first.subscribe(aapl.clone()),
            RelayMessage::Subscribed { .. }
        ));

        upstream.unavailable.store(true, Ordering::SeqCst);
        assert_eq!(
            second.subscribe(SubscriptionKey::new("MSFT", AssetKind::Stock)),
            RelayMessage::error("Real-time data not available for MSFT")
        );
        assert_eq!(
            second.subscribe(aapl.clone()),
            RelayMessage::error("Real-time data not available for AAPL")
        );
        assert_eq!(second.subscription_count(), 0);
        assert!(!relay.registry().has_listener(second.id()));
        assert_eq!(relay.registry().listener_count(&aapl), 1);

        assert!(matches!(
            first.subscribe(aapl.clone()),
            RelayMessage::Subscribed { .. }
        ));

        upstream.unavailable.store(false, Ordering::SeqCst);
        assert!(matches!(
            second.subscribe(aapl.clone()),
            RelayMessage::Subscribed { .. }
        ));
        assert_eq!(relay.registry().listener_count(&aapl), 2);
        assert_eq!(upstream.subscribe_calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn full_viewer_queue_does_not_block_other_sessions() {
        let (relay, _upstream) = relay_with_upstream();
        let (slow_sender, _slow_receiver) = channel(1);
        let (fast_sender, mut fast_receiver) = channel(8);
        let mut slow = relay.open_session(slow_sender);
        let mut fast = relay.open_session(fast_sender);
        let key = SubscriptionKey::new("AAPL", AssetKind::Stock);
        slow.subscribe(key.clone());
        fast.subscribe(key.clone());

        assert_eq!(relay.registry().dispatch(&live("AAPL", 60)), 2);
        assert_eq!(relay.registry().dispatch(&live("AAPL", 120)), 1);

        let mut times = Vec::new();
        while let Ok(RelayMessage::Bar { bar, .. }) = fast_receiver.try_recv() {
            times.push(bar.time);
        }
        assert_eq!(times, vec![60, 120]);
    }

    #[test]
    fn bar_message_serializes_with_type_tag() {
        let encoded = serde_json::to_value(RelayMessage::from_live(&live("AAPL", 60)))
            .expect("message should encode");
        assert_eq!(
            encoded,
            json!({
                "type": "bar",
                "symbol": "AAPL",
                "kind": "stock",
                "bar": {"time": 60, "open": 1.0, "high": 2.0, "low": 0.5, "close": 1.5, "volume": 10.0},
                "source": "bar"
            })
        );
    }
}
