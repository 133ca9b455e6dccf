pub mod alpaca;
pub mod traits;

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::{
    sync::{
        broadcast,
        mpsc::{self, error::TrySendError},
        watch,
    },
    task::JoinHandle,
    time::sleep,
};

use crate::models::{AssetKind, LiveBar, SubscriptionKey};

use self::traits::{FeedLink, FeedTransport, LinkEvent};

const BAR_QUEUE_CAPACITY: usize = 4_096;
const NOTICE_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    #[error("upstream transport error: {0}")]
    Transport(String),
    #[error("upstream rejected the connection: {0}")]
    Rejected(String),
    #[error("{kind} feed gave up after {attempts} reconnection attempts")]
    RetriesExhausted { kind: AssetKind, attempts: u32 },
    #[error("upstream connector is shut down")]
    ShutDown,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpstreamError {
    #[error("{kind} feed is {state:?}")]
    FeedUnavailable {
        kind: AssetKind,
        state: ConnectionState,
    },
    #[error("upstream connector is shut down")]
    ShutDown,
}

/// Calls are made while the registry lock is held, so they must not block.
pub trait UpstreamControl: Send + Sync {
    fn ensure_available(&self, kind: AssetKind) -> Result<(), UpstreamError>;
    fn subscribe(&self, key: &SubscriptionKey) -> Result<(), UpstreamError>;
    fn unsubscribe(&self, key: &SubscriptionKey) -> Result<(), UpstreamError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(1_000),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectDecision {
    Retry { attempt: u32, delay: Duration },
    Exhausted,
    Suppressed,
}

#[derive(Debug, Clone)]
pub struct ReconnectTracker {
    policy: ReconnectPolicy,
    attempts: u32,
    exhausted: bool,
}

impl ReconnectTracker {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            exhausted: false,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_connected(&mut self) {
        self.attempts = 0;
    }

    pub fn on_unexpected_disconnect(&mut self, intentional: bool) -> ReconnectDecision {
        if intentional {
            return ReconnectDecision::Suppressed;
        }
        if self.exhausted || self.attempts >= self.policy.max_attempts {
            self.exhausted = true;
            return ReconnectDecision::Exhausted;
        }

        self.attempts += 1;
        ReconnectDecision::Retry {
            attempt: self.attempts,
            delay: self.policy.delay_for(self.attempts),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedStatus {
    pub state: ConnectionState,
    pub failure: Option<ConnectError>,
    pub connections: u64,
}

impl FeedStatus {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            failure: None,
            connections: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorNotice {
    Connected { kind: AssetKind },
    Reconnecting { kind: AssetKind, attempt: u32 },
    Degraded { kind: AssetKind, message: String },
}

#[derive(Debug)]
enum FeedCommand {
    Subscribe(String),
    Unsubscribe(String),
}

struct FeedHandle {
    commands: mpsc::UnboundedSender<FeedCommand>,
    command_receiver: Mutex<Option<mpsc::UnboundedReceiver<FeedCommand>>>,
    status: watch::Sender<FeedStatus>,
}

impl FeedHandle {
    fn new() -> Self {
        let (commands, command_receiver) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(FeedStatus::initial());
        Self {
            commands,
            command_receiver: Mutex::new(Some(command_receiver)),
            status,
        }
    }
}

struct ConnectorInner {
    transport: Arc<dyn FeedTransport>,
    policy: ReconnectPolicy,
    intentional: AtomicBool,
    shutdown: watch::Sender<bool>,
    bars: mpsc::Sender<LiveBar>,
    notices: broadcast::Sender<ConnectorNotice>,
    stock: FeedHandle,
    crypto: FeedHandle,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct UpstreamConnector {
    inner: Arc<ConnectorInner>,
}

impl UpstreamConnector {
    pub fn new(
        transport: Arc<dyn FeedTransport>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::Receiver<LiveBar>) {
        let (bars, bar_receiver) = mpsc::channel(BAR_QUEUE_CAPACITY);
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        let (shutdown, _) = watch::channel(false);

        let inner = ConnectorInner {
            transport,
            policy,
            intentional: AtomicBool::new(false),
            shutdown,
            bars,
            notices,
            stock: FeedHandle::new(),
            crypto: FeedHandle::new(),
            tasks: Mutex::new(Vec::new()),
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            bar_receiver,
        )
    }

    fn feed(&self, kind: AssetKind) -> &FeedHandle {
        match kind {
            AssetKind::Stock => &self.inner.stock,
            AssetKind::Crypto => &self.inner.crypto,
        }
    }

    pub async fn connect(&self) -> Result<(), ConnectError> {
        if self.inner.intentional.load(Ordering::SeqCst) {
            return Err(ConnectError::ShutDown);
        }

        self.start_feeds();

        let (stock, crypto) = tokio::join!(
            self.wait_connected(AssetKind::Stock),
            self.wait_connected(AssetKind::Crypto)
        );
        stock?;
        crypto
    }

    fn start_feeds(&self) {
        let mut tasks = self.inner.tasks.lock();
        for kind in AssetKind::ALL {
            let feed = self.feed(kind);
            let Some(commands) = feed.command_receiver.lock().take() else {
                continue;
            };

            let actor = FeedActor {
                kind,
                inner: self.inner.clone(),
                commands,
                shutdown: self.inner.shutdown.subscribe(),
                desired: BTreeSet::new(),
            };
            tasks.push(tokio::spawn(actor.run()));
        }
    }

    async fn wait_connected(&self, kind: AssetKind) -> Result<(), ConnectError> {
        let mut status = self.feed(kind).status.subscribe();
        loop {
            {
                let current = status.borrow_and_update();
                if let Some(failure) = &current.failure {
                    return Err(failure.clone());
                }
                if current.connections > 0 && current.state == ConnectionState::Connected {
                    return Ok(());
                }
            }

            if status.changed().await.is_err() {
                return Err(ConnectError::ShutDown);
            }
        }
    }

    /// Stops both feeds. The intentional flag is raised before any link is
    /// closed so the feed tasks never treat the close as a disconnect.
    pub async fn shutdown(&self) {
        self.inner.intentional.store(true, Ordering::SeqCst);
        self.inner.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "upstream feed task ended abnormally");
            }
        }

        for kind in AssetKind::ALL {
            self.feed(kind).status.send_modify(|status| {
                status.state = ConnectionState::Disconnected;
                status.failure.get_or_insert(ConnectError::ShutDown);
            });
        }
        tracing::info!("upstream connector shut down");
    }

    pub fn state(&self, kind: AssetKind) -> ConnectionState {
        self.feed(kind).status.borrow().state
    }

    pub fn failure(&self, kind: AssetKind) -> Option<ConnectError> {
        self.feed(kind).status.borrow().failure.clone()
    }

    pub fn status_receiver(&self, kind: AssetKind) -> watch::Receiver<FeedStatus> {
        self.feed(kind).status.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<ConnectorNotice> {
        self.inner.notices.subscribe()
    }

    fn send_command(&self, kind: AssetKind, command: FeedCommand) -> Result<(), UpstreamError> {
        self.feed(kind)
            .commands
            .send(command)
            .map_err(|_| UpstreamError::ShutDown)
    }
}

impl UpstreamControl for UpstreamConnector {
    fn ensure_available(&self, kind: AssetKind) -> Result<(), UpstreamError> {
        if self.inner.intentional.load(Ordering::SeqCst) {
            return Err(UpstreamError::ShutDown);
        }
        let state = self.state(kind);
        if state != ConnectionState::Connected {
            return Err(UpstreamError::FeedUnavailable { kind, state });
        }
        Ok(())
    }

    fn subscribe(&self, key: &SubscriptionKey) -> Result<(), UpstreamError> {
        self.ensure_available(key.kind)?;
        self.send_command(key.kind, FeedCommand::Subscribe(key.symbol.clone()))
    }

    fn unsubscribe(&self, key: &SubscriptionKey) -> Result<(), UpstreamError> {
        self.send_command(key.kind, FeedCommand::Unsubscribe(key.symbol.clone()))
    }
}

enum LinkOutcome {
    Stop,
    Lost(String),
}

struct FeedActor {
    kind: AssetKind,
    inner: Arc<ConnectorInner>,
    commands: mpsc::UnboundedReceiver<FeedCommand>,
    shutdown: watch::Receiver<bool>,
    desired: BTreeSet<String>,
}

impl FeedActor {
    fn status(&self) -> &watch::Sender<FeedStatus> {
        match self.kind {
            AssetKind::Stock => &self.inner.stock.status,
            AssetKind::Crypto => &self.inner.crypto.status,
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.status().send_modify(|status| status.state = state);
    }

    fn notify(&self, notice: ConnectorNotice) {
        let _ = self.inner.notices.send(notice);
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown.borrow()
    }

    async fn run(mut self) {
        let mut tracker = ReconnectTracker::new(self.inner.policy);

        loop {
            if self.is_shutting_down() {
                break;
            }

            self.set_state(if tracker.attempts() == 0 {
                ConnectionState::Connecting
            } else {
                ConnectionState::Reconnecting
            });

            let opened = tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                    continue;
                }
                opened = self.inner.transport.open(self.kind) => opened,
            };

            match opened {
                Ok(link) => {
                    tracker.on_connected();
                    self.status().send_modify(|status| {
                        status.state = ConnectionState::Connected;
                        status.failure = None;
                        status.connections += 1;
                    });
                    self.notify(ConnectorNotice::Connected { kind: self.kind });
                    tracing::info!(kind = %self.kind, symbols = self.desired.len(), "upstream feed connected");

                    match self.drive(link).await {
                        LinkOutcome::Stop => break,
                        LinkOutcome::Lost(reason) => {
                            tracing::warn!(kind = %self.kind, reason = %reason, "upstream feed disconnected");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(kind = %self.kind, attempt = tracker.attempts(), error = %err, "upstream feed connect failed");
                }
            }

            match tracker.on_unexpected_disconnect(self.inner.intentional.load(Ordering::SeqCst)) {
                ReconnectDecision::Suppressed => break,
                ReconnectDecision::Exhausted => {
                    let failure = ConnectError::RetriesExhausted {
                        kind: self.kind,
                        attempts: self.inner.policy.max_attempts,
                    };
                    tracing::error!(kind = %self.kind, error = %failure, "upstream feed degraded");
                    self.status().send_modify(|status| {
                        status.state = ConnectionState::Disconnected;
                        status.failure = Some(failure.clone());
                    });
                    self.notify(ConnectorNotice::Degraded {
                        kind: self.kind,
                        message: failure.to_string(),
                    });
                    return;
                }
                ReconnectDecision::Retry { attempt, delay } => {
                    self.set_state(ConnectionState::Reconnecting);
                    self.notify(ConnectorNotice::Reconnecting {
                        kind: self.kind,
                        attempt,
                    });
                    tracing::info!(kind = %self.kind, attempt, delay_ms = delay.as_millis() as u64, "scheduling upstream reconnect");
                    if !self.back_off(delay).await {
                        break;
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
    }

    async fn drive(&mut self, mut link: Box<dyn FeedLink>) -> LinkOutcome {
        if !self.desired.is_empty() {
            let symbols: Vec<String> = self.desired.iter().cloned().collect();
            if let Err(err) = link.subscribe(&symbols).await {
                link.close().await;
                return LinkOutcome::Lost(err.to_string());
            }
        }

        loop {
            tokio::select! {
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        link.close().await;
                        return LinkOutcome::Stop;
                    }
                }
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        link.close().await;
                        return LinkOutcome::Stop;
                    };
                    if let Err(err) = self.apply_command(link.as_mut(), command).await {
                        link.close().await;
                        return LinkOutcome::Lost(err.to_string());
                    }
                }
                event = link.next_event() => match event {
                    LinkEvent::Bars(bars) => {
                        for bar in bars {
                            self.forward(bar);
                        }
                    }
                    LinkEvent::Malformed(reason) => {
                        tracing::warn!(kind = %self.kind, reason = %reason, "dropping malformed upstream frame");
                    }
                    LinkEvent::Closed(reason) => {
                        return LinkOutcome::Lost(
                            reason.unwrap_or_else(|| "connection closed".to_string()),
                        );
                    }
                },
            }
        }
    }

    async fn apply_command(
        &mut self,
        link: &mut dyn FeedLink,
        command: FeedCommand,
    ) -> Result<(), ConnectError> {
        match command {
            FeedCommand::Subscribe(symbol) => {
                if self.desired.insert(symbol.clone()) {
                    tracing::debug!(kind = %self.kind, symbol = %symbol, "subscribing upstream");
                    link.subscribe(&[symbol]).await?;
                }
            }
            FeedCommand::Unsubscribe(symbol) => {
                if self.desired.remove(&symbol) {
                    tracing::debug!(kind = %self.kind, symbol = %symbol, "unsubscribing upstream");
                    link.unsubscribe(&[symbol]).await?;
                }
            }
        }
        Ok(())
    }

    fn record_command(&mut self, command: FeedCommand) {
        match command {
            FeedCommand::Subscribe(symbol) => {
                self.desired.insert(symbol);
            }
            FeedCommand::Unsubscribe(symbol) => {
                self.desired.remove(&symbol);
            }
        }
    }

    fn forward(&self, bar: LiveBar) {
        match self.inner.bars.try_send(bar) {
            Ok(()) => {}
            Err(TrySendError::Full(bar)) => {
                tracing::warn!(kind = %self.kind, symbol = %bar.symbol, "bar queue is full; dropping bar");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    async fn back_off(&mut self, delay: Duration) -> bool {
        let timer = sleep(delay);
        tokio::pin!(timer);

        loop {
            tokio::select! {
                _ = &mut timer => return true,
                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        return false;
                    }
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.record_command(command),
                    None => return false,
                },
            }
        }
    }
}
