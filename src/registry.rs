use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::{
    models::{LiveBar, SubscriptionKey},
    upstream::{UpstreamControl, UpstreamError},
};

pub type ListenerId = u64;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("listener queue is full")]
    QueueFull,
    #[error("listener is closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("upstream is unavailable for {key}: {source}")]
    Upstream {
        key: SubscriptionKey,
        #[source]
        source: UpstreamError,
    },
}

pub trait BarListener: Send + Sync {
    fn on_bar(&self, bar: &LiveBar) -> Result<(), DeliveryError>;
}

struct Registration {
    listener_id: ListenerId,
    listener: Arc<dyn BarListener>,
}

/// Upstream subscribe/unsubscribe calls are issued while the entry lock is
/// held, so the upstream sees exactly one subscribe per key for as long as
/// the key has listeners.
pub struct SubscriptionRegistry {
    upstream: Arc<dyn UpstreamControl>,
    entries: Mutex<HashMap<SubscriptionKey, Vec<Registration>>>,
}

impl SubscriptionRegistry {
    pub fn new(upstream: Arc<dyn UpstreamControl>) -> Self {
        Self {
            upstream,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn register(
        &self,
        key: &SubscriptionKey,
        listener_id: ListenerId,
        listener: Arc<dyn BarListener>,
    ) -> Result<(), RegistryError> {
        let mut entries = self.entries.lock();

        if let Some(registrations) = entries.get_mut(key) {
            if registrations
                .iter()
                .any(|registration| registration.listener_id == listener_id)
            {
                return Ok(());
            }
            self.upstream
                .ensure_available(key.kind)
                .map_err(|source| RegistryError::Upstream {
                    key: key.clone(),
                    source,
                })?;
            registrations.push(Registration {
                listener_id,
                listener,
            });
            return Ok(());
        }

        self.upstream
            .subscribe(key)
            .map_err(|source| RegistryError::Upstream {
                key: key.clone(),
                source,
            })?;

        entries.insert(
            key.clone(),
            vec![Registration {
                listener_id,
                listener,
            }],
        );
        tracing::info!(key = %key, "opened upstream subscription");
        Ok(())
    }

    pub fn unregister(&self, key: &SubscriptionKey, listener_id: ListenerId) -> bool {
        let mut entries = self.entries.lock();
        let Some(registrations) = entries.get_mut(key) else {
            return false;
        };

        let before = registrations.len();
        registrations.retain(|registration| registration.listener_id != listener_id);
        let removed = registrations.len() != before;

        if registrations.is_empty() {
            entries.remove(key);
            if let Err(err) = self.upstream.unsubscribe(key) {
                tracing::warn!(key = %key, error = %err, "upstream unsubscribe failed");
            } else {
                tracing::info!(key = %key, "closed upstream subscription");
            }
        }

        removed
    }

    pub fn dispatch(&self, bar: &LiveBar) -> usize {
        let key = bar.key();
        let listeners: Vec<(ListenerId, Arc<dyn BarListener>)> = {
            let entries = self.entries.lock();
            match entries.get(&key) {
                Some(registrations) => registrations
                    .iter()
                    .map(|registration| (registration.listener_id, registration.listener.clone()))
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        for (listener_id, listener) in listeners {
            match listener.on_bar(bar) {
                Ok(()) => delivered += 1,
                Err(err) => {
                    tracing::warn!(key = %key, listener_id, error = %err, "bar delivery failed");
                }
            }
        }
        delivered
    }

    pub async fn run_dispatch(self: Arc<Self>, mut bars: mpsc::Receiver<LiveBar>) {
        while let Some(bar) = bars.recv().await {
            self.dispatch(&bar);
        }
        tracing::debug!("bar dispatch loop finished");
    }

    pub fn listener_count(&self, key: &SubscriptionKey) -> usize {
        self.entries.lock().get(key).map_or(0, Vec::len)
    }

    pub fn has_listener(&self, listener_id: ListenerId) -> bool {
        self.entries.lock().values().any(|registrations| {
            registrations
                .iter()
                .any(|registration| registration.listener_id == listener_id)
        })
    }

    pub fn active_keys(&self) -> Vec<SubscriptionKey> {
        let mut keys: Vec<SubscriptionKey> = self.entries.lock().keys().cloned().collect();
        keys.sort();
        keys
    }
}
