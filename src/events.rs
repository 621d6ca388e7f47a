//! Credential change notifications
//!
//! The broker owns one [`TokenEventBus`]. Listeners are called synchronously
//! on the publishing thread, so handlers must stay cheap (cache eviction,
//! UI invalidation). Async consumers use [`TokenEventBus::events`] instead.
//!
//! ```
//! use sso_token_broker::events::{TokenEvent, TokenEventBus};
//!
//! # tokio_test::block_on(async {
//! let bus = TokenEventBus::new();
//! let mut events = bus.events();
//! bus.publish(&TokenEvent::CredentialsChanged("dev".into()));
//! assert_eq!(events.recv().await.unwrap().provider_id(), "dev");
//! # });
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::trace;

/// Capacity of the broadcast channel behind [`TokenEventBus::events`]
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// A change to the credentials of one provider
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenEvent {
    /// A new token was stored for the provider
    CredentialsChanged(String),
    /// The provider's token was removed
    CredentialsInvalidated(String),
}

impl TokenEvent {
    /// Identifier of the provider the event is about
    #[must_use]
    pub fn provider_id(&self) -> &str {
        match self {
            Self::CredentialsChanged(id) | Self::CredentialsInvalidated(id) => id,
        }
    }
}

/// Receiver of [`TokenEvent`]s
///
/// Events for unknown identifiers must be ignored.
pub trait BearerTokenProviderListener: Send + Sync {
    /// A provider stored a new token
    fn on_change(&self, _provider_id: &str) {}

    /// A provider's token was invalidated
    fn invalidate(&self, _provider_id: &str) {}
}

/// Handle returned by [`TokenEventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Observer list plus broadcast channel
pub struct TokenEventBus {
    listeners: RwLock<Vec<(SubscriptionId, Arc<dyn BearerTokenProviderListener>)>>,
    next_id: AtomicU64,
    sender: broadcast::Sender<TokenEvent>,
}

impl TokenEventBus {
    /// Create an empty bus
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            listeners: RwLock::new(Vec::new()),
            next_id: AtomicU64::new(1),
            sender,
        }
    }

    /// Register a listener until [`unsubscribe`](Self::unsubscribe)
    pub fn subscribe(&self, listener: Arc<dyn BearerTokenProviderListener>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().push((id, listener));
        id
    }

    /// Remove a listener; returns `false` if it was not registered
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(sid, _)| *sid != id);
        listeners.len() != before
    }

    /// Number of registered listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.listeners.read().len()
    }

    /// Async stream of every published event
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<TokenEvent> {
        self.sender.subscribe()
    }

    /// Deliver `event` to every listener, then to broadcast receivers
    pub fn publish(&self, event: &TokenEvent) {
        // Snapshot so handlers may subscribe or unsubscribe while we deliver
        let snapshot: Vec<_> = self
            .listeners
            .read()
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();

        trace!(event = ?event, listeners = snapshot.len(), "Publishing token event");
        for listener in snapshot {
            match event {
                TokenEvent::CredentialsChanged(id) => listener.on_change(id),
                TokenEvent::CredentialsInvalidated(id) => listener.invalidate(id),
            }
        }

        // No receivers is fine
        let _ = self.sender.send(event.clone());
    }
}

impl Default for TokenEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<TokenEvent>>,
    }

    impl BearerTokenProviderListener for Recorder {
        fn on_change(&self, provider_id: &str) {
            self.seen
                .lock()
                .push(TokenEvent::CredentialsChanged(provider_id.to_string()));
        }

        fn invalidate(&self, provider_id: &str) {
            self.seen
                .lock()
                .push(TokenEvent::CredentialsInvalidated(provider_id.to_string()));
        }
    }

    #[test]
    fn delivers_to_subscribers_in_order() {
        let bus = TokenEventBus::new();
        let recorder = Arc::new(Recorder::default());
        bus.subscribe(recorder.clone());

        bus.publish(&TokenEvent::CredentialsChanged("a".into()));
        bus.publish(&TokenEvent::CredentialsInvalidated("a".into()));

        assert_eq!(
            *recorder.seen.lock(),
            vec![
                TokenEvent::CredentialsChanged("a".into()),
                TokenEvent::CredentialsInvalidated("a".into()),
            ]
        );
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = TokenEventBus::new();
        let recorder = Arc::new(Recorder::default());
        let id = bus.subscribe(recorder.clone());

        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        bus.publish(&TokenEvent::CredentialsChanged("a".into()));

        assert!(recorder.seen.lock().is_empty());
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn listener_may_unsubscribe_itself_during_delivery() {
        struct SelfRemoving {
            bus: Arc<TokenEventBus>,
            id: Mutex<Option<SubscriptionId>>,
        }
        impl BearerTokenProviderListener for SelfRemoving {
            fn on_change(&self, _provider_id: &str) {
                if let Some(id) = self.id.lock().take() {
                    self.bus.unsubscribe(id);
                }
            }
        }

        let bus = Arc::new(TokenEventBus::new());
        let listener = Arc::new(SelfRemoving {
            bus: bus.clone(),
            id: Mutex::new(None),
        });
        let id = bus.subscribe(listener.clone());
        *listener.id.lock() = Some(id);

        bus.publish(&TokenEvent::CredentialsChanged("a".into()));
        assert_eq!(bus.listener_count(), 0);
    }

    #[test]
    fn default_listener_methods_are_no_ops() {
        struct Silent;
        impl BearerTokenProviderListener for Silent {}

        let bus = TokenEventBus::new();
        bus.subscribe(Arc::new(Silent));
        bus.publish(&TokenEvent::CredentialsInvalidated("unknown".into()));
    }

    #[tokio::test]
    async fn broadcast_receivers_see_events() {
        let bus = TokenEventBus::new();
        let mut rx = bus.events();

        bus.publish(&TokenEvent::CredentialsInvalidated("b".into()));

        let event = rx.recv().await.unwrap();
        assert_eq!(event, TokenEvent::CredentialsInvalidated("b".into()));
        assert_eq!(event.provider_id(), "b");
    }
}
