//! Credential broker
//!
//! Composition root the host application constructs once and passes to
//! consumers. It owns the token store, the event bus, one
//! [`BearerTokenProvider`] per profile and the client cache, and keeps the
//! cache subscribed to invalidation events.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::client_cache::{
    CacheStatsSnapshot, ClientConnectionCache, ClientFactoryRegistry, CredentialIdentity, ServiceClient,
};
use crate::config::BrokerConfig;
use crate::events::{SubscriptionId, TokenEvent, TokenEventBus};
use crate::retry::RetryPolicy;
use crate::sso::{AccessTokenProvider, BearerTokenProvider, DiskTokenStore, SsoOidcClient, SsoProfile};
use crate::Result;

/// Owner of every credential component
pub struct CredentialBroker {
    config: BrokerConfig,
    storage: Arc<DiskTokenStore>,
    bus: Arc<TokenEventBus>,
    oidc: Arc<dyn AccessTokenProvider>,
    providers: DashMap<String, Arc<BearerTokenProvider>>,
    clients: Arc<ClientConnectionCache>,
    cache_subscription: Mutex<Option<SubscriptionId>>,
}

impl CredentialBroker {
    /// Create a broker talking to AWS SSO OIDC
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be determined or the
    /// HTTP client cannot be built.
    pub fn from_config(config: BrokerConfig, registry: ClientFactoryRegistry) -> Result<Arc<Self>> {
        let storage = Arc::new(DiskTokenStore::new(config.resolved_cache_dir()?));
        let oidc = Arc::new(SsoOidcClient::new(
            config.oidc.clone(),
            Arc::clone(&storage),
            RetryPolicy::new(&config.retry),
        )?);
        Ok(Self::assemble(config, storage, oidc, registry))
    }

    /// Create a broker over a custom [`AccessTokenProvider`]
    ///
    /// # Errors
    ///
    /// Returns an error if the cache directory cannot be determined.
    pub fn new(
        config: BrokerConfig,
        oidc: Arc<dyn AccessTokenProvider>,
        registry: ClientFactoryRegistry,
    ) -> Result<Arc<Self>> {
        let storage = Arc::new(DiskTokenStore::new(config.resolved_cache_dir()?));
        Ok(Self::assemble(config, storage, oidc, registry))
    }

    fn assemble(
        config: BrokerConfig,
        storage: Arc<DiskTokenStore>,
        oidc: Arc<dyn AccessTokenProvider>,
        registry: ClientFactoryRegistry,
    ) -> Arc<Self> {
        let bus = Arc::new(TokenEventBus::new());
        let clients = Arc::new(ClientConnectionCache::new(registry));
        let subscription = bus.subscribe(clients.clone());

        info!(cache_dir = %storage.cache_dir().display(), "Credential broker started");
        Arc::new(Self {
            config,
            storage,
            bus,
            oidc,
            providers: DashMap::new(),
            clients,
            cache_subscription: Mutex::new(Some(subscription)),
        })
    }

    /// Provider for `profile`, created on first use
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`](crate::Error::Storage) if the persisted
    /// token cannot be read.
    pub fn provider(&self, profile: &SsoProfile) -> Result<Arc<BearerTokenProvider>> {
        let id = profile.identifier();
        if let Some(existing) = self.providers.get(id) {
            return Ok(Arc::clone(existing.value()));
        }

        let created = BearerTokenProvider::new(
            profile.clone(),
            Arc::clone(&self.oidc),
            Arc::clone(&self.storage),
            Arc::clone(&self.bus),
            self.config.staleness_margin,
        )?;
        // Another caller may have won the race; keep theirs
        let provider = self
            .providers
            .entry(id.to_string())
            .or_insert(created)
            .value()
            .clone();
        Ok(provider)
    }

    /// Provider registered under `id`, if any
    #[must_use]
    pub fn get_provider(&self, id: &str) -> Option<Arc<BearerTokenProvider>> {
        self.providers.get(id).map(|p| Arc::clone(p.value()))
    }

    /// Identifiers of all providers
    #[must_use]
    pub fn provider_ids(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.key().clone()).collect()
    }

    /// Cached client of type `T`; see [`ClientConnectionCache::get_client`]
    ///
    /// # Errors
    ///
    /// Returns the cache's construction or credential error.
    pub async fn get_client<T: ServiceClient>(
        &self,
        identity: &CredentialIdentity,
        region: &str,
    ) -> Result<Arc<T>> {
        self.clients.get_client::<T>(identity, region).await
    }

    /// Forget an identity: close its clients and drop its provider
    ///
    /// The persisted token is kept; use
    /// [`BearerTokenProvider::invalidate`] to sign out.
    pub fn remove_identity(&self, id: &str) {
        if let Some((_, provider)) = self.providers.remove(id) {
            provider.dispose();
        }
        let closed = self.clients.invalidate(id);
        debug!(identity = %id, clients = closed, "Identity removed");
    }

    /// Dispose every provider and close every client
    pub fn shutdown(&self) {
        for provider in self.providers.iter() {
            provider.dispose();
        }
        self.providers.clear();
        if let Some(subscription) = self.cache_subscription.lock().take() {
            self.bus.unsubscribe(subscription);
        }
        self.clients.clear();
        info!("Credential broker shut down");
    }

    /// Event bus shared by every provider
    #[must_use]
    pub fn bus(&self) -> &Arc<TokenEventBus> {
        &self.bus
    }

    /// Async stream of token events
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<TokenEvent> {
        self.bus.events()
    }

    /// Client cache statistics
    #[must_use]
    pub fn client_stats(&self) -> CacheStatsSnapshot {
        self.clients.stats()
    }

    /// Token store
    #[must_use]
    pub fn storage(&self) -> &Arc<DiskTokenStore> {
        &self.storage
    }

    /// Active configuration
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }
}
