//! Service client cache
//!
//! Clients are keyed by `(identity, region, client type)` and built on first
//! use through a [`ClientFactoryRegistry`]. Entries live until their identity
//! is invalidated or removed; there is no TTL or size bound.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::events::BearerTokenProviderListener;
use crate::sso::{AccessToken, BearerTokenProvider};
use crate::{Error, Result};

/// Tag identifying a kind of service client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientType(pub &'static str);

impl fmt::Display for ClientType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A client the cache can hold
pub trait ServiceClient: Send + Sync + 'static {
    /// Tag the client is registered and cached under
    const CLIENT_TYPE: ClientType;

    /// Release connection pools; called once when the entry is evicted
    fn close(&self) {}
}

/// Long-lived access keys
#[derive(Clone, PartialEq, Eq)]
pub struct StaticCredentials {
    /// Access key id
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Session token for temporary credentials
    pub session_token: Option<String>,
}

impl fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field("session_token", &self.session_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Who a client acts as
#[derive(Clone)]
pub enum CredentialIdentity {
    /// SSO bearer token identity
    Bearer(Arc<BearerTokenProvider>),
    /// Static access keys under a caller-chosen id
    Static {
        /// Identity id used in cache keys
        id: String,
        /// The keys
        credentials: StaticCredentials,
    },
}

impl CredentialIdentity {
    /// Identity id used in cache keys
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Bearer(provider) => provider.id(),
            Self::Static { id, .. } => id,
        }
    }

    async fn resolve(&self) -> Result<ClientCredentials> {
        match self {
            Self::Bearer(provider) => {
                let token = provider.resolve_token().await?;
                Ok(ClientCredentials::Bearer {
                    provider: Arc::clone(provider),
                    initial: token,
                })
            }
            Self::Static { credentials, .. } => Ok(ClientCredentials::Static(credentials.clone())),
        }
    }
}

impl fmt::Debug for CredentialIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bearer(provider) => f.debug_tuple("Bearer").field(&provider.id()).finish(),
            Self::Static { id, .. } => f.debug_struct("Static").field("id", id).finish_non_exhaustive(),
        }
    }
}

/// Credentials handed to a client factory
///
/// Bearer credentials keep the provider so a long-lived client can fetch a
/// current token for every request.
#[derive(Clone)]
pub enum ClientCredentials {
    /// SSO bearer token
    Bearer {
        /// Provider to resolve fresh tokens from
        provider: Arc<BearerTokenProvider>,
        /// Token resolved when the client was built
        initial: Arc<AccessToken>,
    },
    /// Static access keys
    Static(StaticCredentials),
}

impl ClientCredentials {
    /// Current bearer token, refreshing if needed
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for static credentials, or the provider's
    /// resolve error.
    pub async fn bearer_token(&self) -> Result<Arc<AccessToken>> {
        match self {
            Self::Bearer { provider, .. } => provider.resolve_token().await,
            Self::Static(_) => Err(Error::Config(
                "Static credentials have no bearer token".to_string(),
            )),
        }
    }
}

impl fmt::Debug for ClientCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bearer { provider, initial } => f
                .debug_struct("Bearer")
                .field("provider", &provider.id())
                .field("initial", initial)
                .finish(),
            Self::Static(credentials) => f.debug_tuple("Static").field(credentials).finish(),
        }
    }
}

/// Input to a client factory
#[derive(Debug, Clone)]
pub struct ClientContext {
    /// Identity id
    pub identity_id: String,
    /// Target region
    pub region: String,
    /// Resolved credentials
    pub credentials: ClientCredentials,
}

/// Cache key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientCacheKey {
    /// Identity id
    pub identity_id: String,
    /// Region
    pub region: String,
    /// Client type tag
    pub client_type: ClientType,
}

// ── Factory registry ──────────────────────────────────────────────────────

trait Closeable: Send + Sync {
    fn close(&self);
}

impl<T: ServiceClient> Closeable for T {
    fn close(&self) {
        ServiceClient::close(self);
    }
}

/// A built client, type-erased
#[derive(Clone)]
struct CachedClient {
    client: Arc<dyn Any + Send + Sync>,
    closer: Arc<dyn Closeable>,
}

/// Cache entry for one key; the client inside is built at most once
#[derive(Default)]
struct Slot {
    cell: OnceCell<CachedClient>,
    /// Set once the slot has left the cache
    evicted: Mutex<bool>,
    closed: AtomicBool,
}

impl Slot {
    /// Close the built client unless already closed
    fn close(&self) -> bool {
        match self.cell.get() {
            Some(cached) if !self.closed.swap(true, Ordering::SeqCst) => {
                cached.closer.close();
                true
            }
            _ => false,
        }
    }

    /// Mark the slot evicted and close its client if one is built
    fn evict(&self) -> bool {
        let mut evicted = self.evicted.lock();
        *evicted = true;
        self.close()
    }

    /// Called after construction: a slot evicted mid-build closes the
    /// client nobody else will
    fn close_if_evicted(&self) -> bool {
        let evicted = self.evicted.lock();
        if *evicted {
            self.close();
        }
        *evicted
    }
}

type ErasedFactory = Arc<dyn Fn(&ClientContext) -> Result<CachedClient> + Send + Sync>;

/// Maps client type tags to constructors
#[derive(Default, Clone)]
pub struct ClientFactoryRegistry {
    factories: HashMap<ClientType, ErasedFactory>,
}

impl ClientFactoryRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the constructor for `T`, replacing any previous one
    pub fn register<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: ServiceClient,
        F: Fn(&ClientContext) -> Result<T> + Send + Sync + 'static,
    {
        let erased: ErasedFactory = Arc::new(move |context: &ClientContext| {
            let client = Arc::new(factory(context)?);
            Ok(CachedClient {
                client: client.clone(),
                closer: client,
            })
        });
        self.factories.insert(T::CLIENT_TYPE, erased);
        self
    }

    /// Whether a constructor for `client_type` is registered
    #[must_use]
    pub fn contains(&self, client_type: ClientType) -> bool {
        self.factories.contains_key(&client_type)
    }

    fn get(&self, client_type: ClientType) -> Option<ErasedFactory> {
        self.factories.get(&client_type).cloned()
    }
}

impl fmt::Debug for ClientFactoryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

// ── Cache ─────────────────────────────────────────────────────────────────

/// Cache statistics tracked atomically
#[derive(Debug, Default)]
pub struct CacheStats {
    /// Lookups served from an existing client
    pub hits: AtomicU64,
    /// Lookups that built a client
    pub misses: AtomicU64,
    /// Clients closed by invalidation or clear
    pub evictions: AtomicU64,
}

impl CacheStats {
    /// Current hit count
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Current miss count
    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    /// Current eviction count
    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Hit rate (0.0-1.0)
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let hits = self.hits();
        let total = hits + self.misses();
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

/// Snapshot of cache statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct CacheStatsSnapshot {
    /// Lookups served from an existing client
    pub hits: u64,
    /// Lookups that built a client
    pub misses: u64,
    /// Clients closed
    pub evictions: u64,
    /// Number of live clients
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

/// Keyed cache of service clients
pub struct ClientConnectionCache {
    registry: ClientFactoryRegistry,
    entries: DashMap<ClientCacheKey, Arc<Slot>>,
    stats: CacheStats,
}

impl ClientConnectionCache {
    /// Create a cache over `registry`
    #[must_use]
    pub fn new(registry: ClientFactoryRegistry) -> Self {
        Self {
            registry,
            entries: DashMap::new(),
            stats: CacheStats::default(),
        }
    }

    /// Client of type `T` for `identity` in `region`
    ///
    /// Concurrent misses on one key build the client once.
    ///
    /// # Errors
    ///
    /// - [`Error::ClientConstruction`] if no factory is registered for `T`,
    ///   the factory fails, or the identity was invalidated while the client
    ///   was being built (the client is closed)
    /// - the credential resolve error on a miss
    pub async fn get_client<T: ServiceClient>(
        &self,
        identity: &CredentialIdentity,
        region: &str,
    ) -> Result<Arc<T>> {
        let key = ClientCacheKey {
            identity_id: identity.id().to_string(),
            region: region.to_string(),
            client_type: T::CLIENT_TYPE,
        };

        let factory = self.registry.get(T::CLIENT_TYPE).ok_or_else(|| {
            Error::ClientConstruction(format!("No factory registered for {}", T::CLIENT_TYPE))
        })?;

        let slot = Arc::clone(&self.entries.entry(key.clone()).or_default());
        if let Some(cached) = slot.cell.get() {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            return downcast(cached, &key);
        }

        let built = slot
            .cell
            .get_or_try_init(|| async {
                self.stats.misses.fetch_add(1, Ordering::Relaxed);
                let credentials = identity.resolve().await?;
                let context = ClientContext {
                    identity_id: key.identity_id.clone(),
                    region: key.region.clone(),
                    credentials,
                };
                let client = factory(&context)?;
                debug!(
                    identity = %key.identity_id,
                    region = %key.region,
                    client_type = %key.client_type,
                    "Built service client"
                );
                Ok::<_, Error>(client)
            })
            .await;

        let cached = match built {
            Ok(cached) => cached,
            Err(e) => {
                // Drop the empty slot unless another caller is still waiting on it
                self.entries.remove_if(&key, |_, s| {
                    Arc::ptr_eq(s, &slot) && !s.cell.initialized() && Arc::strong_count(s) == 2
                });
                return Err(e);
            }
        };

        if slot.close_if_evicted() {
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
            warn!(
                identity = %key.identity_id,
                client_type = %key.client_type,
                "Client invalidated while being built"
            );
            return Err(Error::ClientConstruction(format!(
                "{} client for {} was invalidated while being built",
                key.client_type, key.identity_id
            )));
        }

        downcast(cached, &key)
    }

    /// Evict and close every client of `identity_id`; returns how many
    pub fn invalidate(&self, identity_id: &str) -> usize {
        let keys: Vec<ClientCacheKey> = self
            .entries
            .iter()
            .filter(|entry| entry.key().identity_id == identity_id)
            .map(|entry| entry.key().clone())
            .collect();

        let closed = self.evict(keys);
        if closed > 0 {
            info!(identity = %identity_id, clients = closed, "Evicted service clients");
        }
        closed
    }

    /// Evict and close every client
    pub fn clear(&self) {
        let keys: Vec<ClientCacheKey> = self.entries.iter().map(|e| e.key().clone()).collect();
        let closed = self.evict(keys);
        debug!(clients = closed, "Cleared client cache");
    }

    /// Number of built clients
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.value().cell.initialized())
            .count()
    }

    /// Whether no clients are built
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get cache statistics
    #[must_use]
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            hits: self.stats.hits(),
            misses: self.stats.misses(),
            evictions: self.stats.evictions(),
            size: self.len(),
            hit_rate: self.stats.hit_rate(),
        }
    }

    fn evict(&self, keys: Vec<ClientCacheKey>) -> usize {
        let mut closed = 0;
        for key in keys {
            if let Some((_, slot)) = self.entries.remove(&key)
                && slot.evict()
            {
                closed += 1;
            }
        }
        self.stats.evictions.fetch_add(closed as u64, Ordering::Relaxed);
        closed
    }
}

fn downcast<T: ServiceClient>(cached: &CachedClient, key: &ClientCacheKey) -> Result<Arc<T>> {
    Arc::clone(&cached.client)
        .downcast::<T>()
        .map_err(|_| Error::Internal(format!("Cached client for {} has the wrong type", key.client_type)))
}

impl BearerTokenProviderListener for ClientConnectionCache {
    fn invalidate(&self, provider_id: &str) {
        ClientConnectionCache::invalidate(self, provider_id);
    }
}
