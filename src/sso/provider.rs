//! Bearer token state machine
//!
//! A [`BearerTokenProvider`] owns the current token of one SSO profile and
//! keeps it usable: tokens close to expiry are refreshed in the background,
//! expired ones are refreshed while the caller waits. At most one refresh is
//! in flight per provider; every caller that needs one attaches to it.
//!
//! ```text
//! NotAuthenticated ──login──▶ Authorized ──time──▶ NeedsRefresh
//!        ▲                        ▲                     │
//!        │                        └────refresh ok───────┤
//!        └──────────invalid grant / no refresh token────┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::{AccessTokenProvider, LoginCallback};
use super::storage::DiskTokenStore;
use super::token::{AccessToken, BearerTokenAuthState, SsoProfile};
use crate::events::{TokenEvent, TokenEventBus};
use crate::{Error, Result};

type SharedRefresh = Shared<BoxFuture<'static, Result<Arc<AccessToken>>>>;

struct InFlight {
    seq: u64,
    future: SharedRefresh,
}

/// Token lifecycle for one SSO profile
pub struct BearerTokenProvider {
    id: String,
    profile: SsoProfile,
    oidc: Arc<dyn AccessTokenProvider>,
    storage: Arc<DiskTokenStore>,
    bus: Arc<TokenEventBus>,
    staleness_margin: Duration,
    /// Held only to read or swap the `Arc`, never across I/O
    token: RwLock<Option<Arc<AccessToken>>>,
    /// Serializes generation checks with disk writes and deletes
    persist: Mutex<()>,
    /// Bumped on every invalidate; a refresh started before it is discarded
    generation: AtomicU64,
    in_flight: Mutex<Option<InFlight>>,
    refresh_seq: AtomicU64,
    shutdown: CancellationToken,
}

impl BearerTokenProvider {
    /// Create a provider and load its persisted token
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the token file exists but cannot be read.
    pub fn new(
        profile: SsoProfile,
        oidc: Arc<dyn AccessTokenProvider>,
        storage: Arc<DiskTokenStore>,
        bus: Arc<TokenEventBus>,
        staleness_margin: Duration,
    ) -> Result<Arc<Self>> {
        let id = profile.identifier().to_string();
        let token = storage.load(&id)?.map(Arc::new);
        debug!(provider = %id, loaded = token.is_some(), "Created bearer token provider");

        Ok(Arc::new(Self {
            id,
            profile,
            oidc,
            storage,
            bus,
            staleness_margin,
            token: RwLock::new(token),
            persist: Mutex::new(()),
            generation: AtomicU64::new(0),
            in_flight: Mutex::new(None),
            refresh_seq: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Provider identifier: session name, else start URL
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Profile this provider authenticates
    #[must_use]
    pub fn profile(&self) -> &SsoProfile {
        &self.profile
    }

    /// Last known token, without any I/O
    #[must_use]
    pub fn current_token(&self) -> Option<Arc<AccessToken>> {
        self.token.read().clone()
    }

    /// Authentication state at this instant
    #[must_use]
    pub fn state(&self) -> BearerTokenAuthState {
        BearerTokenAuthState::of(self.current_token().as_deref(), Utc::now())
    }

    /// Whether a refresh is currently in flight
    #[must_use]
    pub fn is_refreshing(&self) -> bool {
        self.in_flight.lock().is_some()
    }

    /// Token to use for the next API call
    ///
    /// A token inside the staleness margin is returned as is while a
    /// background refresh runs. An expired token is refreshed before
    /// returning.
    ///
    /// # Errors
    ///
    /// - [`Error::AuthenticationRequired`] if there is no token, or it is
    ///   expired without a refresh token
    /// - any error of the blocking refresh
    pub async fn resolve_token(self: &Arc<Self>) -> Result<Arc<AccessToken>> {
        self.ensure_active()?;
        let now = Utc::now();

        match self.current_token() {
            Some(token) if !token.is_expired_at(now) => {
                if token.is_stale_at(now, self.staleness_margin) && token.refresh_token.is_some() {
                    debug!(provider = %self.id, "Token near expiry, prefetching");
                    self.prefetch();
                }
                Ok(token)
            }
            Some(token) if token.refresh_token.is_some() => {
                debug!(provider = %self.id, "Token expired, refreshing");
                self.start_refresh().await
            }
            _ => Err(Error::AuthenticationRequired(self.id.clone())),
        }
    }

    /// Non-blocking variant of [`resolve_token`](Self::resolve_token)
    ///
    /// # Errors
    ///
    /// - [`Error::TokenExpiredRecoverable`] if the token is expired but a
    ///   refresh has been started
    /// - [`Error::AuthenticationRequired`] if no refresh is possible
    pub fn try_resolve_token(self: &Arc<Self>) -> Result<Arc<AccessToken>> {
        self.ensure_active()?;
        let now = Utc::now();

        match self.current_token() {
            Some(token) if !token.is_expired_at(now) => {
                if token.is_stale_at(now, self.staleness_margin) && token.refresh_token.is_some() {
                    self.prefetch();
                }
                Ok(token)
            }
            Some(token) if token.refresh_token.is_some() => {
                self.prefetch();
                Err(Error::TokenExpiredRecoverable(self.id.clone()))
            }
            _ => Err(Error::AuthenticationRequired(self.id.clone())),
        }
    }

    /// Refresh now, joining a refresh already in flight
    ///
    /// # Errors
    ///
    /// - [`Error::AuthenticationRequired`] if no token with a refresh token
    ///   is loaded
    /// - [`Error::InvalidGrant`] if the service rejected the refresh token;
    ///   the provider is invalidated
    pub async fn refresh(self: &Arc<Self>) -> Result<Arc<AccessToken>> {
        self.ensure_active()?;
        self.start_refresh().await
    }

    /// Drop the token from memory and disk
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the token file cannot be deleted. The
    /// in-memory token is cleared regardless.
    pub fn invalidate(&self) -> Result<()> {
        let deleted = {
            let _persist = self.persist.lock();
            self.generation.fetch_add(1, Ordering::SeqCst);
            *self.token.write() = None;
            self.storage.delete(&self.id)
        };
        // A refresh still running belongs to the old generation
        self.in_flight.lock().take();

        info!(provider = %self.id, "Credentials invalidated");
        self.bus
            .publish(&TokenEvent::CredentialsInvalidated(self.id.clone()));
        deleted
    }

    /// Invalidate, then run an interactive login
    ///
    /// A cancelled or failed login leaves the provider unauthenticated.
    ///
    /// # Errors
    ///
    /// Returns the login error ([`Error::Cancelled`],
    /// [`Error::DeviceCodeExpired`], [`Error::AccessDenied`], ...) or
    /// [`Error::Storage`] if the new token cannot be persisted.
    pub async fn reauthenticate(
        &self,
        callback: &dyn LoginCallback,
        cancel: &CancellationToken,
    ) -> Result<Arc<AccessToken>> {
        self.ensure_active()?;
        self.invalidate()?;

        let generation = self.generation.load(Ordering::SeqCst);
        let token = tokio::select! {
            () = self.shutdown.cancelled() => return Err(Error::Cancelled),
            result = self.oidc.login(&self.profile, callback, cancel) => result?,
        };

        let token = self.store(token, generation)?;
        info!(provider = %self.id, expires_at = %token.expires_at, "Signed in");
        Ok(token)
    }

    /// Cancel in-flight work; later calls fail with [`Error::Cancelled`]
    pub fn dispose(&self) {
        self.shutdown.cancel();
        self.in_flight.lock().take();
        debug!(provider = %self.id, "Provider disposed");
    }

    /// Whether [`dispose`](Self::dispose) has been called
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    // ── Internals ─────────────────────────────────────────────────────────

    fn ensure_active(&self) -> Result<()> {
        if self.shutdown.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Start a refresh nobody waits for; failures are only logged
    fn prefetch(self: &Arc<Self>) {
        drop(self.start_refresh());
    }

    /// Join the in-flight refresh or start a new one
    ///
    /// The refresh is driven by a spawned task when a runtime is available,
    /// so it completes even if every caller stops waiting.
    fn start_refresh(self: &Arc<Self>) -> SharedRefresh {
        let mut slot = self.in_flight.lock();
        if let Some(in_flight) = slot.as_ref() {
            debug!(provider = %self.id, "Joining in-flight refresh");
            return in_flight.future.clone();
        }

        let seq = self.refresh_seq.fetch_add(1, Ordering::Relaxed);
        let this = Arc::clone(self);
        let future = async move {
            let result = this.run_refresh().await;
            let mut slot = this.in_flight.lock();
            if slot.as_ref().is_some_and(|f| f.seq == seq) {
                *slot = None;
            }
            result
        }
        .boxed()
        .shared();

        *slot = Some(InFlight {
            seq,
            future: future.clone(),
        });
        drop(slot);

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let driver = future.clone();
            let id = self.id.clone();
            handle.spawn(async move {
                if let Err(e) = driver.await {
                    warn!(provider = %id, error = %e, "Token refresh failed");
                }
            });
        }
        future
    }

    async fn run_refresh(&self) -> Result<Arc<AccessToken>> {
        let generation = self.generation.load(Ordering::SeqCst);
        let current = self
            .current_token()
            .filter(|t| t.refresh_token.is_some())
            .ok_or_else(|| Error::AuthenticationRequired(self.id.clone()))?;

        let result = tokio::select! {
            () = self.shutdown.cancelled() => return Err(Error::Cancelled),
            result = self.oidc.refresh_token(&self.profile, &current) => result,
        };

        match result {
            Ok(token) => {
                let token = self.store(token, generation)?;
                info!(provider = %self.id, expires_at = %token.expires_at, "Token refreshed");
                Ok(token)
            }
            Err(Error::InvalidGrant(reason)) => {
                warn!(provider = %self.id, reason = %reason, "Refresh token rejected, sign-in required");
                if self.generation.load(Ordering::SeqCst) == generation {
                    if let Err(e) = self.invalidate() {
                        warn!(provider = %self.id, error = %e, "Failed to delete rejected token");
                    }
                }
                Err(Error::InvalidGrant(reason))
            }
            Err(e) => Err(e),
        }
    }

    /// Persist and publish `token` unless the provider was invalidated
    /// after `generation` was read
    fn store(&self, token: AccessToken, generation: u64) -> Result<Arc<AccessToken>> {
        let token = Arc::new(token);
        {
            let _persist = self.persist.lock();
            if self.generation.load(Ordering::SeqCst) != generation {
                debug!(provider = %self.id, "Discarding token obtained before invalidation");
                return Err(Error::AuthenticationRequired(self.id.clone()));
            }
            self.storage.save(&self.id, &token)?;
            *self.token.write() = Some(Arc::clone(&token));
        }
        self.bus
            .publish(&TokenEvent::CredentialsChanged(self.id.clone()));
        Ok(token)
    }
}

impl std::fmt::Debug for BearerTokenProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BearerTokenProvider")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
