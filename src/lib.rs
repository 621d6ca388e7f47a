//! SSO Token Broker Library
//!
//! Lifecycle management for AWS SSO OIDC bearer tokens, plus a keyed cache of
//! service clients built on those credentials.
//!
//! # Features
//!
//! - **Device authorization**: interactive sign-in through SSO OIDC
//! - **Single-flight refresh**: one refresh per provider, shared by every caller
//! - **Background prefetch**: tokens near expiry refresh without blocking
//! - **AWS CLI cache format**: tokens interoperate with `~/.aws/sso/cache`
//! - **Change notifications**: observer list and broadcast channel
//! - **Client cache**: `(identity, region, client type)` keyed, evicted on invalidation
//!
//! # Example
//!
//! ```no_run
//! use sso_token_broker::{BrokerConfig, ClientFactoryRegistry, CredentialBroker, SsoProfile};
//!
//! # async fn run() -> sso_token_broker::Result<()> {
//! let broker = CredentialBroker::from_config(BrokerConfig::load(None)?, ClientFactoryRegistry::new())?;
//! let provider = broker.provider(&SsoProfile::new("https://d-123.awsapps.com/start", "us-east-1"))?;
//! let token = provider.resolve_token().await?;
//! # let _ = token;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod broker;
pub mod client_cache;
pub mod config;
pub mod error;
pub mod events;
pub mod retry;
pub mod sso;

pub use broker::CredentialBroker;
pub use client_cache::{
    ClientConnectionCache, ClientContext, ClientCredentials, ClientFactoryRegistry, ClientType,
    CredentialIdentity, ServiceClient, StaticCredentials,
};
pub use config::BrokerConfig;
pub use error::{Error, ErrorCategory, Result};
pub use events::{BearerTokenProviderListener, SubscriptionId, TokenEvent, TokenEventBus};
pub use sso::{
    AccessToken, AccessTokenProvider, BearerTokenAuthState, BearerTokenProvider, DiskTokenStore, LoginCallback,
    PendingAuthorization, RegisteredClient, SsoOidcClient, SsoProfile,
};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `format` is `"json"` for structured output, anything else for plain text.
/// `RUST_LOG` overrides `level`.
///
/// # Errors
///
/// Returns an error if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Config(format!("Failed to install tracing subscriber: {e}")))
}
