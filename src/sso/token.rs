//! SSO token types
//!
//! [`AccessToken`] is immutable; a refresh produces a new instance that
//! replaces the old one wholesale.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A bearer token issued by SSO OIDC `CreateToken`
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    /// Opaque bearer token presented to AWS APIs
    pub access_token: String,
    /// Longer-lived token used to obtain a new access token
    pub refresh_token: Option<String>,
    /// Expiration instant
    pub expires_at: DateTime<Utc>,
    /// SSO region the token was issued in
    pub region: String,
    /// SSO start URL
    pub start_url: String,
    /// `sso-session` name, when the token belongs to a named session
    pub session_name: Option<String>,
    /// OIDC client the refresh token was issued to
    pub client: Option<RegisteredClient>,
}

impl AccessToken {
    /// Whether the token is expired at `now`
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Whether `now` falls within `margin` of expiry (or past it)
    #[must_use]
    pub fn is_stale_at(&self, now: DateTime<Utc>, margin: Duration) -> bool {
        let Ok(margin) = chrono::Duration::from_std(margin) else {
            return true;
        };
        match self.expires_at.checked_sub_signed(margin) {
            Some(refresh_at) => now >= refresh_at,
            None => true,
        }
    }

    /// Time until expiration, `None` if already expired
    #[must_use]
    pub fn time_until_expiry(&self, now: DateTime<Utc>) -> Option<Duration> {
        (self.expires_at - now).to_std().ok().filter(|d| !d.is_zero())
    }

    /// Identifier this token is cached under: session name, else start URL
    #[must_use]
    pub fn identifier(&self) -> &str {
        self.session_name.as_deref().unwrap_or(&self.start_url)
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("access_token", &"<redacted>")
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .field("region", &self.region)
            .field("start_url", &self.start_url)
            .field("session_name", &self.session_name)
            .field("client", &self.client)
            .finish()
    }
}

/// Authentication state derived from an optional token and the current time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BearerTokenAuthState {
    /// Token present and not expired
    Authorized,
    /// Token expired but refreshable
    NeedsRefresh,
    /// No token, or expired without a refresh token
    NotAuthenticated,
}

impl BearerTokenAuthState {
    /// Derive the state of `token` at `now`
    #[must_use]
    pub fn of(token: Option<&AccessToken>, now: DateTime<Utc>) -> Self {
        match token {
            None => Self::NotAuthenticated,
            Some(t) if !t.is_expired_at(now) => Self::Authorized,
            Some(t) if t.refresh_token.is_some() => Self::NeedsRefresh,
            Some(_) => Self::NotAuthenticated,
        }
    }
}

/// OIDC client registration returned by `RegisterClient`
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRegistration {
    /// Registered client id
    pub client_id: String,
    /// Registered client secret
    pub client_secret: String,
    /// Secret expiration
    #[serde(with = "super::timestamp")]
    pub expires_at: DateTime<Utc>,
    /// Scopes the client was registered for
    #[serde(default)]
    pub scopes: Vec<String>,
}

impl ClientRegistration {
    /// Registrations are replaced this many minutes before they expire
    pub const EXPIRY_MARGIN_MINUTES: i64 = 15;

    /// Whether the registration can still be used at `now`
    #[must_use]
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::minutes(Self::EXPIRY_MARGIN_MINUTES) < self.expires_at
    }
}

impl fmt::Debug for ClientRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientRegistration")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Client credentials stored inside a token file
///
/// The AWS CLI writes `clientId`, `clientSecret` and `registrationExpiresAt`
/// next to the token so any tool sharing the cache can refresh it.
#[derive(Clone, PartialEq, Eq)]
pub struct RegisteredClient {
    /// Registered client id
    pub client_id: String,
    /// Registered client secret
    pub client_secret: String,
    /// Secret expiration
    pub expires_at: DateTime<Utc>,
}

impl RegisteredClient {
    /// Whether the client can still be used at `now`
    #[must_use]
    pub fn is_usable_at(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::minutes(ClientRegistration::EXPIRY_MARGIN_MINUTES) < self.expires_at
    }
}

impl From<&ClientRegistration> for RegisteredClient {
    fn from(registration: &ClientRegistration) -> Self {
        Self {
            client_id: registration.client_id.clone(),
            client_secret: registration.client_secret.clone(),
            expires_at: registration.expires_at,
        }
    }
}

impl fmt::Debug for RegisteredClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredClient")
            .field("client_id", &self.client_id)
            .field("client_secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Device authorization awaiting user action in a browser
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    /// Page where the user enters the code
    pub verification_uri: String,
    /// Page with the code pre-filled, when the service provides one
    pub verification_uri_complete: Option<String>,
    /// Short code the user types in
    pub user_code: String,
    /// When the device code stops being valid
    pub expires_at: DateTime<Utc>,
    /// Minimum polling interval
    pub interval: Duration,
}

/// An SSO profile or `sso-session` a [`BearerTokenProvider`](super::BearerTokenProvider) is built for
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SsoProfile {
    /// SSO start URL
    pub start_url: String,
    /// SSO region
    pub region: String,
    /// Requested scopes; empty for legacy (non-scoped) tokens
    #[serde(default)]
    pub scopes: Vec<String>,
    /// `sso-session` name
    #[serde(default)]
    pub session_name: Option<String>,
}

impl SsoProfile {
    /// Create a profile without a session name
    pub fn new(start_url: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            start_url: start_url.into(),
            region: region.into(),
            scopes: Vec::new(),
            session_name: None,
        }
    }

    /// Set the requested scopes
    #[must_use]
    pub fn with_scopes<I, S>(mut self, scopes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.scopes = scopes.into_iter().map(Into::into).collect();
        self
    }

    /// Set the `sso-session` name
    #[must_use]
    pub fn with_session_name(mut self, name: impl Into<String>) -> Self {
        self.session_name = Some(name.into());
        self
    }

    /// Provider identifier: session name if set, else start URL
    #[must_use]
    pub fn identifier(&self) -> &str {
        self.session_name.as_deref().unwrap_or(&self.start_url)
    }
}
