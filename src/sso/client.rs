//! SSO OIDC Client
//!
//! Speaks the AWS SSO OIDC REST-JSON protocol: `RegisterClient`,
//! `StartDeviceAuthorization` and `CreateToken` with the device-code and
//! refresh-token grants.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{SubsecRound, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::{Instant, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::storage::DiskTokenStore;
use super::token::{AccessToken, ClientRegistration, PendingAuthorization, RegisteredClient, SsoProfile};
use crate::config::OidcConfig;
use crate::retry::{RetryPolicy, with_retry};
use crate::{Error, Result};

/// Grant type for polling a device authorization
pub const DEVICE_CODE_GRANT: &str = "urn:ietf:params:oauth:grant-type:device_code";
/// Grant type for exchanging a refresh token
pub const REFRESH_TOKEN_GRANT: &str = "refresh_token";

/// Added to the polling interval every time the service answers `slow_down`
const SLOW_DOWN_INCREMENT: Duration = Duration::from_secs(5);

/// UI hooks invoked during an interactive login
pub trait LoginCallback: Send + Sync {
    /// A device code was issued; show `authorization` to the user
    fn token_pending(&self, authorization: &PendingAuthorization);

    /// The user completed authorization and a token was issued
    fn token_retrieved(&self) {}

    /// The login attempt failed
    fn token_retrieval_failure(&self, _error: &Error) {}
}

/// Source of SSO access tokens
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    /// Run the interactive device-authorization flow for `profile`
    ///
    /// Returns once the user completes authorization, the device code
    /// expires, the user denies access, or `cancel` fires.
    async fn login(
        &self,
        profile: &SsoProfile,
        callback: &dyn LoginCallback,
        cancel: &CancellationToken,
    ) -> Result<AccessToken>;

    /// Exchange the refresh token in `token` for a new access token
    ///
    /// A rejected refresh token surfaces as [`Error::InvalidGrant`]; callers
    /// must fall back to [`login`](Self::login) instead of retrying.
    async fn refresh_token(&self, profile: &SsoProfile, token: &AccessToken) -> Result<AccessToken>;
}

// ── Wire types ────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct RegisterClientRequest<'a> {
    client_name: &'a str,
    client_type: &'a str,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    scopes: &'a [String],
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterClientResponse {
    client_id: String,
    client_secret: String,
    client_secret_expires_at: i64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StartDeviceAuthorizationRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    start_url: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartDeviceAuthorizationResponse {
    device_code: String,
    user_code: String,
    verification_uri: String,
    #[serde(default)]
    verification_uri_complete: Option<String>,
    expires_in: u64,
    #[serde(default)]
    interval: Option<u64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateTokenRequest<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    device_code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTokenResponse {
    access_token: String,
    expires_in: u64,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct OidcErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
    #[serde(default, alias = "Message")]
    message: Option<String>,
}

/// Error response returned by the OIDC service
#[derive(Debug, Clone, PartialEq, Eq)]
struct OidcErrorResponse {
    status: u16,
    /// OAuth-style code, e.g. `authorization_pending`
    code: String,
    message: String,
}

impl OidcErrorResponse {
    /// Generic mapping, used where no call-specific meaning applies
    fn into_error(self) -> Error {
        if self.status >= 500 || self.status == 429 || self.code == "slow_down" {
            return Error::Network(format!("HTTP {} {}: {}", self.status, self.code, self.message));
        }
        match self.code.as_str() {
            "access_denied" => Error::AccessDenied(self.message),
            _ => Error::Service {
                status: self.status,
                code: self.code,
                message: self.message,
            },
        }
    }

    /// Mapping for a refresh-token `CreateToken`
    fn into_refresh_error(self) -> Error {
        match self.code.as_str() {
            "invalid_grant" | "expired_token" | "invalid_client" | "unauthorized_client" => {
                Error::InvalidGrant(self.message)
            }
            _ => self.into_error(),
        }
    }
}

/// Map an `x-amzn-ErrorType` value to the OAuth code carried in the body
fn code_from_error_type(header: &str) -> String {
    let name = header.split(':').next().unwrap_or(header);
    match name {
        "AuthorizationPendingException" => "authorization_pending",
        "SlowDownException" => "slow_down",
        "ExpiredTokenException" => "expired_token",
        "AccessDeniedException" => "access_denied",
        "InvalidGrantException" => "invalid_grant",
        "InvalidClientException" => "invalid_client",
        "UnauthorizedClientException" => "unauthorized_client",
        "InvalidRequestException" => "invalid_request",
        "InvalidScopeException" => "invalid_scope",
        "InternalServerException" => "server_error",
        other => other,
    }
    .to_string()
}

/// Polling interval after the service answered with `code`
fn next_poll_interval(current: Duration, code: &str) -> Duration {
    if code == "slow_down" {
        current + SLOW_DOWN_INCREMENT
    } else {
        current
    }
}

// ── Client ────────────────────────────────────────────────────────────────

/// [`AccessTokenProvider`] backed by the AWS SSO OIDC service
pub struct SsoOidcClient {
    http_client: Client,
    config: OidcConfig,
    /// Client registrations are cached next to the tokens
    storage: Arc<DiskTokenStore>,
    retry_policy: RetryPolicy,
}

impl SsoOidcClient {
    /// Create a client
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: OidcConfig, storage: Arc<DiskTokenStore>, retry_policy: RetryPolicy) -> Result<Self> {
        let http_client = Client::builder()
            .timeout(config.http_timeout)
            .build()
            .map_err(|e| Error::Internal(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            http_client,
            config,
            storage,
            retry_policy,
        })
    }

    fn endpoint(&self, region: &str, operation: &str) -> Result<String> {
        let base = self.config.endpoint_for(region);
        let url = format!("{}/{operation}", base.trim_end_matches('/'));
        url::Url::parse(&url).map_err(|e| Error::Config(format!("Invalid OIDC endpoint {url}: {e}")))?;
        Ok(url)
    }

    /// POST a JSON body; the inner result carries service error responses
    async fn post<B, R>(&self, url: &str, body: &B) -> Result<std::result::Result<R, OidcErrorResponse>>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let response = self.http_client.post(url).json(body).send().await?;
        let status = response.status();

        if status.is_success() {
            let bytes = response.bytes().await?;
            return Ok(Ok(serde_json::from_slice(&bytes)?));
        }

        let header_code = response
            .headers()
            .get("x-amzn-errortype")
            .and_then(|v| v.to_str().ok())
            .map(code_from_error_type);
        let text = response.text().await.unwrap_or_default();
        let parsed: OidcErrorBody = serde_json::from_str(&text).unwrap_or_default();

        let code = parsed
            .error
            .or(header_code)
            .unwrap_or_else(|| "unknown".to_string());
        let message = parsed.error_description.or(parsed.message).unwrap_or(text);

        Ok(Err(OidcErrorResponse {
            status: status.as_u16(),
            code,
            message,
        }))
    }

    /// Cached registration for `profile`, if still usable
    fn cached_registration(&self, profile: &SsoProfile) -> Result<Option<ClientRegistration>> {
        let key = DiskTokenStore::registration_key(&profile.region, &profile.scopes, &profile.start_url);
        Ok(self
            .storage
            .load_client_registration(&key)?
            .filter(|r| r.is_usable_at(Utc::now())))
    }

    /// Reuse or create an OIDC client registration for `profile`
    async fn register_client(&self, profile: &SsoProfile) -> Result<ClientRegistration> {
        if let Some(registration) = self.cached_registration(profile)? {
            debug!(client_id = %registration.client_id, "Reusing cached client registration");
            return Ok(registration);
        }

        let url = self.endpoint(&profile.region, "client/register")?;
        let request = RegisterClientRequest {
            client_name: &self.config.client_name,
            client_type: "public",
            scopes: &profile.scopes,
        };
        let (url, request) = (url.as_str(), &request);

        let response: RegisterClientResponse = with_retry(&self.retry_policy, "RegisterClient", || async move {
            self.post(url, request).await?.map_err(OidcErrorResponse::into_error)
        })
        .await?;

        let expires_at = chrono::DateTime::from_timestamp(response.client_secret_expires_at, 0)
            .ok_or_else(|| Error::Serialization("clientSecretExpiresAt out of range".to_string()))?;
        let registration = ClientRegistration {
            client_id: response.client_id,
            client_secret: response.client_secret,
            expires_at,
            scopes: profile.scopes.clone(),
        };

        let key = DiskTokenStore::registration_key(&profile.region, &profile.scopes, &profile.start_url);
        self.storage.save_client_registration(&key, &registration)?;
        info!(client_id = %registration.client_id, region = %profile.region, "Registered OIDC client");
        Ok(registration)
    }

    async fn start_device_authorization(
        &self,
        profile: &SsoProfile,
        registration: &ClientRegistration,
    ) -> Result<StartDeviceAuthorizationResponse> {
        let url = self.endpoint(&profile.region, "device_authorization")?;
        let request = StartDeviceAuthorizationRequest {
            client_id: &registration.client_id,
            client_secret: &registration.client_secret,
            start_url: &profile.start_url,
        };
        let (url, request) = (url.as_str(), &request);

        with_retry(&self.retry_policy, "StartDeviceAuthorization", || async move {
            self.post(url, request).await?.map_err(|e| {
                if e.code == "invalid_client" {
                    // Stale registration; drop it so the next login re-registers
                    let key = DiskTokenStore::registration_key(
                        &profile.region,
                        &profile.scopes,
                        &profile.start_url,
                    );
                    if let Err(err) = self.storage.delete_client_registration(&key) {
                        warn!(error = %err, "Failed to delete stale client registration");
                    }
                }
                e.into_error()
            })
        })
        .await
    }

    /// Poll `CreateToken` until the device authorization resolves
    async fn poll_for_token(
        &self,
        profile: &SsoProfile,
        registration: &ClientRegistration,
        device: &StartDeviceAuthorizationResponse,
        cancel: &CancellationToken,
    ) -> Result<CreateTokenResponse> {
        let url = self.endpoint(&profile.region, "token")?;
        let request = CreateTokenRequest {
            client_id: &registration.client_id,
            client_secret: &registration.client_secret,
            grant_type: DEVICE_CODE_GRANT,
            device_code: Some(&device.device_code),
            refresh_token: None,
        };

        let deadline = Instant::now() + Duration::from_secs(device.expires_in);
        let mut interval = Duration::from_secs(device.interval.unwrap_or(5)).max(self.config.poll_interval_floor);

        loop {
            tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                () = sleep(interval) => {}
            }
            if Instant::now() >= deadline {
                return Err(Error::DeviceCodeExpired);
            }

            let response = tokio::select! {
                () = cancel.cancelled() => return Err(Error::Cancelled),
                r = self.post::<_, CreateTokenResponse>(&url, &request) => r,
            };

            match response {
                Ok(Ok(token)) => return Ok(token),
                Ok(Err(e)) => match e.code.as_str() {
                    "authorization_pending" => {}
                    "slow_down" => {
                        interval = next_poll_interval(interval, &e.code);
                        debug!(interval_secs = interval.as_secs(), "OIDC asked to slow down");
                    }
                    "expired_token" => return Err(Error::DeviceCodeExpired),
                    _ => return Err(e.into_error()),
                },
                // Transient failures keep polling until the device code expires
                Err(e) if e.is_retryable() => {
                    warn!(error = %e, "Token poll failed, will retry");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn login_inner(
        &self,
        profile: &SsoProfile,
        callback: &dyn LoginCallback,
        cancel: &CancellationToken,
    ) -> Result<AccessToken> {
        let registration = self.register_client(profile).await?;
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }

        let device = self.start_device_authorization(profile, &registration).await?;
        let now = Utc::now();
        let authorization = PendingAuthorization {
            verification_uri: device.verification_uri.clone(),
            verification_uri_complete: device.verification_uri_complete.clone(),
            user_code: device.user_code.clone(),
            expires_at: now + lifetime(device.expires_in),
            interval: Duration::from_secs(device.interval.unwrap_or(5)),
        };
        info!(
            verification_uri = %authorization.verification_uri,
            user_code = %authorization.user_code,
            "Waiting for device authorization"
        );
        callback.token_pending(&authorization);

        let response = self.poll_for_token(profile, &registration, &device, cancel).await?;
        Ok(to_access_token(response, profile, RegisteredClient::from(&registration), None))
    }

    /// Client to refresh `token` with: the one stored in the token file, else
    /// the cached registration for `profile`
    fn refresh_client(&self, profile: &SsoProfile, token: &AccessToken) -> Result<Option<RegisteredClient>> {
        let now = Utc::now();
        if let Some(client) = token.client.as_ref().filter(|c| c.is_usable_at(now)) {
            return Ok(Some(client.clone()));
        }
        Ok(self.cached_registration(profile)?.as_ref().map(RegisteredClient::from))
    }
}

/// `expiresIn` seconds as a chrono duration, capped at one year
fn lifetime(expires_in: u64) -> chrono::Duration {
    const MAX_LIFETIME_SECS: u64 = 365 * 24 * 60 * 60;
    chrono::Duration::seconds(i64::try_from(expires_in.min(MAX_LIFETIME_SECS)).unwrap_or_default())
}

/// Build an [`AccessToken`] from a `CreateToken` response
///
/// Expiry is truncated to whole seconds like the tokens the AWS CLI writes.
fn to_access_token(
    response: CreateTokenResponse,
    profile: &SsoProfile,
    client: RegisteredClient,
    previous_refresh_token: Option<&str>,
) -> AccessToken {
    AccessToken {
        access_token: response.access_token,
        refresh_token: response
            .refresh_token
            .or_else(|| previous_refresh_token.map(str::to_string)),
        expires_at: Utc::now().trunc_subsecs(0) + lifetime(response.expires_in),
        region: profile.region.clone(),
        start_url: profile.start_url.clone(),
        session_name: profile.session_name.clone(),
        client: Some(client),
    }
}

#[async_trait]
impl AccessTokenProvider for SsoOidcClient {
    async fn login(
        &self,
        profile: &SsoProfile,
        callback: &dyn LoginCallback,
        cancel: &CancellationToken,
    ) -> Result<AccessToken> {
        match self.login_inner(profile, callback, cancel).await {
            Ok(token) => {
                info!(id = %profile.identifier(), "SSO login completed");
                callback.token_retrieved();
                Ok(token)
            }
            Err(e) => {
                warn!(id = %profile.identifier(), error = %e, "SSO login failed");
                callback.token_retrieval_failure(&e);
                Err(e)
            }
        }
    }

    async fn refresh_token(&self, profile: &SsoProfile, token: &AccessToken) -> Result<AccessToken> {
        let refresh_token = token
            .refresh_token
            .as_deref()
            .ok_or_else(|| Error::AuthenticationRequired(profile.identifier().to_string()))?;
        let client = self
            .refresh_client(profile, token)?
            .ok_or_else(|| Error::InvalidGrant("client registration missing or expired".to_string()))?;

        let url = self.endpoint(&profile.region, "token")?;
        let request = CreateTokenRequest {
            client_id: &client.client_id,
            client_secret: &client.client_secret,
            grant_type: REFRESH_TOKEN_GRANT,
            device_code: None,
            refresh_token: Some(refresh_token),
        };
        let (url, request) = (url.as_str(), &request);

        let response: CreateTokenResponse = with_retry(&self.retry_policy, "CreateToken", || async move {
            self.post(url, request)
                .await?
                .map_err(OidcErrorResponse::into_refresh_error)
        })
        .await?;

        debug!(id = %profile.identifier(), client_id = %client.client_id, "Token refreshed via SSO OIDC");
        Ok(to_access_token(response, profile, client, Some(refresh_token)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn error(status: u16, code: &str) -> OidcErrorResponse {
        OidcErrorResponse {
            status,
            code: code.to_string(),
            message: "details".to_string(),
        }
    }

    #[test]
    fn header_error_types_map_to_oauth_codes() {
        assert_eq!(
            code_from_error_type("AuthorizationPendingException:http://internal.amazon.com/coral/"),
            "authorization_pending"
        );
        assert_eq!(code_from_error_type("SlowDownException"), "slow_down");
        assert_eq!(code_from_error_type("InvalidGrantException"), "invalid_grant");
        assert_eq!(code_from_error_type("SomethingNew"), "SomethingNew");
    }

    #[test]
    fn server_errors_and_throttling_are_network_errors() {
        assert!(matches!(error(500, "server_error").into_error(), Error::Network(_)));
        assert!(matches!(error(503, "unknown").into_error(), Error::Network(_)));
        assert!(matches!(error(429, "unknown").into_error(), Error::Network(_)));
    }

    #[test]
    fn other_client_errors_are_terminal() {
        match error(400, "invalid_request").into_error() {
            Error::Service { status, code, .. } => {
                assert_eq!(status, 400);
                assert_eq!(code, "invalid_request");
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(error(400, "access_denied").into_error(), Error::AccessDenied(_)));
    }

    #[test]
    fn rejected_refresh_tokens_are_invalid_grant() {
        for code in ["invalid_grant", "expired_token", "invalid_client", "unauthorized_client"] {
            assert!(
                matches!(error(400, code).into_refresh_error(), Error::InvalidGrant(_)),
                "{code} should be InvalidGrant"
            );
        }
        assert!(matches!(error(500, "server_error").into_refresh_error(), Error::Network(_)));
    }

    #[test]
    fn slow_down_widens_interval() {
        let base = Duration::from_secs(5);
        assert_eq!(next_poll_interval(base, "slow_down"), Duration::from_secs(10));
        assert_eq!(next_poll_interval(base, "authorization_pending"), base);
    }

    #[test]
    fn refreshed_token_keeps_previous_refresh_token() {
        let profile = SsoProfile::new("https://d-1.awsapps.com/start", "eu-central-1");
        let response = CreateTokenResponse {
            access_token: "new".to_string(),
            expires_in: 3600,
            refresh_token: None,
        };
        let client = RegisteredClient {
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            expires_at: Utc::now() + chrono::Duration::days(90),
        };
        let token = to_access_token(response, &profile, client.clone(), Some("old-refresh"));
        assert_eq!(token.refresh_token.as_deref(), Some("old-refresh"));
        assert_eq!(token.client, Some(client));
        assert_eq!(token.region, "eu-central-1");
        assert_eq!(token.expires_at.timestamp_subsec_nanos(), 0);
        assert!(token.expires_at > Utc::now() + chrono::Duration::minutes(59));
    }

    #[test]
    fn create_token_request_wire_format() {
        let request = CreateTokenRequest {
            client_id: "cid",
            client_secret: "secret",
            grant_type: REFRESH_TOKEN_GRANT,
            device_code: None,
            refresh_token: Some("rt"),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "clientId": "cid",
                "clientSecret": "secret",
                "grantType": "refresh_token",
                "refreshToken": "rt"
            })
        );
    }
}
