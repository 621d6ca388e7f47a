//! AWS SSO bearer tokens
//!
//! - [`storage`]: token and client-registration files shared with the AWS CLI
//! - [`client`]: the SSO OIDC device-authorization and refresh exchange
//! - [`provider`]: the per-profile token state machine

pub mod client;
pub mod provider;
pub mod storage;
mod timestamp;
pub mod token;

pub use client::{AccessTokenProvider, LoginCallback, SsoOidcClient};
pub use provider::BearerTokenProvider;
pub use storage::DiskTokenStore;
pub use token::{
    AccessToken, BearerTokenAuthState, ClientRegistration, PendingAuthorization, RegisteredClient, SsoProfile,
};
