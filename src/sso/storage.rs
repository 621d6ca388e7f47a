//! SSO Token Storage
//!
//! Persists SSO tokens and OIDC client registrations to disk so they
//! survive restarts and are shared with other AWS tooling.
//!
//! Files live under a single cache root, one JSON document per identifier,
//! named `<sha1(identifier)>.json` like the AWS CLI does. Writes go to a
//! temporary file in the same directory which is then renamed over the
//! target, so a crash never leaves a half-written token behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tracing::{debug, info, warn};

use super::token::{AccessToken, ClientRegistration, RegisteredClient};
use crate::{Error, Result};

/// On-disk token record, field-compatible with the AWS CLI cache format
///
/// Field order follows the files the CLI writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiskTokenRecord {
    start_url: String,
    region: String,
    access_token: String,
    #[serde(with = "super::timestamp")]
    expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    client_secret: Option<String>,
    #[serde(
        default,
        with = "super::timestamp::option",
        skip_serializing_if = "Option::is_none"
    )]
    registration_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    session_name: Option<String>,
}

impl From<&AccessToken> for DiskTokenRecord {
    fn from(token: &AccessToken) -> Self {
        let client = token.client.as_ref();
        Self {
            start_url: token.start_url.clone(),
            region: token.region.clone(),
            access_token: token.access_token.clone(),
            expires_at: token.expires_at,
            client_id: client.map(|c| c.client_id.clone()),
            client_secret: client.map(|c| c.client_secret.clone()),
            registration_expires_at: client.map(|c| c.expires_at),
            refresh_token: token.refresh_token.clone(),
            session_name: token.session_name.clone(),
        }
    }
}

impl From<DiskTokenRecord> for AccessToken {
    fn from(record: DiskTokenRecord) -> Self {
        // Partial client fields are unusable for a refresh
        let client = match (record.client_id, record.client_secret, record.registration_expires_at) {
            (Some(client_id), Some(client_secret), Some(expires_at)) => Some(RegisteredClient {
                client_id,
                client_secret,
                expires_at,
            }),
            _ => None,
        };
        Self {
            access_token: record.access_token,
            refresh_token: record.refresh_token,
            expires_at: record.expires_at,
            region: record.region,
            start_url: record.start_url,
            session_name: record.session_name,
            client,
        }
    }
}

/// Disk-backed token store
#[derive(Debug, Clone)]
pub struct DiskTokenStore {
    /// Cache root; every file this store touches lives directly inside it
    cache_dir: PathBuf,
}

impl DiskTokenStore {
    /// Create a store rooted at `cache_dir`
    ///
    /// The directory is created lazily on first write.
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Cache root
    #[must_use]
    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// File a token for `id` is stored in
    #[must_use]
    pub fn token_path(&self, id: &str) -> PathBuf {
        self.cache_dir.join(format!("{}.json", sha1_hex(id)))
    }

    /// Cache key for a client registration
    #[must_use]
    pub fn registration_key(region: &str, scopes: &[String], start_url: &str) -> String {
        let key = serde_json::json!({
            "region": region,
            "scopes": scopes,
            "startUrl": start_url,
        });
        sha1_hex(&key.to_string())
    }

    fn registration_path(&self, key: &str) -> PathBuf {
        self.cache_dir.join(format!("{key}.json"))
    }

    /// Load the token stored for `id`
    ///
    /// Missing or corrupt files yield `Ok(None)`; a corrupt file is logged.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file exists but cannot be read even
    /// after repairing permissions.
    pub fn load(&self, id: &str) -> Result<Option<AccessToken>> {
        let path = self.token_path(id);
        let Some(content) = self.read_optional(&path)? else {
            debug!(id = %id, "No stored token found");
            return Ok(None);
        };

        match serde_json::from_str::<DiskTokenRecord>(&content) {
            Ok(record) => {
                let token = AccessToken::from(record);
                debug!(id = %id, expires_at = %token.expires_at, "Loaded stored token");
                Ok(Some(token))
            }
            Err(e) => {
                warn!(id = %id, path = %path.display(), error = %e, "Failed to parse stored token");
                Ok(None)
            }
        }
    }

    /// Save `token` for `id`, replacing any previous token atomically
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the cache directory or file cannot be
    /// written even after repairing permissions.
    pub fn save(&self, id: &str, token: &AccessToken) -> Result<()> {
        let path = self.token_path(id);
        let content = serde_json::to_vec_pretty(&DiskTokenRecord::from(token))?;
        self.write_atomic(&path, &content)?;
        info!(id = %id, "Saved SSO token");
        Ok(())
    }

    /// Delete the token for `id`; absent files are not an error
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file exists and cannot be removed.
    pub fn delete(&self, id: &str) -> Result<()> {
        let path = self.token_path(id);
        if self.remove_optional(&path)? {
            info!(id = %id, "Deleted SSO token");
        }
        Ok(())
    }

    /// Load a cached client registration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on unrecoverable read failures.
    pub fn load_client_registration(&self, key: &str) -> Result<Option<ClientRegistration>> {
        let path = self.registration_path(key);
        let Some(content) = self.read_optional(&path)? else {
            return Ok(None);
        };
        match serde_json::from_str(&content) {
            Ok(registration) => Ok(Some(registration)),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to parse client registration");
                Ok(None)
            }
        }
    }

    /// Save a client registration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] on unrecoverable write failures.
    pub fn save_client_registration(&self, key: &str, registration: &ClientRegistration) -> Result<()> {
        let path = self.registration_path(key);
        let content = serde_json::to_vec_pretty(registration)?;
        self.write_atomic(&path, &content)
    }

    /// Delete a client registration
    ///
    /// # Errors
    ///
    /// Returns [`Error::Storage`] if the file exists and cannot be removed.
    pub fn delete_client_registration(&self, key: &str) -> Result<()> {
        let path = self.registration_path(key);
        self.remove_optional(&path).map(|_| ())
    }

    // ── Filesystem primitives ────────────────────────────────────────────

    fn read_optional(&self, path: &Path) -> Result<Option<String>> {
        self.with_permission_repair(path, || match fs::read_to_string(path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        })
    }

    fn remove_optional(&self, path: &Path) -> Result<bool> {
        self.with_permission_repair(path, || match fs::remove_file(path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        })
    }

    fn write_atomic(&self, path: &Path, content: &[u8]) -> Result<()> {
        self.with_permission_repair(path, || {
            create_private_dir_all(&self.cache_dir)?;
            let mut tmp = tempfile::Builder::new()
                .prefix(".tmp-")
                .suffix(".json")
                .tempfile_in(&self.cache_dir)?;
            tmp.write_all(content)?;
            tmp.as_file().sync_all()?;
            set_private_file_permissions(tmp.path())?;
            tmp.persist(path).map_err(|e| e.error)?;
            Ok(())
        })
    }

    /// Run `op`, and on `PermissionDenied` repair permissions and retry once
    fn with_permission_repair<T>(&self, path: &Path, op: impl Fn() -> io::Result<T>) -> Result<T> {
        match op() {
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                warn!(path = %path.display(), error = %e, "Permission denied on token cache, repairing");
                self.repair_permissions(path);
                op().map_err(|e| Error::storage(path, e))
            }
            other => other.map_err(|e| Error::storage(path, e)),
        }
    }

    #[cfg(unix)]
    fn repair_permissions(&self, path: &Path) {
        use std::os::unix::fs::PermissionsExt;

        if self.cache_dir.is_dir() {
            if let Err(e) = fs::set_permissions(&self.cache_dir, fs::Permissions::from_mode(0o700)) {
                debug!(path = %self.cache_dir.display(), error = %e, "Could not repair directory permissions");
            }
        }
        if path.is_file() {
            if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
                debug!(path = %path.display(), error = %e, "Could not repair file permissions");
            }
        }
    }

    #[cfg(not(unix))]
    fn repair_permissions(&self, _path: &Path) {}
}

fn sha1_hex(input: &str) -> String {
    hex::encode(Sha1::digest(input.as_bytes()))
}

#[cfg(unix)]
fn create_private_dir_all(dir: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;

    if dir.is_dir() {
        return Ok(());
    }
    fs::DirBuilder::new().recursive(true).mode(0o700).create(dir)
}

#[cfg(not(unix))]
fn create_private_dir_all(dir: &Path) -> io::Result<()> {
    fs::create_dir_all(dir)
}

#[cfg(unix)]
fn set_private_file_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}

#[cfg(not(unix))]
fn set_private_file_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}
