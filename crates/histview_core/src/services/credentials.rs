//! Credential storage and the authentication retry loop.
//!
//! Credentials entered at the prompt are remembered per database through a
//! pluggable provider:
//!
//! - **Release builds**: OS keychain (macOS Keychain, Windows Credential
//!   Manager, Linux Secret Service)
//! - **Debug builds**: in-memory session storage, so development runs never
//!   trigger keychain prompts. Set `HISTVIEW_USE_KEYCHAIN=1` to force the
//!   keychain.

use crate::error::HistoryError;
use crate::models::{ConnectionDescriptor, Credentials};
use crate::services::connection::{Connector, DirectConnection};
use crate::services::host::CredentialPrompt;

use keyring::Entry;
use parking_lot::RwLock;
use std::collections::HashMap;

/// Service name used for keychain entries.
const KEYRING_SERVICE: &str = "dev.histview.HistoryViewer";

/// Environment variable forcing keychain usage in debug builds.
const FORCE_KEYCHAIN_ENV: &str = "HISTVIEW_USE_KEYCHAIN";

/// Upper bound on credential prompts for one connection attempt.
pub const MAX_CREDENTIAL_ATTEMPTS: usize = 5;

// ============================================================================
// CredentialsProvider
// ============================================================================

/// Storage backend for secrets.
pub trait CredentialsProvider: Send + Sync {
    fn store(&self, key: &str, value: &str) -> Result<(), HistoryError>;

    fn get(&self, key: &str) -> Result<Option<String>, HistoryError>;

    fn delete(&self, key: &str) -> Result<(), HistoryError>;

    fn exists(&self, key: &str) -> Result<bool, HistoryError> {
        Ok(self.get(key)?.is_some())
    }

    /// Provider name for logging.
    fn name(&self) -> &'static str;
}

/// OS keychain storage.
#[derive(Debug)]
pub struct KeychainCredentialsProvider {
    service: String,
}

impl Default for KeychainCredentialsProvider {
    fn default() -> Self {
        Self { service: KEYRING_SERVICE.to_string() }
    }
}

impl KeychainCredentialsProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialsProvider for KeychainCredentialsProvider {
    fn store(&self, key: &str, value: &str) -> Result<(), HistoryError> {
        Entry::new(&self.service, key)
            .map_err(|e| HistoryError::keyring(e.to_string(), None))?
            .set_password(value)
            .map_err(|e| {
                HistoryError::keyring(
                    e.to_string(),
                    Some("Grant the history viewer access to the keychain"),
                )
            })?;
        tracing::debug!(key = key, "Credential stored in keychain");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, HistoryError> {
        let entry = Entry::new(&self.service, key)
            .map_err(|e| HistoryError::keyring(e.to_string(), None))?;
        match entry.get_password() {
            Ok(secret) => Ok(Some(secret)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(HistoryError::keyring(
                e.to_string(),
                Some("Grant the history viewer access to the keychain"),
            )),
        }
    }

    fn delete(&self, key: &str) -> Result<(), HistoryError> {
        let entry = Entry::new(&self.service, key)
            .map_err(|e| HistoryError::keyring(e.to_string(), None))?;
        match entry.delete_credential() {
            Ok(()) => {
                tracing::debug!(key = key, "Credential deleted from keychain");
                Ok(())
            }
            Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(HistoryError::keyring(e.to_string(), None)),
        }
    }

    fn name(&self) -> &'static str {
        "KeychainCredentialsProvider"
    }
}

/// In-memory storage; credentials are lost when the process exits.
#[derive(Debug, Default)]
pub struct SessionCredentialsProvider {
    store: RwLock<HashMap<String, String>>,
}

impl SessionCredentialsProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CredentialsProvider for SessionCredentialsProvider {
    fn store(&self, key: &str, value: &str) -> Result<(), HistoryError> {
        self.store.write().insert(key.to_string(), value.to_string());
        tracing::debug!(key = key, "Credential stored in session");
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<String>, HistoryError> {
        Ok(self.store.read().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), HistoryError> {
        self.store.write().remove(key);
        tracing::debug!(key = key, "Credential deleted from session");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "SessionCredentialsProvider"
    }
}

fn select_provider() -> Box<dyn CredentialsProvider> {
    let force_keychain = std::env::var(FORCE_KEYCHAIN_ENV).map(|v| v == "1").unwrap_or(false);

    if cfg!(debug_assertions) && !force_keychain {
        tracing::debug!(
            provider = "SessionCredentialsProvider",
            reason = "debug build",
            "Using session-only credential storage"
        );
        return Box::new(SessionCredentialsProvider::new());
    }

    tracing::debug!(provider = "KeychainCredentialsProvider", "Using keychain credential storage");
    Box::new(KeychainCredentialsProvider::new())
}

// ============================================================================
// CredentialService
// ============================================================================

/// Remembers database credentials and drives the authentication retry loop.
pub struct CredentialService {
    provider: Box<dyn CredentialsProvider>,
}

impl CredentialService {
    /// Create the service with the provider matching the build type.
    pub fn new() -> Self {
        Self::with_provider(select_provider())
    }

    pub fn with_provider(provider: Box<dyn CredentialsProvider>) -> Self {
        tracing::info!(provider = provider.name(), "Credential service initialized");
        Self { provider }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    fn key(descriptor: &ConnectionDescriptor) -> String {
        format!("db:{}", descriptor.credential_key())
    }

    /// Remember credentials for the database `descriptor` points at.
    pub fn remember(
        &self,
        descriptor: &ConnectionDescriptor,
        credentials: &Credentials,
    ) -> Result<(), HistoryError> {
        let value = serde_json::to_string(credentials)
            .map_err(|e| HistoryError::internal(format!("Failed to serialize credentials: {e}")))?;
        self.provider.store(&Self::key(descriptor), &value)?;
        tracing::debug!(database = %descriptor.normalized(), "Credentials remembered");
        Ok(())
    }

    /// Credentials remembered for the database, if any.
    pub fn recall(
        &self,
        descriptor: &ConnectionDescriptor,
    ) -> Result<Option<Credentials>, HistoryError> {
        let Some(value) = self.provider.get(&Self::key(descriptor))? else {
            return Ok(None);
        };
        match serde_json::from_str(&value) {
            Ok(credentials) => Ok(Some(credentials)),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unreadable stored credentials");
                Ok(None)
            }
        }
    }

    pub fn forget(&self, descriptor: &ConnectionDescriptor) -> Result<(), HistoryError> {
        self.provider.delete(&Self::key(descriptor))
    }

    /// Open a direct connection, prompting for credentials on
    /// authentication failures.
    ///
    /// Remembered credentials are applied when the descriptor carries none.
    /// Each authentication failure prompts once, up to
    /// [`MAX_CREDENTIAL_ATTEMPTS`] prompts; after that the last
    /// authentication error is returned. A dismissed prompt returns
    /// [`HistoryError::UserCancelled`]. Any other failure is returned as is.
    pub fn connect_with_retry(
        &self,
        connector: &dyn Connector,
        descriptor: &ConnectionDescriptor,
        prompt: &dyn CredentialPrompt,
    ) -> Result<Box<dyn DirectConnection>, HistoryError> {
        let mut attempt = descriptor.clone();
        if !descriptor.has_credentials() {
            match self.recall(descriptor) {
                Ok(Some(credentials)) => {
                    tracing::debug!(database = %descriptor.normalized(), "Using remembered credentials");
                    attempt = descriptor.with_credentials(&credentials);
                }
                Ok(None) => {}
                Err(e) => tracing::warn!(error = %e, "Could not read remembered credentials"),
            }
        }

        let domain = descriptor.credential_key();
        let mut entered: Option<Credentials> = None;
        let mut prompts = 0;

        loop {
            let error = match connector.connect(&attempt) {
                Ok(conn) => {
                    if let Some(credentials) = &entered {
                        if let Err(e) = self.remember(descriptor, credentials) {
                            tracing::warn!(error = %e, "Could not remember credentials");
                        }
                    }
                    tracing::info!(database = %attempt, prompts, "Direct connection established");
                    return Ok(conn);
                }
                Err(e) if e.is_authentication() => e,
                Err(e) => return Err(e),
            };

            if prompts >= MAX_CREDENTIAL_ATTEMPTS {
                tracing::warn!(prompts, "Giving up after repeated authentication failures");
                return Err(error);
            }
            prompts += 1;
            tracing::debug!(attempt = prompts, error = %error, "Authentication failed, prompting");

            let Some(credentials) = prompt.prompt(&domain, &error.to_string()) else {
                tracing::info!("Credential prompt cancelled");
                return Err(HistoryError::UserCancelled);
            };
            attempt = descriptor.with_credentials(&credentials);
            entered = Some(credentials);
        }
    }
}

impl Default for CredentialService {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CredentialService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialService").field("provider", &self.provider.name()).finish()
    }
}
