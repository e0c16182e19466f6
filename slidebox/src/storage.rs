use keyring::Entry;
use serde::{Deserialize, Serialize};
use slidebox_core::OAuthToken;
use thiserror::Error;

const SERVICE_NAME: &str = "com.slidebox.triage";
const TOKEN_KEY: &str = "slidebox_oauth_state";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("keyring error: {0}")]
    KeyringError(#[from] keyring::Error),
    #[error("saved oauth state is unreadable: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("token not found")]
    TokenNotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OAuthState {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Unix seconds.
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl OAuthState {
    pub fn from_oauth_token(token: &OAuthToken) -> Self {
        Self {
            access_token: token.access_token.clone(),
            refresh_token: token.refresh_token.clone(),
            expires_at: token
                .expires_in
                .map(|secs| now_unix().saturating_add(i64::try_from(secs).unwrap_or(i64::MAX))),
            scope: token.scope.clone(),
            token_type: token.token_type.clone(),
        }
    }

    /// State after a refresh grant. Servers may leave out what did not
    /// change, so missing fields carry over from `self`.
    pub fn succeeded_by(&self, token: &OAuthToken) -> Self {
        let fresh = Self::from_oauth_token(token);
        Self {
            refresh_token: fresh.refresh_token.or_else(|| self.refresh_token.clone()),
            scope: fresh.scope.or_else(|| self.scope.clone()),
            token_type: fresh.token_type.or_else(|| self.token_type.clone()),
            ..fresh
        }
    }
}

/// OAuth state persisted as JSON in the OS keyring.
pub struct TokenStorage {
    entry: Entry,
}

impl TokenStorage {
    pub fn new() -> Result<Self, StorageError> {
        Ok(Self {
            entry: Entry::new(SERVICE_NAME, TOKEN_KEY)?,
        })
    }

    pub fn save(&self, state: &OAuthState) -> Result<(), StorageError> {
        let payload = serde_json::to_string(state)?;
        self.entry.set_password(&payload)?;
        Ok(())
    }

    pub fn load(&self) -> Result<OAuthState, StorageError> {
        match self.entry.get_password() {
            Ok(payload) => Ok(serde_json::from_str(&payload)?),
            Err(keyring::Error::NoEntry) => Err(StorageError::TokenNotFound),
            Err(err) => Err(StorageError::KeyringError(err)),
        }
    }

    pub fn delete(&self) -> Result<(), StorageError> {
        match self.entry.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(err) => Err(StorageError::KeyringError(err)),
        }
    }
}

pub(crate) fn now_unix() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
