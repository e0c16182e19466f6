use std::future::Future;
use std::sync::Arc;

use slidebox_core::OAuthClient;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::storage::{OAuthState, TokenStorage, now_unix};

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("oauth client is required to refresh expired token")]
    MissingOAuthClient,
    #[error("refresh token is missing")]
    MissingRefreshToken,
    #[error("oauth refresh failed: {0}")]
    OAuth(#[from] slidebox_core::OAuthError),
}

/// Something that can hand out an access token and mint a new one on demand.
pub trait CredentialSource: Send + 'static {
    fn access_token(&mut self) -> impl Future<Output = Result<String, CredentialError>> + Send;

    /// Forces a new token, even if the current one looks valid.
    fn refresh(&mut self) -> impl Future<Output = Result<String, CredentialError>> + Send;
}

pub struct TokenProvider {
    state: OAuthState,
    oauth_client: Option<OAuthClient>,
    storage: Option<TokenStorage>,
    refresh_skew_secs: i64,
}

impl TokenProvider {
    pub fn new(state: OAuthState, oauth_client: Option<OAuthClient>) -> Self {
        Self {
            state,
            oauth_client,
            storage: None,
            refresh_skew_secs: 60,
        }
    }

    /// Refreshed state is written back to `storage`.
    pub fn with_storage(mut self, storage: TokenStorage) -> Self {
        self.storage = Some(storage);
        self
    }

    /// The current token, renewed first when it is about to expire.
    pub async fn valid_access_token(&mut self) -> Result<String, CredentialError> {
        if self.should_refresh() {
            return self.renew().await;
        }
        Ok(self.state.access_token.clone())
    }

    pub fn state(&self) -> &OAuthState {
        &self.state
    }

    pub async fn refresh_now(&mut self) -> Result<String, CredentialError> {
        self.renew().await
    }

    fn should_refresh(&self) -> bool {
        self.state
            .expires_at
            .is_some_and(|expires_at| expires_at <= now_unix().saturating_add(self.refresh_skew_secs))
    }

    async fn renew(&mut self) -> Result<String, CredentialError> {
        let refresh_token = self
            .state
            .refresh_token
            .as_deref()
            .ok_or(CredentialError::MissingRefreshToken)?;
        let client = self
            .oauth_client
            .as_ref()
            .ok_or(CredentialError::MissingOAuthClient)?;
        let grant = client
            .refresh_token(refresh_token, self.state.scope.as_deref())
            .await?;
        self.state = self.state.succeeded_by(&grant);
        debug!(expires_at = ?self.state.expires_at, "access token renewed");
        self.persist();
        Ok(self.state.access_token.clone())
    }

    // Best effort; a failed save is only logged.
    fn persist(&self) {
        let Some(storage) = &self.storage else {
            return;
        };
        if let Err(err) = storage.save(&self.state) {
            warn!("could not save renewed credentials: {err}");
        }
    }
}

impl CredentialSource for TokenProvider {
    async fn access_token(&mut self) -> Result<String, CredentialError> {
        self.valid_access_token().await
    }

    async fn refresh(&mut self) -> Result<String, CredentialError> {
        self.refresh_now().await
    }
}

/// One credential source shared by every component that talks to the remote
/// store. Calls are serialized so concurrent refreshes cannot interleave.
pub struct SharedCredentials<C> {
    inner: Arc<Mutex<C>>,
}

impl<C> Clone for SharedCredentials<C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: CredentialSource> SharedCredentials<C> {
    pub fn new(source: C) -> Self {
        Self {
            inner: Arc::new(Mutex::new(source)),
        }
    }

    pub async fn access_token(&self) -> Result<String, CredentialError> {
        self.inner.lock().await.access_token().await
    }

    pub async fn refresh(&self) -> Result<String, CredentialError> {
        self.inner.lock().await.refresh().await
    }
}
