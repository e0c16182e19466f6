//! Provider-specific storage of user metadata behind one contract.
//!
//! The inline variant writes every change straight onto the remote item; the
//! companion variant keeps a document per item and defers writes to the
//! sync coordinator through the dirty set.

mod companion;
mod inline;
mod retry;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::str::FromStr;

use slidebox_core::{RemoteError, RemoteFile, RemoteFolder};
use thiserror::Error;
use tracing::debug;

use crate::metadata::MetadataCache;
use crate::model::{MetadataUpdate, UserMetadataRecord};
use crate::token_provider::{CredentialError, CredentialSource, SharedCredentials};

pub use companion::CompanionBlobGateway;
pub use inline::InlinePropertiesGateway;
pub use retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("remote request failed: {0}")]
    Remote(#[from] RemoteError),
    #[error("credentials unavailable: {0}")]
    Credentials(#[from] CredentialError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// Metadata stored as properties on the item (Drive-style store).
    GoogleDrive,
    /// Metadata stored as companion documents (Graph-style store).
    OneDrive,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::GoogleDrive => "googledrive",
            ProviderKind::OneDrive => "onedrive",
        }
    }

    /// Whether updates go through the dirty set and the sync coordinator.
    pub fn is_write_behind(&self) -> bool {
        matches!(self, ProviderKind::OneDrive)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "googledrive" | "google" | "gdrive" => Ok(ProviderKind::GoogleDrive),
            "onedrive" | "graph" => Ok(ProviderKind::OneDrive),
            other => Err(format!("unknown provider: {other}")),
        }
    }
}

pub trait MetadataGateway: Send + Sync {
    fn kind(&self) -> ProviderKind;

    fn list_items(
        &self,
        folder_id: &str,
    ) -> impl Future<Output = Result<Vec<RemoteFile>, GatewayError>> + Send;

    /// Folders under `parent_id`; without one, the store's default scope
    /// (every folder, or the drive root).
    fn list_folders(
        &self,
        parent_id: Option<&str>,
    ) -> impl Future<Output = Result<Vec<RemoteFolder>, GatewayError>> + Send;

    /// Reads the stored records for `files`. Items without stored metadata
    /// are simply absent from the result.
    fn hydrate(
        &self,
        files: &[RemoteFile],
    ) -> impl Future<Output = Result<HashMap<String, UserMetadataRecord>, GatewayError>> + Send;

    fn get_user_metadata(&self, cache: &MetadataCache, item_id: &str) -> Option<UserMetadataRecord> {
        cache.get(item_id).cloned()
    }

    /// Applies `update` locally and starts (or schedules) its persistence.
    /// Never waits on the network. Returns the updated record, or `None` for
    /// an unknown id.
    fn update_user_metadata(
        &self,
        cache: &mut MetadataCache,
        item_id: &str,
        update: &MetadataUpdate,
    ) -> Option<UserMetadataRecord>;

    fn delete_item(
        &self,
        cache: &mut MetadataCache,
        item_id: &str,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// Moves the item to another folder and resets its placement to the top
    /// of the inbox (`order_key`).
    fn move_to_folder(
        &self,
        cache: &mut MetadataCache,
        item_id: &str,
        folder_id: &str,
        order_key: i64,
    ) -> impl Future<Output = Result<(), GatewayError>> + Send;

    /// First `max_bytes` of the item content.
    fn fetch_head(
        &self,
        item_id: &str,
        max_bytes: u64,
    ) -> impl Future<Output = Result<Vec<u8>, GatewayError>> + Send;

    /// Resolves once every write already handed off has been attempted.
    fn drain(&self) -> impl Future<Output = ()> + Send;
}

/// Runs `call` with the current access token, and once more with a refreshed
/// token if the first attempt was rejected as unauthorized.
pub(crate) async fn with_fresh_credential<C, T, F, Fut>(
    credentials: &SharedCredentials<C>,
    mut call: F,
) -> Result<T, GatewayError>
where
    C: CredentialSource,
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let token = credentials.access_token().await?;
    match call(token).await {
        Err(err) if err.is_auth_expired() => {
            debug!("access token rejected, refreshing before retry");
            let token = credentials.refresh().await?;
            Ok(call(token).await?)
        }
        other => Ok(other?),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, HashSet};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use slidebox_core::{RemoteError, RemoteFile, RemoteFolder, StatusCode};

    use super::{GatewayError, MetadataGateway, ProviderKind};
    use crate::metadata::MetadataCache;
    use crate::model::{Bucket, MetadataUpdate, UserMetadataRecord};
    use crate::token_provider::{CredentialError, CredentialSource};

    fn api_error(status: StatusCode) -> GatewayError {
        GatewayError::Remote(RemoteError::Api {
            status,
            body: String::new(),
        })
    }

    /// Write-behind gateway backed by plain maps, for exercising the store.
    #[derive(Debug, Default)]
    pub struct MemoryGateway {
        pub listing: Vec<RemoteFile>,
        pub folders: Vec<RemoteFolder>,
        pub stored: HashMap<String, UserMetadataRecord>,
        pub failing: HashSet<String>,
        pub heads: HashMap<String, Vec<u8>>,
        /// Head fetches never resolve.
        pub stall_heads: bool,
        pub list_requests: Arc<AtomicUsize>,
        pub head_requests: Arc<AtomicUsize>,
    }

    impl MetadataGateway for MemoryGateway {
        fn kind(&self) -> ProviderKind {
            ProviderKind::OneDrive
        }

        async fn list_items(&self, _folder_id: &str) -> Result<Vec<RemoteFile>, GatewayError> {
            self.list_requests.fetch_add(1, Ordering::SeqCst);
            Ok(self.listing.clone())
        }

        async fn list_folders(&self, _parent_id: Option<&str>) -> Result<Vec<RemoteFolder>, GatewayError> {
            Ok(self.folders.clone())
        }

        async fn hydrate(
            &self,
            files: &[RemoteFile],
        ) -> Result<HashMap<String, UserMetadataRecord>, GatewayError> {
            Ok(files
                .iter()
                .filter_map(|file| {
                    self.stored
                        .get(&file.id)
                        .map(|record| (file.id.clone(), record.clone()))
                })
                .collect())
        }

        fn update_user_metadata(
            &self,
            cache: &mut MetadataCache,
            item_id: &str,
            update: &MetadataUpdate,
        ) -> Option<UserMetadataRecord> {
            let record = cache.apply(item_id, update)?.clone();
            cache.mark_dirty(item_id);
            Some(record)
        }

        async fn delete_item(&self, cache: &mut MetadataCache, item_id: &str) -> Result<(), GatewayError> {
            if self.failing.contains(item_id) {
                return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR));
            }
            cache.remove(item_id);
            cache.mark_dirty(item_id);
            Ok(())
        }

        async fn move_to_folder(
            &self,
            cache: &mut MetadataCache,
            item_id: &str,
            _folder_id: &str,
            order_key: i64,
        ) -> Result<(), GatewayError> {
            if self.failing.contains(item_id) {
                return Err(api_error(StatusCode::FORBIDDEN));
            }
            if cache.get(item_id).is_none() {
                cache.insert(item_id, UserMetadataRecord::default());
            }
            cache.apply(item_id, &MetadataUpdate::placement(Bucket::In, order_key));
            cache.mark_dirty(item_id);
            Ok(())
        }

        async fn fetch_head(&self, item_id: &str, _max_bytes: u64) -> Result<Vec<u8>, GatewayError> {
            self.head_requests.fetch_add(1, Ordering::SeqCst);
            if self.stall_heads {
                std::future::pending::<()>().await;
            }
            self.heads
                .get(item_id)
                .cloned()
                .ok_or_else(|| api_error(StatusCode::NOT_FOUND))
        }

        async fn drain(&self) {}
    }

    pub fn remote_file(id: &str, name: &str) -> RemoteFile {
        RemoteFile {
            id: id.into(),
            name: name.into(),
            mime_type: "image/png".into(),
            size: 1,
            created: None,
            modified: None,
            app_properties: HashMap::new(),
            parents: Vec::new(),
        }
    }

    /// Hands out `token-N`, bumping N on every refresh.
    #[derive(Debug, Clone, Default)]
    pub struct CountingCredentials {
        pub refreshes: Arc<AtomicUsize>,
        pub fail_refresh: bool,
        pub fail_access: bool,
        /// Lookups of that kind never resolve.
        pub stall_access: bool,
        pub stall_refresh: bool,
    }

    impl CountingCredentials {
        pub fn failing() -> Self {
            Self {
                fail_refresh: true,
                ..Self::default()
            }
        }

        pub fn refresh_count(&self) -> usize {
            self.refreshes.load(Ordering::SeqCst)
        }
    }

    impl CredentialSource for CountingCredentials {
        async fn access_token(&mut self) -> Result<String, CredentialError> {
            if self.stall_access {
                std::future::pending::<()>().await;
            }
            if self.fail_access {
                return Err(CredentialError::MissingRefreshToken);
            }
            Ok(format!("token-{}", self.refreshes.load(Ordering::SeqCst)))
        }

        async fn refresh(&mut self) -> Result<String, CredentialError> {
            if self.stall_refresh {
                std::future::pending::<()>().await;
            }
            if self.fail_refresh {
                return Err(CredentialError::MissingRefreshToken);
            }
            let next = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(format!("token-{next}"))
        }
    }
}
