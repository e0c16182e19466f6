use std::collections::{HashMap, HashSet};

use futures_util::{StreamExt, stream};
use slidebox_core::{AppDocument, GraphClient, RemoteError, RemoteFile, RemoteFolder};
use tracing::{debug, warn};

use super::{GatewayError, MetadataGateway, ProviderKind, with_fresh_credential};
use crate::metadata::MetadataCache;
use crate::model::{Bucket, MetadataUpdate, UserMetadataRecord};
use crate::sync::{Credential, MetadataSink};
use crate::token_provider::{CredentialSource, SharedCredentials};

const FETCH_CONCURRENCY: usize = 8;

/// Gateway for stores that keep one metadata document per item in a private
/// application folder. Updates only touch the local cache and the dirty set;
/// the sync coordinator persists them later.
pub struct CompanionBlobGateway<C> {
    client: GraphClient,
    credentials: SharedCredentials<C>,
}

impl<C: CredentialSource> CompanionBlobGateway<C> {
    pub fn new(client: GraphClient, credentials: SharedCredentials<C>) -> Self {
        Self { client, credentials }
    }

    /// The client the sync worker writes documents through.
    pub fn client(&self) -> &GraphClient {
        &self.client
    }
}

impl<C: CredentialSource> MetadataGateway for CompanionBlobGateway<C> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OneDrive
    }

    async fn list_items(&self, folder_id: &str) -> Result<Vec<RemoteFile>, GatewayError> {
        with_fresh_credential(&self.credentials, |token| {
            let client = self.client.with_token(token);
            async move { client.list_images(folder_id).await }
        })
        .await
    }

    async fn list_folders(&self, parent_id: Option<&str>) -> Result<Vec<RemoteFolder>, GatewayError> {
        let parent_id = parent_id.unwrap_or("root");
        with_fresh_credential(&self.credentials, |token| {
            let client = self.client.with_token(token);
            async move { client.list_folders(parent_id).await }
        })
        .await
    }

    async fn hydrate(
        &self,
        files: &[RemoteFile],
    ) -> Result<HashMap<String, UserMetadataRecord>, GatewayError> {
        let wanted: HashSet<&str> = files.iter().map(|file| file.id.as_str()).collect();
        let listing = with_fresh_credential(&self.credentials, |token| {
            let client = self.client.with_token(token);
            async move { client.list_app_documents().await }
        })
        .await;
        // An app folder that cannot be listed (not created yet, for one)
        // means no stored metadata. Only a rejected credential is fatal.
        let documents = match listing {
            Ok(documents) => documents,
            Err(GatewayError::Remote(err)) if !err.is_auth_expired() => {
                warn!("app folder not listable, loading without stored metadata: {err}");
                return Ok(HashMap::new());
            }
            Err(err) => return Err(err),
        };
        let documents: Vec<AppDocument> = documents
            .into_iter()
            .filter(|document| wanted.contains(document.item_id.as_str()))
            .collect();
        let client = self.client.with_token(self.credentials.access_token().await?);

        let fetched: Vec<_> = stream::iter(documents)
            .map(|document| {
                let client = client.clone();
                async move {
                    let result = client
                        .get_app_document::<UserMetadataRecord>(&document.id)
                        .await;
                    (document.item_id, result)
                }
            })
            .buffer_unordered(FETCH_CONCURRENCY)
            .collect()
            .await;

        let mut records = HashMap::with_capacity(fetched.len());
        for (item_id, result) in fetched {
            match result {
                Ok(record) => {
                    records.insert(item_id, record);
                }
                Err(err) => warn!(item_id = %item_id, "skipping unreadable metadata document: {err}"),
            }
        }
        debug!(documents = records.len(), items = files.len(), "hydrated companion metadata");
        Ok(records)
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
        with_fresh_credential(&self.credentials, |token| {
            let client = self.client.with_token(token);
            async move { client.delete_item(item_id).await }
        })
        .await?;
        cache.remove(item_id);
        cache.mark_dirty(item_id);
        Ok(())
    }

    async fn move_to_folder(
        &self,
        cache: &mut MetadataCache,
        item_id: &str,
        folder_id: &str,
        order_key: i64,
    ) -> Result<(), GatewayError> {
        with_fresh_credential(&self.credentials, |token| {
            let client = self.client.with_token(token);
            async move { client.move_item(item_id, folder_id).await }
        })
        .await?;
        if cache.get(item_id).is_none() {
            cache.insert(item_id, UserMetadataRecord::default());
        }
        cache.apply(item_id, &MetadataUpdate::placement(Bucket::In, order_key));
        cache.mark_dirty(item_id);
        Ok(())
    }

    async fn fetch_head(&self, item_id: &str, max_bytes: u64) -> Result<Vec<u8>, GatewayError> {
        with_fresh_credential(&self.credentials, |token| {
            let client = self.client.with_token(token);
            async move { client.download_head(item_id, max_bytes).await }
        })
        .await
    }

    async fn drain(&self) {}
}

impl MetadataSink for GraphClient {
    async fn write_record(
        &self,
        credential: &Credential,
        item_id: &str,
        record: &UserMetadataRecord,
    ) -> Result<(), RemoteError> {
        self.with_token(credential.secret())
            .put_app_document(item_id, record)
            .await
    }

    async fn delete_record(&self, credential: &Credential, item_id: &str) -> Result<(), RemoteError> {
        self.with_token(credential.secret())
            .delete_app_document(item_id)
            .await
    }
}
