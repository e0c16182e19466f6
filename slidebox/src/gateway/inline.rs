use std::collections::HashMap;

use slidebox_core::{DriveClient, RemoteFile, RemoteFolder};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use super::{GatewayError, MetadataGateway, ProviderKind, RetryPolicy, with_fresh_credential};
use crate::metadata::MetadataCache;
use crate::model::{Bucket, KeyValueMap, MetadataUpdate, UserMetadataRecord};
use crate::token_provider::{CredentialSource, SharedCredentials};

struct PropertyWrite {
    item_id: String,
    properties: KeyValueMap,
}

enum WriterMessage {
    Write(PropertyWrite),
    Drain(oneshot::Sender<()>),
}

/// Gateway for stores that carry metadata as properties on the item record.
///
/// Every update is written immediately, without dirty tracking. Writes are
/// handed to a single writer task, so the caller never waits and writes for
/// one item reach the store in the order they were made.
pub struct InlinePropertiesGateway<C> {
    client: DriveClient,
    credentials: SharedCredentials<C>,
    writes: mpsc::UnboundedSender<WriterMessage>,
}

impl<C: CredentialSource> InlinePropertiesGateway<C> {
    /// Spawns the writer task; must be called inside a Tokio runtime.
    pub fn new(client: DriveClient, credentials: SharedCredentials<C>) -> Self {
        Self::with_retry_policy(client, credentials, RetryPolicy::default())
    }

    pub fn with_retry_policy(
        client: DriveClient,
        credentials: SharedCredentials<C>,
        policy: RetryPolicy,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_writer(client.clone(), credentials.clone(), rx, policy));
        Self {
            client,
            credentials,
            writes: tx,
        }
    }

    fn enqueue(&self, item_id: &str, update: &MetadataUpdate) {
        let write = PropertyWrite {
            item_id: item_id.to_string(),
            properties: update.to_properties(),
        };
        if self.writes.send(WriterMessage::Write(write)).is_err() {
            warn!(item_id, "property writer stopped; update kept locally only");
        }
    }
}

impl<C: CredentialSource> MetadataGateway for InlinePropertiesGateway<C> {
    fn kind(&self) -> ProviderKind {
        ProviderKind::GoogleDrive
    }

    async fn list_items(&self, folder_id: &str) -> Result<Vec<RemoteFile>, GatewayError> {
        with_fresh_credential(&self.credentials, |token| {
            let client = self.client.with_token(token);
            async move { client.list_images(folder_id).await }
        })
        .await
    }

    async fn list_folders(&self, parent_id: Option<&str>) -> Result<Vec<RemoteFolder>, GatewayError> {
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
        Ok(files
            .iter()
            .filter(|file| !file.app_properties.is_empty())
            .map(|file| {
                (
                    file.id.clone(),
                    UserMetadataRecord::from_properties(&file.app_properties),
                )
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
        if !update.is_empty() {
            self.enqueue(item_id, update);
        }
        Some(record)
    }

    async fn delete_item(&self, cache: &mut MetadataCache, item_id: &str) -> Result<(), GatewayError> {
        with_fresh_credential(&self.credentials, |token| {
            let client = self.client.with_token(token);
            async move { client.trash_file(item_id).await }
        })
        .await?;
        cache.forget(item_id);
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
            async move { client.move_to_folder(item_id, folder_id).await }
        })
        .await?;
        self.enqueue(item_id, &MetadataUpdate::placement(Bucket::In, order_key));
        cache.forget(item_id);
        Ok(())
    }

    async fn fetch_head(&self, item_id: &str, max_bytes: u64) -> Result<Vec<u8>, GatewayError> {
        with_fresh_credential(&self.credentials, |token| {
            let client = self.client.with_token(token);
            async move { client.download_head(item_id, max_bytes).await }
        })
        .await
    }

    async fn drain(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.writes.send(WriterMessage::Drain(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

async fn run_writer<C: CredentialSource>(
    client: DriveClient,
    credentials: SharedCredentials<C>,
    mut rx: mpsc::UnboundedReceiver<WriterMessage>,
    policy: RetryPolicy,
) {
    while let Some(message) = rx.recv().await {
        match message {
            WriterMessage::Write(write) => write_with_retry(&client, &credentials, &write, policy).await,
            WriterMessage::Drain(done) => {
                let _ = done.send(());
            }
        }
    }
    debug!("property writer stopped");
}

async fn write_with_retry<C: CredentialSource>(
    client: &DriveClient,
    credentials: &SharedCredentials<C>,
    write: &PropertyWrite,
    policy: RetryPolicy,
) {
    let mut attempt = 0;
    loop {
        let result = with_fresh_credential(credentials, |token| {
            let client = client.with_token(token);
            async move {
                client
                    .update_app_properties(&write.item_id, &write.properties)
                    .await
            }
        })
        .await;
        match result {
            Ok(()) => {
                debug!(item_id = %write.item_id, "properties written");
                return;
            }
            Err(GatewayError::Remote(err)) if err.is_retryable() && policy.allows_retry_after(attempt) => {
                let delay = policy.delay(attempt);
                debug!(item_id = %write.item_id, attempt, ?delay, "property write failed, retrying: {err}");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                warn!(item_id = %write.item_id, "giving up on property write: {err}");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::gateway::testing::CountingCredentials;
    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn gateway(server: &MockServer) -> (InlinePropertiesGateway<CountingCredentials>, CountingCredentials) {
        let source = CountingCredentials::default();
        let client = DriveClient::with_base_url(&server.uri(), "unused").unwrap();
        let policy = RetryPolicy::new(Duration::from_millis(1), Duration::from_millis(5), 3);
        (
            InlinePropertiesGateway::with_retry_policy(client, SharedCredentials::new(source.clone()), policy),
            source,
        )
    }

    fn remote(id: &str, properties: &[(&str, &str)]) -> RemoteFile {
        RemoteFile {
            id: id.into(),
            name: format!("{id}.png"),
            mime_type: "image/png".into(),
            size: 1,
            created: None,
            modified: None,
            app_properties: properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            parents: vec!["folder".into()],
        }
    }

    #[tokio::test]
    async fn hydrate_reads_inline_properties() {
        let server = MockServer::start().await;
        let (gateway, _) = gateway(&server);
        let files = vec![
            remote("a", &[("bucket", "out"), ("orderKey", "12")]),
            remote("b", &[]),
        ];

        let records = gateway.hydrate(&files).await.unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records["a"].bucket, Bucket::Out);
        assert_eq!(records["a"].order_key, 12);
    }

    #[tokio::test]
    async fn update_writes_immediately_without_marking_dirty() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/drive/v3/files/a"))
            .and(header("authorization", "Bearer token-0"))
            .and(body_json(json!({ "appProperties": { "bucket": "out", "orderKey": "99" } })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "a" })))
            .expect(1)
            .mount(&server)
            .await;
        let (gateway, _) = gateway(&server);
        let mut cache = MetadataCache::new();
        cache.insert("a", UserMetadataRecord::default());

        let record = gateway
            .update_user_metadata(&mut cache, "a", &MetadataUpdate::placement(Bucket::Out, 99))
            .unwrap();
        gateway.drain().await;

        assert_eq!(record.bucket, Bucket::Out);
        assert_eq!(cache.dirty_len(), 0);
    }

    #[tokio::test]
    async fn transient_write_failures_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/drive/v3/files/a"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/drive/v3/files/a"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "a" })))
            .expect(1)
            .mount(&server)
            .await;
        let (gateway, _) = gateway(&server);
        let mut cache = MetadataCache::new();
        cache.insert("a", UserMetadataRecord::default());

        gateway.update_user_metadata(&mut cache, "a", &MetadataUpdate::order(5));
        gateway.drain().await;
    }

    #[tokio::test]
    async fn expired_token_is_refreshed_for_ui_calls() {
        let server = MockServer::start().await;
        Mock::given(method("PATCH"))
            .and(path("/drive/v3/files/a"))
            .and(header("authorization", "Bearer token-0"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;
        Mock::given(method("PATCH"))
            .and(path("/drive/v3/files/a"))
            .and(header("authorization", "Bearer token-1"))
            .and(body_json(json!({ "trashed": true })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "a" })))
            .expect(1)
            .mount(&server)
            .await;
        let (gateway, source) = gateway(&server);
        let mut cache = MetadataCache::new();
        cache.insert("a", UserMetadataRecord::default());

        gateway.delete_item(&mut cache, "a").await.unwrap();

        assert_eq!(source.refresh_count(), 1);
        assert!(cache.get("a").is_none());
    }

    #[tokio::test]
    async fn unknown_items_are_not_written() {
        let server = MockServer::start().await;
        let (gateway, _) = gateway(&server);
        let mut cache = MetadataCache::new();

        assert!(
            gateway
                .update_user_metadata(&mut cache, "ghost", &MetadataUpdate::order(1))
                .is_none()
        );
        gateway.drain().await;
        assert!(server.received_requests().await.unwrap().is_empty());
    }
}
