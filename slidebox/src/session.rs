use slidebox_core::RemoteFolder;
use thiserror::Error;
use tracing::{debug, info};

use crate::cache::PersistentCache;
use crate::extraction::{AbortHandle, ExtractionError, ExtractionService};
use crate::gateway::{GatewayError, MetadataGateway};
use crate::model::{Bucket, ExtractionStatus, KeyValueMap, MetadataUpdate};
use crate::state::{BulkOutcome, TriageStateStore};
use crate::sync::{
    SyncCoordinator, SyncError, SyncEvent, SyncReport, SyncState, SyncTrigger, TriggerOutcome,
};
use crate::token_provider::CredentialSource;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no folder loaded")]
    NoFolder,
    #[error("unknown item: {0}")]
    UnknownItem(String),
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadSummary {
    pub items: usize,
    pub from_cache: bool,
}

/// Application state for one signed-in user: the working set, the local
/// cache, the sync engine (write-behind stores only) and extraction.
pub struct TriageSession<G, C> {
    store: TriageStateStore<G>,
    cache: PersistentCache,
    sync: Option<SyncCoordinator<C>>,
    extraction: ExtractionService,
    folder_id: Option<String>,
}

impl<G: MetadataGateway, C: CredentialSource> TriageSession<G, C> {
    pub fn new(
        store: TriageStateStore<G>,
        cache: PersistentCache,
        sync: Option<SyncCoordinator<C>>,
        extraction: ExtractionService,
    ) -> Self {
        Self {
            store,
            cache,
            sync,
            extraction,
            folder_id: None,
        }
    }

    pub fn store(&self) -> &TriageStateStore<G> {
        &self.store
    }

    pub fn folder_id(&self) -> Option<&str> {
        self.folder_id.as_deref()
    }

    /// `None` when the store persists writes inline.
    pub fn sync_state(&self) -> Option<SyncState> {
        self.sync.as_ref().map(SyncCoordinator::state)
    }

    pub fn dirty_len(&self) -> usize {
        self.store.metadata().dirty_len()
    }

    /// Loads `folder_id` into the working set, from the listing cache unless
    /// it is stale or `force_refresh` is set.
    pub async fn load_folder(
        &mut self,
        folder_id: &str,
        force_refresh: bool,
    ) -> Result<LoadSummary, SessionError> {
        self.extraction.abort();
        let cached = if force_refresh {
            None
        } else {
            self.cache.cached_listing(folder_id).await
        };
        let from_cache = cached.is_some();
        let files = match cached {
            Some(files) => files,
            None => {
                let files = self.store.gateway().list_items(folder_id).await?;
                self.cache.store_listing(folder_id, &files).await;
                files
            }
        };
        let items = self.store.load_items(&files).await?;
        self.folder_id = Some(folder_id.to_string());
        info!(folder_id, items, from_cache, "folder loaded");
        Ok(LoadSummary { items, from_cache })
    }

    pub async fn list_folders(&self, parent_id: Option<&str>) -> Result<Vec<RemoteFolder>, SessionError> {
        Ok(self.store.gateway().list_folders(parent_id).await?)
    }

    pub async fn assign_to_bucket(&mut self, item_id: &str, bucket: Bucket) -> bool {
        let changed = self.store.assign_to_bucket(item_id, bucket);
        if changed {
            self.listing_outdated().await;
        }
        changed
    }

    pub async fn reorder_bucket(&mut self, bucket: Bucket, ordered_ids: &[String]) -> usize {
        let touched = self.store.reorder_bucket(bucket, ordered_ids);
        if touched > 0 {
            self.listing_outdated().await;
        }
        touched
    }

    pub async fn update_metadata(&mut self, item_id: &str, update: MetadataUpdate) -> bool {
        let changed = self.store.update_metadata(item_id, update);
        if changed {
            self.listing_outdated().await;
        }
        changed
    }

    pub async fn delete_items(&mut self, item_ids: &[String]) -> BulkOutcome {
        let outcome = self.store.delete_items(item_ids).await;
        self.forget_removed(&outcome).await;
        outcome
    }

    /// Moves items out of the loaded folder. Both folders' listings and the
    /// moved items' extracted metadata are invalidated.
    pub async fn move_to_folder(&mut self, item_ids: &[String], target_folder_id: &str) -> BulkOutcome {
        let outcome = self.store.move_to_folder(item_ids, target_folder_id).await;
        if !outcome.done.is_empty() {
            self.cache.clear_listing(target_folder_id).await;
        }
        self.forget_removed(&outcome).await;
        outcome
    }

    /// Extracts embedded metadata for one item, tracking the item's status.
    pub async fn extract(&mut self, item_id: &str) -> Result<KeyValueMap, SessionError> {
        let item = self
            .store
            .item(item_id)
            .cloned()
            .ok_or_else(|| SessionError::UnknownItem(item_id.to_string()))?;
        self.store.set_extraction_status(item_id, ExtractionStatus::Loading);
        let result = self
            .extraction
            .fetch(self.store.gateway(), &self.cache, &item)
            .await;
        let status = match &result {
            Ok(_) => ExtractionStatus::Loaded,
            Err(ExtractionError::Cancelled) => ExtractionStatus::Pending,
            Err(_) => ExtractionStatus::Error,
        };
        self.store.set_extraction_status(item_id, status);
        Ok(result?)
    }

    /// Aborts a running [`extract`](Self::extract) without borrowing the
    /// session.
    pub fn extraction_abort_handle(&self) -> AbortHandle {
        self.extraction.abort_handle()
    }

    /// Starts a sync cycle. Stores without write-behind have nothing to do.
    pub fn trigger_sync(&mut self, trigger: SyncTrigger) -> TriggerOutcome {
        match self.sync.as_mut() {
            Some(sync) => sync.trigger(self.store.metadata_mut(), trigger),
            None => TriggerOutcome::NothingDirty,
        }
    }

    /// Next event for the sync coordinator. Never resolves without one, so
    /// it can sit in a `select!` unconditionally.
    pub async fn next_sync_event(&mut self) -> Option<SyncEvent> {
        match self.sync.as_mut() {
            Some(sync) => sync.recv_event().await,
            None => std::future::pending().await,
        }
    }

    pub fn handle_sync_event(&mut self, event: SyncEvent) -> Result<Option<SyncReport>, SessionError> {
        let Some(sync) = self.sync.as_mut() else {
            return Ok(None);
        };
        Ok(sync.handle_event(self.store.metadata_mut(), event)?)
    }

    /// Drops the coordinator after its worker went away, requeueing the
    /// running cycle.
    pub fn sync_worker_lost(&mut self) -> Option<SyncReport> {
        let mut sync = self.sync.take()?;
        sync.worker_lost(self.store.metadata_mut())
    }

    /// Waits for pending inline writes, then pushes every dirty record.
    pub async fn flush(&mut self, trigger: SyncTrigger) -> Result<Vec<SyncReport>, SessionError> {
        self.store.gateway().drain().await;
        let Some(sync) = self.sync.as_mut() else {
            return Ok(Vec::new());
        };
        Ok(sync.flush(self.store.metadata_mut(), trigger).await?)
    }

    /// Stops extraction and flushes before the process exits.
    pub async fn close(&mut self) -> Result<Vec<SyncReport>, SessionError> {
        self.extraction.abort();
        let reports = self.flush(SyncTrigger::ProcessExit).await?;
        debug!(dirty = self.dirty_len(), "session closed");
        Ok(reports)
    }

    // Inline stores carry metadata on the listing itself, so a cached listing
    // of the current folder no longer matches what was written.
    async fn listing_outdated(&self) {
        if self.store.gateway().kind().is_write_behind() {
            return;
        }
        if let Some(folder_id) = self.folder_id.as_deref() {
            self.cache.clear_listing(folder_id).await;
        }
    }

    async fn forget_removed(&self, outcome: &BulkOutcome) {
        if outcome.done.is_empty() {
            return;
        }
        if let Some(folder_id) = self.folder_id.as_deref() {
            self.cache.clear_listing(folder_id).await;
        }
        self.cache.clear_extracted(&outcome.done).await;
    }
}

impl<G, C> TriageSession<G, C> {
    pub fn require_folder(&self) -> Result<&str, SessionError> {
        self.folder_id.as_deref().ok_or(SessionError::NoFolder)
    }
}
