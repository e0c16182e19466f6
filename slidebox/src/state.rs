use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use slidebox_core::RemoteFile;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::gateway::{GatewayError, MetadataGateway};
use crate::metadata::MetadataCache;
use crate::model::{Bucket, ExtractionStatus, Item, MetadataUpdate, UserMetadataRecord};

/// Broadcast after every change to bucket membership or order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketsChanged {
    pub revision: u64,
    pub counts: BTreeMap<Bucket, usize>,
}

/// Per-item result of a bulk remote operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    pub done: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Sort rule within a bucket: higher order key first, then name, then id.
pub fn compare_items(a: &Item, b: &Item) -> Ordering {
    b.order_key()
        .cmp(&a.order_key())
        .then_with(|| {
            a.display_name
                .to_lowercase()
                .cmp(&b.display_name.to_lowercase())
        })
        .then_with(|| a.display_name.cmp(&b.display_name))
        .then_with(|| a.id.cmp(&b.id))
}

/// The authoritative working set: which bucket every item is in, and where.
///
/// All mutations are synchronous and local. Persistence is delegated to the
/// gateway, which either writes immediately or marks the item dirty.
pub struct TriageStateStore<G> {
    gateway: G,
    metadata: MetadataCache,
    clock: Arc<dyn Clock>,
    items: HashMap<String, Item>,
    buckets: HashMap<Bucket, Vec<String>>,
    changes: watch::Sender<BucketsChanged>,
}

impl<G: MetadataGateway> TriageStateStore<G> {
    pub fn new(gateway: G, clock: Arc<dyn Clock>) -> Self {
        let (changes, _) = watch::channel(BucketsChanged::default());
        Self {
            gateway,
            metadata: MetadataCache::new(),
            clock,
            items: HashMap::new(),
            buckets: Bucket::ALL.into_iter().map(|b| (b, Vec::new())).collect(),
            changes,
        }
    }

    pub fn gateway(&self) -> &G {
        &self.gateway
    }

    pub fn metadata(&self) -> &MetadataCache {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut MetadataCache {
        &mut self.metadata
    }

    pub fn subscribe(&self) -> watch::Receiver<BucketsChanged> {
        self.changes.subscribe()
    }

    pub fn item(&self, item_id: &str) -> Option<&Item> {
        self.items.get(item_id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn counts(&self) -> BTreeMap<Bucket, usize> {
        Bucket::ALL
            .into_iter()
            .map(|bucket| (bucket, self.buckets.get(&bucket).map_or(0, Vec::len)))
            .collect()
    }

    /// Replaces the working set with `files`, merged with the stored user
    /// metadata. Unflushed local changes win over what the store returns.
    pub async fn load_items(&mut self, files: &[RemoteFile]) -> Result<usize, GatewayError> {
        let records = self.gateway.hydrate(files).await?;
        self.metadata.replace_records(records);

        self.items.clear();
        for file in files {
            let record = match self.metadata.get(&file.id) {
                Some(record) => record.clone(),
                None if self.metadata.is_dirty(&file.id) => {
                    debug!(item_id = %file.id, "skipping item pending remote delete");
                    continue;
                }
                None => {
                    let record = UserMetadataRecord::default();
                    self.metadata.insert(&file.id, record.clone());
                    record
                }
            };
            self.items.insert(file.id.clone(), Item::from_remote(file, record));
        }
        self.rebuild_buckets();
        self.publish();
        Ok(self.items.len())
    }

    /// Moves an item to `target`. Moving to another bucket puts it on top;
    /// re-triaging within its own bucket sends it to the bottom. Unknown ids
    /// are ignored.
    pub fn assign_to_bucket(&mut self, item_id: &str, target: Bucket) -> bool {
        let Some(source) = self.items.get(item_id).map(Item::bucket) else {
            debug!(item_id, "assign ignored for unknown item");
            return false;
        };
        let now = self.clock.now_millis();
        let order_key = if source == target {
            self.bucket_ids(target)
                .iter()
                .filter(|id| id.as_str() != item_id)
                .filter_map(|id| self.items.get(id))
                .map(Item::order_key)
                .min()
                .unwrap_or(now)
                .saturating_sub(1)
        } else {
            now
        };

        self.apply_update(item_id, &MetadataUpdate::placement(target, order_key));
        if source != target {
            self.bucket_ids_mut(source).retain(|id| id != item_id);
            self.bucket_ids_mut(target).push(item_id.to_string());
        }
        self.sort_bucket(target);
        self.publish();
        true
    }

    /// Puts the listed items on top of `bucket`, in the given order, followed
    /// by the remaining items in their current order. Every item in the bucket
    /// gets a fresh, strictly decreasing order key. Returns the number of
    /// items touched; ids not in the bucket are ignored.
    pub fn reorder_bucket(&mut self, bucket: Bucket, ordered_ids: &[String]) -> usize {
        let order = {
            let current = self.bucket_ids(bucket);
            let members: HashSet<&str> = current.iter().map(String::as_str).collect();
            let mut placed: HashSet<&str> = HashSet::new();
            let mut order = Vec::with_capacity(current.len());
            for id in ordered_ids {
                if members.contains(id.as_str()) && placed.insert(id.as_str()) {
                    order.push(id.clone());
                }
            }
            if placed.is_empty() {
                return 0;
            }
            order.extend(
                current
                    .iter()
                    .filter(|id| !placed.contains(id.as_str()))
                    .cloned(),
            );
            order
        };

        let now = self.clock.now_millis();
        for (position, item_id) in order.iter().enumerate() {
            let order_key = now.saturating_sub(position as i64);
            self.apply_update(item_id, &MetadataUpdate::order(order_key));
        }
        let touched = order.len();
        self.buckets.insert(bucket, order);
        self.sort_bucket(bucket);
        self.publish();
        touched
    }

    /// Items of `bucket`, in display order.
    pub fn current_bucket_contents(&self, bucket: Bucket) -> Vec<&Item> {
        self.bucket_ids(bucket)
            .iter()
            .filter_map(|id| self.items.get(id))
            .collect()
    }

    /// Edits tags, ratings or notes. Placement fields are ignored here; they
    /// only change through [`Self::assign_to_bucket`] and
    /// [`Self::reorder_bucket`].
    pub fn update_metadata(&mut self, item_id: &str, update: MetadataUpdate) -> bool {
        let update = MetadataUpdate {
            bucket: None,
            order_key: None,
            ..update
        };
        if update.is_empty() || !self.items.contains_key(item_id) {
            return false;
        }
        self.apply_update(item_id, &update);
        self.publish();
        true
    }

    pub fn known_tags(&self) -> BTreeSet<String> {
        self.items
            .values()
            .flat_map(|item| item.user.tags.iter().cloned())
            .collect()
    }

    /// Deletes items remotely, then drops them from the working set.
    pub async fn delete_items(&mut self, item_ids: &[String]) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for item_id in item_ids {
            if !self.items.contains_key(item_id) {
                continue;
            }
            match self.gateway.delete_item(&mut self.metadata, item_id).await {
                Ok(()) => {
                    self.remove_item(item_id);
                    outcome.done.push(item_id.clone());
                }
                Err(err) => {
                    warn!(item_id = %item_id, "delete failed: {err}");
                    outcome.failed.push((item_id.clone(), err.to_string()));
                }
            }
        }
        if !outcome.done.is_empty() {
            self.publish();
        }
        outcome
    }

    /// Moves items to another folder; they leave the working set and will
    /// show up on top of the inbox there.
    pub async fn move_to_folder(&mut self, item_ids: &[String], folder_id: &str) -> BulkOutcome {
        let mut outcome = BulkOutcome::default();
        for item_id in item_ids {
            if !self.items.contains_key(item_id) {
                continue;
            }
            let order_key = self.clock.now_millis();
            match self
                .gateway
                .move_to_folder(&mut self.metadata, item_id, folder_id, order_key)
                .await
            {
                Ok(()) => {
                    self.remove_item(item_id);
                    outcome.done.push(item_id.clone());
                }
                Err(err) => {
                    warn!(item_id = %item_id, folder_id, "move failed: {err}");
                    outcome.failed.push((item_id.clone(), err.to_string()));
                }
            }
        }
        if !outcome.done.is_empty() {
            self.publish();
        }
        outcome
    }

    pub fn set_extraction_status(&mut self, item_id: &str, status: ExtractionStatus) -> bool {
        match self.items.get_mut(item_id) {
            Some(item) => {
                item.extraction_status = status;
                true
            }
            None => false,
        }
    }

    fn apply_update(&mut self, item_id: &str, update: &MetadataUpdate) {
        let Some(item) = self.items.get_mut(item_id) else {
            return;
        };
        if self.metadata.get(item_id).is_none() {
            self.metadata.insert(item_id, item.user.clone());
        }
        if let Some(record) = self
            .gateway
            .update_user_metadata(&mut self.metadata, item_id, update)
        {
            item.user = record;
        }
    }

    fn remove_item(&mut self, item_id: &str) {
        if let Some(item) = self.items.remove(item_id) {
            self.bucket_ids_mut(item.bucket()).retain(|id| id != item_id);
        }
    }

    fn rebuild_buckets(&mut self) {
        for ids in self.buckets.values_mut() {
            ids.clear();
        }
        for item in self.items.values() {
            self.buckets
                .entry(item.bucket())
                .or_default()
                .push(item.id.clone());
        }
        for bucket in Bucket::ALL {
            self.sort_bucket(bucket);
        }
    }

    fn sort_bucket(&mut self, bucket: Bucket) {
        let items = &self.items;
        if let Some(ids) = self.buckets.get_mut(&bucket) {
            ids.sort_by(|a, b| match (items.get(a), items.get(b)) {
                (Some(a), Some(b)) => compare_items(a, b),
                _ => a.cmp(b),
            });
        }
    }

    fn bucket_ids(&self, bucket: Bucket) -> &[String] {
        self.buckets.get(&bucket).map_or(&[], Vec::as_slice)
    }

    fn bucket_ids_mut(&mut self, bucket: Bucket) -> &mut Vec<String> {
        self.buckets.entry(bucket).or_default()
    }

    fn publish(&self) {
        let counts = self.counts();
        self.changes.send_modify(|state| {
            state.revision += 1;
            state.counts = counts;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::gateway::testing::{MemoryGateway, remote_file};
    use crate::model::parse_tags;

    const T0: i64 = 1_700_000_000_000;

    fn placed(bucket: Bucket, order_key: i64) -> UserMetadataRecord {
        UserMetadataRecord {
            bucket,
            order_key,
            ..UserMetadataRecord::default()
        }
    }

    async fn store_with(
        files: &[(&str, &str, Bucket, i64)],
    ) -> (TriageStateStore<MemoryGateway>, ManualClock) {
        let mut gateway = MemoryGateway::default();
        let mut listing = Vec::new();
        for (id, name, bucket, key) in files {
            listing.push(remote_file(id, name));
            gateway.stored.insert(id.to_string(), placed(*bucket, *key));
        }
        let clock = ManualClock::new(T0);
        let mut store = TriageStateStore::new(gateway, Arc::new(clock.clone()));
        store.load_items(&listing).await.unwrap();
        (store, clock)
    }

    fn ids(store: &TriageStateStore<MemoryGateway>, bucket: Bucket) -> Vec<String> {
        store
            .current_bucket_contents(bucket)
            .into_iter()
            .map(|item| item.id.clone())
            .collect()
    }

    fn assert_sorted_and_disjoint(store: &TriageStateStore<MemoryGateway>) {
        let mut seen = HashSet::new();
        for bucket in Bucket::ALL {
            let contents = store.current_bucket_contents(bucket);
            for pair in contents.windows(2) {
                assert_ne!(compare_items(pair[0], pair[1]), Ordering::Greater);
            }
            for item in contents {
                assert_eq!(item.bucket(), bucket);
                assert!(seen.insert(item.id.clone()), "{} listed twice", item.id);
            }
        }
        assert_eq!(seen.len(), store.len());
    }

    #[tokio::test]
    async fn buckets_sort_by_key_then_name() {
        let (store, _) = store_with(&[
            ("a", "b.png", Bucket::In, 5),
            ("b", "A.png", Bucket::In, 5),
            ("c", "z.png", Bucket::In, 9),
            ("d", "x.png", Bucket::Out, 1),
        ])
        .await;

        assert_eq!(ids(&store, Bucket::In), vec!["c", "b", "a"]);
        assert_eq!(ids(&store, Bucket::Out), vec!["d"]);
        assert_sorted_and_disjoint(&store);
        assert_eq!(store.metadata().dirty_len(), 0);
    }

    #[tokio::test]
    async fn moving_to_another_bucket_puts_item_on_top() {
        let (mut store, clock) = store_with(&[
            ("x", "x.png", Bucket::In, 10),
            ("y", "y.png", Bucket::Out, T0 + 50),
        ])
        .await;
        clock.set(T0 + 100);

        assert!(store.assign_to_bucket("x", Bucket::Out));

        assert!(ids(&store, Bucket::In).is_empty());
        assert_eq!(ids(&store, Bucket::Out), vec!["x", "y"]);
        assert_eq!(store.item("x").unwrap().order_key(), T0 + 100);
        assert!(store.metadata().is_dirty("x"));
        assert_eq!(store.metadata().get("x").unwrap().bucket, Bucket::Out);
        assert_sorted_and_disjoint(&store);
    }

    #[tokio::test]
    async fn re_triage_within_bucket_sends_item_to_bottom() {
        let (mut store, _) = store_with(&[
            ("a", "a.png", Bucket::Priority, 30),
            ("b", "b.png", Bucket::Priority, 20),
            ("c", "c.png", Bucket::Priority, 10),
        ])
        .await;

        assert!(store.assign_to_bucket("a", Bucket::Priority));

        assert_eq!(store.item("a").unwrap().order_key(), 9);
        assert_eq!(ids(&store, Bucket::Priority), vec!["b", "c", "a"]);
        assert!(store.metadata().is_dirty("a"));
    }

    #[tokio::test]
    async fn re_triage_of_a_lone_item_uses_the_clock() {
        let (mut store, _) = store_with(&[("a", "a.png", Bucket::Trash, 30)]).await;
        assert!(store.assign_to_bucket("a", Bucket::Trash));
        assert_eq!(store.item("a").unwrap().order_key(), T0 - 1);
    }

    #[tokio::test]
    async fn reorder_places_listed_items_first() {
        let (mut store, _) = store_with(&[
            ("a", "a.png", Bucket::Out, 4),
            ("b", "b.png", Bucket::Out, 3),
            ("c", "c.png", Bucket::Out, 2),
            ("d", "d.png", Bucket::Out, 1),
        ])
        .await;

        let touched = store.reorder_bucket(
            Bucket::Out,
            &["c".to_string(), "a".to_string(), "b".to_string(), "c".to_string()],
        );

        assert_eq!(touched, 4);
        assert_eq!(ids(&store, Bucket::Out), vec!["c", "a", "b", "d"]);
        for id in ["a", "b", "c"] {
            assert!(store.metadata().is_dirty(id));
        }
        assert_eq!(store.item("c").unwrap().order_key(), T0);
        assert_eq!(store.item("d").unwrap().order_key(), T0 - 3);
    }

    #[tokio::test]
    async fn reorder_ignores_ids_from_other_buckets() {
        let (mut store, _) = store_with(&[
            ("a", "a.png", Bucket::Out, 2),
            ("z", "z.png", Bucket::In, 1),
        ])
        .await;
        assert_eq!(store.reorder_bucket(Bucket::Out, &["z".to_string()]), 0);
        assert_eq!(store.metadata().dirty_len(), 0);
    }

    #[tokio::test]
    async fn unknown_ids_are_silent_no_ops() {
        let (mut store, _) = store_with(&[("a", "a.png", Bucket::In, 1)]).await;
        let before = store.subscribe().borrow().revision;

        assert!(!store.assign_to_bucket("ghost", Bucket::Out));
        assert!(!store.update_metadata("ghost", MetadataUpdate::order(1)));
        assert!(store.delete_items(&["ghost".to_string()]).await.done.is_empty());

        assert_eq!(store.subscribe().borrow().revision, before);
        assert_eq!(store.metadata().dirty_len(), 0);
    }

    #[tokio::test]
    async fn observers_see_counts_after_each_mutation() {
        let (mut store, _) = store_with(&[
            ("a", "a.png", Bucket::In, 2),
            ("b", "b.png", Bucket::In, 1),
        ])
        .await;
        let mut changes = store.subscribe();
        changes.borrow_and_update();

        store.assign_to_bucket("a", Bucket::Trash);

        assert!(changes.has_changed().unwrap());
        let state = changes.borrow_and_update().clone();
        assert_eq!(state.counts[&Bucket::In], 1);
        assert_eq!(state.counts[&Bucket::Trash], 1);
    }

    #[tokio::test]
    async fn metadata_edits_do_not_move_items() {
        let (mut store, _) = store_with(&[("a", "a.png", Bucket::In, 2)]).await;

        assert!(store.update_metadata(
            "a",
            MetadataUpdate {
                bucket: Some(Bucket::Trash),
                tags: Some(parse_tags("sky,sea")),
                quality_rating: Some(9),
                ..MetadataUpdate::default()
            },
        ));

        let item = store.item("a").unwrap();
        assert_eq!(item.bucket(), Bucket::In);
        assert_eq!(item.user.quality_rating, 5);
        assert_eq!(store.known_tags(), parse_tags("sea,sky"));
        assert!(store.metadata().is_dirty("a"));
    }

    #[tokio::test]
    async fn delete_removes_item_and_leaves_tombstone() {
        let (mut store, _) = store_with(&[
            ("a", "a.png", Bucket::In, 2),
            ("b", "b.png", Bucket::In, 1),
        ])
        .await;

        let outcome = store.delete_items(&["a".to_string()]).await;

        assert_eq!(outcome.done, vec!["a"]);
        assert!(store.item("a").is_none());
        assert_eq!(ids(&store, Bucket::In), vec!["b"]);
        assert!(store.metadata().is_dirty("a"));
        assert!(store.metadata().get("a").is_none());
    }

    #[tokio::test]
    async fn failed_moves_keep_the_item() {
        let mut gateway = MemoryGateway::default();
        gateway.failing.insert("b".to_string());
        let listing = vec![remote_file("a", "a.png"), remote_file("b", "b.png")];
        let mut store = TriageStateStore::new(gateway, Arc::new(ManualClock::new(T0)));
        store.load_items(&listing).await.unwrap();

        let outcome = store
            .move_to_folder(&["a".to_string(), "b".to_string()], "elsewhere")
            .await;

        assert_eq!(outcome.done, vec!["a"]);
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(ids(&store, Bucket::In), vec!["b"]);
        let moved = store.metadata().get("a").unwrap();
        assert_eq!(moved.bucket, Bucket::In);
        assert_eq!(moved.order_key, T0);
    }

    #[tokio::test]
    async fn reload_keeps_unflushed_changes_and_pending_deletes() {
        let (mut store, clock) = store_with(&[
            ("a", "a.png", Bucket::In, 2),
            ("b", "b.png", Bucket::In, 1),
        ])
        .await;
        clock.set(T0 + 10);
        store.assign_to_bucket("a", Bucket::Priority);
        store.delete_items(&["b".to_string()]).await;

        let listing = vec![remote_file("a", "a.png"), remote_file("b", "b.png")];
        store.load_items(&listing).await.unwrap();

        assert_eq!(ids(&store, Bucket::Priority), vec!["a"]);
        assert!(store.item("b").is_none());
        assert_eq!(store.metadata().dirty_ids(), vec!["a", "b"]);
    }
}
