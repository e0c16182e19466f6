use std::collections::{HashMap, HashSet};

use crate::model::{MetadataUpdate, UserMetadataRecord};

/// Insertion-ordered set of item ids with unflushed local changes.
#[derive(Debug, Clone, Default)]
pub struct DirtySet {
    order: Vec<String>,
    members: HashSet<String>,
}

impl DirtySet {
    pub fn insert(&mut self, item_id: &str) -> bool {
        if !self.members.insert(item_id.to_string()) {
            return false;
        }
        self.order.push(item_id.to_string());
        true
    }

    pub fn remove(&mut self, item_id: &str) -> bool {
        if !self.members.remove(item_id) {
            return false;
        }
        self.order.retain(|id| id != item_id);
        true
    }

    pub fn contains(&self, item_id: &str) -> bool {
        self.members.contains(item_id)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }

    pub fn take(&mut self) -> Vec<String> {
        self.members.clear();
        std::mem::take(&mut self.order)
    }
}

/// Copy of the dirty ids and their records at the moment a flush starts.
/// An id without a record is a pending remote delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DirtySnapshot {
    pub ids: Vec<String>,
    pub records: HashMap<String, UserMetadataRecord>,
}

/// In-memory mirror of every loaded item's user metadata plus the dirty set.
#[derive(Debug, Default)]
pub struct MetadataCache {
    records: HashMap<String, UserMetadataRecord>,
    dirty: DirtySet,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, item_id: &str) -> Option<&UserMetadataRecord> {
        self.records.get(item_id)
    }

    pub fn insert(&mut self, item_id: &str, record: UserMetadataRecord) {
        self.records.insert(item_id.to_string(), record);
    }

    /// Applies `update` to an existing record. Unknown ids are ignored.
    pub fn apply(&mut self, item_id: &str, update: &MetadataUpdate) -> Option<&UserMetadataRecord> {
        let record = self.records.get_mut(item_id)?;
        record.apply(update);
        Some(record)
    }

    pub fn remove(&mut self, item_id: &str) -> Option<UserMetadataRecord> {
        self.records.remove(item_id)
    }

    /// Drops the record and any pending change for it.
    pub fn forget(&mut self, item_id: &str) {
        self.records.remove(item_id);
        self.dirty.remove(item_id);
    }

    pub fn mark_dirty(&mut self, item_id: &str) {
        self.dirty.insert(item_id);
    }

    pub fn is_dirty(&self, item_id: &str) -> bool {
        self.dirty.contains(item_id)
    }

    pub fn dirty_len(&self) -> usize {
        self.dirty.len()
    }

    pub fn dirty_ids(&self) -> Vec<String> {
        self.dirty.iter().map(str::to_string).collect()
    }

    /// Copies the dirty records out and clears the live set. Changes made
    /// after this call land in a fresh set.
    pub fn snapshot_dirty(&mut self) -> DirtySnapshot {
        let ids = self.dirty.take();
        let records = ids
            .iter()
            .filter_map(|id| self.records.get(id).map(|record| (id.clone(), record.clone())))
            .collect();
        DirtySnapshot { ids, records }
    }

    /// Puts ids back into the dirty set after a failed or aborted flush.
    pub fn requeue<I>(&mut self, item_ids: I)
    where
        I: IntoIterator<Item = String>,
    {
        for id in item_ids {
            self.dirty.insert(&id);
        }
    }

    /// Replaces the records with a freshly hydrated set. Dirty ids keep their
    /// local record (or stay absent, for pending deletes).
    pub fn replace_records(&mut self, mut fresh: HashMap<String, UserMetadataRecord>) {
        for id in self.dirty.iter() {
            match self.records.get(id) {
                Some(local) => {
                    fresh.insert(id.to_string(), local.clone());
                }
                None => {
                    fresh.remove(id);
                }
            }
        }
        self.records = fresh;
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Bucket;

    fn record(bucket: Bucket, order_key: i64) -> UserMetadataRecord {
        UserMetadataRecord {
            bucket,
            order_key,
            ..UserMetadataRecord::default()
        }
    }

    #[test]
    fn dirty_set_keeps_first_insertion_order() {
        let mut dirty = DirtySet::default();
        assert!(dirty.insert("b"));
        assert!(dirty.insert("a"));
        assert!(!dirty.insert("b"));
        assert_eq!(dirty.iter().collect::<Vec<_>>(), vec!["b", "a"]);
        assert!(dirty.remove("b"));
        assert_eq!(dirty.take(), vec!["a".to_string()]);
        assert!(dirty.is_empty());
    }

    #[test]
    fn snapshot_clears_live_set_and_marks_deletes() {
        let mut cache = MetadataCache::new();
        cache.insert("f1", record(Bucket::Out, 1));
        cache.insert("f3", record(Bucket::In, 3));
        cache.mark_dirty("f1");
        cache.mark_dirty("f2");
        cache.mark_dirty("f3");

        let snapshot = cache.snapshot_dirty();

        assert_eq!(snapshot.ids, vec!["f1", "f2", "f3"]);
        assert!(snapshot.records.contains_key("f1"));
        assert!(!snapshot.records.contains_key("f2"));
        assert_eq!(cache.dirty_len(), 0);

        cache.mark_dirty("f4");
        cache.requeue(vec!["f2".to_string(), "f4".to_string()]);
        assert_eq!(cache.dirty_ids(), vec!["f4", "f2"]);
    }

    #[test]
    fn replace_records_keeps_unflushed_changes() {
        let mut cache = MetadataCache::new();
        cache.insert("kept", record(Bucket::Priority, 9));
        cache.insert("clean", record(Bucket::In, 1));
        cache.mark_dirty("kept");
        cache.mark_dirty("deleted");

        let mut fresh = HashMap::new();
        fresh.insert("kept".to_string(), record(Bucket::In, 0));
        fresh.insert("clean".to_string(), record(Bucket::Out, 2));
        fresh.insert("deleted".to_string(), record(Bucket::In, 0));
        cache.replace_records(fresh);

        assert_eq!(cache.get("kept"), Some(&record(Bucket::Priority, 9)));
        assert_eq!(cache.get("clean"), Some(&record(Bucket::Out, 2)));
        assert!(cache.get("deleted").is_none());
    }

    #[test]
    fn apply_ignores_unknown_ids() {
        let mut cache = MetadataCache::new();
        assert!(cache.apply("missing", &MetadataUpdate::order(1)).is_none());
        assert!(cache.is_empty());
    }
}
