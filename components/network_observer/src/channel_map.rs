//! Channel identity → activity record map

use crate::activity::{ActivityRecord, SharedRecord};
use crate::channel::ChannelId;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Map of in-flight activity records, keyed by channel identity
///
/// At most one record exists per live channel. Records leave the map either
/// explicitly ([`ChannelMap::remove`], [`ChannelMap::clear`]) or through the
/// idle sweep, so a long-running observer does not grow without bound.
#[derive(Debug, Default)]
pub struct ChannelMap {
    records: DashMap<ChannelId, SharedRecord>,
}

impl ChannelMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, channel_id: ChannelId) -> Option<SharedRecord> {
        self.records.get(&channel_id).map(|entry| entry.value().clone())
    }

    pub fn set(&self, channel_id: ChannelId, record: SharedRecord) {
        self.records.insert(channel_id, record);
    }

    /// Return the record for `channel_id`, creating it with `create` if absent.
    ///
    /// The boolean is `true` when a new record was inserted.
    pub fn get_or_insert_with<F>(&self, channel_id: ChannelId, create: F) -> (SharedRecord, bool)
    where
        F: FnOnce() -> ActivityRecord,
    {
        let mut created = false;
        let record = self
            .records
            .entry(channel_id)
            .or_insert_with(|| {
                created = true;
                Arc::new(Mutex::new(create()))
            })
            .value()
            .clone();
        (record, created)
    }

    pub fn remove(&self, channel_id: ChannelId) -> Option<SharedRecord> {
        self.records.remove(&channel_id).map(|(_, record)| record)
    }

    pub fn clear(&self) {
        debug!("Clearing {} tracked channels", self.records.len());
        self.records.clear();
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop records that have not seen any activity for `ttl`
    ///
    /// # Returns
    /// Number of records removed
    pub fn evict_idle(&self, ttl: Duration) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| record.try_lock().map_or(true, |r| r.idle_for() < ttl));
        let evicted = before.saturating_sub(self.records.len());
        if evicted > 0 {
            debug!("Evicted {} idle activity records", evicted);
        }
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::MockChannel;

    fn record(id: u64, channel_id: ChannelId) -> ActivityRecord {
        ActivityRecord::new(id, MockChannel::get(channel_id, "https://example.com/"), true)
    }

    #[test]
    fn test_get_or_insert_is_idempotent() {
        let map = ChannelMap::new();

        let (first, created) = map.get_or_insert_with(7, || record(1, 7));
        assert!(created);
        let (second, created) = map.get_or_insert_with(7, || record(2, 7));
        assert!(!created);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.lock().id(), 1);
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_set_get_remove() {
        let map = ChannelMap::new();
        assert!(map.get(1).is_none());

        map.set(1, Arc::new(Mutex::new(record(1, 1))));
        assert!(map.get(1).is_some());

        assert!(map.remove(1).is_some());
        assert!(map.remove(1).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_clear() {
        let map = ChannelMap::new();
        map.get_or_insert_with(1, || record(1, 1));
        map.get_or_insert_with(2, || record(2, 2));

        map.clear();
        assert!(map.is_empty());
    }

    #[test]
    fn test_evict_idle() {
        let map = ChannelMap::new();
        map.get_or_insert_with(1, || record(1, 1));
        map.get_or_insert_with(2, || record(2, 2));

        assert_eq!(map.evict_idle(Duration::from_secs(3600)), 0);
        assert_eq!(map.evict_idle(Duration::ZERO), 2);
        assert!(map.is_empty());
    }
}
