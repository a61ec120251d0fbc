//! Tagged time-series store
//!
//! The post-processor only needs point access per hour and tag group plus an
//! enumeration of the tag groups present. [`MemoryStore`] keeps one lock per
//! hour so that independent hours can be rewritten concurrently.

use crate::cost::CostAndUsage;
use crate::tags::TagGroup;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// Hourly tagged time-series store
///
/// All methods take `&self`; implementations provide their own interior
/// synchronization.
pub trait TagGroupStore: Send + Sync {
    /// Number of hours held by the store
    fn num_hours(&self) -> usize;

    /// Value for one hour and tag group
    fn get(&self, hour: usize, tag_group: &TagGroup) -> Option<CostAndUsage>;

    /// Overwrite the value for one hour and tag group
    fn put(&self, hour: usize, tag_group: TagGroup, value: CostAndUsage);

    /// Accumulate into the value for one hour and tag group
    fn add(&self, hour: usize, tag_group: TagGroup, value: CostAndUsage);

    /// Remove the value for one hour and tag group, returning the old value
    fn remove(&self, hour: usize, tag_group: &TagGroup) -> Option<CostAndUsage>;

    /// All tag groups that have a value in at least one hour, in sorted order
    fn tag_groups(&self) -> Vec<TagGroup>;

    /// Snapshot of one hour
    fn hour_data(&self, hour: usize) -> Vec<(TagGroup, CostAndUsage)>;
}

type HourMap = FxHashMap<TagGroup, CostAndUsage>;

/// In-memory store with one `RwLock` per hour
pub struct MemoryStore {
    hours: RwLock<Vec<RwLock<HourMap>>>,
}

impl MemoryStore {
    /// Create a store pre-sized for `num_hours` hours
    pub fn new(num_hours: usize) -> Self {
        let hours = (0..num_hours).map(|_| RwLock::new(HourMap::default())).collect();
        Self {
            hours: RwLock::new(hours),
        }
    }

    /// Run `f` with write access to the map for `hour`, growing the store when needed
    fn with_hour_mut<R>(&self, hour: usize, f: impl FnOnce(&mut HourMap) -> R) -> R {
        {
            let hours = self.hours.read();
            if let Some(map) = hours.get(hour) {
                return f(&mut map.write());
            }
        }
        let mut hours = self.hours.write();
        while hours.len() <= hour {
            hours.push(RwLock::new(HourMap::default()));
        }
        f(hours[hour].get_mut())
    }

    /// Get statistics about stored data
    pub fn stats(&self) -> MemoryStats {
        let hours = self.hours.read();
        MemoryStats {
            num_hours: hours.len(),
            num_values: hours.iter().map(|h| h.read().len()).sum(),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(0)
    }
}

/// Statistics about memory store usage
#[derive(Debug, Clone)]
pub struct MemoryStats {
    pub num_hours: usize,
    pub num_values: usize,
}

impl TagGroupStore for MemoryStore {
    fn num_hours(&self) -> usize {
        self.hours.read().len()
    }

    fn get(&self, hour: usize, tag_group: &TagGroup) -> Option<CostAndUsage> {
        let hours = self.hours.read();
        let map = hours.get(hour)?.read();
        map.get(tag_group).copied()
    }

    fn put(&self, hour: usize, tag_group: TagGroup, value: CostAndUsage) {
        self.with_hour_mut(hour, |map| {
            map.insert(tag_group, value);
        });
    }

    fn add(&self, hour: usize, tag_group: TagGroup, value: CostAndUsage) {
        self.with_hour_mut(hour, |map| {
            *map.entry(tag_group).or_default() += value;
        });
    }

    fn remove(&self, hour: usize, tag_group: &TagGroup) -> Option<CostAndUsage> {
        let hours = self.hours.read();
        let mut map = hours.get(hour)?.write();
        map.remove(tag_group)
    }

    fn tag_groups(&self) -> Vec<TagGroup> {
        let hours = self.hours.read();
        let mut set = BTreeSet::new();
        for hour in hours.iter() {
            for tg in hour.read().keys() {
                if !set.contains(tg) {
                    set.insert(tg.clone());
                }
            }
        }
        set.into_iter().collect()
    }

    fn hour_data(&self, hour: usize) -> Vec<(TagGroup, CostAndUsage)> {
        let hours = self.hours.read();
        match hours.get(hour) {
            Some(map) => map
                .read()
                .iter()
                .map(|(tg, v)| (tg.clone(), *v))
                .collect(),
            None => Vec::new(),
        }
    }
}
