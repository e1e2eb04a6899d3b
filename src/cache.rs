use std::collections::HashMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Serialize;

#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    pub timestamp: DateTime<Utc>,
    pub data: V,
    touched_at: DateTime<Utc>,
    hits: u64,
}

/// Bookkeeping view of one entry, the only input eviction needs.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryStats {
    pub key: String,
    pub written_at: DateTime<Utc>,
    pub touched_at: DateTime<Utc>,
    pub hits: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub entries: usize,
    pub stale_entries: usize,
    pub capacity: usize,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
}

pub fn is_stale(written_at: DateTime<Utc>, max_age: ChronoDuration, now: DateTime<Utc>) -> bool {
    now - written_at > max_age
}

/// Picks the keys to drop so that at most `capacity` entries remain.
///
/// Stale entries always go. Among fresh entries the coldest go first, where
/// coldness is seconds since last touch divided by `1 + hits`, so an entry
/// that was touched recently or read often survives longer. Ties break on
/// key for determinism.
pub fn select_evictions(
    entries: &[EntryStats],
    capacity: usize,
    max_age: ChronoDuration,
    now: DateTime<Utc>,
) -> Vec<String> {
    let capacity = capacity.max(1);
    let (stale, mut fresh): (Vec<&EntryStats>, Vec<&EntryStats>) = entries
        .iter()
        .partition(|entry| is_stale(entry.written_at, max_age, now));

    let mut evicted = stale
        .into_iter()
        .map(|entry| entry.key.clone())
        .collect::<Vec<_>>();

    if fresh.len() <= capacity {
        return evicted;
    }

    let coldness = |entry: &EntryStats| {
        let idle = (now - entry.touched_at).num_milliseconds().max(0) as f64 / 1000.0;
        idle / (1.0 + entry.hits as f64)
    };
    fresh.sort_by(|a, b| {
        coldness(b)
            .partial_cmp(&coldness(a))
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.key.cmp(&b.key))
    });

    let overflow = fresh.len() - capacity;
    evicted.extend(fresh.into_iter().take(overflow).map(|entry| entry.key.clone()));
    evicted
}

#[derive(Debug)]
pub struct MetricsCache<V> {
    capacity: usize,
    max_age: ChronoDuration,
    entries: HashMap<String, CacheEntry<V>>,
    hits: u64,
    misses: u64,
}

impl<V: Clone> MetricsCache<V> {
    pub fn new(capacity: usize, max_age: std::time::Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            max_age: ChronoDuration::from_std(max_age).unwrap_or_else(|_| ChronoDuration::minutes(5)),
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set(&mut self, key: impl Into<String>, value: V) {
        self.set_at(key, value, Utc::now());
    }

    pub fn set_at(&mut self, key: impl Into<String>, value: V, timestamp: DateTime<Utc>) {
        let key = key.into();
        let hits = self.entries.get(&key).map(|entry| entry.hits).unwrap_or(0);
        self.entries.insert(
            key,
            CacheEntry {
                timestamp,
                data: value,
                touched_at: timestamp,
                hits,
            },
        );
        if self.entries.len() > self.capacity {
            self.optimize_at(timestamp.max(Utc::now()));
        }
    }

    pub fn get(&mut self, key: &str) -> Option<V> {
        self.get_at(key, Utc::now())
    }

    /// Returns the value only while it is fresh. Stale entries stay in place
    /// until the next optimize pass.
    pub fn get_at(&mut self, key: &str, now: DateTime<Utc>) -> Option<V> {
        let max_age = self.max_age;
        match self.entries.get_mut(key) {
            Some(entry) if !is_stale(entry.timestamp, max_age, now) => {
                entry.touched_at = now;
                entry.hits += 1;
                self.hits += 1;
                Some(entry.data.clone())
            }
            _ => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn invalidate(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn stale_count_at(&self, now: DateTime<Utc>) -> usize {
        self.entries
            .values()
            .filter(|entry| is_stale(entry.timestamp, self.max_age, now))
            .count()
    }

    pub fn optimize(&mut self) -> usize {
        self.optimize_at(Utc::now())
    }

    pub fn optimize_at(&mut self, now: DateTime<Utc>) -> usize {
        let snapshot = self
            .entries
            .iter()
            .map(|(key, entry)| EntryStats {
                key: key.clone(),
                written_at: entry.timestamp,
                touched_at: entry.touched_at,
                hits: entry.hits,
            })
            .collect::<Vec<_>>();

        let evicted = select_evictions(&snapshot, self.capacity, self.max_age, now);
        for key in &evicted {
            self.entries.remove(key);
        }
        evicted.len()
    }

    pub fn stats_at(&self, now: DateTime<Utc>) -> CacheStats {
        let lookups = self.hits + self.misses;
        CacheStats {
            entries: self.entries.len(),
            stale_entries: self.stale_count_at(now),
            capacity: self.capacity,
            hits: self.hits,
            misses: self.misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                self.hits as f64 / lookups as f64
            },
        }
    }
}
