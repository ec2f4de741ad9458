//! LRU + TTL cache for Entity Matcher verdicts, keyed by
//! `(type, lower(new.name), lower(existing.name))`.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::Mutex;

use crate::model::EntityType;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatchKey {
    pub entity_type_tag: &'static str,
    pub new_name: String,
    pub existing_name: String,
}

impl MatchKey {
    pub fn new(entity_type: EntityType, new_name: &str, existing_name: &str) -> Self {
        MatchKey {
            entity_type_tag: entity_type_tag(entity_type),
            new_name: new_name.to_lowercase(),
            existing_name: existing_name.to_lowercase(),
        }
    }
}

fn entity_type_tag(t: EntityType) -> &'static str {
    match t {
        EntityType::Character => "character",
        EntityType::Creature => "creature",
        EntityType::Place => "place",
        EntityType::Item => "item",
        EntityType::Object => "object",
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MatchVerdict {
    pub is_match: bool,
    pub confidence: f64,
}

struct Entry {
    verdict: MatchVerdict,
    inserted_at: Instant,
}

pub struct MatcherCache {
    inner: Mutex<LruCache<MatchKey, Entry>>,
    ttl: Duration,
    hits: std::sync::atomic::AtomicU64,
    misses: std::sync::atomic::AtomicU64,
}

impl MatcherCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        MatcherCache {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity.max(1)).unwrap(),
            )),
            ttl,
            hits: std::sync::atomic::AtomicU64::new(0),
            misses: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub async fn get(&self, key: &MatchKey) -> Option<MatchVerdict> {
        let mut guard = self.inner.lock().await;
        if let Some(entry) = guard.get(key) {
            if entry.inserted_at.elapsed() <= self.ttl {
                self.hits.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return Some(entry.verdict);
            }
            guard.pop(key);
        }
        self.misses.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        None
    }

    pub async fn put(&self, key: MatchKey, verdict: MatchVerdict) {
        let mut guard = self.inner.lock().await;
        guard.put(
            key,
            Entry {
                verdict,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn hit_miss_counters(&self) -> (u64, u64) {
        (
            self.hits.load(std::sync::atomic::Ordering::Relaxed),
            self.misses.load(std::sync::atomic::Ordering::Relaxed),
        )
    }
}

pub const DEFAULT_CAPACITY: usize = 1000;
pub const DEFAULT_TTL: Duration = Duration::from_secs(3600);
