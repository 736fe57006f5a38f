//! Age-keyed concurrent map
//!
//! Backs the three dispatch guard maps (processed events, in-flight
//! markers, cooldowns). Entries carry an insertion instant and an owner
//! token; they expire by age and the map is bounded by `max_entries`.
//!
//! Uses `tokio::time::Instant` so paused-clock tests can drive expiry.

use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;

/// Configuration for a [`TtlMap`]
#[derive(Debug, Clone)]
pub struct TtlConfig {
    /// Age after which an entry is expired
    pub ttl: Duration,

    /// Maximum number of entries; the oldest is evicted at capacity
    pub max_entries: usize,
}

/// Owner token handed out on a successful claim
pub type Token = u64;

#[derive(Debug, Clone, Copy)]
struct Slot {
    token: Token,
    inserted_at: Instant,
}

/// Outcome of [`TtlMap::claim`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// Key was absent
    Fresh(Token),
    /// Key held an expired entry, which was replaced
    Reclaimed { token: Token, held_for: Duration },
    /// Key is held by a live entry
    Held { age: Duration },
}

impl Claim {
    pub fn token(&self) -> Option<Token> {
        match self {
            Claim::Fresh(token) | Claim::Reclaimed { token, .. } => Some(*token),
            Claim::Held { .. } => None,
        }
    }
}

/// Statistics for a TTL map.
#[derive(Debug, Default)]
pub struct TtlStats {
    pub inserts: AtomicU64,
    pub rejections: AtomicU64,
    pub evictions: AtomicU64,
}

/// Snapshot of map statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TtlStatsSnapshot {
    pub inserts: u64,
    pub rejections: u64,
    pub evictions: u64,
}

impl TtlStats {
    pub fn snapshot(&self) -> TtlStatsSnapshot {
        TtlStatsSnapshot {
            inserts: self.inserts.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}

/// Concurrent map with age-based expiry
pub struct TtlMap<K>
where
    K: Eq + Hash + Clone,
{
    entries: DashMap<K, Slot>,
    config: TtlConfig,
    next_token: AtomicU64,
    stats: TtlStats,
}

impl<K> TtlMap<K>
where
    K: Eq + Hash + Clone,
{
    pub fn new(config: TtlConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            next_token: AtomicU64::new(1),
            stats: TtlStats::default(),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.config.ttl
    }

    /// Insert the key unless a live entry holds it.
    ///
    /// The check and the insert happen under the key's shard lock, so two
    /// concurrent claims of one key cannot both succeed.
    pub fn claim(&self, key: K) -> Claim {
        // Evict before taking the shard lock; DashMap is not reentrant
        if !self.entries.contains_key(&key) && self.entries.len() >= self.config.max_entries {
            self.evict_oldest();
        }

        let now = Instant::now();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let slot = Slot {
            token,
            inserted_at: now,
        };

        match self.entries.entry(key) {
            Entry::Vacant(vacant) => {
                vacant.insert(slot);
                self.stats.inserts.fetch_add(1, Ordering::Relaxed);
                Claim::Fresh(token)
            }
            Entry::Occupied(mut occupied) => {
                let age = now.saturating_duration_since(occupied.get().inserted_at);
                if age >= self.config.ttl {
                    occupied.insert(slot);
                    self.stats.inserts.fetch_add(1, Ordering::Relaxed);
                    self.stats.evictions.fetch_add(1, Ordering::Relaxed);
                    Claim::Reclaimed {
                        token,
                        held_for: age,
                    }
                } else {
                    self.stats.rejections.fetch_add(1, Ordering::Relaxed);
                    Claim::Held { age }
                }
            }
        }
    }

    /// Insert or refresh the key unconditionally
    pub fn touch(&self, key: K) -> Token {
        if !self.entries.contains_key(&key) && self.entries.len() >= self.config.max_entries {
            self.evict_oldest();
        }

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            key,
            Slot {
                token,
                inserted_at: Instant::now(),
            },
        );
        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        token
    }

    /// Age of a live entry; `None` if absent or expired
    pub fn age(&self, key: &K) -> Option<Duration> {
        let age = self
            .entries
            .get(key)
            .map(|slot| slot.inserted_at.elapsed())?;
        (age < self.config.ttl).then_some(age)
    }

    /// Remove the entry only if it is still owned by `token`
    pub fn release(&self, key: &K, token: Token) -> bool {
        self.entries
            .remove_if(key, |_, slot| slot.token == token)
            .is_some()
    }

    /// Remove all expired entries. Returns the number removed.
    pub fn cleanup(&self) -> usize {
        let ttl = self.config.ttl;
        let mut removed = 0;
        self.entries.retain(|_, slot| {
            if slot.inserted_at.elapsed() >= ttl {
                removed += 1;
                false
            } else {
                true
            }
        });
        self.stats
            .evictions
            .fetch_add(removed as u64, Ordering::Relaxed);
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> TtlStatsSnapshot {
        self.stats.snapshot()
    }

    fn evict_oldest(&self) {
        let oldest = self
            .entries
            .iter()
            .min_by_key(|e| e.value().inserted_at)
            .map(|e| e.key().clone());

        if let Some(key) = oldest {
            self.entries.remove(&key);
            self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(ttl_secs: u64, max_entries: usize) -> TtlMap<String> {
        TtlMap::new(TtlConfig {
            ttl: Duration::from_secs(ttl_secs),
            max_entries,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_rejects_live_entry() {
        let map = map(10, 100);
        assert!(matches!(map.claim("a".to_string()), Claim::Fresh(_)));
        assert!(matches!(map.claim("a".to_string()), Claim::Held { .. }));
        assert_eq!(map.stats().rejections, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_claim_reclaims_expired_entry() {
        let map = map(10, 100);
        map.claim("a".to_string());

        tokio::time::advance(Duration::from_secs(11)).await;
        match map.claim("a".to_string()) {
            Claim::Reclaimed { held_for, .. } => assert!(held_for >= Duration::from_secs(10)),
            other => panic!("expected reclaim, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_requires_current_token() {
        let map = map(10, 100);
        let stale = map.claim("a".to_string()).token().unwrap();

        tokio::time::advance(Duration::from_secs(11)).await;
        let current = map.claim("a".to_string()).token().unwrap();

        // The reclaimed owner's marker must survive the old owner's release
        assert!(!map.release(&"a".to_string(), stale));
        assert_eq!(map.len(), 1);
        assert!(map.release(&"a".to_string(), current));
        assert!(map.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_and_age() {
        let map = map(10, 100);
        map.touch("a".to_string());
        tokio::time::advance(Duration::from_secs(5)).await;
        map.touch("b".to_string());

        assert_eq!(map.age(&"a".to_string()), Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(map.age(&"a".to_string()), None);
        assert_eq!(map.cleanup(), 1);
        assert_eq!(map.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_capacity_evicts_oldest() {
        let map = map(60, 2);
        map.touch("a".to_string());
        tokio::time::advance(Duration::from_millis(10)).await;
        map.touch("b".to_string());
        tokio::time::advance(Duration::from_millis(10)).await;
        map.touch("c".to_string());

        assert_eq!(map.len(), 2);
        assert!(map.age(&"a".to_string()).is_none());
        assert!(map.age(&"c".to_string()).is_some());
    }
}
