//! Cache entry registry: the single owner of entry identity.
//!
//! At most one entry exists per normalized identifier. All creation,
//! reuse, supersession, and eviction goes through the registry; content
//! mutation goes through [`EntryLock`]s handed out from here. Eviction is
//! LRU among unlocked entries under a byte budget and runs opportunistically
//! on fetch requests - locked entries are never candidates.

use std::collections::HashMap;

use tracing::{debug, trace};

use super::entry::{CacheEntry, EntryHandle};
use super::CacheMode;
use crate::uri::ResourceId;

/// Default cache budget: 2 MiB of page text is a lot of pages.
pub const DEFAULT_MAX_SIZE_BYTES: u64 = 2 * 1024 * 1024;

/// Registry configuration.
#[derive(Clone, Debug)]
pub struct RegistryConfig {
    /// Byte budget over all indexed entries; eviction keeps unlocked usage
    /// at or below this.
    pub max_size_bytes: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
        }
    }
}

/// Registry counters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub entry_count: usize,
    pub size_bytes: u64,
}

/// Keyed store of cache entries with reference counting and eviction.
pub struct CacheRegistry {
    index: HashMap<ResourceId, EntryHandle>,
    config: RegistryConfig,
    /// Monotonic tick for LRU ordering.
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            index: HashMap::new(),
            config,
            tick: 0,
            hits: 0,
            misses: 0,
            evictions: 0,
        }
    }

    /// Looks up or creates the entry for `id` under the given cache mode.
    ///
    /// Returns the handle and whether an existing entry was reused.
    /// `reused == true` means a fetch is either unnecessary (entry complete)
    /// or already in flight (attach to it); the caller decides which by
    /// checking completeness.
    pub fn get_or_create(&mut self, id: &ResourceId, mode: CacheMode) -> (EntryHandle, bool) {
        self.tick += 1;
        let tick = self.tick;

        let result = match mode {
            CacheMode::NeverCache => {
                // Transient: never indexed, discarded when the last handle drops.
                self.misses += 1;
                trace!(uri = %id, "transient entry created");
                (EntryHandle::new(CacheEntry::new(id.clone())), false)
            }
            CacheMode::ForceReload => {
                if let Some(old) = self.index.remove(id) {
                    // Supersede: existing lock holders keep a valid (stale)
                    // entry; it drops once the last lock releases.
                    old.with(|e| e.mark_stale());
                    debug!(uri = %id, locks = old.lock_count(), "entry superseded by forced reload");
                }
                self.misses += 1;
                let handle = EntryHandle::new(CacheEntry::new(id.clone()));
                handle.with(|e| e.touch(tick));
                self.index.insert(id.clone(), handle.clone());
                (handle, false)
            }
            CacheMode::Normal | CacheMode::AlwaysCache => {
                if let Some(handle) = self.index.get(id) {
                    handle.with(|e| e.touch(tick));
                    self.hits += 1;
                    trace!(uri = %id, complete = handle.is_complete(), "entry reused");
                    (handle.clone(), true)
                } else {
                    self.misses += 1;
                    let handle = EntryHandle::new(CacheEntry::new(id.clone()));
                    handle.with(|e| e.touch(tick));
                    self.index.insert(id.clone(), handle.clone());
                    (handle, false)
                }
            }
        };

        self.evict(Some(id));
        result
    }

    /// Looks up an existing indexed entry without creating one.
    pub fn entry(&self, id: &ResourceId) -> Option<EntryHandle> {
        self.index.get(id).cloned()
    }

    pub fn contains(&self, id: &ResourceId) -> bool {
        self.index.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Drops an incomplete entry after a cancelled or failed fetch.
    ///
    /// If another holder still has it locked, the entry stays registered but
    /// is marked stale; it is never destroyed under a live lock.
    pub fn discard_incomplete(&mut self, id: &ResourceId) {
        let Some(handle) = self.index.get(id) else {
            return;
        };
        if handle.is_complete() {
            return;
        }
        if handle.lock_count() == 0 {
            debug!(uri = %id, "discarding incomplete entry");
            self.index.remove(id);
        } else {
            debug!(uri = %id, locks = handle.lock_count(), "incomplete entry still locked, marking stale");
            handle.with(|e| e.mark_stale());
        }
    }

    /// Removes an entry from the index unconditionally.
    ///
    /// Lock holders keep the entry alive through their handles; only the
    /// identity mapping is dropped.
    pub fn remove(&mut self, id: &ResourceId) -> bool {
        self.index.remove(id).is_some()
    }

    /// Evicts unlocked entries, least recently used first, until the byte
    /// budget is met. `protect` shields a just-created entry that its
    /// requester has not locked yet.
    fn evict(&mut self, protect: Option<&ResourceId>) {
        let mut total: u64 = self
            .index
            .values()
            .map(|h| h.with(|e| e.byte_size()))
            .sum();

        while total > self.config.max_size_bytes {
            let victim = self
                .index
                .iter()
                .filter(|(id, handle)| {
                    handle.lock_count() == 0 && protect.map_or(true, |p| p != *id)
                })
                .min_by_key(|(_, handle)| handle.with(|e| e.last_touch()))
                .map(|(id, handle)| (id.clone(), handle.with(|e| e.byte_size())));

            let Some((id, size)) = victim else {
                // Everything over budget is locked; nothing we may touch.
                break;
            };
            debug!(uri = %id, size, "evicting cache entry");
            self.index.remove(&id);
            self.evictions += 1;
            total = total.saturating_sub(size);
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            hits: self.hits,
            misses: self.misses,
            evictions: self.evictions,
            entry_count: self.index.len(),
            size_bytes: self
                .index
                .values()
                .map(|h| h.with(|e| e.byte_size()))
                .sum(),
        }
    }
}

impl Default for CacheRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("entries", &self.index.len())
            .field("budget", &self.config.max_size_bytes)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rid(s: &str) -> ResourceId {
        ResourceId::parse(s).unwrap()
    }

    fn registry(budget: u64) -> CacheRegistry {
        CacheRegistry::new(RegistryConfig {
            max_size_bytes: budget,
        })
    }

    fn fill(handle: &EntryHandle, bytes: &[u8]) {
        let lock = handle.lock();
        lock.insert_fragment(0, bytes).unwrap();
        lock.normalize().unwrap();
        lock.set_complete(true);
    }

    #[test]
    fn test_normal_mode_creates_then_reuses() {
        let mut reg = registry(1024);
        let id = rid("http://example.com/a");

        let (h1, reused) = reg.get_or_create(&id, CacheMode::Normal);
        assert!(!reused);
        fill(&h1, b"hello");

        let (h2, reused) = reg.get_or_create(&id, CacheMode::Normal);
        assert!(reused);
        assert!(h1.same_entry(&h2));
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_one_entry_per_identifier() {
        let mut reg = registry(1024);
        let (h1, _) = reg.get_or_create(&rid("HTTP://Example.com:80/a"), CacheMode::Normal);
        let (h2, reused) = reg.get_or_create(&rid("http://example.com/a"), CacheMode::Normal);
        assert!(reused);
        assert!(h1.same_entry(&h2));
    }

    #[test]
    fn test_never_cache_not_indexed() {
        let mut reg = registry(1024);
        let id = rid("http://example.com/secret");
        let (h, reused) = reg.get_or_create(&id, CacheMode::NeverCache);
        assert!(!reused);
        fill(&h, b"body");

        assert!(!reg.contains(&id));
        assert_eq!(reg.len(), 0);
    }

    #[test]
    fn test_force_reload_supersedes() {
        let mut reg = registry(1024);
        let id = rid("http://example.com/a");
        let (old, _) = reg.get_or_create(&id, CacheMode::Normal);
        fill(&old, b"old");

        let (new, reused) = reg.get_or_create(&id, CacheMode::ForceReload);
        assert!(!reused);
        assert!(!old.same_entry(&new));
        assert!(new.same_entry(&reg.entry(&id).unwrap()));
    }

    #[test]
    fn test_force_reload_keeps_locked_old_entry_alive() {
        let mut reg = registry(1024);
        let id = rid("http://example.com/a");
        let (old, _) = reg.get_or_create(&id, CacheMode::Normal);
        fill(&old, b"old content");
        let held = old.lock();

        let (_new, _) = reg.get_or_create(&id, CacheMode::ForceReload);

        // The holder still reads valid (stale) content.
        assert!(held.is_stale());
        assert_eq!(held.content(), b"old content");
        drop(held);
    }

    #[test]
    fn test_eviction_respects_locks() {
        let mut reg = registry(10);
        let locked_id = rid("http://example.com/locked");
        let (locked, _) = reg.get_or_create(&locked_id, CacheMode::Normal);
        fill(&locked, b"0123456789abcdef");
        let guard = locked.lock();

        // Over budget, but the only entry is locked: nothing evictable.
        let (other, _) = reg.get_or_create(&rid("http://example.com/other"), CacheMode::Normal);
        fill(&other, b"xyz");
        assert!(reg.contains(&locked_id));

        // Unlock, then trigger another opportunistic pass.
        drop(guard);
        let _ = reg.get_or_create(&rid("http://example.com/third"), CacheMode::Normal);
        assert!(!reg.contains(&locked_id));
        assert!(reg.stats().evictions >= 1);
    }

    #[test]
    fn test_eviction_is_lru() {
        let mut reg = registry(8);
        let a = rid("http://example.com/a");
        let b = rid("http://example.com/b");

        let (ha, _) = reg.get_or_create(&a, CacheMode::Normal);
        fill(&ha, b"aaaa");
        let (hb, _) = reg.get_or_create(&b, CacheMode::Normal);
        fill(&hb, b"bbbb");

        // Touch a so b becomes least recently used.
        let _ = reg.get_or_create(&a, CacheMode::Normal);

        let (hc, _) = reg.get_or_create(&rid("http://example.com/c"), CacheMode::Normal);
        fill(&hc, b"cccc");
        let _ = reg.get_or_create(&rid("http://example.com/d"), CacheMode::Normal);

        assert!(reg.contains(&a));
        assert!(!reg.contains(&b));
    }

    #[test]
    fn test_discard_incomplete_unlocked() {
        let mut reg = registry(1024);
        let id = rid("http://example.com/a");
        let _ = reg.get_or_create(&id, CacheMode::Normal);
        reg.discard_incomplete(&id);
        assert!(!reg.contains(&id));
    }

    #[test]
    fn test_discard_incomplete_locked_marks_stale() {
        let mut reg = registry(1024);
        let id = rid("http://example.com/a");
        let (h, _) = reg.get_or_create(&id, CacheMode::Normal);
        let guard = h.lock();

        reg.discard_incomplete(&id);
        assert!(reg.contains(&id));
        assert!(guard.is_stale());
    }

    #[test]
    fn test_discard_incomplete_skips_complete() {
        let mut reg = registry(1024);
        let id = rid("http://example.com/a");
        let (h, _) = reg.get_or_create(&id, CacheMode::Normal);
        fill(&h, b"done");
        reg.discard_incomplete(&id);
        assert!(reg.contains(&id));
    }

    #[test]
    fn test_stats_counters() {
        let mut reg = registry(1024);
        let id = rid("http://example.com/a");
        let _ = reg.get_or_create(&id, CacheMode::Normal);
        let _ = reg.get_or_create(&id, CacheMode::Normal);
        let _ = reg.get_or_create(&rid("http://example.com/b"), CacheMode::Normal);

        let stats = reg.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
        assert_eq!(stats.entry_count, 2);
    }
}
