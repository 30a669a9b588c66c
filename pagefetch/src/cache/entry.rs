//! Cache entries and the lock discipline around them.
//!
//! A [`CacheEntry`] is long-lived, externally-referenced memory: rendering,
//! scripting, and export all hold on to entries across calls. Any component
//! retaining an entry beyond a single call takes an [`EntryLock`], an RAII
//! guard that bumps the entry's lock count and releases it on drop. An
//! entry with a positive lock count is never destroyed, never evicted, and
//! never reassigned to a different identity - locking freezes identity and
//! lifetime, not content, so writers mutate through their lock.

use std::sync::Arc;

use parking_lot::Mutex;

use super::fragment::FragmentStore;
use super::CacheError;
use crate::uri::ResourceId;

/// The cached representation of one fetched resource.
#[derive(Debug)]
pub struct CacheEntry {
    id: ResourceId,
    content_type: Option<String>,
    head: Option<String>,
    fragments: FragmentStore,
    complete: bool,
    /// Superseded by a forced reload or discarded while locked elsewhere.
    stale: bool,
    /// Bumped whenever the registry invalidates the entry's content.
    generation: u64,
    lock_count: u32,
    /// LRU tick, maintained by the registry.
    last_touch: u64,
}

impl CacheEntry {
    pub(super) fn new(id: ResourceId) -> Self {
        Self {
            id,
            content_type: None,
            head: None,
            fragments: FragmentStore::new(),
            complete: false,
            stale: false,
            generation: 0,
            lock_count: 0,
            last_touch: 0,
        }
    }

    pub fn uri(&self) -> &ResourceId {
        &self.id
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn lock_count(&self) -> u32 {
        self.lock_count
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn length(&self) -> u64 {
        self.fragments.length()
    }

    pub(super) fn byte_size(&self) -> u64 {
        self.fragments.byte_size()
    }

    pub(super) fn mark_stale(&mut self) {
        self.stale = true;
        self.complete = false;
        self.generation += 1;
    }

    /// Discards content and response metadata so a new transfer starts
    /// from a blank slate. Identity and lock count are untouched.
    pub(super) fn reset(&mut self) {
        self.fragments.clear();
        self.content_type = None;
        self.head = None;
        self.complete = false;
        self.stale = false;
        self.generation += 1;
    }

    pub(super) fn touch(&mut self, tick: u64) {
        self.last_touch = tick;
    }

    pub(super) fn last_touch(&self) -> u64 {
        self.last_touch
    }
}

/// Shared handle to a cache entry.
///
/// Cloning the handle does not lock the entry; take an [`EntryLock`] before
/// retaining it or writing through it.
#[derive(Clone)]
pub struct EntryHandle {
    inner: Arc<Mutex<CacheEntry>>,
}

impl EntryHandle {
    pub(super) fn new(entry: CacheEntry) -> Self {
        Self {
            inner: Arc::new(Mutex::new(entry)),
        }
    }

    /// Takes a lock on the entry, pinning its identity and lifetime.
    pub fn lock(&self) -> EntryLock {
        self.inner.lock().lock_count += 1;
        EntryLock {
            handle: self.clone(),
        }
    }

    /// True when both handles refer to the same entry.
    pub fn same_entry(&self, other: &EntryHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn uri(&self) -> ResourceId {
        self.inner.lock().id.clone()
    }

    pub fn is_complete(&self) -> bool {
        self.inner.lock().complete
    }

    pub fn lock_count(&self) -> u32 {
        self.inner.lock().lock_count
    }

    pub(super) fn with<R>(&self, f: impl FnOnce(&mut CacheEntry) -> R) -> R {
        f(&mut self.inner.lock())
    }
}

impl std::fmt::Debug for EntryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let entry = self.inner.lock();
        f.debug_struct("EntryHandle")
            .field("uri", &entry.id)
            .field("complete", &entry.complete)
            .field("lock_count", &entry.lock_count)
            .field("length", &entry.fragments.length())
            .finish()
    }
}

/// RAII lock on a cache entry.
///
/// Holding one guarantees the entry is neither destroyed nor evicted, even
/// if the registry would otherwise drop it. The count releases on drop -
/// the explicit-unlock-plus-finalizer dance of embedding runtimes becomes
/// plain ownership.
///
/// All reads and writes of entry content go through this type, which makes
/// the "writers must hold a lock" rule a type-level fact.
pub struct EntryLock {
    handle: EntryHandle,
}

impl EntryLock {
    /// The handle this lock was taken from.
    pub fn handle(&self) -> &EntryHandle {
        &self.handle
    }

    /// Normalized content bytes. Empty while the entry still has holes.
    pub fn content(&self) -> Vec<u8> {
        self.handle.with(|e| {
            e.fragments
                .contiguous()
                .map(|b| b.to_vec())
                .unwrap_or_default()
        })
    }

    /// Replaces the whole content and renormalizes; length is recomputed.
    pub fn set_content(&self, bytes: &[u8]) -> Result<(), CacheError> {
        self.handle.with(|e| {
            e.fragments.replace(bytes)?;
            e.fragments.normalize()
        })
    }

    pub fn content_type(&self) -> Option<String> {
        self.handle.with(|e| e.content_type.clone())
    }

    pub fn set_content_type(&self, content_type: &str) {
        self.handle
            .with(|e| e.content_type = Some(content_type.to_string()));
    }

    /// Raw response-header text.
    pub fn head(&self) -> Option<String> {
        self.handle.with(|e| e.head.clone())
    }

    pub fn set_head(&self, head: &str) {
        self.handle.with(|e| e.head = Some(head.to_string()));
    }

    pub fn uri(&self) -> ResourceId {
        self.handle.with(|e| e.id.clone())
    }

    pub fn length(&self) -> u64 {
        self.handle.with(|e| e.fragments.length())
    }

    pub fn is_complete(&self) -> bool {
        self.handle.with(|e| e.complete)
    }

    pub fn is_stale(&self) -> bool {
        self.handle.with(|e| e.stale)
    }

    pub fn generation(&self) -> u64 {
        self.handle.with(|e| e.generation)
    }

    /// Stores one received byte range (transport delivery path).
    pub fn insert_fragment(&self, offset: u64, bytes: &[u8]) -> Result<(), CacheError> {
        self.handle.with(|e| e.fragments.insert(offset, bytes))
    }

    /// Coalesces fragments and recomputes length; invoked at the
    /// data-received-to-completion milestone and after content writes.
    pub fn normalize(&self) -> Result<(), CacheError> {
        self.handle.with(|e| e.fragments.normalize())
    }

    pub(crate) fn set_complete(&self, complete: bool) {
        self.handle.with(|e| {
            e.complete = complete;
            if complete {
                // A finished transfer supersedes any earlier staleness.
                e.stale = false;
            }
        });
    }

    /// Clears leftover state from an earlier unfinished transfer.
    pub(crate) fn reset(&self) {
        self.handle.with(|e| e.reset());
    }
}

impl Drop for EntryLock {
    fn drop(&mut self) {
        self.handle.with(|e| {
            debug_assert!(e.lock_count > 0, "unbalanced entry unlock");
            e.lock_count = e.lock_count.saturating_sub(1);
        });
    }
}

impl std::fmt::Debug for EntryLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EntryLock({})", self.uri())
    }
}
