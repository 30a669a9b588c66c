//! Content cache: fragment reassembly, entry registry, lock counting.
//!
//! Network data arrives in arbitrary order and size; the [`FragmentStore`]
//! reassembles it into a single logical byte sequence. The
//! [`CacheRegistry`] owns entry identity: at most one entry per normalized
//! identifier, reference-counted via [`EntryLock`] guards so nothing
//! externally observed is ever freed, and evicted LRU-wise under a byte
//! budget when unlocked.

mod entry;
mod fragment;
mod registry;

pub use entry::{CacheEntry, EntryHandle, EntryLock};
pub use fragment::{Fragment, FragmentStore};
pub use registry::{CacheRegistry, RegistryConfig, RegistryStats};

use thiserror::Error;

/// Errors from cache operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// An allocation failed. The failing operation left prior state intact;
    /// only the current fragment insert or entry create is aborted.
    #[error("allocation failure")]
    AllocationFailure,
}

/// Policy controlling whether a fetch may reuse, bypass, or skip the cache.
///
/// Evaluated once, at entry creation; a running task never re-evaluates it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CacheMode {
    /// Reuse a complete entry, attach to an in-flight one, else fetch fresh.
    Normal,
    /// Like `Normal` at the registry level; a front end may additionally
    /// suppress expiry checks it performs itself.
    AlwaysCache,
    /// Invalidate any existing entry and fetch fresh. The old entry is only
    /// destroyed once its lock count reaches zero.
    ForceReload,
    /// Fetch into a transient entry the registry never indexes.
    NeverCache,
}
