//! Fragment store: ordered byte ranges reassembled into one logical view.
//!
//! Transport delivers byte ranges in whatever order and size it likes. The
//! store keeps them sorted by offset, resolves overlap last-write-wins
//! within the overlapping span only, and [`FragmentStore::normalize`]
//! coalesces adjacent ranges into the minimal contiguous covering set.
//! Readers only ever see the assembled sequence, never fragment boundaries.
//!
//! Insertion is fallible: every allocation is reserved up front, so an
//! allocation failure leaves the store in its prior valid state and aborts
//! only the current fetch.

use super::CacheError;

/// One received byte range, prior to merge.
#[derive(Debug, Clone)]
pub struct Fragment {
    offset: u64,
    data: Vec<u8>,
    /// Arrival sequence number; irrelevant to final content, useful in logs.
    serial: u64,
}

impl Fragment {
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn serial(&self) -> u64 {
        self.serial
    }

    fn end(&self) -> u64 {
        self.offset + self.data.len() as u64
    }
}

/// Per-entry ordered collection of received byte ranges.
#[derive(Debug, Default)]
pub struct FragmentStore {
    /// Sorted by offset; pairwise non-overlapping between normalizations
    /// because `insert` trims overlapped spans eagerly.
    fragments: Vec<Fragment>,
    next_serial: u64,
    /// Contiguous length from offset 0, recomputed by `normalize`.
    length: u64,
}

impl FragmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores an arbitrary-order, arbitrary-size byte range.
    ///
    /// Any offset the new bytes cover replaces previously stored bytes
    /// (last-write-wins); non-overlapping neighbors are untouched. Empty
    /// input is a no-op.
    ///
    /// On allocation failure no fragment is recorded, existing fragments
    /// are unmodified, and `CacheError::AllocationFailure` is returned.
    pub fn insert(&mut self, offset: u64, bytes: &[u8]) -> Result<(), CacheError> {
        if bytes.is_empty() {
            return Ok(());
        }
        let end = offset + bytes.len() as u64;

        // Reserve everything before touching existing state.
        let mut data = Vec::new();
        data.try_reserve_exact(bytes.len())
            .map_err(|_| CacheError::AllocationFailure)?;
        data.extend_from_slice(bytes);

        // A fragment strictly containing the new range splits in two; the
        // tail piece is the only other allocation insert can need.
        let mut tail: Option<Fragment> = None;
        if let Some(frag) = self
            .fragments
            .iter()
            .find(|f| f.offset < offset && f.end() > end)
        {
            let cut = (end - frag.offset) as usize;
            let mut tail_data = Vec::new();
            tail_data
                .try_reserve_exact(frag.data.len() - cut)
                .map_err(|_| CacheError::AllocationFailure)?;
            tail_data.extend_from_slice(&frag.data[cut..]);
            tail = Some(Fragment {
                offset: end,
                data: tail_data,
                serial: frag.serial,
            });
        }
        self.fragments
            .try_reserve(2)
            .map_err(|_| CacheError::AllocationFailure)?;

        // All allocations done; mutate.
        let mut i = 0;
        while i < self.fragments.len() {
            let frag = &mut self.fragments[i];
            if frag.end() <= offset || frag.offset >= end {
                i += 1;
                continue;
            }
            if frag.offset < offset && frag.end() > end {
                // Containment: keep the head, the reserved tail re-inserts below.
                frag.data.truncate((offset - frag.offset) as usize);
                i += 1;
            } else if frag.offset >= offset && frag.end() <= end {
                // Fully covered by the new bytes.
                self.fragments.remove(i);
            } else if frag.offset < offset {
                // Overlap on the right edge of an existing fragment.
                frag.data.truncate((offset - frag.offset) as usize);
                i += 1;
            } else {
                // Overlap on the left edge of an existing fragment.
                let cut = (end - frag.offset) as usize;
                frag.data.drain(..cut);
                frag.offset = end;
                i += 1;
            }
        }

        let serial = self.next_serial;
        self.next_serial += 1;
        self.insert_sorted(Fragment {
            offset,
            data,
            serial,
        });
        if let Some(tail) = tail {
            self.insert_sorted(tail);
        }
        Ok(())
    }

    fn insert_sorted(&mut self, frag: Fragment) {
        let pos = self
            .fragments
            .partition_point(|f| f.offset < frag.offset);
        self.fragments.insert(pos, frag);
    }

    /// Merges stored ranges into the minimal contiguous covering set and
    /// recomputes the total length. Idempotent.
    ///
    /// If a merge allocation fails the store remains valid (possibly only
    /// partially coalesced) and the error is reported.
    pub fn normalize(&mut self) -> Result<(), CacheError> {
        let mut i = 0;
        while i + 1 < self.fragments.len() {
            if self.fragments[i].end() == self.fragments[i + 1].offset {
                let needed = self.fragments[i + 1].data.len();
                if self.fragments[i].data.try_reserve(needed).is_err() {
                    // Partially coalesced is still a valid state.
                    self.length = self.contiguous_len();
                    return Err(CacheError::AllocationFailure);
                }
                let next = self.fragments.remove(i + 1);
                self.fragments[i].data.extend_from_slice(&next.data);
            } else {
                i += 1;
            }
        }
        self.length = self.contiguous_len();
        Ok(())
    }

    fn contiguous_len(&self) -> u64 {
        match self.fragments.first() {
            Some(f) if f.offset == 0 => f.data.len() as u64,
            _ => 0,
        }
    }

    /// Total length of the assembled sequence, as of the last `normalize`.
    pub fn length(&self) -> u64 {
        self.length
    }

    /// Sum of stored bytes across all fragments (eviction accounting).
    pub fn byte_size(&self) -> u64 {
        self.fragments.iter().map(|f| f.data.len() as u64).sum()
    }

    /// The assembled byte sequence, if it is a single run from offset 0.
    ///
    /// Returns `None` while holes remain or before the first `normalize`.
    pub fn contiguous(&self) -> Option<&[u8]> {
        match self.fragments.as_slice() {
            [f] if f.offset == 0 => Some(&f.data),
            [] => Some(&[]),
            _ => None,
        }
    }

    /// Drops all fragments and resets the assembled length to zero.
    pub fn clear(&mut self) {
        self.fragments.clear();
        self.length = 0;
    }

    /// Drops all fragments and installs `bytes` as the whole content.
    pub fn replace(&mut self, bytes: &[u8]) -> Result<(), CacheError> {
        let mut data = Vec::new();
        data.try_reserve_exact(bytes.len())
            .map_err(|_| CacheError::AllocationFailure)?;
        data.extend_from_slice(bytes);
        self.fragments.clear();
        let serial = self.next_serial;
        self.next_serial += 1;
        if !data.is_empty() {
            self.fragments.push(Fragment {
                offset: 0,
                data,
                serial,
            });
        }
        self.length = self.contiguous_len();
        Ok(())
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn fragments(&self) -> &[Fragment] {
        &self.fragments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn assembled(store: &FragmentStore) -> Vec<u8> {
        store.contiguous().expect("store has holes").to_vec()
    }

    #[test]
    fn test_in_order_inserts_coalesce() {
        let mut store = FragmentStore::new();
        store.insert(0, b"hello ").unwrap();
        store.insert(6, b"world").unwrap();
        store.normalize().unwrap();

        assert_eq!(store.length(), 11);
        assert_eq!(store.fragment_count(), 1);
        assert_eq!(assembled(&store), b"hello world");
    }

    #[test]
    fn test_out_of_order_inserts_coalesce() {
        let mut store = FragmentStore::new();
        store.insert(6, b"world").unwrap();
        store.insert(0, b"hello ").unwrap();
        store.normalize().unwrap();

        assert_eq!(store.length(), 11);
        assert_eq!(assembled(&store), b"hello world");
    }

    #[test]
    fn test_empty_insert_is_noop() {
        let mut store = FragmentStore::new();
        store.insert(100, b"").unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_hole_keeps_length_zero() {
        let mut store = FragmentStore::new();
        store.insert(10, b"late").unwrap();
        store.normalize().unwrap();
        assert_eq!(store.length(), 0);
        assert!(store.contiguous().is_none());
    }

    #[test]
    fn test_exact_overwrite() {
        let mut store = FragmentStore::new();
        store.insert(0, b"aaaa").unwrap();
        store.insert(0, b"bbbb").unwrap();
        store.normalize().unwrap();
        assert_eq!(assembled(&store), b"bbbb");
    }

    #[test]
    fn test_partial_overlap_last_write_wins() {
        let mut store = FragmentStore::new();
        store.insert(0, b"aaaaaaaa").unwrap();
        store.insert(2, b"BBBB").unwrap();
        store.normalize().unwrap();
        assert_eq!(assembled(&store), b"aaBBBBaa");
    }

    #[test]
    fn test_overlap_bridging_two_fragments() {
        let mut store = FragmentStore::new();
        store.insert(0, b"aaaa").unwrap();
        store.insert(4, b"cccc").unwrap();
        store.insert(2, b"BBBB").unwrap();
        store.normalize().unwrap();
        assert_eq!(assembled(&store), b"aaBBBBcc");
    }

    #[test]
    fn test_overlap_swallowing_middle_fragment() {
        let mut store = FragmentStore::new();
        store.insert(0, b"aa").unwrap();
        store.insert(2, b"bb").unwrap();
        store.insert(4, b"cc").unwrap();
        store.insert(1, b"XXXX").unwrap();
        store.normalize().unwrap();
        assert_eq!(assembled(&store), b"aXXXXc");
    }

    #[test]
    fn test_normalize_idempotent() {
        let mut store = FragmentStore::new();
        store.insert(3, b"def").unwrap();
        store.insert(0, b"abc").unwrap();
        store.normalize().unwrap();
        let first = assembled(&store);
        let count = store.fragment_count();
        store.normalize().unwrap();
        assert_eq!(assembled(&store), first);
        assert_eq!(store.fragment_count(), count);
    }

    #[test]
    fn test_replace_resets_content() {
        let mut store = FragmentStore::new();
        store.insert(0, b"old content").unwrap();
        store.normalize().unwrap();
        store.replace(b"new").unwrap();
        assert_eq!(store.length(), 3);
        assert_eq!(assembled(&store), b"new");
    }

    #[test]
    fn test_replace_with_empty() {
        let mut store = FragmentStore::new();
        store.insert(0, b"old").unwrap();
        store.replace(b"").unwrap();
        assert_eq!(store.length(), 0);
        assert_eq!(assembled(&store), b"");
    }

    #[test]
    fn test_byte_size_counts_all_fragments() {
        let mut store = FragmentStore::new();
        store.insert(0, b"abc").unwrap();
        store.insert(10, b"defg").unwrap();
        assert_eq!(store.byte_size(), 7);
    }

    proptest! {
        /// Any permutation of non-overlapping inserts covering [0, N)
        /// normalizes to one contiguous range equal to the concatenation
        /// by offset.
        #[test]
        fn prop_shuffled_chunks_reassemble(
            content in proptest::collection::vec(any::<u8>(), 1..512),
            seed in any::<u64>(),
        ) {
            // Split into chunks at pseudo-random boundaries, then visit the
            // chunks in a seed-derived order.
            let mut chunks = Vec::new();
            let mut pos = 0usize;
            let mut state = seed | 1;
            while pos < content.len() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let step = 1 + (state >> 33) as usize % 64;
                let end = (pos + step).min(content.len());
                chunks.push((pos as u64, content[pos..end].to_vec()));
                pos = end;
            }
            let mut order: Vec<usize> = (0..chunks.len()).collect();
            for i in (1..order.len()).rev() {
                state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                order.swap(i, (state >> 33) as usize % (i + 1));
            }

            let mut store = FragmentStore::new();
            for &i in &order {
                let (offset, ref bytes) = chunks[i];
                store.insert(offset, bytes).unwrap();
            }
            store.normalize().unwrap();

            prop_assert_eq!(store.length(), content.len() as u64);
            prop_assert_eq!(store.fragment_count(), 1);
            prop_assert_eq!(store.contiguous().unwrap(), content.as_slice());
        }

        /// Overwriting a span changes exactly that span.
        #[test]
        fn prop_overlap_rewrites_exact_span(
            base in proptest::collection::vec(any::<u8>(), 4..256),
            patch in proptest::collection::vec(any::<u8>(), 1..64),
            at in any::<proptest::sample::Index>(),
        ) {
            let offset = at.index(base.len());
            let mut store = FragmentStore::new();
            store.insert(0, &base).unwrap();
            store.insert(offset as u64, &patch).unwrap();
            store.normalize().unwrap();

            let mut expected = base.clone();
            if offset + patch.len() > expected.len() {
                expected.resize(offset + patch.len(), 0);
            }
            expected[offset..offset + patch.len()].copy_from_slice(&patch);

            prop_assert_eq!(store.contiguous().unwrap(), expected.as_slice());
        }
    }
}
