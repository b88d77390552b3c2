//! Free-list structure for one arena: the unsorted staging bin, the
//! small and large regular bins with their binmap index, and the
//! lock-free fastbins.
//!
//! Every bin is a circular doubly-linked list threaded through
//! descriptor indices, with a sentinel descriptor (drawn from the
//! descriptor pool, `user_ptr == 0`) as the list head.  Large bins
//! additionally thread a `size_fd`/`size_bk` skip list through the
//! first descriptor of each distinct size, so a best-fit search walks
//! sizes rather than chunks.
#[cfg(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
))]
use contracts::*;
#[cfg(not(any(
    all(test, feature = "check_contracts_in_tests"),
    feature = "check_contracts"
)))]
use disabled_contracts::*;

use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use crate::chunk::DescRef;
use crate::chunk::Descriptor;
use crate::pool::Pool;

/// Regular bin slots; slot 0 is unused and slot 1 is the unsorted
/// bin.
pub const NBINS: usize = 128;
pub const UNSORTED: usize = 1;

/// Chunk sizes below this sort into small bins.
pub const MIN_LARGE_SIZE: usize = 1024;

/// Fastbin count; covers chunk sizes 32..=176.
pub const NFASTBINS: usize = 10;

const BINMAP_SHIFT: usize = 5;
pub const BINMAP_SIZE: usize = NBINS >> BINMAP_SHIFT;

static_assertions::const_assert_eq!(MIN_LARGE_SIZE >> 4, 64);
static_assertions::const_assert!(NBINS % (1 << BINMAP_SHIFT) == 0);

#[inline]
pub fn in_smallbin_range(size: usize) -> bool {
    size < MIN_LARGE_SIZE
}

/// Small bins hold exactly one size each, 16 bytes apart.
#[inline]
pub fn smallbin_index(size: usize) -> usize {
    size >> 4
}

/// Large bins cover roughly logarithmic ranges.
#[inline]
pub fn largebin_index(size: usize) -> usize {
    if (size >> 6) <= 48 {
        48 + (size >> 6)
    } else if (size >> 9) <= 20 {
        91 + (size >> 9)
    } else if (size >> 12) <= 10 {
        110 + (size >> 12)
    } else if (size >> 15) <= 4 {
        119 + (size >> 15)
    } else if (size >> 18) <= 2 {
        124 + (size >> 18)
    } else {
        126
    }
}

#[inline]
pub fn bin_index(size: usize) -> usize {
    if in_smallbin_range(size) {
        smallbin_index(size)
    } else {
        largebin_index(size)
    }
}

#[inline]
pub fn fastbin_index(size: usize) -> usize {
    (size >> 4) - 2
}

/// Largest chunk size the fastbin array can represent, regardless of
/// the `max_fast` tunable.
pub const MAX_FASTBIN_SIZE: usize = (NFASTBINS + 1) << 4;

/// One bit per regular bin: set means "possibly non-empty".  Bits are
/// cleared lazily when a scan finds the bin empty.
#[derive(Default)]
pub struct Binmap {
    map: [u32; BINMAP_SIZE],
}

impl Binmap {
    #[inline]
    fn block(index: usize) -> usize {
        index >> BINMAP_SHIFT
    }

    #[inline]
    fn bit(index: usize) -> u32 {
        1 << (index & ((1 << BINMAP_SHIFT) - 1))
    }

    #[inline]
    pub fn mark(&mut self, index: usize) {
        self.map[Self::block(index)] |= Self::bit(index);
    }

    #[inline]
    pub fn unmark(&mut self, index: usize) {
        self.map[Self::block(index)] &= !Self::bit(index);
    }

    #[inline]
    pub fn marked(&self, index: usize) -> bool {
        self.map[Self::block(index)] & Self::bit(index) != 0
    }

    /// The next possibly non-empty bin at `from` or above.
    pub fn next_marked(&self, from: usize) -> Option<usize> {
        if from >= NBINS {
            return None;
        }

        let mut block = Self::block(from);
        let mut word = self.map[block] & !(Self::bit(from) - 1);

        loop {
            if word != 0 {
                let bit = word.trailing_zeros() as usize;
                return Some((block << BINMAP_SHIFT) + bit);
            }

            block += 1;
            if block == BINMAP_SIZE {
                return None;
            }
            word = self.map[block];
        }
    }
}

/// The regular bins of one arena.  Mutated only under the arena
/// mutex.
pub struct Bins {
    /// Sentinel descriptor per bin; slot 0 stays `None`.
    heads: [Option<DescRef>; NBINS],
    pub binmap: Binmap,
    /// The most recent split remainder, preferred for consecutive
    /// small requests (locality).
    pub last_remainder: Option<DescRef>,
}

impl Bins {
    /// Allocates the sentinels and wires each bin into an empty
    /// circle.  Returns `None` if the descriptor pool cannot grow.
    pub fn new(pool: &Pool<Descriptor>) -> Option<Bins> {
        let mut heads = [None; NBINS];

        for slot in heads.iter_mut().skip(1) {
            let sentinel = pool.allocate()?;
            let d = pool.get_mut(sentinel);
            d.bin_fd = Some(sentinel);
            d.bin_bk = Some(sentinel);
            d.size_fd = Some(sentinel);
            d.size_bk = Some(sentinel);
            *slot = Some(sentinel);
        }

        Some(Bins {
            heads,
            binmap: Binmap::default(),
            last_remainder: None,
        })
    }

    #[inline]
    pub fn head(&self, index: usize) -> DescRef {
        self.heads[index].expect("bin 0 is never addressed")
    }

    /// True iff `r` is a bin sentinel rather than a chunk.
    #[inline]
    pub fn is_sentinel(pool: &Pool<Descriptor>, r: DescRef) -> bool {
        pool.get(r).user_ptr == 0
    }

    pub fn bin_is_empty(&self, pool: &Pool<Descriptor>, index: usize) -> bool {
        let head = self.head(index);

        pool.get(head).bin_bk == Some(head)
    }

    /// Pushes `r` at the head of the unsorted bin; drains happen from
    /// the tail, so staging is first-in first-out.
    pub fn insert_unsorted(&mut self, pool: &Pool<Descriptor>, r: DescRef) {
        self.insert_after(pool, self.head(UNSORTED), r);
    }

    /// Inserts `r` into its small bin (all chunks there share one
    /// size, so position is irrelevant).
    pub fn insert_small(&mut self, pool: &Pool<Descriptor>, index: usize, r: DescRef) {
        debug_assert!(index >= 2 && index < smallbin_index(MIN_LARGE_SIZE));

        self.insert_after(pool, self.head(index), r);
        self.binmap.mark(index);
    }

    /// Inserts `r` into sorted position in large bin `index`,
    /// maintaining both the non-increasing chunk order and the
    /// one-node-per-size skip list.
    #[ensures(pool.get(r).bin_fd.is_some() && pool.get(r).bin_bk.is_some())]
    pub fn insert_large(&mut self, pool: &Pool<Descriptor>, index: usize, r: DescRef) {
        debug_assert!(index >= smallbin_index(MIN_LARGE_SIZE) && index < NBINS);

        let head = self.head(index);
        let size = pool.get(r).chunksize();

        // Walk the represented sizes downward until we find where
        // `size` belongs.
        let mut rep = pool.get(head).size_fd.expect("skip circle is always closed");
        while rep != head && pool.get(rep).chunksize() > size {
            rep = pool.get(rep).size_fd.expect("skip circle is always closed");
        }

        if rep != head && pool.get(rep).chunksize() == size {
            // The size is already represented: tuck `r` right after
            // the representative, off the skip list.
            self.insert_after(pool, rep, r);
        } else {
            // New distinct size: `r` sits in the bin immediately
            // before `rep` (or at the tail when every represented
            // size is larger), and joins the skip circle there.
            self.insert_before(pool, rep, r);

            let size_bk = pool.get(rep).size_bk.expect("skip circle is always closed");
            {
                let d = pool.get_mut(r);
                d.size_fd = Some(rep);
                d.size_bk = Some(size_bk);
            }
            pool.get_mut(size_bk).size_fd = Some(r);
            pool.get_mut(rep).size_bk = Some(r);
        }

        self.binmap.mark(index);
    }

    /// Unlinks `r` from its regular bin, fixing the skip list when
    /// `r` represents a size.  Fails (without touching anything) when
    /// the neighbour back-pointers do not agree, which means the
    /// table is corrupt.
    #[must_use]
    pub fn unlink(&mut self, pool: &Pool<Descriptor>, r: DescRef) -> bool {
        let (fd, bk) = {
            let d = pool.get(r);
            match (d.bin_fd, d.bin_bk) {
                (Some(fd), Some(bk)) => (fd, bk),
                _ => return false,
            }
        };

        if pool.get(fd).bin_bk != Some(r) || pool.get(bk).bin_fd != Some(r) {
            return false;
        }

        // Skip-list maintenance before the bin links go away.
        if let (Some(size_fd), Some(size_bk)) = (pool.get(r).size_fd, pool.get(r).size_bk) {
            let heir = fd;
            if !Self::is_sentinel(pool, heir)
                && pool.get(heir).size_fd.is_none()
                && pool.get(heir).chunksize() == pool.get(r).chunksize()
            {
                // Promote the next same-size chunk to representative.
                {
                    let d = pool.get_mut(heir);
                    d.size_fd = Some(size_fd);
                    d.size_bk = Some(size_bk);
                }
                pool.get_mut(size_bk).size_fd = Some(heir);
                pool.get_mut(size_fd).size_bk = Some(heir);
            } else {
                pool.get_mut(size_bk).size_fd = Some(size_fd);
                pool.get_mut(size_fd).size_bk = Some(size_bk);
            }
        }

        pool.get_mut(fd).bin_bk = Some(bk);
        pool.get_mut(bk).bin_fd = Some(fd);

        let d = pool.get_mut(r);
        d.bin_fd = None;
        d.bin_bk = None;
        d.size_fd = None;
        d.size_bk = None;

        true
    }

    /// The least-recently staged chunk of bin `index`, if any.
    pub fn last(&self, pool: &Pool<Descriptor>, index: usize) -> Option<DescRef> {
        let head = self.head(index);
        let last = pool.get(head).bin_bk.expect("bins are always circular");

        if last == head {
            None
        } else {
            Some(last)
        }
    }

    fn insert_after(&mut self, pool: &Pool<Descriptor>, pos: DescRef, r: DescRef) {
        let next = pool.get(pos).bin_fd.expect("bins are always circular");

        {
            let d = pool.get_mut(r);
            d.bin_fd = Some(next);
            d.bin_bk = Some(pos);
        }
        pool.get_mut(pos).bin_fd = Some(r);
        pool.get_mut(next).bin_bk = Some(r);
    }

    fn insert_before(&mut self, pool: &Pool<Descriptor>, pos: DescRef, r: DescRef) {
        let prev = pool.get(pos).bin_bk.expect("bins are always circular");

        self.insert_after(pool, prev, r);
    }

    /// Walks a large bin and checks invariant order: chunk sizes
    /// non-increasing, represented sizes strictly decreasing.
    pub fn check_large_bin(&self, pool: &Pool<Descriptor>, index: usize) -> Result<(), &'static str> {
        let head = self.head(index);

        let mut prev_size = usize::MAX;
        let mut cursor = pool.get(head).bin_fd.expect("bins are always circular");
        while cursor != head {
            let size = pool.get(cursor).chunksize();
            if size > prev_size {
                return Err("large bin is not sorted");
            }
            prev_size = size;
            cursor = pool.get(cursor).bin_fd.expect("bins are always circular");
        }

        let mut prev_rep = usize::MAX;
        let mut rep = pool.get(head).size_fd.expect("skip circle is always closed");
        while rep != head {
            let size = pool.get(rep).chunksize();
            if size >= prev_rep {
                return Err("skip list sizes are not strictly decreasing");
            }
            prev_rep = size;
            rep = pool.get(rep).size_fd.expect("skip circle is always closed");
        }

        Ok(())
    }
}

/// Packs a descriptor ref and an ABA generation into one CAS-able
/// word.
#[inline]
fn pack(r: Option<DescRef>, generation: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(r.map_or(0, |r| r.get()))
}

#[inline]
fn unpack(word: u64) -> (Option<DescRef>, u32) {
    (DescRef::from_raw(word as u32), (word >> 32) as u32)
}

/// The lock-free fastbins of one arena: LIFO stacks of small freed
/// chunks that skip coalescing.
///
/// Each head carries a generation counter bumped by every successful
/// push and pop, so a pop that raced a concurrent pop/push cycle
/// cannot mistake a recycled head for an unchanged stack.
#[derive(Default)]
pub struct FastBins {
    heads: [AtomicU64; NFASTBINS],
}

impl FastBins {
    /// Pushes `r` onto the fastbin for its size.
    pub fn push(&self, pool: &Pool<Descriptor>, index: usize, r: DescRef) {
        let head = &self.heads[index];

        let mut current = head.load(Ordering::Relaxed);
        loop {
            let (top, generation) = unpack(current);
            pool.get_mut(r).fast_next = top;

            // Release publishes the `fast_next` write above.
            match head.compare_exchange_weak(
                current,
                pack(Some(r), generation.wrapping_add(1)),
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(seen) => current = seen,
            }
        }
    }

    /// Pops the most recently pushed chunk, if any.
    pub fn pop(&self, pool: &Pool<Descriptor>, index: usize) -> Option<DescRef> {
        let head = &self.heads[index];

        let mut current = head.load(Ordering::Acquire);
        loop {
            let (top, generation) = unpack(current);
            let top = top?;
            let next = pool.get(top).fast_next;

            match head.compare_exchange_weak(
                current,
                pack(next, generation.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    pool.get_mut(top).fast_next = None;
                    return Some(top);
                }
                Err(seen) => current = seen,
            }
        }
    }

    /// Empties fastbin `index` wholesale and returns its chain head;
    /// the caller walks `fast_next`.  Used by consolidation, with the
    /// arena lock held.
    pub fn drain(&self, index: usize) -> Option<DescRef> {
        let head = &self.heads[index];

        let mut current = head.load(Ordering::Acquire);
        loop {
            let (top, generation) = unpack(current);
            top?;

            match head.compare_exchange_weak(
                current,
                pack(None, generation.wrapping_add(1)),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return top,
                Err(seen) => current = seen,
            }
        }
    }

    /// The current head of fastbin `index`, without popping it.
    pub fn top(&self, index: usize) -> Option<DescRef> {
        unpack(self.heads[index].load(Ordering::Acquire)).0
    }

    /// True iff every fastbin is empty right now.
    pub fn all_empty(&self) -> bool {
        self.heads
            .iter()
            .all(|head| unpack(head.load(Ordering::Acquire)).0.is_none())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::get_default_descriptor_pool;

    fn chunk_desc(pool: &Pool<Descriptor>, user_ptr: usize, size: usize) -> DescRef {
        let r = pool.allocate().expect("allocate should succeed");
        let d = pool.get_mut(r);
        d.user_ptr = user_ptr;
        d.set_head(size, crate::chunk::PREV_INUSE);
        r
    }

    #[test]
    fn index_math() {
        assert_eq!(smallbin_index(32), 2);
        assert_eq!(smallbin_index(48), 3);
        assert_eq!(smallbin_index(1008), 63);
        assert!(in_smallbin_range(1008));
        assert!(!in_smallbin_range(1024));

        assert_eq!(largebin_index(1024), 64);
        assert_eq!(largebin_index(3072), 96);
        assert!(largebin_index(1 << 24) <= 126);

        // Bin indices partition: small tops out below where large
        // starts.
        assert!(smallbin_index(MIN_LARGE_SIZE - 16) < largebin_index(MIN_LARGE_SIZE));

        assert_eq!(fastbin_index(32), 0);
        assert_eq!(fastbin_index(96), 4);
        assert_eq!(fastbin_index(176), 9);
        assert!(fastbin_index(MAX_FASTBIN_SIZE) < NFASTBINS);
    }

    #[test]
    fn binmap_scan() {
        let mut map = Binmap::default();

        assert_eq!(map.next_marked(0), None);

        map.mark(2);
        map.mark(64);
        map.mark(127);

        assert_eq!(map.next_marked(0), Some(2));
        assert_eq!(map.next_marked(2), Some(2));
        assert_eq!(map.next_marked(3), Some(64));
        assert_eq!(map.next_marked(65), Some(127));
        assert!(map.marked(64));

        map.unmark(64);
        assert_eq!(map.next_marked(3), Some(127));
        assert_eq!(map.next_marked(128), None);
    }

    #[test]
    fn small_bin_fifo() {
        let pool = get_default_descriptor_pool();
        let mut bins = Bins::new(pool).expect("bins should build");

        let index = smallbin_index(48);
        let a = chunk_desc(pool, 0x1000, 48);
        let b = chunk_desc(pool, 0x2000, 48);

        assert!(bins.bin_is_empty(pool, index));
        bins.insert_small(pool, index, a);
        bins.insert_small(pool, index, b);
        assert!(bins.binmap.marked(index));

        // Taken least-recently-inserted first.
        let first = bins.last(pool, index).expect("bin should be non-empty");
        assert_eq!(first, a);
        assert!(bins.unlink(pool, first));

        let second = bins.last(pool, index).expect("bin should be non-empty");
        assert_eq!(second, b);
        assert!(bins.unlink(pool, second));

        assert!(bins.bin_is_empty(pool, index));
    }

    #[test]
    fn large_bin_stays_sorted() {
        let pool = get_default_descriptor_pool();
        let mut bins = Bins::new(pool).expect("bins should build");

        // The first large range spaces bins 64 bytes apart, so these
        // all share one bin.
        let index = largebin_index(2048);
        let sizes = [2048usize, 2096, 2048, 2080, 2096, 2064];
        let mut refs = Vec::new();
        for (i, size) in sizes.iter().enumerate() {
            assert_eq!(largebin_index(*size), index, "test sizes must share a bin");
            let r = chunk_desc(pool, 0x10_0000 + i * 0x1000, *size);
            bins.insert_large(pool, index, r);
            bins.check_large_bin(pool, index).expect("bin must stay sorted");
            refs.push(r);
        }

        let head = bins.head(index);
        let mut walked = Vec::new();
        let mut cursor = pool.get(head).bin_fd.unwrap();
        while cursor != head {
            walked.push(pool.get(cursor).chunksize());
            cursor = pool.get(cursor).bin_fd.unwrap();
        }
        assert_eq!(walked, vec![2096, 2096, 2080, 2064, 2048, 2048]);

        // Unlink a representative; its twin must take over without
        // breaking order.
        let rep_2096 = refs[1];
        assert!(pool.get(rep_2096).size_fd.is_some());
        assert!(bins.unlink(pool, rep_2096));
        bins.check_large_bin(pool, index).expect("bin must stay sorted");

        // Drain everything.
        while let Some(last) = bins.last(pool, index) {
            assert!(bins.unlink(pool, last));
            bins.check_large_bin(pool, index).expect("bin must stay sorted");
        }
        assert!(bins.bin_is_empty(pool, index));
    }

    #[test]
    fn unlink_detects_clobbered_links() {
        let pool = get_default_descriptor_pool();
        let mut bins = Bins::new(pool).expect("bins should build");

        let index = smallbin_index(64);
        let a = chunk_desc(pool, 0x3000, 64);
        let b = chunk_desc(pool, 0x4000, 64);
        bins.insert_small(pool, index, a);
        bins.insert_small(pool, index, b);

        // Simulate a corrupted back-pointer: unlink must refuse
        // without touching the list.
        pool.get_mut(a).bin_bk = Some(a);
        assert!(!bins.unlink(pool, a));
        assert_eq!(bins.last(pool, index), Some(a));
    }

    #[test]
    fn fastbin_lifo() {
        let pool = get_default_descriptor_pool();
        let fast = FastBins::default();

        let a = chunk_desc(pool, 0x5000, 32);
        let b = chunk_desc(pool, 0x6000, 32);

        assert!(fast.all_empty());
        fast.push(pool, 0, a);
        fast.push(pool, 0, b);
        assert!(!fast.all_empty());

        assert_eq!(fast.pop(pool, 0), Some(b));
        assert_eq!(fast.pop(pool, 0), Some(a));
        assert_eq!(fast.pop(pool, 0), None);
        assert!(fast.all_empty());
    }

    #[test]
    fn fastbin_drain() {
        let pool = get_default_descriptor_pool();
        let fast = FastBins::default();

        let a = chunk_desc(pool, 0x7000, 48);
        let b = chunk_desc(pool, 0x8000, 48);
        fast.push(pool, 1, a);
        fast.push(pool, 1, b);

        let mut drained = Vec::new();
        let mut cursor = fast.drain(1);
        while let Some(r) = cursor {
            drained.push(r);
            cursor = pool.get(r).fast_next;
        }

        assert_eq!(drained, vec![b, a]);
        assert!(fast.all_empty());
        assert_eq!(fast.drain(1), None);
    }

    #[test]
    fn fastbin_push_pop_race() {
        use std::sync::Arc;

        let pool = get_default_descriptor_pool();
        let fast = Arc::new(FastBins::default());

        let refs: Vec<DescRef> = (0..64)
            .map(|i| chunk_desc(pool, 0x100_0000 + i * 64, 64))
            .collect();

        let mut handles = Vec::new();
        for shard in refs.chunks(16) {
            let fast = Arc::clone(&fast);
            let shard: Vec<DescRef> = shard.to_vec();
            handles.push(std::thread::spawn(move || {
                let pool = get_default_descriptor_pool();
                let mut local: Vec<DescRef> = Vec::new();

                for r in shard {
                    fast.push(pool, 2, r);
                    if let Some(popped) = fast.pop(pool, 2) {
                        local.push(popped);
                    }
                }
                local
            }));
        }

        let mut seen: Vec<DescRef> = Vec::new();
        for handle in handles {
            seen.extend(handle.join().expect("thread should not panic"));
        }
        while let Some(r) = fast.pop(pool, 2) {
            seen.push(r);
        }

        // Every chunk comes back exactly once.
        seen.sort_unstable_by_key(|r| r.get());
        seen.dedup();
        assert_eq!(seen.len(), 64);
    }
}
