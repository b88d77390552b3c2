//! Fixed-size record pools backed directly by the page mapper.
//!
//! A `Pool<T>` serves descriptor-sized records out of mmapped blocks,
//! with one occupancy bit per slot.  It is the only memory source for
//! the metadata directory and the chunk descriptors, and it never
//! calls back into the heap being implemented.
//!
//! Records are addressed by `Ref<T>`, a non-zero index into the pool.
//! All linked structures in the allocator (bins, neighbour lists, hash
//! chains) store these indices instead of raw pointers, so a stray
//! heap write can at worst name a wrong record, never a wild address.
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

use std::marker::PhantomData;
use std::num::NonZeroU32;
use std::ptr::NonNull;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;

use crate::mapper;
use crate::mapper::Mapper;

/// Records per block; one bit per record in the block's bitmap.
const BLOCK_SLOTS: usize = 1024;
const BITMAP_WORDS: usize = BLOCK_SLOTS / 64;

/// Hard cap on blocks per pool.  The block table is committed up
/// front (1MB of address space), so growth never moves it and readers
/// never race a reallocation.
const MAX_BLOCKS: usize = 1 << 17;

/// Marker for types whose all-zero byte pattern is a valid empty
/// value.  The pool zero-fills slots on release and blocks come
/// zeroed straight from the mapper.
///
/// # Safety
///
/// Implementors promise that zeroed memory is a valid `T`.
pub unsafe trait ZeroSafe: Sized {}

/// A non-zero, 1-based index into a `Pool<T>`.
pub struct Ref<T> {
    index: NonZeroU32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Ref<T> {
    #[inline]
    fn new(index: u32) -> Option<Self> {
        Some(Ref {
            index: NonZeroU32::new(index)?,
            _marker: PhantomData,
        })
    }

    /// The raw 1-based index; useful for packing into tagged words.
    #[inline]
    pub fn get(self) -> u32 {
        self.index.get()
    }

    /// Rebuilds a `Ref` from `get()`'s value.  Zero is `None`.
    #[inline]
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::new(raw)
    }
}

// Manual impls: deriving would bound them on `T`.
impl<T> Clone for Ref<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Ref<T> {}
impl<T> PartialEq for Ref<T> {
    fn eq(&self, other: &Self) -> bool {
        self.index == other.index
    }
}
impl<T> Eq for Ref<T> {}
impl<T> std::hash::Hash for Ref<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.index.hash(state);
    }
}
impl<T> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Ref({})", self.index)
    }
}

#[repr(C)]
struct BlockHeader {
    /// Bits set mark slots in use.
    bitmap: [u64; BITMAP_WORDS],
    free_count: usize,
}

struct PoolInner {
    /// Block to start the next free-slot scan at.
    hint: usize,
    live: usize,
}

/// An immortal, thread-safe pool of `T` records.
///
/// The block table is committed once at init and entries are only
/// appended, so blocks never move and `get` never needs the mutex.
pub struct Pool<T: ZeroSafe> {
    mapper: &'static dyn Mapper,
    table: NonNull<usize>,
    n_blocks: AtomicUsize,
    inner: Mutex<PoolInner>,
    _marker: PhantomData<fn() -> T>,
}

// The raw pointers inside are only dereferenced through the pool's
// own discipline: the mutex guards the table and bitmaps, and record
// contents are guarded by whichever lock owns the record (an arena
// mutex or the directory lock).
unsafe impl<T: ZeroSafe> Send for Pool<T> {}
unsafe impl<T: ZeroSafe> Sync for Pool<T> {}

impl<T: ZeroSafe> Pool<T> {
    fn slots_offset() -> usize {
        let align = std::mem::align_of::<T>().max(std::mem::align_of::<BlockHeader>());
        (std::mem::size_of::<BlockHeader>() + align - 1) & !(align - 1)
    }

    fn block_bytes(mapper: &dyn Mapper) -> usize {
        mapper::round_to_pages(
            mapper,
            Self::slots_offset() + BLOCK_SLOTS * std::mem::size_of::<T>(),
        )
    }

    /// Creates an empty pool served by `mapper`.
    ///
    /// Panics if the block table itself cannot be mapped; pools are
    /// created once, at process init, where there is no heap to keep
    /// consistent yet.
    pub fn new(mapper: &'static dyn Mapper) -> Self {
        let table = mapper::map_anon(mapper, MAX_BLOCKS * std::mem::size_of::<usize>())
            .expect("mapping the pool block table must succeed at init");

        Pool {
            mapper,
            table: table.cast(),
            n_blocks: AtomicUsize::new(0),
            inner: Mutex::new(PoolInner { hint: 0, live: 0 }),
            _marker: PhantomData,
        }
    }

    #[inline]
    fn table_entry(&self, block: usize) -> usize {
        debug_assert!(block < self.n_blocks.load(Ordering::Acquire));
        unsafe { *self.table.as_ptr().add(block) }
    }

    fn header(base: usize) -> *mut BlockHeader {
        base as *mut BlockHeader
    }

    fn slot_ptr(base: usize, slot: usize) -> *mut T {
        (base + Self::slots_offset() + slot * std::mem::size_of::<T>()) as *mut T
    }

    /// Maps one more block.  Returns false on mapper failure or when
    /// the block table is full.
    fn grow(&self, inner: &mut PoolInner) -> bool {
        let n_blocks = self.n_blocks.load(Ordering::Relaxed);
        if n_blocks == MAX_BLOCKS {
            return false;
        }

        let base = match mapper::map_anon(self.mapper, Self::block_bytes(self.mapper)) {
            Ok(base) => base.as_ptr() as usize,
            Err(_) => return false,
        };

        // Fresh pages are zeroed: the bitmap starts all-free and the
        // slots are already valid empty records.
        unsafe { (*Self::header(base)).free_count = BLOCK_SLOTS };

        unsafe { *self.table.as_ptr().add(n_blocks) = base };
        inner.hint = n_blocks;
        // Publishes the table entry written above.
        self.n_blocks.store(n_blocks + 1, Ordering::Release);
        true
    }

    /// Marks the first free slot of `block` as used, if any.
    fn try_block(&self, inner: &mut PoolInner, block: usize) -> Option<Ref<T>> {
        let base = self.table_entry(block);
        let header = unsafe { &mut *Self::header(base) };
        if header.free_count == 0 {
            return None;
        }

        for (word_idx, word) in header.bitmap.iter_mut().enumerate() {
            if *word == u64::MAX {
                continue;
            }

            let bit = (!*word).trailing_zeros() as usize;
            *word |= 1 << bit;
            header.free_count -= 1;
            inner.hint = block;
            inner.live += 1;

            let slot = word_idx * 64 + bit;
            return Ref::new((block * BLOCK_SLOTS + slot + 1) as u32);
        }

        unreachable!("free_count > 0 but no clear bit");
    }

    /// Grabs a free, zeroed record.  Returns `None` only when the
    /// page mapper refuses to grow the pool.
    #[ensures(ret.is_some() -> self.live_count() > 0)]
    pub fn allocate(&self) -> Option<Ref<T>> {
        let mut inner = self.inner.lock().unwrap();

        let n_blocks = self.n_blocks.load(Ordering::Relaxed);
        for attempt in 0..n_blocks {
            let block = (inner.hint + attempt) % n_blocks;
            if let Some(r) = self.try_block(&mut inner, block) {
                return Some(r);
            }
        }

        if !self.grow(&mut inner) {
            return None;
        }

        let fresh = self.n_blocks.load(Ordering::Relaxed) - 1;
        self.try_block(&mut inner, fresh)
    }

    /// Returns a record to the pool and zeroes it.
    ///
    /// The caller must be the record's unique owner.
    pub fn release(&self, r: Ref<T>) {
        let mut inner = self.inner.lock().unwrap();

        let index = (r.get() - 1) as usize;
        let block = index / BLOCK_SLOTS;
        let slot = index % BLOCK_SLOTS;
        assert!(
            block < self.n_blocks.load(Ordering::Relaxed),
            "released a record this pool never served"
        );

        let base = self.table_entry(block);
        let header = unsafe { &mut *Self::header(base) };
        let mask = 1u64 << (slot % 64);
        assert!(header.bitmap[slot / 64] & mask != 0, "double release of a pool record");

        unsafe { std::ptr::write_bytes(Self::slot_ptr(base, slot), 0, 1) };
        header.bitmap[slot / 64] &= !mask;
        header.free_count += 1;
        inner.hint = block;
        inner.live -= 1;
    }

    /// Shared view of a live record.
    ///
    /// Records never move, so the reference stays valid for the
    /// record's lifetime; content reads are serialised by the lock
    /// that owns the record.
    #[inline]
    pub fn get(&self, r: Ref<T>) -> &T {
        unsafe { &*self.record_ptr(r) }
    }

    /// Exclusive view of a live record.
    ///
    /// The pool does not enforce aliasing: the caller must hold the
    /// lock that owns the record (its arena's mutex, or the directory
    /// lock for hash records), and must not fetch two views of the
    /// same record at once.
    #[allow(clippy::mut_from_ref)]
    #[inline]
    pub fn get_mut(&self, r: Ref<T>) -> &mut T {
        unsafe { &mut *self.record_ptr(r) }
    }

    fn record_ptr(&self, r: Ref<T>) -> *mut T {
        let index = (r.get() - 1) as usize;
        let base = self.table_entry(index / BLOCK_SLOTS);

        Self::slot_ptr(base, index % BLOCK_SLOTS)
    }

    /// Number of records currently allocated.
    pub fn live_count(&self) -> usize {
        self.inner.lock().unwrap().live
    }
}

/// Pre-reserved descriptors, one small cache per arena.
///
/// Topped up at the entry of every public API call; if the fill
/// fails, the call reports failure *before* mutating any heap state,
/// so a coalescing path can never be stranded halfway by a descriptor
/// allocation failure.
pub const DESC_CACHE_SIZE: usize = 8;

pub struct DescCache {
    slots: [Option<Ref<crate::chunk::Descriptor>>; DESC_CACHE_SIZE],
    count: usize,
}

impl Default for DescCache {
    fn default() -> Self {
        DescCache {
            slots: [None; DESC_CACHE_SIZE],
            count: 0,
        }
    }
}

impl DescCache {
    /// Fills the cache back up to `DESC_CACHE_SIZE`.  On failure the
    /// cache keeps whatever it already had.
    #[ensures(ret -> self.count == DESC_CACHE_SIZE)]
    pub fn replenish(&mut self, pool: &Pool<crate::chunk::Descriptor>) -> bool {
        while self.count < DESC_CACHE_SIZE {
            match pool.allocate() {
                Some(r) => {
                    self.slots[self.count] = Some(r);
                    self.count += 1;
                }
                None => return false,
            }
        }

        true
    }

    /// Takes a pre-reserved descriptor.  Panics when drained below
    /// the reserve, which means a single API call consumed more than
    /// `DESC_CACHE_SIZE` descriptors.
    pub fn take(&mut self) -> Ref<crate::chunk::Descriptor> {
        assert!(self.count > 0, "descriptor cache drained mid-operation");
        self.count -= 1;
        self.slots[self.count].take().expect("counted slot must be full")
    }

    /// Hands one descriptor back, e.g. when an operation reserved
    /// more than it used.
    pub fn put_back(&mut self, r: Ref<crate::chunk::Descriptor>) {
        if self.count < DESC_CACHE_SIZE {
            self.slots[self.count] = Some(r);
            self.count += 1;
        } else {
            get_default_descriptor_pool().release(r);
        }
    }
}

/// Returns the process-wide descriptor pool.
pub fn get_default_descriptor_pool() -> &'static Pool<crate::chunk::Descriptor> {
    lazy_static::lazy_static! {
        static ref DESCRIPTORS: Pool<crate::chunk::Descriptor> =
            Pool::new(crate::mapper::get_default_mapper());
    }

    &DESCRIPTORS
}

unsafe impl ZeroSafe for crate::chunk::Descriptor {}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    #[repr(C)]
    struct TestRecord {
        key: usize,
        value: u64,
    }

    unsafe impl ZeroSafe for TestRecord {}

    fn test_pool() -> Pool<TestRecord> {
        Pool::new(crate::mapper::get_default_mapper())
    }

    #[test]
    fn smoke_test() {
        let pool = test_pool();

        let a = pool.allocate().expect("allocate should succeed");
        let b = pool.allocate().expect("allocate should succeed");
        assert_ne!(a, b);

        pool.get_mut(a).key = 42;
        pool.get_mut(b).key = 43;
        assert_eq!(pool.get(a).key, 42);
        assert_eq!(pool.get(b).key, 43);

        pool.release(a);
        assert_eq!(pool.live_count(), 1);

        // The freed slot comes back zeroed.
        let c = pool.allocate().expect("allocate should succeed");
        assert_eq!(pool.get(c).key, 0);

        pool.release(b);
        pool.release(c);
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn refs_survive_growth() {
        let pool = test_pool();

        let mut refs = Vec::new();
        // Force several block allocations.
        for i in 0..3 * BLOCK_SLOTS {
            let r = pool.allocate().expect("allocate should succeed");
            pool.get_mut(r).key = i;
            refs.push(r);
        }

        for (i, r) in refs.iter().enumerate() {
            assert_eq!(pool.get(*r).key, i);
        }

        for r in refs {
            pool.release(r);
        }
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn slot_reuse_prefers_released_blocks() {
        let pool = test_pool();

        let refs: Vec<_> = (0..BLOCK_SLOTS + 10)
            .map(|_| pool.allocate().expect("allocate should succeed"))
            .collect();

        let victim = refs[3];
        pool.release(victim);
        let replacement = pool.allocate().expect("allocate should succeed");
        assert_eq!(victim, replacement);

        for r in refs.into_iter().filter(|r| *r != victim) {
            pool.release(r);
        }
        pool.release(replacement);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn double_release_panics() {
        let pool = test_pool();

        let r = pool.allocate().expect("allocate should succeed");
        pool.release(r);
        pool.release(r);
    }

    #[test]
    fn cache_replenish_take() {
        let pool: Pool<crate::chunk::Descriptor> = Pool::new(crate::mapper::get_default_mapper());
        let mut cache = DescCache::default();

        assert!(cache.replenish(&pool));
        assert_eq!(pool.live_count(), DESC_CACHE_SIZE);

        // A full cache services DESC_CACHE_SIZE takes without
        // touching the pool.
        let taken: Vec<_> = (0..DESC_CACHE_SIZE).map(|_| cache.take()).collect();
        assert_eq!(pool.live_count(), DESC_CACHE_SIZE);

        for r in taken {
            cache.put_back(r);
        }
        assert!(cache.replenish(&pool));
        assert_eq!(pool.live_count(), DESC_CACHE_SIZE);
    }
}
