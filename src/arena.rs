//! Arenas: independent heaps, each with its own bins, top chunk, and
//! mutex.  One main arena always exists; more are spun up under
//! contention, up to a cap.  Threads remember the arena they used
//! last and migrate when they find it locked.
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

use std::cell::Cell;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::sync::MutexGuard;

use crate::bins::Bins;
use crate::bins::FastBins;
use crate::chunk::DescRef;
use crate::params::PARAMS;
use crate::pool::DescCache;

/// `arena_tag` of the main arena; 0 tags mmapped chunks.
pub const MAIN_ARENA_TAG: u32 = 1;

/// Low bit of `max_fast`: the authoritative "some fastbin may be
/// non-empty" signal.
const HAVE_FASTCHUNKS_BIT: usize = 1;

/// One heap segment backing a non-main arena: a `HEAP_MAX_SIZE`
/// aligned reservation whose committed frontier grows on demand.
#[derive(Debug, Clone, Copy)]
pub struct HeapSegment {
    pub base: usize,
    /// Bytes made read-write so far.
    pub committed: usize,
    /// Bytes of reserved address space.
    pub reserved: usize,
}

/// Everything an arena protects with its mutex.
pub struct ArenaState {
    /// `None` until the lazy first-call initialisation runs.
    pub bins: Option<Bins>,
    pub top: Option<DescRef>,
    pub cache: DescCache,

    /// Heap segments, newest last (non-main arenas only).
    pub segments: Vec<HeapSegment>,
    /// Whether the main arena's break-managed space is still one
    /// contiguous run.  Cleared forever on the first mapped fallback.
    pub contiguous: bool,
    /// First break address this arena obtained (main arena only).
    pub brk_base: usize,

    /// Bytes obtained from the system and not yet returned.
    pub system_bytes: usize,
    pub max_system_bytes: usize,
}

pub struct Arena {
    tag: u32,
    mutex: Mutex<ArenaState>,
    pub fastbins: FastBins,
    max_fast: AtomicUsize,
    corrupt: AtomicBool,
    /// Mirror of the top chunk's `user_ptr`, readable without the
    /// lock; `free` uses it to keep chunks that border the top out of
    /// the fastbins.  0 until the arena grows a top.
    top_key: AtomicUsize,
}

impl Arena {
    fn new(tag: u32) -> &'static Arena {
        Box::leak(Box::new(Arena {
            tag,
            mutex: Mutex::new(ArenaState {
                bins: None,
                top: None,
                cache: DescCache::default(),
                segments: Vec::new(),
                // In test binaries the C runtime owns the break;
                // growing through it would race its allocator, so
                // the main arena starts out in mapped mode there.
                contiguous: tag == MAIN_ARENA_TAG && cfg!(not(test)),
                brk_base: 0,
                system_bytes: 0,
                max_system_bytes: 0,
            }),
            fastbins: FastBins::default(),
            max_fast: AtomicUsize::new(PARAMS.default_max_fast()),
            corrupt: AtomicBool::new(false),
            top_key: AtomicUsize::new(0),
        }))
    }

    #[inline]
    pub fn tag(&self) -> u32 {
        self.tag
    }

    #[inline]
    pub fn is_main(&self) -> bool {
        self.tag == MAIN_ARENA_TAG
    }

    pub fn lock(&self) -> MutexGuard<ArenaState> {
        self.mutex.lock().unwrap()
    }

    pub fn try_lock(&self) -> Option<MutexGuard<ArenaState>> {
        self.mutex.try_lock().ok()
    }

    /// The fastbin size ceiling (a chunk size); 0 disables fastbins.
    #[inline]
    pub fn max_fast(&self) -> usize {
        self.max_fast.load(Ordering::Relaxed) & !HAVE_FASTCHUNKS_BIT
    }

    pub fn set_max_fast(&self, chunk_size: usize) {
        debug_assert_eq!(chunk_size & HAVE_FASTCHUNKS_BIT, 0);

        // Preserve the flag bit across the update.
        let mut current = self.max_fast.load(Ordering::Relaxed);
        loop {
            let next = chunk_size | (current & HAVE_FASTCHUNKS_BIT);
            match self.max_fast.compare_exchange_weak(
                current,
                next,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(seen) => current = seen,
            }
        }
    }

    #[inline]
    pub fn have_fastchunks(&self) -> bool {
        self.max_fast.load(Ordering::Acquire) & HAVE_FASTCHUNKS_BIT != 0
    }

    /// Called after a fastbin push.
    #[inline]
    pub fn set_fastchunks(&self) {
        self.max_fast.fetch_or(HAVE_FASTCHUNKS_BIT, Ordering::Release);
    }

    /// Called by consolidation, before draining, with the lock held.
    #[inline]
    pub fn clear_fastchunks(&self) {
        self.max_fast.fetch_and(!HAVE_FASTCHUNKS_BIT, Ordering::Release);
    }

    /// The top chunk's address as last published under the lock.
    #[inline]
    pub fn top_key(&self) -> usize {
        self.top_key.load(Ordering::Acquire)
    }

    /// Called whenever the top chunk moves, with the lock held.
    #[inline]
    pub fn publish_top_key(&self, key: usize) {
        self.top_key.store(key, Ordering::Release);
    }

    pub fn is_corrupt(&self) -> bool {
        self.corrupt.load(Ordering::Acquire)
    }

    /// Quarantines the arena: it serves no further allocations.
    pub fn mark_corrupt(&self) {
        self.corrupt.store(true, Ordering::Release);
    }
}

lazy_static::lazy_static! {
    // TODO(lock): this lock is never taken on a fast path once a
    // thread has an affinity.
    static ref ARENAS: Mutex<Vec<&'static Arena>> = Mutex::new(vec![Arena::new(MAIN_ARENA_TAG)]);
}

thread_local!(static AFFINITY: Cell<u32> = Cell::new(0));

pub fn get_main_arena() -> &'static Arena {
    ARENAS.lock().unwrap()[0]
}

/// Resolves an ownership tag to its arena.  Tag 0 (mmapped chunks)
/// has no arena.
pub fn arena_from_tag(tag: u32) -> Option<&'static Arena> {
    if tag == 0 {
        return None;
    }

    ARENAS
        .lock()
        .unwrap()
        .get(tag as usize - 1)
        .copied()
}

pub fn arena_count() -> usize {
    ARENAS.lock().unwrap().len()
}

/// Runs `f` on every arena, in creation order.
pub fn for_each_arena(mut f: impl FnMut(&'static Arena)) {
    let snapshot: Vec<&'static Arena> = ARENAS.lock().unwrap().clone();

    for arena in snapshot {
        f(arena);
    }
}

fn ncpus() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };

    if ret <= 0 {
        1
    } else {
        ret as usize
    }
}

/// The hard arena cap: `M_ARENA_MAX` if set, otherwise the larger of
/// the `M_ARENA_TEST` soft limit and 8 x ncpus.
fn arena_limit() -> usize {
    let configured = PARAMS.arena_max();

    if configured > 0 {
        configured
    } else {
        PARAMS.arena_test().max(8 * ncpus())
    }
}

/// Registers a fresh arena, unless the cap says no.
fn spawn_arena() -> Option<&'static Arena> {
    let mut arenas = ARENAS.lock().unwrap();

    if arenas.len() >= arena_limit() {
        return None;
    }

    let arena = Arena::new(arenas.len() as u32 + 1);
    arenas.push(arena);
    Some(arena)
}

/// Pins the calling thread to `arena` for future allocations.
pub fn set_affinity(arena: &Arena) {
    let _ = AFFINITY.try_with(|cell| cell.set(arena.tag()));
}

/// Pins the calling thread to a freshly created arena, falling back
/// to the main arena at the cap.  Used by tests and by callers that
/// want arena isolation up front.
pub fn pin_to_new_arena() -> &'static Arena {
    let arena = spawn_arena().unwrap_or_else(get_main_arena);

    set_affinity(arena);
    arena
}

/// Picks an arena for an allocation and locks it.
///
/// Preference order: the thread's affine arena if free, then any
/// other uncontended arena, then a fresh arena if the cap allows,
/// then block on the affine arena.  Corrupt arenas are skipped
/// everywhere.
#[ensures(ret.0.tag() >= MAIN_ARENA_TAG)]
pub fn acquire_arena() -> (&'static Arena, MutexGuard<'static, ArenaState>) {
    let affine_tag = AFFINITY.try_with(|cell| cell.get()).unwrap_or(0);
    let affine = arena_from_tag(affine_tag).unwrap_or_else(get_main_arena);

    if !affine.is_corrupt() {
        if let Some(guard) = affine.try_lock() {
            set_affinity(affine);
            return (affine, guard);
        }
    }

    // Contended (or quarantined): migrate to any free arena.
    let snapshot: Vec<&'static Arena> = ARENAS.lock().unwrap().clone();
    for arena in &snapshot {
        if arena.is_corrupt() {
            continue;
        }
        if let Some(guard) = arena.try_lock() {
            set_affinity(arena);
            return (arena, guard);
        }
    }

    if let Some(fresh) = spawn_arena() {
        let guard = fresh.lock();
        set_affinity(fresh);
        return (fresh, guard);
    }

    // Cap reached and everything is busy: wait our turn.
    let fallback = if affine.is_corrupt() {
        snapshot
            .iter()
            .copied()
            .find(|a| !a.is_corrupt())
            .unwrap_or_else(get_main_arena)
    } else {
        affine
    };
    let guard = fallback.lock();
    set_affinity(fallback);
    (fallback, guard)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn main_arena_exists() {
        let main = get_main_arena();

        assert_eq!(main.tag(), MAIN_ARENA_TAG);
        assert!(main.is_main());
        assert_eq!(arena_from_tag(MAIN_ARENA_TAG).unwrap().tag(), main.tag());
        assert!(arena_from_tag(0).is_none());
    }

    #[test]
    fn fastchunks_flag_survives_max_fast_updates() {
        let arena = Arena::new(99);

        let default_max = arena.max_fast();
        assert!(default_max == 0 || default_max % 16 == 0);

        arena.set_fastchunks();
        assert!(arena.have_fastchunks());

        arena.set_max_fast(128);
        assert_eq!(arena.max_fast(), 128);
        assert!(arena.have_fastchunks());

        arena.clear_fastchunks();
        assert!(!arena.have_fastchunks());
        assert_eq!(arena.max_fast(), 128);
    }

    #[test]
    fn acquire_prefers_uncontended() {
        let (first, guard) = acquire_arena();

        // With `first` held, a second acquisition must land
        // elsewhere (or spawn).
        let (second, second_guard) = acquire_arena();
        assert_ne!(first.tag(), second.tag());

        drop(second_guard);
        drop(guard);
    }

    #[test]
    fn corrupt_arena_is_skipped() {
        let quarantined = pin_to_new_arena();
        quarantined.mark_corrupt();

        let (chosen, _guard) = acquire_arena();
        assert_ne!(chosen.tag(), quarantined.tag());
    }
}
