//! The heap engine: the allocation ladder, free with coalescing, the
//! fastbin consolidation pass, and the realloc/memalign cores.
//!
//! Everything here works on descriptors by pool index; the only raw
//! addresses are the user pointers being handed out or taken back.
//! All state mutation happens under the owning arena's mutex, except
//! the fastbin push in `free_inner`, which is a lock-free CAS.
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

use crate::arena::acquire_arena;
use crate::arena::arena_from_tag;
use crate::arena::for_each_arena;
use crate::arena::Arena;
use crate::arena::ArenaState;
use crate::bins::bin_index;
use crate::bins::fastbin_index;
use crate::bins::in_smallbin_range;
use crate::bins::largebin_index;
use crate::bins::smallbin_index;
use crate::bins::Bins;
use crate::bins::NFASTBINS;
use crate::bins::UNSORTED;
use crate::chunk::request2size;
use crate::chunk::DescRef;
use crate::chunk::Descriptor;
use crate::chunk::MIN_CHUNK_SIZE;
use crate::directory::get_default_directory;
use crate::directory::Directory;
use crate::params::CHECK_ABORT;
use crate::params::CHECK_PRINT;
use crate::params::CHECK_STDERR;
use crate::params::FASTBIN_CONSOLIDATION_THRESHOLD;
use crate::params::PARAMS;
use crate::pool::get_default_descriptor_pool;
use crate::pool::Pool;
use crate::sys;
use crate::Error;

/// Unsorted-bin drains give up after this many victims, so a
/// pathological staging queue cannot wedge a malloc call.
const MAX_UNSORTED_ITERS: usize = 10000;

#[inline]
pub(crate) fn pool() -> &'static Pool<Descriptor> {
    get_default_descriptor_pool()
}

#[inline]
pub(crate) fn dir() -> &'static Directory {
    get_default_directory()
}

/// Reports a metadata inconsistency per `M_CHECK_ACTION`: print,
/// abort, and/or quarantine the arena.  Always evaluates to
/// `Error::Corruption` so callers can `return Err(...)` it.
pub(crate) fn report_corruption(arena: Option<&Arena>, what: &str, ptr: usize) -> Error {
    let action = PARAMS.check_action();

    if action & CHECK_PRINT != 0 {
        if action & CHECK_STDERR != 0 {
            eprintln!("sidemalloc: {} (ptr={:#x})", what, ptr);
        } else {
            log::error!("{} (ptr={:#x})", what, ptr);
        }
    }

    if let Some(arena) = arena {
        arena.mark_corrupt();
    }

    if action & CHECK_ABORT != 0 {
        std::process::abort();
    }

    Error::Corruption
}

/// Marks `d` as handed out and flips its successor's `PREV_INUSE`.
fn set_inuse(d: DescRef) {
    pool().get_mut(d).inuse = true;

    if let Some(n) = pool().get(d).md_next {
        pool().get_mut(n).set_prev_inuse(true);
    }
}

fn top_size(state: &ArenaState) -> usize {
    state.top.map_or(0, |t| pool().get(t).chunksize())
}

fn perturb_alloc(ptr: usize, bytes: usize) {
    let b = PARAMS.perturb_byte();

    if b != 0 {
        unsafe { std::ptr::write_bytes(ptr as *mut u8, b ^ 0xff, bytes) };
    }
}

fn perturb_free(ptr: usize, bytes: usize) {
    let b = PARAMS.perturb_byte();

    if b != 0 {
        unsafe { std::ptr::write_bytes(ptr as *mut u8, b, bytes) };
    }
}

#[cfg(feature = "hardening")]
mod guard {
    use crate::chunk::DescRef;
    use crate::chunk::GUARD_SIZE;

    fn process_seed() -> u64 {
        lazy_static::lazy_static! {
            static ref SEED: u64 = {
                let mut seed: u64 = 0;
                let got = unsafe {
                    libc::getrandom(
                        &mut seed as *mut u64 as *mut libc::c_void,
                        std::mem::size_of::<u64>(),
                        0,
                    )
                };
                if got != std::mem::size_of::<u64>() as isize {
                    // Degraded fallback; still per-process.
                    seed = std::process::id() as u64 ^ 0x9e37_79b9_7f4a_7c15;
                }
                seed | 1
            };
        }

        *SEED
    }

    /// Stamps the requested size and a canary after the caller's
    /// bytes.
    pub(super) fn arm(r: DescRef, ptr: usize, request: usize) {
        let pool = super::pool();
        let canary = process_seed().wrapping_mul(ptr as u64 | 1);

        {
            let d = pool.get_mut(r);
            d.req_bytes = request;
            d.guard = canary;
        }
        unsafe {
            std::ptr::copy_nonoverlapping(
                canary.to_ne_bytes().as_ptr(),
                (ptr + request) as *mut u8,
                GUARD_SIZE,
            );
        }
    }

    /// Verifies the canary; false means the caller scribbled past
    /// its allocation.
    pub(super) fn check(r: DescRef, ptr: usize) -> bool {
        let pool = super::pool();
        let (request, canary) = {
            let d = pool.get(r);
            (d.req_bytes, d.guard)
        };

        if ptr + request + GUARD_SIZE > pool.get(r).end() {
            return false;
        }

        let mut found = [0u8; GUARD_SIZE];
        unsafe {
            std::ptr::copy_nonoverlapping(
                (ptr + request) as *const u8,
                found.as_mut_ptr(),
                GUARD_SIZE,
            );
        }
        found == canary.to_ne_bytes()
    }
}

fn ensure_init(state: &mut ArenaState) -> Result<(), Error> {
    if state.bins.is_none() {
        state.bins = Some(Bins::new(pool()).ok_or(Error::OutOfMemory)?);
    }

    Ok(())
}

/// Splits the chunk behind `d` at offset `nb`: `d` keeps the prefix,
/// and a fresh descriptor for the free remainder is registered and
/// spliced into the physical-neighbour list.  The remainder is not
/// placed on any bin; the caller decides.
///
/// On failure nothing has changed.
#[requires(pool().get(d).chunksize() >= nb + MIN_CHUNK_SIZE)]
#[ensures(ret.is_ok() -> pool().get(d).chunksize() == nb)]
fn split_chunk(
    arena: &Arena,
    state: &mut ArenaState,
    d: DescRef,
    nb: usize,
) -> Result<DescRef, Error> {
    let pool = pool();
    let old_size = pool.get(d).chunksize();
    let rem_key = pool.get(d).user_ptr + nb;
    let rem_size = old_size - nb;

    let r = state.cache.take();
    if dir().insert(rem_key, r).is_err() {
        state.cache.put_back(r);
        return Err(Error::OutOfMemory);
    }

    let old_next = pool.get(d).md_next;
    {
        let rd = pool.get_mut(r);
        rd.user_ptr = rem_key;
        rd.set_head(rem_size, crate::chunk::PREV_INUSE | sys::size_flags(arena));
        rd.arena_tag = arena.tag();
        rd.inuse = false;
        rd.md_prev = Some(d);
        rd.md_next = old_next;
    }
    if let Some(n) = old_next {
        let nd = pool.get_mut(n);
        nd.md_prev = Some(r);
        nd.set_prev_inuse(false);
        nd.prev_size = rem_size;
    }

    let dd = pool.get_mut(d);
    dd.set_chunksize(nb);
    dd.md_next = Some(r);

    Ok(r)
}

/// Carves an allocated chunk of `nb` bytes off the bottom of the top
/// chunk.  The top keeps its descriptor but moves up, so its
/// directory key is re-registered first; on failure nothing changed.
#[requires(state.top.is_some())]
#[requires(top_size(state) >= nb + MIN_CHUNK_SIZE)]
fn split_top(arena: &Arena, state: &mut ArenaState, nb: usize) -> Result<usize, Error> {
    let pool = pool();
    let top = state.top.expect("contract checked");
    let old_key = pool.get(top).user_ptr;
    let old_size = pool.get(top).chunksize();
    let new_key = old_key + nb;

    let victim = state.cache.take();
    if dir().insert(new_key, top).is_err() {
        state.cache.put_back(victim);
        return Err(Error::OutOfMemory);
    }
    dir().update(old_key, Some(victim));

    let old_md_prev = pool.get(top).md_prev;
    {
        let vd = pool.get_mut(victim);
        vd.user_ptr = old_key;
        // The chunk below the top is never free, so the prefix
        // inherits a set PREV_INUSE.
        vd.set_head(nb, crate::chunk::PREV_INUSE | sys::size_flags(arena));
        vd.arena_tag = arena.tag();
        vd.inuse = true;
        vd.md_prev = old_md_prev;
        vd.md_next = Some(top);
    }
    if let Some(p) = old_md_prev {
        pool.get_mut(p).md_next = Some(victim);
    }

    {
        let td = pool.get_mut(top);
        td.user_ptr = new_key;
        td.set_chunksize(old_size - nb);
        td.set_prev_inuse(true);
        td.md_prev = Some(victim);
    }
    arena.publish_top_key(new_key);

    Ok(old_key)
}

/// Drains every fastbin, coalescing each chunk with its free
/// neighbours and staging the results on the unsorted bin.  Also the
/// lazy initialiser's workhorse: the first call into an arena runs
/// through here.
pub(crate) fn consolidate(arena: &Arena, state: &mut ArenaState) {
    arena.clear_fastchunks();

    for index in 0..NFASTBINS {
        let mut cursor = arena.fastbins.drain(index);
        while let Some(r) = cursor {
            cursor = pool().get(r).fast_next;
            pool().get_mut(r).fast_next = None;

            // A corrupt chunk poisons the arena but the drain keeps
            // going; the remaining chunks are still reachable only
            // from here.
            let _ = coalesce_and_place(arena, state, r);
        }
    }
}

/// The free core: merges `d` (already marked not-inuse, unbinned)
/// with its free neighbours, absorbs into the top when adjacent, and
/// otherwise stages the result on the unsorted bin.  Returns the
/// resulting chunk size.
fn coalesce_and_place(
    arena: &Arena,
    state: &mut ArenaState,
    d0: DescRef,
) -> Result<usize, Error> {
    let pool = pool();
    let d = d0;
    let mut size = pool.get(d).chunksize();

    debug_assert!(!pool.get(d).inuse);

    // Backward: absorb the free previous neighbour into `d`.
    if !pool.get(d).prev_inuse() {
        let p = match pool.get(d).md_prev {
            Some(p) => p,
            None => {
                let at = pool.get(d).user_ptr;
                return Err(report_corruption(Some(arena), "free chunk below has no descriptor", at));
            }
        };

        let p_ok = !pool.get(p).inuse
            && pool.get(p).bin_fd.is_some()
            && pool.get(p).end() == pool.get(d).user_ptr
            && pool.get(p).chunksize() == pool.get(d).prev_size;
        if !p_ok {
            let at = pool.get(d).user_ptr;
            return Err(report_corruption(Some(arena), "backward coalesce mismatch", at));
        }

        let bins = state.bins.as_mut().expect("initialised before any free");
        if !bins.unlink(pool, p) {
            let at = pool.get(p).user_ptr;
            return Err(report_corruption(Some(arena), "corrupted bin links on coalesce", at));
        }

        // `d` survives and takes over `p`'s address.
        let p_key = pool.get(p).user_ptr;
        let d_key = pool.get(d).user_ptr;
        dir().update(p_key, Some(d));
        dir().delete(d_key);

        size += pool.get(p).chunksize();
        let p_prev = pool.get(p).md_prev;
        let p_prev_inuse = pool.get(p).prev_inuse();
        let p_prev_size = pool.get(p).prev_size;
        {
            let dd = pool.get_mut(d);
            dd.user_ptr = p_key;
            dd.md_prev = p_prev;
            dd.set_prev_inuse(p_prev_inuse);
            dd.prev_size = p_prev_size;
        }
        if let Some(pp) = p_prev {
            pool.get_mut(pp).md_next = Some(d);
        }
        pool.release(p);
    }

    // Forward: merge into the top, a free neighbour, or just fix the
    // successor's bookkeeping.
    match pool.get(d).md_next {
        Some(n) if state.top == Some(n) => {
            if pool.get(d).end() != pool.get(n).user_ptr {
                let at = pool.get(d).user_ptr;
                return Err(report_corruption(Some(arena), "top adjacency mismatch", at));
            }

            let new_size = size + pool.get(n).chunksize();
            dir().delete(pool.get(n).user_ptr);
            let top_next = pool.get(n).md_next;
            pool.release(n);

            {
                let dd = pool.get_mut(d);
                dd.set_chunksize(new_size);
                dd.md_next = top_next;
            }
            sys::set_top(arena, state, Some(d));
            return Ok(new_size);
        }
        Some(n) if !pool.get(n).inuse && pool.get(n).bin_fd.is_some() => {
            if pool.get(d).end() != pool.get(n).user_ptr {
                let at = pool.get(d).user_ptr;
                return Err(report_corruption(Some(arena), "forward coalesce mismatch", at));
            }

            let bins = state.bins.as_mut().expect("initialised before any free");
            if !bins.unlink(pool, n) {
                let at = pool.get(n).user_ptr;
                return Err(report_corruption(Some(arena), "corrupted bin links on coalesce", at));
            }

            size += pool.get(n).chunksize();
            dir().delete(pool.get(n).user_ptr);
            let n_next = pool.get(n).md_next;
            pool.release(n);

            pool.get_mut(d).md_next = n_next;
            if let Some(nn) = n_next {
                let nd = pool.get_mut(nn);
                nd.md_prev = Some(d);
                nd.set_prev_inuse(false);
                nd.prev_size = size;
            }
        }
        Some(n) => {
            let nd = pool.get_mut(n);
            nd.set_prev_inuse(false);
            nd.prev_size = size;
        }
        None => {}
    }

    pool.get_mut(d).set_chunksize(size);
    let bins = state.bins.as_mut().expect("initialised before any free");
    bins.insert_unsorted(pool, d);

    Ok(size)
}

/// The fastbin/smallbin/unsorted/largebin/binmap/top allocation
/// ladder, entered with the arena locked, initialised, and the
/// descriptor cache full.
fn malloc_arena(arena: &Arena, state: &mut ArenaState, nb: usize) -> Result<usize, Error> {
    let pool = pool();

    // 1. Fastbin hit: LIFO, no coalescing, no neighbour updates.
    if nb <= arena.max_fast() {
        let index = fastbin_index(nb);
        if let Some(v) = arena.fastbins.pop(pool, index) {
            let expected = (index + 2) << 4;
            if pool.get(v).chunksize() != expected {
                let at = pool.get(v).user_ptr;
                return Err(report_corruption(Some(arena), "fastbin size-class mismatch", at));
            }
            pool.get_mut(v).inuse = true;
            return Ok(pool.get(v).user_ptr);
        }
    }

    if in_smallbin_range(nb) {
        // 2. Small-bin exact fit.
        let index = smallbin_index(nb);
        let maybe = state.bins.as_ref().expect("initialised").last(pool, index);
        if let Some(v) = maybe {
            let bins = state.bins.as_mut().expect("initialised");
            if !bins.unlink(pool, v) {
                let at = pool.get(v).user_ptr;
                return Err(report_corruption(Some(arena), "corrupted small bin", at));
            }
            set_inuse(v);
            return Ok(pool.get(v).user_ptr);
        }
    } else if arena.have_fastchunks() {
        // 3. Large request with fastbin clutter: consolidate first,
        // so the drained chunks can satisfy us below.
        consolidate(arena, state);
    }

    loop {
        // 4. Drain the unsorted staging queue.
        let mut iters = 0;
        loop {
            let victim = match state.bins.as_ref().expect("initialised").last(pool, UNSORTED) {
                Some(v) => v,
                None => break,
            };
            iters += 1;
            if iters > MAX_UNSORTED_ITERS {
                break;
            }

            let vsize = pool.get(victim).chunksize();
            if vsize < MIN_CHUNK_SIZE || vsize > state.system_bytes {
                let at = pool.get(victim).user_ptr;
                return Err(report_corruption(Some(arena), "unsorted chunk size out of range", at));
            }

            // A lone last-remainder serving a small request splits in
            // place, keeping locality for runs of similar requests.
            let head = state.bins.as_ref().expect("initialised").head(UNSORTED);
            let only_one = pool.get(victim).bin_fd == Some(head)
                && pool.get(victim).bin_bk == Some(head);
            if in_smallbin_range(nb)
                && only_one
                && state.bins.as_ref().expect("initialised").last_remainder == Some(victim)
                && vsize >= nb + MIN_CHUNK_SIZE
            {
                let bins = state.bins.as_mut().expect("initialised");
                if !bins.unlink(pool, victim) {
                    let at = pool.get(victim).user_ptr;
                    return Err(report_corruption(Some(arena), "corrupted unsorted bin", at));
                }

                // A metadata failure downgrades the split: serve the
                // whole chunk rather than strand it.
                if let Ok(rem) = split_chunk(arena, state, victim, nb) {
                    let bins = state.bins.as_mut().expect("initialised");
                    bins.insert_unsorted(pool, rem);
                    bins.last_remainder = Some(rem);
                }

                set_inuse(victim);
                return Ok(pool.get(victim).user_ptr);
            }

            let bins = state.bins.as_mut().expect("initialised");
            if !bins.unlink(pool, victim) {
                let at = pool.get(victim).user_ptr;
                return Err(report_corruption(Some(arena), "corrupted unsorted bin", at));
            }

            if vsize == nb {
                set_inuse(victim);
                return Ok(pool.get(victim).user_ptr);
            }

            // Classify into its real bin.
            if in_smallbin_range(vsize) {
                bins.insert_small(pool, smallbin_index(vsize), victim);
            } else {
                bins.insert_large(pool, largebin_index(vsize), victim);
            }
        }

        // 5. Large-bin best fit through the size skip list.
        if !in_smallbin_range(nb) {
            let index = largebin_index(nb);
            let bins_ref = state.bins.as_ref().expect("initialised");
            if bins_ref.binmap.marked(index) && !bins_ref.bin_is_empty(pool, index) {
                let head = bins_ref.head(index);

                // `size_bk` from the head walks represented sizes
                // smallest-first.
                let mut rep = pool.get(head).size_bk.expect("skip circle is closed");
                while rep != head && pool.get(rep).chunksize() < nb {
                    rep = pool.get(rep).size_bk.expect("skip circle is closed");
                }

                if rep != head {
                    // Prefer a same-size twin over the representative
                    // to spare the skip list a repair.
                    let mut victim = rep;
                    let twin = pool.get(rep).bin_fd.expect("bins are circular");
                    if twin != head
                        && pool.get(twin).size_fd.is_none()
                        && pool.get(twin).chunksize() == pool.get(rep).chunksize()
                    {
                        victim = twin;
                    }

                    return finish_binned_victim(arena, state, victim, nb);
                }
            }
        }

        // 6. Binmap scan: the next non-empty bin above ours serves a
        // smallest-fitting chunk.
        let mut scan = bin_index(nb) + 1;
        let mut scanned_victim = None;
        while let Some(index) = state
            .bins
            .as_ref()
            .expect("initialised")
            .binmap
            .next_marked(scan)
        {
            match state.bins.as_ref().expect("initialised").last(pool, index) {
                None => {
                    // Stale bit left by a lazy clear.
                    state.bins.as_mut().expect("initialised").binmap.unmark(index);
                    scan = index + 1;
                }
                Some(v) => {
                    if pool.get(v).chunksize() < nb {
                        // False alarm: this bin cannot serve us.
                        scan = index + 1;
                        continue;
                    }
                    scanned_victim = Some(v);
                    break;
                }
            }
        }
        if let Some(victim) = scanned_victim {
            return finish_binned_victim(arena, state, victim, nb);
        }

        // 7. The top chunk, growing it if need be.
        if top_size(state) >= nb + MIN_CHUNK_SIZE {
            return split_top(arena, state, nb);
        }
        if arena.have_fastchunks() {
            consolidate(arena, state);
            continue;
        }

        sys::sysmalloc(arena, state, nb)?;
        return split_top(arena, state, nb);
    }
}

/// Unlinks a bin victim, splits off a remainder when worthwhile, and
/// hands out the prefix.
fn finish_binned_victim(
    arena: &Arena,
    state: &mut ArenaState,
    victim: DescRef,
    nb: usize,
) -> Result<usize, Error> {
    let pool = pool();

    let bins = state.bins.as_mut().expect("initialised");
    if !bins.unlink(pool, victim) {
        let at = pool.get(victim).user_ptr;
        return Err(report_corruption(Some(arena), "corrupted bin links", at));
    }

    let vsize = pool.get(victim).chunksize();
    debug_assert!(vsize >= nb);

    if vsize - nb >= MIN_CHUNK_SIZE {
        // A metadata failure downgrades the split: serve the whole
        // chunk rather than strand it.
        if let Ok(rem) = split_chunk(arena, state, victim, nb) {
            let bins = state.bins.as_mut().expect("initialised");
            bins.insert_unsorted(pool, rem);
            if in_smallbin_range(nb) {
                bins.last_remainder = Some(rem);
            }
        }
    }

    set_inuse(victim);
    Ok(pool.get(victim).user_ptr)
}

/// Allocates `request` bytes: mmap bypass for huge requests, the
/// arena ladder otherwise.
pub(crate) fn malloc_inner(request: usize) -> Result<usize, Error> {
    let nb = request2size(request).ok_or(Error::InvalidArgument)?;

    if request >= PARAMS.mmap_threshold() {
        if let Ok(ptr) = sys::mmap_alloc(nb) {
            perturb_alloc(ptr, nb);
            #[cfg(feature = "hardening")]
            guard::arm(
                dir().lookup(ptr).expect("just registered"),
                ptr,
                request,
            );
            return Ok(ptr);
        }
        // Fall through: the arena may still have room.
    }

    let (arena, mut state) = acquire_arena();
    ensure_init(&mut state)?;
    if !state.cache.replenish(pool()) {
        return Err(Error::OutOfMemory);
    }

    let ptr = malloc_arena(arena, &mut state, nb)?;
    drop(state);

    perturb_alloc(ptr, nb);
    #[cfg(feature = "hardening")]
    guard::arm(dir().lookup(ptr).expect("just allocated"), ptr, request);

    Ok(ptr)
}

/// Frees the chunk at `ptr`.  Null is the caller's business; by the
/// time we are here the pointer must be a live allocation.
pub(crate) fn free_inner(ptr: usize) -> Result<(), Error> {
    let pool = pool();

    let r = match dir().lookup(ptr) {
        Some(r) => r,
        None => return Err(report_corruption(None, "free of unregistered pointer", ptr)),
    };
    if !pool.get(r).inuse {
        let arena = arena_from_tag(pool.get(r).arena_tag);
        return Err(report_corruption(arena, "double free", ptr));
    }

    #[cfg(feature = "hardening")]
    {
        if !guard::check(r, ptr) {
            let arena = arena_from_tag(pool.get(r).arena_tag);
            return Err(report_corruption(arena, "guard canary clobbered", ptr));
        }
    }

    if pool.get(r).is_mmapped() {
        perturb_free(ptr, pool.get(r).chunksize());
        return sys::mmap_free(r);
    }

    let tag = pool.get(r).arena_tag;
    let arena = match arena_from_tag(tag) {
        Some(a) => a,
        None => return Err(report_corruption(None, "free with unknown arena tag", ptr)),
    };
    let size = pool.get(r).chunksize();

    perturb_free(ptr, size);

    // Lock-free fast path: small chunks that do not border the top
    // go straight onto a fastbin and keep looking allocated to their
    // neighbours.
    if size <= arena.max_fast() && ptr + size != arena.top_key() {
        let index = fastbin_index(size);
        debug_assert!(index < NFASTBINS);

        if arena.fastbins.top(index) == Some(r) {
            return Err(report_corruption(Some(arena), "double free (fastbin top)", ptr));
        }

        pool.get_mut(r).inuse = false;
        arena.fastbins.push(pool, index, r);
        arena.set_fastchunks();
        return Ok(());
    }

    // Slow path: coalesce under the owner's lock.
    let mut state = arena.lock();
    if !pool.get(r).inuse {
        return Err(report_corruption(Some(arena), "double free", ptr));
    }
    if !state.cache.replenish(pool) {
        // Coalescing only ever releases descriptors, but keep the
        // entry guarantee uniform.
        return Err(Error::OutOfMemory);
    }

    pool.get_mut(r).inuse = false;
    let merged = coalesce_and_place(arena, &mut state, r)?;

    if merged >= FASTBIN_CONSOLIDATION_THRESHOLD {
        if arena.have_fastchunks() {
            consolidate(arena, &mut state);
        }
        if let Some(threshold) = PARAMS.trim_threshold() {
            if top_size(&state) >= threshold {
                if arena.is_main() {
                    sys::systrim(arena, &mut state, PARAMS.top_pad());
                } else {
                    sys::heap_trim(arena, &mut state, PARAMS.top_pad());
                }
            }
        }
    }

    Ok(())
}

/// The realloc core.  Null/zero argument handling lives in the API
/// layer.
pub(crate) fn realloc_inner(ptr: usize, request: usize) -> Result<usize, Error> {
    let pool = pool();
    let nb = request2size(request).ok_or(Error::InvalidArgument)?;

    let r = match dir().lookup(ptr) {
        Some(r) => r,
        None => return Err(report_corruption(None, "realloc of unregistered pointer", ptr)),
    };
    if !pool.get(r).inuse {
        let arena = arena_from_tag(pool.get(r).arena_tag);
        return Err(report_corruption(arena, "realloc after free", ptr));
    }

    if pool.get(r).is_mmapped() {
        let old_size = pool.get(r).chunksize();
        let mapper = crate::mapper::get_default_mapper();
        if crate::mapper::round_to_pages(mapper, nb) == old_size {
            return Ok(ptr);
        }

        // Move: allocate first so failure leaves the original alone.
        let fresh = malloc_inner(request)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                ptr as *const u8,
                fresh as *mut u8,
                old_size.min(request),
            );
        }
        sys::mmap_free(r)?;
        return Ok(fresh);
    }

    let arena = match arena_from_tag(pool.get(r).arena_tag) {
        Some(a) => a,
        None => return Err(report_corruption(None, "realloc with unknown arena tag", ptr)),
    };

    {
        let mut state = arena.lock();
        if !state.cache.replenish(pool) {
            return Err(Error::OutOfMemory);
        }

        let old_size = pool.get(r).chunksize();

        if old_size >= nb {
            // Shrink in place, freeing the tail when it is worth a
            // chunk.
            if old_size - nb >= MIN_CHUNK_SIZE {
                if let Ok(rem) = split_chunk(arena, &mut state, r, nb) {
                    let _ = coalesce_and_place(arena, &mut state, rem)?;
                }
            }
            #[cfg(feature = "hardening")]
            guard::arm(r, ptr, request);
            return Ok(ptr);
        }

        match pool.get(r).md_next {
            Some(n) if state.top == Some(n) => {
                let total = old_size + pool.get(n).chunksize();
                if total >= nb + MIN_CHUNK_SIZE {
                    // Grow into the top: the returned pointer does
                    // not move.
                    let old_top_key = pool.get(n).user_ptr;
                    let new_top_key = ptr + nb;
                    if dir().insert(new_top_key, n).is_ok() {
                        dir().delete(old_top_key);

                        {
                            let td = pool.get_mut(n);
                            td.user_ptr = new_top_key;
                            td.set_chunksize(total - nb);
                            td.set_prev_inuse(true);
                        }
                        pool.get_mut(r).set_chunksize(nb);
                        arena.publish_top_key(new_top_key);

                        #[cfg(feature = "hardening")]
                        guard::arm(r, ptr, request);
                        return Ok(ptr);
                    }
                }
            }
            Some(n)
                if !pool.get(n).inuse
                    && pool.get(n).bin_fd.is_some()
                    && old_size + pool.get(n).chunksize() >= nb =>
            {
                // Absorb the free next neighbour in place.
                let bins = state.bins.as_mut().expect("initialised");
                if !bins.unlink(pool, n) {
                    let at = pool.get(n).user_ptr;
                    return Err(report_corruption(Some(arena), "corrupted bin links on realloc", at));
                }

                let total = old_size + pool.get(n).chunksize();
                dir().delete(pool.get(n).user_ptr);
                let n_next = pool.get(n).md_next;
                pool.release(n);

                {
                    let dd = pool.get_mut(r);
                    dd.set_chunksize(total);
                    dd.md_next = n_next;
                }
                if let Some(nn) = n_next {
                    let nd = pool.get_mut(nn);
                    nd.md_prev = Some(r);
                    nd.set_prev_inuse(true);
                }

                if total - nb >= MIN_CHUNK_SIZE {
                    if let Ok(rem) = split_chunk(arena, &mut state, r, nb) {
                        let _ = coalesce_and_place(arena, &mut state, rem)?;
                    }
                }

                #[cfg(feature = "hardening")]
                guard::arm(r, ptr, request);
                return Ok(ptr);
            }
            _ => {}
        }
    }

    // Move: allocate, copy, free.
    let old_size = pool.get(r).chunksize();
    let fresh = malloc_inner(request)?;
    unsafe {
        std::ptr::copy_nonoverlapping(ptr as *const u8, fresh as *mut u8, old_size.min(request));
    }
    free_inner(ptr)?;
    Ok(fresh)
}

/// The memalign core: over-allocate, carve the aligned interior,
/// free the lead and tail.
pub(crate) fn memalign_inner(alignment: usize, request: usize) -> Result<usize, Error> {
    if !alignment.is_power_of_two() || alignment > crate::chunk::MAX_REQUEST {
        return Err(Error::InvalidArgument);
    }
    if alignment <= crate::chunk::ALIGNMENT {
        return malloc_inner(request);
    }

    let pool = pool();
    let nb = request2size(request).ok_or(Error::InvalidArgument)?;
    let padded = nb
        .checked_add(alignment + MIN_CHUNK_SIZE)
        .ok_or(Error::InvalidArgument)?;

    let raw = malloc_inner(padded)?;
    let r = dir().lookup(raw).expect("just allocated");

    if pool.get(r).is_mmapped() {
        // Mapped chunks are page-aligned; that covers most requests.
        if raw % alignment == 0 {
            return Ok(raw);
        }
        free_inner(raw)?;
        let ptr = sys::mmap_alloc_aligned(nb, alignment)?;
        #[cfg(feature = "hardening")]
        guard::arm(dir().lookup(ptr).expect("just registered"), ptr, request);
        return Ok(ptr);
    }

    if raw % alignment == 0 {
        // Already aligned: just return the generous chunk.
        return Ok(raw);
    }

    let arena = arena_from_tag(pool.get(r).arena_tag).expect("arena chunks carry a live tag");
    let mut state = arena.lock();
    if !state.cache.replenish(pool) {
        drop(state);
        let _ = free_inner(raw);
        return Err(Error::OutOfMemory);
    }

    let mut aligned = (raw + alignment - 1) & !(alignment - 1);
    if aligned - raw < MIN_CHUNK_SIZE {
        aligned += alignment;
    }
    let lead = aligned - raw;
    debug_assert!(pool.get(r).chunksize() >= lead + nb);

    // Split off the aligned chunk, then give the lead back.
    let aligned_ref = match split_chunk(arena, &mut state, r, lead) {
        Ok(rem) => rem,
        Err(e) => {
            drop(state);
            let _ = free_inner(raw);
            return Err(e);
        }
    };
    set_inuse(aligned_ref);

    pool.get_mut(r).inuse = false;
    coalesce_and_place(arena, &mut state, r)?;

    // Trim the tail down to size.
    let aligned_size = pool.get(aligned_ref).chunksize();
    if aligned_size - nb >= MIN_CHUNK_SIZE {
        if let Ok(tail) = split_chunk(arena, &mut state, aligned_ref, nb) {
            coalesce_and_place(arena, &mut state, tail)?;
        }
    }

    drop(state);
    perturb_alloc(aligned, nb);
    #[cfg(feature = "hardening")]
    guard::arm(aligned_ref, aligned, request);

    Ok(aligned)
}

/// Usable bytes behind a live pointer; 0 for anything else.
pub(crate) fn usable_size(ptr: usize) -> usize {
    let pool = pool();

    match dir().lookup(ptr) {
        Some(r) if pool.get(r).inuse => {
            let size = pool.get(r).chunksize();
            #[cfg(feature = "hardening")]
            let size = size - crate::chunk::GUARD_SIZE.min(size);
            size
        }
        _ => 0,
    }
}

/// `malloc_trim`: consolidates and trims every arena.  Returns true
/// if any memory went back to the system.
pub(crate) fn trim(pad: usize) -> bool {
    let mut released = false;

    for_each_arena(|arena| {
        let mut state = arena.lock();
        if state.bins.is_none() {
            return;
        }
        if !state.cache.replenish(pool()) {
            return;
        }

        consolidate(arena, &mut state);
        released |= if arena.is_main() {
            sys::systrim(arena, &mut state, pad)
        } else {
            sys::heap_trim(arena, &mut state, pad)
        };
    });

    released
}

/// True when the chunk behind a live pointer came straight from the
/// page mapper.
pub(crate) fn is_mmapped(ptr: usize) -> bool {
    dir()
        .lookup(ptr)
        .map_or(false, |r| pool().get(r).is_mmapped())
}
