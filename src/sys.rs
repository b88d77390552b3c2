//! System growth: the top chunk, break extension, heap segments for
//! non-main arenas, fencepost insertion at discontinuities, trimming,
//! and the large-request mmap bypass.
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::atomic::Ordering;

use crate::arena::Arena;
use crate::arena::ArenaState;
use crate::arena::HeapSegment;
use crate::chunk;
use crate::chunk::DescRef;
use crate::chunk::ALIGNMENT;
use crate::chunk::IS_MMAPPED;
use crate::chunk::MIN_CHUNK_SIZE;
use crate::chunk::NON_MAIN_ARENA;
use crate::chunk::PREV_INUSE;
use crate::directory::get_default_directory;
use crate::mapper;
use crate::mapper::get_default_mapper;
use crate::params::PARAMS;
use crate::params::MMAP_AS_MORECORE_SIZE;
use crate::pool::get_default_descriptor_pool;
use crate::Error;

/// Address-space reservation per non-main heap segment; segment
/// bases are aligned to this.
pub const HEAP_MAX_SIZE: usize = 64 << 20;
/// First commit of a fresh heap segment, at least.
const HEAP_MIN_COMMIT: usize = 128 * 1024;

/// Size-word flag for chunks owned by `arena`.
pub(crate) fn size_flags(arena: &Arena) -> usize {
    if arena.is_main() {
        0
    } else {
        NON_MAIN_ARENA
    }
}

/// Replaces the arena's top chunk and publishes its address for the
/// lock-free reads in `free`.
pub(crate) fn set_top(arena: &Arena, state: &mut ArenaState, top: Option<DescRef>) {
    let key = top.map_or(0, |r| get_default_descriptor_pool().get(r).user_ptr);

    state.top = top;
    arena.publish_top_key(key);
}

#[inline]
fn align_up(value: usize, alignment: usize) -> usize {
    (value + alignment - 1) & !(alignment - 1)
}

/// Ensures `state.top` exists and can cover `nb + MIN_CHUNK_SIZE`.
///
/// On failure nothing in the arena has changed.
pub(crate) fn sysmalloc(arena: &Arena, state: &mut ArenaState, nb: usize) -> Result<(), Error> {
    // The extra ALIGNMENT covers whatever a misaligned break start
    // shaves off the front of a fresh run.
    let needed = align_up(
        nb + MIN_CHUNK_SIZE + ALIGNMENT + PARAMS.top_pad(),
        crate::map::page_size(),
    );

    if arena.is_main() {
        sysmalloc_main(arena, state, needed)
    } else {
        sysmalloc_segment(arena, state, needed)
    }?;

    let after = state
        .top
        .map_or(0, |t| get_default_descriptor_pool().get(t).chunksize());
    debug_assert!(after >= nb + MIN_CHUNK_SIZE);
    Ok(())
}

fn sysmalloc_main(arena: &Arena, state: &mut ArenaState, needed: usize) -> Result<(), Error> {
    let mapper = get_default_mapper();
    let pool = get_default_descriptor_pool();

    if state.contiguous {
        let top_end = state.top.map(|t| pool.get(t).end());
        let probe = match mapper.extend_break(0) {
            Ok(p) => p.as_ptr() as usize,
            Err(_) => 0,
        };

        match top_end {
            None => {
                // First growth ever: claim a fresh run off the break.
                if let Ok(prev) = mapper.extend_break(needed as isize) {
                    let raw = prev.as_ptr() as usize;
                    let base = align_up(raw, ALIGNMENT);
                    let size = (needed - (base - raw)) & !chunk::ALIGN_MASK;

                    return match install_top(arena, state, base, size) {
                        Ok(()) => {
                            state.brk_base = base;
                            account_growth(state, size);
                            Ok(())
                        }
                        Err(e) => {
                            let _ = mapper.extend_break(-(needed as isize));
                            Err(e)
                        }
                    };
                }
            }
            Some(end) if probe == end => {
                // Still contiguous: extend the top chunk in place.
                if mapper.extend_break(needed as isize).is_ok() {
                    let top = state.top.expect("top_end was Some");
                    let new_size = pool.get(top).chunksize() + needed;
                    pool.get_mut(top).set_chunksize(new_size);
                    account_growth(state, needed);
                    return Ok(());
                }
            }
            Some(_) => {
                // Someone else moved the break under us.  Fence off
                // the old top and restart at the current position.
                if let Ok(prev) = mapper.extend_break(needed as isize) {
                    let raw = prev.as_ptr() as usize;
                    let base = align_up(raw, ALIGNMENT);
                    let size = (needed - (base - raw)) & !chunk::ALIGN_MASK;

                    return match replace_top(arena, state, base, size) {
                        Ok(()) => {
                            account_growth(state, size);
                            Ok(())
                        }
                        Err(e) => {
                            let _ = mapper.extend_break(-(needed as isize));
                            Err(e)
                        }
                    };
                }
            }
        }
    }

    // The break is unusable: fall back to mapped growth, forever.
    let size = needed.max(MMAP_AS_MORECORE_SIZE);
    let base = mapper::map_anon(mapper, size).map_err(|_| Error::OutOfMemory)?;
    let base_addr = base.as_ptr() as usize;

    let adjacent = state.top.map_or(false, |t| pool.get(t).end() == base_addr);
    if adjacent {
        let top = state.top.expect("adjacency implies a top");
        let new_size = pool.get(top).chunksize() + size;
        pool.get_mut(top).set_chunksize(new_size);
        state.contiguous = false;
        account_growth(state, size);
        return Ok(());
    }

    match replace_top(arena, state, base_addr, size) {
        Ok(()) => {
            state.contiguous = false;
            account_growth(state, size);
            Ok(())
        }
        Err(e) => {
            let _ = mapper::unmap(mapper, base, size);
            Err(e)
        }
    }
}

fn sysmalloc_segment(arena: &Arena, state: &mut ArenaState, needed: usize) -> Result<(), Error> {
    let mapper = get_default_mapper();
    let pool = get_default_descriptor_pool();

    // Raise the committed frontier of the current segment if it has
    // room left.
    if let Some(seg) = state.segments.last().copied() {
        let frontier_ok = state
            .top
            .map_or(false, |t| pool.get(t).end() == seg.base + seg.committed);
        let room = seg.reserved - seg.committed;

        if frontier_ok && room >= needed {
            let frontier = NonNull::new((seg.base + seg.committed) as *mut c_void)
                .expect("segment frontiers are never at 0");
            if mapper.commit(frontier, needed).is_ok() {
                let top = state.top.expect("frontier_ok implies a top");
                let new_size = pool.get(top).chunksize() + needed;
                pool.get_mut(top).set_chunksize(new_size);

                let seg = state.segments.last_mut().expect("just read it");
                seg.committed += needed;
                account_growth(state, needed);
                return Ok(());
            }
        }
    }

    // Map a fresh aligned segment and make it the new top.
    if needed > HEAP_MAX_SIZE {
        return Err(Error::OutOfMemory);
    }

    let base = mapper::map_aligned(mapper, HEAP_MAX_SIZE, HEAP_MAX_SIZE)
        .map_err(|_| Error::OutOfMemory)?;
    let commit0 = needed.max(HEAP_MIN_COMMIT).min(HEAP_MAX_SIZE);
    if mapper.commit(base, commit0).is_err() {
        let _ = mapper::unmap(mapper, base, HEAP_MAX_SIZE);
        return Err(Error::OutOfMemory);
    }

    let base_addr = base.as_ptr() as usize;
    match replace_top(arena, state, base_addr, commit0) {
        Ok(()) => {
            state.segments.push(HeapSegment {
                base: base_addr,
                committed: commit0,
                reserved: HEAP_MAX_SIZE,
            });
            account_growth(state, commit0);
            Ok(())
        }
        Err(e) => {
            let _ = mapper::unmap(mapper, base, HEAP_MAX_SIZE);
            Err(e)
        }
    }
}

fn account_growth(state: &mut ArenaState, bytes: usize) {
    state.system_bytes += bytes;
    state.max_system_bytes = state.max_system_bytes.max(state.system_bytes);
}

/// Fences off the old top (if any) and installs a new one at `base`.
/// All directory inserts happen before any engine state changes, so
/// a metadata failure leaves the arena untouched.
fn replace_top(
    arena: &Arena,
    state: &mut ArenaState,
    base: usize,
    size: usize,
) -> Result<(), Error> {
    carve_fenceposts(arena, state)?;
    install_top(arena, state, base, size)
}

fn install_top(arena: &Arena, state: &mut ArenaState, base: usize, size: usize) -> Result<(), Error> {
    debug_assert!(chunk::aligned_ok(base) && size & chunk::ALIGN_MASK == 0);
    debug_assert!(state.top.is_none());

    let pool = get_default_descriptor_pool();
    let dir = get_default_directory();

    let top = state.cache.take();
    if dir.insert(base, top).is_err() {
        state.cache.put_back(top);
        return Err(Error::OutOfMemory);
    }

    let d = pool.get_mut(top);
    d.user_ptr = base;
    d.set_head(size, PREV_INUSE | size_flags(arena));
    d.arena_tag = arena.tag();
    d.inuse = false;
    d.md_prev = None;
    d.md_next = None;

    set_top(arena, state, Some(top));
    Ok(())
}

/// Converts the current top into a free remainder plus a double
/// fencepost of always-allocated chunks, so forward coalescing can
/// never walk off the end of a dead run.  Leaves `state.top` empty.
fn carve_fenceposts(arena: &Arena, state: &mut ArenaState) -> Result<(), Error> {
    let old_top = match state.top {
        Some(t) => t,
        None => return Ok(()),
    };

    let pool = get_default_descriptor_pool();
    let dir = get_default_directory();

    let base = pool.get(old_top).user_ptr;
    let old_size = pool.get(old_top).chunksize();
    debug_assert!(old_size >= MIN_CHUNK_SIZE);

    // The first piece reuses the old top's descriptor and key; later
    // pieces need fresh registrations.
    let (sizes, first_is_free): (Vec<usize>, bool) = if old_size >= 3 * MIN_CHUNK_SIZE {
        (
            vec![old_size - 2 * MIN_CHUNK_SIZE, MIN_CHUNK_SIZE, MIN_CHUNK_SIZE],
            true,
        )
    } else if old_size >= 2 * MIN_CHUNK_SIZE {
        (vec![MIN_CHUNK_SIZE, old_size - MIN_CHUNK_SIZE], false)
    } else {
        (vec![old_size], false)
    };

    let mut pieces = vec![old_top];
    let mut inserted_keys = Vec::new();
    let mut offset = sizes[0];
    for piece_size in &sizes[1..] {
        let r = state.cache.take();
        if dir.insert(base + offset, r).is_err() {
            // Roll everything back; nothing has been mutated yet.
            state.cache.put_back(r);
            for key in inserted_keys {
                dir.delete(key);
            }
            for r in pieces.drain(1..) {
                state.cache.put_back(r);
            }
            return Err(Error::OutOfMemory);
        }

        inserted_keys.push(base + offset);
        pieces.push(r);
        offset += piece_size;
    }

    // All registrations held; now mutate.
    let flags = size_flags(arena);
    let next_of = |i: usize| pieces.get(i + 1).copied();
    let mut offset = 0;
    for (i, (piece, piece_size)) in pieces.iter().zip(sizes.iter()).enumerate() {
        let prev_free = i == 1 && first_is_free;
        let md_next = next_of(i);
        let d = pool.get_mut(*piece);

        d.arena_tag = arena.tag();
        d.inuse = !(i == 0 && first_is_free);
        // Piece 0 reuses the old top's descriptor: its address and
        // physical predecessor stay as they were.
        if i > 0 {
            d.user_ptr = base + offset;
            d.md_prev = Some(pieces[i - 1]);
        }
        d.md_next = md_next;

        let prev_inuse = if prev_free { 0 } else { PREV_INUSE };
        d.set_head(*piece_size, prev_inuse | flags);
        if prev_free {
            d.prev_size = sizes[0];
        }

        offset += piece_size;
    }

    if first_is_free {
        let bins = state.bins.as_mut().expect("arenas are initialised before growth");
        bins.insert_unsorted(pool, old_top);
    }

    set_top(arena, state, None);
    Ok(())
}

/// Gives back the unused tail of the main arena's top chunk by
/// lowering the break.  Returns whether anything was released.
pub(crate) fn systrim(arena: &Arena, state: &mut ArenaState, pad: usize) -> bool {
    if !arena.is_main() || !state.contiguous {
        return false;
    }

    let pool = get_default_descriptor_pool();
    let mapper = get_default_mapper();

    let top = match state.top {
        Some(t) => t,
        None => return false,
    };
    let top_size = pool.get(top).chunksize();

    let page = crate::map::page_size();
    let keep = pad + MIN_CHUNK_SIZE + 1;
    if top_size <= keep {
        return false;
    }
    let extra = (top_size - keep) & !(page - 1);
    if extra == 0 {
        return false;
    }

    // A foreign sbrk since our last growth means the tail of the
    // break is not ours to give back.
    match mapper.extend_break(0) {
        Ok(probe) if probe.as_ptr() as usize == pool.get(top).end() => {}
        _ => return false,
    }

    if mapper.extend_break(-(extra as isize)).is_err() {
        return false;
    }

    let new_size = top_size - extra;
    pool.get_mut(top).set_chunksize(new_size);
    state.system_bytes -= extra;
    true
}

/// The non-main counterpart of `systrim`: decommits the unused tail
/// of the newest heap segment.
pub(crate) fn heap_trim(arena: &Arena, state: &mut ArenaState, pad: usize) -> bool {
    debug_assert!(!arena.is_main());

    let pool = get_default_descriptor_pool();
    let mapper = get_default_mapper();

    let (top, seg) = match (state.top, state.segments.last().copied()) {
        (Some(t), Some(s)) => (t, s),
        _ => return false,
    };
    if pool.get(top).end() != seg.base + seg.committed {
        return false;
    }

    let top_size = pool.get(top).chunksize();
    let page = crate::map::page_size();
    let keep = pad + MIN_CHUNK_SIZE + 1;
    if top_size <= keep {
        return false;
    }
    let extra = (top_size - keep) & !(page - 1);
    if extra == 0 {
        return false;
    }

    let tail = NonNull::new((seg.base + seg.committed - extra) as *mut c_void)
        .expect("segment interiors are never at 0");
    if mapper.uncommit(tail, extra).is_err() {
        return false;
    }

    pool.get_mut(top).set_chunksize(top_size - extra);
    state.segments.last_mut().expect("just read it").committed -= extra;
    state.system_bytes -= extra;
    true
}

/// Registers a freshly mapped region as an mmapped chunk: tag 0,
/// never on any bin, directly in the directory.  Unmaps on metadata
/// failure.
fn register_mmapped(base: NonNull<c_void>, size: usize) -> Result<usize, Error> {
    let mapper = get_default_mapper();
    let pool = get_default_descriptor_pool();
    let dir = get_default_directory();

    let base_addr = base.as_ptr() as usize;
    debug_assert!(chunk::aligned_ok(base_addr));

    let r = match pool.allocate() {
        Some(r) => r,
        None => {
            let _ = mapper::unmap(mapper, base, size);
            return Err(Error::OutOfMemory);
        }
    };
    if dir.insert(base_addr, r).is_err() {
        pool.release(r);
        let _ = mapper::unmap(mapper, base, size);
        return Err(Error::OutOfMemory);
    }

    let d = pool.get_mut(r);
    d.user_ptr = base_addr;
    d.set_head(size, IS_MMAPPED | PREV_INUSE);
    d.prev_size = 0;
    d.arena_tag = 0;
    d.inuse = true;

    let count = PARAMS.n_mmaps.fetch_add(1, Ordering::Relaxed) + 1;
    PARAMS.n_mmaps_max_seen.fetch_max(count, Ordering::Relaxed);
    PARAMS.mmapped_bytes.fetch_add(size, Ordering::Relaxed);

    Ok(base_addr)
}

/// Large-request bypass: the chunk comes straight from the page
/// mapper and never touches any bin.
pub(crate) fn mmap_alloc(nb: usize) -> Result<usize, Error> {
    if PARAMS.n_mmaps.load(Ordering::Relaxed) >= PARAMS.mmap_max() {
        return Err(Error::OutOfMemory);
    }

    let mapper = get_default_mapper();
    let size = mapper::round_to_pages(mapper, nb);
    let base = mapper::map_anon(mapper, size).map_err(|_| Error::OutOfMemory)?;

    register_mmapped(base, size)
}

/// `mmap_alloc` with an alignment stronger than a page: reserves an
/// aligned range, commits it, and registers it like any other mapped
/// chunk.
pub(crate) fn mmap_alloc_aligned(nb: usize, alignment: usize) -> Result<usize, Error> {
    if PARAMS.n_mmaps.load(Ordering::Relaxed) >= PARAMS.mmap_max() {
        return Err(Error::OutOfMemory);
    }

    let mapper = get_default_mapper();
    let size = mapper::round_to_pages(mapper, nb);
    let alignment = alignment.max(crate::map::page_size());

    let base = mapper::map_aligned(mapper, size, alignment).map_err(|_| Error::OutOfMemory)?;
    if mapper.commit(base, size).is_err() {
        let _ = mapper::unmap(mapper, base, size);
        return Err(Error::OutOfMemory);
    }

    register_mmapped(base, size)
}

/// Unmaps an mmapped chunk and tombstones its directory entry.
pub(crate) fn mmap_free(r: DescRef) -> Result<(), Error> {
    let mapper = get_default_mapper();
    let pool = get_default_descriptor_pool();
    let dir = get_default_directory();

    let (base, size) = {
        let d = pool.get(r);
        (d.user_ptr, d.chunksize())
    };

    PARAMS.adapt_mmap_threshold(size);
    PARAMS.n_mmaps.fetch_sub(1, Ordering::Relaxed);
    PARAMS.n_unmaps.fetch_add(1, Ordering::Relaxed);
    PARAMS.mmapped_bytes.fetch_sub(size, Ordering::Relaxed);

    // Tombstone, not delete: a fast re-map of the same address must
    // find the key and revive it.
    dir.update(base, None);
    pool.release(r);

    if mapper::unmap(
        mapper,
        NonNull::new(base as *mut c_void).expect("mmapped chunks are never at 0"),
        size,
    )
    .is_err()
    {
        log::warn!("failed to unmap mmapped chunk at {:x} ({} bytes)", base, size);
    }

    Ok(())
}
