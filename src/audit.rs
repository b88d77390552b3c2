//! The consistency audit: walks every descriptor the directory knows
//! about for one arena, under that arena's lock, and checks the
//! neighbour, bin, and conservation invariants.
//!
//! This is test and diagnostic machinery, not a hot path; it is the
//! out-of-line equivalent of the classic `do_check_chunk` family.
use std::collections::HashMap;
use std::collections::HashSet;

use crate::arena::Arena;
use crate::bins;
use crate::bins::NFASTBINS;
use crate::bins::UNSORTED;
use crate::chunk::DescRef;
use crate::chunk::MIN_CHUNK_SIZE;
use crate::heap;

/// Runs every invariant check against `arena`.  Returns the list of
/// violations, empty when the arena is sound.
pub(crate) fn audit_arena(arena: &Arena) -> Vec<String> {
    let pool = heap::pool();
    let mut errors = Vec::new();

    let state = arena.lock();
    let bins_state = match state.bins.as_ref() {
        Some(b) => b,
        // Never touched: trivially consistent.
        None => return errors,
    };

    // Collect this arena's descriptors from the directory.
    let mut chunks: HashMap<usize, DescRef> = HashMap::new();
    heap::dir().for_each(|key, value| {
        if let Some(r) = value {
            if pool.get(r).arena_tag == arena.tag() {
                if chunks.insert(key, r).is_some() {
                    errors.push(format!("key {:#x} registered twice", key));
                }
            }
        }
    });

    // Fastbin membership, gathered first: these chunks look
    // allocated to their neighbours.
    let mut on_fastbin: HashSet<DescRef> = HashSet::new();
    for index in 0..NFASTBINS {
        let mut cursor = arena.fastbins.top(index);
        while let Some(r) = cursor {
            if !on_fastbin.insert(r) {
                errors.push(format!("fastbin cycle through {:#x}", pool.get(r).user_ptr));
                break;
            }
            let size = pool.get(r).chunksize();
            if size < MIN_CHUNK_SIZE || bins::fastbin_index(size) != index {
                errors.push(format!(
                    "fastbin {} holds chunk of size {}",
                    index, size
                ));
            }
            cursor = pool.get(r).fast_next;
        }
    }

    for (key, r) in &chunks {
        let d = pool.get(*r);

        if d.user_ptr != *key {
            errors.push(format!(
                "descriptor at key {:#x} names user_ptr {:#x}",
                key, d.user_ptr
            ));
            continue;
        }
        if !crate::chunk::aligned_ok(d.user_ptr) {
            errors.push(format!("misaligned user_ptr {:#x}", d.user_ptr));
        }

        // Physical back-link identity.
        if let Some(n) = d.md_next {
            if pool.get(n).md_prev != Some(*r) {
                errors.push(format!(
                    "md_next back-link broken at {:#x}",
                    d.user_ptr
                ));
            }
            if pool.get(n).user_ptr != d.end() {
                errors.push(format!(
                    "physical neighbour of {:#x} is not adjacent",
                    d.user_ptr
                ));
            }
        }

        // PREV_INUSE coherence and prev_size correctness.
        if let Some(p) = d.md_prev {
            let p_free_binned = !pool.get(p).inuse && !on_fastbin.contains(&p);
            if d.prev_inuse() == p_free_binned && state.top != Some(p) {
                errors.push(format!(
                    "PREV_INUSE of {:#x} disagrees with its neighbour",
                    d.user_ptr
                ));
            }
            if !d.prev_inuse() && d.prev_size != pool.get(p).chunksize() {
                errors.push(format!(
                    "prev_size of {:#x} is {} but the neighbour has {}",
                    d.user_ptr,
                    d.prev_size,
                    pool.get(p).chunksize()
                ));
            }
        }

        // No adjacent free pairs among coalescable chunks.
        let d_free_binned = !d.inuse && !on_fastbin.contains(r) && state.top != Some(*r);
        if d_free_binned {
            if let Some(p) = d.md_prev {
                if !pool.get(p).inuse && !on_fastbin.contains(&p) && state.top != Some(p) {
                    errors.push(format!(
                        "adjacent free chunks at {:#x}",
                        d.user_ptr
                    ));
                }
            }
            if d.bin_fd.is_none() || d.bin_bk.is_none() {
                errors.push(format!(
                    "free chunk {:#x} is not on any bin",
                    d.user_ptr
                ));
            }
        }
    }

    // Top: unique, never binned, PREV_INUSE set.
    if let Some(top) = state.top {
        let d = pool.get(top);
        if !d.prev_inuse() {
            errors.push("top chunk has PREV_INUSE clear".to_string());
        }
        if d.bin_fd.is_some() || d.inuse {
            errors.push("top chunk is binned or marked in use".to_string());
        }
        if !chunks.contains_key(&d.user_ptr) {
            errors.push("top chunk is not registered".to_string());
        }
    }

    // Every binned chunk is registered, free, and counted once.
    let mut binned: HashSet<DescRef> = HashSet::new();
    for index in std::iter::once(UNSORTED).chain(2..bins::NBINS) {
        let head = bins_state.head(index);
        let mut cursor = pool.get(head).bin_fd.expect("bins are circular");
        while cursor != head {
            if !binned.insert(cursor) {
                errors.push(format!("chunk {:#x} on two bins", pool.get(cursor).user_ptr));
                break;
            }
            let d = pool.get(cursor);
            if d.inuse {
                errors.push(format!("bin {} holds in-use chunk {:#x}", index, d.user_ptr));
            }
            if !chunks.contains_key(&d.user_ptr) {
                errors.push(format!("binned chunk {:#x} is unregistered", d.user_ptr));
            }
            if index >= 2 && bins::bin_index(d.chunksize()) != index {
                errors.push(format!(
                    "chunk of size {} filed in bin {}",
                    d.chunksize(),
                    index
                ));
            }
            cursor = d.bin_fd.expect("bins are circular");
        }

        if index >= bins::smallbin_index(bins::MIN_LARGE_SIZE) {
            if let Err(what) = bins_state.check_large_bin(pool, index) {
                errors.push(format!("large bin {}: {}", index, what));
            }
        }
    }

    // Conservation: every byte the system gave this arena is in
    // exactly one chunk.
    let total: usize = chunks.values().map(|r| pool.get(*r).chunksize()).sum();
    if total != state.system_bytes {
        errors.push(format!(
            "chunks sum to {} bytes but the system supplied {}",
            total, state.system_bytes
        ));
    }

    errors
}

/// Panics with a readable report if `arena` violates any invariant.
pub(crate) fn assert_arena_sound(arena: &Arena) {
    let errors = audit_arena(arena);

    assert!(
        errors.is_empty(),
        "arena {} failed its audit:\n  {}",
        arena.tag(),
        errors.join("\n  ")
    );
}
