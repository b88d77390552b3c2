//! Thin wrappers around the system calls that hand us address space:
//! anonymous `mmap`, `mprotect`, `munmap`, and the program break.
//!
//! Reservation and backing are split: `reserve_region` only claims
//! address space (`PROT_NONE`), and `allocate_region` later makes a
//! subset of it readable and writable.  Fresh anonymous pages are
//! always zero-filled.
use std::ffi::c_void;
use std::ptr::NonNull;

fn errno() -> i32 {
    // Linux-only, like the rest of the break handling.
    unsafe { *libc::__errno_location() }
}

fn page_size_or_die() -> usize {
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };

    if ret <= 0 {
        panic!("Unable to find page_size: errno={}", errno());
    }

    ret as usize
}

lazy_static::lazy_static! {
    static ref PAGE_SIZE: usize = page_size_or_die();
}

/// Returns the system page size.
#[inline]
pub fn page_size() -> usize {
    *PAGE_SIZE
}

/// Attempts to reserve an *address space* region of `size` bytes.
///
/// The `size` argument must be a multiple of the page size.
pub fn reserve_region(size: usize) -> Result<NonNull<c_void>, i32> {
    assert!(
        size > 0 && (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    let base = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        )
    };

    if base == libc::MAP_FAILED {
        Err(errno())
    } else {
        Ok(NonNull::new(base).expect("mmap never returns NULL on success"))
    }
}

/// Releases a region of `size` bytes starting at `base`.
///
/// The size argument must be a multiple of the page size.
pub fn release_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    if unsafe { libc::munmap(base.as_ptr(), size) } == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Backs a region of `size` bytes starting at `base` with
/// (demand-faulted, zero-filled) memory.
///
/// The size argument must be a multiple of the page size.
pub fn allocate_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    if unsafe { libc::mprotect(base.as_ptr(), size, libc::PROT_READ | libc::PROT_WRITE) } == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Returns a committed region to demand-zero state and drops its
/// backing memory, keeping the address space reserved.
///
/// The size argument must be a multiple of the page size.
pub fn decommit_region(base: NonNull<c_void>, size: usize) -> Result<(), i32> {
    if size == 0 {
        return Ok(());
    }

    assert!(
        (size % page_size()) == 0,
        "Bad region size={} page_size={}",
        size,
        page_size()
    );

    if unsafe { libc::mprotect(base.as_ptr(), size, libc::PROT_NONE) } != 0 {
        return Err(errno());
    }

    // PROT_NONE alone keeps the pages resident; tell the kernel we
    // are done with their contents.
    if unsafe { libc::madvise(base.as_ptr(), size, libc::MADV_DONTNEED) } == 0 {
        Ok(())
    } else {
        Err(errno())
    }
}

/// Moves the program break by `delta` bytes and returns the *previous*
/// break position.  `extend_break(0)` probes the current position
/// without moving it, which lets callers detect foreign `sbrk` calls.
///
/// The break either moves by exactly `delta` or not at all.
pub fn extend_break(delta: isize) -> Result<NonNull<c_void>, i32> {
    let prev = unsafe { libc::sbrk(delta) };

    if prev == usize::MAX as *mut c_void {
        Err(errno())
    } else {
        Ok(NonNull::new(prev).expect("the break is never NULL"))
    }
}

#[test]
fn test_page_size() {
    assert_ne!(page_size(), 0);

    // We only develop on platforms with 4K pages.
    assert_eq!(page_size(), 4096);
}

#[test]
fn test_break_probe() {
    // Probing must not move the break; the process allocator may,
    // so all we can assert is that probes succeed and are aligned
    // realities of the address space.
    let probe = extend_break(0).expect("probing the break should succeed");
    assert!(probe.as_ptr() as usize > 0);

    let again = extend_break(0).expect("probing the break should succeed");
    assert!(again.as_ptr() as usize > 0);
}

// Simulate a reserve/commit/release workflow: overallocate, trim the
// slop, and ask for real memory in some of the remaining space.
#[test]
fn smoke_test() {
    let region_size = 1usize << 21;
    let mut base = reserve_region(3 * region_size).expect("reserve should succeed");

    assert!(region_size > 3 * page_size());

    // We overallocated `base` by 3x.  Drop the bottom and top
    // `region_size` bytes from the range.
    release_region(base, region_size).expect("should release the bottom slop");
    base = NonNull::new((base.as_ptr() as usize + region_size) as *mut c_void)
        .expect("Should be non-null");

    let top_slop = NonNull::new((base.as_ptr() as usize + region_size) as *mut c_void)
        .expect("Should be non-null");
    release_region(top_slop, region_size).expect("should release the top slop");

    // Commit the first page and the tail of what remains, then write
    // to both to make sure the backing memory is really there.
    let bottom = base;
    let remainder = NonNull::new((base.as_ptr() as usize + 2 * page_size()) as *mut c_void)
        .expect("Should be non-null");

    allocate_region(bottom, page_size()).expect("should allocate bottom");
    allocate_region(remainder, region_size - 2 * page_size()).expect("should allocate remainder");

    unsafe {
        std::ptr::write_bytes(bottom.as_ptr() as *mut u8, 42, page_size());
        // Committed anonymous pages start out zeroed.
        assert_eq!(std::ptr::read(remainder.as_ptr() as *const u8), 0);
    }

    // And now release everything.
    release_region(base, region_size).expect("should release everything");
}
