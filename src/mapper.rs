//! A `Mapper` is responsible for acquiring address space and backing
//! memory from the operating system.  The heap engine, the descriptor
//! pool, and the metadata directory are all parameterised on one.
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

use std::ffi::c_void;
use std::ptr::NonNull;

/// The two ways a mapper call can fail.  Callers never retry: they
/// either fall back to another growth strategy or report allocation
/// failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// The kernel could not find room (ENOMEM and friends).
    OutOfAddressSpace,
    /// Anything else: resource limits, permissions, bad break.
    Refused,
}

impl MapError {
    pub fn from_errno(err: i32) -> Self {
        if err == libc::ENOMEM {
            MapError::OutOfAddressSpace
        } else {
            MapError::Refused
        }
    }
}

#[allow(clippy::inline_fn_without_body)]
#[contract_trait]
pub trait Mapper: std::fmt::Debug + Sync {
    /// Returns the mapping granularity for this mapper.  All calls
    /// into the mapper align addresses and sizes to that page size.
    ///
    /// The page size must be constant for the lifetime of a process.
    #[ensures(ret > 0 && ret & (ret - 1) == 0, "page size must be a power of 2")]
    fn page_size(&self) -> usize;

    /// Attempts to reserve `size` bytes of address space, without
    /// backing memory.  `size` must be a positive page multiple.
    #[requires(size > 0 && size % self.page_size() == 0)]
    #[ensures(ret.is_ok() -> ret.as_ref().unwrap().as_ptr() as usize % self.page_size() == 0,
              "Reserved ranges are page-aligned")]
    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, MapError>;

    /// Backs `[base, base + size)` with zero-filled memory.  The range
    /// is always a subset of a single earlier `reserve`.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), MapError>;

    /// Returns a page-aligned range to the system.  The range is
    /// always a subset of a single earlier `reserve`.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), MapError>;

    /// Drops the backing memory of a committed range while keeping
    /// its address space reserved; a later `commit` revives it
    /// zero-filled.
    #[requires(base.as_ptr() as usize % self.page_size() == 0)]
    #[requires(size % self.page_size() == 0)]
    fn uncommit(&self, base: NonNull<c_void>, size: usize) -> Result<(), MapError>;

    /// Moves the program break by `delta` and returns the previous
    /// position; `delta == 0` probes.  Monotonic during contiguous
    /// growth, and never partially succeeds.
    fn extend_break(&self, delta: isize) -> Result<NonNull<c_void>, MapError>;
}

#[derive(Debug)]
struct DefaultMapper {}

/// Returns the process-wide default mapper.
pub fn get_default_mapper() -> &'static dyn Mapper {
    lazy_static::lazy_static! {
        static ref DEFAULT_MAPPER: DefaultMapper = DefaultMapper {};
    }

    &*DEFAULT_MAPPER
}

#[contract_trait]
impl Mapper for DefaultMapper {
    fn page_size(&self) -> usize {
        crate::map::page_size()
    }

    fn reserve(&self, size: usize) -> Result<NonNull<c_void>, MapError> {
        crate::map::reserve_region(size).map_err(MapError::from_errno)
    }

    fn commit(&self, base: NonNull<c_void>, size: usize) -> Result<(), MapError> {
        crate::map::allocate_region(base, size).map_err(MapError::from_errno)
    }

    fn release(&self, base: NonNull<c_void>, size: usize) -> Result<(), MapError> {
        crate::map::release_region(base, size).map_err(MapError::from_errno)
    }

    fn uncommit(&self, base: NonNull<c_void>, size: usize) -> Result<(), MapError> {
        crate::map::decommit_region(base, size).map_err(MapError::from_errno)
    }

    fn extend_break(&self, delta: isize) -> Result<NonNull<c_void>, MapError> {
        crate::map::extend_break(delta).map_err(MapError::from_errno)
    }
}

/// Rounds `size` up to a page multiple.
#[inline]
pub fn round_to_pages(mapper: &dyn Mapper, size: usize) -> usize {
    let page = mapper.page_size();

    page * (size / page + usize::from(size % page > 0))
}

/// Maps `size` bytes (page-rounded) of zero-filled read-write memory.
pub fn map_anon(mapper: &dyn Mapper, size: usize) -> Result<NonNull<c_void>, MapError> {
    let rounded = round_to_pages(mapper, size.max(1));
    let base = mapper.reserve(rounded)?;

    if let Err(e) = mapper.commit(base, rounded) {
        let _ = mapper.release(base, rounded);
        return Err(e);
    }

    Ok(base)
}

/// Unmaps `size` bytes (page-rounded) at `base`.
pub fn unmap(mapper: &dyn Mapper, base: NonNull<c_void>, size: usize) -> Result<(), MapError> {
    mapper.release(base, round_to_pages(mapper, size.max(1)))
}

/// Reserves `size` bytes of address space whose base address is a
/// multiple of `alignment` (a power of two that is itself a page
/// multiple).  The reservation is *not* committed; callers raise the
/// committed frontier with `Mapper::commit` as they go.
///
/// When the kernel happens to return an aligned address for a plain
/// `size` reservation we take it as is.  Otherwise we over-reserve
/// `size + alignment` bytes, keep the first aligned `size` bytes
/// inside, and trim both tails.
pub fn map_aligned(
    mapper: &dyn Mapper,
    size: usize,
    alignment: usize,
) -> Result<NonNull<c_void>, MapError> {
    assert!(alignment.is_power_of_two() && alignment % mapper.page_size() == 0);
    assert!(size > 0 && size % mapper.page_size() == 0);

    // The lucky case: a plain reservation lands aligned.
    let first = mapper.reserve(size)?;
    if first.as_ptr() as usize % alignment == 0 {
        return Ok(first);
    }

    let _ = mapper.release(first, size);

    let padded = size.checked_add(alignment).ok_or(MapError::Refused)?;
    let base = mapper.reserve(padded)?;
    let addr = base.as_ptr() as usize;

    let aligned = match addr.checked_add(alignment - 1) {
        Some(bumped) => bumped & !(alignment - 1),
        None => {
            let _ = mapper.release(base, padded);
            return Err(MapError::Refused);
        }
    };

    // Trim the slop on both sides of the aligned interior.
    let head = aligned - addr;
    let tail = padded - size - head;
    if head > 0 {
        let _ = mapper.release(base, head);
    }
    if tail > 0 {
        let tail_base = NonNull::new((aligned + size) as *mut c_void).expect("must be non-null");
        let _ = mapper.release(tail_base, tail);
    }

    let region = NonNull::new(aligned as *mut c_void).expect("aligned base is never null");
    // An unaligned result here means the arithmetic above is wrong,
    // not that the kernel misbehaved.
    assert_eq!(region.as_ptr() as usize % alignment, 0);
    Ok(region)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_reservation() {
        let mapper = get_default_mapper();
        let alignment = 1usize << 21;

        let region = map_aligned(mapper, alignment, alignment).expect("map_aligned must succeed");
        assert_eq!(region.as_ptr() as usize % alignment, 0);

        // The reservation must be commitable and then writable.
        mapper
            .commit(region, mapper.page_size())
            .expect("commit should succeed");
        unsafe { std::ptr::write_bytes(region.as_ptr() as *mut u8, 42, mapper.page_size()) };

        unmap(mapper, region, alignment).expect("unmap should succeed");
    }

    #[test]
    fn aligned_larger_than_size() {
        let mapper = get_default_mapper();
        let alignment = 1usize << 22;
        let size = mapper.page_size() * 16;

        let region = map_aligned(mapper, size, alignment).expect("map_aligned must succeed");
        assert_eq!(region.as_ptr() as usize % alignment, 0);
        unmap(mapper, region, size).expect("unmap should succeed");
    }

    #[test]
    fn anon_round_trip() {
        let mapper = get_default_mapper();

        let region = map_anon(mapper, 100).expect("map_anon must succeed");
        // Committed and zeroed.
        assert_eq!(unsafe { std::ptr::read(region.as_ptr() as *const u8) }, 0);
        unsafe { std::ptr::write_bytes(region.as_ptr() as *mut u8, 0xFF, 100) };

        unmap(mapper, region, 100).expect("unmap should succeed");
    }
}
