//! sidemalloc: a drop-in heap whose chunk metadata lives out-of-line.
//!
//! The classic C allocators keep each chunk's size and free-list
//! links in the bytes just before the pointer they hand out, where
//! any overflowing write can reach them.  Here that bookkeeping lives
//! in a side table instead: a pool of chunk descriptors indexed by a
//! Larson-style linear hash on the user pointer.  A heap overflow
//! lands on more user data, never on allocator control structure.
//!
//! The heap engine itself is a segregated-bin design: per-size
//! fastbins, 128 small/large regular bins with a binmap index, an
//! unsorted staging bin, and a top chunk grown via the program break
//! or anonymous mappings, with multiple arenas for threaded callers.
mod api;
mod arena;
mod audit;
mod bins;
mod chunk;
mod directory;
mod heap;
mod map;
mod mapper;
mod params;
mod pool;
mod sys;
mod trace;

pub use api::calloc;
pub use api::free;
pub use api::mallinfo;
pub use api::malloc;
pub use api::malloc_stats;
pub use api::malloc_trim;
pub use api::malloc_usable_size;
pub use api::mallopt;
pub use api::memalign;
pub use api::posix_memalign;
pub use api::pvalloc;
pub use api::realloc;
pub use api::set_hooks;
pub use api::valloc;
pub use api::MallInfo;
pub use api::MallocHooks;
pub use arena::pin_to_new_arena;
pub use mapper::MapError;
pub use mapper::Mapper;

/// Why an allocator operation could not complete.
///
/// Every failure leaves the allocator in a consistent state; the
/// public API additionally maps these onto null returns and errno
/// values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    /// The page mapper refused, or a metadata pool cannot grow.
    OutOfMemory,
    /// Request size overflow or a bad alignment.
    InvalidArgument,
    /// A lookup miss, double free, or clobbered link.  The owning
    /// arena has been quarantined.
    Corruption,
    /// The allocator was re-entered from a signal handler that
    /// interrupted it on this same thread.
    WouldDeadlock,
}
