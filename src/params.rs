//! Process-wide tunables, the knobs `mallopt` turns.
//!
//! Everything here is an atomic read by the hot paths and written
//! from `mallopt`; none of it is protected by any arena lock.
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use crate::chunk;

/// `mallopt` keys, with the C interface's key numbers.
pub const M_MXFAST: i32 = 1;
pub const M_TRIM_THRESHOLD: i32 = -1;
pub const M_TOP_PAD: i32 = -2;
pub const M_MMAP_THRESHOLD: i32 = -3;
pub const M_MMAP_MAX: i32 = -4;
pub const M_CHECK_ACTION: i32 = -5;
pub const M_PERTURB: i32 = -6;
pub const M_ARENA_TEST: i32 = -7;
pub const M_ARENA_MAX: i32 = -8;

/// `M_CHECK_ACTION` bits.
pub const CHECK_PRINT: u8 = 1;
pub const CHECK_ABORT: u8 = 2;
/// Print straight to stderr instead of the logging facade.
pub const CHECK_STDERR: u8 = 4;

pub const DEFAULT_TRIM_THRESHOLD: usize = 128 * 1024;
pub const DEFAULT_TOP_PAD: usize = 0;
pub const DEFAULT_MMAP_THRESHOLD: usize = 128 * 1024;
/// Dynamic threshold adaptation never raises past this.
pub const DEFAULT_MMAP_THRESHOLD_MAX: usize = 32 * 1024 * 1024;
pub const DEFAULT_MMAP_MAX: usize = 65536;
/// Largest fastbin-eligible *request* size `M_MXFAST` accepts.
pub const MAX_FAST_REQUEST: usize = 80;
pub const DEFAULT_CHECK_ACTION: u8 = CHECK_PRINT | CHECK_ABORT;

/// Fallback unit when the break refuses to move and the main arena
/// degrades to mapped growth.
pub const MMAP_AS_MORECORE_SIZE: usize = 1024 * 1024;

/// Freeing this much contiguous space triggers fastbin consolidation
/// and a trim check.
pub const FASTBIN_CONSOLIDATION_THRESHOLD: usize = 65536;

pub struct Params {
    trim_threshold: AtomicUsize,
    trim_disabled: AtomicBool,
    top_pad: AtomicUsize,
    mmap_threshold: AtomicUsize,
    /// Cleared the first time the user pins `M_MMAP_THRESHOLD`.
    mmap_threshold_dynamic: AtomicBool,
    mmap_max: AtomicUsize,
    perturb_byte: AtomicUsize,
    check_action: AtomicUsize,
    arena_test: AtomicUsize,
    arena_max: AtomicUsize,
    /// Default fastbin ceiling (a chunk size) for newly created
    /// arenas.
    max_fast_chunk: AtomicUsize,

    /// Running mmap accounting, for mallinfo/malloc_stats.
    pub n_mmaps: AtomicUsize,
    pub n_mmaps_max_seen: AtomicUsize,
    pub mmapped_bytes: AtomicUsize,
    pub n_unmaps: AtomicUsize,
}

pub static PARAMS: Params = Params {
    trim_threshold: AtomicUsize::new(DEFAULT_TRIM_THRESHOLD),
    trim_disabled: AtomicBool::new(false),
    top_pad: AtomicUsize::new(DEFAULT_TOP_PAD),
    mmap_threshold: AtomicUsize::new(DEFAULT_MMAP_THRESHOLD),
    mmap_threshold_dynamic: AtomicBool::new(true),
    mmap_max: AtomicUsize::new(DEFAULT_MMAP_MAX),
    perturb_byte: AtomicUsize::new(0),
    check_action: AtomicUsize::new(DEFAULT_CHECK_ACTION as usize),
    arena_test: AtomicUsize::new(8),
    arena_max: AtomicUsize::new(0),
    max_fast_chunk: AtomicUsize::new(0),

    n_mmaps: AtomicUsize::new(0),
    n_mmaps_max_seen: AtomicUsize::new(0),
    mmapped_bytes: AtomicUsize::new(0),
    n_unmaps: AtomicUsize::new(0),
};

impl Params {
    pub fn trim_threshold(&self) -> Option<usize> {
        if self.trim_disabled.load(Ordering::Relaxed) {
            None
        } else {
            Some(self.trim_threshold.load(Ordering::Relaxed))
        }
    }

    pub fn set_trim_threshold(&self, value: isize) {
        if value < 0 {
            self.trim_disabled.store(true, Ordering::Relaxed);
        } else {
            self.trim_disabled.store(false, Ordering::Relaxed);
            self.trim_threshold.store(value as usize, Ordering::Relaxed);
        }
    }

    pub fn top_pad(&self) -> usize {
        self.top_pad.load(Ordering::Relaxed)
    }

    pub fn set_top_pad(&self, value: usize) {
        self.top_pad.store(value, Ordering::Relaxed);
    }

    pub fn mmap_threshold(&self) -> usize {
        self.mmap_threshold.load(Ordering::Relaxed)
    }

    pub fn set_mmap_threshold(&self, value: usize) {
        self.mmap_threshold.store(value, Ordering::Relaxed);
        self.mmap_threshold_dynamic.store(false, Ordering::Relaxed);
    }

    /// Called when an mmapped chunk of `size` bytes is freed: biases
    /// future allocations of that size toward the break, unless the
    /// user pinned the threshold.
    pub fn adapt_mmap_threshold(&self, size: usize) {
        if !self.mmap_threshold_dynamic.load(Ordering::Relaxed) {
            return;
        }

        if size > self.mmap_threshold() && size <= DEFAULT_MMAP_THRESHOLD_MAX {
            self.mmap_threshold.store(size, Ordering::Relaxed);
            if !self.trim_disabled.load(Ordering::Relaxed) {
                self.trim_threshold.store(2 * size, Ordering::Relaxed);
            }
        }
    }

    pub fn mmap_max(&self) -> usize {
        self.mmap_max.load(Ordering::Relaxed)
    }

    pub fn set_mmap_max(&self, value: usize) {
        self.mmap_max.store(value, Ordering::Relaxed);
    }

    pub fn perturb_byte(&self) -> u8 {
        self.perturb_byte.load(Ordering::Relaxed) as u8
    }

    pub fn set_perturb_byte(&self, value: u8) {
        self.perturb_byte.store(value as usize, Ordering::Relaxed);
    }

    pub fn check_action(&self) -> u8 {
        self.check_action.load(Ordering::Relaxed) as u8
    }

    pub fn set_check_action(&self, value: u8) {
        self.check_action.store(value as usize, Ordering::Relaxed);
    }

    pub fn arena_test(&self) -> usize {
        self.arena_test.load(Ordering::Relaxed)
    }

    pub fn set_arena_test(&self, value: usize) {
        self.arena_test.store(value, Ordering::Relaxed);
    }

    /// 0 means "unset": the cap falls back to 8 x ncpus.
    pub fn arena_max(&self) -> usize {
        self.arena_max.load(Ordering::Relaxed)
    }

    pub fn set_arena_max(&self, value: usize) {
        self.arena_max.store(value, Ordering::Relaxed);
    }

    /// The fastbin ceiling as a chunk size; 0 disables fastbins.
    pub fn default_max_fast(&self) -> usize {
        let raw = self.max_fast_chunk.load(Ordering::Relaxed);

        if raw == 0 {
            // First read before any mallopt: derive from the default
            // request ceiling.  A stored value of usize::MAX encodes
            // "explicitly disabled".
            chunk::request2size(MAX_FAST_REQUEST).expect("default must be representable")
        } else if raw == usize::MAX {
            0
        } else {
            raw
        }
    }

    /// `M_MXFAST`: `request` is a request size, 0..=80; 0 disables.
    pub fn set_max_fast_request(&self, request: usize) -> bool {
        if request > MAX_FAST_REQUEST {
            return false;
        }

        let stored = if request == 0 {
            usize::MAX
        } else {
            chunk::request2size(request).expect("bounded request must be representable")
        };
        self.max_fast_chunk.store(stored, Ordering::Relaxed);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The tunables are process globals; keep every assertion in one
    // test so parallel test threads don't fight over them.
    #[test]
    fn knobs_round_trip() {
        assert_eq!(PARAMS.trim_threshold(), Some(DEFAULT_TRIM_THRESHOLD));
        PARAMS.set_trim_threshold(-1);
        assert_eq!(PARAMS.trim_threshold(), None);
        PARAMS.set_trim_threshold(65536);
        assert_eq!(PARAMS.trim_threshold(), Some(65536));
        PARAMS.set_trim_threshold(DEFAULT_TRIM_THRESHOLD as isize);

        assert_eq!(PARAMS.default_max_fast(), 96);
        assert!(PARAMS.set_max_fast_request(0));
        assert_eq!(PARAMS.default_max_fast(), 0);
        assert!(PARAMS.set_max_fast_request(80));
        assert_eq!(PARAMS.default_max_fast(), 96);
        assert!(!PARAMS.set_max_fast_request(81));

        // Dynamic adaptation moves the threshold up on free, and is
        // latched off by an explicit set.
        assert_eq!(PARAMS.mmap_threshold(), DEFAULT_MMAP_THRESHOLD);
        PARAMS.adapt_mmap_threshold(256 * 1024);
        assert_eq!(PARAMS.mmap_threshold(), 256 * 1024);
        assert_eq!(PARAMS.trim_threshold(), Some(512 * 1024));
        PARAMS.adapt_mmap_threshold(2 * DEFAULT_MMAP_THRESHOLD_MAX);
        assert_eq!(PARAMS.mmap_threshold(), 256 * 1024);

        PARAMS.set_mmap_threshold(DEFAULT_MMAP_THRESHOLD);
        PARAMS.adapt_mmap_threshold(1024 * 1024);
        assert_eq!(PARAMS.mmap_threshold(), DEFAULT_MMAP_THRESHOLD);

        PARAMS.set_trim_threshold(DEFAULT_TRIM_THRESHOLD as isize);
    }
}
