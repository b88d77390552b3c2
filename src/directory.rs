//! The metadata directory: a Larson-style linear hash table mapping a
//! chunk's user pointer to its descriptor.
//!
//! Dynamic hashing after CACM April 1988 pp 446-457, by Per-Ake
//! Larson.  The directory is an expandable array of segments; each
//! segment is a fixed array of bins; each bin heads a chain of
//! records.  The table grows and shrinks one bin at a time, so no
//! insert or delete ever pays for a full rehash.
//!
//! All memory comes from the record pool and the page mapper; the
//! table can never recurse into the heap it describes.  Mutations
//! take the write lock; `lookup` takes the read lock and is callable
//! before any arena has been chosen.
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

use std::ptr::NonNull;
use std::sync::RwLock;

use crate::chunk::DescRef;
use crate::mapper;
use crate::mapper::Mapper;
use crate::pool::Pool;
use crate::pool::Ref;
use crate::pool::ZeroSafe;

/// Bins per segment; Larson uses 256.
const SEGMENT_LENGTH: usize = 256;
/// Segment slots in the initial directory array.
const INITIAL_DIRECTORY_LENGTH: usize = 1024;
/// Segments mapped at startup.
const SEGMENTS_AT_STARTUP: usize = 1;

const MIN_LOAD: usize = 2;
const MAX_LOAD: usize = 3;

const BINCOUNT_MAX: usize = u32::MAX as usize;
const DIRECTORY_LENGTH_MAX: usize = BINCOUNT_MAX / SEGMENT_LENGTH;

/// One chain entry.  `value == None` is a tombstone: the key used to
/// name an mmapped chunk that has since been unmapped, kept so a fast
/// re-map to the same address is observed correctly.
#[derive(Debug, Default)]
#[repr(C)]
pub struct Record {
    key: usize,
    value: Option<DescRef>,
    next: Option<Ref<Record>>,
}

unsafe impl ZeroSafe for Record {}

type RecRef = Ref<Record>;

/// A segment: a fixed array of bin heads, mapped as one region.
/// Represented as a base address; slot `i` holds the raw u32 of the
/// bin's first record ref (0 = empty chain).
#[derive(Clone, Copy)]
struct Segment(usize);

impl Segment {
    fn head_ptr(self, index: usize) -> *mut u32 {
        debug_assert!(index < SEGMENT_LENGTH);
        (self.0 + index * std::mem::size_of::<u32>()) as *mut u32
    }

    fn head(self, index: usize) -> Option<RecRef> {
        RecRef::from_raw(unsafe { *self.head_ptr(index) })
    }

    fn set_head(self, index: usize, head: Option<RecRef>) {
        unsafe { *self.head_ptr(index) = head.map_or(0, |r| r.get()) };
    }

    const BYTES: usize = SEGMENT_LENGTH * std::mem::size_of::<u32>();
}

struct DirectoryInner {
    /// Array of segment base addresses (0 = not yet created).
    directory: NonNull<usize>,
    directory_length: usize,
    /// Number of live segments; always a prefix of the directory.
    directory_current: usize,

    /// Minimum number of bins (`N` in Larson's paper).
    n: usize,
    /// Number of times the table has doubled (`L`).
    l: usize,
    /// Next bin due to split (`p`, `0 <= p < maxp`).
    p: usize,
    /// Current bin-count limit (`maxp = N * 2^L`).
    maxp: usize,
    /// Current number of bins.
    bincount: usize,
    /// Total records, tombstones included.
    count: usize,
}

/// The process-wide side table.
pub struct Directory {
    mapper: &'static dyn Mapper,
    records: &'static Pool<Record>,
    inner: RwLock<DirectoryInner>,
}

unsafe impl Send for Directory {}
unsafe impl Sync for Directory {}

/// What `insert` did with the key.
#[derive(Debug, PartialEq, Eq)]
pub enum Inserted {
    /// A fresh record was chained in.
    Fresh,
    /// The key was present as a tombstone; the record was revived in
    /// place.
    Revived,
}

fn rot(x: u32, k: u32) -> u32 {
    x.rotate_left(k)
}

/// Jenkins lookup3 finaliser over the two halves of the pointer.
fn jenkins_hash_ptr(key: usize) -> u32 {
    let mut a = key as u32;
    let mut b = (key as u64 >> 32) as u32;
    let mut c: u32 = 0xdead_beef;

    c ^= b;
    c = c.wrapping_sub(rot(b, 14));
    a ^= c;
    a = a.wrapping_sub(rot(c, 11));
    b ^= a;
    b = b.wrapping_sub(rot(a, 25));
    c ^= b;
    c = c.wrapping_sub(rot(b, 16));
    a ^= c;
    a = a.wrapping_sub(rot(c, 4));
    b ^= a;
    b = b.wrapping_sub(rot(a, 14));
    c ^= b;
    c = c.wrapping_sub(rot(b, 24));

    c
}

impl DirectoryInner {
    fn load(&self) -> usize {
        self.count / self.bincount
    }

    /// The bin index that should contain `key`.
    fn bindex(&self, key: usize) -> usize {
        let jhash = jenkins_hash_ptr(key) as usize;

        let mut l = jhash & (self.maxp - 1);
        if l < self.p {
            let next_maxp = self.maxp << 1;
            if next_maxp < BINCOUNT_MAX {
                l = jhash & (next_maxp - 1);
            }
        }

        l
    }

    fn segment(&self, index: usize) -> Option<Segment> {
        debug_assert!(index < self.directory_length);
        let base = unsafe { *self.directory.as_ptr().add(index) };

        if base == 0 {
            None
        } else {
            Some(Segment(base))
        }
    }

    fn set_segment(&mut self, index: usize, seg: Option<Segment>) {
        debug_assert!(index < self.directory_length);
        unsafe { *self.directory.as_ptr().add(index) = seg.map_or(0, |s| s.0) };
    }

    /// The bin head slot for `bindex`.
    fn bin(&self, bindex: usize) -> (Segment, usize) {
        debug_assert!(bindex < self.bincount);

        let seg = self
            .segment(bindex / SEGMENT_LENGTH)
            .expect("bins below bincount live in mapped segments");
        (seg, bindex & (SEGMENT_LENGTH - 1))
    }
}

impl Directory {
    pub fn new(mapper: &'static dyn Mapper, records: &'static Pool<Record>) -> Self {
        let directory = mapper::map_anon(
            mapper,
            INITIAL_DIRECTORY_LENGTH * std::mem::size_of::<usize>(),
        )
        .expect("mapping the directory must succeed at init")
        .cast();

        let mut inner = DirectoryInner {
            directory,
            directory_length: INITIAL_DIRECTORY_LENGTH,
            directory_current: SEGMENTS_AT_STARTUP,
            n: SEGMENT_LENGTH * SEGMENTS_AT_STARTUP,
            l: 0,
            p: 0,
            maxp: SEGMENT_LENGTH * SEGMENTS_AT_STARTUP,
            bincount: SEGMENT_LENGTH * SEGMENTS_AT_STARTUP,
            count: 0,
        };

        for index in 0..SEGMENTS_AT_STARTUP {
            let seg = mapper::map_anon(mapper, Segment::BYTES)
                .expect("mapping the initial segments must succeed at init");
            inner.set_segment(index, Some(Segment(seg.as_ptr() as usize)));
        }

        Directory {
            mapper,
            records,
            inner: RwLock::new(inner),
        }
    }

    /// Registers `key -> value`.  The key must not currently be live:
    /// a live duplicate is a caller bug (the caller wants `update`).
    /// A tombstoned key is revived in place.
    ///
    /// # Errors
    ///
    /// Returns `Err` when the record pool cannot grow.
    #[requires(crate::chunk::aligned_ok(key))]
    #[ensures(ret.is_ok() -> self.lookup(key) == Some(value))]
    pub fn insert(&self, key: usize, value: DescRef) -> Result<Inserted, ()> {
        let mut inner = self.inner.write().unwrap();

        let bindex = inner.bindex(key);
        let (seg, slot) = inner.bin(bindex);

        let mut cursor = seg.head(slot);
        while let Some(r) = cursor {
            let record = self.records.get_mut(r);
            if record.key == key {
                if record.value.is_some() {
                    // Insert is for fresh keys only; replacing a live
                    // mapping must go through `update`.
                    debug_assert!(false, "directory insert over a live key {:x}", key);
                    log::error!("directory insert over a live key {:x}; replacing", key);
                }

                record.value = Some(value);
                return Ok(Inserted::Revived);
            }
            cursor = record.next;
        }

        let fresh = self.records.allocate().ok_or(())?;
        {
            let record = self.records.get_mut(fresh);
            record.key = key;
            record.value = Some(value);
            record.next = seg.head(slot);
        }
        seg.set_head(slot, Some(fresh));
        inner.count += 1;

        // A failed expansion is not an insert failure: the table
        // still works, the chains just run longer.
        if !self.expand_check(&mut inner) {
            log::warn!("metadata directory cannot expand past {} bins", inner.bincount);
        }

        Ok(Inserted::Fresh)
    }

    /// Returns the descriptor registered for `key`.  Tombstoned and
    /// absent keys both come back `None`.
    pub fn lookup(&self, key: usize) -> Option<DescRef> {
        let inner = self.inner.read().unwrap();

        let bindex = inner.bindex(key);
        let (seg, slot) = inner.bin(bindex);

        let mut cursor = seg.head(slot);
        while let Some(r) = cursor {
            let record = self.records.get(r);
            if record.key == key {
                return record.value;
            }
            cursor = record.next;
        }

        None
    }

    /// Unregisters `key`, tombstone or not.  Returns whether a record
    /// was present.
    #[ensures(self.lookup(key).is_none())]
    pub fn delete(&self, key: usize) -> bool {
        let mut inner = self.inner.write().unwrap();

        let bindex = inner.bindex(key);
        let (seg, slot) = inner.bin(bindex);

        let mut prev: Option<RecRef> = None;
        let mut cursor = seg.head(slot);
        while let Some(r) = cursor {
            let next = self.records.get(r).next;
            if self.records.get(r).key == key {
                match prev {
                    None => seg.set_head(slot, next),
                    Some(p) => self.records.get_mut(p).next = next,
                }
                self.records.release(r);
                inner.count -= 1;

                self.contract_check(&mut inner);
                return true;
            }

            prev = cursor;
            cursor = next;
        }

        false
    }

    /// Atomically replaces the value registered for `key`; `None`
    /// writes a tombstone.  Returns whether the key was present.
    pub fn update(&self, key: usize, value: Option<DescRef>) -> bool {
        let inner = self.inner.write().unwrap();

        let bindex = inner.bindex(key);
        let (seg, slot) = inner.bin(bindex);

        let mut cursor = seg.head(slot);
        while let Some(r) = cursor {
            let record = self.records.get_mut(r);
            if record.key == key {
                record.value = value;
                return true;
            }
            cursor = record.next;
        }

        false
    }

    /// Visits every record in bin order, chains head to tail.  The
    /// order is deterministic for a given insertion history because
    /// bin splits preserve relative chain order.
    pub fn for_each(&self, mut f: impl FnMut(usize, Option<DescRef>)) {
        let inner = self.inner.read().unwrap();

        for bindex in 0..inner.bincount {
            let (seg, slot) = inner.bin(bindex);

            let mut cursor = seg.head(slot);
            while let Some(r) = cursor {
                let record = self.records.get(r);
                f(record.key, record.value);
                cursor = record.next;
            }
        }
    }

    /// Number of records, tombstones included.
    pub fn count(&self) -> usize {
        self.inner.read().unwrap().count
    }

    #[cfg(test)]
    fn bincount(&self) -> usize {
        self.inner.read().unwrap().bincount
    }

    /// Doubles the directory array.
    fn expand_directory(&self, inner: &mut DirectoryInner) -> bool {
        let old_length = inner.directory_length;
        debug_assert_eq!(old_length, inner.directory_current);

        let new_length = old_length << 1;
        if new_length >= DIRECTORY_LENGTH_MAX {
            return false;
        }

        let new_dir: NonNull<usize> =
            match mapper::map_anon(self.mapper, new_length * std::mem::size_of::<usize>()) {
                Ok(base) => base.cast(),
                Err(_) => return false,
            };

        unsafe {
            std::ptr::copy_nonoverlapping(
                inner.directory.as_ptr(),
                new_dir.as_ptr(),
                old_length,
            );
        }

        let old_dir = inner.directory;
        inner.directory = new_dir;
        inner.directory_length = new_length;

        let _ = mapper::unmap(
            self.mapper,
            old_dir.cast(),
            old_length * std::mem::size_of::<usize>(),
        );
        true
    }

    /// Splits bin `p` when the table runs too loaded.
    fn expand_check(&self, inner: &mut DirectoryInner) -> bool {
        if inner.bincount < BINCOUNT_MAX && inner.load() > MAX_LOAD {
            return self.expand_table(inner);
        }

        true
    }

    fn expand_table(&self, inner: &mut DirectoryInner) -> bool {
        let new_bindex = inner.maxp + inner.p;
        if new_bindex >= BINCOUNT_MAX {
            return false;
        }

        if inner.directory_length == inner.directory_current
            && !self.expand_directory(inner)
        {
            return false;
        }

        let new_segindex = new_bindex / SEGMENT_LENGTH;
        let new_slot = new_bindex & (SEGMENT_LENGTH - 1);

        // Create the new bin's segment if this split is the first to
        // touch it.
        if new_slot == 0 && inner.segment(new_segindex).is_none() {
            let seg = match mapper::map_anon(self.mapper, Segment::BYTES) {
                Ok(base) => Segment(base.as_ptr() as usize),
                Err(_) => return false,
            };
            inner.set_segment(new_segindex, Some(seg));
            inner.directory_current += 1;
        }

        let (old_seg, old_slot) = inner.bin(inner.p);
        let new_seg = inner
            .segment(new_segindex)
            .expect("the split target's segment was just ensured");

        inner.p += 1;
        if inner.p == inner.maxp {
            inner.maxp <<= 1;
            inner.p = 0;
            inner.l += 1;
        }
        inner.bincount += 1;

        debug_assert!(new_seg.head(new_slot).is_none());

        // Rehash the old chain against the widened modulus.  Records
        // keep their relative order on both sides of the split: the
        // old chain is edited in place and the new chain appends at
        // its tail.
        let mut prev: Option<RecRef> = None;
        let mut last_of_new: Option<RecRef> = None;
        let mut cursor = old_seg.head(old_slot);

        while let Some(r) = cursor {
            let next = self.records.get(r).next;

            if inner.bindex(self.records.get(r).key) == new_bindex {
                match last_of_new {
                    None => new_seg.set_head(new_slot, Some(r)),
                    Some(tail) => self.records.get_mut(tail).next = Some(r),
                }
                match prev {
                    None => old_seg.set_head(old_slot, next),
                    Some(p) => self.records.get_mut(p).next = next,
                }

                self.records.get_mut(r).next = None;
                last_of_new = Some(r);
            } else {
                prev = cursor;
            }

            cursor = next;
        }

        true
    }

    /// Merges the top bin back into the bin that produced it when the
    /// table runs too empty.
    fn contract_check(&self, inner: &mut DirectoryInner) {
        if inner.l > 0 && inner.load() < MIN_LOAD {
            self.contract_table(inner);
        }
    }

    fn contract_directory(&self, inner: &mut DirectoryInner) {
        let old_length = inner.directory_length;
        let new_length = old_length >> 1;
        debug_assert!(inner.directory_current < new_length);

        let new_dir: NonNull<usize> =
            match mapper::map_anon(self.mapper, new_length * std::mem::size_of::<usize>()) {
                Ok(base) => base.cast(),
                Err(_) => return,
            };

        unsafe {
            std::ptr::copy_nonoverlapping(
                inner.directory.as_ptr(),
                new_dir.as_ptr(),
                new_length,
            );
        }

        let old_dir = inner.directory;
        inner.directory = new_dir;
        inner.directory_length = new_length;

        let _ = mapper::unmap(
            self.mapper,
            old_dir.cast(),
            old_length * std::mem::size_of::<usize>(),
        );
    }

    fn contract_table(&self, inner: &mut DirectoryInner) {
        if inner.directory_length > INITIAL_DIRECTORY_LENGTH
            && inner.directory_current < inner.directory_length >> 1
        {
            self.contract_directory(inner);
        }

        let (src_index, tgt_index) = if inner.p == 0 {
            ((inner.maxp) - 1, (inner.maxp >> 1) - 1)
        } else {
            (inner.maxp + inner.p - 1, inner.p - 1)
        };

        // Splice the source chain onto the target's tail.
        let (src_seg, src_slot) = inner.bin(src_index);
        let (tgt_seg, tgt_slot) = inner.bin(tgt_index);

        if let Some(src_head) = src_seg.head(src_slot) {
            match tgt_seg.head(tgt_slot) {
                None => tgt_seg.set_head(tgt_slot, Some(src_head)),
                Some(tgt_head) => {
                    let mut tail = tgt_head;
                    while let Some(next) = self.records.get(tail).next {
                        tail = next;
                    }
                    self.records.get_mut(tail).next = Some(src_head);
                }
            }
            src_seg.set_head(src_slot, None);
        }

        // Reclaim the segment if the dropped bin was its first.
        if src_index & (SEGMENT_LENGTH - 1) == 0 {
            let segindex = src_index / SEGMENT_LENGTH;
            let seg = inner
                .segment(segindex)
                .expect("the source bin's segment is mapped");
            let _ = mapper::unmap(
                self.mapper,
                NonNull::new(seg.0 as *mut std::ffi::c_void).expect("segments are never at 0"),
                Segment::BYTES,
            );
            inner.set_segment(segindex, None);
            inner.directory_current -= 1;
        }

        match inner.p.checked_sub(1) {
            Some(p) => inner.p = p,
            None => {
                inner.maxp >>= 1;
                inner.p = inner.maxp - 1;
                inner.l -= 1;
            }
        }
        inner.bincount -= 1;
    }
}

/// Returns the process-wide metadata directory.
pub fn get_default_directory() -> &'static Directory {
    lazy_static::lazy_static! {
        static ref RECORDS: Pool<Record> = Pool::new(crate::mapper::get_default_mapper());
        static ref DIRECTORY: Directory =
            Directory::new(crate::mapper::get_default_mapper(), &RECORDS);
    }

    &DIRECTORY
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::get_default_descriptor_pool;

    fn fresh_directory() -> Directory {
        lazy_static::lazy_static! {
            static ref RECORDS: Pool<Record> = Pool::new(crate::mapper::get_default_mapper());
        }

        Directory::new(crate::mapper::get_default_mapper(), &RECORDS)
    }

    fn some_descriptor() -> DescRef {
        get_default_descriptor_pool()
            .allocate()
            .expect("descriptor allocation should succeed")
    }

    #[test]
    fn insert_lookup_delete() {
        let dir = fresh_directory();
        let d = some_descriptor();

        let key = 0x7000_0000_1000usize;
        assert_eq!(dir.lookup(key), None);

        assert_eq!(dir.insert(key, d), Ok(Inserted::Fresh));
        assert_eq!(dir.lookup(key), Some(d));
        assert_eq!(dir.count(), 1);

        assert!(dir.delete(key));
        assert_eq!(dir.lookup(key), None);
        assert!(!dir.delete(key));
        assert_eq!(dir.count(), 0);
    }

    #[test]
    fn tombstone_revive() {
        let dir = fresh_directory();
        let d0 = some_descriptor();
        let d1 = some_descriptor();

        let key = 0x7000_0000_2000usize;
        assert_eq!(dir.insert(key, d0), Ok(Inserted::Fresh));

        // Unmapping tombstones the key: the record survives, lookups
        // miss.
        assert!(dir.update(key, None));
        assert_eq!(dir.lookup(key), None);
        assert_eq!(dir.count(), 1);

        // Re-registering the same address revives the record in
        // place.
        assert_eq!(dir.insert(key, d1), Ok(Inserted::Revived));
        assert_eq!(dir.lookup(key), Some(d1));
        assert_eq!(dir.count(), 1);
    }

    #[test]
    fn update_replaces_live_value() {
        let dir = fresh_directory();
        let d0 = some_descriptor();
        let d1 = some_descriptor();

        let key = 0x7000_0000_3000usize;
        assert_eq!(dir.insert(key, d0), Ok(Inserted::Fresh));
        assert!(dir.update(key, Some(d1)));
        assert_eq!(dir.lookup(key), Some(d1));

        assert!(!dir.update(0x7000_0000_4000, Some(d0)));
    }

    #[cfg(debug_assertions)]
    #[test]
    #[should_panic(expected = "live key")]
    fn duplicate_insert_is_a_caller_bug() {
        let dir = fresh_directory();
        let d = some_descriptor();

        let key = 0x7000_0000_5000usize;
        let _ = dir.insert(key, d);
        let _ = dir.insert(key, d);
    }

    #[test]
    fn grows_and_shrinks_bucket_by_bucket() {
        let dir = fresh_directory();
        let d = some_descriptor();
        let initial_bins = dir.bincount();

        // Push the load factor well past MAX_LOAD.
        let keys: Vec<usize> = (0..16 * SEGMENT_LENGTH)
            .map(|i| 0x6000_0000_0000 + i * crate::chunk::ALIGNMENT)
            .collect();
        for key in &keys {
            dir.insert(*key, d).expect("insert should succeed");
        }

        assert!(dir.bincount() > initial_bins);
        for key in &keys {
            assert_eq!(dir.lookup(*key), Some(d), "key {:x} lost in expansion", key);
        }

        let peak_bins = dir.bincount();
        for key in &keys {
            assert!(dir.delete(*key));
        }
        assert_eq!(dir.count(), 0);
        // Contraction runs until the table is back to its last
        // doubling; it never shrinks below 2N - 1 bins.
        assert!(dir.bincount() < peak_bins);
        assert!(dir.bincount() < 2 * initial_bins);

        for key in &keys {
            assert_eq!(dir.lookup(*key), None);
        }
    }

    #[test]
    fn iteration_sees_every_record() {
        let dir = fresh_directory();
        let d = some_descriptor();

        let keys: Vec<usize> = (0..100)
            .map(|i| 0x5000_0000_0000 + i * crate::chunk::ALIGNMENT)
            .collect();
        for key in &keys {
            dir.insert(*key, d).expect("insert should succeed");
        }

        let mut seen = Vec::new();
        dir.for_each(|key, value| {
            assert_eq!(value, Some(d));
            seen.push(key);
        });

        seen.sort_unstable();
        assert_eq!(seen, keys);
    }
}
