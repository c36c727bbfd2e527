//! Slot control table layout and atomic accessors.
//!
//! The segment starts with a small fixed header, followed by five parallel
//! per-slot arrays, followed by the slot data regions:
//!
//! ```text
//! [ magic:u64 | layout_version:u32 | num_slots:u32 | slot_size:u64 ]
//! [ version:u64       x num_slots ]
//! [ timestamp_us:u64  x num_slots ]
//! [ data_size:u64     x num_slots ]
//! [ ready:u8          x num_slots ]
//! [ reader_count:u32  x num_slots ]
//! [ slot data regions : slot_size bytes each, 64-byte aligned start ]
//! ```
//!
//! Every offset is derived from `(num_slots, slot_size)` alone, so all
//! participating processes compute an identical layout. This module is the
//! only place in the crate that performs pointer arithmetic on the mapping.

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};

use framelink_foundation::TransportError;

/// Identifies a framelink segment and its layout revision.
pub const TABLE_MAGIC: u64 = 0x464c_4e4b_5348_4d31; // "FLNKSHM1"
pub const LAYOUT_VERSION: u32 = 1;

/// `reader_count` sentinel marking a slot claimed by the writer. The claim is
/// taken with a single compare-and-swap, so slot selection and reservation
/// are one atomic step and a reader can never join a slot that is being
/// overwritten.
pub const WRITER_CLAIM: u32 = u32::MAX;

const fn align_up(off: usize, align: usize) -> usize {
    (off + align - 1) & !(align - 1)
}

/// Byte offsets of every control array and data region, computed once per
/// process from the segment configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTableLayout {
    num_slots: usize,
    slot_size: usize,
    version_off: usize,
    timestamp_off: usize,
    data_size_off: usize,
    ready_off: usize,
    reader_count_off: usize,
    data_off: usize,
}

impl SlotTableLayout {
    /// Fixed header: magic, layout version, slot count, slot size.
    pub const HEADER_LEN: usize = 24;

    pub fn new(num_slots: u32, slot_size: usize) -> Self {
        let n = num_slots as usize;
        let version_off = align_up(Self::HEADER_LEN, 8);
        let timestamp_off = version_off + n * 8;
        let data_size_off = timestamp_off + n * 8;
        let ready_off = data_size_off + n * 8;
        let reader_count_off = align_up(ready_off + n, 4);
        let data_off = align_up(reader_count_off + n * 4, 64);
        Self {
            num_slots: n,
            slot_size,
            version_off,
            timestamp_off,
            data_size_off,
            ready_off,
            reader_count_off,
            data_off,
        }
    }

    pub fn num_slots(&self) -> usize {
        self.num_slots
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    /// Bytes occupied by the fixed header plus all control arrays.
    pub fn control_table_size(&self) -> usize {
        self.data_off
    }

    /// Minimum segment size for this layout.
    pub fn required_size(&self) -> usize {
        self.data_off + self.num_slots * self.slot_size
    }

    /// Byte range of one slot's data region within the segment.
    pub fn slot_data_range(&self, idx: usize) -> std::ops::Range<usize> {
        debug_assert!(idx < self.num_slots);
        let start = self.data_off + idx * self.slot_size;
        start..start + self.slot_size
    }
}

/// Borrowed atomic view over a mapped segment.
///
/// Constructed on demand from the mapping base pointer; never stored, so the
/// owning transport stays `Send + Sync` through `MmapMut` alone.
pub(crate) struct SlotTable<'a> {
    base: *mut u8,
    layout: &'a SlotTableLayout,
}

impl<'a> SlotTable<'a> {
    /// # Safety
    ///
    /// `base` must point to a mapping of at least `layout.required_size()`
    /// bytes that stays valid for `'a`.
    pub(crate) unsafe fn new(base: *mut u8, layout: &'a SlotTableLayout) -> Self {
        Self { base, layout }
    }

    fn atomic_u64(&self, off: usize) -> &'a AtomicU64 {
        debug_assert_eq!(off % 8, 0);
        unsafe { &*(self.base.add(off) as *const AtomicU64) }
    }

    fn atomic_u32(&self, off: usize) -> &'a AtomicU32 {
        debug_assert_eq!(off % 4, 0);
        unsafe { &*(self.base.add(off) as *const AtomicU32) }
    }

    fn atomic_u8(&self, off: usize) -> &'a AtomicU8 {
        unsafe { &*(self.base.add(off) as *const AtomicU8) }
    }

    pub(crate) fn version(&self, idx: usize) -> &'a AtomicU64 {
        self.atomic_u64(self.layout.version_off + idx * 8)
    }

    pub(crate) fn timestamp_us(&self, idx: usize) -> &'a AtomicU64 {
        self.atomic_u64(self.layout.timestamp_off + idx * 8)
    }

    pub(crate) fn data_size(&self, idx: usize) -> &'a AtomicU64 {
        self.atomic_u64(self.layout.data_size_off + idx * 8)
    }

    pub(crate) fn ready(&self, idx: usize) -> &'a AtomicU8 {
        self.atomic_u8(self.layout.ready_off + idx)
    }

    pub(crate) fn reader_count(&self, idx: usize) -> &'a AtomicU32 {
        self.atomic_u32(self.layout.reader_count_off + idx * 4)
    }

    fn magic(&self) -> &'a AtomicU64 {
        self.atomic_u64(0)
    }

    fn layout_version_field(&self) -> &'a AtomicU32 {
        self.atomic_u32(8)
    }

    fn num_slots_field(&self) -> &'a AtomicU32 {
        self.atomic_u32(12)
    }

    fn slot_size_field(&self) -> &'a AtomicU64 {
        self.atomic_u64(16)
    }

    /// Zero every per-slot field and stamp the fixed header. Called exactly
    /// once, by the creator, before any handle is issued.
    pub(crate) fn initialize(&self) {
        for i in 0..self.layout.num_slots {
            self.version(i).store(0, Ordering::Release);
            self.timestamp_us(i).store(0, Ordering::Release);
            self.data_size(i).store(0, Ordering::Release);
            self.ready(i).store(0, Ordering::Release);
            self.reader_count(i).store(0, Ordering::Release);
        }
        self.layout_version_field()
            .store(LAYOUT_VERSION, Ordering::Release);
        self.num_slots_field()
            .store(self.layout.num_slots as u32, Ordering::Release);
        self.slot_size_field()
            .store(self.layout.slot_size as u64, Ordering::Release);
        // Magic last: a valid magic implies a fully stamped header.
        self.magic().store(TABLE_MAGIC, Ordering::Release);
    }

    pub(crate) fn is_stamped(&self) -> bool {
        self.magic().load(Ordering::Acquire) == TABLE_MAGIC
    }

    /// Check that an existing segment was created with the same layout
    /// parameters this process derived from its configuration.
    pub(crate) fn validate(&self) -> Result<(), TransportError> {
        let magic = self.magic().load(Ordering::Acquire);
        if magic != TABLE_MAGIC {
            return Err(TransportError::LayoutMismatch(format!(
                "bad magic {magic:#018x}, segment was not initialized by framelink"
            )));
        }
        let version = self.layout_version_field().load(Ordering::Acquire);
        if version != LAYOUT_VERSION {
            return Err(TransportError::LayoutMismatch(format!(
                "layout version {version}, expected {LAYOUT_VERSION}"
            )));
        }
        let slots = self.num_slots_field().load(Ordering::Acquire) as usize;
        if slots != self.layout.num_slots {
            return Err(TransportError::LayoutMismatch(format!(
                "segment has {slots} slots, configuration says {}",
                self.layout.num_slots
            )));
        }
        let slot_size = self.slot_size_field().load(Ordering::Acquire) as usize;
        if slot_size != self.layout.slot_size {
            return Err(TransportError::LayoutMismatch(format!(
                "segment slot size is {slot_size}, configuration says {}",
                self.layout.slot_size
            )));
        }
        Ok(())
    }

    /// Pick the slot to overwrite: lowest version first (oldest published or
    /// never-published), claimed with a single CAS on `reader_count`. Slots
    /// held by readers are never selected. Fails with `AcquireFailed` when
    /// every slot is held — the designed backpressure signal.
    pub(crate) fn select_write_slot(&self) -> Result<usize, TransportError> {
        let n = self.layout.num_slots;
        let mut order: Vec<(u64, usize)> = (0..n)
            .map(|i| (self.version(i).load(Ordering::Acquire), i))
            .collect();
        order.sort_unstable();

        for (_, idx) in order {
            if self
                .reader_count(idx)
                .compare_exchange(0, WRITER_CLAIM, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                // Hide stale content from new readers while we overwrite.
                self.ready(idx).store(0, Ordering::Release);
                return Ok(idx);
            }
        }
        Err(TransportError::AcquireFailed)
    }

    /// Pick the newest ready slot and join it as a reader. The join is a CAS
    /// increment of `reader_count`, refused while the writer claim sentinel
    /// is present, and re-validated against `ready`/`version` afterwards so
    /// a handle never observes a torn commit.
    pub(crate) fn select_read_slot(&self) -> Result<(usize, u64), TransportError> {
        let n = self.layout.num_slots;
        // A failed join means the table moved under us; rescan. Bounded so a
        // pathological writer cannot spin us forever.
        for _ in 0..n * 4 {
            let mut newest: Option<(u64, usize)> = None;
            for i in 0..n {
                if self.ready(i).load(Ordering::Acquire) == 0 {
                    continue;
                }
                let v = self.version(i).load(Ordering::Acquire);
                if newest.map_or(true, |(best, _)| v > best) {
                    newest = Some((v, i));
                }
            }
            let Some((version, idx)) = newest else {
                return Err(TransportError::NoDataAvailable);
            };

            let counter = self.reader_count(idx);
            let current = counter.load(Ordering::Acquire);
            if current == WRITER_CLAIM {
                continue;
            }
            if counter
                .compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            // Joined. Re-check that the commit we saw is still the one in
            // the slot; the writer cannot touch it from here on.
            if self.ready(idx).load(Ordering::Acquire) == 1
                && self.version(idx).load(Ordering::Acquire) == version
            {
                return Ok((idx, version));
            }
            counter.fetch_sub(1, Ordering::Release);
        }
        Err(TransportError::NoDataAvailable)
    }

    /// Publish a commit: payload bytes must already be in place. `ready` is
    /// stored last so every other field is visible before the slot becomes
    /// readable; the writer claim is dropped after that.
    pub(crate) fn publish(&self, idx: usize, data_size: usize, timestamp_us: u64, version: u64) {
        self.data_size(idx).store(data_size as u64, Ordering::Release);
        self.timestamp_us(idx).store(timestamp_us, Ordering::Release);
        self.version(idx).store(version, Ordering::Release);
        self.ready(idx).store(1, Ordering::Release);
        self.reader_count(idx).store(0, Ordering::Release);
    }

    /// Abandon an uncommitted write: drop the claim, leave `ready == false`
    /// so the half-written content stays invisible.
    pub(crate) fn abandon_write(&self, idx: usize) {
        self.reader_count(idx).store(0, Ordering::Release);
    }

    /// Release a read handle.
    pub(crate) fn release_read(&self, idx: usize) {
        self.reader_count(idx).fetch_sub(1, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_aligned_and_ordered() {
        let l = SlotTableLayout::new(3, 65536);
        assert_eq!(l.version_off % 8, 0);
        assert_eq!(l.timestamp_off % 8, 0);
        assert_eq!(l.data_size_off % 8, 0);
        assert_eq!(l.reader_count_off % 4, 0);
        assert_eq!(l.data_off % 64, 0);
        assert!(l.version_off < l.timestamp_off);
        assert!(l.timestamp_off < l.data_size_off);
        assert!(l.data_size_off < l.ready_off);
        assert!(l.ready_off < l.reader_count_off);
        assert!(l.reader_count_off < l.data_off);
    }

    #[test]
    fn layout_is_deterministic() {
        let a = SlotTableLayout::new(5, 4096);
        let b = SlotTableLayout::new(5, 4096);
        assert_eq!(a, b);
    }

    #[test]
    fn required_size_covers_all_slots() {
        let l = SlotTableLayout::new(4, 1024);
        assert_eq!(l.required_size(), l.control_table_size() + 4 * 1024);
        let last = l.slot_data_range(3);
        assert_eq!(last.end, l.required_size());
    }

    #[test]
    fn slot_ranges_do_not_overlap() {
        let l = SlotTableLayout::new(3, 512);
        let a = l.slot_data_range(0);
        let b = l.slot_data_range(1);
        let c = l.slot_data_range(2);
        assert_eq!(a.end, b.start);
        assert_eq!(b.end, c.start);
        assert_eq!(a.end - a.start, 512);
    }

    #[test]
    fn table_select_on_private_buffer() {
        // Exercise the claim protocol on a plain aligned allocation.
        let layout = SlotTableLayout::new(3, 256);
        let mut backing = vec![0u8; layout.required_size() + 64];
        let base = {
            let p = backing.as_mut_ptr() as usize;
            ((p + 63) & !63) as *mut u8
        };
        let table = unsafe { SlotTable::new(base, &layout) };
        table.initialize();
        assert!(table.is_stamped());
        assert!(table.validate().is_ok());

        // Nothing published yet.
        assert!(matches!(
            table.select_read_slot(),
            Err(TransportError::NoDataAvailable)
        ));

        // Claim all three slots for writing; a fourth claim fails.
        let a = table.select_write_slot().unwrap();
        let b = table.select_write_slot().unwrap();
        let c = table.select_write_slot().unwrap();
        assert_eq!({ [a, b, c].iter().collect::<std::collections::HashSet<_>>().len() }, 3);
        assert!(matches!(
            table.select_write_slot(),
            Err(TransportError::AcquireFailed)
        ));

        table.publish(a, 8, 1_000, 1);
        table.abandon_write(b);
        table.abandon_write(c);

        let (idx, version) = table.select_read_slot().unwrap();
        assert_eq!(idx, a);
        assert_eq!(version, 1);
        assert_eq!(table.reader_count(a).load(Ordering::Acquire), 1);

        // The held slot is skipped for writing; next write goes elsewhere.
        let w = table.select_write_slot().unwrap();
        assert_ne!(w, a);
        table.abandon_write(w);
        table.release_read(a);
        assert_eq!(table.reader_count(a).load(Ordering::Acquire), 0);
    }
}
