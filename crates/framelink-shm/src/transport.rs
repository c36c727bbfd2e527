//! Write/read handle protocol over the slot control table.
//!
//! Single producer, any number of consumer processes. `acquire_write` and
//! `acquire_read` never block: they return immediately with a handle or a
//! transient condition (`AcquireFailed` / `NoDataAvailable`); waiting is the
//! caller's policy, composed from the convenience helpers below.

use std::time::{Duration, Instant};

use framelink_foundation::{clock, SegmentConfig, TransportError};

use crate::frame::{self, FrameHeader};
use crate::layout::{SlotTable, SlotTableLayout};
use crate::segment::Segment;

/// Bounded yield-retry budget used by [`FrameTransport::write_frame`] when
/// every slot is reader-held. Past this the backpressure is surfaced.
const WRITE_RETRY_LIMIT: u32 = 1000;

/// Public, memory-safe surface over one shared segment.
///
/// All methods take `&self`; cross-process coordination happens through the
/// control table's atomics, so the transport can be shared freely between
/// threads (`Arc<FrameTransport>`) as well as processes.
#[derive(Debug)]
pub struct FrameTransport {
    segment: Segment,
    layout: SlotTableLayout,
    config: SegmentConfig,
}

impl FrameTransport {
    /// Create the segment (producer side). Degrades to opening an existing
    /// object with layout validation, so a restarted producer comes back up
    /// against a segment left behind by its predecessor.
    pub fn create(config: SegmentConfig) -> Result<Self, TransportError> {
        let layout = Self::layout_for(&config)?;
        Self::create_with_size(config, layout.required_size())
    }

    /// As [`create`](Self::create) with an explicit total size, which must be
    /// at least the layout's requirement. The check runs before any OS call
    /// so an undersized request never leaves a half-created object behind.
    pub fn create_with_size(
        config: SegmentConfig,
        total_size: usize,
    ) -> Result<Self, TransportError> {
        let layout = Self::layout_for(&config)?;
        let required = layout.required_size();
        if total_size < required {
            return Err(TransportError::BufferTooSmall {
                required,
                available: total_size,
            });
        }

        let segment = Segment::create(&config.shm_name(), total_size)?;
        let transport = Self {
            segment,
            layout,
            config,
        };
        if transport.segment.is_creator() {
            transport.table().initialize();
            tracing::debug!(
                name = %transport.segment.name(),
                slots = transport.layout.num_slots(),
                slot_size = transport.layout.slot_size(),
                "initialized slot control table"
            );
        } else {
            transport.table().validate()?;
        }
        Ok(transport)
    }

    /// Open an existing segment (consumer side). Fails if it does not exist
    /// or was created with different layout parameters.
    pub fn open(config: SegmentConfig) -> Result<Self, TransportError> {
        let layout = Self::layout_for(&config)?;
        let segment = Segment::open(&config.shm_name(), layout.required_size())?;
        let transport = Self {
            segment,
            layout,
            config,
        };
        transport.table().validate()?;
        Ok(transport)
    }

    fn layout_for(config: &SegmentConfig) -> Result<SlotTableLayout, TransportError> {
        config.validate()?;
        if config.slot_size <= FrameHeader::SIZE {
            return Err(TransportError::InvalidArguments(
                "slot_size must exceed the frame header size",
            ));
        }
        Ok(SlotTableLayout::new(config.num_slots, config.slot_size))
    }

    fn table(&self) -> SlotTable<'_> {
        let base = self
            .segment
            .base_ptr()
            .expect("segment is mapped for the transport's lifetime");
        unsafe { SlotTable::new(base, &self.layout) }
    }

    fn slot_bytes(&self, idx: usize) -> *mut u8 {
        let range = self.layout.slot_data_range(idx);
        let base = self
            .segment
            .base_ptr()
            .expect("segment is mapped for the transport's lifetime");
        unsafe { base.add(range.start) }
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    pub fn num_slots(&self) -> usize {
        self.layout.num_slots()
    }

    pub fn slot_size(&self) -> usize {
        self.layout.slot_size()
    }

    /// Largest payload a slot can carry.
    pub fn payload_capacity(&self) -> usize {
        self.layout.slot_size() - FrameHeader::SIZE
    }

    pub fn is_creator(&self) -> bool {
        self.segment.is_creator()
    }

    /// Claim a slot for writing. Non-blocking: `BufferTooSmall` if the
    /// payload cannot fit, `AcquireFailed` if every slot is reader-held
    /// (backpressure — retry policy belongs to the caller).
    pub fn acquire_write(&self, expected_size: usize) -> Result<WriteSlot<'_>, TransportError> {
        if expected_size + FrameHeader::SIZE > self.layout.slot_size() {
            return Err(TransportError::BufferTooSmall {
                required: expected_size + FrameHeader::SIZE,
                available: self.layout.slot_size(),
            });
        }
        let idx = self.table().select_write_slot()?;
        Ok(WriteSlot {
            transport: self,
            idx,
            committed: false,
        })
    }

    /// Join the newest published slot as a reader. Non-blocking:
    /// `NoDataAvailable` when nothing is published.
    pub fn acquire_read(&self) -> Result<ReadSlot<'_>, TransportError> {
        let table = self.table();
        let (idx, version) = table.select_read_slot()?;
        let data_size = table.data_size(idx).load(std::sync::atomic::Ordering::Acquire) as usize;
        // Bound the recorded size before any slice is built over the
        // mapping: a corrupted segment must fail the read, not the reader.
        if data_size < FrameHeader::SIZE || data_size > self.layout.slot_size() {
            table.release_read(idx);
            return Err(TransportError::HeaderMismatch {
                header_bytes: data_size,
                slot_bytes: self.layout.slot_size(),
            });
        }
        let timestamp_us = table
            .timestamp_us(idx)
            .load(std::sync::atomic::Ordering::Acquire);
        Ok(ReadSlot {
            transport: self,
            idx,
            version,
            timestamp_us,
            data_size,
        })
    }

    /// Copy-in convenience: acquire, encode header+payload, commit with the
    /// caller's version. Yields and retries a bounded number of times on
    /// backpressure before giving up with `AcquireFailed`.
    pub fn write_frame(
        &self,
        header: &FrameHeader,
        payload: &[u8],
        version: u64,
    ) -> Result<(), TransportError> {
        let mut attempts = 0u32;
        let mut slot = loop {
            match self.acquire_write(payload.len()) {
                Ok(slot) => break slot,
                Err(TransportError::AcquireFailed) if attempts < WRITE_RETRY_LIMIT => {
                    attempts += 1;
                    std::thread::yield_now();
                }
                Err(err) => return Err(err),
            }
        };
        slot.payload_mut()[..payload.len()].copy_from_slice(payload);
        slot.commit(*header, payload.len(), version)
    }

    /// Copy-out convenience: read the newest published frame into `out`.
    pub fn try_read_latest(&self, out: &mut Vec<u8>) -> Result<LatestFrame, TransportError> {
        let slot = self.acquire_read()?;
        let (header, payload) = slot.frame()?;
        out.clear();
        out.extend_from_slice(payload);
        Ok(LatestFrame {
            header,
            version: slot.version(),
            timestamp_us: slot.timestamp_us(),
        })
    }

    /// Poll [`try_read_latest`](Self::try_read_latest) until data appears or
    /// `deadline` elapses.
    pub fn read_latest_blocking(
        &self,
        out: &mut Vec<u8>,
        poll_interval: Duration,
        deadline: Duration,
    ) -> Result<LatestFrame, TransportError> {
        let start = Instant::now();
        loop {
            match self.try_read_latest(out) {
                Err(TransportError::NoDataAvailable) => {}
                other => return other,
            }
            if start.elapsed() >= deadline {
                return Err(TransportError::Timeout(deadline));
            }
            std::thread::sleep(poll_interval);
        }
    }

    /// Destroy the OS object (creator teardown). Mappings held by other
    /// processes stay valid until they unmap.
    pub fn unlink(&self) -> Result<(), TransportError> {
        self.segment.unlink()
    }
}

impl Drop for FrameTransport {
    fn drop(&mut self) {
        // Unmap only; unlinking is an explicit creator decision.
        self.segment.close();
    }
}

/// Metadata returned by the copy-out read helpers.
#[derive(Debug, Clone, Copy)]
pub struct LatestFrame {
    pub header: FrameHeader,
    pub version: u64,
    pub timestamp_us: u64,
}

/// Exclusive capability over one claimed slot.
///
/// Borrows the transport for its scope; committing consumes it. Dropping it
/// uncommitted releases the claim and leaves the slot invisible
/// (`ready == false`) — abandoning a write never exposes partial data.
#[derive(Debug)]
pub struct WriteSlot<'a> {
    transport: &'a FrameTransport,
    idx: usize,
    committed: bool,
}

impl WriteSlot<'_> {
    pub fn slot_index(&self) -> usize {
        self.idx
    }

    /// Payload capacity after the frame header.
    pub fn capacity(&self) -> usize {
        self.transport.payload_capacity()
    }

    /// Writable payload region (the bytes after the header prefix). Valid to
    /// fill freely: the claim guarantees no reader observes the slot.
    pub fn payload_mut(&mut self) -> &mut [u8] {
        let ptr = self.transport.slot_bytes(self.idx);
        unsafe {
            std::slice::from_raw_parts_mut(
                ptr.add(FrameHeader::SIZE),
                self.transport.payload_capacity(),
            )
        }
    }

    /// Publish `payload_len` bytes of the payload region together with the
    /// header. Field stores are ordered so `ready` flips last; the version is
    /// supplied by the caller, which owns the monotonic counter.
    pub fn commit(
        mut self,
        mut header: FrameHeader,
        payload_len: usize,
        version: u64,
    ) -> Result<(), TransportError> {
        if payload_len > self.capacity() {
            return Err(TransportError::BufferTooSmall {
                required: payload_len + FrameHeader::SIZE,
                available: self.transport.slot_size(),
            });
        }
        if header.payload_size as usize != payload_len {
            return Err(TransportError::InvalidArguments(
                "header payload_size disagrees with committed length",
            ));
        }
        // Defensive: payload_size is authoritative from the commit call.
        header.payload_size = payload_len as u32;

        let slot_ptr = self.transport.slot_bytes(self.idx);
        let header_region =
            unsafe { std::slice::from_raw_parts_mut(slot_ptr, FrameHeader::SIZE) };
        header.encode_into(header_region)?;

        let data_size = FrameHeader::SIZE + payload_len;
        self.transport
            .table()
            .publish(self.idx, data_size, clock::wall_clock_us(), version);
        self.committed = true;
        Ok(())
    }
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.transport.table().abandon_write(self.idx);
        }
    }
}

/// Shared capability over one published slot.
///
/// Holds the slot's `reader_count` for its lifetime, which excludes the
/// writer from reusing the slot. Several handles — across processes — may
/// reference the same slot at once (broadcast fan-out). The transport never
/// deduplicates: a consumer that polls twice may see the same version and is
/// expected to compare against the last version it handled.
#[derive(Debug)]
pub struct ReadSlot<'a> {
    transport: &'a FrameTransport,
    idx: usize,
    version: u64,
    timestamp_us: u64,
    data_size: usize,
}

impl ReadSlot<'_> {
    pub fn slot_index(&self) -> usize {
        self.idx
    }

    /// Producer-assigned version of this frame.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Commit wall-clock timestamp (microseconds since the epoch).
    pub fn timestamp_us(&self) -> u64 {
        self.timestamp_us
    }

    /// Raw committed bytes: header prefix plus payload.
    pub fn raw(&self) -> &[u8] {
        let ptr = self.transport.slot_bytes(self.idx);
        unsafe { std::slice::from_raw_parts(ptr, self.data_size) }
    }

    /// Decoded header plus borrowed payload view. `HeaderMismatch` marks a
    /// protocol violation or corrupted segment; callers skip the slot.
    pub fn frame(&self) -> Result<(FrameHeader, &[u8]), TransportError> {
        frame::decode_frame(self.raw(), self.data_size)
    }
}

impl Drop for ReadSlot<'_> {
    fn drop(&mut self) {
        self.transport.table().release_read(self.idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::PixelFormat;
    use std::sync::atomic::{AtomicU32, Ordering};

    static NEXT_SEGMENT: AtomicU32 = AtomicU32::new(0);

    fn unique_config(num_slots: u32, slot_size: usize) -> SegmentConfig {
        let id = NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed);
        SegmentConfig::new(
            format!("/framelink-unit-{}-{}", std::process::id(), id),
            num_slots,
            slot_size,
        )
    }

    #[test]
    fn corrupted_data_size_fails_the_read_not_the_reader() {
        let config = unique_config(1, 4096);
        let transport = FrameTransport::create(config).unwrap();

        let payload = vec![5u8; 64];
        let header = FrameHeader::new(PixelFormat::Yuyv, 8, 8, 64);
        transport.write_frame(&header, &payload, 1).unwrap();

        // Forge an oversized commit directly in the segment: a data_size far
        // beyond the slot, with a header whose payload_size agrees, so only
        // the bound check in acquire_read stands between the reader and a
        // wild slice.
        let huge = 256usize * 1024 * 1024;
        let fake = FrameHeader::new(PixelFormat::Yuyv, 8, 8, (huge - FrameHeader::SIZE) as u32);
        let header_region =
            unsafe { std::slice::from_raw_parts_mut(transport.slot_bytes(0), FrameHeader::SIZE) };
        fake.encode_into(header_region).unwrap();
        transport
            .table()
            .data_size(0)
            .store(huge as u64, std::sync::atomic::Ordering::Release);

        let mut out = Vec::new();
        let err = transport.try_read_latest(&mut out).unwrap_err();
        assert!(matches!(err, TransportError::HeaderMismatch { .. }));

        // The rejected read must not leak its reader join.
        assert_eq!(
            transport
                .table()
                .reader_count(0)
                .load(std::sync::atomic::Ordering::Acquire),
            0
        );

        transport.unlink().unwrap();
    }

    #[test]
    fn undersized_data_size_is_rejected_too() {
        let config = unique_config(1, 4096);
        let transport = FrameTransport::create(config).unwrap();

        let payload = vec![7u8; 32];
        let header = FrameHeader::new(PixelFormat::Yuyv, 4, 4, 32);
        transport.write_frame(&header, &payload, 1).unwrap();

        // Smaller than a header can ever be.
        transport
            .table()
            .data_size(0)
            .store(8, std::sync::atomic::Ordering::Release);

        let err = transport.acquire_read().unwrap_err();
        assert!(matches!(err, TransportError::HeaderMismatch { .. }));

        transport.unlink().unwrap();
    }
}
