//! Integration tests for the shared-memory frame transport.
//!
//! Each test uses a process-unique segment name so tests can run in parallel
//! and never collide with leftovers from earlier runs. Cross-process
//! semantics are exercised by opening a second transport handle over the
//! same segment; the atomics in the control table make no distinction
//! between threads and processes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use framelink_shm::{FrameHeader, FrameTransport, PixelFormat, SegmentConfig, TransportError};

static NEXT_SEGMENT: AtomicU32 = AtomicU32::new(0);

fn unique_config(num_slots: u32, slot_size: usize) -> SegmentConfig {
    let id = NEXT_SEGMENT.fetch_add(1, Ordering::Relaxed);
    SegmentConfig::new(
        format!("/framelink-test-{}-{}", std::process::id(), id),
        num_slots,
        slot_size,
    )
}

fn header_for(payload: &[u8]) -> FrameHeader {
    FrameHeader::new(PixelFormat::Yuyv, 640, 480, payload.len() as u32)
}

struct Unlinker<'a>(&'a FrameTransport);

impl Drop for Unlinker<'_> {
    fn drop(&mut self) {
        let _ = self.0.unlink();
    }
}

#[test]
fn three_slot_segment_full_cycle() {
    // num_slots=3, slot_size=65536: an oversized payload is rejected before
    // touching any slot, a 1000-byte commit at version 1 is immediately
    // readable, and three held readers exhaust the writer.
    let config = unique_config(3, 65536);
    let producer = FrameTransport::create(config.clone()).unwrap();
    let _cleanup = Unlinker(&producer);

    let err = producer.acquire_write(65500).unwrap_err();
    assert!(matches!(err, TransportError::BufferTooSmall { .. }));

    let payload = vec![0xabu8; 1000];
    producer.write_frame(&header_for(&payload), &payload, 1).unwrap();

    let consumer = FrameTransport::open(config).unwrap();
    let r1 = consumer.acquire_read().unwrap();
    assert_eq!(r1.version(), 1);
    let (header, view) = r1.frame().unwrap();
    assert_eq!(header.payload_size, 1000);
    assert_eq!(view, &payload[..]);

    // Publish onto the two remaining slots, pinning each with a reader so
    // all three end up held by distinct handles.
    producer.write_frame(&header_for(&payload), &payload, 2).unwrap();
    let r2 = consumer.acquire_read().unwrap();
    assert_eq!(r2.version(), 2);
    producer.write_frame(&header_for(&payload), &payload, 3).unwrap();
    let r3 = consumer.acquire_read().unwrap();
    assert_eq!(r3.version(), 3);

    let held: std::collections::HashSet<usize> =
        [r1.slot_index(), r2.slot_index(), r3.slot_index()]
            .into_iter()
            .collect();
    assert_eq!(held.len(), 3, "each reader pins a distinct slot");

    let err = producer.acquire_write(1000).unwrap_err();
    assert!(matches!(err, TransportError::AcquireFailed));

    // Releasing any one reader unblocks the writer.
    drop(r1);
    let slot = producer.acquire_write(1000).unwrap();
    drop(slot);
}

#[test]
fn versions_observed_monotonic() {
    let config = unique_config(3, 4096);
    let producer = FrameTransport::create(config.clone()).unwrap();
    let _cleanup = Unlinker(&producer);
    let consumer = FrameTransport::open(config).unwrap();

    let mut out = Vec::new();
    let mut last_seen = 0u64;
    for version in 1..=50u64 {
        let payload = vec![(version % 256) as u8; 512];
        producer
            .write_frame(&header_for(&payload), &payload, version)
            .unwrap();
        let frame = consumer.try_read_latest(&mut out).unwrap();
        assert!(frame.version > last_seen, "observed version went backwards");
        assert_eq!(frame.version, version);
        assert_eq!(out, vec![(version % 256) as u8; 512]);
        last_seen = frame.version;
    }
    assert_eq!(last_seen, 50);
}

#[test]
fn reader_held_slot_is_never_overwritten() {
    let config = unique_config(3, 4096);
    let producer = FrameTransport::create(config.clone()).unwrap();
    let _cleanup = Unlinker(&producer);
    let consumer = FrameTransport::open(config).unwrap();

    let original = vec![0x11u8; 256];
    producer.write_frame(&header_for(&original), &original, 1).unwrap();
    let held = consumer.acquire_read().unwrap();
    assert_eq!(held.version(), 1);

    // Many more commits; they must all land on the other two slots.
    for version in 2..=20u64 {
        let payload = vec![(version % 256) as u8; 256];
        producer
            .write_frame(&header_for(&payload), &payload, version)
            .unwrap();
    }

    let (_, view) = held.frame().unwrap();
    assert_eq!(view, &original[..], "held slot content changed under reader");
    assert_eq!(held.version(), 1);
}

#[test]
fn abandoned_write_leaves_no_visible_data() {
    let config = unique_config(3, 4096);
    let producer = FrameTransport::create(config).unwrap();
    let _cleanup = Unlinker(&producer);

    {
        let mut slot = producer.acquire_write(128).unwrap();
        slot.payload_mut()[..128].fill(0x55);
        // Dropped without commit.
    }
    assert!(matches!(
        producer.acquire_read(),
        Err(TransportError::NoDataAvailable)
    ));

    // The claim was released: the writer can proceed normally.
    let payload = vec![0x66u8; 128];
    producer.write_frame(&header_for(&payload), &payload, 1).unwrap();
    let slot = producer.acquire_read().unwrap();
    assert_eq!(slot.version(), 1);
}

#[test]
fn abandoning_over_published_slot_keeps_old_frame_hidden_until_recommit() {
    // An abandoned rewrite of the oldest published slot leaves that slot
    // not-ready, while newer slots stay readable.
    let config = unique_config(2, 4096);
    let producer = FrameTransport::create(config).unwrap();
    let _cleanup = Unlinker(&producer);

    let a = vec![1u8; 64];
    let b = vec![2u8; 64];
    producer.write_frame(&header_for(&a), &a, 1).unwrap();
    producer.write_frame(&header_for(&b), &b, 2).unwrap();

    // Next write selects the lowest-version slot (version 1) and abandons.
    drop(producer.acquire_write(64).unwrap());

    let slot = producer.acquire_read().unwrap();
    assert_eq!(slot.version(), 2, "newest commit still readable");
}

#[test]
fn concurrent_readers_share_a_slot() {
    let config = unique_config(3, 4096);
    let producer = FrameTransport::create(config.clone()).unwrap();
    let _cleanup = Unlinker(&producer);
    let consumer = FrameTransport::open(config).unwrap();

    let payload = vec![9u8; 100];
    producer.write_frame(&header_for(&payload), &payload, 7).unwrap();

    let r1 = consumer.acquire_read().unwrap();
    let r2 = consumer.acquire_read().unwrap();
    assert_eq!(r1.slot_index(), r2.slot_index());
    assert_eq!(r1.version(), 7);
    assert_eq!(r2.version(), 7);
    let (_, v1) = r1.frame().unwrap();
    let (_, v2) = r2.frame().unwrap();
    assert_eq!(v1, v2);
}

#[test]
fn undersized_total_size_fails_before_creation() {
    let config = unique_config(3, 65536);
    let name = config.shm_name();
    let err = FrameTransport::create_with_size(config.clone(), 1024).unwrap_err();
    assert!(matches!(err, TransportError::BufferTooSmall { .. }));

    // Nothing was created: a plain open must fail.
    let err = FrameTransport::open(config).unwrap_err();
    assert!(
        matches!(err, TransportError::OpenFailed { .. }),
        "object {name} should not exist, got {err:?}"
    );
}

#[test]
fn open_missing_segment_fails() {
    let config = unique_config(3, 4096);
    assert!(matches!(
        FrameTransport::open(config),
        Err(TransportError::OpenFailed { .. })
    ));
}

#[test]
fn layout_mismatch_is_rejected_on_open() {
    let config = unique_config(3, 8192);
    let producer = FrameTransport::create(config.clone()).unwrap();
    let _cleanup = Unlinker(&producer);

    let mut other = config;
    other.slot_size = 4096;
    let err = FrameTransport::open(other).unwrap_err();
    assert!(matches!(err, TransportError::LayoutMismatch(_)));
}

#[test]
fn create_degrades_to_open_existing() {
    let config = unique_config(3, 4096);
    let first = FrameTransport::create(config.clone()).unwrap();
    let _cleanup = Unlinker(&first);
    assert!(first.is_creator());

    let payload = vec![3u8; 32];
    first.write_frame(&header_for(&payload), &payload, 1).unwrap();

    // A second create (e.g. producer restart) opens the existing object and
    // sees its published state.
    let second = FrameTransport::create(config).unwrap();
    assert!(!second.is_creator());
    let slot = second.acquire_read().unwrap();
    assert_eq!(slot.version(), 1);
}

#[test]
fn blocking_read_times_out_without_data() {
    let config = unique_config(2, 4096);
    let producer = FrameTransport::create(config).unwrap();
    let _cleanup = Unlinker(&producer);

    let mut out = Vec::new();
    let err = producer
        .read_latest_blocking(&mut out, Duration::from_millis(5), Duration::from_millis(40))
        .unwrap_err();
    assert!(matches!(err, TransportError::Timeout(_)));
}

#[test]
fn blocking_read_returns_once_published() {
    let config = unique_config(2, 4096);
    let producer = Arc::new(FrameTransport::create(config.clone()).unwrap());
    let consumer = FrameTransport::open(config).unwrap();

    let writer = {
        let producer = Arc::clone(&producer);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            let payload = vec![4u8; 64];
            producer
                .write_frame(&header_for(&payload), &payload, 42)
                .unwrap();
        })
    };

    let mut out = Vec::new();
    let frame = consumer
        .read_latest_blocking(&mut out, Duration::from_millis(5), Duration::from_secs(5))
        .unwrap();
    assert_eq!(frame.version, 42);
    assert_eq!(out.len(), 64);

    writer.join().unwrap();
    let _ = producer.unlink();
}

#[test]
fn commits_are_never_torn_under_concurrency() {
    // Producer thread commits frames whose payload bytes all equal the
    // version (mod 251); a reader must only ever observe uniform payloads
    // and non-decreasing versions.
    let config = unique_config(3, 4096);
    let producer = Arc::new(FrameTransport::create(config.clone()).unwrap());
    let consumer = FrameTransport::open(config).unwrap();

    let writer = {
        let producer = Arc::clone(&producer);
        std::thread::spawn(move || {
            for version in 1..=500u64 {
                let fill = (version % 251) as u8;
                let payload = vec![fill; 1024];
                producer
                    .write_frame(&header_for(&payload), &payload, version)
                    .unwrap();
            }
        })
    };

    let mut last_seen = 0u64;
    let mut observed = 0u32;
    while last_seen < 500 {
        match consumer.acquire_read() {
            Ok(slot) => {
                let version = slot.version();
                assert!(version >= last_seen, "version regressed");
                let (header, payload) = slot.frame().unwrap();
                assert_eq!(header.payload_size as usize, payload.len());
                let expected = (version % 251) as u8;
                assert!(
                    payload.iter().all(|&b| b == expected),
                    "torn payload at version {version}"
                );
                last_seen = version;
                observed += 1;
            }
            Err(TransportError::NoDataAvailable) => std::thread::yield_now(),
            Err(err) => panic!("unexpected read error: {err}"),
        }
    }
    assert!(observed > 0);

    writer.join().unwrap();
    let _ = producer.unlink();
}

#[test]
fn unlinked_segment_cannot_be_reopened() {
    let config = unique_config(2, 4096);
    let producer = FrameTransport::create(config.clone()).unwrap();
    producer.unlink().unwrap();

    // Existing mapping still works after unlink...
    let payload = vec![8u8; 16];
    producer.write_frame(&header_for(&payload), &payload, 1).unwrap();
    assert_eq!(producer.acquire_read().unwrap().version(), 1);

    // ...but the name is gone for new participants.
    assert!(matches!(
        FrameTransport::open(config),
        Err(TransportError::OpenFailed { .. })
    ));
}

#[test]
fn write_slot_exposes_full_payload_capacity() {
    let config = unique_config(2, 65536);
    let producer = FrameTransport::create(config).unwrap();
    let _cleanup = Unlinker(&producer);

    let capacity = producer.payload_capacity();
    assert_eq!(capacity, 65536 - FrameHeader::SIZE);

    let mut slot = producer.acquire_write(capacity).unwrap();
    assert_eq!(slot.payload_mut().len(), capacity);
    slot.payload_mut().fill(0x77);
    let header = FrameHeader::new(PixelFormat::Mjpeg, 1920, 1080, capacity as u32);
    slot.commit(header, capacity, 1).unwrap();

    let read = producer.acquire_read().unwrap();
    let (h, payload) = read.frame().unwrap();
    assert_eq!(h.format, PixelFormat::Mjpeg);
    assert_eq!(payload.len(), capacity);
}
