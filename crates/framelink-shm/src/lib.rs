//! Zero-copy shared-memory frame transport.
//!
//! One process (the producer) creates a named POSIX shared-memory segment
//! holding a fixed number of frame slots; any number of consumer processes
//! open it and always read the newest published frame. All cross-process
//! synchronization happens through atomics in the slot control table with
//! acquire/release ordering — there is no lock on the data path.

pub mod frame;
pub mod layout;
pub mod segment;
pub mod transport;

pub use frame::{
    decode_frame, encode_frame, DecodeError, FrameDecoder, FrameHeader, PixelBuffer, PixelFormat,
};
pub use layout::SlotTableLayout;
pub use segment::Segment;
pub use transport::{FrameTransport, LatestFrame, ReadSlot, WriteSlot};

pub use framelink_foundation::{SegmentConfig, TransportError};
