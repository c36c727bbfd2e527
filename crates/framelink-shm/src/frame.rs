//! Fixed-size frame header written ahead of the payload in each slot, plus
//! the pluggable decoder boundary.
//!
//! Header and payload are copied into the slot before the commit publishes
//! them, so a reader that observes `ready == true` always sees a consistent
//! pair. The header is serialized little-endian at fixed offsets; the layout
//! never changes without bumping the segment layout version.

use thiserror::Error;

use framelink_foundation::TransportError;

/// Pixel format tag carried in the frame header. The wire value is stable;
/// unknown tags decode to an error, never a panic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelFormat {
    Yuyv,
    Mjpeg,
    H264,
    Bgr24,
}

impl PixelFormat {
    pub fn tag(self) -> u32 {
        match self {
            PixelFormat::Yuyv => 1,
            PixelFormat::Mjpeg => 2,
            PixelFormat::H264 => 3,
            PixelFormat::Bgr24 => 4,
        }
    }

    pub fn from_tag(tag: u32) -> Result<Self, TransportError> {
        match tag {
            1 => Ok(PixelFormat::Yuyv),
            2 => Ok(PixelFormat::Mjpeg),
            3 => Ok(PixelFormat::H264),
            4 => Ok(PixelFormat::Bgr24),
            other => Err(TransportError::UnknownFormat(other)),
        }
    }

    /// Channel count a producer would normally stamp for this format.
    /// Compressed formats carry 1 (opaque byte stream).
    pub fn default_channels(self) -> u32 {
        match self {
            PixelFormat::Yuyv => 2,
            PixelFormat::Bgr24 => 3,
            PixelFormat::Mjpeg | PixelFormat::H264 => 1,
        }
    }

    pub fn fourcc(self) -> &'static [u8; 4] {
        match self {
            PixelFormat::Yuyv => b"YUYV",
            PixelFormat::Mjpeg => b"MJPG",
            PixelFormat::H264 => b"H264",
            PixelFormat::Bgr24 => b"BGR3",
        }
    }
}

/// Metadata prefixed to each slot's payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub payload_size: u32,
    /// Format-specific subtype; H.264 uses 1=I, 2=P, 3=B, raw formats 0.
    pub frame_subtype: u8,
    /// Microsecond wall-clock timestamp taken at capture time (distinct from
    /// the control table's commit timestamp).
    pub capture_timestamp_us: u64,
}

impl FrameHeader {
    /// Serialized size. Field offsets below; the trailing bytes are reserved
    /// padding so the 8-byte timestamp sits naturally aligned and the size
    /// stays a multiple of 8.
    pub const SIZE: usize = 40;

    const OFF_FORMAT: usize = 0;
    const OFF_WIDTH: usize = 4;
    const OFF_HEIGHT: usize = 8;
    const OFF_CHANNELS: usize = 12;
    const OFF_PAYLOAD_SIZE: usize = 16;
    const OFF_TIMESTAMP: usize = 24;
    const OFF_SUBTYPE: usize = 32;

    pub fn new(format: PixelFormat, width: u32, height: u32, payload_size: u32) -> Self {
        Self {
            format,
            width,
            height,
            channels: format.default_channels(),
            payload_size,
            frame_subtype: 0,
            capture_timestamp_us: 0,
        }
    }

    pub fn with_timestamp(mut self, timestamp_us: u64) -> Self {
        self.capture_timestamp_us = timestamp_us;
        self
    }

    pub fn with_subtype(mut self, subtype: u8) -> Self {
        self.frame_subtype = subtype;
        self
    }

    pub fn encode_into(&self, out: &mut [u8]) -> Result<(), TransportError> {
        if out.len() < Self::SIZE {
            return Err(TransportError::BufferTooSmall {
                required: Self::SIZE,
                available: out.len(),
            });
        }
        out[..Self::SIZE].fill(0);
        out[Self::OFF_FORMAT..Self::OFF_FORMAT + 4].copy_from_slice(&self.format.tag().to_le_bytes());
        out[Self::OFF_WIDTH..Self::OFF_WIDTH + 4].copy_from_slice(&self.width.to_le_bytes());
        out[Self::OFF_HEIGHT..Self::OFF_HEIGHT + 4].copy_from_slice(&self.height.to_le_bytes());
        out[Self::OFF_CHANNELS..Self::OFF_CHANNELS + 4]
            .copy_from_slice(&self.channels.to_le_bytes());
        out[Self::OFF_PAYLOAD_SIZE..Self::OFF_PAYLOAD_SIZE + 4]
            .copy_from_slice(&self.payload_size.to_le_bytes());
        out[Self::OFF_TIMESTAMP..Self::OFF_TIMESTAMP + 8]
            .copy_from_slice(&self.capture_timestamp_us.to_le_bytes());
        out[Self::OFF_SUBTYPE] = self.frame_subtype;
        Ok(())
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TransportError> {
        if buf.len() < Self::SIZE {
            return Err(TransportError::InvalidArguments(
                "buffer smaller than a frame header",
            ));
        }
        let u32_at = |off: usize| u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
        let format = PixelFormat::from_tag(u32_at(Self::OFF_FORMAT))?;
        Ok(Self {
            format,
            width: u32_at(Self::OFF_WIDTH),
            height: u32_at(Self::OFF_HEIGHT),
            channels: u32_at(Self::OFF_CHANNELS),
            payload_size: u32_at(Self::OFF_PAYLOAD_SIZE),
            frame_subtype: buf[Self::OFF_SUBTYPE],
            capture_timestamp_us: u64::from_le_bytes(
                buf[Self::OFF_TIMESTAMP..Self::OFF_TIMESTAMP + 8]
                    .try_into()
                    .unwrap(),
            ),
        })
    }
}

/// Serialize header then payload into a slot's data region. Returns the
/// total bytes written (the slot's `data_size`).
pub fn encode_frame(
    slot: &mut [u8],
    header: &FrameHeader,
    payload: &[u8],
) -> Result<usize, TransportError> {
    if header.payload_size as usize != payload.len() {
        return Err(TransportError::InvalidArguments(
            "header payload_size disagrees with payload length",
        ));
    }
    let total = FrameHeader::SIZE + payload.len();
    if total > slot.len() {
        return Err(TransportError::BufferTooSmall {
            required: total,
            available: slot.len(),
        });
    }
    header.encode_into(slot)?;
    slot[FrameHeader::SIZE..total].copy_from_slice(payload);
    Ok(total)
}

/// Deserialize a slot's data region into header + borrowed payload view.
///
/// The declared payload size must agree with the slot's recorded `data_size`.
/// Under the publish protocol a mismatch should be impossible; it is checked
/// anyway and reported as `HeaderMismatch` so a reader skips the slot instead
/// of crashing on a corrupted segment.
pub fn decode_frame(slot: &[u8], data_size: usize) -> Result<(FrameHeader, &[u8]), TransportError> {
    if data_size < FrameHeader::SIZE || data_size > slot.len() {
        return Err(TransportError::HeaderMismatch {
            header_bytes: FrameHeader::SIZE,
            slot_bytes: data_size,
        });
    }
    let header = FrameHeader::decode(slot)?;
    let expected = FrameHeader::SIZE + header.payload_size as usize;
    if expected != data_size {
        return Err(TransportError::HeaderMismatch {
            header_bytes: header.payload_size as usize,
            slot_bytes: data_size - FrameHeader::SIZE,
        });
    }
    Ok((header, &slot[FrameHeader::SIZE..data_size]))
}

/// Decoded pixel data, produced by an external [`FrameDecoder`].
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub channels: u32,
    pub data: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("unsupported pixel format {0:?}")]
    Unsupported(PixelFormat),

    #[error("malformed {format:?} payload: {reason}")]
    Malformed {
        format: PixelFormat,
        reason: String,
    },
}

/// Collaborator boundary: pixel-format decoding is pluggable and lives
/// outside the transport core. Implementations are selected per
/// [`PixelFormat`]; the core neither requires nor assumes a specific decode
/// library.
pub trait FrameDecoder: Send {
    fn supports(&self, format: PixelFormat) -> bool;
    fn decode(&self, header: &FrameHeader, payload: &[u8]) -> Result<PixelBuffer, DecodeError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(payload_len: usize) -> FrameHeader {
        FrameHeader::new(PixelFormat::Yuyv, 640, 480, payload_len as u32)
            .with_timestamp(1_723_000_000_123_456)
            .with_subtype(0)
    }

    #[test]
    fn header_round_trip() {
        let mut buf = [0u8; FrameHeader::SIZE];
        let h = header(1000);
        h.encode_into(&mut buf).unwrap();
        let back = FrameHeader::decode(&buf).unwrap();
        assert_eq!(back, h);
    }

    #[test]
    fn frame_round_trip() {
        let payload: Vec<u8> = (0..1000u32).map(|i| (i % 251) as u8).collect();
        let mut slot = vec![0u8; 4096];
        let h = header(payload.len());
        let written = encode_frame(&mut slot, &h, &payload).unwrap();
        assert_eq!(written, FrameHeader::SIZE + payload.len());

        let (back, view) = decode_frame(&slot, written).unwrap();
        assert_eq!(back, h);
        assert_eq!(view, &payload[..]);
    }

    #[test]
    fn encode_rejects_oversized_payload() {
        let payload = vec![0u8; 100];
        let mut slot = vec![0u8; FrameHeader::SIZE + 99];
        let err = encode_frame(&mut slot, &header(100), &payload).unwrap_err();
        assert!(matches!(err, TransportError::BufferTooSmall { .. }));
    }

    #[test]
    fn encode_rejects_size_disagreement() {
        let payload = vec![0u8; 100];
        let mut slot = vec![0u8; 4096];
        let err = encode_frame(&mut slot, &header(99), &payload).unwrap_err();
        assert!(matches!(err, TransportError::InvalidArguments(_)));
    }

    #[test]
    fn decode_rejects_size_mismatch() {
        let payload = vec![7u8; 64];
        let mut slot = vec![0u8; 4096];
        let written = encode_frame(&mut slot, &header(64), &payload).unwrap();
        // Claim one byte more than the commit recorded.
        let err = decode_frame(&slot, written + 1).unwrap_err();
        assert!(matches!(err, TransportError::HeaderMismatch { .. }));
    }

    #[test]
    fn decode_rejects_unknown_tag() {
        let mut slot = vec![0u8; 4096];
        encode_frame(&mut slot, &header(16), &[0u8; 16]).unwrap();
        slot[0..4].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        let err = decode_frame(&slot, FrameHeader::SIZE + 16).unwrap_err();
        assert!(matches!(err, TransportError::UnknownFormat(_)));
    }

    #[test]
    fn max_payload_fills_slot_exactly() {
        let slot_size = 65536;
        let mut slot = vec![0u8; slot_size];
        let max = slot_size - FrameHeader::SIZE;
        let payload = vec![1u8; max];
        let written = encode_frame(&mut slot, &header(max), &payload).unwrap();
        assert_eq!(written, slot_size);
    }
}
