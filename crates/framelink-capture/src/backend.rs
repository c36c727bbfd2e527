//! Capture backend contract shared by every frame source.

use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use framelink_foundation::CaptureError;
use framelink_shm::{FrameHeader, PixelFormat};

/// Settings a backend negotiates against. The driver may adjust width and
/// height; the granted geometry is what [`CapturedFrame`] reports.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    pub device: PathBuf,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Buffers requested from the driver. The grant may be smaller; fewer
    /// than two makes streaming impossible and fails `start`.
    pub buffer_count: u32,
    /// Default wait per `capture` call when the caller has no tighter bound.
    pub poll_timeout: Duration,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            device: PathBuf::from("/dev/video0"),
            width: 640,
            height: 480,
            format: PixelFormat::Yuyv,
            buffer_count: 4,
            poll_timeout: Duration::from_millis(200),
        }
    }
}

/// One dequeued frame, borrowing the backend's buffer.
///
/// The borrow ties the frame to the source: it must be consumed (typically
/// copied into a transport slot) before the next `capture` call, which
/// requeues the underlying buffer to the driver.
#[derive(Debug)]
pub struct CapturedFrame<'a> {
    pub data: &'a [u8],
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    /// Driver-side frame counter; gaps indicate drops inside the driver.
    pub sequence: u32,
    /// Capture timestamp in microseconds, from the driver when it provides
    /// one, otherwise stamped by the backend.
    pub timestamp_us: u64,
}

impl CapturedFrame<'_> {
    /// Transport header describing this frame.
    pub fn to_header(&self) -> FrameHeader {
        FrameHeader::new(self.format, self.width, self.height, self.data.len() as u32)
            .with_timestamp(self.timestamp_us)
    }
}

/// A stream of frames with an explicit start/stop lifecycle.
///
/// `capture` returns `Ok(None)` on timeout or cancellation; both are normal
/// flow, not errors. Implementations must keep `stop` idempotent and must
/// release driver resources on drop without panicking.
pub trait FrameSource: Send {
    fn start(&mut self) -> Result<(), CaptureError>;

    fn stop(&mut self) -> Result<(), CaptureError>;

    fn is_streaming(&self) -> bool;

    /// Wait up to `timeout` for the next frame. `cancel` is checked around
    /// the wait so a shutdown request interrupts promptly.
    fn capture(
        &mut self,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<Option<CapturedFrame<'_>>, CaptureError>;
}
