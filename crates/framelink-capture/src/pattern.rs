//! Synthetic frame source used by tests and the demo producer when no
//! camera is present.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use framelink_foundation::{clock, CaptureError};
use framelink_shm::PixelFormat;

use crate::backend::{CapturedFrame, FrameSource};

/// Generates YUYV frames with a moving gradient so consecutive frames differ
/// and consumers can tell them apart by content as well as version.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frame: Vec<u8>,
    counter: u64,
    streaming: bool,
    /// Delay injected before each frame; zero produces frames as fast as the
    /// caller polls.
    frame_delay: Duration,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        let len = (width as usize) * (height as usize) * 2;
        Self {
            width,
            height,
            frame: vec![0u8; len],
            counter: 0,
            streaming: false,
            frame_delay: Duration::ZERO,
        }
    }

    pub fn with_frame_delay(mut self, delay: Duration) -> Self {
        self.frame_delay = delay;
        self
    }

    /// Frames produced so far.
    pub fn frames_generated(&self) -> u64 {
        self.counter
    }

    fn fill_pattern(&mut self) {
        let shift = self.counter as usize;
        for (i, pair) in self.frame.chunks_exact_mut(2).enumerate() {
            let x = i % self.width as usize;
            pair[0] = ((x + shift) & 0xff) as u8; // Y ramp scrolls each frame
            pair[1] = 0x80; // neutral chroma
        }
    }
}

impl FrameSource for TestPatternSource {
    fn start(&mut self) -> Result<(), CaptureError> {
        self.streaming = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        self.streaming = false;
        Ok(())
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }

    fn capture(
        &mut self,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<Option<CapturedFrame<'_>>, CaptureError> {
        if !self.streaming {
            return Err(CaptureError::NotStreaming);
        }
        if cancel.load(Ordering::Relaxed) {
            return Ok(None);
        }
        if !self.frame_delay.is_zero() {
            if self.frame_delay > timeout {
                std::thread::sleep(timeout);
                return Ok(None);
            }
            std::thread::sleep(self.frame_delay);
        }
        if cancel.load(Ordering::Relaxed) {
            return Ok(None);
        }
        self.counter += 1;
        self.fill_pattern();
        Ok(Some(CapturedFrame {
            data: &self.frame,
            width: self.width,
            height: self.height,
            format: PixelFormat::Yuyv,
            sequence: self.counter as u32,
            timestamp_us: clock::wall_clock_us(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_before_start_is_rejected() {
        let mut source = TestPatternSource::new(8, 2);
        let cancel = AtomicBool::new(false);
        let err = source.capture(Duration::ZERO, &cancel).unwrap_err();
        assert!(matches!(err, CaptureError::NotStreaming));
    }

    #[test]
    fn consecutive_frames_differ() {
        let mut source = TestPatternSource::new(8, 2);
        source.start().unwrap();
        let cancel = AtomicBool::new(false);

        let first: Vec<u8> = source
            .capture(Duration::ZERO, &cancel)
            .unwrap()
            .unwrap()
            .data
            .to_vec();
        let second: Vec<u8> = source
            .capture(Duration::ZERO, &cancel)
            .unwrap()
            .unwrap()
            .data
            .to_vec();
        assert_ne!(first, second);
    }

    #[test]
    fn cancel_short_circuits() {
        let mut source = TestPatternSource::new(8, 2);
        source.start().unwrap();
        let cancel = AtomicBool::new(true);
        assert!(source.capture(Duration::ZERO, &cancel).unwrap().is_none());
        assert_eq!(source.frames_generated(), 0);
    }
}
