//! Streaming frame capture for framelink.
//!
//! [`V4l2Source`] drives a V4L2 device through the mmap streaming I/O cycle
//! (request buffers, map, queue, poll, dequeue, requeue). It is one
//! implementation of the generic [`FrameSource`] capability; alternate
//! backends such as [`TestPatternSource`] substitute behind the same
//! contract. [`CaptureThread`] runs a source on a dedicated producer thread
//! and publishes every frame into a [`framelink_shm::FrameTransport`].

pub mod backend;
pub mod pattern;
pub mod thread;
pub mod v4l2;
pub mod watchdog;

pub use backend::{CaptureConfig, CapturedFrame, FrameSource};
pub use pattern::TestPatternSource;
pub use thread::{CaptureStats, CaptureThread};
pub use v4l2::V4l2Source;
pub use watchdog::FrameWatchdog;

pub use framelink_foundation::CaptureError;
