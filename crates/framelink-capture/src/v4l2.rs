//! V4L2 mmap streaming backend.
//!
//! Buffer lifecycle follows the kernel streaming I/O model: `VIDIOC_REQBUFS`
//! to allocate driver buffers, `VIDIOC_QUERYBUF` + `mmap` to map each one,
//! `VIDIOC_QBUF` to hand them to the driver, then a poll/`VIDIOC_DQBUF`/
//! requeue cycle while streaming. Exactly one buffer is held dequeued at a
//! time; it is requeued at the start of the next `capture` call, which is
//! what makes the returned frame view valid until then.

use std::mem;
use std::os::raw::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use v4l::buffer::Type;
use v4l::capability::Flags;
use v4l::device::Handle;
use v4l::memory::Memory;
use v4l::v4l2;
use v4l::v4l_sys::{v4l2_buffer, v4l2_requestbuffers};
use v4l::video::Capture;
use v4l::{Device, Format, FourCC};

use framelink_foundation::{clock, CaptureError};

use crate::backend::{CaptureConfig, CapturedFrame, FrameSource};

struct MappedBuffer {
    ptr: *mut u8,
    len: usize,
}

/// Capture source backed by a V4L2 device in mmap streaming mode.
pub struct V4l2Source {
    handle: Arc<Handle>,
    config: CaptureConfig,
    width: u32,
    height: u32,
    buffers: Vec<MappedBuffer>,
    dequeued: Option<u32>,
    streaming: bool,
}

// The mapped buffer pointers are driver memory, only dereferenced through
// `&mut self`, so moving the source to the capture thread is sound.
unsafe impl Send for V4l2Source {}

impl V4l2Source {
    /// Open the device, verify it can capture and stream, and negotiate the
    /// requested format. A driver that substitutes a different pixel format
    /// is rejected; adjusted geometry is accepted and recorded.
    pub fn open(config: CaptureConfig) -> Result<Self, CaptureError> {
        let device =
            Device::with_path(&config.device).map_err(|source| CaptureError::DeviceOpenFailed {
                path: config.device.clone(),
                source,
            })?;

        let caps = device
            .query_caps()
            .map_err(|source| CaptureError::DeviceOpenFailed {
                path: config.device.clone(),
                source,
            })?;
        if !caps
            .capabilities
            .contains(Flags::VIDEO_CAPTURE | Flags::STREAMING)
        {
            return Err(CaptureError::NotACaptureDevice {
                path: config.device.clone(),
            });
        }

        let requested = FourCC::new(config.format.fourcc());
        let granted = device
            .set_format(&Format::new(config.width, config.height, requested))
            .map_err(|source| CaptureError::DeviceOpenFailed {
                path: config.device.clone(),
                source,
            })?;
        if granted.fourcc != requested {
            return Err(CaptureError::FormatNotSupported {
                requested: requested.to_string(),
                granted: granted.fourcc.to_string(),
            });
        }
        if granted.width != config.width || granted.height != config.height {
            tracing::warn!(
                requested_width = config.width,
                requested_height = config.height,
                granted_width = granted.width,
                granted_height = granted.height,
                "driver adjusted capture geometry"
            );
        }
        tracing::info!(
            device = %config.device.display(),
            format = %granted.fourcc,
            width = granted.width,
            height = granted.height,
            "opened capture device"
        );

        let handle = device.handle();
        Ok(Self {
            handle,
            width: granted.width,
            height: granted.height,
            config,
            buffers: Vec::new(),
            dequeued: None,
            streaming: false,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    fn map_buffers(&mut self, count: u32) -> Result<(), CaptureError> {
        let fd = self.handle.fd();
        for index in 0..count {
            let mut buf = v4l2_buffer {
                index,
                type_: Type::VideoCapture as u32,
                memory: Memory::Mmap as u32,
                ..unsafe { mem::zeroed() }
            };
            unsafe {
                v4l2::ioctl(
                    fd,
                    v4l2::vidioc::VIDIOC_QUERYBUF,
                    &mut buf as *mut _ as *mut c_void,
                )
            }
            .map_err(|source| CaptureError::BufferMapFailed { index, source })?;

            let len = buf.length as usize;
            let offset = unsafe { buf.m.offset };
            let ptr = unsafe {
                v4l2::mmap(
                    ptr::null_mut(),
                    len,
                    libc::PROT_READ | libc::PROT_WRITE,
                    libc::MAP_SHARED,
                    fd,
                    offset as libc::off_t,
                )
            }
            .map_err(|source| CaptureError::BufferMapFailed { index, source })?;
            self.buffers.push(MappedBuffer {
                ptr: ptr as *mut u8,
                len,
            });
        }
        Ok(())
    }

    fn queue(&mut self, index: u32) -> Result<(), CaptureError> {
        let mut buf = v4l2_buffer {
            index,
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        unsafe {
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_QBUF,
                &mut buf as *mut _ as *mut c_void,
            )
        }
        .map_err(|source| CaptureError::QueueFailed { index, source })
    }

    fn dequeue(&mut self) -> Result<v4l2_buffer, CaptureError> {
        let mut buf = v4l2_buffer {
            type_: Type::VideoCapture as u32,
            memory: Memory::Mmap as u32,
            ..unsafe { mem::zeroed() }
        };
        unsafe {
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_DQBUF,
                &mut buf as *mut _ as *mut c_void,
            )
        }
        .map_err(|source| CaptureError::DequeueFailed { source })?;
        Ok(buf)
    }
}

impl FrameSource for V4l2Source {
    fn start(&mut self) -> Result<(), CaptureError> {
        if self.streaming {
            return Ok(());
        }
        let fd = self.handle.fd();

        // Buffers are requested and mapped exactly once: drivers answer
        // EBUSY to a REQBUFS while earlier mappings are still live, so a
        // stop/start cycle reuses the existing allocation and goes straight
        // to requeueing.
        if self.buffers.is_empty() {
            let mut req = v4l2_requestbuffers {
                count: self.config.buffer_count,
                type_: Type::VideoCapture as u32,
                memory: Memory::Mmap as u32,
                ..unsafe { mem::zeroed() }
            };
            unsafe {
                v4l2::ioctl(
                    fd,
                    v4l2::vidioc::VIDIOC_REQBUFS,
                    &mut req as *mut _ as *mut c_void,
                )
            }
            .map_err(|source| CaptureError::StreamOnFailed { source })?;
            if req.count < 2 {
                return Err(CaptureError::InsufficientBuffers {
                    requested: self.config.buffer_count,
                    granted: req.count,
                });
            }
            self.map_buffers(req.count)?;
        }
        for index in 0..self.buffers.len() as u32 {
            self.queue(index)?;
        }

        let mut kind = Type::VideoCapture as u32;
        unsafe {
            v4l2::ioctl(
                fd,
                v4l2::vidioc::VIDIOC_STREAMON,
                &mut kind as *mut _ as *mut c_void,
            )
        }
        .map_err(|source| CaptureError::StreamOnFailed { source })?;

        self.dequeued = None;
        self.streaming = true;
        tracing::info!(buffers = self.buffers.len(), "capture streaming started");
        Ok(())
    }

    fn stop(&mut self) -> Result<(), CaptureError> {
        if !self.streaming {
            return Ok(());
        }
        self.streaming = false;
        // STREAMOFF returns every buffer to the driver's free list.
        self.dequeued = None;
        let mut kind = Type::VideoCapture as u32;
        let res = unsafe {
            v4l2::ioctl(
                self.handle.fd(),
                v4l2::vidioc::VIDIOC_STREAMOFF,
                &mut kind as *mut _ as *mut c_void,
            )
        };
        if let Err(source) = res {
            tracing::warn!(error = %source, "VIDIOC_STREAMOFF failed");
        }
        tracing::info!("capture streaming stopped");
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
        // Hand the previously returned buffer back to the driver.
        if let Some(index) = self.dequeued.take() {
            self.queue(index)?;
        }
        if cancel.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let mut pfd = libc::pollfd {
            fd: self.handle.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms = timeout.as_millis().min(i32::MAX as u128) as i32;
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let source = std::io::Error::last_os_error();
            if source.kind() == std::io::ErrorKind::Interrupted {
                return Ok(None);
            }
            return Err(CaptureError::DequeueFailed { source });
        }
        if rc == 0 || cancel.load(Ordering::Relaxed) {
            return Ok(None);
        }

        let buf = self.dequeue()?;
        let index = buf.index;
        self.dequeued = Some(index);

        let driver_us =
            buf.timestamp.tv_sec as u64 * 1_000_000 + buf.timestamp.tv_usec as u64;
        let timestamp_us = if driver_us == 0 {
            clock::wall_clock_us()
        } else {
            driver_us
        };

        let mapped = &self.buffers[index as usize];
        let used = (buf.bytesused as usize).min(mapped.len);
        let data = unsafe { std::slice::from_raw_parts(mapped.ptr, used) };
        Ok(Some(CapturedFrame {
            data,
            width: self.width,
            height: self.height,
            format: self.config.format,
            sequence: buf.sequence,
            timestamp_us,
        }))
    }
}

impl Drop for V4l2Source {
    fn drop(&mut self) {
        let _ = self.stop();
        for buf in self.buffers.drain(..) {
            if let Err(source) = unsafe { v4l2::munmap(buf.ptr as *mut c_void, buf.len) } {
                tracing::warn!(error = %source, "munmap of capture buffer failed");
            }
        }
    }
}
