//! Producer loop: drives a [`FrameSource`] on a dedicated thread and
//! publishes every frame into a shared-memory transport.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use framelink_foundation::CaptureError;
use framelink_shm::FrameTransport;

use crate::backend::FrameSource;
use crate::watchdog::FrameWatchdog;

/// Counters exported by the capture thread; read them from any thread.
#[derive(Default)]
pub struct CaptureStats {
    pub frames_published: AtomicU64,
    pub frames_dropped: AtomicU64,
    pub poll_timeouts: AtomicU64,
    pub watchdog_restarts: AtomicU64,
}

/// Handle to the running producer thread.
pub struct CaptureThread {
    handle: JoinHandle<()>,
    shutdown: Arc<AtomicBool>,
}

impl CaptureThread {
    /// Start the source, then spawn the publish loop. Startup errors surface
    /// here instead of inside the thread so the caller can react.
    ///
    /// Frame versions start at 1 and increment per published frame; the
    /// thread owns the counter, honoring the single-producer contract.
    pub fn spawn(
        mut source: Box<dyn FrameSource>,
        transport: Arc<FrameTransport>,
        poll_timeout: Duration,
        watchdog_timeout: Duration,
    ) -> Result<(Self, Arc<CaptureStats>), CaptureError> {
        source.start()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let stats = Arc::new(CaptureStats::default());
        let thread_shutdown = shutdown.clone();
        let thread_stats = stats.clone();

        let handle = std::thread::Builder::new()
            .name("frame-capture".to_string())
            .spawn(move || {
                run_loop(
                    source.as_mut(),
                    &transport,
                    poll_timeout,
                    watchdog_timeout,
                    &thread_shutdown,
                    &thread_stats,
                );
                let _ = source.stop();
                tracing::info!("capture thread exited");
            })
            .map_err(|e| CaptureError::Fatal(format!("failed to spawn capture thread: {e}")))?;

        Ok((Self { handle, shutdown }, stats))
    }

    pub fn stop(self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if self.handle.join().is_err() {
            tracing::error!("capture thread panicked");
        }
    }
}

fn run_loop(
    source: &mut dyn FrameSource,
    transport: &FrameTransport,
    poll_timeout: Duration,
    watchdog_timeout: Duration,
    shutdown: &AtomicBool,
    stats: &CaptureStats,
) {
    let mut watchdog = FrameWatchdog::new(watchdog_timeout);
    watchdog.arm();
    let mut version: u64 = 0;

    while !shutdown.load(Ordering::Relaxed) {
        match source.capture(poll_timeout, shutdown) {
            Ok(Some(frame)) => {
                let header = frame.to_header();
                version += 1;
                match transport.write_frame(&header, frame.data, version) {
                    Ok(()) => {
                        stats.frames_published.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(err) if err.is_transient() => {
                        // All slots reader-held; drop this frame and move on.
                        stats.frames_dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(version, "frame dropped under reader backpressure");
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "transport write failed, stopping capture");
                        break;
                    }
                }
                watchdog.feed();
            }
            Ok(None) => {
                stats.poll_timeouts.fetch_add(1, Ordering::Relaxed);
                if watchdog.check() {
                    stats.watchdog_restarts.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        timeout = ?watchdog_timeout,
                        "no frames within watchdog window, restarting stream"
                    );
                    if let Err(err) = source.stop().and_then(|()| source.start()) {
                        tracing::error!(error = %err, "stream restart failed, stopping capture");
                        break;
                    }
                }
            }
            Err(err) => {
                tracing::error!(error = %err, "capture failed, stopping capture");
                break;
            }
        }
    }
}
