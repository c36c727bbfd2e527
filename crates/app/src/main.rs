use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand, ValueEnum};

use framelink_capture::backend::{CaptureConfig, FrameSource};
use framelink_capture::{CaptureThread, TestPatternSource, V4l2Source};
use framelink_foundation::clock;
use framelink_shm::{segment, FrameTransport, PixelFormat, SegmentConfig};

#[derive(Parser)]
#[command(
    name = "framelink",
    version,
    about = "Zero-copy shared-memory video frame transport"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Args, Clone)]
struct SegmentArgs {
    /// Shared memory object name.
    #[arg(long, default_value = "/framelink_video")]
    segment: String,

    /// Number of frame slots.
    #[arg(long, default_value_t = 3)]
    slots: u32,

    /// Slot size in bytes, frame header included.
    #[arg(long, default_value_t = 4 * 1024 * 1024)]
    slot_size: usize,
}

impl SegmentArgs {
    fn config(&self) -> SegmentConfig {
        SegmentConfig::new(self.segment.clone(), self.slots, self.slot_size)
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum SourceKind {
    /// Capture from a V4L2 camera.
    V4l2,
    /// Synthetic moving test pattern, no hardware needed.
    Test,
}

#[derive(Clone, Copy, ValueEnum)]
enum FormatArg {
    Yuyv,
    Mjpeg,
}

impl From<FormatArg> for PixelFormat {
    fn from(arg: FormatArg) -> Self {
        match arg {
            FormatArg::Yuyv => PixelFormat::Yuyv,
            FormatArg::Mjpeg => PixelFormat::Mjpeg,
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Capture frames and publish them into the segment.
    Producer {
        #[command(flatten)]
        segment: SegmentArgs,

        #[arg(long, value_enum, default_value_t = SourceKind::V4l2)]
        source: SourceKind,

        #[arg(long, default_value = "/dev/video0")]
        device: PathBuf,

        #[arg(long, default_value_t = 640)]
        width: u32,

        #[arg(long, default_value_t = 480)]
        height: u32,

        #[arg(long, value_enum, default_value_t = FormatArg::Yuyv)]
        format: FormatArg,

        /// Driver buffers to request.
        #[arg(long, default_value_t = 4)]
        buffers: u32,

        /// Restart the stream after this many seconds without frames.
        #[arg(long, default_value_t = 5)]
        watchdog_secs: u64,

        /// Unlink the segment on clean shutdown.
        #[arg(long)]
        unlink_on_exit: bool,
    },

    /// Follow the newest frames in the segment and log them.
    Consumer {
        #[command(flatten)]
        segment: SegmentArgs,

        /// Poll interval in milliseconds.
        #[arg(long, default_value_t = 5)]
        poll_ms: u64,

        /// Exit after this many distinct frames (default: run until killed).
        #[arg(long)]
        count: Option<u64>,
    },

    /// Remove a leftover shared memory object.
    Unlink {
        #[arg(long, default_value = "/framelink_video")]
        segment: String,
    },
}

fn init_logging() {
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt().with_env_filter(log_level).init();
}

fn shutdown_flag() -> anyhow::Result<Arc<AtomicBool>> {
    let flag = Arc::new(AtomicBool::new(false));
    let handler_flag = flag.clone();
    ctrlc::set_handler(move || handler_flag.store(true, Ordering::Relaxed))
        .context("failed to install signal handler")?;
    Ok(flag)
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Command::Producer {
            segment,
            source,
            device,
            width,
            height,
            format,
            buffers,
            watchdog_secs,
            unlink_on_exit,
        } => run_producer(
            segment,
            source,
            device,
            width,
            height,
            format.into(),
            buffers,
            Duration::from_secs(watchdog_secs),
            unlink_on_exit,
        ),
        Command::Consumer {
            segment,
            poll_ms,
            count,
        } => run_consumer(segment, Duration::from_millis(poll_ms), count),
        Command::Unlink { segment } => {
            let name = if segment.starts_with('/') {
                segment
            } else {
                format!("/{segment}")
            };
            segment::unlink_by_name(&name)
                .with_context(|| format!("unlinking segment {name}"))?;
            tracing::info!(%name, "segment unlinked");
            Ok(())
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_producer(
    segment: SegmentArgs,
    source_kind: SourceKind,
    device: PathBuf,
    width: u32,
    height: u32,
    format: PixelFormat,
    buffers: u32,
    watchdog_timeout: Duration,
    unlink_on_exit: bool,
) -> anyhow::Result<()> {
    let config = segment.config();
    let transport = Arc::new(
        FrameTransport::create(config.clone())
            .with_context(|| format!("creating segment {}", config.shm_name()))?,
    );
    tracing::info!(
        segment = %config.shm_name(),
        slots = transport.num_slots(),
        slot_size = transport.slot_size(),
        payload_capacity = transport.payload_capacity(),
        "segment ready"
    );

    let capture_config = CaptureConfig {
        device,
        width,
        height,
        format,
        buffer_count: buffers,
        poll_timeout: Duration::from_millis(200),
    };
    let poll_timeout = capture_config.poll_timeout;
    let source: Box<dyn FrameSource> = match source_kind {
        SourceKind::V4l2 => Box::new(V4l2Source::open(capture_config)?),
        SourceKind::Test => Box::new(
            TestPatternSource::new(width, height).with_frame_delay(Duration::from_millis(33)),
        ),
    };

    let (thread, stats) =
        CaptureThread::spawn(source, transport.clone(), poll_timeout, watchdog_timeout)?;
    tracing::info!("producer running, Ctrl-C to stop");

    let shutdown = shutdown_flag()?;
    let mut last_published = 0u64;
    let mut ticks = 0u32;
    while !shutdown.load(Ordering::Relaxed) {
        std::thread::sleep(Duration::from_millis(200));
        ticks += 1;
        if ticks >= 25 {
            ticks = 0;
            let published = stats.frames_published.load(Ordering::Relaxed);
            tracing::info!(
                published,
                dropped = stats.frames_dropped.load(Ordering::Relaxed),
                restarts = stats.watchdog_restarts.load(Ordering::Relaxed),
                fps = (published - last_published) / 5,
                "producer stats"
            );
            last_published = published;
        }
    }

    tracing::info!("shutdown signal received");
    thread.stop();
    if unlink_on_exit {
        transport.unlink()?;
        tracing::info!("segment unlinked");
    }
    Ok(())
}

fn run_consumer(
    segment: SegmentArgs,
    poll_interval: Duration,
    count: Option<u64>,
) -> anyhow::Result<()> {
    let config = segment.config();
    let transport = FrameTransport::open(config.clone())
        .with_context(|| format!("opening segment {}", config.shm_name()))?;
    tracing::info!(segment = %config.shm_name(), "consumer running, Ctrl-C to stop");

    let shutdown = shutdown_flag()?;
    let mut out = Vec::new();
    let mut last_version = 0u64;
    let mut seen = 0u64;
    while !shutdown.load(Ordering::Relaxed) {
        match transport.try_read_latest(&mut out) {
            Ok(frame) if frame.version > last_version => {
                last_version = frame.version;
                seen += 1;
                tracing::info!(
                    version = frame.version,
                    format = ?frame.header.format,
                    width = frame.header.width,
                    height = frame.header.height,
                    bytes = out.len(),
                    latency_us = clock::wall_clock_us().saturating_sub(frame.timestamp_us),
                    "frame"
                );
                if count.is_some_and(|c| seen >= c) {
                    break;
                }
            }
            // Same frame as last poll; nothing new to report.
            Ok(_) => {}
            Err(err) if err.is_transient() => {}
            Err(err) => return Err(err.into()),
        }
        std::thread::sleep(poll_interval);
    }

    tracing::info!(frames = seen, "consumer done");
    Ok(())
}
