use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the shared-memory transport.
///
/// Setup failures (`OpenFailed`, `TruncateFailed`, `MapFailed`,
/// `LayoutMismatch`) are fatal for the operation that triggered them and are
/// never retried internally. `AcquireFailed`, `NoDataAvailable` and `Timeout`
/// are expected steady-state conditions on the data path; callers loop or
/// back off.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("failed to open shared memory object {name:?}: {source}")]
    OpenFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("failed to size shared memory object {name:?} to {size} bytes: {source}")]
    TruncateFailed {
        name: String,
        size: usize,
        source: std::io::Error,
    },

    #[error("failed to map shared memory object {name:?}: {source}")]
    MapFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("failed to unlink shared memory object {name:?}: {source}")]
    UnlinkFailed {
        name: String,
        source: std::io::Error,
    },

    #[error("buffer too small: need {required} bytes, have {available}")]
    BufferTooSmall { required: usize, available: usize },

    #[error("segment layout mismatch: {0}")]
    LayoutMismatch(String),

    #[error("no free slot to write (all slots held by readers)")]
    AcquireFailed,

    #[error("no published frame available")]
    NoDataAvailable,

    #[error("frame header mismatch: header declares {header_bytes} payload bytes, slot holds {slot_bytes}")]
    HeaderMismatch {
        header_bytes: usize,
        slot_bytes: usize,
    },

    #[error("unknown pixel format tag {0}")]
    UnknownFormat(u32),

    #[error("invalid arguments: {0}")]
    InvalidArguments(&'static str),

    #[error("deadline elapsed after {0:?} while waiting for data")]
    Timeout(Duration),
}

impl TransportError {
    /// True for conditions that are part of normal data-path flow and should
    /// be handled by retrying or backing off rather than propagated as
    /// failures.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            TransportError::AcquireFailed
                | TransportError::NoDataAvailable
                | TransportError::Timeout(_)
        )
    }
}

/// Errors raised by capture backends.
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to open capture device {path}: {source}")]
    DeviceOpenFailed {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("device {path} does not support video capture streaming")]
    NotACaptureDevice { path: PathBuf },

    #[error("format not supported: requested {requested}, driver offered {granted}")]
    FormatNotSupported { requested: String, granted: String },

    #[error("insufficient capture buffers: requested {requested}, driver granted {granted}")]
    InsufficientBuffers { requested: u32, granted: u32 },

    #[error("failed to start streaming: {source}")]
    StreamOnFailed { source: std::io::Error },

    #[error("failed to dequeue a filled buffer: {source}")]
    DequeueFailed { source: std::io::Error },

    #[error("failed to queue buffer {index}: {source}")]
    QueueFailed {
        index: u32,
        source: std::io::Error,
    },

    #[error("failed to map capture buffer {index}: {source}")]
    BufferMapFailed {
        index: u32,
        source: std::io::Error,
    },

    #[error("capture device is not streaming")]
    NotStreaming,

    #[error("fatal capture error: {0}")]
    Fatal(String),
}
