//! Fault taxonomy for the capture engine.
//!
//! Every OS-level fault embeds the failing operation and the underlying
//! errno so it can be diagnosed from the message alone. Transient loop
//! conditions (EINTR on the wait, EAGAIN on a dequeue) are recovered in
//! place and never appear here; a stall is an event, not an error.

use nix::errno::Errno;
use thiserror::Error;

use crate::traits::SessionState;

/// Error type for capture operations.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The path does not refer to a usable video capture device.
    #[error("{0} is not a video capture device")]
    NotACaptureDevice(String),

    /// The character device does not speak the V4L2 ioctl protocol.
    #[error("{0} is not a V4L2 device")]
    NotAV4l2Device(String),

    /// Opening or querying the device failed at the OS level.
    #[error("cannot open {path}: {source}")]
    OpenFailed {
        /// Device path as given by the caller.
        path: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// An operation was called in a state that does not permit it.
    #[error("cannot {op} while session is {state}")]
    InvalidState {
        /// The rejected operation.
        op: &'static str,
        /// The session state at the time of the call.
        state: SessionState,
    },

    /// `VIDIOC_G_FMT` failed.
    #[error("VIDIOC_G_FMT failed: {0}")]
    FormatQueryFailed(#[source] Errno),

    /// The driver granted fewer buffers than streaming requires.
    #[error("insufficient buffer memory: driver granted {granted}, need at least {needed}")]
    InsufficientBuffers {
        /// Buffers the driver actually allocated.
        granted: u32,
        /// Minimum the capture cycle needs.
        needed: u32,
    },

    /// Buffer negotiation or mapping failed.
    #[error("{op} failed: {source}")]
    MappingFailed {
        /// The failing step (`VIDIOC_REQBUFS`, `VIDIOC_QUERYBUF` or `mmap`).
        op: &'static str,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },

    /// One or more buffers could not be unmapped during teardown.
    #[error("munmap failed on {} buffer(s)", .failures.len())]
    UnmapFailed {
        /// (buffer index, errno) per failed unmap.
        failures: Vec<(usize, Errno)>,
    },

    /// `VIDIOC_QBUF` failed while handing a buffer to the driver.
    #[error("VIDIOC_QBUF failed: {0}")]
    EnqueueFailed(#[source] Errno),

    /// `VIDIOC_STREAMON` failed.
    #[error("VIDIOC_STREAMON failed: {0}")]
    StreamOnFailed(#[source] Errno),

    /// `VIDIOC_STREAMOFF` failed; driver state may be inconsistent and the
    /// caller should still proceed to buffer teardown.
    #[error("VIDIOC_STREAMOFF failed: {0}")]
    StreamOffFailed(#[source] Errno),

    /// The readability wait failed for a reason other than a timeout.
    #[error("select failed: {0}")]
    WaitFailed(#[source] Errno),

    /// `VIDIOC_DQBUF` failed with a non-transient error; fatal to the loop.
    #[error("VIDIOC_DQBUF failed: {0}")]
    DequeueFailed(#[source] Errno),

    /// The frame-decode collaborator rejected one payload; the stream
    /// continues.
    #[error("frame decode failed: {0}")]
    DecodeFailed(String),

    /// The acquisition thread could not be spawned.
    #[error("failed to spawn acquisition thread: {0}")]
    SpawnFailed(#[source] std::io::Error),

    /// The acquisition thread terminated abnormally; the buffer table was
    /// reclaimed by teardown and the session must be cleared before reuse.
    #[error("acquisition thread terminated abnormally")]
    LoopPanicked,
}

/// Result type for capture operations.
pub type Result<T> = std::result::Result<T, CaptureError>;
