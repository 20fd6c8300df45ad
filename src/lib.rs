//! USB video capture engine built directly on the V4L2 memory-mapped
//! streaming contract.
//!
//! A [`DeviceSession`] owns the device handle and the kernel-shared buffer
//! table; a dedicated acquisition thread cycles wait/dequeue/dispatch/
//! re-queue and hands decoded frames to the consumer over an event channel.
//! A device that goes silent is detected by a bounded readability wait and
//! recovered by rebuilding the buffer table from scratch, without restarting
//! the process.

pub mod device;
pub mod error;
pub mod traits;
pub mod validation;

mod capture;
mod v4l2;

#[cfg(test)]
pub mod mock;

pub use device::{DeviceSession, DEFAULT_BUFFER_COUNT, MIN_BUFFERS, WAIT_TIMEOUT};
pub use error::{CaptureError, Result};
pub use traits::{
    BufferOwner, CaptureEvent, CaptureQueue, DecodedFrame, DeviceCapabilities, FilledBuffer,
    Format, FourCC, FrameDecoder, Readiness, SessionState,
};
