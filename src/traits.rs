//! Shared data model and the seams between the capture engine and its
//! collaborators: the frame-decode collaborator ([`FrameDecoder`]) and the
//! enqueue/dequeue contract the acquisition loop runs against
//! ([`CaptureQueue`]).

use std::fmt;
use std::time::Duration;

use crate::error::Result;

/// Pixel format representation (e.g., MJPG, YUYV).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FourCC(pub [u8; 4]);

impl FourCC {
    /// Create a new `FourCC` from a 4-byte array.
    #[must_use]
    pub const fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }

    /// MJPEG pixel format (Motion JPEG), the native payload of USB cameras.
    pub const MJPG: Self = Self::new(b"MJPG");
    /// YUYV pixel format (4:2:2 packed).
    pub const YUYV: Self = Self::new(b"YUYV");

    /// Decode the little-endian fourcc integer used by the driver ABI.
    #[must_use]
    pub const fn from_u32(raw: u32) -> Self {
        Self(raw.to_le_bytes())
    }

    /// The little-endian fourcc integer used by the driver ABI.
    #[must_use]
    pub const fn to_u32(self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

impl fmt::Display for FourCC {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            let ch = if byte.is_ascii_graphic() { byte as char } else { '.' };
            write!(f, "{ch}")?;
        }
        Ok(())
    }
}

/// Negotiated frame geometry, snapshot from the driver at initialization.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Format {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format.
    pub fourcc: FourCC,
    /// Bytes per line (stride); zero for compressed formats.
    pub stride: u32,
    /// Driver's worst-case frame size in bytes.
    pub size: u32,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{} {}", self.width, self.height, self.fourcc)
    }
}

/// Device capability snapshot, taken once at open time.
#[derive(Debug, Clone, Default)]
pub struct DeviceCapabilities {
    /// Driver name.
    pub driver: String,
    /// Card/device name.
    pub card: String,
    /// Bus information.
    pub bus_info: String,
    /// Raw driver version from the kernel.
    pub version: u32,
    /// Whether the device can capture video.
    pub can_capture: bool,
    /// Whether the device supports streaming I/O.
    pub can_stream: bool,
}

impl DeviceCapabilities {
    /// Driver version as (major, minor, patch).
    #[must_use]
    pub const fn version_triple(&self) -> (u8, u8, u8) {
        (
            ((self.version >> 16) & 0xFF) as u8,
            ((self.version >> 8) & 0xFF) as u8,
            (self.version & 0xFF) as u8,
        )
    }
}

/// A decoded, displayable image produced by the frame-decode collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    /// Image width in pixels.
    pub width: u32,
    /// Image height in pixels.
    pub height: u32,
    /// Decoder-defined pixel data.
    pub pixels: Vec<u8>,
}

/// Device session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No device handle.
    Closed,
    /// Handle open, capability validated.
    Opened,
    /// Buffer table mapped, geometry readable.
    Initialized,
    /// Streaming with the acquisition context started.
    Capturing,
    /// Streaming stopped, buffer table still mapped.
    Stopped,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Closed => "closed",
            Self::Opened => "opened",
            Self::Initialized => "initialized",
            Self::Capturing => "capturing",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// Ownership tag on a buffer table entry.
///
/// Exactly the buffers currently enqueued to the driver are
/// [`BufferOwner::Driver`]; the two tags partition the table at all times.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOwner {
    /// The driver may write into the buffer.
    Driver,
    /// The application may read and re-queue the buffer.
    Application,
}

/// Events delivered on the session's outbound channel.
///
/// Faults raised inside the acquisition context arrive here; faults from
/// controller operations are returned as `Err` instead.
#[derive(Debug)]
pub enum CaptureEvent {
    /// Success confirmation (device opened, buffers allocated, ...).
    Status(String),
    /// A failure originating in the acquisition context.
    Fault(crate::error::CaptureError),
    /// The bounded wait expired with no frame ready. Raised exactly once;
    /// the acquisition context has exited and the session expects the
    /// clear-stall / restart recovery pair.
    Stall,
    /// One successfully decoded frame.
    Frame(DecodedFrame),
}

/// Frame-decode collaborator: turns one raw compressed payload into a
/// displayable image. Called synchronously from the acquisition context; a
/// failure drops that frame only.
pub trait FrameDecoder {
    /// Decode a single frame payload.
    fn decode(&mut self, data: &[u8]) -> Result<DecodedFrame>;
}

/// Outcome of the bounded readability wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// A filled buffer can be dequeued.
    Ready,
    /// The wait bound expired with nothing ready - a stall.
    TimedOut,
}

/// A dequeued buffer: its table index and the driver-reported fill length.
#[derive(Debug, Clone, Copy)]
pub struct FilledBuffer {
    /// Index into the buffer table.
    pub index: u32,
    /// Bytes the driver filled; at most the mapped length.
    pub bytes_used: u32,
}

/// The enqueue/dequeue contract between the acquisition loop and the buffer
/// table owner. The production implementation drives the memory-mapped
/// driver queue; tests substitute a scripted one. An alternative acquisition
/// strategy (user-pointer, read-based) would implement this same contract.
pub trait CaptureQueue {
    /// Number of entries in the buffer table; fixed for the table's lifetime.
    fn buffer_count(&self) -> usize;

    /// Block until a buffer is ready or `timeout` expires.
    fn wait_readable(&mut self, timeout: Duration) -> Result<Readiness>;

    /// Dequeue one filled buffer. `Ok(None)` means the driver was
    /// momentarily unready (EAGAIN) and the dequeue should be retried
    /// without another wait.
    fn dequeue(&mut self) -> Result<Option<FilledBuffer>>;

    /// Return a buffer to the driver.
    fn requeue(&mut self, index: u32) -> Result<()>;

    /// The filled portion of a dequeued buffer.
    fn frame_data(&self, filled: &FilledBuffer) -> &[u8];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_round_trips_through_driver_encoding() {
        let raw = FourCC::MJPG.to_u32();
        assert_eq!(raw, u32::from_le_bytes(*b"MJPG"));
        assert_eq!(FourCC::from_u32(raw), FourCC::MJPG);
    }

    #[test]
    fn fourcc_display_masks_non_printable_bytes() {
        assert_eq!(FourCC::YUYV.to_string(), "YUYV");
        assert_eq!(FourCC::new(&[0x59, 0x55, 0x01, 0x56]).to_string(), "YU.V");
    }

    #[test]
    fn capability_version_unpacks() {
        let caps = DeviceCapabilities {
            version: (6 << 16) | (1 << 8) | 42,
            ..DeviceCapabilities::default()
        };
        assert_eq!(caps.version_triple(), (6, 1, 42));
    }

    #[test]
    fn session_state_names() {
        assert_eq!(SessionState::Capturing.to_string(), "capturing");
        assert_eq!(SessionState::Closed.to_string(), "closed");
    }
}
