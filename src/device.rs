//! Device session: handle ownership, buffer negotiation and streaming
//! control.
//!
//! The session owns the device handle and the memory-mapped buffer table.
//! While capturing, the table is moved into the acquisition thread inside a
//! [`StreamQueue`] and handed back at join, so exactly one context can touch
//! it at any time. All driver traffic goes through `crate::v4l2`.

use std::fs::{self, OpenOptions};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, info, warn};
use nix::errno::Errno;

use crate::capture;
use crate::error::{CaptureError, Result};
use crate::traits::{
    BufferOwner, CaptureEvent, CaptureQueue, DeviceCapabilities, FilledBuffer, FourCC, Format,
    FrameDecoder, Readiness, SessionState,
};
use crate::v4l2;

/// Buffers requested from the driver by default.
pub const DEFAULT_BUFFER_COUNT: u32 = 4;

/// Minimum buffers the capture cycle needs (one filling, one processing).
pub const MIN_BUFFERS: u32 = 2;

/// Bounded readability wait; expiry with nothing ready is a stall.
pub const WAIT_TIMEOUT: Duration = Duration::from_millis(500);

/// The open device descriptor. Shared with the acquisition context through
/// an `Arc` for the duration of a capture run only.
#[derive(Debug)]
struct DeviceHandle {
    fd: OwnedFd,
}

impl DeviceHandle {
    fn raw(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// One buffer table entry: a kernel buffer mapped into the process address
/// space, tagged with its current owner.
#[derive(Debug)]
struct MappedBuffer {
    ptr: NonNull<libc::c_void>,
    len: usize,
    owner: BufferOwner,
}

// The mapping is exclusively owned through the buffer table.
unsafe impl Send for MappedBuffer {}

impl MappedBuffer {
    /// The filled prefix of the mapped region, clamped to the mapped length.
    fn filled(&self, bytes_used: usize) -> &[u8] {
        let len = bytes_used.min(self.len);
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr().cast::<u8>(), len) }
    }

    /// Unmap explicitly, reporting the error instead of swallowing it.
    fn unmap(self) -> std::result::Result<(), Errno> {
        let (ptr, len) = (self.ptr, self.len);
        std::mem::forget(self);
        unsafe { v4l2::unmap(ptr, len) }
    }
}

impl Drop for MappedBuffer {
    fn drop(&mut self) {
        // Teardown backstop for exit paths that never reach the explicit
        // unmap (early faults, thread panic).
        if let Err(err) = unsafe { v4l2::unmap(self.ptr, self.len) } {
            warn!("munmap failed during teardown: {err}");
        }
    }
}

/// The buffer table plus the enqueue/dequeue primitives the acquisition
/// loop runs against. Moved into the acquisition thread at start and
/// returned to the session at join.
#[derive(Debug)]
struct StreamQueue {
    handle: Arc<DeviceHandle>,
    table: Vec<MappedBuffer>,
}

impl StreamQueue {
    /// Hand every buffer to the driver in index order.
    fn enqueue_all(&mut self) -> Result<()> {
        for index in 0..self.table.len() {
            #[allow(clippy::cast_possible_truncation)]
            enqueue(self.handle.raw(), index as u32).map_err(CaptureError::EnqueueFailed)?;
            if let Some(entry) = self.table.get_mut(index) {
                entry.owner = BufferOwner::Driver;
            }
        }
        Ok(())
    }

    /// Unmap every entry, collecting failures without aborting the rest.
    fn release(&mut self) -> Vec<(usize, Errno)> {
        let mut failures = Vec::new();
        for (index, buffer) in self.table.drain(..).enumerate() {
            if let Err(err) = buffer.unmap() {
                warn!("munmap of buffer {index} failed: {err}");
                failures.push((index, err));
            }
        }
        failures
    }
}

impl CaptureQueue for StreamQueue {
    fn buffer_count(&self) -> usize {
        self.table.len()
    }

    fn wait_readable(&mut self, timeout: Duration) -> Result<Readiness> {
        match v4l2::wait_readable(self.handle.raw(), timeout) {
            Ok(true) => Ok(Readiness::Ready),
            Ok(false) => Ok(Readiness::TimedOut),
            Err(err) => Err(CaptureError::WaitFailed(err)),
        }
    }

    fn dequeue(&mut self) -> Result<Option<FilledBuffer>> {
        let mut buf = v4l2::v4l2_buffer {
            type_: v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: v4l2::V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        match v4l2::retry_eintr(|| unsafe { v4l2::vidioc_dqbuf(self.handle.raw(), &mut buf) }) {
            Ok(_) => {
                if let Some(entry) = self.table.get_mut(buf.index as usize) {
                    entry.owner = BufferOwner::Application;
                }
                Ok(Some(FilledBuffer {
                    index: buf.index,
                    bytes_used: buf.bytesused,
                }))
            }
            Err(Errno::EAGAIN) => Ok(None),
            Err(err) => Err(CaptureError::DequeueFailed(err)),
        }
    }

    fn requeue(&mut self, index: u32) -> Result<()> {
        enqueue(self.handle.raw(), index).map_err(CaptureError::EnqueueFailed)?;
        if let Some(entry) = self.table.get_mut(index as usize) {
            entry.owner = BufferOwner::Driver;
        }
        Ok(())
    }

    fn frame_data(&self, filled: &FilledBuffer) -> &[u8] {
        let index = filled.index as usize;
        assert!(
            index < self.table.len(),
            "dequeued buffer index {index} outside table of {}",
            self.table.len()
        );
        self.table[index].filled(filled.bytes_used as usize)
    }
}

fn enqueue(fd: RawFd, index: u32) -> std::result::Result<(), Errno> {
    let mut buf = v4l2::v4l2_buffer {
        type_: v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE,
        memory: v4l2::V4L2_MEMORY_MMAP,
        index,
        ..Default::default()
    };
    v4l2::retry_eintr(|| unsafe { v4l2::vidioc_qbuf(fd, &mut buf) }).map(|_| ())
}

/// A single capture device session: open handle, capability snapshot,
/// negotiated geometry, the buffer table and the acquisition thread.
///
/// The controller context drives every state transition; the acquisition
/// context only touches the buffer table through the primitives it was
/// given at start. `stop_capture` joins the thread before any teardown.
#[derive(Debug)]
pub struct DeviceSession {
    path: String,
    handle: Option<Arc<DeviceHandle>>,
    capabilities: Option<DeviceCapabilities>,
    format: Option<Format>,
    state: SessionState,
    requested_buffers: u32,
    wait_timeout: Duration,
    queue: Option<StreamQueue>,
    worker: Option<JoinHandle<StreamQueue>>,
    run: Arc<AtomicBool>,
    events: Sender<CaptureEvent>,
}

impl DeviceSession {
    /// Open and validate a capture device.
    ///
    /// The path must refer to a character-special device; it is opened
    /// nonblocking read-write and must report both video capture and
    /// streaming capability. Returns the session and the receiving end of
    /// its event channel.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<(Self, Receiver<CaptureEvent>)> {
        let path = path.as_ref();
        let display = path.display().to_string();

        let metadata = fs::metadata(path).map_err(|source| CaptureError::OpenFailed {
            path: display.clone(),
            source,
        })?;
        if !metadata.file_type().is_char_device() {
            return Err(CaptureError::NotACaptureDevice(display));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| CaptureError::OpenFailed {
                path: display.clone(),
                source,
            })?;
        let handle = Arc::new(DeviceHandle {
            fd: OwnedFd::from(file),
        });

        let capabilities = query_capabilities(handle.raw(), &display)?;
        if !(capabilities.can_capture && capabilities.can_stream) {
            return Err(CaptureError::NotACaptureDevice(display));
        }

        info!(
            "opened {display}: {} ({})",
            capabilities.card, capabilities.driver
        );
        let (events, receiver) = mpsc::channel();
        let session = Self {
            path: display.clone(),
            handle: Some(handle),
            capabilities: Some(capabilities),
            format: None,
            state: SessionState::Opened,
            requested_buffers: DEFAULT_BUFFER_COUNT,
            wait_timeout: WAIT_TIMEOUT,
            queue: None,
            worker: None,
            run: Arc::new(AtomicBool::new(false)),
            events,
        };
        session.status(format!("successfully opened {display}"));
        Ok((session, receiver))
    }

    /// Capability snapshot taken at open time.
    pub fn capabilities(&self) -> Option<&DeviceCapabilities> {
        self.capabilities.as_ref()
    }

    /// Negotiated frame geometry; available after [`Self::initialize`].
    pub fn format(&self) -> Option<&Format> {
        self.format.as_ref()
    }

    /// Negotiated (width, height); available after [`Self::initialize`].
    pub fn frame_size(&self) -> Option<(u32, u32)> {
        self.format.as_ref().map(|f| (f.width, f.height))
    }

    /// Current lifecycle state.
    pub const fn state(&self) -> SessionState {
        self.state
    }

    /// Whether the acquisition context is still running. After a fatal loop
    /// fault or a stall the session reports [`SessionState::Capturing`]
    /// until the controller reacts, so this is the liveness signal to watch.
    pub fn acquisition_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|worker| !worker.is_finished())
    }

    /// Override the bounded readability wait (default 500 ms).
    pub fn set_wait_timeout(&mut self, timeout: Duration) {
        self.wait_timeout = timeout;
    }

    /// Query the driver's current format and build the memory-mapped buffer
    /// table: request `requested_buffers` (clamped to at least
    /// [`MIN_BUFFERS`]), then query and map each granted buffer.
    ///
    /// On a partial mapping failure the already-mapped entries stay with the
    /// session; call [`Self::clear_buffers`] before retrying.
    pub fn initialize(&mut self, requested_buffers: u32) -> Result<()> {
        self.require(SessionState::Opened, "initialize")?;
        let fd = self.device("initialize")?.raw();
        let format = query_format(fd)?;
        debug!("driver format: {format}");
        self.format = Some(format);
        self.requested_buffers = requested_buffers.max(MIN_BUFFERS);
        self.map_buffers()?;
        self.state = SessionState::Initialized;
        self.status("video initialized".to_owned());
        Ok(())
    }

    fn map_buffers(&mut self) -> Result<()> {
        let handle = Arc::clone(self.device("map buffers")?);

        let mut req = v4l2::v4l2_requestbuffers {
            count: self.requested_buffers,
            type_: v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: v4l2::V4L2_MEMORY_MMAP,
            ..Default::default()
        };
        v4l2::retry_eintr(|| unsafe { v4l2::vidioc_reqbufs(handle.raw(), &mut req) }).map_err(
            |source| CaptureError::MappingFailed {
                op: "VIDIOC_REQBUFS",
                source,
            },
        )?;

        // The driver may grant fewer than requested; below two the capture
        // cycle cannot overlap filling with processing.
        if req.count < MIN_BUFFERS {
            return Err(CaptureError::InsufficientBuffers {
                granted: req.count,
                needed: MIN_BUFFERS,
            });
        }
        debug!(
            "driver granted {} of {} requested buffers",
            req.count, self.requested_buffers
        );

        let mut table = Vec::with_capacity(req.count as usize);
        for index in 0..req.count {
            let mut buf = v4l2::v4l2_buffer {
                type_: v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE,
                memory: v4l2::V4L2_MEMORY_MMAP,
                index,
                ..Default::default()
            };
            if let Err(source) =
                v4l2::retry_eintr(|| unsafe { v4l2::vidioc_querybuf(handle.raw(), &mut buf) })
            {
                self.queue = Some(StreamQueue { handle, table });
                return Err(CaptureError::MappingFailed {
                    op: "VIDIOC_QUERYBUF",
                    source,
                });
            }

            let offset = unsafe { buf.m.offset };
            match v4l2::map_buffer(handle.as_fd(), buf.length as usize, offset) {
                Ok(ptr) => table.push(MappedBuffer {
                    ptr,
                    len: buf.length as usize,
                    owner: BufferOwner::Application,
                }),
                Err(source) => {
                    self.queue = Some(StreamQueue { handle, table });
                    return Err(CaptureError::MappingFailed {
                        op: "mmap",
                        source,
                    });
                }
            }
        }

        self.status(format!("allocated {} buffers", req.count));
        self.queue = Some(StreamQueue { handle, table });
        Ok(())
    }

    /// Enqueue every buffer, issue stream-on and start the acquisition
    /// thread with the given decode collaborator.
    ///
    /// On an enqueue or stream-on fault the partially-enqueued table stays
    /// with the session; stop and clear before retrying.
    pub fn start_capture<D>(&mut self, decoder: D) -> Result<()>
    where
        D: FrameDecoder + Send + 'static,
    {
        if !matches!(
            self.state,
            SessionState::Initialized | SessionState::Stopped
        ) {
            return Err(CaptureError::InvalidState {
                op: "start capture",
                state: self.state,
            });
        }
        let Some(mut queue) = self.queue.take() else {
            return Err(CaptureError::InvalidState {
                op: "start capture",
                state: self.state,
            });
        };

        if let Err(err) = queue.enqueue_all() {
            self.queue = Some(queue);
            return Err(err);
        }
        if let Err(err) = self.stream_on() {
            self.queue = Some(queue);
            return Err(err);
        }

        self.run.store(true, Ordering::Release);
        let run = Arc::clone(&self.run);
        let events = self.events.clone();
        let timeout = self.wait_timeout;
        let spawned = thread::Builder::new()
            .name("capture-loop".to_owned())
            .spawn(move || capture::run_capture_loop(queue, decoder, &run, &events, timeout));
        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                self.state = SessionState::Capturing;
                self.status("capturing started".to_owned());
                Ok(())
            }
            Err(source) => {
                // The un-started closure dropped the table; the mappings were
                // reclaimed by the drop backstop. Leave the stream off.
                self.stream_off().ok();
                Err(CaptureError::SpawnFailed(source))
            }
        }
    }

    /// Signal the acquisition context to stop, **join it**, and only then
    /// issue stream-off.
    ///
    /// Never returns while the acquisition context is still executing a
    /// cycle. On a stream-off fault the session still transitions to
    /// [`SessionState::Stopped`] so teardown remains possible.
    pub fn stop_capture(&mut self) -> Result<()> {
        match self.state {
            SessionState::Capturing => {}
            SessionState::Stopped => return Ok(()),
            _ => {
                return Err(CaptureError::InvalidState {
                    op: "stop capture",
                    state: self.state,
                })
            }
        }
        self.join_acquisition()?;
        self.state = SessionState::Stopped;
        self.stream_off()?;
        self.status("capturing stopped".to_owned());
        Ok(())
    }

    /// Unmap every buffer table entry and release the table.
    ///
    /// Idempotent on an empty table. Per-entry unmap failures are collected
    /// into a single fault without aborting the remaining unmaps.
    pub fn clear_buffers(&mut self) -> Result<()> {
        if self.state == SessionState::Capturing {
            return Err(CaptureError::InvalidState {
                op: "clear buffers",
                state: self.state,
            });
        }
        let Some(mut queue) = self.queue.take() else {
            return Ok(());
        };
        let failures = queue.release();
        drop(queue);
        if matches!(
            self.state,
            SessionState::Initialized | SessionState::Stopped
        ) {
            self.state = SessionState::Opened;
        }
        if failures.is_empty() {
            self.status("buffers released".to_owned());
            Ok(())
        } else {
            Err(CaptureError::UnmapFailed { failures })
        }
    }

    /// Recovery step one: force-stop the acquisition context if it is still
    /// running, issue stream-off best-effort, and tear the buffer table
    /// down completely.
    ///
    /// A stalled driver is not trusted to resume from its existing buffer
    /// table, so recovery always rebuilds from scratch; follow with
    /// [`Self::restart_capture`].
    pub fn clear_stall(&mut self) -> Result<()> {
        info!("{}: clearing stalled stream", self.path);
        self.join_acquisition()?;
        if self.state == SessionState::Capturing {
            self.state = SessionState::Stopped;
            if let Err(err) = self.stream_off() {
                // Teardown must still run against a wedged driver.
                warn!("stream-off during stall recovery failed: {err}");
            }
        }
        self.clear_buffers()
    }

    /// Recovery step two: re-map the buffer table with the originally
    /// requested count and re-run the start sequence.
    pub fn restart_capture<D>(&mut self, decoder: D) -> Result<()>
    where
        D: FrameDecoder + Send + 'static,
    {
        self.require(SessionState::Opened, "restart capture")?;
        if self.format.is_none() {
            // Never initialized; nothing to restart.
            return Err(CaptureError::InvalidState {
                op: "restart capture",
                state: self.state,
            });
        }
        self.map_buffers()?;
        self.state = SessionState::Initialized;
        self.start_capture(decoder)
    }

    /// Release the device handle. Idempotent; any remaining buffer table is
    /// dropped (best-effort unmap) so the descriptor actually closes.
    pub fn close(&mut self) -> Result<()> {
        if self.state == SessionState::Capturing {
            return Err(CaptureError::InvalidState {
                op: "close device",
                state: self.state,
            });
        }
        if self.handle.is_none() {
            return Ok(());
        }
        self.queue = None;
        self.handle = None;
        self.capabilities = None;
        self.format = None;
        self.state = SessionState::Closed;
        info!("{}: device closed", self.path);
        self.status("device closed".to_owned());
        Ok(())
    }

    fn join_acquisition(&mut self) -> Result<()> {
        self.run.store(false, Ordering::Release);
        let Some(worker) = self.worker.take() else {
            return Ok(());
        };
        match worker.join() {
            Ok(queue) => {
                self.queue = Some(queue);
                Ok(())
            }
            Err(_) => Err(CaptureError::LoopPanicked),
        }
    }

    fn stream_on(&self) -> Result<()> {
        let fd = self.device("stream on")?.raw();
        #[allow(clippy::cast_possible_wrap)]
        let kind = v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        v4l2::retry_eintr(|| unsafe { v4l2::vidioc_streamon(fd, &kind) })
            .map(|_| ())
            .map_err(CaptureError::StreamOnFailed)
    }

    fn stream_off(&self) -> Result<()> {
        let fd = self.device("stream off")?.raw();
        #[allow(clippy::cast_possible_wrap)]
        let kind = v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        v4l2::retry_eintr(|| unsafe { v4l2::vidioc_streamoff(fd, &kind) })
            .map(|_| ())
            .map_err(CaptureError::StreamOffFailed)
    }

    fn require(&self, expected: SessionState, op: &'static str) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CaptureError::InvalidState {
                op,
                state: self.state,
            })
        }
    }

    fn device(&self, op: &'static str) -> Result<&Arc<DeviceHandle>> {
        self.handle.as_ref().ok_or(CaptureError::InvalidState {
            op,
            state: self.state,
        })
    }

    fn status(&self, text: String) {
        self.events.send(CaptureEvent::Status(text)).ok();
    }
}

impl Drop for DeviceSession {
    fn drop(&mut self) {
        self.run.store(false, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                warn!("acquisition thread terminated abnormally during teardown");
            }
        }
    }
}

fn query_capabilities(fd: RawFd, path: &str) -> Result<DeviceCapabilities> {
    let mut cap = v4l2::v4l2_capability::default();
    v4l2::retry_eintr(|| unsafe { v4l2::vidioc_querycap(fd, &mut cap) }).map_err(
        |err| match err {
            // EINVAL per the documented contract; modern kernels answer
            // ENOTTY for character devices outside the V4L2 family.
            Errno::EINVAL | Errno::ENOTTY => CaptureError::NotAV4l2Device(path.to_owned()),
            other => CaptureError::OpenFailed {
                path: path.to_owned(),
                source: other.into(),
            },
        },
    )?;
    Ok(DeviceCapabilities {
        driver: text_field(&cap.driver),
        card: text_field(&cap.card),
        bus_info: text_field(&cap.bus_info),
        version: cap.version,
        can_capture: cap.capabilities & v4l2::V4L2_CAP_VIDEO_CAPTURE != 0,
        can_stream: cap.capabilities & v4l2::V4L2_CAP_STREAMING != 0,
    })
}

fn query_format(fd: RawFd) -> Result<Format> {
    let mut fmt = v4l2::v4l2_format {
        type_: v4l2::V4L2_BUF_TYPE_VIDEO_CAPTURE,
        ..Default::default()
    };
    v4l2::retry_eintr(|| unsafe { v4l2::vidioc_g_fmt(fd, &mut fmt) })
        .map_err(CaptureError::FormatQueryFailed)?;
    let pix = unsafe { fmt.fmt.pix };
    Ok(Format {
        width: pix.width,
        height: pix.height,
        fourcc: FourCC::from_u32(pix.pixelformat),
        stride: pix.bytesperline,
        size: pix.sizeimage,
    })
}

fn text_field(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    String::from_utf8_lossy(bytes.get(..end).unwrap_or(bytes)).into_owned()
}
