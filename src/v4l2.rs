//! Raw single-planar V4L2 ABI.
//!
//! Everything the kernel contract requires for memory-mapped capture lives
//! here: the `#[repr(C)]` structures exchanged over ioctl, the request
//! definitions, and thin wrappers for the EINTR-retry convention, the bounded
//! readability wait and buffer mapping. Only the subset needed for
//! single-planar `V4L2_MEMORY_MMAP` capture is defined.

#![allow(non_camel_case_types)]

use std::num::NonZeroUsize;
use std::os::fd::{AsFd, BorrowedFd, RawFd};
use std::ptr::NonNull;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::mman::{self, MapFlags, ProtFlags};

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_MEMORY_MMAP: u32 = 1;

pub const V4L2_CAP_VIDEO_CAPTURE: u32 = 0x0000_0001;
pub const V4L2_CAP_STREAMING: u32 = 0x0400_0000;

/// `VIDIOC_QUERYCAP` result.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_capability {
    pub driver: [u8; 16],
    pub card: [u8; 32],
    pub bus_info: [u8; 32],
    pub version: u32,
    pub capabilities: u32,
    pub device_caps: u32,
    pub reserved: [u32; 3],
}

/// Single-planar pixel format geometry.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_pix_format {
    pub width: u32,
    pub height: u32,
    pub pixelformat: u32,
    pub field: u32,
    pub bytesperline: u32,
    pub sizeimage: u32,
    pub colorspace: u32,
    pub priv_: u32,
    pub flags: u32,
    pub ycbcr_enc: u32,
    pub quantization: u32,
    pub xfer_func: u32,
}

/// The `fmt` union of `struct v4l2_format`. Only the single-planar `pix`
/// member is interpreted; `raw_data` pins the 200-byte kernel size and
/// `_align` the 8-byte alignment the pointer-bearing kernel members impose.
#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_format_fmt {
    pub pix: v4l2_pix_format,
    pub raw_data: [u8; 200],
    _align: [u64; 25],
}

/// `VIDIOC_G_FMT` / `VIDIOC_S_FMT` argument.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_format {
    pub type_: u32,
    pub fmt: v4l2_format_fmt,
}

/// `VIDIOC_REQBUFS` argument.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_requestbuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

/// The `m` union of `struct v4l2_buffer`; `offset` is the only member used
/// with `V4L2_MEMORY_MMAP`, `userptr` keeps the union at pointer width.
#[repr(C)]
#[derive(Clone, Copy)]
pub union v4l2_buffer_m {
    pub offset: u32,
    pub userptr: libc::c_ulong,
    pub fd: i32,
}

/// `VIDIOC_QUERYBUF` / `VIDIOC_QBUF` / `VIDIOC_DQBUF` argument.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct v4l2_buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: libc::timeval,
    pub timecode: v4l2_timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: v4l2_buffer_m,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: u32,
}

macro_rules! zeroed_default {
    ($($ty:ty),+ $(,)?) => {
        $(impl Default for $ty {
            // All-zero is a valid kernel-side initial state for this type.
            fn default() -> Self {
                unsafe { std::mem::zeroed() }
            }
        })+
    };
}

zeroed_default!(
    v4l2_capability,
    v4l2_format,
    v4l2_requestbuffers,
    v4l2_buffer,
);

nix::ioctl_read!(vidioc_querycap, b'V', 0, v4l2_capability);
nix::ioctl_readwrite!(vidioc_g_fmt, b'V', 4, v4l2_format);
nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, v4l2_requestbuffers);
nix::ioctl_readwrite!(vidioc_querybuf, b'V', 9, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, v4l2_buffer);
nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, v4l2_buffer);
nix::ioctl_write_ptr!(vidioc_streamon, b'V', 18, libc::c_int);
nix::ioctl_write_ptr!(vidioc_streamoff, b'V', 19, libc::c_int);

/// Retries an ioctl while it fails with `EINTR`.
pub fn retry_eintr<T, F>(mut op: F) -> Result<T, Errno>
where
    F: FnMut() -> Result<T, Errno>,
{
    loop {
        match op() {
            Err(Errno::EINTR) => {}
            other => return other,
        }
    }
}

/// Waits for `fd` to become readable within `timeout` via `select(2)`.
///
/// Returns `Ok(true)` when a descriptor is ready, `Ok(false)` on timeout
/// with nothing ready. An interrupted wait restarts with a fresh timeout.
pub fn wait_readable(fd: RawFd, timeout: Duration) -> Result<bool, Errno> {
    loop {
        let mut fds: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut fds);
            libc::FD_SET(fd, &mut fds);
        }

        #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let ready = unsafe {
            libc::select(
                fd + 1,
                &mut fds,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut tv,
            )
        };
        match ready {
            -1 => {
                let err = Errno::last();
                if err != Errno::EINTR {
                    return Err(err);
                }
            }
            0 => return Ok(false),
            _ => return Ok(true),
        }
    }
}

/// Maps one driver buffer into the process address space.
///
/// `length` and `offset` come from `VIDIOC_QUERYBUF`; the mapping is shared
/// and read-write as the driver model requires.
pub fn map_buffer(
    fd: BorrowedFd<'_>,
    length: usize,
    offset: u32,
) -> Result<NonNull<libc::c_void>, Errno> {
    let length = NonZeroUsize::new(length).ok_or(Errno::EINVAL)?;
    unsafe {
        mman::mmap(
            None,
            length,
            ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
            MapFlags::MAP_SHARED,
            fd.as_fd(),
            libc::off_t::from(offset),
        )
    }
}

/// Unmaps a region previously returned by [`map_buffer`].
///
/// # Safety
///
/// `addr`/`length` must describe a live mapping and nothing may reference it
/// afterwards.
pub unsafe fn unmap(addr: NonNull<libc::c_void>, length: usize) -> Result<(), Errno> {
    unsafe { mman::munmap(addr, length) }
}
