//! Fixed-layout V4L2 records and the buffer-protocol ioctls.
//!
//! Field order and widths follow `linux/videodev2.h` exactly. Request codes are
//! derived from `size_of` so they are correct on both 32- and 64-bit targets.
//! Nothing outside `capture::v4l2` should touch these.

use std::mem;
use std::time::Duration;

use libc::{c_int, c_ulong, c_void, timeval};

pub const V4L2_BUF_TYPE_VIDEO_CAPTURE: u32 = 1;
pub const V4L2_MEMORY_MMAP: u32 = 1;

/// Driver flag: the frame was captured but its data may be corrupted.
pub const V4L2_BUF_FLAG_ERROR: u32 = 0x0000_0040;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2Timecode {
    pub type_: u32,
    pub flags: u32,
    pub frames: u8,
    pub seconds: u8,
    pub minutes: u8,
    pub hours: u8,
    pub userbits: [u8; 4],
}

#[repr(C)]
#[derive(Clone, Copy)]
pub union V4l2BufferM {
    pub offset: u32,
    pub userptr: c_ulong,
    pub planes: *mut c_void,
    pub fd: i32,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub struct V4l2Buffer {
    pub index: u32,
    pub type_: u32,
    pub bytesused: u32,
    pub flags: u32,
    pub field: u32,
    pub timestamp: timeval,
    pub timecode: V4l2Timecode,
    pub sequence: u32,
    pub memory: u32,
    pub m: V4l2BufferM,
    pub length: u32,
    pub reserved2: u32,
    pub request_fd: i32,
}

impl V4l2Buffer {
    /// Descriptor for the mmap capture buffer `index`, everything else zeroed.
    pub fn mmap_capture(index: u32) -> Self {
        // SAFETY: every field is an integer, a C timeval, or a union of integers and a
        // raw pointer; all-zero is a valid value for each.
        let mut buf: Self = unsafe { mem::zeroed() };
        buf.index = index;
        buf.type_ = V4L2_BUF_TYPE_VIDEO_CAPTURE;
        buf.memory = V4L2_MEMORY_MMAP;
        buf
    }

    pub fn offset(&self) -> u32 {
        // SAFETY: for V4L2_MEMORY_MMAP buffers the driver fills `m.offset`.
        unsafe { self.m.offset }
    }

    /// Driver capture timestamp. `None` when unset or out of range.
    pub fn timestamp(&self) -> Option<Duration> {
        let secs = u64::try_from(self.timestamp.tv_sec).ok()?;
        let micros = u64::try_from(self.timestamp.tv_usec).ok()?;
        let timestamp = Duration::from_secs(secs) + Duration::from_micros(micros);
        (!timestamp.is_zero()).then_some(timestamp)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct V4l2RequestBuffers {
    pub count: u32,
    pub type_: u32,
    pub memory: u32,
    pub capabilities: u32,
    pub flags: u8,
    pub reserved: [u8; 3],
}

impl V4l2RequestBuffers {
    pub fn mmap_capture(count: u32) -> Self {
        Self {
            count,
            type_: V4L2_BUF_TYPE_VIDEO_CAPTURE,
            memory: V4L2_MEMORY_MMAP,
            ..Default::default()
        }
    }
}

nix::ioctl_readwrite!(vidioc_reqbufs, b'V', 8, V4l2RequestBuffers);
nix::ioctl_readwrite!(vidioc_querybuf, b'V', 9, V4l2Buffer);
nix::ioctl_readwrite!(vidioc_qbuf, b'V', 15, V4l2Buffer);
nix::ioctl_readwrite!(vidioc_dqbuf, b'V', 17, V4l2Buffer);
nix::ioctl_write_ptr!(vidioc_streamon, b'V', 18, c_int);
nix::ioctl_write_ptr!(vidioc_streamoff, b'V', 19, c_int);

/// Issue a control request, retrying while it is interrupted by a signal.
pub fn xioctl<F>(mut request: F) -> nix::Result<c_int>
where
    F: FnMut() -> nix::Result<c_int>,
{
    loop {
        match request() {
            Err(nix::errno::Errno::EINTR) => continue,
            other => return other,
        }
    }
}
