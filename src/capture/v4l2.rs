//! Single-buffer V4L2 capture over memory-mapped I/O

use std::os::fd::{AsFd, BorrowedFd, RawFd};

use memmap2::{MmapOptions, MmapRaw};
use tracing::{debug, info, instrument, warn};
use v4l::capability::Flags as CapFlags;
use v4l::video::Capture;
use v4l::Device;

use crate::capture::device::{reclaim_when_ready, BufferSlot, CaptureDevice, Dequeued, StopSignal};
use crate::capture::frame::{CaptureFormat, PixelFormat};
use crate::capture::sys::{self, V4l2Buffer, V4l2RequestBuffers, V4L2_BUF_TYPE_VIDEO_CAPTURE};
use crate::error::DeviceError;
use crate::CaptureConfig;

/// Buffer handed out by `allocate`, to be passed to `map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDescriptor {
    pub index: u32,
}

/// The one mapped capture buffer and its lifecycle.
struct MappedBuffer {
    // Declared first so it is unmapped before the device is closed
    mapping: MmapRaw,
    slot: BufferSlot,
}

/// Owns the device, its negotiated format and the single mapped buffer.
pub struct V4l2Device {
    buffer: Option<MappedBuffer>,
    format: Option<CaptureFormat>,
    streaming: bool,
    fd: RawFd,
    device: Device,
    path: String,
}

impl V4l2Device {
    /// Open, negotiate and map according to `config`. The slot is left unarmed.
    pub fn new(config: &CaptureConfig) -> Result<Self, DeviceError> {
        let mut device = Self::open(&config.device)?;
        device.configure(&config.requested_format())?;
        let descriptor = device.allocate(1)?;
        device.map(descriptor)?;
        Ok(device)
    }

    #[instrument]
    pub fn open(path: &str) -> Result<Self, DeviceError> {
        info!("Opening V4L2 device");

        let device = Device::with_path(path).map_err(|source| DeviceError::Open {
            path: path.to_string(),
            source,
        })?;

        let caps = device.query_caps().map_err(|source| DeviceError::Open {
            path: path.to_string(),
            source,
        })?;
        info!("Device: {} ({})", caps.card, caps.driver);

        if !caps.capabilities.contains(CapFlags::VIDEO_CAPTURE) {
            return Err(DeviceError::NotCapable {
                card: caps.card,
                reason: "no video capture support",
            });
        }
        if !caps.capabilities.contains(CapFlags::STREAMING) {
            return Err(DeviceError::NotCapable {
                card: caps.card,
                reason: "no streaming I/O support",
            });
        }

        let fd = device.handle().fd();
        Ok(Self {
            buffer: None,
            format: None,
            streaming: false,
            fd,
            device,
            path: path.to_string(),
        })
    }

    /// Set resolution, encoding and field order. The driver may adjust the
    /// resolution; a different encoding is a rejection.
    #[instrument(skip(self), fields(device = %self.path))]
    pub fn configure(&mut self, requested: &CaptureFormat) -> Result<CaptureFormat, DeviceError> {
        let fourcc = requested.format.fourcc();
        let rejected = |reason: String| DeviceError::UnsupportedFormat {
            requested: format!("{} {}x{}", fourcc, requested.width, requested.height),
            reason,
        };

        let mut fmt = self.device.format().map_err(|e| rejected(e.to_string()))?;
        fmt.width = requested.width;
        fmt.height = requested.height;
        fmt.fourcc = fourcc;
        fmt.field_order = requested.field_order.into();

        let actual = self
            .device
            .set_format(&fmt)
            .map_err(|e| rejected(e.to_string()))?;

        let format = PixelFormat::from_fourcc(actual.fourcc)
            .filter(|f| *f == requested.format)
            .ok_or_else(|| rejected(format!("driver substituted {}", actual.fourcc)))?;

        if actual.width != requested.width || actual.height != requested.height {
            warn!(
                "Driver adjusted resolution to {}x{}",
                actual.width, actual.height
            );
        }

        let negotiated = CaptureFormat {
            width: actual.width,
            height: actual.height,
            format,
            field_order: requested.field_order,
            size_image: actual.size,
        };
        info!("Negotiated format: {:?}", negotiated);
        self.format = Some(negotiated);
        Ok(negotiated)
    }

    /// Request `count` mmap buffers. Anything other than exactly one is refused.
    #[instrument(skip(self), fields(device = %self.path))]
    pub fn allocate(&mut self, count: u32) -> Result<BufferDescriptor, DeviceError> {
        if count != 1 {
            return Err(DeviceError::AllocationFailed(format!(
                "{} buffers requested, single-slot capture needs exactly 1",
                count
            )));
        }

        let mut req = V4l2RequestBuffers::mmap_capture(count);
        let fd = self.fd;
        // SAFETY: `req` is a valid, exclusively borrowed v4l2_requestbuffers.
        sys::xioctl(|| unsafe { sys::vidioc_reqbufs(fd, &mut req) })
            .map_err(|e| DeviceError::AllocationFailed(format!("VIDIOC_REQBUFS: {}", e)))?;

        if req.count != count {
            return Err(DeviceError::AllocationFailed(format!(
                "driver granted {} buffers instead of {}",
                req.count, count
            )));
        }

        debug!("Allocated {} mmap buffer", req.count);
        Ok(BufferDescriptor { index: 0 })
    }

    /// Query the buffer's offset and length and map it shared read/write.
    #[instrument(skip(self), fields(device = %self.path))]
    pub fn map(&mut self, descriptor: BufferDescriptor) -> Result<(), DeviceError> {
        let index = descriptor.index;
        let map_failed = |reason: String| DeviceError::MapFailed { index, reason };

        let mut buf = V4l2Buffer::mmap_capture(index);
        let fd = self.fd;
        // SAFETY: `buf` is a valid, exclusively borrowed v4l2_buffer.
        sys::xioctl(|| unsafe { sys::vidioc_querybuf(fd, &mut buf) })
            .map_err(|e| map_failed(format!("VIDIOC_QUERYBUF: {}", e)))?;

        let length = buf.length as usize;
        let mapping = MmapOptions::new()
            .offset(u64::from(buf.offset()))
            .len(length)
            .map_raw(fd)
            .map_err(|e| map_failed(e.to_string()))?;

        info!(
            "Mapped buffer {} ({} bytes at offset {:#x})",
            index,
            length,
            buf.offset()
        );
        self.buffer = Some(MappedBuffer {
            mapping,
            slot: BufferSlot::new(index, length),
        });
        Ok(())
    }

    /// Arm the slot and turn streaming on.
    pub fn start_stream(&mut self) -> Result<(), DeviceError> {
        let index = self.slot()?.index();
        self.enqueue(index)?;
        self.start()?;
        info!("Capture stream started with 1 buffer");
        Ok(())
    }

    pub fn format(&self) -> Option<CaptureFormat> {
        self.format
    }

    fn slot(&self) -> Result<&BufferSlot, DeviceError> {
        self.buffer
            .as_ref()
            .map(|b| &b.slot)
            .ok_or(DeviceError::UnknownSlot(0))
    }

    fn buffer_mut(&mut self, index: u32) -> Result<&mut MappedBuffer, DeviceError> {
        self.buffer
            .as_mut()
            .filter(|b| b.slot.index() == index)
            .ok_or(DeviceError::UnknownSlot(index))
    }

    fn stream_control(&self, on: bool) -> Result<(), DeviceError> {
        let buf_type = V4L2_BUF_TYPE_VIDEO_CAPTURE as libc::c_int;
        let fd = self.fd;
        // SAFETY: both requests only read the buffer type integer.
        let (action, result) = if on {
            let result = sys::xioctl(|| unsafe { sys::vidioc_streamon(fd, &buf_type) });
            ("VIDIOC_STREAMON", result)
        } else {
            let result = sys::xioctl(|| unsafe { sys::vidioc_streamoff(fd, &buf_type) });
            ("VIDIOC_STREAMOFF", result)
        };
        result
            .map(drop)
            .map_err(|source| DeviceError::StreamControl { action, source })
    }
}

impl CaptureDevice for V4l2Device {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.stream_control(true)?;
        self.streaming = true;
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.stream_control(false)?;
        self.streaming = false;
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.slot.reset();
        }
        Ok(())
    }

    fn enqueue(&mut self, index: u32) -> Result<(), DeviceError> {
        let fd = self.fd;
        let buffer = self.buffer_mut(index)?;
        buffer.slot.check_arm()?;

        let mut buf = V4l2Buffer::mmap_capture(index);
        // SAFETY: `buf` is a valid, exclusively borrowed v4l2_buffer.
        sys::xioctl(|| unsafe { sys::vidioc_qbuf(fd, &mut buf) })
            .map_err(|source| DeviceError::EnqueueFailed { index, source })?;

        buffer.slot.mark_armed();
        Ok(())
    }

    fn dequeue(&mut self, stop: &StopSignal) -> Result<Dequeued, DeviceError> {
        self.slot()?.check_dequeue()?;

        let fd = self.fd;
        let mut buf = V4l2Buffer::mmap_capture(0);
        // The device is opened non-blocking, so DQBUF after a wakeup may still be EAGAIN
        reclaim_when_ready(self.as_fd(), stop, "VIDIOC_DQBUF", || {
            buf = V4l2Buffer::mmap_capture(0);
            // SAFETY: `buf` is a valid, exclusively borrowed v4l2_buffer.
            sys::xioctl(|| unsafe { sys::vidioc_dqbuf(fd, &mut buf) })
        })?;

        let buffer = self.buffer_mut(buf.index)?;
        let bytes_used = buf.bytesused as usize;
        let valid = buffer.slot.mark_filled(bytes_used);
        let corrupted = buf.flags & sys::V4L2_BUF_FLAG_ERROR != 0 || valid < bytes_used;

        Ok(Dequeued {
            index: buf.index,
            bytes_used,
            sequence: buf.sequence,
            timestamp: buf.timestamp(),
            corrupted,
        })
    }

    fn filled(&self, index: u32) -> Result<&[u8], DeviceError> {
        let buffer = self
            .buffer
            .as_ref()
            .filter(|b| b.slot.index() == index)
            .ok_or(DeviceError::UnknownSlot(index))?;
        let len = buffer.slot.valid_len()?;

        // SAFETY: the slot is Filled, so the driver does not write to it until the
        // next enqueue, which needs `&mut self` and so cannot overlap this borrow.
        // `len` is clamped to the mapping length.
        Ok(unsafe { std::slice::from_raw_parts(buffer.mapping.as_ptr(), len) })
    }
}

impl AsFd for V4l2Device {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: `fd` belongs to `self.device`, which lives as long as `self`.
        unsafe { BorrowedFd::borrow_raw(self.fd) }
    }
}

impl Drop for V4l2Device {
    fn drop(&mut self) {
        if self.streaming {
            if let Err(e) = self.stop() {
                warn!("Failed to stop stream on {}: {}", self.path, e);
            }
        }
        if self.buffer.take().is_some() {
            debug!("Unmapped capture buffer of {}", self.path);
        }
    }
}
