//! Steady-state buffer protocol shared by every capture backend.

use std::io;
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::eventfd::{EfdFlags, EventFd};
use tracing::warn;

use crate::error::DeviceError;

/// The enqueue/dequeue protocol the frame pump drives.
///
/// Startup (format negotiation, allocation, mapping) is backend specific and
/// happens before a device is handed to the pump.
pub trait CaptureDevice: Send {
    /// Turn streaming on.
    fn start(&mut self) -> Result<(), DeviceError>;

    /// Turn streaming off. Safe to call more than once.
    fn stop(&mut self) -> Result<(), DeviceError>;

    /// Hand slot `index` to the device for writing.
    fn enqueue(&mut self, index: u32) -> Result<(), DeviceError>;

    /// Block in the readiness wait until a slot has been filled, then reclaim it.
    fn dequeue(&mut self, stop: &StopSignal) -> Result<Dequeued, DeviceError>;

    /// Valid bytes of a filled slot.
    fn filled(&self, index: u32) -> Result<&[u8], DeviceError>;
}

/// Result of a successful dequeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dequeued {
    pub index: u32,
    /// Byte count reported by the driver
    pub bytes_used: usize,
    pub sequence: u32,
    pub timestamp: Option<Duration>,
    /// Driver flagged the data as bad, or reported more bytes than the slot holds
    pub corrupted: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Mapped but not yet handed to the device
    Unarmed,
    /// Owned by the device; hardware may write at any time
    Armed,
    /// Reclaimed from the device; safe to read
    Filled { bytes_used: usize },
}

/// Lifecycle bookkeeping for one mapped buffer.
#[derive(Debug)]
pub struct BufferSlot {
    index: u32,
    length: usize,
    state: SlotState,
}

impl BufferSlot {
    pub fn new(index: u32, length: usize) -> Self {
        Self {
            index,
            length,
            state: SlotState::Unarmed,
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn state(&self) -> SlotState {
        self.state
    }

    pub fn check_arm(&self) -> Result<(), DeviceError> {
        match self.state {
            SlotState::Unarmed | SlotState::Filled { .. } => Ok(()),
            SlotState::Armed => Err(self.invalid("enqueue")),
        }
    }

    pub fn mark_armed(&mut self) {
        self.state = SlotState::Armed;
    }

    pub fn check_dequeue(&self) -> Result<(), DeviceError> {
        match self.state {
            SlotState::Armed => Ok(()),
            _ => Err(self.invalid("dequeue")),
        }
    }

    /// Record a dequeue. Returns the number of bytes that are actually readable.
    pub fn mark_filled(&mut self, bytes_used: usize) -> usize {
        let valid = bytes_used.min(self.length);
        self.state = SlotState::Filled { bytes_used: valid };
        valid
    }

    /// Valid length of a filled slot.
    pub fn valid_len(&self) -> Result<usize, DeviceError> {
        match self.state {
            SlotState::Filled { bytes_used } => Ok(bytes_used),
            _ => Err(self.invalid("be read")),
        }
    }

    /// Streaming off returns every buffer to the application.
    pub fn reset(&mut self) {
        self.state = SlotState::Unarmed;
    }

    fn invalid(&self, op: &'static str) -> DeviceError {
        DeviceError::InvalidSlotState {
            index: self.index,
            op,
            state: self.state,
        }
    }
}

/// Cancellation channel for the readiness wait.
///
/// Backed by an eventfd so a blocked `poll` wakes immediately. Once stopped it
/// stays stopped.
#[derive(Clone)]
pub struct StopSignal {
    inner: Arc<StopInner>,
}

struct StopInner {
    stopped: AtomicBool,
    wake: EventFd,
}

impl StopSignal {
    pub fn new() -> io::Result<Self> {
        let wake =
            EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK)?;
        Ok(Self {
            inner: Arc::new(StopInner {
                stopped: AtomicBool::new(false),
                wake,
            }),
        })
    }

    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.inner.wake.arm() {
            warn!("Failed to wake readiness wait: {}", e);
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::Acquire)
    }
}

impl AsFd for StopSignal {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.inner.wake.as_fd()
    }
}

/// Block until `fd` is readable or `stop` fires. Never spins.
pub fn wait_readable(fd: BorrowedFd<'_>, stop: &StopSignal) -> Result<(), DeviceError> {
    loop {
        if stop.is_stopped() {
            return Err(DeviceError::Interrupted);
        }

        let mut fds = [
            PollFd::new(fd, PollFlags::POLLIN),
            PollFd::new(stop.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(DeviceError::DequeueFailed(format!("poll: {}", e))),
        }

        let woken = fds[1].revents().is_some_and(|r| !r.is_empty());
        if woken || stop.is_stopped() {
            return Err(DeviceError::Interrupted);
        }

        let revents = fds[0].revents().unwrap_or(PollFlags::empty());
        if revents.intersects(PollFlags::POLLERR | PollFlags::POLLHUP | PollFlags::POLLNVAL) {
            return Err(DeviceError::DequeueFailed(format!(
                "device reported {:?}",
                revents
            )));
        }
        if revents.contains(PollFlags::POLLIN) {
            return Ok(());
        }
    }
}

/// Wait for readiness, then run `reclaim`. EAGAIN from `reclaim` is a spurious
/// wakeup and goes back to waiting; any other errno is a `DequeueFailed`.
pub fn reclaim_when_ready<T, F>(
    fd: BorrowedFd<'_>,
    stop: &StopSignal,
    what: &str,
    mut reclaim: F,
) -> Result<T, DeviceError>
where
    F: FnMut() -> nix::Result<T>,
{
    loop {
        wait_readable(fd, stop)?;
        match reclaim() {
            Err(Errno::EAGAIN) => continue,
            Err(e) => return Err(DeviceError::DequeueFailed(format!("{}: {}", what, e))),
            Ok(value) => return Ok(value),
        }
    }
}
