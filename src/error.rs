use nix::errno::Errno;
use thiserror::Error;

use crate::capture::device::SlotState;

/// Errors raised by the capture device and its buffer protocol.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open capture device {path}: {source}")]
    Open {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("device {card} cannot be used: {reason}")]
    NotCapable { card: String, reason: &'static str },

    #[error("device rejected format {requested}: {reason}")]
    UnsupportedFormat { requested: String, reason: String },

    #[error("buffer allocation failed: {0}")]
    AllocationFailed(String),

    #[error("mapping buffer {index} failed: {reason}")]
    MapFailed { index: u32, reason: String },

    #[error("enqueue of buffer {index} failed: {source}")]
    EnqueueFailed {
        index: u32,
        #[source]
        source: Errno,
    },

    #[error("dequeue failed: {0}")]
    DequeueFailed(String),

    #[error("{action} failed: {source}")]
    StreamControl {
        action: &'static str,
        #[source]
        source: Errno,
    },

    #[error("buffer {index} cannot {op} while {state:?}")]
    InvalidSlotState {
        index: u32,
        op: &'static str,
        state: SlotState,
    },

    #[error("no buffer with index {0}")]
    UnknownSlot(u32),

    #[error("readiness wait interrupted by stop signal")]
    Interrupted,
}

impl DeviceError {
    /// True when the pump stopped because it was asked to.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, DeviceError::Interrupted)
    }
}

/// Returned by the publisher before the first frame has been captured.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("no frame has been captured yet")]
pub struct NoFrameYet;
