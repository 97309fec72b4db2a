use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use v4l::FourCC;

/// Latest complete frame, immutable once published.
///
/// `data` holds exactly the valid bytes of one dequeue, so its length is the
/// frame's valid length and the two can never be observed apart.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Immutable frame data - can be shared across threads without copying
    pub data: Bytes,

    /// Frame metadata
    pub meta: FrameMetadata,

    /// When the pump published this frame
    pub captured_at: Instant,
}

impl Frame {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Frame metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameMetadata {
    /// Monotonic publish counter, starting at 1
    pub sequence: u64,
    /// Sequence number as counted by the driver
    pub device_sequence: u32,
    pub device_timestamp: Option<Duration>, // Hardware timestamp if available
}

/// Compressed encodings that can be served byte-for-byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Mjpeg,
    Jpeg,
}

impl PixelFormat {
    pub fn fourcc(self) -> FourCC {
        match self {
            PixelFormat::Mjpeg => FourCC::new(b"MJPG"),
            PixelFormat::Jpeg => FourCC::new(b"JPEG"),
        }
    }

    pub fn from_fourcc(fourcc: FourCC) -> Option<Self> {
        match &fourcc.repr {
            b"MJPG" => Some(PixelFormat::Mjpeg),
            b"JPEG" => Some(PixelFormat::Jpeg),
            _ => None,
        }
    }

    /// Content type the serving side advertises for this encoding.
    pub fn mime_type(self) -> &'static str {
        "image/jpeg"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldOrder {
    /// Let the driver choose
    Any,
    Progressive,
}

impl From<FieldOrder> for v4l::format::FieldOrder {
    fn from(order: FieldOrder) -> Self {
        match order {
            FieldOrder::Any => v4l::format::FieldOrder::Any,
            FieldOrder::Progressive => v4l::format::FieldOrder::Progressive,
        }
    }
}

/// Format agreed with the driver at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureFormat {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub field_order: FieldOrder,
    /// Upper bound on a frame's size as reported by the driver
    pub size_image: u32,
}
