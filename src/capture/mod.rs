pub mod device;
pub mod frame;
pub mod sys;
pub mod v4l2;

pub use device::{CaptureDevice, Dequeued, StopSignal};
pub use frame::{CaptureFormat, FieldOrder, Frame, FrameMetadata, PixelFormat};
pub use v4l2::V4l2Device;
