pub mod publisher;
pub mod pump;

pub use publisher::FramePublisher;
pub use pump::{FramePump, PumpReport};
