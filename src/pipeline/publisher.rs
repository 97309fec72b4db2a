//! Lock-free hand-off of the latest frame to concurrent readers

use std::sync::Arc;

use arc_swap::ArcSwapOption;

use crate::capture::Frame;
use crate::error::NoFrameYet;

/// Latest complete frame, published by the pump and read by any number of
/// request handlers.
///
/// Each publish swaps in a new immutable `Frame`, so a reader holds either the
/// previous snapshot or the new one in full. Readers never wait on the pump
/// and the pump never waits on readers.
#[derive(Clone, Default)]
pub struct FramePublisher {
    latest: Arc<ArcSwapOption<Frame>>,
}

impl FramePublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the current frame. Only the frame pump calls this.
    pub fn publish(&self, frame: Frame) {
        self.latest.store(Some(Arc::new(frame)));
    }

    /// Snapshot of the latest frame. Dropping the `Arc` ends the read.
    pub fn read_latest(&self) -> Result<Arc<Frame>, NoFrameYet> {
        self.latest.load_full().ok_or(NoFrameYet)
    }

    /// Sequence number of the latest frame, if any.
    pub fn latest_sequence(&self) -> Option<u64> {
        let latest = self.latest.load();
        (*latest).as_ref().map(|frame| frame.meta.sequence)
    }
}
