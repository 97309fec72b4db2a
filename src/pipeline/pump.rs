//! Capture loop: dequeue, publish, re-arm.

use std::io;
use std::time::Instant;

use bytes::Bytes;
use tracing::{debug, error, info, instrument, warn};

use crate::capture::device::{CaptureDevice, Dequeued, StopSignal};
use crate::capture::{Frame, FrameMetadata};
use crate::error::DeviceError;
use crate::pipeline::FramePublisher;

/// Counters returned when the pump stops cleanly.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PumpReport {
    pub frames_published: u64,
    pub frames_skipped: u64,
}

/// Drains the device for the lifetime of the process.
///
/// Owns the device: when `run` returns, streaming has been turned off and the
/// mapped buffer released.
pub struct FramePump<D: CaptureDevice> {
    device: D,
    publisher: FramePublisher,
    stop: StopSignal,
    report: PumpReport,
}

impl<D: CaptureDevice> FramePump<D> {
    pub fn new(device: D, publisher: FramePublisher) -> io::Result<Self> {
        Ok(Self {
            device,
            publisher,
            stop: StopSignal::new()?,
            report: PumpReport::default(),
        })
    }

    /// Handle that interrupts the readiness wait and ends `run`.
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    /// Run until stopped or until the device fails.
    ///
    /// A stop signal is a clean exit. Any other device error is returned; with a
    /// single slot there is nothing to fall back to.
    #[instrument(skip(self), name = "frame_pump")]
    pub fn run(mut self) -> Result<PumpReport, DeviceError> {
        info!("Frame pump running");
        let result = self.pump();

        if let Err(e) = self.device.stop() {
            warn!("Failed to stop stream: {}", e);
        }

        match result {
            Err(DeviceError::Interrupted) => {
                info!(
                    "Frame pump stopped after {} frames",
                    self.report.frames_published
                );
                Ok(self.report)
            }
            Err(e) => {
                error!("Frame pump failed: {}", e);
                Err(e)
            }
            Ok(()) => Ok(self.report),
        }
    }

    fn pump(&mut self) -> Result<(), DeviceError> {
        loop {
            // Blocks without holding anything readers need
            let dequeued = self.device.dequeue(&self.stop)?;
            self.publish(&dequeued)?;
            // Re-arm the slot the driver handed back
            self.device.enqueue(dequeued.index)?;
        }
    }

    fn publish(&mut self, dequeued: &Dequeued) -> Result<(), DeviceError> {
        if dequeued.corrupted {
            self.report.frames_skipped += 1;
            metrics::counter!("camsnap_frames_skipped_total").increment(1);
            warn!(
                "Skipping corrupted frame {} ({} bytes)",
                dequeued.sequence, dequeued.bytes_used
            );
            return Ok(());
        }

        let data = Bytes::copy_from_slice(self.device.filled(dequeued.index)?);
        let sequence = self.report.frames_published + 1;
        let len = data.len();

        self.publisher.publish(Frame {
            data,
            meta: FrameMetadata {
                sequence,
                device_sequence: dequeued.sequence,
                device_timestamp: dequeued.timestamp,
            },
            captured_at: Instant::now(),
        });
        self.report.frames_published = sequence;

        metrics::counter!("camsnap_frames_captured_total").increment(1);
        metrics::counter!("camsnap_bytes_captured_total").increment(len as u64);
        debug!(
            "Published frame {} ({} bytes, device sequence {})",
            sequence, len, dequeued.sequence
        );
        Ok(())
    }
}
