//! Scripted capture device for driving the frame pump without hardware.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::os::fd::AsFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use camsnap::capture::device::{reclaim_when_ready, BufferSlot, CaptureDevice, Dequeued, StopSignal};
use camsnap::DeviceError;
use nix::errno::Errno;
use nix::sys::eventfd::{EfdFlags, EventFd};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Start,
    Stop,
    Enqueue(u32),
    Dequeue(u32, usize),
}

enum Step {
    Frame { data: Vec<u8>, corrupted: bool },
    Fail,
}

struct Shared {
    script: Mutex<VecDeque<Step>>,
    events: Mutex<Vec<Event>>,
    ready: EventFd,
    fail_enqueue: AtomicBool,
    copy_delay: Mutex<Duration>,
    dropped: AtomicBool,
}

/// Single-slot device whose frames come from a script.
pub struct FakeDevice {
    shared: Arc<Shared>,
    slot: BufferSlot,
    memory: Vec<u8>,
    sequence: u32,
}

/// Test-side handle for feeding and inspecting a `FakeDevice`.
#[derive(Clone)]
pub struct FakeController {
    shared: Arc<Shared>,
}

/// A fake whose slot is already armed and streaming, like a device after
/// `start_stream`.
pub fn armed_fake_device(capacity: usize) -> (FakeDevice, FakeController) {
    let shared = Arc::new(Shared {
        script: Mutex::new(VecDeque::new()),
        events: Mutex::new(Vec::new()),
        ready: EventFd::from_value_and_flags(0, EfdFlags::EFD_SEMAPHORE | EfdFlags::EFD_NONBLOCK)
            .expect("eventfd"),
        fail_enqueue: AtomicBool::new(false),
        copy_delay: Mutex::new(Duration::ZERO),
        dropped: AtomicBool::new(false),
    });
    let mut device = FakeDevice {
        shared: shared.clone(),
        slot: BufferSlot::new(0, capacity),
        memory: vec![0; capacity],
        sequence: 0,
    };
    device.enqueue(0).expect("initial enqueue");
    device.start().expect("start");
    (device, FakeController { shared })
}

impl FakeController {
    pub fn push_frame(&self, data: Vec<u8>) {
        self.push(Step::Frame {
            data,
            corrupted: false,
        });
    }

    pub fn push_corrupted(&self, data: Vec<u8>) {
        self.push(Step::Frame {
            data,
            corrupted: true,
        });
    }

    pub fn push_dequeue_failure(&self) {
        self.push(Step::Fail);
    }

    pub fn fail_enqueues(&self) {
        self.shared.fail_enqueue.store(true, Ordering::SeqCst);
    }

    /// Delay applied while the pump copies a filled slot.
    pub fn set_copy_delay(&self, delay: Duration) {
        *self.shared.copy_delay.lock().unwrap() = delay;
    }

    pub fn events(&self) -> Vec<Event> {
        self.shared.events.lock().unwrap().clone()
    }

    pub fn is_dropped(&self) -> bool {
        self.shared.dropped.load(Ordering::SeqCst)
    }

    fn push(&self, step: Step) {
        self.shared.script.lock().unwrap().push_back(step);
        self.shared.ready.arm().expect("signal readiness");
    }
}

impl FakeDevice {
    fn record(&self, event: Event) {
        self.shared.events.lock().unwrap().push(event);
    }
}

impl CaptureDevice for FakeDevice {
    fn start(&mut self) -> Result<(), DeviceError> {
        self.record(Event::Start);
        Ok(())
    }

    fn stop(&mut self) -> Result<(), DeviceError> {
        self.slot.reset();
        self.record(Event::Stop);
        Ok(())
    }

    fn enqueue(&mut self, index: u32) -> Result<(), DeviceError> {
        assert_eq!(index, self.slot.index());
        self.slot.check_arm()?;
        if self.shared.fail_enqueue.load(Ordering::SeqCst) {
            return Err(DeviceError::EnqueueFailed {
                index,
                source: Errno::EIO,
            });
        }
        self.slot.mark_armed();
        self.record(Event::Enqueue(index));
        Ok(())
    }

    fn dequeue(&mut self, stop: &StopSignal) -> Result<Dequeued, DeviceError> {
        self.slot.check_dequeue()?;
        let ready = &self.shared.ready;
        reclaim_when_ready(ready.as_fd(), stop, "eventfd read", || ready.read())?;

        let step = self.shared.script.lock().unwrap().pop_front();
        let (data, corrupted) = match step {
            Some(Step::Frame { data, corrupted }) => (data, corrupted),
            Some(Step::Fail) | None => {
                return Err(DeviceError::DequeueFailed("scripted failure".into()))
            }
        };

        let written = data.len().min(self.memory.len());
        self.memory[..written].copy_from_slice(&data[..written]);
        let valid = self.slot.mark_filled(data.len());
        self.sequence += 1;
        self.record(Event::Dequeue(self.slot.index(), data.len()));

        Ok(Dequeued {
            index: self.slot.index(),
            bytes_used: data.len(),
            sequence: self.sequence,
            timestamp: None,
            corrupted: corrupted || valid < data.len(),
        })
    }

    fn filled(&self, index: u32) -> Result<&[u8], DeviceError> {
        assert_eq!(index, self.slot.index());
        let len = self.slot.valid_len()?;
        let delay = *self.shared.copy_delay.lock().unwrap();
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(&self.memory[..len])
    }
}

impl Drop for FakeDevice {
    fn drop(&mut self) {
        self.shared.dropped.store(true, Ordering::SeqCst);
    }
}

/// Frame content that differs per `seed`.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    condition()
}
