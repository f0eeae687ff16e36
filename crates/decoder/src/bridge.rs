//! Conversion bridge — background relays between decoder and converter.
//!
//! When the decoder cannot produce the caller's linear format, its
//! CAPTURE buffers are routed through the converter. Two threads keep
//! that loop turning for the life of the session:
//!
//! - the **forward relay** dequeues finished decoder CAPTURE buffers
//!   and imports them (by reference, no copy) into the converter's
//!   OUTPUT queue;
//! - the **return relay** dequeues converter OUTPUT buffers the
//!   converter has finished reading and re-queues the matching decoder
//!   CAPTURE slot so the hardware can refill it.
//!
//! Together they form a closed relay: the working set is exactly the
//! decoder CAPTURE pool, and no slot is ever owned by both devices at
//! once.
//!
//! Every wait is a bounded poll. "Busy" and "try again" silently
//! retry; any other device error ends the relay and parks a fault the
//! synchronous paths pick up on their next call. Both threads observe
//! a stop flag at each poll boundary, so teardown can cancel and join
//! them before closing the devices underneath.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use m2m_common::DeviceError;

use crate::device::{M2mDevice, MemoryKind, PollStatus, QueueType};
use crate::pool::BufferPool;

/// A fatal error that terminated one of the relay threads.
#[derive(Clone, Debug)]
pub struct BridgeFault {
    pub task: &'static str,
    pub reason: String,
}

impl std::fmt::Display for BridgeFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} relay: {}", self.task, self.reason)
    }
}

/// Handle to the two running relay threads.
pub struct ConversionBridge {
    stop: Arc<AtomicBool>,
    forward: Option<JoinHandle<()>>,
    ret: Option<JoinHandle<()>>,
    faults: Receiver<BridgeFault>,
    sticky_fault: Mutex<Option<BridgeFault>>,
}

impl ConversionBridge {
    /// Launch both relays. Streaming must already be on for all four
    /// queues involved.
    pub fn spawn(
        decoder: Arc<dyn M2mDevice>,
        converter: Arc<dyn M2mDevice>,
        capture_pool: Arc<Mutex<BufferPool>>,
        import_pool: Arc<Mutex<BufferPool>>,
        poll_timeout_ms: u32,
    ) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        // Capacity 2: one slot per relay, a fault is sent at most once.
        let (tx, faults) = bounded(2);

        let forward = {
            let decoder = decoder.clone();
            let converter = converter.clone();
            let capture_pool = capture_pool.clone();
            let import_pool = import_pool.clone();
            let stop = stop.clone();
            let tx = tx.clone();
            thread::Builder::new()
                .name("m2m-forward-relay".into())
                .spawn(move || {
                    run_relay("forward", tx, || {
                        forward_relay(
                            &*decoder,
                            &*converter,
                            &capture_pool,
                            &import_pool,
                            &stop,
                            poll_timeout_ms,
                        )
                    })
                })
                .expect("spawn forward relay thread")
        };

        let ret = {
            let stop = stop.clone();
            thread::Builder::new()
                .name("m2m-return-relay".into())
                .spawn(move || {
                    run_relay("return", tx, || {
                        return_relay(
                            &*decoder,
                            &*converter,
                            &capture_pool,
                            &import_pool,
                            &stop,
                            poll_timeout_ms,
                        )
                    })
                })
                .expect("spawn return relay thread")
        };

        info!(poll_timeout_ms, "conversion bridge started");

        Self {
            stop,
            forward: Some(forward),
            ret: Some(ret),
            faults,
            sticky_fault: Mutex::new(None),
        }
    }

    /// First fatal fault reported by either relay, if any. Sticky: once
    /// a fault is observed it is returned on every subsequent call.
    pub fn fault(&self) -> Option<BridgeFault> {
        let mut sticky = self.sticky_fault.lock();
        if sticky.is_none() {
            if let Ok(fault) = self.faults.try_recv() {
                *sticky = Some(fault);
            }
        }
        sticky.clone()
    }

    /// Signal both relays to stop and wait for them to exit. Must run
    /// before the devices are torn down underneath the threads.
    pub fn shutdown(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        for handle in [self.forward.take(), self.ret.take()].into_iter().flatten() {
            if handle.join().is_err() {
                error!("relay thread panicked during shutdown");
            }
        }
        debug!("conversion bridge stopped");
    }
}

impl Drop for ConversionBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_relay(task: &'static str, tx: Sender<BridgeFault>, body: impl FnOnce() -> Result<(), String>) {
    match body() {
        Ok(()) => debug!(task, "relay cancelled"),
        Err(reason) => {
            error!(task, %reason, "relay terminated");
            let _ = tx.send(BridgeFault { task, reason });
        }
    }
}

/// Decoder CAPTURE → converter OUTPUT.
fn forward_relay(
    decoder: &dyn M2mDevice,
    converter: &dyn M2mDevice,
    capture_pool: &Mutex<BufferPool>,
    import_pool: &Mutex<BufferPool>,
    stop: &AtomicBool,
    poll_timeout_ms: u32,
) -> Result<(), String> {
    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        match decoder.poll_readable(poll_timeout_ms) {
            Ok(PollStatus::Ready) => {}
            Ok(PollStatus::Busy) => continue,
            Err(e) => return Err(format!("poll decoder CAPTURE: {e}")),
        }

        let index = match decoder.dequeue_buffer(QueueType::Capture, MemoryKind::Mmap) {
            Ok(index) => index,
            Err(DeviceError::Again) => continue,
            Err(e) => return Err(format!("dequeue decoder CAPTURE: {e}")),
        };

        // Take ownership of the slot, then hand its planes to the
        // converter by reference. The import pool is marked before the
        // device call so the return relay can never observe the slot
        // mid-transfer.
        let planes = {
            let mut pool = capture_pool.lock();
            pool.mark_completed(index).map_err(|e| e.to_string())?;
            pool.queued_planes(index).map_err(|e| e.to_string())?
        };
        import_pool
            .lock()
            .mark_queued(index)
            .map_err(|e| e.to_string())?;
        converter
            .queue_buffer(QueueType::Output, MemoryKind::UserPtr, index, &planes)
            .map_err(|e| format!("queue converter OUTPUT: {e}"))?;
        debug!(index, "forwarded decoder frame to converter");
    }
}

/// Converter OUTPUT → decoder CAPTURE.
fn return_relay(
    decoder: &dyn M2mDevice,
    converter: &dyn M2mDevice,
    capture_pool: &Mutex<BufferPool>,
    import_pool: &Mutex<BufferPool>,
    stop: &AtomicBool,
    poll_timeout_ms: u32,
) -> Result<(), String> {
    loop {
        if stop.load(Ordering::SeqCst) {
            return Ok(());
        }
        match converter.poll_writable(poll_timeout_ms) {
            Ok(PollStatus::Ready) => {}
            Ok(PollStatus::Busy) => continue,
            Err(e) => return Err(format!("poll converter OUTPUT: {e}")),
        }

        let index = match converter.dequeue_buffer(QueueType::Output, MemoryKind::UserPtr) {
            Ok(index) => index,
            Err(DeviceError::Again) => continue,
            Err(e) => return Err(format!("dequeue converter OUTPUT: {e}")),
        };

        // The converter is done reading this slot; give it back to the
        // decoder to refill.
        {
            let mut pool = import_pool.lock();
            pool.mark_completed(index).map_err(|e| e.to_string())?;
            pool.mark_free(index).map_err(|e| e.to_string())?;
        }
        let planes = {
            let mut pool = capture_pool.lock();
            pool.mark_queued(index).map_err(|e| e.to_string())?;
            pool.queued_planes(index).map_err(|e| e.to_string())?
        };
        decoder
            .queue_buffer(QueueType::Capture, MemoryKind::Mmap, index, &planes)
            .map_err(|e| format!("queue decoder CAPTURE: {e}"))?;
        debug!(index, "returned converter buffer to decoder");
    }
}
