//! The M2M device boundary.
//!
//! Everything below the orchestration engine — ioctls, mmap, poll — is
//! reached through the [`M2mDevice`] trait, and devices themselves are
//! found through a [`DeviceLocator`]. Production code plugs in a thin
//! V4L2 wrapper; tests plug in [`crate::testing::FakeM2mDevice`].

use std::sync::Arc;

use m2m_common::{CropRect, DeviceError, PixelLayout};

use crate::pool::PlaneMemory;

/// Which side of an M2M device a call addresses.
///
/// OUTPUT is the queue data is fed *into* the device; CAPTURE is the
/// queue results are read *out of*. Both are multi-planar.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum QueueType {
    Output,
    Capture,
}

impl QueueType {
    pub fn name(self) -> &'static str {
        match self {
            Self::Output => "OUTPUT",
            Self::Capture => "CAPTURE",
        }
    }
}

/// How buffer memory for a queue is obtained.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    /// Driver-allocated, memory-mapped into the process.
    Mmap,
    /// Imported by pointer from another pool; the importer never owns it.
    UserPtr,
}

/// Outcome of a bounded queue poll.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PollStatus {
    /// The queue has a buffer ready to dequeue.
    Ready,
    /// The budget elapsed with nothing ready. Transient, not a fault.
    Busy,
}

/// Capability bits reported by a device.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct DeviceCaps {
    pub streaming: bool,
    pub m2m_mplane: bool,
    pub capture_mplane: bool,
    pub output_mplane: bool,
}

impl DeviceCaps {
    /// Whether the device can serve as a pipeline stage: streaming I/O
    /// plus either the combined M2M capability or both mplane halves.
    pub fn supports_m2m_streaming(self) -> bool {
        self.streaming && (self.m2m_mplane || (self.capture_mplane && self.output_mplane))
    }
}

/// One memory-mapped buffer handed back by [`M2mDevice::map_buffers`].
pub struct MappedBuffer {
    pub index: u32,
    pub planes: Vec<Arc<PlaneMemory>>,
}

/// Plane payload for a queue submission: which plane memory to hand the
/// device and how many bytes of it are meaningful.
pub struct QueuedPlane {
    pub memory: Arc<PlaneMemory>,
    pub bytes_used: usize,
}

/// A memory-to-memory transform device with an OUTPUT and a CAPTURE queue.
///
/// This is the edge of the engine: implementations translate these
/// calls to `VIDIOC_*` ioctls and `poll(2)`. The contract mirrors the
/// kernel semantics the engine relies on:
///
/// - `dequeue_buffer` returns [`DeviceError::Again`] when no buffer is
///   ready; that is a normal state, never a fault.
/// - `request_buffers` treats the count as advisory — the driver's
///   granted count is the only truth.
/// - Format/crop negotiation calls may adjust what was asked for; the
///   returned layout is what the driver committed to.
pub trait M2mDevice: Send + Sync {
    fn capabilities(&self) -> DeviceCaps;

    /// Non-committing format probe (TRY_FMT): does the device accept
    /// this layout on the given queue?
    fn try_format(&self, queue: QueueType, layout: &PixelLayout) -> Result<(), DeviceError>;

    /// Commit a format (S_FMT). Returns the layout the driver settled on.
    fn set_format(
        &self,
        queue: QueueType,
        layout: &PixelLayout,
    ) -> Result<PixelLayout, DeviceError>;

    /// Read back the currently negotiated format (G_FMT).
    fn format(&self, queue: QueueType) -> Result<PixelLayout, DeviceError>;

    /// Minimum number of CAPTURE buffers the hardware needs to make
    /// progress (G_CTRL MIN_BUFFERS_FOR_CAPTURE). Only meaningful after
    /// OUTPUT streaming has started and the header has been parsed.
    fn min_capture_buffers(&self) -> Result<u32, DeviceError>;

    /// Visible picture rectangle on a queue (G_CROP).
    fn crop(&self, queue: QueueType) -> Result<CropRect, DeviceError>;

    /// Set the crop window on a queue (S_CROP).
    fn set_crop(&self, queue: QueueType, crop: CropRect) -> Result<(), DeviceError>;

    /// Ask the driver for `count` buffers on a queue (REQBUFS).
    /// Returns the count actually granted.
    fn request_buffers(
        &self,
        queue: QueueType,
        memory: MemoryKind,
        count: u32,
    ) -> Result<u32, DeviceError>;

    /// Map `count` previously requested buffers. With `auto_queue` each
    /// buffer is queued to the device as soon as it is mapped, so the
    /// hardware can start filling the pool immediately.
    fn map_buffers(
        &self,
        queue: QueueType,
        memory: MemoryKind,
        count: u32,
        auto_queue: bool,
    ) -> Result<Vec<MappedBuffer>, DeviceError>;

    /// Hand one buffer to the device (QBUF).
    fn queue_buffer(
        &self,
        queue: QueueType,
        memory: MemoryKind,
        index: u32,
        planes: &[QueuedPlane],
    ) -> Result<(), DeviceError>;

    /// Take one finished buffer back from the device (DQBUF). Returns
    /// the buffer's pool index, or [`DeviceError::Again`].
    fn dequeue_buffer(&self, queue: QueueType, memory: MemoryKind) -> Result<u32, DeviceError>;

    fn stream_on(&self, queue: QueueType) -> Result<(), DeviceError>;

    fn stream_off(&self, queue: QueueType) -> Result<(), DeviceError>;

    /// Release all buffers on a queue (REQBUFS 0). Best-effort teardown.
    fn free_buffers(&self, queue: QueueType, memory: MemoryKind) -> Result<(), DeviceError>;

    /// Wait up to `timeout_ms` for the CAPTURE queue to become readable.
    fn poll_readable(&self, timeout_ms: u32) -> Result<PollStatus, DeviceError>;

    /// Wait up to `timeout_ms` for the OUTPUT queue to have a consumed
    /// buffer ready for dequeue.
    fn poll_writable(&self, timeout_ms: u32) -> Result<PollStatus, DeviceError>;
}

/// One enumerated device: its driver name plus an opened handle.
#[derive(Clone)]
pub struct DeviceCandidate {
    pub driver: String,
    pub device: Arc<dyn M2mDevice>,
}

impl std::fmt::Debug for DeviceCandidate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceCandidate")
            .field("driver", &self.driver)
            .field("caps", &self.device.capabilities())
            .finish()
    }
}

/// Capability query interface over the system's device registry.
///
/// Selection is first-match in enumeration order; the engine makes a
/// single pass and never scores candidates against each other.
pub trait DeviceLocator {
    fn candidates(&self) -> Result<Vec<DeviceCandidate>, DeviceError>;
}
