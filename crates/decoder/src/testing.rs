//! Scriptable fakes for the device boundary.
//!
//! [`FakeM2mDevice`] models the queue mechanics of a real M2M device —
//! per-queue queued/completed lists, streaming state, bounded polls —
//! without any hardware underneath. Behaviour is scripted up front with
//! the `with_*` builders and driven from tests with helpers like
//! [`FakeM2mDevice::complete_capture`]. Public so downstream crates can
//! exercise the engine against the same fakes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use m2m_common::{CropRect, DeviceError, FourCc, PixelLayout, Resolution};

use crate::device::{
    DeviceCandidate, DeviceCaps, DeviceLocator, M2mDevice, MappedBuffer, MemoryKind, PollStatus,
    QueueType, QueuedPlane,
};
use crate::pool::PlaneMemory;

const FALLBACK_PLANE_SIZE: usize = 1 << 16;

#[derive(Default)]
struct QueueState {
    streaming: bool,
    queued: VecDeque<u32>,
    completed: VecDeque<u32>,
    fail_dequeue: Option<String>,
    layout: Option<PixelLayout>,
    crop: Option<CropRect>,
    last_bytes_used: Option<usize>,
}

impl QueueState {
    fn complete(&mut self, n: usize) -> usize {
        let mut moved = 0;
        while moved < n {
            match self.queued.pop_front() {
                Some(index) => {
                    self.completed.push_back(index);
                    moved += 1;
                }
                None => break,
            }
        }
        moved
    }
}

/// In-memory M2M device with scriptable negotiation answers.
pub struct FakeM2mDevice {
    caps: DeviceCaps,
    accepts_linear_capture: bool,
    min_capture_buffers: u32,
    grant_cap: Option<u32>,
    /// Consume OUTPUT buffers the moment they are queued while
    /// streaming, the way a decoder eats bitstream. Toggleable at
    /// runtime to model a device that stops making progress.
    auto_complete_output: AtomicBool,

    output: Mutex<QueueState>,
    capture: Mutex<QueueState>,

    stream_on_calls: AtomicU32,
    set_format_calls: AtomicU32,
    request_buffers_calls: AtomicU32,
    map_calls: AtomicU32,
    min_buffer_queries: AtomicU32,
}

impl Default for FakeM2mDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeM2mDevice {
    /// A decoder-shaped fake: full M2M caps, tiled 1920x1088 picture
    /// format with a 1920x1080 visible crop, and no linear CAPTURE
    /// support (so sessions built on defaults chain a converter).
    pub fn new() -> Self {
        let coded = Resolution::new(1920, 1088);
        let capture = QueueState {
            layout: Some(
                PixelLayout::new(FourCc::NV12MT, coded)
                    .with_plane_sizes(&[coded.width as usize * coded.height as usize, 1920 * 544]),
            ),
            crop: Some(CropRect {
                left: 0,
                top: 0,
                width: 1920,
                height: 1080,
            }),
            ..QueueState::default()
        };
        Self {
            caps: DeviceCaps {
                streaming: true,
                m2m_mplane: true,
                capture_mplane: false,
                output_mplane: false,
            },
            accepts_linear_capture: false,
            min_capture_buffers: 8,
            grant_cap: None,
            auto_complete_output: AtomicBool::new(false),
            output: Mutex::new(QueueState::default()),
            capture: Mutex::new(capture),
            stream_on_calls: AtomicU32::new(0),
            set_format_calls: AtomicU32::new(0),
            request_buffers_calls: AtomicU32::new(0),
            map_calls: AtomicU32::new(0),
            min_buffer_queries: AtomicU32::new(0),
        }
    }

    // ── scripting ────────────────────────────────────────────────

    pub fn with_caps(mut self, caps: DeviceCaps) -> Self {
        self.caps = caps;
        self
    }

    pub fn with_linear_capture(mut self, accepts: bool) -> Self {
        self.accepts_linear_capture = accepts;
        self
    }

    pub fn with_min_capture_buffers(mut self, min: u32) -> Self {
        self.min_capture_buffers = min;
        self
    }

    /// Cap every REQBUFS grant, modelling a driver that hands out
    /// fewer buffers than asked for.
    pub fn with_grant_cap(mut self, cap: u32) -> Self {
        self.grant_cap = Some(cap);
        self
    }

    pub fn with_auto_complete_output(self, enabled: bool) -> Self {
        self.auto_complete_output.store(enabled, Ordering::SeqCst);
        self
    }

    pub fn with_capture_layout(self, layout: PixelLayout) -> Self {
        self.capture.lock().layout = Some(layout);
        self
    }

    pub fn with_capture_crop(self, crop: CropRect) -> Self {
        self.capture.lock().crop = Some(crop);
        self
    }

    // ── test drivers ─────────────────────────────────────────────

    /// Move up to `n` queued CAPTURE buffers to completed, as if the
    /// hardware finished that many pictures. Returns how many moved.
    pub fn complete_capture(&self, n: usize) -> usize {
        self.capture.lock().complete(n)
    }

    /// Move up to `n` queued OUTPUT buffers to completed.
    pub fn complete_output(&self, n: usize) -> usize {
        self.output.lock().complete(n)
    }

    /// Make the next and all further dequeues on a queue fail hard.
    pub fn fail_dequeue(&self, queue: QueueType, reason: &str) {
        self.queue(queue).lock().fail_dequeue = Some(reason.to_string());
    }

    /// Stop (or resume) instantly consuming queued OUTPUT buffers.
    pub fn set_auto_complete_output(&self, enabled: bool) {
        self.auto_complete_output.store(enabled, Ordering::SeqCst);
    }

    /// Plane-0 byte count of the most recent submission on a queue.
    pub fn last_queued_bytes(&self, queue: QueueType) -> Option<usize> {
        self.queue(queue).lock().last_bytes_used
    }

    pub fn queued_len(&self, queue: QueueType) -> usize {
        self.queue(queue).lock().queued.len()
    }

    pub fn completed_len(&self, queue: QueueType) -> usize {
        self.queue(queue).lock().completed.len()
    }

    pub fn is_streaming(&self, queue: QueueType) -> bool {
        self.queue(queue).lock().streaming
    }

    pub fn stream_on_calls(&self) -> u32 {
        self.stream_on_calls.load(Ordering::SeqCst)
    }

    pub fn set_format_calls(&self) -> u32 {
        self.set_format_calls.load(Ordering::SeqCst)
    }

    pub fn request_buffers_calls(&self) -> u32 {
        self.request_buffers_calls.load(Ordering::SeqCst)
    }

    pub fn map_calls(&self) -> u32 {
        self.map_calls.load(Ordering::SeqCst)
    }

    pub fn min_buffer_queries(&self) -> u32 {
        self.min_buffer_queries.load(Ordering::SeqCst)
    }

    fn queue(&self, queue: QueueType) -> &Mutex<QueueState> {
        match queue {
            QueueType::Output => &self.output,
            QueueType::Capture => &self.capture,
        }
    }

    fn plane_sizes(&self, queue: QueueType) -> Vec<usize> {
        let state = self.queue(queue).lock();
        match &state.layout {
            Some(layout) if !layout.planes.is_empty() => {
                layout.planes.iter().map(|p| p.size_image).collect()
            }
            _ => vec![FALLBACK_PLANE_SIZE],
        }
    }

    /// Bounded wait for `ready` to hold, polling the fake queue state.
    fn wait_for(&self, timeout_ms: u32, ready: impl Fn() -> bool) -> PollStatus {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms as u64);
        loop {
            if ready() {
                return PollStatus::Ready;
            }
            if Instant::now() >= deadline {
                return PollStatus::Busy;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}

impl M2mDevice for FakeM2mDevice {
    fn capabilities(&self) -> DeviceCaps {
        self.caps
    }

    fn try_format(&self, queue: QueueType, _layout: &PixelLayout) -> Result<(), DeviceError> {
        if queue == QueueType::Capture && !self.accepts_linear_capture {
            return Err(DeviceError::ioctl("VIDIOC_TRY_FMT", "EINVAL"));
        }
        Ok(())
    }

    fn set_format(
        &self,
        queue: QueueType,
        layout: &PixelLayout,
    ) -> Result<PixelLayout, DeviceError> {
        self.set_format_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.queue(queue).lock();
        state.layout = Some(layout.clone());
        Ok(layout.clone())
    }

    fn format(&self, queue: QueueType) -> Result<PixelLayout, DeviceError> {
        self.queue(queue)
            .lock()
            .layout
            .clone()
            .ok_or_else(|| DeviceError::ioctl("VIDIOC_G_FMT", "no format negotiated"))
    }

    fn min_capture_buffers(&self) -> Result<u32, DeviceError> {
        self.min_buffer_queries.fetch_add(1, Ordering::SeqCst);
        Ok(self.min_capture_buffers)
    }

    fn crop(&self, queue: QueueType) -> Result<CropRect, DeviceError> {
        self.queue(queue)
            .lock()
            .crop
            .ok_or_else(|| DeviceError::ioctl("VIDIOC_G_CROP", "no crop window"))
    }

    fn set_crop(&self, queue: QueueType, crop: CropRect) -> Result<(), DeviceError> {
        self.queue(queue).lock().crop = Some(crop);
        Ok(())
    }

    fn request_buffers(
        &self,
        queue: QueueType,
        _memory: MemoryKind,
        count: u32,
    ) -> Result<u32, DeviceError> {
        self.request_buffers_calls.fetch_add(1, Ordering::SeqCst);
        let granted = match self.grant_cap {
            Some(cap) => count.min(cap),
            None => count,
        };
        let mut state = self.queue(queue).lock();
        state.queued.clear();
        state.completed.clear();
        Ok(granted)
    }

    fn map_buffers(
        &self,
        queue: QueueType,
        _memory: MemoryKind,
        count: u32,
        auto_queue: bool,
    ) -> Result<Vec<MappedBuffer>, DeviceError> {
        self.map_calls.fetch_add(1, Ordering::SeqCst);
        let sizes = self.plane_sizes(queue);
        let mapped = (0..count)
            .map(|index| MappedBuffer {
                index,
                planes: sizes
                    .iter()
                    .map(|&size| Arc::new(PlaneMemory::new(size)))
                    .collect(),
            })
            .collect();
        if auto_queue {
            let mut state = self.queue(queue).lock();
            state.queued.extend(0..count);
        }
        Ok(mapped)
    }

    fn queue_buffer(
        &self,
        queue: QueueType,
        _memory: MemoryKind,
        index: u32,
        planes: &[QueuedPlane],
    ) -> Result<(), DeviceError> {
        let mut state = self.queue(queue).lock();
        state.queued.push_back(index);
        state.last_bytes_used = planes.first().map(|p| p.bytes_used);
        if queue == QueueType::Output
            && self.auto_complete_output.load(Ordering::SeqCst)
            && state.streaming
        {
            state.complete(usize::MAX);
        }
        Ok(())
    }

    fn dequeue_buffer(&self, queue: QueueType, _memory: MemoryKind) -> Result<u32, DeviceError> {
        let mut state = self.queue(queue).lock();
        if let Some(reason) = &state.fail_dequeue {
            return Err(DeviceError::ioctl("VIDIOC_DQBUF", reason.clone()));
        }
        state.completed.pop_front().ok_or(DeviceError::Again)
    }

    fn stream_on(&self, queue: QueueType) -> Result<(), DeviceError> {
        self.stream_on_calls.fetch_add(1, Ordering::SeqCst);
        let mut state = self.queue(queue).lock();
        state.streaming = true;
        if queue == QueueType::Output && self.auto_complete_output.load(Ordering::SeqCst) {
            state.complete(usize::MAX);
        }
        Ok(())
    }

    fn stream_off(&self, queue: QueueType) -> Result<(), DeviceError> {
        let mut state = self.queue(queue).lock();
        state.streaming = false;
        state.queued.clear();
        state.completed.clear();
        Ok(())
    }

    fn free_buffers(&self, queue: QueueType, _memory: MemoryKind) -> Result<(), DeviceError> {
        let mut state = self.queue(queue).lock();
        state.queued.clear();
        state.completed.clear();
        Ok(())
    }

    fn poll_readable(&self, timeout_ms: u32) -> Result<PollStatus, DeviceError> {
        Ok(self.wait_for(timeout_ms, || !self.capture.lock().completed.is_empty()))
    }

    fn poll_writable(&self, timeout_ms: u32) -> Result<PollStatus, DeviceError> {
        Ok(self.wait_for(timeout_ms, || !self.output.lock().completed.is_empty()))
    }
}

/// Locator over a fixed candidate list, in the order given.
pub struct FakeDeviceLocator {
    candidates: Vec<DeviceCandidate>,
}

impl FakeDeviceLocator {
    pub fn new(devices: Vec<(&str, Arc<FakeM2mDevice>)>) -> Self {
        Self {
            candidates: devices
                .into_iter()
                .map(|(driver, device)| DeviceCandidate {
                    driver: driver.to_string(),
                    device: device as Arc<dyn M2mDevice>,
                })
                .collect(),
        }
    }

    pub fn empty() -> Self {
        Self { candidates: Vec::new() }
    }
}

impl DeviceLocator for FakeDeviceLocator {
    fn candidates(&self) -> Result<Vec<DeviceCandidate>, DeviceError> {
        Ok(self.candidates.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dequeue_empty_reports_again() {
        let dev = FakeM2mDevice::new();
        let err = dev
            .dequeue_buffer(QueueType::Capture, MemoryKind::Mmap)
            .unwrap_err();
        assert!(err.is_again());
    }

    #[test]
    fn queue_then_complete_then_dequeue() {
        let dev = FakeM2mDevice::new();
        dev.queue_buffer(QueueType::Capture, MemoryKind::Mmap, 3, &[])
            .unwrap();
        assert_eq!(dev.complete_capture(1), 1);
        let index = dev
            .dequeue_buffer(QueueType::Capture, MemoryKind::Mmap)
            .unwrap();
        assert_eq!(index, 3);
    }

    #[test]
    fn auto_complete_output_consumes_on_stream_on() {
        let dev = FakeM2mDevice::new().with_auto_complete_output(true);
        dev.queue_buffer(QueueType::Output, MemoryKind::Mmap, 0, &[])
            .unwrap();
        assert_eq!(dev.completed_len(QueueType::Output), 0);
        dev.stream_on(QueueType::Output).unwrap();
        assert_eq!(dev.completed_len(QueueType::Output), 1);
    }

    #[test]
    fn grant_cap_limits_reqbufs() {
        let dev = FakeM2mDevice::new().with_grant_cap(4);
        let granted = dev
            .request_buffers(QueueType::Capture, MemoryKind::Mmap, 12)
            .unwrap();
        assert_eq!(granted, 4);
    }

    #[test]
    fn poll_times_out_busy() {
        let dev = FakeM2mDevice::new();
        assert_eq!(dev.poll_readable(5).unwrap(), PollStatus::Busy);
    }

    #[test]
    fn mapped_planes_follow_layout() {
        let dev = FakeM2mDevice::new();
        let mapped = dev
            .map_buffers(QueueType::Capture, MemoryKind::Mmap, 2, false)
            .unwrap();
        assert_eq!(mapped.len(), 2);
        assert_eq!(mapped[0].planes.len(), 2);
        assert_eq!(mapped[0].planes[0].capacity(), 1920 * 1088);
    }
}
