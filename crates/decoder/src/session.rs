//! Decode session — the synchronous face of the pipeline.
//!
//! A [`DecodeSession`] owns one decoder device and, when the decoder
//! cannot emit the caller's linear format, one converter device chained
//! behind it. The caller drives it with three calls:
//!
//! - [`submit`](DecodeSession::submit) feeds coded bitstream chunks in;
//! - [`retrieve`](DecodeSession::retrieve) takes finished pictures out;
//! - [`release`](DecodeSession::release) returns a picture's buffer so
//!   the hardware can reuse it.
//!
//! The first `submit` carries the stream header and runs the one-time
//! negotiation sequence: only after the decoder has parsed the header
//! does it know the coded geometry, so the CAPTURE side (and the whole
//! converter stage) cannot be configured at open time.
//!
//! ## Pool ownership
//!
//! The OUTPUT pool belongs to the session alone; no background thread
//! touches it. The decoder CAPTURE pool and the converter's import
//! pool are shared with the [`ConversionBridge`] relays and live behind
//! `Arc<Mutex<_>>`. The converter's own CAPTURE pool is again
//! session-only, since retrieval and release are synchronous.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use m2m_common::{
    CropRect, DecodeError, DecodeResult, DeviceError, FourCc, PixelLayout, PoolError,
    SessionConfig,
};

use crate::bridge::ConversionBridge;
use crate::device::{DeviceLocator, M2mDevice, MemoryKind, PollStatus, QueueType, QueuedPlane};
use crate::pool::{BufferPool, PlaneMemory};

/// One decoded picture, borrowed from a CAPTURE pool.
///
/// The planes stay valid until [`DecodeSession::release`] hands the
/// slot back; `index` is the opaque handle that call expects.
#[derive(Debug)]
pub struct DecodedFrame {
    pub index: u32,
    pub planes: Vec<Arc<PlaneMemory>>,
}

pub struct DecodeSession {
    config: SessionConfig,
    decoder: Arc<dyn M2mDevice>,
    converter: Option<Arc<dyn M2mDevice>>,

    /// Coded-stream slots. Session-owned, never shared.
    output_pool: BufferPool,
    /// Decoder CAPTURE slots, shared with the bridge when chaining.
    capture_pool: Option<Arc<Mutex<BufferPool>>>,
    /// Converter OUTPUT mirror of the CAPTURE pool (imported planes).
    import_pool: Option<Arc<Mutex<BufferPool>>>,
    /// Converter CAPTURE slots, session-owned.
    converter_capture_pool: Option<BufferPool>,

    bridge: Option<ConversionBridge>,

    /// Geometry the decoder settled on after header parsing.
    picture_layout: Option<PixelLayout>,
    picture_crop: Option<CropRect>,

    header_done: bool,
    closed: bool,
}

impl std::fmt::Debug for DecodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecodeSession")
            .field("config", &self.config)
            .field("has_converter", &self.converter.is_some())
            .field("picture_layout", &self.picture_layout)
            .field("picture_crop", &self.picture_crop)
            .field("header_done", &self.header_done)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl DecodeSession {
    /// Enumerate devices once, pick the pipeline stages and commit the
    /// OUTPUT side. Selection is first-match in enumeration order; any
    /// failure tears the partial session down and reports the stage
    /// that failed.
    pub fn open(locator: &dyn DeviceLocator, config: SessionConfig) -> DecodeResult<Self> {
        let candidates = locator.candidates()?;

        let decoder = candidates
            .iter()
            .find(|c| {
                c.driver.contains(&config.decoder_driver)
                    && c.device.capabilities().supports_m2m_streaming()
            })
            .map(|c| c.device.clone())
            .ok_or(DecodeError::NoDevice { role: "decoder" })?;

        // Non-committing probe: can the decoder hand us linear NV12M
        // directly, or does the stream need a converter stage?
        let linear = PixelLayout::new(FourCc::NV12M, config.target);
        let needs_conversion = decoder.try_format(QueueType::Capture, &linear).is_err();

        let converter = if needs_conversion {
            let found = candidates
                .iter()
                .find(|c| {
                    config
                        .converter_driver
                        .iter()
                        .all(|pat| c.driver.contains(pat))
                        && c.device.capabilities().supports_m2m_streaming()
                })
                .map(|c| c.device.clone())
                .ok_or(DecodeError::NoDevice { role: "converter" })?;
            Some(found)
        } else {
            None
        };

        info!(
            codec = config.codec.display_name(),
            needs_conversion, "decode session opening"
        );

        // Coded bitstream side: fixed-capacity single-plane buffers.
        let stream_layout =
            PixelLayout::stream(config.codec.fourcc(), config.stream_buffer_size);
        decoder
            .set_format(QueueType::Output, &stream_layout)
            .map_err(|e| DecodeError::setup("S_FMT OUTPUT", e))?;

        // Without a converter the decoder's CAPTURE format is committed
        // up front; with one, geometry waits for header parsing.
        if !needs_conversion {
            decoder
                .set_format(QueueType::Capture, &linear)
                .map_err(|e| DecodeError::setup("S_FMT CAPTURE", e))?;
        }

        let granted = decoder
            .request_buffers(
                QueueType::Output,
                MemoryKind::Mmap,
                config.output_buffer_count,
            )
            .map_err(|e| DecodeError::setup("REQBUFS OUTPUT", e))?;
        let mapped = decoder
            .map_buffers(QueueType::Output, MemoryKind::Mmap, granted, false)
            .map_err(|e| DecodeError::setup("map OUTPUT", e))?;
        debug!(granted, "OUTPUT pool mapped");

        Ok(Self {
            config,
            decoder,
            converter,
            output_pool: BufferPool::from_mapped("decoder OUTPUT", mapped, false),
            capture_pool: None,
            import_pool: None,
            converter_capture_pool: None,
            bridge: None,
            picture_layout: None,
            picture_crop: None,
            header_done: false,
            closed: false,
        })
    }

    /// Whether a converter stage is chained behind the decoder.
    pub fn is_chaining(&self) -> bool {
        self.converter.is_some()
    }

    /// Coded picture geometry, known once the header has been parsed.
    pub fn picture_layout(&self) -> Option<&PixelLayout> {
        self.picture_layout.as_ref()
    }

    /// Visible rectangle within the coded picture.
    pub fn picture_crop(&self) -> Option<CropRect> {
        self.picture_crop
    }

    // ── submit ───────────────────────────────────────────────────

    /// Feed one coded unit (header or frame) into the pipeline.
    ///
    /// `chunks` are concatenated into a single OUTPUT plane. The first
    /// call runs header processing; for codecs that carry parameter
    /// sets the header consumes the whole call, while H.263 streams
    /// have no out-of-band header and the same data is re-submitted as
    /// the first frame.
    pub fn submit(&mut self, chunks: &[&[u8]]) -> DecodeResult<()> {
        self.ensure_live()?;

        if !self.header_done {
            self.process_header(chunks)?;
            self.header_done = true;
            if self.config.codec.has_parameter_sets() {
                return Ok(());
            }
        }

        self.submit_frame(chunks)
    }

    /// Queue `chunks` into the lowest free OUTPUT slot, reclaiming one
    /// from the device if the pool is saturated. A poll that runs out
    /// its budget is a hard error: the device has stopped consuming.
    fn submit_frame(&mut self, chunks: &[&[u8]]) -> DecodeResult<()> {
        let index = match self.output_pool.first_free() {
            Some(index) => index,
            None => {
                match self.decoder.poll_writable(self.config.poll_timeout_ms)? {
                    PollStatus::Ready => {}
                    PollStatus::Busy => {
                        return Err(DeviceError::PollTimeout {
                            timeout_ms: self.config.poll_timeout_ms,
                        }
                        .into())
                    }
                }
                let index = self
                    .decoder
                    .dequeue_buffer(QueueType::Output, MemoryKind::Mmap)?;
                self.output_pool.mark_completed(index)?;
                self.output_pool.mark_free(index)?;
                index
            }
        };

        let written = self.output_pool.fill_plane(index, chunks)?;
        let planes = self.output_pool.queued_planes(index)?;
        self.decoder
            .queue_buffer(QueueType::Output, MemoryKind::Mmap, index, &planes)?;
        self.output_pool.mark_queued(index)?;
        debug!(index, written, "coded unit queued");
        Ok(())
    }

    /// One-time negotiation driven by the stream header. The header is
    /// queued first so the decoder can parse it; everything downstream
    /// of the parse (CAPTURE geometry, converter stage, relay threads)
    /// follows, and finally the consumed header slot is reclaimed.
    fn process_header(&mut self, chunks: &[&[u8]]) -> DecodeResult<()> {
        self.submit_frame(chunks)?;
        self.decoder
            .stream_on(QueueType::Output)
            .map_err(|e| DecodeError::setup("STREAMON OUTPUT", e))?;

        let layout = self
            .decoder
            .format(QueueType::Capture)
            .map_err(|e| DecodeError::setup("G_FMT CAPTURE", e))?;
        info!(
            fourcc = %layout.fourcc,
            width = layout.resolution.width,
            height = layout.resolution.height,
            "decoder committed picture format"
        );

        if let Some(converter) = &self.converter {
            converter
                .set_format(QueueType::Output, &layout)
                .map_err(|e| DecodeError::setup("converter S_FMT OUTPUT", e))?;
        }

        let min = self
            .decoder
            .min_capture_buffers()
            .map_err(|e| DecodeError::setup("G_CTRL min buffers", e))?;
        let want = scaled_capture_count(min, self.config.capture_headroom);

        let crop = self
            .decoder
            .crop(QueueType::Capture)
            .map_err(|e| DecodeError::setup("G_CROP CAPTURE", e))?;
        if let Some(converter) = &self.converter {
            converter
                .set_crop(QueueType::Output, crop)
                .map_err(|e| DecodeError::setup("converter S_CROP OUTPUT", e))?;
        }

        let granted = self
            .decoder
            .request_buffers(QueueType::Capture, MemoryKind::Mmap, want)
            .map_err(|e| DecodeError::setup("REQBUFS CAPTURE", e))?;
        let mapped = self
            .decoder
            .map_buffers(QueueType::Capture, MemoryKind::Mmap, granted, true)
            .map_err(|e| DecodeError::setup("map CAPTURE", e))?;
        info!(min, want, granted, "CAPTURE pool mapped and queued");
        let capture_pool = Arc::new(Mutex::new(BufferPool::from_mapped(
            "decoder CAPTURE",
            mapped,
            true,
        )));
        self.decoder
            .stream_on(QueueType::Capture)
            .map_err(|e| DecodeError::setup("STREAMON CAPTURE", e))?;

        if let Some(converter) = self.converter.clone() {
            let import_pool = Arc::new(Mutex::new(BufferPool::import_from(
                "converter OUTPUT",
                &capture_pool.lock(),
            )));
            converter
                .request_buffers(QueueType::Output, MemoryKind::UserPtr, granted)
                .map_err(|e| DecodeError::setup("converter REQBUFS OUTPUT", e))?;

            let target = PixelLayout::new(self.config.target_fourcc, self.config.target);
            converter
                .set_format(QueueType::Capture, &target)
                .map_err(|e| DecodeError::setup("converter S_FMT CAPTURE", e))?;
            converter
                .set_crop(QueueType::Capture, CropRect::full(self.config.target))
                .map_err(|e| DecodeError::setup("converter S_CROP CAPTURE", e))?;
            let conv_granted = converter
                .request_buffers(
                    QueueType::Capture,
                    MemoryKind::Mmap,
                    self.config.converter_buffer_count,
                )
                .map_err(|e| DecodeError::setup("converter REQBUFS CAPTURE", e))?;
            let conv_mapped = converter
                .map_buffers(QueueType::Capture, MemoryKind::Mmap, conv_granted, true)
                .map_err(|e| DecodeError::setup("converter map CAPTURE", e))?;
            self.converter_capture_pool = Some(BufferPool::from_mapped(
                "converter CAPTURE",
                conv_mapped,
                true,
            ));

            converter
                .stream_on(QueueType::Output)
                .map_err(|e| DecodeError::setup("converter STREAMON OUTPUT", e))?;
            converter
                .stream_on(QueueType::Capture)
                .map_err(|e| DecodeError::setup("converter STREAMON CAPTURE", e))?;

            self.bridge = Some(ConversionBridge::spawn(
                self.decoder.clone(),
                converter,
                capture_pool.clone(),
                import_pool.clone(),
                self.config.poll_timeout_ms,
            ));
            self.import_pool = Some(import_pool);
        }

        self.capture_pool = Some(capture_pool);
        self.picture_layout = Some(layout);
        self.picture_crop = Some(crop);

        // The decoder has consumed the header by now; reclaim its slot
        // so frame submission starts with a full pool.
        match self.decoder.poll_writable(self.config.poll_timeout_ms) {
            Ok(PollStatus::Ready) => {}
            Ok(PollStatus::Busy) => {
                return Err(DecodeError::setup(
                    "header dequeue",
                    DeviceError::PollTimeout {
                        timeout_ms: self.config.poll_timeout_ms,
                    },
                ))
            }
            Err(e) => return Err(DecodeError::setup("header dequeue", e)),
        }
        let header_slot = self
            .decoder
            .dequeue_buffer(QueueType::Output, MemoryKind::Mmap)
            .map_err(|e| DecodeError::setup("header dequeue", e))?;
        self.output_pool.mark_completed(header_slot)?;
        self.output_pool.mark_free(header_slot)?;
        debug!(header_slot, "header consumed");

        Ok(())
    }

    // ── retrieve / release ───────────────────────────────────────

    /// Take one finished picture if any is ready. `Ok(None)` is the
    /// normal "nothing decoded yet" state, never an error.
    pub fn retrieve(&mut self) -> DecodeResult<Option<DecodedFrame>> {
        self.ensure_live()?;
        if !self.header_done {
            return Ok(None);
        }

        if let Some(converter) = self.converter.clone() {
            let index =
                match converter.dequeue_buffer(QueueType::Capture, MemoryKind::Mmap) {
                    Ok(index) => index,
                    Err(e) if e.is_again() => return Ok(None),
                    Err(e) => return Err(e.into()),
                };
            let pool = self
                .converter_capture_pool
                .as_mut()
                .ok_or(DecodeError::Closed)?;
            pool.mark_completed(index)?;
            let planes = pool.plane_memories(index)?;
            Ok(Some(DecodedFrame { index, planes }))
        } else {
            let index = match self
                .decoder
                .dequeue_buffer(QueueType::Capture, MemoryKind::Mmap)
            {
                Ok(index) => index,
                Err(e) if e.is_again() => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            let pool = self.capture_pool.as_ref().ok_or(DecodeError::Closed)?;
            let mut pool = pool.lock();
            pool.mark_completed(index)?;
            let planes = pool.plane_memories(index)?;
            Ok(Some(DecodedFrame { index, planes }))
        }
    }

    /// Hand a retrieved picture's buffer back to the device it came
    /// from. A handle that is out of range or not currently held is a
    /// contract violation.
    pub fn release(&mut self, index: u32) -> DecodeResult<()> {
        self.ensure_live()?;

        if let Some(converter) = self.converter.clone() {
            let pool = self
                .converter_capture_pool
                .as_mut()
                .ok_or(DecodeError::Closed)?;
            let planes = requeue(pool, index)?;
            converter.queue_buffer(QueueType::Capture, MemoryKind::Mmap, index, &planes)?;
        } else {
            let pool = self.capture_pool.as_ref().ok_or(DecodeError::Closed)?;
            let planes = requeue(&mut pool.lock(), index)?;
            self.decoder
                .queue_buffer(QueueType::Capture, MemoryKind::Mmap, index, &planes)?;
        }
        debug!(index, "picture buffer released");
        Ok(())
    }

    // ── teardown ─────────────────────────────────────────────────

    /// Tear the pipeline down in dependency order: stop and join the
    /// relay threads first so nothing races the device calls, then
    /// stream off and free each queue. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Some(mut bridge) = self.bridge.take() {
            bridge.shutdown();
        }

        stream_off_quiet(&*self.decoder, "decoder", QueueType::Output);
        stream_off_quiet(&*self.decoder, "decoder", QueueType::Capture);
        if let Some(converter) = &self.converter {
            stream_off_quiet(&**converter, "converter", QueueType::Output);
            stream_off_quiet(&**converter, "converter", QueueType::Capture);
        }

        free_quiet(&*self.decoder, "decoder", QueueType::Output, MemoryKind::Mmap);
        free_quiet(&*self.decoder, "decoder", QueueType::Capture, MemoryKind::Mmap);
        if let Some(converter) = &self.converter {
            // Imported planes go back by dropping the refcount only.
            free_quiet(&**converter, "converter", QueueType::Output, MemoryKind::UserPtr);
            free_quiet(&**converter, "converter", QueueType::Capture, MemoryKind::Mmap);
        }

        self.import_pool = None;
        self.capture_pool = None;
        self.converter_capture_pool = None;
        info!("decode session closed");
    }

    /// Reject calls on a closed session and surface any relay fault
    /// before touching the devices.
    fn ensure_live(&self) -> DecodeResult<()> {
        if self.closed {
            return Err(DecodeError::Closed);
        }
        if let Some(bridge) = &self.bridge {
            if let Some(fault) = bridge.fault() {
                return Err(DecodeError::BridgeFault(fault.to_string()));
            }
        }
        Ok(())
    }
}

impl Drop for DecodeSession {
    fn drop(&mut self) {
        self.close();
    }
}

/// Validate and flip a held slot back to queued, translating an
/// out-of-range index into the handle error the caller expects.
fn requeue(pool: &mut BufferPool, index: u32) -> DecodeResult<Vec<QueuedPlane>> {
    pool.mark_queued(index).map_err(|e| match e {
        PoolError::IndexOutOfRange { index, .. } => DecodeError::InvalidHandle { index },
        other => other.into(),
    })?;
    Ok(pool.queued_planes(index)?)
}

/// CAPTURE head-room: the driver's minimum scaled up so the caller can
/// hold pictures without starving the decoder.
fn scaled_capture_count(min: u32, factor: f64) -> u32 {
    ((min as f64) * factor).ceil().max(1.0) as u32
}

fn stream_off_quiet(device: &dyn M2mDevice, role: &str, queue: QueueType) {
    if let Err(e) = device.stream_off(queue) {
        warn!(role, queue = queue.name(), error = %e, "stream-off failed");
    }
}

fn free_quiet(device: &dyn M2mDevice, role: &str, queue: QueueType, memory: MemoryKind) {
    if let Err(e) = device.free_buffers(queue, memory) {
        warn!(role, queue = queue.name(), error = %e, "buffer free failed");
    }
}
