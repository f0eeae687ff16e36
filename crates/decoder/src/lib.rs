//! Buffer-queue orchestration for chained memory-to-memory decode.
//!
//! Hardware stream decoders expose two buffer queues: coded bitstream
//! goes in one side (OUTPUT), decoded pictures come out the other
//! (CAPTURE). Some decoders emit pictures in a tiled layout no consumer
//! can read directly; this crate chains a second M2M device behind the
//! decoder and relays pictures through it by reference, so the caller
//! always receives linear frames.
//!
//! ## Layers
//!
//! - [`device`] — the injectable boundary: [`device::M2mDevice`] and
//!   [`device::DeviceLocator`] traits over queue/ioctl mechanics.
//! - [`pool`] — index-addressed buffer pools with an explicit per-slot
//!   ownership state machine.
//! - [`bridge`] — the two relay threads that keep the decoder→converter
//!   loop turning.
//! - [`session`] — the synchronous submit/retrieve/release API.
//! - [`testing`] — scriptable fakes for driving the engine without
//!   hardware.

pub mod bridge;
pub mod device;
pub mod pool;
pub mod session;
pub mod testing;

pub use bridge::{BridgeFault, ConversionBridge};
pub use device::{
    DeviceCandidate, DeviceCaps, DeviceLocator, M2mDevice, MappedBuffer, MemoryKind, PollStatus,
    QueueType, QueuedPlane,
};
pub use pool::{BufferPool, PlaneBacking, PlaneMemory, SlotState};
pub use session::{DecodeSession, DecodedFrame};

pub use m2m_common::{
    CropRect, DecodeError, DecodeResult, DeviceError, FourCc, PixelLayout, PoolError, Resolution,
    SessionConfig, VideoCodec,
};
