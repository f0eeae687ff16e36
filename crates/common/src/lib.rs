//! `m2m-common` — Shared types, errors, and configuration for the M2M
//! decode pipeline.
//!
//! This crate is the foundation the orchestration engine depends on.
//! It defines:
//!
//! - **Formats**: `FourCc`, `VideoCodec`, `PixelLayout`, `CropRect`,
//!   `Resolution` (negotiation vocabulary for both devices)
//! - **Errors**: `DeviceError`, `PoolError`, `DecodeError` (thiserror-based)
//! - **Config**: `SessionConfig` (pool sizing, poll budgets, driver matching)

pub mod config;
pub mod error;
pub mod format;

// Re-export commonly used items at crate root
pub use config::SessionConfig;
pub use error::{DecodeError, DecodeResult, DeviceError, PoolError};
pub use format::{CropRect, FourCc, PixelLayout, PlaneFormat, Resolution, VideoCodec, MAX_PLANES};
