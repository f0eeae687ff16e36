//! Central error types for the pipeline (thiserror-based).

use thiserror::Error;

/// Errors reported by an M2M device at the queue/ioctl boundary.
#[derive(Error, Debug)]
pub enum DeviceError {
    /// The queue has nothing to dequeue right now. Transient, not a fault.
    #[error("device not ready, try again")]
    Again,

    /// A bounded poll ran out its budget without the queue becoming ready.
    #[error("poll timed out after {timeout_ms} ms")]
    PollTimeout { timeout_ms: u32 },

    /// Any other negative result from the device.
    #[error("{op} failed: {reason}")]
    Ioctl { op: &'static str, reason: String },
}

impl DeviceError {
    pub fn ioctl(op: &'static str, reason: impl Into<String>) -> Self {
        Self::Ioctl {
            op,
            reason: reason.into(),
        }
    }

    /// Whether this is the transient "no buffer ready" state rather
    /// than a hardware fault.
    pub fn is_again(&self) -> bool {
        matches!(self, Self::Again)
    }
}

/// Buffer pool contract violations.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("slot {index}: illegal transition {from} -> {to}")]
    IllegalTransition {
        index: u32,
        from: &'static str,
        to: &'static str,
    },

    #[error("index {index} out of range for pool of {len} slots")]
    IndexOutOfRange { index: u32, len: usize },

    #[error("slot {index} plane {plane}: {written} bytes exceed capacity {capacity}")]
    PlaneOverflow {
        index: u32,
        plane: usize,
        written: usize,
        capacity: usize,
    },

    #[error("slot {index} is queued with the device and cannot be written")]
    SlotQueued { index: u32 },
}

/// Decode session errors.
#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("no suitable {role} device found")]
    NoDevice { role: &'static str },

    #[error("setup failed during {stage}: {source}")]
    Setup {
        stage: &'static str,
        source: DeviceError,
    },

    #[error("device error: {0}")]
    Device(#[from] DeviceError),

    #[error("pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("invalid frame handle {index}")]
    InvalidHandle { index: u32 },

    #[error("conversion bridge terminated: {0}")]
    BridgeFault(String),

    #[error("session is closed")]
    Closed,
}

impl DecodeError {
    pub fn setup(stage: &'static str, source: DeviceError) -> Self {
        Self::Setup { stage, source }
    }
}

/// Convenience Result type for session operations.
pub type DecodeResult<T> = Result<T, DecodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn again_is_transient() {
        assert!(DeviceError::Again.is_again());
        assert!(!DeviceError::ioctl("VIDIOC_DQBUF", "EIO").is_again());
    }

    #[test]
    fn device_error_wraps_into_decode_error() {
        let err: DecodeError = DeviceError::PollTimeout { timeout_ms: 1000 }.into();
        assert!(matches!(err, DecodeError::Device(_)));
        assert!(err.to_string().contains("1000 ms"));
    }

    #[test]
    fn setup_error_names_the_stage() {
        let err = DecodeError::setup("S_FMT output", DeviceError::ioctl("VIDIOC_S_FMT", "EINVAL"));
        assert!(err.to_string().contains("S_FMT output"));
    }

    #[test]
    fn pool_error_messages() {
        let err = PoolError::IllegalTransition {
            index: 2,
            from: "Free",
            to: "Completed",
        };
        assert_eq!(err.to_string(), "slot 2: illegal transition Free -> Completed");
    }
}
