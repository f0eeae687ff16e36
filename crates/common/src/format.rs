//! Format negotiation vocabulary: fourcc codes, codecs, plane layouts, crops.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum number of memory planes a multi-planar buffer can carry.
pub const MAX_PLANES: usize = 3;

/// Four-character pixel/stream format code.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FourCc(pub [u8; 4]);

impl FourCc {
    // Compressed stream formats
    pub const MPEG1: Self = Self(*b"MPG1");
    pub const MPEG2: Self = Self(*b"MPG2");
    pub const MPEG4: Self = Self(*b"MPG4");
    pub const H263: Self = Self(*b"H263");
    pub const H264: Self = Self(*b"H264");

    // Picture formats
    /// Two-plane Y/CbCr, non-contiguous (the linear target layout).
    pub const NV12M: Self = Self(*b"NM12");
    /// Two-plane Y/CbCr in the decoder's native 64x32 tile order.
    pub const NV12MT: Self = Self(*b"TM12");
    /// Three-plane Y/Cb/Cr, non-contiguous.
    pub const YUV420M: Self = Self(*b"YM12");

    pub fn new(code: &[u8; 4]) -> Self {
        Self(*code)
    }
}

impl fmt::Display for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            // Non-printable bytes would garble log lines.
            let c = if b.is_ascii_graphic() || b == b' ' {
                b as char
            } else {
                '?'
            };
            write!(f, "{c}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for FourCc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FourCc({self})")
    }
}

/// Video codec identifier for the compressed OUTPUT side.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    Mpeg1,
    Mpeg2,
    Mpeg4,
    H263,
    H264,
}

impl VideoCodec {
    /// Stream fourcc for the decoder OUTPUT queue.
    pub fn fourcc(self) -> FourCc {
        match self {
            Self::Mpeg1 => FourCc::MPEG1,
            Self::Mpeg2 => FourCc::MPEG2,
            Self::Mpeg4 => FourCc::MPEG4,
            Self::H263 => FourCc::H263,
            Self::H264 => FourCc::H264,
        }
    }

    /// Whether the bitstream carries out-of-band parameter sets.
    ///
    /// For these codecs the first submission is consumed entirely by
    /// header processing. H.263 has no separate header, so its first
    /// access unit must also be submitted as a regular frame.
    pub fn has_parameter_sets(self) -> bool {
        !matches!(self, Self::H263)
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Self::Mpeg1 => "MPEG-1",
            Self::Mpeg2 => "MPEG-2",
            Self::Mpeg4 => "MPEG-4 Part 2",
            Self::H263 => "H.263",
            Self::H264 => "H.264/AVC",
        }
    }
}

/// Video/image resolution.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const HD: Self = Self {
        width: 1920,
        height: 1080,
    };

    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn pixel_count(self) -> u64 {
        self.width as u64 * self.height as u64
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Visible picture rectangle inside a coded frame.
///
/// The coded size is macroblock-aligned and may exceed the visible
/// picture; the crop window selects the region a consumer should read.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
    pub left: u32,
    pub top: u32,
    pub width: u32,
    pub height: u32,
}

impl CropRect {
    pub fn new(left: u32, top: u32, width: u32, height: u32) -> Self {
        Self {
            left,
            top,
            width,
            height,
        }
    }

    /// Full-frame crop at origin.
    pub fn full(res: Resolution) -> Self {
        Self::new(0, 0, res.width, res.height)
    }
}

impl fmt::Display for CropRect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}x{}+{}+{}",
            self.width, self.height, self.left, self.top
        )
    }
}

/// Byte capacity of one plane of a negotiated format.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaneFormat {
    pub size_image: usize,
}

/// A negotiated multi-planar format: fourcc, geometry, and per-plane sizes.
///
/// Used both as a request (what the caller asks the driver for) and as
/// the driver's reply — the driver may adjust geometry and sizes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelLayout {
    pub fourcc: FourCc,
    pub resolution: Resolution,
    /// Per-plane byte capacities; empty planes are absent.
    pub planes: Vec<PlaneFormat>,
}

impl PixelLayout {
    pub fn new(fourcc: FourCc, resolution: Resolution) -> Self {
        Self {
            fourcc,
            resolution,
            planes: Vec::new(),
        }
    }

    pub fn with_plane_sizes(mut self, sizes: &[usize]) -> Self {
        assert!(sizes.len() <= MAX_PLANES, "at most {MAX_PLANES} planes");
        self.planes = sizes
            .iter()
            .map(|&size_image| PlaneFormat { size_image })
            .collect();
        self
    }

    /// Single-plane compressed stream layout with a fixed capacity.
    pub fn stream(fourcc: FourCc, capacity: usize) -> Self {
        Self::new(fourcc, Resolution::new(0, 0)).with_plane_sizes(&[capacity])
    }

    pub fn plane_count(&self) -> usize {
        self.planes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fourcc_display() {
        assert_eq!(FourCc::H264.to_string(), "H264");
        assert_eq!(FourCc::NV12M.to_string(), "NM12");
        assert_eq!(FourCc::new(&[0, b'a', b'b', b'c']).to_string(), "?abc");
    }

    #[test]
    fn codec_fourcc_mapping() {
        assert_eq!(VideoCodec::H264.fourcc(), FourCc::H264);
        assert_eq!(VideoCodec::Mpeg2.fourcc(), FourCc::MPEG2);
    }

    #[test]
    fn h263_has_no_parameter_sets() {
        assert!(!VideoCodec::H263.has_parameter_sets());
        assert!(VideoCodec::H264.has_parameter_sets());
        assert!(VideoCodec::Mpeg2.has_parameter_sets());
    }

    #[test]
    fn crop_full_frame() {
        let crop = CropRect::full(Resolution::HD);
        assert_eq!(crop, CropRect::new(0, 0, 1920, 1080));
        assert_eq!(crop.to_string(), "1920x1080+0+0");
    }

    #[test]
    fn layout_plane_sizes() {
        let layout = PixelLayout::new(FourCc::NV12MT, Resolution::new(1920, 1088))
            .with_plane_sizes(&[2_088_960, 1_044_480]);
        assert_eq!(layout.plane_count(), 2);
        assert_eq!(layout.planes[0].size_image, 2_088_960);
    }

    #[test]
    fn stream_layout_single_plane() {
        let layout = PixelLayout::stream(FourCc::H264, 1 << 20);
        assert_eq!(layout.plane_count(), 1);
        assert_eq!(layout.planes[0].size_image, 1 << 20);
    }
}
