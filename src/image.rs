//! Pixel types and per-frame geometry.
//!
//! A [`Frame`] is one plane of acquisition data: `channels` planes of
//! `width * height` samples in C order (channel slowest, `x` fastest).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The sample type of a single pixel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum PixelType {
    /// `uint8`
    U8,
    /// `uint16`
    U16,
    /// `int8`
    I8,
    /// `int16`
    I16,
    /// `float32`
    F32,
}

/// An unsupported pixel type error.
#[derive(Debug, Error)]
#[error("unsupported pixel type {0}")]
pub struct UnsupportedPixelTypeError(String);

impl PixelType {
    /// The size in bytes of one sample.
    #[must_use]
    pub const fn size_of(&self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::F32 => 4,
        }
    }

    /// The Zarr data type name of this pixel type.
    #[must_use]
    pub const fn dtype_name(&self) -> &'static str {
        match self {
            Self::U8 => "uint8",
            Self::U16 => "uint16",
            Self::I8 => "int8",
            Self::I16 => "int16",
            Self::F32 => "float32",
        }
    }

    /// Create a pixel type from a Zarr data type name.
    ///
    /// # Errors
    ///
    /// Returns [`UnsupportedPixelTypeError`] if `name` is not a supported data type.
    pub fn from_dtype_name(name: &str) -> Result<Self, UnsupportedPixelTypeError> {
        match name {
            "uint8" => Ok(Self::U8),
            "uint16" => Ok(Self::U16),
            "int8" => Ok(Self::I8),
            "int16" => Ok(Self::I16),
            "float32" => Ok(Self::F32),
            _ => Err(UnsupportedPixelTypeError(name.to_string())),
        }
    }
}

/// The geometry of a single frame as delivered by the acquisition host.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ImageShape {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Number of channel planes per frame.
    pub channels: u32,
    /// The sample type.
    pub pixel_type: PixelType,
}

impl ImageShape {
    /// Create a new image shape.
    #[must_use]
    pub const fn new(width: u32, height: u32, channels: u32, pixel_type: PixelType) -> Self {
        Self {
            width,
            height,
            channels,
            pixel_type,
        }
    }

    /// The size in bytes of one frame.
    #[must_use]
    pub const fn bytes_per_frame(&self) -> usize {
        self.width as usize * self.height as usize * self.channels as usize
            * self.pixel_type.size_of()
    }
}

/// A frame shape mismatch error.
///
/// Raised when a frame handed to a writer does not match the configured
/// per-frame geometry. Rejecting the frame does not fail the writer.
#[derive(Debug, Error)]
pub enum ShapeMismatchError {
    /// The frame geometry differs from the configured geometry.
    #[error("frame shape {actual:?} does not match configured shape {expected:?}")]
    Shape {
        /// The configured geometry.
        expected: ImageShape,
        /// The geometry of the rejected frame.
        actual: ImageShape,
    },
    /// The frame payload length is inconsistent with its geometry.
    #[error("frame payload is {actual} bytes, expected {expected}")]
    PayloadLength {
        /// Bytes implied by the frame geometry.
        expected: usize,
        /// Bytes actually supplied.
        actual: usize,
    },
}

/// A borrowed frame: geometry plus sample bytes.
#[derive(Copy, Clone, Debug)]
pub struct FrameView<'a> {
    shape: ImageShape,
    bytes: &'a [u8],
}

impl<'a> FrameView<'a> {
    /// Create a frame view over `bytes`.
    ///
    /// # Errors
    ///
    /// Returns [`ShapeMismatchError::PayloadLength`] if `bytes` is not exactly
    /// one frame of `shape`.
    pub fn new(shape: ImageShape, bytes: &'a [u8]) -> Result<Self, ShapeMismatchError> {
        if bytes.len() != shape.bytes_per_frame() {
            return Err(ShapeMismatchError::PayloadLength {
                expected: shape.bytes_per_frame(),
                actual: bytes.len(),
            });
        }
        Ok(Self { shape, bytes })
    }

    /// The frame geometry.
    #[must_use]
    pub const fn shape(&self) -> &ImageShape {
        &self.shape
    }

    /// The sample bytes.
    #[must_use]
    pub const fn bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Copy into an owned [`Frame`].
    #[must_use]
    pub fn to_frame(&self) -> Frame {
        Frame {
            shape: self.shape,
            bytes: self.bytes.to_vec(),
        }
    }
}

/// An owned frame, used for the downsampled levels of the multiscale cascade.
#[derive(Clone, Debug)]
pub struct Frame {
    shape: ImageShape,
    bytes: Vec<u8>,
}

impl Frame {
    /// Create a frame from its geometry and sample bytes.
    ///
    /// # Errors
    ///
    /// Returns [`ShapeMismatchError::PayloadLength`] if `bytes` is not exactly
    /// one frame of `shape`.
    pub fn new(shape: ImageShape, bytes: Vec<u8>) -> Result<Self, ShapeMismatchError> {
        if bytes.len() != shape.bytes_per_frame() {
            return Err(ShapeMismatchError::PayloadLength {
                expected: shape.bytes_per_frame(),
                actual: bytes.len(),
            });
        }
        Ok(Self { shape, bytes })
    }

    /// Construct without length validation, for callers that derived the
    /// shape and the bytes together.
    pub(crate) fn from_parts(shape: ImageShape, bytes: Vec<u8>) -> Self {
        debug_assert_eq!(bytes.len(), shape.bytes_per_frame());
        Self { shape, bytes }
    }

    /// The frame geometry.
    #[must_use]
    pub const fn shape(&self) -> &ImageShape {
        &self.shape
    }

    /// The sample bytes.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Borrow as a [`FrameView`].
    #[must_use]
    pub fn view(&self) -> FrameView<'_> {
        FrameView {
            shape: self.shape,
            bytes: &self.bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pixel_type_sizes() {
        assert_eq!(PixelType::U8.size_of(), 1);
        assert_eq!(PixelType::I16.size_of(), 2);
        assert_eq!(PixelType::F32.size_of(), 4);
    }

    #[test]
    fn pixel_type_dtype_round_trip() {
        for pt in [
            PixelType::U8,
            PixelType::U16,
            PixelType::I8,
            PixelType::I16,
            PixelType::F32,
        ] {
            assert_eq!(PixelType::from_dtype_name(pt.dtype_name()).unwrap(), pt);
        }
        assert!(PixelType::from_dtype_name("float64").is_err());
    }

    #[test]
    fn frame_payload_length_is_validated() {
        let shape = ImageShape::new(4, 2, 1, PixelType::U16);
        assert_eq!(shape.bytes_per_frame(), 16);
        assert!(Frame::new(shape, vec![0; 16]).is_ok());
        assert!(matches!(
            Frame::new(shape, vec![0; 15]),
            Err(ShapeMismatchError::PayloadLength { expected: 16, .. })
        ));
    }
}
