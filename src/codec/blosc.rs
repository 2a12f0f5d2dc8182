//! Blosc compression parameters and the c-blosc context API glue.
//!
//! Every chunk compresses to one standalone blosc buffer. Compression runs
//! with one internal thread; parallelism across chunks belongs to the
//! [`ThreadPool`](crate::thread_pool::ThreadPool).

use std::ffi::{c_char, c_int, c_void, CStr};

use blosc_src::{
    blosc_cbuffer_validate, blosc_compress_ctx, blosc_decompress_ctx, BLOSC_MAX_OVERHEAD,
};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use serde_repr::{Deserialize_repr, Serialize_repr};
use thiserror::Error;

/// A compression or decompression failure.
#[derive(Debug, Error)]
pub enum CodecError {
    /// blosc could not compress the buffer.
    #[error("blosc failed to compress {src_len} bytes with {codec} (status {status})")]
    Compress {
        /// The configured codec.
        codec: BloscCodecId,
        /// Uncompressed input length.
        src_len: usize,
        /// The c-blosc return code.
        status: i32,
    },
    /// The compressed buffer failed validation.
    ///
    /// c-blosc performs limited validation of untrusted input, so buffers are
    /// checked before the decompressed size is trusted.
    #[error("invalid blosc buffer of {0} bytes")]
    InvalidBuffer(usize),
    /// blosc could not decompress the buffer.
    #[error("blosc failed to decompress {src_len} bytes (status {status})")]
    Decompress {
        /// Compressed input length.
        src_len: usize,
        /// The c-blosc return code.
        status: i32,
    },
}

/// The block codec run inside the blosc container.
#[derive(Copy, Clone, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BloscCodecId {
    /// LZ4.
    #[display("lz4")]
    Lz4,
    /// Zstandard.
    #[display("zstd")]
    Zstd,
}

impl BloscCodecId {
    /// The compressor name as passed to c-blosc.
    #[must_use]
    pub const fn as_cstr(&self) -> &'static CStr {
        match self {
            Self::Lz4 => c"lz4",
            Self::Zstd => c"zstd",
        }
    }
}

/// A compression level in `0..=9`, 0 meaning no compression.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
pub struct BloscCompressionLevel(u8);

impl BloscCompressionLevel {
    /// The raw level.
    #[must_use]
    pub const fn as_u8(&self) -> u8 {
        self.0
    }
}

/// An out-of-range compression level error.
#[derive(Debug, Error)]
#[error("compression level {0} is out of range, expected 0..=9")]
pub struct InvalidCompressionLevelError(u8);

impl TryFrom<u8> for BloscCompressionLevel {
    type Error = InvalidCompressionLevelError;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        if level <= 9 {
            Ok(Self(level))
        } else {
            Err(InvalidCompressionLevelError(level))
        }
    }
}

impl<'de> Deserialize<'de> for BloscCompressionLevel {
    fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let level = u8::deserialize(d)?;
        Self::try_from(level).map_err(serde::de::Error::custom)
    }
}

/// The blosc shuffle filter, applied before block compression.
///
/// Serializes as the integer the wire metadata uses.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize_repr, Deserialize_repr)]
#[repr(u8)]
pub enum BloscShuffle {
    /// No shuffling.
    NoShuffle = 0,
    /// Byte-wise shuffling.
    Shuffle = 1,
    /// Bit-wise shuffling.
    BitShuffle = 2,
}

/// The compression parameter triple configured on an array.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BloscCompressionParams {
    /// The block codec.
    pub codec_id: BloscCodecId,
    /// The compression level.
    pub clevel: BloscCompressionLevel,
    /// The shuffle filter.
    pub shuffle: BloscShuffle,
}

impl BloscCompressionParams {
    /// Create a parameter triple.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidCompressionLevelError`] if `clevel` exceeds 9.
    pub fn new(
        codec_id: BloscCodecId,
        clevel: u8,
        shuffle: BloscShuffle,
    ) -> Result<Self, InvalidCompressionLevelError> {
        Ok(Self {
            codec_id,
            clevel: BloscCompressionLevel::try_from(clevel)?,
            shuffle,
        })
    }
}

/// Compress `src` into a standalone blosc buffer.
///
/// `typesize` is the sample size in bytes, so byte and bit shuffling operate
/// on whole samples. The block size is chosen by c-blosc.
///
/// # Errors
///
/// Returns [`CodecError::Compress`] if c-blosc reports failure. A compressed
/// buffer never exceeds `src.len() + BLOSC_MAX_OVERHEAD` bytes, so a buffer
/// overrun status is a codec failure rather than a short output.
pub fn compress_bytes(
    src: &[u8],
    params: &BloscCompressionParams,
    typesize: usize,
) -> Result<Vec<u8>, CodecError> {
    let mut dest = vec![0u8; src.len() + BLOSC_MAX_OVERHEAD as usize];
    let status = unsafe {
        blosc_compress_ctx(
            c_int::from(params.clevel.as_u8()),
            params.shuffle as c_int,
            typesize,
            src.len(),
            src.as_ptr().cast::<c_void>(),
            dest.as_mut_ptr().cast::<c_void>(),
            dest.len(),
            params.codec_id.as_cstr().as_ptr().cast::<c_char>(),
            0, // automatic blocksize
            1, // internal threads
        )
    };
    if status > 0 {
        dest.truncate(usize::try_from(status).expect("positive"));
        Ok(dest)
    } else {
        Err(CodecError::Compress {
            codec: params.codec_id,
            src_len: src.len(),
            status,
        })
    }
}

/// Decompress a standalone blosc buffer.
///
/// # Errors
///
/// Returns [`CodecError::InvalidBuffer`] if `src` fails header validation and
/// [`CodecError::Decompress`] if c-blosc reports failure.
pub fn decompress_bytes(src: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut nbytes: usize = 0;
    let valid =
        unsafe { blosc_cbuffer_validate(src.as_ptr().cast::<c_void>(), src.len(), &mut nbytes) };
    if valid < 0 {
        return Err(CodecError::InvalidBuffer(src.len()));
    }
    let mut dest = vec![0u8; nbytes];
    let status = unsafe {
        blosc_decompress_ctx(
            src.as_ptr().cast::<c_void>(),
            dest.as_mut_ptr().cast::<c_void>(),
            dest.len(),
            1, // internal threads
        )
    };
    if status >= 0 && usize::try_from(status).expect("non-negative") == nbytes {
        Ok(dest)
    } else {
        Err(CodecError::Decompress {
            src_len: src.len(),
            status,
        })
    }
}
