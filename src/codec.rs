//! Chunk compression codecs.
//!
//! Chunks are compressed independently with the blosc container format; see
//! [`blosc`].

pub mod blosc;

pub use blosc::{
    compress_bytes, decompress_bytes, BloscCodecId, BloscCompressionLevel, BloscCompressionParams,
    BloscShuffle, CodecError, InvalidCompressionLevelError,
};
