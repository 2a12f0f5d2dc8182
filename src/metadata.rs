//! The JSON metadata documents of a dataset.
//!
//! These mirror the draft v3 protocol dialect: a root document at
//! `zarr.json`, group attributes at `meta/root.group.json`, and one array
//! document per multiscale level at `meta/root/<level>.array.json`. Fields
//! are declared in lexicographic order and serialized with a four-space
//! indent, so the documents are byte-stable across writes.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::codec::{BloscCodecId, BloscCompressionParams, BloscShuffle};
use crate::dimension::ArrayConfig;

const PROTOCOL_URL: &str = "https://purl.org/zarr/spec/protocol/core/3.0";
const BLOSC_CODEC_URL: &str = "https://purl.org/zarr/spec/codec/blosc/1.0";
const SHARDING_EXTENSION_URL: &str =
    "https://purl.org/zarr/spec/storage_transformers/sharding/1.0";

/// The key the caller's metadata nests under in the group attributes.
pub const EXTERNAL_ATTRIBUTE_KEY: &str = "acquire";

/// Serialize a document the way the sink lays it out on disk.
///
/// # Errors
///
/// Returns a [`serde_json::Error`] if the value cannot be serialized.
pub fn to_document_string<T: Serialize>(value: &T) -> serde_json::Result<String> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(String::from_utf8(out).expect("serde_json emits utf-8"))
}

/// The protocol root document (`zarr.json`).
#[derive(Clone, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[display("{}", serde_json::to_string(self).unwrap_or_default())]
pub struct RootMetadata {
    /// Protocol extensions in use; always empty here.
    pub extensions: Vec<serde_json::Value>,
    /// The metadata encoding declaration.
    pub metadata_encoding: String,
    /// The suffix of every metadata key.
    pub metadata_key_suffix: String,
    /// The protocol version declaration.
    pub zarr_format: String,
}

impl Default for RootMetadata {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            metadata_encoding: PROTOCOL_URL.to_string(),
            metadata_key_suffix: ".json".to_string(),
            zarr_format: PROTOCOL_URL.to_string(),
        }
    }
}

/// The group document (`meta/root.group.json`).
///
/// The caller-supplied metadata nests verbatim under a fixed attribute key;
/// an absent caller document serializes as the empty string.
#[derive(Clone, Debug, Display, Eq, PartialEq, Serialize, Deserialize)]
#[display("{}", serde_json::to_string(self).unwrap_or_default())]
pub struct GroupMetadata {
    /// The group attributes.
    pub attributes: GroupAttributes,
}

/// Attributes of the root group.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct GroupAttributes {
    /// The caller's opaque metadata document.
    #[serde(rename = "acquire")]
    pub external: serde_json::Value,
}

impl GroupMetadata {
    /// Wrap the caller's metadata document.
    #[must_use]
    pub fn new(external: Option<serde_json::Value>) -> Self {
        Self {
            attributes: GroupAttributes {
                external: external.unwrap_or_else(|| serde_json::Value::String(String::new())),
            },
        }
    }
}

/// The `chunk_grid` record of an array document.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ChunkGridMetadata {
    /// Chunk extents, slowest dimension first.
    pub chunk_shape: Vec<u64>,
    /// The chunk key separator.
    pub separator: String,
    /// The grid type; always `regular`.
    #[serde(rename = "type")]
    pub grid_type: String,
}

/// The `compressor` record of an array document.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CompressorMetadata {
    /// The codec declaration URL.
    pub codec: String,
    /// The codec configuration.
    pub configuration: CompressorConfiguration,
}

/// Blosc parameters as recorded in the array document.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct CompressorConfiguration {
    /// The blosc block size; 0 lets the codec choose.
    pub blocksize: u64,
    /// The compression level.
    pub clevel: u8,
    /// The block codec name.
    pub cname: BloscCodecId,
    /// The shuffle mode.
    pub shuffle: BloscShuffle,
}

impl From<&BloscCompressionParams> for CompressorMetadata {
    fn from(params: &BloscCompressionParams) -> Self {
        Self {
            codec: BLOSC_CODEC_URL.to_string(),
            configuration: CompressorConfiguration {
                blocksize: 0,
                clevel: params.clevel.as_u8(),
                cname: params.codec_id,
                shuffle: params.shuffle,
            },
        }
    }
}

/// One entry of the `storage_transformers` list.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StorageTransformerMetadata {
    /// The transformer configuration.
    pub configuration: StorageTransformerConfiguration,
    /// The transformer extension URL.
    pub extension: String,
    /// The transformer type.
    #[serde(rename = "type")]
    pub transformer_type: String,
}

/// The sharding transformer configuration.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StorageTransformerConfiguration {
    /// Chunks per shard, slowest dimension first.
    pub chunks_per_shard: Vec<u64>,
}

/// One array document (`meta/root/<level>.array.json`).
#[derive(Clone, Debug, Display, PartialEq, Serialize, Deserialize)]
#[display("{}", serde_json::to_string(self).unwrap_or_default())]
pub struct ArrayMetadata {
    /// Array attributes; empty here.
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// The chunk grid.
    pub chunk_grid: ChunkGridMetadata,
    /// The in-memory chunk layout.
    pub chunk_memory_layout: String,
    /// The chunk compressor, when compression is configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compressor: Option<CompressorMetadata>,
    /// The element data type.
    pub data_type: String,
    /// Array extensions; always empty here.
    pub extensions: Vec<serde_json::Value>,
    /// The value of unwritten array regions.
    pub fill_value: u64,
    /// Array extents, append dimension first, then the remaining dimensions
    /// slowest first.
    pub shape: Vec<u64>,
    /// Storage transformers; the sharding declaration.
    pub storage_transformers: Vec<StorageTransformerMetadata>,
}

impl ArrayMetadata {
    /// Build the document for one level.
    ///
    /// The append extent reflects the frames actually written; the other
    /// extents are the configured array sizes in reverse declaration order.
    #[must_use]
    pub fn for_level(config: &ArrayConfig, frames_written: u64) -> Self {
        let dims = &config.dimensions;
        let mut shape = Vec::with_capacity(dims.len());
        shape.push(frames_written);
        shape.extend(dims.iter().rev().skip(1).map(|dim| dim.array_size_px));

        Self {
            attributes: serde_json::Map::new(),
            chunk_grid: ChunkGridMetadata {
                chunk_shape: dims.iter().rev().map(|dim| dim.chunk_size_px.get()).collect(),
                separator: "/".to_string(),
                grid_type: "regular".to_string(),
            },
            chunk_memory_layout: "C".to_string(),
            compressor: config.compression.as_ref().map(CompressorMetadata::from),
            data_type: config.image_shape.pixel_type.dtype_name().to_string(),
            extensions: Vec::new(),
            fill_value: 0,
            shape,
            storage_transformers: vec![StorageTransformerMetadata {
                configuration: StorageTransformerConfiguration {
                    chunks_per_shard: dims
                        .iter()
                        .rev()
                        .map(|dim| dim.shard_size_chunks.get())
                        .collect(),
                },
                extension: SHARDING_EXTENSION_URL.to_string(),
                transformer_type: "indexed".to_string(),
            }],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{BloscCodecId, BloscShuffle};
    use crate::dimension::{Dimension, DimensionKind};
    use crate::image::{ImageShape, PixelType};
    use std::num::NonZeroU64;
    use std::path::PathBuf;

    fn nz(value: u64) -> NonZeroU64 {
        NonZeroU64::new(value).unwrap()
    }

    fn config(compression: Option<BloscCompressionParams>) -> ArrayConfig {
        ArrayConfig {
            image_shape: ImageShape::new(64, 48, 1, PixelType::U16),
            dimensions: vec![
                Dimension::new("x", DimensionKind::Space, 64, nz(32), nz(2)),
                Dimension::new("y", DimensionKind::Space, 48, nz(24), nz(2)),
                Dimension::new("t", DimensionKind::Time, 0, nz(2), nz(1)),
            ],
            data_root: PathBuf::from("."),
            compression,
        }
    }

    #[test]
    fn root_document_declares_the_protocol() {
        let text = to_document_string(&RootMetadata::default()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["zarr_format"], PROTOCOL_URL);
        assert_eq!(value["metadata_key_suffix"], ".json");
        assert!(value["extensions"].as_array().unwrap().is_empty());
    }

    #[test]
    fn group_document_nests_external_metadata() {
        let external: serde_json::Value =
            serde_json::from_str(r#"{"instrument": "sim"}"#).unwrap();
        let doc = GroupMetadata::new(Some(external));
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["attributes"]["acquire"]["instrument"], "sim");

        let empty = serde_json::to_value(GroupMetadata::new(None)).unwrap();
        assert_eq!(empty["attributes"]["acquire"], "");
    }

    #[test]
    fn array_document_reverses_dimension_order() {
        let doc = ArrayMetadata::for_level(&config(None), 7);
        assert_eq!(doc.shape, vec![7, 48, 64]);
        assert_eq!(doc.chunk_grid.chunk_shape, vec![2, 24, 32]);
        assert_eq!(
            doc.storage_transformers[0].configuration.chunks_per_shard,
            vec![1, 2, 2]
        );
        assert_eq!(doc.data_type, "uint16");
        assert_eq!(doc.fill_value, 0);
        assert!(doc.compressor.is_none());
    }

    #[test]
    fn compressor_record_matches_wire_format() {
        let params =
            BloscCompressionParams::new(BloscCodecId::Zstd, 1, BloscShuffle::Shuffle).unwrap();
        let doc = ArrayMetadata::for_level(&config(Some(params)), 0);
        let value = serde_json::to_value(&doc).unwrap();
        let compressor = &value["compressor"];
        assert_eq!(compressor["codec"], BLOSC_CODEC_URL);
        assert_eq!(compressor["configuration"]["blocksize"], 0);
        assert_eq!(compressor["configuration"]["clevel"], 1);
        assert_eq!(compressor["configuration"]["cname"], "zstd");
        assert_eq!(compressor["configuration"]["shuffle"], 1);
    }

    #[test]
    fn documents_use_four_space_indent() {
        let text = to_document_string(&GroupMetadata::new(None)).unwrap();
        assert!(text.starts_with("{\n    \"attributes\""));
    }
}
