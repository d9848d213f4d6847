//! Document codec: a structural encoder followed by a byte compressor.
//!
//! The two stages are independent and can be swapped separately. The default
//! composition is JSON followed by zstd.

use crate::config::Compression;
use crate::document::Data;
use crate::error::{DocStoreError, Result};

/// Serializes document data to bytes and back.
pub trait Encoder: Send + Sync {
    fn encode(&self, data: &Data) -> Result<Vec<u8>>;

    /// Fails with `CorruptData` if the bytes do not parse.
    fn decode(&self, bytes: &[u8]) -> Result<Data>;
}

/// Generic byte compression pass applied after encoding.
pub trait Compressor: Send + Sync {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>>;

    /// Fails with `CorruptData` if the bytes are not a valid compressed frame.
    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>>;

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonEncoder;

impl Encoder for JsonEncoder {
    fn encode(&self, data: &Data) -> Result<Vec<u8>> {
        serde_json::to_vec(data).map_err(|e| DocStoreError::Encoding(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Data> {
        serde_json::from_slice(bytes)
            .map_err(|e| DocStoreError::CorruptData(format!("invalid JSON payload: {e}")))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZstdCompressor {
    pub level: i32,
}

impl Default for ZstdCompressor {
    fn default() -> Self {
        ZstdCompressor {
            level: zstd::DEFAULT_COMPRESSION_LEVEL,
        }
    }
}

impl Compressor for ZstdCompressor {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::encode_all(bytes, self.level)
            .map_err(|e| DocStoreError::Encoding(format!("zstd compression failed: {e}")))
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        zstd::stream::decode_all(bytes)
            .map_err(|e| DocStoreError::CorruptData(format!("zstd decompression failed: {e}")))
    }

    fn name(&self) -> &str {
        "zstd"
    }
}

/// Pass-through compressor; stored payloads are the raw encoder output.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl Compressor for NoCompression {
    fn compress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn decompress(&self, bytes: &[u8]) -> Result<Vec<u8>> {
        Ok(bytes.to_vec())
    }

    fn name(&self) -> &str {
        "none"
    }
}

/// An encoder composed with a compressor.
pub struct Codec {
    encoder: Box<dyn Encoder>,
    compressor: Box<dyn Compressor>,
}

impl Codec {
    pub fn new(encoder: impl Encoder + 'static, compressor: impl Compressor + 'static) -> Self {
        Codec {
            encoder: Box::new(encoder),
            compressor: Box::new(compressor),
        }
    }

    /// JSON encoding with the compressor selected by configuration.
    pub fn from_compression(compression: &Compression) -> Self {
        match compression {
            Compression::Zstd { level } => Codec::new(JsonEncoder, ZstdCompressor { level: *level }),
            Compression::None => Codec::new(JsonEncoder, NoCompression),
        }
    }

    pub fn encode(&self, data: &Data) -> Result<Vec<u8>> {
        let bytes = self.encoder.encode(data)?;
        self.compressor.compress(&bytes)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<Data> {
        let raw = self.compressor.decompress(bytes)?;
        self.encoder.decode(&raw)
    }

    pub fn compressor_name(&self) -> &str {
        self.compressor.name()
    }
}

impl Default for Codec {
    fn default() -> Self {
        Codec::new(JsonEncoder, ZstdCompressor::default())
    }
}

impl std::fmt::Debug for Codec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Codec")
            .field("compressor", &self.compressor.name())
            .finish_non_exhaustive()
    }
}
