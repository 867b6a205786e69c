//! Compression layer for the byte envelope.
//!
//! Snappy generally performs best in CPU cost with a small sacrifice in
//! compression ratio; Gzip trades CPU for a better ratio. Payloads shorter
//! than the configured minimum length skip compression entirely.

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::CacheError;

/// Payloads shorter than this are not worth compressing. Applies when the
/// config's `min_len_for_compression` is 0.
pub const DEFAULT_MIN_LEN_FOR_COMPRESSION: usize = 512;

/// Compression algorithm applied to envelope payloads.
///
/// The discriminants are the wire ids carried in the envelope header and in
/// the legacy attribute bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionAlgo {
    /// No compression.
    #[default]
    None = 0,
    /// Snappy: cheap to compress and decompress.
    Snappy = 1,
    /// Gzip at the default level: better ratio, more CPU.
    Gzip = 2,
}

impl CompressionAlgo {
    /// The id stored on the wire.
    pub fn wire_id(self) -> u32 {
        self as u32
    }

    /// Resolve a wire id back to an algorithm.
    pub fn from_wire(id: u64) -> Result<Self, CacheError> {
        match id {
            0 => Ok(CompressionAlgo::None),
            1 => Ok(CompressionAlgo::Snappy),
            2 => Ok(CompressionAlgo::Gzip),
            other => Err(CacheError::Compression(format!(
                "unknown compression id {}",
                other
            ))),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            CompressionAlgo::None => "none",
            CompressionAlgo::Snappy => "snappy",
            CompressionAlgo::Gzip => "gzip",
        }
    }
}

/// Config for the compression applied before bytes reach the store.
///
/// A `min_len_for_compression` of 0 falls back to
/// [`DEFAULT_MIN_LEN_FOR_COMPRESSION`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CompressionConfig {
    pub algo: CompressionAlgo,
    pub min_len_for_compression: usize,
}

impl CompressionConfig {
    pub fn effective_min_len(&self) -> usize {
        if self.min_len_for_compression == 0 {
            DEFAULT_MIN_LEN_FOR_COMPRESSION
        } else {
            self.min_len_for_compression
        }
    }
}

/// Compress raw bytes with the given algorithm.
pub fn compress(data: &[u8], algo: CompressionAlgo) -> Result<Vec<u8>, CacheError> {
    match algo {
        CompressionAlgo::None => Ok(data.to_vec()),
        CompressionAlgo::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| CacheError::Compression(e.to_string())),
        CompressionAlgo::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder
                .write_all(data)
                .and_then(|_| encoder.finish())
                .map_err(|e| CacheError::Compression(e.to_string()))
        }
    }
}

/// Decompress bytes back into the original payload.
pub fn decompress(data: &[u8], algo: CompressionAlgo) -> Result<Vec<u8>, CacheError> {
    match algo {
        CompressionAlgo::None => Ok(data.to_vec()),
        CompressionAlgo::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| CacheError::Compression(e.to_string())),
        CompressionAlgo::Gzip => {
            let mut decoder = flate2::read::GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|e| CacheError::Compression(e.to_string()))?;
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        // compressible payload
        b"the quick brown fox jumps over the lazy dog "
            .iter()
            .cycle()
            .take(2048)
            .copied()
            .collect()
    }

    #[test]
    fn test_snappy_round_trip() {
        let data = sample();
        let compressed = compress(&data, CompressionAlgo::Snappy).unwrap();
        assert!(compressed.len() < data.len());
        let back = decompress(&compressed, CompressionAlgo::Snappy).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_gzip_round_trip() {
        let data = sample();
        let compressed = compress(&data, CompressionAlgo::Gzip).unwrap();
        assert!(compressed.len() < data.len());
        let back = decompress(&compressed, CompressionAlgo::Gzip).unwrap();
        assert_eq!(back, data);
    }

    #[test]
    fn test_none_is_pass_through() {
        let data = sample();
        assert_eq!(compress(&data, CompressionAlgo::None).unwrap(), data);
        assert_eq!(decompress(&data, CompressionAlgo::None).unwrap(), data);
    }

    #[test]
    fn test_unknown_wire_id_rejected() {
        assert!(CompressionAlgo::from_wire(7).is_err());
        assert_eq!(
            CompressionAlgo::from_wire(1).unwrap(),
            CompressionAlgo::Snappy
        );
    }

    #[test]
    fn test_effective_min_len_defaults() {
        let config = CompressionConfig::default();
        assert_eq!(
            config.effective_min_len(),
            DEFAULT_MIN_LEN_FOR_COMPRESSION
        );
        let config = CompressionConfig {
            min_len_for_compression: 64,
            ..Default::default()
        };
        assert_eq!(config.effective_min_len(), 64);
    }
}
