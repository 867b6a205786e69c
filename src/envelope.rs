//! Self-describing byte envelope for cached payloads.
//!
//! Layout:
//!
//! ```text
//! magic(4) | attrs(4 LE) | header_len(4 LE) | header | data_len(4 LE) | data
//! ```
//!
//! `magic` is `_@@_` and marks bytes produced by this library. Bit 3 of
//! `attrs` says a length-prefixed header follows; without it the low three
//! bits carry the compression id and the payload follows directly (the
//! layout older writers produced). The header is a tagged-varint record of
//! compression id and the soft/hard expiration timestamps.

use bytes::Bytes;

use crate::compression::{self, CompressionAlgo, CompressionConfig};
use crate::entry::MetaHeader;
use crate::error::CacheError;

const MAGIC: [u8; 4] = *b"_@@_";
const ATTRS_LEN: usize = 4;
const LEN_FIELD: usize = 4;

/// Bit 3 of the attribute word: a length-prefixed header is present.
const HEADER_FLAG: u32 = 8;
/// Low bits of the attribute word carry the compression id on the legacy path.
const COMPRESSION_MASK: u32 = 0x07;

/// Header field tags, protobuf varint wire format.
const TAG_COMPRESSION: u8 = 0x08;
const TAG_SOFT_TIMEOUT: u8 = 0x10;
const TAG_HARD_TIMEOUT: u8 = 0x18;

/// Whether `bytes` starts like an envelope produced by [`encode`].
pub fn is_encoded(bytes: &[u8]) -> bool {
    bytes.len() >= MAGIC.len() + ATTRS_LEN && bytes[..MAGIC.len()] == MAGIC
}

/// Frame `payload` into envelope bytes.
///
/// The payload is compressed with `algo`, the header records the algorithm
/// and the (normalized) expiration timestamps.
pub fn encode(
    payload: &[u8],
    algo: CompressionAlgo,
    header: MetaHeader,
) -> Result<Bytes, CacheError> {
    let compressed = compression::compress(payload, algo)?;
    let header = header.normalized();
    let header_bytes = encode_header(algo, &header);

    let mut out = Vec::with_capacity(
        MAGIC.len() + ATTRS_LEN + LEN_FIELD * 2 + header_bytes.len() + compressed.len(),
    );
    out.extend_from_slice(&MAGIC);
    out.extend_from_slice(&HEADER_FLAG.to_le_bytes());
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
    out.extend_from_slice(&compressed);
    Ok(Bytes::from(out))
}

/// Parse envelope bytes back into the payload and its expiration metadata.
///
/// Bytes that do not start with the magic prefix fail with
/// [`CacheError::EncodingNotMatch`]. The legacy headerless layout decodes
/// with zeroed timestamps.
pub fn decode(bytes: &[u8]) -> Result<(Bytes, MetaHeader), CacheError> {
    if !is_encoded(bytes) {
        return Err(CacheError::EncodingNotMatch);
    }

    let attrs = u32::from_le_bytes(bytes[MAGIC.len()..MAGIC.len() + ATTRS_LEN].try_into().unwrap());
    let mut idx = MAGIC.len() + ATTRS_LEN;

    if attrs & HEADER_FLAG != 0 {
        let header_len = read_len(bytes, &mut idx)?;
        let header_end = checked_end(bytes, idx, header_len)?;
        let (algo, header) = decode_header(&bytes[idx..header_end])?;
        idx = header_end;

        let data_len = read_len(bytes, &mut idx)?;
        let data_end = checked_end(bytes, idx, data_len)?;
        let payload = compression::decompress(&bytes[idx..data_end], algo)?;
        Ok((Bytes::from(payload), header))
    } else {
        let algo = CompressionAlgo::from_wire((attrs & COMPRESSION_MASK) as u64)?;
        let payload = compression::decompress(&bytes[idx..], algo)?;
        Ok((Bytes::from(payload), MetaHeader::default()))
    }
}

fn read_len(bytes: &[u8], idx: &mut usize) -> Result<usize, CacheError> {
    let end = checked_end(bytes, *idx, LEN_FIELD)?;
    let len = u32::from_le_bytes(bytes[*idx..end].try_into().unwrap()) as usize;
    *idx = end;
    Ok(len)
}

fn checked_end(bytes: &[u8], idx: usize, len: usize) -> Result<usize, CacheError> {
    idx.checked_add(len)
        .filter(|end| *end <= bytes.len())
        .ok_or(CacheError::EncodingNotMatch)
}

/// All three header fields are always emitted, zero-valued or not, so a
/// header has a fixed field order and decoders can default what they miss.
fn encode_header(algo: CompressionAlgo, header: &MetaHeader) -> Vec<u8> {
    let mut buf = Vec::with_capacity(24);
    buf.push(TAG_COMPRESSION);
    put_uvarint(&mut buf, algo.wire_id() as u64);
    buf.push(TAG_SOFT_TIMEOUT);
    put_uvarint(&mut buf, header.soft_timeout_ts as u64);
    buf.push(TAG_HARD_TIMEOUT);
    put_uvarint(&mut buf, header.hard_timeout_ts as u64);
    buf
}

fn decode_header(buf: &[u8]) -> Result<(CompressionAlgo, MetaHeader), CacheError> {
    let mut idx = 0;
    let mut algo_id = 0u64;
    let mut header = MetaHeader::default();

    while idx < buf.len() {
        let tag = buf[idx];
        idx += 1;
        let value = get_uvarint(buf, &mut idx)?;
        match tag {
            TAG_COMPRESSION => algo_id = value,
            TAG_SOFT_TIMEOUT => header.soft_timeout_ts = value as i64,
            TAG_HARD_TIMEOUT => header.hard_timeout_ts = value as i64,
            _ => return Err(CacheError::EncodingNotMatch),
        }
    }

    Ok((CompressionAlgo::from_wire(algo_id)?, header))
}

fn put_uvarint(buf: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        buf.push((value as u8 & 0x7f) | 0x80);
        value >>= 7;
    }
    buf.push(value as u8);
}

fn get_uvarint(buf: &[u8], idx: &mut usize) -> Result<u64, CacheError> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = *buf.get(*idx).ok_or(CacheError::EncodingNotMatch)?;
        *idx += 1;
        if shift >= 64 {
            return Err(CacheError::EncodingNotMatch);
        }
        value |= ((byte & 0x7f) as u64) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
}

/// Envelope codec as configured for one cache: compression algorithm,
/// minimum payload length for compression, and a switch to bypass the
/// envelope entirely.
#[derive(Debug, Clone)]
pub(crate) struct EncodingHandler {
    algo: CompressionAlgo,
    min_len_for_compression: usize,
    disabled: bool,
}

impl EncodingHandler {
    pub fn new(disabled: bool, compression: &CompressionConfig) -> Self {
        EncodingHandler {
            algo: compression.algo,
            min_len_for_compression: compression.effective_min_len(),
            disabled,
        }
    }

    /// Frame payload bytes; payloads below the compression threshold are
    /// framed uncompressed regardless of the configured algorithm.
    pub fn encode(&self, payload: &[u8], header: MetaHeader) -> Result<Bytes, CacheError> {
        if self.disabled {
            return Ok(Bytes::copy_from_slice(payload));
        }
        let algo = if payload.len() < self.min_len_for_compression {
            CompressionAlgo::None
        } else {
            self.algo
        };
        encode(payload, algo, header)
    }

    pub fn decode(&self, bytes: &[u8]) -> Result<(Bytes, MetaHeader), CacheError> {
        if self.disabled {
            return Ok((Bytes::copy_from_slice(bytes), MetaHeader::default()));
        }
        decode(bytes)
    }
}
