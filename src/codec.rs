//! Application codec adapter: typed values to payload bytes and back.
//!
//! A cache carries a default codec; each operation may override it with a
//! built-in codec id or a caller-supplied [`CustomCodec`].

use std::sync::Arc;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::CacheError;

/// Built-in codec selection.
///
/// `Unset` falls back to the cache-level default (which itself defaults to
/// JSON).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecType {
    #[default]
    Unset,
    Json,
}

/// Config to control the default codec of a cache.
///
/// A per-operation codec set through [`OpOptions`](crate::options::OpOptions)
/// has higher priority than this cache-level default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct CodecConfig {
    pub codec_type: CodecType,
}

/// A caller-supplied marshaller.
///
/// Values travel through `serde_json::Value` so the trait stays
/// object-safe; the codec decides the byte representation.
pub trait CustomCodec: Send + Sync {
    fn marshal(&self, value: &serde_json::Value) -> Result<Vec<u8>, CacheError>;
    fn unmarshal(&self, bytes: &[u8]) -> Result<serde_json::Value, CacheError>;
}

/// Resolves the effective codec per call and runs it.
#[derive(Debug, Clone)]
pub(crate) struct CodecHandler {
    default_type: CodecType,
}

impl CodecHandler {
    pub fn new(config: &CodecConfig) -> Self {
        CodecHandler {
            default_type: config.codec_type,
        }
    }

    pub fn marshal<V: Serialize>(
        &self,
        value: &V,
        codec_type: CodecType,
        custom: Option<&Arc<dyn CustomCodec>>,
    ) -> Result<Vec<u8>, CacheError> {
        if let Some(codec) = custom {
            let json = serde_json::to_value(value)
                .map_err(|e| CacheError::Codec(e.to_string()))?;
            return codec.marshal(&json);
        }

        match self.effective(codec_type) {
            CodecType::Json | CodecType::Unset => {
                serde_json::to_vec(value).map_err(|e| CacheError::Codec(e.to_string()))
            }
        }
    }

    pub fn unmarshal<V: DeserializeOwned>(
        &self,
        bytes: &[u8],
        codec_type: CodecType,
        custom: Option<&Arc<dyn CustomCodec>>,
    ) -> Result<V, CacheError> {
        if let Some(codec) = custom {
            let json = codec.unmarshal(bytes)?;
            return serde_json::from_value(json).map_err(|e| CacheError::Codec(e.to_string()));
        }

        match self.effective(codec_type) {
            CodecType::Json | CodecType::Unset => {
                serde_json::from_slice(bytes).map_err(|e| CacheError::Codec(e.to_string()))
            }
        }
    }

    fn effective(&self, codec_type: CodecType) -> CodecType {
        match codec_type {
            CodecType::Unset => self.default_type,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Payload {
        id: u64,
        name: String,
    }

    #[test]
    fn test_json_round_trip() {
        let handler = CodecHandler::new(&CodecConfig::default());
        let value = Payload {
            id: 7,
            name: "seven".into(),
        };

        let bytes = handler.marshal(&value, CodecType::Unset, None).unwrap();
        let back: Payload = handler.unmarshal(&bytes, CodecType::Unset, None).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn test_unmarshal_garbage_fails() {
        let handler = CodecHandler::new(&CodecConfig::default());
        let result: Result<Payload, _> = handler.unmarshal(b"\xff\xfe", CodecType::Json, None);
        assert!(matches!(result.unwrap_err(), CacheError::Codec(_)));
    }

    struct ReversingCodec;

    impl CustomCodec for ReversingCodec {
        fn marshal(&self, value: &serde_json::Value) -> Result<Vec<u8>, CacheError> {
            let mut bytes = serde_json::to_vec(value)
                .map_err(|e| CacheError::Codec(e.to_string()))?;
            bytes.reverse();
            Ok(bytes)
        }

        fn unmarshal(&self, bytes: &[u8]) -> Result<serde_json::Value, CacheError> {
            let mut bytes = bytes.to_vec();
            bytes.reverse();
            serde_json::from_slice(&bytes).map_err(|e| CacheError::Codec(e.to_string()))
        }
    }

    #[test]
    fn test_custom_codec_takes_priority() {
        let handler = CodecHandler::new(&CodecConfig::default());
        let custom: Arc<dyn CustomCodec> = Arc::new(ReversingCodec);
        let value = Payload {
            id: 9,
            name: "nine".into(),
        };

        let bytes = handler
            .marshal(&value, CodecType::Json, Some(&custom))
            .unwrap();
        // not plain JSON
        assert!(serde_json::from_slice::<Payload>(&bytes).is_err());

        let back: Payload = handler
            .unmarshal(&bytes, CodecType::Json, Some(&custom))
            .unwrap();
        assert_eq!(back, value);
    }
}
