use bytes::Bytes;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

/// `hard_timeout_ts` value meaning "never expires" on the wire.
///
/// `0` means the hard timeout is absent, so a distinct sentinel is needed
/// for entries that must outlive any clock value.
pub const HARD_TIMEOUT_FOREVER: i64 = 1;

/// Expiration requested for a write or load operation.
///
/// `Default` resolves to the cache-level default expiration; `Never` maps to
/// the forever sentinel in the stored metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// Use the default expiration configured at cache level.
    Default,
    /// The entry never hard-expires.
    Never,
    /// The entry hard-expires after this duration.
    After(Duration),
}

impl Expiration {
    /// Shorthand for `Expiration::After(Duration::from_secs(secs))`.
    pub fn secs(secs: u64) -> Self {
        Expiration::After(Duration::from_secs(secs))
    }
}

/// Expiration metadata carried next to every cached payload.
///
/// Timestamps are absolute unix seconds. `0` means the timeout is unset;
/// `hard_timeout_ts == 1` means the entry never hard-expires.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaHeader {
    /// Past this point the entry is still served, but a background refresh
    /// is triggered.
    pub soft_timeout_ts: i64,
    /// Past this point the entry must be treated as missing.
    pub hard_timeout_ts: i64,
}

impl MetaHeader {
    /// Create a header from raw timestamps.
    pub fn new(soft_timeout_ts: i64, hard_timeout_ts: i64) -> Self {
        MetaHeader {
            soft_timeout_ts,
            hard_timeout_ts,
        }
    }

    /// Whether the entry must be treated as missing at `now`.
    pub fn is_hard_expired(&self, now: i64) -> bool {
        self.hard_timeout_ts != 0
            && self.hard_timeout_ts != HARD_TIMEOUT_FOREVER
            && self.hard_timeout_ts <= now
    }

    /// Whether the entry should be served but refreshed at `now`.
    pub fn is_soft_expired(&self, now: i64) -> bool {
        self.soft_timeout_ts != 0 && self.soft_timeout_ts <= now
    }

    /// Drop a soft timeout that would outlive the hard timeout.
    ///
    /// Writers must not persist `soft > hard`; the larger soft value is
    /// ignored rather than rejected.
    pub fn normalized(mut self) -> Self {
        if self.hard_timeout_ts != 0
            && self.hard_timeout_ts != HARD_TIMEOUT_FOREVER
            && self.soft_timeout_ts > self.hard_timeout_ts
        {
            self.soft_timeout_ts = 0;
        }
        self
    }
}

/// The payload half of an in-memory record.
///
/// `Bytes` holds a marshalled payload; `Typed` holds the live value by
/// reference for the skip-codec path (cloning is an `Arc` bump, reading is a
/// downcast).
#[derive(Clone)]
pub enum ItemData {
    /// Marshalled payload bytes.
    Bytes(Bytes),
    /// Live value stored by reference, read back via downcast.
    Typed(Arc<dyn Any + Send + Sync>),
}

impl ItemData {
    /// Wrap a live value for by-reference storage.
    pub fn typed<V: Send + Sync + 'static>(value: V) -> Self {
        ItemData::Typed(Arc::new(value))
    }

    /// Approximate byte size, used by cost-based stores.
    pub fn byte_len(&self) -> usize {
        match self {
            ItemData::Bytes(b) => b.len(),
            ItemData::Typed(_) => 0,
        }
    }

    /// Clone the live value out of a `Typed` payload.
    pub fn downcast<V: Clone + Send + Sync + 'static>(&self) -> Option<V> {
        match self {
            ItemData::Typed(any) => any.downcast_ref::<V>().cloned(),
            ItemData::Bytes(_) => None,
        }
    }
}

/// In-memory record: expiration metadata plus the payload, no serialization.
#[derive(Clone)]
pub struct CacheItem {
    pub header: MetaHeader,
    pub data: ItemData,
}

impl CacheItem {
    pub fn new(header: MetaHeader, data: ItemData) -> Self {
        CacheItem { header, data }
    }
}

/// Type-erased unit a [`Store`](crate::store::Store) holds.
///
/// Typed-mode stores hold `Item`s (header + payload, no serialization);
/// encoded-mode stores hold `Encoded` envelope bytes produced by the wire
/// codec.
#[derive(Clone)]
pub enum StoredValue {
    /// An in-memory record (typed-mode stores).
    Item(CacheItem),
    /// Envelope bytes, or raw bytes when encoding is skipped (encoded-mode
    /// stores).
    Encoded(Bytes),
}

impl StoredValue {
    /// Size in bytes as far as the store can tell; typed payloads weigh
    /// nothing here.
    pub fn byte_len(&self) -> usize {
        match self {
            StoredValue::Item(item) => item.data.byte_len(),
            StoredValue::Encoded(b) => b.len(),
        }
    }
}

/// Storage mode preference for stores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Store holds in-memory records by reference (no envelope).
    Typed,
    /// Store holds envelope bytes.
    Encoded,
}

/// Bounds every cached value type must satisfy.
///
/// The typed-receiver contract: values travel through the codec as serde
/// types and through the skip-codec path as `Any` clones.
pub trait CacheValue:
    Serialize + DeserializeOwned + Clone + Send + Sync + 'static
{
}

impl<T> CacheValue for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_expiry_classification() {
        let now = 1_700_000_000;
        assert!(MetaHeader::new(0, now - 1).is_hard_expired(now));
        assert!(MetaHeader::new(0, now).is_hard_expired(now));
        assert!(!MetaHeader::new(0, now + 1).is_hard_expired(now));
        // unset and forever never hard-expire
        assert!(!MetaHeader::new(0, 0).is_hard_expired(now));
        assert!(!MetaHeader::new(0, HARD_TIMEOUT_FOREVER).is_hard_expired(now));
    }

    #[test]
    fn test_soft_expiry_classification() {
        let now = 1_700_000_000;
        assert!(MetaHeader::new(now - 5, now + 60).is_soft_expired(now));
        assert!(MetaHeader::new(now, now + 60).is_soft_expired(now));
        assert!(!MetaHeader::new(now + 5, now + 60).is_soft_expired(now));
        assert!(!MetaHeader::new(0, now + 60).is_soft_expired(now));
    }

    #[test]
    fn test_normalized_drops_oversized_soft() {
        let h = MetaHeader::new(200, 100).normalized();
        assert_eq!(h.soft_timeout_ts, 0);
        assert_eq!(h.hard_timeout_ts, 100);

        // forever hard keeps any soft
        let h = MetaHeader::new(200, HARD_TIMEOUT_FOREVER).normalized();
        assert_eq!(h.soft_timeout_ts, 200);

        let h = MetaHeader::new(50, 100).normalized();
        assert_eq!(h.soft_timeout_ts, 50);
    }

    #[test]
    fn test_typed_item_downcast() {
        let data = ItemData::typed("hello".to_string());
        assert_eq!(data.downcast::<String>(), Some("hello".to_string()));
        assert_eq!(data.downcast::<u64>(), None);
    }
}
