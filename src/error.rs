/// Error type for cache operations.
///
/// Callers compare against the unit kinds (`CacheMiss`, `NotStored`, ...)
/// rather than parsing messages; the display strings are stable.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    /// A read failed because the item wasn't present or was hard-expired.
    #[error("cache:cache_miss")]
    CacheMiss,

    /// A conditional write (e.g. `add` on an existing key) failed because
    /// the condition was not satisfied.
    #[error("cache:not_stored")]
    NotStored,

    /// All resources used by the cache have been released; no operation may
    /// be performed after `close`.
    #[error("cache:cache_closed")]
    CacheClosed,

    /// The cache is disabled through config. Direct writes succeed silently
    /// and reads report a miss instead; this kind is reserved for surfaces
    /// where neither answer fits.
    #[error("cache:cache_disabled")]
    CacheDisabled,

    /// The config names a cache kind that is not wired in.
    #[error("cache:config_type_not_supported")]
    ConfigTypeNotSupported,

    /// The data loader of `load`/`load_many` did not return a full result list.
    #[error("cache:data_loader_not_return_results_for_all_keys")]
    DataLoaderShortResult,

    /// The data loader of `load`/`load_many` panicked.
    #[error("cache:data_loader_panic")]
    DataLoaderPanic,

    /// The data loader reported a failure.
    #[error("cache:data_loader: {0}")]
    DataLoader(String),

    /// The stored data is not bytes and the codec cannot handle it.
    #[error("cache:pass_non_bytes_to_codec")]
    PassNonBytesToCodec,

    /// The receiver map for `get_many`/`load_many` was empty where a
    /// destination was required.
    #[error("cache:receiver_is_nil")]
    NilReceiver,

    /// The stored bytes do not match the envelope protocol.
    #[error("cache:encoding_not_match")]
    EncodingNotMatch,

    /// Reserved for the cross-instance strategy: the lock holder crashed and
    /// waiters were filled with nil.
    #[error("cache:value_fill_in_nil_due_to_dlock_loss")]
    DlockLoss,

    /// A storage operation was cut short by a deadline.
    #[error("cache:cache_context_timeout_err")]
    ContextTimeout,

    /// Marshal or unmarshal through the application codec failed.
    #[error("cache:codec: {0}")]
    Codec(String),

    /// Compress or decompress failed, or the compression id is unknown.
    #[error("cache:compression: {0}")]
    Compression(String),

    /// Config validation failed.
    #[error("cache:invalid_config: {0}")]
    InvalidConfig(String),

    /// The underlying store reported a failure.
    #[error("cache:storage: {0}")]
    Storage(String),
}

impl CacheError {
    /// Whether retrying the operation could succeed.
    ///
    /// A miss, a closed cache and a deadline overrun are final; everything
    /// else is worth another attempt.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            CacheError::CacheMiss | CacheError::CacheClosed | CacheError::ContextTimeout
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryability() {
        assert!(!CacheError::CacheMiss.is_retryable());
        assert!(!CacheError::CacheClosed.is_retryable());
        assert!(!CacheError::ContextTimeout.is_retryable());
        assert!(CacheError::NotStored.is_retryable());
        assert!(CacheError::Storage("boom".into()).is_retryable());
        assert!(CacheError::DataLoaderPanic.is_retryable());
    }

    #[test]
    fn test_display_is_stable() {
        assert_eq!(CacheError::CacheMiss.to_string(), "cache:cache_miss");
        assert_eq!(
            CacheError::DataLoaderShortResult.to_string(),
            "cache:data_loader_not_return_results_for_all_keys"
        );
        assert_eq!(
            CacheError::EncodingNotMatch.to_string(),
            "cache:encoding_not_match"
        );
    }
}
