//! Per-operation request stats, surfaced through `tracing`.

use std::time::{Duration, Instant};

use crate::error::CacheError;

/// Operations above this elapsed time are logged as slow.
const SLOW_OPERATION_THRESHOLD: Duration = Duration::from_millis(100);

pub(crate) mod cmd {
    pub const GET: &str = "Get";
    pub const GET_MANY: &str = "GetMany";
    pub const SET: &str = "Set";
    pub const SET_MANY: &str = "SetMany";
    pub const ADD: &str = "Add";
    pub const REPLACE: &str = "Replace";
    pub const DELETE: &str = "Delete";
    pub const DELETE_MANY: &str = "DeleteMany";
    pub const INCREMENT: &str = "Increment";
    pub const DECREMENT: &str = "Decrement";
    pub const EXPIRE: &str = "Expire";
    pub const LOAD_MANY: &str = "LoadMany";
    pub const FLUSH: &str = "Flush";
    pub const PING: &str = "Ping";
}

/// Stats for a single cache operation.
pub(crate) struct RequestStats {
    pub cache_name: String,
    pub operation: &'static str,
    pub total_key_count: usize,
    pub success_key_count: usize,
    pub request_size: usize,
    pub response_size: usize,
    started: Instant,
}

impl RequestStats {
    pub fn start(cache_name: &str, operation: &'static str, total_key_count: usize) -> Self {
        RequestStats {
            cache_name: cache_name.to_string(),
            operation,
            total_key_count,
            success_key_count: 0,
            request_size: 0,
            response_size: 0,
            started: Instant::now(),
        }
    }

    /// Log the operation outcome; call exactly once when the operation ends.
    pub fn finish(&self, err: Option<&CacheError>) {
        let elapsed = self.started.elapsed();

        if elapsed >= SLOW_OPERATION_THRESHOLD {
            tracing::warn!(
                cache = %self.cache_name,
                operation = self.operation,
                elapsed_ms = elapsed.as_millis() as u64,
                total_keys = self.total_key_count,
                "slow cache operation"
            );
        }

        match err {
            Some(err) if *err != CacheError::CacheMiss => {
                tracing::debug!(
                    cache = %self.cache_name,
                    operation = self.operation,
                    elapsed_us = elapsed.as_micros() as u64,
                    total_keys = self.total_key_count,
                    error = %err,
                    "cache operation failed"
                );
            }
            _ => {
                tracing::debug!(
                    cache = %self.cache_name,
                    operation = self.operation,
                    elapsed_us = elapsed.as_micros() as u64,
                    total_keys = self.total_key_count,
                    success_keys = self.success_key_count,
                    request_size = self.request_size,
                    response_size = self.response_size,
                    "cache operation"
                );
            }
        }
    }
}
