//! Shared utilities for the cache library.

use std::time::{SystemTime, UNIX_EPOCH};

/// Build the store-level key for an optional namespace prefix.
///
/// Format: `{prefix}::{key}` when a prefix is configured, `{key}` otherwise.
pub fn fix_key(prefix: Option<&str>, key: &str) -> String {
    match prefix {
        Some(p) => format!("{}::{}", p, key),
        None => key.to_string(),
    }
}

/// Get the current time in whole seconds since UNIX epoch.
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

/// Simple pseudo-random number generator (0.0 to 1.0).
/// This avoids adding a dependency on rand crate.
pub fn rand_simple() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let state = RandomState::new();
    let mut hasher = state.build_hasher();
    hasher.write_u64(
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_nanos() as u64,
    );
    (hasher.finish() as f64) / (u64::MAX as f64)
}
