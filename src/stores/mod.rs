//! Store implementations for the cache library.

pub mod memory;
pub mod moka;

use std::sync::Arc;

use crate::config::{StoreBackend, StoreConfig};
use crate::store::Store;

pub use memory::HashMapStore;
pub use moka::MokaStore;

/// Build the store a config asks for.
pub(crate) fn build_store(config: &StoreConfig) -> Arc<dyn Store> {
    match config.backend {
        StoreBackend::Moka => Arc::new(MokaStore::new(config)),
        StoreBackend::HashMap => Arc::new(HashMapStore::new(config)),
    }
}
