// tests/common/mod.rs
use std::sync::Arc;

use raster_pool::config::PoolConfig;
use raster_pool::pool;
use raster_pool::testing::MemoryOpener;

/// Fresh pool environment: tears down whatever the previous test left
/// behind, stores the configuration for the next lazy creation, and
/// installs a new opener.
pub fn setup(max_pool_size: usize) -> Arc<MemoryOpener> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    if pool::stats().is_some() {
        pool::prevent_destroy();
        pool::force_destroy();
    }
    pool::configure(PoolConfig { max_pool_size });
    let opener = MemoryOpener::new();
    pool::register_opener(opener.clone());
    opener
}

/// MRU→LRU list of entry paths currently in the pool.
pub fn pool_paths() -> Vec<String> {
    pool::contents().into_iter().map(|entry| entry.path).collect()
}
