//! Common test utilities

use std::sync::Arc;
use stampede_cache::{CacheConfig, CacheDataLayer, MemoryStore};

/// Setup a data layer over a fresh in-memory store
#[allow(dead_code)] // Used by other test modules
pub fn setup_layer(ttl_ms: u64) -> (CacheDataLayer, MemoryStore) {
    setup_layer_with(CacheConfig::new("app").with_ttl_ms(ttl_ms))
}

/// Route `tracing` output through the test harness; `RUST_LOG` selects the level
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

#[allow(dead_code)]
pub fn setup_layer_with(config: CacheConfig) -> (CacheDataLayer, MemoryStore) {
    init_tracing();
    let store = MemoryStore::new();
    let layer = CacheDataLayer::new(Arc::new(store.clone()), config).unwrap();
    (layer, store)
}

#[allow(dead_code)]
pub fn keys(list: &[&str]) -> Vec<String> {
    list.iter().map(|k| k.to_string()).collect()
}

/// Setup a data layer for S2S tests (requires running Redis)
#[allow(dead_code)] // Used by S2S test modules
pub async fn setup_s2s_layer(prefix: &str, ttl_ms: u64) -> CacheDataLayer {
    init_tracing();
    let url = std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string());
    let config = CacheConfig::new(prefix)
        .with_ttl_ms(ttl_ms)
        .with_redis_url(url);
    CacheDataLayer::connect(config)
        .await
        .expect("Failed to connect S2S layer")
}
