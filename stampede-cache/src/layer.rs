//! Cache data layer

use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error, info};

use crate::config::CacheConfig;
use crate::context::CallContext;
use crate::error::{CacheError, Result, StoreError};
use crate::glob;
use crate::jitter::JitterPolicy;
use crate::scripts::{InvalidationOutcome, ScriptRegistry};
use crate::store::{RedisStore, SetEntry, StoreConnection};

/// A key/value pair for batch writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Kv {
    pub key: String,
    pub value: String,
}

impl Kv {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Result of a completed prefix invalidation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationReport {
    /// Glob the bulk-delete script ran against
    pub pattern: String,
    pub matched: u64,
    pub deleted: u64,
}

/// Jittered cache facade over a remote key-value store.
///
/// Cloning is cheap and clones share the connection and the script
/// references. Scripts are registered once, on [`initialize`](Self::initialize)
/// or on first use, whichever comes first.
///
/// Keys are sent to the store exactly as given. Only keys built with
/// [`namespaced_key`](Self::namespaced_key) sit under the configured prefix,
/// so [`clear_namespace`](Self::clear_namespace) never reaches a key written
/// outside it.
#[derive(Clone)]
pub struct CacheDataLayer {
    inner: Arc<Inner>,
}

struct Inner {
    store: Arc<dyn StoreConnection>,
    config: CacheConfig,
    jitter: JitterPolicy,
    scripts: OnceCell<ScriptRegistry>,
}

impl CacheDataLayer {
    /// Wrap an existing store connection. No round-trip happens until
    /// [`initialize`](Self::initialize) or the first operation.
    pub fn new(store: Arc<dyn StoreConnection>, config: CacheConfig) -> Result<Self> {
        config.validate()?;
        let jitter = JitterPolicy::new(config.cache_ttl_ms, config.jitter_spread);
        info!(
            "Initializing cache data layer prefix={} ttl_ms={} spread={}",
            config.key_prefix, config.cache_ttl_ms, config.jitter_spread
        );

        Ok(Self {
            inner: Arc::new(Inner {
                store,
                config,
                jitter,
                scripts: OnceCell::new(),
            }),
        })
    }

    /// Build a Redis connection from `config.redis` and register the scripts
    pub async fn connect(config: CacheConfig) -> Result<Self> {
        let url = config
            .redis
            .as_ref()
            .map(|redis| redis.url.clone())
            .ok_or_else(|| CacheError::InvalidConfig("redis.url is required".to_string()))?;
        let store = RedisStore::connect(&url)
            .await
            .map_err(|source| CacheError::store("connect", source))?;

        let layer = Self::new(Arc::new(store), config)?;
        layer.initialize().await?;
        Ok(layer)
    }

    /// Register the server-side scripts.
    ///
    /// Safe to call concurrently: the first caller does the work, the rest
    /// wait for it. A failed attempt is not cached, so a later call retries.
    pub async fn initialize(&self) -> Result<()> {
        self.scripts().await.map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.scripts.initialized()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    pub fn key_prefix(&self) -> &str {
        &self.inner.config.key_prefix
    }

    pub fn jitter(&self) -> &JitterPolicy {
        &self.inner.jitter
    }

    /// `<prefix>:<suffix>`
    pub fn namespaced_key(&self, suffix: impl AsRef<str>) -> String {
        format!("{}:{}", self.inner.config.key_prefix, suffix.as_ref())
    }

    /// Fetch one value. A miss is [`CacheError::NotFound`].
    pub async fn get(&self, cx: &CallContext, key: &str) -> Result<String> {
        const OP: &str = "get";
        let hint = self.inner.jitter.draw();
        if self.debug() {
            debug!(operation = OP, key, read_cache_ttl = ?hint);
        }

        let value = cx
            .run(OP, async {
                self.inner
                    .store
                    .get(key, hint)
                    .await
                    .map_err(|source| self.fail(OP, Some(key), source))
            })
            .await?;
        value.ok_or_else(|| CacheError::NotFound(key.to_string()))
    }

    /// Write one value with a freshly drawn expiry, or none when TTL is 0
    pub async fn set(&self, cx: &CallContext, key: &str, value: &str) -> Result<()> {
        const OP: &str = "set";
        let expire = self.inner.jitter.draw();
        if self.debug() {
            debug!(operation = OP, key, expire = ?expire);
        }

        cx.run(OP, async {
            self.inner
                .store
                .set(key, value, expire)
                .await
                .map_err(|source| self.fail(OP, Some(key), source))
        })
        .await
    }

    /// Remove one key; a missing key is not an error
    pub async fn delete(&self, cx: &CallContext, key: &str) -> Result<()> {
        const OP: &str = "delete";
        let keys = [key.to_string()];
        cx.run(OP, async {
            self.inner
                .store
                .del(&keys)
                .await
                .map(|_| ())
                .map_err(|source| self.fail(OP, Some(key), source))
        })
        .await
    }

    pub async fn exists(&self, cx: &CallContext, key: &str) -> Result<bool> {
        const OP: &str = "exists";
        cx.run(OP, async {
            self.inner
                .store
                .exists(key)
                .await
                .map_err(|source| self.fail(OP, Some(key), source))
        })
        .await
    }

    /// Fetch many values in one round-trip, aligned with `keys`.
    ///
    /// All-or-nothing: a failed or missing slot rejects the whole batch with
    /// [`CacheError::BatchPartialFailure`] naming that key. One read-cache
    /// hint is drawn for the whole batch.
    pub async fn batch_get(&self, cx: &CallContext, keys: &[String]) -> Result<Vec<String>> {
        const OP: &str = "batch_get";
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let hint = self.inner.jitter.draw();
        if self.debug() {
            debug!(operation = OP, keys = keys.len(), read_cache_ttl = ?hint);
        }

        let slots = cx
            .run(OP, async {
                self.inner
                    .store
                    .mget(keys, hint)
                    .await
                    .map_err(|source| self.fail(OP, None, source))
            })
            .await?;
        if slots.len() != keys.len() {
            let source = StoreError::Protocol(format!(
                "expected {} values, got {}",
                keys.len(),
                slots.len()
            ));
            return Err(self.fail(OP, None, source));
        }

        let mut values = Vec::with_capacity(keys.len());
        for (key, slot) in keys.iter().zip(slots) {
            match slot {
                Ok(Some(value)) => values.push(value),
                Ok(None) => return Err(self.batch_failure(OP, key, "key not found".to_string())),
                Err(err) => return Err(self.batch_failure(OP, key, err.to_string())),
            }
        }
        Ok(values)
    }

    /// Write many values.
    ///
    /// Without a TTL this is a single MSET. With a TTL every key gets its own
    /// jittered expiry and the SETs share one pipelined round-trip; the first
    /// failed slot is reported and already-applied writes stay applied.
    pub async fn batch_set(&self, cx: &CallContext, kvs: &[Kv]) -> Result<()> {
        const OP: &str = "batch_set";
        if kvs.is_empty() {
            return Ok(());
        }
        let jitter = &self.inner.jitter;

        if jitter.is_disabled() {
            if self.debug() {
                debug!(operation = OP, keys = kvs.len(), mode = "mset");
            }
            let pairs: Vec<(String, String)> = kvs
                .iter()
                .map(|kv| (kv.key.clone(), kv.value.clone()))
                .collect();
            return cx
                .run(OP, async {
                    self.inner
                        .store
                        .mset(&pairs)
                        .await
                        .map_err(|source| self.fail(OP, None, source))
                })
                .await;
        }

        let entries: Vec<SetEntry> = kvs
            .iter()
            .map(|kv| SetEntry {
                key: kv.key.clone(),
                value: kv.value.clone(),
                expire: jitter.draw(),
            })
            .collect();
        if self.debug() {
            debug!(operation = OP, keys = entries.len(), mode = "pipeline");
        }

        let results = cx
            .run(OP, async {
                self.inner
                    .store
                    .set_pipelined(&entries)
                    .await
                    .map_err(|source| self.fail(OP, None, source))
            })
            .await?;

        for (entry, result) in entries.iter().zip(results) {
            if let Err(err) = result {
                return Err(self.batch_failure(OP, &entry.key, err.to_string()));
            }
        }
        Ok(())
    }

    /// Remove many keys in one command; missing keys are ignored
    pub async fn batch_delete(&self, cx: &CallContext, keys: &[String]) -> Result<()> {
        const OP: &str = "batch_delete";
        if keys.is_empty() {
            return Ok(());
        }
        cx.run(OP, async {
            let removed = self
                .inner
                .store
                .del(keys)
                .await
                .map_err(|source| self.fail(OP, None, source))?;
            if self.debug() {
                debug!(operation = OP, keys = keys.len(), removed);
            }
            Ok(())
        })
        .await
    }

    /// True iff every key exists, checked atomically by a server-side script.
    /// An empty key set is vacuously true.
    pub async fn batch_exists(&self, cx: &CallContext, keys: &[String]) -> Result<bool> {
        const OP: &str = "batch_exists";
        if keys.is_empty() {
            return Ok(true);
        }
        cx.run(OP, async {
            let scripts = self.scripts().await?;
            self.inner
                .store
                .eval_sha(scripts.batch_exists(), keys, &[])
                .await
                .and_then(|reply| reply.to_bool())
                .map_err(|source| self.fail(OP, None, source))
        })
        .await
    }

    /// Delete every key under the configured namespace
    pub async fn clear_namespace(&self, cx: &CallContext) -> Result<InvalidationReport> {
        let pattern = glob::prefix_pattern(&self.inner.config.key_prefix);
        self.invalidate(cx, "clear_namespace", pattern).await
    }

    /// Delete every key under `prefix:`; `prefix` is matched literally
    pub async fn delete_keys_with_prefix(
        &self,
        cx: &CallContext,
        prefix: &str,
    ) -> Result<InvalidationReport> {
        let pattern = glob::prefix_pattern(prefix);
        self.invalidate(cx, "delete_keys_with_prefix", pattern).await
    }

    async fn invalidate(
        &self,
        cx: &CallContext,
        operation: &'static str,
        pattern: String,
    ) -> Result<InvalidationReport> {
        let outcome = cx
            .run(operation, async {
                let scripts = self.scripts().await?;
                let args = [pattern.clone()];
                self.inner
                    .store
                    .eval_sha(scripts.bulk_delete(), &[], &args)
                    .await
                    .and_then(InvalidationOutcome::from_reply)
                    .map_err(|source| self.fail(operation, None, source))
            })
            .await?;

        match outcome {
            InvalidationOutcome::Complete { matched, deleted } => {
                info!(operation, pattern = %pattern, matched, deleted, "bulk delete finished");
                Ok(InvalidationReport {
                    pattern,
                    matched,
                    deleted,
                })
            }
            InvalidationOutcome::Aborted {
                matched,
                deleted: 0,
                reason,
            } => {
                error!(operation, pattern = %pattern, matched, error = %reason, "bulk delete failed");
                Err(CacheError::store(operation, StoreError::Script(reason)))
            }
            InvalidationOutcome::Aborted {
                matched,
                deleted,
                reason,
            } => {
                error!(
                    operation,
                    pattern = %pattern,
                    matched,
                    deleted,
                    error = %reason,
                    "bulk delete stopped partway"
                );
                Err(CacheError::PartialInvalidation {
                    pattern,
                    matched,
                    deleted,
                    reason,
                })
            }
        }
    }

    async fn scripts(&self) -> Result<&ScriptRegistry> {
        self.inner
            .scripts
            .get_or_try_init(|| ScriptRegistry::register(self.inner.store.as_ref()))
            .await
    }

    fn debug(&self) -> bool {
        self.inner.config.debug
    }

    fn fail(&self, operation: &'static str, key: Option<&str>, source: StoreError) -> CacheError {
        match key {
            Some(key) => error!(operation, key, error = %source, "store call failed"),
            None => error!(operation, error = %source, "store call failed"),
        }
        CacheError::store(operation, source)
    }

    fn batch_failure(&self, operation: &'static str, key: &str, reason: String) -> CacheError {
        error!(operation, key, error = %reason, "batch element failed");
        CacheError::BatchPartialFailure {
            operation,
            key: key.to_string(),
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CallStats, MemoryStore};

    fn layer(ttl_ms: u64) -> (CacheDataLayer, MemoryStore) {
        let store = MemoryStore::new();
        let config = CacheConfig::new("app").with_ttl_ms(ttl_ms);
        let layer = CacheDataLayer::new(Arc::new(store.clone()), config).unwrap();
        (layer, store)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let store = MemoryStore::new();
        let result = CacheDataLayer::new(Arc::new(store), CacheConfig::new(""));
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[test]
    fn test_namespaced_key() {
        let (layer, _) = layer(0);
        assert_eq!(layer.namespaced_key("users:42"), "app:users:42");
        assert_eq!(layer.key_prefix(), "app");
    }

    #[tokio::test]
    async fn test_connect_requires_redis_url() {
        let result = CacheDataLayer::connect(CacheConfig::new("app")).await;
        assert!(matches!(result, Err(CacheError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_initialize_is_lazy_and_once() {
        let (layer, store) = layer(0);
        assert!(!layer.is_initialized());
        assert_eq!(store.stats().script_load, 0);

        layer.initialize().await.unwrap();
        layer.initialize().await.unwrap();
        assert!(layer.is_initialized());
        assert_eq!(store.stats().script_load, 2);
    }

    #[tokio::test]
    async fn test_script_ops_initialize_on_first_use() {
        let (layer, store) = layer(0);
        let cx = CallContext::background();

        assert!(layer.batch_exists(&cx, &["nope".to_string()]).await.is_ok());
        assert!(layer.is_initialized());
        assert_eq!(store.stats().script_load, 2);
    }

    #[tokio::test]
    async fn test_failed_initialize_can_retry() {
        let (layer, store) = layer(0);
        store.fail_script_load_on(1);

        let err = layer.initialize().await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::ScriptRegistration {
                script: "batch-exists",
                ..
            }
        ));
        assert!(!layer.is_initialized());

        layer.initialize().await.unwrap();
        assert!(layer.is_initialized());
    }

    #[tokio::test]
    async fn test_empty_batches_skip_round_trips() {
        let (layer, store) = layer(1_000);
        let cx = CallContext::background();

        assert!(layer.batch_get(&cx, &[]).await.unwrap().is_empty());
        layer.batch_set(&cx, &[]).await.unwrap();
        layer.batch_delete(&cx, &[]).await.unwrap();
        assert!(layer.batch_exists(&cx, &[]).await.unwrap());

        assert_eq!(store.stats(), CallStats::default());
    }
}
