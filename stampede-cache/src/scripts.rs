//! Server-side scripts and their registration

use tracing::{error, info};

use crate::error::{CacheError, Result, StoreError, StoreResult};
use crate::store::{ScriptRef, ScriptValue, StoreConnection};

/// Keys removed per `DEL` inside the bulk-delete script
pub const DELETE_CHUNK_SIZE: usize = 5000;

/// Returns 1 iff every key in `KEYS` exists; stops at the first miss.
pub const BATCH_EXISTS_SCRIPT: &str = r"
for _, key in ipairs(KEYS) do
    if redis.call('EXISTS', key) == 0 then
        return 0
    end
end
return 1
";

/// Deletes every key matching the glob in `ARGV[1]`, 5000 per `DEL`.
///
/// Replies `{matched, deleted}`, or `{matched, deleted, reason}` when a chunk
/// failed; chunks after a failure are not attempted.
pub const BULK_DELETE_SCRIPT: &str = r"
local unpack = table.unpack or unpack
local keys = redis.call('KEYS', ARGV[1])
local deleted = 0
for i = 1, #keys, 5000 do
    local last = math.min(i + 4999, #keys)
    local ok, removed = pcall(redis.call, 'DEL', unpack(keys, i, last))
    if not ok then
        local reason = type(removed) == 'table' and removed.err or tostring(removed)
        return {#keys, deleted, reason}
    end
    deleted = deleted + removed
end
return {#keys, deleted}
";

const BATCH_EXISTS_NAME: &str = "batch-exists";
const BULK_DELETE_NAME: &str = "bulk-delete";

/// References to the two loaded scripts. Read-only once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRegistry {
    batch_exists: ScriptRef,
    bulk_delete: ScriptRef,
}

impl ScriptRegistry {
    /// Load both scripts. Either failure fails the whole registration.
    pub async fn register(store: &dyn StoreConnection) -> Result<Self> {
        let batch_exists = load(store, BATCH_EXISTS_NAME, BATCH_EXISTS_SCRIPT).await?;
        let bulk_delete = load(store, BULK_DELETE_NAME, BULK_DELETE_SCRIPT).await?;
        Ok(Self {
            batch_exists,
            bulk_delete,
        })
    }

    pub fn batch_exists(&self) -> &ScriptRef {
        &self.batch_exists
    }

    pub fn bulk_delete(&self) -> &ScriptRef {
        &self.bulk_delete
    }
}

async fn load(
    store: &dyn StoreConnection,
    script: &'static str,
    source: &str,
) -> Result<ScriptRef> {
    match store.script_load(source).await {
        Ok(sha) => {
            info!(script, sha1 = %sha, "registered script");
            Ok(sha)
        }
        Err(source) => {
            error!(script, error = %source, "script registration failed");
            Err(CacheError::ScriptRegistration { script, source })
        }
    }
}

/// Decoded reply of [`BULK_DELETE_SCRIPT`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationOutcome {
    Complete {
        matched: u64,
        deleted: u64,
    },
    Aborted {
        matched: u64,
        deleted: u64,
        reason: String,
    },
}

impl InvalidationOutcome {
    pub fn from_reply(reply: ScriptValue) -> StoreResult<Self> {
        let items = match reply {
            ScriptValue::Array(items) => items,
            other => {
                return Err(StoreError::Protocol(format!(
                    "bulk delete returned {:?}",
                    other
                )));
            }
        };

        let count = |idx: usize| -> StoreResult<u64> {
            items
                .get(idx)
                .and_then(ScriptValue::as_int)
                .and_then(|n| u64::try_from(n).ok())
                .ok_or_else(|| {
                    StoreError::Protocol(format!("bulk delete reply slot {} malformed", idx))
                })
        };
        let matched = count(0)?;
        let deleted = count(1)?;

        match items.get(2) {
            None => Ok(Self::Complete { matched, deleted }),
            Some(ScriptValue::Bulk(reason)) => Ok(Self::Aborted {
                matched,
                deleted,
                reason: reason.clone(),
            }),
            Some(other) => Ok(Self::Aborted {
                matched,
                deleted,
                reason: format!("{:?}", other),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[tokio::test]
    async fn test_register_loads_both_scripts() {
        let store = MemoryStore::new();
        let registry = ScriptRegistry::register(&store).await.unwrap();

        assert_ne!(registry.batch_exists(), registry.bulk_delete());
        assert_eq!(store.stats().script_load, 2);

        // Content addressed: loading again yields identical references
        let again = ScriptRegistry::register(&store).await.unwrap();
        assert_eq!(registry, again);
    }

    #[tokio::test]
    async fn test_second_load_failure_fails_registration() {
        let store = MemoryStore::new();
        store.fail_script_load_on(2);

        let err = ScriptRegistry::register(&store).await.unwrap_err();
        assert!(matches!(
            err,
            CacheError::ScriptRegistration {
                script: "bulk-delete",
                ..
            }
        ));
    }

    #[test]
    fn test_script_chunk_size_matches_constant() {
        assert!(BULK_DELETE_SCRIPT.contains(&DELETE_CHUNK_SIZE.to_string()));
        assert!(BULK_DELETE_SCRIPT.contains(&(DELETE_CHUNK_SIZE - 1).to_string()));
    }

    #[test]
    fn test_outcome_decoding() {
        let complete = ScriptValue::Array(vec![ScriptValue::Int(3), ScriptValue::Int(3)]);
        assert_eq!(
            InvalidationOutcome::from_reply(complete).unwrap(),
            InvalidationOutcome::Complete {
                matched: 3,
                deleted: 3
            }
        );

        let aborted = ScriptValue::Array(vec![
            ScriptValue::Int(12000),
            ScriptValue::Int(5000),
            ScriptValue::Bulk("ERR busy".to_string()),
        ]);
        assert_eq!(
            InvalidationOutcome::from_reply(aborted).unwrap(),
            InvalidationOutcome::Aborted {
                matched: 12000,
                deleted: 5000,
                reason: "ERR busy".to_string()
            }
        );

        assert!(InvalidationOutcome::from_reply(ScriptValue::Int(1)).is_err());
        assert!(
            InvalidationOutcome::from_reply(ScriptValue::Array(vec![ScriptValue::Int(-1)]))
                .is_err()
        );
    }
}
