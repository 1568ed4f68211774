//! Store connection seam
//!
//! The data layer only talks to the store through [`StoreConnection`], so the
//! production Redis backend and the in-process [`MemoryStore`] are
//! interchangeable.

pub mod memory;
pub mod redis_store;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

use crate::error::{StoreError, StoreResult};

pub use memory::{CallStats, MemoryStore};
pub use redis_store::RedisStore;

/// Content-addressed handle returned by `SCRIPT LOAD` (hex SHA1 of the body)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ScriptRef(String);

impl ScriptRef {
    pub fn new(sha1: impl Into<String>) -> Self {
        Self(sha1.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ScriptRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Script reply, converted the way Redis converts Lua return values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScriptValue {
    Nil,
    Int(i64),
    Bulk(String),
    Array(Vec<ScriptValue>),
}

impl ScriptValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            Self::Bulk(s) => s.parse().ok(),
            _ => None,
        }
    }

    /// Redis truthiness for integer replies: anything but 0 or nil
    pub fn to_bool(&self) -> StoreResult<bool> {
        match self {
            Self::Nil => Ok(false),
            Self::Int(i) => Ok(*i != 0),
            other => Err(StoreError::Protocol(format!(
                "expected integer reply, got {:?}",
                other
            ))),
        }
    }
}

/// One positional MGET slot: a value, a miss, or an error marker
pub type MGetEntry = StoreResult<Option<String>>;

/// One pipelined `SET` with its own expiry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetEntry {
    pub key: String,
    pub value: String,
    pub expire: Option<Duration>,
}

/// A connected store client.
///
/// Implementations must tolerate many concurrent in-flight calls.
/// `read_cache_ttl` is a hint for transports that keep a client-side read
/// cache; transports without one ignore it.
#[async_trait]
pub trait StoreConnection: Send + Sync {
    async fn get(&self, key: &str, read_cache_ttl: Option<Duration>) -> StoreResult<Option<String>>;

    /// `expire` is applied atomically with the write
    async fn set(&self, key: &str, value: &str, expire: Option<Duration>) -> StoreResult<()>;

    /// Returns how many keys were actually removed
    async fn del(&self, keys: &[String]) -> StoreResult<u64>;

    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// One round-trip; the result is aligned with `keys`
    async fn mget(
        &self,
        keys: &[String],
        read_cache_ttl: Option<Duration>,
    ) -> StoreResult<Vec<MGetEntry>>;

    /// Single multi-set command without expiry
    async fn mset(&self, pairs: &[(String, String)]) -> StoreResult<()>;

    /// One pipelined round-trip of independent `SET` commands, results aligned
    /// with `entries`
    async fn set_pipelined(&self, entries: &[SetEntry]) -> StoreResult<Vec<StoreResult<()>>>;

    async fn script_load(&self, source: &str) -> StoreResult<ScriptRef>;

    async fn eval_sha(
        &self,
        script: &ScriptRef,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<ScriptValue>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_script_value_bool() {
        assert!(ScriptValue::Int(1).to_bool().unwrap());
        assert!(!ScriptValue::Int(0).to_bool().unwrap());
        assert!(!ScriptValue::Nil.to_bool().unwrap());
        assert!(ScriptValue::Bulk("1".into()).to_bool().is_err());
    }

    #[test]
    fn test_script_value_int() {
        assert_eq!(ScriptValue::Int(5).as_int(), Some(5));
        assert_eq!(ScriptValue::Bulk("12".into()).as_int(), Some(12));
        assert_eq!(ScriptValue::Array(vec![]).as_int(), None);
    }
}
