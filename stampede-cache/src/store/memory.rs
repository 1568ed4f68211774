//! In-process store with an embedded Lua engine
//!
//! Behaves like a single Redis node for the command subset the data layer
//! uses, including `SCRIPT LOAD`/`EVALSHA` with a `redis.call` bridge. It
//! doubles as the test double: every round-trip is counted and faults can be
//! injected per command.

use async_trait::async_trait;
use mlua::{Lua, Value as LuaValue, Variadic};
use parking_lot::{Mutex, RwLock};
use sha1::{Digest, Sha1};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use super::{MGetEntry, ScriptRef, ScriptValue, SetEntry, StoreConnection};
use crate::error::{StoreError, StoreResult};
use crate::glob;

const DISABLED_GLOBALS: &[&str] = &[
    "dofile",
    "load",
    "loadfile",
    "require",
    "collectgarbage",
    "package",
    "os",
    "io",
    "debug",
];

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| at > now)
    }
}

/// Round-trips served, per command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallStats {
    pub get: u64,
    pub set: u64,
    pub del: u64,
    pub exists: u64,
    pub mget: u64,
    pub mset: u64,
    pub pipelines: u64,
    pub script_load: u64,
    pub eval_sha: u64,
}

#[derive(Default)]
struct Counters {
    get: AtomicU64,
    set: AtomicU64,
    del: AtomicU64,
    exists: AtomicU64,
    mget: AtomicU64,
    mset: AtomicU64,
    pipelines: AtomicU64,
    script_load: AtomicU64,
    eval_sha: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> CallStats {
        CallStats {
            get: self.get.load(Ordering::Relaxed),
            set: self.set.load(Ordering::Relaxed),
            del: self.del.load(Ordering::Relaxed),
            exists: self.exists.load(Ordering::Relaxed),
            mget: self.mget.load(Ordering::Relaxed),
            mset: self.mset.load(Ordering::Relaxed),
            pipelines: self.pipelines.load(Ordering::Relaxed),
            script_load: self.script_load.load(Ordering::Relaxed),
            eval_sha: self.eval_sha.load(Ordering::Relaxed),
        }
    }
}

#[derive(Default)]
struct Faults {
    unavailable: AtomicBool,
    fail_script_load_on: AtomicU64,
    fail_script_del_on: AtomicU64,
    script_del_calls: AtomicU64,
    poisoned_keys: Mutex<HashSet<String>>,
    latency: Mutex<Option<Duration>>,
}

/// State reachable from inside running scripts
#[derive(Default)]
struct Shared {
    data: RwLock<HashMap<String, Entry>>,
    faults: Faults,
}

impl Shared {
    fn read(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.data
            .read()
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone())
    }

    fn contains(&self, key: &str) -> bool {
        let now = Instant::now();
        self.data
            .read()
            .get(key)
            .is_some_and(|entry| entry.is_live(now))
    }

    fn write(&self, key: &str, value: &str, expire: Option<Duration>) {
        let entry = Entry {
            value: value.to_string(),
            expires_at: expire.map(|ttl| Instant::now() + ttl),
        };
        self.data.write().insert(key.to_string(), entry);
    }

    fn remove(&self, keys: &[String]) -> u64 {
        let now = Instant::now();
        let mut data = self.data.write();
        keys.iter()
            .filter_map(|key| data.remove(key))
            .filter(|entry| entry.is_live(now))
            .count() as u64
    }

    fn keys_matching(&self, pattern: &str) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .data
            .read()
            .iter()
            .filter(|(key, entry)| entry.is_live(now) && glob::matches(pattern, key))
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn is_poisoned(&self, key: &str) -> bool {
        self.faults.poisoned_keys.lock().contains(key)
    }
}

/// In-memory store connection
#[derive(Clone, Default)]
pub struct MemoryStore {
    shared: Arc<Shared>,
    scripts: Arc<RwLock<HashMap<String, Arc<String>>>>,
    // Commands hold this shared; scripts hold it exclusively so they run
    // without interleaving.
    gate: Arc<RwLock<()>>,
    counters: Arc<Counters>,
    read_cache_hints: Arc<Mutex<Vec<Option<Duration>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of round-trips served so far
    pub fn stats(&self) -> CallStats {
        self.counters.snapshot()
    }

    /// Read-cache hints received by `get`/`mget`, in call order
    pub fn read_cache_hints(&self) -> Vec<Option<Duration>> {
        self.read_cache_hints.lock().clone()
    }

    /// Insert without counting a round-trip
    pub fn seed<K, V>(&self, key: K, value: V)
    where
        K: AsRef<str>,
        V: AsRef<str>,
    {
        self.shared.write(key.as_ref(), value.as_ref(), None);
    }

    /// Remaining time to live: `None` if the key is missing,
    /// `Some(None)` if it never expires
    pub fn ttl(&self, key: &str) -> Option<Option<Duration>> {
        let now = Instant::now();
        let data = self.shared.data.read();
        let entry = data.get(key).filter(|entry| entry.is_live(now))?;
        Some(entry.expires_at.map(|at| at.saturating_duration_since(now)))
    }

    /// Live keys, sorted
    pub fn keys(&self) -> Vec<String> {
        self.shared.keys_matching("*")
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every command fails with [`StoreError::Unavailable`] while set
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared
            .faults
            .unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    /// Fail the `nth` (1-based) `SCRIPT LOAD` from now on
    pub fn fail_script_load_on(&self, nth: u64) {
        let served = self.counters.script_load.load(Ordering::SeqCst);
        self.shared
            .faults
            .fail_script_load_on
            .store(served + nth, Ordering::SeqCst);
    }

    /// Fail the `nth` (1-based) `DEL` issued from inside a script from now on
    pub fn fail_script_del_on(&self, nth: u64) {
        let faults = &self.shared.faults;
        let served = faults.script_del_calls.load(Ordering::SeqCst);
        faults.fail_script_del_on.store(served + nth, Ordering::SeqCst);
    }

    /// Make `key` carry an error marker in MGET replies and fail pipelined SETs
    pub fn poison_key(&self, key: impl Into<String>) {
        self.shared.faults.poisoned_keys.lock().insert(key.into());
    }

    /// Delay every command by `latency`
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.shared.faults.latency.lock() = latency;
    }

    async fn round_trip(&self, counter: &AtomicU64) -> StoreResult<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let latency = *self.shared.faults.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if self.shared.faults.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("connection refused".to_string()));
        }
        Ok(())
    }

    fn record_hint(&self, hint: Option<Duration>) {
        self.read_cache_hints.lock().push(hint);
    }
}

#[async_trait]
impl StoreConnection for MemoryStore {
    async fn get(&self, key: &str, read_cache_ttl: Option<Duration>) -> StoreResult<Option<String>> {
        self.round_trip(&self.counters.get).await?;
        self.record_hint(read_cache_ttl);
        let _gate = self.gate.read();
        Ok(self.shared.read(key))
    }

    async fn set(&self, key: &str, value: &str, expire: Option<Duration>) -> StoreResult<()> {
        self.round_trip(&self.counters.set).await?;
        let _gate = self.gate.read();
        self.shared.write(key, value, expire);
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> StoreResult<u64> {
        self.round_trip(&self.counters.del).await?;
        let _gate = self.gate.read();
        Ok(self.shared.remove(keys))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.round_trip(&self.counters.exists).await?;
        let _gate = self.gate.read();
        Ok(self.shared.contains(key))
    }

    async fn mget(
        &self,
        keys: &[String],
        read_cache_ttl: Option<Duration>,
    ) -> StoreResult<Vec<MGetEntry>> {
        self.round_trip(&self.counters.mget).await?;
        self.record_hint(read_cache_ttl);
        let _gate = self.gate.read();
        Ok(keys
            .iter()
            .map(|key| {
                if self.shared.is_poisoned(key) {
                    Err(StoreError::Unavailable(format!("slot for {} failed", key)))
                } else {
                    Ok(self.shared.read(key))
                }
            })
            .collect())
    }

    async fn mset(&self, pairs: &[(String, String)]) -> StoreResult<()> {
        self.round_trip(&self.counters.mset).await?;
        let _gate = self.gate.read();
        for (key, value) in pairs {
            self.shared.write(key, value, None);
        }
        Ok(())
    }

    async fn set_pipelined(&self, entries: &[SetEntry]) -> StoreResult<Vec<StoreResult<()>>> {
        self.round_trip(&self.counters.pipelines).await?;
        let _gate = self.gate.read();
        Ok(entries
            .iter()
            .map(|entry| {
                if self.shared.is_poisoned(&entry.key) {
                    return Err(StoreError::Unavailable(format!(
                        "SET {} rejected",
                        entry.key
                    )));
                }
                self.shared.write(&entry.key, &entry.value, entry.expire);
                Ok(())
            })
            .collect())
    }

    async fn script_load(&self, source: &str) -> StoreResult<ScriptRef> {
        self.round_trip(&self.counters.script_load).await?;
        let served = self.counters.script_load.load(Ordering::SeqCst);
        if self.shared.faults.fail_script_load_on.load(Ordering::SeqCst) == served {
            return Err(StoreError::Unavailable("SCRIPT LOAD rejected".to_string()));
        }

        let sha = compute_sha1(source);
        self.scripts
            .write()
            .entry(sha.clone())
            .or_insert_with(|| Arc::new(source.to_string()));
        debug!("SCRIPT LOAD sha1={}", sha);
        Ok(ScriptRef::new(sha))
    }

    async fn eval_sha(
        &self,
        script: &ScriptRef,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<ScriptValue> {
        self.round_trip(&self.counters.eval_sha).await?;
        let source = self
            .scripts
            .read()
            .get(script.as_str())
            .cloned()
            .ok_or_else(|| {
                StoreError::Script("NOSCRIPT No matching script. Please use EVAL.".to_string())
            })?;

        let _gate = self.gate.write();
        run_script(&self.shared, &source, keys, args)
            .map_err(|err| StoreError::Script(err.to_string()))
    }
}

fn compute_sha1(source: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

fn run_script(
    shared: &Arc<Shared>,
    source: &str,
    keys: &[String],
    args: &[String],
) -> mlua::Result<ScriptValue> {
    let lua = Lua::new();
    let globals = lua.globals();
    for symbol in DISABLED_GLOBALS {
        globals.set(*symbol, LuaValue::Nil)?;
    }

    globals.set("KEYS", lua.create_sequence_from(keys.iter().cloned())?)?;
    globals.set("ARGV", lua.create_sequence_from(args.iter().cloned())?)?;

    let redis_table = lua.create_table()?;
    let bridge = Arc::clone(shared);
    let call_fn = lua.create_function(
        move |lua, (command, args): (String, Variadic<LuaValue>)| {
            handle_redis_call(lua, &bridge, &command, &args)
        },
    )?;
    redis_table.set("call", call_fn)?;
    globals.set("redis", redis_table)?;

    let value: LuaValue = lua.load(source).eval()?;
    lua_to_script_value(value)
}

fn handle_redis_call(
    lua: &Lua,
    shared: &Shared,
    command: &str,
    args: &Variadic<LuaValue>,
) -> mlua::Result<LuaValue> {
    let command_name = command.to_ascii_uppercase();
    let args = args
        .iter()
        .map(|arg| lua_value_to_string(arg, &command_name))
        .collect::<mlua::Result<Vec<_>>>()?;

    match command_name.as_str() {
        "GET" => {
            ensure_min_args(&args, 1, &command_name)?;
            // A nil bulk reply reaches Lua as false
            Ok(match shared.read(&args[0]) {
                Some(value) => LuaValue::String(lua.create_string(value)?),
                None => LuaValue::Boolean(false),
            })
        }
        "SET" => {
            ensure_min_args(&args, 2, &command_name)?;
            let expire = match args.get(2).map(|opt| opt.to_ascii_uppercase()) {
                Some(opt) if opt == "PX" => Some(Duration::from_millis(parse_u64(
                    args.get(3),
                    &command_name,
                )?)),
                Some(opt) if opt == "EX" => Some(Duration::from_secs(parse_u64(
                    args.get(3),
                    &command_name,
                )?)),
                Some(opt) => {
                    return Err(mlua::Error::RuntimeError(format!(
                        "ERR syntax error in SET option {}",
                        opt
                    )));
                }
                None => None,
            };
            shared.write(&args[0], &args[1], expire);
            Ok(LuaValue::String(lua.create_string("OK")?))
        }
        "DEL" => {
            ensure_min_args(&args, 1, &command_name)?;
            let faults = &shared.faults;
            let call = faults.script_del_calls.fetch_add(1, Ordering::SeqCst) + 1;
            if faults.fail_script_del_on.load(Ordering::SeqCst) == call {
                return Err(mlua::Error::RuntimeError(
                    "ERR DEL failed: store unavailable".to_string(),
                ));
            }
            Ok(LuaValue::Integer(shared.remove(&args) as i64))
        }
        "EXISTS" => {
            ensure_min_args(&args, 1, &command_name)?;
            let count = args.iter().filter(|key| shared.contains(key)).count();
            Ok(LuaValue::Integer(count as i64))
        }
        "KEYS" => {
            ensure_min_args(&args, 1, &command_name)?;
            let keys = shared.keys_matching(&args[0]);
            Ok(LuaValue::Table(lua.create_sequence_from(keys)?))
        }
        _ => Err(mlua::Error::RuntimeError(format!(
            "ERR unknown command '{}' called from script",
            command
        ))),
    }
}

fn ensure_min_args(args: &[String], min: usize, command: &str) -> mlua::Result<()> {
    if args.len() < min {
        return Err(mlua::Error::RuntimeError(format!(
            "ERR wrong number of arguments for '{}' command",
            command
        )));
    }
    Ok(())
}

fn parse_u64(value: Option<&String>, command: &str) -> mlua::Result<u64> {
    value
        .and_then(|v| v.parse::<u64>().ok())
        .filter(|v| *v > 0)
        .ok_or_else(|| {
            mlua::Error::RuntimeError(format!("ERR invalid expire time in '{}' command", command))
        })
}

fn lua_value_to_string(value: &LuaValue, command: &str) -> mlua::Result<String> {
    match value {
        LuaValue::String(s) => {
            let bytes = s.as_bytes();
            Ok(String::from_utf8_lossy(bytes.as_ref()).into_owned())
        }
        LuaValue::Integer(i) => Ok(i.to_string()),
        LuaValue::Number(n) => Ok(n.to_string()),
        other => Err(mlua::Error::RuntimeError(format!(
            "ERR {} arguments must be strings or integers (got {})",
            command,
            other.type_name()
        ))),
    }
}

fn lua_to_script_value(value: LuaValue) -> mlua::Result<ScriptValue> {
    match value {
        LuaValue::Nil | LuaValue::Boolean(false) => Ok(ScriptValue::Nil),
        LuaValue::Boolean(true) => Ok(ScriptValue::Int(1)),
        LuaValue::Integer(i) => Ok(ScriptValue::Int(i)),
        LuaValue::Number(n) => Ok(ScriptValue::Int(n as i64)),
        LuaValue::String(s) => {
            let bytes = s.as_bytes();
            Ok(ScriptValue::Bulk(
                String::from_utf8_lossy(bytes.as_ref()).into_owned(),
            ))
        }
        LuaValue::Table(table) => {
            let mut items = Vec::new();
            for value in table.sequence_values::<LuaValue>() {
                items.push(lua_to_script_value(value?)?);
            }
            Ok(ScriptValue::Array(items))
        }
        LuaValue::Error(err) => Err(*err),
        other => Err(mlua::Error::RuntimeError(format!(
            "unsupported script return type: {}",
            other.type_name()
        ))),
    }
}
