use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use colored::Colorize;
use stampede_cache::{CacheConfig, CacheDataLayer, CacheError, CallContext, InvalidationReport, Kv};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "stampede-cli")]
#[command(about = "Stampede CLI - inspect and invalidate a jittered Redis cache", long_about = None)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Redis URL (overrides the config file)
    #[arg(short, long, env = "REDIS_URL")]
    url: Option<String>,

    /// Key namespace (overrides the config file)
    #[arg(short, long)]
    prefix: Option<String>,

    /// Base TTL in milliseconds for writes (overrides the config file)
    #[arg(long)]
    ttl_ms: Option<u64>,

    /// Per-command deadline in milliseconds
    #[arg(long, default_value = "5000")]
    timeout_ms: u64,

    /// Verbose per-call logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Fetch one value
    Get { key: String },
    /// Write one value with a jittered TTL
    Set { key: String, value: String },
    /// Delete one key
    Del { key: String },
    /// Check whether a key exists
    Exists { key: String },
    /// Fetch several values in one round-trip
    Mget {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Delete several keys in one command
    Mdel {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Write key/value pairs: mset k1 v1 k2 v2 ...
    Mset {
        #[arg(required = true)]
        pairs: Vec<String>,
    },
    /// Check whether all keys exist
    Mexists {
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Delete every key under the configured namespace
    Clear,
    /// Delete every key under PREFIX:
    Purge { prefix: String },
}

impl Args {
    fn cache_config(&self) -> Result<CacheConfig> {
        let mut config = match &self.config {
            Some(path) => CacheConfig::from_file(path)
                .with_context(|| format!("failed to load config from {}", path.display()))?,
            None => CacheConfig::default(),
        };

        if let Some(url) = &self.url {
            config = config.with_redis_url(url.clone());
        }
        if let Some(prefix) = &self.prefix {
            config.key_prefix = prefix.clone();
        }
        if let Some(ttl_ms) = self.ttl_ms {
            config.cache_ttl_ms = ttl_ms;
        }
        if self.debug {
            config.debug = true;
        }
        if config.redis.is_none() {
            config = config.with_redis_url("redis://127.0.0.1:6379");
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.cache_config()?;
    info!(
        "Connecting namespace={} ttl_ms={}",
        config.key_prefix, config.cache_ttl_ms
    );
    let layer = CacheDataLayer::connect(config)
        .await
        .context("failed to initialize cache data layer")?;

    let cx = CallContext::with_timeout(Duration::from_millis(args.timeout_ms));
    let start = Instant::now();
    match execute(&layer, &cx, args.command).await {
        Ok(output) => {
            println!("{}", output);
            println!("{}", format!("({:.2?})", start.elapsed()).dimmed());
            Ok(())
        }
        Err(err) => {
            error!("{:#}", err);
            Err(err)
        }
    }
}

async fn execute(layer: &CacheDataLayer, cx: &CallContext, command: Command) -> Result<String> {
    let output = match command {
        Command::Get { key } => match layer.get(cx, &key).await {
            Ok(value) => format!("\"{}\"", value),
            Err(CacheError::NotFound(_)) => "(nil)".dimmed().to_string(),
            Err(err) => return Err(err.into()),
        },
        Command::Set { key, value } => {
            layer.set(cx, &key, &value).await?;
            "OK".green().to_string()
        }
        Command::Del { key } => {
            layer.delete(cx, &key).await?;
            "OK".green().to_string()
        }
        Command::Exists { key } => integer(layer.exists(cx, &key).await?),
        Command::Mget { keys } => layer
            .batch_get(cx, &keys)
            .await?
            .iter()
            .enumerate()
            .map(|(idx, value)| format!("{}) \"{}\"", idx + 1, value))
            .collect::<Vec<_>>()
            .join("\n"),
        Command::Mdel { keys } => {
            layer.batch_delete(cx, &keys).await?;
            "OK".green().to_string()
        }
        Command::Mset { pairs } => {
            layer.batch_set(cx, &parse_pairs(&pairs)?).await?;
            "OK".green().to_string()
        }
        Command::Mexists { keys } => integer(layer.batch_exists(cx, &keys).await?),
        Command::Clear => report(layer.clear_namespace(cx).await)?,
        Command::Purge { prefix } => report(layer.delete_keys_with_prefix(cx, &prefix).await)?,
    };
    Ok(output)
}

fn parse_pairs(pairs: &[String]) -> Result<Vec<Kv>> {
    if pairs.len() % 2 != 0 {
        bail!("Usage: mset key value [key value ...]");
    }
    Ok(pairs
        .chunks(2)
        .map(|pair| Kv::new(pair[0].clone(), pair[1].clone()))
        .collect())
}

fn integer(flag: bool) -> String {
    format!("(integer) {}", u8::from(flag))
}

/// Completed invalidations print a summary; failures print one line and
/// still surface as an error so the exit status is non-zero.
fn report(result: Result<InvalidationReport, CacheError>) -> Result<String> {
    match result {
        Ok(report) => Ok(format!(
            "{} {} of {} keys matching {}",
            "deleted".green(),
            report.deleted,
            report.matched,
            report.pattern
        )),
        Err(err) => {
            eprintln!("{}", failure_line(&err));
            Err(err.into())
        }
    }
}

fn failure_line(err: &CacheError) -> String {
    match err {
        CacheError::PartialInvalidation {
            pattern,
            matched,
            deleted,
            reason,
        } => format!(
            "{} {} of {} keys matching {} before failing: {}",
            "PARTIAL".yellow().bold(),
            deleted,
            matched,
            pattern,
            reason
        ),
        other => format!("{} {}", "ERROR".red().bold(), other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stampede_cache::{DELETE_CHUNK_SIZE, MemoryStore};
    use std::sync::Arc;

    fn memory_layer() -> (CacheDataLayer, MemoryStore) {
        let store = MemoryStore::new();
        let layer = CacheDataLayer::new(Arc::new(store.clone()), CacheConfig::new("orders"))
            .unwrap();
        (layer, store)
    }

    #[test]
    fn test_parse_pairs() {
        let pairs = vec!["a".to_string(), "1".to_string(), "b".to_string(), "2".to_string()];
        let kvs = parse_pairs(&pairs).unwrap();
        assert_eq!(kvs, vec![Kv::new("a", "1"), Kv::new("b", "2")]);

        assert!(parse_pairs(&["lonely".to_string()]).is_err());
    }

    #[test]
    fn test_flag_overrides() {
        let args = Args::parse_from([
            "stampede-cli",
            "--url",
            "redis://cache:6379",
            "--prefix",
            "orders",
            "--ttl-ms",
            "1500",
            "--debug",
            "purge",
            "orders:eu",
        ]);
        let config = args.cache_config().unwrap();
        assert_eq!(config.redis.unwrap().url, "redis://cache:6379");
        assert_eq!(config.key_prefix, "orders");
        assert_eq!(config.cache_ttl_ms, 1500);
        assert!(config.debug);
        assert!(matches!(args.command, Command::Purge { ref prefix } if prefix == "orders:eu"));
    }

    #[test]
    fn test_report_formats_partial() {
        colored::control::set_override(false);
        let text = failure_line(&CacheError::PartialInvalidation {
            pattern: "orders:*".to_string(),
            matched: 12,
            deleted: 5,
            reason: "ERR busy".to_string(),
        });
        assert_eq!(
            text,
            "PARTIAL 5 of 12 keys matching orders:* before failing: ERR busy"
        );
    }

    #[tokio::test]
    async fn test_purge_store_failure_is_error() {
        let (layer, store) = memory_layer();
        let cx = CallContext::background();
        layer.initialize().await.unwrap();
        store.set_unavailable(true);

        let result = execute(
            &layer,
            &cx,
            Command::Purge {
                prefix: "orders".to_string(),
            },
        )
        .await;
        assert!(result.is_err());

        let result = execute(&layer, &cx, Command::Clear).await;
        let err = result.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CacheError>(),
            Some(CacheError::Store { .. })
        ));
    }

    #[tokio::test]
    async fn test_partial_purge_is_error() {
        let (layer, store) = memory_layer();
        let cx = CallContext::background();
        for i in 0..DELETE_CHUNK_SIZE + 1 {
            store.seed(format!("bulk:{}", i), "v");
        }
        store.fail_script_del_on(2);

        let err = execute(
            &layer,
            &cx,
            Command::Purge {
                prefix: "bulk".to_string(),
            },
        )
        .await
        .unwrap_err();
        assert!(
            err.downcast_ref::<CacheError>()
                .is_some_and(CacheError::is_partial)
        );
    }

    #[tokio::test]
    async fn test_clear_success() {
        let (layer, store) = memory_layer();
        let cx = CallContext::background();
        store.seed("orders:1", "a");
        store.seed("users:1", "b");

        let output = execute(&layer, &cx, Command::Clear).await.unwrap();
        assert!(output.contains("1 of 1 keys matching orders:*"));
        assert_eq!(store.keys(), vec!["users:1"]);
    }
}
