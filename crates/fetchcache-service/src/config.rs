use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::fs;
use std::num::NonZeroUsize;
use std::ops::BitOr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, de};
use tracing::level_filters::LevelFilter;

const MEGABYTE: u64 = 1024 * 1024;

/// Controls the log format
#[derive(Clone, Copy, Debug, Eq, PartialEq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Auto detect (pretty for tty, simplified for other)
    Auto,
    /// With colors
    Pretty,
    /// Simplified log output
    Simplified,
    /// Dump out JSON lines
    Json,
}

/// Categories of cache activity that are logged at `INFO` level.
///
/// Activity in a disabled category is still emitted, but only at `TRACE` level.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct LogCategories(u8);

impl LogCategories {
    pub const NOTHING: Self = Self(0);
    /// Fetches handed to the fetch collaborator.
    pub const REQUESTS: Self = Self(1 << 0);
    /// Responses received from the fetch collaborator.
    pub const RESPONSES: Self = Self(1 << 1);
    /// Failed fetches and storage errors.
    pub const ERRORS: Self = Self(1 << 2);
    /// Cache hits, misses and writes.
    pub const CACHE: Self = Self(1 << 3);
    /// Entries removed by expiry sweeps, size eviction or flushes.
    pub const EVICTION: Self = Self(1 << 4);
    pub const ALL: Self = Self(0b1_1111);

    const NAMES: &'static [(&'static str, Self)] = &[
        ("nothing", Self::NOTHING),
        ("requests", Self::REQUESTS),
        ("responses", Self::RESPONSES),
        ("errors", Self::ERRORS),
        ("cache", Self::CACHE),
        ("eviction", Self::EVICTION),
        ("all", Self::ALL),
    ];

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    fn from_name(name: &str) -> Option<Self> {
        Self::NAMES
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, c)| *c)
    }
}

impl BitOr for LogCategories {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Controls the logging system.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Logging {
    /// The log level for fetchcache.
    #[serde(deserialize_with = "deserialize_level_filter")]
    pub level: LevelFilter,
    /// Controls the log format.
    pub format: LogFormat,
    /// When set to true, backtraces are forced on.
    pub enable_backtraces: bool,
    /// Which categories of cache activity are promoted to `INFO` logs.
    #[serde(deserialize_with = "deserialize_log_categories")]
    pub categories: LogCategories,
}

impl Default for Logging {
    fn default() -> Self {
        Logging {
            level: LevelFilter::INFO,
            format: LogFormat::Auto,
            enable_backtraces: true,
            categories: LogCategories::ERRORS,
        }
    }
}

/// Control the metrics.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Metrics {
    /// host/port of statsd instance
    pub statsd: Option<String>,
    /// The prefix that should be added to all metrics.
    pub prefix: String,
    /// A tag name to report the hostname to, for each metric. Defaults to not sending such a tag.
    pub hostname_tag: Option<String>,
    /// A map containing custom tags and their values.
    ///
    /// These tags will be appended to every metric.
    pub custom_tags: BTreeMap<String, String>,
}

impl Default for Metrics {
    fn default() -> Self {
        Metrics {
            statsd: env::var("STATSD_SERVER").ok(),
            prefix: "fetchcache".into(),
            hostname_tag: None,
            custom_tags: BTreeMap::new(),
        }
    }
}

/// Limits and expiry of a single named cache instance.
#[derive(Debug, Clone, Copy, Deserialize, Eq, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    /// Budget of the disk tier in megabytes. `0` means unlimited.
    pub max_disk_size_mb: u64,

    /// Budget of the in-memory tier in megabytes. `None` means unbounded.
    pub max_memory_size_mb: Option<u64>,

    /// Maximum age of entries written without an explicit expiry.
    ///
    /// `None` means entries never expire on their own.
    #[serde(with = "humantime_serde")]
    pub max_age: Option<Duration>,

    /// How many times a transiently failing fetch is attempted before its failure
    /// is surfaced to the callers.
    pub max_attempts: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_disk_size_mb: 20,
            max_memory_size_mb: None,
            max_age: Some(Duration::from_secs(2_592_000)),
            max_attempts: 1,
        }
    }
}

impl CacheConfig {
    /// Disk budget in bytes, `None` if unlimited.
    pub fn max_disk_size(&self) -> Option<u64> {
        (self.max_disk_size_mb > 0).then(|| self.max_disk_size_mb.saturating_mul(MEGABYTE))
    }

    /// Memory budget in bytes, `None` if unbounded.
    pub fn max_memory_size(&self) -> Option<u64> {
        self.max_memory_size_mb.map(|mb| mb.saturating_mul(MEGABYTE))
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheConfigs {
    /// Configuration of the default cache instance, and the base for instances
    /// that have no entry in [`named`](Self::named).
    pub default: CacheConfig,

    /// Per-instance overrides, keyed by cache name.
    pub named: BTreeMap<String, CacheConfig>,

    /// Budget (in megabytes) of the in-memory tier holding decoded items.
    pub decoded_memory_size_mb: u64,
}

impl Default for CacheConfigs {
    fn default() -> Self {
        Self {
            default: CacheConfig::default(),
            named: BTreeMap::new(),
            decoded_memory_size_mb: 100,
        }
    }
}

impl CacheConfigs {
    /// Returns the configuration of the cache instance called `name`.
    pub fn for_name(&self, name: &str) -> CacheConfig {
        self.named.get(name).copied().unwrap_or(self.default)
    }

    pub fn decoded_memory_size(&self) -> u64 {
        self.decoded_memory_size_mb.saturating_mul(MEGABYTE)
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// The maximum number of fetches running concurrently on the fast queue.
    ///
    /// Defaults to twice the available parallelism of the host.
    pub fast_concurrency: Option<NonZeroUsize>,
}

impl QueueConfig {
    pub fn fast_concurrency(&self) -> usize {
        match self.fast_concurrency {
            Some(n) => n.get(),
            None => std::thread::available_parallelism()
                .map(|n| n.get() * 2)
                .unwrap_or(4),
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Which directory to use for the disk tier. Default is to only cache in memory.
    pub cache_dir: Option<PathBuf>,

    /// Configuration for internal logging.
    pub logging: Logging,

    /// Configuration for reporting metrics to a statsd instance.
    pub metrics: Metrics,

    /// DSN to report internal errors to
    pub sentry_dsn: Option<String>,

    /// Limits of the individual cache instances.
    pub caches: CacheConfigs,

    /// Concurrency of the fetch queues.
    pub queues: QueueConfig,

    /// Interval of the periodic expiry sweep. No periodic sweep is run when unset.
    #[serde(with = "humantime_serde")]
    pub cleanup_interval: Option<Duration>,
}

impl Config {
    /// Return a cache directory `dir`, it is joined with the configured base cache directory.
    ///
    /// If there is no base cache directory configured this means no caching should happen
    /// on disk and this returns None.
    pub fn cache_dir<P>(&self, dir: P) -> Option<PathBuf>
    where
        P: AsRef<Path>,
    {
        self.cache_dir.as_ref().map(|base| base.join(dir))
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            cache_dir: None,
            logging: Logging::default(),
            metrics: Metrics::default(),
            sentry_dsn: None,
            caches: CacheConfigs::default(),
            queues: QueueConfig::default(),
            cleanup_interval: None,
        }
    }
}

impl Config {
    pub fn get(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_reader(
                fs::File::open(path).context("failed to open configuration file")?,
            ),
            None => Ok(Config::default()),
        }
    }

    fn from_reader(mut reader: impl std::io::Read) -> Result<Self> {
        let mut config = String::new();
        reader
            .read_to_string(&mut config)
            .context("failed reading config file")?;
        // check for empty files explicitly
        if config.trim().is_empty() {
            anyhow::bail!("config file empty");
        }
        serde_yaml::from_str(&config).context("failed to parse config YAML")
    }
}

#[derive(Debug)]
struct LevelFilterVisitor;

impl de::Visitor<'_> for LevelFilterVisitor {
    type Value = LevelFilter;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            r#"one of the strings "off", "error", "warn", "info", "debug", or "trace""#
        )
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match v {
            "off" => Ok(LevelFilter::OFF),
            "error" => Ok(LevelFilter::ERROR),
            "warn" => Ok(LevelFilter::WARN),
            "info" => Ok(LevelFilter::INFO),
            "debug" => Ok(LevelFilter::DEBUG),
            "trace" => Ok(LevelFilter::TRACE),
            _ => Err(de::Error::unknown_variant(
                v,
                &["off", "error", "warn", "info", "debug", "trace"],
            )),
        }
    }
}

fn deserialize_level_filter<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LevelFilter, D::Error> {
    deserializer.deserialize_str(LevelFilterVisitor)
}

#[derive(Debug)]
struct LogCategoriesVisitor;

impl<'de> de::Visitor<'de> for LogCategoriesVisitor {
    type Value = LogCategories;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> std::fmt::Result {
        write!(
            formatter,
            "a bitmask, a category name, or a list of the category names \
             \"requests\", \"responses\", \"errors\", \"cache\" and \"eviction\""
        )
    }

    fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match u8::try_from(v) {
            Ok(bits) if bits & !LogCategories::ALL.0 == 0 => Ok(LogCategories(bits)),
            _ => Err(de::Error::invalid_value(de::Unexpected::Unsigned(v), &self)),
        }
    }

    fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        match u64::try_from(v) {
            Ok(v) => self.visit_u64(v),
            Err(_) => Err(de::Error::invalid_value(de::Unexpected::Signed(v), &self)),
        }
    }

    fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
    where
        E: de::Error,
    {
        LogCategories::from_name(v)
            .ok_or_else(|| de::Error::invalid_value(de::Unexpected::Str(v), &self))
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: de::SeqAccess<'de>,
    {
        let mut categories = LogCategories::NOTHING;
        while let Some(name) = seq.next_element::<String>()? {
            let category = LogCategories::from_name(&name)
                .ok_or_else(|| de::Error::invalid_value(de::Unexpected::Str(&name), &self))?;
            categories = categories | category;
        }
        Ok(categories)
    }
}

fn deserialize_log_categories<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<LogCategories, D::Error> {
    deserializer.deserialize_any(LogCategoriesVisitor)
}
