//! Exposes the command line application.
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use fetchcache_service::caching::{self, CacheKey, Caches, DEFAULT_CACHE, Queue};
use fetchcache_service::config::Config;
use fetchcache_service::fetcher::{FetchRequest, Offline};
use fetchcache_service::metrics;

use crate::logging;

/// Fetchcache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Remove expired and orphaned files, and enforce the size limits of all caches.
    Cleanup,

    /// Periodically clean up all caches, every `cleanup_interval`, until interrupted.
    Watch,

    /// Print the number of entries and their total size for every cache.
    Stats,

    /// Check whether a fresh entry exists for a key.
    Have {
        /// The cache key.
        key: String,
    },

    /// Write the cached resource to stdout or a file.
    ///
    /// Nothing is downloaded, the command fails if the resource is not cached.
    Get {
        /// The url of the resource, or its cache key when `--key` is given.
        target: String,

        /// Treat the target as explicit cache key instead of a url.
        #[arg(long)]
        key: bool,

        /// A request header that is part of the cache key, as `name:value`.
        #[arg(long = "header", short = 'H', value_parser = parse_header)]
        headers: Vec<(String, String)>,

        /// Write the resource to this file instead of stdout.
        #[arg(long, short, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Store the contents of a file under a key.
    Add {
        /// The cache key.
        key: String,
        /// The file to store.
        file: PathBuf,
    },

    /// Remove the entry for a key.
    Remove {
        /// The cache key.
        key: String,
    },

    /// Remove all entries of the cache.
    Clear,

    /// Remove all entries created before the given age, e.g. `7days`.
    Flush {
        #[arg(long, value_parser = humantime::parse_duration)]
        older_than: Duration,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// The name of the cache instance to operate on.
    #[arg(long, global = true, default_value = DEFAULT_CACHE)]
    cache: String,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

fn parse_header(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once(':')
        .ok_or_else(|| format!("invalid header `{s}`, expected `name:value`"))?;
    Ok((name.trim().to_owned(), value.trim().to_owned()))
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.as_deref().and_then(|dsn| dsn.parse().ok()),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime has not been started yet, so there is only a single thread.
    unsafe { logging::init_logging(&config.logging) };

    if let Some(statsd) = &config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(hostname) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, hostname);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd.as_str(), tags)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("fetchcache")
        .enable_all()
        .build()
        .context("failed to start the runtime")?;

    match cli.command {
        Command::Cleanup => caching::cleanup(config).context("failed to clean up caches")?,
        command => runtime.block_on(run(command, &cli.cache, config))?,
    }

    Ok(())
}

async fn run(command: Command, cache: &str, config: Config) -> Result<()> {
    let caches = Arc::new(Caches::from_config(&config, Arc::new(Offline))?);
    let cacher = caches.get(cache)?;

    match command {
        Command::Cleanup => caches.cleanup()?,
        Command::Watch => {
            let interval = config
                .cleanup_interval
                .context("`cleanup_interval` is not configured")?;
            tracing::info!("Cleaning up caches every {}", humantime::format_duration(interval));
            let handle = caches.spawn_cleanup(interval);
            tokio::signal::ctrl_c()
                .await
                .context("failed to wait for shutdown signal")?;
            handle.abort();
        }
        Command::Stats => {
            let mut stats = BTreeMap::new();
            for name in caches.known_names()? {
                if let Some(disk) = caches.get(&name)?.disk() {
                    stats.insert(name, (disk.len(), disk.total_size()));
                }
            }
            let mut stdout = std::io::stdout().lock();
            for (name, (entries, bytes)) in stats {
                writeln!(stdout, "{name}\t{entries} entries\t{bytes} bytes")?;
            }
        }
        Command::Have { key } => {
            let key = CacheKey::new(&key)?;
            if !cacher.have(&key) {
                anyhow::bail!("no entry for `{key}` in cache `{cache}`");
            }
            println!("{key}");
        }
        Command::Get {
            target,
            key,
            headers,
            output,
        } => {
            let request = if key {
                FetchRequest::for_key(target)
            } else {
                headers
                    .into_iter()
                    .fold(FetchRequest::new(target), |request, (name, value)| {
                        request.with_header(name, value)
                    })
            };
            let data = cacher
                .get_or_fetch(request, Queue::Fast)
                .await
                .context("resource is not cached")?;
            match output {
                Some(path) => std::fs::write(&path, &data)
                    .with_context(|| format!("failed to write `{}`", path.display()))?,
                None => std::io::stdout().lock().write_all(&data)?,
            }
        }
        Command::Add { key, file } => {
            let key = CacheKey::new(&key)?;
            let data = std::fs::read(&file)
                .with_context(|| format!("failed to read `{}`", file.display()))?;
            cacher.add_raw(Bytes::from(data), &key).await?;
            tracing::info!(cache, key = %key, "Stored cache entry");
        }
        Command::Remove { key } => {
            let key = CacheKey::new(&key)?;
            cacher.remove(&key);
        }
        Command::Clear => cacher.clear(),
        Command::Flush { older_than } => cacher.flush_older_than(older_than),
    }

    Ok(())
}
