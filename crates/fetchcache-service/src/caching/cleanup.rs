use std::collections::HashSet;
use std::fs::{read_dir, remove_dir, remove_file};
use std::path::{Path, PathBuf};

use anyhow::Result;
use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::config::Config;
use crate::fetcher::Offline;

use super::disk::{DiskCache, INDEX_FILE, TMP_DIR, catch_not_found};
use super::{CacheKey, Caches};

/// Entry function for the cleanup command.
///
/// This will clean up all caches based on their configured retention.
pub fn cleanup(config: Config) -> Result<()> {
    Caches::from_config(&config, std::sync::Arc::new(Offline))?.cleanup()
}

impl Caches {
    /// Cleans up all known cache instances, in random order.
    pub fn cleanup(&self) -> Result<()> {
        let mut names = self.known_names()?;
        // an instance that reproducibly breaks the cleanup must not starve the others
        names.shuffle(&mut thread_rng());

        // every instance is attempted, the first error is reported
        let mut first_error = None;
        for name in &names {
            let result = self
                .get(name)
                .map_err(anyhow::Error::from)
                .and_then(|cacher| cacher.cleanup());
            if let Err(err) = result {
                let stderr: &dyn std::error::Error = &*err;
                tracing::error!(stderr, cache = name.as_str(), "Failed to clean up cache");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

#[derive(Debug, Default)]
pub struct CleanupStats {
    pub removed_dirs: usize,
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_dirs: usize,
    pub retained_files: usize,
    pub retained_bytes: u64,

    /// Keys of the entries removed because they expired or exceeded the size budget.
    pub removed_keys: Vec<String>,
}

impl DiskCache {
    /// Removes expired entries and files unknown to the index, then enforces the size budget.
    pub fn cleanup(&self) -> Result<CleanupStats> {
        tracing::info!(cache = %self.name, "Cleaning up cache");
        let mut stats = CleanupStats::default();

        let expired = self.sweep_expired();
        stats.removed_files += expired.len();
        stats.removed_keys = expired;

        {
            // Hold the index lock, so no entry can be written while we look for orphans.
            let index = self.lock();
            let known: HashSet<PathBuf> = index
                .entries
                .keys()
                .map(|key| self.dir.join(CacheKey::from_index(key).cache_path()))
                .collect();

            let entries = catch_not_found(|| read_dir(&self.dir))?.into_iter().flatten();
            for entry in entries {
                let path = entry?.path();
                let is_reserved = path
                    .file_name()
                    .is_some_and(|name| name == INDEX_FILE || name == TMP_DIR);
                if is_reserved {
                    continue;
                }
                if path.is_dir() {
                    let dir_is_empty = self.cleanup_directory_recursive(&path, &known, &mut stats)?;
                    if dir_is_empty && remove_empty_dir(&path) {
                        stats.removed_dirs += 1;
                    } else {
                        stats.retained_dirs += 1;
                    }
                } else {
                    self.cleanup_file(&path, &known, &mut stats);
                }
            }
        }

        let evicted = self.enforce_size_limit();
        stats.removed_files += evicted.len();
        stats.retained_files = stats.retained_files.saturating_sub(evicted.len());
        stats.removed_keys.extend(evicted);
        stats.retained_bytes = self.total_size();
        self.flush_index();

        tracing::info!(
            cache = %self.name,
            removed_dirs = stats.removed_dirs,
            removed_files = stats.removed_files,
            removed_bytes = stats.removed_bytes,
            retained_files = stats.retained_files,
            retained_bytes = stats.retained_bytes,
            "Cleaned up cache"
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64, "cache" => self.name.as_str());
        metric!(gauge("caches.size.bytes") = stats.retained_bytes, "cache" => self.name.as_str());
        metric!(counter("caches.size.files_removed") += stats.removed_files as i64, "cache" => self.name.as_str());
        metric!(counter("caches.size.bytes_removed") += stats.removed_bytes as i64, "cache" => self.name.as_str());

        Ok(stats)
    }

    /// Cleans up the directory recursively, returning `true` if the directory is left empty after cleanup.
    fn cleanup_directory_recursive(
        &self,
        directory: &Path,
        known: &HashSet<PathBuf>,
        stats: &mut CleanupStats,
    ) -> Result<bool> {
        let Some(entries) = catch_not_found(|| read_dir(directory))? else {
            tracing::warn!("Directory not found: `{}`", directory.display());
            return Ok(true);
        };
        tracing::debug!("Cleaning directory `{}`", directory.display());

        let mut is_empty = true;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                let dir_is_empty = self.cleanup_directory_recursive(&path, known, stats)?
                    && remove_empty_dir(&path);
                if dir_is_empty {
                    stats.removed_dirs += 1;
                } else {
                    stats.retained_dirs += 1;
                }
                is_empty &= dir_is_empty;
            } else {
                is_empty &= self.cleanup_file(&path, known, stats);
            }
        }

        Ok(is_empty)
    }

    /// Removes the file at `path` unless it belongs to an indexed entry, returning `true` if
    /// it is gone.
    fn cleanup_file(&self, path: &Path, known: &HashSet<PathBuf>, stats: &mut CleanupStats) -> bool {
        tracing::trace!("Checking file `{}`", path.display());
        if known.contains(path) {
            stats.retained_files += 1;
            return false;
        }

        let size = path.metadata().map(|m| m.len()).unwrap_or_default();
        tracing::debug!("Removing orphaned file `{}`", path.display());
        match catch_not_found(|| remove_file(path)) {
            Ok(_) => {
                stats.removed_bytes += size;
                stats.removed_files += 1;
                true
            }
            Err(e) => {
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to clean cache file: {:?}", e),
                );
                false
            }
        }
    }
}

fn remove_empty_dir(path: &Path) -> bool {
    tracing::debug!("Removing directory `{}`", path.display());
    match remove_dir(path) {
        Ok(()) => true,
        Err(e) => {
            sentry::with_scope(
                |scope| scope.set_extra("path", path.display().to_string().into()),
                || tracing::error!("Failed to clean cache directory: {:?}", e),
            );
            false
        }
    }
}
