use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant, SystemTime};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::config::CacheConfig;

use super::{CacheError, CacheKey, SecondaryAttrs, attrs_match};

pub(super) const INDEX_FILE: &str = "index.json";
pub(super) const TMP_DIR: &str = "tmp";

/// Minimum time between two writes of the index file, changes in between are batched.
const INDEX_SAVE_INTERVAL: Duration = Duration::from_secs(1);

/// Book-keeping of a single entry of the disk tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub created: SystemTime,
    pub expires: Option<SystemTime>,
    pub size: u64,
    /// Position of the write that created this entry, used as eviction order.
    pub seq: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub secondary: SecondaryAttrs,
}

impl IndexEntry {
    fn is_expired(&self, now: SystemTime) -> bool {
        self.expires.is_some_and(|expires| expires <= now)
    }

    fn is_valid(&self, now: SystemTime, wanted: &SecondaryAttrs) -> bool {
        !self.is_expired(now) && attrs_match(&self.secondary, wanted)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(super) struct Index {
    next_seq: u64,
    pub(super) entries: BTreeMap<String, IndexEntry>,
    /// Whether there are changes not yet written to the index file.
    #[serde(skip)]
    dirty: bool,
    #[serde(skip)]
    saved_at: Option<Instant>,
}

impl Index {
    fn total_size(&self) -> u64 {
        self.entries.values().map(|e| e.size).sum()
    }
}

/// An entry read back from the disk tier.
#[derive(Debug, Clone)]
pub struct DiskEntry {
    pub data: Bytes,
    pub created: SystemTime,
    pub expires: Option<SystemTime>,
    pub secondary: SecondaryAttrs,
}

/// The durable tier of a cache instance.
///
/// Every entry lives in its own file, addressed by the hash of its key. A JSON side index
/// in the same directory keeps track of creation time, expiry, size and secondary attributes.
/// Mutations of the index and renames into place happen under the same lock. Entry files are
/// read outside of it, a reader checks afterwards that the entry was not replaced meanwhile.
///
/// The index file is written at most once per second, pending changes are flushed by
/// [`flush_index`](Self::flush_index), by cleanups and when the cache is dropped.
#[derive(Debug)]
pub struct DiskCache {
    /// Name of the cache instance, used for metrics and logs.
    pub(super) name: String,
    pub(super) dir: PathBuf,
    tmp_dir: PathBuf,
    config: CacheConfig,
    pub(super) index: Mutex<Index>,
}

impl DiskCache {
    /// Opens the disk tier in `dir`, creating it if necessary.
    ///
    /// Temporary files left behind by a previous process are removed.
    pub fn open(name: &str, dir: PathBuf, config: CacheConfig) -> io::Result<Self> {
        fs::create_dir_all(&dir)?;
        let tmp_dir = dir.join(TMP_DIR);
        if tmp_dir.exists() {
            fs::remove_dir_all(&tmp_dir)?;
        }
        fs::create_dir_all(&tmp_dir)?;

        let index = load_index(&dir.join(INDEX_FILE));
        tracing::debug!(
            cache = name,
            entries = index.entries.len(),
            "Opened disk cache at `{}`",
            dir.display()
        );

        Ok(Self {
            name: name.to_owned(),
            dir,
            tmp_dir,
            config,
            index: Mutex::new(index),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(super) fn lock(&self) -> MutexGuard<'_, Index> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.dir.join(CacheKey::from_index(key).cache_path())
    }

    /// The expiry of an entry written now without an explicit expiry.
    pub fn default_expiry(&self, now: SystemTime) -> Option<SystemTime> {
        self.config.max_age.and_then(|age| now.checked_add(age))
    }

    /// Whether a fresh entry for `key` exists with all the `wanted` secondary attributes.
    pub fn has(&self, key: &CacheKey, wanted: &SecondaryAttrs) -> bool {
        let index = self.lock();
        match index.entries.get(key.as_str()) {
            Some(entry) => {
                entry.is_valid(SystemTime::now(), wanted) && self.entry_path(key.as_str()).is_file()
            }
            None => false,
        }
    }

    /// Returns the metadata of a fresh entry for `key`.
    pub fn entry(&self, key: &CacheKey) -> Option<IndexEntry> {
        let index = self.lock();
        index
            .entries
            .get(key.as_str())
            .filter(|e| !e.is_expired(SystemTime::now()))
            .cloned()
    }

    /// Reads the fresh entry for `key` with all the `wanted` secondary attributes.
    ///
    /// If `bump_expiry_to` is given, the expiry of a hit is moved to that point in time.
    /// Failing reads are logged and reported as a miss.
    pub fn read(
        &self,
        key: &CacheKey,
        wanted: &SecondaryAttrs,
        bump_expiry_to: Option<SystemTime>,
    ) -> Option<DiskEntry> {
        const MAX_RETRIES: usize = 2;
        let path = self.entry_path(key.as_str());

        for _ in 0..=MAX_RETRIES {
            let seq = {
                let index = self.lock();
                let entry = index.entries.get(key.as_str())?;
                if !entry.is_valid(SystemTime::now(), wanted) {
                    return None;
                }
                entry.seq
            };

            let data = match catch_not_found(|| fs::read(&path)) {
                Ok(data) => data,
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", path.display().to_string().into()),
                        || tracing::error!("Failed to read cache file: {:?}", e),
                    );
                    return None;
                }
            };

            let mut index = self.lock();
            match index.entries.get(key.as_str()) {
                Some(entry) if entry.seq == seq => {}
                // rewritten while reading, the file may belong to the newer entry
                Some(_) => continue,
                None => return None,
            }

            let Some(data) = data else {
                tracing::warn!(cache = %self.name, "Cache file `{}` vanished", path.display());
                index.entries.remove(key.as_str());
                self.save_index(&mut index);
                return None;
            };

            let entry = index.entries.get_mut(key.as_str())?;
            if let Some(expires) = bump_expiry_to {
                entry.expires = Some(expires);
            }
            let entry = entry.clone();
            if bump_expiry_to.is_some() {
                self.save_index(&mut index);
            }

            return Some(DiskEntry {
                data: Bytes::from(data),
                created: entry.created,
                expires: entry.expires,
                secondary: entry.secondary,
            });
        }

        tracing::debug!(cache = %self.name, key = %key, "Cache entry kept changing while reading");
        None
    }

    /// Returns the value of the secondary attribute `name` of the entry for `key`.
    pub fn secondary_value(&self, key: &CacheKey, name: &str) -> Option<String> {
        let index = self.lock();
        index
            .entries
            .get(key.as_str())
            .and_then(|entry| entry.secondary.get(name))
            .cloned()
    }

    /// Atomically writes `data` as the entry for `key`.
    ///
    /// Without an explicit `expires`, the entry expires after the configured max age.
    /// Returns the keys that had to be evicted to stay within the size budget.
    pub fn write(
        &self,
        key: &CacheKey,
        data: &[u8],
        secondary: SecondaryAttrs,
        expires: Option<SystemTime>,
    ) -> Result<Vec<String>, CacheError> {
        let mut temp_file = self.tempfile()?;
        temp_file.write_all(data)?;
        temp_file.flush()?;

        let created = SystemTime::now();
        let expires = expires.or_else(|| self.default_expiry(created));
        let path = self.entry_path(key.as_str());

        let mut index = self.lock();
        persist_tempfile(temp_file, &path)?;

        let seq = index.next_seq;
        index.next_seq += 1;
        index.entries.insert(
            key.as_str().to_owned(),
            IndexEntry {
                created,
                expires,
                size: data.len() as u64,
                seq,
                secondary,
            },
        );

        let evicted = self.enforce_size_limit_locked(&mut index);
        self.save_index(&mut index);

        metric!(counter("caches.file.write") += 1, "cache" => self.name.as_str());
        metric!(histogram("caches.file.size") = data.len() as u64, "cache" => self.name.as_str());
        Ok(evicted)
    }

    /// Removes the entry for `key`, returning whether there was one.
    pub fn remove(&self, key: &CacheKey) -> bool {
        let mut index = self.lock();
        let removed = self.remove_locked(&mut index, key.as_str());
        if removed {
            self.save_index(&mut index);
        }
        removed
    }

    /// Removes the entries of all given `keys`, returning how many existed.
    pub fn remove_many<'a>(&self, keys: impl IntoIterator<Item = &'a CacheKey>) -> usize {
        let mut index = self.lock();
        let removed = keys
            .into_iter()
            .filter(|key| self.remove_locked(&mut index, key.as_str()))
            .count();
        if removed > 0 {
            self.save_index(&mut index);
        }
        removed
    }

    /// Removes every entry whose key is not in `keep`.
    pub fn remove_all_except(&self, keep: &HashSet<&str>) -> Vec<String> {
        self.remove_where(|key, _| !keep.contains(key))
    }

    /// Removes the entry for `key` if it has expired, returning whether it was removed.
    pub fn remove_if_expired(&self, key: &CacheKey) -> bool {
        let mut index = self.lock();
        let expired = index
            .entries
            .get(key.as_str())
            .is_some_and(|entry| entry.is_expired(SystemTime::now()));
        if expired && self.remove_locked(&mut index, key.as_str()) {
            self.save_index(&mut index);
            return true;
        }
        false
    }

    /// Removes all entries, returning how many there were.
    pub fn clear(&self) -> usize {
        self.remove_where(|_, _| true).len()
    }

    /// Removes expired entries and entries created more than `age` ago.
    pub fn remove_older_than(&self, age: Duration) -> Vec<String> {
        let now = SystemTime::now();
        let cutoff = now.checked_sub(age).unwrap_or(SystemTime::UNIX_EPOCH);
        self.remove_where(|_, entry| entry.is_expired(now) || entry.created < cutoff)
    }

    /// Removes expired entries, returning their keys.
    ///
    /// Expired entries are invisible to lookups already, this reclaims their space.
    pub fn sweep_expired(&self) -> Vec<String> {
        let now = SystemTime::now();
        self.remove_where(|_, entry| entry.is_expired(now))
    }

    /// Evicts the oldest entries until the aggregate size is within the configured budget.
    pub fn enforce_size_limit(&self) -> Vec<String> {
        let mut index = self.lock();
        let evicted = self.enforce_size_limit_locked(&mut index);
        if !evicted.is_empty() {
            self.save_index(&mut index);
        }
        evicted
    }

    /// Aggregate size of all indexed entries in bytes.
    pub fn total_size(&self) -> u64 {
        self.lock().total_size()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove_where(&self, mut f: impl FnMut(&str, &IndexEntry) -> bool) -> Vec<String> {
        let mut index = self.lock();
        let keys: Vec<_> = index
            .entries
            .iter()
            .filter(|(key, entry)| f(key, entry))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &keys {
            self.remove_locked(&mut index, key);
        }
        if !keys.is_empty() {
            self.save_index(&mut index);
        }
        keys
    }

    fn enforce_size_limit_locked(&self, index: &mut Index) -> Vec<String> {
        let Some(budget) = self.config.max_disk_size() else {
            return vec![];
        };

        let mut total = index.total_size();
        if total <= budget {
            return vec![];
        }

        let mut by_age: Vec<_> = index
            .entries
            .iter()
            .map(|(key, entry)| (entry.seq, entry.size, key.clone()))
            .collect();
        by_age.sort_unstable();
        // the newest entry is never evicted
        by_age.pop();

        let mut evicted = vec![];
        for (_, size, key) in by_age {
            if total <= budget {
                break;
            }
            self.remove_locked(index, &key);
            total = total.saturating_sub(size);
            evicted.push(key);
        }

        metric!(counter("caches.file.evicted") += evicted.len() as i64, "cache" => self.name.as_str());
        evicted
    }

    fn remove_locked(&self, index: &mut Index, key: &str) -> bool {
        if index.entries.remove(key).is_none() {
            return false;
        }
        let path = self.entry_path(key);
        if let Err(e) = catch_not_found(|| fs::remove_file(&path)) {
            sentry::with_scope(
                |scope| scope.set_extra("path", path.display().to_string().into()),
                || tracing::error!("Failed to remove cache file: {:?}", e),
            );
        }
        true
    }

    /// Writes all pending changes of the index to the index file.
    pub fn flush_index(&self) {
        let mut index = self.lock();
        if index.dirty {
            self.write_index(&mut index);
        }
    }

    /// Marks the index as changed, and writes it unless it was written just now.
    fn save_index(&self, index: &mut Index) {
        index.dirty = true;
        if index
            .saved_at
            .is_some_and(|saved_at| saved_at.elapsed() < INDEX_SAVE_INTERVAL)
        {
            return;
        }
        self.write_index(index);
    }

    fn write_index(&self, index: &mut Index) {
        let result = self.tempfile().and_then(|mut temp_file| {
            serde_json::to_writer(&mut temp_file, &*index)?;
            temp_file.flush()?;
            persist_tempfile(temp_file, &self.dir.join(INDEX_FILE))
        });
        match result {
            Ok(()) => {
                index.dirty = false;
                index.saved_at = Some(Instant::now());
            }
            Err(e) => sentry::with_scope(
                |scope| scope.set_extra("path", self.dir.display().to_string().into()),
                || tracing::error!("Failed to write cache index: {:?}", e),
            ),
        }
    }

    /// Create a new temporary file to use in the cache.
    fn tempfile(&self) -> io::Result<NamedTempFile> {
        // The `cleanup` process could potentially remove the parent directories we are
        // operating in, so retry the fs operations.
        const MAX_RETRIES: usize = 2;
        let mut retries = 0;
        loop {
            retries += 1;

            if let Err(e) = fs::create_dir_all(&self.tmp_dir) {
                sentry::with_scope(
                    |scope| scope.set_extra("path", self.tmp_dir.display().to_string().into()),
                    || tracing::error!("Failed to create cache directory: {:?}", e),
                );
                if retries > MAX_RETRIES {
                    return Err(e);
                }
                continue;
            }

            match tempfile::Builder::new()
                .prefix("tmp")
                .tempfile_in(&self.tmp_dir)
            {
                Ok(temp_file) => return Ok(temp_file),
                Err(e) => {
                    sentry::with_scope(
                        |scope| scope.set_extra("path", self.tmp_dir.display().to_string().into()),
                        || tracing::error!("Failed to create cache file: {:?}", e),
                    );
                    if retries > MAX_RETRIES {
                        return Err(e);
                    }
                }
            }
        }
    }
}

impl Drop for DiskCache {
    fn drop(&mut self) {
        self.flush_index();
    }
}

fn load_index(path: &Path) -> Index {
    let contents = match catch_not_found(|| fs::read(path)) {
        Ok(Some(contents)) => contents,
        Ok(None) => return Index::default(),
        Err(e) => {
            tracing::error!("Failed to read cache index `{}`: {:?}", path.display(), e);
            return Index::default();
        }
    };
    match serde_json::from_slice(&contents) {
        Ok(index) => index,
        Err(e) => {
            // entry files of a lost index are removed as orphans by the next sweep
            tracing::error!("Discarding corrupt cache index `{}`: {}", path.display(), e);
            Index::default()
        }
    }
}

fn persist_tempfile(mut temp_file: NamedTempFile, path: &Path) -> io::Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| io::Error::other("no parent directory to persist item"))?;

    const MAX_RETRIES: usize = 2;
    let mut retries = 0;
    loop {
        retries += 1;

        if let Err(e) = fs::create_dir_all(parent) {
            sentry::with_scope(
                |scope| scope.set_extra("path", parent.display().to_string().into()),
                || tracing::error!("Failed to create cache directory: {:?}", e),
            );
            if retries > MAX_RETRIES {
                return Err(e);
            }
            continue;
        }

        match temp_file.persist(path) {
            Ok(_) => return Ok(()),
            Err(e) => {
                temp_file = e.file;
                let err = e.error;
                sentry::with_scope(
                    |scope| scope.set_extra("path", path.display().to_string().into()),
                    || tracing::error!("Failed to create cache file: {:?}", err),
                );
                if retries > MAX_RETRIES {
                    return Err(err);
                }
            }
        }
    }
}

pub(super) fn catch_not_found<F, R>(f: F) -> io::Result<Option<R>>
where
    F: FnOnce() -> io::Result<R>,
{
    match f() {
        Ok(x) => Ok(Some(x)),
        Err(e) => match e.kind() {
            io::ErrorKind::NotFound => Ok(None),
            _ => Err(e),
        },
    }
}
