//! The directory cache.
//!
//! Artifacts live at `<root>/<package>/<name>/<base64-url-key>/<output>`.
//! Writes go through a tempfile in the cache root and an atomic rename, so a
//! concurrent retrieve never sees a torn file. Every store and every hit
//! refreshes an explicit access stamp, kept as the file mtime since mount
//! `atime` options are not to be relied on; when the cache grows past its high
//! water mark, files are deleted least-recently-accessed first until the
//! total is back under the low water mark.

use super::Cache;
use crate::build::hashes::CacheKey;
use crate::cmap::{KeySet, SMALL_SHARD_COUNT};
use crate::config::Config;
use crate::graph::BuildTarget;
use crate::util::fs as ufs;
use crate::util::hash_one;
use filetime::FileTime;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

fn key_hash(key: &String) -> u64 {
    hash_one(key.as_str())
}

/// Filesystem cache with water-mark eviction.
pub struct DirCache {
    config: Arc<Config>,
    root: PathBuf,
    /// Keys stored this invocation; makes a concurrent second store of the
    /// same (target, key) a no-op.
    stored: KeySet<String>,
    /// Approximate current size; corrected by each eviction walk.
    total_size: AtomicU64,
    /// Serialises eviction walks.
    eviction: Mutex<()>,
}

impl DirCache {
    /// Opens (creating if needed) the configured cache directory.
    #[must_use]
    pub fn new(config: Arc<Config>) -> Self {
        let root = config.cache.dir.clone();
        let size = ufs::dir_size(&root).unwrap_or(0);
        Self {
            config,
            root,
            stored: KeySet::new(SMALL_SHARD_COUNT, key_hash),
            total_size: AtomicU64::new(size),
            eviction: Mutex::new(()),
        }
    }

    fn key_dir(&self, target: &BuildTarget, key: &CacheKey) -> PathBuf {
        self.root
            .join(&target.label.package)
            .join(&target.label.name)
            .join(key.b64())
    }

    fn store_file(&self, src: &Path, dst: &Path) {
        let contents = match fs::read(src) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(src = %src.display(), %err, "cache store skipped unreadable file");
                return;
            }
        };
        let len = contents.len() as u64;
        if let Err(err) = ufs::atomic_write(dst, &contents) {
            warn!(dst = %dst.display(), %err, "cache store failed");
            return;
        }
        touch(dst);
        let total = self.total_size.fetch_add(len, Ordering::AcqRel) + len;
        if total > self.config.cache.dir_cache_high_water_mark {
            self.evict();
        }
    }

    /// Deletes least-recently-accessed files until the cache fits under the
    /// low water mark.
    fn evict(&self) {
        let Some(_guard) = self.eviction.try_lock() else {
            return; // someone else is already evicting
        };
        let mut files = Vec::new();
        collect_files(&self.root, &mut files);
        let total: u64 = files.iter().map(|f| f.size).sum();
        self.total_size.store(total, Ordering::Release);
        if total <= self.config.cache.dir_cache_high_water_mark {
            return;
        }
        debug!(
            total,
            high = self.config.cache.dir_cache_high_water_mark,
            "dir cache over high water mark, evicting"
        );
        files.sort_by_key(|f| f.accessed);
        let mut remaining = total;
        for file in files {
            if remaining <= self.config.cache.dir_cache_low_water_mark {
                break;
            }
            if fs::remove_file(&file.path).is_ok() {
                remaining = remaining.saturating_sub(file.size);
            }
        }
        self.total_size.store(remaining, Ordering::Release);
    }
}

struct CachedFile {
    path: PathBuf,
    size: u64,
    accessed: FileTime,
}

fn collect_files(dir: &Path, out: &mut Vec<CachedFile>) {
    let Ok(entries) = fs::read_dir(dir) else {
        return;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        let Ok(meta) = entry.metadata() else { continue };
        if meta.is_dir() {
            collect_files(&path, out);
        } else {
            out.push(CachedFile {
                size: meta.len(),
                accessed: FileTime::from_last_modification_time(&meta),
                path,
            });
        }
    }
}

/// Refreshes the access stamp.
fn touch(path: &Path) {
    let now = FileTime::now();
    if let Err(err) = filetime::set_file_mtime(path, now) {
        warn!(path = %path.display(), %err, "failed to stamp cache file");
    }
}

impl Cache for DirCache {
    fn store(&self, target: &BuildTarget, key: &CacheKey, extra_files: &[String]) {
        let claim = format!("{}/{}/{}", target.label.package, target.label.name, key.b64());
        if !self.stored.add(claim) {
            return;
        }
        let out_dir = target.out_dir(&self.config);
        let cache_dir = self.key_dir(target, key);
        for output in target.all_outputs().iter().chain(extra_files) {
            self.store_file(&out_dir.join(output), &cache_dir.join(output));
        }
    }

    fn store_extra(&self, target: &BuildTarget, key: &CacheKey, file: &str) {
        let out_dir = target.out_dir(&self.config);
        self.store_file(&out_dir.join(file), &self.key_dir(target, key).join(file));
    }

    fn retrieve(&self, target: &BuildTarget, key: &CacheKey) -> bool {
        let cache_dir = self.key_dir(target, key);
        if !cache_dir.is_dir() {
            return false;
        }
        let out_dir = target.out_dir(&self.config);
        for output in target.all_outputs() {
            let cached = cache_dir.join(&output);
            if !cached.exists() {
                // Partially evicted entry; treat the whole key as a miss.
                return false;
            }
            if let Err(err) = ufs::link_or_copy_all(&cached, &out_dir.join(&output)) {
                warn!(target = %target.label, %err, "cache retrieve failed");
                return false;
            }
            touch(&cached);
        }
        debug!(target = %target.label, "retrieved from dir cache");
        true
    }

    fn retrieve_extra(&self, target: &BuildTarget, key: &CacheKey, file: &str) -> bool {
        let cached = self.key_dir(target, key).join(file);
        if !cached.exists() {
            return false;
        }
        let out_dir = target.out_dir(&self.config);
        match ufs::link_or_copy_all(&cached, &out_dir.join(file)) {
            Ok(()) => {
                touch(&cached);
                true
            }
            Err(err) => {
                warn!(target = %target.label, %err, "cache retrieve failed");
                false
            }
        }
    }

    fn clean(&self, target: &BuildTarget) {
        let dir = self
            .root
            .join(&target.label.package)
            .join(&target.label.name);
        if let Err(err) = ufs::remove_dir_if_exists(&dir) {
            warn!(target = %target.label, %err, "cache clean failed");
        }
    }

    fn clean_all(&self) {
        if let Err(err) = ufs::remove_dir_if_exists(&self.root) {
            warn!(%err, "cache clean failed");
        }
        self.total_size.store(0, Ordering::Release);
    }

    fn shutdown(&self) {}
}
