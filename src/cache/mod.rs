//! The artifact cache multiplexer.
//!
//! Builds consume caches through the narrow [`Cache`] trait; the concrete
//! stack behind it is assembled from configuration: a directory cache,
//! optionally a remote filesystem cache, composed by [`CompositeCache`]
//! which retrieves first-hit-wins and fans stores out to every backend.
//!
//! Cache problems are never fatal here: a miss or an error falls through to
//! the builder. The one exception, configuration marking the cache
//! authoritative, is enforced by the builder, not the cache.

pub mod dir;
pub mod remote;

pub use dir::DirCache;
pub use remote::RemoteFsCache;

use crate::build::hashes::CacheKey;
use crate::config::Config;
use crate::graph::BuildTarget;
use std::sync::Arc;
use tracing::warn;

/// The contract every cache backend implements.
///
/// `extra_files` and `file` arguments are paths relative to the target's
/// output directory; `retrieve` must leave the output directory exactly as a
/// successful build would.
pub trait Cache: Send + Sync {
    /// Stores the target's outputs (plus `extra_files`) under `key`.
    /// Idempotent: a concurrent second store of the same key is a no-op.
    fn store(&self, target: &BuildTarget, key: &CacheKey, extra_files: &[String]);

    /// Stores one additional file under an existing key.
    fn store_extra(&self, target: &BuildTarget, key: &CacheKey, file: &str);

    /// Places the artifacts for `key` into the target's output directory.
    /// Returns whether a hit occurred.
    fn retrieve(&self, target: &BuildTarget, key: &CacheKey) -> bool;

    /// Retrieves one additional file stored via [`Cache::store_extra`].
    fn retrieve_extra(&self, target: &BuildTarget, key: &CacheKey, file: &str) -> bool;

    /// Drops all artifacts for one target.
    fn clean(&self, target: &BuildTarget);

    /// Drops everything.
    fn clean_all(&self);

    /// Flushes and releases resources before process exit.
    fn shutdown(&self);
}

/// A stack of caches: retrieval asks each in order, stores fan out to all.
pub struct CompositeCache {
    caches: Vec<Arc<dyn Cache>>,
}

impl CompositeCache {
    /// Creates a composite over the given backends, fastest first.
    #[must_use]
    pub fn new(caches: Vec<Arc<dyn Cache>>) -> Self {
        Self { caches }
    }
}

impl Cache for CompositeCache {
    fn store(&self, target: &BuildTarget, key: &CacheKey, extra_files: &[String]) {
        std::thread::scope(|scope| {
            for cache in &self.caches {
                let cache = Arc::clone(cache);
                scope.spawn(move || cache.store(target, key, extra_files));
            }
        });
    }

    fn store_extra(&self, target: &BuildTarget, key: &CacheKey, file: &str) {
        std::thread::scope(|scope| {
            for cache in &self.caches {
                let cache = Arc::clone(cache);
                scope.spawn(move || cache.store_extra(target, key, file));
            }
        });
    }

    fn retrieve(&self, target: &BuildTarget, key: &CacheKey) -> bool {
        self.caches.iter().any(|cache| cache.retrieve(target, key))
    }

    fn retrieve_extra(&self, target: &BuildTarget, key: &CacheKey, file: &str) -> bool {
        self.caches
            .iter()
            .any(|cache| cache.retrieve_extra(target, key, file))
    }

    fn clean(&self, target: &BuildTarget) {
        for cache in &self.caches {
            cache.clean(target);
        }
    }

    fn clean_all(&self) {
        for cache in &self.caches {
            cache.clean_all();
        }
    }

    fn shutdown(&self) {
        for cache in &self.caches {
            cache.shutdown();
        }
    }
}

/// Builds the configured cache stack, or `None` when caching is disabled.
#[must_use]
pub fn from_config(config: &Arc<Config>) -> Option<Arc<dyn Cache>> {
    let mut caches: Vec<Arc<dyn Cache>> = Vec::new();
    if !config.cache.dir.as_os_str().is_empty() {
        caches.push(Arc::new(DirCache::new(Arc::clone(config))));
    }
    if !config.remote_fs.urls.is_empty() {
        match RemoteFsCache::connect(Arc::clone(config)) {
            Ok(cache) => caches.push(Arc::new(cache)),
            Err(err) => warn!(%err, "remote cache unavailable, continuing without it"),
        }
    }
    match caches.len() {
        0 => None,
        1 => caches.pop(),
        _ => Some(Arc::new(CompositeCache::new(caches))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::label::BuildLabel;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    /// In-memory cache for exercising the composite.
    #[derive(Default)]
    struct MemCache {
        hits: Mutex<HashMap<Vec<u8>, usize>>,
        stored: Mutex<Vec<Vec<u8>>>,
        always_hit: bool,
    }

    impl Cache for MemCache {
        fn store(&self, _: &BuildTarget, key: &CacheKey, _: &[String]) {
            self.stored.lock().push(key.0.clone());
        }
        fn store_extra(&self, _: &BuildTarget, key: &CacheKey, _: &str) {
            self.stored.lock().push(key.0.clone());
        }
        fn retrieve(&self, _: &BuildTarget, key: &CacheKey) -> bool {
            *self.hits.lock().entry(key.0.clone()).or_insert(0) += 1;
            self.always_hit
        }
        fn retrieve_extra(&self, target: &BuildTarget, key: &CacheKey, _: &str) -> bool {
            self.retrieve(target, key)
        }
        fn clean(&self, _: &BuildTarget) {}
        fn clean_all(&self) {
            self.stored.lock().clear();
        }
        fn shutdown(&self) {}
    }

    #[test]
    fn retrieve_short_circuits_on_first_hit() {
        let hit = Arc::new(MemCache {
            always_hit: true,
            ..MemCache::default()
        });
        let second = Arc::new(MemCache::default());
        let composite = CompositeCache::new(vec![hit.clone(), second.clone()]);
        let target = BuildTarget::new(BuildLabel::new("pkg", "lib"));
        let key = CacheKey(vec![1]);

        assert!(composite.retrieve(&target, &key));
        assert_eq!(*hit.hits.lock().get(&vec![1u8]).unwrap(), 1);
        assert!(second.hits.lock().is_empty());
    }

    #[test]
    fn miss_falls_through_all_backends() {
        let a = Arc::new(MemCache::default());
        let b = Arc::new(MemCache::default());
        let composite = CompositeCache::new(vec![a.clone(), b.clone()]);
        let target = BuildTarget::new(BuildLabel::new("pkg", "lib"));
        let key = CacheKey(vec![2]);

        assert!(!composite.retrieve(&target, &key));
        assert_eq!(*a.hits.lock().get(&vec![2u8]).unwrap(), 1);
        assert_eq!(*b.hits.lock().get(&vec![2u8]).unwrap(), 1);
    }

    #[test]
    fn store_fans_out_to_every_backend() {
        let a = Arc::new(MemCache::default());
        let b = Arc::new(MemCache::default());
        let composite = CompositeCache::new(vec![a.clone(), b.clone()]);
        let target = BuildTarget::new(BuildLabel::new("pkg", "lib"));
        composite.store(&target, &CacheKey(vec![3]), &[]);

        assert_eq!(a.stored.lock().len(), 1);
        assert_eq!(b.stored.lock().len(), 1);
    }

    #[test]
    fn from_config_respects_disabled_caches() {
        let mut config = Config::default();
        config.cache.dir = std::path::PathBuf::new();
        assert!(from_config(&Arc::new(config)).is_none());

        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.cache.dir = dir.path().join("cache");
        assert!(from_config(&Arc::new(config)).is_some());
    }
}
