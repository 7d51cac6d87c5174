//! Cache backend over the remote filesystem cluster.
//!
//! Each artifact is stored as an object keyed by the rule fingerprint's
//! 64-bit placement hash and a name of the form
//! `<package>/<target>/<key>/<output>`. Not-found reads are silent misses;
//! anything else is logged at warning level and degraded to a miss.

use super::Cache;
use crate::build::hashes::CacheKey;
use crate::config::Config;
use crate::graph::BuildTarget;
use crate::remote::Client;
use crate::util::fs as ufs;
use std::sync::Arc;
use tracing::warn;

/// Artifact cache backed by the remote filesystem.
pub struct RemoteFsCache {
    config: Arc<Config>,
    client: Client,
}

impl RemoteFsCache {
    /// Connects to the configured cluster.
    pub fn connect(config: Arc<Config>) -> Result<Self, crate::remote::RemoteError> {
        let client = Client::connect(&config.remote_fs.urls, config.remote_fs.chunk_size)?;
        Ok(Self { config, client })
    }

    fn object_name(target: &BuildTarget, key: &CacheKey, file: &str) -> String {
        format!(
            "{}/{}/{}/{file}",
            target.label.package,
            target.label.name,
            key.b64()
        )
    }

    fn store_one(&self, target: &BuildTarget, key: &CacheKey, file: &str) {
        let path = target.out_dir(&self.config).join(file);
        let contents = match std::fs::read(&path) {
            Ok(contents) => contents,
            Err(err) => {
                warn!(path = %path.display(), %err, "remote store skipped unreadable file");
                return;
            }
        };
        let name = Self::object_name(target, key, file);
        if let Err(err) = self.client.put(key.as_u64(), &name, &contents) {
            warn!(target = %target.label, %err, "remote cache store failed");
        }
    }

    fn retrieve_one(&self, target: &BuildTarget, key: &CacheKey, file: &str) -> bool {
        let name = Self::object_name(target, key, file);
        match self.client.get(key.as_u64(), &name) {
            Ok(Some(contents)) => {
                let path = target.out_dir(&self.config).join(file);
                match ufs::atomic_write(&path, &contents) {
                    Ok(()) => true,
                    Err(err) => {
                        warn!(path = %path.display(), %err, "remote retrieve failed to write");
                        false
                    }
                }
            }
            // A miss is routine and silent.
            Ok(None) => false,
            Err(err) => {
                warn!(target = %target.label, %err, "remote cache retrieve failed");
                false
            }
        }
    }
}

impl Cache for RemoteFsCache {
    fn store(&self, target: &BuildTarget, key: &CacheKey, extra_files: &[String]) {
        for output in target.all_outputs().iter().chain(extra_files) {
            self.store_one(target, key, output);
        }
    }

    fn store_extra(&self, target: &BuildTarget, key: &CacheKey, file: &str) {
        self.store_one(target, key, file);
    }

    fn retrieve(&self, target: &BuildTarget, key: &CacheKey) -> bool {
        let outputs = target.all_outputs();
        !outputs.is_empty()
            && outputs
                .iter()
                .all(|output| self.retrieve_one(target, key, output))
    }

    fn retrieve_extra(&self, target: &BuildTarget, key: &CacheKey, file: &str) -> bool {
        self.retrieve_one(target, key, file)
    }

    fn clean(&self, _target: &BuildTarget) {
        // The remote store is content-addressed and shared; eviction is the
        // cluster's concern, not one client's.
    }

    fn clean_all(&self) {}

    fn shutdown(&self) {}
}
