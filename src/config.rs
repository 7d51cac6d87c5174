//! Declarative configuration.
//!
//! Loaded from a TOML file; every field has a documented default so an empty
//! file (or none at all) yields a working configuration. The parts that feed
//! rule fingerprints are folded into [`Config::fingerprint`] so a config
//! change invalidates cached artifacts that depended on it.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error loading a config file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// Path we attempted to read.
        path: PathBuf,
        /// Underlying error.
        source: std::io::Error,
    },
    /// The file was not valid TOML or had unexpected shape.
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        /// Path we attempted to parse.
        path: PathBuf,
        /// Underlying error.
        source: toml::de::Error,
    },
}

/// Which algorithm hashes file contents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HashFunction {
    /// SHA-1, the historical default.
    #[default]
    Sha1,
    /// SHA-256.
    Sha256,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Build-phase options.
    pub build: BuildConfig,
    /// Artifact cache options.
    pub cache: CacheConfig,
    /// Test-phase options.
    pub test: TestConfig,
    /// Remote filesystem cluster options.
    pub remote_fs: RemoteFsConfig,
}

/// Build-phase options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BuildConfig {
    /// Worker pool size; 0 means one per available CPU.
    pub num_threads: usize,
    /// Per-target build timeout in seconds.
    pub timeout_secs: u64,
    /// Content hash algorithm.
    pub hash_function: HashFunction,
    /// Accept a single SHA-1 file hash for single-output targets with pinned
    /// hashes, for compatibility with older pins.
    pub single_sha1_hash: bool,
    /// Default container image for containerised rules; passed through to
    /// the command runner.
    pub default_container: Option<String>,
    /// Root of the output tree.
    pub output_dir: PathBuf,
    /// Filenames recognised as build files, in preference order.
    pub build_file_name: Vec<String>,
    /// Shard count for the large graph maps; must be a power of two.
    pub shard_count: usize,
    /// Shell used to run build commands.
    pub shell: String,
    /// Sandbox wrapper command, prepended when a target sets `sandbox`.
    pub sandbox_tool: Option<String>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            timeout_secs: 600,
            hash_function: HashFunction::default(),
            single_sha1_hash: false,
            default_container: None,
            output_dir: PathBuf::from("plz-out"),
            build_file_name: vec!["BUILD".to_owned(), "BUILD.plz".to_owned()],
            shard_count: 256,
            shell: "sh".to_owned(),
            sandbox_tool: None,
        }
    }
}

/// Artifact cache options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Directory cache root; empty disables the directory cache.
    pub dir: PathBuf,
    /// Once the directory cache exceeds this many bytes, eviction starts.
    pub dir_cache_high_water_mark: u64,
    /// Eviction keeps deleting least-recently-used artifacts until the cache
    /// is at most this many bytes.
    pub dir_cache_low_water_mark: u64,
    /// Treat cache errors as fatal rather than falling through to a build.
    pub authoritative: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from(".plz-cache"),
            dir_cache_high_water_mark: 10 * 1024 * 1024 * 1024,
            dir_cache_low_water_mark: 8 * 1024 * 1024 * 1024,
            authoritative: false,
        }
    }
}

/// Test-phase options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TestConfig {
    /// Per-target test timeout in seconds.
    pub timeout_secs: u64,
}

impl Default for TestConfig {
    fn default() -> Self {
        Self { timeout_secs: 600 }
    }
}

/// Remote filesystem cluster options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteFsConfig {
    /// Seed URLs of cluster nodes; empty disables the remote cache.
    pub urls: Vec<String>,
    /// Replication factor for stored objects.
    pub replicas: usize,
    /// Chunk size for streamed reads, in bytes. Minimum 1 KiB.
    pub chunk_size: u32,
}

impl Default for RemoteFsConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            replicas: 1,
            chunk_size: 32 * 1024,
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_owned(),
            source,
        })
    }

    /// Worker pool size with the CPU-count default applied.
    #[must_use]
    pub fn num_threads(&self) -> usize {
        if self.build.num_threads > 0 {
            self.build.num_threads
        } else {
            std::thread::available_parallelism().map_or(1, std::num::NonZero::get)
        }
    }

    /// Per-target build timeout.
    #[must_use]
    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build.timeout_secs)
    }

    /// Per-target test timeout.
    #[must_use]
    pub fn test_timeout(&self) -> Duration {
        Duration::from_secs(self.test.timeout_secs)
    }

    /// Directory build artifacts land in.
    #[must_use]
    pub fn gen_dir(&self) -> PathBuf {
        self.build.output_dir.join("gen")
    }

    /// Scratch directory builds run in.
    #[must_use]
    pub fn tmp_dir(&self) -> PathBuf {
        self.build.output_dir.join("tmp")
    }

    /// Stable fingerprint of the configuration fields that affect build
    /// outputs; mixed into every rule hash.
    #[must_use]
    pub fn fingerprint(&self) -> u64 {
        let relevant = serde_json::json!({
            "hash_function": self.build.hash_function,
            "single_sha1_hash": self.build.single_sha1_hash,
            "default_container": self.build.default_container,
            "shell": self.build.shell,
        });
        crate::util::hash_one(relevant.to_string().as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert!(config.num_threads() >= 1);
        assert_eq!(config.build_timeout(), Duration::from_secs(600));
        assert_eq!(config.cache.dir, PathBuf::from(".plz-cache"));
        assert!(config.cache.dir_cache_low_water_mark < config.cache.dir_cache_high_water_mark);
        assert_eq!(config.remote_fs.chunk_size, 32 * 1024);
        assert!(config.build.shard_count.is_power_of_two());
    }

    #[test]
    fn loads_partial_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plzconfig.toml");
        std::fs::write(
            &path,
            "[build]\nnum_threads = 4\nhash_function = \"sha256\"\n\n[cache]\nauthoritative = true\n",
        )
        .unwrap();
        let config = Config::load(&path).unwrap();
        assert_eq!(config.build.num_threads, 4);
        assert_eq!(config.build.hash_function, HashFunction::Sha256);
        assert!(config.cache.authoritative);
        // Unspecified sections keep defaults.
        assert_eq!(config.test.timeout_secs, 600);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = Config::load(Path::new("/nonexistent/plzconfig.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn fingerprint_tracks_relevant_fields() {
        let a = Config::default();
        let mut b = Config::default();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.build.hash_function = HashFunction::Sha256;
        assert_ne!(a.fingerprint(), b.fingerprint());
        // Worker count does not affect outputs.
        let mut c = Config::default();
        c.build.num_threads = 93;
        assert_eq!(a.fingerprint(), c.fingerprint());
    }
}
