//! Output hashing and rule fingerprints.
//!
//! The core is parameterised on its hash algorithm: file contents go through
//! the [`PathHasher`] collaborator, configured to SHA-1 or SHA-256. The
//! [`TargetHasher`] memoises one output hash per target (behind the target's
//! own read-write lock) and computes the rule fingerprint that keys the
//! artifact cache.

use crate::config::{Config, HashFunction};
use crate::graph::{BuildGraph, BuildTarget};
use crate::label::BuildInput;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use std::io::{self, Read};
use std::path::Path;
use std::sync::Arc;

/// Renders a hash as lowercase hex for comparisons and diagnostics.
#[must_use]
pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// The configured content-hash algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentHasher {
    /// SHA-1.
    Sha1,
    /// SHA-256.
    Sha256,
}

impl ContentHasher {
    /// Selects the hasher from configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        match config.build.hash_function {
            HashFunction::Sha1 => Self::Sha1,
            HashFunction::Sha256 => Self::Sha256,
        }
    }

    /// Digest of a byte slice.
    #[must_use]
    pub fn digest(self, bytes: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha1 => Sha1::digest(bytes).to_vec(),
            Self::Sha256 => Sha256::digest(bytes).to_vec(),
        }
    }

    /// Streaming digest of a file's contents.
    pub fn digest_file(self, path: &Path) -> io::Result<Vec<u8>> {
        let mut file = std::fs::File::open(path)?;
        let mut buf = [0u8; 64 * 1024];
        match self {
            Self::Sha1 => {
                let mut hasher = Sha1::new();
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(hasher.finalize().to_vec())
            }
            Self::Sha256 => {
                let mut hasher = Sha256::new();
                loop {
                    let n = file.read(&mut buf)?;
                    if n == 0 {
                        break;
                    }
                    hasher.update(&buf[..n]);
                }
                Ok(hasher.finalize().to_vec())
            }
        }
    }
}

/// Hashes filesystem paths with the configured algorithm. A seam so tests
/// and remote execution can substitute their own.
pub trait PathHasher: Send + Sync {
    /// Hash of the file (or directory tree) at `path`.
    fn hash(&self, path: &Path) -> io::Result<Vec<u8>>;
    /// Digest of raw bytes with the same algorithm.
    fn hash_bytes(&self, bytes: &[u8]) -> Vec<u8>;
    /// Short algorithm name for diagnostics.
    fn algo_name(&self) -> &'static str;
}

/// The filesystem-backed [`PathHasher`]. Directories hash as the chained
/// digest of their sorted entries' names and hashes.
pub struct FsPathHasher {
    algo: ContentHasher,
}

impl FsPathHasher {
    /// Creates a path hasher from configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            algo: ContentHasher::from_config(config),
        }
    }
}

impl PathHasher for FsPathHasher {
    fn hash(&self, path: &Path) -> io::Result<Vec<u8>> {
        if path.is_dir() {
            let mut entries: Vec<_> = std::fs::read_dir(path)?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|e| e.path())
                .collect();
            entries.sort();
            let mut acc = Vec::new();
            for entry in entries {
                if let Some(name) = entry.file_name() {
                    acc.extend_from_slice(name.to_string_lossy().as_bytes());
                }
                acc.extend_from_slice(&self.hash(&entry)?);
            }
            Ok(self.algo.digest(&acc))
        } else {
            self.algo.digest_file(path)
        }
    }

    fn hash_bytes(&self, bytes: &[u8]) -> Vec<u8> {
        self.algo.digest(bytes)
    }

    fn algo_name(&self) -> &'static str {
        match self.algo {
            ContentHasher::Sha1 => "sha1",
            ContentHasher::Sha256 => "sha256",
        }
    }
}

/// A rule fingerprint: the cache key derived from (command, input hashes,
/// config hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(pub Vec<u8>);

impl CacheKey {
    /// URL-safe base64 form, used as the cache directory name.
    #[must_use]
    pub fn b64(&self) -> String {
        use base64::Engine as _;
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(&self.0)
    }

    /// Stable 64-bit form, used for remote FS placement.
    #[must_use]
    pub fn as_u64(&self) -> u64 {
        let mut buf = [0u8; 8];
        for (i, b) in self.0.iter().take(8).enumerate() {
            buf[i] = *b;
        }
        u64::from_le_bytes(buf)
    }
}

/// Memoised per-target output-hash computation plus rule fingerprints.
pub struct TargetHasher {
    path_hasher: Arc<dyn PathHasher>,
}

impl TargetHasher {
    /// Creates a hasher from configuration.
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            path_hasher: Arc::new(FsPathHasher::from_config(config)),
        }
    }

    /// Creates a hasher around an explicit path hasher.
    #[must_use]
    pub fn with_path_hasher(path_hasher: Arc<dyn PathHasher>) -> Self {
        Self { path_hasher }
    }

    /// The underlying path hasher.
    #[must_use]
    pub fn path_hasher(&self) -> &Arc<dyn PathHasher> {
        &self.path_hasher
    }

    /// The memoised hash over `target`'s outputs in the output tree,
    /// computing it on first use.
    pub fn output_hash(&self, config: &Config, target: &BuildTarget) -> io::Result<Vec<u8>> {
        if let Some(hash) = target.output_hash() {
            return Ok(hash);
        }
        let hash = self.compute_output_hash(config, target)?;
        target.set_output_hash(hash.clone());
        Ok(hash)
    }

    /// Recomputes the output hash, replacing a memoised value known stale
    /// after a rebuild.
    pub fn force_output_hash(&self, config: &Config, target: &BuildTarget) -> io::Result<Vec<u8>> {
        let hash = self.compute_output_hash(config, target)?;
        target.set_output_hash(hash.clone());
        Ok(hash)
    }

    fn compute_output_hash(&self, config: &Config, target: &BuildTarget) -> io::Result<Vec<u8>> {
        let dir = target.out_dir(config);
        let outputs = target.all_outputs();
        // A single output hashes as the file itself so the artifact can be
        // verified out-of-band with standard tools.
        if let [only] = outputs.as_slice() {
            return self.path_hasher.hash(&dir.join(only));
        }
        // Filenames are mixed in unless the target pins explicit hashes;
        // pinned hashes predate name-mixing and must keep verifying.
        let mix_names = target.hashes.is_empty();
        let mut acc = Vec::new();
        for output in &outputs {
            if mix_names {
                acc.extend_from_slice(output.as_bytes());
            }
            acc.extend_from_slice(&self.path_hasher.hash(&dir.join(output))?);
        }
        Ok(self.path_hasher.hash_bytes(&acc))
    }

    /// The rule fingerprint keying the cache: command text, source and
    /// dependency hashes, declared outputs, and the config fingerprint.
    pub fn rule_hash(
        &self,
        graph: &BuildGraph,
        config: &Config,
        target: &BuildTarget,
        profile: Option<&str>,
    ) -> io::Result<CacheKey> {
        let mut acc = Vec::new();
        let command = target
            .command
            .as_ref()
            .and_then(|c| c.resolve(profile))
            .unwrap_or("filegroup");
        acc.extend_from_slice(command.as_bytes());
        acc.push(u8::from(target.sandbox));
        for output in target.all_outputs() {
            acc.extend_from_slice(output.as_bytes());
        }
        for src in target.sources() {
            match &src {
                BuildInput::Target(label) | BuildInput::NamedOutput { label, .. } => {
                    // Dependency inputs contribute their producer's output
                    // hash; the producer is built by the time we are keyed.
                    if let Some(dep) = graph.target(label) {
                        acc.extend_from_slice(&self.output_hash(config, &dep)?);
                        continue;
                    }
                    acc.extend_from_slice(label.to_string().as_bytes());
                }
                BuildInput::File { .. } | BuildInput::System { .. } => {
                    for path in src.paths(graph, config) {
                        acc.extend_from_slice(path.to_string_lossy().as_bytes());
                        acc.extend_from_slice(&self.path_hasher.hash(&path)?);
                    }
                }
            }
        }
        acc.extend_from_slice(&config.fingerprint().to_le_bytes());
        Ok(CacheKey(self.path_hasher.hash_bytes(&acc)))
    }

    /// Checks a computed output hash against the target's pinned hashes.
    /// Pins may carry an `algo:` prefix; comparison is on lowercase hex.
    #[must_use]
    pub fn verify_pinned(target: &BuildTarget, computed: &[u8]) -> bool {
        if target.hashes.is_empty() {
            return true;
        }
        let computed = hex(computed);
        target.hashes.iter().any(|pin| {
            let pin = pin.rsplit(':').next().unwrap_or(pin).trim();
            pin.eq_ignore_ascii_case(&computed)
        })
    }
}
