//! Build targets: the primary entity of the graph.

use super::TargetState;
use crate::config::Config;
use crate::label::{BuildInput, BuildLabel};
use crate::parse::CallbackHandle;
use crate::results::TestResults;
use parking_lot::{Mutex, RwLock};
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

/// A build command: one string, or one per configuration profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// The same command regardless of profile.
    Plain(String),
    /// Per-profile commands; `default` is the fallback entry.
    PerConfig(HashMap<String, String>),
}

impl Command {
    /// Resolves the command for the given profile.
    #[must_use]
    pub fn resolve(&self, profile: Option<&str>) -> Option<&str> {
        match self {
            Self::Plain(cmd) => Some(cmd),
            Self::PerConfig(map) => profile
                .and_then(|p| map.get(p))
                .or_else(|| map.get("default"))
                .map(String::as_str),
        }
    }
}

/// One declared dependency and what it resolved to.
#[derive(Debug, Clone)]
pub struct DepInfo {
    /// The label as declared in the build file.
    pub declared: BuildLabel,
    /// The targets the declaration resolved to, after require/provide
    /// substitution. Empty until resolved.
    pub deps: SmallVec<[BuildLabel; 1]>,
    /// Exported deps propagate to dependents of this target.
    pub exported: bool,
    /// Whether resolution has happened yet.
    pub resolved: bool,
}

/// A declared unit of build work.
///
/// Declaration-time attributes are plain public fields, set by the
/// interpreter before the target is registered on the graph. Everything that
/// can change afterwards (state, outputs added by callbacks, dependency
/// resolution, memoised hashes) sits behind the target's own locks, because
/// by then the target is shared across worker threads.
pub struct BuildTarget {
    /// Canonical identifier.
    pub label: BuildLabel,
    /// Build command, if the target runs one. Filegroups have none.
    pub command: Option<Command>,
    /// Test command for test targets.
    pub test_command: Option<String>,
    /// Overrides the configured build timeout.
    pub build_timeout: Option<Duration>,
    /// Overrides the configured test timeout.
    pub test_timeout: Option<Duration>,
    /// Language tags this target wants from its dependencies.
    pub requires: Vec<String>,
    /// Maps a language tag to the target that should stand in for this one
    /// when a dependent requires that tag.
    pub provides: HashMap<String, BuildLabel>,
    /// Who may depend on this target. Empty means same-package only.
    pub visibility: Vec<BuildLabel>,
    /// Free-form tags, matched by include/exclude filters.
    pub labels: Vec<String>,
    /// Run the command inside the configured sandbox wrapper.
    pub sandbox: bool,
    /// Filegroups re-export their sources without running a command.
    pub is_filegroup: bool,
    /// Whether this target has tests to run.
    pub is_test: bool,
    /// Binary targets get executable outputs.
    pub is_binary: bool,
    /// Pinned output hashes; when non-empty the computed hash must match one.
    pub hashes: Vec<String>,

    state: AtomicU8,
    outs: Mutex<Vec<String>>,
    named_outs: Mutex<BTreeMap<String, Vec<String>>>,
    srcs: Mutex<Vec<BuildInput>>,
    named_srcs: Mutex<BTreeMap<String, Vec<BuildInput>>>,
    deps: Mutex<Vec<DepInfo>>,
    pre_build: Mutex<Option<Arc<dyn CallbackHandle>>>,
    post_build: Mutex<Option<Arc<dyn CallbackHandle>>>,
    test_results: Mutex<Option<TestResults>>,
    output_hash: RwLock<Option<Vec<u8>>>,
}

impl BuildTarget {
    /// Creates a target with no attributes set.
    #[must_use]
    pub fn new(label: BuildLabel) -> Self {
        Self {
            label,
            command: None,
            test_command: None,
            build_timeout: None,
            test_timeout: None,
            requires: Vec::new(),
            provides: HashMap::new(),
            visibility: Vec::new(),
            labels: Vec::new(),
            sandbox: false,
            is_filegroup: false,
            is_test: false,
            is_binary: false,
            hashes: Vec::new(),
            state: AtomicU8::new(TargetState::Inactive as u8),
            outs: Mutex::new(Vec::new()),
            named_outs: Mutex::new(BTreeMap::new()),
            srcs: Mutex::new(Vec::new()),
            named_srcs: Mutex::new(BTreeMap::new()),
            deps: Mutex::new(Vec::new()),
            pre_build: Mutex::new(None),
            post_build: Mutex::new(None),
            test_results: Mutex::new(None),
            output_hash: RwLock::new(None),
        }
    }

    // ---- state machine ----

    /// Current state.
    pub fn state(&self) -> TargetState {
        TargetState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Advances to `to` if the current state is behind it. Returns whether
    /// this call performed the transition; late duplicate triggers get
    /// `false` and must not re-enqueue.
    pub fn transition_to(&self, to: TargetState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= to as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    /// Transition that requires the exact prior state; used where only one
    /// worker may claim the move (e.g. Pending → Building).
    pub fn sync_update_state(&self, from: TargetState, to: TargetState) -> bool {
        debug_assert!(from < to, "state machine only moves forward");
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    // ---- outputs ----

    /// Adds a declared output; duplicates are ignored. Returns whether the
    /// output was new.
    pub fn add_output(&self, out: impl Into<String>) -> bool {
        let out = out.into();
        let mut outs = self.outs.lock();
        if outs.contains(&out) {
            return false;
        }
        outs.push(out);
        outs.sort_unstable();
        true
    }

    /// Adds an output to a named group.
    pub fn add_named_output(&self, name: impl Into<String>, out: impl Into<String>) {
        let mut named = self.named_outs.lock();
        let group = named.entry(name.into()).or_default();
        let out = out.into();
        if !group.contains(&out) {
            group.push(out);
            group.sort_unstable();
        }
    }

    /// Declared plain outputs, sorted. Filegroups with no declared outputs
    /// re-export their source filenames.
    pub fn outputs(&self) -> Vec<String> {
        let outs = self.outs.lock();
        if !outs.is_empty() || !self.is_filegroup {
            return outs.clone();
        }
        drop(outs);
        let mut derived: Vec<String> = self
            .sources()
            .iter()
            .filter_map(|src| match src {
                BuildInput::File { file, .. } => {
                    Some(file.rsplit('/').next().unwrap_or(file).to_owned())
                }
                _ => None,
            })
            .collect();
        derived.sort_unstable();
        derived
    }

    /// All outputs including named groups, sorted.
    pub fn all_outputs(&self) -> Vec<String> {
        let mut outs = self.outputs();
        for group in self.named_outs.lock().values() {
            outs.extend(group.iter().cloned());
        }
        outs.sort_unstable();
        outs.dedup();
        outs
    }

    /// Outputs of one named group.
    pub fn named_outputs(&self, name: &str) -> Vec<String> {
        self.named_outs.lock().get(name).cloned().unwrap_or_default()
    }

    /// Directory this target's outputs land in.
    #[must_use]
    pub fn out_dir(&self, config: &Config) -> PathBuf {
        config.gen_dir().join(&self.label.package)
    }

    /// Scratch directory its command runs in.
    #[must_use]
    pub fn build_tmp_dir(&self, config: &Config) -> PathBuf {
        config
            .tmp_dir()
            .join(&self.label.package)
            .join(format!("{}._build", self.label.name))
    }

    /// Full paths of all outputs in the output tree.
    pub fn output_paths(&self, config: &Config) -> Vec<PathBuf> {
        let dir = self.out_dir(config);
        self.all_outputs().iter().map(|out| dir.join(out)).collect()
    }

    /// Full paths of one named output group.
    pub fn named_output_paths(&self, name: &str, config: &Config) -> Vec<PathBuf> {
        let dir = self.out_dir(config);
        self.named_outputs(name).iter().map(|out| dir.join(out)).collect()
    }

    // ---- sources ----

    /// Adds a plain source.
    pub fn add_source(&self, src: BuildInput) {
        self.srcs.lock().push(src);
    }

    /// Adds a source to a named group.
    pub fn add_named_source(&self, name: impl Into<String>, src: BuildInput) {
        self.named_srcs.lock().entry(name.into()).or_default().push(src);
    }

    /// All sources, plain then named groups in name order.
    pub fn sources(&self) -> Vec<BuildInput> {
        let mut all = self.srcs.lock().clone();
        for group in self.named_srcs.lock().values() {
            all.extend(group.iter().cloned());
        }
        all
    }

    // ---- dependencies ----

    /// Declares a dependency on `label`. Idempotent. Returns whether the
    /// declaration was new.
    pub fn add_dependency(&self, label: BuildLabel, exported: bool) -> bool {
        let mut deps = self.deps.lock();
        if let Some(existing) = deps.iter_mut().find(|d| d.declared == label) {
            existing.exported |= exported;
            return false;
        }
        deps.push(DepInfo {
            declared: label,
            deps: SmallVec::new(),
            exported,
            resolved: false,
        });
        true
    }

    /// Records what a declared dependency resolved to. Once resolved the
    /// mapping is permanent; later calls are no-ops.
    pub fn resolve_dependency(&self, declared: &BuildLabel, actual: &[BuildLabel]) {
        let mut deps = self.deps.lock();
        if let Some(info) = deps.iter_mut().find(|d| d.declared == *declared) {
            if !info.resolved {
                info.deps = actual.iter().cloned().collect();
                info.resolved = true;
            }
        }
    }

    /// Labels of everything this target was declared to depend on.
    pub fn declared_dependencies(&self) -> Vec<BuildLabel> {
        self.deps.lock().iter().map(|d| d.declared.clone()).collect()
    }

    /// Resolved dependency labels, flattened. Unresolved declarations
    /// contribute nothing.
    pub fn dependencies(&self) -> Vec<BuildLabel> {
        let mut out = Vec::new();
        for info in self.deps.lock().iter() {
            if info.resolved {
                out.extend(info.deps.iter().cloned());
            }
        }
        out
    }

    /// Declared dependencies that have not resolved yet.
    pub fn unresolved_dependencies(&self) -> Vec<BuildLabel> {
        self.deps
            .lock()
            .iter()
            .filter(|d| !d.resolved)
            .map(|d| d.declared.clone())
            .collect()
    }

    /// True once every declared dependency has resolved.
    pub fn all_deps_resolved(&self) -> bool {
        self.deps.lock().iter().all(|d| d.resolved)
    }

    // ---- require/provide ----

    /// The labels that stand in for this target when `dependor_requires`
    /// asks for specific language tags. Falls back to this target itself
    /// when nothing matches.
    pub fn provides_for(&self, dependor_requires: &[String]) -> Vec<BuildLabel> {
        let mut out: Vec<BuildLabel> = dependor_requires
            .iter()
            .filter_map(|tag| self.provides.get(tag).cloned())
            .collect();
        if out.is_empty() {
            out.push(self.label.clone());
        } else {
            out.sort();
            out.dedup();
        }
        out
    }

    // ---- visibility & filtering ----

    /// Whether a target in `from`'s position may depend on this one.
    /// Same-package deps are always visible; otherwise the dependor must
    /// match one of the visibility entries (`//...` is public).
    #[must_use]
    pub fn is_visible_to(&self, from: &BuildLabel) -> bool {
        if from.subrepo == self.label.subrepo && from.package == self.label.package {
            return true;
        }
        self.visibility.iter().any(|vis| {
            if vis.is_all_subpackages() {
                from.package_name().is_under(&vis.package_name())
            } else if vis.is_all_targets() {
                from.subrepo == vis.subrepo && from.package == vis.package
            } else {
                from.subrepo == vis.subrepo && from.package == vis.package && from.name == vis.name
            }
        })
    }

    /// Applies include/exclude tag filters; used by wildcard activation.
    /// An empty include list admits everything not excluded.
    #[must_use]
    pub fn should_include(&self, include: &[String], exclude: &[String]) -> bool {
        if exclude.iter().any(|tag| self.labels.contains(tag)) {
            return false;
        }
        include.is_empty() || include.iter().any(|tag| self.labels.contains(tag))
    }

    // ---- callbacks ----

    /// Installs the pre-build callback.
    pub fn set_pre_build(&self, handle: Arc<dyn CallbackHandle>) {
        *self.pre_build.lock() = Some(handle);
    }

    /// Installs the post-build callback.
    pub fn set_post_build(&self, handle: Arc<dyn CallbackHandle>) {
        *self.post_build.lock() = Some(handle);
    }

    /// The pre-build callback, if any.
    pub fn pre_build(&self) -> Option<Arc<dyn CallbackHandle>> {
        self.pre_build.lock().clone()
    }

    /// The post-build callback, if any.
    pub fn post_build(&self) -> Option<Arc<dyn CallbackHandle>> {
        self.post_build.lock().clone()
    }

    // ---- results & hashes ----

    /// Stores this target's test results.
    pub fn set_test_results(&self, results: TestResults) {
        *self.test_results.lock() = Some(results);
    }

    /// Test results, if the target has been tested.
    pub fn test_results(&self) -> Option<TestResults> {
        self.test_results.lock().clone()
    }

    /// Memoised output hash, if computed.
    pub fn output_hash(&self) -> Option<Vec<u8>> {
        self.output_hash.read().clone()
    }

    /// Stores the memoised output hash.
    pub fn set_output_hash(&self, hash: Vec<u8>) {
        *self.output_hash.write() = Some(hash);
    }

    /// Drops the memoised output hash; used after rebuilds.
    pub fn invalidate_output_hash(&self) {
        *self.output_hash.write() = None;
    }

    // ---- misc ----

    /// Whether artifacts of this target can be cached. Filegroups and
    /// commandless targets only rearrange existing files.
    #[must_use]
    pub fn is_cacheable(&self) -> bool {
        !self.is_filegroup && self.command.is_some()
    }

    /// Build timeout with the configured default applied.
    #[must_use]
    pub fn build_timeout_or(&self, config: &Config) -> Duration {
        self.build_timeout.unwrap_or_else(|| config.build_timeout())
    }

    /// Test timeout with the configured default applied.
    #[must_use]
    pub fn test_timeout_or(&self, config: &Config) -> Duration {
        self.test_timeout.unwrap_or_else(|| config.test_timeout())
    }
}

impl std::fmt::Debug for BuildTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildTarget")
            .field("label", &self.label)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(name: &str) -> BuildTarget {
        BuildTarget::new(BuildLabel::new("pkg", name))
    }

    #[test]
    fn transitions_only_advance() {
        let t = target("lib");
        assert_eq!(t.state(), TargetState::Inactive);
        assert!(t.transition_to(TargetState::Active));
        assert!(!t.transition_to(TargetState::Active));
        assert!(!t.transition_to(TargetState::Semiactive));
        assert_eq!(t.state(), TargetState::Active);
        assert!(t.transition_to(TargetState::Built));
        assert_eq!(t.state(), TargetState::Built);
    }

    #[test]
    fn sync_update_requires_exact_state() {
        let t = target("lib");
        t.transition_to(TargetState::Pending);
        assert!(!t.sync_update_state(TargetState::Active, TargetState::Building));
        assert!(t.sync_update_state(TargetState::Pending, TargetState::Building));
        assert!(!t.sync_update_state(TargetState::Pending, TargetState::Building));
    }

    #[test]
    fn outputs_dedupe_and_sort() {
        let t = target("lib");
        assert!(t.add_output("b.o"));
        assert!(t.add_output("a.o"));
        assert!(!t.add_output("b.o"));
        assert_eq!(t.outputs(), vec!["a.o", "b.o"]);
        t.add_named_output("hdrs", "lib.h");
        assert_eq!(t.all_outputs(), vec!["a.o", "b.o", "lib.h"]);
        assert_eq!(t.named_outputs("hdrs"), vec!["lib.h"]);
        assert!(t.named_outputs("nope").is_empty());
    }

    #[test]
    fn filegroup_outputs_derive_from_sources() {
        let mut t = target("files");
        t.is_filegroup = true;
        t.add_source(BuildInput::File {
            package: "pkg".into(),
            file: "sub/data.txt".into(),
        });
        t.add_source(BuildInput::File {
            package: "pkg".into(),
            file: "conf.yaml".into(),
        });
        assert_eq!(t.outputs(), vec!["conf.yaml", "data.txt"]);
    }

    #[test]
    fn dependency_resolution_is_permanent() {
        let t = target("bin");
        let dep = BuildLabel::new("other", "lib");
        assert!(t.add_dependency(dep.clone(), false));
        assert!(!t.add_dependency(dep.clone(), true));
        assert!(!t.all_deps_resolved());
        assert_eq!(t.unresolved_dependencies(), vec![dep.clone()]);
        assert!(t.dependencies().is_empty());

        let actual = BuildLabel::new("other", "lib_go");
        t.resolve_dependency(&dep, std::slice::from_ref(&actual));
        assert!(t.all_deps_resolved());
        assert_eq!(t.dependencies(), vec![actual.clone()]);

        // Re-resolution does not change the mapping.
        t.resolve_dependency(&dep, &[BuildLabel::new("other", "lib_py")]);
        assert_eq!(t.dependencies(), vec![actual]);
    }

    #[test]
    fn provides_substitution() {
        let mut t = target("lib");
        t.provides
            .insert("go".into(), BuildLabel::new("pkg", "lib_go"));
        t.provides
            .insert("py".into(), BuildLabel::new("pkg", "lib_py"));

        assert_eq!(
            t.provides_for(&["go".into()]),
            vec![BuildLabel::new("pkg", "lib_go")]
        );
        // No matching tag falls back to the target itself.
        assert_eq!(t.provides_for(&["rust".into()]), vec![t.label.clone()]);
        assert_eq!(t.provides_for(&[]), vec![t.label.clone()]);
    }

    #[test]
    fn visibility_rules() {
        let mut t = target("lib");
        // Same package is always visible.
        assert!(t.is_visible_to(&BuildLabel::new("pkg", "other")));
        // Different package needs a visibility entry.
        let outsider = BuildLabel::new("app", "bin");
        assert!(!t.is_visible_to(&outsider));

        t.visibility.push(BuildLabel::new("app", ALL_TARGETS));
        assert!(t.is_visible_to(&outsider));
        assert!(!t.is_visible_to(&BuildLabel::new("app/sub", "bin")));

        let mut public = target("pub");
        public.visibility.push(BuildLabel {
            subrepo: None,
            package: String::new(),
            name: ALL_SUBPACKAGES.to_owned(),
        });
        assert!(public.is_visible_to(&BuildLabel::new("anywhere/at/all", "x")));
    }

    use crate::label::{ALL_SUBPACKAGES, ALL_TARGETS};

    #[test]
    fn include_exclude_filters() {
        let mut t = target("lib");
        t.labels = vec!["go".into(), "manual".into()];
        assert!(t.should_include(&[], &[]));
        assert!(t.should_include(&["go".into()], &[]));
        assert!(!t.should_include(&["py".into()], &[]));
        assert!(!t.should_include(&["go".into()], &["manual".into()]));
    }

    #[test]
    fn output_hash_memo() {
        let t = target("lib");
        assert_eq!(t.output_hash(), None);
        t.set_output_hash(vec![1, 2, 3]);
        assert_eq!(t.output_hash(), Some(vec![1, 2, 3]));
        t.invalidate_output_hash();
        assert_eq!(t.output_hash(), None);
    }

    #[test]
    fn command_resolution() {
        let plain = Command::Plain("echo hi".into());
        assert_eq!(plain.resolve(None), Some("echo hi"));
        assert_eq!(plain.resolve(Some("opt")), Some("echo hi"));

        let mut map = HashMap::new();
        map.insert("default".to_owned(), "echo default".to_owned());
        map.insert("opt".to_owned(), "echo opt".to_owned());
        let per = Command::PerConfig(map);
        assert_eq!(per.resolve(Some("opt")), Some("echo opt"));
        assert_eq!(per.resolve(Some("dbg")), Some("echo default"));
        assert_eq!(per.resolve(None), Some("echo default"));
    }
}
