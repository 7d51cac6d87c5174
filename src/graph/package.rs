//! Packages: one build file and the targets it declares.

use super::BuildTarget;
use crate::cmap::WaitGate;
use crate::label::{BuildLabel, PackageName};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Where a package is in its parse lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    /// A worker is running the interpreter on the build file.
    Parsing,
    /// Parsing stopped at a `subinclude` on an unbuilt target; the package
    /// will be re-parsed once that target builds.
    Deferred,
    /// Fully parsed; targets and outputs are final for this invocation
    /// (modulo post-build callbacks).
    Ready,
}

/// A directory's build file and its registered targets.
pub struct Package {
    /// The package's canonical name.
    pub name: PackageName,
    filename: Mutex<Option<PathBuf>>,
    targets: Mutex<HashMap<String, Arc<BuildTarget>>>,
    outputs: Mutex<HashMap<String, BuildLabel>>,
    parse_state: Mutex<ParseState>,
    /// Released when the initial parse (including any deferred re-parses)
    /// completes; waiters may then read targets.
    ready: Arc<WaitGate>,
}

impl Package {
    /// Creates a package in the `Parsing` state, claimed by its creator.
    #[must_use]
    pub fn new(name: PackageName) -> Self {
        Self {
            name,
            filename: Mutex::new(None),
            targets: Mutex::new(HashMap::new()),
            outputs: Mutex::new(HashMap::new()),
            parse_state: Mutex::new(ParseState::Parsing),
            ready: Arc::new(WaitGate::new()),
        }
    }

    /// The build file this package was parsed from, once located.
    pub fn filename(&self) -> Option<PathBuf> {
        self.filename.lock().clone()
    }

    /// Records the build file path.
    pub fn set_filename(&self, path: PathBuf) {
        *self.filename.lock() = Some(path);
    }

    /// Current parse state.
    pub fn parse_state(&self) -> ParseState {
        *self.parse_state.lock()
    }

    /// Claims the package for (re-)parsing. Succeeds only from `Deferred`;
    /// the initial claim belongs to whoever created the package.
    pub fn claim_reparse(&self) -> bool {
        let mut state = self.parse_state.lock();
        if *state == ParseState::Deferred {
            *state = ParseState::Parsing;
            true
        } else {
            false
        }
    }

    /// Marks the parse deferred on an unbuilt subinclude.
    pub fn mark_deferred(&self) {
        *self.parse_state.lock() = ParseState::Deferred;
    }

    /// Marks the package fully parsed and wakes everyone waiting on it.
    pub fn mark_ready(&self) {
        *self.parse_state.lock() = ParseState::Ready;
        self.ready.release();
    }

    /// True once the package has fully parsed.
    pub fn is_ready(&self) -> bool {
        self.ready.is_released()
    }

    /// Blocks until the package has fully parsed.
    pub fn wait_ready(&self) {
        self.ready.wait();
    }

    /// Registers a target. If a target of the same name already exists (a
    /// deferred re-parse re-registering its declarations) the existing one is
    /// returned and the new declaration discarded. Returns the canonical
    /// target and whether it was newly added.
    pub fn add_target(&self, target: BuildTarget) -> (Arc<BuildTarget>, bool) {
        debug_assert_eq!(target.label.package_name(), self.name);
        let mut targets = self.targets.lock();
        if let Some(existing) = targets.get(&target.label.name) {
            return (Arc::clone(existing), false);
        }
        let target = Arc::new(target);
        targets.insert(target.label.name.clone(), Arc::clone(&target));
        (target, true)
    }

    /// Looks up a target by name.
    pub fn target(&self, name: &str) -> Option<Arc<BuildTarget>> {
        self.targets.lock().get(name).cloned()
    }

    /// Snapshot of all targets in the package.
    pub fn all_targets(&self) -> Vec<Arc<BuildTarget>> {
        self.targets.lock().values().cloned().collect()
    }

    /// Claims a declared output filename for `label`.
    ///
    /// # Panics
    ///
    /// Two targets in one package may not declare the same output file; that
    /// is a structural defect in the build definition, so it aborts naming
    /// both claimants.
    pub fn register_output(&self, filename: &str, label: &BuildLabel) {
        let mut outputs = self.outputs.lock();
        if let Some(existing) = outputs.get(filename) {
            assert!(
                existing == label,
                "output file {filename:?} in package {} is declared by both {existing} and {label}",
                self.name,
            );
            return;
        }
        outputs.insert(filename.to_owned(), label.clone());
    }

    /// The target that declared `filename`, if any.
    pub fn output_owner(&self, filename: &str) -> Option<BuildLabel> {
        self.outputs.lock().get(filename).cloned()
    }
}

impl std::fmt::Debug for Package {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Package")
            .field("name", &self.name)
            .field("parse_state", &self.parse_state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn package() -> Package {
        Package::new(PackageName::new("pkg"))
    }

    #[test]
    fn new_package_is_parsing_and_not_ready() {
        let p = package();
        assert_eq!(p.parse_state(), ParseState::Parsing);
        assert!(!p.is_ready());
        assert!(!p.claim_reparse());
    }

    #[test]
    fn ready_releases_waiters() {
        let p = Arc::new(package());
        let waiter = {
            let p = Arc::clone(&p);
            std::thread::spawn(move || p.wait_ready())
        };
        p.mark_ready();
        waiter.join().unwrap();
        assert!(p.is_ready());
        assert_eq!(p.parse_state(), ParseState::Ready);
    }

    #[test]
    fn deferred_can_be_reclaimed_once() {
        let p = package();
        p.mark_deferred();
        assert_eq!(p.parse_state(), ParseState::Deferred);
        assert!(p.claim_reparse());
        assert!(!p.claim_reparse());
        assert_eq!(p.parse_state(), ParseState::Parsing);
    }

    #[test]
    fn add_target_dedupes_by_name() {
        let p = package();
        let (first, added) = p.add_target(BuildTarget::new(BuildLabel::new("pkg", "lib")));
        assert!(added);
        let (second, added) = p.add_target(BuildTarget::new(BuildLabel::new("pkg", "lib")));
        assert!(!added);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(p.all_targets().len(), 1);
        assert!(p.target("lib").is_some());
        assert!(p.target("other").is_none());
    }

    #[test]
    fn register_output_is_idempotent_per_owner() {
        let p = package();
        let lib = BuildLabel::new("pkg", "lib");
        p.register_output("lib.a", &lib);
        p.register_output("lib.a", &lib);
        assert_eq!(p.output_owner("lib.a"), Some(lib));
        assert_eq!(p.output_owner("other.a"), None);
    }

    #[test]
    #[should_panic(expected = "declared by both")]
    fn conflicting_output_owners_abort() {
        let p = package();
        p.register_output("out.txt", &BuildLabel::new("pkg", "a"));
        p.register_output("out.txt", &BuildLabel::new("pkg", "b"));
    }
}
