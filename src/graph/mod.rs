//! The build graph: concurrent-safe registry of packages, targets and
//! dependency edges.
//!
//! The graph exclusively owns targets and packages; everything else refers to
//! them by label, which is what lets the graph grow freely while workers hold
//! no pointers across suspension points. Edges are append-only: nothing is
//! ever removed from the graph within one invocation.

pub mod package;
pub mod state;
pub mod target;

pub use package::{Package, ParseState};
pub use state::TargetState;
pub use target::{BuildTarget, Command, DepInfo};

use crate::cmap::AwaitMap;
use crate::label::{BuildLabel, PackageName};
use crate::util::hash_one;
use parking_lot::RwLock;
use smallvec::SmallVec;
use std::path::PathBuf;
use std::sync::Arc;

fn label_hash(label: &BuildLabel) -> u64 {
    hash_one(label)
}

fn package_hash(name: &PackageName) -> u64 {
    hash_one(name)
}

/// A subrepo known to the graph.
#[derive(Debug, Clone)]
pub struct Subrepo {
    /// Subrepo name as referenced by `///name//...` labels.
    pub name: String,
    /// Where the subrepo's sources live.
    pub root: PathBuf,
}

type EdgeMap = hashbrown::HashMap<BuildLabel, SmallVec<[BuildLabel; 4]>>;

/// Registry of packages, targets and dependency edges.
pub struct BuildGraph {
    targets: AwaitMap<BuildLabel, Arc<BuildTarget>>,
    packages: AwaitMap<PackageName, Arc<Package>>,
    edges: RwLock<EdgeMap>,
    revdeps: RwLock<EdgeMap>,
    subrepos: RwLock<hashbrown::HashMap<String, Subrepo>>,
}

impl BuildGraph {
    /// Creates an empty graph. `shard_count` (a power of two) sizes the
    /// target and package maps.
    #[must_use]
    pub fn new(shard_count: usize) -> Self {
        Self {
            targets: AwaitMap::new(shard_count, label_hash),
            packages: AwaitMap::new(shard_count, package_hash),
            edges: RwLock::new(EdgeMap::default()),
            revdeps: RwLock::new(EdgeMap::default()),
            subrepos: RwLock::new(hashbrown::HashMap::new()),
        }
    }

    // ---- targets ----

    /// Registers a target under its label.
    ///
    /// # Panics
    ///
    /// Registering two distinct targets under one label is a structural
    /// defect; the process aborts naming the label.
    pub fn add_target(&self, target: Arc<BuildTarget>) -> Arc<BuildTarget> {
        let label = target.label.clone();
        assert!(
            self.targets.add(label.clone(), Arc::clone(&target)),
            "duplicate target registered for label {label}",
        );
        target
    }

    /// Looks up a target.
    pub fn target(&self, label: &BuildLabel) -> Option<Arc<BuildTarget>> {
        self.targets.get(label)
    }

    /// Looks up a target that must exist.
    ///
    /// # Panics
    ///
    /// A missing target here means an edge refers to something never
    /// registered, which is unrecoverable.
    pub fn target_or_die(&self, label: &BuildLabel) -> Arc<BuildTarget> {
        self.target(label)
            .unwrap_or_else(|| panic!("target {label} is not in the build graph"))
    }

    /// Blocks until some parse registers `label`, then returns it.
    pub fn wait_for_target(&self, label: &BuildLabel) -> Arc<BuildTarget> {
        self.targets.wait(label)
    }

    /// Snapshot of every registered target.
    pub fn all_targets(&self) -> Vec<Arc<BuildTarget>> {
        self.targets.values()
    }

    /// Number of registered targets.
    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    // ---- packages ----

    /// Registers a package.
    ///
    /// # Panics
    ///
    /// At most one package may exist per name.
    pub fn add_package(&self, package: Arc<Package>) -> Arc<Package> {
        let name = package.name.clone();
        assert!(
            self.packages.add(name.clone(), Arc::clone(&package)),
            "duplicate package registered for {name}",
        );
        package
    }

    /// Looks up a package.
    pub fn package(&self, name: &PackageName) -> Option<Arc<Package>> {
        self.packages.get(name)
    }

    /// Atomically claims `name` for parsing: returns the (possibly new)
    /// package and whether this call created it. The creator owns the
    /// initial parse.
    pub fn get_or_add_package(&self, name: &PackageName) -> (Arc<Package>, bool) {
        let candidate = Arc::new(Package::new(name.clone()));
        if self.packages.add(name.clone(), Arc::clone(&candidate)) {
            (candidate, true)
        } else {
            let existing = self
                .packages
                .get(name)
                .expect("produced package keys are permanent");
            (existing, false)
        }
    }

    /// Blocks until some worker claims (or has claimed) `name`, then
    /// returns the package. Callers usually still wait on the package's own
    /// ready gate before reading targets.
    pub fn wait_for_package(&self, name: &PackageName) -> Arc<Package> {
        self.packages.wait(name)
    }

    /// Snapshot of every known package.
    pub fn all_packages(&self) -> Vec<Arc<Package>> {
        self.packages.values()
    }

    // ---- edges ----

    /// Records a dependency edge `from → to` and its reverse. Edges are
    /// append-only and deduplicated.
    pub fn add_dependency(&self, from: &BuildLabel, to: &BuildLabel) {
        {
            let mut edges = self.edges.write();
            let fwd = edges.entry(from.clone()).or_default();
            if !fwd.contains(to) {
                fwd.push(to.clone());
            }
        }
        let mut revdeps = self.revdeps.write();
        let rev = revdeps.entry(to.clone()).or_default();
        if !rev.contains(from) {
            rev.push(from.clone());
        }
    }

    /// Everything `label` has an edge to.
    pub fn dependencies_of(&self, label: &BuildLabel) -> Vec<BuildLabel> {
        self.edges
            .read()
            .get(label)
            .map(|deps| deps.to_vec())
            .unwrap_or_default()
    }

    /// Everything with an edge to `label`.
    pub fn reverse_dependencies(&self, label: &BuildLabel) -> Vec<BuildLabel> {
        self.revdeps
            .read()
            .get(label)
            .map(|deps| deps.to_vec())
            .unwrap_or_default()
    }

    // ---- dependency queries ----

    /// True once every declared dependency of `target` resolves to a
    /// registered target.
    pub fn all_dependencies_resolved(&self, target: &BuildTarget) -> bool {
        target.all_deps_resolved()
            && target
                .dependencies()
                .iter()
                .all(|dep| self.target(dep).is_some())
    }

    /// True once every resolved dependency of `target` has built.
    /// Unresolved declarations mean "no".
    pub fn all_deps_built(&self, target: &BuildTarget) -> bool {
        target.all_deps_resolved()
            && target
                .dependencies()
                .iter()
                .all(|dep| self.target(dep).is_some_and(|t| t.state().is_built()))
    }

    /// Expands one declared dependency of `dependor` into the labels that
    /// should actually be depended on: `:all` wildcards iterate the
    /// package's non-internal targets, and require/provide substitution
    /// rewrites edges towards what the dependency provides for the
    /// dependor's required tags. Labels that cannot be expanded yet come
    /// back unchanged.
    pub fn dependent_targets(&self, dependor: &BuildTarget, label: &BuildLabel) -> Vec<BuildLabel> {
        if label.is_all_targets() {
            if let Some(package) = self.package(&label.package_name()) {
                let mut out: Vec<BuildLabel> = package
                    .all_targets()
                    .into_iter()
                    .filter(|t| !t.label.is_internal())
                    .flat_map(|t| t.provides_for(&dependor.requires))
                    .collect();
                out.sort();
                out.dedup();
                return out;
            }
            return vec![label.clone()];
        }
        match self.target(label) {
            Some(target) => target.provides_for(&dependor.requires),
            None => vec![label.clone()],
        }
    }

    // ---- subrepos ----

    /// Registers a subrepo.
    pub fn register_subrepo(&self, subrepo: Subrepo) {
        self.subrepos.write().insert(subrepo.name.clone(), subrepo);
    }

    /// Looks up a subrepo by name.
    pub fn subrepo(&self, name: &str) -> Option<Subrepo> {
        self.subrepos.read().get(name).cloned()
    }
}
