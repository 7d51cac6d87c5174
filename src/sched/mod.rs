//! The parse/build scheduler.
//!
//! A pool of worker threads drains the parse, build and test queues, biased
//! towards parsing so the graph grows as fast as possible. Activation turns
//! labels into scheduled work: unknown packages become parse tasks, wildcard
//! labels fan out across their package, and concrete labels are resolved
//! through require/provide substitution into dependency edges. A target is
//! enqueued to build exactly once, by whichever thread wins the
//! Active → Pending transition after its last dependency builds.
//!
//! The invocation ends when the pending counter reaches zero: every queue is
//! empty and no unit is in flight. Failed units still reconcile the counter,
//! so failures never wedge the exit; their dependents are left Active and
//! reported as blocked.

pub mod queue;

use crate::build;
use crate::graph::{BuildTarget, Package, TargetState};
use crate::label::{ALL_TARGETS, BuildLabel};
use crate::parse;
use crate::results::{BuildError, BuildResult, BuildSummary};
use crate::state::{ActivationMode, BuildState, ParseTask, Task};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::Duration;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// How long an idle worker parks before re-checking for work.
const IDLE_PARK: Duration = Duration::from_millis(50);

/// Builds (and optionally tests) the given root labels to quiescence.
pub fn run(state: &Arc<BuildState>, roots: &[BuildLabel]) -> BuildSummary {
    let results = state.take_results();
    for root in roots {
        let mode = ActivationMode {
            arch: state.arch.clone(),
            ..ActivationMode::default()
        };
        activate(state, root, None, &mode);
    }
    let num_threads = state.config.num_threads();
    debug!(num_threads, roots = roots.len(), "scheduler starting");
    std::thread::scope(|scope| {
        for _ in 0..num_threads {
            let state = Arc::clone(state);
            scope.spawn(move || worker_loop(&state));
        }
    });
    info!(
        targets = state.graph.target_count(),
        failed = state.has_failed(),
        "scheduler quiescent"
    );
    summarize(state, &results)
}

/// One worker: take the next unit, do it, reconcile the counter, repeat.
fn worker_loop(state: &Arc<BuildState>) {
    loop {
        if state.is_stopped() {
            return;
        }
        match state.next_task() {
            Some(Task::Parse(task)) => {
                parse::parse_step(state, &task);
                state.task_done();
            }
            Some(Task::Build(label)) => {
                build::build_target(state, &label);
                state.task_done();
            }
            Some(Task::Test(label)) => {
                build::test_target(state, &label);
                state.task_done();
            }
            None => {
                if state.is_quiescent() {
                    return;
                }
                state.park_for_work(IDLE_PARK);
            }
        }
    }
}

/// Activates a label on behalf of `dependor`: schedules parses for unknown
/// packages, expands wildcards, and resolves dependency edges.
pub(crate) fn activate(
    state: &Arc<BuildState>,
    label: &BuildLabel,
    dependor: Option<&BuildLabel>,
    mode: &ActivationMode,
) {
    if state.is_stopped() {
        return;
    }
    if label.is_all_subpackages() {
        for package_label in expand_tree_wildcard(state, label) {
            state.add_pending_parse(ParseTask {
                label: package_label,
                dependor: Some(label.clone()),
                mode: mode.clone(),
            });
        }
        return;
    }
    let name = label.package_name();
    let Some(package) = state.graph.package(&name) else {
        state.add_pending_parse(ParseTask {
            label: label.clone(),
            dependor: dependor.cloned(),
            mode: mode.clone(),
        });
        return;
    };
    if !package.is_ready() {
        // Mid-parse; the queued task re-activates once the parse lands.
        state.add_pending_parse(ParseTask {
            label: label.clone(),
            dependor: dependor.cloned(),
            mode: mode.clone(),
        });
        return;
    }
    // Query-only activation registers the reference and stops, unless a
    // wildcard dependor pulls the target in regardless.
    if mode.no_build && !dependor.is_some_and(BuildLabel::is_wildcard) {
        if let Some(target) = package.target(&label.name) {
            target.transition_to(TargetState::Semiactive);
        }
        return;
    }
    // A dependor that is itself a registered target resolves this label as
    // one of its dependency edges (with require/provide substitution).
    if let Some(from_label) = dependor
        && let Some(from_target) = state.graph.target(from_label)
    {
        resolve_dep_edge(state, from_label, &from_target, label, mode);
        return;
    }
    if label.is_all_targets() {
        for target in package.all_targets() {
            if target.label.is_internal() {
                continue;
            }
            if !target.should_include(&state.include, &state.exclude) {
                continue;
            }
            activate_target(state, &target, mode);
        }
        return;
    }
    match package.target(&label.name) {
        Some(target) => activate_target(state, &target, mode),
        None => {
            state.send_result(BuildResult::Failed(BuildError::ParseFailed {
                label: label.clone(),
                reason: format!("target {} is not defined in package {name}", label.name),
            }));
            state.set_failed();
        }
    }
}

/// Resolves one declared dependency of `from` into concrete edges and
/// activates everything it expands to.
fn resolve_dep_edge(
    state: &Arc<BuildState>,
    from_label: &BuildLabel,
    from_target: &Arc<BuildTarget>,
    declared: &BuildLabel,
    mode: &ActivationMode,
) {
    let expanded = state.graph.dependent_targets(from_target, declared);
    // Dependencies must be visible to the dependor. Internal targets carry
    // their parent's visibility.
    let is_visible = |dep: &BuildTarget| {
        dep.is_visible_to(from_label)
            || dep
                .label
                .parent()
                .and_then(|parent| state.graph.target(&parent))
                .is_some_and(|parent| parent.is_visible_to(from_label))
    };
    for dep_label in &expanded {
        if let Some(dep) = state.graph.target(dep_label)
            && !is_visible(&dep)
        {
            state.send_result(BuildResult::Failed(BuildError::BadDependency {
                label: from_label.clone(),
                dep: dep_label.clone(),
                reason: "target is not visible to the dependor".to_owned(),
            }));
            state.set_failed();
            return;
        }
    }
    from_target.resolve_dependency(declared, &expanded);
    for dep_label in &expanded {
        state.graph.add_dependency(from_label, dep_label);
    }
    let child_mode = ActivationMode {
        force_build: mode.force_build,
        no_build: false,
        rescan: false,
        arch: mode.arch.clone(),
    };
    for dep_label in &expanded {
        match state.graph.target(dep_label) {
            Some(dep) => activate_target(state, &dep, &child_mode),
            None => {
                let dep_package = state.graph.package(&dep_label.package_name());
                if dep_package.is_some_and(|p| p.is_ready()) {
                    // The package is fully parsed and the target really is
                    // not there.
                    state.send_result(BuildResult::Failed(BuildError::BadDependency {
                        label: from_label.clone(),
                        dep: dep_label.clone(),
                        reason: "target does not exist".to_owned(),
                    }));
                    state.set_failed();
                } else {
                    // Provides may point into packages we have not parsed
                    // yet; schedule them.
                    activate(state, dep_label, Some(from_label), &child_mode);
                }
            }
        }
    }
    maybe_enqueue(state, from_target);
}

/// Moves a target through Semiactive/Active and schedules its dependencies;
/// enqueues the build once everything it needs is already built.
pub(crate) fn activate_target(
    state: &Arc<BuildState>,
    target: &Arc<BuildTarget>,
    mode: &ActivationMode,
) {
    target.transition_to(TargetState::Semiactive);
    if !(state.need_build || mode.force_build) {
        return;
    }
    if target.transition_to(TargetState::Active) {
        state.add_active_target();
        if state.need_tests && target.is_test {
            state.add_active_test();
        }
        debug!(target = %target.label, "activated");
    }
    let child_mode = ActivationMode {
        force_build: mode.force_build,
        no_build: false,
        rescan: false,
        arch: mode.arch.clone(),
    };
    for declared in target.unresolved_dependencies() {
        activate(state, &declared, Some(&target.label), &child_mode);
    }
    // Resolved deps may still be dormant from an earlier query-only parse.
    for dep_label in target.dependencies() {
        if let Some(dep) = state.graph.target(&dep_label)
            && dep.state() < TargetState::Active
        {
            activate_target(state, &dep, &child_mode);
        }
    }
    maybe_enqueue(state, target);
}

/// Enqueues the build iff the target is Active with every dependency built.
/// The compare-and-set guarantees a single enqueue however many threads race
/// here.
pub(crate) fn maybe_enqueue(state: &Arc<BuildState>, target: &Arc<BuildTarget>) {
    if target.state() == TargetState::Active
        && state.graph.all_deps_built(target)
        && target.sync_update_state(TargetState::Active, TargetState::Pending)
    {
        state.add_pending_build(target.label.clone());
    }
}

/// Called by the builder once a target reaches a built state (after its
/// post-build callback): resumes deferred parses, wakes newly eligible
/// dependents, and schedules tests.
pub(crate) fn on_target_built(state: &Arc<BuildState>, target: &Arc<BuildTarget>) {
    state.notify_built(target.label.clone());
    for task in state.take_deferred(&target.label) {
        debug!(target = %target.label, package = %task.label, "resuming deferred parse");
        state.add_pending_parse(task);
    }
    for rd_label in state.graph.reverse_dependencies(&target.label) {
        if let Some(dependent) = state.graph.target(&rd_label) {
            maybe_enqueue(state, &dependent);
        }
    }
    if state.need_tests && target.is_test && target.test_command.is_some() {
        state.add_pending_test(target.label.clone());
    }
}

/// Called by the builder when a target fails: parses deferred on it can
/// never complete, so they are re-run to surface the failure and release
/// anything waiting on those packages.
pub(crate) fn on_target_failed(state: &Arc<BuildState>, target: &Arc<BuildTarget>) {
    for task in state.take_deferred(&target.label) {
        state.add_pending_parse(task);
    }
}

/// Re-examines every target of a package after a post-build callback:
/// registers late-declared outputs and targets, materialises new dependency
/// edges, and re-activates anything not yet built so newly resolved deps are
/// reconsidered. Idempotent; nothing double-enqueues.
pub(crate) fn rescan_package(state: &Arc<BuildState>, package: &Arc<Package>) {
    for target in package.all_targets() {
        for out in target.all_outputs() {
            package.register_output(&out, &target.label);
        }
        if state.graph.target(&target.label).is_none() {
            state.graph.add_target(Arc::clone(&target));
        }
        let st = target.state();
        if !st.is_done() && st < TargetState::Built {
            activate_target(
                state,
                &target,
                &ActivationMode {
                    rescan: true,
                    ..ActivationMode::default()
                },
            );
        }
    }
}

/// Expands `//pkg/...` by walking the tree for build files.
fn expand_tree_wildcard(state: &Arc<BuildState>, label: &BuildLabel) -> Vec<BuildLabel> {
    let root = if label.package.is_empty() {
        PathBuf::from(".")
    } else {
        PathBuf::from(&label.package)
    };
    let out_dir_name = state
        .config
        .build
        .output_dir
        .file_name()
        .map(|name| name.to_string_lossy().into_owned());
    let mut labels = Vec::new();
    let walker = WalkDir::new(&root).into_iter().filter_entry(|entry| {
        let name = entry.file_name().to_string_lossy();
        !(entry.file_type().is_dir()
            && (name.starts_with('.') || Some(name.as_ref()) == out_dir_name.as_deref()))
    });
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(err) => {
                warn!(%err, "walk error expanding {label}");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let file_name = entry.file_name().to_string_lossy();
        if !state
            .config
            .build
            .build_file_name
            .iter()
            .any(|candidate| candidate.as_str() == file_name)
        {
            continue;
        }
        let package = entry
            .path()
            .parent()
            .map(|dir| {
                let dir = dir.to_string_lossy();
                let dir = dir.strip_prefix("./").unwrap_or(&dir);
                if dir == "." { String::new() } else { dir.to_owned() }
            })
            .unwrap_or_default();
        labels.push(BuildLabel {
            subrepo: label.subrepo.clone(),
            package,
            name: ALL_TARGETS.to_owned(),
        });
    }
    debug!(label = %label, packages = labels.len(), "expanded tree wildcard");
    labels
}

/// Drains the results channel and classifies what is left in the graph.
fn summarize(state: &Arc<BuildState>, results: &mpsc::Receiver<BuildResult>) -> BuildSummary {
    let mut summary = BuildSummary::default();
    for result in results.try_iter() {
        match result {
            BuildResult::TargetBuilt { label, state: st } => {
                match st {
                    TargetState::Cached => summary.cached += 1,
                    TargetState::Unchanged | TargetState::Reused => summary.reused += 1,
                    _ => {}
                }
                summary.built.push(label);
            }
            BuildResult::TargetTested { label, .. } => summary.tested.push(label),
            BuildResult::Failed(err) => summary.failed.push(err),
            BuildResult::PackageParsed { .. } => {}
        }
    }
    if !state.is_stopped() {
        for target in state.graph.all_targets() {
            if target.state() == TargetState::Active {
                summary.blocked.push(target.label.clone());
            }
        }
        summary.blocked.sort();
    }
    summary
}
