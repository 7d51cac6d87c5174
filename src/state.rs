//! The per-invocation coordination object.
//!
//! One `BuildState` is constructed per invocation and shared (via `Arc`) by
//! every worker. It owns the three work queues, the pending counter whose
//! zero-crossing ends the invocation, the results channel, and the assorted
//! flags and registries the scheduler and builder coordinate through. There
//! is deliberately no global singleton; everything threads through this
//! object.

use crate::build::hashes::TargetHasher;
use crate::cache::Cache;
use crate::cmap::{NotifyMap, SMALL_SHARD_COUNT};
use crate::config::Config;
use crate::exec::CommandRunner;
use crate::graph::BuildGraph;
use crate::label::BuildLabel;
use crate::parse::Interpreter;
use crate::results::BuildResult;
use crate::sched::queue::WorkQueue;
use crate::util::hash_one;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::time::Duration;

/// How a label is being activated.
#[derive(Debug, Clone, Default)]
pub struct ActivationMode {
    /// Build the target even in a parse that would otherwise only register
    /// it (used when a subinclude needs its artifacts).
    pub force_build: bool,
    /// Register only; do not schedule a build. Ignored when the dependor is
    /// a wildcard.
    pub no_build: bool,
    /// Re-examination after a post-build callback; suppresses duplicate
    /// bookkeeping.
    pub rescan: bool,
    /// Architecture override carried from the original root label.
    pub arch: Option<String>,
}

/// A queued parse: load this label's package on behalf of `dependor`.
#[derive(Debug, Clone)]
pub struct ParseTask {
    /// The label whose package needs parsing (or re-activation).
    pub label: BuildLabel,
    /// Who asked, if anyone. Wildcard dependors loosen `no_build`.
    pub dependor: Option<BuildLabel>,
    /// Activation flags.
    pub mode: ActivationMode,
}

/// One unit of work handed to a worker.
#[derive(Debug)]
pub enum Task {
    /// Parse a package.
    Parse(ParseTask),
    /// Build a target whose dependencies are all built.
    Build(BuildLabel),
    /// Run a built target's tests.
    Test(BuildLabel),
}

/// Shared coordination state for one invocation.
pub struct BuildState {
    /// Configuration.
    pub config: Arc<Config>,
    /// The (growing) build graph.
    pub graph: Arc<BuildGraph>,
    /// Memoised output hashing.
    pub hasher: Arc<TargetHasher>,
    /// The artifact cache stack, if caching is enabled.
    pub cache: Option<Arc<dyn Cache>>,
    /// Spawns build and test commands.
    pub runner: Arc<dyn CommandRunner>,
    /// Parses build files and runs callbacks.
    pub interpreter: Arc<dyn Interpreter>,

    /// Include filters for wildcard activation (empty = everything).
    pub include: Vec<String>,
    /// Exclude filters for wildcard activation.
    pub exclude: Vec<String>,
    /// Whether this invocation builds at all (queries parse only).
    pub need_build: bool,
    /// Whether tests should run after builds.
    pub need_tests: bool,
    /// Whether coverage is collected while testing.
    pub need_coverage: bool,
    /// Stop the world on the first failure instead of building on.
    pub stop_after_failure: bool,
    /// Architecture override applied to root labels.
    pub arch: Option<String>,
    /// Configuration profile used to resolve per-config commands.
    pub profile: Option<String>,

    parse_queue: WorkQueue<ParseTask>,
    build_queue: WorkQueue<BuildLabel>,
    test_queue: WorkQueue<BuildLabel>,
    /// Units enqueued but not yet reconciled by `task_done`.
    pending: AtomicUsize,
    idle_lock: Mutex<()>,
    work_cond: Condvar,

    results_tx: Mutex<mpsc::Sender<BuildResult>>,
    results_rx: Mutex<Option<mpsc::Receiver<BuildResult>>>,

    stop: AtomicBool,
    failed: AtomicBool,
    test_failed: AtomicBool,
    lint_failed: AtomicBool,

    active: AtomicUsize,
    active_tests: AtomicUsize,
    active_remote: AtomicUsize,

    /// Keyed completion signals: released once a label reaches a built
    /// state, after its post-build callback.
    built: NotifyMap<BuildLabel>,
    /// Packages whose parse awaits a target build: target label → the parse
    /// tasks to re-run once it is built.
    deferred: Mutex<HashMap<BuildLabel, Vec<ParseTask>>>,
    /// Filegroups may claim the same output file, so their linking step is
    /// process-serialised and memoised here.
    filegroup_outputs: Mutex<HashSet<PathBuf>>,
}

impl BuildState {
    /// Creates a fresh invocation state.
    #[must_use]
    pub fn new(
        config: Config,
        interpreter: Arc<dyn Interpreter>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let graph = Arc::new(BuildGraph::new(config.build.shard_count));
        let hasher = Arc::new(TargetHasher::new(&config));
        let (tx, rx) = mpsc::channel();
        Self {
            config: Arc::new(config),
            graph,
            hasher,
            cache: None,
            runner,
            interpreter,
            include: Vec::new(),
            exclude: Vec::new(),
            need_build: true,
            need_tests: false,
            need_coverage: false,
            stop_after_failure: false,
            arch: None,
            profile: None,
            parse_queue: WorkQueue::new(),
            build_queue: WorkQueue::new(),
            test_queue: WorkQueue::new(),
            pending: AtomicUsize::new(0),
            idle_lock: Mutex::new(()),
            work_cond: Condvar::new(),
            results_tx: Mutex::new(tx),
            results_rx: Mutex::new(Some(rx)),
            stop: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            test_failed: AtomicBool::new(false),
            lint_failed: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            active_tests: AtomicUsize::new(0),
            active_remote: AtomicUsize::new(0),
            built: NotifyMap::new(SMALL_SHARD_COUNT, |label: &BuildLabel| hash_one(label)),
            deferred: Mutex::new(HashMap::new()),
            filegroup_outputs: Mutex::new(HashSet::new()),
        }
    }

    // ---- work queues ----

    /// Enqueues a parse task.
    pub fn add_pending_parse(&self, task: ParseTask) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.parse_queue.push(task);
        self.notify_workers();
    }

    /// Enqueues a build for a target whose dependencies are all built.
    pub fn add_pending_build(&self, label: BuildLabel) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.build_queue.push(label);
        self.notify_workers();
    }

    /// Enqueues a test run.
    pub fn add_pending_test(&self, label: BuildLabel) {
        self.pending.fetch_add(1, Ordering::AcqRel);
        self.test_queue.push(label);
        self.notify_workers();
    }

    /// Takes the next unit of work, biased parse > build > test so the graph
    /// expands as fast as possible.
    pub fn next_task(&self) -> Option<Task> {
        if let Some(task) = self.parse_queue.pop() {
            return Some(Task::Parse(task));
        }
        if let Some(label) = self.build_queue.pop() {
            return Some(Task::Build(label));
        }
        self.test_queue.pop().map(Task::Test)
    }

    /// Reconciles one completed unit of work, successful or not. Anything a
    /// unit enqueues must be enqueued *before* its own `task_done`, so the
    /// counter can only reach zero at true quiescence.
    pub fn task_done(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Quiescent: wake idle workers so they observe it and exit.
            self.work_cond.notify_all();
        }
    }

    /// Units currently queued or in flight.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    /// True when every queue is empty and nothing is in flight.
    pub fn is_quiescent(&self) -> bool {
        self.pending() == 0
    }

    /// Parks the calling worker until new work may be available.
    pub fn park_for_work(&self, timeout: Duration) {
        let mut guard = self.idle_lock.lock();
        self.work_cond.wait_for(&mut guard, timeout);
    }

    fn notify_workers(&self) {
        self.work_cond.notify_one();
    }

    // ---- stop & failure flags ----

    /// Requests all workers stop at the next work boundary.
    pub fn stop_all(&self) {
        self.stop.store(true, Ordering::Release);
        self.work_cond.notify_all();
    }

    /// True once a stop was requested.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Records that some unit failed; the invocation exits non-zero.
    pub fn set_failed(&self) {
        self.failed.store(true, Ordering::Release);
        if self.stop_after_failure {
            self.stop_all();
        }
    }

    /// True once anything failed.
    pub fn has_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// Records a test failure (does not block unrelated targets).
    pub fn set_test_failed(&self) {
        self.test_failed.store(true, Ordering::Release);
    }

    /// True once any test failed.
    pub fn has_test_failures(&self) -> bool {
        self.test_failed.load(Ordering::Acquire)
    }

    /// Records a lint failure.
    pub fn set_lint_failed(&self) {
        self.lint_failed.store(true, Ordering::Release);
    }

    /// True once any lint failed.
    pub fn has_lint_failures(&self) -> bool {
        self.lint_failed.load(Ordering::Acquire)
    }

    // ---- results channel ----

    /// Takes the receiving end of the results channel. May be called once.
    pub fn take_results(&self) -> mpsc::Receiver<BuildResult> {
        self.results_rx
            .lock()
            .take()
            .expect("results receiver already taken")
    }

    /// Emits a result. Dropped silently if nobody is listening any more.
    pub fn send_result(&self, result: BuildResult) {
        let _ = self.results_tx.lock().send(result);
    }

    // ---- progress counters ----

    /// Records a target becoming Active (scheduled to build eventually).
    pub fn add_active_target(&self) {
        self.active.fetch_add(1, Ordering::AcqRel);
    }

    /// Records a test becoming anticipated for an Active target.
    pub fn add_active_test(&self) {
        self.active_tests.fetch_add(1, Ordering::AcqRel);
    }

    /// Records a remote execution in flight.
    pub fn add_active_remote(&self) {
        self.active_remote.fetch_add(1, Ordering::AcqRel);
    }

    /// Number of targets activated so far.
    pub fn active_targets(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Number of anticipated tests.
    pub fn active_tests(&self) -> usize {
        self.active_tests.load(Ordering::Acquire)
    }

    /// Number of remote executions in flight.
    pub fn active_remote(&self) -> usize {
        self.active_remote.load(Ordering::Acquire)
    }

    // ---- built-label notifications ----

    /// Signals that `label` reached a built state (post-build callback
    /// included). Idempotent.
    pub fn notify_built(&self, label: BuildLabel) {
        self.built.notify(label);
    }

    /// True once `label` has been notified built this invocation.
    pub fn is_notified_built(&self, label: &BuildLabel) -> bool {
        self.built.is_done(label)
    }

    /// Blocks until `label` is notified built. For observers outside the
    /// worker pool (workers themselves must never block on this).
    pub fn wait_for_built(&self, label: &BuildLabel) {
        self.built.wait(label);
    }

    // ---- deferred parses ----

    /// Registers a parse to re-run once `awaiting` is built.
    pub fn defer_parse(&self, awaiting: BuildLabel, task: ParseTask) {
        self.deferred.lock().entry(awaiting).or_default().push(task);
    }

    /// Takes the parses deferred on `built`, if any.
    pub fn take_deferred(&self, built: &BuildLabel) -> Vec<ParseTask> {
        self.deferred.lock().remove(built).unwrap_or_default()
    }

    /// Labels still awaited by deferred parses; used for exit diagnostics.
    pub fn deferred_labels(&self) -> Vec<BuildLabel> {
        self.deferred.lock().keys().cloned().collect()
    }

    // ---- filegroups ----

    /// Runs `f` under the process-wide filegroup lock with the memoised set
    /// of already-installed outputs.
    pub fn with_filegroup_lock<R>(&self, f: impl FnOnce(&mut HashSet<PathBuf>) -> R) -> R {
        let mut installed = self.filegroup_outputs.lock();
        f(&mut installed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::LocalRunner;
    use crate::parse::NoopInterpreter;

    fn state() -> BuildState {
        BuildState::new(
            Config::default(),
            Arc::new(NoopInterpreter),
            Arc::new(LocalRunner::default()),
        )
    }

    #[test]
    fn queue_bias_prefers_parse_then_build_then_test() {
        let s = state();
        s.add_pending_test(BuildLabel::new("pkg", "t"));
        s.add_pending_build(BuildLabel::new("pkg", "b"));
        s.add_pending_parse(ParseTask {
            label: BuildLabel::new("pkg", "p"),
            dependor: None,
            mode: ActivationMode::default(),
        });
        assert!(matches!(s.next_task(), Some(Task::Parse(_))));
        assert!(matches!(s.next_task(), Some(Task::Build(_))));
        assert!(matches!(s.next_task(), Some(Task::Test(_))));
        assert!(s.next_task().is_none());
        assert_eq!(s.pending(), 3);
    }

    #[test]
    fn pending_counter_reconciles() {
        let s = state();
        assert!(s.is_quiescent());
        s.add_pending_build(BuildLabel::new("pkg", "b"));
        assert!(!s.is_quiescent());
        let _ = s.next_task();
        s.task_done();
        assert!(s.is_quiescent());
    }

    #[test]
    fn results_channel_delivers() {
        let s = state();
        let rx = s.take_results();
        s.send_result(BuildResult::PackageParsed {
            label: BuildLabel::new("pkg", "all"),
        });
        assert!(matches!(
            rx.recv().unwrap(),
            BuildResult::PackageParsed { .. }
        ));
    }

    #[test]
    fn stop_after_failure_stops_the_world() {
        let mut s = state();
        s.stop_after_failure = true;
        assert!(!s.is_stopped());
        s.set_failed();
        assert!(s.has_failed());
        assert!(s.is_stopped());
    }

    #[test]
    fn failure_without_stop_after_failure_continues() {
        let s = state();
        s.set_failed();
        assert!(s.has_failed());
        assert!(!s.is_stopped());
    }

    #[test]
    fn deferred_parses_keyed_by_awaited_label() {
        let s = state();
        let awaited = BuildLabel::new("p2", "lib");
        s.defer_parse(
            awaited.clone(),
            ParseTask {
                label: BuildLabel::new("p1", "all"),
                dependor: None,
                mode: ActivationMode::default(),
            },
        );
        assert_eq!(s.deferred_labels(), vec![awaited.clone()]);
        let tasks = s.take_deferred(&awaited);
        assert_eq!(tasks.len(), 1);
        assert!(s.take_deferred(&awaited).is_empty());
    }

    #[test]
    fn filegroup_lock_memoises_outputs() {
        let s = state();
        let installed = s.with_filegroup_lock(|set| set.insert(PathBuf::from("out/a.txt")));
        assert!(installed);
        let installed_again = s.with_filegroup_lock(|set| set.insert(PathBuf::from("out/a.txt")));
        assert!(!installed_again);
    }
}
