//! The bridge to the build-file interpreter.
//!
//! The core does not know the surface language. It hands a claimed
//! [`Package`] to an [`Interpreter`], which registers targets back onto it
//! through [`register_target`] and may call [`require_subinclude`] to demand
//! another package's build artifacts at parse time. An unbuilt subinclude
//! aborts the parse with [`ParseError::Deferred`]; the scheduler forces the
//! awaited target to build and re-runs the parse afterwards.
//!
//! Pre- and post-build callbacks are opaque [`CallbackHandle`]s owned by the
//! interpreter; the core only decides when to invoke them.

use crate::graph::{BuildTarget, Package};
use crate::label::BuildLabel;
use crate::results::{BuildError, BuildResult};
use crate::sched;
use crate::state::{ActivationMode, BuildState, ParseTask};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Error raised while interpreting a build file.
#[derive(Debug, Error, Clone)]
pub enum ParseError {
    /// The build file subincludes a target that has not built yet; parse
    /// again once it has.
    #[error("deferred on unbuilt subinclude {0}")]
    Deferred(BuildLabel),
    /// The interpreter raised; fatal for this package and its dependents.
    #[error("{0}")]
    Failed(String),
}

/// Executes build files against a package.
pub trait Interpreter: Send + Sync {
    /// Parses the package's build file, registering its targets via
    /// [`register_target`]. Must be re-runnable: a deferred parse executes
    /// again from the top once the awaited target builds.
    fn parse_package(&self, state: &Arc<BuildState>, package: &Arc<Package>)
    -> Result<(), ParseError>;
}

/// An opaque callback registered by the interpreter on a target.
pub trait CallbackHandle: Send + Sync {
    /// Invokes the callback. Post-build callbacks receive the command's
    /// captured stdout; pre-build callbacks get `None`.
    fn invoke(
        &self,
        state: &Arc<BuildState>,
        target: &Arc<BuildTarget>,
        stdout: Option<&[u8]>,
    ) -> Result<(), ParseError>;
}

impl<F> CallbackHandle for F
where
    F: Fn(&Arc<BuildState>, &Arc<BuildTarget>, Option<&[u8]>) -> Result<(), ParseError>
        + Send
        + Sync,
{
    fn invoke(
        &self,
        state: &Arc<BuildState>,
        target: &Arc<BuildTarget>,
        stdout: Option<&[u8]>,
    ) -> Result<(), ParseError> {
        self(state, target, stdout)
    }
}

/// An interpreter that parses every package as empty. Stands in where no
/// surface language is wired up.
pub struct NoopInterpreter;

impl Interpreter for NoopInterpreter {
    fn parse_package(&self, _: &Arc<BuildState>, _: &Arc<Package>) -> Result<(), ParseError> {
        Ok(())
    }
}

/// Registers a declared target onto its package and the graph. Re-parses of
/// deferred packages re-register their declarations; those return the
/// already-registered target untouched.
pub fn register_target(
    state: &Arc<BuildState>,
    package: &Arc<Package>,
    target: BuildTarget,
) -> Arc<BuildTarget> {
    let (target, added) = package.add_target(target);
    if added {
        for out in target.all_outputs() {
            package.register_output(&out, &target.label);
        }
        state.graph.add_target(Arc::clone(&target));
        debug!(target = %target.label, "registered target");
    }
    target
}

/// Demands that `label` is built before parsing can continue. Interpreters
/// call this for each `subinclude`; the `?` on the result aborts the parse
/// with a deferral the scheduler knows how to resume.
pub fn require_subinclude(state: &Arc<BuildState>, label: &BuildLabel) -> Result<(), ParseError> {
    match state.graph.target(label) {
        Some(target) if target.state().is_built() => Ok(()),
        Some(target) if target.state().is_done() => Err(ParseError::Failed(format!(
            "subincluded target {label} failed to build"
        ))),
        _ => Err(ParseError::Deferred(label.clone())),
    }
}

/// Runs one parse task: claims the package if nobody has, interprets its
/// build file, and activates the requested label against the result.
pub(crate) fn parse_step(state: &Arc<BuildState>, task: &ParseTask) {
    let name = task.label.package_name();
    let (package, created) = state.graph.get_or_add_package(&name);
    let claimed = created || package.claim_reparse();
    if claimed {
        if created {
            locate_build_file(state, &package);
        }
        match state.interpreter.parse_package(state, &package) {
            Ok(()) => {
                package.mark_ready();
                debug!(package = %package.name, "parsed package");
                state.send_result(BuildResult::PackageParsed {
                    label: task.label.clone(),
                });
            }
            Err(ParseError::Deferred(subinclude)) => {
                // A subinclude that already terminally failed can never
                // satisfy this parse; fail it now instead of deferring
                // forever.
                if state
                    .graph
                    .target(&subinclude)
                    .is_some_and(|t| t.state().is_done() && !t.state().is_built())
                {
                    package.mark_ready();
                    state.send_result(BuildResult::Failed(BuildError::ParseFailed {
                        label: task.label.clone(),
                        reason: format!("subincluded target {subinclude} failed to build"),
                    }));
                    state.set_failed();
                    return;
                }
                debug!(
                    package = %package.name,
                    subinclude = %subinclude,
                    "parse deferred on unbuilt subinclude"
                );
                package.mark_deferred();
                state.defer_parse(subinclude.clone(), task.clone());
                // Force the awaited target to build even if this invocation
                // otherwise would not.
                sched::activate(
                    state,
                    &subinclude,
                    None,
                    &ActivationMode {
                        force_build: true,
                        arch: task.mode.arch.clone(),
                        ..ActivationMode::default()
                    },
                );
                // The target may have finished between the interpreter's
                // check and the registration above; resume rather than
                // strand.
                if state
                    .graph
                    .target(&subinclude)
                    .is_some_and(|t| t.state().is_done())
                {
                    for deferred in state.take_deferred(&subinclude) {
                        state.add_pending_parse(deferred);
                    }
                }
                return;
            }
            Err(ParseError::Failed(reason)) => {
                warn!(package = %package.name, %reason, "parse failed");
                // Release waiters; the package simply has no targets.
                package.mark_ready();
                state.send_result(BuildResult::Failed(BuildError::ParseFailed {
                    label: task.label.clone(),
                    reason,
                }));
                state.set_failed();
                return;
            }
        }
    } else if !package.is_ready() {
        // Another worker holds the parse (or it deferred); requeue rather
        // than tying this worker to the ready gate.
        std::thread::sleep(std::time::Duration::from_millis(1));
        state.add_pending_parse(task.clone());
        return;
    }
    sched::activate(state, &task.label, task.dependor.as_ref(), &task.mode);
}

/// Finds the package's build file on disk, if it exists. Interpreters that
/// synthesise packages (tests, queries) work without one.
fn locate_build_file(state: &Arc<BuildState>, package: &Arc<Package>) {
    let base = match &package.name.subrepo {
        Some(name) => match state.graph.subrepo(name) {
            Some(subrepo) => subrepo.root.join(&package.name.package),
            None => return,
        },
        None => PathBuf::from(&package.name.package),
    };
    for candidate in &state.config.build.build_file_name {
        let path = if package.name.package.is_empty() && package.name.subrepo.is_none() {
            PathBuf::from(candidate)
        } else {
            base.join(candidate)
        };
        if path.is_file() {
            package.set_filename(path);
            return;
        }
    }
}
