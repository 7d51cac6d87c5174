//! The per-target build pipeline.
//!
//! A build worker takes a Pending target through: cache probe, source
//! staging, command execution, post-build callback, output install, hashing
//! and verification, cache store. Failures surface on the results channel
//! and leave the target Failed; dependents simply never become eligible.

pub mod filegroup;
pub mod hashes;

use crate::exec::{CommandSpec, ExecError};
use crate::graph::{BuildTarget, TargetState};
use crate::label::BuildLabel;
use crate::results::{BuildError, BuildResult, TestResults};
use crate::sched;
use crate::state::BuildState;
use crate::util::fs as ufs;
use hashes::TargetHasher;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Name of the hidden file recording the rule hash a target was last built
/// with; a match lets an untouched output tree be reused outright.
fn rule_hash_file(target: &BuildTarget) -> String {
    format!(".{}.rulehash", target.label.name)
}

/// Name of the hidden file capturing build stdout, kept so post-build
/// callbacks replay correctly on cache hits.
fn stdout_file(target: &BuildTarget) -> String {
    format!(".{}.build_stdout", target.label.name)
}

/// Builds one target picked off the build queue.
pub(crate) fn build_target(state: &Arc<BuildState>, label: &BuildLabel) {
    let target = state.graph.target_or_die(label);
    if state.is_stopped() {
        target.transition_to(TargetState::Stopped);
        return;
    }
    // Exactly one worker claims the move out of Pending.
    if !target.sync_update_state(TargetState::Pending, TargetState::Building) {
        return;
    }
    match build_one(state, &target) {
        Ok(terminal) => {
            target.transition_to(terminal);
            state.send_result(BuildResult::TargetBuilt {
                label: target.label.clone(),
                state: terminal,
            });
            sched::on_target_built(state, &target);
        }
        Err(err) => {
            warn!(target = %target.label, %err, "build failed");
            target.transition_to(TargetState::Failed);
            state.set_failed();
            state.send_result(BuildResult::Failed(err));
            sched::on_target_failed(state, &target);
        }
    }
}

/// The pipeline proper; returns the terminal state on success.
fn build_one(state: &Arc<BuildState>, target: &Arc<BuildTarget>) -> Result<TargetState, BuildError> {
    let config = &state.config;
    let out_dir = target.out_dir(config);
    fs::create_dir_all(&out_dir).map_err(|e| internal_error(target, "create output dir", &e))?;

    // Filegroups and commandless rules just rearrange existing files.
    if target.is_filegroup || target.command.is_none() {
        filegroup::build_filegroup(state, target)?;
        let _ = state.hasher.force_output_hash(config, target);
        return Ok(TargetState::Built);
    }

    let key = state
        .hasher
        .rule_hash(&state.graph, config, target, state.profile.as_deref())
        .map_err(|e| internal_error(target, "fingerprint inputs", &e))?;

    // An output tree built with this exact rule hash needs no work at all.
    let marker = out_dir.join(rule_hash_file(target));
    if fs::read(&marker).is_ok_and(|prev| prev == key.0)
        && target
            .output_paths(config)
            .iter()
            .all(|path| path.exists())
    {
        let _ = state.hasher.output_hash(config, target);
        debug!(target = %target.label, "outputs reused");
        return Ok(TargetState::Reused);
    }

    // Cache probe.
    if target.is_cacheable()
        && let Some(cache) = &state.cache
    {
        if cache.retrieve(target, &key) {
            if replay_post_build(state, target, cache.as_ref(), &key)? {
                finish_outputs(state, target, &key, &marker)?;
                debug!(target = %target.label, "retrieved from cache");
                return Ok(TargetState::Cached);
            }
            // Couldn't replay the callback; fall through to a real build.
        } else if config.cache.authoritative {
            return Err(BuildError::CacheFailed {
                label: target.label.clone(),
                reason: "authoritative cache has no artifacts for this key".to_owned(),
            });
        }
    }

    // The previous output hash, when outputs already exist, distinguishes
    // Unchanged rebuilds from fresh ones.
    let previous_hash = if target.output_paths(config).iter().all(|p| p.exists()) {
        state.hasher.force_output_hash(config, target).ok()
    } else {
        None
    };

    if let Some(pre_build) = target.pre_build() {
        pre_build
            .invoke(state, target, None)
            .map_err(|e| BuildError::TargetBuildFailed {
                label: target.label.clone(),
                reason: format!("pre-build callback failed: {e}"),
                stdout: String::new(),
                stderr: String::new(),
            })?;
    }

    let stdout = run_build_command(state, target)?;

    // Post-build callback runs before anyone can observe the target built,
    // and may add outputs or rewire targets in this package.
    if let Some(post_build) = target.post_build() {
        ufs::atomic_write(&out_dir.join(stdout_file(target)), &stdout)
            .map_err(|e| internal_error(target, "record stdout", &e))?;
        post_build
            .invoke(state, target, Some(&stdout))
            .map_err(|e| BuildError::TargetBuildFailed {
                label: target.label.clone(),
                reason: format!("post-build callback failed: {e}"),
                stdout: String::from_utf8_lossy(&stdout).into_owned(),
                stderr: String::new(),
            })?;
        install_outputs(state, target)?;
        if let Some(package) = state.graph.package(&target.label.package_name()) {
            sched::rescan_package(state, &package);
        }
    }

    let hash = finish_outputs(state, target, &key, &marker)?;

    if let Some(cache) = &state.cache
        && target.is_cacheable()
    {
        let extras = if target.post_build().is_some() {
            vec![stdout_file(target)]
        } else {
            Vec::new()
        };
        cache.store(target, &key, &extras);
    }

    if previous_hash.as_deref() == Some(hash.as_slice()) {
        debug!(target = %target.label, "outputs unchanged");
        return Ok(TargetState::Unchanged);
    }
    Ok(TargetState::Built)
}

/// Runs the build command in a clean scratch dir and installs declared
/// outputs into the output tree. Returns captured stdout.
fn run_build_command(
    state: &Arc<BuildState>,
    target: &Arc<BuildTarget>,
) -> Result<Vec<u8>, BuildError> {
    let config = &state.config;
    let tmp_dir = target.build_tmp_dir(config);
    ufs::remove_dir_if_exists(&tmp_dir)
        .and_then(|()| fs::create_dir_all(&tmp_dir))
        .map_err(|e| internal_error(target, "prepare build dir", &e))?;

    // Stage sources into the scratch dir.
    let mut src_names = Vec::new();
    for src in target.sources() {
        for path in src.paths(&state.graph, config) {
            let Some(name) = path.file_name() else {
                continue;
            };
            ufs::link_or_copy_all(&path, &tmp_dir.join(name)).map_err(|e| {
                BuildError::TargetBuildFailed {
                    label: target.label.clone(),
                    reason: format!("missing source {}: {e}", path.display()),
                    stdout: String::new(),
                    stderr: String::new(),
                }
            })?;
            src_names.push(name.to_string_lossy().into_owned());
        }
    }

    let command = target
        .command
        .as_ref()
        .and_then(|c| c.resolve(state.profile.as_deref()))
        .ok_or_else(|| BuildError::TargetBuildFailed {
            label: target.label.clone(),
            reason: "no command for the current profile".to_owned(),
            stdout: String::new(),
            stderr: String::new(),
        })?;

    let outs = target.all_outputs();
    let spec = CommandSpec {
        command: command.to_owned(),
        cwd: tmp_dir.clone(),
        env: build_env(state, target, &src_names, &outs),
        timeout: target.build_timeout_or(config),
        sandbox: target.sandbox,
    };
    let output = state.runner.run(&spec).map_err(|err| match err {
        ExecError::Timeout { stderr, .. } => BuildError::Timeout {
            label: target.label.clone(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        },
        ExecError::NonZero {
            code,
            stdout,
            stderr,
        } => BuildError::TargetBuildFailed {
            label: target.label.clone(),
            reason: format!("command exited with status {code}"),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        },
        ExecError::Io(e) => internal_error(target, "spawn command", &e),
    })?;

    install_outputs(state, target)?;
    Ok(output.stdout)
}

/// Moves declared outputs from the scratch dir into the output tree.
/// Already-installed outputs (e.g. from before a post-build callback added
/// more) are left alone.
fn install_outputs(state: &Arc<BuildState>, target: &Arc<BuildTarget>) -> Result<(), BuildError> {
    let config = &state.config;
    let tmp_dir = target.build_tmp_dir(config);
    let out_dir = target.out_dir(config);
    for output in target.all_outputs() {
        let built = tmp_dir.join(&output);
        let installed = out_dir.join(&output);
        if !built.exists() {
            if installed.exists() {
                continue;
            }
            return Err(BuildError::TargetBuildFailed {
                label: target.label.clone(),
                reason: format!("command did not produce declared output {output}"),
                stdout: String::new(),
                stderr: String::new(),
            });
        }
        if installed.exists() {
            let cleared = if installed.is_dir() {
                ufs::remove_dir_if_exists(&installed)
            } else {
                fs::remove_file(&installed)
            };
            cleared.map_err(|e| internal_error(target, "clear stale output", &e))?;
        }
        if let Some(parent) = installed.parent() {
            fs::create_dir_all(parent).map_err(|e| internal_error(target, "create output dir", &e))?;
        }
        fs::rename(&built, &installed)
            .or_else(|_| ufs::link_or_copy_all(&built, &installed))
            .map_err(|e| internal_error(target, "install output", &e))?;
    }
    Ok(())
}

/// Hashes installed outputs, verifies pinned hashes, and writes the rule
/// hash marker. Returns the output hash.
fn finish_outputs(
    state: &Arc<BuildState>,
    target: &Arc<BuildTarget>,
    key: &hashes::CacheKey,
    marker: &Path,
) -> Result<Vec<u8>, BuildError> {
    let hash = state
        .hasher
        .force_output_hash(&state.config, target)
        .map_err(|e| internal_error(target, "hash outputs", &e))?;
    if !TargetHasher::verify_pinned(target, &hash) && !single_sha1_matches(state, target) {
        return Err(BuildError::TargetBuildFailed {
            label: target.label.clone(),
            reason: format!(
                "output hash {} does not match any declared hash",
                hashes::hex(&hash)
            ),
            stdout: String::new(),
            stderr: String::new(),
        });
    }
    ufs::atomic_write(marker, &key.0).map_err(|e| internal_error(target, "record rule hash", &e))?;
    Ok(hash)
}

/// On a cache hit, replays the post-build callback from the cached stdout.
/// Returns false when the stdout record is missing and the target must be
/// rebuilt for real.
fn replay_post_build(
    state: &Arc<BuildState>,
    target: &Arc<BuildTarget>,
    cache: &dyn crate::cache::Cache,
    key: &hashes::CacheKey,
) -> Result<bool, BuildError> {
    let Some(post_build) = target.post_build() else {
        return Ok(true);
    };
    let file = stdout_file(target);
    if !cache.retrieve_extra(target, key, &file) {
        return Ok(false);
    }
    let stdout = fs::read(target.out_dir(&state.config).join(&file))
        .map_err(|e| internal_error(target, "read cached stdout", &e))?;
    post_build
        .invoke(state, target, Some(&stdout))
        .map_err(|e| BuildError::TargetBuildFailed {
            label: target.label.clone(),
            reason: format!("post-build callback failed: {e}"),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::new(),
        })?;
    if let Some(package) = state.graph.package(&target.label.package_name()) {
        sched::rescan_package(state, &package);
    }
    Ok(true)
}

fn build_env(
    state: &Arc<BuildState>,
    target: &BuildTarget,
    srcs: &[String],
    outs: &[String],
) -> Vec<(String, String)> {
    let mut env = vec![
        ("PKG".to_owned(), target.label.package.clone()),
        ("NAME".to_owned(), target.label.name.clone()),
        ("SRCS".to_owned(), srcs.join(" ")),
        ("OUTS".to_owned(), outs.join(" ")),
        (
            "TMP_DIR".to_owned(),
            target.build_tmp_dir(&state.config).display().to_string(),
        ),
    ];
    if let [only] = outs {
        env.push(("OUT".to_owned(), only.clone()));
    }
    if let Some(container) = &state.config.build.default_container {
        env.push(("CONTAINER".to_owned(), container.clone()));
    }
    env
}

/// Old pins on single-output targets may be plain SHA-1 file hashes even
/// when the configured algorithm differs; the `single_sha1_hash` flag keeps
/// accepting them.
fn single_sha1_matches(state: &Arc<BuildState>, target: &Arc<BuildTarget>) -> bool {
    if !state.config.build.single_sha1_hash || target.hashes.is_empty() {
        return false;
    }
    let outputs = target.output_paths(&state.config);
    let [only] = outputs.as_slice() else {
        return false;
    };
    hashes::ContentHasher::Sha1
        .digest_file(only)
        .is_ok_and(|sha1| TargetHasher::verify_pinned(target, &sha1))
}

fn internal_error(target: &BuildTarget, doing: &str, err: &dyn std::fmt::Display) -> BuildError {
    BuildError::TargetBuildFailed {
        label: target.label.clone(),
        reason: format!("failed to {doing}: {err}"),
        stdout: String::new(),
        stderr: String::new(),
    }
}

/// Runs one target's tests off the test queue.
pub(crate) fn test_target(state: &Arc<BuildState>, label: &BuildLabel) {
    let target = state.graph.target_or_die(label);
    if state.is_stopped() || !target.state().is_built() {
        return;
    }
    let Some(test_command) = target.test_command.clone() else {
        return;
    };
    let config = &state.config;
    let started = Instant::now();
    let mut env = build_env(state, &target, &[], &target.all_outputs());
    if state.need_coverage {
        env.push(("COVERAGE".to_owned(), "true".to_owned()));
    }
    let spec = CommandSpec {
        command: test_command,
        cwd: target.out_dir(config),
        env,
        timeout: target.test_timeout_or(config),
        sandbox: target.sandbox,
    };
    match state.runner.run(&spec) {
        Ok(output) => {
            let results = TestResults {
                num_tests: 1,
                passed: 1,
                failed: 0,
                skipped: 0,
                duration: started.elapsed(),
                output: String::from_utf8_lossy(&output.stdout).into_owned(),
            };
            target.set_test_results(results.clone());
            target.transition_to(TargetState::Tested);
            state.send_result(BuildResult::TargetTested {
                label: target.label.clone(),
                results,
            });
        }
        Err(err) => {
            let (reason, output) = match &err {
                ExecError::Timeout { stderr, .. } => (
                    "Timeout exceeded".to_owned(),
                    String::from_utf8_lossy(stderr).into_owned(),
                ),
                ExecError::NonZero { code, stdout, stderr } => (
                    format!("tests exited with status {code}"),
                    format!(
                        "{}{}",
                        String::from_utf8_lossy(stdout),
                        String::from_utf8_lossy(stderr)
                    ),
                ),
                ExecError::Io(e) => (format!("failed to run tests: {e}"), String::new()),
            };
            target.set_test_results(TestResults {
                num_tests: 1,
                passed: 0,
                failed: 1,
                skipped: 0,
                duration: started.elapsed(),
                output: output.clone(),
            });
            target.transition_to(TargetState::Failed);
            state.set_test_failed();
            state.send_result(BuildResult::Failed(BuildError::TargetTestFailed {
                label: target.label.clone(),
                reason,
                output,
            }));
        }
    }
}
