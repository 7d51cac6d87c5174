//! Filegroup handling.
//!
//! Filegroups re-export existing files without running a command. Several
//! filegroups may legitimately claim the same output file, so the linking
//! step runs under the process-wide filegroup lock and memoises which
//! destinations have been installed; repeated requests are no-ops.

use crate::graph::BuildTarget;
use crate::label::BuildInput;
use crate::results::BuildError;
use crate::state::BuildState;
use crate::util::fs as ufs;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::debug;

/// Links a filegroup's sources into its output directory.
pub(crate) fn build_filegroup(
    state: &Arc<BuildState>,
    target: &Arc<BuildTarget>,
) -> Result<(), BuildError> {
    let out_dir = target.out_dir(&state.config);
    let mut links: Vec<(PathBuf, PathBuf)> = Vec::new();
    for src in target.sources() {
        for path in src.paths(&state.graph, &state.config) {
            let dst = match &src {
                BuildInput::File { file, .. } => {
                    out_dir.join(file.rsplit('/').next().unwrap_or(file))
                }
                _ => match path.file_name() {
                    Some(name) => out_dir.join(name),
                    None => continue,
                },
            };
            links.push((path, dst));
        }
    }
    state.with_filegroup_lock(|installed| {
        for (src, dst) in links {
            if installed.contains(&dst) {
                continue;
            }
            ufs::link_or_copy_all(&src, &dst).map_err(|err| BuildError::TargetBuildFailed {
                label: target.label.clone(),
                reason: format!("failed to link {}: {err}", src.display()),
                stdout: String::new(),
                stderr: String::new(),
            })?;
            installed.insert(dst);
        }
        Ok(())
    })?;
    debug!(target = %target.label, "filegroup linked");
    Ok(())
}
