//! Shared harness for scheduler integration tests: a scripted interpreter
//! standing in for the build-file language, and helpers for assembling
//! targets against a scratch directory.

use parking_lot::Mutex;
use plz::config::Config;
use plz::exec::LocalRunner;
use plz::graph::{BuildTarget, Command, Package};
use plz::label::{ALL_SUBPACKAGES, BuildLabel};
use plz::parse::{Interpreter, ParseError};
use plz::state::BuildState;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

type ParseFn =
    Box<dyn Fn(&Arc<BuildState>, &Arc<Package>) -> Result<(), ParseError> + Send + Sync>;

/// Interpreter scripted per package path; parses of unknown packages fail.
#[derive(Default)]
pub struct ScriptedInterpreter {
    packages: Mutex<HashMap<String, Arc<ParseFn>>>,
}

impl ScriptedInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the parse of one package.
    #[must_use]
    pub fn package(
        self,
        name: &str,
        f: impl Fn(&Arc<BuildState>, &Arc<Package>) -> Result<(), ParseError>
        + Send
        + Sync
        + 'static,
    ) -> Self {
        self.packages
            .lock()
            .insert(name.to_owned(), Arc::new(Box::new(f)));
        self
    }
}

impl Interpreter for ScriptedInterpreter {
    fn parse_package(
        &self,
        state: &Arc<BuildState>,
        package: &Arc<Package>,
    ) -> Result<(), ParseError> {
        let script = self.packages.lock().get(&package.name.package).cloned();
        match script {
            Some(script) => script(state, package),
            None => Err(ParseError::Failed(format!(
                "no build file for package {}",
                package.name
            ))),
        }
    }
}

/// A `BuildState` rooted in a scratch directory, with caching enabled.
pub fn state_with(scratch: &Path, interpreter: ScriptedInterpreter) -> Arc<BuildState> {
    let mut config = Config::default();
    config.build.output_dir = scratch.join("plz-out");
    config.cache.dir = scratch.join(".plz-cache");
    config.build.num_threads = 4;
    let mut state = BuildState::new(
        config,
        Arc::new(interpreter),
        Arc::new(LocalRunner::default()),
    );
    state.cache = plz::cache::from_config(&state.config);
    Arc::new(state)
}

/// A publicly visible target that writes `contents` to its single output.
pub fn echo_target(package: &str, name: &str, contents: &str) -> BuildTarget {
    let mut t = BuildTarget::new(BuildLabel::new(package, name));
    t.command = Some(Command::Plain(format!("printf '%s' '{contents}' > \"$OUT\"")));
    t.add_output(format!("{name}.txt"));
    t.visibility = vec![public()];
    t
}

/// The `//...` visibility label.
pub fn public() -> BuildLabel {
    BuildLabel {
        subrepo: None,
        package: String::new(),
        name: ALL_SUBPACKAGES.to_owned(),
    }
}

/// Reads a target's single output out of the output tree.
pub fn read_output(state: &Arc<BuildState>, package: &str, name: &str) -> String {
    let path = state
        .config
        .gen_dir()
        .join(package)
        .join(format!("{name}.txt"));
    std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("missing output {}: {e}", path.display()))
}
