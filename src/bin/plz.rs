//! The `plz` command line entry point.

use clap::Parser;
use plz::exec::LocalRunner;
use plz::label::BuildLabel;
use plz::parse::NoopInterpreter;
use plz::{BuildState, Config, sched};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;
use tracing_subscriber::EnvFilter;

/// Parallel, content-cached build system.
#[derive(Debug, Parser)]
#[command(name = "plz", version, about)]
struct Args {
    /// Labels to build, e.g. //src/core:lib, //src/..., //pkg:all.
    #[arg(required = true)]
    targets: Vec<String>,

    /// Number of worker threads (0 = one per CPU).
    #[arg(short = 'n', long, default_value_t = 0)]
    num_threads: usize,

    /// Disable the artifact caches for this invocation.
    #[arg(long)]
    no_cache: bool,

    /// Run tests of the built targets.
    #[arg(short, long)]
    test: bool,

    /// Collect coverage while testing (implies --test).
    #[arg(long)]
    coverage: bool,

    /// Only build targets carrying one of these labels.
    #[arg(long = "include", value_name = "LABEL")]
    include: Vec<String>,

    /// Skip targets carrying one of these labels.
    #[arg(long = "exclude", value_name = "LABEL")]
    exclude: Vec<String>,

    /// Architecture override applied to the given targets.
    #[arg(long)]
    arch: Option<String>,

    /// Stop the whole invocation at the first failure.
    #[arg(long)]
    stop_after_failure: bool,

    /// Config file path.
    #[arg(long, default_value = ".plzconfig")]
    config: PathBuf,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let args = Args::parse();

    let mut config = if args.config.is_file() {
        match Config::load(&args.config) {
            Ok(config) => config,
            Err(err) => {
                error!(%err, "bad configuration");
                return ExitCode::FAILURE;
            }
        }
    } else {
        Config::default()
    };
    if args.num_threads > 0 {
        config.build.num_threads = args.num_threads;
    }

    let mut roots = Vec::with_capacity(args.targets.len());
    for target in &args.targets {
        match BuildLabel::parse(target) {
            Ok(label) => roots.push(label),
            Err(err) => {
                eprintln!("{err}");
                return ExitCode::FAILURE;
            }
        }
    }

    let runner = Arc::new(LocalRunner::from_config(&config));
    // The surface language binding supplies the real interpreter; without
    // one, packages parse as empty and only already-known labels resolve.
    let mut state = BuildState::new(config, Arc::new(NoopInterpreter), runner);
    if !args.no_cache {
        state.cache = plz::cache::from_config(&state.config);
    }
    state.need_tests = args.test || args.coverage;
    state.need_coverage = args.coverage;
    state.include = args.include;
    state.exclude = args.exclude;
    state.arch = args.arch;
    state.stop_after_failure = args.stop_after_failure;
    let state = Arc::new(state);

    let summary = sched::run(&state, &roots);
    if let Some(cache) = &state.cache {
        cache.shutdown();
    }

    for err in &summary.failed {
        eprintln!("{err}");
        if let plz::BuildError::TargetBuildFailed { stdout, stderr, .. } = err {
            if !stdout.is_empty() {
                eprintln!("--- stdout ---\n{stdout}");
            }
            if !stderr.is_empty() {
                eprintln!("--- stderr ---\n{stderr}");
            }
        }
    }
    for label in &summary.blocked {
        eprintln!("{label} was not built: a dependency failed or never resolved");
    }
    println!(
        "built {} targets ({} cached, {} reused), {} tested, {} failed",
        summary.built.len(),
        summary.cached,
        summary.reused,
        summary.tested.len(),
        summary.failed.len(),
    );
    if summary.success() && !state.has_test_failures() && !state.has_lint_failures() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
