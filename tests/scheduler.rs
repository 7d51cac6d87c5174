//! End-to-end scheduler behaviour through a scripted interpreter.

mod common;

use common::{ScriptedInterpreter, echo_target, public, read_output, state_with};
use plz::graph::{BuildTarget, Command, TargetState};
use plz::label::BuildLabel;
use plz::parse::{ParseError, register_target, require_subinclude};
use plz::sched;
use plz::state::BuildState;
use std::sync::Arc;

fn assert_quiescent(state: &Arc<BuildState>) {
    assert!(state.is_quiescent(), "pending counter is not zero");
    assert!(state.next_task().is_none(), "queues are not empty");
}

#[test]
fn builds_a_cross_package_chain() {
    let scratch = tempfile::tempdir().unwrap();
    let interpreter = ScriptedInterpreter::new()
        .package("app", |state, pkg| {
            let mut bin = echo_target("app", "bin", "binary");
            bin.add_dependency(BuildLabel::new("lib", "lib"), false);
            register_target(state, pkg, bin);
            Ok(())
        })
        .package("lib", |state, pkg| {
            register_target(state, pkg, echo_target("lib", "lib", "library"));
            Ok(())
        });
    let state = state_with(scratch.path(), interpreter);

    // An outside observer can rendezvous on a label being built.
    let watcher = {
        let state = Arc::clone(&state);
        std::thread::spawn(move || state.wait_for_built(&BuildLabel::new("lib", "lib")))
    };
    let summary = sched::run(&state, &[BuildLabel::parse("//app:bin").unwrap()]);
    watcher.join().unwrap();
    assert!(state.is_notified_built(&BuildLabel::new("lib", "lib")));

    assert!(summary.success(), "failures: {:?}", summary.failed);
    assert_quiescent(&state);
    assert_eq!(read_output(&state, "app", "bin"), "binary");
    assert_eq!(read_output(&state, "lib", "lib"), "library");

    let lib = state.graph.target(&BuildLabel::new("lib", "lib")).unwrap();
    let bin = state.graph.target(&BuildLabel::new("app", "bin")).unwrap();
    assert!(lib.state().is_built());
    assert!(bin.state().is_built());
    // The dependency edge was recorded both ways.
    assert_eq!(
        state.graph.reverse_dependencies(&lib.label),
        vec![bin.label.clone()]
    );
}

#[test]
fn deferred_parse_resumes_after_subinclude_builds() {
    // P1's build file subincludes //p2:lib, which is not parsed yet. The
    // parse of p1 defers, p2 parses and builds, then p1 re-parses and its
    // app builds.
    let scratch = tempfile::tempdir().unwrap();
    let interpreter = ScriptedInterpreter::new()
        .package("p1", |state, pkg| {
            require_subinclude(state, &BuildLabel::new("p2", "lib"))?;
            let mut app = echo_target("p1", "app", "application");
            app.add_dependency(BuildLabel::new("p2", "lib"), false);
            register_target(state, pkg, app);
            Ok(())
        })
        .package("p2", |state, pkg| {
            register_target(state, pkg, echo_target("p2", "lib", "subincluded"));
            Ok(())
        });
    let state = state_with(scratch.path(), interpreter);

    let summary = sched::run(&state, &[BuildLabel::parse("//p1:app").unwrap()]);

    assert!(summary.success(), "failures: {:?}", summary.failed);
    assert_quiescent(&state);
    assert!(state.deferred_labels().is_empty());
    assert_eq!(read_output(&state, "p1", "app"), "application");
    assert_eq!(read_output(&state, "p2", "lib"), "subincluded");
    let lib = state.graph.target(&BuildLabel::new("p2", "lib")).unwrap();
    assert!(lib.state().is_built());
}

#[test]
fn wildcard_activation_excludes_internal_targets() {
    // Two packages, three public targets each plus one internal; a tree
    // wildcard builds exactly the six public ones.
    let tree = tempfile::tempdir_in(".").unwrap();
    let base = format!(
        "{}/tree",
        tree.path().file_name().unwrap().to_string_lossy()
    );
    for pkg in ["pkg1", "pkg2"] {
        let dir = tree.path().join("tree").join(pkg);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("BUILD"), "").unwrap();
    }

    let scratch = tempfile::tempdir().unwrap();
    let mut interpreter = ScriptedInterpreter::new();
    for pkg in ["pkg1", "pkg2"] {
        let package_path = format!("{base}/{pkg}");
        let path_for_closure = package_path.clone();
        interpreter = interpreter.package(&package_path, move |state, p| {
            for name in ["one", "two", "three"] {
                register_target(state, p, echo_target(&path_for_closure, name, name));
            }
            register_target(
                state,
                p,
                echo_target(&path_for_closure, "_hidden#impl", "internal"),
            );
            Ok(())
        });
    }
    let state = state_with(scratch.path(), interpreter);

    let root = BuildLabel::parse(&format!("//{base}/...")).unwrap();
    let summary = sched::run(&state, &[root]);

    assert!(summary.success(), "failures: {:?}", summary.failed);
    assert_quiescent(&state);
    assert_eq!(summary.built.len(), 6, "built: {:?}", summary.built);
    for pkg in ["pkg1", "pkg2"] {
        for name in ["one", "two", "three"] {
            let label = BuildLabel::new(format!("{base}/{pkg}"), name);
            assert!(state.graph.target(&label).unwrap().state().is_built());
        }
        let internal = BuildLabel::new(format!("{base}/{pkg}"), "_hidden#impl");
        assert!(!state.graph.target(&internal).unwrap().state().is_built());
    }
}

#[test]
fn require_provide_rewires_dependency_edges() {
    // A requires "go" and depends on B's lib, which provides go and py
    // variants. A's effective dependency is the go one only.
    let scratch = tempfile::tempdir().unwrap();
    let interpreter = ScriptedInterpreter::new()
        .package("a", |state, pkg| {
            let mut bin = echo_target("a", "bin", "go-binary");
            bin.requires = vec!["go".to_owned()];
            bin.add_dependency(BuildLabel::new("b", "lib"), false);
            register_target(state, pkg, bin);
            Ok(())
        })
        .package("b", |state, pkg| {
            let mut lib = BuildTarget::new(BuildLabel::new("b", "lib"));
            lib.provides
                .insert("go".to_owned(), BuildLabel::new("b", "go_lib"));
            lib.provides
                .insert("py".to_owned(), BuildLabel::new("b", "py_lib"));
            lib.visibility = vec![public()];
            register_target(state, pkg, lib);
            register_target(state, pkg, echo_target("b", "go_lib", "go code"));
            register_target(state, pkg, echo_target("b", "py_lib", "py code"));
            Ok(())
        });
    let state = state_with(scratch.path(), interpreter);

    let summary = sched::run(&state, &[BuildLabel::parse("//a:bin").unwrap()]);

    assert!(summary.success(), "failures: {:?}", summary.failed);
    let bin = state.graph.target(&BuildLabel::new("a", "bin")).unwrap();
    assert_eq!(bin.dependencies(), vec![BuildLabel::new("b", "go_lib")]);
    assert!(
        state
            .graph
            .target(&BuildLabel::new("b", "go_lib"))
            .unwrap()
            .state()
            .is_built()
    );
    // Neither the facade nor the python variant was built.
    for name in ["lib", "py_lib"] {
        let t = state.graph.target(&BuildLabel::new("b", name)).unwrap();
        assert!(!t.state().is_built(), "{name} should not have built");
    }
}

#[test]
fn failed_dependency_blocks_dependents_but_terminates() {
    let scratch = tempfile::tempdir().unwrap();
    let interpreter = ScriptedInterpreter::new()
        .package("app", |state, pkg| {
            let mut bin = echo_target("app", "bin", "never");
            bin.add_dependency(BuildLabel::new("broken", "lib"), false);
            register_target(state, pkg, bin);
            Ok(())
        })
        .package("broken", |state, pkg| {
            let mut lib = BuildTarget::new(BuildLabel::new("broken", "lib"));
            lib.command = Some(Command::Plain(
                "echo compile error >&2; exit 1".to_owned(),
            ));
            lib.add_output("lib.txt");
            lib.visibility = vec![public()];
            register_target(state, pkg, lib);
            Ok(())
        });
    let state = state_with(scratch.path(), interpreter);

    let summary = sched::run(&state, &[BuildLabel::parse("//app:bin").unwrap()]);

    assert!(!summary.success());
    assert_quiescent(&state);
    assert_eq!(summary.failed.len(), 1);
    let err = summary.failed[0].to_string();
    assert!(err.contains("//broken:lib"), "{err}");
    assert_eq!(summary.blocked, vec![BuildLabel::new("app", "bin")]);
    assert_eq!(
        state
            .graph
            .target(&BuildLabel::new("app", "bin"))
            .unwrap()
            .state(),
        TargetState::Active
    );
    assert!(state.has_failed());
}

#[test]
fn parse_failure_is_reported_and_terminates() {
    let scratch = tempfile::tempdir().unwrap();
    let interpreter = ScriptedInterpreter::new().package("bad", |_, _| {
        Err(ParseError::Failed("name 'glob' is not defined".to_owned()))
    });
    let state = state_with(scratch.path(), interpreter);

    let summary = sched::run(&state, &[BuildLabel::parse("//bad:all").unwrap()]);
    assert!(!summary.success());
    assert_quiescent(&state);
    assert!(
        summary.failed[0].to_string().contains("glob"),
        "{}",
        summary.failed[0]
    );
}

#[test]
fn post_build_callback_adds_dependency_before_dependents_proceed() {
    // `user` depends on `gen`. gen's post-build callback (running before
    // anyone can observe gen as built) wires user up to `late`, so user may
    // only build after late has.
    let scratch = tempfile::tempdir().unwrap();
    let late_out = scratch
        .path()
        .join("plz-out/gen/p/late.txt")
        .display()
        .to_string();
    let interpreter = ScriptedInterpreter::new().package("p", move |state, pkg| {
        register_target(state, pkg, echo_target("p", "late", "late-content"));

        let mut generator = echo_target("p", "gen", "needs:late");
        generator.set_post_build(Arc::new(
            |state: &Arc<BuildState>,
             target: &Arc<plz::graph::BuildTarget>,
             stdout: Option<&[u8]>|
             -> Result<(), ParseError> {
                // The command prints nothing; the dependency is wired up
                // regardless of stdout contents.
                let _ = (target, stdout);
                let user = state
                    .graph
                    .target(&BuildLabel::new("p", "user"))
                    .expect("user is registered");
                user.add_dependency(BuildLabel::new("p", "late"), false);
                Ok(())
            },
        ));
        register_target(state, pkg, generator);

        let mut user = BuildTarget::new(BuildLabel::new("p", "user"));
        user.command = Some(Command::Plain(format!(
            "cat '{late_out}' > \"$OUT\""
        )));
        user.add_output("user.txt");
        user.visibility = vec![public()];
        user.add_dependency(BuildLabel::new("p", "gen"), false);
        register_target(state, pkg, user);
        Ok(())
    });
    let state = state_with(scratch.path(), interpreter);

    let summary = sched::run(&state, &[BuildLabel::parse("//p:user").unwrap()]);

    assert!(summary.success(), "failures: {:?}", summary.failed);
    assert_quiescent(&state);
    // user could only produce this by reading late's installed output.
    assert_eq!(read_output(&state, "p", "user"), "late-content");
    let user = state.graph.target(&BuildLabel::new("p", "user")).unwrap();
    let mut deps = user.dependencies();
    deps.sort();
    assert_eq!(
        deps,
        vec![BuildLabel::new("p", "gen"), BuildLabel::new("p", "late")]
    );
}

#[test]
fn random_dag_builds_to_quiescence() {
    // A randomized single-package DAG: every target depends on a few
    // earlier ones, so whatever interleaving the workers pick, dependency
    // order and termination must hold.
    fastrand::seed(42);
    let scratch = tempfile::tempdir().unwrap();
    let interpreter = ScriptedInterpreter::new().package("dag", |state, pkg| {
        for i in 0..30usize {
            let mut t = echo_target("dag", &format!("t{i}"), &format!("content{i}"));
            if i > 0 {
                for _ in 0..fastrand::usize(0..3) {
                    let dep = fastrand::usize(0..i);
                    t.add_dependency(BuildLabel::new("dag", format!("t{dep}")), false);
                }
            }
            register_target(state, pkg, t);
        }
        Ok(())
    });
    let state = state_with(scratch.path(), interpreter);

    let summary = sched::run(&state, &[BuildLabel::parse("//dag:all").unwrap()]);

    assert!(summary.success(), "failures: {:?}", summary.failed);
    assert_quiescent(&state);
    assert_eq!(summary.built.len(), 30);
    for i in 0..30 {
        assert_eq!(read_output(&state, "dag", &format!("t{i}")), format!("content{i}"));
    }
}

#[test]
fn second_invocation_reuses_unchanged_outputs() {
    let scratch = tempfile::tempdir().unwrap();
    let make_interpreter = || {
        ScriptedInterpreter::new().package("lib", |state, pkg| {
            register_target(state, pkg, echo_target("lib", "lib", "stable"));
            Ok(())
        })
    };
    let root = BuildLabel::parse("//lib:lib").unwrap();

    let state = state_with(scratch.path(), make_interpreter());
    let first = sched::run(&state, std::slice::from_ref(&root));
    assert!(first.success());
    assert_eq!(first.reused, 0);

    // A fresh invocation over the same output tree reuses the artifacts.
    let state = state_with(scratch.path(), make_interpreter());
    let second = sched::run(&state, std::slice::from_ref(&root));
    assert!(second.success());
    assert_eq!(second.reused, 1, "expected a Reused target: {second:?}");
    assert_eq!(read_output(&state, "lib", "lib"), "stable");
}

#[test]
fn tests_run_after_build_and_record_results() {
    let scratch = tempfile::tempdir().unwrap();
    let interpreter = ScriptedInterpreter::new().package("t", |state, pkg| {
        let mut test = echo_target("t", "good", "test-binary");
        test.is_test = true;
        test.test_command = Some("true".to_owned());
        register_target(state, pkg, test);

        let mut failing = echo_target("t", "bad", "test-binary");
        failing.is_test = true;
        failing.test_command = Some("echo assertion failed; exit 1".to_owned());
        register_target(state, pkg, failing);
        Ok(())
    });
    let state = {
        let mut config = plz::Config::default();
        config.build.output_dir = scratch.path().join("plz-out");
        config.cache.dir = scratch.path().join(".plz-cache");
        let mut s = BuildState::new(
            config,
            Arc::new(interpreter),
            Arc::new(plz::exec::LocalRunner::default()),
        );
        s.need_tests = true;
        Arc::new(s)
    };

    let summary = sched::run(&state, &[BuildLabel::parse("//t:all").unwrap()]);

    assert_quiescent(&state);
    assert_eq!(summary.tested, vec![BuildLabel::new("t", "good")]);
    assert!(state.has_test_failures());
    let good = state.graph.target(&BuildLabel::new("t", "good")).unwrap();
    assert_eq!(good.state(), TargetState::Tested);
    assert_eq!(good.test_results().unwrap().passed, 1);
    let bad = state.graph.target(&BuildLabel::new("t", "bad")).unwrap();
    assert_eq!(bad.state(), TargetState::Failed);
    assert!(bad.test_results().unwrap().output.contains("assertion failed"));
}
