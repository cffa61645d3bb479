//! Alias behaviour end to end: contribution aggregation, sentinel
//! short-circuiting across sessions, and re-runs on definition change.

use std::sync::Arc;

use camino::Utf8PathBuf;
use kumade::eval::Session;
use kumade::exec::{Action, ExecMode};
use kumade::expr::need_paths;
use kumade::graph::{BuildGraph, GraphBuilder, TargetSpec};
use kumade::path::{PathSet, path_set};

fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
    (dir, root)
}

fn session(root: &Utf8PathBuf, graph: BuildGraph) -> Session {
    Session::new(Arc::new(graph), root.clone(), ExecMode::Direct, 4)
}

fn touch_rule(builder: &mut GraphBuilder, name: &str) {
    builder
        .register_rule(
            TargetSpec::Declared(path_set([name])),
            need_paths(PathSet::default()),
            Action::Command {
                program: "touch".into(),
                args: vec![name.to_owned()],
            },
        )
        .expect("register");
}

fn append_action(line: &str, log: &str) -> Action {
    Action::Command {
        program: "sh".into(),
        args: vec!["-c".into(), format!("echo {line} >> {log}")],
    }
}

fn log_lines(root: &Utf8PathBuf, log: &str) -> usize {
    std::fs::read_to_string(root.join(log)).map_or(0, |text| text.lines().count())
}

#[tokio::test]
async fn alias_builds_the_union_of_its_contributions() {
    let (_guard, root) = scratch();
    let mut builder = GraphBuilder::new();
    for name in ["a", "b", "c"] {
        touch_rule(&mut builder, name);
        builder.register_alias("all", ".", need_paths(path_set([name])), None);
    }
    let session = session(&root, builder.freeze());

    let alias = session.graph().find_alias("all").expect("alias");
    session.require_alias(alias).await.expect("build alias");

    for name in ["a", "b", "c"] {
        assert!(root.join(name).exists(), "{name} not built via alias");
    }
}

#[tokio::test]
async fn same_name_in_different_directories_stays_distinct() {
    let (_guard, root) = scratch();
    std::fs::create_dir_all(root.join("pkg")).expect("mkdir");
    std::fs::create_dir_all(root.join("other")).expect("mkdir");
    let mut builder = GraphBuilder::new();
    touch_rule(&mut builder, "pkg/lib.o");
    touch_rule(&mut builder, "other/lib.o");
    builder.register_alias("check", "pkg", need_paths(path_set(["pkg/lib.o"])), None);
    builder.register_alias("check", "other", need_paths(path_set(["other/lib.o"])), None);
    let session = session(&root, builder.freeze());

    let alias = session
        .graph()
        .alias("check", &"pkg".into())
        .expect("scoped alias");
    session.require_alias(alias).await.expect("build");

    assert!(root.join("pkg/lib.o").exists());
    assert!(
        !root.join("other/lib.o").exists(),
        "the sibling alias must not have been forced"
    );
}

#[tokio::test]
async fn alias_action_is_skipped_while_its_definition_is_stable() {
    let (_guard, root) = scratch();
    let graph = || {
        let mut builder = GraphBuilder::new();
        touch_rule(&mut builder, "lib.o");
        builder.register_alias(
            "install",
            ".",
            need_paths(path_set(["lib.o"])),
            Some(append_action("installed", "install.log")),
        );
        builder.freeze()
    };

    // Two separate sessions over the same root and the same definition.
    for _ in 0..2 {
        let session = session(&root, graph());
        let alias = session.graph().find_alias("install").expect("alias");
        session.require_alias(alias).await.expect("build");
    }
    assert_eq!(
        log_lines(&root, "install.log"),
        1,
        "unchanged definition must not re-run the alias action"
    );
}

#[tokio::test]
async fn alias_action_reruns_when_a_contribution_is_added() {
    let (_guard, root) = scratch();
    let graph = |extra: bool| {
        let mut builder = GraphBuilder::new();
        touch_rule(&mut builder, "lib.o");
        builder.register_alias(
            "install",
            ".",
            need_paths(path_set(["lib.o"])),
            Some(append_action("installed", "install.log")),
        );
        if extra {
            touch_rule(&mut builder, "doc.txt");
            builder.register_alias("install", ".", need_paths(path_set(["doc.txt"])), None);
        }
        builder.freeze()
    };

    let first = session(&root, graph(false));
    let alias = first.graph().find_alias("install").expect("alias");
    first.require_alias(alias).await.expect("first build");
    assert_eq!(log_lines(&root, "install.log"), 1);

    // A new contribution changes the resolved dependency set, hence the
    // digest, hence the sentinel name.
    let second = session(&root, graph(true));
    let alias = second.graph().find_alias("install").expect("alias");
    second.require_alias(alias).await.expect("second build");
    assert_eq!(
        log_lines(&root, "install.log"),
        2,
        "definition change must re-run the alias action"
    );

    // And the new definition is itself stable afterwards.
    let third = session(&root, graph(true));
    let alias = third.graph().find_alias("install").expect("alias");
    third.require_alias(alias).await.expect("third build");
    assert_eq!(log_lines(&root, "install.log"), 2);
}

#[tokio::test]
async fn alias_without_action_only_forces_contributions() {
    let (_guard, root) = scratch();
    let mut builder = GraphBuilder::new();
    touch_rule(&mut builder, "a");
    builder.register_alias("group", ".", need_paths(path_set(["a"])), None);
    let session = session(&root, builder.freeze());
    let alias = session.graph().find_alias("group").expect("alias");

    session.require_alias(alias).await.expect("build");

    assert!(root.join("a").exists());
    let sentinels: Vec<_> = std::fs::read_dir(&root)
        .expect("read root")
        .filter_map(Result::ok)
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(".kumade-alias-"))
        .collect();
    assert!(
        sentinels.is_empty(),
        "an action-less alias must not leave sentinels"
    );
}
