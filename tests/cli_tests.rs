//! End-to-end tests driving the `kumade` binary against real rulefiles.

use assert_cmd::Command;
use camino::Utf8PathBuf;
use predicates::prelude::*;

fn scratch() -> (tempfile::TempDir, Utf8PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).expect("utf8 tempdir");
    (dir, root)
}

fn kumade(root: &Utf8PathBuf) -> Command {
    let mut cmd = Command::cargo_bin("kumade").expect("binary");
    cmd.current_dir(root);
    cmd
}

fn write_rulefile(root: &Utf8PathBuf, text: &str) {
    std::fs::write(root.join("Kumadefile"), text).expect("write rulefile");
}

#[test]
fn builds_a_declared_target() {
    let (_guard, root) = scratch();
    std::fs::write(root.join("greeting.in"), "hello\n").expect("seed input");
    write_rulefile(
        &root,
        "rules:\n\
         \x20 - targets: [greeting.out]\n\
         \x20   deps: [greeting.in]\n\
         \x20   copy: { src: greeting.in, dest: greeting.out }\n",
    );

    kumade(&root)
        .args(["build", "greeting.out"])
        .assert()
        .success();

    let copied = std::fs::read_to_string(root.join("greeting.out")).expect("output");
    assert_eq!(copied, "hello\n");
}

#[test]
fn second_invocation_is_a_no_op() {
    let (_guard, root) = scratch();
    std::fs::write(root.join("src.txt"), "v1\n").expect("seed input");
    write_rulefile(
        &root,
        "rules:\n\
         \x20 - targets: [out.txt]\n\
         \x20   deps: [src.txt]\n\
         \x20   command: \"sh -c 'echo ran >> runs.log && cp src.txt out.txt'\"\n",
    );

    kumade(&root).args(["build", "out.txt"]).assert().success();
    kumade(&root).args(["build", "out.txt"]).assert().success();

    let log = std::fs::read_to_string(root.join("runs.log")).expect("log");
    assert_eq!(log.lines().count(), 1, "clean rebuild must run nothing");
}

#[test]
fn stdout_capture_produces_the_declared_file() {
    let (_guard, root) = scratch();
    write_rulefile(
        &root,
        "rules:\n\
         \x20 - command: echo generated\n\
         \x20   stdout_to: banner.txt\n",
    );

    kumade(&root).arg("build").assert().success();

    let banner = std::fs::read_to_string(root.join("banner.txt")).expect("captured");
    assert_eq!(banner.trim(), "generated");
}

#[test]
fn default_invocation_builds_registered_aliases() {
    let (_guard, root) = scratch();
    write_rulefile(
        &root,
        "rules:\n\
         \x20 - targets: [a.out]\n\
         \x20   command: touch a.out\n\
         \x20 - targets: [b.out]\n\
         \x20   command: touch b.out\n\
         aliases:\n\
         \x20 - name: all\n\
         \x20   deps: [a.out, b.out]\n",
    );

    kumade(&root).assert().success();

    assert!(root.join("a.out").exists());
    assert!(root.join("b.out").exists());
}

#[test]
fn failing_action_yields_a_failure_exit() {
    let (_guard, root) = scratch();
    write_rulefile(
        &root,
        "rules:\n\
         \x20 - targets: [never.out]\n\
         \x20   command: \"sh -c 'echo boom >&2; exit 3'\"\n",
    );

    kumade(&root)
        .args(["build", "never.out"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("never.out"));
}

#[test]
fn undeclared_output_is_a_mismatch() {
    let (_guard, root) = scratch();
    write_rulefile(
        &root,
        "rules:\n\
         \x20 - targets: [right.out]\n\
         \x20   command: \"sh -c 'touch wrong.out'\"\n",
    );

    kumade(&root)
        .args(["build", "right.out"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("right.out"));
}

#[test]
fn graph_subcommand_lists_targets_and_aliases() {
    let (_guard, root) = scratch();
    write_rulefile(
        &root,
        "rules:\n\
         \x20 - targets: [main.o]\n\
         \x20   command: touch main.o\n\
         aliases:\n\
         \x20 - name: all\n\
         \x20   deps: [main.o]\n",
    );

    kumade(&root)
        .arg("graph")
        .assert()
        .success()
        .stdout(predicate::str::contains("main.o").and(predicate::str::contains("all")));
    assert!(!root.join("main.o").exists(), "graph must not build");
}

#[test]
fn missing_rulefile_is_a_clean_error() {
    let (_guard, root) = scratch();
    kumade(&root)
        .arg("build")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Kumadefile"));
}

#[test]
fn clean_build_succeeds_when_the_action_emits_its_own_depfile() {
    let (_guard, root) = scratch();
    std::fs::write(root.join("main.c"), "int main() {}\n").expect("seed source");
    std::fs::write(root.join("main.h"), "v1\n").expect("seed header");
    // No main.d yet: the compile step writes it, cc -MD style.
    write_rulefile(
        &root,
        "rules:\n\
         \x20 - targets: [main.out]\n\
         \x20   deps: [main.c]\n\
         \x20   depfile: main.d\n\
         \x20   command: \"sh -c 'echo main.out: main.c main.h > main.d && echo ran >> compile.log && touch main.out'\"\n",
    );

    kumade(&root).args(["build", "main.out"]).assert().success();
    assert!(root.join("main.d").exists(), "action must have emitted the depfile");

    // The depfile now feeds discovery: a header edit triggers a rebuild.
    std::thread::sleep(std::time::Duration::from_millis(60));
    std::fs::write(root.join("main.h"), "v2\n").expect("modify header");
    kumade(&root).args(["build", "main.out"]).assert().success();

    // And with nothing changed, the third invocation runs nothing.
    kumade(&root).args(["build", "main.out"]).assert().success();

    let log = std::fs::read_to_string(root.join("compile.log")).expect("log");
    assert_eq!(log.lines().count(), 2);
}

#[test]
fn depfile_discovery_rebuilds_on_header_changes() {
    let (_guard, root) = scratch();
    std::fs::write(root.join("main.c"), "int main() {}\n").expect("seed source");
    std::fs::write(root.join("main.h"), "v1\n").expect("seed header");
    std::fs::write(root.join("main.d"), "main.out: main.c main.h\n").expect("seed depfile");
    write_rulefile(
        &root,
        "rules:\n\
         \x20 - targets: [main.out]\n\
         \x20   deps: [main.c]\n\
         \x20   depfile: main.d\n\
         \x20   command: \"sh -c 'echo ran >> compile.log && touch main.out'\"\n",
    );

    kumade(&root).args(["build", "main.out"]).assert().success();
    // The header is only named by the depfile, never in `deps`.
    std::thread::sleep(std::time::Duration::from_millis(60));
    std::fs::write(root.join("main.h"), "v2\n").expect("modify header");
    kumade(&root).args(["build", "main.out"]).assert().success();

    let log = std::fs::read_to_string(root.join("compile.log")).expect("log");
    assert_eq!(
        log.lines().count(),
        2,
        "header change must trigger a rebuild"
    );
}
