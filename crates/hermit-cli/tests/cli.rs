//! Tests for the `hermit` binary against a temporary workspace.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::Write;
use std::process::{Command, Output, Stdio};

use tempfile::TempDir;

fn hermit(root: &TempDir, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_hermit"))
        .arg("--root")
        .arg(root.path())
        .args(args)
        .env_remove("HERMIT_CONFIG")
        .output()
        .expect("run hermit")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn test_run_streams_output_and_exit_code() {
    let root = tempfile::tempdir().unwrap();
    let output = hermit(&root, &["run", "-c", "echo out; echo err >&2; exit 5"]);
    assert_eq!(output.status.code(), Some(5));
    assert_eq!(stdout(&output), "out\n");
    assert!(stderr(&output).contains("err\n"));
}

#[test]
fn test_run_uses_workspace_as_cwd() {
    let root = tempfile::tempdir().unwrap();
    std::fs::create_dir(root.path().join("sub")).unwrap();
    std::fs::write(root.path().join("sub/marker"), "x").unwrap();

    let output = hermit(&root, &["run", "-c", "ls", "--cwd", "sub"]);
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(stdout(&output), "marker\n");
}

#[test]
fn test_run_timeout() {
    let root = tempfile::tempdir().unwrap();
    let output = hermit(
        &root,
        &["run", "-c", "echo started; sleep 30", "--timeout-ms", "300"],
    );
    assert_eq!(output.status.code(), Some(124));
    assert_eq!(stdout(&output), "started\n");
    assert!(stderr(&output).contains("timed out"));
}

#[test]
fn test_fs_write_read_ls_rm() {
    let root = tempfile::tempdir().unwrap();

    let output = hermit(
        &root,
        &["fs", "write", "docs/readme.md", "--content", "# hello\n"],
    );
    assert!(output.status.success(), "{}", stderr(&output));
    assert_eq!(
        std::fs::read_to_string(root.path().join("docs/readme.md")).unwrap(),
        "# hello\n"
    );

    let output = hermit(&root, &["fs", "read", "/workspace/docs/readme.md"]);
    assert_eq!(stdout(&output), "# hello\n");

    let output = hermit(&root, &["fs", "ls"]);
    assert_eq!(stdout(&output), "docs/\n");

    let output = hermit(&root, &["fs", "ls", "docs"]);
    assert_eq!(stdout(&output), "readme.md\t8\n");

    let output = hermit(&root, &["fs", "rm", "docs"]);
    assert!(output.status.success());
    assert!(!root.path().join("docs").exists());
}

#[test]
fn test_fs_write_from_stdin() {
    let root = tempfile::tempdir().unwrap();
    let mut child = Command::new(env!("CARGO_BIN_EXE_hermit"))
        .arg("--root")
        .arg(root.path())
        .args(["fs", "write", "piped.txt"])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    child.stdin.take().unwrap().write_all(b"from stdin").unwrap();
    assert!(child.wait().unwrap().success());
    assert_eq!(
        std::fs::read_to_string(root.path().join("piped.txt")).unwrap(),
        "from stdin"
    );
}

#[test]
fn test_fs_refuses_escaping_paths() {
    let root = tempfile::tempdir().unwrap();
    let output = hermit(&root, &["fs", "write", "../escape.txt", "--content", "x"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("escapes the workspace root"));
    assert!(!root.path().parent().unwrap().join("escape.txt").exists());
}

#[test]
fn test_agent_requires_decider() {
    let root = tempfile::tempdir().unwrap();
    let output = Command::new(env!("CARGO_BIN_EXE_hermit"))
        .arg("--root")
        .arg(root.path())
        .args(["agent", "--prompt", "hi"])
        .env_remove("HERMIT_DECIDER_URL")
        .env_remove("HERMIT_CONFIG")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("no decision endpoint"));
}
