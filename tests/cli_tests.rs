//! CLI integration tests using assert_cmd.
//!
//! These tests invoke the actual `tcoord` binary and verify its output.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

#[allow(deprecated)]
fn tcoord_cmd() -> Command {
    Command::cargo_bin("tcoord").expect("binary should exist")
}

/// Temp dir holding an input file and its own config, so the user's config
/// never leaks into a test. The tool gets the job's arguments verbatim,
/// which lets `/bin/sh -c` stand in for a transcoder.
fn workspace() -> TempDir {
    let dir = TempDir::new().expect("tempdir");
    std::fs::write(dir.path().join("a.raw"), b"raw frames").expect("write input");
    std::fs::write(
        dir.path().join("config.json"),
        r#"{"grace_period_ms": 500, "insert_input_arg": false, "append_output_path": false}"#,
    )
    .expect("write config");
    dir
}

#[test]
fn test_version_flag() {
    tcoord_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("0.1.0"));
}

#[test]
fn test_help_flag() {
    tcoord_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Transcode Coordinator"))
        .stdout(predicate::str::contains("run"));
}

#[test]
fn test_run_help_shows_options() {
    tcoord_cmd()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--input"))
        .stdout(predicate::str::contains("--output"))
        .stdout(predicate::str::contains("--tool"))
        .stdout(predicate::str::contains("--timeout"));
}

#[test]
fn test_no_subcommand_shows_help() {
    tcoord_cmd()
        .assert()
        .success()
        .stdout(predicate::str::contains("Transcode Coordinator"));
}

#[test]
fn test_run_without_tool_arguments_fails() {
    tcoord_cmd()
        .args(["run", "--input", "a.raw", "--output", "out.mp4"])
        .assert()
        .failure();
}

#[test]
fn test_run_missing_input_fails() {
    let dir = workspace();
    tcoord_cmd()
        .arg("run")
        .arg("--config")
        .arg(dir.path().join("config.json"))
        .arg("--input")
        .arg(dir.path().join("missing.raw"))
        .arg("--output")
        .arg(dir.path().join("out.mp4"))
        .args(["--", "-c:v", "mpeg4"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("does not exist"));
}

#[test]
fn test_run_missing_config_fails() {
    let dir = workspace();
    tcoord_cmd()
        .arg("run")
        .arg("--config")
        .arg(dir.path().join("nope.json"))
        .arg("--input")
        .arg(dir.path().join("a.raw"))
        .arg("--output")
        .arg(dir.path().join("out.mp4"))
        .args(["--", "-y"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Config file not found"));
}

#[cfg(unix)]
#[test]
fn test_run_shell_tool_succeeds() {
    let dir = workspace();
    tcoord_cmd()
        .arg("run")
        .arg("--config")
        .arg(dir.path().join("config.json"))
        .arg("--input")
        .arg(dir.path().join("a.raw"))
        .arg("--output")
        .arg(dir.path().join("out.mp4"))
        .args(["--tool", "/bin/sh", "--", "-c"])
        .arg(format!(
            "echo frame=1; cp '{}' '{}'",
            dir.path().join("a.raw").display(),
            dir.path().join("out.mp4").display()
        ))
        .assert()
        .success()
        .stdout(predicate::str::contains("frame=1"))
        .stdout(predicate::str::contains("succeeded"));

    let written = std::fs::read(dir.path().join("out.mp4")).expect("output");
    assert_eq!(written, b"raw frames");
}

#[cfg(unix)]
#[test]
fn test_run_shell_tool_failure_prints_last_output() {
    let dir = workspace();
    tcoord_cmd()
        .arg("run")
        .arg("--config")
        .arg(dir.path().join("config.json"))
        .arg("--input")
        .arg(dir.path().join("a.raw"))
        .arg("--output")
        .arg(dir.path().join("out.mp4"))
        .args(["--tool", "/bin/sh", "--", "-c", "echo 'Unknown encoder' >&2; exit 4"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("exit code 4"))
        .stderr(predicate::str::contains("Unknown encoder"));
}

#[cfg(unix)]
#[test]
fn test_run_timeout_fails() {
    let dir = workspace();
    tcoord_cmd()
        .arg("run")
        .arg("--config")
        .arg(dir.path().join("config.json"))
        .arg("--input")
        .arg(dir.path().join("a.raw"))
        .arg("--output")
        .arg(dir.path().join("out.mp4"))
        .args(["--tool", "/bin/sh", "--timeout", "1", "--", "-c", "sleep 30"])
        .timeout(std::time::Duration::from_secs(20))
        .assert()
        .code(1)
        .stderr(predicate::str::contains("timed out"));
}
