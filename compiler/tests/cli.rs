// Integration tests for the `fgc` command-line driver.
//
// Each test runs the built binary on a graph from `demos/` and checks the
// exit code and the text written to stdout/stderr.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

fn fgc_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_fgc"))
}

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn fgc(demo: &str, args: &[&str]) -> Output {
    Command::new(fgc_binary())
        .arg(project_root().join("demos").join(demo))
        .args(args)
        .output()
        .expect("failed to run fgc")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

fn stderr(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).into_owned()
}

#[test]
fn run_adds_arguments() {
    let output = fgc("add.json", &["--arg", "4", "--arg", "20"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "result = 24\n");
}

#[test]
fn run_accepts_negative_arguments() {
    let output = fgc("add.json", &["--arg", "-1.5", "--arg", "0.5"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "result = -1\n");
}

#[test]
fn run_vector_outputs() {
    let output = fgc("wave.json", &["--arg", "0", "--opt", "none"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let text = stdout(&output);
    assert!(text.starts_with("position = (1, 0, 0.5)\n"), "{text}");
    assert!(text.contains("radius = 1.118"), "{text}");
}

#[test]
fn run_reads_scene_objects() {
    let output = fgc("follow_object.json", &[]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "result = (1, 2, 4)\n");
    // The value node feeds nothing.
    assert!(stderr(&output).contains("W0101"), "{}", stderr(&output));
}

#[test]
fn wrong_argument_count_is_usage_error() {
    let output = fgc("add.json", &["--arg", "4"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(stderr(&output).contains("takes 2 arguments"));
}

#[test]
fn malformed_argument_is_usage_error() {
    let output = fgc("add.json", &["--arg", "four", "--arg", "20"]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn missing_file_is_usage_error() {
    let output = fgc("does_not_exist.json", &[]);
    assert_eq!(output.status.code(), Some(2));
}

#[test]
fn cycle_is_graph_error() {
    let output = fgc("cycle.json", &[]);
    assert_eq!(output.status.code(), Some(1));
    assert!(stderr(&output).contains("not a DAG"), "{}", stderr(&output));
}

#[test]
fn emit_signature() {
    let output = fgc("add.json", &["--emit", "signature", "--entry", "adder"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "fn adder(a: Float, b: Float) -> (result: Float)\n");
}

#[test]
fn emit_ir_contains_entry_function() {
    let output = fgc("add.json", &["--emit", "ir"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let ir = stdout(&output);
    assert!(ir.contains("fadd"), "{ir}");
    assert!(ir.contains("store"), "{ir}");
}

#[test]
fn emit_deps_lists_object_transforms() {
    let output = fgc("follow_object.json", &["--emit", "deps"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert_eq!(stdout(&output), "transform:Target\n");
}

#[test]
fn emit_dot_is_digraph() {
    let output = fgc("wave.json", &["--emit", "dot"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    assert!(stdout(&output).starts_with("digraph fgc {"));
}

#[test]
fn emit_build_info_is_json() {
    let output = fgc("add.json", &["--emit", "build-info"]);
    assert!(output.status.success(), "stderr: {}", stderr(&output));
    let info: serde_json::Value = serde_json::from_str(&stdout(&output)).unwrap();
    assert_eq!(info["source_hash"].as_str().unwrap().len(), 64);
    assert_eq!(info["compiler_version"], env!("CARGO_PKG_VERSION"));
}
