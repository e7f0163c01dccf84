// Reproducibility tests.
//
// The same graph description must yield byte-identical IR, signatures and
// provenance across runs, so outputs can be cached by provenance hash.

use std::path::{Path, PathBuf};
use std::process::Command;

fn fgc_binary() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_fgc"))
}

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn run_fgc(args: &[&str]) -> String {
    let output = Command::new(fgc_binary())
        .args(args)
        .output()
        .expect("failed to run fgc");
    assert!(
        output.status.success(),
        "fgc failed with args {:?}\nstderr: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
    String::from_utf8(output.stdout).expect("non-UTF8 output")
}

/// Graphs without native addresses lower to identical IR in every process.
#[test]
fn same_graph_identical_ir() {
    let graph = project_root().join("demos/add.json");
    let graph = graph.to_str().unwrap();
    let first = run_fgc(&["--emit", "ir", "--opt", "none", graph]);
    let second = run_fgc(&["--emit", "ir", "--opt", "none", graph]);
    assert_eq!(first, second, "IR should be byte-identical across runs");
}

#[test]
fn same_graph_identical_build_info() {
    let graph = project_root().join("demos/wave.json");
    let graph = graph.to_str().unwrap();
    let first = run_fgc(&["--emit", "build-info", graph]);
    let second = run_fgc(&["--emit", "build-info", graph]);
    assert_eq!(first, second);
}

/// Different graphs hash differently while the registry fingerprint holds.
#[test]
fn build_info_tracks_source_only() {
    let add = project_root().join("demos/add.json");
    let wave = project_root().join("demos/wave.json");
    let a: serde_json::Value =
        serde_json::from_str(&run_fgc(&["--emit", "build-info", add.to_str().unwrap()])).unwrap();
    let b: serde_json::Value =
        serde_json::from_str(&run_fgc(&["--emit", "build-info", wave.to_str().unwrap()])).unwrap();
    assert_ne!(a["source_hash"], b["source_hash"]);
    assert_eq!(a["registry_fingerprint"], b["registry_fingerprint"]);
}

/// In-process: recompiling with a fresh context keeps the IR text.
#[test]
fn in_process_recompile_identical_ir() {
    use fgc::import::{import_graph, GraphDescription};
    use fgc::jit::MachineContext;
    use fgc::pipeline::{compile, CompileOptions};
    use fgc::registry::{register_builtins, NodeRegistry};
    use fgc::types::{CoreTypes, TypeRegistry};

    let text = std::fs::read_to_string(project_root().join("demos/add.json")).unwrap();
    let ir = || {
        let core = CoreTypes::from_registry(&TypeRegistry::with_builtins()).unwrap();
        let mut registry = NodeRegistry::new();
        register_builtins(&mut registry, &core).unwrap();
        let imported =
            import_graph(&GraphDescription::from_json(&text).unwrap(), &registry).unwrap();
        let options = CompileOptions {
            keep_ir: true,
            ..CompileOptions::default()
        };
        let ctx = MachineContext::host(options.opt_level, options.verify).unwrap();
        let compiled = compile(&imported.function, &ctx, &options).unwrap();
        compiled.ir().unwrap().to_string()
    };
    assert_eq!(ir(), ir());
}
