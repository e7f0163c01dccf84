// Snapshot tests: lock textual renderings of graphs, signatures, DOT output
// and import diagnostics.
//
// Snapshots are inline `insta` snapshots. Run `cargo insta review` after
// intentional output changes to update them.

use std::path::{Path, PathBuf};

use fgc::error::ImportError;
use fgc::graph::DataFlowGraph;
use fgc::import::{import_graph, GraphDescription, ImportedGraph};
use fgc::jit::{MachineContext, OptLevel};
use fgc::nodes::{ConstantNode, MathNode, MathOp};
use fgc::pipeline::{compile, CompileOptions};
use fgc::registry::{register_builtins, NodeRegistry};
use fgc::types::{CoreTypes, TypeRegistry};

fn project_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .unwrap()
        .to_path_buf()
}

fn core() -> CoreTypes {
    CoreTypes::from_registry(&TypeRegistry::with_builtins()).unwrap()
}

fn registry() -> NodeRegistry {
    let mut registry = NodeRegistry::new();
    register_builtins(&mut registry, &core()).unwrap();
    registry
}

fn import_demo(name: &str) -> Result<ImportedGraph, ImportError> {
    let path = project_root().join("demos").join(name);
    let text = std::fs::read_to_string(&path)
        .unwrap_or_else(|e| panic!("failed to read {}: {}", path.display(), e));
    import_graph(&GraphDescription::from_json(&text)?, &registry())
}

fn small_graph() -> DataFlowGraph {
    let types = core();
    let mut graph = DataFlowGraph::new();
    let c = graph.insert_node(ConstantNode::float(&types, 1.0));
    let add = graph.insert_node(MathNode::new(&types, MathOp::Add));
    graph.link(graph.output(c, 0), graph.input(add, 1)).unwrap();
    graph
}

#[test]
fn snapshot_small_graph_display() {
    insta::assert_snapshot!(small_graph().to_string(), @r"
    DataFlowGraph (2 nodes, 1 links)
      n0 Constant
        out0 value: Float
      n1 Add
        in0 a: Float
        in1 b: Float
        out0 result: Float
      n0.out0 -> n1.in1
    ");
}

#[test]
fn snapshot_imported_add_graph() {
    let imported = import_demo("add.json").unwrap();
    insta::assert_snapshot!(imported.function.graph().to_string(), @r"
    DataFlowGraph (3 nodes, 3 links)
      n0 Function Input
        out0 a: Float
        out1 b: Float
      n1 Add
        in0 a: Float
        in1 b: Float
        out0 result: Float
      n2 Function Output
        in0 result: Float
      n0.out0 -> n1.in0
      n0.out1 -> n1.in1
      n1.out0 -> n2.in0
    ");
}

#[test]
fn snapshot_signatures() {
    let ctx = MachineContext::host(OptLevel::None, true).unwrap();
    let add = import_demo("add.json").unwrap();
    let wave = import_demo("wave.json").unwrap();
    let add = compile(&add.function, &ctx, &CompileOptions::default()).unwrap();
    let options = CompileOptions {
        entry_name: "wave".to_string(),
        ..CompileOptions::default()
    };
    let wave = compile(&wave.function, &ctx, &options).unwrap();
    let text = format!("{}\n{}", add.signature(), wave.signature());
    insta::assert_snapshot!(text, @r"
    fn fgc_main(a: Float, b: Float) -> (result: Float)
    fn wave(time: Float) -> (position: Vector, radius: Float)
    ");
}

#[test]
fn snapshot_dot() {
    insta::assert_snapshot!(fgc::dot::emit_dot(&small_graph()), @r#"
    digraph fgc {
        rankdir=LR;
        node [shape=record, fontname="Helvetica", fontsize=10];
        edge [fontname="Helvetica", fontsize=9];
        n0 [label="{{}|Constant|{<o0> value}}"];
        n1 [label="{{<i0> a|<i1> b}|Add|{<o0> result}}"];

        n0:o0 -> n1:i1;
    }
    "#);
}

#[test]
fn snapshot_import_diagnostics() {
    let json = r#"{
        "nodes": [
            {"id": "mystery", "kind": "fn_TeleportNode"},
            {"id": "sum", "kind": "fn_AddFloatsNode",
             "inputs": [{"id": "a", "kind": "fn_FloatSocket"},
                        {"id": "b", "kind": "fn_ColorSocket"}],
             "outputs": [{"id": "r", "kind": "fn_FloatSocket"}]}
        ],
        "links": [
            {"from": {"node": "nowhere", "socket": "x"}, "to": {"node": "sum", "socket": "a"}}
        ],
        "interface": {"outputs": [{"node": "sum", "socket": "r"}]}
    }"#;
    let description = GraphDescription::from_json(json).unwrap();
    let diagnostics = match import_graph(&description, &registry()) {
        Err(ImportError::Rejected { diagnostics }) => diagnostics,
        other => panic!("expected rejection, got {:?}", other.map(|g| g.warnings)),
    };
    let text: Vec<String> = diagnostics.iter().map(|d| d.to_string()).collect();
    insta::assert_snapshot!(text.join("\n"), @r"
    error[E0101]: unsupported node kind 'fn_TeleportNode' (at mystery)
      hint: the graph was exported by a newer or extended host
    error[E0102]: unsupported socket kind 'fn_ColorSocket' (at sum.b)
    error[E0103]: unknown socket nowhere.x (at nowhere.x)
    ");
}
