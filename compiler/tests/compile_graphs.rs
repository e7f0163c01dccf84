// End-to-end compilation tests through the public library API.
//
// Graphs are built in memory, compiled for the host, and invoked through the
// packed trampoline or the native entry point.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use cranelift_codegen::ir::InstBuilder;
use fgc::error::{CompileError, GraphIntegrityError};
use fgc::graph::{DataFlowGraph, FunctionGraph};
use fgc::jit::{MachineContext, OptLevel, Value};
use fgc::node::{IrEmitter, NativeValue, Node, NodeSockets};
use fgc::nodes::{ConstantNode, MathNode, MathOp, PassThroughNode};
use fgc::pipeline::{compile, CompileOptions};
use fgc::types::{get_machine_type, CoreTypes, TypeRegistry};

// ── Test helpers ────────────────────────────────────────────────────────────

fn core() -> CoreTypes {
    CoreTypes::from_registry(&TypeRegistry::with_builtins()).unwrap()
}

fn host() -> MachineContext {
    MachineContext::host(OptLevel::Speed, true).unwrap()
}

/// One math node whose two inputs are the function parameters.
fn binary(types: &CoreTypes, op: MathOp) -> FunctionGraph {
    let mut graph = DataFlowGraph::new();
    let node = graph.insert_node(MathNode::new(types, op));
    let inputs = vec![graph.input(node, 0), graph.input(node, 1)];
    let outputs = vec![graph.output(node, 0)];
    FunctionGraph::new(graph, inputs, outputs)
}

/// `((p0 + p1) + p2) + p3` as three chained add nodes.
fn add_chain(types: &CoreTypes) -> FunctionGraph {
    let mut graph = DataFlowGraph::new();
    let first = graph.insert_node(MathNode::new(types, MathOp::Add));
    let second = graph.insert_node(MathNode::new(types, MathOp::Add));
    let third = graph.insert_node(MathNode::new(types, MathOp::Add));
    graph.link(graph.output(first, 0), graph.input(second, 0)).unwrap();
    graph.link(graph.output(second, 0), graph.input(third, 0)).unwrap();
    let inputs = vec![
        graph.input(first, 0),
        graph.input(first, 1),
        graph.input(second, 1),
        graph.input(third, 1),
    ];
    let outputs = vec![graph.output(third, 0)];
    FunctionGraph::new(graph, inputs, outputs)
}

struct Counted {
    sockets: NodeSockets,
    count: Arc<AtomicUsize>,
}

impl Node for Counted {
    fn name(&self) -> &str {
        "Counted"
    }

    fn sockets(&self) -> &NodeSockets {
        &self.sockets
    }

    fn build_ir(
        &self,
        emitter: &mut IrEmitter<'_, '_>,
        inputs: &[NativeValue],
        outputs: &mut Vec<NativeValue>,
    ) {
        self.count.fetch_add(1, Ordering::SeqCst);
        let doubled = emitter
            .ins()
            .fadd(inputs[0].as_scalar(), inputs[0].as_scalar());
        outputs.push(NativeValue::scalar(doubled));
    }
}

// ── Arithmetic ──────────────────────────────────────────────────────────────

#[test]
fn add_of_4_and_20_is_24() {
    let compiled = compile(&binary(&core(), MathOp::Add), &host(), &CompileOptions::default())
        .unwrap();
    let out = compiled
        .call(&[Value::Float(4.0), Value::Float(20.0)])
        .unwrap();
    assert_eq!(out, vec![Value::Float(24.0)]);
}

#[test]
fn multiply_of_4_and_20_is_80() {
    let compiled = compile(
        &binary(&core(), MathOp::Multiply),
        &host(),
        &CompileOptions::default(),
    )
    .unwrap();
    let out = compiled
        .call(&[Value::Float(4.0), Value::Float(20.0)])
        .unwrap();
    assert_eq!(out, vec![Value::Float(80.0)]);
}

#[test]
fn chained_adds_sum_all_inputs() {
    let compiled = compile(&add_chain(&core()), &host(), &CompileOptions::default()).unwrap();
    let args: Vec<Value> = [1.0, 2.0, 3.0, 4.0].into_iter().map(Value::Float).collect();
    assert_eq!(compiled.call(&args).unwrap(), vec![Value::Float(10.0)]);
    assert_eq!(compiled.stats().live_nodes, 3);
}

#[test]
fn native_entry_uses_out_parameters() {
    let compiled = compile(&add_chain(&core()), &host(), &CompileOptions::default()).unwrap();
    let mut out = f32::NAN;
    unsafe {
        let f: unsafe extern "C" fn(f32, f32, f32, f32, *mut f32) = compiled.entry();
        f(1.0, 2.0, 3.0, 4.0, &mut out);
    }
    assert_eq!(out, 10.0);
}

#[test]
fn interface_exposes_ordered_types() {
    let function = add_chain(&core());
    let names: Vec<String> = function
        .input_types()
        .iter()
        .map(|t| t.name().to_string())
        .collect();
    assert_eq!(names, vec!["Float"; 4]);
    assert_eq!(function.output_types().len(), 1);
}

// ── Sharing and liveness ────────────────────────────────────────────────────

#[test]
fn fan_out_is_computed_once() {
    let types = core();
    let count = Arc::new(AtomicUsize::new(0));
    let mut sockets = NodeSockets::new();
    sockets
        .add_input("value", &types.float)
        .add_output("twice", &types.float);

    let mut graph = DataFlowGraph::new();
    let producer = graph.insert_node(Counted {
        sockets,
        count: Arc::clone(&count),
    });
    let left = graph.insert_node(PassThroughNode::new(&types.float));
    let right = graph.insert_node(PassThroughNode::new(&types.float));
    let join = graph.insert_node(MathNode::new(&types, MathOp::Add));
    graph.link(graph.output(producer, 0), graph.input(left, 0)).unwrap();
    graph.link(graph.output(producer, 0), graph.input(right, 0)).unwrap();
    graph.link(graph.output(left, 0), graph.input(join, 0)).unwrap();
    graph.link(graph.output(right, 0), graph.input(join, 1)).unwrap();
    let inputs = vec![graph.input(producer, 0)];
    let outputs = vec![graph.output(join, 0)];
    let function = FunctionGraph::new(graph, inputs, outputs);

    let compiled = compile(&function, &host(), &CompileOptions::default()).unwrap();
    assert_eq!(count.load(Ordering::SeqCst), 1);
    assert_eq!(compiled.stats().emission_count(producer), 1);
    assert_eq!(compiled.call(&[Value::Float(3.0)]).unwrap(), vec![Value::Float(12.0)]);
}

#[test]
fn removing_dead_nodes_keeps_behavior() {
    let types = core();
    let build = |with_dead: bool| {
        let mut graph = DataFlowGraph::new();
        let c = graph.insert_node(ConstantNode::float(&types, 1.5));
        let mul = graph.insert_node(MathNode::new(&types, MathOp::Multiply));
        graph.link(graph.output(c, 0), graph.input(mul, 1)).unwrap();
        if with_dead {
            let dead = graph.insert_node(MathNode::new(&types, MathOp::Divide));
            graph.link(graph.output(c, 0), graph.input(dead, 0)).unwrap();
            graph.link(graph.output(mul, 0), graph.input(dead, 1)).unwrap();
        }
        let inputs = vec![graph.input(mul, 0)];
        let outputs = vec![graph.output(mul, 0)];
        FunctionGraph::new(graph, inputs, outputs)
    };
    let ctx = host();
    let full = compile(&build(true), &ctx, &CompileOptions::default()).unwrap();
    let pruned = compile(&build(false), &ctx, &CompileOptions::default()).unwrap();
    for x in [-2.0f32, 0.0, 7.25] {
        assert_eq!(
            full.call(&[Value::Float(x)]).unwrap(),
            pruned.call(&[Value::Float(x)]).unwrap()
        );
    }
    assert_eq!(full.stats().live_nodes, pruned.stats().live_nodes);
}

// ── Integrity errors ────────────────────────────────────────────────────────

#[test]
fn unlinked_input_names_the_socket() {
    let types = core();
    let mut graph = DataFlowGraph::new();
    let add = graph.insert_node(MathNode::new(&types, MathOp::Add));
    let inputs = vec![graph.input(add, 0)];
    let outputs = vec![graph.output(add, 0)];
    let function = FunctionGraph::new(graph, inputs, outputs);
    let err = compile(&function, &host(), &CompileOptions::default()).unwrap_err();
    assert_eq!(
        err.to_string(),
        "input 1 ('b') of node n0 ('Add') is not linked"
    );
}

#[test]
fn cycle_fails_without_hanging() {
    let types = core();
    let mut graph = DataFlowGraph::new();
    let a = graph.insert_node(MathNode::new(&types, MathOp::Add));
    let b = graph.insert_node(MathNode::new(&types, MathOp::Multiply));
    graph.link(graph.output(a, 0), graph.input(b, 0)).unwrap();
    graph.link(graph.output(b, 0), graph.input(a, 0)).unwrap();
    let inputs = vec![graph.input(a, 1), graph.input(b, 1)];
    let outputs = vec![graph.output(b, 0)];
    let function = FunctionGraph::new(graph, inputs, outputs);
    let err = compile(&function, &host(), &CompileOptions::default()).unwrap_err();
    assert!(
        matches!(err, CompileError::Integrity(GraphIntegrityError::Cycle { .. })),
        "{err}"
    );
}

#[test]
fn link_type_mismatch_is_rejected() {
    let types = core();
    let mut graph = DataFlowGraph::new();
    let v = graph.insert_node(ConstantNode::vector(&types, [1.0, 2.0, 3.0]));
    let add = graph.insert_node(MathNode::new(&types, MathOp::Add));
    let err = graph
        .link(graph.output(v, 0), graph.input(add, 0))
        .unwrap_err();
    assert!(matches!(err, GraphIntegrityError::TypeMismatch { .. }));
}

// ── Type cache and threads ──────────────────────────────────────────────────

#[test]
fn machine_types_are_identity_stable_per_context() {
    let types = core();
    let a = host();
    let b = host();
    let first = get_machine_type(&types.vector, &a);
    let again = get_machine_type(&types.vector, &a);
    let other = get_machine_type(&types.vector, &b);
    assert!(Arc::ptr_eq(&first, &again));
    assert!(!Arc::ptr_eq(&first, &other));
}

#[test]
fn compiled_function_is_callable_from_many_threads() {
    let compiled = Arc::new(
        compile(&binary(&core(), MathOp::Multiply), &host(), &CompileOptions::default()).unwrap(),
    );
    let handles: Vec<_> = (0..8)
        .map(|i| {
            let compiled = Arc::clone(&compiled);
            thread::spawn(move || {
                let x = i as f32;
                compiled
                    .call(&[Value::Float(x), Value::Float(2.0)])
                    .unwrap()
            })
        })
        .collect();
    for (i, handle) in handles.into_iter().enumerate() {
        assert_eq!(handle.join().unwrap(), vec![Value::Float(i as f32 * 2.0)]);
    }
}

#[test]
fn graphs_compile_concurrently_against_one_context() {
    let types = core();
    let ctx = Arc::new(host());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            let function = add_chain(&types);
            thread::spawn(move || {
                let compiled = compile(&function, &ctx, &CompileOptions::default()).unwrap();
                let args: Vec<Value> = [1.0, 1.0, 1.0, 1.0].into_iter().map(Value::Float).collect();
                compiled.call(&args).unwrap()
            })
        })
        .collect();
    for handle in handles {
        assert_eq!(handle.join().unwrap(), vec![Value::Float(4.0)]);
    }
    assert_eq!(types.float.cached_contexts(), 1);
}
