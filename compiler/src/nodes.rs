// nodes.rs — Built-in node kinds
//
// Constants, float math, vector assembly, reroutes, the function interface
// nodes, and a handful of native functions lifted through
// `FunctionPointerNode` (trigonometry, power, vector length, and the object
// location query, which takes its scene handle as the context argument).

use std::collections::BTreeMap;
use std::sync::Arc;

use cranelift_codegen::ir::{types as clif, InstBuilder};

use crate::graph::SocketInfo;
use crate::node::{Dependency, FunctionPointerNode, IrEmitter, NativeValue, Node, NodeSockets};
use crate::types::{CoreTypes, Type};

// ── Constants ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ConstantValue {
    Float(f32),
    Double(f64),
    Int32(i32),
    Int64(i64),
    Bool(bool),
    Vector([f32; 3]),
}

/// Produces a fixed value. Also used to feed unlinked inputs on import.
pub struct ConstantNode {
    sockets: NodeSockets,
    value: ConstantValue,
}

impl ConstantNode {
    pub fn new(types: &CoreTypes, value: ConstantValue) -> Self {
        let ty = match value {
            ConstantValue::Float(_) => &types.float,
            ConstantValue::Double(_) => &types.double,
            ConstantValue::Int32(_) => &types.int32,
            ConstantValue::Int64(_) => &types.int64,
            ConstantValue::Bool(_) => &types.boolean,
            ConstantValue::Vector(_) => &types.vector,
        };
        let mut sockets = NodeSockets::new();
        sockets.add_output("value", ty);
        ConstantNode { sockets, value }
    }

    pub fn float(types: &CoreTypes, value: f32) -> Self {
        Self::new(types, ConstantValue::Float(value))
    }

    pub fn vector(types: &CoreTypes, value: [f32; 3]) -> Self {
        Self::new(types, ConstantValue::Vector(value))
    }

    pub fn value(&self) -> ConstantValue {
        self.value
    }
}

impl Node for ConstantNode {
    fn name(&self) -> &str {
        "Constant"
    }

    fn sockets(&self) -> &NodeSockets {
        &self.sockets
    }

    fn build_ir(
        &self,
        emitter: &mut IrEmitter<'_, '_>,
        _inputs: &[NativeValue],
        outputs: &mut Vec<NativeValue>,
    ) {
        let value = match self.value {
            ConstantValue::Float(v) => NativeValue::scalar(emitter.ins().f32const(v)),
            ConstantValue::Double(v) => NativeValue::scalar(emitter.ins().f64const(v)),
            ConstantValue::Int32(v) => NativeValue::scalar(emitter.ins().iconst(clif::I32, v as i64)),
            ConstantValue::Int64(v) => NativeValue::scalar(emitter.ins().iconst(clif::I64, v)),
            ConstantValue::Bool(v) => NativeValue::scalar(emitter.ins().iconst(clif::I8, v as i64)),
            ConstantValue::Vector(components) => NativeValue::new(
                components
                    .iter()
                    .map(|c| emitter.ins().f32const(*c))
                    .collect(),
            ),
        };
        outputs.push(value);
    }
}

/// Zero of any type, lane by lane.
pub(crate) fn zero_value(emitter: &mut IrEmitter<'_, '_>, ty: &Type) -> NativeValue {
    let mt = emitter.machine_type(ty);
    let lanes = mt
        .lanes()
        .iter()
        .map(|lane| match *lane {
            clif::F32 => emitter.ins().f32const(0.0),
            clif::F64 => emitter.ins().f64const(0.0),
            int => emitter.ins().iconst(int, 0),
        })
        .collect();
    NativeValue::new(lanes)
}

// ── Float math ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathOp {
    Add,
    Subtract,
    Multiply,
    Divide,
    Minimum,
    Maximum,
}

impl MathOp {
    /// Parse an external operation identifier such as `"ADD"`.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "ADD" => Some(MathOp::Add),
            "SUBTRACT" => Some(MathOp::Subtract),
            "MULTIPLY" => Some(MathOp::Multiply),
            "DIVIDE" => Some(MathOp::Divide),
            "MINIMUM" => Some(MathOp::Minimum),
            "MAXIMUM" => Some(MathOp::Maximum),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            MathOp::Add => "Add",
            MathOp::Subtract => "Subtract",
            MathOp::Multiply => "Multiply",
            MathOp::Divide => "Divide",
            MathOp::Minimum => "Minimum",
            MathOp::Maximum => "Maximum",
        }
    }
}

/// `result = a <op> b` on floats.
pub struct MathNode {
    sockets: NodeSockets,
    op: MathOp,
}

impl MathNode {
    pub fn new(types: &CoreTypes, op: MathOp) -> Self {
        let mut sockets = NodeSockets::new();
        sockets
            .add_input("a", &types.float)
            .add_input("b", &types.float)
            .add_output("result", &types.float);
        MathNode { sockets, op }
    }

    pub fn op(&self) -> MathOp {
        self.op
    }
}

impl Node for MathNode {
    fn name(&self) -> &str {
        self.op.label()
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
        let a = inputs[0].as_scalar();
        let b = inputs[1].as_scalar();
        let ins = emitter.ins();
        let result = match self.op {
            MathOp::Add => ins.fadd(a, b),
            MathOp::Subtract => ins.fsub(a, b),
            MathOp::Multiply => ins.fmul(a, b),
            MathOp::Divide => ins.fdiv(a, b),
            MathOp::Minimum => ins.fmin(a, b),
            MathOp::Maximum => ins.fmax(a, b),
        };
        outputs.push(NativeValue::scalar(result));
    }
}

// ── Vectors ─────────────────────────────────────────────────────────────────

/// Three floats into one vector.
pub struct CombineVectorNode {
    sockets: NodeSockets,
}

impl CombineVectorNode {
    pub fn new(types: &CoreTypes) -> Self {
        let mut sockets = NodeSockets::new();
        sockets
            .add_input("x", &types.float)
            .add_input("y", &types.float)
            .add_input("z", &types.float)
            .add_output("vector", &types.vector);
        CombineVectorNode { sockets }
    }
}

impl Node for CombineVectorNode {
    fn name(&self) -> &str {
        "Combine Vector"
    }

    fn sockets(&self) -> &NodeSockets {
        &self.sockets
    }

    fn build_ir(
        &self,
        _emitter: &mut IrEmitter<'_, '_>,
        inputs: &[NativeValue],
        outputs: &mut Vec<NativeValue>,
    ) {
        let lanes = inputs.iter().map(NativeValue::as_scalar).collect();
        outputs.push(NativeValue::new(lanes));
    }
}

/// One vector into three floats.
pub struct SeparateVectorNode {
    sockets: NodeSockets,
}

impl SeparateVectorNode {
    pub fn new(types: &CoreTypes) -> Self {
        let mut sockets = NodeSockets::new();
        sockets
            .add_input("vector", &types.vector)
            .add_output("x", &types.float)
            .add_output("y", &types.float)
            .add_output("z", &types.float);
        SeparateVectorNode { sockets }
    }
}

impl Node for SeparateVectorNode {
    fn name(&self) -> &str {
        "Separate Vector"
    }

    fn sockets(&self) -> &NodeSockets {
        &self.sockets
    }

    fn build_ir(
        &self,
        _emitter: &mut IrEmitter<'_, '_>,
        inputs: &[NativeValue],
        outputs: &mut Vec<NativeValue>,
    ) {
        for lane in inputs[0].lanes() {
            outputs.push(NativeValue::scalar(*lane));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorOp {
    /// `a + b`, component-wise.
    Add,
    /// `vector * factor`.
    Scale,
}

pub struct VectorMathNode {
    sockets: NodeSockets,
    op: VectorOp,
}

impl VectorMathNode {
    pub fn new(types: &CoreTypes, op: VectorOp) -> Self {
        let mut sockets = NodeSockets::new();
        match op {
            VectorOp::Add => sockets
                .add_input("a", &types.vector)
                .add_input("b", &types.vector),
            VectorOp::Scale => sockets
                .add_input("vector", &types.vector)
                .add_input("factor", &types.float),
        };
        sockets.add_output("result", &types.vector);
        VectorMathNode { sockets, op }
    }
}

impl Node for VectorMathNode {
    fn name(&self) -> &str {
        match self.op {
            VectorOp::Add => "Vector Add",
            VectorOp::Scale => "Vector Scale",
        }
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
        let lanes = match self.op {
            VectorOp::Add => inputs[0]
                .lanes()
                .iter()
                .zip(inputs[1].lanes())
                .map(|(a, b)| emitter.ins().fadd(*a, *b))
                .collect(),
            VectorOp::Scale => {
                let factor = inputs[1].as_scalar();
                inputs[0]
                    .lanes()
                    .iter()
                    .map(|a| emitter.ins().fmul(*a, factor))
                    .collect()
            }
        };
        outputs.push(NativeValue::new(lanes));
    }
}

// ── Routing ─────────────────────────────────────────────────────────────────

/// Forwards its input unchanged. Emits no instructions.
pub struct PassThroughNode {
    sockets: NodeSockets,
}

impl PassThroughNode {
    pub fn new(ty: &Arc<Type>) -> Self {
        let mut sockets = NodeSockets::new();
        sockets.add_input("input", ty).add_output("output", ty);
        PassThroughNode { sockets }
    }
}

impl Node for PassThroughNode {
    fn name(&self) -> &str {
        "Reroute"
    }

    fn sockets(&self) -> &NodeSockets {
        &self.sockets
    }

    fn build_ir(
        &self,
        _emitter: &mut IrEmitter<'_, '_>,
        inputs: &[NativeValue],
        outputs: &mut Vec<NativeValue>,
    ) {
        outputs.push(inputs[0].clone());
    }
}

/// Source of a function's parameters. Its outputs are normally bound as
/// interface inputs; an unbound output that is still consumed yields zero.
pub struct FunctionInputNode {
    sockets: NodeSockets,
}

impl FunctionInputNode {
    pub fn new(outputs: Vec<SocketInfo>) -> Self {
        let mut sockets = NodeSockets::new();
        for info in outputs {
            sockets.add_output(info.name, &info.ty);
        }
        FunctionInputNode { sockets }
    }
}

impl Node for FunctionInputNode {
    fn name(&self) -> &str {
        "Function Input"
    }

    fn sockets(&self) -> &NodeSockets {
        &self.sockets
    }

    fn build_ir(
        &self,
        emitter: &mut IrEmitter<'_, '_>,
        _inputs: &[NativeValue],
        outputs: &mut Vec<NativeValue>,
    ) {
        for info in self.sockets.outputs() {
            outputs.push(zero_value(emitter, &info.ty));
        }
    }
}

/// Sink whose inputs are a function's results.
pub struct FunctionOutputNode {
    sockets: NodeSockets,
}

impl FunctionOutputNode {
    pub fn new(inputs: Vec<SocketInfo>) -> Self {
        let mut sockets = NodeSockets::new();
        for info in inputs {
            sockets.add_input(info.name, &info.ty);
        }
        FunctionOutputNode { sockets }
    }
}

impl Node for FunctionOutputNode {
    fn name(&self) -> &str {
        "Function Output"
    }

    fn sockets(&self) -> &NodeSockets {
        &self.sockets
    }

    fn build_ir(
        &self,
        _emitter: &mut IrEmitter<'_, '_>,
        _inputs: &[NativeValue],
        _outputs: &mut Vec<NativeValue>,
    ) {
    }
}

// ── Native functions ────────────────────────────────────────────────────────

extern "C" fn native_sin(x: f32, out: *mut f32) {
    unsafe { out.write(x.sin()) }
}

extern "C" fn native_cos(x: f32, out: *mut f32) {
    unsafe { out.write(x.cos()) }
}

extern "C" fn native_pow(base: f32, exponent: f32, out: *mut f32) {
    unsafe { out.write(base.powf(exponent)) }
}

extern "C" fn native_vector_length(x: f32, y: f32, z: f32, out: *mut f32) {
    unsafe { out.write((x * x + y * y + z * z).sqrt()) }
}

extern "C" fn native_object_location(query: *const ObjectQuery, out: *mut f32) {
    let query = unsafe { &*query };
    let [x, y, z] = query
        .scene
        .object_location(&query.object)
        .unwrap_or([0.0; 3]);
    unsafe {
        out.write(x);
        out.add(1).write(y);
        out.add(2).write(z);
    }
}

fn unary_float(types: &CoreTypes) -> NodeSockets {
    let mut sockets = NodeSockets::new();
    sockets
        .add_input("value", &types.float)
        .add_output("result", &types.float);
    sockets
}

pub fn sine_node(types: &CoreTypes) -> FunctionPointerNode {
    // SAFETY: native_sin takes (f32, *mut f32), matching one float in, one out.
    unsafe { FunctionPointerNode::new("Sine", unary_float(types), native_sin as *const u8) }
}

pub fn cosine_node(types: &CoreTypes) -> FunctionPointerNode {
    // SAFETY: native_cos takes (f32, *mut f32), matching one float in, one out.
    unsafe { FunctionPointerNode::new("Cosine", unary_float(types), native_cos as *const u8) }
}

pub fn power_node(types: &CoreTypes) -> FunctionPointerNode {
    let mut sockets = NodeSockets::new();
    sockets
        .add_input("base", &types.float)
        .add_input("exponent", &types.float)
        .add_output("result", &types.float);
    // SAFETY: native_pow takes (f32, f32, *mut f32).
    unsafe { FunctionPointerNode::new("Power", sockets, native_pow as *const u8) }
}

pub fn vector_length_node(types: &CoreTypes) -> FunctionPointerNode {
    let mut sockets = NodeSockets::new();
    sockets
        .add_input("vector", &types.vector)
        .add_output("length", &types.float);
    // SAFETY: a vector input is passed as three f32 lanes.
    unsafe { FunctionPointerNode::new("Vector Length", sockets, native_vector_length as *const u8) }
}

// ── Scene queries ───────────────────────────────────────────────────────────

/// Read access to the surrounding scene.
pub trait SceneQuery: Send + Sync {
    fn object_location(&self, object: &str) -> Option<[f32; 3]>;
}

/// Scene backed by a fixed table of object locations.
#[derive(Debug, Clone, Default)]
pub struct StaticScene {
    objects: BTreeMap<String, [f32; 3]>,
}

impl StaticScene {
    pub fn new(objects: BTreeMap<String, [f32; 3]>) -> Self {
        StaticScene { objects }
    }
}

impl SceneQuery for StaticScene {
    fn object_location(&self, object: &str) -> Option<[f32; 3]> {
        self.objects.get(object).copied()
    }
}

struct ObjectQuery {
    scene: Arc<dyn SceneQuery>,
    object: String,
}

/// Location of a named object. Unknown objects evaluate to the origin.
pub fn object_location_node(
    types: &CoreTypes,
    scene: Arc<dyn SceneQuery>,
    object: &str,
) -> FunctionPointerNode {
    let mut sockets = NodeSockets::new();
    sockets.add_output("location", &types.vector);
    let query = Arc::new(ObjectQuery {
        scene,
        object: object.to_string(),
    });
    // SAFETY: native_object_location takes (*const ObjectQuery, *mut f32), and
    // the query is attached as the context argument.
    let node = unsafe {
        FunctionPointerNode::new(
            "Object Location",
            sockets,
            native_object_location as *const u8,
        )
    };
    node.with_context(query)
        .with_dependency(Dependency::ObjectTransform(object.to_string()))
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{AnySocket, DataFlowGraph, FunctionGraph};
    use crate::jit::{MachineContext, OptLevel, Value};
    use crate::pipeline::{compile, CompileOptions};
    use crate::types::TypeRegistry;

    fn core() -> CoreTypes {
        CoreTypes::from_registry(&TypeRegistry::with_builtins()).unwrap()
    }

    fn run(
        graph: DataFlowGraph,
        inputs: Vec<AnySocket>,
        outputs: Vec<AnySocket>,
        args: &[Value],
    ) -> Vec<Value> {
        let function = FunctionGraph::new(graph, inputs, outputs);
        let context = MachineContext::host(OptLevel::None, true).unwrap();
        let compiled = compile(&function, &context, &CompileOptions::default()).unwrap();
        compiled.call(args).unwrap()
    }

    #[test]
    fn math_ops_compute_expected_results() {
        let types = core();
        let cases = [
            (MathOp::Add, 24.0),
            (MathOp::Subtract, -16.0),
            (MathOp::Multiply, 80.0),
            (MathOp::Divide, 0.2),
            (MathOp::Minimum, 4.0),
            (MathOp::Maximum, 20.0),
        ];
        for (op, expected) in cases {
            let mut graph = DataFlowGraph::new();
            let n = graph.insert_node(MathNode::new(&types, op));
            let inputs = vec![graph.input(n, 0), graph.input(n, 1)];
            let outputs = vec![graph.output(n, 0)];
            let result = run(graph, inputs, outputs, &[Value::Float(4.0), Value::Float(20.0)]);
            assert_eq!(result, vec![Value::Float(expected)], "{:?}", op);
        }
    }

    #[test]
    fn math_op_parse_accepts_external_names() {
        assert_eq!(MathOp::parse("MULTIPLY"), Some(MathOp::Multiply));
        assert_eq!(MathOp::parse("multiply"), None);
    }

    #[test]
    fn constants_of_every_kind_round_trip() {
        let types = core();
        let values = [
            (ConstantValue::Double(2.5), Value::Double(2.5)),
            (ConstantValue::Int32(-7), Value::Int32(-7)),
            (ConstantValue::Int64(1 << 40), Value::Int64(1 << 40)),
            (ConstantValue::Bool(true), Value::Bool(true)),
            (ConstantValue::Vector([1.0, 2.0, 3.0]), Value::Vector([1.0, 2.0, 3.0])),
        ];
        for (constant, expected) in values {
            let mut graph = DataFlowGraph::new();
            let c = graph.insert_node(ConstantNode::new(&types, constant));
            let out = graph.output(c, 0);
            assert_eq!(run(graph, vec![], vec![out], &[]), vec![expected]);
        }
    }

    #[test]
    fn combine_scale_and_separate_vector() {
        let types = core();
        let mut graph = DataFlowGraph::new();
        let combine = graph.insert_node(CombineVectorNode::new(&types));
        let scale = graph.insert_node(VectorMathNode::new(&types, VectorOp::Scale));
        let offset = graph.insert_node(ConstantNode::vector(&types, [0.5, 0.5, 0.5]));
        let add = graph.insert_node(VectorMathNode::new(&types, VectorOp::Add));
        let split = graph.insert_node(SeparateVectorNode::new(&types));
        graph.link(graph.output(combine, 0), graph.input(scale, 0)).unwrap();
        graph.link(graph.output(scale, 0), graph.input(add, 0)).unwrap();
        graph.link(graph.output(offset, 0), graph.input(add, 1)).unwrap();
        graph.link(graph.output(add, 0), graph.input(split, 0)).unwrap();

        let inputs = vec![
            graph.input(combine, 0),
            graph.input(combine, 1),
            graph.input(combine, 2),
            graph.input(scale, 1),
        ];
        let outputs = vec![graph.output(split, 2), graph.output(split, 0)];
        let args = [
            Value::Float(1.0),
            Value::Float(2.0),
            Value::Float(3.0),
            Value::Float(2.0),
        ];
        assert_eq!(
            run(graph, inputs, outputs, &args),
            vec![Value::Float(6.5), Value::Float(2.5)]
        );
    }

    #[test]
    fn function_pointer_nodes_call_native_code() {
        let types = core();
        let mut graph = DataFlowGraph::new();
        let pow = graph.insert_node(power_node(&types));
        let length = graph.insert_node(vector_length_node(&types));
        let inputs = vec![graph.input(pow, 0), graph.input(pow, 1), graph.input(length, 0)];
        let outputs = vec![graph.output(pow, 0), graph.output(length, 0)];
        let args = [
            Value::Float(2.0),
            Value::Float(10.0),
            Value::Vector([3.0, 4.0, 12.0]),
        ];
        assert_eq!(
            run(graph, inputs, outputs, &args),
            vec![Value::Float(1024.0), Value::Float(13.0)]
        );
    }

    #[test]
    fn sine_and_cosine_agree_with_std() {
        let types = core();
        let mut graph = DataFlowGraph::new();
        let sin = graph.insert_node(sine_node(&types));
        let cos = graph.insert_node(cosine_node(&types));
        let inputs = vec![graph.input(sin, 0), graph.input(cos, 0)];
        let outputs = vec![graph.output(sin, 0), graph.output(cos, 0)];
        let result = run(graph, inputs, outputs, &[Value::Float(0.5), Value::Float(0.5)]);
        assert_eq!(
            result,
            vec![Value::Float(0.5f32.sin()), Value::Float(0.5f32.cos())]
        );
    }

    #[test]
    fn object_location_reads_scene_through_context() {
        let types = core();
        let scene: Arc<dyn SceneQuery> = Arc::new(StaticScene::new(BTreeMap::from([(
            "Cube".to_string(),
            [1.0, -2.0, 4.0],
        )])));
        let mut graph = DataFlowGraph::new();
        let known = graph.insert_node(object_location_node(&types, Arc::clone(&scene), "Cube"));
        let missing = graph.insert_node(object_location_node(&types, scene, "Lamp"));
        let outputs = vec![graph.output(known, 0), graph.output(missing, 0)];
        let function = FunctionGraph::new(graph, vec![], outputs);
        assert_eq!(
            function.dependencies().unwrap(),
            vec![
                Dependency::ObjectTransform("Cube".into()),
                Dependency::ObjectTransform("Lamp".into()),
            ]
        );

        let context = MachineContext::host(OptLevel::Speed, true).unwrap();
        let compiled = compile(&function, &context, &CompileOptions::default()).unwrap();
        drop(function);
        assert_eq!(
            compiled.call(&[]).unwrap(),
            vec![Value::Vector([1.0, -2.0, 4.0]), Value::Vector([0.0; 3])]
        );
    }

    #[test]
    fn unbound_function_input_yields_zero() {
        let types = core();
        let mut graph = DataFlowGraph::new();
        let input = graph.insert_node(FunctionInputNode::new(vec![
            SocketInfo::new("a", &types.float),
            SocketInfo::new("b", &types.float),
        ]));
        let add = graph.insert_node(MathNode::new(&types, MathOp::Add));
        graph.link(graph.output(input, 0), graph.input(add, 0)).unwrap();
        graph.link(graph.output(input, 1), graph.input(add, 1)).unwrap();
        let inputs = vec![graph.output(input, 0)];
        let outputs = vec![graph.output(add, 0)];
        assert_eq!(
            run(graph, inputs, outputs, &[Value::Float(3.0)]),
            vec![Value::Float(3.0)]
        );
    }
}
