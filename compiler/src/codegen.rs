// codegen.rs — IR emission engine
//
// Lowers the live part of a `FunctionGraph` into one Cranelift function:
//   1. reverse reachability from the interface outputs (dead nodes are never
//      emitted),
//   2. dependency ordering with back-edge detection,
//   3. one `build_ir` call per live node, with values shared by all consumers,
//   4. results stored through out-pointer parameters.
// A packed trampoline `<entry>_packed(inputs, outputs)` is emitted next to the
// entry so callers without a static signature can invoke it.
//
// Preconditions: every consumed input is linked or bound as an interface input.
// Postconditions: returns an unfinalized module holding both functions.
// Failure modes: unlinked input, cycle, or node output mismatch →
//                `GraphIntegrityError`; backend rejection → `CompileError`.
//                All graph checks run before any instruction is emitted.
// Side effects: none outside the returned module.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use cranelift_codegen::ir::{AbiParam, InstBuilder, MemFlags, UserFuncName};
use cranelift_frontend::{FunctionBuilder, FunctionBuilderContext};
use cranelift_jit::JITModule;
use cranelift_module::{Linkage, Module};
use tracing::{debug, info};

use crate::error::{CompileError, GraphIntegrityError};
use crate::graph::{AnySocket, DataFlowGraph, FunctionGraph, SocketInfo};
use crate::id::NodeId;
use crate::jit::MachineContext;
use crate::node::{Dependency, IrEmitter, NativeValue, Retained};
use crate::pipeline::CompileOptions;
use crate::types::{align_to, MachineType};

// ── Public types ────────────────────────────────────────────────────────────

/// Per-compilation emission counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmitStats {
    /// `build_ir` invocations per node. Every live node appears exactly once.
    pub emissions: BTreeMap<NodeId, usize>,
    pub live_nodes: usize,
    pub live_sockets: usize,
}

impl EmitStats {
    pub fn emission_count(&self, node: NodeId) -> usize {
        self.emissions.get(&node).copied().unwrap_or(0)
    }

    pub fn total_emissions(&self) -> usize {
        self.emissions.values().sum()
    }
}

/// Byte offsets of consecutive values in a packed buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedLayout {
    pub offsets: Vec<u32>,
    pub size: u32,
}

impl PackedLayout {
    fn new(types: &[Arc<MachineType>]) -> Self {
        let mut offsets = Vec::with_capacity(types.len());
        let mut size = 0;
        for mt in types {
            size = align_to(size, mt.align());
            offsets.push(size);
            size += mt.size();
        }
        PackedLayout {
            offsets,
            size: align_to(size, 8),
        }
    }
}

/// Calling-convention metadata of a compiled function.
#[derive(Debug, Clone)]
pub struct FunctionSignature {
    pub entry_name: String,
    pub packed_name: String,
    pub inputs: Vec<SocketInfo>,
    pub outputs: Vec<SocketInfo>,
    pub input_machine_types: Vec<Arc<MachineType>>,
    pub output_machine_types: Vec<Arc<MachineType>>,
    pub input_layout: PackedLayout,
    pub output_layout: PackedLayout,
}

impl FunctionSignature {
    /// Native parameter list: input lanes by value, then one pointer per output.
    pub fn abi(&self, context: &MachineContext) -> Vec<cranelift_codegen::ir::Type> {
        let mut params: Vec<_> = self
            .input_machine_types
            .iter()
            .flat_map(|mt| mt.lanes().to_vec())
            .collect();
        params.extend(std::iter::repeat(context.pointer_type()).take(self.outputs.len()));
        params
    }
}

impl fmt::Display for FunctionSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let list = |sockets: &[SocketInfo]| {
            sockets
                .iter()
                .map(|s| format!("{}: {}", s.name, s.ty))
                .collect::<Vec<_>>()
                .join(", ")
        };
        write!(
            f,
            "fn {}({}) -> ({})",
            self.entry_name,
            list(&self.inputs),
            list(&self.outputs)
        )
    }
}

/// Output of emission: a module ready to be finalized.
pub struct EmittedFunction {
    pub(crate) module: JITModule,
    pub(crate) signature: FunctionSignature,
    pub(crate) stats: EmitStats,
    pub(crate) ir: Option<String>,
    pub(crate) retained: Vec<Retained>,
    pub(crate) dependencies: Vec<Dependency>,
}

impl EmittedFunction {
    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    pub fn stats(&self) -> &EmitStats {
        &self.stats
    }
}

// ── Public entry point ──────────────────────────────────────────────────────

/// Emit `function` into a fresh module for `context`.
pub fn emit_function(
    function: &FunctionGraph,
    context: &MachineContext,
    options: &CompileOptions,
) -> Result<EmittedFunction, CompileError> {
    let graph = function.graph();
    let stops: HashSet<AnySocket> = function.inputs().iter().copied().collect();

    // Graph checks first: nothing is emitted for a rejected graph.
    let live = function.required_sockets()?;
    let mut live_nodes: Vec<NodeId> = live
        .iter()
        .filter(|s| s.is_output() && !stops.contains(s))
        .map(|s| s.node())
        .collect();
    live_nodes.sort_unstable();
    live_nodes.dedup();
    let order = emission_order(graph, &stops, &live_nodes)?;
    info!(
        live_nodes = live_nodes.len(),
        live_sockets = live.len(),
        total_nodes = graph.node_count(),
        "emission plan ready"
    );

    let mut dependencies = Vec::new();
    for &id in &order {
        graph.node(id).declare_dependencies(&mut dependencies);
    }
    dependencies.sort();
    dependencies.dedup();

    let signature = build_signature(function, context, options);
    let ptr = context.pointer_type();
    let mut module = context.new_module();

    let mut entry_sig = module.make_signature();
    for mt in &signature.input_machine_types {
        entry_sig.params.extend(mt.lanes().iter().map(|lane| AbiParam::new(*lane)));
    }
    entry_sig
        .params
        .extend(std::iter::repeat(AbiParam::new(ptr)).take(signature.outputs.len()));
    let entry_id = module
        .declare_function(&signature.entry_name, Linkage::Export, &entry_sig)
        .map_err(|e| CompileError::Backend(e.to_string()))?;

    let mut ctx = module.make_context();
    ctx.func.signature = entry_sig;
    ctx.func.name = UserFuncName::user(0, entry_id.as_u32());
    let mut builder_ctx = FunctionBuilderContext::new();
    let mut retained = Vec::new();
    let mut stats = EmitStats {
        live_nodes: live_nodes.len(),
        live_sockets: live.len(),
        ..EmitStats::default()
    };

    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
        let block = builder.create_block();
        builder.append_block_params_for_function_params(block);
        builder.switch_to_block(block);
        builder.seal_block(block);
        let params = builder.block_params(block).to_vec();

        let mut values: HashMap<AnySocket, NativeValue> = HashMap::new();
        let mut cursor = 0;
        for (socket, mt) in function.inputs().iter().zip(&signature.input_machine_types) {
            let lanes = params[cursor..cursor + mt.lane_count()].to_vec();
            cursor += mt.lane_count();
            values.insert(*socket, NativeValue::new(lanes));
        }
        let out_ptrs = params[cursor..].to_vec();

        {
            let mut emitter = IrEmitter::new(&mut builder, context, &mut retained);
            for &id in &order {
                emit_node(graph, id, &stops, &mut emitter, &mut values, &mut stats)?;
            }
        }

        for ((socket, mt), out_ptr) in function
            .outputs()
            .iter()
            .zip(&signature.output_machine_types)
            .zip(out_ptrs)
        {
            let value = socket_value(graph, &values, *socket)?;
            for (lane, offset) in value.lanes().iter().zip(mt.offsets()) {
                builder
                    .ins()
                    .store(MemFlags::trusted(), *lane, out_ptr, *offset as i32);
            }
        }
        builder.ins().return_(&[]);
        builder.finalize();
    }

    let ir = options.keep_ir.then(|| ctx.func.display().to_string());
    module
        .define_function(entry_id, &mut ctx)
        .map_err(|e| CompileError::Backend(e.to_string()))?;
    module.clear_context(&mut ctx);

    emit_packed_trampoline(&mut module, &signature, entry_id, context)?;
    debug!(entry = %signature.entry_name, "module emitted");

    Ok(EmittedFunction {
        module,
        signature,
        stats,
        ir,
        retained,
        dependencies,
    })
}

// ── Ordering ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mark {
    InProgress,
    Done,
}

/// Order `live` so each node follows every node feeding it. Sibling order is
/// whatever the traversal produces and must not be relied on.
///
/// Depth-first over inputs with an explicit stack of `(node, next input)`
/// frames, so chain length is bounded by memory rather than thread stack.
fn emission_order(
    graph: &DataFlowGraph,
    stops: &HashSet<AnySocket>,
    live: &[NodeId],
) -> Result<Vec<NodeId>, GraphIntegrityError> {
    let mut marks = HashMap::new();
    let mut order = Vec::with_capacity(live.len());
    let mut stack: Vec<(NodeId, usize)> = Vec::new();

    for &root in live {
        if marks.contains_key(&root) {
            continue;
        }
        marks.insert(root, Mark::InProgress);
        stack.push((root, 0));

        while let Some(frame) = stack.last_mut() {
            let (node, next) = *frame;
            if next == graph.node(node).sockets().inputs().len() {
                marks.insert(node, Mark::Done);
                order.push(node);
                stack.pop();
                continue;
            }
            frame.1 += 1;

            let input = AnySocket::input(node, next);
            if stops.contains(&input) {
                continue;
            }
            let origin = graph.origin_socket(input)?;
            if stops.contains(&origin) {
                continue;
            }
            let dep = origin.node();
            match marks.get(&dep) {
                None => {
                    marks.insert(dep, Mark::InProgress);
                    stack.push((dep, 0));
                }
                Some(Mark::InProgress) => {
                    return Err(GraphIntegrityError::Cycle {
                        node,
                        node_name: graph.node(node).name().to_string(),
                        index: next,
                    });
                }
                Some(Mark::Done) => {}
            }
        }
    }
    Ok(order)
}

// ── Emission ────────────────────────────────────────────────────────────────

fn emit_node(
    graph: &DataFlowGraph,
    id: NodeId,
    stops: &HashSet<AnySocket>,
    emitter: &mut IrEmitter<'_, '_>,
    values: &mut HashMap<AnySocket, NativeValue>,
    stats: &mut EmitStats,
) -> Result<(), GraphIntegrityError> {
    let node = graph.node(id);
    let inputs = graph
        .inputs_of(id)
        .map(|socket| socket_value(graph, values, socket))
        .collect::<Result<Vec<_>, _>>()?;

    let declared = node.sockets().outputs();
    let mut outputs = Vec::with_capacity(declared.len());
    node.build_ir(emitter, &inputs, &mut outputs);
    *stats.emissions.entry(id).or_insert(0) += 1;
    debug!(node = %id, name = node.name(), outputs = outputs.len(), "emitted node");

    if outputs.len() != declared.len() {
        return Err(GraphIntegrityError::OutputCountMismatch {
            node: id,
            node_name: node.name().to_string(),
            expected: declared.len(),
            actual: outputs.len(),
        });
    }
    for (index, (value, info)) in outputs.iter().zip(declared).enumerate() {
        let expected = emitter.machine_type(&info.ty).lane_count();
        if value.lanes().len() != expected {
            return Err(GraphIntegrityError::OutputShapeMismatch {
                node: id,
                node_name: node.name().to_string(),
                index,
                expected,
                actual: value.lanes().len(),
            });
        }
    }

    for (index, value) in outputs.into_iter().enumerate() {
        let socket = AnySocket::output(id, index);
        if !stops.contains(&socket) {
            values.insert(socket, value);
        }
    }
    Ok(())
}

/// Value flowing through `socket`: bound directly, or from the origin of an
/// input. Emission order guarantees origins are computed first.
fn socket_value(
    graph: &DataFlowGraph,
    values: &HashMap<AnySocket, NativeValue>,
    socket: AnySocket,
) -> Result<NativeValue, GraphIntegrityError> {
    if let Some(value) = values.get(&socket) {
        return Ok(value.clone());
    }
    let origin = graph.origin_socket(socket)?;
    let value = values
        .get(&origin)
        .unwrap_or_else(|| panic!("socket {} used before its node was emitted", origin));
    Ok(value.clone())
}

fn build_signature(
    function: &FunctionGraph,
    context: &MachineContext,
    options: &CompileOptions,
) -> FunctionSignature {
    let graph = function.graph();
    let infos = |sockets: &[AnySocket]| -> Vec<SocketInfo> {
        sockets.iter().map(|s| graph.socket_info(*s).clone()).collect()
    };
    let inputs = infos(function.inputs());
    let outputs = infos(function.outputs());
    let input_machine_types: Vec<_> = inputs.iter().map(|s| s.ty.machine_type(context)).collect();
    let output_machine_types: Vec<_> = outputs.iter().map(|s| s.ty.machine_type(context)).collect();
    FunctionSignature {
        entry_name: options.entry_name.clone(),
        packed_name: format!("{}_packed", options.entry_name),
        input_layout: PackedLayout::new(&input_machine_types),
        output_layout: PackedLayout::new(&output_machine_types),
        inputs,
        outputs,
        input_machine_types,
        output_machine_types,
    }
}

/// `packed(inputs: *const u8, outputs: *mut u8)`: loads every input from the
/// packed input buffer, points each out-parameter into the output buffer, and
/// calls the entry function.
fn emit_packed_trampoline(
    module: &mut JITModule,
    signature: &FunctionSignature,
    entry_id: cranelift_module::FuncId,
    context: &MachineContext,
) -> Result<(), CompileError> {
    let ptr = context.pointer_type();
    let mut sig = module.make_signature();
    sig.params.push(AbiParam::new(ptr));
    sig.params.push(AbiParam::new(ptr));
    let packed_id = module
        .declare_function(&signature.packed_name, Linkage::Export, &sig)
        .map_err(|e| CompileError::Backend(e.to_string()))?;

    let mut ctx = module.make_context();
    ctx.func.signature = sig;
    ctx.func.name = UserFuncName::user(0, packed_id.as_u32());
    let mut builder_ctx = FunctionBuilderContext::new();
    {
        let mut builder = FunctionBuilder::new(&mut ctx.func, &mut builder_ctx);
        let block = builder.create_block();
        builder.append_block_params_for_function_params(block);
        builder.switch_to_block(block);
        builder.seal_block(block);
        let (in_base, out_base) = (builder.block_params(block)[0], builder.block_params(block)[1]);
        let callee = module.declare_func_in_func(entry_id, builder.func);

        let mut args = Vec::new();
        for (mt, base) in signature
            .input_machine_types
            .iter()
            .zip(&signature.input_layout.offsets)
        {
            for (lane, offset) in mt.lanes().iter().zip(mt.offsets()) {
                let flags = MemFlags::trusted();
                args.push(builder.ins().load(*lane, flags, in_base, (base + offset) as i32));
            }
        }
        for offset in &signature.output_layout.offsets {
            args.push(builder.ins().iadd_imm(out_base, *offset as i64));
        }
        builder.ins().call(callee, &args);
        builder.ins().return_(&[]);
        builder.finalize();
    }
    module
        .define_function(packed_id, &mut ctx)
        .map_err(|e| CompileError::Backend(e.to_string()))?;
    module.clear_context(&mut ctx);
    Ok(())
}

// ── Tests ───────────────────────────────────────────────────────────────────
