// node.rs — Node abstraction and the emitter facade handed to nodes
//
// A node declares ordered input and output sockets in its constructor and
// implements `build_ir`: given one native value per input, it appends one
// native value per output. New node kinds need nothing else; there is no
// central dispatch table.
//
// `FunctionPointerNode` lifts a native `extern "C"` function into the graph:
// arguments are an optional context pointer, the input lanes by value, then
// one out-pointer per output. Results are loaded back from the out-pointers.
//
// Preconditions: sockets are declared before the node is inserted in a graph.
// Postconditions: `build_ir` pushes exactly `outputs().len()` values.
// Failure modes: none here; the emission engine checks output counts.
// Side effects: `IrEmitter::retain` moves ownership of native contexts into
//               the compiled function.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use cranelift_codegen::ir::{
    self, AbiParam, InstBuilder, MemFlags, Signature, StackSlotData, StackSlotKind,
};
use cranelift_frontend::{FuncInstBuilder, FunctionBuilder};

use crate::graph::SocketInfo;
use crate::jit::MachineContext;
use crate::types::{MachineType, Type};

// ── Sockets ─────────────────────────────────────────────────────────────────

/// Ordered socket declarations. Insertion order is the socket index and the
/// calling-convention order.
#[derive(Debug, Clone, Default)]
pub struct NodeSockets {
    inputs: Vec<SocketInfo>,
    outputs: Vec<SocketInfo>,
}

impl NodeSockets {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_input(&mut self, name: impl Into<String>, ty: &Arc<Type>) -> &mut Self {
        self.inputs.push(SocketInfo::new(name, ty));
        self
    }

    pub fn add_output(&mut self, name: impl Into<String>, ty: &Arc<Type>) -> &mut Self {
        self.outputs.push(SocketInfo::new(name, ty));
        self
    }

    pub fn inputs(&self) -> &[SocketInfo] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[SocketInfo] {
        &self.outputs
    }
}

// ── Dependencies ────────────────────────────────────────────────────────────

/// External resource a compiled function reads. Schedulers use these to
/// order re-execution after the resource changes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dependency {
    /// World-space transform of a named object.
    ObjectTransform(String),
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::ObjectTransform(name) => write!(f, "transform:{}", name),
        }
    }
}

// ── Node trait ──────────────────────────────────────────────────────────────

/// A unit of computation with fixed sockets.
pub trait Node: Send + Sync {
    /// Display name used in diagnostics.
    fn name(&self) -> &str;

    fn sockets(&self) -> &NodeSockets;

    /// Emit code for this node. `inputs` holds one value per declared input,
    /// in order; push one value per declared output, in order.
    fn build_ir(
        &self,
        emitter: &mut IrEmitter<'_, '_>,
        inputs: &[NativeValue],
        outputs: &mut Vec<NativeValue>,
    );

    /// External resources this node reads at run time.
    fn declare_dependencies(&self, _deps: &mut Vec<Dependency>) {}
}

// ── Native values ───────────────────────────────────────────────────────────

/// An SSA value of some `Type`: one Cranelift value per machine lane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeValue {
    lanes: Vec<ir::Value>,
}

impl NativeValue {
    pub fn new(lanes: Vec<ir::Value>) -> Self {
        NativeValue { lanes }
    }

    pub fn scalar(value: ir::Value) -> Self {
        NativeValue { lanes: vec![value] }
    }

    pub fn lanes(&self) -> &[ir::Value] {
        &self.lanes
    }

    /// The single lane of a scalar value.
    pub fn as_scalar(&self) -> ir::Value {
        debug_assert_eq!(self.lanes.len(), 1, "scalar access to a multi-lane value");
        self.lanes[0]
    }

    pub fn lane(&self, index: usize) -> ir::Value {
        self.lanes[index]
    }
}

/// Native state kept alive for as long as compiled code may reference it.
pub type Retained = Arc<dyn Any + Send + Sync>;

// ── Emitter ─────────────────────────────────────────────────────────────────

/// Facade over the function being built. Nodes emit through it.
pub struct IrEmitter<'a, 'f> {
    builder: &'a mut FunctionBuilder<'f>,
    context: &'a MachineContext,
    retained: &'a mut Vec<Retained>,
}

impl<'a, 'f> IrEmitter<'a, 'f> {
    pub(crate) fn new(
        builder: &'a mut FunctionBuilder<'f>,
        context: &'a MachineContext,
        retained: &'a mut Vec<Retained>,
    ) -> Self {
        IrEmitter {
            builder,
            context,
            retained,
        }
    }

    /// Instruction builder at the current insertion point.
    pub fn ins(&mut self) -> FuncInstBuilder<'_, 'f> {
        self.builder.ins()
    }

    pub fn builder(&mut self) -> &mut FunctionBuilder<'f> {
        &mut *self.builder
    }

    pub fn context(&self) -> &MachineContext {
        self.context
    }

    pub fn machine_type(&self, ty: &Type) -> Arc<MachineType> {
        ty.machine_type(self.context)
    }

    pub fn pointer_type(&self) -> ir::Type {
        self.context.pointer_type()
    }

    /// Signature with the target's default calling convention.
    pub fn signature(&self) -> Signature {
        Signature::new(self.context.call_conv())
    }

    /// Reserve stack memory for one value and return its address.
    pub fn alloca(&mut self, mt: &MachineType) -> ir::Value {
        let align_shift = mt.align().trailing_zeros() as u8;
        let slot = self.builder.create_sized_stack_slot(StackSlotData::new(
            StackSlotKind::ExplicitSlot,
            mt.size().max(1),
            align_shift,
        ));
        let ptr = self.pointer_type();
        self.builder.ins().stack_addr(ptr, slot, 0)
    }

    /// Store every lane of `value` at `address` using the packed layout.
    pub fn store(&mut self, value: &NativeValue, mt: &MachineType, address: ir::Value) {
        for (lane, offset) in value.lanes().iter().zip(mt.offsets()) {
            self.builder
                .ins()
                .store(MemFlags::trusted(), *lane, address, *offset as i32);
        }
    }

    /// Load a value of machine type `mt` from `address`.
    pub fn load(&mut self, mt: &MachineType, address: ir::Value) -> NativeValue {
        let lanes = mt
            .lanes()
            .iter()
            .zip(mt.offsets())
            .map(|(lane, offset)| {
                self.builder
                    .ins()
                    .load(*lane, MemFlags::trusted(), address, *offset as i32)
            })
            .collect();
        NativeValue::new(lanes)
    }

    /// Call the native function at `address` with `args`. Returns the
    /// call's results (empty for out-parameter conventions).
    pub fn call_address(
        &mut self,
        signature: Signature,
        address: usize,
        args: &[ir::Value],
    ) -> Vec<ir::Value> {
        let sig_ref = self.builder.import_signature(signature);
        let ptr = self.pointer_type();
        let callee = self.builder.ins().iconst(ptr, address as i64);
        let call = self.builder.ins().call_indirect(sig_ref, callee, args);
        self.builder.inst_results(call).to_vec()
    }

    /// Keep `value` alive for the lifetime of the compiled function.
    pub fn retain(&mut self, value: Retained) {
        self.retained.push(value);
    }
}

// ── Function-pointer node ───────────────────────────────────────────────────

/// Lifts a native function into the graph without hand-written codegen.
///
/// The callee must be an `extern "C"` function taking, in order: the context
/// pointer (if one is attached), every input lane by value, and one pointer
/// per output that it writes the result through.
pub struct FunctionPointerNode {
    name: String,
    sockets: NodeSockets,
    address: usize,
    context: Option<(Retained, usize)>,
    dependencies: Vec<Dependency>,
}

impl FunctionPointerNode {
    /// # Safety
    ///
    /// `function` must point to an `extern "C"` function whose parameters
    /// match the convention above for `sockets`, and it must stay valid for
    /// the lifetime of every function compiled from this node.
    pub unsafe fn new(name: impl Into<String>, sockets: NodeSockets, function: *const u8) -> Self {
        FunctionPointerNode {
            name: name.into(),
            sockets,
            address: function as usize,
            context: None,
            dependencies: Vec::new(),
        }
    }

    /// Pass a pointer to `context` as the synthetic first argument. The
    /// compiled function holds a reference, so the context outlives it.
    pub fn with_context<T: Send + Sync + 'static>(mut self, context: Arc<T>) -> Self {
        let address = Arc::as_ptr(&context) as usize;
        self.context = Some((context as Retained, address));
        self
    }

    pub fn with_dependency(mut self, dependency: Dependency) -> Self {
        self.dependencies.push(dependency);
        self
    }
}

impl Node for FunctionPointerNode {
    fn name(&self) -> &str {
        &self.name
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
        let ptr = emitter.pointer_type();
        let mut signature = emitter.signature();
        let mut args = Vec::new();

        if let Some((context, address)) = &self.context {
            emitter.retain(Arc::clone(context));
            signature.params.push(AbiParam::new(ptr));
            args.push(emitter.ins().iconst(ptr, *address as i64));
        }

        for value in inputs {
            for lane in value.lanes() {
                let ty = emitter.builder().func.dfg.value_type(*lane);
                signature.params.push(AbiParam::new(ty));
                args.push(*lane);
            }
        }

        let mut slots = Vec::with_capacity(self.sockets.outputs().len());
        for info in self.sockets.outputs() {
            let mt = emitter.machine_type(&info.ty);
            let slot = emitter.alloca(&mt);
            signature.params.push(AbiParam::new(ptr));
            args.push(slot);
            slots.push((mt, slot));
        }

        emitter.call_address(signature, self.address, &args);

        for (mt, slot) in &slots {
            outputs.push(emitter.load(mt, *slot));
        }
    }

    fn declare_dependencies(&self, deps: &mut Vec<Dependency>) {
        deps.extend(self.dependencies.iter().cloned());
    }
}
