// jit.rs — Machine context and execution binding
//
// `MachineContext` owns the host target description. Machine types are cached
// per context, so every compilation that shares a context shares its layouts.
// `finalize` links an emitted module into executable memory and resolves the
// entry symbols; the resulting `CompiledFunction` owns that memory until it
// is dropped.
//
// Preconditions: the module passed to `finalize` came from `emit_function`.
// Postconditions: a returned `CompiledFunction` has both entry points resolved.
// Failure modes: unresolvable symbol → `LinkError::MissingSymbol`;
//                backend finalization failure → `LinkError::Backend`.
//                On failure all executable memory is released.
// Side effects: maps executable memory.

use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use cranelift_codegen::ir::{types as clif, Type as LaneType};
use cranelift_codegen::isa::{CallConv, OwnedTargetIsa};
use cranelift_codegen::settings::{self, Configurable};
use cranelift_jit::{JITBuilder, JITModule};
use cranelift_module::{default_libcall_names, FuncOrDataId, Module};
use tracing::{debug, info};

use crate::codegen::{EmitStats, EmittedFunction, FunctionSignature};
use crate::error::{CallError, CompileError, LinkError};
use crate::graph::SocketInfo;
use crate::id::ContextId;
use crate::node::{Dependency, Retained};
use crate::types::{MachineType, Type, TypeKind};

// ── Machine context ─────────────────────────────────────────────────────────

/// Backend optimization level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OptLevel {
    None,
    #[default]
    Speed,
    SpeedAndSize,
}

impl OptLevel {
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "none" | "0" => Some(OptLevel::None),
            "speed" | "1" => Some(OptLevel::Speed),
            "speed_and_size" | "2" => Some(OptLevel::SpeedAndSize),
            _ => None,
        }
    }

    fn as_setting(self) -> &'static str {
        match self {
            OptLevel::None => "none",
            OptLevel::Speed => "speed",
            OptLevel::SpeedAndSize => "speed_and_size",
        }
    }
}

/// Host target plus the identity used to key machine-type caches.
pub struct MachineContext {
    id: ContextId,
    isa: OwnedTargetIsa,
    opt_level: OptLevel,
    // Types drop their cached lowering once this has no strong owner.
    liveness: Arc<()>,
}

impl MachineContext {
    /// Context for the machine this process runs on.
    pub fn host(opt_level: OptLevel, verify: bool) -> Result<Self, CompileError> {
        let backend = |e: &dyn fmt::Display| CompileError::Backend(e.to_string());
        let mut flags = settings::builder();
        flags
            .set("opt_level", opt_level.as_setting())
            .map_err(|e| backend(&e))?;
        flags
            .set("enable_verifier", if verify { "true" } else { "false" })
            .map_err(|e| backend(&e))?;
        flags.set("use_colocated_libcalls", "false").map_err(|e| backend(&e))?;
        flags.set("is_pic", "false").map_err(|e| backend(&e))?;

        let isa = cranelift_native::builder()
            .map_err(|e| backend(&e))?
            .finish(settings::Flags::new(flags))
            .map_err(|e| backend(&e))?;
        let context = MachineContext {
            id: ContextId::fresh(),
            isa,
            opt_level,
            liveness: Arc::new(()),
        };
        debug!(context = context.id.0, triple = %context.isa.triple(), "machine context created");
        Ok(context)
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn opt_level(&self) -> OptLevel {
        self.opt_level
    }

    pub fn triple(&self) -> String {
        self.isa.triple().to_string()
    }

    pub fn pointer_type(&self) -> LaneType {
        self.isa.pointer_type()
    }

    pub fn call_conv(&self) -> CallConv {
        self.isa.default_call_conv()
    }

    pub(crate) fn liveness(&self) -> Weak<()> {
        Arc::downgrade(&self.liveness)
    }

    pub(crate) fn new_module(&self) -> JITModule {
        JITModule::new(JITBuilder::with_isa(self.isa.clone(), default_libcall_names()))
    }
}

impl fmt::Debug for MachineContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MachineContext")
            .field("id", &self.id)
            .field("triple", &self.triple())
            .field("opt_level", &self.opt_level)
            .finish()
    }
}

// ── Runtime values ──────────────────────────────────────────────────────────

/// A value crossing the packed calling convention.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Float(f32),
    Double(f64),
    Int32(i32),
    Int64(i64),
    Bool(bool),
    Vector([f32; 3]),
    Pointer(usize),
    Composite(Vec<Value>),
}

impl Value {
    /// Parse a command-line literal for a value of type `ty`.
    /// Vectors are written `x,y,z`; composites are not supported.
    pub fn parse(text: &str, ty: &Type) -> Option<Value> {
        let text = text.trim();
        match ty.kind() {
            TypeKind::Float { bits: 32 } => text.parse().ok().map(Value::Float),
            TypeKind::Float { .. } => text.parse().ok().map(Value::Double),
            TypeKind::Int { bits: 32 } => text.parse().ok().map(Value::Int32),
            TypeKind::Int { bits: 64 } => text.parse().ok().map(Value::Int64),
            TypeKind::Bool => match text {
                "true" | "1" => Some(Value::Bool(true)),
                "false" | "0" => Some(Value::Bool(false)),
                _ => None,
            },
            TypeKind::Vector { arity: 3 } => {
                let parts = text
                    .split(',')
                    .map(|p| p.trim().parse::<f32>().ok())
                    .collect::<Option<Vec<_>>>()?;
                <[f32; 3]>::try_from(parts).ok().map(Value::Vector)
            }
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Float(v) => write!(f, "{}", v),
            Value::Double(v) => write!(f, "{}", v),
            Value::Int32(v) => write!(f, "{}", v),
            Value::Int64(v) => write!(f, "{}", v),
            Value::Bool(v) => write!(f, "{}", v),
            Value::Vector([x, y, z]) => write!(f, "({}, {}, {})", x, y, z),
            Value::Pointer(p) => write!(f, "{:#x}", p),
            Value::Composite(fields) => {
                let parts: Vec<String> = fields.iter().map(|v| v.to_string()).collect();
                write!(f, "{{{}}}", parts.join(", "))
            }
        }
    }
}

/// One machine lane's worth of data.
#[derive(Debug, Clone, Copy)]
enum Scalar {
    Int(i64),
    F32(f32),
    F64(f64),
}

fn flatten(value: &Value, ty: &Type, out: &mut Vec<Scalar>) -> bool {
    match (ty.kind(), value) {
        (TypeKind::Float { bits: 32 }, Value::Float(v)) => out.push(Scalar::F32(*v)),
        (TypeKind::Float { bits: 64 }, Value::Double(v)) => out.push(Scalar::F64(*v)),
        (TypeKind::Int { bits: 32 }, Value::Int32(v)) => out.push(Scalar::Int(*v as i64)),
        (TypeKind::Int { bits: 64 }, Value::Int64(v)) => out.push(Scalar::Int(*v)),
        (TypeKind::Bool, Value::Bool(v)) => out.push(Scalar::Int(*v as i64)),
        (TypeKind::Vector { arity: 3 }, Value::Vector(v)) => {
            out.extend(v.iter().map(|c| Scalar::F32(*c)))
        }
        (TypeKind::Pointer, Value::Pointer(p)) => out.push(Scalar::Int(*p as i64)),
        (TypeKind::Composite { fields }, Value::Composite(values)) if fields.len() == values.len() => {
            return fields.iter().zip(values).all(|(f, v)| flatten(v, f, out));
        }
        _ => return false,
    }
    true
}

fn rebuild(ty: &Type, lanes: &mut dyn Iterator<Item = Scalar>) -> Option<Value> {
    let value = match ty.kind() {
        TypeKind::Composite { fields } => Value::Composite(
            fields
                .iter()
                .map(|field| rebuild(field, lanes))
                .collect::<Option<Vec<_>>>()?,
        ),
        TypeKind::Vector { .. } => {
            let x = as_f32(lanes.next()?)?;
            let y = as_f32(lanes.next()?)?;
            let z = as_f32(lanes.next()?)?;
            Value::Vector([x, y, z])
        }
        kind => match (kind, lanes.next()?) {
            (TypeKind::Float { bits: 32 }, Scalar::F32(v)) => Value::Float(v),
            (TypeKind::Float { .. }, Scalar::F64(v)) => Value::Double(v),
            (TypeKind::Int { bits: 32 }, Scalar::Int(v)) => Value::Int32(v as i32),
            (TypeKind::Int { .. }, Scalar::Int(v)) => Value::Int64(v),
            (TypeKind::Bool, Scalar::Int(v)) => Value::Bool(v != 0),
            (TypeKind::Pointer, Scalar::Int(v)) => Value::Pointer(v as usize),
            _ => return None,
        },
    };
    Some(value)
}

fn as_f32(scalar: Scalar) -> Option<f32> {
    match scalar {
        Scalar::F32(v) => Some(v),
        _ => None,
    }
}

fn write_lane(buf: &mut [u8], offset: usize, lane: LaneType, scalar: Scalar) {
    let bytes = lane.bytes() as usize;
    let dst = &mut buf[offset..offset + bytes];
    match (lane, scalar) {
        (clif::F32, Scalar::F32(v)) => dst.copy_from_slice(&v.to_ne_bytes()),
        (clif::F64, Scalar::F64(v)) => dst.copy_from_slice(&v.to_ne_bytes()),
        (clif::I8, Scalar::Int(v)) => dst.copy_from_slice(&(v as i8).to_ne_bytes()),
        (clif::I32, Scalar::Int(v)) => dst.copy_from_slice(&(v as i32).to_ne_bytes()),
        (clif::I64, Scalar::Int(v)) => dst.copy_from_slice(&v.to_ne_bytes()),
        (lane, scalar) => unreachable!("lane {} cannot hold {:?}", lane, scalar),
    }
}

fn read_lane(buf: &[u8], offset: usize, lane: LaneType) -> Scalar {
    let src = &buf[offset..offset + lane.bytes() as usize];
    let mut raw = [0u8; 8];
    raw[..src.len()].copy_from_slice(src);
    match lane {
        clif::F32 => Scalar::F32(f32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]])),
        clif::F64 => Scalar::F64(f64::from_ne_bytes(raw)),
        clif::I8 => Scalar::Int(raw[0] as i8 as i64),
        clif::I32 => Scalar::Int(i32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]) as i64),
        _ => Scalar::Int(i64::from_ne_bytes(raw)),
    }
}

/// Byte buffer backed by `u64` words so every packed offset is aligned.
struct PackedBuffer {
    words: Vec<u64>,
}

impl PackedBuffer {
    fn zeroed(size: u32) -> Self {
        PackedBuffer {
            words: vec![0; (size as usize).div_ceil(8).max(1)],
        }
    }

    fn from_bytes(bytes: &[u8]) -> Self {
        let mut buffer = PackedBuffer::zeroed(bytes.len() as u32);
        for (word, chunk) in buffer.words.iter_mut().zip(bytes.chunks(8)) {
            let mut raw = [0u8; 8];
            raw[..chunk.len()].copy_from_slice(chunk);
            *word = u64::from_ne_bytes(raw);
        }
        buffer
    }

    fn to_bytes(&self) -> Vec<u8> {
        self.words.iter().flat_map(|w| w.to_ne_bytes()).collect()
    }
}

// ── Compiled function ───────────────────────────────────────────────────────

type PackedFn = unsafe extern "C" fn(*const u8, *mut u8);

/// Executable code for one function graph. Owns its code memory and every
/// runtime object the code refers to.
pub struct CompiledFunction {
    module: Option<JITModule>,
    entry: *const u8,
    packed: *const u8,
    signature: FunctionSignature,
    stats: EmitStats,
    ir: Option<String>,
    dependencies: Vec<Dependency>,
    _retained: Vec<Retained>,
}

// SAFETY: the code is immutable after finalization and the module is only
// touched again in `Drop`. Retained objects are `Send + Sync`.
unsafe impl Send for CompiledFunction {}
unsafe impl Sync for CompiledFunction {}

impl CompiledFunction {
    /// Address of the native entry point: input lanes by value, then one
    /// out-pointer per output, no return value.
    pub fn entry_point(&self) -> *const u8 {
        self.entry
    }

    /// Reinterpret the entry point as a function pointer type.
    ///
    /// # Safety
    /// `F` must be an `extern "C"` function pointer whose parameters match
    /// `signature().abi()`.
    pub unsafe fn entry<F: Copy>(&self) -> F {
        assert_eq!(mem::size_of::<F>(), mem::size_of::<*const u8>());
        mem::transmute_copy(&self.entry)
    }

    pub fn signature(&self) -> &FunctionSignature {
        &self.signature
    }

    pub fn inputs(&self) -> &[SocketInfo] {
        &self.signature.inputs
    }

    pub fn outputs(&self) -> &[SocketInfo] {
        &self.signature.outputs
    }

    pub fn stats(&self) -> &EmitStats {
        &self.stats
    }

    /// Textual IR, when compiled with `keep_ir`.
    pub fn ir(&self) -> Option<&str> {
        self.ir.as_deref()
    }

    pub fn dependencies(&self) -> &[Dependency] {
        &self.dependencies
    }

    /// Invoke through the packed trampoline. Arguments are checked against
    /// the interface types before any native code runs.
    pub fn call(&self, args: &[Value]) -> Result<Vec<Value>, CallError> {
        let sig = &self.signature;
        if args.len() != sig.inputs.len() {
            return Err(CallError::Arity {
                expected: sig.inputs.len(),
                actual: args.len(),
            });
        }

        let mut bytes = vec![0u8; sig.input_layout.size as usize];
        for (index, (arg, info)) in args.iter().zip(&sig.inputs).enumerate() {
            let mut scalars = Vec::new();
            if !flatten(arg, &info.ty, &mut scalars) {
                return Err(CallError::Type {
                    index,
                    expected: info.ty.name().to_string(),
                });
            }
            let mt = &sig.input_machine_types[index];
            let base = sig.input_layout.offsets[index] as usize;
            for ((lane, offset), scalar) in mt.lanes().iter().zip(mt.offsets()).zip(scalars) {
                write_lane(&mut bytes, base + *offset as usize, *lane, scalar);
            }
        }
        let input = PackedBuffer::from_bytes(&bytes);
        let mut output = PackedBuffer::zeroed(sig.output_layout.size);

        // SAFETY: `packed` was resolved from this module and takes two
        // pointers. Both buffers cover their layouts and are 8-byte aligned.
        unsafe {
            let packed: PackedFn = mem::transmute(self.packed);
            packed(
                input.words.as_ptr() as *const u8,
                output.words.as_mut_ptr() as *mut u8,
            );
        }

        let bytes = output.to_bytes();
        let results = sig
            .outputs
            .iter()
            .zip(&sig.output_machine_types)
            .zip(&sig.output_layout.offsets)
            .map(|((info, mt), base)| unpack(&bytes, *base as usize, &info.ty, mt))
            .collect();
        Ok(results)
    }
}

fn unpack(bytes: &[u8], base: usize, ty: &Type, mt: &MachineType) -> Value {
    let mut lanes = mt
        .lanes()
        .iter()
        .zip(mt.offsets())
        .map(|(lane, offset)| read_lane(bytes, base + *offset as usize, *lane));
    rebuild(ty, &mut lanes)
        .unwrap_or_else(|| panic!("machine layout of {} does not match its kind", ty.name()))
}

impl fmt::Debug for CompiledFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompiledFunction")
            .field("signature", &self.signature.to_string())
            .field("entry", &self.entry)
            .finish()
    }
}

impl Drop for CompiledFunction {
    fn drop(&mut self) {
        if let Some(module) = self.module.take() {
            // SAFETY: `entry` and `packed` are private and die with `self`.
            // Callers of `entry_point` must not outlive the function.
            unsafe { module.free_memory() };
        }
    }
}

// ── Finalization ────────────────────────────────────────────────────────────

/// Link `emitted` into executable memory and resolve both entry points.
pub fn finalize(emitted: EmittedFunction) -> Result<CompiledFunction, LinkError> {
    let EmittedFunction {
        mut module,
        signature,
        stats,
        ir,
        retained,
        dependencies,
    } = emitted;

    if let Err(e) = module.finalize_definitions() {
        // SAFETY: no address from this module has been handed out yet.
        unsafe { module.free_memory() };
        return Err(LinkError::Backend(e.to_string()));
    }

    let resolved = resolve(&module, &signature.entry_name)
        .and_then(|entry| Ok((entry, resolve(&module, &signature.packed_name)?)));
    let (entry, packed) = match resolved {
        Ok(pair) => pair,
        Err(e) => {
            // SAFETY: as above.
            unsafe { module.free_memory() };
            return Err(e);
        }
    };
    info!(entry = %signature.entry_name, address = ?entry, "function finalized");

    Ok(CompiledFunction {
        module: Some(module),
        entry,
        packed,
        signature,
        stats,
        ir,
        dependencies,
        _retained: retained,
    })
}

fn resolve(module: &JITModule, name: &str) -> Result<*const u8, LinkError> {
    match module.get_name(name) {
        Some(FuncOrDataId::Func(id)) => Ok(module.get_finalized_function(id)),
        _ => Err(LinkError::MissingSymbol(name.to_string())),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
