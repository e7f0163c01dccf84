// types.rs — Abstract value types and their per-context machine types
//
// A `Type` describes the shape of a socket value. Lowering a type to machine
// lanes depends on the target (pointer width), so every `Type` owns a cache
// keyed by machine context. Repeated lookups against one context return the
// same `Arc<MachineType>`; downstream checks compare machine types by
// identity, never structurally.
//
// Preconditions: composite components are registered before the composite.
// Postconditions: machine types are created at most once per (type, context).
// Failure modes: duplicate names, unknown components or shapes without a
//                machine lowering → `ConfigError` at registration time.
//                Lookups never fail.
// Side effects: fills the per-type cache on first lookup and prunes entries
//               of dropped contexts.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use cranelift_codegen::ir::{types as clif, Type as LaneType};

use crate::error::ConfigError;
use crate::id::ContextId;
use crate::jit::MachineContext;

// ── Type descriptors ────────────────────────────────────────────────────────

/// Shape of a value.
#[derive(Debug, Clone)]
pub enum TypeKind {
    /// Signed integer of 32 or 64 bits.
    Int { bits: u8 },
    /// IEEE float of 32 or 64 bits.
    Float { bits: u8 },
    /// Stored as one byte, 0 or 1.
    Bool,
    /// Three packed f32 components.
    Vector { arity: u8 },
    /// Opaque aggregate handled by address.
    Pointer,
    /// Ordered fields, flattened lane by lane.
    Composite { fields: Vec<Arc<Type>> },
}

impl TypeKind {
    /// Shapes the backend and the packed calling convention can carry.
    fn check(&self) -> Result<(), &'static str> {
        match self {
            TypeKind::Int { bits: 32 | 64 } => Ok(()),
            TypeKind::Int { .. } => Err("integers must be 32 or 64 bits"),
            TypeKind::Float { bits: 32 | 64 } => Ok(()),
            TypeKind::Float { .. } => Err("floats must be 32 or 64 bits"),
            TypeKind::Vector { arity: 3 } => Ok(()),
            TypeKind::Vector { .. } => Err("vectors must have 3 components"),
            TypeKind::Bool | TypeKind::Pointer => Ok(()),
            TypeKind::Composite { .. } => Err("composites are registered with register_composite"),
        }
    }
}

/// Cached lowering for one context. Dead once the context is dropped.
struct CacheEntry {
    context: Weak<()>,
    machine_type: Arc<MachineType>,
}

/// An immutable value type. Compare with [`Type::same`] (identity).
pub struct Type {
    name: String,
    kind: TypeKind,
    machine_types: Mutex<HashMap<ContextId, CacheEntry>>,
}

impl Type {
    pub(crate) fn new(name: impl Into<String>, kind: TypeKind) -> Arc<Self> {
        Arc::new(Type {
            name: name.into(),
            kind,
            machine_types: Mutex::new(HashMap::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &TypeKind {
        &self.kind
    }

    /// Identity comparison.
    pub fn same(a: &Arc<Type>, b: &Arc<Type>) -> bool {
        Arc::ptr_eq(a, b)
    }

    /// Machine type for `context`, created on first use and cached.
    pub fn machine_type(&self, context: &MachineContext) -> Arc<MachineType> {
        let mut cache = self
            .machine_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = cache.get(&context.id()) {
            return Arc::clone(&existing.machine_type);
        }
        cache.retain(|_, entry| entry.context.strong_count() > 0);
        let created = Arc::new(MachineType::from_lanes(self.lanes(context), context.id()));
        cache.insert(
            context.id(),
            CacheEntry {
                context: context.liveness(),
                machine_type: Arc::clone(&created),
            },
        );
        created
    }

    /// Number of live contexts this type has been lowered for.
    pub fn cached_contexts(&self) -> usize {
        self.machine_types
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|entry| entry.context.strong_count() > 0)
            .count()
    }

    fn lanes(&self, context: &MachineContext) -> Vec<LaneType> {
        match &self.kind {
            TypeKind::Int { bits } => vec![if *bits == 64 { clif::I64 } else { clif::I32 }],
            TypeKind::Float { bits } => vec![if *bits == 64 { clif::F64 } else { clif::F32 }],
            TypeKind::Bool => vec![clif::I8],
            TypeKind::Vector { arity } => vec![clif::F32; *arity as usize],
            TypeKind::Pointer => vec![context.pointer_type()],
            TypeKind::Composite { fields } => fields
                .iter()
                .flat_map(|field| field.machine_type(context).lanes().to_vec())
                .collect(),
        }
    }
}

impl fmt::Debug for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Type")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Resolve the machine type of `ty` in `context`.
pub fn get_machine_type(ty: &Type, context: &MachineContext) -> Arc<MachineType> {
    ty.machine_type(context)
}

// ── Machine types ───────────────────────────────────────────────────────────

/// Context-scoped lowering of a `Type`: the Cranelift lanes that carry a value,
/// plus the packed in-memory layout used when values cross memory.
#[derive(Debug)]
pub struct MachineType {
    lanes: Vec<LaneType>,
    offsets: Vec<u32>,
    size: u32,
    align: u32,
    context: ContextId,
}

impl MachineType {
    fn from_lanes(lanes: Vec<LaneType>, context: ContextId) -> Self {
        let mut offsets = Vec::with_capacity(lanes.len());
        let mut size = 0u32;
        let mut align = 1u32;
        for lane in &lanes {
            let bytes = lane.bytes();
            size = align_to(size, bytes);
            offsets.push(size);
            size += bytes;
            align = align.max(bytes);
        }
        MachineType {
            size: align_to(size, align),
            lanes,
            offsets,
            align,
            context,
        }
    }

    pub fn lanes(&self) -> &[LaneType] {
        &self.lanes
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Byte offset of each lane inside the packed layout.
    pub fn offsets(&self) -> &[u32] {
        &self.offsets
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn align(&self) -> u32 {
        self.align
    }

    pub fn context(&self) -> ContextId {
        self.context
    }
}

pub(crate) fn align_to(value: u32, align: u32) -> u32 {
    if align <= 1 {
        value
    } else {
        value.div_ceil(align) * align
    }
}

// ── Registry ────────────────────────────────────────────────────────────────

pub const FLOAT: &str = "Float";
pub const DOUBLE: &str = "Double";
pub const INT32: &str = "Int32";
pub const INT64: &str = "Int64";
pub const BOOL: &str = "Bool";
pub const VECTOR: &str = "Vector";
pub const POINTER: &str = "Pointer";

/// Named types available to node constructors.
#[derive(Debug, Default)]
pub struct TypeRegistry {
    types: HashMap<String, Arc<Type>>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in scalar and vector types.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        let builtins = [
            (FLOAT, TypeKind::Float { bits: 32 }),
            (DOUBLE, TypeKind::Float { bits: 64 }),
            (INT32, TypeKind::Int { bits: 32 }),
            (INT64, TypeKind::Int { bits: 64 }),
            (BOOL, TypeKind::Bool),
            (VECTOR, TypeKind::Vector { arity: 3 }),
            (POINTER, TypeKind::Pointer),
        ];
        for (name, kind) in builtins {
            registry.types.insert(name.to_string(), Type::new(name, kind));
        }
        registry
    }

    /// Register a non-composite type.
    pub fn register(&mut self, name: &str, kind: TypeKind) -> Result<Arc<Type>, ConfigError> {
        if self.types.contains_key(name) {
            return Err(ConfigError::DuplicateType(name.to_string()));
        }
        kind.check().map_err(|reason| ConfigError::UnsupportedKind {
            name: name.to_string(),
            reason,
        })?;
        let ty = Type::new(name, kind);
        self.types.insert(name.to_string(), Arc::clone(&ty));
        Ok(ty)
    }

    /// Register a composite whose fields are already-registered types.
    pub fn register_composite(
        &mut self,
        name: &str,
        components: &[&str],
    ) -> Result<Arc<Type>, ConfigError> {
        if self.types.contains_key(name) {
            return Err(ConfigError::DuplicateType(name.to_string()));
        }
        if components.is_empty() {
            return Err(ConfigError::EmptyComposite(name.to_string()));
        }
        let fields = components
            .iter()
            .map(|component| {
                self.lookup(component)
                    .ok_or_else(|| ConfigError::UnknownComponent {
                        composite: name.to_string(),
                        component: component.to_string(),
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let ty = Type::new(name, TypeKind::Composite { fields });
        self.types.insert(name.to_string(), Arc::clone(&ty));
        Ok(ty)
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<Type>> {
        self.types.get(name).cloned()
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Drop every registration. Types already referenced by graphs stay alive
    /// until those graphs are dropped.
    pub fn free_registered_types(&mut self) {
        self.types.clear();
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Handles to the built-in types, cloned into node constructors.
#[derive(Debug, Clone)]
pub struct CoreTypes {
    pub float: Arc<Type>,
    pub double: Arc<Type>,
    pub int32: Arc<Type>,
    pub int64: Arc<Type>,
    pub boolean: Arc<Type>,
    pub vector: Arc<Type>,
    pub pointer: Arc<Type>,
}

impl CoreTypes {
    pub fn from_registry(registry: &TypeRegistry) -> Result<Self, ConfigError> {
        let get = |name: &str| {
            registry
                .lookup(name)
                .ok_or_else(|| ConfigError::MissingBuiltin(name.to_string()))
        };
        Ok(CoreTypes {
            float: get(FLOAT)?,
            double: get(DOUBLE)?,
            int32: get(INT32)?,
            int64: get(INT64)?,
            boolean: get(BOOL)?,
            vector: get(VECTOR)?,
            pointer: get(POINTER)?,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
