// pipeline.rs — Compilation entry point and build provenance
//
// `compile` runs the two phases of turning a function graph into code:
// emission (graph checks + IR) and finalization (linking into executable
// memory). Each phase is timed and logged.
//
// Preconditions: the graph's types were registered before `context` lowered them.
// Postconditions: on success the returned function owns its code memory.
// Failure modes: integrity, backend or link errors, surfaced as `CompileError`.
//                Nothing is executed before every check has passed.
// Side effects: maps executable memory; logs phase timings.

use std::fmt::Write as _;
use std::time::Instant;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::codegen::emit_function;
use crate::error::CompileError;
use crate::graph::FunctionGraph;
use crate::jit::{finalize, CompiledFunction, MachineContext, OptLevel};
use crate::registry::NodeRegistry;

// ── Options ─────────────────────────────────────────────────────────────────

/// Default exported symbol of a compiled function.
pub const DEFAULT_ENTRY: &str = "fgc_main";

/// Knobs for a single compilation.
#[derive(Debug, Clone)]
pub struct CompileOptions {
    /// Used when the caller builds its own `MachineContext` from these options.
    pub opt_level: OptLevel,
    /// Keep the textual IR of the entry function on the result.
    pub keep_ir: bool,
    /// Exported symbol; the packed trampoline is `<entry_name>_packed`.
    pub entry_name: String,
    /// Run the backend IR verifier.
    pub verify: bool,
}

impl Default for CompileOptions {
    fn default() -> Self {
        CompileOptions {
            opt_level: OptLevel::default(),
            keep_ir: false,
            entry_name: DEFAULT_ENTRY.to_string(),
            verify: true,
        }
    }
}

impl CompileOptions {
    /// Host context configured from these options.
    pub fn machine_context(&self) -> Result<MachineContext, CompileError> {
        MachineContext::host(self.opt_level, self.verify)
    }
}

// ── Compilation ─────────────────────────────────────────────────────────────

/// Compile `function` into native code for `context`.
pub fn compile(
    function: &FunctionGraph,
    context: &MachineContext,
    options: &CompileOptions,
) -> Result<CompiledFunction, CompileError> {
    let t = Instant::now();
    let emitted = emit_function(function, context, options)?;
    info!(
        phase = "emit",
        elapsed_us = t.elapsed().as_micros() as u64,
        live_nodes = emitted.stats().live_nodes,
        "phase complete"
    );

    let t = Instant::now();
    let compiled = finalize(emitted)?;
    info!(
        phase = "finalize",
        elapsed_us = t.elapsed().as_micros() as u64,
        "phase complete"
    );
    debug!(signature = %compiled.signature(), "compiled");
    Ok(compiled)
}

// ── Provenance ──────────────────────────────────────────────────────────────

/// Provenance metadata for cache keys and reproducible builds.
///
/// `source_hash`: SHA-256 of the raw graph description text.
/// `registry_fingerprint`: SHA-256 of `NodeRegistry::canonical_json()`.
/// `compiler_version`: crate version from `Cargo.toml`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Provenance {
    pub source_hash: [u8; 32],
    pub registry_fingerprint: [u8; 32],
    pub compiler_version: &'static str,
}

impl Provenance {
    pub fn source_hash_hex(&self) -> String {
        bytes_to_hex(&self.source_hash)
    }

    pub fn registry_fingerprint_hex(&self) -> String {
        bytes_to_hex(&self.registry_fingerprint)
    }

    /// JSON document for `--emit build-info`.
    pub fn to_json(&self) -> String {
        let doc = serde_json::json!({
            "source_hash": self.source_hash_hex(),
            "registry_fingerprint": self.registry_fingerprint_hex(),
            "compiler_version": self.compiler_version,
        });
        format!("{:#}\n", doc)
    }
}

fn bytes_to_hex(bytes: &[u8; 32]) -> String {
    let mut s = String::with_capacity(64);
    for b in bytes {
        let _ = write!(s, "{:02x}", b);
    }
    s
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&hasher.finalize());
    hash
}

/// Hash the graph description and the registry it is resolved against.
pub fn compute_provenance(source: &str, registry: &NodeRegistry) -> Provenance {
    Provenance {
        source_hash: sha256(source.as_bytes()),
        registry_fingerprint: sha256(registry.canonical_json().as_bytes()),
        compiler_version: env!("CARGO_PKG_VERSION"),
    }
}
