// error.rs — Error taxonomy for registration, graph integrity, and linking
//
// ConfigError: registration-time mistakes (duplicate kinds, unknown composite
//              components). Meant to surface during development, at startup.
// GraphIntegrityError: rejected compilation input. Carries node identity and
//              socket index so callers can point at the offending socket.
// LinkError: the finalized module lacks an expected symbol, or the backend
//              failed while finalizing. Indicates a code generation bug.
// CallError: a packed invocation received arguments that do not match the
//              compiled signature.

use thiserror::Error;

use crate::diag::Diagnostic;
use crate::id::NodeId;

/// Registration-time configuration failures.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("node kind '{0}' is already registered")]
    DuplicateNodeKind(String),
    #[error("socket kind '{0}' is already registered")]
    DuplicateSocketKind(String),
    #[error("type '{0}' is already registered")]
    DuplicateType(String),
    #[error("composite type '{composite}' names unregistered component type '{component}'")]
    UnknownComponent { composite: String, component: String },
    #[error("composite type '{0}' has no components")]
    EmptyComposite(String),
    #[error("type '{name}' cannot be lowered: {reason}")]
    UnsupportedKind { name: String, reason: &'static str },
    #[error("built-in type '{0}' is not registered")]
    MissingBuiltin(String),
}

/// A graph that cannot be compiled as given.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GraphIntegrityError {
    #[error("graph is not a DAG: node {node} ('{node_name}') depends on itself through input {index}")]
    Cycle {
        node: NodeId,
        node_name: String,
        index: usize,
    },
    #[error("input {index} ('{socket_name}') of node {node} ('{node_name}') is not linked")]
    UnlinkedInput {
        node: NodeId,
        node_name: String,
        index: usize,
        socket_name: String,
    },
    #[error("node {node} ('{node_name}') declares {expected} outputs but emitted {actual}")]
    OutputCountMismatch {
        node: NodeId,
        node_name: String,
        expected: usize,
        actual: usize,
    },
    #[error("output {index} of node {node} ('{node_name}') emitted {actual} lanes, its type has {expected}")]
    OutputShapeMismatch {
        node: NodeId,
        node_name: String,
        index: usize,
        expected: usize,
        actual: usize,
    },
    #[error("input {index} of node {node} already has an incoming link")]
    DuplicateLink { node: NodeId, index: usize },
    #[error("links must run from an output socket to an input socket")]
    LinkDirection,
    #[error("cannot link '{from_type}' output to '{to_type}' input {index} of node {node}")]
    TypeMismatch {
        node: NodeId,
        index: usize,
        from_type: String,
        to_type: String,
    },
}

/// Failures while turning an emitted module into executable memory.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("finalized module has no function named '{0}'")]
    MissingSymbol(String),
    #[error("backend failed to finalize module: {0}")]
    Backend(String),
}

/// Everything `compile` can fail with.
#[derive(Debug, Error)]
pub enum CompileError {
    #[error(transparent)]
    Integrity(#[from] GraphIntegrityError),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error("code generation backend error: {0}")]
    Backend(String),
}

/// Rejected graph import. Diagnostics list every problem found.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("malformed graph description: {0}")]
    Json(#[from] serde_json::Error),
    #[error("graph import rejected with {} error(s)", .diagnostics.len())]
    Rejected { diagnostics: Vec<Diagnostic> },
}

/// Argument mismatch for a packed invocation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CallError {
    #[error("expected {expected} arguments, got {actual}")]
    Arity { expected: usize, actual: usize },
    #[error("argument {index} does not match parameter type '{expected}'")]
    Type { index: usize, expected: String },
}
