// fgc — Function Graph Compiler
//
// Library root. Node graphs are imported, checked, lowered to Cranelift IR
// and linked into callable native functions.

pub mod codegen;
pub mod diag;
pub mod dot;
pub mod error;
pub mod graph;
pub mod id;
pub mod import;
pub mod jit;
pub mod node;
pub mod nodes;
pub mod pipeline;
pub mod registry;
pub mod types;
