// id.rs — Stable identifiers for graph arenas and machine contexts
//
// Node identifiers index into the arena owned by a `DataFlowGraph`, so socket
// handles stay valid when a graph is cloned or moved between threads. Context
// identifiers key the per-context machine-type caches and are unique for the
// lifetime of the process.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Index of a node inside its owning `DataFlowGraph`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Process-unique identifier of a machine context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl ContextId {
    /// Allocate a fresh identifier. Never returns the same value twice.
    pub fn fresh() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ContextId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Allocator for node identifiers. Produces monotonically increasing IDs in
/// insertion order, so the arena index and the ID always agree.
#[derive(Debug, Default, Clone)]
pub struct IdAllocator {
    next_node: u32,
}

impl IdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alloc_node(&mut self) -> NodeId {
        let id = NodeId(self.next_node);
        self.next_node += 1;
        id
    }
}
