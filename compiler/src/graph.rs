// graph.rs — Sockets, links, and the data-flow graph arena
//
// Nodes live in an arena owned by `DataFlowGraph`; sockets are addressed by
// `(node, direction, index)` triples into that arena, never by reference.
// Every input socket has at most one incoming link. Outputs may feed any
// number of inputs, or none.
//
// Preconditions: socket handles were produced by the graph they are used with.
// Postconditions: `link` keeps the single-assignment and type invariants.
// Failure modes: invalid links → `GraphIntegrityError`; out-of-range socket
//                indices and wrong directions are programming errors (panic).
// Side effects: none.

use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use crate::error::GraphIntegrityError;
use crate::id::{IdAllocator, NodeId};
use crate::node::{Dependency, Node};
use crate::types::Type;

// ── Sockets ─────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Direction {
    Input,
    Output,
}

/// Handle to one socket of one node. Compared and hashed by the full triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AnySocket {
    node: NodeId,
    direction: Direction,
    index: u32,
}

impl AnySocket {
    pub fn input(node: NodeId, index: usize) -> Self {
        AnySocket {
            node,
            direction: Direction::Input,
            index: index as u32,
        }
    }

    pub fn output(node: NodeId, index: usize) -> Self {
        AnySocket {
            node,
            direction: Direction::Output,
            index: index as u32,
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn index(&self) -> usize {
        self.index as usize
    }

    pub fn is_input(&self) -> bool {
        self.direction == Direction::Input
    }

    pub fn is_output(&self) -> bool {
        self.direction == Direction::Output
    }
}

impl fmt::Display for AnySocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dir = match self.direction {
            Direction::Input => "in",
            Direction::Output => "out",
        };
        write!(f, "{}.{}{}", self.node, dir, self.index)
    }
}

/// Declared name and type of a socket.
#[derive(Debug, Clone)]
pub struct SocketInfo {
    pub name: String,
    pub ty: Arc<Type>,
}

impl SocketInfo {
    pub fn new(name: impl Into<String>, ty: &Arc<Type>) -> Self {
        SocketInfo {
            name: name.into(),
            ty: Arc::clone(ty),
        }
    }
}

// ── Links ───────────────────────────────────────────────────────────────────

/// Directed edge from an output socket to an input socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Link {
    pub from: AnySocket,
    pub to: AnySocket,
}

/// The links of one graph, indexed by target input.
#[derive(Debug, Clone, Default)]
pub struct LinkSet {
    links: Vec<Link>,
    origins: HashMap<AnySocket, AnySocket>,
}

impl LinkSet {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&mut self, link: Link) {
        self.origins.insert(link.to, link.from);
        self.links.push(link);
    }

    /// Whether any link touches `socket`. Linear in the number of links.
    pub fn is_linked(&self, socket: AnySocket) -> bool {
        self.links
            .iter()
            .any(|link| link.from == socket || link.to == socket)
    }

    /// The output feeding `input`, if it is linked.
    pub fn origin(&self, input: AnySocket) -> Option<AnySocket> {
        assert!(input.is_input(), "origin of non-input socket {}", input);
        self.origins.get(&input).copied()
    }

    /// Every input fed by `output`. Empty for unconsumed outputs.
    pub fn targets(&self, output: AnySocket) -> Vec<AnySocket> {
        assert!(output.is_output(), "targets of non-output socket {}", output);
        self.links
            .iter()
            .filter(|link| link.from == output)
            .map(|link| link.to)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Link> {
        self.links.iter()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

// ── Graph ───────────────────────────────────────────────────────────────────

/// Node arena plus links. Cloning shares the (immutable) node instances.
#[derive(Clone, Default)]
pub struct DataFlowGraph {
    nodes: Vec<Arc<dyn Node>>,
    links: LinkSet,
    ids: IdAllocator,
}

impl DataFlowGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a node. Its sockets are fixed from here on.
    pub fn insert(&mut self, node: Arc<dyn Node>) -> NodeId {
        let id = self.ids.alloc_node();
        debug_assert_eq!(id.index(), self.nodes.len());
        self.nodes.push(node);
        id
    }

    pub fn insert_node<N: Node + 'static>(&mut self, node: N) -> NodeId {
        self.insert(Arc::new(node))
    }

    pub fn node(&self, id: NodeId) -> &dyn Node {
        self.nodes[id.index()].as_ref()
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &dyn Node)> {
        self.nodes
            .iter()
            .enumerate()
            .map(|(i, node)| (NodeId(i as u32), node.as_ref()))
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Handle to input `index` of `node`. Panics when out of range.
    pub fn input(&self, node: NodeId, index: usize) -> AnySocket {
        let count = self.node(node).sockets().inputs().len();
        assert!(index < count, "node {} has {} inputs, asked for {}", node, count, index);
        AnySocket::input(node, index)
    }

    /// Handle to output `index` of `node`. Panics when out of range.
    pub fn output(&self, node: NodeId, index: usize) -> AnySocket {
        let count = self.node(node).sockets().outputs().len();
        assert!(index < count, "node {} has {} outputs, asked for {}", node, count, index);
        AnySocket::output(node, index)
    }

    pub fn inputs_of(&self, node: NodeId) -> impl Iterator<Item = AnySocket> {
        (0..self.node(node).sockets().inputs().len()).map(move |i| AnySocket::input(node, i))
    }

    pub fn outputs_of(&self, node: NodeId) -> impl Iterator<Item = AnySocket> {
        (0..self.node(node).sockets().outputs().len()).map(move |i| AnySocket::output(node, i))
    }

    /// Declared info of the socket. Panics when the index is out of range.
    pub fn socket_info(&self, socket: AnySocket) -> &SocketInfo {
        let sockets = self.node(socket.node()).sockets();
        let list = match socket.direction() {
            Direction::Input => sockets.inputs(),
            Direction::Output => sockets.outputs(),
        };
        &list[socket.index()]
    }

    pub fn socket_type(&self, socket: AnySocket) -> &Arc<Type> {
        &self.socket_info(socket).ty
    }

    pub fn socket_name(&self, socket: AnySocket) -> &str {
        &self.socket_info(socket).name
    }

    /// Connect `from` (an output) to `to` (an input).
    pub fn link(&mut self, from: AnySocket, to: AnySocket) -> Result<(), GraphIntegrityError> {
        if !from.is_output() || !to.is_input() {
            return Err(GraphIntegrityError::LinkDirection);
        }
        // Validate both handles against the arena.
        let from_ty = Arc::clone(self.socket_type(from));
        let to_ty = self.socket_type(to);
        if !Type::same(&from_ty, to_ty) {
            return Err(GraphIntegrityError::TypeMismatch {
                node: to.node(),
                index: to.index(),
                from_type: from_ty.name().to_string(),
                to_type: to_ty.name().to_string(),
            });
        }
        if self.links.origin(to).is_some() {
            return Err(GraphIntegrityError::DuplicateLink {
                node: to.node(),
                index: to.index(),
            });
        }
        self.links.insert(Link { from, to });
        Ok(())
    }

    pub fn links(&self) -> &LinkSet {
        &self.links
    }

    /// The output feeding `input`. Every consumed input must be linked.
    pub fn origin_socket(&self, input: AnySocket) -> Result<AnySocket, GraphIntegrityError> {
        self.links
            .origin(input)
            .ok_or_else(|| GraphIntegrityError::UnlinkedInput {
                node: input.node(),
                node_name: self.node(input.node()).name().to_string(),
                index: input.index(),
                socket_name: self.socket_name(input).to_string(),
            })
    }

    pub fn target_sockets(&self, output: AnySocket) -> Vec<AnySocket> {
        self.links.targets(output)
    }
}

impl fmt::Debug for DataFlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataFlowGraph")
            .field("nodes", &self.nodes.len())
            .field("links", &self.links.len())
            .finish()
    }
}

impl fmt::Display for DataFlowGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "DataFlowGraph ({} nodes, {} links)",
            self.nodes.len(),
            self.links.len()
        )?;
        for (id, node) in self.nodes() {
            writeln!(f, "  {} {}", id, node.name())?;
            for (i, info) in node.sockets().inputs().iter().enumerate() {
                writeln!(f, "    in{} {}: {}", i, info.name, info.ty)?;
            }
            for (i, info) in node.sockets().outputs().iter().enumerate() {
                writeln!(f, "    out{} {}: {}", i, info.name, info.ty)?;
            }
        }
        let mut links: Vec<&Link> = self.links.iter().collect();
        links.sort_by_key(|link| (link.to, link.from));
        for link in links {
            writeln!(f, "  {} -> {}", link.from, link.to)?;
        }
        Ok(())
    }
}

// ── Function graph ──────────────────────────────────────────────────────────

/// A graph plus the sockets that form a function's interface. Inputs become
/// parameters in order; outputs are written through out-pointers in order.
#[derive(Debug, Clone)]
pub struct FunctionGraph {
    graph: DataFlowGraph,
    inputs: Vec<AnySocket>,
    outputs: Vec<AnySocket>,
}

impl FunctionGraph {
    /// Panics if an interface socket does not exist or an input is repeated.
    pub fn new(graph: DataFlowGraph, inputs: Vec<AnySocket>, outputs: Vec<AnySocket>) -> Self {
        let mut seen = HashSet::new();
        for socket in &inputs {
            graph.socket_info(*socket);
            assert!(seen.insert(*socket), "interface input {} listed twice", socket);
        }
        for socket in &outputs {
            graph.socket_info(*socket);
        }
        FunctionGraph {
            graph,
            inputs,
            outputs,
        }
    }

    pub fn graph(&self) -> &DataFlowGraph {
        &self.graph
    }

    pub fn inputs(&self) -> &[AnySocket] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[AnySocket] {
        &self.outputs
    }

    pub fn input_types(&self) -> Vec<Arc<Type>> {
        self.inputs
            .iter()
            .map(|s| Arc::clone(self.graph.socket_type(*s)))
            .collect()
    }

    pub fn output_types(&self) -> Vec<Arc<Type>> {
        self.outputs
            .iter()
            .map(|s| Arc::clone(self.graph.socket_type(*s)))
            .collect()
    }

    /// Reverse reachability from the outputs, stopping at interface inputs.
    /// The result is exactly the set of sockets the outputs depend on.
    pub fn required_sockets(&self) -> Result<HashSet<AnySocket>, GraphIntegrityError> {
        let stops: HashSet<AnySocket> = self.inputs.iter().copied().collect();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<AnySocket> = self.outputs.iter().copied().collect();
        while let Some(socket) = queue.pop_front() {
            if !visited.insert(socket) || stops.contains(&socket) {
                continue;
            }
            if socket.is_input() {
                queue.push_back(self.graph.origin_socket(socket)?);
            } else {
                queue.extend(self.graph.inputs_of(socket.node()));
            }
        }
        Ok(visited)
    }

    /// Nodes that must be emitted to compute the outputs, sorted by id.
    pub fn required_nodes(&self) -> Result<Vec<NodeId>, GraphIntegrityError> {
        let stops: HashSet<AnySocket> = self.inputs.iter().copied().collect();
        let mut nodes: Vec<NodeId> = self
            .required_sockets()?
            .into_iter()
            .filter(|s| s.is_output() && !stops.contains(s))
            .map(|s| s.node())
            .collect();
        nodes.sort_unstable();
        nodes.dedup();
        Ok(nodes)
    }

    /// External resources the live part of the graph reads, sorted and unique.
    pub fn dependencies(&self) -> Result<Vec<Dependency>, GraphIntegrityError> {
        let mut deps = Vec::new();
        for id in self.required_nodes()? {
            self.graph.node(id).declare_dependencies(&mut deps);
        }
        deps.sort();
        deps.dedup();
        Ok(deps)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
