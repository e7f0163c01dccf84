// import.rs — External graph description and import
//
// The external format is a JSON document listing nodes with their sockets,
// links between sockets, and the function interface. Import runs in four
// steps:
//   1. node inserters build internal nodes and map external socket ids,
//   2. socket inserters turn stored values of unlinked inputs into nodes,
//   3. external links are translated through the socket map,
//   4. interface sockets are resolved into a `FunctionGraph`.
//
// Preconditions: `registry` is fully populated.
// Postconditions: on success every external socket used by a link or the
//                 interface resolved to an internal socket.
// Failure modes: all problems are collected as diagnostics and returned
//                together in `ImportError::Rejected`.
// Side effects: logs warnings for nodes that feed no output.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::diag::{codes, Diagnostic};
use crate::error::ImportError;
use crate::graph::{AnySocket, DataFlowGraph, FunctionGraph};
use crate::id::NodeId;
use crate::node::Node;
use crate::nodes::{SceneQuery, StaticScene};
use crate::registry::NodeRegistry;
use crate::types::Type;

// ── Description format ──────────────────────────────────────────────────────

/// A node graph exported by the host application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphDescription {
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<ExternalNode>,
    #[serde(default)]
    pub links: Vec<ExternalLink>,
    pub interface: Interface,
    /// Named object locations for scene-query nodes.
    #[serde(default)]
    pub objects: BTreeMap<String, [f32; 3]>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalNode {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub inputs: Vec<ExternalSocket>,
    #[serde(default)]
    pub outputs: Vec<ExternalSocket>,
    #[serde(default)]
    pub properties: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalSocket {
    pub id: String,
    pub kind: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Value used when the socket is an unlinked input.
    #[serde(default)]
    pub value: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SocketRef {
    pub node: String,
    pub socket: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalLink {
    pub from: SocketRef,
    pub to: SocketRef,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Interface {
    #[serde(default)]
    pub inputs: Vec<SocketRef>,
    #[serde(default)]
    pub outputs: Vec<SocketRef>,
}

impl GraphDescription {
    pub fn from_json(text: &str) -> Result<Self, ImportError> {
        Ok(serde_json::from_str(text)?)
    }
}

fn malformed(node: &ExternalNode, key: &str, expected: &str) -> Diagnostic {
    Diagnostic::error(
        codes::E0106,
        format!("property '{}' of node '{}' must be {}", key, node.id, expected),
    )
    .at_node(&node.id)
}

impl ExternalNode {
    fn property(&self, key: &str) -> Result<&serde_json::Value, Diagnostic> {
        self.properties.get(key).ok_or_else(|| {
            Diagnostic::error(
                codes::E0106,
                format!("node '{}' ({}) has no property '{}'", self.id, self.kind, key),
            )
            .at_node(&self.id)
        })
    }

    pub fn property_str(&self, key: &str) -> Result<&str, Diagnostic> {
        self.property(key)?
            .as_str()
            .ok_or_else(|| malformed(self, key, "a string"))
    }

    pub fn property_f32(&self, key: &str) -> Result<f32, Diagnostic> {
        self.property(key)?
            .as_f64()
            .map(|v| v as f32)
            .ok_or_else(|| malformed(self, key, "a number"))
    }

    pub fn property_i32(&self, key: &str) -> Result<i32, Diagnostic> {
        self.property(key)?
            .as_i64()
            .and_then(|v| i32::try_from(v).ok())
            .ok_or_else(|| malformed(self, key, "a 32-bit integer"))
    }

    pub fn property_vector(&self, key: &str) -> Result<[f32; 3], Diagnostic> {
        parse_vector(self.property(key)?).ok_or_else(|| malformed(self, key, "three numbers"))
    }
}

fn parse_vector(value: &serde_json::Value) -> Option<[f32; 3]> {
    let parts = value
        .as_array()?
        .iter()
        .map(|v| v.as_f64().map(|c| c as f32))
        .collect::<Option<Vec<_>>>()?;
    <[f32; 3]>::try_from(parts).ok()
}

impl ExternalSocket {
    /// Display name; falls back to the id.
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    fn bad_value(&self, expected: &str) -> Diagnostic {
        Diagnostic::error(
            codes::E0106,
            format!("stored value of socket '{}' must be {}", self.id, expected),
        )
        .at_socket(&self.id)
    }

    fn typed_value<T>(
        &self,
        expected: &str,
        convert: impl Fn(&serde_json::Value) -> Option<T>,
    ) -> Result<Option<T>, Diagnostic> {
        match &self.value {
            None => Ok(None),
            Some(v) => convert(v).map(Some).ok_or_else(|| self.bad_value(expected)),
        }
    }

    pub fn value_f32(&self) -> Result<Option<f32>, Diagnostic> {
        self.typed_value("a number", |v| v.as_f64().map(|f| f as f32))
    }

    pub fn value_i32(&self) -> Result<Option<i32>, Diagnostic> {
        self.typed_value("a 32-bit integer", |v| {
            v.as_i64().and_then(|i| i32::try_from(i).ok())
        })
    }

    pub fn value_bool(&self) -> Result<Option<bool>, Diagnostic> {
        self.typed_value("a boolean", serde_json::Value::as_bool)
    }

    pub fn value_vector(&self) -> Result<Option<[f32; 3]>, Diagnostic> {
        self.typed_value("three numbers", parse_vector)
    }
}

// ── Graph builder ───────────────────────────────────────────────────────────

/// Destination of node inserters: the graph under construction plus the
/// external-to-internal socket map.
pub struct GraphBuilder<'a> {
    registry: &'a NodeRegistry,
    scene: Arc<dyn SceneQuery>,
    graph: DataFlowGraph,
    nodes: HashMap<String, NodeId>,
    sockets: HashMap<(String, String), AnySocket>,
}

impl<'a> GraphBuilder<'a> {
    pub fn new(registry: &'a NodeRegistry, scene: Arc<dyn SceneQuery>) -> Self {
        GraphBuilder {
            registry,
            scene,
            graph: DataFlowGraph::new(),
            nodes: HashMap::new(),
            sockets: HashMap::new(),
        }
    }

    /// Insert `node` as the counterpart of `external` and map every external
    /// socket to the internal socket at the same position.
    pub fn insert<N: Node + 'static>(
        &mut self,
        external: &ExternalNode,
        node: N,
    ) -> Result<NodeId, Diagnostic> {
        let declared = node.sockets();
        let (inputs, outputs) = (declared.inputs().len(), declared.outputs().len());
        if external.inputs.len() != inputs || external.outputs.len() != outputs {
            return Err(Diagnostic::error(
                codes::E0104,
                format!(
                    "node '{}' has {} inputs and {} outputs, but '{}' declares {} and {}",
                    external.id,
                    external.inputs.len(),
                    external.outputs.len(),
                    external.kind,
                    inputs,
                    outputs
                ),
            )
            .at_node(&external.id));
        }
        let id = self.graph.insert_node(node);
        self.nodes.insert(external.id.clone(), id);
        for (index, socket) in external.inputs.iter().enumerate() {
            self.map_socket(&external.id, &socket.id, AnySocket::input(id, index));
        }
        for (index, socket) in external.outputs.iter().enumerate() {
            self.map_socket(&external.id, &socket.id, AnySocket::output(id, index));
        }
        debug!(external = %external.id, kind = %external.kind, node = %id, "inserted node");
        Ok(id)
    }

    /// Record that external socket `socket` of node `node` is `target`.
    pub fn map_socket(&mut self, node: &str, socket: &str, target: AnySocket) {
        self.sockets
            .insert((node.to_string(), socket.to_string()), target);
    }

    pub fn socket(&self, node: &str, socket: &str) -> Option<AnySocket> {
        self.sockets
            .get(&(node.to_string(), socket.to_string()))
            .copied()
    }

    pub fn node_id(&self, external: &str) -> Option<NodeId> {
        self.nodes.get(external).copied()
    }

    /// Internal type carried by an external socket kind.
    pub fn socket_type(
        &self,
        node: &ExternalNode,
        socket: &ExternalSocket,
    ) -> Result<Arc<Type>, Diagnostic> {
        self.registry
            .socket_type(&socket.kind)
            .cloned()
            .ok_or_else(|| unsupported_socket(node, socket))
    }

    pub fn scene(&self) -> Arc<dyn SceneQuery> {
        Arc::clone(&self.scene)
    }

    pub fn graph(&self) -> &DataFlowGraph {
        &self.graph
    }

    pub fn graph_mut(&mut self) -> &mut DataFlowGraph {
        &mut self.graph
    }
}

fn unsupported_socket(node: &ExternalNode, socket: &ExternalSocket) -> Diagnostic {
    Diagnostic::error(
        codes::E0102,
        format!("unsupported socket kind '{}'", socket.kind),
    )
    .at_node(&node.id)
    .at_socket(&socket.id)
}

// ── Import ──────────────────────────────────────────────────────────────────

/// Result of a successful import.
#[derive(Debug, Clone)]
pub struct ImportedGraph {
    pub function: FunctionGraph,
    /// External node id → internal node.
    pub nodes: BTreeMap<String, NodeId>,
    pub warnings: Vec<Diagnostic>,
}

/// Import using a static scene built from the description's `objects`.
pub fn import_graph(
    description: &GraphDescription,
    registry: &NodeRegistry,
) -> Result<ImportedGraph, ImportError> {
    let scene = Arc::new(StaticScene::new(description.objects.clone()));
    import_graph_with_scene(description, registry, scene)
}

pub fn import_graph_with_scene(
    description: &GraphDescription,
    registry: &NodeRegistry,
    scene: Arc<dyn SceneQuery>,
) -> Result<ImportedGraph, ImportError> {
    let mut builder = GraphBuilder::new(registry, scene);
    let mut diagnostics = Vec::new();
    let known: HashSet<&str> = description.nodes.iter().map(|n| n.id.as_str()).collect();

    // Ids are map keys; a repeated one would shadow its first use.
    let mut seen_nodes = HashSet::new();
    let mut accepted = Vec::with_capacity(description.nodes.len());
    for node in &description.nodes {
        let fresh = seen_nodes.insert(node.id.as_str());
        if !fresh {
            diagnostics.push(
                Diagnostic::error(codes::E0107, format!("node id '{}' is used twice", node.id))
                    .at_node(&node.id),
            );
        }
        let mut seen_sockets = HashSet::new();
        let mut unique_sockets = true;
        for socket in node.inputs.iter().chain(&node.outputs) {
            if !seen_sockets.insert(socket.id.as_str()) {
                unique_sockets = false;
                diagnostics.push(
                    Diagnostic::error(
                        codes::E0107,
                        format!("socket id '{}' is used twice on node '{}'", socket.id, node.id),
                    )
                    .at_node(&node.id)
                    .at_socket(&socket.id),
                );
            }
        }
        accepted.push(fresh && unique_sockets);
    }

    for node in description.nodes.iter().zip(&accepted).filter(|(_, ok)| **ok).map(|(n, _)| n) {
        match registry.get_node_inserter(&node.kind) {
            Some(inserter) => {
                if let Err(d) = inserter(&mut builder, node) {
                    diagnostics.push(d);
                }
            }
            None => diagnostics.push(
                Diagnostic::error(
                    codes::E0101,
                    format!("unsupported node kind '{}'", node.kind),
                )
                .at_node(&node.id)
                .with_hint("the graph was exported by a newer or extended host"),
            ),
        }
    }

    // Unlinked inputs take their stored value.
    let linked: HashSet<&SocketRef> = description.links.iter().map(|l| &l.to).collect();
    let bound: HashSet<&SocketRef> = description.interface.inputs.iter().collect();
    for (node, _) in description.nodes.iter().zip(&accepted).filter(|(_, ok)| **ok) {
        if builder.node_id(&node.id).is_none() {
            continue;
        }
        for socket in &node.inputs {
            let key = SocketRef {
                node: node.id.clone(),
                socket: socket.id.clone(),
            };
            if linked.contains(&key) || bound.contains(&key) {
                continue;
            }
            let Some(inserter) = registry.get_socket_inserter(&socket.kind) else {
                diagnostics.push(unsupported_socket(node, socket));
                continue;
            };
            let origin = match inserter(&mut builder, socket) {
                Ok(origin) => origin,
                Err(d) => {
                    diagnostics.push(d.at_node(&node.id));
                    continue;
                }
            };
            if let Some(target) = builder.socket(&node.id, &socket.id) {
                if let Err(e) = builder.graph_mut().link(origin, target) {
                    diagnostics.push(rejected_link(&e.to_string(), &node.id, &socket.id));
                }
            }
        }
    }

    for link in &description.links {
        // Endpoints on nodes that failed to insert were already reported.
        let skip = |r: &SocketRef| known.contains(r.node.as_str()) && builder.node_id(&r.node).is_none();
        if skip(&link.from) || skip(&link.to) {
            continue;
        }
        let from = resolve(&builder, &link.from, &mut diagnostics);
        let to = resolve(&builder, &link.to, &mut diagnostics);
        if let (Some(from), Some(to)) = (from, to) {
            if let Err(e) = builder.graph_mut().link(from, to) {
                diagnostics.push(rejected_link(&e.to_string(), &link.to.node, &link.to.socket));
            }
        }
    }

    let inputs: Vec<Option<AnySocket>> = description
        .interface
        .inputs
        .iter()
        .map(|r| resolve(&builder, r, &mut diagnostics))
        .collect();
    let outputs: Vec<Option<AnySocket>> = description
        .interface
        .outputs
        .iter()
        .map(|r| resolve(&builder, r, &mut diagnostics))
        .collect();

    let mut seen = HashSet::new();
    for (r, socket) in description.interface.inputs.iter().zip(&inputs) {
        if let Some(socket) = socket {
            if !seen.insert(*socket) {
                diagnostics.push(
                    Diagnostic::error(
                        codes::E0103,
                        format!("interface input {}.{} is listed twice", r.node, r.socket),
                    )
                    .at_node(&r.node)
                    .at_socket(&r.socket),
                );
            }
        }
    }

    if diagnostics.iter().any(Diagnostic::is_error) {
        return Err(ImportError::Rejected { diagnostics });
    }

    let nodes: BTreeMap<String, NodeId> = description
        .nodes
        .iter()
        .filter_map(|n| builder.node_id(&n.id).map(|id| (n.id.clone(), id)))
        .collect();
    let function = FunctionGraph::new(
        builder.graph,
        inputs.into_iter().flatten().collect(),
        outputs.into_iter().flatten().collect(),
    );
    let warnings = unused_node_warnings(&function, &nodes);
    for w in &warnings {
        warn!("{}", w);
    }
    Ok(ImportedGraph {
        function,
        nodes,
        warnings,
    })
}

fn resolve(
    builder: &GraphBuilder<'_>,
    r: &SocketRef,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<AnySocket> {
    let socket = builder.socket(&r.node, &r.socket);
    if socket.is_none() {
        diagnostics.push(
            Diagnostic::error(
                codes::E0103,
                format!("unknown socket {}.{}", r.node, r.socket),
            )
            .at_node(&r.node)
            .at_socket(&r.socket),
        );
    }
    socket
}

fn rejected_link(reason: &str, node: &str, socket: &str) -> Diagnostic {
    Diagnostic::error(codes::E0105, format!("link rejected: {}", reason))
        .at_node(node)
        .at_socket(socket)
}

/// Nodes that neither feed an output nor own an interface socket.
fn unused_node_warnings(
    function: &FunctionGraph,
    nodes: &BTreeMap<String, NodeId>,
) -> Vec<Diagnostic> {
    // Graph errors surface at compile time; no warnings for such graphs.
    let Ok(live) = function.required_nodes() else {
        return Vec::new();
    };
    let mut used: HashSet<NodeId> = live.into_iter().collect();
    used.extend(function.inputs().iter().map(|s| s.node()));
    used.extend(function.outputs().iter().map(|s| s.node()));

    nodes
        .iter()
        .filter(|(_, id)| !used.contains(id))
        .map(|(external, _)| {
            Diagnostic::warning(
                codes::W0101,
                format!("node '{}' does not contribute to any output", external),
            )
            .at_node(external)
        })
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────
