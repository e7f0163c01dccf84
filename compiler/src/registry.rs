// registry.rs — Node and socket kind registry
//
// Maps identifiers of the external graph format to inserter callbacks. Node
// inserters construct an internal node, add it to the graph under
// construction and map its sockets back to external ids. Socket inserters
// materialize the stored value of an unlinked external input as a node.
//
// Preconditions: registration happens before any import; the registry is
// read-only afterwards and can be shared across threads.
// Postconditions: each kind id maps to at most one inserter.
// Failure modes: duplicate registration → `ConfigError`. Unknown kinds are an
//                absent lookup result, reported by the importer.
// Side effects: none.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::diag::{codes, Diagnostic};
use crate::error::ConfigError;
use crate::graph::{AnySocket, SocketInfo};
use crate::import::{ExternalNode, ExternalSocket, GraphBuilder};
use crate::node::Node;
use crate::nodes::{
    cosine_node, object_location_node, power_node, sine_node, vector_length_node,
    CombineVectorNode, ConstantNode, ConstantValue, FunctionInputNode, FunctionOutputNode,
    MathNode, MathOp, PassThroughNode, SeparateVectorNode, VectorMathNode, VectorOp,
};
use crate::types::{CoreTypes, Type};

// ── Callback types ──────────────────────────────────────────────────────────

/// Inserts the internal counterpart of one external node.
pub type NodeInserter =
    Arc<dyn Fn(&mut GraphBuilder<'_>, &ExternalNode) -> Result<(), Diagnostic> + Send + Sync>;

/// Inserts a node producing the stored value of an unlinked external input
/// and returns the output socket to link from.
pub type SocketInserter = Arc<
    dyn Fn(&mut GraphBuilder<'_>, &ExternalSocket) -> Result<AnySocket, Diagnostic> + Send + Sync,
>;

// ── Registry ────────────────────────────────────────────────────────────────

/// Node and socket kinds known to the importer.
#[derive(Default, Clone)]
pub struct NodeRegistry {
    node_inserters: BTreeMap<String, NodeInserter>,
    socket_inserters: BTreeMap<String, SocketInserter>,
    socket_types: BTreeMap<String, Arc<Type>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_node_inserter<F>(&mut self, kind: &str, inserter: F) -> Result<(), ConfigError>
    where
        F: Fn(&mut GraphBuilder<'_>, &ExternalNode) -> Result<(), Diagnostic> + Send + Sync + 'static,
    {
        if self.node_inserters.contains_key(kind) {
            return Err(ConfigError::DuplicateNodeKind(kind.to_string()));
        }
        self.node_inserters.insert(kind.to_string(), Arc::new(inserter));
        Ok(())
    }

    pub fn register_socket_inserter<F>(
        &mut self,
        kind: &str,
        inserter: F,
    ) -> Result<(), ConfigError>
    where
        F: Fn(&mut GraphBuilder<'_>, &ExternalSocket) -> Result<AnySocket, Diagnostic>
            + Send
            + Sync
            + 'static,
    {
        if self.socket_inserters.contains_key(kind) {
            return Err(ConfigError::DuplicateSocketKind(kind.to_string()));
        }
        self.socket_inserters.insert(kind.to_string(), Arc::new(inserter));
        Ok(())
    }

    /// Declare the internal type carried by an external socket kind.
    pub fn register_socket_type(&mut self, kind: &str, ty: &Arc<Type>) -> Result<(), ConfigError> {
        if self.socket_types.contains_key(kind) {
            return Err(ConfigError::DuplicateSocketKind(kind.to_string()));
        }
        self.socket_types.insert(kind.to_string(), Arc::clone(ty));
        Ok(())
    }

    /// Register a node kind whose construction takes no external data: the
    /// node is built, inserted, and its sockets mapped in declared order.
    pub fn register_simple_node<F, N>(&mut self, kind: &str, factory: F) -> Result<(), ConfigError>
    where
        F: Fn() -> N + Send + Sync + 'static,
        N: Node + 'static,
    {
        self.register_node_inserter(kind, move |builder, external| {
            builder.insert(external, factory()).map(|_| ())
        })
    }

    pub fn get_node_inserter(&self, kind: &str) -> Option<NodeInserter> {
        self.node_inserters.get(kind).cloned()
    }

    pub fn get_socket_inserter(&self, kind: &str) -> Option<SocketInserter> {
        self.socket_inserters.get(kind).cloned()
    }

    pub fn socket_type(&self, kind: &str) -> Option<&Arc<Type>> {
        self.socket_types.get(kind)
    }

    /// Registered node kinds, sorted.
    pub fn node_kinds(&self) -> Vec<&str> {
        self.node_inserters.keys().map(String::as_str).collect()
    }

    /// Registered socket kinds, sorted.
    pub fn socket_kinds(&self) -> Vec<&str> {
        self.socket_inserters.keys().map(String::as_str).collect()
    }

    /// Compact JSON of every registered kind. Stable across runs, used for
    /// provenance fingerprints.
    pub fn canonical_json(&self) -> String {
        let socket_types: BTreeMap<&str, &str> = self
            .socket_types
            .iter()
            .map(|(kind, ty)| (kind.as_str(), ty.name()))
            .collect();
        serde_json::json!({
            "node_kinds": self.node_kinds(),
            "socket_kinds": self.socket_kinds(),
            "socket_types": socket_types,
        })
        .to_string()
    }
}

impl fmt::Debug for NodeRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeRegistry")
            .field("node_kinds", &self.node_kinds())
            .field("socket_kinds", &self.socket_kinds())
            .finish()
    }
}

// ── Built-in kinds ──────────────────────────────────────────────────────────

/// Register the built-in node and socket kinds.
pub fn register_builtins(registry: &mut NodeRegistry, types: &CoreTypes) -> Result<(), ConfigError> {
    register_socket_kinds(registry, types)?;

    registry.register_node_inserter("fn_FunctionInputNode", |builder, external| {
        let outputs = interface_sockets(builder, external, &external.outputs)?;
        builder.insert(external, FunctionInputNode::new(outputs)).map(|_| ())
    })?;
    registry.register_node_inserter("fn_FunctionOutputNode", |builder, external| {
        let inputs = interface_sockets(builder, external, &external.inputs)?;
        builder.insert(external, FunctionOutputNode::new(inputs)).map(|_| ())
    })?;

    let t = types.clone();
    registry.register_node_inserter("fn_FloatMathNode", move |builder, external| {
        let name = external.property_str("operation")?;
        let op = MathOp::parse(name).ok_or_else(|| {
            Diagnostic::error(codes::E0106, format!("unknown math operation '{}'", name))
                .at_node(&external.id)
                .with_hint("expected one of ADD, SUBTRACT, MULTIPLY, DIVIDE, MINIMUM, MAXIMUM")
        })?;
        builder.insert(external, MathNode::new(&t, op)).map(|_| ())
    })?;
    for (kind, op) in [
        ("fn_AddFloatsNode", MathOp::Add),
        ("fn_MultiplyFloatsNode", MathOp::Multiply),
    ] {
        let t = types.clone();
        registry.register_simple_node(kind, move || MathNode::new(&t, op))?;
    }

    let t = types.clone();
    registry.register_simple_node("fn_CombineVectorNode", move || CombineVectorNode::new(&t))?;
    let t = types.clone();
    registry.register_simple_node("fn_SeparateVectorNode", move || SeparateVectorNode::new(&t))?;
    for (kind, op) in [
        ("fn_AddVectorsNode", VectorOp::Add),
        ("fn_ScaleVectorNode", VectorOp::Scale),
    ] {
        let t = types.clone();
        registry.register_simple_node(kind, move || VectorMathNode::new(&t, op))?;
    }

    let t = types.clone();
    registry.register_node_inserter("fn_FloatValueNode", move |builder, external| {
        let value = external.property_f32("value")?;
        builder.insert(external, ConstantNode::float(&t, value)).map(|_| ())
    })?;
    let t = types.clone();
    registry.register_node_inserter("fn_IntegerValueNode", move |builder, external| {
        let value = external.property_i32("value")?;
        let node = ConstantNode::new(&t, ConstantValue::Int32(value));
        builder.insert(external, node).map(|_| ())
    })?;
    let t = types.clone();
    registry.register_node_inserter("fn_VectorValueNode", move |builder, external| {
        let value = external.property_vector("value")?;
        builder.insert(external, ConstantNode::vector(&t, value)).map(|_| ())
    })?;

    let t = types.clone();
    registry.register_simple_node("fn_SineNode", move || sine_node(&t))?;
    let t = types.clone();
    registry.register_simple_node("fn_CosineNode", move || cosine_node(&t))?;
    let t = types.clone();
    registry.register_simple_node("fn_PowerNode", move || power_node(&t))?;
    let t = types.clone();
    registry.register_simple_node("fn_VectorLengthNode", move || vector_length_node(&t))?;

    let t = types.clone();
    registry.register_node_inserter("fn_ObjectLocationNode", move |builder, external| {
        let object = external.property_str("object")?;
        let node = object_location_node(&t, builder.scene(), object);
        builder.insert(external, node).map(|_| ())
    })?;

    registry.register_node_inserter("fn_RerouteNode", |builder, external| {
        let socket = external.inputs.first().ok_or_else(|| {
            Diagnostic::error(codes::E0104, "reroute node needs one input socket")
                .at_node(&external.id)
        })?;
        let ty = builder.socket_type(external, socket)?;
        builder.insert(external, PassThroughNode::new(&ty)).map(|_| ())
    })?;

    Ok(())
}

fn register_socket_kinds(registry: &mut NodeRegistry, types: &CoreTypes) -> Result<(), ConfigError> {
    registry.register_socket_type("fn_FloatSocket", &types.float)?;
    registry.register_socket_type("fn_IntegerSocket", &types.int32)?;
    registry.register_socket_type("fn_VectorSocket", &types.vector)?;
    registry.register_socket_type("fn_BooleanSocket", &types.boolean)?;

    let t = types.clone();
    registry.register_socket_inserter("fn_FloatSocket", move |builder, socket| {
        let value = socket.value_f32()?.unwrap_or(0.0);
        Ok(insert_constant(builder, ConstantNode::float(&t, value)))
    })?;
    let t = types.clone();
    registry.register_socket_inserter("fn_IntegerSocket", move |builder, socket| {
        let value = socket.value_i32()?.unwrap_or(0);
        Ok(insert_constant(builder, ConstantNode::new(&t, ConstantValue::Int32(value))))
    })?;
    let t = types.clone();
    registry.register_socket_inserter("fn_VectorSocket", move |builder, socket| {
        let value = socket.value_vector()?.unwrap_or([0.0; 3]);
        Ok(insert_constant(builder, ConstantNode::vector(&t, value)))
    })?;
    let t = types.clone();
    registry.register_socket_inserter("fn_BooleanSocket", move |builder, socket| {
        let value = socket.value_bool()?.unwrap_or(false);
        Ok(insert_constant(builder, ConstantNode::new(&t, ConstantValue::Bool(value))))
    })?;
    Ok(())
}

fn insert_constant(builder: &mut GraphBuilder<'_>, node: ConstantNode) -> AnySocket {
    let id = builder.graph_mut().insert_node(node);
    AnySocket::output(id, 0)
}

fn interface_sockets(
    builder: &GraphBuilder<'_>,
    external: &ExternalNode,
    sockets: &[ExternalSocket],
) -> Result<Vec<SocketInfo>, Diagnostic> {
    sockets
        .iter()
        .map(|socket| {
            let ty = builder.socket_type(external, socket)?;
            Ok::<_, Diagnostic>(SocketInfo::new(socket.name(), &ty))
        })
        .collect()
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::TypeRegistry;

    fn builtins() -> NodeRegistry {
        let types = CoreTypes::from_registry(&TypeRegistry::with_builtins()).unwrap();
        let mut registry = NodeRegistry::new();
        register_builtins(&mut registry, &types).unwrap();
        registry
    }

    #[test]
    fn builtin_kinds_are_registered() {
        let registry = builtins();
        for kind in [
            "fn_FunctionInputNode",
            "fn_FunctionOutputNode",
            "fn_FloatMathNode",
            "fn_AddFloatsNode",
            "fn_CombineVectorNode",
            "fn_ObjectLocationNode",
            "fn_RerouteNode",
        ] {
            assert!(registry.get_node_inserter(kind).is_some(), "{kind}");
        }
        assert_eq!(
            registry.socket_kinds(),
            vec![
                "fn_BooleanSocket",
                "fn_FloatSocket",
                "fn_IntegerSocket",
                "fn_VectorSocket"
            ]
        );
    }

    #[test]
    fn unknown_kind_is_absent() {
        let registry = builtins();
        assert!(registry.get_node_inserter("fn_NoSuchNode").is_none());
        assert!(registry.get_socket_inserter("fn_NoSuchSocket").is_none());
        assert!(registry.socket_type("fn_NoSuchSocket").is_none());
    }

    #[test]
    fn duplicate_node_kind_is_config_error() {
        let mut registry = builtins();
        let err = registry
            .register_node_inserter("fn_SineNode", |_, _| Ok(()))
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateNodeKind("fn_SineNode".into()));
    }

    #[test]
    fn duplicate_socket_kind_is_config_error() {
        let mut registry = builtins();
        let err = registry
            .register_socket_inserter("fn_FloatSocket", |_, _| {
                Err(Diagnostic::error(codes::E0102, "unused"))
            })
            .unwrap_err();
        assert_eq!(err, ConfigError::DuplicateSocketKind("fn_FloatSocket".into()));
    }

    #[test]
    fn builtins_cannot_register_twice() {
        let types = CoreTypes::from_registry(&TypeRegistry::with_builtins()).unwrap();
        let mut registry = builtins();
        assert!(register_builtins(&mut registry, &types).is_err());
    }

    #[test]
    fn canonical_json_is_sorted_and_compact() {
        let mut registry = NodeRegistry::new();
        registry.register_node_inserter("b", |_, _| Ok(())).unwrap();
        registry.register_node_inserter("a", |_, _| Ok(())).unwrap();
        assert_eq!(
            registry.canonical_json(),
            r#"{"node_kinds":["a","b"],"socket_kinds":[],"socket_types":{}}"#
        );
    }
}
