// dot.rs — Graphviz DOT output for data-flow graphs
//
// Renders nodes as record-shaped vertices (inputs on the left, outputs on
// the right) and links as port-to-port edges, with nodes and edges sorted so
// the text is deterministic.
//
// Preconditions: none.
// Postconditions: returns a valid DOT string representing the graph.
// Failure modes: none (pure string formatting).
// Side effects: none.

use std::collections::HashSet;
use std::fmt::Write;

use crate::graph::{DataFlowGraph, FunctionGraph, Link};
use crate::id::NodeId;

/// Emit the whole graph as a Graphviz DOT string.
pub fn emit_dot(graph: &DataFlowGraph) -> String {
    render(graph, None)
}

/// Emit a function graph. Interface sockets are marked and nodes that do
/// not feed any output are drawn dashed and gray.
pub fn emit_function_dot(function: &FunctionGraph) -> String {
    let live: Option<HashSet<NodeId>> = function
        .required_nodes()
        .ok()
        .map(|nodes| nodes.into_iter().collect());
    render(function.graph(), Some((function, live)))
}

fn render(graph: &DataFlowGraph, function: Option<(&FunctionGraph, Option<HashSet<NodeId>>)>) -> String {
    let mut buf = String::new();
    writeln!(buf, "digraph fgc {{").unwrap();
    writeln!(buf, "    rankdir=LR;").unwrap();
    writeln!(buf, "    node [shape=record, fontname=\"Helvetica\", fontsize=10];").unwrap();
    writeln!(buf, "    edge [fontname=\"Helvetica\", fontsize=9];").unwrap();

    for (id, node) in graph.nodes() {
        let inputs: Vec<String> = node
            .sockets()
            .inputs()
            .iter()
            .enumerate()
            .map(|(i, s)| format!("<i{}> {}", i, escape(&s.name)))
            .collect();
        let outputs: Vec<String> = node
            .sockets()
            .outputs()
            .iter()
            .enumerate()
            .map(|(i, s)| format!("<o{}> {}", i, escape(&s.name)))
            .collect();
        let label = format!(
            "{{{{{}}}|{}|{{{}}}}}",
            inputs.join("|"),
            escape(node.name()),
            outputs.join("|")
        );
        let dead = matches!(&function, Some((_, Some(live))) if !live.contains(&id));
        let style = if dead {
            ", style=dashed, color=gray60, fontcolor=gray60"
        } else {
            ""
        };
        writeln!(buf, "    {} [label=\"{}\"{}];", id, label, style).unwrap();
    }

    let mut links: Vec<&Link> = graph.links().iter().collect();
    links.sort_by_key(|l| (l.from, l.to));
    if !links.is_empty() {
        writeln!(buf).unwrap();
    }
    for link in links {
        writeln!(
            buf,
            "    {}:o{} -> {}:i{};",
            link.from.node(),
            link.from.index(),
            link.to.node(),
            link.to.index()
        )
        .unwrap();
    }

    if let Some((function, _)) = function {
        writeln!(buf).unwrap();
        for (i, socket) in function.inputs().iter().enumerate() {
            writeln!(buf, "    arg{} [shape=plaintext, label=\"arg {}\"];", i, i).unwrap();
            let port = if socket.is_input() { "i" } else { "o" };
            writeln!(buf, "    arg{} -> {}:{}{} [style=dotted];", i, socket.node(), port, socket.index()).unwrap();
        }
        for (i, socket) in function.outputs().iter().enumerate() {
            writeln!(buf, "    ret{} [shape=plaintext, label=\"ret {}\"];", i, i).unwrap();
            let port = if socket.is_input() { "i" } else { "o" };
            writeln!(buf, "    {}:{}{} -> ret{} [style=dotted];", socket.node(), port, socket.index(), i).unwrap();
        }
    }

    writeln!(buf, "}}").unwrap();
    buf
}

/// Escape characters with meaning inside record labels.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '{' | '}' | '|' | '<' | '>' | '"' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}
