// diag.rs — Import diagnostics
//
// Graph import reports every problem it finds instead of stopping at the
// first one. Unsupported node or socket kinds are version or plugin
// mismatches between the exporter and the current registrations, so they are
// user-facing reports, not crashes.
//
// Preconditions: none (types only).
// Postconditions: none (types only).
// Failure modes: none.
// Side effects: none.

use std::fmt;

// ── Diagnostic code ──────────────────────────────────────────────────────

/// A stable diagnostic code (e.g., `E0101`, `W0101`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DiagCode(pub &'static str);

impl fmt::Display for DiagCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub mod codes {
    use super::DiagCode;

    /// No inserter is registered for a node kind.
    pub const E0101: DiagCode = DiagCode("E0101");
    /// No inserter is registered for the kind of an unlinked input socket.
    pub const E0102: DiagCode = DiagCode("E0102");
    /// A link or interface entry names a socket that was never mapped.
    pub const E0103: DiagCode = DiagCode("E0103");
    /// External and internal socket counts disagree.
    pub const E0104: DiagCode = DiagCode("E0104");
    /// A link was rejected by the internal graph.
    pub const E0105: DiagCode = DiagCode("E0105");
    /// A node property is missing or malformed.
    pub const E0106: DiagCode = DiagCode("E0106");
    /// A node id, or a socket id within one node, is used twice.
    pub const E0107: DiagCode = DiagCode("E0107");
    /// A node does not contribute to any interface output.
    pub const W0101: DiagCode = DiagCode("W0101");
}

// ── Severity level ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagLevel {
    Error,
    Warning,
}

// ── Diagnostic ───────────────────────────────────────────────────────────

/// One import problem, anchored to an external node and optionally a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Diagnostic {
    pub code: Option<DiagCode>,
    pub level: DiagLevel,
    pub message: String,
    pub node: Option<String>,
    pub socket: Option<String>,
    pub hint: Option<String>,
}

impl Diagnostic {
    pub fn new(level: DiagLevel, message: impl Into<String>) -> Self {
        Self {
            code: None,
            level,
            message: message.into(),
            node: None,
            socket: None,
            hint: None,
        }
    }

    pub fn error(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Error, message).with_code(code)
    }

    pub fn warning(code: DiagCode, message: impl Into<String>) -> Self {
        Self::new(DiagLevel::Warning, message).with_code(code)
    }

    pub fn with_code(mut self, code: DiagCode) -> Self {
        self.code = Some(code);
        self
    }

    /// Anchor the diagnostic to an external node id.
    pub fn at_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }

    /// Anchor the diagnostic to an external socket id.
    pub fn at_socket(mut self, socket: impl Into<String>) -> Self {
        self.socket = Some(socket.into());
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    pub fn is_error(&self) -> bool {
        self.level == DiagLevel::Error
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.level {
            DiagLevel::Error => "error",
            DiagLevel::Warning => "warning",
        };
        if let Some(code) = &self.code {
            write!(f, "{}[{}]: {}", level, code, self.message)?;
        } else {
            write!(f, "{}: {}", level, self.message)?;
        }
        match (&self.node, &self.socket) {
            (Some(node), Some(socket)) => write!(f, " (at {}.{})", node, socket)?,
            (Some(node), None) => write!(f, " (at {})", node)?,
            _ => {}
        }
        if let Some(hint) = &self.hint {
            write!(f, "\n  hint: {}", hint)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_without_code() {
        let d = Diagnostic::new(DiagLevel::Error, "something failed");
        assert_eq!(format!("{d}"), "error: something failed");
    }

    #[test]
    fn display_with_code_and_anchor() {
        let d = Diagnostic::error(codes::E0101, "unsupported node kind 'fn_Foo'")
            .at_node("node_3");
        assert_eq!(
            format!("{d}"),
            "error[E0101]: unsupported node kind 'fn_Foo' (at node_3)"
        );
    }

    #[test]
    fn builder_chain() {
        let d = Diagnostic::warning(codes::W0101, "node is unused")
            .at_node("n")
            .at_socket("s")
            .with_hint("remove the node");
        assert!(!d.is_error());
        assert_eq!(d.code, Some(codes::W0101));
        assert_eq!(d.hint.as_deref(), Some("remove the node"));
        assert_eq!(
            format!("{d}"),
            "warning[W0101]: node is unused (at n.s)\n  hint: remove the node"
        );
    }
}
