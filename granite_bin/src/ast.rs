//! The statement boundary: the syntax-tree shape the external parser hands
//! to the engine. Construction and validation of these trees is the
//! parser's concern; the engine only dispatches on them.

/// Node kinds the engine dispatches on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AstNodeKind {
    CreateDb,
    DropDb,
    ShowDb,
    UseDb,
    ShowTables,
    CreateTable,
    DropTable,
    ShowIndexes,
    CreateIndex,
    DropIndex,
    ExecFile,
    Quit,
    Select,
    Insert,
    Update,
    Delete,
    Values,
}

/// A generic syntax-tree node: a kind, an optional literal value, and its
/// ordered children.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntaxNode {
    pub kind: AstNodeKind,
    pub value: Option<String>,
    pub children: Vec<SyntaxNode>,
}

impl SyntaxNode {
    pub fn new(kind: AstNodeKind) -> SyntaxNode {
        SyntaxNode {
            kind,
            value: None,
            children: Vec::new(),
        }
    }

    pub fn with_value(kind: AstNodeKind, value: impl Into<String>) -> SyntaxNode {
        SyntaxNode {
            kind,
            value: Some(value.into()),
            children: Vec::new(),
        }
    }

    pub fn push_child(&mut self, child: SyntaxNode) {
        self.children.push(child);
    }

    /// First child of the given kind, if any.
    pub fn child_of_kind(&self, kind: AstNodeKind) -> Option<&SyntaxNode> {
        self.children.iter().find(|child| child.kind == kind)
    }
}
