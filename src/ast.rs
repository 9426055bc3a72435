//! The parser's output tree (spec.md §3 "AST Node").
//!
//! Nodes live in a single arena owned by [`Tree`]; children are referenced by
//! [`NodeId`] index rather than by pointer, so the whole tree is freed as one
//! unit when the `Tree` drops and no node outlives its arena.

/// An index into a [`Tree`]'s node arena.
pub type NodeId = usize;

#[derive(Debug, Clone, PartialEq)]
pub enum Literal {
    Int(i64),
    Num(f64),
    Str(Vec<u8>),
    Bool(bool),
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixOp {
    BoolNot,
    Try,
    Neg,
    Pos,
    BitNot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InfixOp {
    Add,
    Sub,
    Mul,
    Div,
    DivFloor,
    Mod,
    Pow,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Lt,
    LtEq,
    Gt,
    GtEq,
    Eq,
    NotEq,
    In,
    And,
    Or,
    Range,
    Assign,
    AddAssign,
    SubAssign,
    MulAssign,
    PowAssign,
    DivAssign,
    DivFloorAssign,
    ModAssign,
    ShlAssign,
    ShrAssign,
    BitAndAssign,
    BitOrAssign,
    BitXorAssign,
}

impl InfixOp {
    /// Whether this operator assigns into its left-hand side, i.e. the
    /// left-hand side must parse as an lvalue (identifier, index, or member).
    pub fn is_assignment(self) -> bool {
        matches!(
            self,
            InfixOp::Assign
                | InfixOp::AddAssign
                | InfixOp::SubAssign
                | InfixOp::MulAssign
                | InfixOp::PowAssign
                | InfixOp::DivAssign
                | InfixOp::DivFloorAssign
                | InfixOp::ModAssign
                | InfixOp::ShlAssign
                | InfixOp::ShrAssign
                | InfixOp::BitAndAssign
                | InfixOp::BitOrAssign
                | InfixOp::BitXorAssign
        )
    }

    /// The plain binary operator a compound assignment applies before storing
    /// the result, e.g. `+=` performs `Add` then assigns.
    pub fn underlying(self) -> Option<InfixOp> {
        Some(match self {
            InfixOp::AddAssign => InfixOp::Add,
            InfixOp::SubAssign => InfixOp::Sub,
            InfixOp::MulAssign => InfixOp::Mul,
            InfixOp::PowAssign => InfixOp::Pow,
            InfixOp::DivAssign => InfixOp::Div,
            InfixOp::DivFloorAssign => InfixOp::DivFloor,
            InfixOp::ModAssign => InfixOp::Mod,
            InfixOp::ShlAssign => InfixOp::Shl,
            InfixOp::ShrAssign => InfixOp::Shr,
            InfixOp::BitAndAssign => InfixOp::BitAnd,
            InfixOp::BitOrAssign => InfixOp::BitOr,
            InfixOp::BitXorAssign => InfixOp::BitXor,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeOp {
    Is,
    As,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggregateKind {
    List,
    Tuple,
    Map,
    Block,
}

/// A destructuring pattern (spec.md §4.2 "Patterns (`unwrap`)"). Recursive
/// through `Box` rather than the node arena: patterns are small, bounded in
/// depth by source nesting, and never need arena-wide sharing.
#[derive(Debug, Clone, PartialEq)]
pub enum Pattern {
    Ident(String),
    Discard,
    Tuple(Vec<Pattern>),
    List(Vec<Pattern>),
    Map(Vec<(Option<String>, Pattern)>),
    Error(Box<Pattern>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct MapItem {
    pub key: Option<NodeId>,
    pub value: NodeId,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MatchCase {
    CatchAll(NodeId),
    Let(Pattern, NodeId),
    Values(Vec<NodeId>, NodeId),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Jump {
    Return(Option<NodeId>),
    Break(Option<NodeId>),
    Continue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Literal(Literal),
    Ident(String),
    Discard,
    Prefix {
        op: PrefixOp,
        rhs: NodeId,
    },
    Infix {
        op: InfixOp,
        lhs: NodeId,
        rhs: NodeId,
    },
    TypeInfix {
        op: TypeOp,
        lhs: NodeId,
        type_name: String,
    },
    Index {
        target: NodeId,
        index: NodeId,
    },
    Call {
        target: NodeId,
        args: Vec<NodeId>,
    },
    Member {
        target: NodeId,
        name: String,
    },
    Grouped(NodeId),
    Aggregate {
        kind: AggregateKind,
        items: Vec<NodeId>,
    },
    MapItem(MapItem),
    Let {
        pattern: Pattern,
        value: NodeId,
    },
    Fn {
        name: Option<String>,
        params: Vec<Pattern>,
        body: NodeId,
    },
    Unwrap(Pattern),
    If {
        /// An optional `let pattern =` header: `cond` is destructured into
        /// this pattern rather than only tested for truthiness.
        binding: Option<Pattern>,
        cond: NodeId,
        body: NodeId,
        else_branch: Option<NodeId>,
    },
    While {
        binding: Option<Pattern>,
        cond: NodeId,
        body: NodeId,
    },
    For {
        pattern: Pattern,
        iterable: NodeId,
        body: NodeId,
    },
    Match {
        scrutinee: NodeId,
        cases: Vec<MatchCase>,
    },
    Catch {
        lhs: NodeId,
        binding: Option<Pattern>,
        rhs: NodeId,
    },
    Jump(Jump),
    Import {
        path: Vec<u8>,
    },
    Error(NodeId),
}

/// The arena-allocated tree produced by the parser. Immutable after parsing.
#[derive(Debug, Default, Clone)]
pub struct Tree {
    nodes: Vec<Node>,
    /// Byte offset of each node's first token, parallel to `nodes`, used to
    /// re-attach diagnostics to source positions during compilation.
    offsets: Vec<usize>,
    /// Top-level statements in source order.
    pub statements: Vec<NodeId>,
}

impl Tree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, node: Node, offset: usize) -> NodeId {
        self.nodes.push(node);
        self.offsets.push(offset);
        self.nodes.len() - 1
    }

    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id]
    }

    pub fn offset(&self, id: NodeId) -> usize {
        self.offsets[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_assigns_increasing_ids() {
        let mut tree = Tree::new();
        let a = tree.push(Node::Literal(Literal::Int(1)), 0);
        let b = tree.push(Node::Literal(Literal::Int(2)), 4);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        assert_eq!(tree.offset(b), 4);
        assert_eq!(tree.get(a), &Node::Literal(Literal::Int(1)));
    }

    #[test]
    fn compound_assign_has_underlying_operator() {
        assert_eq!(InfixOp::AddAssign.underlying(), Some(InfixOp::Add));
        assert!(InfixOp::AddAssign.is_assignment());
        assert_eq!(InfixOp::Add.underlying(), None);
        assert!(!InfixOp::Add.is_assignment());
    }
}
