//! Resolved abstract syntax tree.
//!
//! The middle-end receives this tree fully name- and type-resolved: every
//! identifier carries a symbol reference, every expression an attached type
//! (plus a coercion chain where the front-end inserted implicit
//! conversions), and every block the list of its locals with destructor
//! descriptors. Nodes share a header of kind, source range, children and
//! parent; the kind tag carries the per-kind payload.

use crate::symbols::{DeinitId, FuncId, LocalId, Location, SymbolRef, TableId};
use crate::types::Type;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub u32);

impl NodeId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceRange {
    pub start_line: u32,
    pub start_column: u32,
    pub end_line: u32,
    pub end_column: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    BitAnd,
    BitOr,
    BitXor,
    Shl,
    Shr,
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Gt | BinaryOp::Lt | BinaryOp::Ge | BinaryOp::Le
        )
    }

    pub fn is_logical(self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

/// Record of an ownership transfer out of a destructible value, attached to
/// the moving expression by the front-end.
#[derive(Debug, Clone, Copy)]
pub struct MoveInfo {
    pub deinit: DeinitId,
}

/// Resolution results attached to expression nodes.
#[derive(Debug, Clone, Default)]
pub struct ExprInfo {
    /// The expression's final static type.
    pub ty: Option<Type>,
    /// Implicit conversion chain, outermost first; index 0 is the final
    /// type, the last entry the expression's own type. Empty when no
    /// coercion applies.
    pub coercion_chain: Vec<Type>,
    /// Resolved l-value path for identifier/dot/index syntax.
    pub location: Option<Location>,
    /// Overloaded operator implementation for struct operands.
    pub operator_func: Option<FuncId>,
    /// Resolved symbol for plain identifiers.
    pub symbol: Option<SymbolRef>,
    /// Set when evaluating this expression transfers ownership.
    pub moves: Option<MoveInfo>,
}

#[derive(Debug, Clone)]
pub enum NodeKind {
    // Literals
    IntLiteral(i128),
    FloatLiteral(f64),
    CharLiteral(String),
    StringLiteral(String),
    True,
    False,
    Null,
    NoneLiteral,
    SelfLiteral,

    // Composite literals; children are the elements.
    ArrayLiteral,
    MapLiteral,
    MapEntry,
    TupleLiteral,
    /// Children: field values in declaration order; a `Skipped` child leaves
    /// the field uninitialized.
    StructLiteral,
    Skipped,

    // Operators
    Binary(BinaryOp),
    Neg,
    Not,
    AddressOf,
    Deref,

    // Resolved names
    Identifier(String),
    Dot,
    Index,
    /// Children: callee location, then arguments.
    Call,
    /// Child 0 is the source expression; the node's type is the target.
    Cast,
    /// Lifted closure body; the payload is the function symbol the body was
    /// attached to.
    Closure(FuncId),
    /// `start..end` in a `for` header.
    Range,
    /// Compile-time query already reduced by the front-end where possible;
    /// `sizeof` survives to lowering because it needs the data layout.
    SizeOf(Type),

    // Statements
    Block(BlockInfo),
    /// Child 0: initializer (optional). Payload: the declared local.
    VarDecl(LocalId),
    /// Child 0: target location expression, child 1: value.
    Assign,
    /// Compound assignment desugars to load-op-store of one location.
    CompoundAssign(BinaryOp),
    IfChain,
    /// Children: condition, block.
    If,
    ElseIf,
    /// Child: block.
    Else,
    /// Children: scrutinee, then the cases.
    Switch,
    /// Children: bound-variable name, case type expression, block.
    SwitchCase,
    SwitchDefault,
    /// Children: condition, block.
    While,
    /// Children: loop variable, iterable or range, block.
    For {
        by_ref: bool,
    },
    Break,
    Continue,
    /// Optional child: return value.
    Return,
    /// Children: the `try` cases.
    Try,
    /// Children: bound variable, value expression, block.
    TrySuccess,
    /// Children: bound variable, block.
    TryError,
    /// Child: block.
    TryElse,
    /// Payload: the function symbol this definition belongs to.
    FunctionDef(FuncId),
    StructDef,
    UnionDef,
    EnumDef,
    ProtoDef,
}

/// Payload of a block node.
#[derive(Debug, Clone)]
pub struct BlockInfo {
    pub table: TableId,
    /// Destructible values owned by this block, outermost first.
    pub deinits: Vec<DeinitId>,
}

#[derive(Debug)]
pub struct AstNode {
    pub kind: NodeKind,
    pub range: SourceRange,
    pub children: Vec<NodeId>,
    pub parent: Option<NodeId>,
    pub expr: ExprInfo,
}

/// Arena of AST nodes for one compilation unit.
#[derive(Default)]
pub struct Ast {
    nodes: Vec<AstNode>,
}

impl Ast {
    pub fn new() -> Ast {
        Ast::default()
    }

    pub fn add(&mut self, kind: NodeKind) -> NodeId {
        self.nodes.push(AstNode {
            kind,
            range: SourceRange::default(),
            children: Vec::new(),
            parent: None,
            expr: ExprInfo::default(),
        });
        NodeId((self.nodes.len() - 1) as u32)
    }

    pub fn node(&self, id: NodeId) -> &AstNode {
        &self.nodes[id.index()]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut AstNode {
        &mut self.nodes[id.index()]
    }

    pub fn append_child(&mut self, parent: NodeId, child: NodeId) {
        self.nodes[parent.index()].children.push(child);
        self.nodes[child.index()].parent = Some(parent);
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self.node(id).children
    }

    pub fn child(&self, id: NodeId, index: usize) -> NodeId {
        self.node(id).children[index]
    }

    /// The expression's static type; panics if resolution never attached
    /// one, which is a front-end contract violation.
    pub fn ty(&self, id: NodeId) -> &Type {
        self.node(id)
            .expr
            .ty
            .as_ref()
            .expect("expression without resolved type")
    }

    pub fn is_ancestor_of(&self, ancestor: NodeId, node: NodeId) -> bool {
        let mut cur = Some(node);

        while let Some(id) = cur {
            if id == ancestor {
                return true;
            }
            cur = self.node(id).parent;
        }

        false
    }

    /// Deep-copies the subtree rooted at `node`, applying a type
    /// substitution to every attached type. Used by generic instantiation.
    pub fn clone_subtree(&mut self, node: NodeId, args: &[Type]) -> NodeId {
        let source = &self.nodes[node.index()];
        let kind = source.kind.clone();
        let range = source.range;
        let children = source.children.clone();
        let mut expr = source.expr.clone();

        expr.ty = expr.ty.map(|ty| ty.substitute(args));
        expr.coercion_chain = expr
            .coercion_chain
            .iter()
            .map(|ty| ty.substitute(args))
            .collect();

        let clone = self.add(kind);
        self.nodes[clone.index()].range = range;
        self.nodes[clone.index()].expr = expr;

        for child in children {
            let child_clone = self.clone_subtree(child, args);
            self.append_child(clone, child_clone);
        }

        clone
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimitiveType;

    #[test]
    fn ancestry_follows_parent_links() {
        let mut ast = Ast::new();
        let root = ast.add(NodeKind::IfChain);
        let branch = ast.add(NodeKind::If);
        let condition = ast.add(NodeKind::True);

        ast.append_child(root, branch);
        ast.append_child(branch, condition);

        assert!(ast.is_ancestor_of(root, condition));
        assert!(ast.is_ancestor_of(branch, condition));
        assert!(!ast.is_ancestor_of(condition, root));
    }

    #[test]
    fn clone_subtree_substitutes_types() {
        let mut ast = Ast::new();
        let parent = ast.add(NodeKind::Call);
        let child = ast.add(NodeKind::Identifier("x".to_string()));
        ast.node_mut(child).expr.ty = Some(Type::Generic(0));
        ast.append_child(parent, child);

        let clone = ast.clone_subtree(parent, &[Type::Primitive(PrimitiveType::I32)]);
        let cloned_child = ast.child(clone, 0);

        assert_eq!(
            ast.ty(cloned_child),
            &Type::Primitive(PrimitiveType::I32)
        );
        // The original stays generic.
        assert_eq!(ast.ty(child), &Type::Generic(0));
    }
}
