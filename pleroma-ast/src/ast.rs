//! The AST & value model (spec §3, §4.1).
//!
//! `AstNode` is the single sum type shared by the parser (external
//! collaborator), the type solver and the evaluator. Every node carries
//! its own `CType`; constructors below are the only supported way to
//! build one, and each fills in a sensible default `ctype` so callers
//! never have to hand-assemble one for a literal.

use crate::{
    ctype::{CType, DType, PType},
    error::RtError,
    ids::{CallbackId, PromiseId},
    vatrt::EvalContext,
};
use arcstr::ArcStr;
use fxhash::FxHashMap;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use triomphe::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnOp {
    Neg,
    Not,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

/// `Sync` is only legal same-vat; `Async` is always legal and always
/// allocates exactly one promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommMode {
    Sync,
    Async,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Pattern {
    Wildcard,
    Literal(AstNode),
    Bind(ArcStr),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchArm {
    pub pattern: Pattern,
    pub body: AstNode,
}

/// The reply handler attached to an async send by a `.then(param) { ... }`
/// suffix in source (spec §9: "a `then` chain becomes a `PromiseRes` node
/// whose callback is evaluated when the result arrives"). Stashed on the
/// `MessageSend` node itself rather than modeled as a separate AST
/// variant, since grammar shape is the parser's concern and this is the
/// only extra information the evaluator needs from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThenClause {
    pub param: ArcStr,
    pub body: Vec<AstNode>,
}

/// A function pointer invoked identically whether it backs a user method
/// or a kernel builtin (spec §9: "native_ptr to unify user and kernel
/// methods behind one call rule"). Plain `fn`, not a closure: kernel
/// builtins reach whatever state they need through `ctx.rt`.
pub type NativeFn = fn(&mut EvalContext<'_>, &[AstNode]) -> Result<AstNode, RtError>;

pub struct FuncStmt {
    pub name: ArcStr,
    pub params: Vec<ArcStr>,
    pub param_types: Vec<CType>,
    pub body: Vec<AstNode>,
    pub return_type: CType,
    pub native: Option<NativeFn>,
}

impl std::fmt::Debug for FuncStmt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FuncStmt")
            .field("name", &self.name)
            .field("native", &self.native.is_some())
            .finish()
    }
}

impl PartialEq for FuncStmt {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Serialize for FuncStmt {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        // function definitions never cross the wire; only `EntityRef`s do.
        s.serialize_str(&self.name)
    }
}

impl<'de> Deserialize<'de> for FuncStmt {
    fn deserialize<D: serde::Deserializer<'de>>(_d: D) -> Result<Self, D::Error> {
        Err(serde::de::Error::custom("FuncStmt cannot be deserialized"))
    }
}

pub struct EntityDef {
    pub name: ArcStr,
    pub functions: FxHashMap<ArcStr, Arc<FuncStmt>>,
    /// declared data fields and their initial value expressions
    pub data_fields: FxHashMap<ArcStr, AstNode>,
    pub children: Vec<Arc<EntityDef>>,
}

impl std::fmt::Debug for EntityDef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EntityDef").field("name", &self.name).finish()
    }
}

impl PartialEq for EntityDef {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Serialize for EntityDef {
    fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.name)
    }
}

impl<'de> Deserialize<'de> for EntityDef {
    fn deserialize<D: serde::Deserializer<'de>>(_d: D) -> Result<Self, D::Error> {
        Err(serde::de::Error::custom("EntityDef cannot be deserialized"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AstKind {
    // -- Values --
    Number(i64),
    Str(ArcStr),
    Char(u32),
    Bool(bool),
    List(Vec<AstNode>),
    EntityRef(crate::address::EntityAddress),
    PromiseRes(PromiseId, Option<CallbackId>),
    None,

    // -- Expressions --
    Symbol(ArcStr),
    BinOp(BinOp, AstNode, AstNode),
    UnOp(UnOp, AstNode),
    Compare(CompareOp, AstNode, AstNode),
    Index(AstNode, AstNode),
    FieldAccess(AstNode, ArcStr),
    Call(AstNode, Vec<AstNode>),
    MessageSend {
        target: AstNode,
        mode: CommMode,
        method: ArcStr,
        args: Vec<AstNode>,
        then: Option<ThenClause>,
    },
    Match(AstNode, Vec<MatchArm>),

    // -- Statements --
    Assignment {
        sym: ArcStr,
        value: AstNode,
        kind: DType,
    },
    Return(AstNode),
    For {
        sym: ArcStr,
        iterable: AstNode,
        body: Vec<AstNode>,
    },
    While {
        cond: AstNode,
        body: Vec<AstNode>,
    },
    Fallthrough,

    // -- Declarations --
    FuncStmt(Arc<FuncStmt>),
    EntityDef(Arc<EntityDef>),
    Import {
        path: ArcStr,
        alias: ArcStr,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AstNode {
    pub kind: Box<AstKind>,
    pub ctype: CType,
}

impl AstNode {
    pub fn new(kind: AstKind, ctype: CType) -> Self {
        Self { kind: Box::new(kind), ctype }
    }

    pub fn number(n: i64) -> Self {
        Self::new(AstKind::Number(n), CType::i64())
    }

    pub fn string(s: impl Into<ArcStr>) -> Self {
        Self::new(AstKind::Str(s.into()), CType::str())
    }

    pub fn char(c: u32) -> Self {
        Self::new(AstKind::Char(c), CType::char())
    }

    pub fn bool(b: bool) -> Self {
        Self::new(AstKind::Bool(b), CType::bool())
    }

    pub fn none() -> Self {
        Self::new(AstKind::None, CType::none())
    }

    /// Well-formed-children contract: every element of the list must share
    /// `elt_type`.
    pub fn list(items: Vec<AstNode>, elt_type: CType) -> Self {
        Self::new(AstKind::List(items), CType::list(elt_type))
    }

    pub fn entity_ref(addr: crate::address::EntityAddress, entity_name: impl Into<ArcStr>) -> Self {
        Self::new(AstKind::EntityRef(addr), CType::entity(entity_name, DType::Far))
    }

    pub fn promise(id: PromiseId, callback: Option<CallbackId>, result_type: CType) -> Self {
        Self::new(AstKind::PromiseRes(id, callback), CType::promise(result_type))
    }

    pub fn is_none(&self) -> bool {
        matches!(&*self.kind, AstKind::None)
    }

    pub fn as_number(&self) -> Option<i64> {
        match &*self.kind {
            AstKind::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&ArcStr> {
        match &*self.kind {
            AstKind::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match &*self.kind {
            AstKind::Bool(b) => Some(*b),
            _ => None,
        }
    }
}

/// A program unit: free functions, entity definitions and a resolved
/// import table (alias -> module), exactly what `record_top_types` walks
/// recursively (spec §4.2).
#[derive(Debug, Default)]
pub struct Module {
    pub name: ArcStr,
    pub imports: FxHashMap<ArcStr, Arc<Module>>,
    pub entities: FxHashMap<ArcStr, Arc<EntityDef>>,
    pub functions: FxHashMap<ArcStr, Arc<FuncStmt>>,
}
