//! AST, value model, type solver and evaluator for the pleroma actor
//! language (spec components 1, 2 and 4).
//!
//! This crate is pure: no threads, no sockets, no clocks. `eval` reaches
//! every side effect it needs (message enqueueing, entity creation,
//! promise bookkeeping) through the [`vatrt::VatRt`] trait, which is the
//! seam a concrete scheduler (`pleroma-rt`) implements. Kernel builtins
//! (`pleroma-kernel`) are ordinary [`ast::FuncStmt`]s with a native
//! function pointer and depend on nothing but this crate.
#[macro_use]
extern crate serde_derive;

pub mod address;
pub mod ast;
pub mod ctype;
pub mod error;
pub mod eval;
pub mod ids;
pub mod msg;
pub mod scope;
pub mod typesolve;
pub mod vatrt;

pub use address::EntityAddress;
pub use ast::{AstKind, AstNode, CommMode, EntityDef, FuncStmt, Module, ThenClause};
pub use ctype::{exact_match, CType, DType, PType};
pub use error::{RtError, TypesolverError};
pub use ids::{CallbackId, PromiseId};
pub use msg::{Msg, PromiseResult, SystemModule};
pub use scope::Scope;
pub use vatrt::{Entity, EvalContext, PendingCallback, VatRt};
