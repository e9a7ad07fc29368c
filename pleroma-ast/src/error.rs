//! The error taxonomy from spec §7.
//!
//! `TokenizerError`/`ParseError` are kept as opaque pass-through variants:
//! this crate never constructs them (tokenizing and parsing are external
//! collaborators per the scope boundary), but downstream code that does
//! own a tokenizer/parser has a slot to report into the same enum.

use arcstr::ArcStr;
use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum RtError {
    TokenizerError(ArcStr),
    ParseError(ArcStr),
    TypesolverError(ArcStr),
    UnresolvedSymbol(ArcStr),
    TypeMismatch { expected: ArcStr, found: ArcStr },
    DivisionByZero,
    IntegerOverflow,
    EntityNotFound { entity_id: u64 },
    MethodNotFound { entity_name: ArcStr, method: ArcStr },
    TransportFailed(ArcStr),
}

impl fmt::Display for RtError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::TokenizerError(m) => write!(f, "tokenizer error: {m}"),
            Self::ParseError(m) => write!(f, "parse error: {m}"),
            Self::TypesolverError(m) => write!(f, "type error: {m}"),
            Self::UnresolvedSymbol(s) => write!(f, "unresolved symbol `{s}`"),
            Self::TypeMismatch { expected, found } => {
                write!(f, "type mismatch: expected {expected}, found {found}")
            }
            Self::DivisionByZero => write!(f, "division by zero"),
            Self::IntegerOverflow => write!(f, "integer overflow"),
            Self::EntityNotFound { entity_id } => {
                write!(f, "entity {entity_id} not found")
            }
            Self::MethodNotFound { entity_name, method } => {
                write!(f, "method `{method}` not found on entity `{entity_name}`")
            }
            Self::TransportFailed(m) => write!(f, "transport failed: {m}"),
        }
    }
}

impl std::error::Error for RtError {}

/// A single type-solver finding. Several of these accumulate per `solve`
/// call; their presence is the precondition the evaluator assumes never
/// holds once it starts running.
#[derive(Debug, Clone, PartialEq)]
pub struct TypesolverError {
    pub message: ArcStr,
    pub function: Option<ArcStr>,
    pub expected: Option<ArcStr>,
    pub found: Option<ArcStr>,
}

impl fmt::Display for TypesolverError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(func) = &self.function {
            write!(f, " (in `{func}`)")?;
        }
        if let (Some(e), Some(g)) = (&self.expected, &self.found) {
            write!(f, ": expected {e}, found {g}")?;
        }
        Ok(())
    }
}

impl std::error::Error for TypesolverError {}
