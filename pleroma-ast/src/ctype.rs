//! The `CType` type descriptor attached to every AST node.

use arcstr::ArcStr;
use std::fmt;

/// Primitive base type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PType {
    None,
    U8,
    I64,
    Str,
    Char,
    Bool,
    List,
    Promise,
    UserType,
    Entity,
    BaseEntity,
}

/// Distribution kind: where does a value of this type live relative to the
/// code observing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DType {
    /// in-vat
    Local,
    /// cross-vat/node
    Far,
    /// foreign native (kernel) value
    Alien,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CType {
    pub basetype: PType,
    pub dtype: DType,
    pub subtype: Option<Box<CType>>,
    pub entity_name: Option<ArcStr>,
}

impl CType {
    pub fn new(basetype: PType, dtype: DType) -> Self {
        Self { basetype, dtype, subtype: None, entity_name: None }
    }

    pub fn none() -> Self {
        Self::new(PType::None, DType::Local)
    }

    pub fn u8() -> Self {
        Self::new(PType::U8, DType::Local)
    }

    pub fn i64() -> Self {
        Self::new(PType::I64, DType::Local)
    }

    pub fn str() -> Self {
        Self::new(PType::Str, DType::Local)
    }

    pub fn char() -> Self {
        Self::new(PType::Char, DType::Local)
    }

    pub fn bool() -> Self {
        Self::new(PType::Bool, DType::Local)
    }

    pub fn list(elt: CType) -> Self {
        Self { subtype: Some(Box::new(elt)), ..Self::new(PType::List, DType::Local) }
    }

    pub fn promise(elt: CType) -> Self {
        Self { subtype: Some(Box::new(elt)), ..Self::new(PType::Promise, DType::Local) }
    }

    pub fn entity(name: impl Into<ArcStr>, dtype: DType) -> Self {
        Self {
            entity_name: Some(name.into()),
            ..Self::new(PType::Entity, dtype)
        }
    }

    pub fn base_entity(dtype: DType) -> Self {
        Self::new(PType::BaseEntity, dtype)
    }

    fn is_complex(&self) -> bool {
        matches!(self.basetype, PType::List | PType::Promise | PType::UserType)
    }
}

impl fmt::Display for CType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.entity_name {
            Some(n) => write!(f, "{:?}<{n}>", self.basetype),
            None => write!(f, "{:?}", self.basetype),
        }?;
        if let Some(s) = &self.subtype {
            write!(f, "[{s}]")?;
        }
        Ok(())
    }
}

/// Structural, recursive type equality used throughout the type solver.
///
/// `BaseEntity` matches any entity type (it is the "any actor" supertype).
/// Distribution kinds must agree where both sides specify one other than
/// through the `BaseEntity` escape hatch.
pub fn exact_match(a: &CType, b: &CType) -> bool {
    if a.basetype == PType::BaseEntity && b.basetype == PType::Entity {
        return true;
    }
    if b.basetype == PType::BaseEntity && a.basetype == PType::Entity {
        return true;
    }
    if a.basetype != b.basetype {
        return false;
    }
    if a.dtype != b.dtype {
        return false;
    }
    if a.is_complex() || b.is_complex() {
        return match (&a.subtype, &b.subtype) {
            (Some(sa), Some(sb)) => exact_match(sa, sb),
            (None, None) => true,
            _ => false,
        };
    }
    if a.basetype == PType::Entity {
        return a.entity_name == b.entity_name;
    }
    true
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn reflexive() {
        let t = CType::list(CType::i64());
        assert!(exact_match(&t, &t));
    }

    #[test]
    fn symmetric() {
        let a = CType::str();
        let b = CType::i64();
        assert_eq!(exact_match(&a, &b), exact_match(&b, &a));
    }

    #[test]
    fn transitive() {
        let a = CType::list(CType::i64());
        let b = CType::list(CType::i64());
        let c = CType::list(CType::i64());
        assert!(exact_match(&a, &b) && exact_match(&b, &c) && exact_match(&a, &c));
    }

    #[test]
    fn base_entity_matches_any_entity() {
        let base = CType::base_entity(DType::Far);
        let greeter = CType::entity("Greeter", DType::Far);
        assert!(exact_match(&base, &greeter));
        assert!(exact_match(&greeter, &base));
    }

    #[test]
    fn distinct_entities_do_not_match() {
        let a = CType::entity("Greeter", DType::Far);
        let b = CType::entity("Io", DType::Far);
        assert!(!exact_match(&a, &b));
    }
}
