//! Entity addressing.
//!
//! An [`EntityAddress`] is a plain `(node_id, vat_id, entity_id)` triple.
//! It names an entity without owning it: entities may hold arbitrarily
//! many addresses forming cycles, but because an address is just three
//! integers there is never an ownership cycle to break.

use std::fmt;

/// The local node always has id zero.
pub const LOCAL_NODE: u64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityAddress {
    pub node_id: u64,
    pub vat_id: u64,
    pub entity_id: u64,
}

impl EntityAddress {
    pub fn new(node_id: u64, vat_id: u64, entity_id: u64) -> Self {
        Self { node_id, vat_id, entity_id }
    }

    pub fn is_local(&self) -> bool {
        self.node_id == LOCAL_NODE
    }
}

impl fmt::Display for EntityAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.node_id, self.vat_id, self.entity_id)
    }
}

/// A monotonic counter used to allocate ids within a parent scope (a node
/// allocates vat ids, a vat allocates entity ids and promise ids).
#[derive(Debug, Default)]
pub struct IdCounter(u64);

impl IdCounter {
    pub fn new(base: u64) -> Self {
        Self(base)
    }

    pub fn next(&mut self) -> u64 {
        let id = self.0;
        self.0 += 1;
        id
    }
}
