//! Lexical scope chain.
//!
//! A [`Scope`] is a singly linked chain of frames. A global scope holds
//! top-level bindings; invoking a function pushes a fresh child frame
//! whose parent is the entity's file scope, so symbol lookup that falls
//! off the end of the local call chain lands in the entity's captured
//! top-level environment for free.

use crate::ast::AstNode;
use arcstr::ArcStr;
use fxhash::FxHashMap;
use std::{cell::RefCell, rc::Rc};

#[derive(Debug)]
pub struct Scope {
    pub parent: Option<Rc<Scope>>,
    table: RefCell<FxHashMap<ArcStr, AstNode>>,
}

impl Scope {
    pub fn root() -> Rc<Scope> {
        Rc::new(Scope { parent: None, table: RefCell::new(FxHashMap::default()) })
    }

    pub fn child(parent: &Rc<Scope>) -> Rc<Scope> {
        Rc::new(Scope {
            parent: Some(Rc::clone(parent)),
            table: RefCell::new(FxHashMap::default()),
        })
    }

    /// Bind `name` in this frame specifically (scope-kind `Local`).
    pub fn bind_here(&self, name: ArcStr, value: AstNode) {
        self.table.borrow_mut().insert(name, value);
    }

    /// Walk from this frame up through parents, returning the innermost
    /// binding for `name`.
    pub fn get(&self, name: &str) -> Option<AstNode> {
        if let Some(v) = self.table.borrow().get(name) {
            return Some(v.clone());
        }
        self.parent.as_ref().and_then(|p| p.get(name))
    }

    /// True if `name` is already bound in this exact frame (used by the
    /// type solver and the evaluator to decide whether an assignment is a
    /// rebind of an existing local or a fresh declaration).
    pub fn bound_here(&self, name: &str) -> bool {
        self.table.borrow().contains_key(name)
    }
}
