//! The seam between the pure evaluator and a concrete scheduler.
//!
//! [`VatRt`] is implemented once, concretely, by the vat scheduler in
//! `pleroma-rt`. It is a trait object (`&mut dyn VatRt`) rather than a
//! generic parameter because `AstNode` must stay a single concrete type
//! (spec §3) — a generic `Rt` parameter here would force the AST itself
//! to become generic over it, which the wire format and the kernel's
//! native function table both forbid.

use crate::{
    address::EntityAddress,
    ast::{AstNode, EntityDef},
    ids::{CallbackId, PromiseId},
    msg::Msg,
};
use arcstr::ArcStr;
use fxhash::FxHashMap;
use std::rc::Rc;
use triomphe::Arc;

/// A live actor: its definition, its address, its mutable data fields and
/// the top-level scope its methods close over.
pub struct Entity {
    pub def: Arc<EntityDef>,
    pub address: EntityAddress,
    pub data: FxHashMap<ArcStr, AstNode>,
    pub file_scope: Rc<crate::scope::Scope>,
}

/// The body and captured environment of an async reply handler, stashed
/// here rather than inside the `AstNode` sent over the wire so that
/// `AstNode` can stay `Send + Sync` (spec §4.1, `PromiseRes` carries only
/// a `CallbackId`).
pub struct PendingCallback {
    pub param: ArcStr,
    pub body: Vec<AstNode>,
    pub env: Rc<crate::scope::Scope>,
}

/// Everything `eval` needs from its host vat, named by what the
/// evaluator does rather than how the vat does it: allocate an id,
/// look up an entity, enqueue an outbound message.
pub trait VatRt {
    fn address(&self) -> EntityAddress;

    fn alloc_promise_id(&mut self) -> PromiseId;
    fn alloc_entity_id(&mut self) -> u64;
    fn alloc_callback_id(&mut self) -> CallbackId;

    fn entity(&self, id: u64) -> Option<&Entity>;
    fn entity_mut(&mut self, id: u64) -> Option<&mut Entity>;
    fn insert_entity(&mut self, entity: Entity);

    fn register_callback(&mut self, id: CallbackId, cb: PendingCallback);
    fn take_callback(&mut self, id: CallbackId) -> Option<PendingCallback>;

    /// Record that `id` is outstanding, with an optional reply callback
    /// to run when it resolves.
    fn register_promise(&mut self, id: PromiseId, callback: Option<CallbackId>);

    /// Hand a message to the scheduler for delivery; same-vat, cross-vat
    /// and cross-node routing are all the scheduler's concern, not the
    /// evaluator's.
    fn enqueue_outbound(&mut self, msg: Msg);

    /// Resolve a kernel module name (`"Io"`, `"Net"`, ...) to its loaded
    /// entity definition.
    fn kernel_entity(&self, module_name: &str) -> Option<Arc<EntityDef>>;

    /// Resolve a well-known system entity (e.g. the Monad) to its address,
    /// lazily instantiating it on first reference.
    fn system_entity_ref(&mut self, name: &str) -> Result<EntityAddress, crate::error::RtError>;

    /// Dial a peer node's transport address, returning the node id
    /// assigned to it. Backs the `Net.dial` kernel builtin.
    fn transport_dial(&mut self, host: &str, port: u16) -> Result<u64, crate::error::RtError>;

    /// This node's own listening port. Backs `Net.local_port`.
    fn transport_local_port(&self) -> u16;

    /// Count of programs running on this node, starting at 1 for the
    /// Monad itself. Backs `Monad.n-programs`.
    fn n_running_programs(&self) -> u64;

    /// Count a newly-started program against the node total, returning
    /// the new count. Backs `Monad.start-program`, which sends `main(0)`
    /// to an already-existing entity rather than spawning a vat for it.
    fn bump_running_programs(&mut self) -> u64;

    fn log_error(&self, msg: &str);
}

/// Per-call evaluation state: which entity is executing, in what lexical
/// scope, against which runtime.
pub struct EvalContext<'a> {
    pub rt: &'a mut dyn VatRt,
    pub entity_id: u64,
    pub scope: Rc<crate::scope::Scope>,
}

impl<'a> EvalContext<'a> {
    pub fn new(rt: &'a mut dyn VatRt, entity_id: u64, scope: Rc<crate::scope::Scope>) -> Self {
        Self { rt, entity_id, scope }
    }

    pub fn child_scope(&self) -> Rc<crate::scope::Scope> {
        crate::scope::Scope::child(&self.scope)
    }
}
