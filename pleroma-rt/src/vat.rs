//! A vat: one OS thread, one single-threaded message loop (spec §5).
//!
//! Every vat runs its own `std::thread`, never a tokio task. `Rc`/`RefCell`
//! inside `pleroma_ast::Scope` depends on this: a `Scope` never needs to
//! be `Send` because it never leaves the thread that created it. Only
//! [`Msg`] values cross the channel into and out of a vat.

use crate::{node::Node, router::RouterHandle};
use fxhash::FxHashMap;
use log::{error, warn};
use parking_lot::Mutex;
use pleroma_ast::{
    address::{EntityAddress, IdCounter},
    ast::EntityDef,
    eval,
    ids::{CallbackId, PromiseId},
    msg::{Msg, PromiseResult},
    vatrt::{Entity, PendingCallback, VatRt},
    RtError,
};
use std::{
    sync::mpsc::{self, Receiver, Sender},
    sync::{Arc as StdArc, Weak},
    thread::JoinHandle,
};
use triomphe::Arc;

/// Commands a vat's own thread consumes from its inbound queue.
pub enum VatCmd {
    Deliver(Msg),
    /// Instantiate `def` as `entity_id` in this vat, then invoke
    /// `function_name` on it. Used by `Node::start_program` to boot a
    /// fresh program's entrypoint entity.
    Start {
        def: Arc<EntityDef>,
        entity_id: u64,
        function_name: arcstr::ArcStr,
        args: Vec<pleroma_ast::AstNode>,
    },
    Shutdown,
}

/// A lightweight, cloneable reference to a running vat. Dropping every
/// handle does not stop the vat; send [`VatCmd::Shutdown`] for that.
#[derive(Clone)]
pub struct VatHandle {
    pub vat_id: u64,
    tx: Sender<VatCmd>,
}

impl VatHandle {
    pub fn send(&self, cmd: VatCmd) {
        if self.tx.send(cmd).is_err() {
            error!("vat {} is gone, dropping command", self.vat_id);
        }
    }
}

/// Shared sink every vat's `VatRt::enqueue_outbound` writes into. A
/// single dispatcher thread in `Node` reads from the matching receiver
/// and decides same-node-different-vat (direct handoff) from
/// cross-node (handed to the router).
pub type OutboundSink = Sender<Msg>;

pub struct Vat {
    address: EntityAddress,
    entities: FxHashMap<u64, Entity>,
    promises: FxHashMap<PromiseId, PromiseResult>,
    callbacks: FxHashMap<CallbackId, PendingCallback>,
    entity_ids: IdCounter,
    promise_ids: IdCounter,
    callback_ids: IdCounter,
    kernel_entities: StdArc<Mutex<FxHashMap<String, Arc<EntityDef>>>>,
    system_entities: FxHashMap<String, EntityAddress>,
    outbound: OutboundSink,
    router: RouterHandle,
    peer_ids: StdArc<Mutex<IdCounter>>,
    /// Back-reference to the owning node, used only to reach
    /// `Monad.start-program` and `Monad.n-programs`. `Weak` so the node
    /// and its vats don't keep each other alive.
    node: Weak<Node>,
}

impl Vat {
    fn new(
        address: EntityAddress,
        kernel_entities: StdArc<Mutex<FxHashMap<String, Arc<EntityDef>>>>,
        outbound: OutboundSink,
        router: RouterHandle,
        peer_ids: StdArc<Mutex<IdCounter>>,
        node: Weak<Node>,
    ) -> Self {
        Self {
            address,
            entities: FxHashMap::default(),
            promises: FxHashMap::default(),
            callbacks: FxHashMap::default(),
            entity_ids: IdCounter::new(1),
            promise_ids: IdCounter::new(1),
            callback_ids: IdCounter::new(1),
            kernel_entities,
            system_entities: FxHashMap::default(),
            outbound,
            router,
            peer_ids,
            node,
        }
    }

    fn handle(&mut self, cmd: VatCmd) {
        match cmd {
            VatCmd::Deliver(msg) => self.deliver(msg),
            VatCmd::Start { def, entity_id, function_name, args } => {
                self.create_entity(def, entity_id);
                self.invoke(entity_id, &function_name, args)
            }
            VatCmd::Shutdown => unreachable!("handled by caller"),
        }
    }

    /// Build an [`Entity`] from its definition, evaluating each declared
    /// data field's initializer expression in the entity's own fresh file
    /// scope, then register it under `entity_id`.
    fn create_entity(&mut self, def: Arc<EntityDef>, entity_id: u64) {
        let address = EntityAddress::new(self.address.node_id, self.address.vat_id, entity_id);
        let file_scope = pleroma_ast::Scope::root();
        let mut data = FxHashMap::default();
        for (name, init) in &def.data_fields {
            let mut ctx = pleroma_ast::vatrt::EvalContext::new(self, entity_id, file_scope.clone());
            match eval::eval(&mut ctx, init) {
                Ok(v) => {
                    data.insert(name.clone(), v);
                }
                Err(e) => error!("failed to initialize field `{name}` on `{}`: {e}", def.name),
            }
        }
        self.insert_entity(Entity { def, address, data, file_scope });
    }

    fn invoke(&mut self, entity_id: u64, function_name: &str, args: Vec<pleroma_ast::AstNode>) {
        let Some(entity) = self.entities.get(&entity_id) else {
            error!("invoke on unknown entity {entity_id}");
            return;
        };
        let Some(func) = entity.def.functions.get(function_name).cloned() else {
            error!("entity {} has no function `{function_name}`", entity.def.name);
            return;
        };
        let scope = pleroma_ast::Scope::child(&entity.file_scope);
        scope.bind_here(
            "self".into(),
            pleroma_ast::AstNode::entity_ref(entity.address, entity.def.name.clone()),
        );
        let result = if let Some(native) = func.native {
            let mut ctx = pleroma_ast::vatrt::EvalContext::new(self, entity_id, scope);
            native(&mut ctx, &args)
        } else {
            for (p, v) in func.params.iter().zip(args) {
                scope.bind_here(p.clone(), v);
            }
            let mut ctx = pleroma_ast::vatrt::EvalContext::new(self, entity_id, scope);
            eval::eval_block(&mut ctx, &func.body)
        };
        if let Err(e) = result {
            error!("entrypoint `{function_name}` on entity {entity_id} failed: {e}");
        }
    }

    /// A reply completes a promise and, if one was registered, runs its
    /// callback body in a fresh scope chained off the callback's captured
    /// environment; a call invokes the target entity's method and sends
    /// a reply back to `msg.src`, whichever vat or node that is.
    fn deliver(&mut self, msg: Msg) {
        if msg.response {
            self.resolve_promise(msg);
            return;
        }
        let reply = match self.run_call(&msg) {
            Ok(result) => msg.reply_ok(result),
            Err(e) => msg.reply_err(e.to_string()),
        };
        self.enqueue_outbound(reply);
    }

    fn run_call(&mut self, msg: &Msg) -> Result<pleroma_ast::AstNode, RtError> {
        let entity_id = msg.dst.entity_id;
        let entity = self
            .entities
            .get(&entity_id)
            .ok_or(RtError::EntityNotFound { entity_id })?;
        let func = entity
            .def
            .functions
            .get(&msg.function_name)
            .cloned()
            .ok_or_else(|| RtError::MethodNotFound {
                entity_name: entity.def.name.clone(),
                method: msg.function_name.clone(),
            })?;
        let scope = pleroma_ast::Scope::child(&entity.file_scope);
        scope.bind_here("self".into(), pleroma_ast::AstNode::entity_ref(msg.dst, entity.def.name.clone()));
        for (p, v) in func.params.iter().zip(msg.values.iter().cloned()) {
            scope.bind_here(p.clone(), v);
        }
        let mut ctx = pleroma_ast::vatrt::EvalContext::new(self, entity_id, scope);
        if let Some(native) = func.native {
            native(&mut ctx, &msg.values)
        } else {
            eval::eval_block(&mut ctx, &func.body)
        }
    }

    fn resolve_promise(&mut self, msg: Msg) {
        let Some(state) = self.promises.get_mut(&msg.promise_id) else {
            warn!("reply for unknown promise {}", msg.promise_id);
            return;
        };
        let err = msg.response_err.clone();
        state.resolve(msg.values.clone(), err.clone());
        let callback = state.callback;
        if let Some(cb_id) = callback {
            if let Some(cb) = self.callbacks.remove(&cb_id) {
                let scope = pleroma_ast::Scope::child(&cb.env);
                let value = msg.values.into_iter().next().unwrap_or_else(pleroma_ast::AstNode::none);
                scope.bind_here(cb.param, value);
                let mut ctx = pleroma_ast::vatrt::EvalContext::new(self, msg.dst.entity_id, scope);
                if let Err(e) = eval::eval_block(&mut ctx, &cb.body) {
                    error!("promise callback failed: {e}");
                }
            }
        }
    }
}

impl VatRt for Vat {
    fn address(&self) -> EntityAddress {
        self.address
    }

    fn alloc_promise_id(&mut self) -> PromiseId {
        PromiseId(self.promise_ids.next())
    }

    fn alloc_entity_id(&mut self) -> u64 {
        self.entity_ids.next()
    }

    fn alloc_callback_id(&mut self) -> CallbackId {
        CallbackId(self.callback_ids.next())
    }

    fn entity(&self, id: u64) -> Option<&Entity> {
        self.entities.get(&id)
    }

    fn entity_mut(&mut self, id: u64) -> Option<&mut Entity> {
        self.entities.get_mut(&id)
    }

    fn insert_entity(&mut self, entity: Entity) {
        self.entities.insert(entity.address.entity_id, entity);
    }

    fn register_callback(&mut self, id: CallbackId, cb: PendingCallback) {
        self.callbacks.insert(id, cb);
    }

    fn take_callback(&mut self, id: CallbackId) -> Option<PendingCallback> {
        self.callbacks.remove(&id)
    }

    fn register_promise(&mut self, id: PromiseId, callback: Option<CallbackId>) {
        self.promises.insert(id, PromiseResult::pending(callback));
    }

    fn enqueue_outbound(&mut self, msg: Msg) {
        if self.outbound.send(msg).is_err() {
            error!("node dispatcher is gone, message dropped");
        }
    }

    fn kernel_entity(&self, module_name: &str) -> Option<Arc<EntityDef>> {
        self.kernel_entities.lock().get(module_name).cloned()
    }

    fn system_entity_ref(&mut self, name: &str) -> Result<EntityAddress, RtError> {
        if let Some(addr) = self.system_entities.get(name) {
            return Ok(*addr);
        }
        let def = self
            .kernel_entity(name)
            .ok_or_else(|| RtError::EntityNotFound { entity_id: 0 })?;
        let entity_id = self.alloc_entity_id();
        let address = EntityAddress::new(self.address.node_id, self.address.vat_id, entity_id);
        self.insert_entity(Entity {
            def,
            address,
            data: FxHashMap::default(),
            file_scope: pleroma_ast::Scope::root(),
        });
        self.system_entities.insert(name.to_string(), address);
        Ok(address)
    }

    fn transport_dial(&mut self, host: &str, port: u16) -> Result<u64, RtError> {
        let addr: std::net::SocketAddr = format!("{host}:{port}")
            .parse()
            .map_err(|_| RtError::TransportFailed(format!("invalid address {host}:{port}").into()))?;
        let node_id = self.peer_ids.lock().next();
        self.router.dial(addr, node_id);
        Ok(node_id)
    }

    fn transport_local_port(&self) -> u16 {
        self.router.local_port()
    }

    fn n_running_programs(&self) -> u64 {
        self.node.upgrade().map(|n| n.n_running_programs()).unwrap_or(0)
    }

    fn bump_running_programs(&mut self) -> u64 {
        self.node.upgrade().map(|n| n.bump_running_programs()).unwrap_or(0)
    }

    fn log_error(&self, msg: &str) {
        error!("[vat {}] {msg}", self.address);
    }
}

/// Spawn a vat's thread. Returns a handle to send it commands and the
/// `JoinHandle` so the owning `Node` can wait for clean shutdown.
pub fn spawn_vat(
    address: EntityAddress,
    kernel_entities: StdArc<Mutex<FxHashMap<String, Arc<EntityDef>>>>,
    outbound: OutboundSink,
    router: RouterHandle,
    peer_ids: StdArc<Mutex<IdCounter>>,
    node: Weak<Node>,
) -> (VatHandle, JoinHandle<()>) {
    let (tx, rx): (Sender<VatCmd>, Receiver<VatCmd>) = mpsc::channel();
    let handle = VatHandle { vat_id: address.vat_id, tx };
    let join = std::thread::Builder::new()
        .name(format!("vat-{}", address.vat_id))
        .spawn(move || {
            let mut vat = Vat::new(address, kernel_entities, outbound, router, peer_ids, node);
            for cmd in rx {
                if matches!(cmd, VatCmd::Shutdown) {
                    break;
                }
                vat.handle(cmd);
            }
        })
        .expect("failed to spawn vat thread");
    (handle, join)
}
