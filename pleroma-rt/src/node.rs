//! Node bootstrap: wires vats and the router together into one process
//! (spec §6).

use crate::{
    router::{self, RouterHandle},
    vat::{self, OutboundSink, VatCmd, VatHandle},
};
use anyhow::{Context, Result};
use derive_builder::Builder;
use fxhash::FxHashMap;
use log::info;
use parking_lot::Mutex;
use pleroma_ast::{
    address::{EntityAddress, IdCounter, LOCAL_NODE},
    ast::{AstKind, AstNode, EntityDef, Module},
    ctype::CType,
    error::TypesolverError,
    typesolve,
};
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        mpsc, Arc, Weak,
    },
};
use triomphe::Arc as TArc;

/// The TCP port the original ENet transport listens on by default.
pub const DEFAULT_PORT: u16 = 1234;

#[derive(Builder, Debug, Clone)]
#[builder(pattern = "owned")]
pub struct NodeConfig {
    /// 0 lets the OS choose a port; `DEFAULT_PORT` matches the original
    /// transport's default.
    #[builder(default = "DEFAULT_PORT")]
    pub bind_port: u16,
    #[builder(default = "LOCAL_NODE")]
    pub node_id: u64,
}

impl NodeConfig {
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }
}

struct Dispatch {
    node_id: u64,
    vats: Arc<Mutex<FxHashMap<u64, VatHandle>>>,
    router: RouterHandle,
}

impl Dispatch {
    fn route(&self, msg: pleroma_ast::msg::Msg) {
        if msg.dst.node_id == self.node_id {
            match self.vats.lock().get(&msg.dst.vat_id) {
                Some(vat) => vat.send(VatCmd::Deliver(msg)),
                None => log::error!("no local vat {}", msg.dst.vat_id),
            }
        } else {
            self.router.send(msg);
        }
    }
}

/// A running node: some number of vats, a router, and the kernel entity
/// definitions every vat can instantiate by name.
pub struct Node {
    config: NodeConfig,
    vats: Arc<Mutex<FxHashMap<u64, VatHandle>>>,
    joins: Mutex<Vec<std::thread::JoinHandle<()>>>,
    vat_ids: Mutex<IdCounter>,
    peer_ids: Arc<Mutex<IdCounter>>,
    kernel_entities: Arc<Mutex<FxHashMap<String, TArc<EntityDef>>>>,
    outbound_tx: mpsc::Sender<pleroma_ast::msg::Msg>,
    router: RouterHandle,
    /// "Always 1, because we count the Monad": the kernel's singleton
    /// Monad entity counts as the first running program the instant the
    /// node boots, before any user program starts.
    n_running_programs: Arc<AtomicU64>,
}

impl Node {
    pub fn start(config: NodeConfig) -> Result<Arc<Node>> {
        let vats: Arc<Mutex<FxHashMap<u64, VatHandle>>> = Arc::new(Mutex::new(FxHashMap::default()));
        let kernel_entities = Arc::new(Mutex::new(FxHashMap::default()));
        let (outbound_tx, outbound_rx) = mpsc::channel();

        let dispatch_vats = Arc::clone(&vats);
        let router_vats = Arc::clone(&vats);
        let node_id = config.node_id;

        let (router, router_join) = router::spawn_router(config.bind_port, move |msg| {
            if msg.dst.node_id == node_id {
                match router_vats.lock().get(&msg.dst.vat_id) {
                    Some(vat) => vat.send(VatCmd::Deliver(msg)),
                    None => log::error!("no local vat {} for inbound message", msg.dst.vat_id),
                }
            } else {
                log::warn!("dropping misrouted message for node {}", msg.dst.node_id);
            }
        })
        .context("failed to start router")?;

        let dispatch = Dispatch { node_id, vats: dispatch_vats, router: router.clone() };
        let dispatcher_join = std::thread::Builder::new()
            .name("pleroma-dispatch".into())
            .spawn(move || {
                for msg in outbound_rx {
                    dispatch.route(msg);
                }
            })
            .context("failed to spawn dispatcher thread")?;

        let node = Node {
            config,
            vats,
            joins: Mutex::new(vec![router_join, dispatcher_join]),
            vat_ids: Mutex::new(IdCounter::new(1)),
            peer_ids: Arc::new(Mutex::new(IdCounter::new(1))),
            kernel_entities,
            outbound_tx,
            router,
            n_running_programs: Arc::new(AtomicU64::new(1)),
        };
        info!("node {} listening on port {}", node.config.node_id, node.router.local_port());
        Ok(Arc::new(node))
    }

    pub fn local_port(&self) -> u16 {
        self.router.local_port()
    }

    pub fn node_id(&self) -> u64 {
        self.config.node_id
    }

    pub fn n_running_programs(&self) -> u64 {
        self.n_running_programs.load(Ordering::Acquire)
    }

    /// Count an additional program against the total without spawning a
    /// vat for it; used when `start-program` targets an entity that
    /// already exists. Returns the new count.
    pub fn bump_running_programs(&self) -> u64 {
        self.n_running_programs.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Load a kernel module's entity definition so vats can instantiate it
    /// by name (`Io`, `Net`, `Fs`, `Monad`).
    pub fn register_kernel_entity(&self, name: impl Into<String>, def: TArc<EntityDef>) {
        self.kernel_entities.lock().insert(name.into(), def);
    }

    pub fn dial(&self, addr: SocketAddr, node_id: u64) {
        self.router.dial(addr, node_id);
    }

    fn outbound_sink(&self) -> OutboundSink {
        self.outbound_tx.clone()
    }

    /// Spawn a fresh vat on this node. Returns its address, which has no
    /// entities in it yet.
    ///
    /// Takes `self` by `Arc` so the vat can hold a [`Weak`] reference back
    /// to this node: that's how `Monad.start-program` and
    /// `Monad.n-programs`, called from inside a vat, reach the node that
    /// owns it without the vat owning the node outright.
    pub fn spawn_vat(self: &Arc<Node>) -> EntityAddress {
        let vat_id = self.vat_ids.lock().next();
        let address = EntityAddress::new(self.config.node_id, vat_id, 0);
        let (handle, join) = vat::spawn_vat(
            address,
            Arc::clone(&self.kernel_entities),
            self.outbound_sink(),
            self.router.clone(),
            Arc::clone(&self.peer_ids),
            Arc::downgrade(self),
        );
        self.vats.lock().insert(vat_id, handle);
        self.joins.lock().push(join);
        address
    }

    /// Allocate a vat, create an instance of `entity_name` in it and
    /// invoke `entry_point` with `args`. Does not touch
    /// `n_running_programs` — use this for vats that merely carry a
    /// query rather than a counted program (spec §8 scenario 1's probe
    /// is the motivating case); [`Node::start_program`] is the counted
    /// entry point everything else should use.
    pub fn spawn_and_invoke(
        self: &Arc<Node>,
        entity_name: &str,
        entry_point: &str,
        args: Vec<AstNode>,
    ) -> Result<EntityAddress> {
        let def = self
            .kernel_entities
            .lock()
            .get(entity_name)
            .cloned()
            .with_context(|| format!("no entity definition registered for `{entity_name}`"))?;
        let vat_addr = self.spawn_vat();
        let vat = self
            .vats
            .lock()
            .get(&vat_addr.vat_id)
            .cloned()
            .context("vat vanished immediately after spawn")?;

        // entity_id 0 is reserved for "not yet instantiated"; the first
        // real entity in a fresh vat always gets id 1.
        let entity_id = 1;
        let address = EntityAddress::new(vat_addr.node_id, vat_addr.vat_id, entity_id);

        vat.send(VatCmd::Start {
            def,
            entity_id,
            function_name: entry_point.into(),
            args,
        });
        Ok(address)
    }

    /// Start a new program: allocate a vat, create an instance of
    /// `entity_name` in it and invoke `entry_point` with `args`. This is
    /// what bumps `n_running_programs` past its boot-time floor of 1.
    pub fn start_program(
        self: &Arc<Node>,
        entity_name: &str,
        entry_point: &str,
        args: Vec<AstNode>,
    ) -> Result<EntityAddress> {
        let address = self.spawn_and_invoke(entity_name, entry_point, args)?;
        self.n_running_programs.fetch_add(1, Ordering::AcqRel);
        Ok(address)
    }

    /// "Load kernel, load module, instantiate `Monad`, send `main`"
    /// (spec §4.6/§6). The kernel is loaded separately, before this is
    /// called; this step carries the remaining three: type-check
    /// `module`'s declarations, register every entity it defines, and
    /// invoke `entry_entity`'s `main(0)`. Type errors are returned
    /// without instantiating anything — the evaluator never starts on a
    /// module that fails to solve (spec §8 E2E scenario 4).
    pub fn bootstrap(
        self: &Arc<Node>,
        module: &Module,
        entry_entity: &str,
    ) -> Result<EntityAddress, Vec<TypesolverError>> {
        let errors = typesolve::solve(module);
        if !errors.is_empty() {
            return Err(errors);
        }
        for (name, def) in &module.entities {
            self.register_kernel_entity(name.as_str(), def.clone());
        }
        self.start_program(entry_entity, "main", vec![AstNode::new(AstKind::Number(0), CType::u8())])
            .map_err(|e| {
                vec![TypesolverError {
                    message: e.to_string().into(),
                    function: None,
                    expected: None,
                    found: None,
                }]
            })
    }

    pub fn shutdown(&self) {
        for vat in self.vats.lock().values() {
            vat.send(VatCmd::Shutdown);
        }
        self.router.shutdown();
    }
}
