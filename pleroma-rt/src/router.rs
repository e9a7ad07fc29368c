//! Cross-node transport.
//!
//! The original implementation carries inter-node traffic over ENet
//! (reliable UDP with up to 32 peers and 2 channels per peer). This
//! corpus has no first-class ENet binding, so the router speaks the same
//! shape of protocol — bounded peer count, a small fixed channel count,
//! best-effort reconnect — over TCP with `tokio`, framing each message as
//! a 4-byte big-endian length prefix followed by a `bincode`-encoded
//! [`Msg`]. The router owns its own OS thread and its own single-threaded
//! tokio runtime; it never shares a runtime with any vat.

use anyhow::{Context, Result};
use fxhash::FxHashMap;
use log::{error, info, warn};
use pleroma_ast::msg::Msg;
use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{TcpListener, TcpStream},
    runtime::Builder,
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
};

/// ENet's `enet_host_create` in the original is configured for 32 peers
/// and 2 channels each; kept here as the router's own connection budget.
pub const MAX_PEERS: usize = 32;
pub const CHANNELS_PER_PEER: usize = 2;

enum RouterCmd {
    Dial { addr: SocketAddr, node_id: u64 },
    Send(Msg),
    Shutdown,
}

/// A handle to the running router; cheap to clone, safe to share across
/// vat threads.
#[derive(Clone)]
pub struct RouterHandle {
    tx: UnboundedSender<RouterCmd>,
    local_port: Arc<AtomicU64>,
}

impl RouterHandle {
    pub fn dial(&self, addr: SocketAddr, node_id: u64) {
        let _ = self.tx.send(RouterCmd::Dial { addr, node_id });
    }

    pub fn send(&self, msg: Msg) {
        let _ = self.tx.send(RouterCmd::Send(msg));
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(RouterCmd::Shutdown);
    }

    pub fn local_port(&self) -> u16 {
        self.local_port.load(Ordering::Acquire) as u16
    }
}

/// Per-peer connection state machine (spec §4.5):
/// `disconnected -> connecting -> connected -> disconnected` on loss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Disconnected,
    Connected,
}

struct Peer {
    state: PeerState,
    /// Remembered so a lost connection can be redialed; `None` for peers
    /// we only ever heard from (accepted inbound, never dialed out).
    addr: Option<SocketAddr>,
    outbound: Option<UnboundedSender<Msg>>,
}

impl Peer {
    fn disconnected(addr: Option<SocketAddr>) -> Self {
        Self { state: PeerState::Disconnected, addr, outbound: None }
    }

    fn connected(addr: Option<SocketAddr>, outbound: UnboundedSender<Msg>) -> Self {
        Self { state: PeerState::Connected, addr, outbound: Some(outbound) }
    }
}

/// Spawn the router's thread and runtime, binding a TCP listener on
/// `bind_port` (0 lets the OS choose). `deliver` is called from the
/// router's thread for every message that arrives addressed to a local
/// vat, exactly the same way `Vat::deliver` is called for same-node
/// traffic — the evaluator and the kernel never know whether a reply
/// crossed the network or not. `deliver` is also how a failed send comes
/// back to its sender: a synthesized error reply is routed through it
/// exactly like a real one.
pub fn spawn_router(
    bind_port: u16,
    deliver: impl Fn(Msg) + Send + Sync + 'static,
) -> Result<(RouterHandle, std::thread::JoinHandle<()>)> {
    let (tx, rx) = mpsc::unbounded_channel();
    let local_port = Arc::new(AtomicU64::new(bind_port as u64));
    let handle = RouterHandle { tx, local_port: Arc::clone(&local_port) };

    let join = std::thread::Builder::new()
        .name("pleroma-router".into())
        .spawn(move || {
            let rt = Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("failed to build router tokio runtime");
            rt.block_on(run(bind_port, local_port, rx, deliver));
        })
        .context("failed to spawn router thread")?;

    Ok((handle, join))
}

async fn run(
    bind_port: u16,
    local_port: Arc<AtomicU64>,
    mut cmds: UnboundedReceiver<RouterCmd>,
    deliver: impl Fn(Msg) + Send + Sync + 'static,
) {
    let listener = match TcpListener::bind(("0.0.0.0", bind_port)).await {
        Ok(l) => l,
        Err(e) => {
            error!("router failed to bind port {bind_port}: {e}");
            return;
        }
    };
    if let Ok(addr) = listener.local_addr() {
        local_port.store(addr.port() as u64, Ordering::Release);
    }

    let deliver: Arc<dyn Fn(Msg) + Send + Sync> = Arc::new(deliver);
    // Every decoded inbound frame is paired with the sender half of the
    // connection it arrived on, so a connection we only accepted (and
    // therefore never learned a `SocketAddr` to dial) can still be used
    // for replies once we see its first message's source node id —
    // `netcode.cpp`'s `connect_client` dials the peer back the same way
    // on first contact from an unrecognized address.
    let (inbound_tx, mut inbound_rx) = mpsc::unbounded_channel::<(Msg, UnboundedSender<Msg>)>();
    let mut peers: FxHashMap<u64, Peer> = FxHashMap::default();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        if peers.values().filter(|p| p.state == PeerState::Connected).count() >= MAX_PEERS {
                            warn!("rejecting connection from {addr}: peer limit reached");
                            continue;
                        }
                        info!("accepted connection from {addr}");
                        spawn_peer(stream, inbound_tx.clone());
                    }
                    Err(e) => error!("accept failed: {e}"),
                }
            }
            Some((msg, sender)) = inbound_rx.recv() => {
                peers.entry(msg.src.node_id)
                    .and_modify(|p| { p.state = PeerState::Connected; p.outbound = Some(sender.clone()); })
                    .or_insert_with(|| Peer::connected(None, sender));
                deliver(msg);
            }
            Some(cmd) = cmds.recv() => {
                match cmd {
                    RouterCmd::Dial { addr, node_id } => {
                        match TcpStream::connect(addr).await {
                            Ok(stream) => {
                                info!("dialed node {node_id} at {addr}");
                                let outbound = spawn_peer(stream, inbound_tx.clone());
                                peers.insert(node_id, Peer::connected(Some(addr), outbound));
                            }
                            Err(e) => {
                                error!("dial {addr} failed: {e}");
                                peers.insert(node_id, Peer::disconnected(Some(addr)));
                            }
                        }
                    }
                    RouterCmd::Send(msg) => {
                        send_or_redial(&mut peers, &inbound_tx, &deliver, msg).await;
                    }
                    RouterCmd::Shutdown => return,
                }
            }
        }
    }
}

/// Send `msg` to its destination node. A connected peer gets it
/// immediately; a disconnected-but-known peer gets exactly one redial
/// attempt before the send is reported as failed; an unknown peer fails
/// immediately. Failure surfaces as a synthesized error reply handed
/// back to `deliver` exactly as §7 describes: "the router surfaces the
/// failure through the outgoing promise as `TransportFailed`."
async fn send_or_redial(
    peers: &mut FxHashMap<u64, Peer>,
    inbound_tx: &UnboundedSender<(Msg, UnboundedSender<Msg>)>,
    deliver: &Arc<dyn Fn(Msg) + Send + Sync>,
    msg: Msg,
) {
    let node_id = msg.dst.node_id;

    if let Some(peer) = peers.get(&node_id) {
        if peer.state == PeerState::Connected {
            if let Some(sender) = &peer.outbound {
                if sender.send(msg.clone()).is_ok() {
                    return;
                }
            }
        }
    }

    if let Some(peer) = peers.get_mut(&node_id) {
        peer.state = PeerState::Disconnected;
        peer.outbound = None;
    }

    let Some(addr) = peers.get(&node_id).and_then(|p| p.addr) else {
        fail(deliver, msg, "no route to node");
        return;
    };

    match TcpStream::connect(addr).await {
        Ok(stream) => {
            info!("redialed node {node_id} at {addr}");
            let outbound = spawn_peer(stream, inbound_tx.clone());
            let sent = outbound.send(msg.clone()).is_ok();
            peers.insert(node_id, Peer::connected(Some(addr), outbound));
            if !sent {
                fail(deliver, msg, "reconnected but send failed");
            }
        }
        Err(e) => {
            peers.insert(node_id, Peer::disconnected(Some(addr)));
            fail(deliver, msg, &format!("reconnect to {addr} failed: {e}"));
        }
    }
}

/// A call that can never be delivered resolves its sender's promise with
/// `TransportFailed` instead of hanging forever; a reply that can never
/// be delivered is just dropped (there is no further promise to fail).
fn fail(deliver: &Arc<dyn Fn(Msg) + Send + Sync>, msg: Msg, reason: &str) {
    warn!("transport failed sending to node {}: {reason}", msg.dst.node_id);
    if !msg.response {
        deliver(msg.reply_err(format!("TransportFailed: {reason}")));
    }
}

/// Spawn the read and write halves of one peer connection. Returns a
/// sender for outbound messages to this peer; inbound frames are decoded
/// and forwarded, paired with a clone of this same outbound sender, for
/// the router loop to dispatch and to learn the peer's node id from.
fn spawn_peer(
    stream: TcpStream,
    inbound_tx: UnboundedSender<(Msg, UnboundedSender<Msg>)>,
) -> UnboundedSender<Msg> {
    let (read_half, mut write_half) = stream.into_split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Msg>();
    let reader_out_tx = out_tx.clone();

    tokio::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            let encoded = match bincode::serialize(&msg) {
                Ok(b) => b,
                Err(e) => {
                    error!("failed to encode message: {e}");
                    continue;
                }
            };
            let len = (encoded.len() as u32).to_be_bytes();
            if write_half.write_all(&len).await.is_err() || write_half.write_all(&encoded).await.is_err()
            {
                warn!("connection write failed, closing");
                break;
            }
        }
    });

    tokio::spawn(async move {
        let mut read_half = read_half;
        loop {
            let mut len_buf = [0u8; 4];
            if read_half.read_exact(&mut len_buf).await.is_err() {
                break;
            }
            let len = u32::from_be_bytes(len_buf) as usize;
            let mut buf = vec![0u8; len];
            if read_half.read_exact(&mut buf).await.is_err() {
                break;
            }
            match bincode::deserialize::<Msg>(&buf) {
                Ok(msg) => {
                    if inbound_tx.send((msg, reader_out_tx.clone())).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    error!("failed to decode message: {e}");
                    break;
                }
            }
        }
    });

    out_tx
}
