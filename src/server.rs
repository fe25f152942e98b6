//! The connection multiplexer: owns the listening socket and the peer-to-connection
//!  table, opens outbound connections lazily on first send, collapses duplicate
//!  connections between the same peer pair, and routes outbound frames onto the
//!  owning connection's task.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::buffer_pool::{BufferPool, PayloadBuf};
use crate::config::TcpTransportConfig;
use crate::connection::{spawn_inbound, spawn_outbound, ConnCommand, ConnState, ConnectionHandle};
use crate::dispatch::DispatchEngine;
use crate::frame::Frame;
use crate::message_sink::MessageSink;
use crate::node_addr::NodeAddr;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RegisterOutcome {
    /// this connection is (now) the registered one for the peer
    Registered,
    /// another connection is registered for the peer and stays; this one remains
    ///  usable but unregistered
    KeptExisting,
    /// another connection is registered for the peer; this one must close
    CloseNew,
}

pub(crate) struct TransportInner {
    pub(crate) config: TcpTransportConfig,
    pub(crate) local_addr: NodeAddr,
    /// the local address in reply-address wire form, sent with every frame
    pub(crate) reply_addr_bytes: Bytes,
    pub(crate) buffer_pool: Arc<BufferPool>,
    pub(crate) engine: Arc<DispatchEngine>,
    /// peer address -> the one registered connection for that peer
    connections: RwLock<FxHashMap<NodeAddr, Arc<ConnectionHandle>>>,
    /// every live connection, registered or not, for shutdown
    all_connections: Mutex<FxHashMap<u64, Arc<ConnectionHandle>>>,
    conn_tasks: Mutex<FxHashMap<u64, JoinHandle<()>>>,
    next_ctx_id: AtomicU64,
    next_conn_id: AtomicU64,
    shutting_down: AtomicBool,
}

impl TransportInner {
    pub(crate) fn next_ctx_id(&self) -> u64 {
        self.next_ctx_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        self.next_conn_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn track_connection(&self, conn: &Arc<ConnectionHandle>) {
        self.all_connections.lock().unwrap().insert(conn.id, conn.clone());
    }

    pub(crate) fn track_task(&self, conn_id: u64, task: JoinHandle<()>) {
        self.conn_tasks.lock().unwrap().insert(conn_id, task);
    }

    /// called by a connection task as its last action
    pub(crate) fn release_task(&self, conn_id: u64) {
        self.all_connections.lock().unwrap().remove(&conn_id);
        self.conn_tasks.lock().unwrap().remove(&conn_id);
    }

    /// Record `conn` as the connection for `peer`, unless one is already
    ///  registered. When both nodes race to connect to each other, each node runs
    ///  this rule on the late connection; the endpoint comparison makes (only) the
    ///  side whose new channel points at the registered peer address close it, so
    ///  one connection of the pair is culled instead of both.
    pub(crate) fn register_connection(
        &self,
        peer: NodeAddr,
        conn: &Arc<ConnectionHandle>,
    ) -> RegisterOutcome {
        let mut connections = self.connections.write().unwrap();
        if let Some(existing) = connections.get(&peer) {
            if existing.id == conn.id {
                return RegisterOutcome::Registered;
            }
            return if conn.remote_addr == peer.socket_addr {
                RegisterOutcome::CloseNew
            } else {
                RegisterOutcome::KeptExisting
            };
        }

        conn.set_peer_addr(peer);
        connections.insert(peer, conn.clone());
        debug!("registered {:?} for peer {:?}", conn, peer);
        RegisterOutcome::Registered
    }

    /// Drop the registration held by this connection, if any. The sender table is
    ///  deliberately left alone - it is pruned on membership changes only, so a
    ///  transient disconnect does not lose queued dispatch state.
    pub(crate) fn unregister_connection(&self, conn: &ConnectionHandle) {
        let mut connections = self.connections.write().unwrap();
        let before = connections.len();
        connections.retain(|_, c| c.id != conn.id);
        if connections.len() < before {
            debug!("removed peer registration of {:?}", conn);
        }
    }
}

pub struct TcpTransport {
    inner: Arc<TransportInner>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Bind the listener (scanning the configured port range) and start accepting.
    ///  Failure to bind any port in the range is fatal to the transport.
    pub async fn start(
        config: TcpTransportConfig,
        sink: Arc<dyn MessageSink>,
    ) -> anyhow::Result<TcpTransport> {
        config.validate()?;

        let listener = bind_listener(&config)?;
        let local_addr = NodeAddr::from(listener.local_addr()?);
        info!("bound transport listener to {:?}", local_addr);

        let mut reply_addr_bytes = BytesMut::new();
        local_addr.write_reply_addr(&mut reply_addr_bytes);

        let engine = Arc::new(DispatchEngine::new(sink, &config));
        let buffer_pool = Arc::new(BufferPool::new(config.buffer_capacity, config.buffer_pool_size));
        let inner = Arc::new(TransportInner {
            config,
            local_addr,
            reply_addr_bytes: reply_addr_bytes.freeze(),
            buffer_pool,
            engine,
            connections: RwLock::new(FxHashMap::default()),
            all_connections: Mutex::new(FxHashMap::default()),
            conn_tasks: Mutex::new(FxHashMap::default()),
            next_ctx_id: AtomicU64::new(0),
            next_conn_id: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
        });

        let accept_inner = inner.clone();
        let accept_task = tokio::spawn(accept_loop(accept_inner, listener));

        Ok(TcpTransport {
            inner,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> NodeAddr {
        self.inner.local_addr
    }

    pub fn dispatch_engine(&self) -> &Arc<DispatchEngine> {
        &self.inner.engine
    }

    /// Send opaque payload bytes to a peer. Non-blocking: the frame is handed to
    ///  the connection's task, or a connection attempt is started and the frame
    ///  written once it is established. A failed or timed-out attempt drops the
    ///  frame - retries are the upper layer's business.
    pub fn send(&self, to: NodeAddr, payload: &[u8]) -> anyhow::Result<()> {
        self.send_frame(to, payload)
    }

    /// Announce this node's reply address to a peer that has seen no traffic from
    ///  us yet, so the peer can address future sends back.
    pub fn connect_and_send(&self, to: NodeAddr) -> anyhow::Result<()> {
        self.send_frame(to, b"")
    }

    fn send_frame(&self, to: NodeAddr, payload: &[u8]) -> anyhow::Result<()> {
        if self.inner.shutting_down.load(Ordering::Acquire) {
            bail!("transport is shut down");
        }
        let total_len = 2 * size_of::<i32>() + self.inner.reply_addr_bytes.len() + payload.len();
        if total_len > self.inner.config.max_frame_len {
            bail!(
                "payload of {} bytes exceeds the maximum frame length of {}",
                payload.len(),
                self.inner.config.max_frame_len
            );
        }

        let mut buf = self.inner.buffer_pool.get_buffer();
        Frame::encode(&self.inner.reply_addr_bytes, payload, &mut buf);
        let frame = PayloadBuf::from_pooled(buf, self.inner.buffer_pool.clone());

        let registered = self
            .inner
            .connections
            .read()
            .unwrap()
            .get(&to)
            .filter(|conn| conn.state() == ConnState::Open)
            .cloned();
        match registered {
            Some(conn) => {
                conn.post(ConnCommand::WriteFrame(frame));
            }
            None => {
                debug!("no open connection for {:?}, connecting", to);
                spawn_outbound(self.inner.clone(), to, frame);
            }
        }
        Ok(())
    }

    /// the current cluster membership; dispatch state of departed senders is dropped
    pub fn on_view_change(&self, members: &[NodeAddr]) {
        self.inner.engine.on_view_change(members);
    }

    pub fn num_registered_connections(&self) -> usize {
        self.inner.connections.read().unwrap().len()
    }

    pub fn has_connection(&self, peer: &NodeAddr) -> bool {
        self.inner.connections.read().unwrap().contains_key(peer)
    }

    /// Stop accepting, close every connection and drop all per-sender state.
    ///  Sends fail fast afterwards. Idempotent.
    pub fn shutdown(&self) {
        if self.inner.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down transport on {:?}", self.inner.local_addr);

        if let Some(accept_task) = self.accept_task.lock().unwrap().take() {
            accept_task.abort();
        }
        for conn in self.inner.all_connections.lock().unwrap().values() {
            conn.post(ConnCommand::Close);
        }
        let tasks: Vec<_> = self.inner.conn_tasks.lock().unwrap().drain().collect();
        for (_, task) in tasks {
            task.abort();
        }
        self.inner.connections.write().unwrap().clear();
        self.inner.all_connections.lock().unwrap().clear();
        self.inner.engine.clear();
    }
}

impl Drop for TcpTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(inner: Arc<TransportInner>, listener: TcpListener) {
    info!("accepting connections on {:?}", inner.local_addr);
    loop {
        match listener.accept().await {
            Ok((stream, remote_addr)) => {
                if inner.shutting_down.load(Ordering::Acquire) {
                    break;
                }
                debug!("accepted connection from {}", remote_addr);
                if let Err(e) = stream.set_nodelay(inner.config.tcp_nodelay) {
                    debug!("could not set TCP_NODELAY for {}: {}", remote_addr, e);
                }
                spawn_inbound(inner.clone(), stream, remote_addr);
            }
            Err(e) => {
                warn!("accepting a connection failed: {}", e);
            }
        }
    }
}

fn bind_listener(config: &TcpTransportConfig) -> anyhow::Result<TcpListener> {
    let last_port = config.bind_port.saturating_add(config.port_range);
    let mut port = config.bind_port;
    loop {
        match try_bind(SocketAddr::new(config.bind_addr, port)) {
            Ok(listener) => return Ok(listener),
            Err(e) if port < last_port => {
                debug!("could not bind port {}: {} - trying the next port in the range", port, e);
                port += 1;
            }
            Err(e) => bail!(
                "no available port to bind within {}..={}: {}",
                config.bind_port,
                last_port,
                e
            ),
        }
    }
}

fn try_bind(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(128)?)
}
