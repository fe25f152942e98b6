//! One task per TCP connection. The task owns the stream and everything that
//!  happens on it: framing, inbound dispatch for the senders behind the connection,
//!  and all writes. Other parts of the transport never touch a connection directly -
//!  they post [`ConnCommand`]s to its queue. This makes the connection task the
//!  single execution context for its state, and the per-sender dispatch state bound
//!  to it (see [`crate::dispatch`]).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, span, trace, warn, Instrument, Level};
use uuid::Uuid;

use crate::buffer_pool::PayloadBuf;
use crate::frame::{Frame, FrameDecoder};
use crate::message::TransportMessage;
use crate::node_addr::NodeAddr;
use crate::server::{RegisterOutcome, TransportInner};

pub(crate) type CtxId = u64;

tokio::task_local! {
    static CURRENT_CTX: CtxId;
}

/// Handle on a connection task's command queue, used as the identity of the
///  execution context that per-sender dispatch state is bound to.
#[derive(Clone)]
pub(crate) struct ExecutionContext {
    id: CtxId,
    commands: mpsc::UnboundedSender<ConnCommand>,
}

impl ExecutionContext {
    /// is the calling task the one owning this context?
    pub fn is_current(&self) -> bool {
        CURRENT_CTX.try_with(|ctx| *ctx == self.id).unwrap_or(false)
    }

    /// false if the owning task is gone and the command was dropped
    pub fn post(&self, cmd: ConnCommand) -> bool {
        self.commands.send(cmd).is_ok()
    }

    pub fn is_alive(&self) -> bool {
        !self.commands.is_closed()
    }
}

pub(crate) enum ConnCommand {
    /// write a pre-encoded frame to the stream
    WriteFrame(PayloadBuf),
    /// stop reading from the stream until `ResumeReads`
    PauseReads,
    ResumeReads,
    /// run the dispatch-next step for the given sender on this context
    DispatchNext(NodeAddr),
    Close,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnState {
    Connecting,
    Open,
    Closed,
}

pub(crate) struct ConnectionHandle {
    pub id: u64,
    pub ctx: ExecutionContext,
    /// the transport-level remote endpoint (for outbound: the connect target)
    pub remote_addr: SocketAddr,
    state: AtomicU8,
    /// the peer's advertised reply address; set when the connection is registered
    peer_addr: Mutex<Option<NodeAddr>>,
}

impl ConnectionHandle {
    fn new(id: u64, ctx: ExecutionContext, remote_addr: SocketAddr, state: ConnState) -> ConnectionHandle {
        ConnectionHandle {
            id,
            ctx,
            remote_addr,
            state: AtomicU8::new(state as u8),
            peer_addr: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnState {
        match self.state.load(Ordering::Acquire) {
            0 => ConnState::Connecting,
            1 => ConnState::Open,
            _ => ConnState::Closed,
        }
    }

    fn set_state(&self, state: ConnState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub fn peer_addr(&self) -> Option<NodeAddr> {
        *self.peer_addr.lock().unwrap()
    }

    pub fn set_peer_addr(&self, addr: NodeAddr) {
        *self.peer_addr.lock().unwrap() = Some(addr);
    }

    pub fn post(&self, cmd: ConnCommand) -> bool {
        self.ctx.post(cmd)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Connection{{#{} remote={} peer={:?} {:?}}}",
            self.id,
            self.remote_addr,
            self.peer_addr(),
            self.state()
        )
    }
}

/// Spawn the task for an accepted connection. The peer stays unknown until its
///  first frame reveals the advertised reply address.
pub(crate) fn spawn_inbound(inner: Arc<TransportInner>, stream: TcpStream, remote_addr: SocketAddr) {
    let (handle, commands) = new_handle(&inner, remote_addr, ConnState::Open);

    let ctx_id = handle.ctx.id;
    let conn_id = handle.id;
    let task_inner = inner.clone();
    let task = tokio::spawn(CURRENT_CTX.scope(ctx_id, async move {
        run_connection(&task_inner, &handle, stream, commands).await;
        task_inner.release_task(conn_id);
    }));
    inner.track_task(conn_id, task);
}

/// Spawn the task for an outbound connection: connect (bounded by the configured
///  timeout), write the pending frame, then register under the target address.
///  On connect failure the pending frame is dropped - no retries at this level.
pub(crate) fn spawn_outbound(inner: Arc<TransportInner>, target: NodeAddr, first_frame: PayloadBuf) {
    let (handle, commands) = new_handle(&inner, target.socket_addr, ConnState::Connecting);

    let ctx_id = handle.ctx.id;
    let conn_id = handle.id;
    let task_inner = inner.clone();
    let task = tokio::spawn(CURRENT_CTX.scope(ctx_id, async move {
        let inner = task_inner;
        match timeout(inner.config.connect_timeout, TcpStream::connect(target.socket_addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(inner.config.tcp_nodelay) {
                    debug!("could not set TCP_NODELAY for {:?}: {}", target, e);
                }
                handle.set_state(ConnState::Open);
                debug!("connected to {:?}", target);

                // write the pending frame first, then register - registration may
                //  lose the duplicate-connection tie-break and close us
                handle.post(ConnCommand::WriteFrame(first_frame));
                if inner.register_connection(target, &handle) == RegisterOutcome::CloseNew {
                    debug!("{:?} lost the tie-break against an existing connection, closing", handle);
                    handle.post(ConnCommand::Close);
                }
                run_connection(&inner, &handle, stream, commands).await;
            }
            Ok(Err(e)) => {
                warn!("connecting to {:?} failed: {} - dropping pending send", target, e);
                handle.set_state(ConnState::Closed);
            }
            Err(_) => {
                warn!(
                    "connecting to {:?} timed out after {:?} - dropping pending send",
                    target, inner.config.connect_timeout
                );
                handle.set_state(ConnState::Closed);
            }
        }
        inner.release_task(conn_id);
    }));
    inner.track_task(conn_id, task);
}

fn new_handle(
    inner: &Arc<TransportInner>,
    remote_addr: SocketAddr,
    state: ConnState,
) -> (Arc<ConnectionHandle>, mpsc::UnboundedReceiver<ConnCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let ctx = ExecutionContext {
        id: inner.next_ctx_id(),
        commands: tx,
    };
    let handle = Arc::new(ConnectionHandle::new(inner.next_conn_id(), ctx, remote_addr, state));
    inner.track_connection(&handle);
    (handle, rx)
}

async fn run_connection(
    inner: &Arc<TransportInner>,
    handle: &Arc<ConnectionHandle>,
    stream: TcpStream,
    mut commands: mpsc::UnboundedReceiver<ConnCommand>,
) {
    let (mut read_half, mut write_half) = stream.into_split();
    let decoder = FrameDecoder::new(inner.config.max_frame_len);
    let mut read_buf = inner.buffer_pool.get_buffer();
    let mut reads_paused = false;

    loop {
        tokio::select! {
            biased;

            cmd = commands.recv() => match cmd {
                None => break, // transport is gone
                Some(ConnCommand::WriteFrame(frame)) => {
                    if let Err(e) = write_half.write_all(frame.as_ref()).await {
                        warn!("write to {:?} failed: {}", handle, e);
                        break;
                    }
                }
                Some(ConnCommand::PauseReads) => reads_paused = true,
                Some(ConnCommand::ResumeReads) => reads_paused = false,
                Some(ConnCommand::DispatchNext(sender)) => {
                    inner.engine.dispatch_next(sender).await;
                }
                Some(ConnCommand::Close) => break,
            },

            read = read_half.read_buf(&mut read_buf), if !reads_paused => match read {
                Ok(0) => {
                    debug!("{:?}: peer closed the stream", handle);
                    break;
                }
                Ok(_) => {
                    match on_bytes(inner, handle, &decoder, &mut read_buf).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            warn!("{:?}: protocol error: {} - closing", handle, e);
                            break;
                        }
                    }
                }
                Err(e) => {
                    warn!("{:?}: read failed: {}", handle, e);
                    break;
                }
            },
        }
    }

    handle.set_state(ConnState::Closed);
    inner.unregister_connection(handle);
    inner.buffer_pool.return_buffer(read_buf);
    debug!("{:?} terminated", handle);
}

/// Decode and dispatch every complete frame in the receive buffer. `Ok(false)`
///  means the connection should close (it lost a duplicate tie-break).
async fn on_bytes(
    inner: &Arc<TransportInner>,
    handle: &Arc<ConnectionHandle>,
    decoder: &FrameDecoder,
    read_buf: &mut BytesMut,
) -> anyhow::Result<bool> {
    while let Some(frame) = decoder.decode(read_buf)? {
        let correlation_id = Uuid::new_v4();
        let span = span!(Level::TRACE, "frame_received", ?correlation_id);
        if !on_frame(inner, handle, frame).instrument(span).await? {
            return Ok(false);
        }
    }
    Ok(true)
}

async fn on_frame(
    inner: &Arc<TransportInner>,
    handle: &Arc<ConnectionHandle>,
    frame: Frame,
) -> anyhow::Result<bool> {
    let sender = NodeAddr::try_from_reply_addr(frame.reply_addr.as_ref())?
        .unwrap_or(NodeAddr::from(handle.remote_addr));

    // every frame re-asserts the peer binding (a no-op once this connection is
    //  registered for the sender)
    match inner.register_connection(sender, handle) {
        RegisterOutcome::CloseNew => {
            debug!("{:?} lost the tie-break against an existing connection, closing", handle);
            return Ok(false);
        }
        RegisterOutcome::Registered | RegisterOutcome::KeptExisting => {}
    }

    if frame.payload.is_empty() {
        trace!("announce frame from {:?}", sender);
        return Ok(true);
    }

    let mut payload = frame.payload;
    let mut batches: Vec<(NodeAddr, Vec<TransportMessage>)> = Vec::new();
    while payload.has_remaining() {
        let mut msg = TransportMessage::try_deser_shared(&mut payload, &inner.buffer_pool)?;
        msg.fill_src(sender);

        if msg.is_oob() {
            trace!("submitting out-of-band message {:?}", msg);
            inner.engine.process_oob(msg);
            continue;
        }

        let msg_sender = msg.src().expect("source was just filled");
        match batches.last_mut() {
            Some((last_sender, msgs)) if *last_sender == msg_sender => msgs.push(msg),
            _ => batches.push((msg_sender, vec![msg])),
        }
    }

    for (batch_sender, mut msgs) in batches {
        if msgs.len() == 1 {
            inner
                .engine
                .process(&handle.ctx, msgs.pop().expect("just checked length"))
                .await;
        } else {
            inner.engine.process_batch(&handle.ctx, batch_sender, msgs).await;
        }
    }
    Ok(true)
}

/// a free-standing execution context for driving the dispatch engine in tests,
///  with its command queue exposed for inspection
#[cfg(test)]
pub(crate) fn test_context(id: CtxId) -> (ExecutionContext, mpsc::UnboundedReceiver<ConnCommand>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ExecutionContext { id, commands: tx }, rx)
}

/// run `f` as if on the execution context with the given id
#[cfg(test)]
pub(crate) async fn in_context<F: std::future::Future>(id: CtxId, f: F) -> F::Output {
    CURRENT_CTX.scope(id, f).await
}
