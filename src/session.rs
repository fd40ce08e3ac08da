//! # Port-Forward Session Engine
//!
//! Runs one session: a single WebSocket to the broker, bridged to at most
//! one local TCP connection. Handles the init handshake, bidirectional
//! relay with base64 framing, per-message acknowledgement deadlines, and
//! cooperative teardown.
//!
//! ## Tasks
//!
//! Each session spawns a small set of cooperating tasks:
//! - **writer** — sole owner of the WebSocket sink; drains the outbound
//!   queue so that concurrent senders never interleave frames
//! - **write-pump** — TCP → WS: reads local bytes, base64-encodes them
//!   into `stdin` messages (absent in probe mode)
//! - **read-pump** — WS → TCP: decodes incoming frames and dispatches them
//! - **drain** — writes decoded `stdout` bytes to the TCP socket in order
//! - **keep-alive** — periodic `keep-alive` messages (probe mode only)
//! - one **deadline watcher** per message still waiting for its ack
//!
//! The first task to record a termination cause wins; everything else is
//! unwound through `stop()`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tokio_tungstenite::tungstenite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SessionError;
use crate::protocol::{ErrorData, Payload, SessionMessage, StdinData, TerminationData};
use crate::ws::{self, WsSink, WsSource};

/// Cadence of the probe-mode keep-alive pump.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// TCP read chunk; one chunk becomes one `stdin` message.
const TCP_CHUNK_SIZE: usize = 8192;

/// Everything a session needs to know before dialing.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Broker base URL (`wss://...`), without the per-agent path.
    pub ws_url: String,
    /// Cluster-side relay the broker routes this session to.
    pub agent_id: String,
    /// Bearer token for the WebSocket upgrade.
    pub token: String,
    /// Probe mode: handshake only, no TCP bridging.
    pub probe: bool,
    /// Template payload for the init message; stamped with a fresh id and
    /// timestamp when the session starts.
    pub init: Payload,
    /// How long a sent message may wait for its ack.
    pub ack_timeout: Duration,
}

/// Items consumed by the writer task.
enum Outbound {
    Frame(SessionMessage),
    /// Flush whatever is queued, close the sink, exit.
    Shutdown,
}

/// One port-forward session over one WebSocket.
pub struct Session {
    cfg: SessionConfig,
    cancel: CancellationToken,
    /// Fired by the first completion path; unblocks `run()` and every pump.
    done: CancellationToken,
    /// Local connection to bridge; `None` in probe mode. Taken by `run()`.
    tcp: Mutex<Option<TcpStream>>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    outbound_rx: Mutex<Option<mpsc::UnboundedReceiver<Outbound>>>,
    /// Broker-assigned session identifier; empty until the init-ack.
    session_id: Mutex<String>,
    /// Message id of the init frame, once stamped.
    init_id: Mutex<Option<String>>,
    /// Message id → deadline watcher, for every unacked message.
    pending_acks: Mutex<HashMap<String, AbortHandle>>,
    /// Filled from decoded `stdout` frames, drained to TCP by the drain
    /// task. Absent in probe mode (payloads are discarded).
    stdout_tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
    /// Opened once, when the init-ack arrives.
    ready_tx: watch::Sender<bool>,
    /// Guards the teardown so it runs exactly once.
    closed: Mutex<bool>,
    /// Set when the broker announced termination; a following WS close is
    /// then a clean end of stream.
    graceful: AtomicBool,
    /// First recorded termination cause; what `run()` returns.
    outcome: Mutex<Option<Result<(), SessionError>>>,
}

impl Session {
    /// Creates a session. `tcp` must be `None` when `cfg.probe` is set; a
    /// probe session never touches a local connection.
    pub fn new(cancel: CancellationToken, tcp: Option<TcpStream>, cfg: SessionConfig) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (ready_tx, _) = watch::channel(false);
        Self {
            cfg,
            cancel,
            done: CancellationToken::new(),
            tcp: Mutex::new(tcp),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            session_id: Mutex::new(String::new()),
            init_id: Mutex::new(None),
            pending_acks: Mutex::new(HashMap::new()),
            stdout_tx: Mutex::new(None),
            ready_tx,
            closed: Mutex::new(false),
            graceful: AtomicBool::new(false),
            outcome: Mutex::new(None),
        }
    }

    /// Runs the session until it terminates and returns the first recorded
    /// cause. Dials the broker, performs the init handshake, spawns the
    /// pump tasks, then waits for cancellation or completion, tears
    /// everything down and joins every task.
    pub async fn run(self: Arc<Self>) -> Result<(), SessionError> {
        let stream = ws::dial(
            &self.cfg.ws_url,
            &self.cfg.agent_id,
            &self.cfg.token,
            &self.cancel,
        )
        .await?;
        let (sink, source) = stream.split();

        let Some(outbound_rx) = self.outbound_rx.lock().await.take() else {
            return Err(SessionError::Protocol("session already started".into()));
        };

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();
        tasks.push(tokio::spawn(write_loop(
            self.clone(),
            sink,
            outbound_rx,
        )));

        // Init handshake: first frame on the wire, acked before any stdin.
        match send_message(&self, self.cfg.init.clone(), true).await {
            Ok(init_id) => *self.init_id.lock().await = Some(init_id),
            Err(e) => self.complete(Err(e)).await,
        }

        if let Some(tcp) = self.tcp.lock().await.take() {
            let (tcp_read, tcp_write) = tcp.into_split();
            let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
            *self.stdout_tx.lock().await = Some(stdout_tx);
            tasks.push(tokio::spawn(drain_loop(self.clone(), tcp_write, stdout_rx)));
            tasks.push(tokio::spawn(write_pump(self.clone(), tcp_read)));
        }
        tasks.push(tokio::spawn(read_pump(self.clone(), source)));
        if self.cfg.probe {
            tasks.push(tokio::spawn(keep_alive_pump(self.clone())));
        }

        tokio::select! {
            _ = self.cancel.cancelled() => {
                self.complete(Err(SessionError::Cancelled)).await;
            }
            _ = self.done.cancelled() => {}
        }

        self.stop().await;
        for task in tasks {
            let _ = task.await;
        }

        self.outcome.lock().await.take().unwrap_or(Ok(()))
    }

    /// Tears the session down. Idempotent: the first call sends a
    /// best-effort termination frame (failure is logged, never fatal),
    /// cancels outstanding ack watchers and releases the WebSocket and the
    /// TCP connection; later calls are no-ops.
    pub async fn stop(&self) {
        {
            let mut closed = self.closed.lock().await;
            if *closed {
                return;
            }
            *closed = true;
        }
        debug!("Stopping session");

        let session_id = self.session_id.lock().await.clone();
        let goodbye = SessionMessage::new(
            session_id,
            Payload::Termination(TerminationData {
                process_exit_code: 0,
                exit_message: "client disconnected".into(),
            }),
        );
        if self.outbound_tx.send(Outbound::Frame(goodbye)).is_err() {
            debug!("Could not send termination message, WS writer already gone");
        }
        let _ = self.outbound_tx.send(Outbound::Shutdown);

        for (_, watcher) in self.pending_acks.lock().await.drain() {
            watcher.abort();
        }

        // Unblocks every pump; their TCP halves are dropped on exit.
        self.done.cancel();
    }

    /// Records the first termination cause and wakes everything up.
    /// Later causes are dropped: the first writer wins.
    async fn complete(&self, outcome: Result<(), SessionError>) {
        let mut slot = self.outcome.lock().await;
        if slot.is_none() {
            *slot = Some(outcome);
        }
        drop(slot);
        self.done.cancel();
    }

    /// Removes a pending-ack entry and cancels its deadline watcher.
    /// Returns whether the entry was still present (removal is idempotent).
    async fn resolve_ack(&self, acked_id: &str) -> bool {
        match self.pending_acks.lock().await.remove(acked_id) {
            Some(watcher) => {
                watcher.abort();
                true
            }
            None => false,
        }
    }
}

// ─── Outbound Path ──────────────────────────────────────────────

/// Stamps and enqueues a message for the writer task. With `needs_ack`, a
/// deadline watcher is registered first, so the entry exists before the
/// frame can possibly be acked.
async fn send_message(
    session: &Arc<Session>,
    payload: Payload,
    needs_ack: bool,
) -> Result<String, SessionError> {
    let session_id = session.session_id.lock().await.clone();
    let msg = SessionMessage::new(session_id, payload);
    let id = msg.message_id.clone();

    if needs_ack {
        watch_ack(session, id.clone()).await;
    }

    if session.outbound_tx.send(Outbound::Frame(msg)).is_err() {
        // Writer is gone; the watcher entry would never resolve.
        session.resolve_ack(&id).await;
        return Err(SessionError::Transport(tungstenite::Error::ConnectionClosed));
    }
    Ok(id)
}

/// Registers a deadline watcher for a message id. On expiry the watcher
/// removes its own entry first and only acts if it was still present, so
/// an ack landing at the same instant cannot race it.
async fn watch_ack(session: &Arc<Session>, message_id: String) {
    let deadline = session.cfg.ack_timeout;
    let watcher = tokio::spawn({
        let session = session.clone();
        let id = message_id.clone();
        async move {
            tokio::time::sleep(deadline).await;
            let expired = session.pending_acks.lock().await.remove(&id).is_some();
            if expired {
                warn!("No ack for message {} within {:?}", id, deadline);
                session
                    .complete(Err(SessionError::AckTimeout { message_id: id }))
                    .await;
            }
        }
    });
    session
        .pending_acks
        .lock()
        .await
        .insert(message_id, watcher.abort_handle());
}

/// Sole owner of the WebSocket sink. Serializes queued frames one at a
/// time; `Shutdown` flushes the queue ahead of it and closes the socket.
async fn write_loop(
    session: Arc<Session>,
    mut sink: WsSink,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(msg) => {
                if let Err(e) = ws::send_frame(&mut sink, &msg).await {
                    warn!("Failed to send message over WS: {}", e);
                    session.complete(Err(e)).await;
                    break;
                }
            }
            Outbound::Shutdown => {
                let _ = sink.close().await;
                break;
            }
        }
    }
}

/// TCP → WS. Waits for the ready gate (the init-ack), then turns every
/// chunk read from the local peer into one `stdin` message. EOF from the
/// local peer ends the session cleanly.
async fn write_pump(session: Arc<Session>, mut tcp_read: OwnedReadHalf) {
    let mut ready = session.ready_tx.subscribe();
    tokio::select! {
        _ = session.done.cancelled() => return,
        result = ready.wait_for(|open| *open) => {
            if result.is_err() {
                return;
            }
        }
    }

    let mut buf = vec![0u8; TCP_CHUNK_SIZE];
    loop {
        let read = tokio::select! {
            _ = session.done.cancelled() => return,
            read = tcp_read.read(&mut buf) => read,
        };
        match read {
            Ok(0) => {
                debug!("Local peer closed the connection");
                session.complete(Ok(())).await;
                return;
            }
            Ok(n) => {
                let input = BASE64.encode(&buf[..n]);
                if let Err(e) = send_message(&session, Payload::Stdin(StdinData { input }), true).await
                {
                    session.complete(Err(e)).await;
                    return;
                }
            }
            Err(e) => {
                session.complete(Err(SessionError::Tcp(e))).await;
                return;
            }
        }
    }
}

/// Writes decoded `stdout` chunks to the local peer, in arrival order.
async fn drain_loop(
    session: Arc<Session>,
    mut tcp_write: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    loop {
        let chunk = tokio::select! {
            _ = session.done.cancelled() => break,
            chunk = rx.recv() => match chunk {
                Some(chunk) => chunk,
                None => break,
            },
        };
        if let Err(e) = tcp_write.write_all(&chunk).await {
            session.complete(Err(SessionError::Tcp(e))).await;
            break;
        }
    }
    let _ = tcp_write.shutdown().await;
}

/// WS → dispatch. Frames that fail to decode are logged and skipped; a
/// close without a prior termination message is a transport failure.
async fn read_pump(session: Arc<Session>, mut source: WsSource) {
    loop {
        let frame = tokio::select! {
            _ = session.done.cancelled() => return,
            frame = ws::read_frame(&mut source) => frame,
        };
        match frame {
            Ok(Some(text)) => match SessionMessage::decode(&text) {
                Ok(msg) => dispatch(&session, msg).await,
                Err(e) => warn!("Ignoring undecodable frame: {}", e),
            },
            Ok(None) => {
                if session.graceful.load(Ordering::SeqCst) {
                    session.complete(Ok(())).await;
                } else {
                    debug!("WS closed by broker");
                    session
                        .complete(Err(SessionError::Transport(
                            tungstenite::Error::ConnectionClosed,
                        )))
                        .await;
                }
                return;
            }
            Err(e) => {
                session.complete(Err(e)).await;
                return;
            }
        }
    }
}

/// Applies one incoming message to the session state.
async fn dispatch(session: &Arc<Session>, msg: SessionMessage) {
    match &msg.payload {
        Payload::Ack(ack) => {
            let known = session.resolve_ack(&ack.acked_message_id).await;
            let is_init =
                session.init_id.lock().await.as_deref() == Some(ack.acked_message_id.as_str());
            if is_init {
                info!("Session established: {}", msg.session_id);
                *session.session_id.lock().await = msg.session_id.clone();
                session.ready_tx.send_replace(true);
                if session.cfg.probe {
                    // Connectivity is proven; a probe has nothing more to do.
                    session.complete(Ok(())).await;
                }
            } else if !known {
                warn!("Ack for unknown message {}", ack.acked_message_id);
            }
        }
        Payload::Stdout(stdout) => match BASE64.decode(stdout.out.as_bytes()) {
            Ok(bytes) => {
                let stdout_tx = session.stdout_tx.lock().await;
                match stdout_tx.as_ref() {
                    Some(tx) => {
                        let _ = tx.send(bytes);
                    }
                    None => debug!("Discarding {} stdout bytes, no local connection", bytes.len()),
                }
            }
            Err(e) => {
                warn!("stdout payload is not valid base64: {}", e);
                let reply = Payload::Error(ErrorData {
                    original_message_id: msg.message_id.clone(),
                    error_message: format!("invalid base64 in stdout payload: {e}"),
                });
                if let Err(e) = send_message(session, reply, false).await {
                    debug!("Could not report the decode failure: {}", e);
                }
            }
        },
        Payload::Error(err) => {
            session
                .complete(Err(SessionError::Remote(err.error_message.clone())))
                .await;
        }
        Payload::Termination(term) => {
            debug!(
                "Remote terminated the session (exit code {}): {}",
                term.process_exit_code, term.exit_message
            );
            session.graceful.store(true, Ordering::SeqCst);
            session.complete(Ok(())).await;
        }
        Payload::KeepAlive(_) | Payload::Ping(_) | Payload::TerminalSize(_) => {
            debug!("Ignoring {} message", msg.payload.tag());
        }
        Payload::PortForwardInit(_) | Payload::PodExecInit(_) | Payload::Stdin(_) => {
            debug!("Ignoring unexpected {} message", msg.payload.tag());
        }
    }
}

/// Periodic keep-alive sender. Only constructed for probe sessions,
/// matching the broker's expectations for connectivity tests.
async fn keep_alive_pump(session: Arc<Session>) {
    loop {
        tokio::select! {
            _ = session.done.cancelled() => return,
            _ = tokio::time::sleep(KEEP_ALIVE_INTERVAL) => {}
        }
        if let Err(e) = send_message(&session, Payload::KeepAlive(Default::default()), true).await {
            session.complete(Err(e)).await;
            return;
        }
    }
}
