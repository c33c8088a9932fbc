//! WebSocket sync server with path-based room routing.
//!
//! Architecture:
//! ```text
//! Client A ──┐  ws://host/abc
//!             ├── SessionRegistry ── Session("abc") ── RoomDocument (Yrs)
//! Client B ──┘                          │        │
//!                                       │        └── fan-out ──► A, B (no echo)
//!                                       ▼
//!                               PersistenceBridge ── per-room writer ── DocumentStore
//! ```
//!
//! One port carries both surfaces. A request asking for a WebSocket upgrade
//! becomes a sync connection; any other HTTP request goes to the control
//! router. The room id is the request path without its leading `/`; an empty
//! path selects the default room. A connection acquires its room's session on
//! attach and releases it on close; the last release flushes the room.
//!
//! Shutdown stops the accept loop and tells every connection to close. It
//! waits up to `shutdown_timeout` for their releases, aborts whatever is
//! still running, then flushes the remaining sessions (with a bound of its
//! own) and closes the store.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use uuid::Uuid;

use crate::bridge::PersistenceBridge;
use crate::config::ServerConfig;
use crate::control;
use crate::document::peer_origin;
use crate::protocol::{Frame, FrameKind};
use crate::registry::SessionRegistry;
use crate::session::Session;
use crate::storage::{DocumentStore, RoomDirectory};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Longest request head inspected when routing a new connection.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// How long a new connection may take to send its request head.
const REQUEST_HEAD_TIMEOUT: Duration = Duration::from_secs(10);

/// Plain HTTP connections waiting for the control router.
const CONTROL_BACKLOG: usize = 64;

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub bytes_in: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_in: AtomicU64,
    frames_out: AtomicU64,
    bytes_in: AtomicU64,
}

/// Derive the room id from a request path.
pub fn room_id_from_path(path: &str, default_room: &str) -> String {
    let room = path.strip_prefix('/').unwrap_or(path);
    if room.is_empty() {
        default_room.to_string()
    } else {
        room.to_string()
    }
}

/// Whether an HTTP request head asks for a WebSocket upgrade.
pub fn is_websocket_request(head: &[u8]) -> bool {
    String::from_utf8_lossy(head).lines().skip(1).any(|line| {
        let Some((name, value)) = line.split_once(':') else {
            return false;
        };
        name.trim().eq_ignore_ascii_case("upgrade")
            && value.to_ascii_lowercase().contains("websocket")
    })
}

fn request_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|pos| pos + 4)
}

/// Peek at the request head without consuming it, so the chosen handler
/// still reads the whole request.
async fn peek_websocket_request(stream: &TcpStream) -> std::io::Result<bool> {
    let mut buf = vec![0u8; MAX_REQUEST_HEAD];
    let mut seen = 0;
    loop {
        let n = stream.peek(&mut buf).await?;
        if n == 0 {
            return Ok(false);
        }
        if let Some(end) = request_head_end(&buf[..n]) {
            return Ok(is_websocket_request(&buf[..end]));
        }
        if n == buf.len() {
            return Ok(is_websocket_request(&buf[..n]));
        }
        if n == seen {
            // Nothing new arrived yet
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        seen = n;
    }
}

/// Feeds plain HTTP connections from the shared port to `axum::serve`.
struct ControlListener {
    incoming: mpsc::Receiver<(TcpStream, SocketAddr)>,
    local_addr: SocketAddr,
}

impl axum::serve::Listener for ControlListener {
    type Io = TcpStream;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match self.incoming.recv().await {
            Some(connection) => connection,
            // Accept loop is gone; graceful shutdown ends the serve
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> std::io::Result<Self::Addr> {
        Ok(self.local_addr)
    }
}

/// Resolves once shutdown has been requested, including before the call.
async fn shutdown_signalled(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Triggers a graceful shutdown of a running [`SyncServer`].
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_shutdown(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Everything a connection task needs.
#[derive(Clone)]
struct ConnectionContext {
    registry: Arc<SessionRegistry>,
    stats: Arc<AtomicServerStats>,
    default_room: Arc<str>,
    shutdown: watch::Receiver<bool>,
}

/// The sync server.
pub struct SyncServer {
    config: ServerConfig,
    registry: Arc<SessionRegistry>,
    store: Arc<dyn DocumentStore>,
    directory: Arc<dyn RoomDirectory>,
    stats: Arc<AtomicServerStats>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl SyncServer {
    /// Create a server over an explicitly constructed store.
    pub fn new<S>(config: ServerConfig, store: Arc<S>) -> Self
    where
        S: DocumentStore + RoomDirectory,
    {
        let document_store: Arc<dyn DocumentStore> = store.clone();
        let directory: Arc<dyn RoomDirectory> = store;
        let bridge = Arc::new(PersistenceBridge::new(
            document_store.clone(),
            config.ephemeral_room.clone(),
        ));
        let registry = Arc::new(SessionRegistry::new(bridge, config.broadcast_capacity));
        let (shutdown, _) = watch::channel(false);

        Self {
            config,
            registry,
            store: document_store,
            directory,
            stats: Arc::new(AtomicServerStats::default()),
            shutdown: Arc::new(shutdown),
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.shutdown.clone(),
        }
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve sync connections and the control router on an already-bound
    /// listener until shutdown.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        let local_addr = listener.local_addr()?;
        log::info!("Sync server and control endpoint listening on {local_addr}");

        let (control_tx, control_rx) = mpsc::channel(CONTROL_BACKLOG);
        let control_listener = ControlListener {
            incoming: control_rx,
            local_addr,
        };
        let app = control::router(self.directory.clone());
        let mut control_stop = self.shutdown.subscribe();
        let control_task = tokio::spawn(async move {
            let graceful = async move { shutdown_signalled(&mut control_stop).await };
            if let Err(e) = axum::serve(control_listener, app)
                .with_graceful_shutdown(graceful)
                .await
            {
                log::error!("Control endpoint failed: {e}");
            }
        });

        let ctx = ConnectionContext {
            registry: self.registry.clone(),
            stats: self.stats.clone(),
            default_room: Arc::from(self.config.default_room.as_str()),
            shutdown: self.shutdown.subscribe(),
        };
        let mut stop = self.shutdown.subscribe();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            log::debug!("New TCP connection from {addr}");
                            connections.spawn(Self::route_connection(
                                stream,
                                addr,
                                ctx.clone(),
                                control_tx.clone(),
                            ));
                        }
                        Err(e) => log::warn!("Accept failed: {e}"),
                    }
                }
                _ = shutdown_signalled(&mut stop) => {
                    log::info!("Shutdown requested; no longer accepting connections");
                    break;
                }
                Some(finished) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = finished {
                        log::error!("Connection task failed: {e}");
                    }
                }
            }
        }
        drop(listener);
        drop(control_tx);

        self.drain(&mut connections).await;

        if let Err(e) = control_task.await {
            log::error!("Control endpoint task failed: {e}");
        }
        Ok(())
    }

    async fn drain(&self, connections: &mut JoinSet<()>) {
        let budget = self.config.shutdown_timeout;
        log::info!("Draining {} connection(s)", connections.len());

        let joined = tokio::time::timeout(budget, async {
            while let Some(finished) = connections.join_next().await {
                if let Err(e) = finished {
                    log::error!("Connection task failed during shutdown: {e}");
                }
            }
        })
        .await;

        if joined.is_err() {
            log::warn!(
                "{} connection(s) still open after {budget:?}; aborting them",
                connections.len()
            );
            connections.abort_all();
            while let Some(finished) = connections.join_next().await {
                if let Err(e) = finished {
                    if !e.is_cancelled() {
                        log::error!("Connection task failed during shutdown: {e}");
                    }
                }
            }
        }

        // Rooms left behind by aborted connections still get flushed
        if tokio::time::timeout(budget, self.registry.drain()).await.is_err() {
            log::warn!(
                "Flush timed out after {budget:?}; rooms not flushed: {:?}",
                self.registry.room_ids()
            );
        }

        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.close()).await {
            Ok(Ok(())) => log::info!("Store closed"),
            Ok(Err(e)) => log::error!("Store close failed: {e}"),
            Err(e) => log::error!("Store close task failed: {e}"),
        }
    }

    /// Send a new connection to the sync handshake or the control router,
    /// depending on whether it asks for a WebSocket upgrade.
    async fn route_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ConnectionContext,
        control: mpsc::Sender<(TcpStream, SocketAddr)>,
    ) {
        let mut shutdown = ctx.shutdown.clone();
        let peeked = tokio::select! {
            peeked = tokio::time::timeout(REQUEST_HEAD_TIMEOUT, peek_websocket_request(&stream)) => peeked,
            _ = shutdown_signalled(&mut shutdown) => return,
        };

        match peeked {
            Ok(Ok(true)) => {
                if let Err(e) = Self::handle_connection(stream, addr, ctx).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            }
            Ok(Ok(false)) => {
                log::debug!("HTTP request from {addr} routed to control endpoint");
                if control.send((stream, addr)).await.is_err() {
                    log::debug!("Control endpoint stopped; dropping {addr}");
                }
            }
            Ok(Err(e)) => log::warn!("Failed to read request from {addr}: {e}"),
            Err(_) => log::warn!("No request from {addr} within {REQUEST_HEAD_TIMEOUT:?}"),
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        ctx: ConnectionContext,
    ) -> Result<(), BoxError> {
        let mut path: Option<String> = None;
        let ws_stream = tokio_tungstenite::accept_hdr_async(
            stream,
            |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                path = Some(req.uri().path().to_string());
                Ok(resp)
            },
        )
        .await?;

        let room_id = room_id_from_path(path.as_deref().unwrap_or("/"), &ctx.default_room);
        let session = ctx.registry.acquire(&room_id).await?;

        ctx.stats.total_connections.fetch_add(1, Ordering::Relaxed);
        ctx.stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("Peer {addr} joined room '{room_id}'");

        let result = Self::exchange(ws_stream, addr, &session, &ctx).await;

        ctx.registry.release(&room_id, &session).await;
        ctx.stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Peer {addr} left room '{room_id}'");

        result
    }

    /// Bidirectional delta exchange for one attached connection.
    async fn exchange(
        ws_stream: WebSocketStream<TcpStream>,
        addr: SocketAddr,
        session: &Arc<Session>,
        ctx: &ConnectionContext,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let origin = peer_origin(Uuid::new_v4());
        let mut updates = session.subscribe();
        let mut shutdown = ctx.shutdown.clone();
        let stats = &ctx.stats;

        // Offer our state vector so the client can push what we lack
        let hello = Frame::sync_step1(session.document().state_vector()).encode()?;
        ws_sender.send(Message::Binary(hello.into())).await?;
        stats.frames_out.fetch_add(1, Ordering::Relaxed);

        // Then the full state, encoded after subscribing: anything committed
        // before the subscription is in it, anything after arrives as updates
        let state = Frame::sync_step2(session.document().encode_state()).encode()?;
        ws_sender.send(Message::Binary(state.into())).await?;
        stats.frames_out.fetch_add(1, Ordering::Relaxed);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            stats.frames_in.fetch_add(1, Ordering::Relaxed);
                            stats.bytes_in.fetch_add(data.len() as u64, Ordering::Relaxed);

                            let frame = match Frame::decode(&data) {
                                Ok(frame) => frame,
                                Err(e) => {
                                    log::warn!("Failed to decode frame from {addr}: {e}");
                                    continue;
                                }
                            };

                            match frame.kind {
                                FrameKind::SyncStep1 => {
                                    match session.document().diff(&frame.payload) {
                                        Ok(diff) => {
                                            let reply = Frame::sync_step2(diff).encode()?;
                                            ws_sender.send(Message::Binary(reply.into())).await?;
                                            stats.frames_out.fetch_add(1, Ordering::Relaxed);
                                        }
                                        Err(e) => log::warn!("Bad state vector from {addr}: {e}"),
                                    }
                                }
                                FrameKind::SyncStep2 | FrameKind::Update => {
                                    if let Err(e) = session.apply_delta(&frame.payload, Some(origin.clone())) {
                                        log::warn!("Rejected delta from {addr}: {e}");
                                    }
                                }
                                FrameKind::Ping => {
                                    let pong = Frame::pong().encode()?;
                                    ws_sender.send(Message::Binary(pong.into())).await?;
                                    stats.frames_out.fetch_add(1, Ordering::Relaxed);
                                }
                                FrameKind::Pong => {
                                    log::trace!("Pong from {addr}");
                                }
                            }
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Connection closed from {addr}");
                            break;
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Err(e)) => {
                            log::warn!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                update = updates.recv() => {
                    match update {
                        Ok(update) => {
                            // Don't echo back to sender
                            if update.is_from(&origin) {
                                continue;
                            }
                            let frame = Frame::update(update.delta.to_vec()).encode()?;
                            ws_sender.send(Message::Binary(frame.into())).await?;
                            stats.frames_out.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("Peer {addr} lagged by {n} updates; resending full state");
                            let state = Frame::sync_step2(session.document().encode_state()).encode()?;
                            ws_sender.send(Message::Binary(state.into())).await?;
                            stats.frames_out.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = shutdown_signalled(&mut shutdown) => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        Ok(())
    }

    /// Get server statistics.
    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            frames_in: self.stats.frames_in.load(Ordering::Relaxed),
            frames_out: self.stats.frames_out.load(Ordering::Relaxed),
            bytes_in: self.stats.bytes_in.load(Ordering::Relaxed),
            active_rooms: self.registry.room_count(),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn bridge(&self) -> &Arc<PersistenceBridge> {
        self.registry.bridge()
    }
}
