//! Shared helpers for the end-to-end tests: a server on loopback ports and a
//! minimal WebSocket peer that keeps its own replica of the room.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use quill_sync::storage::{DocumentStore, RoomDirectory};
use quill_sync::{Frame, FrameKind, RoomDocument, ServerConfig, SyncServer};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use yrs::{GetString, Text, Transact, WriteTxn};

// ─── Documents ───────────────────────────────────────────────────────────────

/// Append text to a document, return the delta.
pub fn make_delta(doc: &RoomDocument, insert_text: &str) -> Vec<u8> {
    let before = doc.state_vector();
    {
        let mut txn = doc.inner().transact_mut();
        let text = txn.get_or_insert_text("content");
        let len = text.len(&txn);
        text.insert(&mut txn, len, insert_text);
    }
    doc.diff(&before).unwrap()
}

pub fn text_of(doc: &RoomDocument) -> String {
    let mut txn = doc.inner().transact_mut();
    let text = txn.get_or_insert_text("content");
    text.get_string(&txn)
}

pub fn text_of_state(state: &[u8]) -> String {
    let doc = RoomDocument::new();
    doc.apply_delta(state, None).unwrap();
    text_of(&doc)
}

/// Poll `cond` until it holds or two seconds pass.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 2s");
}

// ─── Server ──────────────────────────────────────────────────────────────────

pub struct TestServer {
    pub addr: SocketAddr,
    pub server: Arc<SyncServer>,
    task: JoinHandle<()>,
}

impl TestServer {
    pub async fn start<S>(store: Arc<S>) -> Self
    where
        S: DocumentStore + RoomDirectory,
    {
        Self::start_with(ServerConfig::for_testing("unused"), store).await
    }

    pub async fn start_with<S>(config: ServerConfig, store: Arc<S>) -> Self
    where
        S: DocumentStore + RoomDirectory,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = Arc::new(SyncServer::new(config, store));
        let task = {
            let server = server.clone();
            tokio::spawn(async move {
                server.serve(listener).await.unwrap();
            })
        };
        Self { addr, server, task }
    }

    /// Graceful shutdown; returns once the store is closed.
    pub async fn stop(self) {
        self.server.shutdown_handle().shutdown();
        self.task.await.unwrap();
    }

    /// Kill the server without any flush, as a crash would.
    pub async fn abort(self) {
        self.task.abort();
        let _ = self.task.await;
    }

    pub async fn connect(&self, room: &str) -> Peer {
        Peer::connect(self.addr, room).await
    }

    /// Plain HTTP/1.1 request on the server's port; returns status and body.
    pub async fn http(&self, method: &str, path: &str, body: Option<&str>) -> (u16, String) {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let mut request = format!(
            "{method} {path} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n",
            self.addr
        );
        match body {
            Some(body) => request.push_str(&format!(
                "Content-Type: application/json\r\nContent-Length: {}\r\n\r\n{body}",
                body.len()
            )),
            None => request.push_str("Content-Length: 0\r\n\r\n"),
        }
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        timeout(Duration::from_secs(5), stream.read_to_end(&mut response))
            .await
            .expect("http response")
            .unwrap();
        let response = String::from_utf8(response).unwrap();
        let status = response
            .split_whitespace()
            .nth(1)
            .and_then(|code| code.parse().ok())
            .expect("status line");
        let body = response
            .split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .unwrap_or_default();
        (status, body)
    }

    /// Wait until the server holds no room sessions.
    pub async fn wait_idle(&self) {
        let server = self.server.clone();
        wait_until(move || server.registry().room_count() == 0).await;
    }
}

// ─── Peer ────────────────────────────────────────────────────────────────────

pub struct Peer {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    pub doc: RoomDocument,
}

impl Peer {
    /// Connect to `room` and complete the initial sync.
    pub async fn connect(addr: SocketAddr, room: &str) -> Self {
        let url = format!("ws://{addr}/{room}");
        let (ws, _) = connect_async(url).await.unwrap();
        let mut peer = Self {
            ws,
            doc: RoomDocument::new(),
        };

        // Server opens with its state vector, then its full state
        let hello = peer.next_frame().await.expect("server hello");
        assert_eq!(hello.kind, FrameKind::SyncStep1);
        let state = peer.next_frame().await.expect("server state");
        assert_eq!(state.kind, FrameKind::SyncStep2);
        peer.absorb(&state);

        let diff = peer.doc.diff(&hello.payload).unwrap();
        peer.send(Frame::sync_step2(diff)).await;
        peer
    }

    /// Connect without reading anything, ever.
    pub async fn connect_silent(
        addr: SocketAddr,
        room: &str,
    ) -> WebSocketStream<MaybeTlsStream<TcpStream>> {
        let url = format!("ws://{addr}/{room}");
        connect_async(url).await.unwrap().0
    }

    pub async fn send(&mut self, frame: Frame) {
        let bytes = frame.encode().unwrap();
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: Vec<u8>) {
        self.ws.send(Message::Binary(bytes.into())).await.unwrap();
    }

    /// Next binary frame, or `None` after two seconds of silence or on close.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.next_frame_within(Duration::from_secs(2)).await
    }

    pub async fn next_frame_within(&mut self, wait: Duration) -> Option<Frame> {
        loop {
            match timeout(wait, self.ws.next()).await {
                Ok(Some(Ok(Message::Binary(data)))) => return Some(Frame::decode(&data).unwrap()),
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) | Err(_) => {
                    return None
                }
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    /// Request the room state and merge everything received until it arrives.
    pub async fn sync(&mut self) {
        let sv = self.doc.state_vector();
        self.send(Frame::sync_step1(sv)).await;
        loop {
            let frame = self.next_frame().await.expect("sync reply");
            self.absorb(&frame);
            if frame.kind == FrameKind::SyncStep2 {
                break;
            }
        }
    }

    /// Wait for the next update from another peer and merge it.
    pub async fn receive_update(&mut self) -> Frame {
        let frame = self.next_frame().await.expect("update");
        self.absorb(&frame);
        frame
    }

    fn absorb(&self, frame: &Frame) {
        if frame.carries_delta() {
            self.doc.apply_delta(&frame.payload, None).unwrap();
        }
    }

    /// Type locally and push the delta to the server.
    pub async fn type_text(&mut self, s: &str) -> Vec<u8> {
        let delta = make_delta(&self.doc, s);
        self.send(Frame::update(delta.clone())).await;
        delta
    }

    pub fn text(&self) -> String {
        text_of(&self.doc)
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
        // Drain until the server acknowledges the close
        while let Ok(Some(Ok(_))) = timeout(Duration::from_secs(1), self.ws.next()).await {}
    }
}
