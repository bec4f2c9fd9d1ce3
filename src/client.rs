//! Client sessions
//!
//! Each TCP connection gets two tasks and one session value:
//!
//! - a **read task** that frames bytes off the socket and turns them into
//!   coordinator events, one in-flight message at a time;
//! - a **write task** that drains the session's outbox channel, so every
//!   framed reply hits the socket atomically with respect to other sends on
//!   the same connection;
//! - a [`ClientSession`], owned by the coordinator, holding the per-client
//!   protocol state: the FIFO of pending data requests and the all-data
//!   subscription flag.
//!
//! Sessions know nothing of the source or the recording; they are protocol
//! adapters.

use std::collections::VecDeque;
use std::net::SocketAddr;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::coordinator::Event;
use crate::frame::DataFrame;
use crate::protocol::{self, ServerMessage};

pub type ClientId = u64;

/// A queued chunk request, waiting for the recording to grow past `stop`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PendingRequest {
    pub start: f32,
    pub stop: f32,
}

/// Per-connection state, owned and mutated only by the coordinator.
#[derive(Debug)]
pub struct ClientSession {
    id: ClientId,
    addr: SocketAddr,
    outbox: mpsc::UnboundedSender<Bytes>,
    cancel: CancellationToken,
    pending: VecDeque<PendingRequest>,
    requested_all_data: bool,
}

impl ClientSession {
    pub(crate) fn new(
        id: ClientId,
        addr: SocketAddr,
        outbox: mpsc::UnboundedSender<Bytes>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            addr,
            outbox,
            cancel,
            pending: VecDeque::new(),
            requested_all_data: false,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// Remote address, the client's identity in logs and status reports.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    /// Tear the connection down. The read task stops immediately; the write
    /// task drains queued replies, then closes the socket.
    pub fn disconnect(&self) {
        self.cancel.cancel();
    }

    // ── Pending chunk requests ───────────────────────────────────────

    pub fn add_pending_request(&mut self, start: f32, stop: f32) {
        self.pending.push_back(PendingRequest { start, stop });
    }

    /// How many queued requests end at or before recording time `t`.
    pub fn num_servicable(&self, t: f64) -> usize {
        self.pending
            .iter()
            .filter(|request| f64::from(request.stop) <= t)
            .count()
    }

    /// Remove and return the oldest queued request.
    pub fn pop_next_request(&mut self) -> Option<PendingRequest> {
        self.pending.pop_front()
    }

    // ── All-data subscription ────────────────────────────────────────

    pub fn requested_all_data(&self) -> bool {
        self.requested_all_data
    }

    pub fn set_all_data(&mut self, requested: bool) {
        self.requested_all_data = requested;
    }

    // ── Send operations ──────────────────────────────────────────────
    //
    // Fire-and-forget: a session whose connection died loses its replies,
    // and the coordinator learns of the death through the disconnect event.

    fn send(&self, msg: ServerMessage) {
        let _ = self.outbox.send(msg.encode());
    }

    /// Send pre-encoded bytes; the broadcast pass serializes one data frame
    /// and shares it across subscribers.
    pub fn send_encoded(&self, bytes: Bytes) {
        let _ = self.outbox.send(bytes);
    }

    pub fn send_source_create_response(&self, success: bool, msg: &str) {
        self.send(ServerMessage::SourceCreated {
            success,
            msg: msg.to_string(),
        });
    }

    pub fn send_source_delete_response(&self, success: bool, msg: &str) {
        self.send(ServerMessage::SourceDeleted {
            success,
            msg: msg.to_string(),
        });
    }

    pub fn send_server_set_response(&self, param: &str, success: bool, msg: &str) {
        self.send(ServerMessage::ServerSet {
            param: param.to_string(),
            success,
            msg: msg.to_string(),
        });
    }

    pub fn send_server_get_response(&self, param: &str, success: bool, value: Bytes) {
        self.send(ServerMessage::ServerGet {
            param: param.to_string(),
            success,
            value,
        });
    }

    pub fn send_source_set_response(&self, param: &str, success: bool, msg: &str) {
        self.send(ServerMessage::SourceSet {
            param: param.to_string(),
            success,
            msg: msg.to_string(),
        });
    }

    pub fn send_source_get_response(&self, param: &str, success: bool, value: Bytes) {
        self.send(ServerMessage::SourceGet {
            param: param.to_string(),
            success,
            value,
        });
    }

    pub fn send_start_recording_response(&self, success: bool, msg: &str) {
        self.send(ServerMessage::RecordingStarted {
            success,
            msg: msg.to_string(),
        });
    }

    pub fn send_stop_recording_response(&self, success: bool, msg: &str) {
        self.send(ServerMessage::RecordingStopped {
            success,
            msg: msg.to_string(),
        });
    }

    pub fn send_all_data_response(&self, success: bool, msg: &str) {
        self.send(ServerMessage::AllData {
            success,
            msg: msg.to_string(),
        });
    }

    pub fn send_data_frame(&self, frame: DataFrame) {
        self.send(ServerMessage::Data(frame));
    }

    pub fn send_error(&self, msg: &str) {
        self.send(ServerMessage::Error {
            msg: msg.to_string(),
        });
    }
}

/// Build a session for a fresh connection and spawn its read and write
/// tasks. The returned session goes to the coordinator in a connect event.
pub(crate) fn spawn_connection(
    id: ClientId,
    stream: TcpStream,
    addr: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
    tracker: &TaskTracker,
    shutdown: &CancellationToken,
) -> ClientSession {
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
    let cancel = shutdown.child_token();
    let (read_half, write_half) = stream.into_split();

    tracker.spawn(write_loop(id, write_half, outbox_rx));
    tracker.spawn(read_loop(id, read_half, events, cancel.clone()));

    ClientSession::new(id, addr, outbox_tx, cancel)
}

/// Drain the outbox onto the socket. Exits when the session is dropped
/// (after delivering everything already queued) or the peer stops reading.
async fn write_loop<W>(id: ClientId, mut writer: W, mut outbox: mpsc::UnboundedReceiver<Bytes>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(bytes) = outbox.recv().await {
        if let Err(e) = writer.write_all(&bytes).await {
            debug!(client = id, error = %e, "write to client failed");
            break;
        }
    }
    let _ = writer.shutdown().await;
}

/// Frame bytes off the socket and emit coordinator events. Strictly ordered:
/// one message is parsed and dispatched before the next is considered.
async fn read_loop<R>(
    id: ClientId,
    mut reader: R,
    events: mpsc::UnboundedSender<Event>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        loop {
            match protocol::decode_frame(&mut buf) {
                Ok(Some(payload)) => match protocol::parse_client_message(payload) {
                    Ok(message) => {
                        if events.send(Event::ClientMessage { id, message }).is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        // Bad payload, but the envelope kept us in sync:
                        // report it and keep the connection open.
                        if events
                            .send(Event::ClientProtocolError {
                                id,
                                message: e.to_string(),
                            })
                            .is_err()
                        {
                            return;
                        }
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    // Framing is unrecoverable (today only an oversized
                    // length prefix): report it and drop the client.
                    warn!(client = id, error = %e, "dropping client");
                    let _ = events.send(Event::ClientProtocolError {
                        id,
                        message: e.to_string(),
                    });
                    let _ = events.send(Event::ClientDisconnected { id });
                    return;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) => {
                    let _ = events.send(Event::ClientDisconnected { id });
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(client = id, error = %e, "read from client failed");
                    let _ = events.send(Event::ClientDisconnected { id });
                    return;
                }
            },
        }
    }
}
