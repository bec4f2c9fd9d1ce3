//! The coordinator
//!
//! One task owns everything mutable: the managed source (at most one), the
//! recording sink (at most one), server-scope parameters, and the connected
//! client sessions. Every producer - client read tasks, the acceptor, the
//! source, the HTTP handlers - funnels through the coordinator's event
//! channel, so no mutation ever races another.
//!
//! Requests to the source are one-shot and correlated: each carries an id,
//! the id maps to the originating client, and the paired reply event routes
//! the answer back to that client's session.
//!
//! Thread-safe sources live on a worker task and are reached over channels;
//! file-replay sources are executed inline, with the coordinator running
//! their poll timer itself.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Local, SecondsFormat};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{ClientId, ClientSession};
use crate::config::ServerConfig;
use crate::frame::{DataFrame, Samples};
use crate::protocol::{ClientMessage, ServerMessage, ServerParam};
use crate::recording::{resolve_save_filename, RecordingFile, RecordingSink};
use crate::source::{
    self, SourceCommand, SourceEvent, SourceHandle, SourceReply, SourceRequest, StatusMap,
    StatusValue, StreamChange,
};

/// Everything the coordinator reacts to.
#[derive(Debug)]
pub enum Event {
    /// The acceptor admitted a connection.
    ClientConnected { session: ClientSession },
    /// A client's read task saw the connection end.
    ClientDisconnected { id: ClientId },
    /// A parsed request from a client.
    ClientMessage {
        id: ClientId,
        message: ClientMessage,
    },
    /// A client sent something unintelligible; the connection survives.
    ClientProtocolError { id: ClientId, message: String },
    /// A reply, sample batch, or failure from the managed source.
    Source(SourceEvent),
    /// HTTP snapshot of server state.
    StatusQuery {
        reply: oneshot::Sender<StatusReport>,
    },
    /// HTTP snapshot of the source status map; `None` when no source.
    SourceStatusQuery {
        reply: oneshot::Sender<Option<StatusMap>>,
    },
}

/// Read-only projection of coordinator state for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    #[serde(rename = "start-time")]
    pub start_time: String,
    #[serde(rename = "save-directory")]
    pub save_directory: String,
    #[serde(rename = "save-file")]
    pub save_file: String,
    #[serde(rename = "recording-length")]
    pub recording_length: u32,
    #[serde(rename = "read-interval")]
    pub read_interval: u32,
    #[serde(rename = "recording-exists")]
    pub recording_exists: bool,
    #[serde(rename = "recording-position")]
    pub recording_position: f32,
    #[serde(rename = "source-exists")]
    pub source_exists: bool,
    #[serde(rename = "source-type")]
    pub source_type: String,
    #[serde(rename = "device-type")]
    pub device_type: String,
    #[serde(rename = "source-location")]
    pub source_location: String,
    pub clients: Vec<String>,
}

/// Where the source actor lives.
enum SourceDriver {
    /// Driven directly by the coordinator loop; the backing library is not
    /// reentrant across threads.
    Inline(Box<dyn source::DataSource>),
    /// Running on its own worker task.
    Worker(SourceHandle),
}

/// Lifecycle of the managed source as observed by clients.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SourcePhase {
    Creating,
    Ready,
    Streaming,
}

struct ManagedSource {
    driver: SourceDriver,
    phase: SourcePhase,
    kind: &'static str,
    location: String,
}

/// Who asked for the in-flight source operation with a given id.
#[derive(Debug)]
enum PendingOp {
    Initialize { client: ClientId },
    /// Internal status refresh; nobody to answer.
    Status,
    Get { client: ClientId },
    Set { client: ClientId },
    StartStream { client: ClientId },
    /// `None` when the stop came from the coordinator itself.
    StopStream { client: Option<ClientId> },
}

pub struct Coordinator {
    config: ServerConfig,
    start_time: DateTime<Local>,
    save_directory: String,
    save_file: String,
    recording_length: u32,
    read_interval: u32,
    source: Option<ManagedSource>,
    source_status: StatusMap,
    sink: Option<Box<dyn RecordingSink>>,
    /// Cleared before a stop-stream is issued, so late batches are ignored.
    samples_wanted: bool,
    clients: Vec<ClientSession>,
    pending_ops: HashMap<u32, PendingOp>,
    next_op_id: u32,
    /// Poll timer when an inline source is streaming.
    inline_stream: Option<Interval>,
    events: mpsc::UnboundedReceiver<Event>,
    events_tx: mpsc::UnboundedSender<Event>,
    client_count: Arc<AtomicUsize>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(
        config: ServerConfig,
        events: mpsc::UnboundedReceiver<Event>,
        events_tx: mpsc::UnboundedSender<Event>,
        client_count: Arc<AtomicUsize>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            save_directory: config.save_directory.clone(),
            save_file: String::new(),
            recording_length: config.recording_length,
            read_interval: config.read_interval,
            config,
            start_time: Local::now(),
            source: None,
            source_status: StatusMap::new(),
            sink: None,
            samples_wanted: false,
            clients: Vec::new(),
            pending_ops: HashMap::new(),
            next_op_id: 0,
            inline_stream: None,
            events,
            events_tx,
            client_count,
            cancel,
        }
    }

    /// Run until cancelled. Consumes the coordinator; state dies with it.
    pub async fn run(mut self) {
        debug!("coordinator running");
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = self.events.recv() => match event {
                    Some(event) => Some(event),
                    None => break,
                },
                _ = source::maybe_tick(self.inline_stream.as_mut()) => None,
            };
            match event {
                Some(event) => self.handle_event(event),
                None => self.poll_inline_source(),
            }
        }
        self.shutdown();
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::ClientConnected { session } => {
                info!(client = %session.address(), "new client connected");
                self.clients.push(session);
            }
            Event::ClientDisconnected { id } => self.remove_client(id),
            Event::ClientMessage { id, message } => self.handle_client_message(id, message),
            Event::ClientProtocolError { id, message } => {
                if let Some(client) = self.client(id) {
                    warn!(client = %client.address(), error = %message,
                        "error communicating with client");
                    client.send_error(&message);
                }
            }
            Event::Source(event) => self.handle_source_event(event),
            Event::StatusQuery { reply } => {
                let _ = reply.send(self.status_report());
            }
            Event::SourceStatusQuery { reply } => {
                let snapshot = self
                    .source
                    .is_some()
                    .then(|| self.source_status.clone());
                let _ = reply.send(snapshot);
            }
        }
    }

    fn handle_client_message(&mut self, id: ClientId, message: ClientMessage) {
        if self.client(id).is_none() {
            // Raced with a disconnect; nobody left to answer.
            return;
        }
        match message {
            ClientMessage::CreateSource { kind, location } => {
                self.handle_create_source(id, &kind, location)
            }
            ClientMessage::DeleteSource => self.handle_delete_source(id),
            ClientMessage::SetServerParam(param) => self.handle_set_server_param(id, param),
            ClientMessage::GetServerParam { param } => self.handle_get_server_param(id, &param),
            ClientMessage::SetSourceParam { param, raw } => {
                self.handle_set_source_param(id, param, raw)
            }
            ClientMessage::GetSourceParam { param } => self.handle_get_source_param(id, param),
            ClientMessage::StartRecording => self.handle_start_recording(id),
            ClientMessage::StopRecording => self.handle_stop_recording(id),
            ClientMessage::GetData { start, stop } => self.handle_data_request(id, start, stop),
            ClientMessage::GetAllData { requested } => self.handle_all_data_request(id, requested),
        }
    }

    // ── Client bookkeeping ───────────────────────────────────────────

    fn client(&self, id: ClientId) -> Option<&ClientSession> {
        self.clients.iter().find(|c| c.id() == id)
    }

    fn client_index(&self, id: ClientId) -> Option<usize> {
        self.clients.iter().position(|c| c.id() == id)
    }

    fn remove_client(&mut self, id: ClientId) {
        if let Some(index) = self.client_index(id) {
            let session = self.clients.remove(index);
            info!(client = %session.address(), "client disconnected");
            session.disconnect();
            self.client_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Send every client an error, then drop them all.
    fn disconnect_all_clients(&mut self, msg: &str) {
        for client in &self.clients {
            client.send_error(msg);
            client.disconnect();
        }
        self.client_count
            .fetch_sub(self.clients.len(), Ordering::Relaxed);
        self.clients.clear();
    }

    // ── Source plumbing ──────────────────────────────────────────────

    fn register_op(&mut self, op: PendingOp) -> u32 {
        let id = self.next_op_id;
        self.next_op_id = self.next_op_id.wrapping_add(1);
        self.pending_ops.insert(id, op);
        id
    }

    /// Hand a command to the source. Worker sources answer through the
    /// event channel; inline sources answer right here, through the same
    /// reply path.
    fn submit_source(&mut self, id: u32, command: SourceCommand) {
        let outcome = match &mut self.source {
            Some(managed) => match &mut managed.driver {
                SourceDriver::Worker(handle) => {
                    handle.submit(SourceRequest { id, command });
                    None
                }
                SourceDriver::Inline(src) => Some(source::execute(src.as_mut(), command)),
            },
            None => {
                self.pending_ops.remove(&id);
                return;
            }
        };
        if let Some((reply, change)) = outcome {
            match change {
                StreamChange::Start(period) => {
                    self.inline_stream = Some(source::stream_interval(period))
                }
                StreamChange::Stop => self.inline_stream = None,
                StreamChange::None => {}
            }
            self.handle_source_event(SourceEvent::Reply { id, reply });
        }
    }

    /// One poll-timer tick for an inline source.
    fn poll_inline_source(&mut self) {
        let polled = match &mut self.source {
            Some(ManagedSource {
                driver: SourceDriver::Inline(src),
                ..
            }) => source::poll_stream(src.as_mut()),
            _ => {
                self.inline_stream = None;
                return;
            }
        };
        match polled {
            Ok(Some(samples)) => self.handle_samples(samples),
            Ok(None) => unreachable!("poll_stream maps exhaustion to an error"),
            Err(msg) => {
                self.inline_stream = None;
                self.handle_source_error(&msg);
            }
        }
    }

    fn teardown_source(&mut self) {
        self.source = None;
        self.inline_stream = None;
        self.source_status.clear();
    }

    fn set_phase(&mut self, phase: SourcePhase) {
        if let Some(managed) = &mut self.source {
            managed.phase = phase;
        }
    }

    fn refresh_source_status(&mut self) {
        let op = self.register_op(PendingOp::Status);
        self.submit_source(op, SourceCommand::RequestStatus);
    }

    // ── Source events ────────────────────────────────────────────────

    fn handle_source_event(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Reply { id, reply } => match self.pending_ops.remove(&id) {
                Some(op) => self.handle_source_reply(op, reply),
                None => warn!(request = id, "source reply for an unknown request"),
            },
            SourceEvent::Samples(samples) => self.handle_samples(samples),
            SourceEvent::Error(msg) => self.handle_source_error(&msg),
        }
    }

    fn handle_source_reply(&mut self, op: PendingOp, reply: SourceReply) {
        match (op, reply) {
            (PendingOp::Initialize { client }, SourceReply::Initialized { success, msg }) => {
                if success {
                    self.set_phase(SourcePhase::Ready);
                    self.refresh_source_status();
                    if let Some(c) = self.client(client) {
                        info!(client = %c.address(), "data source successfully initialized");
                    }
                } else {
                    warn!(error = %msg, "could not initialize data source");
                    self.teardown_source();
                }
                if let Some(c) = self.client(client) {
                    c.send_source_create_response(success, &msg);
                }
            }
            (PendingOp::Status, SourceReply::Status(map)) => {
                self.source_status = map;
            }
            (PendingOp::Get { client }, SourceReply::Get { param, result }) => {
                match result {
                    Ok(value) => {
                        self.source_status.insert(param.clone(), value.clone());
                        if let Some(c) = self.client(client) {
                            c.send_source_get_response(&param, true, value.encode_wire());
                        }
                    }
                    Err(msg) => {
                        warn!(param = %param, error = %msg,
                            "error retrieving parameter from source");
                        if let Some(c) = self.client(client) {
                            c.send_source_get_response(&param, false, Bytes::from(msg));
                        }
                    }
                }
            }
            (PendingOp::Set { client }, SourceReply::Set { param, success, msg }) => {
                if success {
                    self.refresh_source_status();
                    if let Some(c) = self.client(client) {
                        info!(client = %c.address(), param = %param,
                            "client set source parameter");
                    }
                } else {
                    warn!(param = %param, error = %msg, "source parameter not set");
                }
                if let Some(c) = self.client(client) {
                    c.send_source_set_response(&param, success, &msg);
                }
            }
            (PendingOp::StartStream { client }, SourceReply::StreamStarted { success, msg }) => {
                if success {
                    self.set_phase(SourcePhase::Streaming);
                    if let Some(c) = self.client(client) {
                        info!(client = %c.address(), file = %self.save_file,
                            "recording started");
                    }
                } else {
                    warn!(error = %msg, "could not start recording");
                    self.samples_wanted = false;
                    if let Some(mut sink) = self.sink.take() {
                        let _ = sink.finalize();
                    }
                    self.save_file.clear();
                }
                if let Some(c) = self.client(client) {
                    c.send_start_recording_response(success, &msg);
                }
            }
            (PendingOp::StopStream { client }, SourceReply::StreamStopped { success, msg }) => {
                if success {
                    if let Some(mut sink) = self.sink.take() {
                        info!(seconds = sink.length(), "recording stopped");
                        let _ = sink.finalize();
                    }
                    self.save_file.clear();
                    self.set_phase(SourcePhase::Ready);
                } else {
                    warn!(error = %msg, "could not stop recording");
                }
                if let Some(c) = client.and_then(|id| self.client(id)) {
                    c.send_stop_recording_response(success, &msg);
                }
            }
            (op, reply) => {
                warn!(?op, ?reply, "mismatched source reply");
            }
        }
    }

    /// Fatal source failure: every client is told and disconnected, then
    /// the source is removed.
    fn handle_source_error(&mut self, msg: &str) {
        warn!(error = %msg, "error from data source");
        self.disconnect_all_clients(msg);
        self.samples_wanted = false;
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.finalize();
        }
        self.save_file.clear();
        self.teardown_source();
    }

    /// A streamed batch: append, broadcast, drain pendings, check length.
    fn handle_samples(&mut self, samples: Samples) {
        if !self.samples_wanted || samples.is_empty() {
            return;
        }
        let Some(sink) = self.sink.as_mut() else {
            return;
        };
        if let Err(e) = sink.append(&samples) {
            let msg = format!("Recording failed, data could not be written: {e:#}");
            self.fail_streaming(&msg);
            return;
        }
        let sample_rate = sink.sample_rate();
        let nsamples = sink.nsamples();
        let recorded = sink.length();

        // Forward the batch to every all-data subscriber, serializing once.
        if self.clients.iter().any(|c| c.requested_all_data()) {
            let rows = samples.nsamples() as u64;
            let start = (nsamples - rows) as f64 / sample_rate;
            let frame = DataFrame::new(start as f32, recorded as f32, samples);
            let encoded = ServerMessage::Data(frame).encode();
            for client in &self.clients {
                if client.requested_all_data() {
                    client.send_encoded(encoded.clone());
                }
            }
        }

        // Serve every pending request the recording now covers, oldest
        // first per client.
        if let Some(sink) = self.sink.as_mut() {
            for client in &mut self.clients {
                while client.num_servicable(recorded) > 0 {
                    let Some(request) = client.pop_next_request() else {
                        break;
                    };
                    let start_sample = (f64::from(request.start) * sample_rate) as u64;
                    let end_sample = (f64::from(request.stop) * sample_rate) as u64;
                    match sink.read(start_sample, end_sample) {
                        Ok(chunk) => client.send_data_frame(DataFrame::new(
                            request.start,
                            request.stop,
                            chunk,
                        )),
                        Err(e) => client.send_error(&format!(
                            "Could not read requested chunk ({}, {}): {e:#}",
                            request.start, request.stop
                        )),
                    }
                }
            }
        }

        if recorded >= f64::from(self.recording_length) {
            self.finish_recording(recorded);
        }
    }

    /// The recording reached its requested length.
    fn finish_recording(&mut self, recorded: f64) {
        self.samples_wanted = false;
        let op = self.register_op(PendingOp::StopStream { client: None });
        self.submit_source(op, SourceCommand::StopStream);
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.finalize();
        }
        self.save_file.clear();
        self.set_phase(SourcePhase::Ready);
        info!(seconds = recorded, "recording finished streaming to data file");
    }

    /// A write to the recording failed mid-stream. Fail-fast: everyone is
    /// told, everything is torn down.
    fn fail_streaming(&mut self, msg: &str) {
        warn!(error = %msg, "streaming failed");
        self.disconnect_all_clients(msg);
        self.samples_wanted = false;
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.finalize();
        }
        self.save_file.clear();
        let op = self.register_op(PendingOp::StopStream { client: None });
        self.submit_source(op, SourceCommand::StopStream);
        self.teardown_source();
    }

    // ── Client requests ──────────────────────────────────────────────

    fn handle_create_source(&mut self, id: ClientId, kind: &str, location: String) {
        if self.source.is_some() {
            let msg = "Cannot create data source while another exists.";
            warn!("{msg}");
            if let Some(c) = self.client(id) {
                c.send_source_create_response(false, msg);
            }
            return;
        }
        match source::create(kind, &location) {
            Ok(src) => {
                let kind = src.source_type();
                let driver = if src.is_thread_safe() {
                    let (src_tx, mut src_rx) = mpsc::unbounded_channel();
                    let events_tx = self.events_tx.clone();
                    tokio::spawn(async move {
                        while let Some(event) = src_rx.recv().await {
                            if events_tx.send(Event::Source(event)).is_err() {
                                break;
                            }
                        }
                    });
                    SourceDriver::Worker(source::spawn_worker(src, src_tx))
                } else {
                    SourceDriver::Inline(src)
                };
                self.source = Some(ManagedSource {
                    driver,
                    phase: SourcePhase::Creating,
                    kind,
                    location,
                });
                let op = self.register_op(PendingOp::Initialize { client: id });
                self.submit_source(op, SourceCommand::Initialize);
            }
            Err(e) => {
                let msg = format!("Could not create source! {e:#}");
                warn!("{msg}");
                if let Some(c) = self.client(id) {
                    c.send_source_create_response(false, &msg);
                }
            }
        }
    }

    fn handle_delete_source(&mut self, id: ClientId) {
        let (success, msg) = if self.source.is_none() {
            (false, "No source exists to be deleted.")
        } else if self.sink.is_some() {
            (
                false,
                "Cannot delete source while recording is active, stop it first.",
            )
        } else {
            self.teardown_source();
            (true, "")
        };
        if let Some(c) = self.client(id) {
            if success {
                info!(client = %c.address(), "data source deleted");
            } else {
                warn!("{msg}");
            }
            c.send_source_delete_response(success, msg);
        }
    }

    fn handle_set_server_param(&mut self, id: ClientId, param: ServerParam) {
        let name = param.name();
        let result: Result<(), String> = if self.sink.is_some() {
            Err(
                "Cannot set server parameters while a recording is active. Stop it first."
                    .to_string(),
            )
        } else {
            match param {
                ServerParam::SaveFile(file) => {
                    let path = Path::new(&self.save_directory).join(&file);
                    if path.exists() {
                        Err("The requested file already exists, remove it first.".to_string())
                    } else {
                        self.save_file = file;
                        Ok(())
                    }
                }
                ServerParam::SaveDirectory(dir) => {
                    if Path::new(&dir).is_dir() {
                        self.save_directory = dir;
                        Ok(())
                    } else {
                        Err(format!("The requested save directory does not exist: {dir}"))
                    }
                }
                ServerParam::RecordingLength(length) => {
                    self.recording_length = length;
                    Ok(())
                }
                ServerParam::ReadInterval(interval) => {
                    self.read_interval = interval;
                    Ok(())
                }
            }
        };
        if let Some(c) = self.client(id) {
            match &result {
                Ok(()) => info!(client = %c.address(), param = name, "server parameter set"),
                Err(msg) => warn!("{msg}"),
            }
            c.send_server_set_response(name, result.is_ok(), result.err().as_deref().unwrap_or(""));
        }
    }

    fn handle_get_server_param(&mut self, id: ClientId, param: &str) {
        let result: Result<Bytes, String> = match param {
            "save-file" => Ok(Bytes::from(self.save_file.clone())),
            "save-directory" => Ok(Bytes::from(self.save_directory.clone())),
            "recording-length" => Ok(Bytes::copy_from_slice(&self.recording_length.to_le_bytes())),
            "read-interval" => Ok(Bytes::copy_from_slice(&self.read_interval.to_le_bytes())),
            "recording-exists" => Ok(Bytes::copy_from_slice(&[self.sink.is_some() as u8])),
            "recording-position" => {
                let position = self.sink.as_ref().map_or(0.0, |sink| sink.length()) as f32;
                Ok(Bytes::copy_from_slice(&position.to_le_bytes()))
            }
            "source-exists" => Ok(Bytes::copy_from_slice(&[self.source.is_some() as u8])),
            "source-type" => match &self.source {
                Some(managed) => Ok(Bytes::from(managed.kind)),
                None => Err("There is no active data source.".to_string()),
            },
            "source-location" => match &self.source {
                Some(managed) => Ok(Bytes::from(managed.location.clone())),
                None => Err("There is no active data source.".to_string()),
            },
            "start-time" => Ok(Bytes::from(
                self.start_time.to_rfc3339_opts(SecondsFormat::Secs, false),
            )),
            _ => Err(format!("Unknown parameter type: {param}")),
        };
        if let Some(c) = self.client(id) {
            match result {
                Ok(value) => c.send_server_get_response(param, true, value),
                Err(msg) => c.send_server_get_response(param, false, Bytes::from(msg)),
            }
        }
    }

    fn handle_set_source_param(&mut self, id: ClientId, param: String, raw: Bytes) {
        let phase = self.source.as_ref().map(|s| s.phase);
        let rejection = match phase {
            None => Some("There is no active data source."),
            Some(SourcePhase::Creating) => Some("The data source is still initializing."),
            Some(SourcePhase::Streaming) => {
                Some("Cannot set source parameters while the stream is running.")
            }
            Some(SourcePhase::Ready) => None,
        };
        if let Some(msg) = rejection {
            if let Some(c) = self.client(id) {
                c.send_source_set_response(&param, false, msg);
            }
            return;
        }
        let op = self.register_op(PendingOp::Set { client: id });
        self.submit_source(op, SourceCommand::Set { param, raw });
    }

    fn handle_get_source_param(&mut self, id: ClientId, param: String) {
        if self.source.is_none() {
            if let Some(c) = self.client(id) {
                c.send_source_get_response(
                    &param,
                    false,
                    Bytes::from_static(b"There is no active data source."),
                );
            }
            return;
        }
        let op = self.register_op(PendingOp::Get { client: id });
        self.submit_source(op, SourceCommand::Get { param });
    }

    fn handle_start_recording(&mut self, id: ClientId) {
        let rejection = match self.source.as_ref().map(|s| s.phase) {
            None => Some("Cannot start recording, there is no active data source.".to_string()),
            Some(SourcePhase::Creating) => {
                Some("Cannot start recording, the data source is still initializing.".to_string())
            }
            _ if self.sink.is_some() => {
                Some("Cannot create recording, one is already active.".to_string())
            }
            _ => None,
        };
        if let Some(msg) = rejection {
            warn!("{msg}");
            if let Some(c) = self.client(id) {
                c.send_start_recording_response(false, &msg);
            }
            return;
        }

        match self.create_sink() {
            Ok((sink, filename)) => {
                self.save_file = filename;
                self.sink = Some(sink);
                self.samples_wanted = true;
                let op = self.register_op(PendingOp::StartStream { client: id });
                self.submit_source(
                    op,
                    SourceCommand::StartStream {
                        interval: Duration::from_millis(u64::from(self.read_interval)),
                    },
                );
            }
            Err(msg) => {
                warn!("{msg}");
                if let Some(c) = self.client(id) {
                    c.send_start_recording_response(false, &msg);
                }
            }
        }
    }

    /// Create the recording file and stamp it with the source's reported
    /// gain, range, date and layout.
    fn create_sink(&mut self) -> Result<(Box<dyn RecordingSink>, String), String> {
        let sample_rate = self
            .source_status
            .get("sample-rate")
            .and_then(StatusValue::as_f64)
            .ok_or("Cannot start recording, the source has not reported a sample rate.")?;
        let nchannels = self
            .source_status
            .get("nchannels")
            .and_then(StatusValue::as_i64)
            .filter(|&n| n > 0)
            .ok_or("Cannot start recording, the source has not reported its channel count.")?;

        let filename = resolve_save_filename(&self.save_file, Local::now());
        let path = Path::new(&self.save_directory).join(&filename);
        if path.exists() {
            return Err("The requested file already exists, remove it first.".to_string());
        }

        let mut sink = RecordingFile::create(&path, sample_rate, nchannels as u32)
            .map_err(|e| format!("{e:#}"))?;
        if let Some(gain) = self.source_status.get("gain").and_then(StatusValue::as_f64) {
            sink.set_gain(gain as f32).map_err(|e| format!("{e:#}"))?;
        }
        if let Some(range) = self
            .source_status
            .get("adc-range")
            .and_then(StatusValue::as_f64)
        {
            sink.set_offset(range as f32).map_err(|e| format!("{e:#}"))?;
        }
        sink.set_date(&Local::now().to_rfc3339_opts(SecondsFormat::Secs, false))
            .map_err(|e| format!("{e:#}"))?;

        let device_type = self
            .source_status
            .get("device-type")
            .and_then(StatusValue::as_str)
            .unwrap_or("");
        if device_type.starts_with("hidens") {
            if let Some(StatusValue::Bytes(config)) = self.source_status.get("configuration") {
                sink.set_configuration(config).map_err(|e| format!("{e:#}"))?;
            }
        } else if let Some(StatusValue::FloatSeq(output)) = self.source_status.get("analog-output")
        {
            sink.set_analog_output_size(output.len() as u32)
                .map_err(|e| format!("{e:#}"))?;
        }
        Ok((Box::new(sink), filename))
    }

    fn handle_stop_recording(&mut self, id: ClientId) {
        let rejection = if self.source.is_none() {
            Some("Cannot stop recording, there is no active data source.")
        } else if self.sink.is_none() {
            Some("Cannot stop recording, there is no recording to stop.")
        } else {
            None
        };
        if let Some(msg) = rejection {
            warn!("{msg}");
            if let Some(c) = self.client(id) {
                c.send_stop_recording_response(false, msg);
            }
            return;
        }
        self.samples_wanted = false;
        let op = self.register_op(PendingOp::StopStream { client: Some(id) });
        self.submit_source(op, SourceCommand::StopStream);
    }

    fn handle_data_request(&mut self, id: ClientId, start: f32, stop: f32) {
        let Some(index) = self.client_index(id) else {
            return;
        };
        let Some(sink) = self.sink.as_mut() else {
            self.clients[index]
                .send_error("There is no active recording, data cannot be requested.");
            return;
        };
        let sample_rate = sink.sample_rate();
        if let Err(msg) = verify_chunk_request(
            start,
            stop,
            sample_rate,
            self.config.max_chunk_size,
            self.recording_length,
        ) {
            self.clients[index].send_error(&msg);
            return;
        }
        let end_sample = (f64::from(stop) * sample_rate) as u64;
        if end_sample <= sink.nsamples() {
            let start_sample = (f64::from(start) * sample_rate) as u64;
            let client = &self.clients[index];
            match sink.read(start_sample, end_sample) {
                Ok(chunk) => client.send_data_frame(DataFrame::new(start, stop, chunk)),
                Err(e) => client.send_error(&format!(
                    "Could not read requested chunk ({start}, {stop}): {e:#}"
                )),
            }
        } else {
            self.clients[index].add_pending_request(start, stop);
        }
    }

    fn handle_all_data_request(&mut self, id: ClientId, requested: bool) {
        let Some(index) = self.client_index(id) else {
            return;
        };
        if self.sink.is_none() || !requested {
            self.clients[index].set_all_data(requested);
            self.clients[index].send_all_data_response(true, "");
        } else {
            self.clients[index].send_all_data_response(
                false,
                "Can only request all data before a recording starts. \
                 Data must now be requested in individual chunks.",
            );
        }
    }

    // ── Status projection ────────────────────────────────────────────

    fn status_report(&self) -> StatusReport {
        StatusReport {
            start_time: self.start_time.to_rfc3339_opts(SecondsFormat::Secs, false),
            save_directory: self.save_directory.clone(),
            save_file: self.save_file.clone(),
            recording_length: self.recording_length,
            read_interval: self.read_interval,
            recording_exists: self.sink.is_some(),
            recording_position: self.sink.as_ref().map_or(0.0, |sink| sink.length()) as f32,
            source_exists: self.source.is_some(),
            source_type: self
                .source
                .as_ref()
                .map_or_else(String::new, |s| s.kind.to_string()),
            device_type: self
                .source_status
                .get("device-type")
                .and_then(StatusValue::as_str)
                .unwrap_or("")
                .to_string(),
            source_location: self
                .source
                .as_ref()
                .map_or_else(String::new, |s| s.location.clone()),
            clients: self.clients.iter().map(|c| c.address()).collect(),
        }
    }

    /// Shutdown: flush and close everything, best-effort.
    fn shutdown(&mut self) {
        info!("coordinator shutting down");
        for client in &self.clients {
            client.disconnect();
        }
        self.client_count
            .fetch_sub(self.clients.len(), Ordering::Relaxed);
        self.clients.clear();
        self.samples_wanted = false;
        if let Some(mut sink) = self.sink.take() {
            let _ = sink.finalize();
        }
        self.teardown_source();
    }
}

/// Whether a chunk request is acceptable right now.
fn verify_chunk_request(
    start: f32,
    stop: f32,
    sample_rate: f64,
    max_chunk_size: f64,
    recording_length: u32,
) -> Result<(), String> {
    let start = f64::from(start);
    let stop = f64::from(stop);
    if start < 0.0 {
        return Err(format!(
            "Chunk request start must be at least 0 seconds, got {start}."
        ));
    }
    if stop <= start + 1.0 / sample_rate {
        return Err(format!(
            "Chunk request stop of {stop} seconds must exceed its start of {start} \
             by at least one sample."
        ));
    }
    if stop - start > max_chunk_size {
        return Err(format!(
            "Chunk requests may span at most {max_chunk_size} seconds."
        ));
    }
    if stop > f64::from(recording_length) {
        return Err(format!(
            "Chunk request stop of {stop} seconds is past the recording length \
             of {recording_length} seconds."
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode_frame, ClientMessage};
    use crate::recording::RecordingFile;
    use bytes::BytesMut;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::time::timeout;

    /// A coordinator under test, with fabricated client connections.
    struct Harness {
        events: mpsc::UnboundedSender<Event>,
        cancel: CancellationToken,
        dir: TempDir,
        next_client: ClientId,
    }

    impl Harness {
        fn start(mut config: ServerConfig) -> Self {
            let dir = tempfile::tempdir().unwrap();
            config.save_directory = dir.path().to_string_lossy().into_owned();
            let (events_tx, events_rx) = mpsc::unbounded_channel();
            let cancel = CancellationToken::new();
            let coordinator = Coordinator::new(
                config,
                events_rx,
                events_tx.clone(),
                Arc::new(AtomicUsize::new(0)),
                cancel.clone(),
            );
            tokio::spawn(coordinator.run());
            Self {
                events: events_tx,
                cancel,
                dir,
                next_client: 0,
            }
        }

        /// Write a small recording to replay through a file source.
        fn fixture(&self, name: &str, sample_rate: f64, nchannels: u32, nsamples: u32) -> String {
            let path = self.dir.path().join(name);
            let mut file = RecordingFile::create(&path, sample_rate, nchannels).unwrap();
            let data = (0..nsamples as i32 * nchannels as i32)
                .map(|v| v as i16)
                .collect();
            file.append(&Samples::from_vec(data, nchannels)).unwrap();
            file.finalize().unwrap();
            path.to_string_lossy().into_owned()
        }

        fn connect(&mut self) -> (ClientId, mpsc::UnboundedReceiver<Bytes>) {
            let id = self.next_client;
            self.next_client += 1;
            let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
            let session = ClientSession::new(
                id,
                format!("127.0.0.1:{}", 40000 + id).parse().unwrap(),
                outbox_tx,
                CancellationToken::new(),
            );
            self.events
                .send(Event::ClientConnected { session })
                .unwrap();
            (id, outbox_rx)
        }

        fn send(&self, id: ClientId, message: ClientMessage) {
            self.events
                .send(Event::ClientMessage { id, message })
                .unwrap();
        }

        fn inject_samples(&self, samples: Samples) {
            self.events
                .send(Event::Source(SourceEvent::Samples(samples)))
                .unwrap();
        }

        async fn recv(&self, rx: &mut mpsc::UnboundedReceiver<Bytes>) -> ServerMessage {
            let bytes = timeout(Duration::from_secs(5), rx.recv())
                .await
                .expect("timed out waiting for a reply")
                .expect("connection closed");
            let mut buf = BytesMut::from(&bytes[..]);
            let payload = decode_frame(&mut buf).unwrap().unwrap();
            ServerMessage::parse(payload).unwrap()
        }

        /// Create a file source and wait for the deferred reply.
        async fn create_source(
            &self,
            id: ClientId,
            rx: &mut mpsc::UnboundedReceiver<Bytes>,
            location: &str,
        ) {
            self.send(
                id,
                ClientMessage::CreateSource {
                    kind: "file".into(),
                    location: location.into(),
                },
            );
            match self.recv(rx).await {
                ServerMessage::SourceCreated { success: true, .. } => {}
                other => panic!("source creation failed: {other:?}"),
            }
        }

        async fn start_recording(&self, id: ClientId, rx: &mut mpsc::UnboundedReceiver<Bytes>) {
            self.send(id, ClientMessage::StartRecording);
            match self.recv(rx).await {
                ServerMessage::RecordingStarted { success: true, .. } => {}
                other => panic!("recording start failed: {other:?}"),
            }
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.cancel.cancel();
        }
    }

    /// Config with an effectively-disabled poll timer so tests inject
    /// sample batches deterministically.
    fn quiet_config() -> ServerConfig {
        ServerConfig {
            read_interval: 3_600_000,
            recording_length: 10,
            ..ServerConfig::default()
        }
    }

    // ── Source lifecycle ─────────────────────────────────────────────

    #[tokio::test]
    async fn create_and_delete_roundtrip() {
        let mut h = Harness::start(quiet_config());
        let fixture = h.fixture("session.h5", 1000.0, 4, 100);
        let (id, mut rx) = h.connect();

        h.create_source(id, &mut rx, &fixture).await;

        h.send(id, ClientMessage::DeleteSource);
        assert_eq!(
            h.recv(&mut rx).await,
            ServerMessage::SourceDeleted {
                success: true,
                msg: String::new()
            }
        );
    }

    #[tokio::test]
    async fn second_create_is_rejected() {
        let mut h = Harness::start(quiet_config());
        let fixture = h.fixture("session.h5", 1000.0, 4, 100);
        let (id, mut rx) = h.connect();
        h.create_source(id, &mut rx, &fixture).await;

        h.send(
            id,
            ClientMessage::CreateSource {
                kind: "file".into(),
                location: fixture,
            },
        );
        assert_eq!(
            h.recv(&mut rx).await,
            ServerMessage::SourceCreated {
                success: false,
                msg: "Cannot create data source while another exists.".into()
            }
        );
    }

    #[tokio::test]
    async fn unknown_source_type_reports_failure() {
        let mut h = Harness::start(quiet_config());
        let (id, mut rx) = h.connect();

        h.send(
            id,
            ClientMessage::CreateSource {
                kind: "laser".into(),
                location: String::new(),
            },
        );
        assert_eq!(
            h.recv(&mut rx).await,
            ServerMessage::SourceCreated {
                success: false,
                msg: "Could not create source! Unknown source type: laser".into()
            }
        );
    }

    #[tokio::test]
    async fn failed_initialization_deletes_the_source() {
        let mut h = Harness::start(quiet_config());
        let (id, mut rx) = h.connect();

        h.send(
            id,
            ClientMessage::CreateSource {
                kind: "file".into(),
                location: "/nonexistent/rec.h5".into(),
            },
        );
        match h.recv(&mut rx).await {
            ServerMessage::SourceCreated { success: false, .. } => {}
            other => panic!("expected failure, got {other:?}"),
        }

        // The slot is free again.
        let fixture = h.fixture("session.h5", 1000.0, 4, 100);
        h.create_source(id, &mut rx, &fixture).await;
    }

    #[tokio::test]
    async fn delete_without_source_fails() {
        let mut h = Harness::start(quiet_config());
        let (id, mut rx) = h.connect();

        h.send(id, ClientMessage::DeleteSource);
        assert_eq!(
            h.recv(&mut rx).await,
            ServerMessage::SourceDeleted {
                success: false,
                msg: "No source exists to be deleted.".into()
            }
        );
    }

    #[tokio::test]
    async fn delete_is_blocked_while_recording() {
        let mut h = Harness::start(quiet_config());
        let fixture = h.fixture("session.h5", 1000.0, 4, 100);
        let (id, mut rx) = h.connect();
        h.create_source(id, &mut rx, &fixture).await;
        h.start_recording(id, &mut rx).await;

        h.send(id, ClientMessage::DeleteSource);
        assert_eq!(
            h.recv(&mut rx).await,
            ServerMessage::SourceDeleted {
                success: false,
                msg: "Cannot delete source while recording is active, stop it first.".into()
            }
        );
    }

    // ── Server parameters ────────────────────────────────────────────

    #[tokio::test]
    async fn server_params_are_frozen_while_recording() {
        let mut h = Harness::start(quiet_config());
        let fixture = h.fixture("session.h5", 1000.0, 4, 100);
        let (id, mut rx) = h.connect();
        h.create_source(id, &mut rx, &fixture).await;
        h.start_recording(id, &mut rx).await;

        h.send(
            id,
            ClientMessage::SetServerParam(ServerParam::RecordingLength(500)),
        );
        assert_eq!(
            h.recv(&mut rx).await,
            ServerMessage::ServerSet {
                param: "recording-length".into(),
                success: false,
                msg: "Cannot set server parameters while a recording is active. Stop it first."
                    .into()
            }
        );

        // Unchanged.
        h.send(
            id,
            ClientMessage::GetServerParam {
                param: "recording-length".into(),
            },
        );
        match h.recv(&mut rx).await {
            ServerMessage::ServerGet {
                success: true,
                value,
                ..
            } => assert_eq!(&value[..], &10u32.to_le_bytes()),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn save_directory_must_exist() {
        let mut h = Harness::start(quiet_config());
        let (id, mut rx) = h.connect();

        h.send(
            id,
            ClientMessage::SetServerParam(ServerParam::SaveDirectory(
                "/nonexistent/recordings".into(),
            )),
        );
        match h.recv(&mut rx).await {
            ServerMessage::ServerSet { success: false, .. } => {}
            other => panic!("unexpected reply {other:?}"),
        }

        let good = h.dir.path().to_string_lossy().into_owned();
        h.send(
            id,
            ClientMessage::SetServerParam(ServerParam::SaveDirectory(good)),
        );
        match h.recv(&mut rx).await {
            ServerMessage::ServerSet { success: true, .. } => {}
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn save_file_conflicts_are_rejected() {
        let mut h = Harness::start(quiet_config());
        let (id, mut rx) = h.connect();
        std::fs::write(h.dir.path().join("taken.h5"), b"data").unwrap();

        h.send(
            id,
            ClientMessage::SetServerParam(ServerParam::SaveFile("taken.h5".into())),
        );
        assert_eq!(
            h.recv(&mut rx).await,
            ServerMessage::ServerSet {
                param: "save-file".into(),
                success: false,
                msg: "The requested file already exists, remove it first.".into()
            }
        );
    }

    #[tokio::test]
    async fn server_get_covers_the_key_set() {
        let mut h = Harness::start(quiet_config());
        let fixture = h.fixture("session.h5", 1000.0, 4, 100);
        let (id, mut rx) = h.connect();
        h.create_source(id, &mut rx, &fixture).await;

        let get = |param: &str| ClientMessage::GetServerParam {
            param: param.into(),
        };

        h.send(id, get("read-interval"));
        match h.recv(&mut rx).await {
            ServerMessage::ServerGet { success: true, value, .. } => {
                assert_eq!(&value[..], &3_600_000u32.to_le_bytes())
            }
            other => panic!("unexpected reply {other:?}"),
        }

        h.send(id, get("source-exists"));
        match h.recv(&mut rx).await {
            ServerMessage::ServerGet { success: true, value, .. } => assert_eq!(&value[..], &[1]),
            other => panic!("unexpected reply {other:?}"),
        }

        h.send(id, get("source-type"));
        match h.recv(&mut rx).await {
            ServerMessage::ServerGet { success: true, value, .. } => {
                assert_eq!(&value[..], b"file")
            }
            other => panic!("unexpected reply {other:?}"),
        }

        h.send(id, get("recording-exists"));
        match h.recv(&mut rx).await {
            ServerMessage::ServerGet { success: true, value, .. } => assert_eq!(&value[..], &[0]),
            other => panic!("unexpected reply {other:?}"),
        }

        h.send(id, get("recording-position"));
        match h.recv(&mut rx).await {
            ServerMessage::ServerGet { success: true, value, .. } => {
                assert_eq!(&value[..], &0f32.to_le_bytes())
            }
            other => panic!("unexpected reply {other:?}"),
        }

        h.send(id, get("start-time"));
        match h.recv(&mut rx).await {
            ServerMessage::ServerGet { success: true, value, .. } => assert!(!value.is_empty()),
            other => panic!("unexpected reply {other:?}"),
        }

        h.send(id, get("chronometer"));
        match h.recv(&mut rx).await {
            ServerMessage::ServerGet { success: false, value, .. } => {
                assert_eq!(&value[..], b"Unknown parameter type: chronometer")
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    // ── Source parameters ────────────────────────────────────────────

    #[tokio::test]
    async fn source_get_is_correlated_back_to_the_requester() {
        let mut h = Harness::start(quiet_config());
        let fixture = h.fixture("session.h5", 1000.0, 4, 100);
        let (id, mut rx) = h.connect();
        h.create_source(id, &mut rx, &fixture).await;

        h.send(
            id,
            ClientMessage::GetSourceParam {
                param: "sample-rate".into(),
            },
        );
        match h.recv(&mut rx).await {
            ServerMessage::SourceGet {
                param,
                success: true,
                value,
            } => {
                assert_eq!(param, "sample-rate");
                assert_eq!(&value[..], &1000f64.to_le_bytes());
            }
            other => panic!("unexpected reply {other:?}"),
        }

        h.send(
            id,
            ClientMessage::GetSourceParam {
                param: "warp-drive".into(),
            },
        );
        match h.recv(&mut rx).await {
            ServerMessage::SourceGet { success: false, .. } => {}
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn file_source_set_is_refused_through_the_correlation_path() {
        let mut h = Harness::start(quiet_config());
        let fixture = h.fixture("session.h5", 1000.0, 4, 100);
        let (id, mut rx) = h.connect();
        h.create_source(id, &mut rx, &fixture).await;

        h.send(
            id,
            ClientMessage::SetSourceParam {
                param: "gain".into(),
                raw: Bytes::from_static(&[0, 0, 0, 64]),
            },
        );
        match h.recv(&mut rx).await {
            ServerMessage::SourceSet {
                param,
                success: false,
                ..
            } => assert_eq!(param, "gain"),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn source_params_require_a_source() {
        let mut h = Harness::start(quiet_config());
        let (id, mut rx) = h.connect();

        h.send(
            id,
            ClientMessage::GetSourceParam {
                param: "gain".into(),
            },
        );
        match h.recv(&mut rx).await {
            ServerMessage::SourceGet { success: false, value, .. } => {
                assert_eq!(&value[..], b"There is no active data source.")
            }
            other => panic!("unexpected reply {other:?}"),
        }

        h.send(
            id,
            ClientMessage::SetSourceParam {
                param: "gain".into(),
                raw: Bytes::new(),
            },
        );
        match h.recv(&mut rx).await {
            ServerMessage::SourceSet { success: false, msg, .. } => {
                assert_eq!(msg, "There is no active data source.")
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    // ── Recording lifecycle ──────────────────────────────────────────

    #[tokio::test]
    async fn recording_requires_a_source() {
        let mut h = Harness::start(quiet_config());
        let (id, mut rx) = h.connect();

        h.send(id, ClientMessage::StartRecording);
        assert_eq!(
            h.recv(&mut rx).await,
            ServerMessage::RecordingStarted {
                success: false,
                msg: "Cannot start recording, there is no active data source.".into()
            }
        );

        h.send(id, ClientMessage::StopRecording);
        assert_eq!(
            h.recv(&mut rx).await,
            ServerMessage::RecordingStopped {
                success: false,
                msg: "Cannot stop recording, there is no active data source.".into()
            }
        );
    }

    #[tokio::test]
    async fn start_stop_cycle_creates_and_releases_the_sink() {
        let mut h = Harness::start(quiet_config());
        let fixture = h.fixture("session.h5", 1000.0, 4, 100);
        let (id, mut rx) = h.connect();
        h.create_source(id, &mut rx, &fixture).await;

        h.send(
            id,
            ClientMessage::SetServerParam(ServerParam::SaveFile("take-one".into())),
        );
        match h.recv(&mut rx).await {
            ServerMessage::ServerSet { success: true, .. } => {}
            other => panic!("unexpected reply {other:?}"),
        }

        h.start_recording(id, &mut rx).await;
        assert!(h.dir.path().join("take-one.h5").exists());

        // A second start while one is active fails.
        h.send(id, ClientMessage::StartRecording);
        assert_eq!(
            h.recv(&mut rx).await,
            ServerMessage::RecordingStarted {
                success: false,
                msg: "Cannot create recording, one is already active.".into()
            }
        );

        h.send(id, ClientMessage::StopRecording);
        assert_eq!(
            h.recv(&mut rx).await,
            ServerMessage::RecordingStopped {
                success: true,
                msg: String::new()
            }
        );

        // save-file cleared after the stop.
        h.send(
            id,
            ClientMessage::GetServerParam {
                param: "save-file".into(),
            },
        );
        match h.recv(&mut rx).await {
            ServerMessage::ServerGet { success: true, value, .. } => assert!(value.is_empty()),
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn stop_without_recording_fails() {
        let mut h = Harness::start(quiet_config());
        let fixture = h.fixture("session.h5", 1000.0, 4, 100);
        let (id, mut rx) = h.connect();
        h.create_source(id, &mut rx, &fixture).await;

        h.send(id, ClientMessage::StopRecording);
        assert_eq!(
            h.recv(&mut rx).await,
            ServerMessage::RecordingStopped {
                success: false,
                msg: "Cannot stop recording, there is no recording to stop.".into()
            }
        );
    }

    #[tokio::test]
    async fn recording_stops_itself_at_the_requested_length() {
        let mut h = Harness::start(ServerConfig {
            recording_length: 1,
            ..quiet_config()
        });
        let fixture = h.fixture("session.h5", 1000.0, 2, 100);
        let (id, mut rx) = h.connect();
        h.create_source(id, &mut rx, &fixture).await;
        h.send(
            id,
            ClientMessage::SetServerParam(ServerParam::SaveFile("first-take".into())),
        );
        match h.recv(&mut rx).await {
            ServerMessage::ServerSet { success: true, .. } => {}
            other => panic!("unexpected reply {other:?}"),
        }
        h.start_recording(id, &mut rx).await;

        h.inject_samples(Samples::zeros(600, 2));
        h.inject_samples(Samples::zeros(600, 2));

        // 1.2 s recorded with recording-length 1: the sink must be gone.
        h.send(
            id,
            ClientMessage::GetServerParam {
                param: "recording-exists".into(),
            },
        );
        match h.recv(&mut rx).await {
            ServerMessage::ServerGet { success: true, value, .. } => assert_eq!(&value[..], &[0]),
            other => panic!("unexpected reply {other:?}"),
        }

        // Late batches are dropped, and the slot is free for a new take.
        h.inject_samples(Samples::zeros(600, 2));
        h.start_recording(id, &mut rx).await;
    }

    // ── Data requests ────────────────────────────────────────────────

    #[test]
    fn chunk_validation_enforces_every_bound() {
        assert!(verify_chunk_request(0.0, 1.0, 1000.0, 10.0, 100).is_ok());
        assert!(verify_chunk_request(-0.5, 1.0, 1000.0, 10.0, 100).is_err());
        // stop must exceed start by more than one sample period
        assert!(verify_chunk_request(1.0, 1.0005, 1000.0, 10.0, 100).is_err());
        assert!(verify_chunk_request(1.0, 1.002, 1000.0, 10.0, 100).is_ok());
        // chunk cap
        assert!(verify_chunk_request(0.0, 10.5, 1000.0, 10.0, 100).is_err());
        // past the end of the recording
        assert!(verify_chunk_request(95.0, 101.0, 1000.0, 10.0, 100).is_err());
    }

    #[tokio::test]
    async fn data_requests_require_a_recording() {
        let mut h = Harness::start(quiet_config());
        let (id, mut rx) = h.connect();

        h.send(
            id,
            ClientMessage::GetData {
                start: 0.0,
                stop: 1.0,
            },
        );
        assert_eq!(
            h.recv(&mut rx).await,
            ServerMessage::Error {
                msg: "There is no active recording, data cannot be requested.".into()
            }
        );
    }

    #[tokio::test]
    async fn available_chunks_are_served_immediately() {
        let mut h = Harness::start(quiet_config());
        let fixture = h.fixture("session.h5", 1000.0, 2, 100);
        let (id, mut rx) = h.connect();
        h.create_source(id, &mut rx, &fixture).await;
        h.start_recording(id, &mut rx).await;

        h.inject_samples(Samples::from_vec((0..1000).map(|v| v as i16).collect(), 2));

        h.send(
            id,
            ClientMessage::GetData {
                start: 0.1,
                stop: 0.2,
            },
        );
        match h.recv(&mut rx).await {
            ServerMessage::Data(frame) => {
                assert_eq!(frame.start(), 0.1);
                assert_eq!(frame.stop(), 0.2);
                assert_eq!(frame.nsamples(), 100);
                assert_eq!(frame.nchannels(), 2);
                // Row 100 of the injected ramp.
                assert_eq!(frame.samples().row(0), &[200, 201]);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    #[tokio::test]
    async fn queued_chunks_are_served_in_request_order() {
        let mut h = Harness::start(quiet_config());
        let fixture = h.fixture("session.h5", 1000.0, 2, 100);
        let (id, mut rx) = h.connect();
        h.create_source(id, &mut rx, &fixture).await;
        h.start_recording(id, &mut rx).await;

        h.inject_samples(Samples::zeros(500, 2));

        // Neither request is servicable at 0.5 s; both are queued.
        h.send(
            id,
            ClientMessage::GetData {
                start: 1.0,
                stop: 2.0,
            },
        );
        h.send(
            id,
            ClientMessage::GetData {
                start: 0.5,
                stop: 1.0,
            },
        );

        // Grow the recording past 2.0 s; both become servicable at once
        // and must come back in the order they were queued.
        h.inject_samples(Samples::zeros(1600, 2));

        match h.recv(&mut rx).await {
            ServerMessage::Data(frame) => {
                assert_eq!(frame.start(), 1.0);
                assert_eq!(frame.stop(), 2.0);
                assert_eq!(frame.nsamples(), 1000);
            }
            other => panic!("unexpected reply {other:?}"),
        }
        match h.recv(&mut rx).await {
            ServerMessage::Data(frame) => {
                assert_eq!(frame.start(), 0.5);
                assert_eq!(frame.stop(), 1.0);
                assert_eq!(frame.nsamples(), 500);
            }
            other => panic!("unexpected reply {other:?}"),
        }
    }

    // ── All-data subscriptions ───────────────────────────────────────

    #[tokio::test]
    async fn all_data_goes_only_to_subscribers() {
        let mut h = Harness::start(quiet_config());
        let fixture = h.fixture("session.h5", 1000.0, 2, 100);
        let (id_a, mut rx_a) = h.connect();
        let (id_b, mut rx_b) = h.connect();

        h.send(id_a, ClientMessage::GetAllData { requested: true });
        assert_eq!(
            h.recv(&mut rx_a).await,
            ServerMessage::AllData {
                success: true,
                msg: String::new()
            }
        );

        h.create_source(id_a, &mut rx_a, &fixture).await;
        h.start_recording(id_a, &mut rx_a).await;

        let batch = Samples::from_vec((0..200).map(|v| v as i16).collect(), 2);
        h.inject_samples(batch.clone());

        match h.recv(&mut rx_a).await {
            ServerMessage::Data(frame) => {
                assert_eq!(frame.start(), 0.0);
                assert_eq!(frame.stop(), 0.1);
                assert_eq!(frame.samples(), &batch);
            }
            other => panic!("unexpected reply {other:?}"),
        }

        // The non-subscriber sees nothing; prove it with a probe request
        // whose reply would queue behind any stray data frame.
        h.send(
            id_b,
            ClientMessage::GetServerParam {
                param: "recording-exists".into(),
            },
        );
        match h.recv(&mut rx_b).await {
            ServerMessage::ServerGet { success: true, .. } => {}
            other => panic!("subscriber leak: {other:?}"),
        }
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn all_data_cannot_start_mid_recording() {
        let mut h = Harness::start(quiet_config());
        let fixture = h.fixture("session.h5", 1000.0, 2, 100);
        let (id, mut rx) = h.connect();
        h.create_source(id, &mut rx, &fixture).await;
        h.start_recording(id, &mut rx).await;

        h.send(id, ClientMessage::GetAllData { requested: true });
        match h.recv(&mut rx).await {
            ServerMessage::AllData { success: false, msg } => {
                assert!(msg.starts_with("Can only request all data before a recording starts."))
            }
            other => panic!("unexpected reply {other:?}"),
        }

        // Cancelling is always allowed.
        h.send(id, ClientMessage::GetAllData { requested: false });
        match h.recv(&mut rx).await {
            ServerMessage::AllData { success: true, .. } => {}
            other => panic!("unexpected reply {other:?}"),
        }
    }

    // ── Failure escalation ───────────────────────────────────────────

    #[tokio::test]
    async fn source_error_notifies_and_disconnects_everyone() {
        let mut h = Harness::start(quiet_config());
        let fixture = h.fixture("session.h5", 1000.0, 4, 100);
        let (id, mut rx) = h.connect();
        h.create_source(id, &mut rx, &fixture).await;

        h.events
            .send(Event::Source(SourceEvent::Error("array went dark".into())))
            .unwrap();

        assert_eq!(
            h.recv(&mut rx).await,
            ServerMessage::Error {
                msg: "array went dark".into()
            }
        );
        // The session was dropped by the coordinator: channel closes after
        // the error drains.
        assert!(
            timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn exhausted_file_source_escalates_as_a_source_error() {
        // Real poll timer: 20 ms per tick over a 50-sample fixture.
        let mut h = Harness::start(ServerConfig {
            read_interval: 20,
            recording_length: 10,
            ..ServerConfig::default()
        });
        let fixture = h.fixture("session.h5", 1000.0, 2, 50);
        let (id, mut rx) = h.connect();
        h.create_source(id, &mut rx, &fixture).await;
        h.start_recording(id, &mut rx).await;

        // 20 rows per tick: exhausted after three ticks, error after four.
        loop {
            match h.recv(&mut rx).await {
                ServerMessage::Error { msg } => {
                    assert_eq!(msg, "The data source has no more data to stream.");
                    break;
                }
                ServerMessage::Data(_) => continue,
                other => panic!("unexpected reply {other:?}"),
            }
        }
    }

    // ── Protocol errors and status ───────────────────────────────────

    #[tokio::test]
    async fn protocol_errors_are_echoed_to_the_client() {
        let mut h = Harness::start(quiet_config());
        let (id, mut rx) = h.connect();

        h.events
            .send(Event::ClientProtocolError {
                id,
                message: "Unknown message type from client: frobnicate".into(),
            })
            .unwrap();
        assert_eq!(
            h.recv(&mut rx).await,
            ServerMessage::Error {
                msg: "Unknown message type from client: frobnicate".into()
            }
        );
    }

    #[tokio::test]
    async fn status_report_projects_coordinator_state() {
        let mut h = Harness::start(quiet_config());
        let fixture = h.fixture("session.h5", 1000.0, 4, 100);
        let (id, mut rx) = h.connect();
        h.create_source(id, &mut rx, &fixture).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        h.events.send(Event::StatusQuery { reply: reply_tx }).unwrap();
        let report = reply_rx.await.unwrap();

        assert!(report.source_exists);
        assert_eq!(report.source_type, "file");
        assert_eq!(report.device_type, "file");
        assert_eq!(report.source_location, fixture);
        assert!(!report.recording_exists);
        assert_eq!(report.clients.len(), 1);

        let (reply_tx, reply_rx) = oneshot::channel();
        h.events
            .send(Event::SourceStatusQuery { reply: reply_tx })
            .unwrap();
        let status = reply_rx.await.unwrap().expect("a source exists");
        assert_eq!(status["sample-rate"], StatusValue::Float(1000.0));
    }

    #[tokio::test]
    async fn source_status_query_is_none_without_a_source() {
        let h = Harness::start(quiet_config());
        let (reply_tx, reply_rx) = oneshot::channel();
        h.events
            .send(Event::SourceStatusQuery { reply: reply_tx })
            .unwrap();
        assert!(reply_rx.await.unwrap().is_none());
    }
}
