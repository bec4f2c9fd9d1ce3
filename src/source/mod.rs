//! Source adapters
//!
//! A data source is a cooperative actor: the coordinator issues one-shot
//! requests (initialize, get, set, start-stream, stop-stream, status) and
//! the source answers each with a paired reply event, plus unsolicited
//! `samples` batches while streaming and a fatal out-of-band `error`.
//!
//! Every request carries a correlation id; the coordinator keeps a map from
//! id to the originating client so replies land on the right connection.
//!
//! Placement is decided by [`DataSource::is_thread_safe`]: sources backed by
//! libraries that tolerate running off the coordinator's thread are moved to
//! a worker task and reached over channels; file-replay sources are driven
//! inline by the coordinator loop.

mod file;

pub use file::FileSource;

use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::{bail, Result};
use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::debug;

use crate::frame::Samples;

/// A value in a source's status map.
///
/// Status maps are heterogeneous; the tagged variant keeps the JSON
/// projection and the wire encoding honest about each value's type.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum StatusValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    /// A sequence of floats, e.g. an analog-output waveform.
    FloatSeq(Vec<f64>),
    /// An opaque blob, e.g. a HiDens electrode configuration.
    Bytes(Vec<u8>),
}

impl StatusValue {
    /// Fixed little-endian encoding used in `get-source` replies and for
    /// source-backed server parameters.
    pub fn encode_wire(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            StatusValue::Bool(b) => buf.put_u8(*b as u8),
            StatusValue::Int(i) => buf.put_i64_le(*i),
            StatusValue::Float(f) => buf.put_f64_le(*f),
            StatusValue::Str(s) => buf.put_slice(s.as_bytes()),
            StatusValue::FloatSeq(seq) => {
                for v in seq {
                    buf.put_f64_le(*v);
                }
            }
            StatusValue::Bytes(b) => buf.put_slice(b),
        }
        buf.freeze()
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StatusValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            StatusValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            StatusValue::Float(f) => Some(*f),
            StatusValue::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            StatusValue::Str(s) => Some(s),
            _ => None,
        }
    }
}

/// A source's status, keyed by parameter name. Well-known keys include
/// `source-type`, `device-type`, `location`, `nchannels`, `sample-rate`,
/// `gain`, `adc-range`, `has-analog-output`, `analog-output` and
/// `configuration`.
pub type StatusMap = BTreeMap<String, StatusValue>;

/// The capability set the coordinator requires of any data source.
///
/// Methods are synchronous; the owning loop (worker task or coordinator)
/// provides the asynchrony and answers each request with a reply event.
pub trait DataSource: Send {
    /// Source type tag, e.g. `"file"`, `"hidens"`, `"mcs"`.
    fn source_type(&self) -> &'static str;

    /// The location identifier the source was created with.
    fn location(&self) -> &str;

    /// Whether the backing library tolerates running off the coordinator's
    /// thread. Decides actor placement at creation time.
    fn is_thread_safe(&self) -> bool;

    /// Perform any connection or file-opening work. Called exactly once.
    fn initialize(&mut self) -> Result<()>;

    /// A snapshot of every parameter of the source.
    fn status(&self) -> StatusMap;

    fn get(&self, param: &str) -> Result<StatusValue>;

    fn set(&mut self, param: &str, value: StatusValue) -> Result<()>;

    /// Begin producing samples; `interval` is the cadence at which the
    /// owning loop will poll [`read_samples`](Self::read_samples).
    fn start_stream(&mut self, interval: Duration) -> Result<()>;

    fn stop_stream(&mut self) -> Result<()>;

    /// Produce the next batch of samples, or `None` when the source has no
    /// more data to stream.
    fn read_samples(&mut self) -> Result<Option<Samples>>;

    /// Decode a client-supplied `set-source` value for `param`. Sources
    /// with structured parameters override this; the default treats the
    /// bytes as opaque.
    fn decode_param(&self, _param: &str, raw: &[u8]) -> Result<StatusValue> {
        Ok(StatusValue::Bytes(raw.to_vec()))
    }
}

/// One-shot requests the coordinator issues to a source.
#[derive(Debug)]
pub enum SourceCommand {
    Initialize,
    RequestStatus,
    Get { param: String },
    Set { param: String, raw: Bytes },
    StartStream { interval: Duration },
    StopStream,
}

/// A command tagged with its correlation id.
#[derive(Debug)]
pub struct SourceRequest {
    pub id: u32,
    pub command: SourceCommand,
}

/// The paired reply to one [`SourceCommand`].
#[derive(Debug)]
pub enum SourceReply {
    Initialized {
        success: bool,
        msg: String,
    },
    Status(StatusMap),
    Get {
        param: String,
        result: Result<StatusValue, String>,
    },
    Set {
        param: String,
        success: bool,
        msg: String,
    },
    StreamStarted {
        success: bool,
        msg: String,
    },
    StreamStopped {
        success: bool,
        msg: String,
    },
}

/// Everything a source emits toward the coordinator.
#[derive(Debug)]
pub enum SourceEvent {
    /// The reply to the request with the matching id.
    Reply { id: u32, reply: SourceReply },
    /// A batch of streamed samples.
    Samples(Samples),
    /// Fatal, out-of-band failure; the coordinator tears the source down.
    Error(String),
}

/// Construct a source of the requested type.
///
/// Live-device drivers (`hidens`, `mcs`) are managed outside this crate;
/// asking for one reports why it cannot be had.
pub fn create(kind: &str, location: &str) -> Result<Box<dyn DataSource>> {
    match kind {
        "file" => Ok(Box::new(FileSource::new(location))),
        "hidens" => bail!("HiDens sources require the array driver, which is not available in this build."),
        "mcs" => bail!("Cannot create MCS sources on this platform."),
        _ => bail!("Unknown source type: {kind}"),
    }
}

/// Whether a stream poll timer must start or stop after a command.
#[derive(Debug, PartialEq)]
pub(crate) enum StreamChange {
    None,
    Start(Duration),
    Stop,
}

fn err_msg(e: anyhow::Error) -> String {
    format!("{e:#}")
}

/// Execute one command against a source. Shared by the worker loop and the
/// coordinator's inline driver so both placements answer identically.
pub(crate) fn execute(
    source: &mut dyn DataSource,
    command: SourceCommand,
) -> (SourceReply, StreamChange) {
    match command {
        SourceCommand::Initialize => match source.initialize() {
            Ok(()) => (
                SourceReply::Initialized {
                    success: true,
                    msg: String::new(),
                },
                StreamChange::None,
            ),
            Err(e) => (
                SourceReply::Initialized {
                    success: false,
                    msg: err_msg(e),
                },
                StreamChange::None,
            ),
        },
        SourceCommand::RequestStatus => {
            (SourceReply::Status(source.status()), StreamChange::None)
        }
        SourceCommand::Get { param } => {
            let result = source.get(&param).map_err(err_msg);
            (SourceReply::Get { param, result }, StreamChange::None)
        }
        SourceCommand::Set { param, raw } => {
            let outcome = source
                .decode_param(&param, &raw)
                .and_then(|value| source.set(&param, value));
            let reply = match outcome {
                Ok(()) => SourceReply::Set {
                    param,
                    success: true,
                    msg: String::new(),
                },
                Err(e) => SourceReply::Set {
                    param,
                    success: false,
                    msg: err_msg(e),
                },
            };
            (reply, StreamChange::None)
        }
        SourceCommand::StartStream { interval } => match source.start_stream(interval) {
            Ok(()) => (
                SourceReply::StreamStarted {
                    success: true,
                    msg: String::new(),
                },
                StreamChange::Start(interval),
            ),
            Err(e) => (
                SourceReply::StreamStarted {
                    success: false,
                    msg: err_msg(e),
                },
                StreamChange::None,
            ),
        },
        SourceCommand::StopStream => match source.stop_stream() {
            Ok(()) => (
                SourceReply::StreamStopped {
                    success: true,
                    msg: String::new(),
                },
                StreamChange::Stop,
            ),
            Err(e) => (
                SourceReply::StreamStopped {
                    success: false,
                    msg: err_msg(e),
                },
                StreamChange::None,
            ),
        },
    }
}

/// Poll a streaming source once. Distinguishes a normal batch, exhaustion,
/// and failure, so both placements escalate the same way.
pub(crate) fn poll_stream(source: &mut dyn DataSource) -> Result<Option<Samples>, String> {
    match source.read_samples() {
        Ok(Some(samples)) => Ok(Some(samples)),
        Ok(None) => Err("The data source has no more data to stream.".to_string()),
        Err(e) => Err(err_msg(e)),
    }
}

/// The poll timer for a streaming source. Skips the tick `interval_at`
/// would otherwise fire immediately, and does not try to catch up after a
/// stall.
pub(crate) fn stream_interval(period: Duration) -> Interval {
    let mut interval = interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Channel endpoint for a source running on its own worker task.
#[derive(Debug)]
pub struct SourceHandle {
    requests: mpsc::UnboundedSender<SourceRequest>,
}

impl SourceHandle {
    /// Queue a request for the worker. A dead worker is reported through
    /// its closed event channel, so a failed send needs no handling here.
    pub fn submit(&self, request: SourceRequest) {
        let _ = self.requests.send(request);
    }
}

/// Move a source onto its own worker task. The worker answers requests and
/// polls the stream; dropping the handle lets it drain and exit.
pub fn spawn_worker(
    source: Box<dyn DataSource>,
    events: mpsc::UnboundedSender<SourceEvent>,
) -> SourceHandle {
    let (req_tx, req_rx) = mpsc::unbounded_channel();
    tokio::spawn(run_worker(source, req_rx, events));
    SourceHandle { requests: req_tx }
}

async fn run_worker(
    mut source: Box<dyn DataSource>,
    mut requests: mpsc::UnboundedReceiver<SourceRequest>,
    events: mpsc::UnboundedSender<SourceEvent>,
) {
    let kind = source.source_type();
    let mut stream: Option<Interval> = None;
    debug!(kind, "source worker started");

    loop {
        tokio::select! {
            request = requests.recv() => {
                let Some(SourceRequest { id, command }) = request else {
                    break;
                };
                let (reply, change) = execute(source.as_mut(), command);
                match change {
                    StreamChange::Start(period) => stream = Some(stream_interval(period)),
                    StreamChange::Stop => stream = None,
                    StreamChange::None => {}
                }
                if events.send(SourceEvent::Reply { id, reply }).is_err() {
                    break;
                }
            }
            _ = maybe_tick(stream.as_mut()) => {
                match poll_stream(source.as_mut()) {
                    Ok(Some(samples)) => {
                        if events.send(SourceEvent::Samples(samples)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => unreachable!("poll_stream maps exhaustion to an error"),
                    Err(msg) => {
                        stream = None;
                        if events.send(SourceEvent::Error(msg)).is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }
    debug!(kind, "source worker stopped");
}

pub(crate) async fn maybe_tick(interval: Option<&mut Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
