//! Wire protocol: framing, request parsing, response encoding
//!
//! Every message travels in the same envelope:
//!
//! ```text
//! ┌───────────────┬──────────────────┬───────────────────────────┐
//! │  size (u32)   │  type + b'\n'    │  type-specific body       │
//! │ little-endian │  ASCII           │                           │
//! └───────────────┴──────────────────┴───────────────────────────┘
//! ```
//!
//! The size counts the payload only, excluding the four size bytes.
//! Numeric fields are fixed little-endian: bool as one byte, u32 and f32 as
//! four, f64 as eight. Strings are raw bytes delimited by a newline or by
//! the end of the payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::frame::DataFrame;

/// Maximum accepted payload size. Large enough for a maximum-length chunk of
/// samples from a dense array, small enough to reject hostile lengths.
pub const MAX_FRAME_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Errors raised while decoding a frame or parsing a message payload.
///
/// All of these are per-message: the envelope keeps the stream in sync, so
/// the connection stays open and the offending message is reported back to
/// the client as an `error` reply.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Message type is malformed, must have newline after message type.")]
    MissingDelimiter,

    #[error("Unknown message type from client: {0}")]
    UnknownMessageType(String),

    #[error("Unknown server parameter: {0}")]
    UnknownServerParameter(String),

    #[error("Message body ends before the {expected}-byte {field} field.")]
    Truncated {
        field: &'static str,
        expected: usize,
    },

    #[error("Message field is not valid UTF-8.")]
    InvalidUtf8,

    #[error("Frame of {0} bytes exceeds the maximum of {MAX_FRAME_PAYLOAD_SIZE}.")]
    Oversized(usize),
}

/// A request parsed off a client connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    CreateSource { kind: String, location: String },
    DeleteSource,
    SetServerParam(ServerParam),
    GetServerParam { param: String },
    SetSourceParam { param: String, raw: Bytes },
    GetSourceParam { param: String },
    StartRecording,
    StopRecording,
    GetData { start: f32, stop: f32 },
    GetAllData { requested: bool },
}

/// A typed server-scope parameter assignment from a `set` message.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerParam {
    SaveFile(String),
    SaveDirectory(String),
    RecordingLength(u32),
    ReadInterval(u32),
}

impl ServerParam {
    pub fn name(&self) -> &'static str {
        match self {
            ServerParam::SaveFile(_) => "save-file",
            ServerParam::SaveDirectory(_) => "save-directory",
            ServerParam::RecordingLength(_) => "recording-length",
            ServerParam::ReadInterval(_) => "read-interval",
        }
    }
}

/// A reply or notification sent to a client.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    SourceCreated {
        success: bool,
        msg: String,
    },
    SourceDeleted {
        success: bool,
        msg: String,
    },
    /// Reply to a server-scope `set`.
    ServerSet {
        param: String,
        success: bool,
        msg: String,
    },
    /// Reply to a server-scope `get`; `value` is the parameter encoded per
    /// its type on success, or an error message on failure.
    ServerGet {
        param: String,
        success: bool,
        value: Bytes,
    },
    SourceSet {
        param: String,
        success: bool,
        msg: String,
    },
    /// Reply to `get-source`; `value` is the source-specific encoding on
    /// success, or an error message on failure.
    SourceGet {
        param: String,
        success: bool,
        value: Bytes,
    },
    RecordingStarted {
        success: bool,
        msg: String,
    },
    RecordingStopped {
        success: bool,
        msg: String,
    },
    AllData {
        success: bool,
        msg: String,
    },
    Data(DataFrame),
    Error {
        msg: String,
    },
}

// ── Envelope ─────────────────────────────────────────────────────────

/// Try to split one complete payload off the receive buffer.
///
/// Returns `Ok(None)` when the buffer does not yet hold the declared
/// payload; the caller waits for more bytes. Rejects declared lengths past
/// [`MAX_FRAME_PAYLOAD_SIZE`] so a hostile prefix cannot pin the buffer.
pub fn decode_frame(buf: &mut BytesMut) -> Result<Option<Bytes>, ProtocolError> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let size = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    if size > MAX_FRAME_PAYLOAD_SIZE {
        return Err(ProtocolError::Oversized(size));
    }
    if buf.len() < 4 + size {
        return Ok(None);
    }
    buf.advance(4);
    Ok(Some(buf.split_to(size).freeze()))
}

/// Prefix a payload with its little-endian size.
pub fn encode_frame(payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(4 + payload.len());
    buf.put_u32_le(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Read one framed payload from an async reader.
///
/// Returns `Ok(None)` on a clean end-of-stream at a frame boundary. Used by
/// client-side code and the test harness; the server's sessions decode from
/// their receive buffers instead.
pub async fn read_frame<R>(reader: &mut R) -> anyhow::Result<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let size = u32::from_le_bytes(len_bytes) as usize;
    if size > MAX_FRAME_PAYLOAD_SIZE {
        anyhow::bail!("frame of {size} bytes exceeds the maximum of {MAX_FRAME_PAYLOAD_SIZE}");
    }
    let mut payload = vec![0u8; size];
    reader.read_exact(&mut payload).await?;
    Ok(Some(Bytes::from(payload)))
}

/// Write one framed payload to an async writer.
pub async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&(payload.len() as u32).to_le_bytes()).await?;
    writer.write_all(payload).await?;
    Ok(())
}

// ── Payload helpers ──────────────────────────────────────────────────

/// Split the bytes up to the next newline off the front of `buf` and decode
/// them as UTF-8. The newline is consumed but not returned.
fn split_line(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let pos = buf
        .iter()
        .position(|&b| b == b'\n')
        .ok_or(ProtocolError::MissingDelimiter)?;
    let line = buf.split_to(pos);
    buf.advance(1);
    String::from_utf8(line.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

fn take_string(buf: Bytes) -> Result<String, ProtocolError> {
    String::from_utf8(buf.to_vec()).map_err(|_| ProtocolError::InvalidUtf8)
}

fn take_u32(buf: &mut Bytes, field: &'static str) -> Result<u32, ProtocolError> {
    if buf.len() < 4 {
        return Err(ProtocolError::Truncated { field, expected: 4 });
    }
    Ok(buf.get_u32_le())
}

fn take_f32(buf: &mut Bytes, field: &'static str) -> Result<f32, ProtocolError> {
    if buf.len() < 4 {
        return Err(ProtocolError::Truncated { field, expected: 4 });
    }
    Ok(buf.get_f32_le())
}

fn take_bool(buf: &mut Bytes, field: &'static str) -> Result<bool, ProtocolError> {
    if buf.is_empty() {
        return Err(ProtocolError::Truncated { field, expected: 1 });
    }
    Ok(buf.get_u8() != 0)
}

// ── Client → server ──────────────────────────────────────────────────

/// Parse one client request from a complete frame payload.
pub fn parse_client_message(mut payload: Bytes) -> Result<ClientMessage, ProtocolError> {
    let msg_type = split_line(&mut payload)?;
    match msg_type.as_str() {
        "create-source" => {
            let kind = split_line(&mut payload)?;
            let location = take_string(payload)?;
            Ok(ClientMessage::CreateSource { kind, location })
        }
        "delete-source" => Ok(ClientMessage::DeleteSource),
        "set" => {
            let param = split_line(&mut payload)?;
            let value = match param.as_str() {
                "save-file" => ServerParam::SaveFile(take_string(payload)?),
                "save-directory" => ServerParam::SaveDirectory(take_string(payload)?),
                "recording-length" => {
                    ServerParam::RecordingLength(take_u32(&mut payload, "recording-length")?)
                }
                "read-interval" => {
                    ServerParam::ReadInterval(take_u32(&mut payload, "read-interval")?)
                }
                _ => return Err(ProtocolError::UnknownServerParameter(param)),
            };
            Ok(ClientMessage::SetServerParam(value))
        }
        "get" => {
            let param = split_line(&mut payload)?;
            Ok(ClientMessage::GetServerParam { param })
        }
        "set-source" => {
            let param = split_line(&mut payload)?;
            Ok(ClientMessage::SetSourceParam {
                param,
                raw: payload,
            })
        }
        "get-source" => {
            let param = split_line(&mut payload)?;
            Ok(ClientMessage::GetSourceParam { param })
        }
        "start-recording" => Ok(ClientMessage::StartRecording),
        "stop-recording" => Ok(ClientMessage::StopRecording),
        "get-data" => {
            let start = take_f32(&mut payload, "start")?;
            let stop = take_f32(&mut payload, "stop")?;
            Ok(ClientMessage::GetData { start, stop })
        }
        "get-all-data" => {
            let requested = take_bool(&mut payload, "requested")?;
            Ok(ClientMessage::GetAllData { requested })
        }
        other => Err(ProtocolError::UnknownMessageType(other.to_string())),
    }
}

/// Encode a client request, envelope included. The inverse of
/// [`parse_client_message`]; client-side code and tests use it.
pub fn encode_client_message(msg: &ClientMessage) -> Bytes {
    let mut buf = BytesMut::new();
    match msg {
        ClientMessage::CreateSource { kind, location } => {
            buf.put_slice(b"create-source\n");
            buf.put_slice(kind.as_bytes());
            buf.put_u8(b'\n');
            buf.put_slice(location.as_bytes());
        }
        ClientMessage::DeleteSource => buf.put_slice(b"delete-source\n"),
        ClientMessage::SetServerParam(param) => {
            buf.put_slice(b"set\n");
            buf.put_slice(param.name().as_bytes());
            buf.put_u8(b'\n');
            match param {
                ServerParam::SaveFile(v) | ServerParam::SaveDirectory(v) => {
                    buf.put_slice(v.as_bytes())
                }
                ServerParam::RecordingLength(v) | ServerParam::ReadInterval(v) => {
                    buf.put_u32_le(*v)
                }
            }
        }
        ClientMessage::GetServerParam { param } => {
            buf.put_slice(b"get\n");
            buf.put_slice(param.as_bytes());
            buf.put_u8(b'\n');
        }
        ClientMessage::SetSourceParam { param, raw } => {
            buf.put_slice(b"set-source\n");
            buf.put_slice(param.as_bytes());
            buf.put_u8(b'\n');
            buf.put_slice(raw);
        }
        ClientMessage::GetSourceParam { param } => {
            buf.put_slice(b"get-source\n");
            buf.put_slice(param.as_bytes());
            buf.put_u8(b'\n');
        }
        ClientMessage::StartRecording => buf.put_slice(b"start-recording\n"),
        ClientMessage::StopRecording => buf.put_slice(b"stop-recording\n"),
        ClientMessage::GetData { start, stop } => {
            buf.put_slice(b"get-data\n");
            buf.put_f32_le(*start);
            buf.put_f32_le(*stop);
        }
        ClientMessage::GetAllData { requested } => {
            buf.put_slice(b"get-all-data\n");
            buf.put_u8(*requested as u8);
        }
    }
    encode_frame(&buf)
}

// ── Server → client ──────────────────────────────────────────────────

impl ServerMessage {
    /// Encode this reply, envelope included, ready for the socket.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            ServerMessage::SourceCreated { success, msg } => {
                put_ack(&mut buf, "source-created", *success, msg)
            }
            ServerMessage::SourceDeleted { success, msg } => {
                put_ack(&mut buf, "source-deleted", *success, msg)
            }
            ServerMessage::ServerSet {
                param,
                success,
                msg,
            } => put_param_reply(&mut buf, "set", param, *success, msg.as_bytes()),
            ServerMessage::ServerGet {
                param,
                success,
                value,
            } => put_param_reply(&mut buf, "get", param, *success, value),
            ServerMessage::SourceSet {
                param,
                success,
                msg,
            } => put_param_reply(&mut buf, "set-source", param, *success, msg.as_bytes()),
            ServerMessage::SourceGet {
                param,
                success,
                value,
            } => put_param_reply(&mut buf, "get-source", param, *success, value),
            ServerMessage::RecordingStarted { success, msg } => {
                put_ack(&mut buf, "recording-started", *success, msg)
            }
            ServerMessage::RecordingStopped { success, msg } => {
                put_ack(&mut buf, "recording-stopped", *success, msg)
            }
            ServerMessage::AllData { success, msg } => {
                put_ack(&mut buf, "get-all-data", *success, msg)
            }
            ServerMessage::Data(frame) => {
                buf.put_slice(b"data\n");
                frame.encode_into(&mut buf);
            }
            ServerMessage::Error { msg } => {
                buf.put_slice(b"error\n");
                buf.put_slice(msg.as_bytes());
            }
        }
        encode_frame(&buf)
    }

    /// Parse a reply from a complete frame payload. The inverse of
    /// [`encode`](Self::encode); client-side code and tests use it.
    pub fn parse(mut payload: Bytes) -> Result<Self, ProtocolError> {
        let msg_type = split_line(&mut payload)?;
        match msg_type.as_str() {
            "source-created" => {
                let (success, msg) = take_ack(&mut payload)?;
                Ok(ServerMessage::SourceCreated { success, msg })
            }
            "source-deleted" => {
                let (success, msg) = take_ack(&mut payload)?;
                Ok(ServerMessage::SourceDeleted { success, msg })
            }
            "set" => {
                let (param, success, value) = take_param_reply(&mut payload)?;
                Ok(ServerMessage::ServerSet {
                    param,
                    success,
                    msg: take_string(value)?,
                })
            }
            "get" => {
                let (param, success, value) = take_param_reply(&mut payload)?;
                Ok(ServerMessage::ServerGet {
                    param,
                    success,
                    value,
                })
            }
            "set-source" => {
                let (param, success, value) = take_param_reply(&mut payload)?;
                Ok(ServerMessage::SourceSet {
                    param,
                    success,
                    msg: take_string(value)?,
                })
            }
            "get-source" => {
                let (param, success, value) = take_param_reply(&mut payload)?;
                Ok(ServerMessage::SourceGet {
                    param,
                    success,
                    value,
                })
            }
            "recording-started" => {
                let (success, msg) = take_ack(&mut payload)?;
                Ok(ServerMessage::RecordingStarted { success, msg })
            }
            "recording-stopped" => {
                let (success, msg) = take_ack(&mut payload)?;
                Ok(ServerMessage::RecordingStopped { success, msg })
            }
            "get-all-data" => {
                let (success, msg) = take_ack(&mut payload)?;
                Ok(ServerMessage::AllData { success, msg })
            }
            "data" => {
                let frame = DataFrame::decode(payload)
                    .map_err(|_| ProtocolError::Truncated {
                        field: "data frame",
                        expected: 16,
                    })?;
                Ok(ServerMessage::Data(frame))
            }
            "error" => Ok(ServerMessage::Error {
                msg: take_string(payload)?,
            }),
            other => Err(ProtocolError::UnknownMessageType(other.to_string())),
        }
    }
}

fn put_ack(buf: &mut BytesMut, msg_type: &str, success: bool, msg: &str) {
    buf.put_slice(msg_type.as_bytes());
    buf.put_u8(b'\n');
    buf.put_u8(success as u8);
    buf.put_slice(msg.as_bytes());
}

fn put_param_reply(buf: &mut BytesMut, msg_type: &str, param: &str, success: bool, body: &[u8]) {
    buf.put_slice(msg_type.as_bytes());
    buf.put_u8(b'\n');
    buf.put_u8(success as u8);
    buf.put_slice(param.as_bytes());
    buf.put_u8(b'\n');
    buf.put_slice(body);
}

fn take_ack(payload: &mut Bytes) -> Result<(bool, String), ProtocolError> {
    let success = take_bool(payload, "success")?;
    let msg = take_string(payload.split_off(0))?;
    Ok((success, msg))
}

fn take_param_reply(payload: &mut Bytes) -> Result<(String, bool, Bytes), ProtocolError> {
    let success = take_bool(payload, "success")?;
    let param = split_line(payload)?;
    Ok((param, success, payload.split_off(0)))
}
