//! Message framing: call, send, reply and exception frames.
//!
//! # Layout
//!
//! Every frame starts with `[length:i32][destination:i32]`; `length` counts
//! the whole frame including itself. The body that follows is
//! `[kind:u8][message_id:i32]` plus a kind-specific payload:
//!
//! - call / send: `[source:i32][service:i32][method:i32]` args, terminate tag
//! - reply: data, terminate tag
//! - exception: `[code:u8]` message string, detail string (typed, no terminator)
//!
//! A lone `-1` in the length slot is a disconnect notice.

use super::reader::DataBlockReader;
use super::types::DataBlockType;
use super::writer::DataBlockWriter;
use crate::{RemoteErrorKind, Result, SbwError};
use bytes::{BufMut, Bytes, BytesMut};

/// Module id of the broker itself.
pub const BROKER_MODULE: i32 = -1;

/// Service id every module answers for housekeeping notifications.
pub const SYSTEM_SERVICE: i32 = -1;

/// Value sent in the length slot to announce a disconnect.
pub const DISCONNECT_MESSAGE: i32 = -1;

/// Message id carried by one-way sends.
pub const SEND_MESSAGE_ID: i32 = -1;

/// Broker control service and its shutdown method (`void shutdownBroker()`).
pub const BROKER_CONTROL_SERVICE: i32 = 0;
pub const SHUTDOWN_BROKER_METHOD: i32 = 17;

/// Method ids of the system service.
pub mod system_method {
    pub const GET_SERVICES: i32 = 0;
    pub const GET_METHODS: i32 = 1;
    pub const ON_OTHER_MODULE_INSTANCE_SHUTDOWN: i32 = 2;
    pub const SHUTDOWN: i32 = 3;
    pub const GET_METHOD_HELP: i32 = 4;
    pub const ON_OTHER_MODULE_INSTANCE_STARTUP: i32 = 5;
    pub const ON_REGISTRATION_CHANGE: i32 = 6;
}

/// Length of `[length][destination][kind][message_id]`.
pub const HEADER_LEN: usize = 13;

/// Extra length of a call/send frame beyond its arguments.
pub const CALL_OVERHEAD: usize = 26;

/// Extra length of a reply frame beyond its data.
pub const REPLY_OVERHEAD: usize = 14;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageKind {
    Reply = 0,
    Send = 1,
    Call = 2,
    Exception = 3,
}

impl MessageKind {
    // ---

    pub fn from_code(code: u8) -> Option<Self> {
        // ---
        match code {
            0 => Some(Self::Reply),
            1 => Some(Self::Send),
            2 => Some(Self::Call),
            3 => Some(Self::Exception),
            _ => None,
        }
    }

    pub fn is_request(self) -> bool {
        matches!(self, Self::Call | Self::Send)
    }
}

/// A decoded frame.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub destination: i32,
    pub kind: MessageKind,
    pub message_id: i32,
    /// Everything after the message id.
    pub payload: Bytes,
}

/// Source and target of a call or send, plus a reader over its arguments.
#[derive(Debug, Clone)]
pub struct CallHeader {
    pub source: i32,
    pub service: i32,
    pub method: i32,
    pub args: DataBlockReader,
}

/// Remote failure decoded from an exception frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionBody {
    pub kind: RemoteErrorKind,
    pub message: String,
    pub detail: String,
}

impl From<ExceptionBody> for SbwError {
    fn from(body: ExceptionBody) -> Self {
        SbwError::Remote {
            kind: body.kind,
            message: body.message,
            detail: body.detail,
        }
    }
}

impl Envelope {
    // ---

    /// Parse the body that follows `[length][destination]`.
    pub fn from_body(destination: i32, body: Bytes) -> Result<Self> {
        // ---
        let mut r = DataBlockReader::new(body);
        let code = r.raw_u8(DataBlockType::Byte, "in message kind")?;
        let kind = MessageKind::from_code(code)
            .ok_or_else(|| SbwError::communication(format!("unknown message kind {code}")))?;
        let message_id = r.raw_i32(DataBlockType::Integer, "in message id")?;
        Ok(Self {
            destination,
            kind,
            message_id,
            payload: r.rest(),
        })
    }

    /// Parse a complete frame, length prefix included.
    pub fn decode(frame: &[u8]) -> Result<Self> {
        // ---
        let mut r = DataBlockReader::from_slice(frame);
        let length = r.raw_i32(DataBlockType::Integer, "in message length")?;
        if length < 0 || length as usize != frame.len() {
            return Err(SbwError::communication(format!(
                "frame length {length} does not match {} bytes",
                frame.len()
            )));
        }
        let destination = r.raw_i32(DataBlockType::Integer, "in destination")?;
        Self::from_body(destination, r.rest())
    }

    /// Header and arguments of a call or send.
    pub fn call_header(&self) -> Result<CallHeader> {
        // ---
        if !self.kind.is_request() {
            return Err(SbwError::communication(format!(
                "{:?} message has no call header",
                self.kind
            )));
        }
        let mut r = DataBlockReader::new(self.payload.clone());
        let source = r.raw_i32(DataBlockType::Integer, "in source module id")?;
        let service = r.raw_i32(DataBlockType::Integer, "in service id")?;
        let method = r.raw_i32(DataBlockType::Integer, "in method id")?;
        Ok(CallHeader {
            source,
            service,
            method,
            args: DataBlockReader::new(r.rest()),
        })
    }

    /// Code, message and detail of an exception frame.
    pub fn exception(&self) -> Result<ExceptionBody> {
        decode_exception_payload(self.payload.clone())
    }

    /// Re-encode as a complete frame, for forwarding.
    pub fn to_frame(&self) -> Bytes {
        // ---
        let len = HEADER_LEN + self.payload.len();
        let mut buf = BytesMut::with_capacity(len);
        buf.put_i32_le(len as i32);
        buf.put_i32_le(self.destination);
        buf.put_u8(self.kind as u8);
        buf.put_i32_le(self.message_id);
        buf.put_slice(&self.payload);
        buf.freeze()
    }
}

pub(crate) fn decode_exception_payload(payload: Bytes) -> Result<ExceptionBody> {
    // ---
    let mut r = DataBlockReader::new(payload);
    let code = r.raw_u8(DataBlockType::Byte, "in exception code")?;
    let message = r.get_string("in exception message")?;
    let detail = r.get_string("in exception detail")?;
    Ok(ExceptionBody {
        kind: RemoteErrorKind::from_code(code),
        message,
        detail,
    })
}

fn request_frame(
    kind: MessageKind,
    destination: i32,
    message_id: i32,
    source: i32,
    service: i32,
    method: i32,
    args: &DataBlockWriter,
) -> Bytes {
    // ---
    let len = CALL_OVERHEAD + args.len();
    let mut buf = BytesMut::with_capacity(len);
    buf.put_i32_le(len as i32);
    buf.put_i32_le(destination);
    buf.put_u8(kind as u8);
    buf.put_i32_le(message_id);
    buf.put_i32_le(source);
    buf.put_i32_le(service);
    buf.put_i32_le(method);
    buf.put_slice(args.as_bytes());
    buf.put_u8(DataBlockType::Terminate.tag());
    buf.freeze()
}

pub fn encode_call(
    destination: i32,
    message_id: i32,
    source: i32,
    service: i32,
    method: i32,
    args: &DataBlockWriter,
) -> Bytes {
    request_frame(MessageKind::Call, destination, message_id, source, service, method, args)
}

pub fn encode_send(
    destination: i32,
    source: i32,
    service: i32,
    method: i32,
    args: &DataBlockWriter,
) -> Bytes {
    // ---
    request_frame(
        MessageKind::Send,
        destination,
        SEND_MESSAGE_ID,
        source,
        service,
        method,
        args,
    )
}

pub fn encode_reply(destination: i32, message_id: i32, data: &DataBlockWriter) -> Bytes {
    // ---
    let len = REPLY_OVERHEAD + data.len();
    let mut buf = BytesMut::with_capacity(len);
    buf.put_i32_le(len as i32);
    buf.put_i32_le(destination);
    buf.put_u8(MessageKind::Reply as u8);
    buf.put_i32_le(message_id);
    buf.put_slice(data.as_bytes());
    buf.put_u8(DataBlockType::Terminate.tag());
    buf.freeze()
}

pub fn encode_exception(
    destination: i32,
    message_id: i32,
    kind: RemoteErrorKind,
    message: &str,
    detail: &str,
) -> Bytes {
    // ---
    let mut strings = DataBlockWriter::new();
    strings.add_string(message).add_string(detail);

    let len = HEADER_LEN + 1 + strings.len();
    let mut buf = BytesMut::with_capacity(len);
    buf.put_i32_le(len as i32);
    buf.put_i32_le(destination);
    buf.put_u8(MessageKind::Exception as u8);
    buf.put_i32_le(message_id);
    buf.put_u8(kind.code());
    buf.put_slice(strings.as_bytes());
    buf.freeze()
}

/// Exception frame built from a local error.
pub fn encode_error(destination: i32, message_id: i32, err: &SbwError) -> Bytes {
    encode_exception(destination, message_id, err.kind(), &err.message(), &err.detail())
}

pub fn encode_disconnect() -> [u8; 4] {
    DISCONNECT_MESSAGE.to_le_bytes()
}
