//! Binary data block codec and wire framing.
//!
//! Data blocks are self-describing: every object starts with a one-byte
//! [`DataBlockType`] tag. Scalars are little-endian regardless of host order.
mod framing;
mod message;
mod reader;
mod types;
mod writer;

pub use framing::{
    read_handshake_string, read_i32, read_incoming, write_handshake_string, write_i32, Incoming,
    MAX_FRAME_LEN, MAX_HANDSHAKE_STRING,
};
pub use message::{
    encode_call, encode_disconnect, encode_error, encode_exception, encode_reply, encode_send,
    system_method, CallHeader, Envelope, ExceptionBody, MessageKind, BROKER_CONTROL_SERVICE,
    BROKER_MODULE, CALL_OVERHEAD, DISCONNECT_MESSAGE, HEADER_LEN, REPLY_OVERHEAD,
    SEND_MESSAGE_ID, SHUTDOWN_BROKER_METHOD, SYSTEM_SERVICE,
};
pub(crate) use message::decode_exception_payload;
pub use reader::DataBlockReader;
pub use types::{Array, ArrayData, Complex, DataBlockType, Value};
pub use writer::{DataBlockWriter, DEFAULT_CAPACITY};
