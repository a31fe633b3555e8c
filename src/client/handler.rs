use crate::protocol::{DataBlockReader, DataBlockWriter, MessageKind};
use crate::Result;

/// A call or send delivered to this module.
#[derive(Debug)]
pub struct IncomingCall {
    pub from: i32,
    pub service: i32,
    pub method: i32,
    pub kind: MessageKind,
    pub args: DataBlockReader,
}

impl IncomingCall {
    /// Whether the caller waits for a reply.
    pub fn expects_reply(&self) -> bool {
        self.kind == MessageKind::Call
    }
}

/// Serves the calls other modules make to this one.
///
/// The returned writer becomes the reply; an error becomes an exception
/// frame with [`SbwError::kind`](crate::SbwError::kind) as its code. For
/// sends both are discarded.
///
/// Each incoming call runs on its own thread, so a handler may itself make
/// blocking calls through the same client.
pub trait CallHandler: Send + Sync + 'static {
    fn handle(&self, call: IncomingCall) -> Result<DataBlockWriter>;
}

impl<F> CallHandler for F
where
    F: Fn(IncomingCall) -> Result<DataBlockWriter> + Send + Sync + 'static,
{
    fn handle(&self, call: IncomingCall) -> Result<DataBlockWriter> {
        self(call)
    }
}
