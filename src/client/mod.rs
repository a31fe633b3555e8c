//! Module-side RPC: issuing calls through the broker and serving incoming ones.
//!
//! Every outgoing call gets a message id and a oneshot channel from
//! [`PendingCalls`]. The connection's receive thread completes the channel
//! when the reply or exception arrives; the calling thread blocks on it.
//! Replies are matched by message id, so concurrent callers never see each
//! other's results.

mod handler;
mod pending;

pub use handler::{CallHandler, IncomingCall};
pub use pending::CallEvent;

use crate::config::ConnectConfig;
use crate::connection::{Connection, ConnectionState, MessageSink};
use crate::protocol::{
    decode_exception_payload, encode_call, encode_error, encode_reply, encode_send, system_method,
    CallHeader, DataBlockReader, DataBlockWriter, Envelope, MessageKind, BROKER_CONTROL_SERVICE,
    BROKER_MODULE, SHUTDOWN_BROKER_METHOD, SYSTEM_SERVICE,
};
use crate::{RemoteErrorKind, Result, SbwError};
use pending::PendingCalls;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::oneshot;

/// A module's handle on the broker.
///
/// # Example
///
/// ```no_run
/// use sbw_broker::{ConnectConfig, DataBlockWriter, ModuleClient, SbwPaths};
///
/// # fn example() -> sbw_broker::Result<()> {
/// let client = ModuleClient::new(ConnectConfig::new(SbwPaths::from_env()?));
/// let my_id = client.connect("example")?;
///
/// let mut args = DataBlockWriter::new();
/// args.add_integer(42).add_string("x");
/// let mut reply = client.call(3, 1, 2, &args)?;
/// let answer = reply.get_double("in reply")?;
/// # let _ = (my_id, answer);
/// client.disconnect();
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ModuleClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    // ---
    connection: Connection,
    calls: Mutex<PendingCalls>,
    handler: Option<Arc<dyn CallHandler>>,
}

impl ModuleClient {
    // ---

    /// Client that can only issue calls; incoming calls are refused.
    pub fn new(config: ConnectConfig) -> Self {
        Self::build(config, None)
    }

    /// Client that serves incoming calls with `handler`.
    pub fn with_handler(config: ConnectConfig, handler: impl CallHandler) -> Self {
        Self::build(config, Some(Arc::new(handler)))
    }

    fn build(config: ConnectConfig, handler: Option<Arc<dyn CallHandler>>) -> Self {
        // ---
        Self {
            inner: Arc::new(ClientInner {
                connection: Connection::new(config),
                calls: Mutex::new(PendingCalls::new()),
                handler,
            }),
        }
    }

    /// Connect as `module_name` and return the id the broker assigned.
    pub fn connect(&self, module_name: &str) -> Result<i32> {
        // ---
        let sink: Arc<dyn MessageSink> = Arc::new(Dispatcher(self.inner.clone()));
        self.inner.connection.connect(module_name, sink)
    }

    pub fn module_id(&self) -> Option<i32> {
        self.inner.connection.module_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.connection.state()
    }

    pub fn connection(&self) -> &Connection {
        &self.inner.connection
    }

    /// Number of calls still waiting for an answer.
    pub fn pending_calls(&self) -> usize {
        crate::lock_ignore_poison(&self.inner.calls).len()
    }

    /// Invoke `service`/`method` on module `destination` and wait for the result.
    ///
    /// A remote exception comes back as [`SbwError::Remote`] with its kind;
    /// losing the broker or the target module is a communication error.
    pub fn call(
        &self,
        destination: i32,
        service: i32,
        method: i32,
        args: &DataBlockWriter,
    ) -> Result<DataBlockReader> {
        // ---
        let source = self.require_id()?;
        let (message_id, rx) = crate::lock_ignore_poison(&self.inner.calls).register(destination);

        let frame = encode_call(destination, message_id, source, service, method, args);
        if let Err(err) = self.inner.connection.transmit(&frame) {
            crate::lock_ignore_poison(&self.inner.calls).remove(message_id);
            return Err(err);
        }

        crate::log_debug!(
            "call {message_id} to {destination}/{service}/{method} sent, waiting for reply"
        );
        wait_for_reply(rx, destination)
    }

    /// One-way message; no reply is expected.
    pub fn send(&self, destination: i32, service: i32, method: i32, args: &DataBlockWriter) -> Result<()> {
        // ---
        let source = self.require_id()?;
        let frame = encode_send(destination, source, service, method, args);
        self.inner.connection.transmit(&frame)
    }

    /// Ask the broker to shut down.
    pub fn shutdown_broker(&self) -> Result<()> {
        // ---
        self.call(
            BROKER_MODULE,
            BROKER_CONTROL_SERVICE,
            SHUTDOWN_BROKER_METHOD,
            &DataBlockWriter::new(),
        )
        .map(|_| ())
    }

    pub fn signal_disconnect(&self) {
        self.inner.connection.signal_disconnect();
    }

    pub fn wait_for_disconnect(&self) {
        self.inner.connection.wait_for_disconnect();
    }

    /// Signal the broker and wait for the receive thread to finish.
    pub fn disconnect(&self) {
        // ---
        self.signal_disconnect();
        self.wait_for_disconnect();
    }

    fn require_id(&self) -> Result<i32> {
        self.module_id()
            .ok_or_else(|| SbwError::communication("not connected to broker"))
    }
}

/// Block until the call's event arrives and turn it into a result.
fn wait_for_reply(rx: oneshot::Receiver<CallEvent>, destination: i32) -> Result<DataBlockReader> {
    // ---
    match rx.blocking_recv() {
        Ok(CallEvent::Reply(payload)) => Ok(DataBlockReader::new(payload)),
        Ok(CallEvent::Exception(payload)) => Err(decode_exception_payload(payload)?.into()),
        Ok(CallEvent::ModuleDisconnected) => Err(SbwError::communication(format!(
            "module {destination} disconnected before replying"
        ))),
        Ok(CallEvent::BrokerDisconnected) | Err(_) => Err(SbwError::communication(format!(
            "broker disconnected while waiting for module {destination}"
        ))),
    }
}

impl ClientInner {
    // ---

    /// Bookkeeping for system notices, done on the receive thread before
    /// anything else is read.
    fn system_notice(&self, connection: &Connection, header: &CallHeader) {
        // ---
        match header.method {
            system_method::ON_OTHER_MODULE_INSTANCE_SHUTDOWN => {
                let mut args = header.args.clone();
                match args.get_integer("in shutdown notice") {
                    Ok(id) => {
                        let released = crate::lock_ignore_poison(&self.calls).fail_module(id);
                        crate::log_debug!("module {id} shut down, released {released} calls");
                    }
                    Err(err) => crate::log_warn!("bad shutdown notice: {err}"),
                }
            }
            system_method::SHUTDOWN => {
                crate::log_info!("broker requested shutdown");
                connection.signal_disconnect();
            }
            _ => {}
        }
    }

    /// Run the handler for a call or send and transmit the answer.
    fn respond(&self, connection: &Connection, envelope: Envelope, header: CallHeader) {
        // ---
        let call = IncomingCall {
            from: header.source,
            service: header.service,
            method: header.method,
            kind: envelope.kind,
            args: header.args,
        };
        let expects_reply = call.expects_reply();
        let (service, method) = (call.service, call.method);

        let result = match (&self.handler, service) {
            (Some(handler), _) => match handler.handle(call) {
                Err(SbwError::Remote {
                    kind: RemoteErrorKind::MethodNotFound,
                    ..
                }) if service == SYSTEM_SERVICE && is_notice(method) => Ok(DataBlockWriter::new()),
                other => other,
            },
            (None, SYSTEM_SERVICE) if is_notice(method) => Ok(DataBlockWriter::new()),
            (None, SYSTEM_SERVICE) => Err(SbwError::remote(
                RemoteErrorKind::MethodNotFound,
                format!("Method {method} does not exist on service {service}"),
            )),
            (None, _) => Err(SbwError::remote(
                RemoteErrorKind::ServiceNotFound,
                format!("Service {service} does not exist"),
            )),
        };

        if !expects_reply {
            if let Err(err) = result {
                crate::log_debug!("send to {service}/{method} failed: {err}");
            }
            return;
        }

        let frame = match &result {
            Ok(data) => encode_reply(header.source, envelope.message_id, data),
            Err(err) => encode_error(header.source, envelope.message_id, err),
        };
        if let Err(err) = connection.transmit(&frame) {
            crate::log_debug!("reply to module {} not sent: {err}", header.source);
        }
    }
}

/// System methods that are notifications and are acknowledged by default.
fn is_notice(method: i32) -> bool {
    // ---
    matches!(
        method,
        system_method::ON_OTHER_MODULE_INSTANCE_SHUTDOWN
            | system_method::SHUTDOWN
            | system_method::ON_OTHER_MODULE_INSTANCE_STARTUP
            | system_method::ON_REGISTRATION_CHANGE
    )
}

/// Receive-thread side of a [`ModuleClient`].
struct Dispatcher(Arc<ClientInner>);

impl MessageSink for Dispatcher {
    fn deliver(&self, connection: &Connection, envelope: Envelope) {
        // ---
        match envelope.kind {
            MessageKind::Reply | MessageKind::Exception => {
                let id = envelope.message_id;
                let event = if envelope.kind == MessageKind::Reply {
                    CallEvent::Reply(envelope.payload)
                } else {
                    CallEvent::Exception(envelope.payload)
                };
                if !crate::lock_ignore_poison(&self.0.calls).complete(id, event) {
                    crate::log_warn!("no outstanding call with message id {id}");
                }
            }
            MessageKind::Call | MessageKind::Send => {
                let header = match envelope.call_header() {
                    Ok(header) => header,
                    Err(err) => {
                        crate::log_warn!("dropping malformed request: {err}");
                        return;
                    }
                };
                if header.service == SYSTEM_SERVICE {
                    self.0.system_notice(connection, &header);
                }

                // Handlers may block or call back through this connection.
                let me = self.0.clone();
                let connection = connection.clone();
                let spawned = thread::Builder::new()
                    .name("sbw-incoming-call".into())
                    .spawn(move || me.respond(&connection, envelope, header));
                if let Err(err) = spawned {
                    crate::log_error!("cannot start thread for incoming call: {err}");
                }
            }
        }
    }

    fn disconnected(&self, _connection: &Connection) {
        // ---
        let released = crate::lock_ignore_poison(&self.0.calls).fail_all();
        if released > 0 {
            crate::log_warn!("broker connection closed with {released} calls outstanding");
        }
    }
}
