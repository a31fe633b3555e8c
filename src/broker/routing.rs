//! Per-instance receive loop: forwards frames to their destination module.

use super::{control, BrokerInner};
use crate::error::RemoteErrorKind;
use crate::instance::ModuleInstance;
use crate::protocol::{encode_exception, read_incoming, Envelope, Incoming, MessageKind, BROKER_MODULE};
use std::net::TcpStream;
use std::sync::Arc;

/// Read frames from `instance` until it disconnects or the socket fails.
pub(super) fn run(inner: &Arc<BrokerInner>, instance: &ModuleInstance, mut stream: TcpStream) {
    // ---
    loop {
        let incoming = match read_incoming(&mut stream) {
            Ok(incoming) => incoming,
            Err(err) => {
                if inner.is_running() {
                    crate::log_debug!("module {} connection ended: {err}", instance.id());
                }
                return;
            }
        };
        let envelope = match incoming {
            Incoming::Disconnect => {
                crate::log_debug!("module {} sent disconnect", instance.id());
                return;
            }
            Incoming::Frame { destination, body } => match Envelope::from_body(destination, body) {
                Ok(envelope) => envelope,
                Err(err) => {
                    crate::log_warn!("dropping malformed frame from module {}: {err}", instance.id());
                    continue;
                }
            },
        };

        if envelope.destination == BROKER_MODULE {
            control::handle(inner, instance, &envelope);
        } else {
            forward(inner, instance, &envelope);
        }
    }
}

fn forward(inner: &BrokerInner, sender: &ModuleInstance, envelope: &Envelope) {
    // ---
    let Some(target) = inner.instances.get(envelope.destination) else {
        bounce(sender, envelope);
        return;
    };
    if let Err(err) = target.transmit(&envelope.to_frame()) {
        crate::log_warn!("cannot forward to module {}: {err}", target.id());
        if envelope.kind.is_request() {
            bounce(sender, envelope);
        }
    }
}

/// Tell the sender of a call that its destination is gone.
///
/// Sends have nobody waiting, and stray replies are dropped.
fn bounce(sender: &ModuleInstance, envelope: &Envelope) {
    // ---
    if !envelope.kind.is_request() {
        crate::log_debug!(
            "dropping {:?} from module {} for missing module {}",
            envelope.kind,
            sender.id(),
            envelope.destination
        );
        return;
    }

    let source = envelope
        .call_header()
        .map(|header| header.source)
        .unwrap_or_else(|_| sender.id());
    let message = format!("Module instance id {} does not exist", envelope.destination);
    crate::log_debug!("{message} (from module {source})");

    if envelope.kind != MessageKind::Call {
        return;
    }
    let frame = encode_exception(
        source,
        envelope.message_id,
        RemoteErrorKind::Communication,
        &message,
        "",
    );
    if let Err(err) = sender.transmit(&frame) {
        crate::log_debug!("cannot return error to module {}: {err}", sender.id());
    }
}
