//! Services the broker itself answers on module id -1.

use super::BrokerInner;
use crate::error::RemoteErrorKind;
use crate::instance::ModuleInstance;
use crate::protocol::{
    encode_exception, encode_reply, system_method, DataBlockWriter, Envelope, MessageKind,
    BROKER_CONTROL_SERVICE, SHUTDOWN_BROKER_METHOD, SYSTEM_SERVICE,
};
use std::sync::Arc;

pub(super) fn handle(inner: &Arc<BrokerInner>, sender: &ModuleInstance, envelope: &Envelope) {
    // ---
    let header = match envelope.call_header() {
        Ok(header) => header,
        Err(_) => {
            crate::log_debug!("ignoring {:?} from module {} to the broker", envelope.kind, sender.id());
            return;
        }
    };
    let is_call = envelope.kind == MessageKind::Call;

    let reply = |frame: &[u8]| {
        if let Err(err) = sender.transmit(frame) {
            crate::log_debug!("cannot answer module {}: {err}", sender.id());
        }
    };

    match (header.service, header.method) {
        (BROKER_CONTROL_SERVICE, SHUTDOWN_BROKER_METHOD) => {
            crate::log_info!("module {} requested broker shutdown", sender.id());
            if is_call {
                let mut data = DataBlockWriter::new();
                data.add_void();
                reply(&encode_reply(header.source, envelope.message_id, &data));
            }
            inner.request_shutdown();
        }
        (SYSTEM_SERVICE, method) if is_notice(method) => {
            if is_call {
                reply(&encode_reply(header.source, envelope.message_id, &DataBlockWriter::new()));
            }
        }
        (service, method) => {
            crate::log_debug!("module {} called unknown broker method {service}/{method}", sender.id());
            if is_call {
                reply(&encode_exception(
                    header.source,
                    envelope.message_id,
                    RemoteErrorKind::MethodNotFound,
                    &format!("Method {method} does not exist on service {service}"),
                    "",
                ));
            }
        }
    }
}

fn is_notice(method: i32) -> bool {
    matches!(
        method,
        system_method::ON_OTHER_MODULE_INSTANCE_SHUTDOWN
            | system_method::SHUTDOWN
            | system_method::ON_OTHER_MODULE_INSTANCE_STARTUP
            | system_method::ON_REGISTRATION_CHANGE
    )
}
