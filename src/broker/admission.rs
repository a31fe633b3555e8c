//! Accept loop and module handshake.

use super::{routing, BrokerInner};
use crate::host::{Host, ANY_PORT};
use crate::instance::ModuleInstance;
use crate::protocol::{read_handshake_string, write_i32};
use crate::{Result, SbwError};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread;

/// Id written back to a module whose handshake was refused.
const REJECTED: i32 = -1;

pub(super) fn accept_loop(inner: Arc<BrokerInner>, listener: TcpListener) {
    // ---
    for stream in listener.incoming() {
        if !inner.is_running() {
            break;
        }
        let stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                crate::log_warn!("accept failed: {err}");
                continue;
            }
        };

        let conn_inner = inner.clone();
        let spawned = thread::Builder::new()
            .name("sbw-module".into())
            .spawn(move || serve_connection(conn_inner, stream));
        match spawned {
            Ok(handle) => inner.track(handle),
            Err(err) => crate::log_error!("cannot start module thread: {err}"),
        }
    }
    crate::log_debug!("accept loop finished");
}

/// Handshake, register, then route until the module goes away.
fn serve_connection(inner: Arc<BrokerInner>, mut stream: TcpStream) {
    // ---
    let instance = match admit(&inner, &mut stream) {
        Ok(Some(instance)) => instance,
        Ok(None) => {
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
        Err(err) => {
            crate::log_warn!("module handshake failed: {err}");
            let _ = stream.shutdown(Shutdown::Both);
            return;
        }
    };

    inner.notify_startup(&instance);
    routing::run(&inner, &instance, stream);
    inner.retire(&instance);
}

/// Run the handshake on a fresh socket.
///
/// `Ok(None)` means the peer was refused and has been told so, or was
/// dropped without a reply.
fn admit(inner: &BrokerInner, stream: &mut TcpStream) -> Result<Option<Arc<ModuleInstance>>> {
    // ---
    let peer = stream.peer_addr()?;
    let host = Host::from_ip(peer.ip(), ANY_PORT);
    let local = host.is_local();

    if !local && !(inner.config.allow_remote_modules && inner.config.access.is_permitted(host.address())) {
        crate::log_warn!("refusing module connection from {}", host.address());
        return Ok(None);
    }
    if !inner.is_running() {
        return Ok(None);
    }

    stream.set_read_timeout(Some(inner.config.handshake_timeout))?;
    let key = read_handshake_string(stream)?;
    let name = read_handshake_string(stream)?;

    if local && key != inner.key {
        crate::log_warn!("module '{name}' presented a wrong session key");
        write_i32(stream, REJECTED)?;
        return Ok(None);
    }

    let id = inner.instances.next_id();
    let name = if name.is_empty() {
        format!("anonymous-{id}")
    } else {
        name
    };

    let writer = stream
        .try_clone()
        .map_err(|err| SbwError::communication_detail("cannot register module", err.to_string()))?;
    let instance = Arc::new(ModuleInstance::connected(id, name, host, writer)?);

    // Register before replying so the module can be called as soon as it
    // knows its id.
    inner.instances.add(instance.clone());
    if let Err(err) = write_i32(stream, id) {
        inner.instances.remove(&instance);
        return Err(err.into());
    }
    stream.set_read_timeout(None)?;

    crate::log_info!("module {id} ({}) connected", instance.full_name());
    Ok(Some(instance))
}
