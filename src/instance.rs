//! Registry entry for one connected module.

use crate::host::Host;
use crate::protocol::BROKER_MODULE;
use crate::{Result, SbwError};
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::Mutex;

/// Write half of an instance's connection.
type Link = Box<dyn Write + Send>;

/// A module known to the broker.
///
/// Writes to the module go through [`ModuleInstance::transmit`], which holds
/// the instance's transmit lock for the whole frame.
pub struct ModuleInstance {
    // ---
    id: i32,
    name: String,
    host: Host,
    broker_id: i32,
    link: Mutex<Option<Link>>,
    socket: Option<TcpStream>,
}

impl std::fmt::Debug for ModuleInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // ---
        f.debug_struct("ModuleInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("host", &self.host)
            .field("broker_id", &self.broker_id)
            .finish()
    }
}

impl ModuleInstance {
    // ---

    /// Instance connected through `socket`, owned by this broker.
    pub fn connected(id: i32, name: impl Into<String>, host: Host, socket: TcpStream) -> Result<Self> {
        // ---
        let writer = socket.try_clone()?;
        Ok(Self {
            id,
            name: name.into(),
            host,
            broker_id: BROKER_MODULE,
            link: Mutex::new(Some(Box::new(writer))),
            socket: Some(socket),
        })
    }

    /// Instance writing to an arbitrary sink.
    pub fn with_link(
        id: i32,
        name: impl Into<String>,
        host: Host,
        broker_id: i32,
        link: impl Write + Send + 'static,
    ) -> Self {
        // ---
        Self {
            id,
            name: name.into(),
            host,
            broker_id,
            link: Mutex::new(Some(Box::new(link))),
            socket: None,
        }
    }

    /// Instance with no connection; transmits fail.
    pub fn detached(id: i32, name: impl Into<String>, host: Host, broker_id: i32) -> Self {
        // ---
        Self {
            id,
            name: name.into(),
            host,
            broker_id,
            link: Mutex::new(None),
            socket: None,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn host(&self) -> &Host {
        &self.host
    }

    /// Id of the broker that owns this instance; [`BROKER_MODULE`] for local ones.
    pub fn broker_id(&self) -> i32 {
        self.broker_id
    }

    /// `host name:module name`, for messages.
    pub fn full_name(&self) -> String {
        format!("{}:{}", self.host.name(), self.name)
    }

    /// `host address:module name`, the instance table's name key.
    pub fn internal_name(&self) -> String {
        internal_name(self.host.address(), &self.name)
    }

    /// Write one complete frame under the transmit lock.
    pub fn transmit(&self, frame: &[u8]) -> Result<()> {
        // ---
        let mut link = crate::lock_ignore_poison(&self.link);
        let writer = link.as_mut().ok_or_else(|| {
            SbwError::communication(format!("module instance {} is not connected", self.id))
        })?;
        writer.write_all(frame)?;
        writer.flush()?;
        Ok(())
    }

    /// Drop the write half and shut the socket down, unblocking its reader.
    pub fn close(&self) {
        // ---
        let mut link = crate::lock_ignore_poison(&self.link);
        link.take();
        if let Some(socket) = &self.socket {
            let _ = socket.shutdown(Shutdown::Both);
        }
    }
}

pub(crate) fn internal_name(address: &str, name: &str) -> String {
    format!("{address}:{name}")
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Sink(Arc<Mutex<Vec<u8>>>);

    impl Write for Sink {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_names() {
        // ---
        let inst = ModuleInstance::detached(4, "solver", Host::local(-1), BROKER_MODULE);
        assert_eq!(inst.full_name(), "localhost:solver");
        assert_eq!(inst.internal_name(), "127.0.0.1:solver");
    }

    #[test]
    fn test_transmit_and_close() {
        // ---
        let sink = Sink::default();
        let inst = ModuleInstance::with_link(1, "m", Host::local(-1), BROKER_MODULE, sink.clone());
        inst.transmit(&[1, 2, 3]).unwrap();
        assert_eq!(*sink.0.lock().unwrap(), vec![1, 2, 3]);

        inst.close();
        assert!(inst.transmit(&[4]).is_err());
    }
}
