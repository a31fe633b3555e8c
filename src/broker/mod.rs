//! The broker: admits module connections and routes frames between them.
//!
//! # Threads
//!
//! - one accept thread, see [`admission`]
//! - one thread per module connection, which performs the handshake and
//!   then runs that instance's routing loop, see [`routing`]
//!
//! Frames addressed to [`BROKER_MODULE`] are answered by the control
//! service in [`control`]. The instance table is the only state shared
//! between connection threads.

mod admission;
mod control;
mod routing;

use crate::config::BrokerConfig;
use crate::instance::ModuleInstance;
use crate::instance_table::InstanceTable;
use crate::properties::{PropertiesFile, BROKER_PORT, MODULE_PORT};
use crate::protocol::{encode_send, system_method, DataBlockWriter, BROKER_MODULE, SYSTEM_SERVICE};
use crate::retry::retry_blocking;
use crate::session_key::SessionKey;
use crate::{Result, SbwError};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use tokio::sync::oneshot;

/// A running broker.
///
/// Cloning is cheap; every clone controls the same broker.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

pub(crate) struct BrokerInner {
    // ---
    config: BrokerConfig,
    instances: InstanceTable,
    session_key: SessionKey,
    key: String,
    port: u16,
    running: AtomicBool,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
    connection_threads: Mutex<Vec<JoinHandle<()>>>,

    // Fired once shutdown has finished.
    stopped_tx: Mutex<Option<oneshot::Sender<()>>>,
    stopped_rx: Mutex<Option<oneshot::Receiver<()>>>,
}

impl Broker {
    // ---

    /// Load the session key, bind a module port, publish it and start accepting.
    ///
    /// The key must already be on disk; see
    /// [`init_session_key`](crate::bootstrap::init_session_key).
    pub fn start(config: BrokerConfig) -> Result<Self> {
        // ---
        let session_key = SessionKey::new(config.paths.key_file());
        let key = session_key.key()?;

        let listener = bind_first_free(&config)?;
        let port = listener.local_addr()?.port();

        let (stopped_tx, stopped_rx) = oneshot::channel();
        let inner = Arc::new(BrokerInner {
            config,
            instances: InstanceTable::new(),
            session_key,
            key,
            port,
            running: AtomicBool::new(true),
            accept_thread: Mutex::new(None),
            connection_threads: Mutex::new(Vec::new()),
            stopped_tx: Mutex::new(Some(stopped_tx)),
            stopped_rx: Mutex::new(Some(stopped_rx)),
        });

        inner.publish_port()?;

        let accept_inner = inner.clone();
        let handle = thread::Builder::new()
            .name("sbw-accept".into())
            .spawn(move || admission::accept_loop(accept_inner, listener))?;
        *crate::lock_ignore_poison(&inner.accept_thread) = Some(handle);

        crate::log_info!("broker listening for modules on port {port}");
        Ok(Self { inner })
    }

    /// Port modules connect to.
    pub fn port(&self) -> u16 {
        self.inner.port
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    pub fn instances(&self) -> &InstanceTable {
        &self.inner.instances
    }

    /// Block until the broker has shut down.
    pub fn wait(&self) {
        // ---
        let stopped_rx = crate::lock_ignore_poison(&self.inner.stopped_rx).take();
        if let Some(rx) = stopped_rx {
            let _ = rx.blocking_recv();
        }
    }

    /// Stop accepting, tell every module to leave, and clear the runtime files.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }
}

fn bind_first_free(config: &BrokerConfig) -> Result<TcpListener> {
    // ---
    let address = if config.allow_remote_modules {
        Ipv4Addr::UNSPECIFIED
    } else {
        Ipv4Addr::LOCALHOST
    };
    for port in config.module_ports.ports() {
        match TcpListener::bind((address, port)) {
            Ok(listener) => return Ok(listener),
            Err(err) => crate::log_debug!("port {port} unavailable: {err}"),
        }
    }
    Err(SbwError::BrokerStart {
        message: "unable to find a free module port".into(),
        detail: format!("no port available in range {}", config.module_ports),
    })
}

impl BrokerInner {
    // ---

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn publish_port(&self) -> Result<()> {
        // ---
        let mut props = PropertiesFile::load(self.config.paths.properties_file())?;
        props.set(MODULE_PORT, self.port.to_string());
        // Broker-to-broker links are not offered.
        props.remove(BROKER_PORT);
        props.save()
    }

    fn clear_port(&self) -> Result<()> {
        // ---
        let mut props = PropertiesFile::load(self.config.paths.properties_file())?;
        props.remove(MODULE_PORT);
        props.remove(BROKER_PORT);
        props.save()
    }

    fn track(&self, handle: JoinHandle<()>) {
        // ---
        let mut threads = crate::lock_ignore_poison(&self.connection_threads);
        threads.retain(|h| !h.is_finished());
        threads.push(handle);
    }

    /// Send a system notice to every local module except `skip`.
    fn notify_locals(&self, method: i32, args: &DataBlockWriter, skip: i32) {
        // ---
        for instance in self.instances.get_all_for_broker(BROKER_MODULE) {
            if instance.id() == skip {
                continue;
            }
            let frame = encode_send(instance.id(), BROKER_MODULE, SYSTEM_SERVICE, method, args);
            if let Err(err) = instance.transmit(&frame) {
                crate::log_debug!("notice to module {} not delivered: {err}", instance.id());
            }
        }
    }

    fn notify_startup(&self, instance: &ModuleInstance) {
        // ---
        let mut args = DataBlockWriter::new();
        args.add_integer(instance.id()).add_string(instance.name());
        self.notify_locals(system_method::ON_OTHER_MODULE_INSTANCE_STARTUP, &args, instance.id());
    }

    fn notify_shutdown(&self, id: i32) {
        // ---
        let mut args = DataBlockWriter::new();
        args.add_integer(id);
        self.notify_locals(system_method::ON_OTHER_MODULE_INSTANCE_SHUTDOWN, &args, id);
    }

    /// Drop an instance whose connection has ended and tell the others.
    fn retire(&self, instance: &ModuleInstance) {
        // ---
        let removed = self.instances.remove(instance);
        instance.close();
        if removed {
            crate::log_info!("module {} ({}) disconnected", instance.id(), instance.full_name());
            self.notify_shutdown(instance.id());
        }
    }

    /// Run [`shutdown`](Self::shutdown) on its own thread, for callers that
    /// are themselves connection threads.
    fn request_shutdown(self: &Arc<Self>) {
        // ---
        let inner = self.clone();
        let spawned = thread::Builder::new()
            .name("sbw-shutdown".into())
            .spawn(move || inner.shutdown());
        if let Err(err) = spawned {
            crate::log_error!("cannot start shutdown thread: {err}");
        }
    }

    fn shutdown(&self) {
        // ---
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        crate::log_info!("broker shutting down");

        let notice = DataBlockWriter::new();
        for instance in self.instances.get_all() {
            let frame = encode_send(
                instance.id(),
                BROKER_MODULE,
                SYSTEM_SERVICE,
                system_method::SHUTDOWN,
                &notice,
            );
            if let Err(err) = instance.transmit(&frame) {
                crate::log_debug!("shutdown notice to module {} failed: {err}", instance.id());
            }
        }

        let gone = retry_blocking(&self.config.shutdown_grace, |_| {
            if self.instances.is_empty() {
                Ok(())
            } else {
                Err(SbwError::Unavailable(format!("{} modules still connected", self.instances.len())))
            }
        });
        if gone.is_err() {
            crate::log_warn!("closing {} modules that did not disconnect", self.instances.len());
        }
        for instance in self.instances.get_all() {
            instance.close();
        }

        // Wake the accept loop so it sees `running == false`.
        let _ = TcpStream::connect((Ipv4Addr::LOCALHOST, self.port));
        if let Some(handle) = crate::lock_ignore_poison(&self.accept_thread).take() {
            let _ = handle.join();
        }

        let threads: Vec<_> = crate::lock_ignore_poison(&self.connection_threads).drain(..).collect();
        let me = thread::current().id();
        for handle in threads {
            if handle.thread().id() != me {
                let _ = handle.join();
            }
        }

        if let Err(err) = self.clear_port() {
            crate::log_error!("cannot clear broker port: {err}");
        }
        if let Err(err) = self.session_key.remove() {
            crate::log_error!("cannot clear session key: {err}");
        }

        if let Some(tx) = crate::lock_ignore_poison(&self.stopped_tx).take() {
            let _ = tx.send(());
        }
        crate::log_info!("broker stopped");
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::bootstrap::init_session_key;
    use crate::client::ModuleClient;
    use crate::config::{ConnectConfig, PortRange, SbwPaths};
    use crate::error::RemoteErrorKind;
    use crate::retry::RetryConfig;
    use std::time::Duration;

    fn started(dir: &tempfile::TempDir) -> (Broker, SbwPaths) {
        // ---
        let paths = SbwPaths::with_user_dir(dir.path());
        init_session_key(&SessionKey::new(paths.key_file()), false, false).unwrap();
        let config = BrokerConfig::new(paths.clone())
            .with_module_ports(PortRange::ephemeral())
            .with_shutdown_grace(RetryConfig::fixed(10, Duration::from_millis(50)));
        (Broker::start(config).unwrap(), paths)
    }

    #[test]
    fn test_start_publishes_port() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let (broker, paths) = started(&dir);

        let props = PropertiesFile::load(paths.properties_file()).unwrap();
        assert_eq!(props.get_i32(MODULE_PORT), Some(i32::from(broker.port())));
        assert_eq!(props.get(BROKER_PORT), None);

        broker.shutdown();
        let props = PropertiesFile::load(paths.properties_file()).unwrap();
        assert_eq!(props.get(MODULE_PORT), None);
        assert!(!broker.is_running());
    }

    #[test]
    fn test_start_without_key_fails() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig::new(SbwPaths::with_user_dir(dir.path()))
            .with_module_ports(PortRange::ephemeral());
        assert!(matches!(Broker::start(config), Err(SbwError::SessionKey(_))));
    }

    #[test]
    fn test_busy_port_range_is_reported() {
        // ---
        let taken = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = taken.local_addr().unwrap().port();
        let dir = tempfile::tempdir().unwrap();
        let config = BrokerConfig::new(SbwPaths::with_user_dir(dir.path()))
            .with_module_ports(PortRange { low: port, high: port });

        let err = bind_first_free(&config).unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::BrokerStart);
    }

    #[test]
    fn test_unknown_broker_method() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let (broker, paths) = started(&dir);
        let client = ModuleClient::new(ConnectConfig::existing_only(paths));
        client.connect("probe").unwrap();

        let err = client
            .call(BROKER_MODULE, SYSTEM_SERVICE, system_method::GET_METHODS, &DataBlockWriter::new())
            .unwrap_err();
        assert_eq!(err.kind(), RemoteErrorKind::MethodNotFound);

        let ack = client.call(
            BROKER_MODULE,
            SYSTEM_SERVICE,
            system_method::ON_REGISTRATION_CHANGE,
            &DataBlockWriter::new(),
        );
        assert!(ack.is_ok());

        client.disconnect();
        broker.shutdown();
    }

    #[test]
    fn test_empty_name_becomes_anonymous() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let (broker, paths) = started(&dir);
        let client = ModuleClient::new(ConnectConfig::existing_only(paths));
        let id = client.connect("").unwrap();

        let instance = broker.instances().get(id).unwrap();
        assert_eq!(instance.name(), format!("anonymous-{id}"));
        assert!(instance.host().is_local());

        client.disconnect();
        broker.shutdown();
    }
}
