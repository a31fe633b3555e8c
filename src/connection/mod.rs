//! A module's connection to the broker.
//!
//! One [`Connection`] owns one socket. Writers share it through a single
//! transmit lock; a dedicated receive thread owns the read half and hands
//! every frame addressed to this module to a [`MessageSink`].
//!
//! # Connecting
//!
//! [`Connection::connect`] first tries the port published in
//! `run.properties`. If nothing answers it launches a broker, polls the
//! properties file until a port appears, then retries the handshake. Both
//! waits are bounded by [`ConnectConfig`] retry budgets.

mod launch;
mod state;

pub use launch::launch_broker;
pub use state::ConnectionState;

use crate::config::ConnectConfig;
use crate::host::LOCAL_ADDRESS;
use crate::properties::{PropertiesFile, MODULE_PORT};
use crate::protocol::{
    encode_disconnect, read_i32, read_incoming, write_handshake_string, Envelope, Incoming,
};
use crate::retry::retry_blocking;
use crate::session_key::SessionKey;
use crate::{Result, SbwError};
use std::io::Write;
use std::net::{Shutdown, TcpStream};
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Module id value meaning "none assigned".
const NO_MODULE_ID: i32 = -1;

/// Receives what the connection's receive thread reads.
///
/// Both methods run on the receive thread; long work should be handed off.
pub trait MessageSink: Send + Sync + 'static {
    /// A frame addressed to this module.
    fn deliver(&self, connection: &Connection, envelope: Envelope);

    /// The receive loop ended; no more frames will arrive.
    fn disconnected(&self, connection: &Connection);
}

#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    config: ConnectConfig,
    session_key: SessionKey,
    state: Mutex<ConnectionState>,
    module_id: AtomicI32,
    // Bumped on every successful connect so a stale receive thread cannot
    // reset the state of a newer connection.
    generation: AtomicU64,
    transmit: Mutex<Option<TcpStream>>,
    receiver: Mutex<Option<JoinHandle<()>>>,
}

impl Connection {
    // ---

    pub fn new(config: ConnectConfig) -> Self {
        // ---
        let session_key = SessionKey::new(config.paths.key_file());
        Self {
            inner: Arc::new(Inner {
                config,
                session_key,
                state: Mutex::new(ConnectionState::Disconnected),
                module_id: AtomicI32::new(NO_MODULE_ID),
                generation: AtomicU64::new(0),
                transmit: Mutex::new(None),
                receiver: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *crate::lock_ignore_poison(&self.inner.state)
    }

    fn set_state(&self, state: ConnectionState) {
        *crate::lock_ignore_poison(&self.inner.state) = state;
    }

    /// Id assigned by the broker, while connected.
    pub fn module_id(&self) -> Option<i32> {
        // ---
        match self.inner.module_id.load(Ordering::SeqCst) {
            NO_MODULE_ID => None,
            id => Some(id),
        }
    }

    pub fn config(&self) -> &ConnectConfig {
        &self.inner.config
    }

    /// Connect to (and if necessary start) the broker as `module_name`.
    ///
    /// Returns the assigned module id. Calling this while already connected
    /// returns the current id without touching the socket.
    pub fn connect(&self, module_name: &str, sink: Arc<dyn MessageSink>) -> Result<i32> {
        // ---
        {
            let mut state = crate::lock_ignore_poison(&self.inner.state);
            if *state == ConnectionState::Disconnecting {
                drop(state);
                thread::sleep(self.inner.config.disconnect_grace);
                state = crate::lock_ignore_poison(&self.inner.state);
                if *state == ConnectionState::Disconnecting {
                    crate::log_warn!("forcing reset of a connection still disconnecting");
                    *state = ConnectionState::Disconnected;
                }
            }
            if *state != ConnectionState::Disconnected {
                return self
                    .module_id()
                    .ok_or_else(|| SbwError::communication(format!("connection is {}", *state)));
            }
            *state = ConnectionState::Connecting;
        }

        match self.establish(module_name) {
            Ok((stream, id)) => self.start_receiving(stream, id, sink),
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                crate::log_error!("unable to connect {module_name} to broker: {err}");
                Err(SbwError::communication_detail(
                    "unable to connect to broker",
                    err.to_string(),
                ))
            }
        }
    }

    fn broker_host(&self) -> &str {
        self.inner.config.broker_host.as_deref().unwrap_or(LOCAL_ADDRESS)
    }

    fn is_local_broker(&self) -> bool {
        // ---
        matches!(
            self.inner.config.broker_host.as_deref(),
            None | Some(LOCAL_ADDRESS) | Some("localhost")
        )
    }

    fn establish(&self, module_name: &str) -> Result<(TcpStream, i32)> {
        // ---
        let config = &self.inner.config;
        let mut props = PropertiesFile::load(config.paths.properties_file())?;
        let published = props.get_i32(MODULE_PORT);

        if let Some(port) = published {
            match self.try_handshake(port, module_name) {
                Ok(found) => return Ok(found),
                Err(err) => crate::log_debug!("no broker answering on port {port}: {err}"),
            }
        }

        if config.launch_broker && self.is_local_broker() {
            if let Err(err) = launch_broker(&config.paths) {
                crate::log_warn!("{err}: {}", err.detail());
            }
        }

        let before = props.modified();
        let port = retry_blocking(&config.startup_poll, |_| {
            props.reload()?;
            match props.get_i32(MODULE_PORT) {
                Some(port) if published.is_none() || props.modified() != before => Ok(port),
                _ => Err(SbwError::Unavailable("broker port not published".into())),
            }
        })?;

        retry_blocking(&config.handshake_retry, |_| self.try_handshake(port, module_name))
    }

    fn try_handshake(&self, port: i32, module_name: &str) -> Result<(TcpStream, i32)> {
        // ---
        let port = u16::try_from(port)
            .map_err(|_| SbwError::Config(format!("invalid broker port {port}")))?;
        let key = self.inner.session_key.load()?.unwrap_or_default();
        handshake(
            self.broker_host(),
            port,
            &key,
            module_name,
            self.inner.config.handshake_timeout,
        )
    }

    fn start_receiving(&self, stream: TcpStream, id: i32, sink: Arc<dyn MessageSink>) -> Result<i32> {
        // ---
        let reader = match stream.try_clone() {
            Ok(reader) => reader,
            Err(err) => {
                self.set_state(ConnectionState::Disconnected);
                return Err(err.into());
            }
        };

        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        *crate::lock_ignore_poison(&self.inner.transmit) = Some(stream);
        self.inner.module_id.store(id, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);

        let connection = self.clone();
        let spawned = thread::Builder::new()
            .name(format!("sbw-receive-{id}"))
            .spawn(move || connection.receive_loop(reader, sink, generation));
        match spawned {
            Ok(handle) => {
                *crate::lock_ignore_poison(&self.inner.receiver) = Some(handle);
                crate::log_info!("connected to broker as module {id}");
                Ok(id)
            }
            Err(err) => {
                self.release_socket();
                self.inner.module_id.store(NO_MODULE_ID, Ordering::SeqCst);
                self.set_state(ConnectionState::Disconnected);
                Err(err.into())
            }
        }
    }

    fn receive_loop(self, mut reader: TcpStream, sink: Arc<dyn MessageSink>, generation: u64) {
        // ---
        let my_id = self.inner.module_id.load(Ordering::SeqCst);
        crate::log_debug!("receive thread started for module {my_id}");

        loop {
            match read_incoming(&mut reader) {
                Ok(Incoming::Disconnect) => {
                    crate::log_debug!("broker sent disconnect to module {my_id}");
                    self.set_state(ConnectionState::Disconnecting);
                    break;
                }
                Ok(Incoming::Frame { destination, body }) => {
                    if destination != my_id {
                        crate::log_warn!(
                            "received message for different module {destination} (this is {my_id})"
                        );
                        continue;
                    }
                    match Envelope::from_body(destination, body) {
                        Ok(envelope) => sink.deliver(&self, envelope),
                        Err(err) => crate::log_warn!("dropping malformed message: {err}"),
                    }
                }
                Err(err) => {
                    if self.state() == ConnectionState::Connected {
                        crate::log_warn!("connection of module {my_id} lost: {err}");
                    }
                    break;
                }
            }
        }

        self.release_socket();
        sink.disconnected(&self);

        if self.inner.generation.load(Ordering::SeqCst) == generation {
            self.inner.module_id.store(NO_MODULE_ID, Ordering::SeqCst);
            self.set_state(ConnectionState::Disconnected);
        }
        crate::log_debug!("receive thread stopped for module {my_id}");
    }

    fn release_socket(&self) {
        // ---
        if let Some(stream) = crate::lock_ignore_poison(&self.inner.transmit).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }

    /// Write one complete frame under the transmit lock.
    pub fn transmit(&self, frame: &[u8]) -> Result<()> {
        // ---
        let mut guard = crate::lock_ignore_poison(&self.inner.transmit);
        let stream = guard
            .as_mut()
            .ok_or_else(|| SbwError::communication("not connected to broker"))?;
        stream
            .write_all(frame)
            .and_then(|_| stream.flush())
            .map_err(|e| SbwError::communication_detail("unable to transmit to broker", e.to_string()))
    }

    /// Tell the broker this module is leaving. Never blocks on the peer.
    pub fn signal_disconnect(&self) {
        // ---
        {
            let mut state = crate::lock_ignore_poison(&self.inner.state);
            if *state != ConnectionState::Connected {
                return;
            }
            *state = ConnectionState::Disconnecting;
        }

        if let Some(stream) = crate::lock_ignore_poison(&self.inner.transmit).as_mut() {
            if let Err(err) = stream.write_all(&encode_disconnect()) {
                crate::log_debug!("disconnect notice not delivered: {err}");
            }
            let _ = stream.shutdown(Shutdown::Write);
        }
    }

    /// Block until the receive thread has exited.
    ///
    /// Returns immediately when called from the receive thread itself.
    pub fn wait_for_disconnect(&self) {
        // ---
        let handle = crate::lock_ignore_poison(&self.inner.receiver).take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                crate::log_error!("receive thread panicked");
            }
        }
    }
}

/// Open a socket to `host:port`, present `key` and `module_name`, and read
/// the assigned module id.
///
/// Connection failures are I/O errors and may be retried; a peer that
/// answers wrongly or rejects the key is a communication error.
pub(crate) fn handshake(
    host: &str,
    port: u16,
    key: &str,
    module_name: &str,
    timeout: Duration,
) -> Result<(TcpStream, i32)> {
    // ---
    let mut stream = TcpStream::connect((host, port))?;
    let protocol = |e: std::io::Error| {
        SbwError::communication_detail(format!("handshake with {host}:{port} failed"), e.to_string())
    };

    stream.set_nodelay(true).map_err(protocol)?;
    stream.set_read_timeout(Some(timeout)).map_err(protocol)?;
    write_handshake_string(&mut stream, key).map_err(protocol)?;
    write_handshake_string(&mut stream, module_name).map_err(protocol)?;
    stream.flush().map_err(protocol)?;

    let id = read_i32(&mut stream).map_err(protocol)?;
    if id < 0 {
        return Err(SbwError::communication(format!(
            "broker at {host}:{port} rejected the connection"
        )));
    }
    stream.set_read_timeout(None).map_err(protocol)?;
    Ok((stream, id))
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::config::SbwPaths;
    use crate::protocol::{encode_reply, read_handshake_string, write_i32, DataBlockWriter, MessageKind};
    use crate::retry::RetryConfig;
    use std::net::TcpListener;
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<Envelope>>,
        closed: Mutex<bool>,
    }

    impl MessageSink for Recorder {
        fn deliver(&self, _connection: &Connection, envelope: Envelope) {
            self.seen.lock().unwrap().push(envelope);
        }
        fn disconnected(&self, _connection: &Connection) {
            *self.closed.lock().unwrap() = true;
        }
    }

    fn quick_config(paths: SbwPaths) -> ConnectConfig {
        // ---
        ConnectConfig::new(paths)
            .with_launch_broker(false)
            .with_startup_poll(RetryConfig::fixed(3, Duration::from_millis(10)))
            .with_handshake_retry(RetryConfig::fixed(3, Duration::from_millis(10)))
    }

    /// Publish a listener's port the way a broker does.
    fn publish(paths: &SbwPaths, port: u16) {
        // ---
        let mut props = PropertiesFile::new(paths.properties_file());
        props.set(MODULE_PORT, port.to_string());
        props.save().unwrap();
    }

    #[test]
    fn test_connect_without_broker_fails_within_budget() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::new(quick_config(SbwPaths::with_user_dir(dir.path())));

        let start = Instant::now();
        let err = conn.connect("m", Arc::new(Recorder::default())).unwrap_err();
        assert!(matches!(err, SbwError::Communication { .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(conn.state(), ConnectionState::Disconnected);
    }

    #[test]
    fn test_transmit_while_disconnected_fails() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let conn = Connection::new(quick_config(SbwPaths::with_user_dir(dir.path())));
        assert!(conn.transmit(&[0; 4]).is_err());
    }

    #[test]
    fn test_handshake_then_receive_and_disconnect() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let paths = SbwPaths::with_user_dir(dir.path());
        let key = SessionKey::new(paths.key_file());
        key.generate();
        key.save().unwrap();
        let expected_key = key.key().unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        publish(&paths, listener.local_addr().unwrap().port());

        let fake_broker = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            assert_eq!(read_handshake_string(&mut sock).unwrap(), expected_key);
            assert_eq!(read_handshake_string(&mut sock).unwrap(), "tester");
            write_i32(&mut sock, 7).unwrap();

            // One frame for someone else, one for us.
            sock.write_all(&encode_reply(9, 1, &DataBlockWriter::new())).unwrap();
            sock.write_all(&encode_reply(7, 2, &DataBlockWriter::new())).unwrap();

            // Expect the disconnect notice, then close.
            assert_eq!(read_i32(&mut sock).unwrap(), -1);
        });

        let recorder = Arc::new(Recorder::default());
        let conn = Connection::new(quick_config(paths));
        assert_eq!(conn.connect("tester", recorder.clone()).unwrap(), 7);
        assert_eq!(conn.state(), ConnectionState::Connected);
        assert_eq!(conn.module_id(), Some(7));

        // Connecting again is a no-op.
        assert_eq!(conn.connect("tester", recorder.clone()).unwrap(), 7);

        let deadline = Instant::now() + Duration::from_secs(5);
        while recorder.seen.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        conn.signal_disconnect();
        conn.wait_for_disconnect();
        fake_broker.join().unwrap();

        let seen = recorder.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].message_id, 2);
        assert_eq!(seen[0].kind, MessageKind::Reply);
        assert!(*recorder.closed.lock().unwrap());
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(conn.module_id(), None);
    }

    #[test]
    fn test_rejected_handshake_is_not_retried() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let paths = SbwPaths::with_user_dir(dir.path());
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        publish(&paths, listener.local_addr().unwrap().port());

        let fake_broker = thread::spawn(move || {
            let (mut sock, _) = listener.accept().unwrap();
            let _ = read_handshake_string(&mut sock);
            let _ = read_handshake_string(&mut sock);
            write_i32(&mut sock, -1).unwrap();
        });

        let conn = Connection::new(
            ConnectConfig::existing_only(paths).with_handshake_timeout(Duration::from_secs(2)),
        );
        assert!(conn.connect("m", Arc::new(Recorder::default())).is_err());
        fake_broker.join().unwrap();
    }
}
