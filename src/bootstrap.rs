//! Process-level orchestration: detect a running broker, prepare the
//! session key, and start or stop the broker.

use crate::broker::Broker;
use crate::client::ModuleClient;
use crate::config::{BrokerConfig, ConnectConfig, SbwPaths};
use crate::connection::handshake;
use crate::host::LOCAL_ADDRESS;
use crate::properties::{PropertiesFile, BROKER_PORT, MODULE_PORT};
use crate::protocol::encode_disconnect;
use crate::session_key::SessionKey;
use crate::{Result, SbwError};
use std::io::Write;
use std::time::Duration;

/// Module name used when probing for a live broker.
const PROBE_NAME: &str = "test";

/// Module name used to ask a broker to shut down.
const SHUTDOWN_CLIENT_NAME: &str = "shutdown";

/// Process exit statuses of the `sbw-broker` binary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitStatus {
    Normal = 0,
    BadArgument = 1,
    BrokerRunning = 2,
    CannotStart = 3,
    CannotLoadKey = 4,
    CannotShutdown = 5,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }
}

/// A failure together with the exit status it maps to.
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct BootstrapError {
    pub status: ExitStatus,
    #[source]
    pub error: SbwError,
}

impl BootstrapError {
    fn new(status: ExitStatus, error: SbwError) -> Self {
        Self { status, error }
    }
}

/// True when a port is published and something on it accepts the on-disk key.
///
/// A stale port, or a listener that does not speak the handshake, reads as
/// not running.
pub fn is_broker_running(paths: &SbwPaths, timeout: Duration) -> bool {
    // ---
    let port = match PropertiesFile::load(paths.properties_file()) {
        Ok(props) => props.get_i32(MODULE_PORT),
        Err(err) => {
            crate::log_debug!("cannot read runtime properties: {err}");
            None
        }
    };
    let Some(port) = port.and_then(|p| u16::try_from(p).ok()).filter(|p| *p > 0) else {
        return false;
    };

    let key = match SessionKey::new(paths.key_file()).load() {
        Ok(Some(key)) => key,
        Ok(None) => return false,
        Err(err) => {
            crate::log_debug!("{err}");
            return false;
        }
    };

    match handshake(LOCAL_ADDRESS, port, &key, PROBE_NAME, timeout) {
        Ok((mut stream, id)) => {
            crate::log_debug!("broker on port {port} answered as module {id}");
            let _ = stream.write_all(&encode_disconnect());
            true
        }
        Err(err) => {
            crate::log_debug!("no broker on port {port}: {err}");
            false
        }
    }
}

/// Make the session key available.
///
/// A running broker or an explicit `reuse` means the key on disk must be
/// used, and its absence is an error. Otherwise a fresh key is generated
/// and saved.
pub fn init_session_key(key: &SessionKey, running: bool, reuse: bool) -> Result<String> {
    // ---
    if running || reuse {
        return key.load()?.ok_or_else(|| {
            SbwError::SessionKey(format!("no session key in {}", key.path().display()))
        });
    }
    let fresh = key.generate();
    key.save()?;
    Ok(fresh)
}

/// Ask the broker to shut down, then clear its port from `run.properties`
/// whether or not it answered.
pub fn shutdown_broker(paths: &SbwPaths) -> Result<()> {
    // ---
    let client = ModuleClient::new(ConnectConfig::existing_only(paths.clone()));
    let result = client
        .connect(SHUTDOWN_CLIENT_NAME)
        .and_then(|_| client.shutdown_broker());
    client.disconnect();

    let cleared = clear_ports(paths);
    result.and(cleared)
}

fn clear_ports(paths: &SbwPaths) -> Result<()> {
    // ---
    let mut props = PropertiesFile::load(paths.properties_file())?;
    props.remove(MODULE_PORT);
    props.remove(BROKER_PORT);
    props.save()
}

/// Run the broker until it is shut down, or stop the running one when
/// `shutdown` is set.
pub fn run(config: BrokerConfig, shutdown: bool) -> std::result::Result<(), BootstrapError> {
    // ---
    let running = is_broker_running(&config.paths, config.handshake_timeout);

    if shutdown {
        if !running {
            crate::log_info!("no broker running");
            return Ok(());
        }
        return shutdown_broker(&config.paths)
            .map_err(|err| BootstrapError::new(ExitStatus::CannotShutdown, err));
    }

    if running {
        return Err(BootstrapError::new(
            ExitStatus::BrokerRunning,
            SbwError::BrokerStart {
                message: "a broker is already running".into(),
                detail: config.paths.user_dir().display().to_string(),
            },
        ));
    }

    let key = SessionKey::new(config.paths.key_file());
    init_session_key(&key, running, config.reuse_key)
        .map_err(|err| BootstrapError::new(ExitStatus::CannotLoadKey, err))?;

    let broker = Broker::start(config).map_err(|err| BootstrapError::new(ExitStatus::CannotStart, err))?;
    broker.wait();
    Ok(())
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use std::net::TcpListener;
    use std::thread;

    fn publish(paths: &SbwPaths, port: u16) {
        let mut props = PropertiesFile::new(paths.properties_file());
        props.set(MODULE_PORT, port.to_string());
        props.save().unwrap();
    }

    #[test]
    fn test_fresh_key_is_generated_and_saved() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let paths = SbwPaths::with_user_dir(dir.path());
        let key = SessionKey::new(paths.key_file());

        let generated = init_session_key(&key, false, false).unwrap();
        assert_eq!(generated.len(), 64);
        assert_eq!(SessionKey::new(paths.key_file()).load().unwrap(), Some(generated));
    }

    #[test]
    fn test_reuse_without_key_fails() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let key = SessionKey::new(dir.path().join("key"));

        let err = init_session_key(&key, false, true).unwrap_err();
        assert!(matches!(err, SbwError::SessionKey(_)));
        assert!(init_session_key(&key, true, false).is_err());
    }

    #[test]
    fn test_reuse_loads_existing_key() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let key = SessionKey::new(dir.path().join("key"));
        let first = init_session_key(&key, false, false).unwrap();

        let again = SessionKey::new(dir.path().join("key"));
        assert_eq!(init_session_key(&again, true, false).unwrap(), first);
    }

    #[test]
    fn test_not_running_without_published_port() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let paths = SbwPaths::with_user_dir(dir.path());
        assert!(!is_broker_running(&paths, Duration::from_millis(200)));
    }

    #[test]
    fn test_foreign_listener_is_not_a_broker() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let paths = SbwPaths::with_user_dir(dir.path());
        init_session_key(&SessionKey::new(paths.key_file()), false, false).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        publish(&paths, listener.local_addr().unwrap().port());
        let server = thread::spawn(move || {
            // Accept and hang up without answering the handshake.
            let (stream, _) = listener.accept().unwrap();
            drop(stream);
        });

        assert!(!is_broker_running(&paths, Duration::from_millis(500)));
        server.join().unwrap();
    }

    #[test]
    fn test_shutdown_clears_ports_even_without_broker() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let paths = SbwPaths::with_user_dir(dir.path());
        publish(&paths, 1);

        assert!(shutdown_broker(&paths).is_err());
        let props = PropertiesFile::load(paths.properties_file()).unwrap();
        assert_eq!(props.get(MODULE_PORT), None);
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(ExitStatus::Normal.code(), 0);
        assert_eq!(ExitStatus::BadArgument.code(), 1);
        assert_eq!(ExitStatus::BrokerRunning.code(), 2);
        assert_eq!(ExitStatus::CannotStart.code(), 3);
        assert_eq!(ExitStatus::CannotLoadKey.code(), 4);
        assert_eq!(ExitStatus::CannotShutdown.code(), 5);
    }
}
