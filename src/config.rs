//! Paths, port ranges and the broker/module configuration builders.
//!
//! Nothing here is global: a [`SbwPaths`] value is resolved once (usually
//! from the environment) and passed to whatever needs it, so tests can point
//! a broker and its modules at a temporary directory.

use crate::host_access::HostAccessTable;
use crate::properties::{self, PropertiesFile};
use crate::retry::RetryConfig;
use crate::{Result, SbwError};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Overrides the per-user directory (default `~/.sbw`).
pub const SBW_USER_ENV: &str = "SBW_USER";
/// Overrides the installation root.
pub const SBW_HOME_ENV: &str = "SBW_HOME";

pub const DEFAULT_MODULE_PORTS: &str = "10100-10200";
pub const DEFAULT_BROKER_PORTS: &str = "10300-10400";

/// Name of the broker executable looked up under `<install root>/bin` and on `PATH`.
pub const BROKER_EXECUTABLE: &str = "sbw-broker";

/// Resolved on-disk locations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SbwPaths {
    // ---
    user_dir: PathBuf,
    runtime_dir: PathBuf,
    key_file: PathBuf,
    install_root: Option<PathBuf>,
}

impl SbwPaths {
    // ---

    /// Paths rooted at `user_dir`, ignoring the environment.
    pub fn with_user_dir(user_dir: impl Into<PathBuf>) -> Self {
        // ---
        let user_dir = user_dir.into();
        let runtime_dir = user_dir.join("runtime").join("127.0.0.1");
        Self {
            key_file: runtime_dir.join("key"),
            runtime_dir,
            user_dir,
            install_root: None,
        }
    }

    /// Resolve from `SBW_USER`, `SBW_HOME` and `config.properties`.
    pub fn from_env() -> Result<Self> {
        // ---
        let user_dir = match std::env::var_os(SBW_USER_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::home_dir()
                .ok_or_else(|| SbwError::Config("cannot determine home directory".into()))?
                .join(".sbw"),
        };
        let mut paths = Self::with_user_dir(user_dir);

        let config = PropertiesFile::load(paths.config_file())?;
        if let Some(key_file) = config.get(properties::KEY_FILE) {
            paths.key_file = PathBuf::from(key_file);
        }
        paths.install_root = match std::env::var_os(SBW_HOME_ENV) {
            Some(root) if !root.is_empty() => Some(PathBuf::from(root)),
            _ => config.get(properties::SBW_HOME).map(PathBuf::from),
        };
        Ok(paths)
    }

    pub fn with_key_file(mut self, key_file: impl Into<PathBuf>) -> Self {
        self.key_file = key_file.into();
        self
    }

    pub fn with_install_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.install_root = Some(root.into());
        self
    }

    pub fn user_dir(&self) -> &Path {
        &self.user_dir
    }

    pub fn runtime_dir(&self) -> &Path {
        &self.runtime_dir
    }

    pub fn key_file(&self) -> &Path {
        &self.key_file
    }

    pub fn install_root(&self) -> Option<&Path> {
        self.install_root.as_deref()
    }

    pub fn properties_file(&self) -> PathBuf {
        self.runtime_dir.join("run.properties")
    }

    pub fn config_file(&self) -> PathBuf {
        self.user_dir.join("config.properties")
    }

    /// Optional one-line file naming the broker executable.
    pub fn broker_file(&self) -> PathBuf {
        self.user_dir.join("brokerfile")
    }

    /// Broker executables to try, in order.
    ///
    /// The first line of the broker file, then `<install root>/bin`, then a
    /// bare name resolved through `PATH`.
    pub fn broker_commands(&self) -> Vec<PathBuf> {
        // ---
        let mut candidates = Vec::new();
        if let Ok(text) = std::fs::read_to_string(self.broker_file()) {
            if let Some(line) = text.lines().map(str::trim).find(|l| !l.is_empty()) {
                candidates.push(PathBuf::from(line));
            }
        }
        if let Some(root) = &self.install_root {
            candidates.push(root.join("bin").join(BROKER_EXECUTABLE));
        }
        candidates.push(PathBuf::from(BROKER_EXECUTABLE));
        candidates
    }
}

/// Inclusive `low-high` port range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub low: u16,
    pub high: u16,
}

impl PortRange {
    // ---

    /// Any free port chosen by the OS.
    pub fn ephemeral() -> Self {
        Self { low: 0, high: 0 }
    }

    pub fn ports(&self) -> impl Iterator<Item = u16> {
        self.low..=self.high
    }
}

impl FromStr for PortRange {
    type Err = SbwError;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        let s = s.trim();
        if s.is_empty() {
            return Err(SbwError::Config("empty port range".into()));
        }
        let invalid = || SbwError::Config(format!("invalid port range {s:?}"));
        let (low, high) = s.split_once('-').unwrap_or((s, s));
        let low: u16 = low.trim().parse().map_err(|_| invalid())?;
        let high: u16 = high.trim().parse().map_err(|_| invalid())?;
        if low > high {
            return Err(invalid());
        }
        Ok(Self { low, high })
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.low, self.high)
    }
}

/// How a module finds, starts and handshakes with a broker.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    // ---
    pub paths: SbwPaths,

    /// Host the broker runs on; `None` means this machine.
    pub broker_host: Option<String>,

    /// Spawn a broker process when none answers.
    pub launch_broker: bool,

    /// Polling of `run.properties` after spawning a broker (25 × 200 ms).
    pub startup_poll: RetryConfig,

    /// Handshake attempts once a port is known (120 × 1 s).
    pub handshake_retry: RetryConfig,

    /// Read timeout while waiting for the handshake reply.
    pub handshake_timeout: Duration,

    /// Pause before force-resetting a connection stuck in `Disconnecting`.
    pub disconnect_grace: Duration,
}

impl ConnectConfig {
    // ---

    pub fn new(paths: SbwPaths) -> Self {
        // ---
        Self {
            paths,
            broker_host: None,
            launch_broker: true,
            startup_poll: RetryConfig::fixed(25, Duration::from_millis(200)),
            handshake_retry: RetryConfig::fixed(120, Duration::from_secs(1)),
            handshake_timeout: Duration::from_secs(10),
            disconnect_grace: Duration::from_millis(100),
        }
    }

    /// Connect only to an already running broker, with a single attempt.
    pub fn existing_only(paths: SbwPaths) -> Self {
        // ---
        Self::new(paths)
            .with_launch_broker(false)
            .with_startup_poll(RetryConfig::none())
            .with_handshake_retry(RetryConfig::none())
    }

    pub fn with_broker_host(mut self, host: impl Into<String>) -> Self {
        self.broker_host = Some(host.into());
        self
    }

    pub fn with_launch_broker(mut self, launch: bool) -> Self {
        self.launch_broker = launch;
        self
    }

    pub fn with_startup_poll(mut self, config: RetryConfig) -> Self {
        self.startup_poll = config;
        self
    }

    pub fn with_handshake_retry(mut self, config: RetryConfig) -> Self {
        self.handshake_retry = config;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }
}

/// Broker startup settings.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    // ---
    pub paths: SbwPaths,
    pub module_ports: PortRange,

    /// Reserved for broker-to-broker links, which this broker does not open.
    /// Parsed so existing command lines keep working.
    pub broker_ports: PortRange,

    /// Admit modules from other hosts (subject to `access`).
    pub allow_remote_modules: bool,

    /// Reserved for broker-to-broker links. Broker links are never accepted,
    /// so this has no effect on admission.
    pub no_remote: bool,

    /// Reload the key on disk instead of generating a new one.
    pub reuse_key: bool,

    /// Accept/deny patterns for remote module addresses.
    pub access: HostAccessTable,

    /// Read timeout for a newly accepted socket's handshake.
    pub handshake_timeout: Duration,

    /// How long shutdown waits for modules to disconnect on their own.
    pub shutdown_grace: RetryConfig,
}

impl BrokerConfig {
    // ---

    pub fn new(paths: SbwPaths) -> Self {
        // ---
        Self {
            paths,
            module_ports: PortRange {
                low: 10100,
                high: 10200,
            },
            broker_ports: PortRange {
                low: 10300,
                high: 10400,
            },
            allow_remote_modules: false,
            no_remote: false,
            reuse_key: false,
            access: HostAccessTable::local_only(),
            handshake_timeout: Duration::from_secs(10),
            shutdown_grace: RetryConfig::fixed(20, Duration::from_millis(100)),
        }
    }

    /// Defaults plus the remote flags from `config.properties`.
    pub fn from_paths(paths: SbwPaths) -> Result<Self> {
        // ---
        let config = PropertiesFile::load(paths.config_file())?;
        let mut broker = Self::new(paths);
        if let Some(allow) = config.get_bool(properties::ALLOW_REMOTE_MODULES) {
            broker.allow_remote_modules = allow;
        }
        if let Some(no_remote) = config.get_bool(properties::NO_REMOTE) {
            broker.no_remote = no_remote;
        }
        Ok(broker)
    }

    pub fn with_module_ports(mut self, ports: PortRange) -> Self {
        self.module_ports = ports;
        self
    }

    pub fn with_broker_ports(mut self, ports: PortRange) -> Self {
        self.broker_ports = ports;
        self
    }

    pub fn with_allow_remote_modules(mut self, allow: bool) -> Self {
        self.allow_remote_modules = allow;
        self
    }

    pub fn with_no_remote(mut self, no_remote: bool) -> Self {
        self.no_remote = no_remote;
        self
    }

    pub fn with_reuse_key(mut self, reuse: bool) -> Self {
        self.reuse_key = reuse;
        self
    }

    pub fn with_access(mut self, access: HostAccessTable) -> Self {
        self.access = access;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: RetryConfig) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    #[test]
    fn test_layout_under_user_dir() {
        // ---
        let paths = SbwPaths::with_user_dir("/tmp/u");
        assert_eq!(paths.runtime_dir(), Path::new("/tmp/u/runtime/127.0.0.1"));
        assert_eq!(paths.key_file(), Path::new("/tmp/u/runtime/127.0.0.1/key"));
        assert_eq!(
            paths.properties_file(),
            PathBuf::from("/tmp/u/runtime/127.0.0.1/run.properties")
        );
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/u/config.properties"));
    }

    #[test]
    fn test_port_range_parse() {
        // ---
        let range: PortRange = DEFAULT_MODULE_PORTS.parse().unwrap();
        assert_eq!(range, PortRange { low: 10100, high: 10200 });
        assert_eq!(range.ports().count(), 101);
        assert_eq!("0".parse::<PortRange>().unwrap(), PortRange::ephemeral());
        assert!("".parse::<PortRange>().is_err());
        assert!("10200-10100".parse::<PortRange>().is_err());
        assert!("a-b".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_broker_commands_order() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let paths = SbwPaths::with_user_dir(dir.path()).with_install_root("/opt/sbw");
        std::fs::write(paths.broker_file(), "\n/usr/local/bin/my-broker\n").unwrap();

        let commands = paths.broker_commands();
        assert_eq!(commands[0], PathBuf::from("/usr/local/bin/my-broker"));
        assert_eq!(commands[1], PathBuf::from("/opt/sbw/bin").join(BROKER_EXECUTABLE));
        assert_eq!(commands[2], PathBuf::from(BROKER_EXECUTABLE));
    }

    #[test]
    fn test_remote_flags_from_config_file() {
        // ---
        let dir = tempfile::tempdir().unwrap();
        let paths = SbwPaths::with_user_dir(dir.path());
        std::fs::write(
            paths.config_file(),
            "sbw.broker.allow-remote-modules=true\nsbw.broker.no-remote=true\n",
        )
        .unwrap();

        let config = BrokerConfig::from_paths(paths).unwrap();
        assert!(config.allow_remote_modules);
        assert!(config.no_remote);
    }

    #[test]
    fn test_existing_only_is_single_attempt() {
        // ---
        let config = ConnectConfig::existing_only(SbwPaths::with_user_dir("/tmp/u"));
        assert!(!config.launch_broker);
        assert_eq!(config.startup_poll.total_attempts(), 1);
        assert_eq!(config.handshake_retry.total_attempts(), 1);
    }
}
