//! SBW broker and module connection layer
//!
//! One broker process per user mediates any number of module connections.
//! Modules connect over TCP, prove they belong to the same user with a
//! session key, and then exchange calls, sends, replies and exceptions
//! routed by module id. Arguments travel as self-describing binary data
//! blocks.
//!
//! - [`protocol`]: data block codec and frame layout
//! - [`ModuleClient`]: connect to a broker, call other modules, serve calls
//! - [`Broker`]: accept modules and route frames between them
//! - [`bootstrap`]: detect, start and stop the per-user broker
//!

// Import all sub modules once...
mod macros;

mod client;
mod config;
mod connection;
mod error;
mod host;
mod host_access;
mod instance;
mod instance_table;
mod properties;
mod retry;
mod session_key;

pub mod bootstrap;
pub mod broker;
pub mod protocol;

pub(crate) use macros::{log_debug, log_error, log_info, log_warn};

// Re-export main types
pub use broker::Broker;
pub use client::{CallEvent, CallHandler, IncomingCall, ModuleClient};
pub use connection::{launch_broker, Connection, ConnectionState, MessageSink};

pub use config::{
    //
    BrokerConfig,
    ConnectConfig,
    PortRange,
    SbwPaths,
    BROKER_EXECUTABLE,
    DEFAULT_BROKER_PORTS,
    DEFAULT_MODULE_PORTS,
    SBW_HOME_ENV,
    SBW_USER_ENV,
};
pub use error::{RemoteErrorKind, Result, SbwError};
pub use host::{Host, ANY_PORT, LOCAL_ADDRESS, LOCAL_NAME};
pub use host_access::{address_is_valid, AddressPattern, HostAccessTable};
pub use instance::ModuleInstance;
pub use instance_table::InstanceTable;
pub use properties::PropertiesFile;
pub use retry::{retry_blocking, RetryConfig};
pub use session_key::{SessionKey, KEY_BYTES};

pub use protocol::{DataBlockReader, DataBlockType, DataBlockWriter, Value};

/// Property names used in `run.properties` and `config.properties`.
pub mod property {
    pub use crate::properties::{ALLOW_REMOTE_MODULES, BROKER_PORT, KEY_FILE, MODULE_PORT, NO_REMOTE, SBW_HOME};
}

use std::sync::{Mutex, MutexGuard};

/// Lock a mutex, recovering the data if another thread panicked while
/// holding it.
pub(crate) fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // ---
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
