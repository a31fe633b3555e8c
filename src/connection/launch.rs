//! Locating and spawning a broker process.

use crate::config::{SbwPaths, SBW_USER_ENV};
use crate::{Result, SbwError};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;

/// Spawn the broker named by the broker file, the install root or `PATH`.
pub fn launch_broker(paths: &SbwPaths) -> Result<()> {
    spawn_first(&paths.broker_commands(), paths.user_dir())
}

/// Spawn the first candidate that starts.
///
/// The child is detached; its readiness is observed through `run.properties`.
fn spawn_first(candidates: &[PathBuf], user_dir: &Path) -> Result<()> {
    // ---
    let mut failures = Vec::new();
    for candidate in candidates {
        let spawned = Command::new(candidate)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .env(SBW_USER_ENV, user_dir)
            .spawn();
        match spawned {
            Ok(child) => {
                crate::log_info!("started broker {} (pid {})", candidate.display(), child.id());
                reap(child);
                return Ok(());
            }
            Err(err) => {
                crate::log_debug!("cannot start {}: {err}", candidate.display());
                failures.push(format!("{}: {err}", candidate.display()));
            }
        }
    }

    Err(SbwError::BrokerStart {
        message: "unable to start broker".into(),
        detail: failures.join("; "),
    })
}

/// Wait for the child in the background so its exit does not leave a zombie.
fn reap(mut child: Child) {
    // ---
    let pid = child.id();
    let spawned = thread::Builder::new()
        .name("sbw-broker-reaper".into())
        .spawn(move || match child.wait() {
            Ok(status) => crate::log_debug!("broker pid {pid} exited: {status}"),
            Err(err) => crate::log_debug!("cannot wait for broker pid {pid}: {err}"),
        });
    if let Err(err) = spawned {
        crate::log_warn!("cannot start reaper for broker pid {pid}: {err}");
    }
}
