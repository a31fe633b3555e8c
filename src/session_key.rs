//! Shared secret proving a connection belongs to this broker session.
//!
//! The key is 256 random bits rendered as uppercase hex and stored in a
//! private file under the runtime directory. It is loaded once and cached;
//! later calls to [`SessionKey::key`] never touch the disk again.

use crate::{Result, SbwError};
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

/// Key size in bytes.
pub const KEY_BYTES: usize = 32;

#[derive(Debug)]
pub struct SessionKey {
    // ---
    path: PathBuf,
    cached: Mutex<Option<String>>,
}

impl SessionKey {
    // ---

    /// Key stored at `path`; nothing is read until first use.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        // ---
        Self {
            path: path.into(),
            cached: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Produce a fresh key, cache it and return it. Nothing is written to disk.
    pub fn generate(&self) -> String {
        // ---
        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let mut rng = StdRng::seed_from_u64(seed ^ u64::from(std::process::id()));
        let mut raw = [0u8; KEY_BYTES];
        rng.fill_bytes(&mut raw);

        let key = hex::encode_upper(raw);
        *crate::lock_ignore_poison(&self.cached) = Some(key.clone());
        key
    }

    /// Write the cached key, creating the runtime directory if needed.
    pub fn save(&self) -> Result<()> {
        // ---
        let key = crate::lock_ignore_poison(&self.cached)
            .clone()
            .ok_or_else(|| SbwError::SessionKey("no key to save".into()))?;
        write_private(&self.path, &key)?;
        crate::log_debug!("session key saved to {}", self.path.display());
        Ok(())
    }

    /// Re-read the first line of the key file into the cache.
    ///
    /// Returns `None` when the file is missing or empty.
    pub fn load(&self) -> Result<Option<String>> {
        // ---
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(SbwError::SessionKey(format!(
                    "cannot read {}: {err}",
                    self.path.display()
                )))
            }
        };

        let key = text.lines().next().unwrap_or("").trim().to_owned();
        let mut cached = crate::lock_ignore_poison(&self.cached);
        if key.is_empty() {
            *cached = None;
            return Ok(None);
        }
        *cached = Some(key.clone());
        Ok(Some(key))
    }

    /// Overwrite the key file with an empty string and forget the cached key.
    pub fn remove(&self) -> Result<()> {
        // ---
        write_private(&self.path, "")?;
        *crate::lock_ignore_poison(&self.cached) = None;
        Ok(())
    }

    /// Cached key, loading it from disk on first use.
    pub fn key(&self) -> Result<String> {
        // ---
        if let Some(key) = crate::lock_ignore_poison(&self.cached).clone() {
            return Ok(key);
        }
        self.load()?.ok_or_else(|| {
            SbwError::SessionKey(format!("no session key in {}", self.path.display()))
        })
    }
}

fn write_private(path: &Path, contents: &str) -> Result<()> {
    // ---
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)?;
    }
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;

    // `mode` only applies on creation; narrow a file that already existed.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        file.set_permissions(fs::Permissions::from_mode(0o600))?;
    }
    file.write_all(contents.as_bytes())?;
    Ok(())
}
