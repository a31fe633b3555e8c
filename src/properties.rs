//! `key=value` property files.
//!
//! `run.properties` publishes the ports of a running broker; an empty or
//! missing value means no broker. `config.properties` holds user settings
//! such as the installation root.

use crate::Result;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Port modules connect to.
pub const MODULE_PORT: &str = "sbw.module.port";
/// Port other brokers connect to.
pub const BROKER_PORT: &str = "sbw.broker.port";
/// Installation root, in `config.properties`.
pub const SBW_HOME: &str = "sbw.home";
/// Session key file override, in `config.properties`.
pub const KEY_FILE: &str = "sbw.key.file";
pub const ALLOW_REMOTE_MODULES: &str = "sbw.broker.allow-remote-modules";
pub const NO_REMOTE: &str = "sbw.broker.no-remote";

#[derive(Debug, Clone)]
pub struct PropertiesFile {
    // ---
    path: PathBuf,
    values: BTreeMap<String, String>,
}

impl PropertiesFile {
    // ---

    /// Empty store bound to `path`; nothing is read.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        // ---
        Self {
            path: path.into(),
            values: BTreeMap::new(),
        }
    }

    /// Read `path`. A missing file yields an empty store.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        // ---
        let mut props = Self::new(path);
        props.reload()?;
        Ok(props)
    }

    pub fn reload(&mut self) -> Result<()> {
        // ---
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };
        self.values = parse(&text);
        Ok(())
    }

    /// Write every property, creating the parent directory if needed.
    pub fn save(&self) -> Result<()> {
        // ---
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }
        let text: String = self
            .values
            .iter()
            .map(|(k, v)| format!("{k}={v}\n"))
            .collect();
        fs::write(&self.path, text)?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Value of `key`; empty values read as absent.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key)?.trim().parse().ok()
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        // ---
        match self.get(key)?.trim().to_ascii_lowercase().as_str() {
            "true" | "yes" | "1" => Some(true),
            "false" | "no" | "0" => Some(false),
            _ => None,
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.values.remove(key)
    }

    /// Modification time of the backing file, if it exists.
    pub fn modified(&self) -> Option<SystemTime> {
        fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

fn parse(text: &str) -> BTreeMap<String, String> {
    // ---
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(k, v)| (k.trim().to_owned(), v.trim().to_owned()))
        .collect()
}
