//! Persisted guiding settings.
//!
//! Settings are scalar integer and boolean values addressed by slash-separated
//! keys such as `/SimMount/DecBacklashPulse`. The store abstraction lets the
//! guiding algorithms persist values without knowing where they live; the
//! file-backed implementation keeps everything in a single JSON document.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Key-value store for persisted guiding settings.
///
/// Reads fall back to the supplied default when the key is absent. Writes are
/// synchronous and idempotent.
pub trait SettingsStore {
    fn get_int(&self, key: &str, default: i32) -> i32;
    fn set_int(&mut self, key: &str, value: i32);
    fn get_bool(&self, key: &str, default: bool) -> bool;
    fn set_bool(&mut self, key: &str, value: bool);
}

/// In-memory settings store for tests and embedding hosts.
#[derive(Debug, Clone, Default)]
pub struct MemorySettings {
    ints: HashMap<String, i32>,
    bools: HashMap<String, bool>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get_int(&self, key: &str, default: i32) -> i32 {
        self.ints.get(key).copied().unwrap_or(default)
    }

    fn set_int(&mut self, key: &str, value: i32) {
        self.ints.insert(key.to_string(), value);
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.bools.get(key).copied().unwrap_or(default)
    }

    fn set_bool(&mut self, key: &str, value: bool) {
        self.bools.insert(key.to_string(), value);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct SettingsDocument {
    #[serde(default)]
    ints: HashMap<String, i32>,
    #[serde(default)]
    bools: HashMap<String, bool>,
}

/// Settings store backed by a single JSON file.
///
/// Every write flushes the whole document to disk. A write failure is logged
/// and the in-memory value is kept, so a transient disk problem degrades to
/// session-only settings rather than an error path in the guiding loop.
#[derive(Debug)]
pub struct FileSettings {
    path: PathBuf,
    doc: SettingsDocument,
}

impl FileSettings {
    /// Open a settings file, creating an empty document if the file does not
    /// exist yet. Parent directories are created on the first flush.
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let doc = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?
        } else {
            SettingsDocument::default()
        };
        Ok(Self { path, doc })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn flush(&self) {
        let result = self
            .path
            .parent()
            .map_or(Ok(()), std::fs::create_dir_all)
            .and_then(|()| {
                let contents = serde_json::to_string_pretty(&self.doc)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                std::fs::write(&self.path, contents)
            });
        if let Err(e) = result {
            log::warn!("Failed to write settings to {}: {e}", self.path.display());
        }
    }
}

impl SettingsStore for FileSettings {
    fn get_int(&self, key: &str, default: i32) -> i32 {
        self.doc.ints.get(key).copied().unwrap_or(default)
    }

    fn set_int(&mut self, key: &str, value: i32) {
        self.doc.ints.insert(key.to_string(), value);
        self.flush();
    }

    fn get_bool(&self, key: &str, default: bool) -> bool {
        self.doc.bools.get(key).copied().unwrap_or(default)
    }

    fn set_bool(&mut self, key: &str, value: bool) {
        self.doc.bools.insert(key.to_string(), value);
        self.flush();
    }
}
