//! Configuration for persister construction
//!
//! This module provides the settings used by
//! [`create_persister_from_config`](crate::create_persister_from_config):
//! which backend to write to, how writes are executed, record compression, and
//! whether every write is round-trip validated.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::compression::CompressionKind;
use crate::write_queue::WriteMode;
use crate::{PersistError, Result};

/// URI scheme selecting the in-memory backend.
pub const MEMORY_URI: &str = "memory://";

/// Enumeration of supported persistence backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process memory; nothing survives a restart
    InMemory,
    /// One file per record under a base directory
    File,
}

/// Persister settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersisterConfig {
    /// The backend to write to
    pub backend: BackendKind,
    /// Base directory (required for the file backend)
    #[serde(default)]
    pub base_dir: Option<PathBuf>,
    /// Inline or background writes
    #[serde(default)]
    pub write_mode: WriteMode,
    /// Record compression
    #[serde(default)]
    pub compression: CompressionKind,
    /// Round-trip every write through a scratch store before accepting it
    #[serde(default)]
    pub check_persistable: bool,
}

impl PersisterConfig {
    /// In-memory backend without compression, with round-trip validation
    ///
    /// This is the development setup: nothing is kept, but every write is
    /// checked to read back intact.
    pub fn in_memory() -> Self {
        PersisterConfig {
            backend: BackendKind::InMemory,
            base_dir: None,
            write_mode: WriteMode::default(),
            compression: CompressionKind::None,
            check_persistable: true,
        }
    }

    /// File backend rooted at `base_dir` with gzip compression
    pub fn file<P: AsRef<Path>>(base_dir: P) -> Self {
        PersisterConfig {
            backend: BackendKind::File,
            base_dir: Some(base_dir.as_ref().to_path_buf()),
            write_mode: WriteMode::default(),
            compression: CompressionKind::Gzip,
            check_persistable: false,
        }
    }

    pub fn with_write_mode(mut self, write_mode: WriteMode) -> Self {
        self.write_mode = write_mode;
        self
    }

    pub fn with_compression(mut self, compression: CompressionKind) -> Self {
        self.compression = compression;
        self
    }

    pub fn with_check_persistable(mut self, check: bool) -> Self {
        self.check_persistable = check;
        self
    }

    /// Parse a store URI
    ///
    /// Supports formats:
    /// - `memory://` for the in-memory backend
    /// - `file:///abs/path`, `/abs/path` or `./relative/path` for the file backend
    pub fn from_uri(uri: &str) -> Result<PersisterConfig> {
        if uri == MEMORY_URI {
            return Ok(PersisterConfig::in_memory());
        }
        if let Some(rest) = uri.strip_prefix("memory://") {
            return Err(PersistError::invalid_state(format!(
                "memory URI takes no path, got '{rest}'"
            )));
        }

        let path = uri.strip_prefix("file://").unwrap_or(uri);
        if path.is_empty() {
            return Err(PersistError::invalid_state(
                "Invalid store URI: missing directory",
            ));
        }
        Ok(PersisterConfig::file(path))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        match self.backend {
            BackendKind::File => {
                self.require_base_dir()?;
            }
            BackendKind::InMemory => {
                if self.base_dir.is_some() {
                    return Err(PersistError::invalid_state(
                        "in-memory backend does not take a base directory",
                    ));
                }
            }
        }
        Ok(())
    }

    /// Base directory of a file backend.
    pub fn require_base_dir(&self) -> Result<&Path> {
        match self.base_dir.as_deref() {
            Some(dir) if !dir.as_os_str().is_empty() => Ok(dir),
            _ => Err(PersistError::invalid_state(
                "file backend requires a base directory",
            )),
        }
    }
}

impl Default for PersisterConfig {
    fn default() -> Self {
        Self::in_memory()
    }
}
