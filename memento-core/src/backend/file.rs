/*!
Local filesystem backend.

Layout under the base directory:

```text
checkpoint-<seq>/manifest
checkpoint-<seq>/<kinds>/<escaped-id>
deltas/delta-<seq>
```

A checkpoint is written into a private staging directory and published with a
single directory rename, so readers never see a partial checkpoint. Deltas are
written to a `.tmp` file and renamed into place.
*/

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use tracing::{debug, warn};
use uuid::Uuid;

use super::{CheckpointMarker, EncodedCheckpoint, EncodedDelta, PersistenceBackend};
use crate::memento::{MementoKind, MementoRef};
use crate::{PersistError, Result};

const CHECKPOINT_PREFIX: &str = "checkpoint-";
const DELTA_PREFIX: &str = "delta-";
const STAGING_PREFIX: &str = ".staging-";
const DELTAS_DIR: &str = "deltas";
const MANIFEST_FILE: &str = "manifest";
const TMP_SUFFIX: &str = ".tmp";

/// Filesystem backend storing one file per record
///
/// # Example
/// ```rust
/// use memento_core::backend::{FileBackend, PersistenceBackend};
///
/// let dir = tempfile::tempdir()?;
/// let backend = FileBackend::open(dir.path())?;
/// let sequence = backend.append_delta(b"encoded delta".to_vec())?;
/// assert_eq!(sequence, 1);
/// # Ok::<(), Box<dyn std::error::Error>>(())
/// ```
#[derive(Debug)]
pub struct FileBackend {
    base_dir: PathBuf,
    /// Last sequence number handed out; the lock also serializes writers.
    last_sequence: Mutex<u64>,
}

impl FileBackend {
    /// Open (or create) a store rooted at `base_dir`
    ///
    /// Leftover staging directories and temporary delta files from an
    /// interrupted write are removed, and the sequence counter resumes after
    /// the highest checkpoint or delta found on disk.
    pub fn open<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        let deltas_dir = base_dir.join(DELTAS_DIR);
        fs::create_dir_all(&deltas_dir).map_err(|e| {
            PersistError::persistence(format!(
                "Failed to create directory {}: {}",
                deltas_dir.display(),
                e
            ))
        })?;

        let mut last_sequence = 0;
        for name in list_names(&base_dir)? {
            if name.starts_with(STAGING_PREFIX) {
                let path = base_dir.join(&name);
                debug!(path = %path.display(), "Removing abandoned checkpoint staging directory");
                remove_path(&path)?;
            } else if let Some(sequence) = parse_sequence(&name, CHECKPOINT_PREFIX) {
                last_sequence = last_sequence.max(sequence);
            }
        }
        for name in list_names(&deltas_dir)? {
            if name.ends_with(TMP_SUFFIX) {
                remove_path(&deltas_dir.join(&name))?;
            } else if let Some(sequence) = parse_sequence(&name, DELTA_PREFIX) {
                last_sequence = last_sequence.max(sequence);
            }
        }

        debug!(base_dir = %base_dir.display(), last_sequence, "Opened file backend");
        Ok(Self {
            base_dir,
            last_sequence: Mutex::new(last_sequence),
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn lock(&self) -> Result<MutexGuard<'_, u64>> {
        self.last_sequence
            .lock()
            .map_err(|_| PersistError::persistence("file backend lock poisoned"))
    }

    fn deltas_dir(&self) -> PathBuf {
        self.base_dir.join(DELTAS_DIR)
    }

    fn checkpoint_dir(&self, sequence: u64) -> PathBuf {
        self.base_dir
            .join(format!("{CHECKPOINT_PREFIX}{sequence:020}"))
    }

    fn checkpoint_sequences(&self) -> Result<Vec<u64>> {
        let mut sequences: Vec<u64> = list_names(&self.base_dir)?
            .iter()
            .filter_map(|name| parse_sequence(name, CHECKPOINT_PREFIX))
            .collect();
        sequences.sort_unstable();
        Ok(sequences)
    }

    fn delta_sequences(&self) -> Result<Vec<u64>> {
        let mut sequences: Vec<u64> = list_names(&self.deltas_dir())?
            .iter()
            .filter_map(|name| parse_sequence(name, DELTA_PREFIX))
            .collect();
        sequences.sort_unstable();
        Ok(sequences)
    }

    fn stage_checkpoint(&self, staging: &Path, checkpoint: &EncodedCheckpoint) -> Result<()> {
        create_dir(staging)?;
        write_file(&staging.join(MANIFEST_FILE), &checkpoint.manifest)?;
        for (key, bytes) in &checkpoint.records {
            let kind_dir = staging.join(key.kind.plural());
            if !kind_dir.exists() {
                create_dir(&kind_dir)?;
            }
            write_file(&kind_dir.join(escape_id(&key.id)), bytes)?;
        }
        Ok(())
    }

    /// Drop checkpoints and deltas superseded by the checkpoint at `sequence`.
    /// The new checkpoint is already durable, so failures here only leave
    /// garbage that the next checkpoint retries.
    fn prune_before(&self, sequence: u64) {
        let stale_checkpoints = self
            .checkpoint_sequences()
            .map(|all| all.into_iter().filter(|s| *s < sequence).collect::<Vec<_>>());
        let stale_deltas = self
            .delta_sequences()
            .map(|all| all.into_iter().filter(|s| *s < sequence).collect::<Vec<_>>());

        let mut paths = Vec::new();
        match stale_checkpoints {
            Ok(found) => paths.extend(found.into_iter().map(|s| self.checkpoint_dir(s))),
            Err(e) => warn!(error = %e, "Failed to list old checkpoints"),
        }
        match stale_deltas {
            Ok(found) => paths.extend(found.into_iter().map(|s| self.delta_path(s))),
            Err(e) => warn!(error = %e, "Failed to list superseded deltas"),
        }

        for path in paths {
            if let Err(e) = remove_path(&path) {
                warn!(path = %path.display(), error = %e, "Failed to prune superseded record");
            }
        }
    }

    fn delta_path(&self, sequence: u64) -> PathBuf {
        self.deltas_dir()
            .join(format!("{DELTA_PREFIX}{sequence:020}"))
    }

    fn read_checkpoint_dir(&self, dir: &Path) -> Result<EncodedCheckpoint> {
        let manifest = read_file(&dir.join(MANIFEST_FILE))?;
        let mut checkpoint = EncodedCheckpoint {
            manifest,
            ..Default::default()
        };

        for kind_name in list_names(dir)? {
            if kind_name == MANIFEST_FILE {
                continue;
            }
            let kind = MementoKind::from_plural(&kind_name).ok_or_else(|| {
                PersistError::invalid_format(format!(
                    "Unexpected entry {} in checkpoint {}",
                    kind_name,
                    dir.display()
                ))
            })?;
            let kind_dir = dir.join(&kind_name);
            for file_name in list_names(&kind_dir)? {
                let id = unescape_id(&file_name)?;
                let bytes = read_file(&kind_dir.join(&file_name))?;
                checkpoint.records.insert(MementoRef::new(kind, id), bytes);
            }
        }

        Ok(checkpoint)
    }
}

impl PersistenceBackend for FileBackend {
    fn write_checkpoint(&self, checkpoint: EncodedCheckpoint) -> Result<CheckpointMarker> {
        let mut last_sequence = self.lock()?;
        let sequence = *last_sequence + 1;

        let staging = self
            .base_dir
            .join(format!("{STAGING_PREFIX}{}", Uuid::new_v4()));
        if let Err(e) = self.stage_checkpoint(&staging, &checkpoint) {
            let _ = fs::remove_dir_all(&staging);
            return Err(e);
        }

        let target = self.checkpoint_dir(sequence);
        if let Err(e) = fs::rename(&staging, &target) {
            let _ = fs::remove_dir_all(&staging);
            return Err(PersistError::persistence(format!(
                "Failed to publish checkpoint {}: {}",
                target.display(),
                e
            )));
        }
        *last_sequence = sequence;

        debug!(
            sequence,
            records = checkpoint.records.len(),
            path = %target.display(),
            "Published checkpoint"
        );
        self.prune_before(sequence);

        Ok(CheckpointMarker { sequence })
    }

    fn append_delta(&self, payload: Vec<u8>) -> Result<u64> {
        let mut last_sequence = self.lock()?;
        let sequence = *last_sequence + 1;

        let target = self.delta_path(sequence);
        let tmp = target.with_file_name(format!("{DELTA_PREFIX}{sequence:020}{TMP_SUFFIX}"));
        write_file(&tmp, &payload)?;
        fs::rename(&tmp, &target).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            PersistError::persistence(format!(
                "Failed to publish delta {}: {}",
                target.display(),
                e
            ))
        })?;

        *last_sequence = sequence;
        Ok(sequence)
    }

    fn read_latest_checkpoint(&self) -> Result<Option<(CheckpointMarker, EncodedCheckpoint)>> {
        let Some(sequence) = self.checkpoint_sequences()?.last().copied() else {
            return Ok(None);
        };
        let checkpoint = self.read_checkpoint_dir(&self.checkpoint_dir(sequence))?;
        Ok(Some((CheckpointMarker { sequence }, checkpoint)))
    }

    fn read_deltas_since(&self, marker: CheckpointMarker) -> Result<Vec<EncodedDelta>> {
        self.delta_sequences()?
            .into_iter()
            .filter(|sequence| *sequence > marker.sequence)
            .map(|sequence| {
                Ok(EncodedDelta {
                    sequence,
                    payload: read_file(&self.delta_path(sequence))?,
                })
            })
            .collect()
    }

    fn delete_all(&self) -> Result<()> {
        let _guard = self.lock()?;
        for name in list_names(&self.base_dir)? {
            if name.starts_with(CHECKPOINT_PREFIX) || name.starts_with(STAGING_PREFIX) {
                remove_path(&self.base_dir.join(name))?;
            }
        }
        for name in list_names(&self.deltas_dir())? {
            remove_path(&self.deltas_dir().join(name))?;
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}

/// Escape an id into a file name: bytes outside `[A-Za-z0-9_-]` become `%XX`.
pub fn escape_id(id: &str) -> String {
    let mut escaped = String::with_capacity(id.len());
    for byte in id.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'_' || byte == b'-' {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("%{byte:02X}"));
        }
    }
    escaped
}

/// Reverse of [`escape_id`].
pub fn unescape_id(name: &str) -> Result<String> {
    let invalid = || PersistError::invalid_format(format!("Invalid escaped id in file name: {name}"));

    let bytes = name.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3).ok_or_else(invalid)?;
            decoded.push(u8::from_str_radix(hex, 16).map_err(|_| invalid())?);
            i += 3;
        } else {
            decoded.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(decoded).map_err(|_| invalid())
}

fn parse_sequence(name: &str, prefix: &str) -> Option<u64> {
    name.strip_prefix(prefix)?.parse().ok()
}

fn list_names(dir: &Path) -> Result<Vec<String>> {
    let entries = fs::read_dir(dir).map_err(|e| {
        PersistError::persistence(format!("Failed to list {}: {}", dir.display(), e))
    })?;

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| {
            PersistError::persistence(format!("Failed to list {}: {}", dir.display(), e))
        })?;
        if let Some(name) = entry.file_name().to_str() {
            names.push(name.to_string());
        }
    }
    Ok(names)
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir(path).map_err(|e| {
        PersistError::persistence(format!(
            "Failed to create directory {}: {}",
            path.display(),
            e
        ))
    })
}

fn write_file(path: &Path, data: &[u8]) -> Result<()> {
    let write = || -> std::io::Result<()> {
        let mut file = File::create(path)?;
        file.write_all(data)?;
        file.sync_all()
    };
    write().map_err(|e| {
        PersistError::persistence(format!("Failed to write record to {}: {}", path.display(), e))
    })
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| {
        PersistError::persistence(format!("Failed to read record from {}: {}", path.display(), e))
    })
}

fn remove_path(path: &Path) -> Result<()> {
    let removed = if path.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match removed {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PersistError::persistence(format!(
            "Failed to delete {}: {}",
            path.display(),
            e
        ))),
    }
}
