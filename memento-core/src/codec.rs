/*!
Record encoding.

Every persisted record (one memento, a checkpoint manifest, or a delta) is a JSON
envelope carrying a format version and the SHA-256 of its normalized body, then
compressed with the configured [`CompressionAdapter`]. Decoding checks the
version and the hash before handing back typed values.
*/

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::aggregate::MementoAggregate;
use crate::backend::EncodedCheckpoint;
use crate::compression::CompressionAdapter;
use crate::delta::Delta;
use crate::memento::{ConfigValue, Memento, MementoRef};
use crate::{PersistError, Result};

/// Current record format version for compatibility tracking
pub const RECORD_FORMAT_VERSION: u8 = 1;

#[derive(Serialize, Deserialize, Debug)]
struct RecordEnvelope {
    format_version: u8,
    content_hash: String,
    body: serde_json::Value,
}

/// Checkpoint-wide information stored next to the memento records.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CheckpointManifest {
    /// Unique identifier of this checkpoint
    pub checkpoint_id: Uuid,

    /// When the checkpoint was encoded
    pub written_at: DateTime<Utc>,

    /// Application roots, in order
    pub application_ids: Vec<String>,

    /// Number of memento records that must accompany the manifest
    pub record_count: usize,
}

/// Encodes and decodes records for a backend.
#[derive(Debug, Clone)]
pub struct RecordCodec<C: CompressionAdapter> {
    compressor: C,
}

impl<C: CompressionAdapter> RecordCodec<C> {
    pub fn new(compressor: C) -> Self {
        Self { compressor }
    }

    pub fn compression_name(&self) -> &str {
        self.compressor.algorithm_name()
    }

    /// Compute SHA-256 of the provided data as lowercase hex
    pub fn compute_hash(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        format!("{:x}", hasher.finalize())
    }

    fn seal<T: Serialize>(&self, body: &T) -> Result<Vec<u8>> {
        // Hash the normalized form so the check survives a decode/encode cycle
        let body = serde_json::to_value(body)?;
        let normalized = serde_json::to_vec(&body)?;
        let envelope = RecordEnvelope {
            format_version: RECORD_FORMAT_VERSION,
            content_hash: Self::compute_hash(&normalized),
            body,
        };
        self.compressor.compress(&serde_json::to_vec(&envelope)?)
    }

    fn open<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        let decompressed = self.compressor.decompress(bytes)?;
        let envelope: RecordEnvelope = serde_json::from_slice(&decompressed)?;

        if envelope.format_version > RECORD_FORMAT_VERSION {
            return Err(PersistError::invalid_format(format!(
                "Incompatible record format version: {} (current: {})",
                envelope.format_version, RECORD_FORMAT_VERSION
            )));
        }

        let actual = Self::compute_hash(&serde_json::to_vec(&envelope.body)?);
        if actual != envelope.content_hash {
            return Err(PersistError::IntegrityCheckFailed {
                expected: envelope.content_hash,
                actual,
            });
        }

        Ok(serde_json::from_value(envelope.body)?)
    }

    /// Encode one memento
    ///
    /// # Errors
    /// * `PersistError::NotSerializable` - If a value has no JSON form, such as
    ///   a NaN or infinite float
    pub fn encode_memento(&self, memento: &Memento) -> Result<Vec<u8>> {
        check_persistable(memento)?;
        self.seal(memento).map_err(|e| match e {
            PersistError::Json(e) => {
                PersistError::not_serializable(memento.kind(), memento.id.clone(), e.to_string())
            }
            other => other,
        })
    }

    /// Decode a memento stored under `key`, rejecting records filed under the
    /// wrong kind or id.
    pub fn decode_memento(&self, key: &MementoRef, bytes: &[u8]) -> Result<Memento> {
        let memento: Memento = self.open(bytes)?;
        if memento.reference() != *key {
            return Err(PersistError::invalid_format(format!(
                "record stored as {key} contains {}",
                memento.reference()
            )));
        }
        Ok(memento)
    }

    pub fn encode_manifest(&self, manifest: &CheckpointManifest) -> Result<Vec<u8>> {
        self.seal(manifest)
    }

    pub fn decode_manifest(&self, bytes: &[u8]) -> Result<CheckpointManifest> {
        self.open(bytes)
    }

    /// Encode a full aggregate: one record per memento plus the manifest.
    /// Records are encoded in parallel.
    pub fn encode_checkpoint(&self, aggregate: &MementoAggregate) -> Result<EncodedCheckpoint> {
        let mementos: Vec<&Memento> = aggregate.iter().collect();
        let records = mementos
            .par_iter()
            .map(|memento| -> Result<(MementoRef, Vec<u8>)> {
                Ok((memento.reference(), self.encode_memento(memento)?))
            })
            .collect::<Result<BTreeMap<_, _>>>()?;

        let manifest = CheckpointManifest {
            checkpoint_id: Uuid::new_v4(),
            written_at: Utc::now(),
            application_ids: aggregate.application_ids().to_vec(),
            record_count: records.len(),
        };

        Ok(EncodedCheckpoint {
            manifest: self.encode_manifest(&manifest)?,
            records,
        })
    }

    /// Decode a checkpoint back into an aggregate.
    pub fn decode_checkpoint(&self, encoded: &EncodedCheckpoint) -> Result<MementoAggregate> {
        let manifest = self.decode_manifest(&encoded.manifest)?;
        if manifest.record_count != encoded.records.len() {
            return Err(PersistError::invalid_format(format!(
                "checkpoint {} lists {} records but {} are stored",
                manifest.checkpoint_id,
                manifest.record_count,
                encoded.records.len()
            )));
        }

        let mementos = encoded
            .records
            .par_iter()
            .map(|(key, bytes)| self.decode_memento(key, bytes))
            .collect::<Result<Vec<_>>>()?;

        let builder = manifest
            .application_ids
            .iter()
            .fold(MementoAggregate::builder().mementos(mementos), |b, id| {
                b.application(id.clone())
            });

        builder.build().map_err(|e| {
            PersistError::invalid_format(format!(
                "checkpoint {} is inconsistent: {e}",
                manifest.checkpoint_id
            ))
        })
    }

    /// Encode a delta, rejecting upserts that [`Self::encode_memento`] would.
    pub fn encode_delta(&self, delta: &Delta) -> Result<Vec<u8>> {
        for memento in delta.all_upserts() {
            check_persistable(memento)?;
        }
        self.seal(delta)
    }

    pub fn decode_delta(&self, bytes: &[u8]) -> Result<Delta> {
        self.open(bytes)
    }
}

/// JSON has no NaN or infinity; serde_json would write them as `null`.
fn check_persistable(memento: &Memento) -> Result<()> {
    match non_finite_path(memento) {
        Some(path) => Err(PersistError::not_serializable(
            memento.kind(),
            memento.id.clone(),
            format!("field '{path}' holds a non-finite float"),
        )),
        None => Ok(()),
    }
}

/// Path of the first non-finite float in a memento's config or fields.
pub(crate) fn non_finite_path(memento: &Memento) -> Option<String> {
    fn walk(value: &ConfigValue, path: String) -> Option<String> {
        match value {
            ConfigValue::Float(f) if !f.is_finite() => Some(path),
            ConfigValue::List(items) => items
                .iter()
                .enumerate()
                .find_map(|(i, item)| walk(item, format!("{path}[{i}]"))),
            ConfigValue::Map(entries) => entries
                .iter()
                .find_map(|(key, item)| walk(item, format!("{path}.{key}"))),
            _ => None,
        }
    }

    memento
        .config
        .iter()
        .find_map(|(key, value)| walk(value, format!("config.{key}")))
        .or_else(|| {
            memento
                .fields
                .iter()
                .find_map(|(key, value)| walk(value, key.clone()))
        })
}
