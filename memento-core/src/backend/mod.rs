/*!
Persistence backends.

This module defines the storage port the persister writes through and its two
adapters: [`InMemoryBackend`] and the one-file-per-record [`FileBackend`]. A
backend only moves bytes; encoding lives in [`crate::codec`].

Every write is tagged with a sequence number that increases monotonically across
checkpoints and deltas. A checkpoint replaces everything written before it, and
a load reads the latest checkpoint plus the deltas whose sequence is greater
than the checkpoint's.
*/

pub mod file;
pub mod memory;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::memento::MementoRef;
use crate::Result;

pub use file::FileBackend;
pub use memory::InMemoryBackend;

/// Position of a checkpoint in the write sequence.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CheckpointMarker {
    pub sequence: u64,
}

impl CheckpointMarker {
    /// Marker of "no checkpoint yet"; deltas written before the first
    /// checkpoint apply to an empty aggregate.
    pub const ORIGIN: CheckpointMarker = CheckpointMarker { sequence: 0 };
}

/// An encoded checkpoint: the manifest record and one record per memento.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct EncodedCheckpoint {
    pub manifest: Vec<u8>,
    pub records: BTreeMap<MementoRef, Vec<u8>>,
}

/// An encoded delta with the sequence number the backend assigned to it.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedDelta {
    pub sequence: u64,
    pub payload: Vec<u8>,
}

/// Storage port for encoded checkpoints and deltas
///
/// Implementations must apply writes in call order and must never expose a
/// partially written checkpoint to a reader.
pub trait PersistenceBackend: Send + Sync {
    /// Replace all durable state with the given checkpoint
    ///
    /// # Returns
    /// The marker of the new checkpoint. Deltas written before it are discarded.
    fn write_checkpoint(&self, checkpoint: EncodedCheckpoint) -> Result<CheckpointMarker>;

    /// Append one delta record
    ///
    /// # Returns
    /// The sequence number assigned to the delta
    fn append_delta(&self, payload: Vec<u8>) -> Result<u64>;

    /// Read the most recent complete checkpoint, if any
    fn read_latest_checkpoint(&self) -> Result<Option<(CheckpointMarker, EncodedCheckpoint)>>;

    /// Read the deltas written after `marker`, in sequence order
    fn read_deltas_since(&self, marker: CheckpointMarker) -> Result<Vec<EncodedDelta>>;

    /// Delete every checkpoint and delta
    fn delete_all(&self) -> Result<()>;

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

impl<B: PersistenceBackend + ?Sized> PersistenceBackend for Arc<B> {
    fn write_checkpoint(&self, checkpoint: EncodedCheckpoint) -> Result<CheckpointMarker> {
        (**self).write_checkpoint(checkpoint)
    }

    fn append_delta(&self, payload: Vec<u8>) -> Result<u64> {
        (**self).append_delta(payload)
    }

    fn read_latest_checkpoint(&self) -> Result<Option<(CheckpointMarker, EncodedCheckpoint)>> {
        (**self).read_latest_checkpoint()
    }

    fn read_deltas_since(&self, marker: CheckpointMarker) -> Result<Vec<EncodedDelta>> {
        (**self).read_deltas_since(marker)
    }

    fn delete_all(&self) -> Result<()> {
        (**self).delete_all()
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}
