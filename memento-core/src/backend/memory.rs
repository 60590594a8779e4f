/*!
In-memory backend.
*/

use std::sync::{Mutex, MutexGuard};

use super::{CheckpointMarker, EncodedCheckpoint, EncodedDelta, PersistenceBackend};
use crate::{PersistError, Result};

#[derive(Debug, Default)]
struct MemoryState {
    checkpoint: Option<(CheckpointMarker, EncodedCheckpoint)>,
    deltas: Vec<EncodedDelta>,
    last_sequence: u64,
}

/// Backend keeping encoded records in process memory
///
/// State lives behind a single mutex, so a reader sees either the state before
/// a write or the state after it. Nothing survives the process; use it for tests
/// and for the development setup where only round-trip validation matters.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    state: Mutex<MemoryState>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| PersistError::persistence("in-memory backend lock poisoned"))
    }

    /// Number of deltas written since the latest checkpoint.
    pub fn delta_count(&self) -> Result<usize> {
        Ok(self.lock()?.deltas.len())
    }

    /// Whether a checkpoint has been written.
    pub fn has_checkpoint(&self) -> Result<bool> {
        Ok(self.lock()?.checkpoint.is_some())
    }
}

impl PersistenceBackend for InMemoryBackend {
    fn write_checkpoint(&self, checkpoint: EncodedCheckpoint) -> Result<CheckpointMarker> {
        let mut state = self.lock()?;
        state.last_sequence += 1;
        let marker = CheckpointMarker {
            sequence: state.last_sequence,
        };
        state.checkpoint = Some((marker, checkpoint));
        state.deltas.clear();
        Ok(marker)
    }

    fn append_delta(&self, payload: Vec<u8>) -> Result<u64> {
        let mut state = self.lock()?;
        state.last_sequence += 1;
        let sequence = state.last_sequence;
        state.deltas.push(EncodedDelta { sequence, payload });
        Ok(sequence)
    }

    fn read_latest_checkpoint(&self) -> Result<Option<(CheckpointMarker, EncodedCheckpoint)>> {
        Ok(self.lock()?.checkpoint.clone())
    }

    fn read_deltas_since(&self, marker: CheckpointMarker) -> Result<Vec<EncodedDelta>> {
        Ok(self
            .lock()?
            .deltas
            .iter()
            .filter(|delta| delta.sequence > marker.sequence)
            .cloned()
            .collect())
    }

    fn delete_all(&self) -> Result<()> {
        let mut state = self.lock()?;
        state.checkpoint = None;
        state.deltas.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "in-memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_discards_earlier_deltas() {
        let backend = InMemoryBackend::new();

        assert_eq!(backend.append_delta(b"d1".to_vec()).unwrap(), 1);
        let marker = backend.write_checkpoint(EncodedCheckpoint::default()).unwrap();
        assert_eq!(marker.sequence, 2);
        assert_eq!(backend.delta_count().unwrap(), 0);

        assert_eq!(backend.append_delta(b"d2".to_vec()).unwrap(), 3);
        let deltas = backend.read_deltas_since(marker).unwrap();
        assert_eq!(deltas.len(), 1);
        assert_eq!(deltas[0].payload, b"d2");
    }

    #[test]
    fn test_deltas_before_first_checkpoint() {
        let backend = InMemoryBackend::new();
        backend.append_delta(b"d1".to_vec()).unwrap();
        backend.append_delta(b"d2".to_vec()).unwrap();

        assert!(backend.read_latest_checkpoint().unwrap().is_none());
        let deltas = backend.read_deltas_since(CheckpointMarker::ORIGIN).unwrap();
        let sequences: Vec<_> = deltas.iter().map(|d| d.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
    }

    #[test]
    fn test_delete_all() {
        let backend = InMemoryBackend::new();
        backend.write_checkpoint(EncodedCheckpoint::default()).unwrap();
        backend.append_delta(b"d".to_vec()).unwrap();

        backend.delete_all().unwrap();
        assert!(!backend.has_checkpoint().unwrap());
        assert!(backend
            .read_deltas_since(CheckpointMarker::ORIGIN)
            .unwrap()
            .is_empty());
    }
}
