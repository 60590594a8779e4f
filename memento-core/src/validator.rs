/*!
Round-trip validation of persisted state.

[`RoundTripValidator`] wraps a [`Persister`] and, after every write, pushes the
whole current aggregate through a private scratch store and reads it back. A
memento that does not come back identical is reported as
[`PersistError::NotSerializable`], naming the first field that differs. It is
meant for development setups where catching a non-persistable value early
matters more than write throughput.
*/

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use tracing::{debug, warn};

use crate::aggregate::MementoAggregate;
use crate::backend::FileBackend;
use crate::codec::{non_finite_path, RecordCodec};
use crate::compression::NoCompression;
use crate::delta::Delta;
use crate::lookup::{LookupContext, PlaceholderLookupContext};
#[cfg(feature = "metrics")]
use crate::observability::MementoMetrics;
use crate::memento::{ConfigValue, Memento};
use crate::persister::{MementoPersister, Persister};
use crate::write_queue::{WriteMode, WriteStats};
use crate::{PersistError, Result};

const SCRATCH_PREFIX: &str = "memento-verify-";

/// Check that `aggregate` survives a write to disk and a reload
///
/// The cycle runs a synchronous persister over a [`FileBackend`] in a fresh
/// temporary directory, which is removed when the cycle ends whatever the
/// outcome.
///
/// # Errors
/// * `PersistError::NotSerializable` - If a memento is lost or altered
/// * `PersistError::PersistenceFailure` - If the scratch store cannot be used
pub fn verify_round_trip(aggregate: &MementoAggregate) -> Result<()> {
    verify_round_trip_in(&std::env::temp_dir(), aggregate)
}

/// [`verify_round_trip`] with the scratch directory created under `parent`.
pub fn verify_round_trip_in(parent: &Path, aggregate: &MementoAggregate) -> Result<()> {
    let scratch = tempfile::Builder::new()
        .prefix(SCRATCH_PREFIX)
        .tempdir_in(parent)
        .map_err(|e| PersistError::persistence(format!("Failed to create scratch directory: {e}")))?;
    let scratch_path = scratch.path().to_path_buf();

    let result = write_and_reload(&scratch_path, aggregate);

    if let Err(e) = scratch.close() {
        warn!(path = %scratch_path.display(), error = %e, "Failed to remove scratch directory");
    }

    #[cfg(feature = "metrics")]
    MementoMetrics::global().record_round_trip(result.is_ok());
    debug!(mementos = aggregate.len(), ok = result.is_ok(), "Round-trip check finished");
    result
}

fn write_and_reload(dir: &Path, aggregate: &MementoAggregate) -> Result<()> {
    let persister = MementoPersister::new(
        FileBackend::open(dir)?,
        NoCompression,
        WriteMode::Synchronous,
    )?;
    persister.checkpoint(aggregate)?;
    match persister.load_memento(PlaceholderLookupContext::shared()) {
        Ok(reloaded) => compare(aggregate, &reloaded),
        Err(e) => Err(diagnose(aggregate, e)),
    }
}

/// Name the memento responsible for a failed reload.
fn diagnose(aggregate: &MementoAggregate, error: PersistError) -> PersistError {
    let codec = RecordCodec::new(NoCompression);
    for memento in aggregate.iter() {
        if let Some(path) = non_finite_path(memento) {
            return PersistError::not_serializable(
                memento.kind(),
                memento.id.clone(),
                format!("field '{path}' holds a non-finite float"),
            );
        }
        let decoded = codec
            .encode_memento(memento)
            .and_then(|bytes| codec.decode_memento(&memento.reference(), &bytes));
        if let Err(e) = decoded {
            return PersistError::not_serializable(memento.kind(), memento.id.clone(), e.to_string());
        }
    }
    error
}

fn compare(original: &MementoAggregate, reloaded: &MementoAggregate) -> Result<()> {
    for memento in original.iter() {
        let reason = match reloaded.get(memento.kind(), &memento.id) {
            None => Some("missing after reload".to_string()),
            Some(copy) => first_difference(memento, copy),
        };
        if let Some(reason) = reason {
            return Err(PersistError::not_serializable(
                memento.kind(),
                memento.id.clone(),
                reason,
            ));
        }
    }

    if original.application_ids() != reloaded.application_ids() {
        return Err(PersistError::invalid_state(format!(
            "application roots changed on reload: {:?} -> {:?}",
            original.application_ids(),
            reloaded.application_ids()
        )));
    }
    Ok(())
}

/// Describe the first field of `copy` that differs from `original`.
fn first_difference(original: &Memento, copy: &Memento) -> Option<String> {
    if original == copy {
        return None;
    }
    if original.type_name != copy.type_name {
        return Some(format!(
            "type changed from '{}' to '{}'",
            original.type_name, copy.type_name
        ));
    }
    if original.display_name != copy.display_name {
        return Some("field 'display_name' changed".to_string());
    }
    if original.tags != copy.tags {
        return Some("field 'tags' changed".to_string());
    }
    if let Some(key) = differing_key(&original.config, &copy.config) {
        return Some(format!("field 'config.{key}' changed"));
    }
    if let Some(key) = differing_key(&original.fields, &copy.fields) {
        return Some(format!("field '{key}' changed"));
    }
    Some("relations changed".to_string())
}

fn differing_key<'a>(
    original: &'a BTreeMap<String, ConfigValue>,
    copy: &BTreeMap<String, ConfigValue>,
) -> Option<&'a str> {
    original
        .iter()
        .find(|(key, value)| copy.get(*key) != Some(*value))
        .map(|(key, _)| key.as_str())
        .or_else(|| {
            (original.len() != copy.len()).then_some("<extra entries>")
        })
}

/// Persister wrapper that round-trip checks every write
///
/// Writes are delegated first; the validator then updates its own
/// materialized copy of the current aggregate and verifies it with
/// [`verify_round_trip`]. Reads and waits are delegated unchanged.
pub struct RoundTripValidator<P: Persister> {
    inner: P,
    current: Mutex<MementoAggregate>,
}

impl<P: Persister> RoundTripValidator<P> {
    /// Wrap `inner`, starting from an empty aggregate.
    pub fn new(inner: P) -> Self {
        Self {
            inner,
            current: Mutex::new(MementoAggregate::empty()),
        }
    }

    /// Wrap `inner`, starting from what it has already stored.
    pub fn resume(inner: P) -> Result<Self> {
        let current = inner.load_memento(PlaceholderLookupContext::shared())?;
        Ok(Self {
            inner,
            current: Mutex::new(current),
        })
    }

    pub fn inner(&self) -> &P {
        &self.inner
    }

    fn lock(&self) -> Result<MutexGuard<'_, MementoAggregate>> {
        self.current
            .lock()
            .map_err(|_| PersistError::invalid_state("validator lock poisoned"))
    }
}

impl<P: Persister> Persister for RoundTripValidator<P> {
    fn checkpoint(&self, aggregate: &MementoAggregate) -> Result<()> {
        self.inner.checkpoint(aggregate)?;
        let mut current = self.lock()?;
        *current = aggregate.clone();
        verify_round_trip(&current)
    }

    fn delta(&self, delta: &Delta) -> Result<()> {
        self.inner.delta(delta)?;
        if delta.is_empty() {
            return Ok(());
        }
        let mut current = self.lock()?;
        *current = current.apply(delta);
        // Mirror the load path, which drops roots left without an entity
        current.drop_missing_application_roots();
        verify_round_trip(&current)
    }

    fn load_memento(&self, lookup: &dyn LookupContext) -> Result<MementoAggregate> {
        self.inner.load_memento(lookup)
    }

    fn wait_for_writes_completed(&self, timeout: Duration) -> Result<()> {
        self.inner.wait_for_writes_completed(timeout)
    }

    fn compact(&self) -> Result<()> {
        self.inner.compact()
    }

    fn stats(&self) -> Result<WriteStats> {
        self.inner.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::InMemoryBackend;
    use crate::memento::{EntityRelations, MementoKind};

    fn validator() -> RoundTripValidator<MementoPersister<InMemoryBackend, NoCompression>> {
        RoundTripValidator::new(
            MementoPersister::new(InMemoryBackend::new(), NoCompression, WriteMode::Synchronous)
                .unwrap(),
        )
    }

    fn aggregate() -> MementoAggregate {
        MementoAggregate::builder()
            .memento(
                Memento::entity("e1", "BasicApplication")
                    .with_config("replicas", 3i64)
                    .with_relations(EntityRelations::default().with_location("l1")),
            )
            .memento(Memento::location("l1", "SshMachineLocation"))
            .application("e1")
            .build()
            .unwrap()
    }

    #[test]
    fn test_valid_writes_pass() {
        let validator = validator();
        validator.checkpoint(&aggregate()).unwrap();
        validator
            .delta(
                &Delta::builder()
                    .upsert(Memento::entity("e2", "BasicEntity").with_field("ratio", 0.5))
                    .build()
                    .unwrap(),
            )
            .unwrap();

        assert_eq!(validator.stats().unwrap().acknowledged, 2);
        assert_eq!(validator.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_non_finite_float_is_not_serializable() {
        let validator = validator();
        validator.checkpoint(&aggregate()).unwrap();

        let delta = Delta::builder()
            .upsert(
                Memento::entity("e1", "BasicApplication")
                    .with_config("limits", ConfigValue::Map(
                        [("cpu".to_string(), ConfigValue::Float(f64::INFINITY))]
                            .into_iter()
                            .collect(),
                    )),
            )
            .build()
            .unwrap();

        match validator.delta(&delta) {
            Err(PersistError::NotSerializable { kind, id, reason }) => {
                assert_eq!(kind, MementoKind::Entity);
                assert_eq!(id, "e1");
                assert!(reason.contains("config.limits.cpu"), "{reason}");
            }
            other => panic!("expected NotSerializable, got {other:?}"),
        }
    }

    #[test]
    fn test_first_difference_names_field() {
        let original = Memento::entity("e1", "BasicEntity").with_config("port", 80i64);
        let copy = Memento::entity("e1", "BasicEntity").with_config("port", 81i64);
        assert_eq!(
            first_difference(&original, &copy).unwrap(),
            "field 'config.port' changed"
        );
        assert!(first_difference(&original, &original.clone()).is_none());
    }

    #[test]
    fn test_scratch_directory_is_removed() {
        let parent = tempfile::tempdir().unwrap();
        let is_empty = || std::fs::read_dir(parent.path()).unwrap().next().is_none();

        verify_round_trip_in(parent.path(), &aggregate()).unwrap();
        assert!(is_empty());

        let bad = MementoAggregate::builder()
            .memento(Memento::entity("e1", "BasicEntity").with_field("load", f64::NAN))
            .build()
            .unwrap();
        let result = verify_round_trip_in(parent.path(), &bad);
        assert!(matches!(result, Err(PersistError::NotSerializable { .. })));
        assert!(is_empty());
    }
}
