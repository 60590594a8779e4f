/*!
Persister engine.

[`MementoPersister`] ties a [`RecordCodec`] to a backend through a write queue.
It is the piece that owns checkpoint/delta semantics; backends only store
bytes, the codec only encodes them.
*/

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::aggregate::MementoAggregate;
use crate::backend::{CheckpointMarker, FileBackend, InMemoryBackend, PersistenceBackend};
use crate::codec::RecordCodec;
use crate::compression::{CompressionAdapter, RecordCompression};
use crate::config::{BackendKind, PersisterConfig};
use crate::delta::Delta;
use crate::lookup::LookupContext;
use crate::validator::RoundTripValidator;
use crate::write_queue::{WriteJob, WriteMode, WriteQueue, WriteStats};
use crate::Result;

/// How long [`Persister::compact`] waits for queued writes before reading.
pub const COMPACT_WAIT: Duration = Duration::from_secs(60);

/// Caller-facing persistence contract
///
/// Object safe, so configuration code can hand out a `Box<dyn Persister>`
/// whether or not round-trip validation is switched on.
pub trait Persister: Send + Sync {
    /// Replace the entire durable state with `aggregate`
    ///
    /// Records are encoded before this returns; encoding failures surface
    /// here. In background mode the backend write happens later.
    ///
    /// # Errors
    /// * `PersistError::InvalidState` - If an application root is not an entity
    ///   of `aggregate`; nothing is written
    /// * `PersistError::NotSerializable` - If a memento cannot be encoded
    /// * `PersistError::PersistenceFailure` - If the write fails (synchronous mode)
    fn checkpoint(&self, aggregate: &MementoAggregate) -> Result<()>;

    /// Append an incremental change. Empty deltas are skipped.
    ///
    /// # Errors
    /// * `PersistError::PersistenceFailure` - If this write fails (synchronous
    ///   mode), or an earlier write failed and no checkpoint has succeeded since
    fn delta(&self, delta: &Delta) -> Result<()>;

    /// Read the latest checkpoint plus every later delta as one aggregate
    ///
    /// References that neither the aggregate nor `lookup` can resolve are
    /// logged as dangling; they do not fail the load. Application roots that
    /// deltas left without an entity are logged and dropped. Empty storage
    /// yields an empty aggregate.
    fn load_memento(&self, lookup: &dyn LookupContext) -> Result<MementoAggregate>;

    /// Block until every write submitted before the call has been processed
    ///
    /// # Errors
    /// * `PersistError::Timeout` - If writes are still outstanding after `timeout`
    /// * `PersistError::PersistenceFailure` - If the persister is in the failed state
    fn wait_for_writes_completed(&self, timeout: Duration) -> Result<()>;

    /// Fold every delta into a fresh checkpoint.
    fn compact(&self) -> Result<()>;

    fn stats(&self) -> Result<WriteStats>;
}

impl<P: Persister + ?Sized> Persister for Box<P> {
    fn checkpoint(&self, aggregate: &MementoAggregate) -> Result<()> {
        (**self).checkpoint(aggregate)
    }

    fn delta(&self, delta: &Delta) -> Result<()> {
        (**self).delta(delta)
    }

    fn load_memento(&self, lookup: &dyn LookupContext) -> Result<MementoAggregate> {
        (**self).load_memento(lookup)
    }

    fn wait_for_writes_completed(&self, timeout: Duration) -> Result<()> {
        (**self).wait_for_writes_completed(timeout)
    }

    fn compact(&self) -> Result<()> {
        (**self).compact()
    }

    fn stats(&self) -> Result<WriteStats> {
        (**self).stats()
    }
}

/// Persister writing encoded mementos to a [`PersistenceBackend`]
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use memento_core::{
///     InMemoryBackend, Memento, MementoAggregate, MementoPersister, NoCompression,
///     PlaceholderLookupContext, Persister, WriteMode,
/// };
///
/// let persister =
///     MementoPersister::new(InMemoryBackend::new(), NoCompression, WriteMode::Background)?;
///
/// let aggregate = MementoAggregate::builder()
///     .memento(Memento::entity("app", "BasicApplication"))
///     .application("app")
///     .build()?;
/// persister.checkpoint(&aggregate)?;
/// persister.wait_for_writes_completed(Duration::from_secs(5))?;
///
/// let loaded = persister.load_memento(PlaceholderLookupContext::shared())?;
/// assert_eq!(loaded, aggregate);
/// # Ok::<(), memento_core::PersistError>(())
/// ```
pub struct MementoPersister<B, C>
where
    B: PersistenceBackend + 'static,
    C: CompressionAdapter,
{
    codec: RecordCodec<C>,
    queue: WriteQueue<B>,
}

impl<B, C> MementoPersister<B, C>
where
    B: PersistenceBackend + 'static,
    C: CompressionAdapter,
{
    /// Create a persister owning `backend`
    ///
    /// # Errors
    /// * `PersistError::InvalidState` - If the writer thread cannot be started
    pub fn new(backend: B, compressor: C, mode: WriteMode) -> Result<Self> {
        Self::with_shared_backend(Arc::new(backend), compressor, mode)
    }

    /// Create a persister over a backend the caller keeps a handle on.
    pub fn with_shared_backend(backend: Arc<B>, compressor: C, mode: WriteMode) -> Result<Self> {
        Ok(Self {
            codec: RecordCodec::new(compressor),
            queue: WriteQueue::new(backend, mode)?,
        })
    }

    pub fn backend(&self) -> &B {
        self.queue.backend()
    }

    pub fn codec(&self) -> &RecordCodec<C> {
        &self.codec
    }

    pub fn write_mode(&self) -> WriteMode {
        self.queue.mode()
    }

    /// Whether a failed write is blocking deltas until the next checkpoint.
    pub fn is_failed(&self) -> Result<bool> {
        self.queue.is_failed()
    }

    /// Materialize the stored aggregate without checking references.
    fn read_aggregate(&self) -> Result<MementoAggregate> {
        let backend = self.queue.backend();
        let (marker, mut aggregate) = match backend.read_latest_checkpoint()? {
            Some((marker, encoded)) => (marker, self.codec.decode_checkpoint(&encoded)?),
            None => (CheckpointMarker::ORIGIN, MementoAggregate::empty()),
        };

        let deltas = backend.read_deltas_since(marker)?;
        let delta_count = deltas.len();
        for encoded in deltas {
            let delta = self.codec.decode_delta(&encoded.payload)?;
            aggregate = aggregate.apply(&delta);
        }

        let dropped = aggregate.drop_missing_application_roots();
        if !dropped.is_empty() {
            warn!(
                roots = ?dropped,
                "Dropping application roots that are not entities of the stored aggregate"
            );
        }

        debug!(
            backend = backend.name(),
            checkpoint = marker.sequence,
            deltas = delta_count,
            mementos = aggregate.len(),
            "Read stored aggregate"
        );
        Ok(aggregate)
    }
}

impl<B, C> Persister for MementoPersister<B, C>
where
    B: PersistenceBackend + 'static,
    C: CompressionAdapter,
{
    fn checkpoint(&self, aggregate: &MementoAggregate) -> Result<()> {
        aggregate.check_application_roots()?;
        let encoded = self.codec.encode_checkpoint(aggregate)?;
        info!(
            backend = self.queue.backend().name(),
            mementos = aggregate.len(),
            applications = aggregate.application_ids().len(),
            "Submitting checkpoint"
        );
        self.queue.submit(WriteJob::Checkpoint(encoded))
    }

    fn delta(&self, delta: &Delta) -> Result<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let payload = self.codec.encode_delta(delta)?;
        debug!(
            upserts = delta.upsert_count(),
            removals = delta.removal_count(),
            "Submitting delta"
        );
        self.queue.submit(WriteJob::Delta(payload))
    }

    fn load_memento(&self, lookup: &dyn LookupContext) -> Result<MementoAggregate> {
        let aggregate = self.read_aggregate()?;

        for dangling in aggregate.dangling_references(lookup) {
            warn!(
                owner = %dangling.owner,
                relation = %dangling.relation,
                target = %dangling.target,
                "Dangling reference in loaded memento"
            );
        }

        info!(
            mementos = aggregate.len(),
            applications = aggregate.application_ids().len(),
            "Loaded memento"
        );
        Ok(aggregate)
    }

    fn wait_for_writes_completed(&self, timeout: Duration) -> Result<()> {
        self.queue.wait_for_completion(timeout)
    }

    fn compact(&self) -> Result<()> {
        self.queue.wait_for_completion(COMPACT_WAIT)?;
        let aggregate = self.read_aggregate()?;
        info!(mementos = aggregate.len(), "Compacting deltas into a checkpoint");
        self.checkpoint(&aggregate)
    }

    fn stats(&self) -> Result<WriteStats> {
        self.queue.stats()
    }
}

/// Create a persister based on configuration
///
/// Selects the backend and compression named by `config`, and wraps the
/// result in a [`RoundTripValidator`] when `check_persistable` is set. The
/// validator starts from whatever the backend already holds.
///
/// # Example
/// ```rust
/// use memento_core::{create_persister_from_config, PersisterConfig};
///
/// let persister = create_persister_from_config(&PersisterConfig::in_memory())?;
/// assert_eq!(persister.stats()?.submitted, 0);
/// # Ok::<(), memento_core::PersistError>(())
/// ```
pub fn create_persister_from_config(config: &PersisterConfig) -> Result<Box<dyn Persister>> {
    config.validate()?;
    let compression = RecordCompression::from(config.compression);

    let persister: Box<dyn Persister> = match config.backend {
        BackendKind::InMemory => Box::new(MementoPersister::new(
            InMemoryBackend::new(),
            compression,
            config.write_mode,
        )?),
        BackendKind::File => {
            let base_dir = config.require_base_dir()?;
            Box::new(MementoPersister::new(
                FileBackend::open(base_dir)?,
                compression,
                config.write_mode,
            )?)
        }
    };

    info!(
        backend = ?config.backend,
        write_mode = ?config.write_mode,
        check_persistable = config.check_persistable,
        "Created persister"
    );

    if config.check_persistable {
        Ok(Box::new(RoundTripValidator::resume(persister)?))
    } else {
        Ok(persister)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::{GzipCompressor, NoCompression};
    use crate::lookup::{DetachedLookupContext, PlaceholderLookupContext};
    use crate::memento::{EntityRelations, Memento, MementoKind};
    use crate::PersistError;

    fn aggregate() -> MementoAggregate {
        MementoAggregate::builder()
            .memento(
                Memento::entity("app", "BasicApplication")
                    .with_relations(EntityRelations::default().with_child("web")),
            )
            .memento(
                Memento::entity("web", "WebServer")
                    .with_relations(EntityRelations::default().with_parent("app")),
            )
            .application("app")
            .build()
            .unwrap()
    }

    #[test]
    fn test_empty_storage_loads_empty_aggregate() {
        let persister =
            MementoPersister::new(InMemoryBackend::new(), NoCompression, WriteMode::Synchronous)
                .unwrap();
        let loaded = persister.load_memento(&DetachedLookupContext).unwrap();
        assert!(loaded.is_empty());
    }

    #[test]
    fn test_checkpoint_then_deltas() {
        let persister = MementoPersister::new(
            InMemoryBackend::new(),
            GzipCompressor::fast(),
            WriteMode::Synchronous,
        )
        .unwrap();
        persister.checkpoint(&aggregate()).unwrap();

        let delta = Delta::builder()
            .upsert(Memento::entity("web", "WebServer").with_config("port", 8080i64))
            .build()
            .unwrap();
        persister.delta(&delta).unwrap();
        persister.delta(&Delta::default()).unwrap();

        let loaded = persister.load_memento(&DetachedLookupContext).unwrap();
        assert_eq!(loaded, aggregate().apply(&delta));
        assert_eq!(persister.stats().unwrap().submitted, 2);
        assert_eq!(persister.backend().delta_count().unwrap(), 1);
    }

    #[test]
    fn test_compact_folds_deltas() {
        let backend = Arc::new(InMemoryBackend::new());
        let persister = MementoPersister::with_shared_backend(
            Arc::clone(&backend),
            NoCompression,
            WriteMode::Background,
        )
        .unwrap();

        persister.checkpoint(&aggregate()).unwrap();
        let delta = Delta::builder()
            .remove(MementoKind::Entity, "web")
            .build()
            .unwrap();
        persister.delta(&delta).unwrap();

        persister.compact().unwrap();
        persister
            .wait_for_writes_completed(Duration::from_secs(5))
            .unwrap();

        assert_eq!(backend.delta_count().unwrap(), 0);
        let loaded = persister
            .load_memento(PlaceholderLookupContext::shared())
            .unwrap();
        assert_eq!(loaded, aggregate().apply(&delta));
    }

    #[test]
    fn test_dangling_reference_does_not_fail_load() {
        let persister =
            MementoPersister::new(InMemoryBackend::new(), NoCompression, WriteMode::Background)
                .unwrap();
        let orphan = Delta::builder()
            .upsert(Memento::policy("p1", "AutoScalerPolicy").owned_by("gone").unwrap())
            .build()
            .unwrap();
        persister.checkpoint(&aggregate()).unwrap();
        persister.delta(&orphan).unwrap();
        persister
            .wait_for_writes_completed(Duration::from_secs(5))
            .unwrap();

        let loaded = persister.load_memento(&DetachedLookupContext).unwrap();
        assert_eq!(loaded.dangling_references(&DetachedLookupContext).len(), 1);
        assert!(loaded.get(MementoKind::Policy, "p1").is_some());
        assert!(!matches!(
            persister.wait_for_writes_completed(Duration::ZERO),
            Err(PersistError::Timeout { .. })
        ));
    }

    #[test]
    fn test_non_finite_checkpoint_leaves_prior_state() {
        let persister =
            MementoPersister::new(InMemoryBackend::new(), NoCompression, WriteMode::Synchronous)
                .unwrap();
        persister.checkpoint(&aggregate()).unwrap();

        let bad = MementoAggregate::builder()
            .memento(Memento::entity("app", "BasicApplication").with_field("load", f64::INFINITY))
            .application("app")
            .build()
            .unwrap();
        let result = persister.checkpoint(&bad);
        assert!(
            matches!(result, Err(PersistError::NotSerializable { .. })),
            "{result:?}"
        );

        let delta = Delta::builder()
            .upsert(Memento::entity("web", "WebServer").with_field("load", f64::NAN))
            .build()
            .unwrap();
        assert!(matches!(
            persister.delta(&delta),
            Err(PersistError::NotSerializable { .. })
        ));

        assert_eq!(persister.stats().unwrap().submitted, 1);
        assert!(!persister.is_failed().unwrap());
        assert_eq!(
            persister.load_memento(&DetachedLookupContext).unwrap(),
            aggregate()
        );
    }

    #[test]
    fn test_checkpoint_with_rootless_application_writes_nothing() {
        let backend = Arc::new(InMemoryBackend::new());
        let persister = MementoPersister::with_shared_backend(
            Arc::clone(&backend),
            NoCompression,
            WriteMode::Synchronous,
        )
        .unwrap();
        let rootless = aggregate().apply(&Delta::builder().add_application("ghost").build().unwrap());

        let result = persister.checkpoint(&rootless);
        assert!(matches!(result, Err(PersistError::InvalidState(_))), "{result:?}");
        assert!(backend.read_latest_checkpoint().unwrap().is_none());
        assert_eq!(persister.stats().unwrap().submitted, 0);
    }

    #[test]
    fn test_compact_after_rootless_delta_stays_readable() {
        let persister =
            MementoPersister::new(InMemoryBackend::new(), NoCompression, WriteMode::Synchronous)
                .unwrap();
        persister.checkpoint(&aggregate()).unwrap();
        persister
            .delta(&Delta::builder().add_application("ghost").build().unwrap())
            .unwrap();

        let loaded = persister.load_memento(&DetachedLookupContext).unwrap();
        assert_eq!(loaded.application_ids(), ["app".to_string()]);

        persister.compact().unwrap();
        let compacted = persister.load_memento(&DetachedLookupContext).unwrap();
        assert_eq!(compacted, aggregate());
        assert_eq!(persister.backend().delta_count().unwrap(), 0);
    }

    #[test]
    fn test_create_from_config() {
        let temp_dir = tempfile::tempdir().unwrap();
        let config = PersisterConfig::file(temp_dir.path()).with_write_mode(WriteMode::Synchronous);
        let persister = create_persister_from_config(&config).unwrap();

        persister.checkpoint(&aggregate()).unwrap();
        let reopened = create_persister_from_config(&config).unwrap();
        assert_eq!(
            reopened.load_memento(&DetachedLookupContext).unwrap(),
            aggregate()
        );
    }
}
