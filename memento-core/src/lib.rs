/*!
# Memento Core Engine

Checkpoint/delta persistence and rebind engine for graphs of live
orchestrator objects.

A running system is captured as plain, serializable **mementos**: one per
entity, location, policy, enricher and feed, referencing each other by id. This
crate provides:

- An immutable memento model and the aggregate of a whole graph
- Deltas with idempotent, composable application
- A persister writing full checkpoints and incremental deltas to pluggable
  backends (in memory, one file per record), synchronously or on a background
  writer thread
- Two-phase rebind that rebuilds a cyclic live graph from mementos
- Round-trip validation of every write for development setups

## Architecture

Storage and compression are adapters behind traits ([`PersistenceBackend`],
[`CompressionAdapter`]); the persister engine owns the checkpoint/delta
semantics and the record codec owns the byte format. Rebind knows nothing about
concrete object types: a [`TypeRegistry`] supplied by the caller builds them.

## Usage

```rust
use std::time::Duration;
use memento_core::{
    create_persister_from_config, Delta, EntityRelations, Memento, MementoAggregate,
    MementoKind, PersisterConfig, PlaceholderLookupContext, Rebinder, TypeRegistry,
};

let persister = create_persister_from_config(&PersisterConfig::in_memory())?;

let aggregate = MementoAggregate::builder()
    .memento(
        Memento::entity("app", "BasicApplication")
            .with_relations(EntityRelations::default().with_child("web")),
    )
    .memento(
        Memento::entity("web", "WebServer")
            .with_relations(EntityRelations::default().with_parent("app")),
    )
    .application("app")
    .build()?;

// Full checkpoint, then an incremental change
persister.checkpoint(&aggregate)?;
persister.delta(
    &Delta::builder()
        .upsert(Memento::entity("web", "WebServer").with_config("port", 8080i64))
        .build()?,
)?;
persister.wait_for_writes_completed(Duration::from_secs(5))?;

// Restore and rebuild the live graph
let loaded = persister.load_memento(PlaceholderLookupContext::shared())?;
let registry = TypeRegistry::new().with_fallback(|m, _| Ok(m.type_name.clone()));
let outcome = Rebinder::new(loaded).rebind(&registry)?;
assert_eq!(outcome.graph.len(), 2);
assert!(outcome.report.is_empty());
# let _ = MementoKind::Entity;
# Ok::<(), memento_core::PersistError>(())
```
*/

pub mod aggregate;
pub mod backend;
pub mod codec;
pub mod compression;
pub mod config;
pub mod delta;
pub mod error;
pub mod lookup;
pub mod memento;
pub mod observability;
pub mod persister;
pub mod rebind;
pub mod validator;
pub mod write_queue;

#[cfg(test)]
mod error_tests;

pub use aggregate::{AggregateBuilder, DanglingReference, MementoAggregate};
pub use backend::{
    CheckpointMarker, EncodedCheckpoint, EncodedDelta, FileBackend, InMemoryBackend,
    PersistenceBackend,
};
pub use codec::{CheckpointManifest, RecordCodec, RECORD_FORMAT_VERSION};
pub use compression::{
    CompressionAdapter, CompressionKind, GzipCompressor, NoCompression, RecordCompression,
};
pub use config::{BackendKind, PersisterConfig};
pub use delta::{Delta, DeltaBuilder};
pub use error::{PersistError, Result};
pub use lookup::{
    DetachedLookupContext, ExternalObjects, HandleOrigin, LookupContext, ObjectHandle,
    PlaceholderLookupContext,
};
pub use memento::{
    AdjunctRelations, ConfigValue, EntityRelations, LocationRelations, Memento, MementoKind,
    MementoRef, OutgoingRef, Relations,
};
#[cfg(feature = "metrics")]
pub use observability::{MementoMetrics, MetricsTimer};
pub use observability::{init_default_observability, init_observability};
pub use persister::{create_persister_from_config, MementoPersister, Persister};
pub use rebind::{
    LiveObject, RebindIssue, RebindOutcome, RebindPolicy, RebindProblem, RebindReport,
    Rebinder, RebuiltGraph, SkeletonGraph, TypeRegistry,
};
pub use validator::{verify_round_trip, RoundTripValidator};
pub use write_queue::{WriteMode, WriteStats};
