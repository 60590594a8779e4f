/*!
Integration tests for the file backend, background writes and the
configuration-driven persister.
*/

use memento_core::{
    create_persister_from_config, CheckpointMarker, CompressionAdapter, Delta, EncodedCheckpoint,
    EncodedDelta, EntityRelations, FileBackend, GzipCompressor, InMemoryBackend, Memento,
    MementoAggregate, MementoKind, MementoPersister, PersistError, PersistenceBackend, Persister,
    PersisterConfig, PlaceholderLookupContext, WriteMode,
};
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn aggregate() -> MementoAggregate {
    MementoAggregate::builder()
        .memento(
            Memento::entity("app", "BasicApplication")
                .with_config("owner", "ops/team")
                .with_relations(EntityRelations::default().with_child("web/1")),
        )
        .memento(
            Memento::entity("web/1", "WebServer")
                .with_relations(EntityRelations::default().with_parent("app")),
        )
        .application("app")
        .build()
        .unwrap()
}

fn add_db(id: &str) -> Delta {
    Delta::builder()
        .upsert(Memento::entity(id, "Database"))
        .build()
        .unwrap()
}

fn file_persister(dir: &std::path::Path) -> MementoPersister<FileBackend, GzipCompressor> {
    MementoPersister::new(
        FileBackend::open(dir).unwrap(),
        GzipCompressor::new(),
        WriteMode::Synchronous,
    )
    .unwrap()
}

#[test]
fn test_state_survives_reopen() {
    let temp_dir = TempDir::new().unwrap();

    {
        let persister = file_persister(temp_dir.path());
        persister.checkpoint(&aggregate()).unwrap();
        persister.delta(&add_db("db1")).unwrap();
        persister.delta(&add_db("db2")).unwrap();
    }

    let persister = file_persister(temp_dir.path());
    let loaded = persister
        .load_memento(PlaceholderLookupContext::shared())
        .unwrap();
    assert_eq!(loaded.count(MementoKind::Entity), 4);
    assert_eq!(loaded.application_ids(), ["app".to_string()]);
    assert_eq!(
        loaded.entity("web/1").unwrap().entity_relations().unwrap().parent_id,
        Some("app".to_string())
    );

    // Sequence numbers carry on after the reopen
    persister.delta(&add_db("db3")).unwrap();
    let deltas = persister
        .backend()
        .read_deltas_since(CheckpointMarker { sequence: 1 })
        .unwrap();
    let sequences: Vec<u64> = deltas.iter().map(|d| d.sequence).collect();
    assert_eq!(sequences, vec![2, 3, 4]);
}

#[test]
fn test_corrupt_record_fails_integrity_check() {
    let temp_dir = TempDir::new().unwrap();
    let persister = file_persister(temp_dir.path());
    persister.checkpoint(&aggregate()).unwrap();

    let record = temp_dir
        .path()
        .join("checkpoint-00000000000000000001")
        .join("entities")
        .join("app");
    let gzip = GzipCompressor::new();
    let stored = gzip.decompress(&fs::read(&record).unwrap()).unwrap();
    let mut envelope: serde_json::Value = serde_json::from_slice(&stored).unwrap();
    envelope["body"]["type"] = serde_json::Value::from("TamperedApplication");
    let tampered = gzip.compress(&serde_json::to_vec(&envelope).unwrap()).unwrap();
    fs::write(&record, tampered).unwrap();

    let result = persister.load_memento(PlaceholderLookupContext::shared());
    assert!(
        matches!(result, Err(PersistError::IntegrityCheckFailed { .. })),
        "{result:?}"
    );
}

#[test]
fn test_truncated_record_is_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let persister = file_persister(temp_dir.path());
    persister.checkpoint(&aggregate()).unwrap();

    let record = temp_dir
        .path()
        .join("checkpoint-00000000000000000001")
        .join("entities")
        .join("app");
    let bytes = fs::read(&record).unwrap();
    fs::write(&record, &bytes[..bytes.len() / 2]).unwrap();

    assert!(persister
        .load_memento(PlaceholderLookupContext::shared())
        .is_err());
}

#[test]
fn test_config_driven_persister_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let config = PersisterConfig::file(temp_dir.path()).with_check_persistable(true);

    {
        let persister = create_persister_from_config(&config).unwrap();
        persister.checkpoint(&aggregate()).unwrap();
        persister.delta(&add_db("db1")).unwrap();
        persister
            .wait_for_writes_completed(Duration::from_secs(5))
            .unwrap();
        persister.compact().unwrap();
        persister
            .wait_for_writes_completed(Duration::from_secs(5))
            .unwrap();
    }

    let uri = format!("file://{}", temp_dir.path().display());
    let persister = create_persister_from_config(&PersisterConfig::from_uri(&uri).unwrap()).unwrap();
    let loaded = persister
        .load_memento(PlaceholderLookupContext::shared())
        .unwrap();
    assert_eq!(loaded.len(), 3);
    assert!(loaded.entity("db1").is_some());

    let deltas_dir = temp_dir.path().join("deltas");
    assert_eq!(fs::read_dir(deltas_dir).unwrap().count(), 0);
}

#[test]
fn test_checked_persister_resumes_after_reopen() {
    let temp_dir = TempDir::new().unwrap();
    let config = PersisterConfig::file(temp_dir.path())
        .with_write_mode(WriteMode::Synchronous)
        .with_check_persistable(true);

    {
        let persister = create_persister_from_config(&config).unwrap();
        persister.checkpoint(&aggregate()).unwrap();
    }

    let persister = create_persister_from_config(&config).unwrap();
    let delta = Delta::builder()
        .upsert(
            Memento::entity("web/2", "WebServer")
                .with_relations(EntityRelations::default().with_parent("app")),
        )
        .add_application("app")
        .build()
        .unwrap();
    persister.delta(&delta).unwrap();

    let loaded = persister
        .load_memento(PlaceholderLookupContext::shared())
        .unwrap();
    assert_eq!(loaded.application_ids(), ["app".to_string()]);
    assert_eq!(loaded.count(MementoKind::Entity), 3);
}

#[test]
fn test_non_finite_value_never_reaches_disk() {
    let temp_dir = TempDir::new().unwrap();
    let persister = file_persister(temp_dir.path());
    persister.checkpoint(&aggregate()).unwrap();

    let sensor = Delta::builder()
        .upsert(Memento::entity("web/1", "WebServer").with_field("load", f64::INFINITY))
        .build()
        .unwrap();
    let result = persister.delta(&sensor);
    assert!(
        matches!(result, Err(PersistError::NotSerializable { .. })),
        "{result:?}"
    );
    assert_eq!(fs::read_dir(temp_dir.path().join("deltas")).unwrap().count(), 0);

    let reopened = file_persister(temp_dir.path());
    assert_eq!(
        reopened
            .load_memento(PlaceholderLookupContext::shared())
            .unwrap(),
        aggregate()
    );
}

/// Backend whose delta writes block while the test holds the gate.
struct GatedBackend {
    inner: InMemoryBackend,
    gate: Arc<Mutex<()>>,
}

impl PersistenceBackend for GatedBackend {
    fn write_checkpoint(&self, checkpoint: EncodedCheckpoint) -> memento_core::Result<CheckpointMarker> {
        self.inner.write_checkpoint(checkpoint)
    }

    fn append_delta(&self, payload: Vec<u8>) -> memento_core::Result<u64> {
        let _open = self.gate.lock().unwrap();
        self.inner.append_delta(payload)
    }

    fn read_latest_checkpoint(
        &self,
    ) -> memento_core::Result<Option<(CheckpointMarker, EncodedCheckpoint)>> {
        self.inner.read_latest_checkpoint()
    }

    fn read_deltas_since(&self, marker: CheckpointMarker) -> memento_core::Result<Vec<EncodedDelta>> {
        self.inner.read_deltas_since(marker)
    }

    fn delete_all(&self) -> memento_core::Result<()> {
        self.inner.delete_all()
    }

    fn name(&self) -> &'static str {
        "gated"
    }
}

#[test]
fn test_background_wait_times_out_then_drains() {
    let gate = Arc::new(Mutex::new(()));
    let persister = MementoPersister::new(
        GatedBackend {
            inner: InMemoryBackend::new(),
            gate: Arc::clone(&gate),
        },
        GzipCompressor::new(),
        WriteMode::Background,
    )
    .unwrap();

    persister.checkpoint(&aggregate()).unwrap();
    persister
        .wait_for_writes_completed(Duration::from_secs(5))
        .unwrap();

    let held = gate.lock().unwrap();
    persister.delta(&add_db("db1")).unwrap();
    persister.delta(&add_db("db2")).unwrap();

    match persister.wait_for_writes_completed(Duration::from_millis(50)) {
        Err(PersistError::Timeout { pending, waited }) => {
            assert_eq!(pending, 2);
            assert!(waited >= Duration::from_millis(50));
        }
        other => panic!("expected Timeout, got {other:?}"),
    }
    assert_eq!(persister.stats().unwrap().pending, 2);

    drop(held);
    persister
        .wait_for_writes_completed(Duration::from_secs(5))
        .unwrap();

    let stats = persister.stats().unwrap();
    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.acknowledged, 3);
    assert_eq!(stats.pending, 0);

    let loaded = persister
        .load_memento(PlaceholderLookupContext::shared())
        .unwrap();
    assert!(loaded.entity("db1").is_some());
    assert!(loaded.entity("db2").is_some());
}
