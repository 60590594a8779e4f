/*!
Memento CLI - Command-line interface for memento persistence directories.

This CLI provides utilities for inspecting, verifying, compacting and purging
the checkpoint/delta directories written by the file backend.
*/

use clap::{Parser, Subcommand, ValueEnum};
use memento_core::{
    verify_round_trip, CheckpointMarker, CompressionKind, FileBackend, Memento, MementoKind,
    MementoPersister, PersistError, PersistenceBackend, Persister, PlaceholderLookupContext,
    RebindPolicy, Rebinder, RecordCodec, RecordCompression, TypeRegistry, WriteMode,
};
use memento_retry::{local_storage_backoff_policy, with_custom_backoff};
use std::path::{Path, PathBuf};
use tabled::{Table, Tabled};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "memento")]
#[command(about = "CLI for memento persistence directories")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Persistence directory
    #[arg(short, long, global = true, env = "MEMENTO_DIR", default_value = "./memento")]
    dir: PathBuf,

    /// Compression used for new records
    #[arg(short, long, global = true, value_enum, default_value = "gzip")]
    compression: CompressionArg,

    #[command(subcommand)]
    command: Commands,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum CompressionArg {
    Gzip,
    None,
}

impl From<CompressionArg> for CompressionKind {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::Gzip => CompressionKind::Gzip,
            CompressionArg::None => CompressionKind::None,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Summarize the latest checkpoint and pending deltas
    Inspect {
        /// Only list mementos of this kind (entity, location, policy, enricher, feed)
        #[arg(short, long)]
        kind: Option<MementoKind>,
    },
    /// Print the stored aggregate, deltas applied, as JSON
    Dump,
    /// Check that the stored state reloads intact and rebinds
    Verify {
        /// Treat unresolved references as errors
        #[arg(short, long)]
        strict: bool,
    },
    /// Fold pending deltas into a new checkpoint
    Compact,
    /// Delete every checkpoint and delta
    Purge {
        /// Skip confirmation prompt
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Tabled)]
struct MementoInfo {
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "Type")]
    type_name: String,
    #[tabled(rename = "Name")]
    display_name: String,
    #[tabled(rename = "Config")]
    config_keys: usize,
    #[tabled(rename = "Size")]
    size: String,
}

fn main() -> Result<(), anyhow::Error> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    let compression = CompressionKind::from(cli.compression);

    // Execute command
    match cli.command {
        Commands::Inspect { kind } => inspect(&cli.dir, compression, kind)?,
        Commands::Dump => dump(&cli.dir, compression)?,
        Commands::Verify { strict } => verify(&cli.dir, compression, strict)?,
        Commands::Compact => compact(&cli.dir, compression)?,
        Commands::Purge { force } => purge(&cli.dir, force)?,
    }

    Ok(())
}

fn init_logging(verbose: bool) {
    let default_directive = if verbose { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn open_backend(dir: &Path) -> Result<FileBackend, anyhow::Error> {
    if !dir.is_dir() {
        return Err(anyhow::anyhow!(
            "No persistence directory found at: {}",
            dir.display()
        ));
    }
    Ok(FileBackend::open(dir)?)
}

fn open_persister(
    dir: &Path,
    compression: CompressionKind,
) -> Result<MementoPersister<FileBackend, RecordCompression>, anyhow::Error> {
    let backend = open_backend(dir)?;
    Ok(MementoPersister::new(
        backend,
        RecordCompression::from(compression),
        WriteMode::Synchronous,
    )?)
}

fn inspect(
    dir: &Path,
    compression: CompressionKind,
    kind: Option<MementoKind>,
) -> Result<(), anyhow::Error> {
    info!("Inspecting {}", dir.display());

    let backend = open_backend(dir)?;
    let codec = RecordCodec::new(RecordCompression::from(compression));

    let marker = match backend.read_latest_checkpoint()? {
        Some((marker, encoded)) => {
            let manifest = codec.decode_manifest(&encoded.manifest)?;
            println!("Checkpoint:");
            println!("  Sequence: {}", marker.sequence);
            println!("  ID: {}", manifest.checkpoint_id);
            println!(
                "  Written: {}",
                manifest
                    .written_at
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M:%S")
            );
            println!("  Applications: {}", manifest.application_ids.join(", "));
            println!("  Records: {}", manifest.record_count);

            let mut rows = Vec::new();
            for (reference, bytes) in &encoded.records {
                if kind.is_some_and(|k| k != reference.kind) {
                    continue;
                }
                let memento = codec.decode_memento(reference, bytes)?;
                rows.push(memento_info(&memento, bytes.len()));
            }
            if rows.is_empty() {
                println!("No mementos found");
            } else {
                println!("{}", Table::new(rows));
            }
            marker
        }
        None => {
            println!("No checkpoint found");
            CheckpointMarker::ORIGIN
        }
    };

    let deltas = backend.read_deltas_since(marker)?;
    let delta_bytes: usize = deltas.iter().map(|d| d.payload.len()).sum();
    println!(
        "Pending deltas: {} ({})",
        deltas.len(),
        format_size(delta_bytes as u64)
    );

    Ok(())
}

fn memento_info(memento: &Memento, size: usize) -> MementoInfo {
    MementoInfo {
        kind: memento.kind().to_string(),
        id: memento.id.clone(),
        type_name: memento.type_name.clone(),
        display_name: memento.display_name.clone().unwrap_or_default(),
        config_keys: memento.config.len(),
        size: format_size(size as u64),
    }
}

fn dump(dir: &Path, compression: CompressionKind) -> Result<(), anyhow::Error> {
    let persister = open_persister(dir, compression)?;
    let aggregate = persister.load_memento(PlaceholderLookupContext::shared())?;
    println!("{}", serde_json::to_string_pretty(&aggregate)?);
    Ok(())
}

fn verify(dir: &Path, compression: CompressionKind, strict: bool) -> Result<(), anyhow::Error> {
    info!("Verifying {}", dir.display());

    let persister = open_persister(dir, compression)?;
    let aggregate = match persister.load_memento(PlaceholderLookupContext::shared()) {
        Ok(aggregate) => aggregate,
        Err(PersistError::IntegrityCheckFailed { expected, actual }) => {
            error!("✗ Integrity check failed:");
            error!("  Expected hash: {}", expected);
            error!("  Actual hash: {}", actual);
            return Err(anyhow::anyhow!("Integrity check failed"));
        }
        Err(e) => {
            error!("✗ Failed to load stored state: {}", e);
            return Err(e.into());
        }
    };

    if let Err(e) = verify_round_trip(&aggregate) {
        error!("✗ Round trip failed: {}", e);
        return Err(e.into());
    }
    println!("✓ {} memento(s) reload intact", aggregate.len());

    let policy = if strict {
        RebindPolicy::Strict
    } else {
        RebindPolicy::Lenient
    };
    let registry: TypeRegistry<String> =
        TypeRegistry::new().with_fallback(|memento, _| Ok(memento.type_name.clone()));
    let outcome = Rebinder::new(aggregate)
        .with_policy(policy)
        .rebind(&registry)?;

    if outcome.report.is_empty() {
        println!(
            "✓ Rebind succeeded: {} object(s), {} application(s)",
            outcome.graph.len(),
            outcome.graph.applications().count()
        );
    } else {
        println!("! Rebind completed with {}", outcome.report);
    }

    Ok(())
}

fn compact(dir: &Path, compression: CompressionKind) -> Result<(), anyhow::Error> {
    let persister = open_persister(dir, compression)?;
    let before = persister
        .backend()
        .read_latest_checkpoint()?
        .map(|(marker, _)| marker)
        .unwrap_or(CheckpointMarker::ORIGIN);
    let pending = persister.backend().read_deltas_since(before)?.len();

    with_custom_backoff("compact", local_storage_backoff_policy(), |_attempt| {
        persister.compact()
    })?;

    println!("✓ Folded {pending} delta(s) into a new checkpoint");
    Ok(())
}

fn purge(dir: &Path, force: bool) -> Result<(), anyhow::Error> {
    if !force {
        print!(
            "Are you sure you want to delete all state under '{}'? (y/N): ",
            dir.display()
        );
        use std::io::{self, Write};
        io::stdout().flush()?;

        let mut input = String::new();
        io::stdin().read_line(&mut input)?;

        if !input.trim().to_lowercase().starts_with('y') {
            println!("Purge cancelled");
            return Ok(());
        }
    }

    open_backend(dir)?.delete_all()?;
    println!("✓ Persisted state deleted");
    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(3 * 1024 * 1024 + 512 * 1024), "3.5 MB");
    }

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::try_parse_from([
            "memento", "--dir", "/srv/state", "inspect", "--kind", "location",
        ])
        .unwrap();
        assert_eq!(cli.dir, PathBuf::from("/srv/state"));
        assert!(matches!(
            cli.command,
            Commands::Inspect {
                kind: Some(MementoKind::Location)
            }
        ));

        let cli = Cli::try_parse_from(["memento", "verify", "--strict", "-c", "none"]).unwrap();
        assert!(matches!(cli.command, Commands::Verify { strict: true }));
        assert!(matches!(cli.compression, CompressionArg::None));
    }

    #[test]
    fn test_missing_directory_is_reported() {
        let missing = PathBuf::from("/nonexistent/memento-state");
        let err = open_backend(&missing).unwrap_err();
        assert!(err.to_string().contains("No persistence directory"));
    }
}
