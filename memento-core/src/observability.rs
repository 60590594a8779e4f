/*!
Observability for the persister.

- Structured logging setup (`tracing` + JSON `tracing-subscriber`)
- Prometheus metrics for writes and round-trip validation, behind the
  `metrics` feature
*/

#[cfg(feature = "metrics")]
use prometheus::{Counter, Encoder, Histogram, HistogramOpts, Registry, TextEncoder};
#[cfg(feature = "metrics")]
use std::sync::OnceLock;
#[cfg(feature = "metrics")]
use std::time::Instant;
use tracing::subscriber::set_global_default;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry as TracingRegistry};

use crate::{PersistError, Result};

/// Filter applied when `RUST_LOG` does not say otherwise.
pub const DEFAULT_LOG_DIRECTIVE: &str = "memento=info";

/// Global metrics instance
#[cfg(feature = "metrics")]
static METRICS: OnceLock<MementoMetrics> = OnceLock::new();

/// Backend write being measured.
#[cfg(feature = "metrics")]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOperation {
    Checkpoint,
    Delta,
}

/// Metrics collection for persister operations
#[cfg(feature = "metrics")]
#[derive(Debug)]
pub struct MementoMetrics {
    pub checkpoints_total: Counter,
    pub deltas_total: Counter,
    pub write_failures_total: Counter,
    pub write_latency_seconds: Histogram,
    pub checkpoint_records: Histogram,

    pub round_trips_total: Counter,
    pub round_trip_failures_total: Counter,

    registry: Registry,
}

#[cfg(feature = "metrics")]
fn register_counter(registry: &Registry, name: &str, help: &str) -> Result<Counter> {
    let counter = Counter::new(name, help)
        .map_err(|e| PersistError::invalid_state(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(counter.clone()))
        .map_err(|e| PersistError::invalid_state(format!("Failed to register {name}: {e}")))?;
    Ok(counter)
}

#[cfg(feature = "metrics")]
fn register_histogram(registry: &Registry, opts: HistogramOpts) -> Result<Histogram> {
    let name = opts.common_opts.name.clone();
    let histogram = Histogram::with_opts(opts)
        .map_err(|e| PersistError::invalid_state(format!("Failed to create {name} metric: {e}")))?;
    registry
        .register(Box::new(histogram.clone()))
        .map_err(|e| PersistError::invalid_state(format!("Failed to register {name}: {e}")))?;
    Ok(histogram)
}

#[cfg(feature = "metrics")]
impl MementoMetrics {
    fn new() -> Result<Self> {
        let registry = Registry::new();

        let checkpoints_total = register_counter(
            &registry,
            "memento_checkpoints_total",
            "Checkpoints written to the backend",
        )?;
        let deltas_total = register_counter(
            &registry,
            "memento_deltas_total",
            "Deltas written to the backend",
        )?;
        let write_failures_total = register_counter(
            &registry,
            "memento_write_failures_total",
            "Backend writes that failed or were dropped behind a failure",
        )?;
        let write_latency_seconds = register_histogram(
            &registry,
            HistogramOpts::new(
                "memento_write_latency_seconds",
                "Duration of backend writes in seconds",
            ),
        )?;
        let checkpoint_records = register_histogram(
            &registry,
            HistogramOpts::new(
                "memento_checkpoint_records",
                "Number of memento records per checkpoint",
            )
            .buckets(vec![1.0, 10.0, 100.0, 1_000.0, 10_000.0, 100_000.0]),
        )?;
        let round_trips_total = register_counter(
            &registry,
            "memento_round_trips_total",
            "Round-trip validation cycles run",
        )?;
        let round_trip_failures_total = register_counter(
            &registry,
            "memento_round_trip_failures_total",
            "Round-trip validation cycles that found a non-persistable memento",
        )?;

        Ok(Self {
            checkpoints_total,
            deltas_total,
            write_failures_total,
            write_latency_seconds,
            checkpoint_records,
            round_trips_total,
            round_trip_failures_total,
            registry,
        })
    }

    /// Get or initialize global metrics instance
    pub fn global() -> &'static MementoMetrics {
        METRICS.get_or_init(|| Self::new().expect("Failed to initialize memento metrics"))
    }

    pub fn record_write(&self, operation: WriteOperation, duration: std::time::Duration) {
        match operation {
            WriteOperation::Checkpoint => self.checkpoints_total.inc(),
            WriteOperation::Delta => self.deltas_total.inc(),
        }
        self.write_latency_seconds.observe(duration.as_secs_f64());
    }

    pub fn record_write_failure(&self) {
        self.write_failures_total.inc();
    }

    pub fn record_checkpoint_size(&self, records: usize) {
        self.checkpoint_records.observe(records as f64);
    }

    pub fn record_round_trip(&self, ok: bool) {
        self.round_trips_total.inc();
        if !ok {
            self.round_trip_failures_total.inc();
        }
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| PersistError::invalid_state(format!("Failed to encode metrics: {e}")))?;

        String::from_utf8(buffer).map_err(|e| {
            PersistError::invalid_state(format!("Failed to convert metrics to string: {e}"))
        })
    }
}

/// Measures one backend write
#[cfg(feature = "metrics")]
pub struct MetricsTimer {
    start: Instant,
    operation: WriteOperation,
}

#[cfg(feature = "metrics")]
impl MetricsTimer {
    pub fn start(operation: WriteOperation) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    /// Complete the timer, recording a successful write
    pub fn finish(self) {
        MementoMetrics::global().record_write(self.operation, self.start.elapsed());
    }

    /// Complete the timer with an error
    pub fn finish_with_error(self) {
        let metrics = MementoMetrics::global();
        metrics
            .write_latency_seconds
            .observe(self.start.elapsed().as_secs_f64());
        metrics.record_write_failure();
    }
}

/// Initialize the global tracing subscriber
///
/// Installs a subscriber filtered by `RUST_LOG` (falling back to
/// [`DEFAULT_LOG_DIRECTIVE`]), printing JSON lines when `json` is set and the
/// compact human format otherwise. With the `metrics` feature the metrics
/// registry is created eagerly.
pub fn init_observability(json: bool) -> Result<()> {
    #[cfg(feature = "metrics")]
    MementoMetrics::global();

    let directive = DEFAULT_LOG_DIRECTIVE
        .parse()
        .map_err(|e| PersistError::invalid_state(format!("Invalid log directive: {e}")))?;
    let filter = EnvFilter::from_default_env().add_directive(directive);

    let installed = if json {
        let fmt_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false);
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    } else {
        let fmt_layer = tracing_subscriber::fmt::layer().compact();
        set_global_default(TracingRegistry::default().with(filter).with(fmt_layer))
    };
    installed.map_err(|e| {
        PersistError::invalid_state(format!("Failed to set global tracing subscriber: {e}"))
    })?;

    tracing::info!("memento observability initialized");
    Ok(())
}

/// JSON logging with the default filter
pub fn init_default_observability() -> Result<()> {
    init_observability(true)
}
