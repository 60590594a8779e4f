/*!
Ordered write execution for a persister.

Every encoded write goes through a [`WriteQueue`]. In synchronous mode the
write runs on the caller's thread; in background mode it is appended to a FIFO
drained by a single named writer thread, so writes reach the backend in
submission order either way. The queue also keeps the counters behind
`wait_for_writes_completed` and the sticky failed state that stops deltas from
landing on top of a lost write.
*/

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::backend::{EncodedCheckpoint, PersistenceBackend};
#[cfg(feature = "metrics")]
use crate::observability::{MementoMetrics, MetricsTimer, WriteOperation};
use crate::{PersistError, Result};

const WRITER_THREAD_NAME: &str = "memento-writer";

/// How backend writes are executed.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Write on the calling thread before returning
    Synchronous,
    /// Queue the write for the writer thread and return immediately
    #[default]
    Background,
}

/// Write counters of one persister.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WriteStats {
    /// Writes accepted by `checkpoint`/`delta`
    pub submitted: u64,
    /// Writes the backend confirmed
    pub acknowledged: u64,
    /// Writes that failed or were dropped behind a failure
    pub failed: u64,
    /// Writes not processed yet
    pub pending: u64,
}

/// One encoded write.
#[derive(Debug)]
pub(crate) enum WriteJob {
    Checkpoint(EncodedCheckpoint),
    Delta(Vec<u8>),
}

impl WriteJob {
    fn describe(&self) -> &'static str {
        match self {
            WriteJob::Checkpoint(_) => "checkpoint",
            WriteJob::Delta(_) => "delta",
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    jobs: VecDeque<WriteJob>,
    submitted: u64,
    processed: u64,
    acknowledged: u64,
    failed: u64,
    /// Set by a failed write, cleared by a checkpoint
    failure: Option<String>,
    shutdown: bool,
}

impl QueueState {
    fn stats(&self) -> WriteStats {
        WriteStats {
            submitted: self.submitted,
            acknowledged: self.acknowledged,
            failed: self.failed,
            pending: self.submitted - self.processed,
        }
    }

    fn record_outcome(&mut self, job: &'static str, outcome: Result<()>) -> Result<()> {
        self.processed += 1;
        match outcome {
            Ok(()) => {
                self.acknowledged += 1;
                if job == "checkpoint" {
                    self.failure = None;
                }
                Ok(())
            }
            Err(e) => {
                self.failed += 1;
                self.failure = Some(format!("{job} write failed: {e}"));
                Err(e)
            }
        }
    }
}

struct Shared<B> {
    backend: Arc<B>,
    state: Mutex<QueueState>,
    changed: Condvar,
}

impl<B: PersistenceBackend> Shared<B> {
    fn lock(&self) -> Result<MutexGuard<'_, QueueState>> {
        self.state
            .lock()
            .map_err(|_| PersistError::persistence("write queue lock poisoned"))
    }

    fn execute(&self, job: WriteJob) -> Result<()> {
        let describe = job.describe();
        #[cfg(feature = "metrics")]
        let timer = MetricsTimer::start(match job {
            WriteJob::Checkpoint(_) => WriteOperation::Checkpoint,
            WriteJob::Delta(_) => WriteOperation::Delta,
        });

        let result = match job {
            WriteJob::Checkpoint(checkpoint) => {
                let records = checkpoint.records.len();
                self.backend.write_checkpoint(checkpoint).map(|marker| {
                    #[cfg(feature = "metrics")]
                    MementoMetrics::global().record_checkpoint_size(records);
                    debug!(sequence = marker.sequence, records, "Checkpoint written");
                })
            }
            WriteJob::Delta(payload) => self.backend.append_delta(payload).map(|sequence| {
                debug!(sequence, "Delta written");
            }),
        };

        #[cfg(feature = "metrics")]
        match &result {
            Ok(()) => timer.finish(),
            Err(_) => timer.finish_with_error(),
        }
        if let Err(e) = &result {
            error!(backend = self.backend.name(), write = describe, error = %e, "Backend write failed");
        }

        result.map_err(|e| match e {
            e @ PersistError::PersistenceFailure(_) => e,
            other => PersistError::persistence(format!("{describe} write failed: {other}")),
        })
    }

    fn run_writer(&self) {
        loop {
            let job = {
                let Ok(mut state) = self.lock() else {
                    return;
                };
                loop {
                    match state.jobs.pop_front() {
                        Some(WriteJob::Delta(_)) if state.failure.is_some() => {
                            state.processed += 1;
                            state.failed += 1;
                            #[cfg(feature = "metrics")]
                            MementoMetrics::global().record_write_failure();
                            warn!("Dropping queued delta behind a failed write");
                            self.changed.notify_all();
                        }
                        Some(job) => break job,
                        None if state.shutdown => return,
                        None => {
                            state = match self.changed.wait(state) {
                                Ok(state) => state,
                                Err(_) => return,
                            };
                        }
                    }
                }
            };

            let describe = job.describe();
            let outcome = self.execute(job);
            let Ok(mut state) = self.lock() else {
                return;
            };
            let _ = state.record_outcome(describe, outcome);
            self.changed.notify_all();
        }
    }
}

/// FIFO of encoded writes with completion tracking
pub(crate) struct WriteQueue<B: PersistenceBackend + 'static> {
    shared: Arc<Shared<B>>,
    mode: WriteMode,
    worker: Option<JoinHandle<()>>,
}

impl<B: PersistenceBackend + 'static> WriteQueue<B> {
    pub fn new(backend: Arc<B>, mode: WriteMode) -> Result<Self> {
        let shared = Arc::new(Shared {
            backend,
            state: Mutex::new(QueueState::default()),
            changed: Condvar::new(),
        });

        let worker = match mode {
            WriteMode::Synchronous => None,
            WriteMode::Background => {
                let shared = Arc::clone(&shared);
                let handle = thread::Builder::new()
                    .name(WRITER_THREAD_NAME.to_string())
                    .spawn(move || shared.run_writer())
                    .map_err(|e| {
                        PersistError::invalid_state(format!("Failed to spawn writer thread: {e}"))
                    })?;
                Some(handle)
            }
        };

        Ok(Self {
            shared,
            mode,
            worker,
        })
    }

    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    /// Submit a write
    ///
    /// Deltas are refused while the queue is in the failed state. A checkpoint
    /// supersedes every earlier write and leaves the failed state on
    /// submission; if it fails in turn the state is set again.
    pub fn submit(&self, job: WriteJob) -> Result<()> {
        let mut state = self.shared.lock()?;
        match &job {
            WriteJob::Delta(_) => {
                if let Some(failure) = &state.failure {
                    return Err(PersistError::persistence(format!(
                        "delta refused until the next checkpoint; {failure}"
                    )));
                }
            }
            WriteJob::Checkpoint(_) => state.failure = None,
        }
        state.submitted += 1;

        match self.mode {
            WriteMode::Synchronous => {
                // The state lock is held across the write so concurrent callers
                // reach the backend one at a time, in order.
                let describe = job.describe();
                let outcome = self.shared.execute(job);
                let result = state.record_outcome(describe, outcome);
                self.shared.changed.notify_all();
                result
            }
            WriteMode::Background => {
                state.jobs.push_back(job);
                self.shared.changed.notify_all();
                Ok(())
            }
        }
    }

    /// Block until every write submitted before this call has been processed
    pub fn wait_for_completion(&self, timeout: Duration) -> Result<()> {
        let started = Instant::now();
        let mut state = self.shared.lock()?;
        let target = state.submitted;

        while state.processed < target {
            let waited = started.elapsed();
            let Some(remaining) = timeout.checked_sub(waited).filter(|d| !d.is_zero()) else {
                return Err(PersistError::Timeout {
                    pending: target - state.processed,
                    waited,
                });
            };
            state = self
                .shared
                .changed
                .wait_timeout(state, remaining)
                .map_err(|_| PersistError::persistence("write queue lock poisoned"))?
                .0;
        }

        match &state.failure {
            Some(failure) => Err(PersistError::persistence(failure.clone())),
            None => Ok(()),
        }
    }

    pub fn stats(&self) -> Result<WriteStats> {
        Ok(self.shared.lock()?.stats())
    }

    /// Whether a failed write is blocking deltas.
    pub fn is_failed(&self) -> Result<bool> {
        Ok(self.shared.lock()?.failure.is_some())
    }
}

impl<B: PersistenceBackend + 'static> Drop for WriteQueue<B> {
    fn drop(&mut self) {
        if let Ok(mut state) = self.shared.state.lock() {
            state.shutdown = true;
            self.shared.changed.notify_all();
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("Writer thread panicked");
            }
        }
    }
}
