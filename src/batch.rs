//! Record buffering and batch emission.
//!
//! The batch manager buffers records until a size or age trigger fires, then
//! hands the batch to the processor exactly once. A dispatcher task invokes
//! processors in emission order; a semaphore bounds how many run at once.
//! `add` never performs I/O and fails fast when the pending cap is reached.

use crate::error::PipelineError;
use crate::record::{Batch, LogRecord};
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify, Semaphore};

/// Batch manager tuning.
#[derive(Debug, Clone, Copy)]
pub struct BatchConfig {
    pub max_size: usize,
    pub timeout: Duration,
    pub max_concurrency: usize,
    pub max_queue_size: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_size: 100,
            timeout: Duration::from_secs(5),
            max_concurrency: 4,
            max_queue_size: 10_000,
        }
    }
}

/// Processor callback invoked once per emitted batch.
pub type Processor =
    Arc<dyn Fn(Batch) -> BoxFuture<'static, Result<(), PipelineError>> + Send + Sync>;

const MAX_STORED_FAILURES: usize = 64;

struct BufferState {
    records: Vec<LogRecord>,
    oldest_at: Option<Instant>,
    // Bumped on every emission; invalidates the batch timer.
    generation: u64,
    failures: Vec<PipelineError>,
}

struct Inner {
    config: BatchConfig,
    state: Mutex<BufferState>,
    batch_tx: Mutex<Option<mpsc::UnboundedSender<Batch>>>,
    pending: AtomicUsize,
    closed: AtomicBool,
    overflowed: AtomicBool,
    settled: Notify,
}

impl Inner {
    /// Take the current buffer and queue it for processing. Caller must not
    /// hold the state lock.
    fn emit_current(&self) {
        let batch = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if state.records.is_empty() {
                return;
            }
            state.generation += 1;
            state.oldest_at = None;
            Batch::new(std::mem::take(&mut state.records))
        };
        self.enqueue(batch);
    }

    fn enqueue(&self, batch: Batch) {
        let tx = self.batch_tx.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(tx) = tx.as_ref() {
            if tx.send(batch).is_err() {
                tracing::error!("batch dispatcher is gone; records dropped");
            }
        }
    }

    fn record_failure(&self, err: PipelineError) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.failures.len() < MAX_STORED_FAILURES {
            state.failures.push(err);
        }
    }
}

/// Buffers records and releases bounded batches to a processor.
pub struct BatchManager {
    inner: Arc<Inner>,
    processor: Processor,
}

impl std::fmt::Debug for BatchManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchManager")
            .field("config", &self.inner.config)
            .field("pending", &self.pending_count())
            .finish()
    }
}

impl BatchManager {
    pub fn new(config: BatchConfig, processor: Processor) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let inner = Arc::new(Inner {
            config,
            state: Mutex::new(BufferState {
                records: Vec::new(),
                oldest_at: None,
                generation: 0,
                failures: Vec::new(),
            }),
            batch_tx: Mutex::new(Some(tx)),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            overflowed: AtomicBool::new(false),
            settled: Notify::new(),
        });
        let manager = Self { inner: Arc::clone(&inner), processor: Arc::clone(&processor) };
        manager.spawn_dispatcher(rx);
        manager
    }

    /// Dispatcher: pops batches in emission order and runs the processor,
    /// never more than `max_concurrency` at a time.
    fn spawn_dispatcher(&self, mut rx: mpsc::UnboundedReceiver<Batch>) {
        let inner = Arc::clone(&self.inner);
        let processor = Arc::clone(&self.processor);
        let semaphore = Arc::new(Semaphore::new(self.inner.config.max_concurrency));
        tokio::spawn(async move {
            while let Some(batch) = rx.recv().await {
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let inner = Arc::clone(&inner);
                let processor = Arc::clone(&processor);
                tokio::spawn(async move {
                    let size = batch.len();
                    let result = processor(batch).await;
                    if let Err(err) = result {
                        inner.record_failure(err);
                    }
                    inner.pending.fetch_sub(size, Ordering::AcqRel);
                    inner.settled.notify_waiters();
                    drop(permit);
                });
            }
        });
    }

    /// Queue one record. Fails fast with `QueueFull` at the pending cap,
    /// `Closed` after shutdown, `Validation` for records breaking their
    /// invariants. Never waits on sink I/O.
    pub fn add(&self, record: LogRecord) -> Result<(), PipelineError> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(PipelineError::Closed);
        }
        record.validate().map_err(PipelineError::Validation)?;

        let prior = self.inner.pending.fetch_add(1, Ordering::AcqRel);
        if prior >= self.inner.config.max_queue_size {
            self.inner.pending.fetch_sub(1, Ordering::AcqRel);
            self.inner.overflowed.store(true, Ordering::Release);
            return Err(PipelineError::QueueFull {
                pending: prior + 1,
                max: self.inner.config.max_queue_size,
            });
        }

        let emit_now = {
            let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
            state.records.push(record);
            if state.records.len() == 1 {
                state.oldest_at = Some(Instant::now());
                self.spawn_batch_timer(state.generation);
            }
            state.records.len() >= self.inner.config.max_size
        };
        if emit_now {
            self.inner.emit_current();
        }
        Ok(())
    }

    /// One timer per open batch: fires when the oldest record has been
    /// buffered for the configured timeout. Emission elsewhere bumps the
    /// generation and turns the timer into a no-op.
    fn spawn_batch_timer(&self, generation: u64) {
        let inner = Arc::clone(&self.inner);
        let timeout = self.inner.config.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = {
                let state = inner.state.lock().unwrap_or_else(|p| p.into_inner());
                state.generation == generation && state.oldest_at.is_some()
            };
            if expired {
                inner.emit_current();
            }
        });
    }

    /// Emit the current partial batch and wait for every in-flight batch to
    /// resolve. The first processor failure observed since the previous
    /// flush is returned.
    pub async fn flush(&self) -> Result<(), PipelineError> {
        self.inner.emit_current();
        loop {
            let settled = self.inner.settled.notified();
            if self.inner.pending.load(Ordering::Acquire) == 0 {
                break;
            }
            settled.await;
        }
        let failure = {
            let mut state = self.inner.state.lock().unwrap_or_else(|p| p.into_inner());
            let mut failures = std::mem::take(&mut state.failures);
            if failures.is_empty() {
                None
            } else {
                Some(failures.remove(0))
            }
        };
        match failure {
            Some(err) => Err(err),
            None => {
                self.inner.overflowed.store(false, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Drain and shut down. Idempotent; subsequent `add` calls fail with
    /// `Closed`.
    pub async fn close(&self) -> Result<(), PipelineError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = self.flush().await;
        // Dropping the sender ends the dispatcher once the queue drains.
        self.inner.batch_tx.lock().unwrap_or_else(|p| p.into_inner()).take();
        result
    }

    /// Records admitted but not yet resolved by a processor.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.load(Ordering::Acquire)
    }

    /// False while closing or after an overflow that has not been cleared by
    /// a clean flush.
    pub fn is_healthy(&self) -> bool {
        !self.inner.closed.load(Ordering::Acquire)
            && !self.inner.overflowed.load(Ordering::Acquire)
    }
}
