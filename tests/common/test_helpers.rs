//! Shared fakes for integration tests.

use async_trait::async_trait;
use logship::{Batch, Level, LogRecord, Metadata, Sink, SinkError};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Build a minimal valid record.
pub fn record(level: Level, message: &str) -> LogRecord {
    LogRecord::builder(level, message)
        .metadata(Metadata::new("svc", "test"))
        .build()
}

/// In-memory sink with scripted outcomes.
///
/// Each `send` pops the next scripted result; an empty script means success.
/// Delivered batches are recorded as message lists so tests can assert
/// content and ordering.
pub struct ScriptedSink {
    name: String,
    script: Mutex<VecDeque<Result<(), SinkError>>>,
    delivered: Mutex<Vec<Vec<String>>>,
    calls: AtomicUsize,
    flushes: AtomicUsize,
    closes: AtomicUsize,
    healthy: AtomicBool,
    send_delay: Mutex<Option<Duration>>,
    send_timeout: Mutex<Option<Duration>>,
}

impl ScriptedSink {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            delivered: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            closes: AtomicUsize::new(0),
            healthy: AtomicBool::new(true),
            send_delay: Mutex::new(None),
            send_timeout: Mutex::new(None),
        }
    }

    /// Queue an outcome for the next `send` call.
    pub fn push_result(&self, result: Result<(), SinkError>) {
        self.script.lock().unwrap().push_back(result);
    }

    /// Queue the same failure `n` times.
    pub fn fail_times(&self, n: usize, err: SinkError) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..n {
            script.push_back(Err(err.clone()));
        }
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        *self.send_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_send_timeout(&self, timeout: Duration) {
        *self.send_timeout.lock().unwrap() = Some(timeout);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn flushes(&self) -> usize {
        self.flushes.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Message lists of every successfully delivered batch.
    pub fn delivered(&self) -> Vec<Vec<String>> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl Sink for ScriptedSink {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, batch: &Batch) -> Result<(), SinkError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.send_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let scripted = self.script.lock().unwrap().pop_front();
        match scripted {
            Some(Err(err)) => Err(err),
            _ => {
                let messages = batch.records().iter().map(|r| r.message.clone()).collect();
                self.delivered.lock().unwrap().push(messages);
                Ok(())
            }
        }
    }

    async fn flush(&self) -> Result<(), SinkError> {
        self.flushes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), SinkError> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn check_health(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    fn send_timeout(&self) -> Option<Duration> {
        *self.send_timeout.lock().unwrap()
    }
}
