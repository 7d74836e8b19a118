//! Per-sink health tracking, the background probe loop, and failover
//! dispatch across an ordered chain of sinks.

use crate::error::{PipelineError, SinkError};
use crate::record::Batch;
use crate::wrapper::TransportWrapper;
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

/// Number of response-time samples retained per sink.
pub const RESPONSE_RING_SIZE: usize = 100;

/// Health monitor tuning.
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    pub check_interval: Duration,
    pub failure_threshold: usize,
    pub recovery_threshold: usize,
    pub probe_timeout: Duration,
    pub auto_recovery: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            failure_threshold: 3,
            recovery_threshold: 2,
            probe_timeout: Duration::from_secs(5),
            auto_recovery: true,
        }
    }
}

/// Anything the probe loop can ask "are you healthy?".
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn name(&self) -> &str;
    async fn probe(&self) -> bool;
}

#[derive(Debug)]
struct SinkHealth {
    healthy: bool,
    consecutive_failures: usize,
    consecutive_successes: usize,
    last_success: Option<Instant>,
    last_failure: Option<Instant>,
    response_times: VecDeque<Duration>,
}

impl Default for SinkHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_success: None,
            last_failure: None,
            response_times: VecDeque::with_capacity(RESPONSE_RING_SIZE),
        }
    }
}

/// Read-only view of one sink's health.
#[derive(Debug, Clone)]
pub struct SinkHealthSnapshot {
    pub healthy: bool,
    pub consecutive_failures: usize,
    pub consecutive_successes: usize,
    pub last_success: Option<Instant>,
    pub last_failure: Option<Instant>,
    pub average_response: Option<Duration>,
    pub samples: usize,
}

/// Tracks per-sink health from send outcomes and periodic probes. Holds only
/// weak references to the wrappers it watches; ownership stays with the
/// dispatcher.
pub struct HealthMonitor {
    config: HealthConfig,
    states: Mutex<HashMap<String, SinkHealth>>,
    probes: Mutex<HashMap<String, Weak<dyn HealthProbe>>>,
    probe_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor").field("config", &self.config).finish()
    }
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            states: Mutex::new(HashMap::new()),
            probes: Mutex::new(HashMap::new()),
            probe_task: Mutex::new(None),
        }
    }

    pub fn register_probe(&self, probe: Weak<dyn HealthProbe>) {
        if let Some(alive) = probe.upgrade() {
            self.probes
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(alive.name().to_string(), probe);
        }
    }

    pub fn unregister_probe(&self, name: &str) {
        self.probes.lock().unwrap_or_else(|p| p.into_inner()).remove(name);
    }

    /// Record a successful send or probe.
    pub fn record_success(&self, sink: &str, latency: Option<Duration>) {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        let state = states.entry(sink.to_string()).or_default();
        state.last_success = Some(Instant::now());
        state.consecutive_successes += 1;
        if self.config.auto_recovery {
            state.consecutive_failures = state.consecutive_failures.saturating_sub(1);
        } else {
            state.consecutive_failures = 0;
        }
        if let Some(latency) = latency {
            if state.response_times.len() == RESPONSE_RING_SIZE {
                state.response_times.pop_front();
            }
            state.response_times.push_back(latency);
        }
        let recovered = !state.healthy
            && (state.consecutive_successes >= self.config.recovery_threshold
                || (self.config.auto_recovery && state.consecutive_failures == 0));
        if recovered {
            state.healthy = true;
            tracing::info!(sink, "sink recovered");
        }
    }

    /// Record a failed send or probe.
    pub fn record_failure(&self, sink: &str) {
        let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        let state = states.entry(sink.to_string()).or_default();
        state.last_failure = Some(Instant::now());
        state.consecutive_successes = 0;
        state.consecutive_failures += 1;
        if state.healthy && state.consecutive_failures >= self.config.failure_threshold {
            state.healthy = false;
            tracing::warn!(
                sink,
                failures = state.consecutive_failures,
                "sink marked unhealthy"
            );
        }
    }

    /// A sink never seen is assumed healthy.
    pub fn is_healthy(&self, sink: &str) -> bool {
        self.states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(sink)
            .map(|s| s.healthy)
            .unwrap_or(true)
    }

    pub fn snapshot(&self, sink: &str) -> Option<SinkHealthSnapshot> {
        let states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        states.get(sink).map(|s| {
            let samples = s.response_times.len();
            let average_response = if samples == 0 {
                None
            } else {
                Some(s.response_times.iter().sum::<Duration>() / samples as u32)
            };
            SinkHealthSnapshot {
                healthy: s.healthy,
                consecutive_failures: s.consecutive_failures,
                consecutive_successes: s.consecutive_successes,
                last_success: s.last_success,
                last_failure: s.last_failure,
                average_response,
                samples,
            }
        })
    }

    /// Probe every watched sink once. Exposed so tests (and the loop) can
    /// drive cycles deterministically.
    pub async fn run_probe_cycle(&self) {
        let targets: Vec<Arc<dyn HealthProbe>> = {
            let mut probes = self.probes.lock().unwrap_or_else(|p| p.into_inner());
            probes.retain(|_, weak| weak.strong_count() > 0);
            probes.values().filter_map(Weak::upgrade).collect()
        };
        for target in targets {
            let started = Instant::now();
            let outcome = tokio::time::timeout(self.config.probe_timeout, target.probe())
                .await
                .unwrap_or(false);
            if outcome {
                self.record_success(target.name(), Some(started.elapsed()));
            } else {
                self.record_failure(target.name());
            }
        }
    }

    /// Start the background probe loop. Idempotent.
    pub fn start(self: &Arc<Self>) {
        let mut slot = self.probe_task.lock().unwrap_or_else(|p| p.into_inner());
        if slot.is_some() {
            return;
        }
        let monitor = Arc::clone(self);
        let interval = self.config.check_interval;
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            ticker.tick().await; // first tick fires immediately
            loop {
                ticker.tick().await;
                monitor.run_probe_cycle().await;
            }
        }));
    }

    /// Stop the probe loop. Idempotent.
    pub fn stop(&self) {
        if let Some(task) = self.probe_task.lock().unwrap_or_else(|p| p.into_inner()).take() {
            task.abort();
        }
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Failover tuning.
#[derive(Debug, Clone)]
pub struct FailoverConfig {
    pub enable: bool,
    pub chain: Vec<String>,
    pub max_depth: usize,
    pub send_timeout: Duration,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            enable: true,
            chain: vec!["console".to_string()],
            max_depth: 3,
            send_timeout: Duration::from_secs(10),
        }
    }
}

/// Outcome of one dispatch.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub sink_used: String,
    pub fallback_used: bool,
}

/// Dispatch counters.
#[derive(Debug, Default)]
pub struct DispatchStats {
    delivered: AtomicU64,
    dropped: AtomicU64,
    fallback_used: AtomicU64,
    failed_sends: AtomicU64,
}

/// Point-in-time view of [`DispatchStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchStatsSnapshot {
    pub delivered: u64,
    pub dropped: u64,
    pub fallback_used: u64,
    pub failed_sends: u64,
}

impl DispatchStats {
    pub fn snapshot(&self) -> DispatchStatsSnapshot {
        DispatchStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            fallback_used: self.fallback_used.load(Ordering::Relaxed),
            failed_sends: self.failed_sends.load(Ordering::Relaxed),
        }
    }
}

/// Routes a batch through the primary sink and, when it is degraded or
/// failing, down the configured fallback chain. Never reorders records
/// within a batch; a batch may land on a different sink than the primary.
pub struct FailoverDispatcher {
    monitor: Arc<HealthMonitor>,
    wrappers: HashMap<String, Arc<TransportWrapper>>,
    config: FailoverConfig,
    stats: DispatchStats,
}

impl FailoverDispatcher {
    pub fn new(
        monitor: Arc<HealthMonitor>,
        wrappers: HashMap<String, Arc<TransportWrapper>>,
        config: FailoverConfig,
    ) -> Self {
        Self { monitor, wrappers, config, stats: DispatchStats::default() }
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn wrappers(&self) -> impl Iterator<Item = &Arc<TransportWrapper>> {
        self.wrappers.values()
    }

    fn chain_for(&self, primary: &str) -> Vec<Arc<TransportWrapper>> {
        let mut names: Vec<&str> = vec![primary];
        if self.config.enable {
            for name in &self.config.chain {
                if names.len() > self.config.max_depth {
                    break;
                }
                if !names.contains(&name.as_str()) {
                    names.push(name);
                }
            }
        }
        names
            .into_iter()
            .filter_map(|name| {
                let found = self.wrappers.get(name).cloned();
                if found.is_none() {
                    tracing::warn!(sink = name, "fallback chain references unknown sink");
                }
                found
            })
            .collect()
    }

    /// Try each sink in the chain in order; unhealthy sinks are skipped
    /// unless they are the last resort.
    pub async fn dispatch(
        &self,
        primary: &str,
        batch: &Batch,
    ) -> Result<DispatchReport, PipelineError> {
        let chain = self.chain_for(primary);
        if chain.is_empty() {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(PipelineError::FailoverExhausted {
                chain_len: 0,
                source: SinkError::new(format!("no sink available for '{primary}'")),
            });
        }

        let last_index = chain.len() - 1;
        let mut last_error: Option<PipelineError> = None;
        for (index, wrapper) in chain.iter().enumerate() {
            let name = wrapper.name().to_string();
            if index < last_index && !self.monitor.is_healthy(&name) {
                tracing::debug!(sink = %name, "skipping unhealthy sink in failover chain");
                continue;
            }

            let outcome =
                match tokio::time::timeout(self.config.send_timeout, wrapper.send(batch)).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.monitor.record_failure(&name);
                        Err(PipelineError::Delivery {
                            sink: name.clone(),
                            attempts: 0,
                            source: SinkError::timeout(self.config.send_timeout),
                        })
                    }
                };

            match outcome {
                Ok(()) => {
                    let fallback_used = name != primary;
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                    if fallback_used {
                        self.stats.fallback_used.fetch_add(1, Ordering::Relaxed);
                        tracing::info!(primary, sink = %name, "batch delivered via fallback");
                    }
                    return Ok(DispatchReport { sink_used: name, fallback_used });
                }
                Err(err) => {
                    self.stats.failed_sends.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(sink = %name, error = %err, "sink failed in failover chain");
                    last_error = Some(err);
                }
            }
        }

        self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        let source = last_error
            .as_ref()
            .and_then(|e| e.sink_error().cloned())
            .unwrap_or_else(|| {
                SinkError::new(
                    last_error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "all sinks unavailable".to_string()),
                )
            });
        Err(PipelineError::FailoverExhausted { chain_len: chain.len(), source })
    }

    /// Close every wrapper in the chain. Used by the pipeline at shutdown.
    pub async fn close_all(&self) {
        for wrapper in self.wrappers.values() {
            wrapper.close().await;
        }
    }

    /// Flush every wrapper.
    pub async fn flush_all(&self) -> Result<(), PipelineError> {
        let mut first_err = None;
        for wrapper in self.wrappers.values() {
            if let Err(err) = wrapper.flush().await {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
