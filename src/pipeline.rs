//! The assembled pipeline: configuration in, a `log`/`flush`/`close` surface
//! out.
//!
//! Construction is the only place errors surface synchronously; once built,
//! nothing downstream of `log` can panic the host process. Must be built
//! inside a tokio runtime (the batch dispatcher and probe loop are tasks).

use crate::alert::AlertProvider;
use crate::batch::{BatchManager, Processor};
use crate::breaker::CircuitBreaker;
use crate::config::PipelineConfig;
use crate::error::{ConfigError, PipelineError};
use crate::handler::ErrorHandler;
use crate::health::{
    DispatchStatsSnapshot, FailoverDispatcher, HealthMonitor, HealthProbe, SinkHealthSnapshot,
};
use crate::rate_limit::ErrorRateLimiter;
use crate::record::LogRecord;
use crate::registry::ResourceRegistry;
use crate::serialize::Serializer;
use crate::sink::{ConsoleSink, Sink};
use crate::wrapper::TransportWrapper;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Builder for [`Pipeline`]. Sinks are supplied by the caller (the sink
/// crates construct them from their config sections); a console sink is
/// added automatically when none is registered, so a fallback of last
/// resort always exists.
pub struct PipelineBuilder {
    config: PipelineConfig,
    sinks: Vec<Arc<dyn Sink>>,
    alert_provider: Option<Arc<dyn AlertProvider>>,
    registry: Option<Arc<ResourceRegistry>>,
}

impl PipelineBuilder {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config, sinks: Vec::new(), alert_provider: None, registry: None }
    }

    pub fn sink(mut self, sink: Arc<dyn Sink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn alert_provider(mut self, provider: Arc<dyn AlertProvider>) -> Self {
        self.alert_provider = Some(provider);
        self
    }

    pub fn registry(mut self, registry: Arc<ResourceRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn build(self) -> Result<Pipeline, PipelineError> {
        let Self { config, mut sinks, alert_provider, registry } = self;
        config.validate()?;

        let masking = config.masking.to_config()?;
        let serializer = Serializer::new(masking);
        if !sinks.iter().any(|s| s.name() == ConsoleSink::NAME) {
            sinks.push(Arc::new(ConsoleSink::new(serializer.clone())));
        }

        let monitor = Arc::new(HealthMonitor::new(config.health.to_config()));
        let handler = match alert_provider {
            Some(provider) => ErrorHandler::new(provider),
            None => ErrorHandler::default(),
        };
        let rate_limiter = ErrorRateLimiter::new(config.max_errors_per_minute);
        let table = config.retry_table();
        let breaker_config = config.circuit.to_config();

        let mut wrappers: HashMap<String, Arc<TransportWrapper>> = HashMap::new();
        for sink in sinks {
            let name = sink.name().to_string();
            let wrapper = Arc::new(TransportWrapper::new(
                sink,
                table.policy_for(&name).clone(),
                CircuitBreaker::with_config(breaker_config),
                rate_limiter.clone(),
                handler.clone(),
                Arc::clone(&monitor),
            ));
            let probe: Arc<dyn HealthProbe> = wrapper.clone();
            monitor.register_probe(Arc::downgrade(&probe));
            wrappers.insert(name, wrapper);
        }

        // Every configured transport and every fallback chain entry must
        // resolve to a registered sink.
        let mut primary = None;
        for transport in config.enabled_transports() {
            if !wrappers.contains_key(&transport.name) {
                return Err(ConfigError::UnknownSink(transport.name.clone()).into());
            }
            if primary.is_none() {
                primary = Some(transport.name.clone());
            }
        }
        let primary = primary.ok_or(ConfigError::NoTransports)?;
        for name in &config.fallback.chain {
            if !wrappers.contains_key(name) {
                return Err(ConfigError::UnknownSink(name.clone()).into());
            }
        }

        let dispatcher = Arc::new(FailoverDispatcher::new(
            Arc::clone(&monitor),
            wrappers,
            config.fallback.to_config(),
        ));

        let processor: Processor = {
            let dispatcher = Arc::clone(&dispatcher);
            let primary = primary.clone();
            Arc::new(move |batch| {
                let dispatcher = Arc::clone(&dispatcher);
                let primary = primary.clone();
                Box::pin(async move { dispatcher.dispatch(&primary, &batch).await.map(|_| ()) })
            })
        };
        let manager = BatchManager::new(config.batch.to_config(), processor);

        monitor.start();

        Ok(Pipeline {
            config,
            manager,
            dispatcher,
            monitor,
            serializer,
            registry: registry.unwrap_or_default(),
            closed: AtomicBool::new(false),
        })
    }
}

/// The delivery pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    manager: BatchManager,
    dispatcher: Arc<FailoverDispatcher>,
    monitor: Arc<HealthMonitor>,
    serializer: Serializer,
    registry: Arc<ResourceRegistry>,
    closed: AtomicBool,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("pending", &self.manager.pending_count())
            .field("stats", &self.dispatcher.stats())
            .finish()
    }
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    /// Admit one record. Records below the configured minimum level are
    /// dropped silently; sink failures never surface here.
    pub fn log(&self, mut record: LogRecord) -> Result<(), PipelineError> {
        if record.level < self.config.level {
            return Ok(());
        }
        if record.performance.is_some() && !self.config.performance.should_sample() {
            record.performance = None;
        }
        self.manager.add(record)
    }

    /// Emit the current partial batch and wait for in-flight deliveries.
    pub async fn flush(&self) -> Result<(), PipelineError> {
        self.manager.flush().await
    }

    /// Drain and shut everything down: batch manager, sinks, probe loop,
    /// resource registry. Idempotent.
    pub async fn close(&self) -> Result<(), PipelineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let drain_result = self.manager.close().await;
        let flush_result = self.dispatcher.flush_all().await;
        self.dispatcher.close_all().await;
        self.monitor.stop();
        self.registry.drain();
        drain_result.and(flush_result)
    }

    pub fn pending_count(&self) -> usize {
        self.manager.pending_count()
    }

    pub fn is_healthy(&self) -> bool {
        self.manager.is_healthy()
    }

    pub fn health(&self, sink: &str) -> Option<SinkHealthSnapshot> {
        self.monitor.snapshot(sink)
    }

    pub fn stats(&self) -> DispatchStatsSnapshot {
        self.dispatcher.stats()
    }

    pub fn serializer(&self) -> &Serializer {
        &self.serializer
    }
}
