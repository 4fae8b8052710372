//! Event system for the probing engine.
//!
//! Provides hooks for metrics, logging, and custom reactions around attempt
//! and run activity.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;

use super::classifier::VerdictKind;
use super::metrics::MetricsCollector;

/// A sub-attempt is about to hit the transport.
#[derive(Debug, Clone)]
pub struct AttemptStartedEvent {
    pub run: String,
    pub sequence: usize,
    pub sub_attempt: u32,
    pub identity: String,
    pub timestamp: DateTime<Utc>,
}

/// A sub-attempt has been classified.
#[derive(Debug, Clone)]
pub struct AttemptFinishedEvent {
    pub run: String,
    pub sequence: usize,
    pub sub_attempt: u32,
    pub identity: String,
    pub verdict: VerdictKind,
    pub signal: Option<String>,
    pub status: Option<u16>,
    pub latency: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RetryEvent {
    pub run: String,
    pub sequence: usize,
    pub retry: u32,
    pub reason: String,
    pub scheduled_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CooldownEvent {
    pub identity: String,
    pub duration: Duration,
    pub forced: bool,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct PoolExhaustedEvent {
    pub run: String,
    pub sequence: usize,
    pub retry_after: Duration,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct RunFinishedEvent {
    pub run: String,
    pub attempts: usize,
    pub success_rate: f64,
    pub block_rate: f64,
    pub stop_reason: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum EngineEvent {
    AttemptStarted(AttemptStartedEvent),
    AttemptFinished(AttemptFinishedEvent),
    Retry(RetryEvent),
    Cooldown(CooldownEvent),
    PoolExhausted(PoolExhaustedEvent),
    RunFinished(RunFinishedEvent),
}

/// Trait implemented by event handlers.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &EngineEvent);
}

/// Dispatcher that broadcasts events to registered handlers.
#[derive(Clone, Default)]
pub struct EventDispatcher {
    handlers: Vec<Arc<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self { handlers: Vec::new() }
    }

    pub fn register_handler(&mut self, handler: Arc<dyn EventHandler>) {
        self.handlers.push(handler);
    }

    pub fn dispatch(&self, event: EngineEvent) {
        for handler in &self.handlers {
            handler.handle(&event);
        }
    }
}

/// Logs events using the `log` crate.
#[derive(Debug)]
pub struct LoggingHandler;

impl EventHandler for LoggingHandler {
    fn handle(&self, event: &EngineEvent) {
        match event {
            EngineEvent::AttemptStarted(started) => {
                log::trace!(
                    "[{}] -> #{}.{} via {}",
                    started.run,
                    started.sequence,
                    started.sub_attempt,
                    started.identity
                );
            }
            EngineEvent::AttemptFinished(finished) => {
                log::debug!(
                    "[{}] <- #{}.{} via {} -> {} {} ({:.2}s)",
                    finished.run,
                    finished.sequence,
                    finished.sub_attempt,
                    finished.identity,
                    finished.verdict,
                    finished.signal.as_deref().unwrap_or("-"),
                    finished.latency.as_secs_f64()
                );
            }
            EngineEvent::Retry(retry) => {
                log::info!(
                    "[{}] retry #{} ({}) after {:.2}s: {}",
                    retry.run,
                    retry.sequence,
                    retry.retry,
                    retry.scheduled_after.as_secs_f64(),
                    retry.reason
                );
            }
            EngineEvent::Cooldown(cooldown) => {
                log::warn!(
                    "identity {} benched for {:.0}s{}",
                    cooldown.identity,
                    cooldown.duration.as_secs_f64(),
                    if cooldown.forced { " (forced)" } else { "" }
                );
            }
            EngineEvent::PoolExhausted(exhausted) => {
                log::warn!(
                    "[{}] every identity is cooling down at #{} (next in {:.0}s)",
                    exhausted.run,
                    exhausted.sequence,
                    exhausted.retry_after.as_secs_f64()
                );
            }
            EngineEvent::RunFinished(run) => {
                log::info!(
                    "[{}] finished ({}) after {} attempts: success {:.1}%, blocked {:.1}%",
                    run.run,
                    run.stop_reason,
                    run.attempts,
                    run.success_rate * 100.0,
                    run.block_rate * 100.0
                );
            }
        }
    }
}

/// Metrics handler that feeds the metrics collector.
#[derive(Clone, Debug)]
pub struct MetricsHandler {
    metrics: MetricsCollector,
}

impl MetricsHandler {
    pub fn new(metrics: MetricsCollector) -> Self {
        Self { metrics }
    }
}

impl EventHandler for MetricsHandler {
    fn handle(&self, event: &EngineEvent) {
        if let EngineEvent::AttemptFinished(finished) = event {
            self.metrics
                .record_attempt(&finished.identity, finished.verdict, finished.status, finished.latency);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct CountingHandler(std::sync::Mutex<usize>);

    impl EventHandler for CountingHandler {
        fn handle(&self, _event: &EngineEvent) {
            *self.0.lock().unwrap() += 1;
        }
    }

    fn finished(identity: &str, verdict: VerdictKind) -> EngineEvent {
        EngineEvent::AttemptFinished(AttemptFinishedEvent {
            run: "delay_fixed_2s".into(),
            sequence: 0,
            sub_attempt: 0,
            identity: identity.into(),
            verdict,
            signal: None,
            status: Some(200),
            latency: Duration::from_millis(120),
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn dispatches_to_handlers() {
        let mut dispatcher = EventDispatcher::new();
        let counter = Arc::new(CountingHandler(std::sync::Mutex::new(0)));
        dispatcher.register_handler(counter.clone());
        dispatcher.register_handler(Arc::new(LoggingHandler));
        dispatcher.dispatch(EngineEvent::Cooldown(CooldownEvent {
            identity: "http://10.0.0.1:8080".into(),
            duration: Duration::from_secs(300),
            forced: false,
            timestamp: Utc::now(),
        }));
        assert_eq!(*counter.0.lock().unwrap(), 1);
    }

    #[test]
    fn metrics_handler_records_finished_attempts() {
        let metrics = MetricsCollector::new();
        let mut dispatcher = EventDispatcher::new();
        dispatcher.register_handler(Arc::new(MetricsHandler::new(metrics.clone())));

        dispatcher.dispatch(finished("direct", VerdictKind::Success));
        dispatcher.dispatch(finished("direct", VerdictKind::Blocked));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.global.total_attempts, 2);
        assert_eq!(snapshot.global.blocks, 1);
    }
}
