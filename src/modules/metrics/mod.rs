//! Metrics collection utilities.
//!
//! Aggregates global and per-identity attempt statistics with latency
//! percentiles. Survives across runs, so it reflects cumulative identity
//! health rather than a single configuration.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use super::classifier::VerdictKind;

/// Aggregated metrics across all identities.
#[derive(Debug, Clone)]
pub struct GlobalStats {
    pub started_at: DateTime<Utc>,
    pub total_attempts: u64,
    pub successes: u64,
    pub blocks: u64,
    pub transient_errors: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self {
            started_at: Utc::now(),
            total_attempts: 0,
            successes: 0,
            blocks: 0,
            transient_errors: 0,
            average_latency: None,
            p95_latency: None,
        }
    }
}

impl GlobalStats {
    pub fn block_rate(&self) -> f64 {
        if self.total_attempts == 0 {
            0.0
        } else {
            self.blocks as f64 / self.total_attempts as f64
        }
    }
}

/// Identity-scoped metrics snapshot.
#[derive(Debug, Clone)]
pub struct IdentityStats {
    pub identity: String,
    pub total_attempts: u64,
    pub successes: u64,
    pub blocks: u64,
    pub transient_errors: u64,
    pub average_latency: Option<Duration>,
    pub p95_latency: Option<Duration>,
    pub consecutive_failures: u32,
    pub last_status: Option<u16>,
}

impl IdentityStats {
    fn from_accumulator(identity: &str, acc: &IdentityAccumulator) -> Self {
        let (avg, p95) = latency_stats(acc.latencies.iter().copied());
        Self {
            identity: identity.to_string(),
            total_attempts: acc.total_attempts,
            successes: acc.successes,
            blocks: acc.blocks,
            transient_errors: acc.transient_errors,
            average_latency: avg,
            p95_latency: p95,
            consecutive_failures: acc.consecutive_failures,
            last_status: acc.last_status,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub global: GlobalStats,
    pub identities: Vec<IdentityStats>,
}

impl MetricsSnapshot {
    pub fn identity(&self, label: &str) -> Option<&IdentityStats> {
        self.identities.iter().find(|stats| stats.identity == label)
    }
}

#[derive(Debug)]
struct IdentityAccumulator {
    total_attempts: u64,
    successes: u64,
    blocks: u64,
    transient_errors: u64,
    latencies: VecDeque<Duration>,
    max_window: usize,
    consecutive_failures: u32,
    last_status: Option<u16>,
}

impl IdentityAccumulator {
    fn new(max_window: usize) -> Self {
        Self {
            total_attempts: 0,
            successes: 0,
            blocks: 0,
            transient_errors: 0,
            latencies: VecDeque::with_capacity(max_window),
            max_window,
            consecutive_failures: 0,
            last_status: None,
        }
    }

    fn record(&mut self, verdict: VerdictKind, status: Option<u16>, latency: Duration) {
        self.total_attempts += 1;
        if status.is_some() {
            self.last_status = status;
        }

        match verdict {
            VerdictKind::Success => {
                self.successes += 1;
                self.consecutive_failures = 0;
            }
            VerdictKind::Blocked => {
                self.blocks += 1;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
            VerdictKind::TransientError => {
                self.transient_errors += 1;
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
        }

        if self.latencies.len() == self.max_window {
            self.latencies.pop_front();
        }
        self.latencies.push_back(latency);
    }
}

fn latency_stats(samples: impl Iterator<Item = Duration>) -> (Option<Duration>, Option<Duration>) {
    let mut samples: Vec<_> = samples.collect();
    if samples.is_empty() {
        return (None, None);
    }
    samples.sort_unstable();
    let avg = samples.iter().map(|d| d.as_secs_f64()).sum::<f64>() / samples.len() as f64;
    let p95_index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
    (Some(Duration::from_secs_f64(avg)), Some(samples[p95_index]))
}

#[derive(Debug)]
struct MetricsState {
    global: GlobalStats,
    max_window: usize,
    identities: HashMap<String, IdentityAccumulator>,
}

impl MetricsState {
    fn new(max_window: usize) -> Self {
        Self {
            global: GlobalStats::default(),
            max_window,
            identities: HashMap::new(),
        }
    }

    fn accumulator_mut(&mut self, identity: &str) -> &mut IdentityAccumulator {
        self.identities
            .entry(identity.to_string())
            .or_insert_with(|| IdentityAccumulator::new(self.max_window))
    }
}

/// Thread-safe metrics collector shared by the runner and its handlers.
#[derive(Clone, Debug)]
pub struct MetricsCollector {
    inner: Arc<Mutex<MetricsState>>,
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self::with_window(128)
    }

    pub fn with_window(window: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(MetricsState::new(window.max(16)))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record_attempt(&self, identity: &str, verdict: VerdictKind, status: Option<u16>, latency: Duration) {
        let mut guard = self.lock();
        let global = &mut guard.global;
        global.total_attempts += 1;
        match verdict {
            VerdictKind::Success => global.successes += 1,
            VerdictKind::Blocked => global.blocks += 1,
            VerdictKind::TransientError => global.transient_errors += 1,
        }

        global.average_latency = Some(match global.average_latency {
            Some(avg) => Duration::from_secs_f64(avg.as_secs_f64() * 0.9 + latency.as_secs_f64() * 0.1),
            None => latency,
        });

        guard.accumulator_mut(identity).record(verdict, status, latency);

        let (_, p95) = latency_stats(
            guard
                .identities
                .values()
                .flat_map(|acc| acc.latencies.iter().copied()),
        );
        guard.global.p95_latency = p95;
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let guard = self.lock();
        let mut identities: Vec<_> = guard
            .identities
            .iter()
            .map(|(identity, acc)| IdentityStats::from_accumulator(identity, acc))
            .collect();
        identities.sort_by(|a, b| a.identity.cmp(&b.identity));
        MetricsSnapshot {
            global: guard.global.clone(),
            identities,
        }
    }

    pub fn reset(&self) {
        let mut guard = self.lock();
        let window = guard.max_window;
        *guard = MetricsState::new(window);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}
