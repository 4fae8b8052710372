//! Experiment runner.
//!
//! Drives the dispatcher through one named configuration and finalizes the
//! collected attempt records into a [`RunResult`]. The identity pool is
//! injected by the caller and shared across runs unless a configuration
//! asks for a reset.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, sleep, sleep_until, timeout};
use url::Url;

use super::record::{AttemptRecord, RunResult, StopReason};
use super::shutdown::StopListener;
use super::store::{ResultStore, StoreError};
use crate::config::{ConfigError, ConfigResult, ExperimentConfig};
use crate::dispatcher::{AttemptScope, DispatchError, DispatchOutcome, DispatchState, Dispatcher};
use crate::modules::classifier::{BlockClassifier, TransientCause, Verdict, VerdictKind};
use crate::modules::events::{
	EngineEvent, EventDispatcher, EventHandler, LoggingHandler, MetricsHandler, RunFinishedEvent,
};
use crate::modules::identity::IdentityPool;
use crate::modules::metrics::MetricsCollector;
use crate::modules::pacing::PacingController;
use crate::transport::{RequestSpec, Transport, TransportError, TransportMode, TransportRequest};

const UNASSIGNED_IDENTITY: &str = "unassigned";
const IDENTITY_CHECK_TIMEOUT: Duration = Duration::from_secs(10);

/// Outcome of one proxy liveness check.
#[derive(Debug, Clone, PartialEq)]
pub struct IdentityCheck {
	pub identity: String,
	/// Only a 200 counts.
	pub alive: bool,
	pub status: Option<u16>,
	pub latency: Duration,
	pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
	Idle,
	Running,
	Finalized,
}

impl fmt::Display for RunnerState {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			RunnerState::Idle => "idle",
			RunnerState::Running => "running",
			RunnerState::Finalized => "finalized",
		})
	}
}

#[derive(Debug, Error)]
pub enum SweepError {
	#[error(transparent)]
	Config(#[from] ConfigError),
	#[error(transparent)]
	Store(#[from] StoreError),
}

/// Everything an in-flight attempt needs; cheap to clone into tasks.
#[derive(Clone)]
struct RunContext {
	name: Arc<str>,
	pool: Arc<IdentityPool>,
	state: Arc<DispatchState>,
	dispatcher: Arc<Dispatcher>,
	request: Arc<RequestSpec>,
}

impl RunContext {
	async fn dispatch(&self, sequence: usize) -> Result<DispatchOutcome, DispatchError> {
		let scope = AttemptScope {
			run: &self.name,
			pool: &self.pool,
			state: &self.state,
		};
		self.dispatcher.attempt(&scope, &self.request, sequence).await
	}
}

/// Records accumulated while a run is in progress.
struct Progress {
	records: Vec<AttemptRecord>,
	dispatcher_failures: usize,
	consecutive_blocks: usize,
	stop_reason: StopReason,
}

impl Progress {
	fn new() -> Self {
		Self {
			records: Vec::new(),
			dispatcher_failures: 0,
			consecutive_blocks: 0,
			stop_reason: StopReason::Completed,
		}
	}

	fn absorb(&mut self, run: &str, sequence: usize, outcome: Result<DispatchOutcome, DispatchError>) {
		match outcome {
			Ok(outcome) => {
				let blocked = outcome
					.last()
					.is_some_and(|record| record.verdict() == VerdictKind::Blocked);
				if blocked {
					self.consecutive_blocks += 1;
				} else {
					self.consecutive_blocks = 0;
				}
				self.records.extend(outcome.records);
			}
			Err(err) => {
				log::warn!("[{run}] attempt #{sequence} failed: {err}");
				self.fail(sequence, TransientCause::TransportUnavailable, err.to_string());
			}
		}
	}

	fn fail(&mut self, sequence: usize, cause: TransientCause, error: String) {
		self.dispatcher_failures += 1;
		self.consecutive_blocks = 0;
		self.records.push(
			AttemptRecord::new(
				sequence,
				0,
				UNASSIGNED_IDENTITY,
				&Verdict::TransientError(cause),
				Duration::ZERO,
			)
			.with_error(error),
		);
	}

	fn should_stop_early(&self, limit: Option<usize>) -> bool {
		limit.is_some_and(|limit| self.consecutive_blocks >= limit)
	}
}

pub struct ExperimentRunner {
	classifier: Arc<BlockClassifier>,
	transports: HashMap<TransportMode, Arc<dyn Transport>>,
	timeout: Duration,
	direct_fallback: bool,
	stop: Option<StopListener>,
	events: EventDispatcher,
	metrics: MetricsCollector,
	state: RunnerState,
}

impl ExperimentRunner {
	/// Runner with logging and metrics handlers registered and no
	/// transport bound yet.
	pub fn new(classifier: BlockClassifier) -> Self {
		let metrics = MetricsCollector::new();
		let mut events = EventDispatcher::new();
		events.register_handler(Arc::new(LoggingHandler));
		events.register_handler(Arc::new(MetricsHandler::new(metrics.clone())));

		Self {
			classifier: Arc::new(classifier),
			transports: HashMap::new(),
			timeout: Duration::from_secs(30),
			direct_fallback: false,
			stop: None,
			events,
			metrics,
			state: RunnerState::Idle,
		}
	}

	pub fn with_transport(mut self, mode: TransportMode, transport: Arc<dyn Transport>) -> Self {
		self.transports.insert(mode, transport);
		self
	}

	pub fn with_timeout(mut self, timeout: Duration) -> Self {
		self.timeout = timeout;
		self
	}

	pub fn with_direct_fallback(mut self, enabled: bool) -> Self {
		self.direct_fallback = enabled;
		self
	}

	pub fn with_stop_signal(mut self, listener: StopListener) -> Self {
		self.stop = Some(listener);
		self
	}

	pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
		self.events.register_handler(handler);
		self
	}

	pub fn metrics(&self) -> &MetricsCollector {
		&self.metrics
	}

	pub fn state(&self) -> RunnerState {
		self.state
	}

	pub fn is_stopped(&self) -> bool {
		self.stop.as_ref().is_some_and(StopListener::is_stopped)
	}

	/// Run one configuration to completion, early stop, cancellation or
	/// deadline. Configuration errors are reported before any attempt.
	pub async fn run(
		&mut self,
		pool: Arc<IdentityPool>,
		config: &ExperimentConfig,
		request: &RequestSpec,
	) -> ConfigResult<RunResult> {
		config.validate()?;
		config.validate_for_pool(&pool)?;
		let transport = self
			.transports
			.get(&config.transport)
			.cloned()
			.ok_or_else(|| ConfigError::TransportUnavailable {
				experiment: config.name.clone(),
				mode: config.transport,
			})?;
		let request = match &config.user_agent {
			Some(user_agent) => request
				.clone()
				.with_user_agent(user_agent)
				.map_err(|_| ConfigError::InvalidHeader("user-agent".into()))?,
			None => request.clone(),
		};

		if self.state == RunnerState::Finalized {
			self.state = RunnerState::Idle;
		}
		if config.reset_pool {
			pool.reset();
		}
		self.state = RunnerState::Running;

		log::info!(
			"[{}] starting {} attempts: pacing {}, retry {} (budget {}), rotation {}, parallelism {}",
			config.name,
			config.attempts,
			config.pacing,
			config.retry,
			config.retry_budget,
			config.rotation,
			config.parallelism
		);

		let dispatcher = Dispatcher::new(
			transport,
			Arc::clone(&self.classifier),
			config.dispatch_config(self.timeout, self.direct_fallback),
		)
		.with_events(Arc::new(self.events.clone()));
		let context = RunContext {
			name: Arc::from(config.name.as_str()),
			pool,
			state: Arc::new(DispatchState::new()),
			dispatcher: Arc::new(dispatcher),
			request: Arc::new(request),
		};

		let started_at = Utc::now();
		let deadline = config.max_duration.map(|limit| Instant::now() + limit);
		let progress = if config.parallelism <= 1 {
			self.run_sequential(&context, config, deadline).await
		} else {
			self.run_concurrent(&context, config, deadline).await
		};

		let result = RunResult::finalize(
			config.clone(),
			started_at,
			progress.stop_reason,
			progress.dispatcher_failures,
			progress.records,
		);
		self.state = RunnerState::Finalized;

		let summary = result.summary();
		self.events.dispatch(EngineEvent::RunFinished(RunFinishedEvent {
			run: config.name.clone(),
			attempts: summary.total_attempts,
			success_rate: summary.success_rate,
			block_rate: summary.block_rate,
			stop_reason: result.stop_reason().to_string(),
			timestamp: Utc::now(),
		}));
		Ok(result)
	}

	async fn run_sequential(
		&self,
		context: &RunContext,
		config: &ExperimentConfig,
		deadline: Option<Instant>,
	) -> Progress {
		let mut progress = Progress::new();
		let mut pacing = PacingController::new(config.pacing.clone());
		let mut stop = self.stop.clone();

		for index in 0..config.attempts {
			if let Some(reason) = interruption(stop.as_ref(), deadline) {
				progress.stop_reason = reason;
				break;
			}
			tokio::select! {
				reason = interrupted(stop.as_mut(), deadline) => {
					progress.stop_reason = reason;
					break;
				}
				_ = pacing.wait(index) => {}
			}

			let outcome = context.dispatch(index).await;
			progress.absorb(&context.name, index, outcome);

			if progress.should_stop_early(config.early_stop_after) {
				log::info!(
					"[{}] stopping after {} consecutive blocks",
					context.name,
					progress.consecutive_blocks
				);
				progress.stop_reason = StopReason::EarlyStop;
				break;
			}
		}

		progress
	}

	/// Up to `parallelism` attempts in flight. Sequence numbers follow
	/// submission order; a stop lets in-flight attempts finish.
	async fn run_concurrent(
		&self,
		context: &RunContext,
		config: &ExperimentConfig,
		deadline: Option<Instant>,
	) -> Progress {
		let mut progress = Progress::new();
		let mut pacing = PacingController::new(config.pacing.clone());
		let mut stop = self.stop.clone();
		let permits = Arc::new(Semaphore::new(config.parallelism));
		let mut tasks = JoinSet::new();
		let mut in_flight: BTreeSet<usize> = BTreeSet::new();

		for index in 0..config.attempts {
			if let Some(reason) = interruption(stop.as_ref(), deadline) {
				progress.stop_reason = reason;
				break;
			}
			tokio::select! {
				reason = interrupted(stop.as_mut(), deadline) => {
					progress.stop_reason = reason;
					break;
				}
				_ = pacing.wait(index) => {}
			}

			let permit = tokio::select! {
				reason = interrupted(stop.as_mut(), deadline) => {
					progress.stop_reason = reason;
					break;
				}
				permit = Arc::clone(&permits).acquire_owned() => permit,
			};
			let Ok(permit) = permit else {
				break;
			};

			let task_context = context.clone();
			in_flight.insert(index);
			tasks.spawn(async move {
				let _permit = permit;
				(index, task_context.dispatch(index).await)
			});

			while let Some(joined) = tasks.try_join_next() {
				collect(&mut progress, &mut in_flight, &context.name, joined);
			}
			if progress.should_stop_early(config.early_stop_after) {
				progress.stop_reason = StopReason::EarlyStop;
				break;
			}
		}

		while let Some(joined) = tasks.join_next().await {
			collect(&mut progress, &mut in_flight, &context.name, joined);
		}
		for sequence in in_flight {
			progress.fail(sequence, TransientCause::Transport, "attempt task failed".to_string());
		}

		progress
	}

	/// Run each configuration in order and persist every result. All
	/// configurations are validated before the first attempt.
	pub async fn run_sweep(
		&mut self,
		pool: Arc<IdentityPool>,
		configs: &[ExperimentConfig],
		request: &RequestSpec,
		store: &mut dyn ResultStore,
		pause: Duration,
	) -> Result<Vec<RunResult>, SweepError> {
		for config in configs {
			config.validate()?;
			config.validate_for_pool(&pool)?;
		}

		let mut results = Vec::with_capacity(configs.len());
		for (position, config) in configs.iter().enumerate() {
			if self.is_stopped() {
				log::warn!("sweep interrupted before '{}'", config.name);
				break;
			}
			if position > 0 && !self.cool_down(pause).await {
				break;
			}

			let result = self.run(Arc::clone(&pool), config, request).await?;
			store.persist(&result)?;
			results.push(result);
		}
		Ok(results)
	}

	/// Sleep between runs; returns `false` when interrupted.
	pub async fn cool_down(&self, pause: Duration) -> bool {
		if pause.is_zero() {
			return !self.is_stopped();
		}
		log::info!("cooling down for {:.0}s", pause.as_secs_f64());
		let mut stop = self.stop.clone();
		tokio::select! {
			_ = interrupted(stop.as_mut(), None) => false,
			_ = sleep(pause) => true,
		}
	}

	/// Fetch `url` once through every proxy that is not cooling down, all at
	/// once, and report each outcome to the pool: a 200 seeds the identity's
	/// latency, anything else counts as a failure towards its cooldown.
	pub async fn check_identities(&self, pool: &Arc<IdentityPool>, url: &Url) -> Vec<IdentityCheck> {
		let Some(transport) = self.transports.get(&TransportMode::Http).cloned() else {
			log::warn!("no http transport bound, skipping identity check");
			return Vec::new();
		};
		let request = Arc::new(RequestSpec::get(url.clone()));
		let body_limit = self.classifier.config().body_sample_limit;

		let mut tasks = JoinSet::new();
		for identity in pool.proxies() {
			if pool.snapshot(identity.id).is_some_and(|snapshot| snapshot.is_cooling_down()) {
				log::debug!("skipping check of {}: cooling down", identity.label);
				continue;
			}
			let transport = Arc::clone(&transport);
			let request = Arc::clone(&request);
			tasks.spawn(async move {
				let fetch = TransportRequest::new(&request, identity.address.as_ref(), IDENTITY_CHECK_TIMEOUT)
					.with_body_limit(body_limit);
				let started = Instant::now();
				let outcome = timeout(IDENTITY_CHECK_TIMEOUT, transport.fetch(&fetch))
					.await
					.unwrap_or(Err(TransportError::Timeout(IDENTITY_CHECK_TIMEOUT)));
				(identity, outcome.map(|response| response.status), started.elapsed())
			});
		}

		let mut checked = Vec::new();
		while let Some(joined) = tasks.join_next().await {
			match joined {
				Ok(outcome) => checked.push(outcome),
				Err(err) => log::error!("identity check task failed: {err}"),
			}
		}
		checked.sort_by_key(|(identity, _, _)| identity.id);

		let mut checks = Vec::with_capacity(checked.len());
		for (identity, outcome, latency) in checked {
			let (status, error) = match outcome {
				Ok(status) => (Some(status), None),
				Err(err) => (None, Some(err.to_string())),
			};
			let alive = status == Some(200);
			let verdict = if alive {
				VerdictKind::Success
			} else {
				VerdictKind::TransientError
			};
			let cooldown = pool.report(identity.id, verdict, latency);

			if alive {
				log::info!("{} is working ({:.2}s)", identity.label, latency.as_secs_f64());
			} else {
				log::warn!(
					"{} failed its check: {}",
					identity.label,
					error.as_deref().map_or_else(|| format!("status {status:?}"), str::to_string)
				);
			}
			if let Some(duration) = cooldown {
				log::warn!("{} cooling down for {:.0}s", identity.label, duration.as_secs_f64());
			}
			checks.push(IdentityCheck {
				identity: identity.label,
				alive,
				status,
				latency,
				error,
			});
		}

		let working = checks.iter().filter(|check| check.alive).count();
		log::info!("identity check: {working}/{} proxies working", checks.len());
		checks
	}
}

fn collect(
	progress: &mut Progress,
	in_flight: &mut BTreeSet<usize>,
	run: &str,
	joined: Result<(usize, Result<DispatchOutcome, DispatchError>), JoinError>,
) {
	match joined {
		Ok((sequence, outcome)) => {
			in_flight.remove(&sequence);
			progress.absorb(run, sequence, outcome);
		}
		Err(err) => log::error!("[{run}] attempt task failed: {err}"),
	}
}

fn interruption(stop: Option<&StopListener>, deadline: Option<Instant>) -> Option<StopReason> {
	if stop.is_some_and(StopListener::is_stopped) {
		Some(StopReason::Cancelled)
	} else if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
		Some(StopReason::Deadline)
	} else {
		None
	}
}

async fn interrupted(stop: Option<&mut StopListener>, deadline: Option<Instant>) -> StopReason {
	let cancelled = async {
		match stop {
			Some(listener) => listener.stopped().await,
			None => std::future::pending().await,
		}
	};
	let expired = async {
		match deadline {
			Some(deadline) => sleep_until(deadline).await,
			None => std::future::pending().await,
		}
	};
	tokio::select! {
		_ = cancelled => StopReason::Cancelled,
		_ = expired => StopReason::Deadline,
	}
}
