//! Attempt dispatch.
//!
//! Binds each top-level attempt to an identity, fetches through the
//! configured transport, classifies the response and feeds the verdict back
//! into the identity pool. Failed sub-attempts are retried according to the
//! run's [`RetryPolicy`]; every sub-attempt is returned as its own record.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::Utc;
use http::header::{HeaderValue, USER_AGENT};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::{Instant, sleep, timeout};

use crate::experiments::record::AttemptRecord;
use crate::modules::classifier::{
	BlockClassifier, LatencyBaseline, LatencyTracker, ResponseView, TransientCause, Verdict,
};
use crate::modules::events::{
	AttemptFinishedEvent, AttemptStartedEvent, CooldownEvent, EngineEvent, EventDispatcher,
	PoolExhaustedEvent, RetryEvent,
};
use crate::modules::identity::{IdentityId, IdentityPool, PoolError, SelectedIdentity};
use crate::transport::{RequestSpec, SessionMode, Transport, TransportError, TransportRequest};

const UNASSIGNED_IDENTITY: &str = "unassigned";

/// How identities are chosen across top-level attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationMode {
	/// Fresh selection for every attempt.
	#[default]
	Enabled,
	/// Always the direct connection.
	Disabled,
	/// Keep the current identity until it fails.
	OnBlockOnly,
}

impl fmt::Display for RotationMode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			RotationMode::Enabled => "enabled",
			RotationMode::Disabled => "disabled",
			RotationMode::OnBlockOnly => "on-block-only",
		})
	}
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum RetryPolicyError {
	#[error("retry delay must be a finite, non-negative number of seconds (got {0})")]
	InvalidDelay(f64),
	#[error("backoff cap {cap}s is below its base {base}s")]
	InvertedBackoff { base: f64, cap: f64 },
}

/// What to do after a blocked or transient sub-attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RetryPolicy {
	None,
	Immediate,
	FixedDelay { secs: f64 },
	/// `min(base * 2^retry, cap)` seconds.
	ExponentialBackoff { base_secs: f64, cap_secs: f64 },
	/// Bench the failing identity, then retry at once on another one.
	RotateAndRetry,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		RetryPolicy::FixedDelay { secs: 5.0 }
	}
}

impl RetryPolicy {
	pub fn validate(&self) -> Result<(), RetryPolicyError> {
		let check = |secs: f64| {
			if secs.is_finite() && secs >= 0.0 {
				Ok(())
			} else {
				Err(RetryPolicyError::InvalidDelay(secs))
			}
		};
		match *self {
			RetryPolicy::FixedDelay { secs } => check(secs),
			RetryPolicy::ExponentialBackoff { base_secs, cap_secs } => {
				check(base_secs)?;
				check(cap_secs)?;
				if cap_secs < base_secs {
					return Err(RetryPolicyError::InvertedBackoff {
						base: base_secs,
						cap: cap_secs,
					});
				}
				Ok(())
			}
			_ => Ok(()),
		}
	}

	pub fn allows_retry(&self) -> bool {
		!matches!(self, RetryPolicy::None)
	}

	/// Delay before retry number `retry` (0-based).
	pub fn delay_for(&self, retry: u32) -> Duration {
		let secs = match *self {
			RetryPolicy::None | RetryPolicy::Immediate | RetryPolicy::RotateAndRetry => 0.0,
			RetryPolicy::FixedDelay { secs } => secs,
			RetryPolicy::ExponentialBackoff { base_secs, cap_secs } => {
				(base_secs * 2f64.powi(retry.min(62) as i32)).min(cap_secs)
			}
		};
		Duration::try_from_secs_f64(secs).unwrap_or_default()
	}
}

impl fmt::Display for RetryPolicy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			RetryPolicy::None => f.write_str("none"),
			RetryPolicy::Immediate => f.write_str("immediate"),
			RetryPolicy::FixedDelay { secs } => write!(f, "fixed-delay({secs}s)"),
			RetryPolicy::ExponentialBackoff { base_secs, cap_secs } => {
				write!(f, "exponential-backoff({base_secs}s, cap {cap_secs}s)")
			}
			RetryPolicy::RotateAndRetry => f.write_str("rotate-and-retry"),
		}
	}
}

/// Per-run dispatch settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchConfig {
	pub retry_policy: RetryPolicy,
	/// Retries allowed per top-level attempt.
	pub retry_budget: u32,
	pub rotation: RotationMode,
	/// Use the direct connection when every proxy is cooling down.
	pub direct_fallback: bool,
	pub timeout: Duration,
	pub session: SessionMode,
	/// One is drawn at random for every top-level attempt; retries keep it.
	pub user_agents: Vec<HeaderValue>,
}

impl Default for DispatchConfig {
	fn default() -> Self {
		Self {
			retry_policy: RetryPolicy::default(),
			retry_budget: 3,
			rotation: RotationMode::Enabled,
			direct_fallback: false,
			timeout: Duration::from_secs(30),
			session: SessionMode::Persistent,
			user_agents: Vec::new(),
		}
	}
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DispatchError {
	#[error("no identity available and direct fallback is disabled (next identity in {retry_after:?})")]
	TransportUnavailable { retry_after: Duration },
}

/// Run-scoped state shared by every attempt of one run.
#[derive(Debug, Default)]
pub struct DispatchState {
	latency: Mutex<LatencyTracker>,
	sticky: Mutex<Option<IdentityId>>,
}

impl DispatchState {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn baseline(&self) -> LatencyBaseline {
		self.latency.lock().unwrap_or_else(PoisonError::into_inner).baseline()
	}

	fn record_latency(&self, latency: Duration) {
		self.latency
			.lock()
			.unwrap_or_else(PoisonError::into_inner)
			.record(latency);
	}

	fn sticky(&self) -> Option<IdentityId> {
		*self.sticky.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn set_sticky(&self, id: Option<IdentityId>) {
		*self.sticky.lock().unwrap_or_else(PoisonError::into_inner) = id;
	}
}

/// Borrowed context for one attempt; nothing here outlives the call.
#[derive(Clone, Copy)]
pub struct AttemptScope<'a> {
	pub run: &'a str,
	pub pool: &'a IdentityPool,
	pub state: &'a DispatchState,
}

/// Every sub-attempt of one top-level attempt, in order.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
	pub records: Vec<AttemptRecord>,
}

impl DispatchOutcome {
	/// The record of the last sub-attempt.
	pub fn last(&self) -> Option<&AttemptRecord> {
		self.records.last()
	}
}

enum Selection {
	Identity(SelectedIdentity),
	Exhausted(Duration),
}

pub struct Dispatcher {
	transport: Arc<dyn Transport>,
	classifier: Arc<BlockClassifier>,
	config: DispatchConfig,
	events: Arc<EventDispatcher>,
}

impl Dispatcher {
	pub fn new(transport: Arc<dyn Transport>, classifier: Arc<BlockClassifier>, config: DispatchConfig) -> Self {
		Self {
			transport,
			classifier,
			config,
			events: Arc::new(EventDispatcher::new()),
		}
	}

	pub fn with_events(mut self, events: Arc<EventDispatcher>) -> Self {
		self.events = events;
		self
	}

	pub fn config(&self) -> &DispatchConfig {
		&self.config
	}

	/// Run one top-level attempt, retries included.
	///
	/// Classification outcomes never surface as errors. The only failure is
	/// an exhausted pool on the first sub-attempt with no direct fallback.
	pub async fn attempt(
		&self,
		scope: &AttemptScope<'_>,
		request: &RequestSpec,
		sequence: usize,
	) -> Result<DispatchOutcome, DispatchError> {
		let mut records: Vec<AttemptRecord> = Vec::new();
		let mut sub_attempt: u32 = 0;
		let mut excluded: Option<IdentityId> = None;

		let user_agent = self.config.user_agents.choose(&mut rand::thread_rng()).cloned();
		let rotated;
		let request = match user_agent {
			Some(user_agent) => {
				rotated = request.clone().with_header(USER_AGENT, user_agent);
				&rotated
			}
			None => request,
		};

		loop {
			let identity = match self.select_identity(scope, excluded) {
				Selection::Identity(identity) => identity,
				Selection::Exhausted(retry_after) => {
					self.events.dispatch(EngineEvent::PoolExhausted(PoolExhaustedEvent {
						run: scope.run.to_string(),
						sequence,
						retry_after,
						timestamp: Utc::now(),
					}));

					if self.config.direct_fallback {
						scope.pool.direct()
					} else if records.is_empty() {
						return Err(DispatchError::TransportUnavailable { retry_after });
					} else {
						records.push(AttemptRecord::new(
							sequence,
							sub_attempt,
							UNASSIGNED_IDENTITY,
							&Verdict::TransientError(TransientCause::PoolExhausted),
							Duration::ZERO,
						));
						break;
					}
				}
			};

			let record = self.fetch_once(scope, request, &identity, sequence, sub_attempt).await;
			let failed = record.signal().is_some();
			records.push(record);

			if !failed || !self.config.retry_policy.allows_retry() || sub_attempt >= self.config.retry_budget {
				break;
			}

			if self.config.retry_policy == RetryPolicy::RotateAndRetry {
				if let Some(duration) = scope.pool.force_cooldown(identity.id) {
					self.emit_cooldown(&identity, duration, true);
				}
				excluded = Some(identity.id);
			}

			let delay = self.config.retry_policy.delay_for(sub_attempt);
			self.events.dispatch(EngineEvent::Retry(RetryEvent {
				run: scope.run.to_string(),
				sequence,
				retry: sub_attempt + 1,
				reason: records
					.last()
					.and_then(AttemptRecord::signal)
					.unwrap_or_default()
					.to_string(),
				scheduled_after: delay,
				timestamp: Utc::now(),
			}));
			if !delay.is_zero() {
				sleep(delay).await;
			}
			sub_attempt += 1;
		}

		Ok(DispatchOutcome { records })
	}

	fn select_identity(&self, scope: &AttemptScope<'_>, excluded: Option<IdentityId>) -> Selection {
		let selected = match self.config.rotation {
			RotationMode::Disabled => return Selection::Identity(scope.pool.direct()),
			RotationMode::Enabled => scope.pool.select_excluding(excluded),
			RotationMode::OnBlockOnly => {
				let kept = scope
					.state
					.sticky()
					.filter(|id| Some(*id) != excluded)
					.and_then(|id| scope.pool.acquire(id));
				match kept {
					Some(identity) => Ok(identity),
					None => scope.pool.select_excluding(excluded).inspect(|identity| {
						scope.state.set_sticky(Some(identity.id));
					}),
				}
			}
		};

		match selected {
			Ok(identity) => Selection::Identity(identity),
			Err(PoolError::Exhausted { retry_after }) => Selection::Exhausted(retry_after),
		}
	}

	async fn fetch_once(
		&self,
		scope: &AttemptScope<'_>,
		request: &RequestSpec,
		identity: &SelectedIdentity,
		sequence: usize,
		sub_attempt: u32,
	) -> AttemptRecord {
		self.events.dispatch(EngineEvent::AttemptStarted(AttemptStartedEvent {
			run: scope.run.to_string(),
			sequence,
			sub_attempt,
			identity: identity.label.clone(),
			timestamp: Utc::now(),
		}));

		let transport_request = TransportRequest::new(request, identity.address.as_ref(), self.config.timeout)
			.with_session(self.config.session)
			.with_body_limit(self.classifier.config().body_sample_limit);

		let started = Instant::now();
		let outcome = timeout(self.config.timeout, self.transport.fetch(&transport_request))
			.await
			.unwrap_or(Err(TransportError::Timeout(self.config.timeout)));
		let latency = started.elapsed();

		let record = match outcome {
			Ok(response) => {
				let view =
					ResponseView::new(response.status, &response.body, latency).with_body_size(response.body_size);
				let verdict = self.classifier.classify(&view, scope.state.baseline());
				AttemptRecord::new(sequence, sub_attempt, identity.label.as_str(), &verdict, latency)
					.with_status(response.status)
					.with_response_size(view.body_size)
					.with_user_agent(request.user_agent())
			}
			Err(err) => {
				let verdict = self.classifier.classify_error(&err);
				AttemptRecord::new(sequence, sub_attempt, identity.label.as_str(), &verdict, latency)
					.with_error(err.to_string())
					.with_user_agent(request.user_agent())
			}
		};

		let verdict = record.verdict();
		if record.signal().is_none() {
			scope.state.record_latency(latency);
		} else if self.config.rotation == RotationMode::OnBlockOnly {
			scope.state.set_sticky(None);
		}

		if let Some(duration) = scope.pool.report(identity.id, verdict, latency) {
			self.emit_cooldown(identity, duration, false);
		}

		self.events.dispatch(EngineEvent::AttemptFinished(AttemptFinishedEvent {
			run: scope.run.to_string(),
			sequence,
			sub_attempt,
			identity: identity.label.clone(),
			verdict,
			signal: record.signal().map(str::to_string),
			status: record.status(),
			latency,
			timestamp: Utc::now(),
		}));

		record
	}

	fn emit_cooldown(&self, identity: &SelectedIdentity, duration: Duration, forced: bool) {
		self.events.dispatch(EngineEvent::Cooldown(CooldownEvent {
			identity: identity.label.clone(),
			duration,
			forced,
			timestamp: Utc::now(),
		}));
	}
}
