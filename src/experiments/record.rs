//! Attempt records, run aggregates and finalized run results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use crate::config::ExperimentConfig;
use crate::config::serde_secs;
use crate::modules::classifier::{Verdict, VerdictKind};

/// Outcome of one fetch. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttemptRecord {
	sequence: usize,
	sub_attempt: u32,
	timestamp: DateTime<Utc>,
	identity: String,
	#[serde(rename = "latency_secs", with = "serde_secs")]
	latency: Duration,
	verdict: VerdictKind,
	status: Option<u16>,
	signal: Option<String>,
	response_size: Option<usize>,
	error: Option<String>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	user_agent: Option<String>,
}

impl AttemptRecord {
	/// The signal is derived from the verdict, so a blocked record always
	/// explains itself.
	pub fn new(
		sequence: usize,
		sub_attempt: u32,
		identity: impl Into<String>,
		verdict: &Verdict,
		latency: Duration,
	) -> Self {
		Self {
			sequence,
			sub_attempt,
			timestamp: Utc::now(),
			identity: identity.into(),
			latency,
			verdict: verdict.kind(),
			status: None,
			signal: verdict.signal(),
			response_size: None,
			error: None,
			user_agent: None,
		}
	}

	pub fn with_status(mut self, status: u16) -> Self {
		self.status = Some(status);
		self
	}

	pub fn with_response_size(mut self, size: usize) -> Self {
		self.response_size = Some(size);
		self
	}

	pub fn with_error(mut self, error: impl Into<String>) -> Self {
		self.error = Some(error.into());
		self
	}

	pub fn with_user_agent(mut self, user_agent: Option<&str>) -> Self {
		self.user_agent = user_agent.map(str::to_string);
		self
	}

	pub fn sequence(&self) -> usize {
		self.sequence
	}

	pub fn sub_attempt(&self) -> u32 {
		self.sub_attempt
	}

	pub fn timestamp(&self) -> DateTime<Utc> {
		self.timestamp
	}

	pub fn identity(&self) -> &str {
		&self.identity
	}

	pub fn latency(&self) -> Duration {
		self.latency
	}

	pub fn verdict(&self) -> VerdictKind {
		self.verdict
	}

	pub fn status(&self) -> Option<u16> {
		self.status
	}

	pub fn signal(&self) -> Option<&str> {
		self.signal.as_deref()
	}

	pub fn response_size(&self) -> Option<usize> {
		self.response_size
	}

	pub fn error(&self) -> Option<&str> {
		self.error.as_deref()
	}

	pub fn user_agent(&self) -> Option<&str> {
		self.user_agent.as_deref()
	}
}

/// Aggregates derived from a run's attempt records.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RunSummary {
	pub total_attempts: usize,
	pub top_level_attempts: usize,
	pub successes: usize,
	pub blocked: usize,
	pub transient_errors: usize,
	pub success_rate: f64,
	pub block_rate: f64,
	pub transient_rate: f64,
	#[serde(rename = "mean_latency_secs", with = "serde_secs::option", default)]
	pub mean_latency: Option<Duration>,
	#[serde(rename = "median_latency_secs", with = "serde_secs::option", default)]
	pub median_latency: Option<Duration>,
	/// Lowest sequence number with a blocked sub-attempt.
	pub first_block_index: Option<usize>,
}

impl RunSummary {
	pub fn from_attempts(attempts: &[AttemptRecord]) -> Self {
		let total = attempts.len();
		let count = |kind: VerdictKind| attempts.iter().filter(|a| a.verdict == kind).count();
		let successes = count(VerdictKind::Success);
		let blocked = count(VerdictKind::Blocked);
		let transient_errors = count(VerdictKind::TransientError);
		let rate = |n: usize| if total == 0 { 0.0 } else { n as f64 / total as f64 };

		let mut latencies: Vec<Duration> = attempts
			.iter()
			.filter(|a| a.verdict == VerdictKind::Success)
			.map(|a| a.latency)
			.collect();
		latencies.sort_unstable();

		let mean_latency = (!latencies.is_empty()).then(|| {
			let sum: f64 = latencies.iter().map(Duration::as_secs_f64).sum();
			Duration::from_secs_f64(sum / latencies.len() as f64)
		});
		let median_latency = match latencies.len() {
			0 => None,
			n if n % 2 == 1 => Some(latencies[n / 2]),
			n => Some((latencies[n / 2 - 1] + latencies[n / 2]) / 2),
		};

		Self {
			total_attempts: total,
			top_level_attempts: attempts.iter().map(|a| a.sequence).collect::<BTreeSet<_>>().len(),
			successes,
			blocked,
			transient_errors,
			success_rate: rate(successes),
			block_rate: rate(blocked),
			transient_rate: rate(transient_errors),
			mean_latency,
			median_latency,
			first_block_index: attempts
				.iter()
				.filter(|a| a.verdict == VerdictKind::Blocked)
				.map(|a| a.sequence)
				.min(),
		}
	}
}

/// Why a run stopped issuing attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StopReason {
	Completed,
	EarlyStop,
	Cancelled,
	Deadline,
}

impl fmt::Display for StopReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			StopReason::Completed => "completed",
			StopReason::EarlyStop => "early-stop",
			StopReason::Cancelled => "cancelled",
			StopReason::Deadline => "deadline",
		})
	}
}

/// Finalized outcome of one named configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunResult {
	name: String,
	parameters: ExperimentConfig,
	started_at: DateTime<Utc>,
	finished_at: DateTime<Utc>,
	stop_reason: StopReason,
	dispatcher_failures: usize,
	attempts: Vec<AttemptRecord>,
	summary: RunSummary,
}

impl RunResult {
	/// Orders the records by `(sequence, sub_attempt)` and computes the
	/// aggregates. Nothing can be appended afterwards.
	pub fn finalize(
		parameters: ExperimentConfig,
		started_at: DateTime<Utc>,
		stop_reason: StopReason,
		dispatcher_failures: usize,
		mut attempts: Vec<AttemptRecord>,
	) -> Self {
		attempts.sort_by_key(|a| (a.sequence, a.sub_attempt));
		let summary = RunSummary::from_attempts(&attempts);
		Self {
			name: parameters.name.clone(),
			parameters,
			started_at,
			finished_at: Utc::now(),
			stop_reason,
			dispatcher_failures,
			attempts,
			summary,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn parameters(&self) -> &ExperimentConfig {
		&self.parameters
	}

	pub fn started_at(&self) -> DateTime<Utc> {
		self.started_at
	}

	pub fn finished_at(&self) -> DateTime<Utc> {
		self.finished_at
	}

	pub fn stop_reason(&self) -> StopReason {
		self.stop_reason
	}

	/// Top-level attempts that ended in an unrecoverable dispatcher failure.
	pub fn dispatcher_failures(&self) -> usize {
		self.dispatcher_failures
	}

	pub fn attempts(&self) -> &[AttemptRecord] {
		&self.attempts
	}

	pub fn summary(&self) -> &RunSummary {
		&self.summary
	}

	/// Aggregates recomputed from the records; always equal to [`Self::summary`].
	pub fn recompute_summary(&self) -> RunSummary {
		RunSummary::from_attempts(&self.attempts)
	}

	/// Records belonging to one top-level attempt, in sub-attempt order.
	pub fn attempts_for(&self, sequence: usize) -> impl Iterator<Item = &AttemptRecord> {
		self.attempts.iter().filter(move |a| a.sequence == sequence)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::modules::classifier::{BlockSignal, TransientCause};

	fn record(sequence: usize, sub: u32, verdict: Verdict, millis: u64) -> AttemptRecord {
		AttemptRecord::new(sequence, sub, "direct", &verdict, Duration::from_millis(millis))
	}

	#[test]
	fn summary_rates_cover_every_record() {
		let attempts = vec![
			record(0, 0, Verdict::Success, 100),
			record(1, 0, Verdict::Blocked(BlockSignal::Status(429)), 50),
			record(1, 1, Verdict::Success, 300),
			record(2, 0, Verdict::TransientError(TransientCause::Timeout), 30_000),
		];
		let summary = RunSummary::from_attempts(&attempts);

		assert_eq!(summary.total_attempts, 4);
		assert_eq!(summary.top_level_attempts, 3);
		assert!((summary.success_rate + summary.block_rate + summary.transient_rate - 1.0).abs() < 1e-9);
		assert_eq!(summary.first_block_index, Some(1));
		assert_eq!(summary.mean_latency, Some(Duration::from_millis(200)));
		assert_eq!(summary.median_latency, Some(Duration::from_millis(200)));
	}

	#[test]
	fn empty_run_has_no_rates() {
		let summary = RunSummary::from_attempts(&[]);
		assert_eq!(summary.success_rate, 0.0);
		assert_eq!(summary.first_block_index, None);
		assert_eq!(summary.mean_latency, None);
	}

	#[test]
	fn blocked_records_always_carry_a_signal() {
		let blocked = record(0, 0, Verdict::Blocked(BlockSignal::UndersizedBody), 10);
		assert_eq!(blocked.signal(), Some("anomaly:undersized-body"));
		assert_eq!(record(0, 0, Verdict::Success, 10).signal(), None);
	}

	#[test]
	fn finalize_orders_records_and_matches_recompute() {
		let attempts = vec![
			record(2, 0, Verdict::Success, 100),
			record(0, 1, Verdict::Success, 100),
			record(0, 0, Verdict::Blocked(BlockSignal::Status(403)), 100),
			record(1, 0, Verdict::Success, 100),
		];
		let result = RunResult::finalize(
			ExperimentConfig::new("ordering", 3),
			Utc::now(),
			StopReason::Completed,
			0,
			attempts,
		);

		let order: Vec<_> = result.attempts().iter().map(|a| (a.sequence(), a.sub_attempt())).collect();
		assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (2, 0)]);
		assert_eq!(result.summary(), &result.recompute_summary());
		assert_eq!(result.attempts_for(0).count(), 2);
		assert_eq!(result.name(), "ordering");
	}

	#[test]
	fn results_round_trip_through_json() {
		let result = RunResult::finalize(
			ExperimentConfig::new("json", 1),
			Utc::now(),
			StopReason::EarlyStop,
			1,
			vec![record(0, 0, Verdict::Success, 250).with_status(200).with_response_size(1000)],
		);
		let json = serde_json::to_string(&result).unwrap();
		assert!(json.contains("\"stop_reason\":\"early-stop\""));
		let back: RunResult = serde_json::from_str(&json).unwrap();
		assert_eq!(back.summary(), result.summary());
		assert_eq!(back.attempts()[0].status(), Some(200));
	}
}
