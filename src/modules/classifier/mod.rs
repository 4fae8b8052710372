//! Block classification.
//!
//! Turns a raw fetch outcome into a [`Verdict`]. Rules are evaluated in a
//! fixed order and the first match wins:
//!
//! 1. blocking status codes (403, 429, 503 by default)
//! 2. other server errors and transport failures (transient)
//! 3. block phrases in the body sample (case-insensitive)
//! 4. undersized `200` bodies
//! 5. `200` responses far slower than the running average
//!
//! Machine-readable signals come first so that a fast `200` page mentioning
//! "security" in its footer is not the only thing deciding the outcome.

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::transport::TransportError;

pub const DEFAULT_BLOCK_PHRASES: &[&str] = &[
    "access denied",
    "captcha",
    "rate limit",
    "too many requests",
    "bot detection",
    "suspicious activity",
    "security check",
];

/// Coarse outcome of one fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerdictKind {
    Success,
    Blocked,
    TransientError,
}

impl fmt::Display for VerdictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            VerdictKind::Success => "success",
            VerdictKind::Blocked => "blocked",
            VerdictKind::TransientError => "transient-error",
        })
    }
}

/// Evidence behind a `blocked` verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockSignal {
    Status(u16),
    Content(String),
    UndersizedBody,
    LatencySpike,
}

impl fmt::Display for BlockSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockSignal::Status(code) => write!(f, "status:{code}"),
            BlockSignal::Content(phrase) => write!(f, "content:{phrase}"),
            BlockSignal::UndersizedBody => f.write_str("anomaly:undersized-body"),
            BlockSignal::LatencySpike => f.write_str("anomaly:latency-spike"),
        }
    }
}

/// Why an attempt ended as a transient error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransientCause {
    ServerError(u16),
    Timeout,
    Connect,
    Proxy,
    Transport,
    PoolExhausted,
    TransportUnavailable,
}

impl fmt::Display for TransientCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransientCause::ServerError(code) => write!(f, "server-error:{code}"),
            TransientCause::Timeout => f.write_str("timeout"),
            TransientCause::Connect => f.write_str("connect"),
            TransientCause::Proxy => f.write_str("proxy"),
            TransientCause::Transport => f.write_str("transport"),
            TransientCause::PoolExhausted => f.write_str("pool-exhausted"),
            TransientCause::TransportUnavailable => f.write_str("transport-unavailable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Success,
    Blocked(BlockSignal),
    TransientError(TransientCause),
}

impl Verdict {
    pub fn kind(&self) -> VerdictKind {
        match self {
            Verdict::Success => VerdictKind::Success,
            Verdict::Blocked(_) => VerdictKind::Blocked,
            Verdict::TransientError(_) => VerdictKind::TransientError,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Verdict::Success)
    }

    /// Signal string stored in attempt records; `None` only for successes.
    pub fn signal(&self) -> Option<String> {
        match self {
            Verdict::Success => None,
            Verdict::Blocked(signal) => Some(signal.to_string()),
            Verdict::TransientError(cause) => Some(cause.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    pub block_statuses: Vec<u16>,
    pub block_phrases: Vec<String>,
    /// `200` bodies smaller than this many bytes are treated as block pages.
    pub min_body_size: usize,
    pub latency_spike_multiplier: f64,
    /// Successful samples required before latency spikes are evaluated.
    pub latency_min_samples: usize,
    pub body_sample_limit: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            block_statuses: vec![403, 429, 503],
            block_phrases: DEFAULT_BLOCK_PHRASES.iter().map(|p| p.to_string()).collect(),
            min_body_size: 500,
            latency_spike_multiplier: 5.0,
            latency_min_samples: 5,
            body_sample_limit: 64 * 1024,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClassifierError {
    #[error("block phrases must not be empty")]
    EmptyPhrase,
    #[error("invalid block phrase '{phrase}': {source}")]
    InvalidPhrase {
        phrase: String,
        #[source]
        source: regex::Error,
    },
    #[error("latency spike multiplier must be a finite value above 1.0 (got {0})")]
    InvalidMultiplier(f64),
    #[error("body sample limit must be positive")]
    EmptySample,
}

/// What the classifier needs to know about a received response.
#[derive(Debug, Clone, Copy)]
pub struct ResponseView<'a> {
    pub status: u16,
    pub body_sample: &'a [u8],
    pub body_size: usize,
    pub elapsed: Duration,
}

impl<'a> ResponseView<'a> {
    pub fn new(status: u16, body: &'a [u8], elapsed: Duration) -> Self {
        Self {
            status,
            body_sample: body,
            body_size: body.len(),
            elapsed,
        }
    }

    /// Full body size when `body_sample` holds only a prefix of the body.
    pub fn with_body_size(mut self, body_size: usize) -> Self {
        self.body_size = body_size.max(self.body_sample.len());
        self
    }
}

/// Running mean of successful latencies, used by the latency-spike rule.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LatencyBaseline {
    pub mean: Duration,
    pub samples: usize,
}

#[derive(Debug, Clone, Default)]
pub struct LatencyTracker {
    mean_secs: f64,
    samples: usize,
}

impl LatencyTracker {
    pub fn record(&mut self, latency: Duration) {
        self.samples += 1;
        let sample = latency.as_secs_f64();
        self.mean_secs += (sample - self.mean_secs) / self.samples as f64;
    }

    pub fn baseline(&self) -> LatencyBaseline {
        LatencyBaseline {
            mean: Duration::from_secs_f64(self.mean_secs.max(0.0)),
            samples: self.samples,
        }
    }
}

#[derive(Debug, Clone)]
struct PhrasePattern {
    phrase: String,
    regex: Regex,
}

/// Pure, ordered rule set mapping responses to verdicts.
#[derive(Debug, Clone)]
pub struct BlockClassifier {
    config: ClassifierConfig,
    phrases: Vec<PhrasePattern>,
}

impl BlockClassifier {
    pub fn new(config: ClassifierConfig) -> Result<Self, ClassifierError> {
        if !config.latency_spike_multiplier.is_finite() || config.latency_spike_multiplier <= 1.0 {
            return Err(ClassifierError::InvalidMultiplier(config.latency_spike_multiplier));
        }
        if config.body_sample_limit == 0 {
            return Err(ClassifierError::EmptySample);
        }

        let phrases = config
            .block_phrases
            .iter()
            .map(|raw| build_phrase(raw))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { config, phrases })
    }

    pub fn config(&self) -> &ClassifierConfig {
        &self.config
    }

    pub fn classify(&self, response: &ResponseView<'_>, baseline: LatencyBaseline) -> Verdict {
        let status = response.status;

        if self.config.block_statuses.contains(&status) {
            return Verdict::Blocked(BlockSignal::Status(status));
        }

        if (500..600).contains(&status) {
            return Verdict::TransientError(TransientCause::ServerError(status));
        }

        let limit = response.body_sample.len().min(self.config.body_sample_limit);
        let sample = String::from_utf8_lossy(&response.body_sample[..limit]);
        if let Some(pattern) = self.phrases.iter().find(|p| p.regex.is_match(&sample)) {
            return Verdict::Blocked(BlockSignal::Content(pattern.phrase.clone()));
        }

        if status == 200 {
            if response.body_size < self.config.min_body_size {
                return Verdict::Blocked(BlockSignal::UndersizedBody);
            }

            if baseline.samples >= self.config.latency_min_samples && !baseline.mean.is_zero() {
                let ceiling = baseline.mean.as_secs_f64() * self.config.latency_spike_multiplier;
                if response.elapsed.as_secs_f64() > ceiling {
                    return Verdict::Blocked(BlockSignal::LatencySpike);
                }
            }
        }

        Verdict::Success
    }

    /// Transport-level failures never reach the content rules.
    pub fn classify_error(&self, error: &TransportError) -> Verdict {
        let cause = match error {
            TransportError::Timeout(_) => TransientCause::Timeout,
            TransportError::Connect(_) => TransientCause::Connect,
            TransportError::Proxy(_) => TransientCause::Proxy,
            TransportError::Body(_) | TransportError::Other(_) => TransientCause::Transport,
        };
        Verdict::TransientError(cause)
    }
}

fn build_phrase(raw: &str) -> Result<PhrasePattern, ClassifierError> {
    let phrase = raw.trim().to_lowercase();
    if phrase.is_empty() {
        return Err(ClassifierError::EmptyPhrase);
    }
    let regex = RegexBuilder::new(&regex::escape(&phrase))
        .case_insensitive(true)
        .build()
        .map_err(|source| ClassifierError::InvalidPhrase {
            phrase: phrase.clone(),
            source,
        })?;
    Ok(PhrasePattern { phrase, regex })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classifier() -> BlockClassifier {
        BlockClassifier::new(ClassifierConfig::default()).unwrap()
    }

    fn page(size: usize) -> Vec<u8> {
        "<p>catalogue entry</p>".repeat(size / 22 + 1).into_bytes()
    }

    fn classify(status: u16, body: &[u8]) -> Verdict {
        classifier().classify(
            &ResponseView::new(status, body, Duration::from_millis(200)),
            LatencyBaseline::default(),
        )
    }

    #[test]
    fn blocking_status_codes_win_first() {
        for code in [403, 429, 503] {
            let verdict = classify(code, b"captcha required");
            assert_eq!(verdict, Verdict::Blocked(BlockSignal::Status(code)));
            assert_eq!(verdict.signal().as_deref(), Some(format!("status:{code}").as_str()));
        }
    }

    #[test]
    fn other_server_errors_are_transient() {
        let verdict = classify(502, &page(1000));
        assert_eq!(verdict, Verdict::TransientError(TransientCause::ServerError(502)));
        // Kept apart from the `status:` namespace of blocking codes.
        assert_eq!(verdict.signal().as_deref(), Some("server-error:502"));
    }

    #[test]
    fn block_phrases_match_case_insensitively() {
        let mut body = page(2000);
        body.extend_from_slice(b"<h1>Captcha required</h1>");
        let verdict = classify(200, &body);
        assert_eq!(verdict, Verdict::Blocked(BlockSignal::Content("captcha".into())));
        assert_eq!(verdict.signal().as_deref(), Some("content:captcha"));
    }

    #[test]
    fn first_configured_phrase_wins() {
        let verdict = classify(200, b"Access Denied: suspicious activity detected");
        assert_eq!(verdict.signal().as_deref(), Some("content:access denied"));
    }

    #[test]
    fn undersized_ok_body_is_blocked() {
        let verdict = classify(200, b"<html></html>");
        assert_eq!(verdict.signal().as_deref(), Some("anomaly:undersized-body"));
        // Only 200s are checked for size.
        assert_eq!(classify(404, b"<html></html>"), Verdict::Success);
    }

    #[test]
    fn latency_spike_needs_enough_samples() {
        let classifier = classifier();
        let body = page(1000);
        let slow = ResponseView::new(200, &body, Duration::from_secs(6));

        let mut tracker = LatencyTracker::default();
        for _ in 0..4 {
            tracker.record(Duration::from_secs(1));
        }
        assert_eq!(classifier.classify(&slow, tracker.baseline()), Verdict::Success);

        tracker.record(Duration::from_secs(1));
        assert_eq!(
            classifier.classify(&slow, tracker.baseline()),
            Verdict::Blocked(BlockSignal::LatencySpike)
        );

        let fine = ResponseView::new(200, &body, Duration::from_secs(4));
        assert_eq!(classifier.classify(&fine, tracker.baseline()), Verdict::Success);
    }

    #[test]
    fn classification_is_deterministic() {
        let classifier = classifier();
        let body = page(800);
        let view = ResponseView::new(200, &body, Duration::from_millis(300));
        let baseline = LatencyBaseline {
            mean: Duration::from_millis(250),
            samples: 10,
        };
        assert_eq!(classifier.classify(&view, baseline), classifier.classify(&view, baseline));
    }

    #[test]
    fn body_sample_limit_bounds_phrase_search() {
        let config = ClassifierConfig {
            body_sample_limit: 16,
            min_body_size: 0,
            ..Default::default()
        };
        let classifier = BlockClassifier::new(config).unwrap();
        let mut body = vec![b' '; 64];
        body.extend_from_slice(b"captcha");
        let view = ResponseView::new(200, &body, Duration::ZERO);
        assert_eq!(classifier.classify(&view, LatencyBaseline::default()), Verdict::Success);
    }

    #[test]
    fn size_rule_uses_full_body_size_of_truncated_sample() {
        let prefix = page(100);
        let truncated = ResponseView::new(200, &prefix, Duration::ZERO).with_body_size(4096);
        assert_eq!(truncated.body_size, 4096);
        assert_eq!(classifier().classify(&truncated, LatencyBaseline::default()), Verdict::Success);

        let view = ResponseView::new(200, &prefix, Duration::ZERO);
        assert_eq!(
            classifier().classify(&view, LatencyBaseline::default()),
            Verdict::Blocked(BlockSignal::UndersizedBody)
        );
    }

    #[test]
    fn transport_failures_are_transient() {
        let classifier = classifier();
        let verdict = classifier.classify_error(&TransportError::Timeout(Duration::from_secs(30)));
        assert_eq!(verdict.kind(), VerdictKind::TransientError);
        assert_eq!(verdict.signal().as_deref(), Some("timeout"));
        assert_eq!(
            classifier
                .classify_error(&TransportError::Connect("refused".into()))
                .signal()
                .as_deref(),
            Some("connect")
        );
    }

    #[test]
    fn rejects_bad_settings() {
        let config = ClassifierConfig {
            block_phrases: vec!["  ".into()],
            ..Default::default()
        };
        assert!(matches!(BlockClassifier::new(config), Err(ClassifierError::EmptyPhrase)));

        let config = ClassifierConfig {
            latency_spike_multiplier: 0.5,
            ..Default::default()
        };
        assert!(matches!(
            BlockClassifier::new(config),
            Err(ClassifierError::InvalidMultiplier(_))
        ));
    }
}
