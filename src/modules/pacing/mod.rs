//! Inter-request pacing.
//!
//! Pacing runs before each top-level attempt only; retries inside one
//! attempt are timed by the retry policy instead.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum PacingError {
    #[error("pacing delay must be a finite, non-negative number of seconds (got {0})")]
    InvalidDelay(f64),
    #[error("uniform pacing range is inverted: min {min}s > max {max}s")]
    InvertedRange { min: f64, max: f64 },
    #[error("requests per minute must be positive (got {0})")]
    InvalidRate(f64),
}

/// Delay policy between top-level attempts.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PacingPolicy {
    #[default]
    None,
    Fixed {
        secs: f64,
    },
    UniformRandom {
        min_secs: f64,
        max_secs: f64,
    },
    /// Fixed `60 / rpm` spacing, independent of how long requests take.
    RateCapped {
        requests_per_minute: f64,
    },
}

impl PacingPolicy {
    pub fn validate(&self) -> Result<(), PacingError> {
        match *self {
            PacingPolicy::None => Ok(()),
            PacingPolicy::Fixed { secs } => check_secs(secs),
            PacingPolicy::UniformRandom { min_secs, max_secs } => {
                check_secs(min_secs)?;
                check_secs(max_secs)?;
                if min_secs > max_secs {
                    return Err(PacingError::InvertedRange {
                        min: min_secs,
                        max: max_secs,
                    });
                }
                Ok(())
            }
            PacingPolicy::RateCapped { requests_per_minute } => {
                if !requests_per_minute.is_finite() || requests_per_minute <= 0.0 {
                    return Err(PacingError::InvalidRate(requests_per_minute));
                }
                Ok(())
            }
        }
    }

    /// Delay to observe before the next attempt. Invalid policies yield zero.
    pub fn delay_for(&self) -> Duration {
        let secs = match *self {
            PacingPolicy::None => 0.0,
            PacingPolicy::Fixed { secs } => secs,
            PacingPolicy::UniformRandom { min_secs, max_secs } => {
                if max_secs > min_secs {
                    rand::thread_rng().gen_range(min_secs..=max_secs)
                } else {
                    min_secs
                }
            }
            PacingPolicy::RateCapped { requests_per_minute } => 60.0 / requests_per_minute,
        };
        Duration::try_from_secs_f64(secs).unwrap_or_default()
    }
}

impl fmt::Display for PacingPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacingPolicy::None => f.write_str("none"),
            PacingPolicy::Fixed { secs } => write!(f, "fixed({secs}s)"),
            PacingPolicy::UniformRandom { min_secs, max_secs } => {
                write!(f, "uniform-random({min_secs}s..{max_secs}s)")
            }
            PacingPolicy::RateCapped { requests_per_minute } => {
                write!(f, "rate-capped({requests_per_minute}/min)")
            }
        }
    }
}

fn check_secs(secs: f64) -> Result<(), PacingError> {
    if secs.is_finite() && secs >= 0.0 {
        Ok(())
    } else {
        Err(PacingError::InvalidDelay(secs))
    }
}

/// Applies a [`PacingPolicy`] across one run.
#[derive(Debug, Clone)]
pub struct PacingController {
    policy: PacingPolicy,
    total_waited: Duration,
}

impl PacingController {
    pub fn new(policy: PacingPolicy) -> Self {
        Self {
            policy,
            total_waited: Duration::ZERO,
        }
    }

    pub fn policy(&self) -> &PacingPolicy {
        &self.policy
    }

    /// Suspend before attempt `attempt_index`. The first attempt of a run
    /// starts immediately.
    pub async fn wait(&mut self, attempt_index: usize) -> Duration {
        if attempt_index == 0 {
            return Duration::ZERO;
        }
        let delay = self.policy.delay_for();
        if !delay.is_zero() {
            log::trace!("pacing {:.2}s before attempt {}", delay.as_secs_f64(), attempt_index);
            tokio::time::sleep(delay).await;
            self.total_waited += delay;
        }
        delay
    }

    pub fn total_waited(&self) -> Duration {
        self.total_waited
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_cap_spaces_requests_evenly() {
        let policy = PacingPolicy::RateCapped {
            requests_per_minute: 12.0,
        };
        assert_eq!(policy.delay_for(), Duration::from_secs(5));
    }

    #[test]
    fn uniform_delay_stays_in_range() {
        let policy = PacingPolicy::UniformRandom {
            min_secs: 1.0,
            max_secs: 3.0,
        };
        for _ in 0..100 {
            let delay = policy.delay_for();
            assert!(delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3));
        }
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(PacingPolicy::Fixed { secs: -1.0 }.validate().is_err());
        assert!(PacingPolicy::RateCapped { requests_per_minute: 0.0 }.validate().is_err());
        assert_eq!(
            PacingPolicy::UniformRandom {
                min_secs: 5.0,
                max_secs: 2.0
            }
            .validate(),
            Err(PacingError::InvertedRange { min: 5.0, max: 2.0 })
        );
        assert!(PacingPolicy::Fixed { secs: 2.0 }.validate().is_ok());
    }

    #[test]
    fn parses_tagged_policies() {
        let policy: PacingPolicy = serde_json::from_str(r#"{"kind":"rate-capped","requests_per_minute":30}"#).unwrap();
        assert_eq!(
            policy,
            PacingPolicy::RateCapped {
                requests_per_minute: 30.0
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn first_attempt_is_not_delayed() {
        let mut pacing = PacingController::new(PacingPolicy::Fixed { secs: 2.0 });
        let start = tokio::time::Instant::now();
        assert_eq!(pacing.wait(0).await, Duration::ZERO);
        assert_eq!(pacing.wait(1).await, Duration::from_secs(2));
        assert_eq!(pacing.wait(2).await, Duration::from_secs(2));
        assert_eq!(start.elapsed(), Duration::from_secs(4));
        assert_eq!(pacing.total_waited(), Duration::from_secs(4));
    }
}
