//! Named experiment suites for blocking-threshold sweeps.
//!
//! Each suite expands into a list of [`ExperimentConfig`]s whose names are
//! stable, so stored results from different sweeps can be compared.

use std::fmt;
use std::str::FromStr;

use once_cell::sync::Lazy;

use crate::config::ExperimentConfig;
use crate::dispatcher::RetryPolicy;
use crate::modules::pacing::PacingPolicy;
use crate::transport::SessionMode;

pub const FULL_ITERATIONS: usize = 50;
pub const QUICK_ITERATIONS: usize = 20;
const USER_AGENT_ITERATIONS: usize = 20;
const USER_AGENT_DELAY_SECS: f64 = 2.0;
const SESSION_DELAY_SECS: f64 = 2.0;

const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36";
const FIREFOX_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:109.0) Gecko/20100101 Firefox/119.0";
const SAFARI_UA: &str = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.0 Safari/605.1.15";

static USER_AGENTS: Lazy<Vec<(&'static str, &'static str)>> = Lazy::new(|| {
    vec![
        ("chrome_modern", CHROME_UA),
        ("firefox_modern", FIREFOX_UA),
        ("safari", SAFARI_UA),
        ("python_requests", "python-requests/2.31.0"),
        ("empty", ""),
    ]
});

/// Desktop browsers the `ua_rotating` configuration draws from.
static ROTATING_USER_AGENTS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        CHROME_UA,
        "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
        FIREFOX_UA,
        SAFARI_UA,
        "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/119.0.0.0 Safari/537.36",
    ]
});

pub fn iterations(quick: bool) -> usize {
    if quick { QUICK_ITERATIONS } else { FULL_ITERATIONS }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExperimentSuite {
    RequestFrequency,
    Delays,
    UserAgents,
    Retry,
    Session,
}

impl ExperimentSuite {
    pub const ALL: [ExperimentSuite; 5] = [
        ExperimentSuite::RequestFrequency,
        ExperimentSuite::Delays,
        ExperimentSuite::UserAgents,
        ExperimentSuite::Retry,
        ExperimentSuite::Session,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ExperimentSuite::RequestFrequency => "request-frequency",
            ExperimentSuite::Delays => "delays",
            ExperimentSuite::UserAgents => "user-agents",
            ExperimentSuite::Retry => "retry",
            ExperimentSuite::Session => "session",
        }
    }

    /// Configurations of this suite. Quick mode trims both the parameter
    /// grid and the attempt count.
    pub fn configurations(&self, quick: bool) -> Vec<ExperimentConfig> {
        let attempts = iterations(quick);
        match self {
            ExperimentSuite::RequestFrequency => {
                let rates: &[u32] = if quick { &[6, 12, 20] } else { &[6, 12, 20, 30, 60] };
                rates
                    .iter()
                    .map(|rpm| {
                        ExperimentConfig::new(format!("freq_rpm_{rpm}"), attempts)
                            .with_pacing(PacingPolicy::RateCapped {
                                requests_per_minute: f64::from(*rpm),
                            })
                            .with_retry(RetryPolicy::None)
                            .with_user_agent(CHROME_UA)
                    })
                    .collect()
            }
            ExperimentSuite::Delays => {
                let grid = [
                    ("fixed_1s", PacingPolicy::Fixed { secs: 1.0 }),
                    ("fixed_2s", PacingPolicy::Fixed { secs: 2.0 }),
                    ("fixed_5s", PacingPolicy::Fixed { secs: 5.0 }),
                    (
                        "random_1_3s",
                        PacingPolicy::UniformRandom {
                            min_secs: 1.0,
                            max_secs: 3.0,
                        },
                    ),
                    (
                        "random_2_5s",
                        PacingPolicy::UniformRandom {
                            min_secs: 2.0,
                            max_secs: 5.0,
                        },
                    ),
                ];
                let take = if quick { 3 } else { grid.len() };
                grid.into_iter()
                    .take(take)
                    .map(|(name, pacing)| {
                        ExperimentConfig::new(format!("delay_{name}"), attempts)
                            .with_pacing(pacing)
                            .with_retry(RetryPolicy::None)
                    })
                    .collect()
            }
            ExperimentSuite::UserAgents => {
                let user_agent_run = |name: &str| {
                    ExperimentConfig::new(format!("ua_{name}"), attempts.min(USER_AGENT_ITERATIONS))
                        .with_pacing(PacingPolicy::Fixed {
                            secs: USER_AGENT_DELAY_SECS,
                        })
                        .with_retry(RetryPolicy::None)
                };
                let mut configs: Vec<_> = USER_AGENTS
                    .iter()
                    .map(|(name, user_agent)| user_agent_run(*name).with_user_agent(*user_agent))
                    .collect();
                configs.push(user_agent_run("rotating").with_user_agents(ROTATING_USER_AGENTS.iter().copied()));
                configs
            }
            ExperimentSuite::Retry => {
                let policies = [
                    ("none", RetryPolicy::None),
                    ("immediate", RetryPolicy::Immediate),
                    ("fixed_5s", RetryPolicy::FixedDelay { secs: 5.0 }),
                    (
                        "backoff_1_30s",
                        RetryPolicy::ExponentialBackoff {
                            base_secs: 1.0,
                            cap_secs: 30.0,
                        },
                    ),
                    ("rotate", RetryPolicy::RotateAndRetry),
                ];
                policies
                    .into_iter()
                    .map(|(name, retry)| {
                        ExperimentConfig::new(format!("retry_{name}"), attempts)
                            .with_pacing(PacingPolicy::Fixed { secs: 2.0 })
                            .with_retry(retry)
                    })
                    .collect()
            }
            ExperimentSuite::Session => [
                ("persistent_session", SessionMode::Persistent),
                ("new_session_each", SessionMode::PerRequest),
            ]
            .into_iter()
            .map(|(name, session)| {
                ExperimentConfig::new(format!("session_{name}"), attempts)
                    .with_pacing(PacingPolicy::Fixed {
                        secs: SESSION_DELAY_SECS,
                    })
                    .with_retry(RetryPolicy::None)
                    .with_user_agent(CHROME_UA)
                    .with_session(session)
            })
            .collect(),
        }
    }
}

impl fmt::Display for ExperimentSuite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ExperimentSuite {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        ExperimentSuite::ALL
            .into_iter()
            .find(|suite| suite.name() == normalized)
            .ok_or_else(|| format!("unknown experiment suite '{raw}'"))
    }
}

/// Look up a single preset configuration by its name, e.g. `delay_fixed_2s`.
pub fn find_configuration(name: &str, quick: bool) -> Option<ExperimentConfig> {
    ExperimentSuite::ALL
        .iter()
        .flat_map(|suite| suite.configurations(quick))
        .find(|config| config.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frequency_suite_matches_rate_grid() {
        let names: Vec<_> = ExperimentSuite::RequestFrequency
            .configurations(false)
            .into_iter()
            .map(|c| c.name)
            .collect();
        assert_eq!(
            names,
            ["freq_rpm_6", "freq_rpm_12", "freq_rpm_20", "freq_rpm_30", "freq_rpm_60"]
        );
        assert_eq!(ExperimentSuite::RequestFrequency.configurations(true).len(), 3);
    }

    #[test]
    fn quick_mode_trims_attempts_and_grid() {
        let delays = ExperimentSuite::Delays.configurations(true);
        assert_eq!(delays.len(), 3);
        assert!(delays.iter().all(|c| c.attempts == QUICK_ITERATIONS));
        assert_eq!(ExperimentSuite::Delays.configurations(false)[0].attempts, FULL_ITERATIONS);
    }

    #[test]
    fn user_agent_suite_is_capped_and_overrides_agent() {
        let configs = ExperimentSuite::UserAgents.configurations(false);
        assert_eq!(configs.len(), 6);
        assert!(configs.iter().all(|c| c.attempts == USER_AGENT_ITERATIONS));
        let empty = configs.iter().find(|c| c.name == "ua_empty").unwrap();
        assert_eq!(empty.user_agent.as_deref(), Some(""));

        let rotating = configs.iter().find(|c| c.name == "ua_rotating").unwrap();
        assert_eq!(rotating.user_agent, None);
        assert_eq!(rotating.user_agents.len(), 5);
    }

    #[test]
    fn session_suite_compares_shared_and_fresh_clients() {
        let configs = ExperimentSuite::Session.configurations(false);
        let modes: Vec<_> = configs.iter().map(|c| (c.name.as_str(), c.session)).collect();
        assert_eq!(
            modes,
            [
                ("session_persistent_session", SessionMode::Persistent),
                ("session_new_session_each", SessionMode::PerRequest),
            ]
        );
        assert!(configs.iter().all(|c| c.attempts == FULL_ITERATIONS));
        assert!(configs.iter().all(|c| c.pacing == PacingPolicy::Fixed { secs: 2.0 }));
        assert!(configs.iter().all(|c| c.retry == RetryPolicy::None));
    }

    #[test]
    fn every_preset_validates() {
        for suite in ExperimentSuite::ALL {
            for config in suite.configurations(false) {
                config.validate().unwrap();
            }
        }
    }

    #[test]
    fn suites_parse_from_cli_names() {
        assert_eq!("request_frequency".parse::<ExperimentSuite>(), Ok(ExperimentSuite::RequestFrequency));
        assert_eq!("user-agents".parse::<ExperimentSuite>(), Ok(ExperimentSuite::UserAgents));
        assert_eq!("session".parse::<ExperimentSuite>(), Ok(ExperimentSuite::Session));
        assert!("cloudscraper".parse::<ExperimentSuite>().is_err());
        assert!(find_configuration("session_new_session_each", false).is_some());
        assert!(find_configuration("retry_rotate", true).is_some());
        assert!(find_configuration("delay_random_2_5s", true).is_none());
    }
}
