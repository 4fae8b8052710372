//! # blockprobe-rs
//!
//! Proxy rotation, block detection and blocking-threshold experiments for
//! outbound HTTP fetches.
//!
//! An [`ExperimentRunner`] drives a [`Dispatcher`] through a named
//! [`ExperimentConfig`]: each attempt is paced, bound to an identity from a
//! shared [`IdentityPool`], fetched through a pluggable [`Transport`] and
//! classified by the [`BlockClassifier`]. Every sub-attempt lands in the
//! finalized [`RunResult`].
//!
//! ## Features
//!
//! - Identity pool with per-identity health and exponential cooldowns
//! - Ordered block classification (status codes, block phrases, anomalies)
//! - Retry policies with rotation and bounded budgets
//! - Fixed, random and rate-capped pacing
//! - Sequential and bounded-concurrency runs with cooperative stop
//! - JSON result store and sweep ranking
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use blockprobe_rs::{
//!     BlockClassifier, ClassifierConfig, ExperimentConfig, ExperimentRunner, IdentityPool,
//!     PacingPolicy, PoolConfig, RequestSpec, ReqwestTransport, RotationMode, TransportMode,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let classifier = BlockClassifier::new(ClassifierConfig::default())?;
//!     let mut runner = ExperimentRunner::new(classifier)
//!         .with_transport(TransportMode::Http, Arc::new(ReqwestTransport::new()));
//!
//!     let pool = Arc::new(IdentityPool::new(PoolConfig::default()));
//!     let config = ExperimentConfig::new("delay_fixed_2s", 20)
//!         .with_pacing(PacingPolicy::Fixed { secs: 2.0 })
//!         .with_rotation(RotationMode::Disabled);
//!     let request = RequestSpec::browser_like("https://example.com".parse()?);
//!
//!     let result = runner.run(pool, &config, &request).await?;
//!     println!("success rate: {:.1}%", result.summary().success_rate * 100.0);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dispatcher;
pub mod experiments;
pub mod modules;
pub mod transport;

pub use crate::config::{ConfigError, ConfigResult, EngineConfig, ExperimentConfig, IdentityEntry};

pub use crate::dispatcher::{
    AttemptScope,
    DispatchConfig,
    DispatchError,
    DispatchOutcome,
    DispatchState,
    Dispatcher,
    RetryPolicy,
    RetryPolicyError,
    RotationMode,
};

pub use crate::experiments::{
    AttemptRecord,
    ExperimentRunner,
    ExperimentSuite,
    IdentityCheck,
    JsonFileStore,
    MemoryStore,
    ResultStore,
    RunResult,
    RunSummary,
    RunnerState,
    StopHandle,
    StopListener,
    StopReason,
    StoreError,
    SweepError,
    SweepReport,
};

pub use crate::modules::{
    BlockClassifier,
    BlockSignal,
    ClassifierConfig,
    EngineEvent,
    EventDispatcher,
    EventHandler,
    IdentityId,
    IdentityPool,
    MetricsCollector,
    MetricsSnapshot,
    PacingController,
    PacingPolicy,
    PoolConfig,
    PoolError,
    PoolHealthReport,
    ProxyAddress,
    TransientCause,
    Verdict,
    VerdictKind,
};

pub use crate::transport::{
    RequestSpec,
    ReqwestTransport,
    SessionMode,
    Transport,
    TransportError,
    TransportMode,
    TransportRequest,
    TransportResponse,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
