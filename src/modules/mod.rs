//! Cross-cutting services module
//!
//! Identity health, block classification, pacing, events and metrics shared
//! by the dispatcher and the experiment runner.

pub mod classifier;
pub mod events;
pub mod identity;
pub mod metrics;
pub mod pacing;

// Re-export commonly used types
pub use classifier::{
    BlockClassifier, BlockSignal, ClassifierConfig, ClassifierError, LatencyBaseline,
    LatencyTracker, ResponseView, TransientCause, Verdict, VerdictKind,
};
pub use events::{
    AttemptFinishedEvent, AttemptStartedEvent, CooldownEvent, EngineEvent, EventDispatcher,
    EventHandler, LoggingHandler, MetricsHandler, PoolExhaustedEvent, RetryEvent,
    RunFinishedEvent,
};
pub use identity::{
    AddressError, IdentityId, IdentityPool, IdentitySnapshot, PoolConfig, PoolError,
    PoolHealthReport, ProxyAddress, SelectedIdentity,
};
pub use metrics::{GlobalStats, IdentityStats, MetricsCollector, MetricsSnapshot};
pub use pacing::{PacingController, PacingError, PacingPolicy};
